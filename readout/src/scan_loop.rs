/*!
Scan loop engine.

Repeats a trigger command `repeat` times for every enabled mask step and
double column while the FIFO read-out drains the resulting data.

1. Options are validated before anything is sent to the chip.
2. The register file is snapshotted into a [`RestorePoint`].
3. Injection is set up (`DIGHITIN_SEL`, with `C_High` and `C_Low` cleared
   for digital injection).
4. Per mask step the shift masks are written, then every double column is
   addressed and triggered, either from a preloaded sequence (fast) or with
   freshly encoded address and mask writes (slow).
5. On every exit the restore point is applied and written back to the chip.
*/

use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use shared::mask::make_pixel_mask_with;
use shared::protocol::{COLPR_MODE_SINGLE, DOUBLE_COLUMNS, ROWS};
use shared::{Command, Encoder, PixelMask, RegisterFile};

use crate::cancel::CancellationToken;
use crate::error::ScanError;
use crate::transport::CommandSequencer;

/// Pixel registers written with the injection mask by default
pub const DEFAULT_ENABLE_SHIFT_MASKS: [&str; 3] = ["Enable", "C_High", "C_Low"];

/// Pixel registers that select analog injection
const ANALOG_INJECTION_MASKS: [&str; 2] = ["C_High", "C_Low"];

/// Name of the restore point taken at loop entry
const RESTORE_POINT: &str = "scan_loop";

/// Upper bound for one preloaded trigger sequence to finish
const SEQUENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// How double columns are addressed inside a mask step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Fast,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMode {
    Analog,
    Digital,
}

/// Position of the loop, handed to the hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanLoopState {
    pub mask_steps: usize,
    pub shift: usize,
    pub double_column: usize,
    pub mode: LoopMode,
    pub injection: InjectionMode,
}

/// Called immediately around every trigger dispatch
pub trait ScanLoopHooks {
    fn begin_of_loop(&mut self, _state: &ScanLoopState) {}

    fn end_of_loop(&mut self, _state: &ScanLoopState) {}
}

/// Hooks that do nothing
pub struct NoHooks;

impl ScanLoopHooks for NoHooks {}

#[derive(Debug, Clone)]
pub struct ScanLoopOptions {
    /// Number of times the command is sent per double column
    pub repeat: u32,
    /// Append a delay after the command, scaled with the number of enabled rows
    pub use_delay: bool,
    /// Additional delay in command clock cycles
    pub additional_delay: usize,
    pub mask_steps: usize,
    /// Mask steps to run; `None` or empty runs all
    pub enable_mask_steps: Option<Vec<usize>>,
    /// Double columns to run; `None` or empty runs all 40
    pub enable_double_columns: Option<Vec<usize>>,
    /// Write the mask once for all double columns
    pub same_mask_for_all_dc: bool,
    pub fast_dc_loop: bool,
    pub digital_injection: bool,
    /// Pixel registers set to the injection mask
    pub enable_shift_masks: Vec<String>,
    /// Pixel registers set to the inverted injection mask
    pub disable_shift_masks: Vec<String>,
    /// Write the original shift mask contents back to the chip after the loop
    pub restore_shift_masks: bool,
    /// Pixels allowed to be enabled, intersected with every mask step
    pub mask: Option<PixelMask>,
}

impl Default for ScanLoopOptions {
    fn default() -> Self {
        Self {
            repeat: 100,
            use_delay: true,
            additional_delay: 0,
            mask_steps: 3,
            enable_mask_steps: None,
            enable_double_columns: None,
            same_mask_for_all_dc: false,
            fast_dc_loop: true,
            digital_injection: false,
            enable_shift_masks: DEFAULT_ENABLE_SHIFT_MASKS.iter().map(|name| name.to_string()).collect(),
            disable_shift_masks: Vec::new(),
            restore_shift_masks: true,
            mask: None,
        }
    }
}

impl ScanLoopOptions {
    fn mask_step_list(&self) -> Vec<usize> {
        match &self.enable_mask_steps {
            Some(steps) if !steps.is_empty() => steps.clone(),
            _ => (0..self.mask_steps).collect(),
        }
    }

    fn double_column_list(&self) -> Vec<usize> {
        match &self.enable_double_columns {
            Some(dcs) if !dcs.is_empty() => dcs.clone(),
            _ => (0..DOUBLE_COLUMNS).collect(),
        }
    }

    /// Delay appended to the command, in bits
    pub fn delay_bits(&self) -> usize {
        if !self.use_delay {
            return 0;
        }
        let rows_per_step = (2 * ROWS).div_ceil(self.mask_steps.max(1));
        self.additional_delay + rows_per_step * 4
    }
}

/// What a finished (or cancelled) loop did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanLoopSummary {
    pub mask_steps_done: usize,
    pub double_columns_done: usize,
    /// Commands dispatched, counting every repetition
    pub triggers: u64,
    pub cancelled: bool,
}

/// Drives trigger loops on one chip
pub struct ScanLoop<'a> {
    encoder: &'a Encoder,
    sequencer: &'a CommandSequencer,
    cancel: CancellationToken,
}

impl<'a> ScanLoop<'a> {
    pub fn new(encoder: &'a Encoder, sequencer: &'a CommandSequencer, cancel: CancellationToken) -> Self {
        Self {
            encoder,
            sequencer,
            cancel,
        }
    }

    /// Run `command` across the enabled mask steps and double columns.
    ///
    /// The register file is restored and written back on every exit path,
    /// including errors and cancellation.
    pub fn run(
        &self,
        registers: &mut RegisterFile,
        command: &Command,
        options: &ScanLoopOptions,
        hooks: &mut dyn ScanLoopHooks,
    ) -> Result<ScanLoopSummary, ScanError> {
        self.validate(registers, options)?;

        let restore_point = registers.create_restore_point(RESTORE_POINT);
        let start_time = Instant::now();
        let mut summary = ScanLoopSummary::default();
        let result = self.run_steps(registers, command, options, hooks, &mut summary);

        let touched = registers.changed_pixel_registers(&restore_point);
        let kept_masks = if options.restore_shift_masks {
            Vec::new()
        } else {
            touched
                .iter()
                .filter_map(|name| registers.pixel_values(name).ok().map(|values| (name.clone(), values.clone())))
                .collect()
        };
        registers.restore(restore_point);
        for (name, values) in kept_masks {
            registers.set_pixel_values(&name, values)?;
        }
        let restored = self.write_back(registers, &touched, options);

        match (result, restored) {
            (Ok(()), Ok(())) => {
                info!("✅ Scan loop finished in {:.1}s:", start_time.elapsed().as_secs_f64());
                info!("   Mask steps: {}", summary.mask_steps_done);
                info!("   Double columns: {}", summary.double_columns_done);
                info!("   Triggers: {}", summary.triggers);
                if summary.cancelled {
                    warn!("   Scan loop was cancelled");
                }
                Ok(summary)
            }
            (Err(e), restored) => {
                if let Err(restore_error) = restored {
                    error!("Failed to restore registers after scan loop error: {}", restore_error);
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
        }
    }

    fn validate(&self, registers: &RegisterFile, options: &ScanLoopOptions) -> Result<(), ScanError> {
        if options.digital_injection {
            if let Some(name) = options
                .enable_shift_masks
                .iter()
                .chain(&options.disable_shift_masks)
                .find(|name| ANALOG_INJECTION_MASKS.contains(&name.as_str()))
            {
                return Err(ScanError::config(format!(
                    "digital injection cannot be combined with analog injection shift mask {name}"
                )));
            }
        }
        if options.repeat == 0 {
            return Err(ScanError::config("repeat must be at least 1"));
        }
        // rejects invalid step counts
        make_pixel_mask_with(options.mask_steps, 0, None, None)?;
        if let Some(step) = options.mask_step_list().into_iter().find(|&step| step >= options.mask_steps) {
            return Err(ScanError::config(format!(
                "mask step {step} not below {} mask steps",
                options.mask_steps
            )));
        }
        if let Some(dc) = options.double_column_list().into_iter().find(|&dc| dc >= DOUBLE_COLUMNS) {
            return Err(ScanError::config(format!("double column {dc} out of range")));
        }

        let description = registers.description();
        for name in options.enable_shift_masks.iter().chain(&options.disable_shift_masks) {
            if !description.pixel_register(name)?.is_boolean() {
                return Err(ScanError::config(format!("shift mask {name} is not a boolean pixel register")));
            }
        }
        Ok(())
    }

    fn state(&self, options: &ScanLoopOptions, shift: usize, double_column: usize) -> ScanLoopState {
        ScanLoopState {
            mask_steps: options.mask_steps,
            shift,
            double_column,
            mode: if options.fast_dc_loop { LoopMode::Fast } else { LoopMode::Slow },
            injection: if options.digital_injection {
                InjectionMode::Digital
            } else {
                InjectionMode::Analog
            },
        }
    }

    fn run_steps(
        &self,
        registers: &mut RegisterFile,
        command: &Command,
        options: &ScanLoopOptions,
        hooks: &mut dyn ScanLoopHooks,
        summary: &mut ScanLoopSummary,
    ) -> Result<(), ScanError> {
        let encoder = self.encoder;
        let double_columns = options.double_column_list();
        let mut body = vec![command.clone()];
        let delay = options.delay_bits();
        if delay > 0 {
            body.push(encoder.zeros(delay));
        }

        registers.set_global_value("DIGHITIN_SEL", options.digital_injection as u64)?;
        let mut setup = vec![encoder.conf_mode()?];
        setup.extend(encoder.encode_global_write(registers, ["DIGHITIN_SEL"])?);
        if options.digital_injection {
            // analog injection stays off for the whole loop
            for name in ANALOG_INJECTION_MASKS {
                registers.fill_pixel_values(name, 0)?;
            }
            setup.extend(encoder.encode_pixel_write_broadcast(registers, ANALOG_INJECTION_MASKS, true)?);
        }
        self.sequencer.send_commands(&setup, 1)?;

        for shift in options.mask_step_list() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            debug!("Mask step {} of {}", shift + 1, options.mask_steps);
            self.set_shift_masks(registers, options, shift)?;

            if options.fast_dc_loop {
                self.write_shift_masks(registers, options, &double_columns)?;
                self.fast_double_column_loop(registers, &body, options, shift, &double_columns, hooks, summary)?;
            } else {
                self.slow_double_column_loop(registers, &body, options, shift, &double_columns, hooks, summary)?;
            }
            if summary.cancelled {
                break;
            }
            summary.mask_steps_done += 1;
        }
        Ok(())
    }

    /// Update the register file with the masks of one mask step
    fn set_shift_masks(&self, registers: &mut RegisterFile, options: &ScanLoopOptions, shift: usize) -> Result<(), ScanError> {
        let enable = make_pixel_mask_with(options.mask_steps, shift, None, options.mask.as_ref())?;
        for name in &options.enable_shift_masks {
            registers.set_pixel_mask(name, &enable)?;
        }
        if !options.disable_shift_masks.is_empty() {
            let disable = enable.invert();
            for name in &options.disable_shift_masks {
                registers.set_pixel_mask(name, &disable)?;
            }
        }
        Ok(())
    }

    /// Pixel writes of all shift masks, in configuration mode
    fn encode_shift_masks(
        &self,
        registers: &RegisterFile,
        options: &ScanLoopOptions,
        double_columns: &[usize],
        broadcast: bool,
    ) -> Result<Vec<Command>, ScanError> {
        let encoder = self.encoder;
        let mut commands = vec![encoder.conf_mode()?];
        for names in [&options.enable_shift_masks, &options.disable_shift_masks] {
            if names.is_empty() {
                continue;
            }
            if broadcast {
                commands.extend(encoder.encode_pixel_write_broadcast(registers, names, true)?);
            } else {
                commands.extend(encoder.encode_pixel_write(registers, names, double_columns, true)?);
            }
        }
        Ok(commands)
    }

    fn write_shift_masks(&self, registers: &RegisterFile, options: &ScanLoopOptions, double_columns: &[usize]) -> Result<(), ScanError> {
        let commands = self.encode_shift_masks(registers, options, double_columns, options.same_mask_for_all_dc)?;
        self.sequencer.send_commands(&commands, 1)?;
        Ok(())
    }

    /// Configuration mode, `Colpr_Addr` = `dc` in single column mode, run mode.
    /// The length does not depend on `dc`.
    fn double_column_prefix(&self, registers: &mut RegisterFile, dc: usize) -> Result<Vec<Command>, ScanError> {
        let encoder = self.encoder;
        registers.set_global_value("Colpr_Mode", COLPR_MODE_SINGLE)?;
        registers.set_global_value("Colpr_Addr", dc as u64)?;
        let mut commands = vec![encoder.conf_mode()?];
        commands.extend(encoder.encode_global_write(registers, ["Colpr_Mode", "Colpr_Addr"])?);
        commands.push(encoder.run_mode()?);
        Ok(commands)
    }

    /// Preload prefix and trigger once, patch only the prefix per double column
    #[allow(clippy::too_many_arguments)]
    fn fast_double_column_loop(
        &self,
        registers: &mut RegisterFile,
        body: &[Command],
        options: &ScanLoopOptions,
        shift: usize,
        double_columns: &[usize],
        hooks: &mut dyn ScanLoopHooks,
        summary: &mut ScanLoopSummary,
    ) -> Result<(), ScanError> {
        for (index, &dc) in double_columns.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let prefix = self.double_column_prefix(registers, dc)?;
            if index == 0 {
                self.sequencer.load_sequence(&prefix, body, options.repeat)?;
            } else {
                self.sequencer.patch_start(&prefix)?;
            }

            let state = self.state(options, shift, dc);
            hooks.begin_of_loop(&state);
            self.sequencer.run_sequence()?;
            self.sequencer.wait_ready(SEQUENCE_TIMEOUT)?;
            hooks.end_of_loop(&state);

            summary.triggers += options.repeat as u64;
            summary.double_columns_done += 1;
        }
        Ok(())
    }

    /// Address and mask written freshly for every double column
    #[allow(clippy::too_many_arguments)]
    fn slow_double_column_loop(
        &self,
        registers: &mut RegisterFile,
        body: &[Command],
        options: &ScanLoopOptions,
        shift: usize,
        double_columns: &[usize],
        hooks: &mut dyn ScanLoopHooks,
        summary: &mut ScanLoopSummary,
    ) -> Result<(), ScanError> {
        for &dc in double_columns {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let mut commands = self.encode_shift_masks(registers, options, &[dc], false)?;
            commands.extend(self.double_column_prefix(registers, dc)?);
            self.sequencer.send_commands(&commands, 1)?;

            let state = self.state(options, shift, dc);
            hooks.begin_of_loop(&state);
            self.sequencer.send_commands(body, options.repeat)?;
            hooks.end_of_loop(&state);

            summary.triggers += options.repeat as u64;
            summary.double_columns_done += 1;
        }
        Ok(())
    }

    /// Write the restored configuration back to the chip
    fn write_back(&self, registers: &RegisterFile, touched: &[String], options: &ScanLoopOptions) -> Result<(), ScanError> {
        let encoder = self.encoder;
        let mut commands = vec![encoder.conf_mode()?];
        commands.extend(encoder.encode_global_write_all(registers)?);
        if options.restore_shift_masks && !touched.is_empty() {
            let all: Vec<usize> = (0..DOUBLE_COLUMNS).collect();
            commands.extend(encoder.encode_pixel_write(registers, touched, &all, false)?);
        }
        self.sequencer.send_commands(&commands, 1)?;
        debug!("Restored {} pixel register(s) after scan loop", touched.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::ChipEmulator;
    use crate::records;
    use crate::transport::Transport;
    use shared::mask::make_box_pixel_mask;
    use shared::ChipDescription;
    use std::sync::Arc;

    struct Fixture {
        emulator: Arc<ChipEmulator>,
        encoder: Encoder,
        sequencer: CommandSequencer,
        registers: RegisterFile,
    }

    fn fixture() -> Fixture {
        let description = Arc::new(ChipDescription::fei4b().unwrap());
        let emulator = Arc::new(ChipEmulator::new(description.clone()));
        Fixture {
            sequencer: CommandSequencer::new(emulator.clone()),
            emulator,
            encoder: Encoder::new(description.clone()),
            registers: RegisterFile::new(description),
        }
    }

    fn trigger(encoder: &Encoder) -> Command {
        let bits = Command::join(&[encoder.cal().unwrap(), encoder.zeros(40), encoder.lv1().unwrap()]);
        Command::new("CAL_LV1", bits.clone(), bits.len()).unwrap()
    }

    #[derive(Default)]
    struct RecordingHooks {
        begins: Vec<ScanLoopState>,
        ends: usize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScanLoopHooks for RecordingHooks {
        fn begin_of_loop(&mut self, state: &ScanLoopState) {
            self.begins.push(state.clone());
        }

        fn end_of_loop(&mut self, _state: &ScanLoopState) {
            self.ends += 1;
            if let Some((after, token)) = &self.cancel_after {
                if self.ends >= *after {
                    token.cancel();
                }
            }
        }
    }

    #[test]
    fn test_digital_injection_with_analog_masks_fails_before_sending() {
        let mut f = fixture();
        let command = trigger(&f.encoder);
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, CancellationToken::new());
        let options = ScanLoopOptions {
            repeat: 10,
            mask_steps: 3,
            enable_double_columns: Some(vec![0]),
            digital_injection: true,
            enable_shift_masks: vec!["Enable".into(), "C_High".into(), "C_Low".into()],
            ..ScanLoopOptions::default()
        };
        let err = scan.run(&mut f.registers, &command, &options, &mut NoHooks).unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));

        let options = ScanLoopOptions {
            enable_shift_masks: vec!["Enable".into()],
            disable_shift_masks: vec!["C_Low".into()],
            ..options
        };
        let err = scan.run(&mut f.registers, &command, &options, &mut NoHooks).unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
        assert_eq!(f.emulator.counters().total(), 0);
        assert_eq!(f.emulator.counters().sequence_starts, 0);
    }

    struct AnalogLatchHooks {
        emulator: Arc<ChipEmulator>,
        pixels_on: Vec<usize>,
    }

    impl ScanLoopHooks for AnalogLatchHooks {
        fn begin_of_loop(&mut self, _state: &ScanLoopState) {
            for name in ANALOG_INJECTION_MASKS {
                let values = self.emulator.pixel_register(name).unwrap();
                self.pixels_on.push(values.as_slice().iter().filter(|&&value| value != 0).count());
            }
        }
    }

    #[test]
    fn test_digital_injection_clears_analog_injection() {
        let mut f = fixture();
        f.registers.fill_pixel_values("C_High", 1).unwrap();
        let mut preload = vec![f.encoder.conf_mode().unwrap()];
        preload.extend(f.encoder.encode_pixel_write_broadcast(&f.registers, ["C_High"], false).unwrap());
        f.sequencer.send_commands(&preload, 1).unwrap();
        assert!(f.emulator.pixel_register("C_High").unwrap().as_slice().iter().all(|&value| value == 1));

        let command = trigger(&f.encoder);
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, CancellationToken::new());
        let options = ScanLoopOptions {
            repeat: 1,
            mask_steps: 3,
            enable_double_columns: Some(vec![0, 20]),
            digital_injection: true,
            enable_shift_masks: vec!["Enable".into()],
            ..ScanLoopOptions::default()
        };
        let mut hooks = AnalogLatchHooks {
            emulator: f.emulator.clone(),
            pixels_on: Vec::new(),
        };
        scan.run(&mut f.registers, &command, &options, &mut hooks).unwrap();

        assert_eq!(hooks.pixels_on.len(), 2 * 3 * 2);
        assert!(hooks.pixels_on.iter().all(|&count| count == 0));
        // the original analog setting is written back afterwards
        assert_eq!(f.registers.pixel_values("C_High").unwrap().as_slice().iter().filter(|&&v| v == 1).count(), 80 * 336);
        assert_eq!(f.emulator.pixel_register("C_High").unwrap(), *f.registers.pixel_values("C_High").unwrap());
    }

    #[test]
    fn test_fast_loop_injects_every_pixel_once_per_repeat() {
        let mut f = fixture();
        let command = trigger(&f.encoder);
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, CancellationToken::new());
        let options = ScanLoopOptions {
            repeat: 2,
            mask_steps: 3,
            enable_double_columns: Some(vec![0, 7]),
            ..ScanLoopOptions::default()
        };
        let mut hooks = RecordingHooks::default();
        let summary = scan.run(&mut f.registers, &command, &options, &mut hooks).unwrap();

        assert_eq!(summary.mask_steps_done, 3);
        assert_eq!(summary.double_columns_done, 6);
        assert_eq!(summary.triggers, 12);
        assert!(!summary.cancelled);
        assert_eq!(hooks.begins.len(), 6);
        assert_eq!(hooks.ends, 6);
        assert_eq!(hooks.begins[1].double_column, 7);
        assert_eq!(hooks.begins[1].mode, LoopMode::Fast);

        let words = f.emulator.read_fifo().unwrap();
        assert_eq!(records::count_hits(&words), 2 * 2 * 2 * ROWS);
    }

    #[test]
    fn test_slow_loop_matches_fast_loop() {
        let mut f = fixture();
        let command = trigger(&f.encoder);
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, CancellationToken::new());
        let options = ScanLoopOptions {
            repeat: 3,
            mask_steps: 4,
            enable_mask_steps: Some(vec![1, 3]),
            enable_double_columns: Some(vec![39]),
            fast_dc_loop: false,
            ..ScanLoopOptions::default()
        };
        let summary = scan.run(&mut f.registers, &command, &options, &mut NoHooks).unwrap();
        assert_eq!(summary.mask_steps_done, 2);
        assert_eq!(summary.triggers, 6);
        // half of the 672 pixels, three times
        assert_eq!(records::count_hits(&f.emulator.read_fifo().unwrap()), 3 * 2 * ROWS / 2);
    }

    #[test]
    fn test_registers_restored_after_loop() {
        let mut f = fixture();
        let command = trigger(&f.encoder);
        let before = f.registers.create_restore_point("test");
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, CancellationToken::new());
        let options = ScanLoopOptions {
            repeat: 1,
            mask_steps: 6,
            enable_mask_steps: Some(vec![2]),
            enable_double_columns: Some(vec![5]),
            digital_injection: true,
            enable_shift_masks: vec!["Enable".into()],
            disable_shift_masks: vec!["Imon".into()],
            ..ScanLoopOptions::default()
        };
        scan.run(&mut f.registers, &command, &options, &mut NoHooks).unwrap();

        assert!(f.registers.changed_pixel_registers(&before).is_empty());
        assert_eq!(f.registers.global_value("DIGHITIN_SEL").unwrap(), 0);
        assert_eq!(f.emulator.global_value("DIGHITIN_SEL").unwrap(), 0);
        assert_eq!(f.emulator.global_value("Colpr_Addr").unwrap(), 0);
        assert_eq!(f.emulator.pixel_register("Enable").unwrap(), *f.registers.pixel_values("Enable").unwrap());
        assert_eq!(f.emulator.pixel_register("Imon").unwrap(), *f.registers.pixel_values("Imon").unwrap());
    }

    #[test]
    fn test_cancellation_stops_between_columns_and_restores() {
        let mut f = fixture();
        let command = trigger(&f.encoder);
        let token = CancellationToken::new();
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, token.clone());
        let options = ScanLoopOptions {
            repeat: 1,
            mask_steps: 3,
            ..ScanLoopOptions::default()
        };
        let mut hooks = RecordingHooks {
            cancel_after: Some((2, token)),
            ..RecordingHooks::default()
        };
        let summary = scan.run(&mut f.registers, &command, &options, &mut hooks).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.double_columns_done, 2);
        assert_eq!(summary.mask_steps_done, 0);
        assert_eq!(f.registers.global_value("Colpr_Addr").unwrap(), 0);
        assert_eq!(f.emulator.global_value("Colpr_Addr").unwrap(), 0);
    }

    #[test]
    fn test_caller_mask_and_same_mask_for_all_dc() {
        let mut f = fixture();
        let command = trigger(&f.encoder);
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, CancellationToken::new());
        let options = ScanLoopOptions {
            repeat: 1,
            mask_steps: 2,
            enable_double_columns: Some(vec![2, 3]),
            same_mask_for_all_dc: true,
            mask: Some(make_box_pixel_mask(0..80, 0..100)),
            ..ScanLoopOptions::default()
        };
        scan.run(&mut f.registers, &command, &options, &mut NoHooks).unwrap();
        // 100 rows in 4 columns over both mask steps
        assert_eq!(records::count_hits(&f.emulator.read_fifo().unwrap()), 4 * 100);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut f = fixture();
        let command = trigger(&f.encoder);
        let scan = ScanLoop::new(&f.encoder, &f.sequencer, CancellationToken::new());
        for options in [
            ScanLoopOptions {
                enable_double_columns: Some(vec![40]),
                ..ScanLoopOptions::default()
            },
            ScanLoopOptions {
                enable_mask_steps: Some(vec![3]),
                ..ScanLoopOptions::default()
            },
            ScanLoopOptions {
                enable_shift_masks: vec!["TDAC".into()],
                ..ScanLoopOptions::default()
            },
            ScanLoopOptions {
                mask_steps: 0,
                ..ScanLoopOptions::default()
            },
        ] {
            assert!(scan.run(&mut f.registers, &command, &options, &mut NoHooks).is_err());
        }
        assert_eq!(f.emulator.counters().sequence_starts, 0);
    }
}
