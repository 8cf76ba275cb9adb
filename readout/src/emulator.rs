/*!
In-process FE-I4 chip emulator.

[`ChipEmulator`] implements [`Transport`] for a read-out board with one chip
attached. Writing `TX.START` executes the sequencer memory synchronously: the
start part once, then the body `TX.CMD_REPEAT` times. The command stream is
decoded bit by bit exactly as the encoder serializes it.

Pixel configuration is modelled with one 672-bit shift register per double
column and one latch per strobe and double column. A `GlobalPulse` with
`Latch_En` set copies the shift register into every strobed latch of the
addressed double columns.

A `CAL` followed by `LV1` in run mode emits a data header plus one hit record
for every injected pixel of the double columns addressed at `CAL` time.
*/

use bitvec::prelude::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use shared::command::unpack_bits;
use shared::protocol::{CONF_MODE, DOUBLE_COLUMNS, PIXEL_DATA_BITS, ROWS, RUN_MODE};
use shared::{ChipDescription, ChipError, Command, CommandBits, PixelMatrix, RegisterFile};

use crate::error::TransportError;
use crate::records;
use crate::transport::{registers, Transport, SEQUENCER_MEMORY_BYTES};

/// Number of emulated RX channels
pub const RX_CHANNELS: usize = 4;

/// ToT reported for every injected hit
pub const INJECTED_TOT: u8 = 6;

const LV1: u64 = 0b11101;
const FAST_HEADER: u64 = 0b10110;
const BCR: u64 = 0b0001;
const ECR: u64 = 0b0010;
const CAL: u64 = 0b0100;
const SLOW: u64 = 0b1000;

const RD_REGISTER: u64 = 0b0001;
const WR_REGISTER: u64 = 0b0010;
const WR_FRONT_END: u64 = 0b0100;
const GLOBAL_RESET: u64 = 0b1000;
const GLOBAL_PULSE: u64 = 0b1001;
const RUN_MODE_CMD: u64 = 0b1010;

const SLOW_HEADER_BITS: usize = 17;
const BROADCAST_CHIP_ID: u64 = 0b1000;

/// Number of decoded commands by kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandCounters {
    pub lv1: u64,
    pub bcr: u64,
    pub ecr: u64,
    pub cal: u64,
    pub rd_register: u64,
    pub wr_register: u64,
    pub wr_front_end: u64,
    pub global_reset: u64,
    pub global_pulse: u64,
    pub run_mode: u64,
    /// Bits that did not start any known command
    pub unknown_bits: u64,
    /// Sequencer starts through `TX.START`
    pub sequence_starts: u64,
}

impl CommandCounters {
    /// Commands other than delay bits
    pub fn total(&self) -> u64 {
        self.lv1
            + self.bcr
            + self.ecr
            + self.cal
            + self.rd_register
            + self.wr_register
            + self.wr_front_end
            + self.global_reset
            + self.global_pulse
            + self.run_mode
    }
}

/// Strobe indices of the pixel registers that take part in injection
#[derive(Debug, Clone, Copy)]
struct InjectionStrobes {
    enable: usize,
    c_high: usize,
    c_low: usize,
}

struct ChipState {
    description: Arc<ChipDescription>,
    chip_id: u64,
    words: Vec<u16>,
    defaults: Vec<u16>,
    run_mode: bool,
    shift_registers: Vec<CommandBits>,
    latches: Vec<Vec<CommandBits>>,
    injection: Option<InjectionStrobes>,
    pending_cal: Option<Vec<usize>>,
    lv1_id: u32,
    bcid: u32,
    counters: CommandCounters,
    fifo: VecDeque<u32>,
}

impl ChipState {
    fn new(description: Arc<ChipDescription>) -> Self {
        let defaults = RegisterFile::new(description.clone()).address_words();
        let strobes = description
            .pixel_registers()
            .iter()
            .map(|reg| reg.address + reg.bitlength)
            .max()
            .unwrap_or(0);
        let injection = match (
            description.pixel_register("Enable"),
            description.pixel_register("C_High"),
            description.pixel_register("C_Low"),
        ) {
            (Ok(enable), Ok(c_high), Ok(c_low)) => Some(InjectionStrobes {
                enable: enable.address,
                c_high: c_high.address,
                c_low: c_low.address,
            }),
            _ => None,
        };
        Self {
            chip_id: description.chip_id() as u64,
            words: defaults.clone(),
            defaults,
            run_mode: false,
            shift_registers: vec![CommandBits::repeat(false, PIXEL_DATA_BITS); DOUBLE_COLUMNS],
            latches: vec![vec![CommandBits::repeat(false, PIXEL_DATA_BITS); DOUBLE_COLUMNS]; strobes],
            injection,
            pending_cal: None,
            lv1_id: 0,
            bcid: 0,
            counters: CommandCounters::default(),
            fifo: VecDeque::new(),
            description,
        }
    }

    fn global(&self, name: &str) -> u64 {
        self.description
            .global_register(name)
            .map(|reg| reg.extract_from(&self.words))
            .unwrap_or(0)
    }

    /// Double columns addressed by Colpr_Mode / Colpr_Addr
    fn addressed_double_columns(&self) -> Vec<usize> {
        let address = self.global("Colpr_Addr") as usize;
        match self.global("Colpr_Mode") {
            0 => (address < DOUBLE_COLUMNS).then_some(address).into_iter().collect(),
            1 => (0..DOUBLE_COLUMNS).filter(|dc| dc % 8 == address % 8).collect(),
            2 => (0..DOUBLE_COLUMNS).filter(|dc| dc % 4 == address % 4).collect(),
            _ => (0..DOUBLE_COLUMNS).collect(),
        }
    }

    fn latch_bit(&self, strobe: usize, col: usize, row: usize) -> bool {
        let index = if col % 2 == 0 { row } else { PIXEL_DATA_BITS - 1 - row };
        self.latches[strobe][col / 2][index]
    }

    fn execute(&mut self, bits: &BitSlice<u8, Msb0>) {
        let mut pos = 0;
        while pos < bits.len() {
            if !bits[pos] {
                pos += 1;
                continue;
            }
            let consumed = self.decode_command(&bits[pos..]);
            if consumed == 0 {
                self.counters.unknown_bits += 1;
                pos += 1;
            } else {
                pos += consumed;
            }
        }
    }

    /// Execute the command at the start of `bits`, returning its length or 0
    fn decode_command(&mut self, bits: &BitSlice<u8, Msb0>) -> usize {
        if bits.len() >= 5 && value(&bits[..5]) == LV1 {
            self.trigger();
            return 5;
        }
        if bits.len() < 9 || value(&bits[..5]) != FAST_HEADER {
            return 0;
        }
        match value(&bits[5..9]) {
            BCR => {
                self.counters.bcr += 1;
                self.bcid = 0;
                9
            }
            ECR => {
                self.counters.ecr += 1;
                self.lv1_id = 0;
                9
            }
            CAL => {
                self.counters.cal += 1;
                self.pending_cal = Some(self.addressed_double_columns());
                9
            }
            SLOW => self.decode_slow_command(bits),
            _ => 0,
        }
    }

    fn decode_slow_command(&mut self, bits: &BitSlice<u8, Msb0>) -> usize {
        if bits.len() < SLOW_HEADER_BITS {
            return 0;
        }
        let kind = value(&bits[9..13]);
        let chip_id = value(&bits[13..17]);
        let length = match kind {
            RD_REGISTER | GLOBAL_PULSE | RUN_MODE_CMD => 23,
            WR_REGISTER => 39,
            WR_FRONT_END => SLOW_HEADER_BITS + 6 + PIXEL_DATA_BITS,
            GLOBAL_RESET => SLOW_HEADER_BITS,
            _ => return 0,
        };
        if bits.len() < length {
            return 0;
        }
        if chip_id != self.chip_id && chip_id & BROADCAST_CHIP_ID == 0 {
            trace!("Ignoring command for chip {}", chip_id);
            return length;
        }

        let payload = &bits[SLOW_HEADER_BITS..length];
        match kind {
            RD_REGISTER => {
                self.counters.rd_register += 1;
                let address = value(&payload[..6]) as usize;
                let data = self.words.get(address).copied().unwrap_or(0);
                self.fifo.push_back(records::address_record(address as u16));
                self.fifo.push_back(records::value_record(data));
            }
            WR_REGISTER => {
                self.counters.wr_register += 1;
                let address = value(&payload[..6]) as usize;
                let data = value(&payload[6..22]) as u16;
                if let Some(word) = self.words.get_mut(address) {
                    *word = data;
                }
            }
            WR_FRONT_END => {
                self.counters.wr_front_end += 1;
                let data = payload[6..].to_bitvec();
                for dc in self.addressed_double_columns() {
                    self.shift_registers[dc] = data.clone();
                }
            }
            GLOBAL_RESET => {
                self.counters.global_reset += 1;
                self.words = self.defaults.clone();
                self.run_mode = false;
            }
            GLOBAL_PULSE => {
                self.counters.global_pulse += 1;
                self.global_pulse();
            }
            RUN_MODE_CMD => {
                self.counters.run_mode += 1;
                match value(&payload[..6]) {
                    RUN_MODE => self.run_mode = true,
                    CONF_MODE => self.run_mode = false,
                    mode => debug!("Unknown run mode pattern {:06b}", mode),
                }
            }
            _ => {}
        }
        length
    }

    fn global_pulse(&mut self) {
        if self.global("Latch_En") == 0 {
            return;
        }
        let strobes = self.global("Pixel_Strobes");
        for dc in self.addressed_double_columns() {
            for (strobe, latches) in self.latches.iter_mut().enumerate() {
                if (strobes >> strobe) & 1 == 1 {
                    latches[dc] = self.shift_registers[dc].clone();
                }
            }
        }
    }

    fn trigger(&mut self) {
        self.counters.lv1 += 1;
        if !self.run_mode {
            self.pending_cal = None;
            return;
        }
        self.fifo.push_back(records::data_header(self.lv1_id, self.bcid));
        self.lv1_id = self.lv1_id.wrapping_add(1);
        self.bcid = (self.bcid + 1) & 0x3FF;

        let (Some(dcs), Some(strobes)) = (self.pending_cal.take(), self.injection) else {
            return;
        };
        let digital = self.global("DIGHITIN_SEL") == 1;
        for dc in dcs {
            for col in [2 * dc, 2 * dc + 1] {
                for row in 0..ROWS {
                    let enabled = self.latch_bit(strobes.enable, col, row);
                    let injected = digital
                        || self.latch_bit(strobes.c_high, col, row)
                        || self.latch_bit(strobes.c_low, col, row);
                    if enabled && injected {
                        self.fifo
                            .push_back(records::hit(col, row, INJECTED_TOT, records::NO_HIT_TOT));
                    }
                }
            }
        }
    }
}

/// MSB-first integer value of a short bit slice
fn value(bits: &BitSlice<u8, Msb0>) -> u64 {
    bits.iter().by_vals().fold(0, |acc, bit| (acc << 1) | bit as u64)
}

#[derive(Debug, Default)]
struct SequencerState {
    memory: Vec<u8>,
    cmd_size: u64,
    repeat: u64,
    start_len: u64,
}

#[derive(Debug)]
struct LinkState {
    ready: Vec<bool>,
    decoder_errors: Vec<u64>,
    lost_data: Vec<u64>,
}

struct EmulatorState {
    chip: ChipState,
    sequencer: SequencerState,
    link: LinkState,
    failing_reads: usize,
}

/// Emulated read-out board with one FE-I4 chip
pub struct ChipEmulator {
    state: Mutex<EmulatorState>,
    read_delay: Mutex<Duration>,
}

impl ChipEmulator {
    pub fn new(description: Arc<ChipDescription>) -> Self {
        Self {
            state: Mutex::new(EmulatorState {
                chip: ChipState::new(description),
                sequencer: SequencerState {
                    memory: vec![0; SEQUENCER_MEMORY_BYTES],
                    repeat: 1,
                    ..SequencerState::default()
                },
                link: LinkState {
                    ready: vec![true; RX_CHANNELS],
                    decoder_errors: vec![0; RX_CHANNELS],
                    lost_data: vec![0; RX_CHANNELS],
                },
                failing_reads: 0,
            }),
            read_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Emulator for the built-in FE-I4B description
    pub fn fei4b() -> Result<Self, ChipError> {
        Ok(Self::new(Arc::new(ChipDescription::fei4b()?)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, EmulatorState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Link(String::from("emulator state poisoned")))
    }

    /// Decode and execute commands directly, bypassing the sequencer
    pub fn execute_commands(&self, commands: &[Command]) -> Result<(), TransportError> {
        let bits = Command::join(commands);
        self.lock()?.chip.execute(&bits);
        Ok(())
    }

    pub fn counters(&self) -> CommandCounters {
        self.lock().map(|state| state.chip.counters.clone()).unwrap_or_default()
    }

    pub fn is_run_mode(&self) -> bool {
        self.lock().map(|state| state.chip.run_mode).unwrap_or(false)
    }

    /// Global register value as currently held by the chip
    pub fn global_value(&self, name: &str) -> Result<u64, ChipError> {
        let state = self
            .state
            .lock()
            .map_err(|_| ChipError::invalid_description("emulator state poisoned"))?;
        let reg = state.chip.description.global_register(name)?;
        Ok(reg.extract_from(&state.chip.words))
    }

    /// Reconstruct a pixel register from the latched bit planes
    pub fn pixel_register(&self, name: &str) -> Result<PixelMatrix<u8>, ChipError> {
        let state = self
            .state
            .lock()
            .map_err(|_| ChipError::invalid_description("emulator state poisoned"))?;
        let chip = &state.chip;
        let reg = chip.description.pixel_register(name)?;
        let mut values = PixelMatrix::<u8>::filled(0);
        for plane in 0..reg.bitlength {
            let strobe = reg.address + plane;
            let bit = reg.plane_bit(plane);
            for col in 0..2 * DOUBLE_COLUMNS {
                for row in 0..ROWS {
                    if chip.latch_bit(strobe, col, row) {
                        values.set(col, row, values.get(col, row) | (1 << bit));
                    }
                }
            }
        }
        Ok(values)
    }

    pub fn push_fifo(&self, words: &[u32]) {
        if let Ok(mut state) = self.lock() {
            state.chip.fifo.extend(words.iter().copied());
        }
    }

    pub fn fifo_len(&self) -> usize {
        self.lock().map(|state| state.chip.fifo.len()).unwrap_or(0)
    }

    pub fn set_rx_sync(&self, channel: usize, ready: bool) {
        if let Ok(mut state) = self.lock() {
            if let Some(flag) = state.link.ready.get_mut(channel) {
                *flag = ready;
            }
        }
    }

    pub fn add_decoder_errors(&self, channel: usize, count: u64) {
        if let Ok(mut state) = self.lock() {
            if let Some(counter) = state.link.decoder_errors.get_mut(channel) {
                *counter += count;
            }
        }
    }

    pub fn add_lost_data(&self, channel: usize, count: u64) {
        if let Ok(mut state) = self.lock() {
            if let Some(counter) = state.link.lost_data.get_mut(channel) {
                *counter += count;
            }
        }
    }

    /// Make every FIFO read block for `delay`
    pub fn set_read_delay(&self, delay: Duration) {
        if let Ok(mut read_delay) = self.read_delay.lock() {
            *read_delay = delay;
        }
    }

    /// Fail the next `count` FIFO reads
    pub fn fail_next_reads(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.failing_reads = count;
        }
    }

    fn run_sequencer(state: &mut EmulatorState) {
        let sequencer = &state.sequencer;
        let size = (sequencer.cmd_size as usize).min(sequencer.memory.len() * 8);
        let start_len = (sequencer.start_len as usize).min(size);
        let repeat = sequencer.repeat.max(1);
        let bits = unpack_bits(&sequencer.memory, size);

        state.chip.counters.sequence_starts += 1;
        state.chip.execute(&bits[..start_len]);
        for _ in 0..repeat {
            state.chip.execute(&bits[start_len..]);
        }
    }

    fn rx_channel(name: &str) -> Option<(usize, &str)> {
        let (channel, register) = name.strip_prefix("RX")?.split_once('.')?;
        let channel = channel.parse::<usize>().ok()?;
        (channel < RX_CHANNELS).then_some((channel, register))
    }
}

impl Transport for ChipEmulator {
    fn read_register(&self, name: &str) -> Result<u64, TransportError> {
        let state = self.lock()?;
        let value = match name {
            registers::CMD_SIZE => state.sequencer.cmd_size,
            registers::CMD_REPEAT => state.sequencer.repeat,
            registers::START_SEQUENCE_LENGTH => state.sequencer.start_len,
            registers::READY => 1,
            registers::FIFO_SIZE => state.chip.fifo.len() as u64,
            _ => match Self::rx_channel(name) {
                Some((ch, "READY")) => state.link.ready[ch] as u64,
                Some((ch, "DECODER_ERROR_COUNTER")) => state.link.decoder_errors[ch],
                Some((ch, "LOST_DATA_COUNTER")) => state.link.lost_data[ch],
                _ => return Err(TransportError::UnknownRegister(name.to_string())),
            },
        };
        Ok(value)
    }

    fn write_register(&self, name: &str, value: u64) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        match name {
            registers::CMD_SIZE => state.sequencer.cmd_size = value,
            registers::CMD_REPEAT => state.sequencer.repeat = value,
            registers::START_SEQUENCE_LENGTH => state.sequencer.start_len = value,
            registers::START => Self::run_sequencer(&mut state),
            registers::FIFO_RESET => state.chip.fifo.clear(),
            _ => match Self::rx_channel(name) {
                Some((ch, "RESET")) => {
                    state.link.ready[ch] = true;
                    state.link.decoder_errors[ch] = 0;
                    state.link.lost_data[ch] = 0;
                }
                _ => return Err(TransportError::UnknownRegister(name.to_string())),
            },
        }
        Ok(())
    }

    fn write_memory(&self, name: &str, offset: usize, data: &[u8]) -> Result<(), TransportError> {
        if name != registers::MEMORY {
            return Err(TransportError::UnknownRegister(name.to_string()));
        }
        let mut state = self.lock()?;
        let memory = &mut state.sequencer.memory;
        if offset + data.len() > memory.len() {
            return Err(TransportError::MemoryOverflow {
                name: name.to_string(),
                offset,
                len: data.len(),
            });
        }
        memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_fifo(&self) -> Result<Vec<u32>, TransportError> {
        let delay = self.read_delay.lock().map(|delay| *delay).unwrap_or_default();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = self.lock()?;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(TransportError::Link(String::from("FIFO read failed")));
        }
        Ok(state.chip.fifo.drain(..).collect())
    }
}
