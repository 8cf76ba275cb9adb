/*!
# Pixel Read-out Application

Runs injection scans against FE-I4 front-ends, drains the readout FIFO while
triggers are sent and stores every chunk in rotating raw data files.

## Features

- Interleaved mask-step scan loop in fast (preloaded) or slow mode
- Threaded FIFO read-out with link watchdog
- Raw data stores with scan parameter rows and rotation
- Live TCP mirror of the data stream
- In-process chip emulator for running without hardware

## Usage

### Simulated analog scan
```bash
pixreadout simulate --mask-steps 3 --repeat 100
```

### PlsrDAC sweep, one store per value, with live mirror
```bash
pixreadout simulate --plsr-dac 100,200,300 --rotate --live 0.0.0.0:5500
```

### Inspect a raw data store
```bash
pixreadout inspect ./data/run
```
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use readout::fifo_readout::{Callback, Errback};
use readout::scan_loop::{ScanLoopHooks, ScanLoopState};
use readout::{
    link, records, AppConfig, CancellationToken, ChipEmulator, CommandSequencer, DataChunk, FifoReadout, OpenMode, RawDataFile,
    RawDataReader, ReadoutError, RotatePolicy, ScanLoop, Transport,
};
use shared::{ChipDescription, Command, Encoder, RegisterFile};

#[derive(Parser)]
#[command(name = "pixreadout")]
#[command(about = "FE-I4 scan loop, FIFO read-out and raw data storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "pixreadout.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan against the chip emulator
    Simulate {
        /// Output directory for raw data stores
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Number of interleaved mask steps
        #[arg(long)]
        mask_steps: Option<usize>,

        /// Triggers per double column
        #[arg(long)]
        repeat: Option<u32>,

        /// Address double columns one by one instead of using the preloaded sequence
        #[arg(long)]
        slow: bool,

        /// Use digital injection
        #[arg(long)]
        digital: bool,

        /// PlsrDAC values to scan, comma separated
        #[arg(long, value_delimiter = ',')]
        plsr_dac: Vec<i64>,

        /// Start a new raw data store for every PlsrDAC value
        #[arg(long)]
        rotate: bool,

        /// Publish data live on this address
        #[arg(long)]
        live: Option<String>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "pixreadout.toml")]
        output: PathBuf,
    },

    /// Print the contents of a raw data store
    Inspect {
        /// Store stem, without extension
        stem: PathBuf,

        /// Number of leading words to print
        #[arg(long, default_value = "16")]
        words: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging goes to stderr to keep stdout for reports
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            output_dir,
            mask_steps,
            repeat,
            slow,
            digital,
            plsr_dac,
            rotate,
            live,
        } => {
            let mut config = load_config(&cli.config);
            if let Some(output_dir) = output_dir {
                config.sink.output_directory = output_dir;
            }
            if let Some(mask_steps) = mask_steps {
                config.scan.mask_steps = mask_steps;
            }
            if let Some(repeat) = repeat {
                config.scan.repeat = repeat;
            }
            config.scan.fast_dc_loop &= !slow;
            config.scan.digital_injection |= digital;
            if live.is_some() {
                config.sink.live_address = live;
            }
            run_simulation(&config, &plsr_dac, rotate)
        }

        Commands::Config { output } => generate_config_file(output),

        Commands::Inspect { stem, words } => inspect_store(&stem, words),
    }
}

fn load_config(path: &Path) -> AppConfig {
    if !path.exists() {
        return AppConfig::new();
    }
    AppConfig::load_from_file(path).unwrap_or_else(|e| {
        warn!("⚠️ Failed to load config, using defaults: {:#}", e);
        AppConfig::new()
    })
}

/// Scan parameters shared between the scan loop and the data callback
type ScanParameters = Arc<Mutex<BTreeMap<String, i64>>>;

struct ParameterHooks {
    parameters: ScanParameters,
}

impl ScanLoopHooks for ParameterHooks {
    fn begin_of_loop(&mut self, state: &ScanLoopState) {
        if let Ok(mut parameters) = self.parameters.lock() {
            parameters.insert("mask_step".to_string(), state.shift as i64);
        }
    }
}

fn run_simulation(config: &AppConfig, plsr_dac: &[i64], rotate: bool) -> Result<()> {
    let description = match &config.chip.description_file {
        Some(path) => ChipDescription::load_from_file(path)
            .with_context(|| format!("Failed to load chip description {}", path.display()))?,
        None => ChipDescription::fei4b()?,
    };
    let description = Arc::new(description);
    println!("🚀 Starting simulated {} scan", description.name());

    let emulator = Arc::new(ChipEmulator::new(Arc::clone(&description)));
    let transport: Arc<dyn Transport> = emulator.clone();
    let encoder = Encoder::new(Arc::clone(&description)).with_chip_id(config.chip.chip_id);
    let sequencer = CommandSequencer::new(Arc::clone(&transport));
    let mut registers = RegisterFile::new(Arc::clone(&description));

    // Initial configuration
    let mut commands = vec![encoder.conf_mode()?];
    commands.extend(encoder.encode_global_write_all(&registers)?);
    commands.push(encoder.run_mode()?);
    sequencer.send_commands(&commands, 1)?;

    let stem = config.output_stem();
    let sink = Arc::new(RawDataFile::open(
        &stem,
        OpenMode::Write,
        &["PlsrDAC", "mask_step"],
        config.sink_options(),
    )?);
    sink.set_group("run_conf", serde_json::to_value(&config.scan)?)?;
    println!("💾 Output: {}", stem.display());
    if let Some(address) = sink.live_address() {
        println!("📡 Live data on {}", address);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            println!("\n🛑 Received Ctrl+C, aborting scan...");
            cancel.cancel();
        })?;
    }

    let parameters: ScanParameters = Arc::new(Mutex::new(BTreeMap::new()));
    let policy = if rotate {
        RotatePolicy::OnChange(vec!["PlsrDAC".to_string()])
    } else {
        RotatePolicy::Never
    };
    let callback: Callback = {
        let sink = Arc::clone(&sink);
        let parameters = Arc::clone(&parameters);
        let flush = config.sink.flush_every_chunk;
        Box::new(move |chunk: &DataChunk| {
            let current = parameters.lock().map(|p| p.clone()).unwrap_or_default();
            sink.append(chunk, &current, &policy, flush)?;
            Ok(())
        })
    };
    let errback: Errback = {
        let transport = Arc::clone(&transport);
        let channels = config.chip.rx_channels.clone();
        let cancel = cancel.clone();
        Arc::new(move |err: ReadoutError| {
            if err.is_fatal() {
                error!("Read-out error, aborting scan: {}", err);
                cancel.cancel();
                return;
            }
            warn!("Read-out error: {}", err);
            if let ReadoutError::Link(link_error) = &err {
                if link_error.is_recoverable() {
                    if let Err(e) = link::reset_rx(transport.as_ref(), &channels) {
                        error!("Failed to reset RX: {}", e);
                    }
                }
            }
        })
    };

    let mut readout = FifoReadout::new(Arc::clone(&transport), config.readout_settings());
    readout.start(callback, Some(errback), config.start_options())?;

    let trigger = {
        let bits = Command::join(&[encoder.cal()?, encoder.zeros(40), encoder.lv1()?]);
        let len = bits.len();
        Command::new("CAL_LV1", bits, len)?
    };
    let options = config.scan_loop_options();
    let scan = ScanLoop::new(&encoder, &sequencer, cancel.clone());
    let mut hooks = ParameterHooks {
        parameters: Arc::clone(&parameters),
    };

    let dac_values = if plsr_dac.is_empty() {
        vec![registers.global_value("PlsrDAC")? as i64]
    } else {
        plsr_dac.to_vec()
    };

    let mut scan_result = Ok(());
    let mut triggers = 0;
    for dac in dac_values {
        if cancel.is_cancelled() {
            break;
        }
        registers.set_global_value("PlsrDAC", dac as u64)?;
        let mut commands = vec![encoder.conf_mode()?];
        commands.extend(encoder.encode_global_write(&registers, ["PlsrDAC"])?);
        commands.push(encoder.run_mode()?);
        sequencer.send_commands(&commands, 1)?;
        if let Ok(mut parameters) = parameters.lock() {
            parameters.insert("PlsrDAC".to_string(), dac);
        }
        info!("PlsrDAC = {}", dac);

        match scan.run(&mut registers, &trigger, &options, &mut hooks) {
            Ok(summary) => {
                triggers += summary.triggers;
                if summary.cancelled {
                    break;
                }
            }
            Err(e) => {
                scan_result = Err(e);
                break;
            }
        }
        if let Some(rate) = readout.words_per_second() {
            info!("📈 {:.0} words/s", rate);
        }
    }

    let stopped = readout.stop(config.stop_timeout());
    if stopped.is_err() || scan_result.is_err() {
        readout.log_link_status();
    }
    sink.close()?;
    scan_result?;
    stopped?;

    let counters = emulator.counters();
    println!("✅ Scan completed");
    println!("   Triggers: {}", triggers);
    println!("   LV1 received: {}", counters.lv1);
    for stem in sink.filenames() {
        let store = RawDataReader::open(&stem)?;
        println!(
            "   {}: {} chunks, {} words, {} hits",
            stem.display(),
            store.meta.len(),
            store.words.len(),
            records::count_hits(&store.words)
        );
    }
    Ok(())
}

fn inspect_store(stem: &Path, leading_words: usize) -> Result<()> {
    let store = RawDataReader::open(stem).with_context(|| format!("Failed to open {}", stem.display()))?;

    println!("📂 {}", stem.display());
    println!("   Format version: {}", store.header.format_version);
    println!("   Created: {}", store.header.created);
    println!("   Chunks: {}", store.meta.len());
    println!("   Words: {}", store.words.len());
    println!("   Hits: {}", records::count_hits(&store.words));
    let flagged = store.meta.iter().filter(|row| row.error != 0).count();
    println!("   Chunks with link errors: {}", flagged);
    if let (Some(first), Some(last)) = (store.meta.first(), store.meta.last()) {
        println!("   Duration: {:.3} s", last.timestamp_stop - first.timestamp_start);
    }

    for name in &store.header.scan_parameters {
        let values: Vec<i64> = (0..store.meta.len()).filter_map(|row| store.parameter(row, name)).collect();
        if let (Some(min), Some(max)) = (values.iter().min(), values.iter().max()) {
            println!("   {}: {} .. {}", name, min, max);
        }
    }
    for (name, value) in &store.header.groups {
        println!("   [{}] {}", name, value);
    }

    for (i, word) in store.words.iter().take(leading_words).enumerate() {
        println!("   {:6}  {:08x}  {:?}", i, word, records::decode(*word));
    }
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;
    println!("✅ Generated configuration file: {}", output_path.display());
    Ok(())
}
