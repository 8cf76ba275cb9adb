/*!
Configuration management for the read-out application.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fifo_readout::{ReadoutSettings, StartOptions};
use crate::raw_data::SinkOptions;
use crate::scan_loop::ScanLoopOptions;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub chip: ChipConfig,
    pub readout: ReadoutConfig,
    pub sink: SinkConfig,
    pub scan: ScanConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            chip: ChipConfig::default(),
            readout: ReadoutConfig::default(),
            sink: SinkConfig::default(),
            scan: ScanConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn readout_settings(&self) -> ReadoutSettings {
        ReadoutSettings {
            poll_interval: Duration::from_millis(self.readout.poll_interval_ms),
            throughput_period: Duration::from_secs(self.readout.throughput_period_seconds),
            rx_channels: self.chip.rx_channels.clone(),
            history_capacity: self.readout.history_capacity,
        }
    }

    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            no_data_timeout: self
                .readout
                .no_data_timeout_seconds
                .map(Duration::from_secs_f64),
            ..StartOptions::default()
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.readout.stop_timeout_seconds)
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            max_rows: self.sink.max_rows,
            live_address: self.sink.live_address.clone(),
            live_queue: self.sink.live_queue_capacity,
        }
    }

    /// Stem of the raw data store for this run
    pub fn output_stem(&self) -> PathBuf {
        Path::new(&self.sink.output_directory).join(&self.sink.run_name)
    }

    pub fn scan_loop_options(&self) -> ScanLoopOptions {
        ScanLoopOptions {
            repeat: self.scan.repeat,
            mask_steps: self.scan.mask_steps,
            enable_double_columns: self.scan.double_columns.clone(),
            same_mask_for_all_dc: self.scan.same_mask_for_all_dc,
            fast_dc_loop: self.scan.fast_dc_loop,
            digital_injection: self.scan.digital_injection,
            ..ScanLoopOptions::default()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Front-end chip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipConfig {
    /// Chip id used in slow commands (8 and above broadcast)
    pub chip_id: u8,

    /// Chip description file, the built-in FE-I4B description if unset
    pub description_file: Option<PathBuf>,

    /// RX channels checked by the link watchdog
    pub rx_channels: Vec<usize>,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            chip_id: 8,
            description_file: None,
            rx_channels: vec![0],
        }
    }
}

/// FIFO read-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadoutConfig {
    /// FIFO poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Period of the throughput estimate in seconds
    pub throughput_period_seconds: u64,

    /// Report an error if no data arrives for this many seconds
    pub no_data_timeout_seconds: Option<f64>,

    /// Time the reader gets to drain the FIFO on stop
    pub stop_timeout_seconds: f64,

    /// Chunks kept in memory for later retrieval
    pub history_capacity: usize,
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            throughput_period_seconds: 10,
            no_data_timeout_seconds: None,
            stop_timeout_seconds: 10.0,
            history_capacity: 10_000,
        }
    }
}

/// Raw data storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Output directory for raw data stores
    pub output_directory: String,

    /// Stem of the first raw data store
    pub run_name: String,

    /// Words per store before a continuation store is opened
    pub max_rows: u64,

    /// Flush the store after every chunk
    pub flush_every_chunk: bool,

    /// Live publisher address, no live mirror if unset
    pub live_address: Option<String>,

    /// Pending live frames before new ones are dropped
    pub live_queue_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_directory: "./data".to_string(),
            run_name: "run".to_string(),
            max_rows: u32::MAX as u64,
            flush_every_chunk: false,
            live_address: None,
            live_queue_capacity: 1000,
        }
    }
}

/// Scan loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Interleaved injection mask steps
    pub mask_steps: usize,

    /// Triggers per double column
    pub repeat: u32,

    /// Preload the trigger sequence and only re-address double columns
    pub fast_dc_loop: bool,

    /// Inject digitally instead of through the injection capacitors
    pub digital_injection: bool,

    /// Write the mask once for all double columns
    pub same_mask_for_all_dc: bool,

    /// Double columns to scan, all 40 if unset
    pub double_columns: Option<Vec<usize>>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mask_steps: 3,
            repeat: 100,
            fast_dc_loop: true,
            digital_injection: false,
            same_mask_for_all_dc: false,
            double_columns: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::new();
        original_config.sink.live_address = Some("127.0.0.1:5500".to_string());
        original_config.scan.double_columns = Some(vec![0, 1, 39]);

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(format!("{:?}", original_config), format!("{:?}", loaded_config));
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.chip.chip_id, 8);
        assert_eq!(config.chip.rx_channels, vec![0]);
        assert_eq!(config.readout.poll_interval_ms, 50);
        assert_eq!(config.readout.throughput_period_seconds, 10);
        assert!(config.readout.no_data_timeout_seconds.is_none());
        assert_eq!(config.sink.max_rows, u32::MAX as u64);
        assert_eq!(config.scan.mask_steps, 3);
        assert!(config.scan.fast_dc_loop);

        let settings = config.readout_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
        assert_eq!(config.output_stem(), Path::new("./data").join("run"));
        assert_eq!(config.scan_loop_options().repeat, 100);
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load_from_file("/nonexistent/pixreadout.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
