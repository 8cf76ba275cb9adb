/*!
Error types for the read-out components.
*/

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use shared::ChipError;

/// Errors raised by a register/bus transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown register: {0}")]
    UnknownRegister(String),

    #[error("Memory write of {len} bytes at offset {offset} exceeds {name}")]
    MemoryOverflow { name: String, offset: usize, len: usize },

    #[error("Command sequencer not ready after {0:?}")]
    SequencerTimeout(Duration),

    #[error("Transport failure: {0}")]
    Link(String),
}

/// Link-health and read-out lifecycle conditions reported through the errback
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("RX sync lost on channel(s) {0:?}")]
    RxSyncLost(Vec<usize>),

    #[error("8b10b decoder error(s) on channel(s) {channels:?}: {counts:?}")]
    EightB10bError { channels: Vec<usize>, counts: Vec<u64> },

    #[error("RX FIFO discarded data on channel(s) {channels:?}: {counts:?}")]
    FifoDiscard { channels: Vec<usize>, counts: Vec<u64> },

    #[error("Received no data for {:.1} second(s)", .0.as_secs_f64())]
    NoDataTimeout(Duration),

    #[error("FIFO read-out did not stop within {:.1} second(s)", .0.as_secs_f64())]
    StopTimeout(Duration),
}

impl LinkError {
    /// Receiver-level errors, usually recovered by resetting the receiver
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RxSyncLost(_) | Self::EightB10bError { .. } | Self::FifoDiscard { .. }
        )
    }
}

/// Everything the FIFO read-out engine can report
#[derive(Error, Debug)]
pub enum ReadoutError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Data callback failed: {0}")]
    Callback(anyhow::Error),

    #[error("FIFO read-out is already running")]
    AlreadyRunning,

    #[error("FIFO read-out is not running")]
    NotRunning,

    #[error("Read-out thread panicked: {0}")]
    ThreadPanic(&'static str),
}

impl ReadoutError {
    /// Errors after which the current run should be aborted
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Link(link) => !link.is_recoverable(),
            Self::Callback(_) => false,
            _ => true,
        }
    }
}

/// Errors raised by the scan loop
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan loop configuration error: {0}")]
    Config(String),

    #[error("Chip error: {0}")]
    Chip(#[from] ChipError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ScanError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Errors raised by the raw data sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Unknown scan parameter {0}")]
    UnknownScanParameter(String),

    #[error("Raw data store {0:?} does not exist")]
    NotFound(PathBuf),

    #[error("Raw data store {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Raw data store {path:?} was written with scan parameters {found:?}, expected {expected:?}")]
    ParameterMismatch {
        path: PathBuf,
        found: Vec<String>,
        expected: Vec<String>,
    },

    #[error("Raw data file is closed")]
    Closed,
}
