/*!
# FE-I4 Read-out

Scan loop, FIFO read-out and raw data storage for FE-I4 pixel detector
front-ends. Chip-level types (description, commands, registers, masks) live
in the `shared` crate.

## Core Types

- [`ScanLoop`] - Repeats a trigger command over mask steps and double columns
- [`FifoReadout`] - Reader, worker and watchdog threads draining the FIFO
- [`RawDataFile`] - Rotating raw data store with optional live mirror
- [`CommandSequencer`] - Command memory of the readout board
- [`ChipEmulator`] - In-process chip and readout board

## Modules

- [`transport`] - Register/bus transport and command sequencer
- [`link`] - RX link status and resets
- [`scan_loop`] - Scan loop engine
- [`fifo_readout`] - FIFO read-out engine
- [`raw_data`] - Raw data stores
- [`live`] - Live TCP mirror
- [`records`] - FE-I4 data records
- [`emulator`] - Chip emulator
- [`cancel`] - Cancellation tokens
- [`config`] - Application configuration
- [`error`] - Error types
*/

pub mod cancel;
pub mod config;
pub mod emulator;
pub mod error;
pub mod fifo_readout;
pub mod link;
pub mod live;
pub mod raw_data;
pub mod records;
pub mod scan_loop;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::AppConfig;
pub use emulator::ChipEmulator;
pub use error::{LinkError, ReadoutError, ScanError, SinkError, TransportError};
pub use fifo_readout::{DataChunk, FifoReadout, ReadoutSettings, ReadoutState, StartOptions};
pub use live::{LiveHeader, LivePublisher};
pub use raw_data::{OpenMode, RawDataFile, RawDataReader, RotatePolicy, SinkOptions};
pub use scan_loop::{ScanLoop, ScanLoopHooks, ScanLoopOptions, ScanLoopState, ScanLoopSummary};
pub use transport::{CommandSequencer, Transport};
