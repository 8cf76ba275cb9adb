/*!
Receiver link status helpers.

Each RX channel exposes `RX{n}.READY` (sync), `RX{n}.DECODER_ERROR_COUNTER`
(8b10b), `RX{n}.LOST_DATA_COUNTER` (FIFO discard) and `RX{n}.RESET`.
*/

use tracing::{info, warn};

use crate::error::{LinkError, TransportError};
use crate::transport::{registers, Transport};

fn rx_register(channel: usize, name: &str) -> String {
    format!("RX{channel}.{name}")
}

/// Sync flag per channel
pub fn rx_sync_status(transport: &dyn Transport, channels: &[usize]) -> Result<Vec<bool>, TransportError> {
    channels
        .iter()
        .map(|&ch| Ok(transport.read_register(&rx_register(ch, "READY"))? != 0))
        .collect()
}

pub fn eight_b10b_error_counts(transport: &dyn Transport, channels: &[usize]) -> Result<Vec<u64>, TransportError> {
    channels
        .iter()
        .map(|&ch| transport.read_register(&rx_register(ch, "DECODER_ERROR_COUNTER")))
        .collect()
}

pub fn fifo_discard_counts(transport: &dyn Transport, channels: &[usize]) -> Result<Vec<u64>, TransportError> {
    channels
        .iter()
        .map(|&ch| transport.read_register(&rx_register(ch, "LOST_DATA_COUNTER")))
        .collect()
}

/// Words waiting in the FIFO
pub fn fifo_size(transport: &dyn Transport) -> Result<u64, TransportError> {
    transport.read_register(registers::FIFO_SIZE)
}

/// Reset the receivers, clearing their error counters
pub fn reset_rx(transport: &dyn Transport, channels: &[usize]) -> Result<(), TransportError> {
    for &ch in channels {
        transport.write_register(&rx_register(ch, "RESET"), 1)?;
    }
    Ok(())
}

/// Clear the FIFO, discarding any words left in it
pub fn reset_fifo(transport: &dyn Transport) -> Result<(), TransportError> {
    transport.write_register(registers::FIFO_RESET, 1)?;
    let remaining = fifo_size(transport)?;
    if remaining != 0 {
        warn!("FIFO not empty after reset: {} word(s)", remaining);
    }
    Ok(())
}

/// Snapshot of all link health indicators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub channels: Vec<usize>,
    pub sync: Vec<bool>,
    pub decoder_errors: Vec<u64>,
    pub discarded: Vec<u64>,
    pub fifo_size: u64,
}

impl LinkStatus {
    pub fn read(transport: &dyn Transport, channels: &[usize]) -> Result<Self, TransportError> {
        Ok(Self {
            channels: channels.to_vec(),
            sync: rx_sync_status(transport, channels)?,
            decoder_errors: eight_b10b_error_counts(transport, channels)?,
            discarded: fifo_discard_counts(transport, channels)?,
            fifo_size: fifo_size(transport)?,
        })
    }

    /// First violated condition, checked in order sync, 8b10b, discard
    pub fn first_violation(&self) -> Option<LinkError> {
        let lost: Vec<usize> = self
            .channels
            .iter()
            .zip(&self.sync)
            .filter(|(_, &ready)| !ready)
            .map(|(&ch, _)| ch)
            .collect();
        if !lost.is_empty() {
            return Some(LinkError::RxSyncLost(lost));
        }
        if let Some((channels, counts)) = nonzero(&self.channels, &self.decoder_errors) {
            return Some(LinkError::EightB10bError { channels, counts });
        }
        if let Some((channels, counts)) = nonzero(&self.channels, &self.discarded) {
            return Some(LinkError::FifoDiscard { channels, counts });
        }
        None
    }
}

fn nonzero(channels: &[usize], counts: &[u64]) -> Option<(Vec<usize>, Vec<u64>)> {
    let (channels, counts): (Vec<usize>, Vec<u64>) = channels
        .iter()
        .zip(counts)
        .filter(|(_, &count)| count != 0)
        .map(|(&ch, &count)| (ch, count))
        .unzip();
    if channels.is_empty() {
        None
    } else {
        Some((channels, counts))
    }
}

/// Log the link state. Failures to read are logged too, never returned.
pub fn log_link_status(transport: &dyn Transport, channels: &[usize]) -> Option<LinkStatus> {
    match LinkStatus::read(transport, channels) {
        Ok(status) => {
            info!("🔗 Link status:");
            for (i, ch) in status.channels.iter().enumerate() {
                info!(
                    "   RX{}: sync {}, 8b10b errors {}, discarded {}",
                    ch,
                    if status.sync[i] { "ok" } else { "LOST" },
                    status.decoder_errors[i],
                    status.discarded[i]
                );
            }
            info!("   FIFO size: {}", status.fifo_size);
            Some(status)
        }
        Err(e) => {
            warn!("Could not read link status: {}", e);
            None
        }
    }
}
