/*!
Register/bus transport and the command sequencer built on top of it.

The [`Transport`] is the only path to the hardware: named register access,
block writes into named memories and a FIFO drain. The physical bus framing
lives behind the trait. [`CommandSequencer`] loads serialized commands into
the sequencer memory `TX.MEM` and starts it through the `TX.*` registers.
*/

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use shared::command::pack_bits;
use shared::{Command, CommandBits};

use crate::error::TransportError;

/// Size of the sequencer command memory in bytes
pub const SEQUENCER_MEMORY_BYTES: usize = 8192;

/// Sequencer register names
pub mod registers {
    pub const CMD_SIZE: &str = "TX.CMD_SIZE";
    pub const CMD_REPEAT: &str = "TX.CMD_REPEAT";
    pub const START_SEQUENCE_LENGTH: &str = "TX.START_SEQUENCE_LENGTH";
    pub const START: &str = "TX.START";
    pub const READY: &str = "TX.READY";
    pub const MEMORY: &str = "TX.MEM";
    pub const FIFO_SIZE: &str = "FIFO.SIZE";
    pub const FIFO_RESET: &str = "FIFO.RESET";
}

/// Named register access to the read-out hardware
pub trait Transport: Send + Sync {
    fn read_register(&self, name: &str) -> Result<u64, TransportError>;

    fn write_register(&self, name: &str, value: u64) -> Result<(), TransportError>;

    /// Write `data` into memory `name` starting at byte `offset`
    fn write_memory(&self, name: &str, offset: usize, data: &[u8]) -> Result<(), TransportError>;

    /// Drain all words currently available in the FIFO
    fn read_fifo(&self) -> Result<Vec<u32>, TransportError>;
}

/// Sequence currently held in the sequencer memory
#[derive(Debug, Clone)]
struct LoadedSequence {
    bits: CommandBits,
    start_len: usize,
}

/// Serializes commands into the sequencer memory and runs them
pub struct CommandSequencer {
    transport: Arc<dyn Transport>,
    memory_bytes: usize,
    ready_timeout: Duration,
    loaded: Mutex<Option<LoadedSequence>>,
}

impl CommandSequencer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            memory_bytes: SEQUENCER_MEMORY_BYTES,
            ready_timeout: Duration::from_secs(10),
            loaded: Mutex::new(None),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send `commands` and wait until the sequencer is done.
    ///
    /// Command lists larger than the sequencer memory are split at command
    /// boundaries and sent in several transfers, which requires `repeat == 1`.
    pub fn send_commands(&self, commands: &[Command], repeat: u32) -> Result<(), TransportError> {
        if commands.is_empty() {
            return Ok(());
        }
        let capacity = self.memory_bytes * 8;
        let total: usize = commands.iter().map(Command::len).sum();
        if total <= capacity {
            self.load_sequence(&[], commands, repeat)?;
            self.run_sequence()?;
            return self.wait_ready(self.ready_timeout);
        }
        if repeat != 1 {
            return Err(TransportError::MemoryOverflow {
                name: registers::MEMORY.to_string(),
                offset: 0,
                len: total.div_ceil(8),
            });
        }

        let mut batch: Vec<Command> = Vec::new();
        let mut batch_bits = 0;
        let mut transfers = 0;
        for command in commands {
            if command.len() > capacity {
                return Err(TransportError::MemoryOverflow {
                    name: registers::MEMORY.to_string(),
                    offset: 0,
                    len: command.len().div_ceil(8),
                });
            }
            if batch_bits + command.len() > capacity {
                self.load_sequence(&[], &batch, 1)?;
                self.run_sequence()?;
                self.wait_ready(self.ready_timeout)?;
                transfers += 1;
                batch.clear();
                batch_bits = 0;
            }
            batch_bits += command.len();
            batch.push(command.clone());
        }
        self.load_sequence(&[], &batch, 1)?;
        self.run_sequence()?;
        self.wait_ready(self.ready_timeout)?;
        debug!("Sent {} command(s), {} bits in {} transfers", commands.len(), total, transfers + 1);
        Ok(())
    }

    /// Load `start` (executed once) followed by `body` (executed `repeat` times)
    pub fn load_sequence(&self, start: &[Command], body: &[Command], repeat: u32) -> Result<(), TransportError> {
        let mut bits = Command::join(start);
        let start_len = bits.len();
        bits.extend_from_bitslice(&Command::join(body));
        let bytes = pack_bits(&bits);
        if bytes.len() > self.memory_bytes {
            return Err(TransportError::MemoryOverflow {
                name: registers::MEMORY.to_string(),
                offset: 0,
                len: bytes.len(),
            });
        }

        self.transport.write_memory(registers::MEMORY, 0, &bytes)?;
        self.transport.write_register(registers::CMD_SIZE, bits.len() as u64)?;
        self.transport.write_register(registers::START_SEQUENCE_LENGTH, start_len as u64)?;
        self.transport.write_register(registers::CMD_REPEAT, repeat as u64)?;
        trace!("Loaded sequence: {} start bits, {} total bits, repeat {}", start_len, bits.len(), repeat);

        if let Ok(mut loaded) = self.loaded.lock() {
            *loaded = Some(LoadedSequence { bits, start_len });
        }
        Ok(())
    }

    /// Overwrite the start part of the loaded sequence, keeping the body.
    /// The new start must have the same length as the loaded one.
    pub fn patch_start(&self, start: &[Command]) -> Result<(), TransportError> {
        let new_start = Command::join(start);
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| TransportError::Link(String::from("sequencer state poisoned")))?;
        let sequence = loaded
            .as_mut()
            .ok_or_else(|| TransportError::Link(String::from("no sequence loaded")))?;
        if new_start.len() != sequence.start_len {
            return Err(TransportError::Link(format!(
                "start sequence length {} differs from loaded length {}",
                new_start.len(),
                sequence.start_len
            )));
        }

        sequence.bits[..sequence.start_len].copy_from_bitslice(&new_start);
        // the last byte may be shared with the body, rewrite it from the full sequence
        let bytes = pack_bits(&sequence.bits);
        let patched = sequence.start_len.div_ceil(8).min(bytes.len());
        self.transport.write_memory(registers::MEMORY, 0, &bytes[..patched])
    }

    /// Start the loaded sequence without waiting
    pub fn run_sequence(&self) -> Result<(), TransportError> {
        self.transport.write_register(registers::START, 1)
    }

    /// Poll `TX.READY` until set
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.transport.read_register(registers::READY)? != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::SequencerTimeout(timeout));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingTransport {
        registers: Mutex<HashMap<String, u64>>,
        memory: Mutex<Vec<u8>>,
        starts: Mutex<usize>,
    }

    impl Transport for RecordingTransport {
        fn read_register(&self, name: &str) -> Result<u64, TransportError> {
            if name == registers::READY {
                return Ok(1);
            }
            Ok(*self.registers.lock().unwrap().get(name).unwrap_or(&0))
        }

        fn write_register(&self, name: &str, value: u64) -> Result<(), TransportError> {
            if name == registers::START {
                *self.starts.lock().unwrap() += 1;
            }
            self.registers.lock().unwrap().insert(name.to_string(), value);
            Ok(())
        }

        fn write_memory(&self, _name: &str, offset: usize, data: &[u8]) -> Result<(), TransportError> {
            let mut memory = self.memory.lock().unwrap();
            if memory.len() < offset + data.len() {
                memory.resize(offset + data.len(), 0);
            }
            memory[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn read_fifo(&self) -> Result<Vec<u32>, TransportError> {
            Ok(Vec::new())
        }
    }

    fn command(bits: &str) -> Command {
        Command::from_bit_str("test", bits).unwrap()
    }

    #[test]
    fn test_load_sequence_sets_registers() {
        let transport = Arc::new(RecordingTransport::default());
        let sequencer = CommandSequencer::new(transport.clone());
        sequencer
            .load_sequence(&[command("101")], &[command("11101"), command("0000")], 7)
            .unwrap();
        let regs = transport.registers.lock().unwrap();
        assert_eq!(regs[registers::CMD_SIZE], 12);
        assert_eq!(regs[registers::START_SEQUENCE_LENGTH], 3);
        assert_eq!(regs[registers::CMD_REPEAT], 7);
        assert_eq!(*transport.memory.lock().unwrap(), vec![0b1011_1101, 0b0000_0000]);
    }

    #[test]
    fn test_patch_start_keeps_body_bits() {
        let transport = Arc::new(RecordingTransport::default());
        let sequencer = CommandSequencer::new(transport.clone());
        sequencer.load_sequence(&[command("000")], &[command("11111")], 1).unwrap();
        sequencer.patch_start(&[command("101")]).unwrap();
        assert_eq!(transport.memory.lock().unwrap()[0], 0b1011_1111);
        assert!(sequencer.patch_start(&[command("10")]).is_err());
    }

    #[test]
    fn test_large_command_lists_are_split() {
        let transport = Arc::new(RecordingTransport::default());
        let sequencer = CommandSequencer::new(transport.clone());
        let big = Command::zeros(SEQUENCER_MEMORY_BYTES * 8 - 8);
        sequencer.send_commands(&[big.clone(), big.clone()], 1).unwrap();
        assert_eq!(*transport.starts.lock().unwrap(), 2);
        assert!(matches!(
            sequencer.send_commands(&[big.clone(), big], 2),
            Err(TransportError::MemoryOverflow { .. })
        ));
    }
}
