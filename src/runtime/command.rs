//! Command builder.
//!
//! Arguments are encoded straight into an [`OutgoingBuffer`] as they are
//! added; the `*argc` header is patched into the reserved prefix on
//! [`Command::commit`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{RespError, Result};
use crate::framing::Framer;
use crate::memory::{BlockPool, CommittedBuffer, OutgoingBuffer};
use crate::protocols::resp::parser::RespScanner;
use crate::protocols::resp::response::payload;
use crate::protocols::resp::types::RespType;
use crate::protocols::resp::writer::ProtocolWriter;

/// Default size of blocks backing outgoing commands (128 KiB).
pub const DEFAULT_OUTGOING_BLOCK_SIZE: usize = 128 * 1024;

/// Reserved for `*<argc>\r\n`.
const COMMAND_PREFIX_SIZE: usize = 16;

/// Number of cluster hash slots.
pub const SLOT_COUNT: u16 = 16384;

const SUBSCRIPTION_COMMANDS: &[&str] = &[
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "SSUBSCRIBE",
    "SUNSUBSCRIBE",
];

const CRC16_TABLE: [u16; 256] = crc16_table();

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16/XMODEM.
fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[usize::from((crc >> 8) as u8 ^ byte)]
    })
}

/// Cluster slot of `key`. Only a non-empty `{hashtag}` is hashed when
/// present.
pub fn hash_slot(key: &[u8]) -> u16 {
    let hashed = key
        .iter()
        .position(|&b| b == b'{')
        .and_then(|open| {
            let rest = &key[open + 1..];
            rest.iter()
                .position(|&b| b == b'}')
                .filter(|&close| close > 0)
                .map(|close| &rest[..close])
        })
        .unwrap_or(key);
    crc16(hashed) % SLOT_COUNT
}

/// A command being built.
///
/// Holds this thread's staging block until committed or dropped, so build
/// commands one at a time per thread.
pub struct Command {
    name: String,
    buffer: Option<OutgoingBuffer>,
    argc: usize,
    slots: Vec<u16>,
    timeout: Option<Duration>,
    error: Option<RespError>,
}

impl Command {
    /// Start a command backed by the process-wide pool.
    pub fn new(name: &str) -> Self {
        Self::with_pool(&BlockPool::shared(), DEFAULT_OUTGOING_BLOCK_SIZE, name)
    }

    pub fn with_pool(pool: &BlockPool, block_size: usize, name: &str) -> Self {
        let (buffer, error) = match OutgoingBuffer::new(pool, true, COMMAND_PREFIX_SIZE, block_size) {
            Ok(buffer) => (Some(buffer), None),
            Err(e) => (None, Some(e)),
        };
        let mut command = Self {
            name: name.to_string(),
            buffer,
            argc: 0,
            slots: Vec::new(),
            timeout: None,
            error,
        };
        command.push_with(|buffer| buffer.write_bulk_str(name));
        command
    }

    fn push_with(&mut self, write: impl FnOnce(&mut OutgoingBuffer) -> Result<()>) {
        if self.error.is_some() {
            return;
        }
        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };
        match write(buffer) {
            Ok(()) => self.argc += 1,
            Err(e) => self.error = Some(e),
        }
    }

    pub fn push_arg(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        self.push_with(|buffer| buffer.write_bulk_string(value.as_ref()));
        self
    }

    pub fn push_key(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        let key = key.as_ref();
        self.slots.push(hash_slot(key));
        self.push_with(|buffer| buffer.write_bulk_string(key));
        self
    }

    pub fn arg(mut self, value: impl AsRef<[u8]>) -> Self {
        self.push_arg(value);
        self
    }

    pub fn arg_i64(mut self, value: i64) -> Self {
        self.push_with(|buffer| buffer.write_bulk_i64(value));
        self
    }

    pub fn arg_f64(mut self, value: f64) -> Self {
        self.push_with(|buffer| buffer.write_bulk_f64(value));
        self
    }

    /// Add a key argument and record its cluster slot.
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.push_key(key);
        self
    }

    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        for value in values {
            self.push_arg(value);
        }
        self
    }

    /// Override the client's command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments written so far, the name included.
    pub fn argc(&self) -> usize {
        self.argc
    }

    /// Patch the header and seal the encoding.
    ///
    /// Reports the first error hit while adding arguments.
    pub fn commit(self) -> Result<EncodedCommand> {
        let Command {
            name,
            buffer,
            argc,
            slots,
            timeout,
            error,
        } = self;
        if let Some(e) = error {
            return Err(e);
        }
        let mut buffer = buffer.ok_or(RespError::Ownership("command has no buffer"))?;
        buffer.write_array_prefix(argc)?;
        Ok(EncodedCommand {
            name,
            buffer: buffer.commit()?,
            slots,
            timeout,
        })
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("argc", &self.argc)
            .field("error", &self.error)
            .finish()
    }
}

/// A committed command, ready to hand to a client. Cheap to clone and
/// safe to send across threads.
#[derive(Clone)]
pub struct EncodedCommand {
    name: String,
    buffer: CommittedBuffer,
    slots: Vec<u16>,
    timeout: Option<Duration>,
}

impl EncodedCommand {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &CommittedBuffer {
        &self.buffer
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn slots(&self) -> &[u16] {
        &self.slots
    }

    /// Slot of the first key, if the command has keys.
    pub fn slot(&self) -> Option<u16> {
        self.slots.first().copied()
    }

    pub fn is_cross_slot(&self) -> bool {
        self.slots.windows(2).any(|pair| pair[0] != pair[1])
    }

    pub fn is_subscription(&self) -> bool {
        SUBSCRIPTION_COMMANDS
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&self.name))
    }

    /// Decode the arguments back out of the encoding, name included.
    pub fn arguments(&self) -> Result<Vec<Bytes>> {
        let pool = BlockPool::shared();
        let mut framer = Framer::new(RespScanner::new(), &pool, self.len().max(64))?;
        let frames = framer.push(&self.buffer.to_vec())?;

        let mut frames = frames.into_iter();
        match frames.next() {
            Some(header) if header.context().resp_type == RespType::Array => {}
            _ => return Err(RespError::format("command does not start with an array header")),
        }
        frames
            .map(|frame| match frame.context().resp_type {
                RespType::BulkString => Ok(Bytes::copy_from_slice(payload(&frame))),
                other => Err(RespError::format(format!("unexpected {other} in command"))),
            })
            .collect()
    }

    pub(crate) fn into_buffer(self) -> CommittedBuffer {
        self.buffer
    }
}

impl fmt::Debug for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedCommand")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("slots", &self.slots)
            .finish()
    }
}
