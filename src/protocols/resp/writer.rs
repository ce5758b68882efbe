//! Command encoding: `*<argc>\r\n` followed by one bulk string per argument.

use std::io::Write as _;

use crate::error::{RespError, Result};
use crate::memory::OutgoingBuffer;

/// Room for any `i64`, `usize` or `f64` rendering plus its header.
const SCRATCH: usize = 32;

/// Render `value` into a stack buffer, returning the used bytes.
fn render(scratch: &mut [u8; SCRATCH], value: impl std::fmt::Display) -> Result<&[u8]> {
    let mut cursor = &mut scratch[..];
    write!(cursor, "{value}").map_err(|_| RespError::capacity("number does not fit the scratch buffer"))?;
    let used = SCRATCH - cursor.len();
    Ok(&scratch[..used])
}

/// Wire-format helpers for an [`OutgoingBuffer`].
pub trait ProtocolWriter {
    /// `$<len>\r\n<bytes>\r\n`
    fn write_bulk_string(&mut self, value: &[u8]) -> Result<()>;

    fn write_bulk_str(&mut self, value: &str) -> Result<()> {
        self.write_bulk_string(value.as_bytes())
    }

    fn write_bulk_i64(&mut self, value: i64) -> Result<()>;

    /// Infinities go out as `inf`/`-inf` and NaN as `nan`.
    fn write_bulk_f64(&mut self, value: f64) -> Result<()>;

    /// Patch `*<argc>\r\n` into the reserved prefix.
    fn write_array_prefix(&mut self, argc: usize) -> Result<()>;
}

impl ProtocolWriter for OutgoingBuffer {
    fn write_bulk_string(&mut self, value: &[u8]) -> Result<()> {
        let mut scratch = [0u8; SCRATCH];
        self.write(b"$")?;
        self.write(render(&mut scratch, value.len())?)?;
        self.write_crlf()?;
        self.write(value)?;
        self.write_crlf()
    }

    fn write_bulk_i64(&mut self, value: i64) -> Result<()> {
        let mut scratch = [0u8; SCRATCH];
        let digits = render(&mut scratch, value)?;
        self.write_bulk_string(digits)
    }

    fn write_bulk_f64(&mut self, value: f64) -> Result<()> {
        if value.is_nan() {
            return self.write_bulk_string(b"nan");
        }
        if value.is_infinite() {
            return self.write_bulk_string(if value > 0.0 { b"inf" } else { b"-inf" });
        }
        let mut scratch = [0u8; SCRATCH];
        let mut cursor = &mut scratch[..];
        // Debug keeps large and tiny magnitudes in exponent form.
        write!(cursor, "{value:?}").map_err(|_| RespError::capacity("double does not fit the scratch buffer"))?;
        let used = SCRATCH - cursor.len();
        self.write_bulk_string(&scratch[..used])
    }

    fn write_array_prefix(&mut self, argc: usize) -> Result<()> {
        let mut header = [0u8; SCRATCH];
        header[0] = b'*';
        let mut cursor = &mut header[1..];
        write!(cursor, "{argc}\r\n").map_err(|_| RespError::capacity("argument count does not fit"))?;
        let used = SCRATCH - cursor.len();
        self.commit_prefix(used)?.copy_from_slice(&header[..used]);
        Ok(())
    }
}
