//! RESP3 frame scanner.
//!
//! Drives the generic framer for RESP3: one type byte, an optional decimal
//! length line, then either a CRLF-terminated payload or a payload of known
//! size. Collection headers (`*3\r\n`) are frames of their own; children
//! follow as sibling frames and are folded back together by the
//! aggregation layer.

use crate::error::{RespError, Result};
use crate::framing::{Decision, FrameScanner, WindowSize};
use crate::memory::MAX_BLOCK_SIZE;

use super::types::{DeclaredLength, RespContext, RespType};

/// Lookahead used for RESP: any single byte is enough to make progress.
pub const RESP_WINDOW: WindowSize = WindowSize::new(1, 128);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CrLfState {
    #[default]
    WaitingForCr,
    WaitingForLf,
}

/// Finds the end of a CRLF-terminated line across window boundaries.
#[derive(Debug, Default)]
struct CrLfParser {
    state: CrLfState,
}

impl CrLfParser {
    /// Offset of the LF completing the line, if it is in `window`.
    fn find(&mut self, window: &[u8]) -> Result<Option<usize>> {
        for (offset, &byte) in window.iter().enumerate() {
            match (self.state, byte) {
                (CrLfState::WaitingForCr, b'\r') => self.state = CrLfState::WaitingForLf,
                (CrLfState::WaitingForCr, _) => {}
                (CrLfState::WaitingForLf, b'\n') => {
                    self.state = CrLfState::WaitingForCr;
                    return Ok(Some(offset));
                }
                (CrLfState::WaitingForLf, other) => {
                    return Err(RespError::ProtocolState {
                        byte: other,
                        state: "waiting for LF after CR",
                    })
                }
            }
        }
        Ok(None)
    }
}

/// Accumulates a signed decimal length digit by digit.
#[derive(Debug, Default)]
struct LengthParser {
    started: bool,
    negative: bool,
    digits: usize,
    value: i64,
}

impl LengthParser {
    /// Returns the length and the bytes of `window` it spans (up to, not
    /// including, the CR) once the CR is reached.
    fn feed(&mut self, window: &[u8]) -> Result<Option<(DeclaredLength, usize)>> {
        let mut offset = 0;
        if !self.started {
            match window.first() {
                None => return Ok(None),
                Some(b'?') => {
                    *self = Self::default();
                    return Ok(Some((DeclaredLength::Streamed, 1)));
                }
                Some(b'-') => {
                    self.negative = true;
                    offset = 1;
                }
                Some(_) => {}
            }
            self.started = true;
        }

        while let Some(&byte) = window.get(offset) {
            if byte == b'\r' {
                if self.digits == 0 {
                    return Err(RespError::format("empty length"));
                }
                let value = if self.negative { -self.value } else { self.value };
                *self = Self::default();
                return Ok(Some((DeclaredLength::Known(value), offset)));
            }
            if !byte.is_ascii_digit() {
                return Err(RespError::format(format!("invalid length byte {byte:#04x}")));
            }
            self.value = self
                .value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i64::from(byte - b'0')))
                .ok_or_else(|| RespError::format("length overflows i64"))?;
            self.digits += 1;
            offset += 1;
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ScanState {
    #[default]
    WaitingForType,
    ParsingLength,
    WaitingForCrLf,
}

/// [`FrameScanner`] for RESP3.
#[derive(Debug, Default)]
pub struct RespScanner {
    state: ScanState,
    crlf: CrLfParser,
    length: LengthParser,
}

impl RespScanner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameScanner for RespScanner {
    type Context = RespContext;

    fn window(&self) -> WindowSize {
        RESP_WINDOW
    }

    fn begin(&mut self) -> RespContext {
        self.state = ScanState::WaitingForType;
        RespContext::default()
    }

    fn advance(&mut self, context: &mut RespContext, mut window: &[u8]) -> Result<Decision> {
        let mut examined = 0;

        if self.state == ScanState::WaitingForType {
            let tag = window[0];
            let resp_type = RespType::from_tag(tag)
                .ok_or_else(|| RespError::format(format!("unknown type tag {tag:#04x}")))?;
            context.resp_type = resp_type;
            context.data_offset = 1;
            examined = 1;
            window = &window[1..];
            self.state = if resp_type.is_length_prefixed() {
                ScanState::ParsingLength
            } else {
                ScanState::WaitingForCrLf
            };
        }

        if self.state == ScanState::ParsingLength {
            let Some((length, spanned)) = self.length.feed(window)? else {
                context.data_offset += window.len();
                return Ok(Decision::Continue);
            };
            context.length = length;
            context.data_offset += spanned;
            examined += spanned;
            window = &window[spanned..];

            match length {
                DeclaredLength::Streamed if !context.resp_type.allows_streaming() => {
                    return Err(RespError::format(format!(
                        "type {} cannot be streamed",
                        context.resp_type
                    )));
                }
                DeclaredLength::Known(n) if n < -1 => {
                    return Err(RespError::format(format!("negative length {n}")));
                }
                DeclaredLength::Known(-1) if context.resp_type == RespType::StreamedChunk => {
                    return Err(RespError::format("streamed chunk with null length"));
                }
                DeclaredLength::Known(n)
                    if !context.resp_type.is_collection()
                        && (n > 0 || (n == 0 && context.resp_type != RespType::StreamedChunk)) =>
                {
                    // Header CRLF, payload, trailing CRLF.
                    context.data_offset += 2;
                    let frame_len = (n as u64).saturating_add(context.data_offset as u64 + 2);
                    if frame_len > MAX_BLOCK_SIZE as u64 {
                        return Err(RespError::capacity(format!(
                            "declared length {n} exceeds the {MAX_BLOCK_SIZE} byte frame limit"
                        )));
                    }
                    self.state = ScanState::WaitingForType;
                    return Ok(Decision::PredefinedLength {
                        examined,
                        remaining: n as usize + 4,
                    });
                }
                _ => {}
            }
            self.state = ScanState::WaitingForCrLf;
        }

        match self.crlf.find(window)? {
            Some(offset) => {
                self.state = ScanState::WaitingForType;
                Ok(Decision::MarkBoundary(examined + offset))
            }
            None => Ok(Decision::Continue),
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Frame, Framer};
    use crate::memory::{BlockPool, PoolOptions};

    fn framer(block_size: usize) -> Framer<RespScanner> {
        let pool = BlockPool::new(PoolOptions { track_leases: true });
        Framer::new(RespScanner::new(), &pool, block_size).unwrap()
    }

    fn slice_input(input: &[u8], chunk: usize, block_size: usize) -> Result<Vec<Frame<RespContext>>> {
        let mut framer = framer(block_size);
        let mut frames = Vec::new();
        for piece in input.chunks(chunk) {
            frames.extend(framer.push(piece)?);
        }
        Ok(frames)
    }

    fn as_strings(frames: &[Frame<RespContext>]) -> Vec<String> {
        frames
            .iter()
            .map(|f| String::from_utf8_lossy(f.bytes()).into_owned())
            .collect()
    }

    const FIXTURES: &[(&str, &[&str])] = &[
        ("$0\r\n\r\n", &["$0\r\n\r\n"]),
        ("-MOVED 15113 192.168.208.4:7002\r\n", &["-MOVED 15113 192.168.208.4:7002\r\n"]),
        ("*?\r\n:1\r\n:2\r\n:3\r\n.\r\n", &["*?\r\n", ":1\r\n", ":2\r\n", ":3\r\n", ".\r\n"]),
        ("_\r\n_\r\n_\r\n_\r\n", &["_\r\n", "_\r\n", "_\r\n", "_\r\n"]),
        ("$-1\r\n$-1\r\n", &["$-1\r\n", "$-1\r\n"]),
        (
            "%2\r\n+first\r\n:1\r\n+second\r\n:2\r\n",
            &["%2\r\n", "+first\r\n", ":1\r\n", "+second\r\n", ":2\r\n"],
        ),
        ("$11\r\nhello world\r\n", &["$11\r\nhello world\r\n"]),
        ("!21\r\nSYNTAX invalid syntax\r\n", &["!21\r\nSYNTAX invalid syntax\r\n"]),
        ("*3\r\n:1\r\n:2\r\n:3\r\n", &["*3\r\n", ":1\r\n", ":2\r\n", ":3\r\n"]),
        (
            "$?\r\n;4\r\nHell\r\n;5\r\no wor\r\n;1\r\nd\r\n;0\r\n",
            &["$?\r\n", ";4\r\nHell\r\n", ";5\r\no wor\r\n", ";1\r\nd\r\n", ";0\r\n"],
        ),
        (
            "*2\r\n*3\r\n:1\r\n$5\r\nhello\r\n:2\r\n#f\r\n",
            &["*2\r\n", "*3\r\n", ":1\r\n", "$5\r\nhello\r\n", ":2\r\n", "#f\r\n"],
        ),
        (
            "|1\r\n+key-popularity\r\n%2\r\n$1\r\na\r\n,0.1923\r\n$1\r\nb\r\n,0.0012\r\n*2\r\n:2039123\r\n:9543892\r\n",
            &[
                "|1\r\n", "+key-popularity\r\n", "%2\r\n", "$1\r\na\r\n", ",0.1923\r\n",
                "$1\r\nb\r\n", ",0.0012\r\n", "*2\r\n", ":2039123\r\n", ":9543892\r\n",
            ],
        ),
        ("=15\r\ntxt:Some string\r\n", &["=15\r\ntxt:Some string\r\n"]),
        ("(3492890328409238509324850943850943825024385\r\n", &["(3492890328409238509324850943850943825024385\r\n"]),
    ];

    #[test]
    fn test_fixtures_at_every_chunk_size() {
        for (input, expected) in FIXTURES {
            for chunk in 1..=128 {
                let frames = slice_input(input.as_bytes(), chunk, 16 * 1024).unwrap();
                assert_eq!(as_strings(&frames), *expected, "input {input:?}, chunk {chunk}");
            }
        }
    }

    #[test]
    fn test_fixtures_with_tiny_blocks() {
        let input: String = FIXTURES.iter().map(|(input, _)| *input).collect();
        let expected: Vec<&str> = FIXTURES.iter().flat_map(|(_, frames)| frames.iter().copied()).collect();
        for chunk in [1, 3, 7, 64, 500] {
            let frames = slice_input(input.as_bytes(), chunk, 64).unwrap();
            assert_eq!(as_strings(&frames), expected, "chunk {chunk}");
        }
    }

    #[test]
    fn test_context_for_bulk_string() {
        let frames = slice_input(b"$11\r\nhello world\r\n", 3, 1024).unwrap();
        let context = frames[0].context();
        assert_eq!(context.resp_type, RespType::BulkString);
        assert_eq!(context.length, DeclaredLength::Known(11));
        assert_eq!(context.data_offset, 5);
        let bytes = frames[0].bytes();
        assert_eq!(&bytes[context.data_offset..bytes.len() - 2], b"hello world");
    }

    #[test]
    fn test_context_for_streamed_and_null() {
        let frames = slice_input(b"$?\r\n;0\r\n$-1\r\n*-1\r\n_\r\n", 1, 1024).unwrap();
        let contexts: Vec<_> = frames.iter().map(|f| *f.context()).collect();
        assert_eq!(contexts[0].length, DeclaredLength::Streamed);
        assert_eq!(contexts[1].resp_type, RespType::StreamedChunk);
        assert_eq!(contexts[1].length, DeclaredLength::Known(0));
        assert_eq!(contexts[2].length, DeclaredLength::Known(-1));
        assert_eq!(contexts[3].resp_type, RespType::Array);
        assert!(contexts[3].length.is_null());
        assert_eq!(contexts[4].resp_type, RespType::Null);
        assert_eq!(contexts[4].length, DeclaredLength::Unspecified);
    }

    #[test]
    fn test_long_length_spans_windows() {
        let payload = vec![b'z'; 1_000_000];
        let mut input = b"$1000000\r\n".to_vec();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"\r\n");

        let frames = slice_input(&input, 4096, 64 * 1024).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].context().data_offset, 10);
        assert_eq!(&frames[0].bytes()[10..1_000_010], &payload[..]);
    }

    #[test]
    fn test_multi_block_bulk_string_matches_single_block() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let mut input = format!("${}\r\n", payload.len()).into_bytes();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"\r\n");

        let single = slice_input(&input, input.len(), 4096).unwrap();
        let split = slice_input(&input, 50, 64).unwrap();
        assert_eq!(single[0].bytes(), split[0].bytes());
    }

    #[test]
    fn test_unknown_type_tag() {
        match slice_input(b"@oops\r\n", 16, 1024) {
            Err(RespError::Format(message)) => assert!(message.contains("unknown type tag")),
            other => panic!("Expected format error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_length_digits() {
        match slice_input(b"$1x\r\n", 16, 1024) {
            Err(RespError::Format(message)) => assert!(message.contains("invalid length byte")),
            other => panic!("Expected format error, got {other:?}"),
        }
        match slice_input(b"*\r\n", 16, 1024) {
            Err(RespError::Format(message)) => assert_eq!(message, "empty length"),
            other => panic!("Expected format error, got {other:?}"),
        }
        assert!(matches!(
            slice_input(b"$-5\r\n", 16, 1024),
            Err(RespError::Format(_))
        ));
        assert!(matches!(
            slice_input(b"$99999999999999999999\r\n", 16, 1024),
            Err(RespError::Format(_))
        ));
        assert!(matches!(slice_input(b">?\r\n", 16, 1024), Err(RespError::Format(_))));
    }

    #[test]
    fn test_oversized_length_fails_at_header() {
        match slice_input(b"$1000000000\r\n", 4, 1024) {
            Err(RespError::Capacity(_)) => {}
            other => panic!("Expected capacity error, got {other:?}"),
        }

        // Largest payload that still fits one frame: header `$536870898\r\n` is 12 bytes.
        let limit = MAX_BLOCK_SIZE - 12 - 2;
        let header = format!("${limit}\r\n");
        assert_eq!(header.len(), 12);
        let mut scanner = RespScanner::new();
        let mut context = scanner.begin();
        match scanner.advance(&mut context, header.as_bytes()).unwrap() {
            Decision::PredefinedLength { remaining, .. } => assert_eq!(remaining, limit + 4),
            other => panic!("Expected known length, got {other:?}"),
        }
        let mut context = scanner.begin();
        let header = format!("${}\r\n", limit + 1);
        assert!(matches!(
            scanner.advance(&mut context, header.as_bytes()),
            Err(RespError::Capacity(_))
        ));
    }

    #[test]
    fn test_cr_without_lf() {
        match slice_input(b"+OK\rX\n", 1, 1024) {
            Err(RespError::ProtocolState { byte, .. }) => assert_eq!(byte, b'X'),
            other => panic!("Expected protocol state error, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_clears_partial_length() {
        let mut framer = framer(1024);
        assert!(framer.push(b"$12").unwrap().is_empty());
        framer.reset().unwrap();
        let frames = framer.push(b"$2\r\nok\r\n").unwrap();
        assert_eq!(as_strings(&frames), vec!["$2\r\nok\r\n"]);
    }
}
