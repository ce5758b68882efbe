//! RESP3 type tags and per-frame context.

use std::fmt;

/// RESP3 frame types, keyed by their one-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum RespType {
    /// No tag read yet.
    #[default]
    Unset = 0,
    SimpleString = b'+',
    BulkString = b'$',
    SimpleError = b'-',
    Number = b':',
    Null = b'_',
    Double = b',',
    Boolean = b'#',
    BulkError = b'!',
    VerbatimString = b'=',
    BigNumber = b'(',
    Array = b'*',
    Map = b'%',
    Set = b'~',
    Attribute = b'|',
    Push = b'>',
    StreamedChunk = b';',
    End = b'.',
}

impl RespType {
    pub fn from_tag(tag: u8) -> Option<RespType> {
        Some(match tag {
            b'+' => RespType::SimpleString,
            b'$' => RespType::BulkString,
            b'-' => RespType::SimpleError,
            b':' => RespType::Number,
            b'_' => RespType::Null,
            b',' => RespType::Double,
            b'#' => RespType::Boolean,
            b'!' => RespType::BulkError,
            b'=' => RespType::VerbatimString,
            b'(' => RespType::BigNumber,
            b'*' => RespType::Array,
            b'%' => RespType::Map,
            b'~' => RespType::Set,
            b'|' => RespType::Attribute,
            b'>' => RespType::Push,
            b';' => RespType::StreamedChunk,
            b'.' => RespType::End,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Types whose header is followed by child frames.
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            RespType::Array | RespType::Map | RespType::Set | RespType::Attribute | RespType::Push
        )
    }

    /// Types whose tag is followed by a decimal length line.
    pub fn is_length_prefixed(self) -> bool {
        self.is_collection()
            || matches!(
                self,
                RespType::BulkString
                    | RespType::BulkError
                    | RespType::VerbatimString
                    | RespType::StreamedChunk
            )
    }

    /// Collections whose declared count is in key/value pairs.
    pub fn is_paired(self) -> bool {
        matches!(self, RespType::Map | RespType::Attribute)
    }

    pub fn is_error(self) -> bool {
        matches!(self, RespType::SimpleError | RespType::BulkError)
    }

    /// Types that may declare a `?` length.
    pub fn allows_streaming(self) -> bool {
        matches!(
            self,
            RespType::BulkString | RespType::Array | RespType::Map | RespType::Set
        )
    }
}

impl fmt::Display for RespType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespType::Unset => write!(f, "unset"),
            other => write!(f, "'{}'", other.tag() as char),
        }
    }
}

/// Length declared in a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeclaredLength {
    /// The type carries no length.
    #[default]
    Unspecified,
    /// A decimal length; `-1` is null.
    Known(i64),
    /// `?`: total size unknown up front.
    Streamed,
}

impl DeclaredLength {
    pub fn is_null(self) -> bool {
        self == DeclaredLength::Known(-1)
    }
}

/// What the scanner learned about one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RespContext {
    pub resp_type: RespType,
    pub length: DeclaredLength,
    /// Offset of the payload within the frame bytes.
    pub data_offset: usize,
}

impl RespContext {
    pub fn new(resp_type: RespType, length: DeclaredLength, data_offset: usize) -> Self {
        Self {
            resp_type,
            length,
            data_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for tag in b"+$-:_,#!=(*%~|>;.".iter().copied() {
            let resp_type = RespType::from_tag(tag).unwrap();
            assert_eq!(resp_type.tag(), tag);
        }
        assert_eq!(RespType::from_tag(b'x'), None);
        assert_eq!(RespType::from_tag(0), None);
    }

    #[test]
    fn test_classification() {
        assert!(RespType::Push.is_collection());
        assert!(!RespType::BulkString.is_collection());
        assert!(RespType::StreamedChunk.is_length_prefixed());
        assert!(!RespType::BigNumber.is_length_prefixed());
        assert!(RespType::Attribute.is_paired());
        assert!(RespType::BulkError.is_error());
        assert!(!RespType::Push.allows_streaming());
    }

    #[test]
    fn test_null_length() {
        assert!(DeclaredLength::Known(-1).is_null());
        assert!(!DeclaredLength::Known(0).is_null());
        assert!(!DeclaredLength::Streamed.is_null());
    }
}
