//! Typed views over aggregated RESP values.
//!
//! Each wrapper holds the frame or aggregate it was built from, so the
//! underlying blocks stay leased for as long as the wrapper lives. Build a
//! wrapper only after checking `can_convert`; the constructors assert the
//! type in debug builds.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;

use super::aggregate::{Aggregate, RespFrame, RespValueVariant};
use super::types::{DeclaredLength, RespType};
use crate::error::{ClientError, RespError, Result};

/// Push kinds that acknowledge a subscription change.
const SUBSCRIPTION_KINDS: &[&[u8]] = &[
    b"subscribe",
    b"unsubscribe",
    b"psubscribe",
    b"punsubscribe",
    b"ssubscribe",
    b"sunsubscribe",
];

/// Payload bytes of a single frame, without tag, length line or trailing CRLF.
pub fn payload(frame: &RespFrame) -> &[u8] {
    let bytes = frame.bytes();
    let end = bytes.len().saturating_sub(2);
    let start = frame.context().data_offset.min(end);
    &bytes[start..end]
}

fn payload_str(frame: &RespFrame) -> Result<&str> {
    std::str::from_utf8(payload(frame)).map_err(|_| {
        RespError::format(format!(
            "{} payload is not valid UTF-8",
            frame.context().resp_type
        ))
    })
}

/// Shape a caller expects a reply to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Any,
    String,
    Number,
    Double,
    Boolean,
    BigNumber,
    Array,
    Set,
    Map,
    Push,
    Void,
    SubscriptionAck,
}

impl ResponseType {
    /// Whether `value` can be viewed as this type.
    pub fn can_convert(self, value: &RespValueVariant) -> bool {
        match self {
            ResponseType::Any | ResponseType::Void => true,
            ResponseType::String => RespString::can_convert(value),
            ResponseType::Number => RespNumber::can_convert(value),
            ResponseType::Double => RespDouble::can_convert(value),
            ResponseType::Boolean => RespBoolean::can_convert(value),
            ResponseType::BigNumber => RespBigNumber::can_convert(value),
            ResponseType::Array => RespArray::can_convert(value),
            ResponseType::Set => RespSet::can_convert(value),
            ResponseType::Map => RespMap::can_convert(value),
            ResponseType::Push => RespPush::can_convert(value),
            ResponseType::SubscriptionAck => RespSubscriptionAck::can_convert(value),
        }
    }
}

/// A complete reply plus the attribute that preceded it, if any.
#[derive(Debug, Clone)]
pub struct RespResponse {
    pub value: RespValueVariant,
    pub attribute: Option<Aggregate>,
}

impl RespResponse {
    pub fn new(value: RespValueVariant) -> Self {
        Self {
            value,
            attribute: None,
        }
    }

    pub fn with_attribute(value: RespValueVariant, attribute: Option<Aggregate>) -> Self {
        Self { value, attribute }
    }

    pub fn resp_type(&self) -> RespType {
        self.value.resp_type()
    }

    pub fn into_value(self) -> RespValueVariant {
        self.value
    }
}

/// Conversion from a reply into a caller-facing type.
pub trait FromResponse: Sized {
    const RESPONSE_TYPE: ResponseType;

    fn from_response(response: RespResponse) -> Result<Self, ClientError>;
}

fn unexpected(expected: ResponseType, value: &RespValueVariant) -> ClientError {
    ClientError::UnexpectedResponse {
        expected,
        actual: value.resp_type(),
    }
}

/// Bulk, simple, verbatim or streamed string. Error and null frames also
/// convert, so callers can inspect them.
#[derive(Debug, Clone)]
pub struct RespString {
    value: RespValueVariant,
}

impl RespString {
    pub fn can_convert(value: &RespValueVariant) -> bool {
        match value {
            RespValueVariant::Simple(frame) => matches!(
                frame.context().resp_type,
                RespType::SimpleString
                    | RespType::BulkString
                    | RespType::VerbatimString
                    | RespType::SimpleError
                    | RespType::BulkError
                    | RespType::Null
            ),
            RespValueVariant::Aggregate(aggregate) => {
                aggregate.resp_type() == RespType::BulkString
                    && aggregate.context().length == DeclaredLength::Streamed
            }
        }
    }

    pub fn new(value: RespValueVariant) -> Self {
        debug_assert!(Self::can_convert(&value), "not a string: {}", value.resp_type());
        Self { value }
    }

    pub fn is_null(&self) -> bool {
        let context = self.value.context();
        context.resp_type == RespType::Null || context.length.is_null()
    }

    /// `txt` or `mkd` for verbatim strings.
    pub fn verbatim_format(&self) -> Option<&str> {
        match &self.value {
            RespValueVariant::Simple(frame) if frame.context().resp_type == RespType::VerbatimString => {
                let data = payload(frame);
                if data.len() >= 4 && data[3] == b':' {
                    std::str::from_utf8(&data[..3]).ok()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// The string's bytes. Borrowed for single frames, concatenated for
    /// streamed strings.
    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match &self.value {
            RespValueVariant::Simple(frame) => {
                let data = payload(frame);
                if self.verbatim_format().is_some() {
                    Cow::Borrowed(&data[4..])
                } else {
                    Cow::Borrowed(data)
                }
            }
            RespValueVariant::Aggregate(aggregate) => {
                let mut out = Vec::new();
                for chunk in aggregate.iter().filter_map(RespValueVariant::as_frame) {
                    out.extend_from_slice(payload(chunk));
                }
                Cow::Owned(out)
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self.as_bytes() {
            Cow::Borrowed(data) => Bytes::copy_from_slice(data),
            Cow::Owned(data) => Bytes::from(data),
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.as_bytes()).into_owned()
    }

    pub fn into_inner(self) -> RespValueVariant {
        self.value
    }
}

/// Generates a wrapper around a single frame of one RESP type.
macro_rules! scalar_wrapper {
    ($(#[$meta:meta])* $name:ident, $resp_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            frame: RespFrame,
        }

        impl $name {
            pub fn can_convert(value: &RespValueVariant) -> bool {
                value.as_frame().map_or(false, |frame| frame.context().resp_type == $resp_type)
            }

            pub fn new(frame: RespFrame) -> Self {
                debug_assert_eq!(frame.context().resp_type, $resp_type);
                Self { frame }
            }

            pub fn frame(&self) -> &RespFrame {
                &self.frame
            }
        }

        impl TryFrom<RespValueVariant> for $name {
            type Error = ClientError;

            fn try_from(value: RespValueVariant) -> Result<Self, ClientError> {
                match value {
                    RespValueVariant::Simple(frame) if frame.context().resp_type == $resp_type => {
                        Ok(Self::new(frame))
                    }
                    other => Err(unexpected(<$name as FromResponse>::RESPONSE_TYPE, &other)),
                }
            }
        }
    };
}

scalar_wrapper!(
    /// `:` integer reply.
    RespNumber,
    RespType::Number
);
scalar_wrapper!(
    /// `,` floating point reply.
    RespDouble,
    RespType::Double
);
scalar_wrapper!(RespBoolean, RespType::Boolean);
scalar_wrapper!(
    /// `(` arbitrary precision integer, kept as text.
    RespBigNumber,
    RespType::BigNumber
);

impl RespNumber {
    pub fn to_i64(&self) -> Result<i64> {
        payload_str(&self.frame)?
            .parse()
            .map_err(|_| RespError::format("invalid integer reply"))
    }
}

impl RespDouble {
    /// Accepts `inf`, `-inf` and `nan` besides decimal notation.
    pub fn to_f64(&self) -> Result<f64> {
        payload_str(&self.frame)?
            .parse()
            .map_err(|_| RespError::format("invalid double reply"))
    }
}

impl RespBoolean {
    pub fn to_bool(&self) -> bool {
        payload(&self.frame).first() == Some(&b't')
    }
}

impl RespBigNumber {
    pub fn as_str(&self) -> Result<&str> {
        payload_str(&self.frame)
    }

    /// Fails with `Format` if the number does not fit in 128 bits.
    pub fn to_i128(&self) -> Result<i128> {
        self.as_str()?
            .parse()
            .map_err(|_| RespError::format("big number does not fit in i128"))
    }
}

/// Generates a wrapper around an aggregate of one collection type.
macro_rules! collection_wrapper {
    ($(#[$meta:meta])* $name:ident, $resp_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            aggregate: Aggregate,
        }

        impl $name {
            pub fn can_convert(value: &RespValueVariant) -> bool {
                value.as_aggregate().map_or(false, |aggregate| aggregate.resp_type() == $resp_type)
            }

            pub fn new(aggregate: Aggregate) -> Self {
                debug_assert_eq!(aggregate.resp_type(), $resp_type);
                Self { aggregate }
            }

            pub fn is_null(&self) -> bool {
                self.aggregate.is_null()
            }

            pub fn aggregate(&self) -> &Aggregate {
                &self.aggregate
            }

            pub fn into_inner(self) -> Aggregate {
                self.aggregate
            }
        }

        impl TryFrom<RespValueVariant> for $name {
            type Error = ClientError;

            fn try_from(value: RespValueVariant) -> Result<Self, ClientError> {
                match value {
                    RespValueVariant::Aggregate(aggregate) if aggregate.resp_type() == $resp_type => {
                        Ok(Self::new(aggregate))
                    }
                    other => Err(unexpected(<$name as FromResponse>::RESPONSE_TYPE, &other)),
                }
            }
        }
    };
}

collection_wrapper!(RespArray, RespType::Array);
collection_wrapper!(RespSet, RespType::Set);
collection_wrapper!(
    /// Key/value reply. Lengths and iteration are in pairs.
    RespMap,
    RespType::Map
);
collection_wrapper!(
    /// Out-of-band message from the server.
    RespPush,
    RespType::Push
);

impl RespArray {
    pub fn len(&self) -> usize {
        self.aggregate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RespValueVariant> {
        self.aggregate.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RespValueVariant> {
        self.aggregate.iter()
    }
}

impl RespSet {
    pub fn len(&self) -> usize {
        self.aggregate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.is_empty()
    }

    /// Member at `index`, in the order the server sent them.
    pub fn get(&self, index: usize) -> Option<&RespValueVariant> {
        self.aggregate.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RespValueVariant> {
        self.aggregate.iter()
    }

    /// Whether a string member equals `member`.
    pub fn contains(&self, member: &[u8]) -> bool {
        self.iter().any(|value| string_eq(value, member))
    }
}

fn string_eq(value: &RespValueVariant, expected: &[u8]) -> bool {
    RespString::can_convert(value) && RespString::new(value.clone()).as_bytes() == expected
}

impl RespMap {
    pub fn len(&self) -> usize {
        self.aggregate.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RespValueVariant, &RespValueVariant)> {
        self.aggregate
            .elements()
            .chunks_exact(2)
            .map(|pair| (&pair[0], &pair[1]))
    }

    /// Value stored under a string key.
    pub fn get(&self, key: &[u8]) -> Option<&RespValueVariant> {
        self.iter()
            .find(|(k, _)| string_eq(k, key))
            .map(|(_, value)| value)
    }
}

impl RespPush {
    /// First element: `message`, `invalidate`, `subscribe`...
    pub fn kind(&self) -> Option<Cow<'_, str>> {
        self.aggregate
            .get(0)
            .and_then(RespValueVariant::as_frame)
            .map(|frame| String::from_utf8_lossy(payload(frame)))
    }

    pub fn len(&self) -> usize {
        self.aggregate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RespValueVariant> {
        self.aggregate.get(index)
    }
}

/// Reply whose content is ignored; only success matters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RespVoid;

impl RespVoid {
    pub fn can_convert(value: &RespValueVariant) -> bool {
        !value.is_error()
    }
}

/// `subscribe`-family push acknowledging a subscription change.
#[derive(Debug, Clone)]
pub struct RespSubscriptionAck {
    push: RespPush,
}

impl RespSubscriptionAck {
    pub fn can_convert(value: &RespValueVariant) -> bool {
        let Some(aggregate) = value.as_aggregate() else {
            return false;
        };
        if aggregate.resp_type() != RespType::Push || aggregate.len() < 3 {
            return false;
        }
        aggregate
            .get(0)
            .and_then(RespValueVariant::as_frame)
            .map_or(false, |frame| {
                let kind = payload(frame);
                SUBSCRIPTION_KINDS.iter().any(|k| k.eq_ignore_ascii_case(kind))
            })
    }

    pub fn new(aggregate: Aggregate) -> Self {
        let push = RespPush::new(aggregate);
        debug_assert!(Self::can_convert(&RespValueVariant::Aggregate(push.aggregate().clone())));
        Self { push }
    }

    pub fn kind(&self) -> Cow<'_, str> {
        self.push.kind().unwrap_or(Cow::Borrowed(""))
    }

    pub fn channel(&self) -> Option<Cow<'_, [u8]>> {
        self.push
            .get(1)
            .filter(|value| RespString::can_convert(value))
            .and_then(RespValueVariant::as_frame)
            .map(|frame| Cow::Borrowed(payload(frame)))
    }

    /// Subscriptions the connection holds after this change.
    pub fn count(&self) -> Result<i64> {
        match self.push.get(2).and_then(RespValueVariant::as_frame) {
            Some(frame) if frame.context().resp_type == RespType::Number => {
                RespNumber::new(frame.clone()).to_i64()
            }
            _ => Err(RespError::format("subscription ack without a count")),
        }
    }
}

/// Owned, pool-independent copy of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(Bytes),
    Verbatim { format: String, text: String },
    Error(String),
    Number(i64),
    Double(f64),
    Boolean(bool),
    BigNumber(String),
    Array(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Push(Vec<Value>),
    Attribute(Vec<(Value, Value)>),
}

impl RespValueVariant {
    /// Copy the value out of its blocks.
    pub fn to_value(&self) -> Result<Value> {
        match self {
            RespValueVariant::Simple(frame) => frame_value(frame),
            RespValueVariant::Aggregate(aggregate) => aggregate_value(aggregate),
        }
    }
}

fn frame_value(frame: &RespFrame) -> Result<Value> {
    let context = frame.context();
    if context.length.is_null() {
        return Ok(Value::Null);
    }
    Ok(match context.resp_type {
        RespType::Null => Value::Null,
        RespType::SimpleString | RespType::BulkString => {
            Value::String(Bytes::copy_from_slice(payload(frame)))
        }
        RespType::VerbatimString => {
            let string = RespString::new(RespValueVariant::Simple(frame.clone()));
            Value::Verbatim {
                format: string.verbatim_format().unwrap_or_default().to_string(),
                text: string.to_string_lossy(),
            }
        }
        RespType::SimpleError | RespType::BulkError => {
            Value::Error(String::from_utf8_lossy(payload(frame)).into_owned())
        }
        RespType::Number => Value::Number(RespNumber::new(frame.clone()).to_i64()?),
        RespType::Double => Value::Double(RespDouble::new(frame.clone()).to_f64()?),
        RespType::Boolean => Value::Boolean(RespBoolean::new(frame.clone()).to_bool()),
        RespType::BigNumber => Value::BigNumber(payload_str(frame)?.to_string()),
        other => return Err(RespError::format(format!("{other} frame is not a value"))),
    })
}

fn aggregate_value(aggregate: &Aggregate) -> Result<Value> {
    if aggregate.is_null() {
        return Ok(Value::Null);
    }
    let items = || aggregate.iter().map(RespValueVariant::to_value).collect::<Result<Vec<_>>>();
    let pairs = || -> Result<Vec<(Value, Value)>> {
        aggregate
            .elements()
            .chunks_exact(2)
            .map(|pair| Ok((pair[0].to_value()?, pair[1].to_value()?)))
            .collect()
    };

    Ok(match aggregate.resp_type() {
        RespType::BulkString => {
            let string = RespString::new(RespValueVariant::Aggregate(aggregate.clone()));
            Value::String(string.to_bytes())
        }
        RespType::Array => Value::Array(items()?),
        RespType::Set => Value::Set(items()?),
        RespType::Push => Value::Push(items()?),
        RespType::Map => Value::Map(pairs()?),
        RespType::Attribute => Value::Attribute(pairs()?),
        other => return Err(RespError::format(format!("{other} is not a collection"))),
    })
}

impl Value {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            Value::Null => write!(f, "(nil)"),
            Value::String(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes).escape_debug()),
            Value::Verbatim { text, .. } => write!(f, "{text}"),
            Value::Error(message) => write!(f, "(error) {message}"),
            Value::Number(n) => write!(f, "(integer) {n}"),
            Value::Double(d) => write!(f, "(double) {d}"),
            Value::Boolean(b) => write!(f, "({b})"),
            Value::BigNumber(n) => write!(f, "(big number) {n}"),
            Value::Array(items) | Value::Set(items) | Value::Push(items) => {
                if items.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, "\n{:indent$}", "")?;
                    }
                    let label = format!("{}) ", i + 1);
                    write!(f, "{label}")?;
                    item.write_indented(f, indent + label.len())?;
                }
                Ok(())
            }
            Value::Map(pairs) | Value::Attribute(pairs) => {
                if pairs.is_empty() {
                    return write!(f, "(empty hash)");
                }
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "\n{:indent$}", "")?;
                    }
                    let label = format!("{}# ", i + 1);
                    write!(f, "{label}")?;
                    key.write_indented(f, indent + label.len())?;
                    write!(f, " => ")?;
                    value.write_indented(f, indent + label.len())?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl FromResponse for RespResponse {
    const RESPONSE_TYPE: ResponseType = ResponseType::Any;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        Ok(response)
    }
}

impl FromResponse for RespValueVariant {
    const RESPONSE_TYPE: ResponseType = ResponseType::Any;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        Ok(response.value)
    }
}

impl FromResponse for Value {
    const RESPONSE_TYPE: ResponseType = ResponseType::Any;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        Ok(response.value.to_value()?)
    }
}

impl FromResponse for RespVoid {
    const RESPONSE_TYPE: ResponseType = ResponseType::Void;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        if RespVoid::can_convert(&response.value) {
            Ok(RespVoid)
        } else {
            Err(unexpected(Self::RESPONSE_TYPE, &response.value))
        }
    }
}

impl FromResponse for () {
    const RESPONSE_TYPE: ResponseType = ResponseType::Void;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        RespVoid::from_response(response).map(|_| ())
    }
}

impl TryFrom<RespValueVariant> for RespString {
    type Error = ClientError;

    fn try_from(value: RespValueVariant) -> Result<Self, ClientError> {
        if RespString::can_convert(&value) {
            Ok(RespString::new(value))
        } else {
            Err(unexpected(ResponseType::String, &value))
        }
    }
}

impl TryFrom<RespValueVariant> for RespSubscriptionAck {
    type Error = ClientError;

    fn try_from(value: RespValueVariant) -> Result<Self, ClientError> {
        match value {
            RespValueVariant::Aggregate(aggregate)
                if RespSubscriptionAck::can_convert(&RespValueVariant::Aggregate(aggregate.clone())) =>
            {
                Ok(RespSubscriptionAck::new(aggregate))
            }
            other => Err(unexpected(ResponseType::SubscriptionAck, &other)),
        }
    }
}

/// `FromResponse` for wrappers that are plain `TryFrom` conversions.
macro_rules! from_response_via_try_from {
    ($($name:ty => $response_type:expr),* $(,)?) => {
        $(
            impl FromResponse for $name {
                const RESPONSE_TYPE: ResponseType = $response_type;

                fn from_response(response: RespResponse) -> Result<Self, ClientError> {
                    <$name>::try_from(response.value)
                }
            }
        )*
    };
}

from_response_via_try_from!(
    RespString => ResponseType::String,
    RespNumber => ResponseType::Number,
    RespDouble => ResponseType::Double,
    RespBoolean => ResponseType::Boolean,
    RespBigNumber => ResponseType::BigNumber,
    RespArray => ResponseType::Array,
    RespSet => ResponseType::Set,
    RespMap => ResponseType::Map,
    RespPush => ResponseType::Push,
    RespSubscriptionAck => ResponseType::SubscriptionAck,
);

/// A converted reply that keeps its attribute.
#[derive(Debug, Clone)]
pub struct TypedResponse<T> {
    pub value: T,
    pub attribute: Option<Aggregate>,
}

impl<T: FromResponse> FromResponse for TypedResponse<T> {
    const RESPONSE_TYPE: ResponseType = T::RESPONSE_TYPE;

    fn from_response(mut response: RespResponse) -> Result<Self, ClientError> {
        let attribute = response.attribute.take();
        Ok(Self {
            value: T::from_response(response)?,
            attribute,
        })
    }
}

impl FromResponse for i64 {
    const RESPONSE_TYPE: ResponseType = ResponseType::Number;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        Ok(RespNumber::from_response(response)?.to_i64()?)
    }
}

impl FromResponse for f64 {
    const RESPONSE_TYPE: ResponseType = ResponseType::Double;

    /// RESP2 servers send doubles as bulk strings; both forms are accepted.
    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        if RespString::can_convert(&response.value) {
            let text = RespString::new(response.value).to_string_lossy();
            return text
                .parse()
                .map_err(|_| RespError::format("invalid double reply").into());
        }
        Ok(RespDouble::from_response(response)?.to_f64()?)
    }
}

impl FromResponse for bool {
    const RESPONSE_TYPE: ResponseType = ResponseType::Boolean;

    /// RESP2 servers answer `:1`/`:0` where RESP3 sends `#t`/`#f`.
    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        if RespNumber::can_convert(&response.value) {
            return Ok(RespNumber::from_response(response)?.to_i64()? != 0);
        }
        Ok(RespBoolean::from_response(response)?.to_bool())
    }
}

impl FromResponse for Option<Bytes> {
    const RESPONSE_TYPE: ResponseType = ResponseType::String;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        let string = RespString::from_response(response)?;
        Ok((!string.is_null()).then(|| string.to_bytes()))
    }
}

impl FromResponse for String {
    const RESPONSE_TYPE: ResponseType = ResponseType::String;

    fn from_response(response: RespResponse) -> Result<Self, ClientError> {
        Ok(RespString::from_response(response)?.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framer;
    use crate::memory::{BlockPool, PoolOptions};
    use crate::protocols::resp::aggregate::{AggregatesPool, AggregationStrategy};
    use crate::protocols::resp::parser::RespScanner;

    fn parse(input: &[u8]) -> Vec<RespValueVariant> {
        let pool = BlockPool::new(PoolOptions::default());
        let mut framer = Framer::new(RespScanner::new(), &pool, 256).unwrap();
        let mut strategy = AggregationStrategy::new(AggregatesPool::new());
        let mut values = Vec::new();
        for frame in framer.push(input).unwrap() {
            values.extend(strategy.aggregate(frame).unwrap());
        }
        values
    }

    fn one(input: &[u8]) -> RespValueVariant {
        let mut values = parse(input);
        assert_eq!(values.len(), 1, "expected one value from {:?}", String::from_utf8_lossy(input));
        values.remove(0)
    }

    #[test]
    fn test_strings() {
        let bulk = RespString::try_from(one(b"$5\r\nhello\r\n")).unwrap();
        assert_eq!(&*bulk.as_bytes(), b"hello");
        assert!(!bulk.is_null());

        let simple = RespString::try_from(one(b"+OK\r\n")).unwrap();
        assert_eq!(simple.to_string_lossy(), "OK");

        let empty = RespString::try_from(one(b"$0\r\n\r\n")).unwrap();
        assert!(empty.as_bytes().is_empty());
        assert!(!empty.is_null());

        assert!(RespString::try_from(one(b"$-1\r\n")).unwrap().is_null());
        assert!(RespString::try_from(one(b"_\r\n")).unwrap().is_null());
    }

    #[test]
    fn test_verbatim_string() {
        let verbatim = RespString::try_from(one(b"=15\r\ntxt:Some string\r\n")).unwrap();
        assert_eq!(verbatim.verbatim_format(), Some("txt"));
        assert_eq!(verbatim.to_string_lossy(), "Some string");
    }

    #[test]
    fn test_streamed_string_concatenates() {
        let value = one(b"$?\r\n;4\r\nHell\r\n;6\r\no worl\r\n;1\r\nd\r\n;0\r\n");
        let string = RespString::try_from(value).unwrap();
        assert_eq!(string.to_bytes(), Bytes::from_static(b"Hello world"));
    }

    #[test]
    fn test_scalars() {
        assert_eq!(RespNumber::try_from(one(b":-42\r\n")).unwrap().to_i64().unwrap(), -42);
        assert_eq!(RespDouble::try_from(one(b",1.5\r\n")).unwrap().to_f64().unwrap(), 1.5);
        assert_eq!(
            RespDouble::try_from(one(b",-inf\r\n")).unwrap().to_f64().unwrap(),
            f64::NEG_INFINITY
        );
        assert!(RespDouble::try_from(one(b",nan\r\n")).unwrap().to_f64().unwrap().is_nan());
        assert!(RespBoolean::try_from(one(b"#t\r\n")).unwrap().to_bool());
        assert!(!RespBoolean::try_from(one(b"#f\r\n")).unwrap().to_bool());

        let big = RespBigNumber::try_from(one(b"(3492890328409238509324850943850943825024385\r\n")).unwrap();
        assert_eq!(big.as_str().unwrap(), "3492890328409238509324850943850943825024385");
        assert!(matches!(big.to_i128(), Err(RespError::Format(_))));
        let small = RespBigNumber::try_from(one(b"(-170141183460469231731687303715884105728\r\n")).unwrap();
        assert_eq!(small.to_i128().unwrap(), i128::MIN);
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        match RespNumber::try_from(one(b"+OK\r\n")) {
            Err(ClientError::UnexpectedResponse { expected, actual }) => {
                assert_eq!(expected, ResponseType::Number);
                assert_eq!(actual, RespType::SimpleString);
            }
            other => panic!("Expected UnexpectedResponse, got {other:?}"),
        }
        assert!(!RespArray::can_convert(&one(b"%0\r\n")));
        assert!(ResponseType::Map.can_convert(&one(b"%0\r\n")));
    }

    #[test]
    fn test_collections() {
        let array = RespArray::try_from(one(b"*3\r\n:1\r\n$5\r\nhello\r\n#t\r\n")).unwrap();
        assert_eq!(array.len(), 3);
        assert_eq!(array.iter().count(), 3);
        assert!(RespBoolean::can_convert(array.get(2).unwrap()));

        let map = RespMap::try_from(one(b"%2\r\n+first\r\n:1\r\n$6\r\nsecond\r\n:2\r\n")).unwrap();
        assert_eq!(map.len(), 2);
        let second = map.get(b"second").unwrap();
        assert_eq!(RespNumber::try_from(second.clone()).unwrap().to_i64().unwrap(), 2);
        assert!(map.get(b"third").is_none());

        let set = RespSet::try_from(one(b"~2\r\n+a\r\n+b\r\n")).unwrap();
        assert!(set.contains(b"b"));
        assert!(!set.contains(b"c"));
        assert_eq!(set.get(1).unwrap().to_debug_string(), "+b\r\n");
        assert!(set.get(2).is_none());

        assert!(RespArray::try_from(one(b"*-1\r\n")).unwrap().is_null());
    }

    #[test]
    fn test_push_and_subscription_ack() {
        let ack = one(b">3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n");
        assert!(RespSubscriptionAck::can_convert(&ack));
        let ack = RespSubscriptionAck::try_from(ack).unwrap();
        assert_eq!(ack.kind(), "subscribe");
        assert_eq!(ack.channel().as_deref(), Some(&b"news"[..]));
        assert_eq!(ack.count().unwrap(), 1);

        let message = one(b">3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n");
        assert!(!RespSubscriptionAck::can_convert(&message));
        let push = RespPush::try_from(message).unwrap();
        assert_eq!(push.kind().as_deref(), Some("message"));
        assert_eq!(push.len(), 3);
    }

    #[test]
    fn test_from_response_conversions() {
        let response = |input: &[u8]| RespResponse::new(one(input));

        assert_eq!(i64::from_response(response(b":7\r\n")).unwrap(), 7);
        assert!(bool::from_response(response(b":1\r\n")).unwrap());
        assert!(!bool::from_response(response(b"#f\r\n")).unwrap());
        assert_eq!(f64::from_response(response(b"$4\r\n2.25\r\n")).unwrap(), 2.25);
        assert_eq!(String::from_response(response(b"+PONG\r\n")).unwrap(), "PONG");
        assert_eq!(Option::<Bytes>::from_response(response(b"$-1\r\n")).unwrap(), None);
        assert_eq!(
            Option::<Bytes>::from_response(response(b"$2\r\nhi\r\n")).unwrap(),
            Some(Bytes::from_static(b"hi"))
        );
        assert!(<()>::from_response(response(b"+OK\r\n")).is_ok());
        assert!(matches!(
            i64::from_response(response(b"$1\r\n1\r\n")),
            Err(ClientError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn test_typed_response_keeps_attribute() {
        let pool = BlockPool::new(PoolOptions::default());
        let mut framer = Framer::new(RespScanner::new(), &pool, 256).unwrap();
        let mut strategy = AggregationStrategy::new(AggregatesPool::new());
        let mut reply = None;
        for frame in framer.push(b"|1\r\n+ttl\r\n:10\r\n:42\r\n").unwrap() {
            if let Some(value) = strategy.aggregate(frame).unwrap() {
                reply = Some(RespResponse::with_attribute(value, strategy.take_attribute()));
            }
        }

        let typed = TypedResponse::<i64>::from_response(reply.unwrap()).unwrap();
        assert_eq!(typed.value, 42);
        assert_eq!(typed.attribute.unwrap().len(), 2);
    }

    #[test]
    fn test_value_tree() {
        let value = one(b"*3\r\n:1\r\n%1\r\n+k\r\n$1\r\nv\r\n_\r\n").to_value().unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Number(1),
                Value::Map(vec![(
                    Value::String(Bytes::from_static(b"k")),
                    Value::String(Bytes::from_static(b"v"))
                )]),
                Value::Null,
            ])
        );
        assert_eq!(value.to_string(), "1) (integer) 1\n2) 1# \"k\" => \"v\"\n3) (nil)");
    }

    #[test]
    fn test_value_display_nested() {
        let value = one(b"*2\r\n*2\r\n+a\r\n+b\r\n*0\r\n").to_value().unwrap();
        assert_eq!(value.to_string(), "1) 1) \"a\"\n   2) \"b\"\n2) (empty array)");
        assert_eq!(one(b"-ERR boom\r\n").to_value().unwrap().to_string(), "(error) ERR boom");
    }
}
