//! Folding flat RESP frames back into nested values.
//!
//! The scanner emits collection headers and their children as siblings.
//! [`AggregationStrategy`] rebuilds the tree with an explicit stack rather
//! than recursion, so hostile nesting depth costs heap, not call stack, and
//! is capped by `max_depth`.

use std::fmt;
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tracing::{debug, trace};

use super::types::{DeclaredLength, RespContext, RespType};
use crate::error::{RespError, Result};
use crate::framing::Frame;

/// Initial stack capacity; the stack grows past it up to `max_depth`.
const INITIAL_DEPTH: usize = 32;

/// Default nesting limit.
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Element vectors larger than this are not kept for reuse.
const MAX_POOLED_ELEMENTS: usize = 1024;

pub type RespFrame = Frame<RespContext>;

/// Pool of element vectors for [`Aggregate`]s.
#[derive(Clone, Default)]
pub struct AggregatesPool {
    vectors: Arc<SegQueue<Vec<RespValueVariant>>>,
}

impl AggregatesPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an aggregate around its header frame.
    pub fn aggregate(&self, header: RespFrame) -> Aggregate {
        Aggregate {
            header,
            elements: self.vectors.pop().unwrap_or_default(),
            attribute: None,
            pool: Some(self.clone()),
        }
    }

    /// Idle vectors waiting for reuse.
    pub fn idle(&self) -> usize {
        self.vectors.len()
    }

    fn give_back(&self, mut elements: Vec<RespValueVariant>) {
        elements.clear();
        if elements.capacity() > 0 && elements.capacity() <= MAX_POOLED_ELEMENTS {
            self.vectors.push(elements);
        }
    }
}

impl fmt::Debug for AggregatesPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatesPool").field("idle", &self.idle()).finish()
    }
}

/// A reconstructed collection: header frame, children and an optional
/// attribute.
///
/// Owns its children; dropping it releases every frame underneath.
pub struct Aggregate {
    header: RespFrame,
    elements: Vec<RespValueVariant>,
    attribute: Option<Box<Aggregate>>,
    pool: Option<AggregatesPool>,
}

impl Aggregate {
    pub fn header(&self) -> &RespFrame {
        &self.header
    }

    pub fn context(&self) -> &RespContext {
        self.header.context()
    }

    pub fn resp_type(&self) -> RespType {
        self.header.context().resp_type
    }

    /// Number of children. For maps and attributes this counts keys and
    /// values separately.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether the header declared a null collection (`*-1`).
    pub fn is_null(&self) -> bool {
        self.context().length.is_null()
    }

    pub fn get(&self, index: usize) -> Option<&RespValueVariant> {
        self.elements.get(index)
    }

    pub fn elements(&self) -> &[RespValueVariant] {
        &self.elements
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RespValueVariant> {
        self.elements.iter()
    }

    /// Attribute that preceded this value on the wire.
    pub fn attribute(&self) -> Option<&Aggregate> {
        self.attribute.as_deref()
    }

    pub fn take_attribute(&mut self) -> Option<Aggregate> {
        self.attribute.take().map(|boxed| *boxed)
    }

    pub(crate) fn push(&mut self, value: RespValueVariant) {
        self.elements.push(value);
    }

    fn set_attribute(&mut self, attribute: Aggregate) {
        self.attribute = Some(Box::new(attribute));
    }

    /// Move the parts out, e.g. to keep one child past the parent.
    pub fn into_parts(mut self) -> (RespFrame, Vec<RespValueVariant>) {
        let elements = std::mem::take(&mut self.elements);
        self.pool = None;
        // The header stays with `self` until drop, so hand out a new lease.
        (self.header.clone(), elements)
    }

    /// Frame-level rendering used by tests and diagnostics: `[hdr, child, ...]`.
    pub fn to_debug_string(&self) -> String {
        let mut out = String::from("[");
        out.push_str(&String::from_utf8_lossy(self.header.bytes()));
        for element in &self.elements {
            out.push_str(", ");
            out.push_str(&element.to_debug_string());
        }
        out.push(']');
        out
    }
}

impl Clone for Aggregate {
    fn clone(&self) -> Self {
        let mut elements = match &self.pool {
            Some(pool) => pool.vectors.pop().unwrap_or_default(),
            None => Vec::new(),
        };
        elements.extend(self.elements.iter().cloned());
        Self {
            header: self.header.clone(),
            elements,
            attribute: self.attribute.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for Aggregate {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.elements));
        }
    }
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("type", &self.resp_type())
            .field("elements", &self.elements)
            .field("attribute", &self.attribute)
            .finish()
    }
}

/// The unit produced by aggregation: a single frame or a collection.
#[derive(Debug, Clone)]
pub enum RespValueVariant {
    Simple(RespFrame),
    Aggregate(Aggregate),
}

impl RespValueVariant {
    pub fn resp_type(&self) -> RespType {
        match self {
            RespValueVariant::Simple(frame) => frame.context().resp_type,
            RespValueVariant::Aggregate(aggregate) => aggregate.resp_type(),
        }
    }

    pub fn context(&self) -> &RespContext {
        match self {
            RespValueVariant::Simple(frame) => frame.context(),
            RespValueVariant::Aggregate(aggregate) => aggregate.context(),
        }
    }

    pub fn as_frame(&self) -> Option<&RespFrame> {
        match self {
            RespValueVariant::Simple(frame) => Some(frame),
            RespValueVariant::Aggregate(_) => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&Aggregate> {
        match self {
            RespValueVariant::Simple(_) => None,
            RespValueVariant::Aggregate(aggregate) => Some(aggregate),
        }
    }

    pub fn is_error(&self) -> bool {
        self.resp_type().is_error()
    }

    pub fn to_debug_string(&self) -> String {
        match self {
            RespValueVariant::Simple(frame) => String::from_utf8_lossy(frame.bytes()).into_owned(),
            RespValueVariant::Aggregate(aggregate) => aggregate.to_debug_string(),
        }
    }
}

/// How a collection on the stack knows it is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remaining {
    Count(usize),
    /// Indefinite collection, closed by an `End` frame.
    UntilEnd,
}

struct StackEntry {
    aggregate: Aggregate,
    remaining: Remaining,
}

/// Stack machine that turns a frame sequence into complete values.
///
/// Not thread-safe; owned by the connection's receive path.
pub struct AggregationStrategy {
    pool: AggregatesPool,
    stack: Vec<StackEntry>,
    streamed: Option<Aggregate>,
    /// Attributes waiting for the next value at the depth they were read.
    attributes: Vec<(usize, Aggregate)>,
    /// Attribute preceding the next top-level value.
    top_attribute: Option<Aggregate>,
    max_depth: usize,
}

impl AggregationStrategy {
    pub fn new(pool: AggregatesPool) -> Self {
        Self::with_max_depth(pool, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(pool: AggregatesPool, max_depth: usize) -> Self {
        Self {
            pool,
            stack: Vec::with_capacity(INITIAL_DEPTH.min(max_depth)),
            streamed: None,
            attributes: Vec::new(),
            top_attribute: None,
            max_depth,
        }
    }

    /// Collections currently open.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Whether a value is partially built.
    pub fn in_progress(&self) -> bool {
        !self.stack.is_empty() || self.streamed.is_some()
    }

    /// The attribute that preceded the most recent top-level value, if any.
    pub fn take_attribute(&mut self) -> Option<Aggregate> {
        self.top_attribute.take()
    }

    /// Feed one frame. Returns a value once a top-level value is complete.
    pub fn aggregate(&mut self, frame: RespFrame) -> Result<Option<RespValueVariant>> {
        let context = *frame.context();

        if context.resp_type.is_collection() {
            let remaining = match context.length {
                DeclaredLength::Streamed => Remaining::UntilEnd,
                DeclaredLength::Known(n) if n <= 0 => Remaining::Count(0),
                DeclaredLength::Known(n) => {
                    let n = usize::try_from(n)
                        .map_err(|_| RespError::format(format!("collection length {n} out of range")))?;
                    let n = if context.resp_type.is_paired() {
                        n.checked_mul(2)
                            .ok_or_else(|| RespError::format("collection length overflows"))?
                    } else {
                        n
                    };
                    Remaining::Count(n)
                }
                DeclaredLength::Unspecified => {
                    return Err(RespError::format("collection header without length"))
                }
            };

            let aggregate = self.pool.aggregate(frame);
            if remaining == Remaining::Count(0) {
                return self.fold(RespValueVariant::Aggregate(aggregate));
            }
            if self.stack.len() >= self.max_depth {
                return Err(RespError::format(format!(
                    "nesting deeper than {} levels",
                    self.max_depth
                )));
            }
            trace!(depth = self.stack.len() + 1, ?remaining, "collection opened");
            self.stack.push(StackEntry {
                aggregate,
                remaining,
            });
            return Ok(None);
        }

        match context.resp_type {
            RespType::BulkString if context.length == DeclaredLength::Streamed => {
                if self.streamed.is_some() {
                    return Err(RespError::format("streamed string inside a streamed string"));
                }
                self.streamed = Some(self.pool.aggregate(frame));
                Ok(None)
            }
            RespType::StreamedChunk => {
                let streamed = self
                    .streamed
                    .as_mut()
                    .ok_or_else(|| RespError::format("streamed chunk outside a streamed string"))?;
                if context.length != DeclaredLength::Known(0) {
                    streamed.push(RespValueVariant::Simple(frame));
                    return Ok(None);
                }
                match self.streamed.take() {
                    Some(done) => self.fold(RespValueVariant::Aggregate(done)),
                    None => Ok(None),
                }
            }
            RespType::End => match self.stack.last() {
                Some(StackEntry {
                    remaining: Remaining::UntilEnd,
                    ..
                }) => match self.pop_entry() {
                    Some(entry) => self.fold(RespValueVariant::Aggregate(entry.aggregate)),
                    None => Ok(None),
                },
                _ => Err(RespError::format("end marker outside an indefinite collection")),
            },
            _ => self.fold(RespValueVariant::Simple(frame)),
        }
    }

    /// Add a finished value to its parent, closing parents as they fill up.
    fn fold(&mut self, mut value: RespValueVariant) -> Result<Option<RespValueVariant>> {
        loop {
            let depth = self.stack.len();

            if value.resp_type() == RespType::Attribute {
                if let RespValueVariant::Aggregate(attribute) = value {
                    if depth == 0 {
                        self.top_attribute = Some(attribute);
                    } else {
                        self.attributes.push((depth, attribute));
                    }
                }
                return Ok(None);
            }

            if matches!(self.attributes.last(), Some((at, _)) if *at == depth) {
                if let Some((_, attribute)) = self.attributes.pop() {
                    match &mut value {
                        RespValueVariant::Aggregate(aggregate) => aggregate.set_attribute(attribute),
                        RespValueVariant::Simple(frame) => debug!(
                            resp_type = %frame.context().resp_type,
                            "dropping attribute attached to a scalar"
                        ),
                    }
                }
            }

            let Some(top) = self.stack.last_mut() else {
                return Ok(Some(value));
            };

            top.aggregate.push(value);
            match &mut top.remaining {
                Remaining::Count(n) => {
                    *n -= 1;
                    if *n > 0 {
                        return Ok(None);
                    }
                }
                Remaining::UntilEnd => return Ok(None),
            }

            match self.pop_entry() {
                Some(entry) => value = RespValueVariant::Aggregate(entry.aggregate),
                None => return Ok(None),
            }
        }
    }

    /// Close the innermost collection. Attributes waiting for a child of it
    /// can no longer attach to anything.
    fn pop_entry(&mut self) -> Option<StackEntry> {
        let entry = self.stack.pop()?;
        let depth = self.stack.len();
        let before = self.attributes.len();
        self.attributes.retain(|(at, _)| *at <= depth);
        if self.attributes.len() < before {
            debug!(depth = depth + 1, "dropping attribute with no following value");
        }
        Some(entry)
    }

    /// Drop all partial state, e.g. after the stream broke.
    pub fn reset(&mut self) {
        if self.in_progress() {
            debug!(depth = self.stack.len(), "dropping partial aggregate");
        }
        self.stack.clear();
        self.streamed = None;
        self.attributes.clear();
        self.top_attribute = None;
    }
}

impl fmt::Debug for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationStrategy")
            .field("depth", &self.stack.len())
            .field("streamed", &self.streamed.is_some())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framer;
    use crate::memory::{BlockPool, PoolOptions};
    use crate::protocols::resp::parser::RespScanner;

    fn aggregate_all(input: &[u8], chunk: usize) -> (Vec<RespValueVariant>, AggregationStrategy) {
        let pool = BlockPool::new(PoolOptions { track_leases: true });
        let mut framer = Framer::new(RespScanner::new(), &pool, 1024).unwrap();
        let mut strategy = AggregationStrategy::new(AggregatesPool::new());
        let mut values = Vec::new();
        for piece in input.chunks(chunk) {
            for frame in framer.push(piece).unwrap() {
                if let Some(value) = strategy.aggregate(frame).unwrap() {
                    values.push(value);
                }
            }
        }
        (values, strategy)
    }

    fn aggregate_err(input: &[u8]) -> RespError {
        let pool = BlockPool::new(PoolOptions::default());
        let mut framer = Framer::new(RespScanner::new(), &pool, 1024).unwrap();
        let mut strategy = AggregationStrategy::with_max_depth(AggregatesPool::new(), 4);
        for frame in framer.push(input).unwrap() {
            if let Err(e) = strategy.aggregate(frame) {
                return e;
            }
        }
        panic!("Expected aggregation error for {:?}", String::from_utf8_lossy(input));
    }

    #[test]
    fn test_nested_array_folds() {
        for chunk in [1, 2, 5, 128] {
            let (values, strategy) = aggregate_all(b"*2\r\n*3\r\n:1\r\n$5\r\nhello\r\n:2\r\n#f\r\n", chunk);
            assert_eq!(values.len(), 1);
            assert_eq!(strategy.depth(), 0);

            let top = values[0].as_aggregate().unwrap();
            assert_eq!(top.resp_type(), RespType::Array);
            assert_eq!(top.len(), 2);

            let inner = top.get(0).unwrap().as_aggregate().unwrap();
            assert_eq!(inner.len(), 3);
            assert_eq!(inner.get(1).unwrap().to_debug_string(), "$5\r\nhello\r\n");
            assert_eq!(top.get(1).unwrap().resp_type(), RespType::Boolean);
            assert_eq!(top.get(1).unwrap().to_debug_string(), "#f\r\n");
        }
    }

    #[test]
    fn test_map_counts_pairs() {
        let (values, _) = aggregate_all(b"%2\r\n+first\r\n:1\r\n+second\r\n:2\r\n", 3);
        let map = values[0].as_aggregate().unwrap();
        assert_eq!(map.resp_type(), RespType::Map);
        assert_eq!(map.len(), 4);
        assert_eq!(
            map.to_debug_string(),
            "[%2\r\n, +first\r\n, :1\r\n, +second\r\n, :2\r\n]"
        );
    }

    #[test]
    fn test_simple_values_pass_through() {
        let (values, _) = aggregate_all(b"+OK\r\n:42\r\n_\r\n", 4);
        let types: Vec<_> = values.iter().map(|v| v.resp_type()).collect();
        assert_eq!(types, vec![RespType::SimpleString, RespType::Number, RespType::Null]);
    }

    #[test]
    fn test_empty_and_null_collections_complete_immediately() {
        let (values, _) = aggregate_all(b"*0\r\n*-1\r\n%0\r\n", 1);
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| v.as_aggregate().unwrap().is_empty()));
        assert!(values[1].as_aggregate().unwrap().is_null());
        assert!(!values[0].as_aggregate().unwrap().is_null());
    }

    #[test]
    fn test_streamed_string() {
        let (values, strategy) =
            aggregate_all(b"$?\r\n;4\r\nHell\r\n;6\r\no worl\r\n;1\r\nd\r\n;0\r\n", 1);
        assert!(!strategy.in_progress());
        let streamed = values[0].as_aggregate().unwrap();
        assert_eq!(streamed.resp_type(), RespType::BulkString);
        assert_eq!(streamed.len(), 3);

        let text: Vec<u8> = streamed
            .iter()
            .flat_map(|chunk| {
                let frame = chunk.as_frame().unwrap();
                let offset = frame.context().data_offset;
                frame.bytes()[offset..frame.len() - 2].to_vec()
            })
            .collect();
        assert_eq!(text, b"Hello world");
    }

    #[test]
    fn test_indefinite_array() {
        let (values, _) = aggregate_all(b"*?\r\n:1\r\n*?\r\n:2\r\n.\r\n:3\r\n.\r\n+after\r\n", 2);
        assert_eq!(values.len(), 2);
        let outer = values[0].as_aggregate().unwrap();
        assert_eq!(outer.len(), 3);
        assert_eq!(outer.get(1).unwrap().as_aggregate().unwrap().len(), 1);
        assert_eq!(values[1].resp_type(), RespType::SimpleString);
    }

    #[test]
    fn test_streamed_string_inside_array() {
        let (values, _) = aggregate_all(b"*2\r\n$?\r\n;2\r\nab\r\n;0\r\n:7\r\n", 3);
        let array = values[0].as_aggregate().unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array.get(0).unwrap().as_aggregate().unwrap().len(), 1);
    }

    #[test]
    fn test_top_level_attribute_is_out_of_band() {
        let input = b"|1\r\n+key-popularity\r\n%2\r\n$1\r\na\r\n,0.1923\r\n$1\r\nb\r\n,0.0012\r\n*2\r\n:2039123\r\n:9543892\r\n";
        let (values, mut strategy) = aggregate_all(input, 128);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].to_debug_string(), "[*2\r\n, :2039123\r\n, :9543892\r\n]");

        let attribute = strategy.take_attribute().unwrap();
        assert_eq!(attribute.resp_type(), RespType::Attribute);
        assert_eq!(attribute.len(), 2);
        assert_eq!(
            attribute.get(1).unwrap().to_debug_string(),
            "[%2\r\n, $1\r\na\r\n, ,0.1923\r\n, $1\r\nb\r\n, ,0.0012\r\n]"
        );
        assert!(strategy.take_attribute().is_none());
    }

    #[test]
    fn test_nested_attribute_attaches_to_next_aggregate() {
        let input = b"*2\r\n|1\r\n+ttl\r\n:3600\r\n*1\r\n:1\r\n:2\r\n";
        let (values, _) = aggregate_all(input, 1);
        let outer = values[0].as_aggregate().unwrap();
        assert_eq!(outer.len(), 2);
        let inner = outer.get(0).unwrap().as_aggregate().unwrap();
        let attribute = inner.attribute().unwrap();
        assert_eq!(attribute.get(0).unwrap().to_debug_string(), "+ttl\r\n");
        assert!(outer.attribute().is_none());
    }

    #[test]
    fn test_nested_attribute_on_scalar_is_dropped() {
        let (values, strategy) = aggregate_all(b"*1\r\n|1\r\n+a\r\n:1\r\n:9\r\n", 1);
        let outer = values[0].as_aggregate().unwrap();
        assert_eq!(outer.len(), 1);
        assert!(strategy.attributes.is_empty());
    }

    #[test]
    fn test_trailing_attribute_in_streamed_collection_is_dropped() {
        let input = b"*?\r\n|1\r\n+a\r\n:1\r\n.\r\n*1\r\n:2\r\n";
        let (values, strategy) = aggregate_all(input, 1);
        assert_eq!(values.len(), 2);
        assert!(values[0].as_aggregate().unwrap().is_empty());
        assert!(values[0].as_aggregate().unwrap().attribute().is_none());
        assert!(values[1].as_aggregate().unwrap().attribute().is_none());
        assert!(strategy.attributes.is_empty());
    }

    #[test]
    fn test_format_errors() {
        assert!(matches!(aggregate_err(b";3\r\nabc\r\n"), RespError::Format(_)));
        assert!(matches!(aggregate_err(b".\r\n"), RespError::Format(_)));
        assert!(matches!(aggregate_err(b"*1\r\n.\r\n"), RespError::Format(_)));
        assert!(matches!(aggregate_err(b"$?\r\n$?\r\n"), RespError::Format(_)));
        assert!(matches!(
            aggregate_err(b"*1\r\n*1\r\n*1\r\n*1\r\n*1\r\n:1\r\n"),
            RespError::Format(_)
        ));
    }

    #[test]
    fn test_reset_mid_aggregate() {
        let pool = BlockPool::new(PoolOptions { track_leases: true });
        let mut framer = Framer::new(RespScanner::new(), &pool, 1024).unwrap();
        let mut strategy = AggregationStrategy::new(AggregatesPool::new());

        for frame in framer.push(b"*3\r\n:1\r\n$?\r\n;1\r\na\r\n").unwrap() {
            assert!(strategy.aggregate(frame).unwrap().is_none());
        }
        assert!(strategy.in_progress());
        strategy.reset();
        framer.reset().unwrap();
        assert!(!strategy.in_progress());
        // Only the framer's receive block is still leased.
        assert_eq!(pool.outstanding(), 1);

        let mut done = Vec::new();
        for frame in framer.push(b"*1\r\n:5\r\n").unwrap() {
            done.extend(strategy.aggregate(frame).unwrap());
        }
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].as_aggregate().unwrap().len(), 1);
    }

    #[test]
    fn test_element_vectors_are_recycled() {
        let pool = AggregatesPool::new();
        let block_pool = BlockPool::new(PoolOptions::default());
        let mut framer = Framer::new(RespScanner::new(), &block_pool, 1024).unwrap();
        let mut strategy = AggregationStrategy::new(pool.clone());

        for frame in framer.push(b"*2\r\n:1\r\n:2\r\n").unwrap() {
            drop(strategy.aggregate(frame).unwrap());
        }
        assert_eq!(pool.idle(), 1);

        let (header, elements) = {
            let mut values = Vec::new();
            for frame in framer.push(b"*1\r\n:3\r\n").unwrap() {
                values.extend(strategy.aggregate(frame).unwrap());
            }
            match values.pop() {
                Some(RespValueVariant::Aggregate(aggregate)) => aggregate.into_parts(),
                other => panic!("Expected aggregate, got {other:?}"),
            }
        };
        assert_eq!(header.bytes(), b"*1\r\n");
        assert_eq!(elements.len(), 1);
        assert_eq!(pool.idle(), 0);
    }
}
