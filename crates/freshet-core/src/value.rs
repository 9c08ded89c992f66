//! Producer-side value tree.
//!
//! A [`Value`] is what `freshet::produce` dehydrates: plain JSON leaves,
//! containers, and the two deferred leaf kinds — a single-shot [`Promise`]
//! and a lazy [`Sequence`]. Deferred leaves carry `anyhow::Error` as their
//! failure type; the codec never interprets those errors beyond handing
//! them to the configured observer and formatter.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};

/// Result type produced by deferred leaves.
pub type LeafResult = Result<Value, anyhow::Error>;

/// A value handed to the producer.
///
/// `Json` is a fully-plain subtree and passes through dehydration
/// untouched. `Array` and `Object` are containers whose entries may be
/// deferred. Deferred entries deeper than one container level inside a
/// single dehydration unit are not representable on the wire; express
/// deeper deferral by nesting promises instead.
pub enum Value {
    Json(serde_json::Value),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Promise(Promise),
    Sequence(Sequence),
}

impl Value {
    /// Plain JSON leaf.
    pub fn json(value: impl Into<serde_json::Value>) -> Self {
        Value::Json(value.into())
    }

    /// Promise leaf from any compatible future.
    pub fn promise<F>(future: F) -> Self
    where
        F: Future<Output = LeafResult> + Send + 'static,
    {
        Value::Promise(Promise::new(future))
    }

    /// Sequence leaf from any compatible stream.
    pub fn sequence<S>(stream: S) -> Self
    where
        S: Stream<Item = LeafResult> + Send + 'static,
    {
        Value::Sequence(Sequence::new(stream))
    }

    /// True for the two deferred leaf kinds.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Value::Promise(_) | Value::Sequence(_))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Value::Promise(_) => f.write_str("Promise(..)"),
            Value::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

/// A single-shot deferred leaf: resolves to one [`Value`] or rejects.
pub struct Promise(BoxFuture<'static, LeafResult>);

impl Promise {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = LeafResult> + Send + 'static,
    {
        Promise(future.boxed())
    }

    /// Already-resolved promise. Still transmitted as a chunk.
    pub fn resolved(value: impl Into<Value>) -> Self {
        let value = value.into();
        Promise(async move { Ok(value) }.boxed())
    }

    /// Already-rejected promise. Transmitted as a REJECTED chunk.
    pub fn rejected(error: anyhow::Error) -> Self {
        Promise(async move { Err(error) }.boxed())
    }

    pub fn into_future(self) -> BoxFuture<'static, LeafResult> {
        self.0
    }
}

/// A lazy deferred sequence: yields zero or more [`Value`]s, then
/// completes or fails. Dropping the inner stream is the cleanup path when
/// the consumer goes away mid-iteration.
pub struct Sequence(BoxStream<'static, LeafResult>);

impl Sequence {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = LeafResult> + Send + 'static,
    {
        Sequence(stream.boxed())
    }

    /// Finite sequence over already-known values.
    pub fn of_values(values: impl IntoIterator<Item = Value>) -> Self {
        let items: Vec<Value> = values.into_iter().collect();
        Sequence(futures::stream::iter(items.into_iter().map(Ok)).boxed())
    }

    pub fn into_stream(self) -> BoxStream<'static, LeafResult> {
        self.0
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

/// One step into the value tree: a mapping key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Location of a value within the root tree.
///
/// Used for error reporting and depth checks. The depth of a value is the
/// number of segments in its path; top-level entries sit at depth 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path(Vec<Segment>);

impl Path {
    /// The root mapping itself.
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn child_key(&self, key: &str) -> Path {
        let mut segments = self.0.clone();
        segments.push(Segment::Key(key.to_string()));
        Path(segments)
    }

    pub fn child_index(&self, index: usize) -> Path {
        let mut segments = self.0.clone();
        segments.push(Segment::Index(index));
        Path(segments)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("root")?;
        for segment in &self.0 {
            match segment {
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}
