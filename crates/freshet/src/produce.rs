//! Producer entry point — dehydrates a root mapping into the outgoing
//! JSON Lines byte stream.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use freshet_core::value::{Path, Value};
use freshet_core::wire;

use crate::dehydrate::Dehydrator;
use crate::error::ProduceError;

/// Unary transform applied to the head and every chunk before
/// serialization. A hook for supertype-aware wire representations.
pub type SerializeHook = Box<dyn Fn(Json) -> Json + Send + Sync>;

/// Observer invoked for every leaf error (rejections, sequence failures,
/// depth violations) before the error chunk is emitted.
pub type ErrorObserver = Box<dyn Fn(&anyhow::Error, &Path) + Send + Sync>;

/// Maps a leaf error to its wire payload. The codec does not prescribe
/// the payload shape; the default is `{"message": <Display>}`.
pub type FormatErrorHook = Box<dyn Fn(&anyhow::Error, &Path) -> Json + Send + Sync>;

/// Outbound chunk lines buffered between leaf tasks and the byte stream.
/// Awaiting a slot is the producer's implicit backpressure point.
const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// Options for [`produce`].
pub struct ProduceOptions {
    /// The root mapping to transmit.
    pub data: BTreeMap<String, Value>,
    pub serialize: Option<SerializeHook>,
    pub on_error: Option<ErrorObserver>,
    pub format_error: Option<FormatErrorHook>,
    /// Maximum path depth for deferred leaves. Violations reject the
    /// affected leaf; they never abort the stream.
    pub max_depth: Option<usize>,
}

impl ProduceOptions {
    pub fn new(data: BTreeMap<String, Value>) -> Self {
        ProduceOptions {
            data,
            serialize: None,
            on_error: None,
            format_error: None,
            max_depth: None,
        }
    }
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

/// Dehydrate `options.data` and return the outgoing byte stream: the head
/// line first, then chunk lines in emission order, each a complete
/// newline-terminated JSON value encoded as UTF-8.
///
/// The stream ends once every deferred leaf has published its terminal
/// chunk. Dropping the stream cancels all outstanding leaf work.
///
/// Must be called within a tokio runtime: deferred leaves are driven by
/// spawned tasks.
pub fn produce(options: ProduceOptions) -> Result<ByteStream, ProduceError> {
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let dehydrator = Dehydrator::new(
        chunk_tx,
        options.serialize,
        options.on_error,
        options.format_error,
        options.max_depth,
    );

    let root = Path::root();
    let mut head = BTreeMap::new();
    let mut leaves = Vec::new();
    for (key, value) in options.data {
        let entry_path = root.child_key(&key);
        let entry = dehydrator.dehydrate(value, &entry_path, &mut leaves)?;
        head.insert(key, entry);
    }

    let head_line = dehydrator.encode(wire::encode_head(&head));
    tracing::debug!(entries = head.len(), deferred = leaves.len(), "root dehydrated");

    // Leaf tasks start only now that the head referencing their ids is
    // fixed at the front of the stream; on an error above, the collected
    // leaves drop without ever touching the wire.
    dehydrator.spawn_leaves(leaves);

    // The dehydrator handle (and with it the root chunk sender) drops
    // here; the stream closes once the remaining senders, one per live
    // leaf task, are gone and the channel drains.
    Ok(ByteStream {
        head: Some(head_line),
        chunk_rx,
    })
}

/// The outgoing byte stream returned by [`produce`].
#[derive(Debug)]
pub struct ByteStream {
    head: Option<Bytes>,
    chunk_rx: mpsc::Receiver<Bytes>,
}

impl Stream for ByteStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(head) = this.head.take() {
            return Poll::Ready(Some(head));
        }
        this.chunk_rx.poll_recv(cx)
    }
}
