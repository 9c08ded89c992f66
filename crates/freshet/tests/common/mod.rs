//! Shared harness for the integration tests: in-memory transports and
//! small accessors for reconstructed values.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value as Json;

use freshet::{ByteStream, Hydrated, PromiseHandle, Value};

/// Drain a produced byte stream into the full transmitted text.
pub async fn collect_text(stream: ByteStream) -> String {
    let chunks: Vec<Bytes> = stream.collect().await;
    let mut text = String::new();
    for chunk in chunks {
        text.push_str(std::str::from_utf8(&chunk).expect("produced bytes must be UTF-8"));
    }
    text
}

/// Next line of a produced stream. Each stream item is one complete line.
pub async fn next_line(stream: &mut ByteStream) -> String {
    let chunk = stream.next().await.expect("stream ended early");
    String::from_utf8(chunk.to_vec()).expect("produced bytes must be UTF-8")
}

/// A byte source replaying fixed text, split into awkward chunk sizes to
/// exercise the framer.
pub fn replay_source(text: &str) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let chunks: Vec<io::Result<Bytes>> = text
        .as_bytes()
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks)
}

/// A push-style byte source: send text through the handle, drop it to end
/// the stream.
pub fn channel_source() -> (
    futures::channel::mpsc::UnboundedSender<io::Result<Bytes>>,
    impl Stream<Item = io::Result<Bytes>> + Send + 'static,
) {
    futures::channel::mpsc::unbounded()
}

pub fn send_text(tx: &futures::channel::mpsc::UnboundedSender<io::Result<Bytes>>, text: &str) {
    tx.unbounded_send(Ok(Bytes::copy_from_slice(text.as_bytes())))
        .expect("consumer dropped the source");
}

/// Connect a producer directly to a consumer.
pub fn pipe(stream: ByteStream) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream.map(Ok)
}

/// Root mapping with a single entry.
pub fn root(key: &str, value: Value) -> BTreeMap<String, Value> {
    let mut data = BTreeMap::new();
    data.insert(key.to_string(), value);
    data
}

pub fn expect_json(value: &Hydrated) -> &Json {
    value.as_json().expect("expected a plain JSON value")
}

pub fn expect_promise(value: Hydrated) -> PromiseHandle {
    value.into_promise().expect("expected a promise handle")
}

/// Resolve a promise handle that must yield plain JSON.
pub async fn resolve_json(handle: PromiseHandle) -> Json {
    match handle.resolve().await.expect("promise rejected") {
        Hydrated::Json(v) => v,
        other => panic!("expected plain JSON resolution, got {other:?}"),
    }
}
