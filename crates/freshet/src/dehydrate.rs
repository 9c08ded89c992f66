//! Dehydration — walks a value tree, substitutes deferred leaves with
//! placeholders, and drives the background tasks that publish their
//! resolutions as chunks.
//!
//! Dehydration is synchronous and only collects deferred leaves; their
//! tasks are spawned by the caller *after* the line referencing their
//! chunk-ids has been emitted. That ordering is load-bearing: the
//! consumer's demuxer suspends on a chunk whose id it has not been told
//! about, so a leaf chunk overtaking its referencing line would stall the
//! whole stream.
//!
//! Each leaf task races the user's future or sequence against
//! cancellation of the outgoing stream, so a consumer that goes away never
//! leaves producer work running.
//!
//! Container recursion is one level shallow per dehydration unit: deferred
//! leaves nested deeper inside plain containers are not addressable by a
//! descriptor key and are rejected. A promise whose resolved value itself
//! contains deferred leaves works because the resolved value re-enters
//! dehydration with fresh chunk-ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;

use freshet_core::value::{Path, Promise, Sequence, Value};
use freshet_core::wire::{
    self, ChunkId, ChunkKind, Dehydrated, Descriptor, DescriptorKey, RawChunk,
};

use crate::error::ProduceError;
use crate::produce::{ErrorObserver, FormatErrorHook, SerializeHook};

/// A deferred leaf collected during a dehydration walk, not yet running.
pub(crate) struct PendingLeaf {
    id: ChunkId,
    path: Path,
    work: LeafWork,
}

enum LeafWork {
    Promise(Promise),
    Sequence(Sequence),
    /// Leaf sat past `max_depth`; the user value was already dropped and
    /// the task only publishes the rejection.
    PromiseDepth(usize),
    SequenceDepth(usize),
}

pub(crate) struct Dehydrator {
    next_id: AtomicU64,
    chunk_tx: mpsc::Sender<Bytes>,
    serialize: Option<SerializeHook>,
    on_error: Option<ErrorObserver>,
    format_error: Option<FormatErrorHook>,
    max_depth: Option<usize>,
}

impl Dehydrator {
    pub(crate) fn new(
        chunk_tx: mpsc::Sender<Bytes>,
        serialize: Option<SerializeHook>,
        on_error: Option<ErrorObserver>,
        format_error: Option<FormatErrorHook>,
        max_depth: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Dehydrator {
            next_id: AtomicU64::new(0),
            chunk_tx,
            serialize,
            on_error,
            format_error,
            max_depth,
        })
    }

    /// Replace deferred leaves with placeholders plus chunk descriptors,
    /// pushing each leaf onto `leaves` for the caller to spawn once the
    /// referencing line is out.
    ///
    /// On error the collected leaves are simply dropped with the vec;
    /// nothing has been spawned, so no orphan chunk-id ever reaches the
    /// wire.
    pub(crate) fn dehydrate(
        &self,
        value: Value,
        path: &Path,
        leaves: &mut Vec<PendingLeaf>,
    ) -> Result<Dehydrated, ProduceError> {
        match value {
            Value::Promise(promise) => {
                let id = self.defer_promise(promise, path.clone(), leaves);
                Ok(deferred_whole(ChunkKind::Promise, id))
            }
            Value::Sequence(sequence) => {
                let id = self.defer_sequence(sequence, path.clone(), leaves);
                Ok(deferred_whole(ChunkKind::Sequence, id))
            }
            Value::Json(payload) => Ok(Dehydrated::plain(payload)),
            Value::Array(items) => {
                let mut payload = Vec::with_capacity(items.len());
                let mut descriptors = Vec::new();
                for (index, item) in items.into_iter().enumerate() {
                    let entry_path = path.child_index(index);
                    match item {
                        Value::Promise(promise) => {
                            let id = self.defer_promise(promise, entry_path, leaves);
                            payload.push(wire::placeholder());
                            descriptors.push(Descriptor {
                                key: DescriptorKey::Index(index as u64),
                                kind: ChunkKind::Promise,
                                id,
                            });
                        }
                        Value::Sequence(sequence) => {
                            let id = self.defer_sequence(sequence, entry_path, leaves);
                            payload.push(wire::placeholder());
                            descriptors.push(Descriptor {
                                key: DescriptorKey::Index(index as u64),
                                kind: ChunkKind::Sequence,
                                id,
                            });
                        }
                        other => payload.push(flatten_plain(other, &entry_path)?),
                    }
                }
                Ok(Dehydrated {
                    payload: Json::Array(payload),
                    descriptors,
                })
            }
            Value::Object(entries) => {
                let mut payload = serde_json::Map::with_capacity(entries.len());
                let mut descriptors = Vec::new();
                for (key, item) in entries {
                    let entry_path = path.child_key(&key);
                    match item {
                        Value::Promise(promise) => {
                            let id = self.defer_promise(promise, entry_path, leaves);
                            payload.insert(key.clone(), wire::placeholder());
                            descriptors.push(Descriptor {
                                key: DescriptorKey::Key(key),
                                kind: ChunkKind::Promise,
                                id,
                            });
                        }
                        Value::Sequence(sequence) => {
                            let id = self.defer_sequence(sequence, entry_path, leaves);
                            payload.insert(key.clone(), wire::placeholder());
                            descriptors.push(Descriptor {
                                key: DescriptorKey::Key(key),
                                kind: ChunkKind::Sequence,
                                id,
                            });
                        }
                        other => {
                            payload.insert(key, flatten_plain(other, &entry_path)?);
                        }
                    }
                }
                Ok(Dehydrated {
                    payload: Json::Object(payload),
                    descriptors,
                })
            }
        }
    }

    /// Start one task per collected leaf. Call only after the line whose
    /// descriptors reference these ids has been emitted (or, for the
    /// root, placed at the front of the byte stream).
    pub(crate) fn spawn_leaves(self: &Arc<Self>, leaves: Vec<PendingLeaf>) {
        for leaf in leaves {
            let inner = Arc::clone(self);
            match leaf.work {
                LeafWork::Promise(promise) => {
                    tokio::spawn(inner.run_promise(leaf.id, promise, leaf.path));
                }
                LeafWork::Sequence(sequence) => {
                    tokio::spawn(inner.run_sequence(leaf.id, sequence, leaf.path));
                }
                LeafWork::PromiseDepth(max_depth) => {
                    tokio::spawn(async move {
                        let error = max_depth_error(&leaf.path, max_depth);
                        inner.reject(leaf.id, error, &leaf.path).await;
                    });
                }
                LeafWork::SequenceDepth(max_depth) => {
                    tokio::spawn(async move {
                        let error = max_depth_error(&leaf.path, max_depth);
                        inner.fail_sequence(leaf.id, error, &leaf.path).await;
                    });
                }
            }
        }
    }

    /// Serialize one line, applying the serialize hook. Shared by the head
    /// (in `produce`) and every chunk.
    pub(crate) fn encode(&self, value: Json) -> Bytes {
        let value = match &self.serialize {
            Some(hook) => hook(value),
            None => value,
        };
        Bytes::from(wire::encode_line(&value))
    }

    fn allocate(&self) -> ChunkId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn over_depth(&self, path: &Path) -> Option<usize> {
        self.max_depth.filter(|max| path.depth() > *max)
    }

    fn defer_promise(
        &self,
        promise: Promise,
        path: Path,
        leaves: &mut Vec<PendingLeaf>,
    ) -> ChunkId {
        let id = self.allocate();
        let work = match self.over_depth(&path) {
            // Depth violations inject through the normal rejection path.
            Some(max_depth) => LeafWork::PromiseDepth(max_depth),
            None => LeafWork::Promise(promise),
        };
        leaves.push(PendingLeaf { id, path, work });
        id
    }

    fn defer_sequence(
        &self,
        sequence: Sequence,
        path: Path,
        leaves: &mut Vec<PendingLeaf>,
    ) -> ChunkId {
        let id = self.allocate();
        let work = match self.over_depth(&path) {
            Some(max_depth) => LeafWork::SequenceDepth(max_depth),
            None => LeafWork::Sequence(sequence),
        };
        leaves.push(PendingLeaf { id, path, work });
        id
    }

    async fn run_promise(self: Arc<Self>, id: ChunkId, promise: Promise, path: Path) {
        let mut future = promise.into_future();
        let result = tokio::select! {
            _ = self.chunk_tx.closed() => {
                tracing::debug!(id, "outgoing stream cancelled, abandoning promise");
                return;
            }
            result = &mut future => result,
        };

        match result {
            Ok(value) => {
                let mut leaves = Vec::new();
                match self.dehydrate(value, &path, &mut leaves) {
                    Ok(dehydrated) => {
                        self.emit(RawChunk {
                            id,
                            status: wire::PROMISE_FULFILLED,
                            payload: Some(dehydrated.to_value()),
                        })
                        .await;
                        self.spawn_leaves(leaves);
                    }
                    Err(error) => self.reject(id, anyhow::Error::new(error), &path).await,
                }
            }
            Err(error) => self.reject(id, error, &path).await,
        }
    }

    async fn run_sequence(self: Arc<Self>, id: ChunkId, sequence: Sequence, path: Path) {
        let mut stream = sequence.into_stream();
        loop {
            let item = tokio::select! {
                _ = self.chunk_tx.closed() => {
                    // Dropping the stream runs the user's cleanup.
                    tracing::debug!(id, "outgoing stream cancelled, abandoning sequence");
                    return;
                }
                item = stream.next() => item,
            };

            match item {
                Some(Ok(value)) => {
                    let mut leaves = Vec::new();
                    match self.dehydrate(value, &path, &mut leaves) {
                        Ok(dehydrated) => {
                            self.emit(RawChunk {
                                id,
                                status: wire::SEQUENCE_VALUE,
                                payload: Some(dehydrated.to_value()),
                            })
                            .await;
                            self.spawn_leaves(leaves);
                        }
                        Err(error) => {
                            self.fail_sequence(id, anyhow::Error::new(error), &path).await;
                            return;
                        }
                    }
                }
                Some(Err(error)) => {
                    self.fail_sequence(id, error, &path).await;
                    return;
                }
                None => {
                    self.emit(RawChunk {
                        id,
                        status: wire::SEQUENCE_DONE,
                        payload: None,
                    })
                    .await;
                    return;
                }
            }
        }
    }

    async fn emit(&self, chunk: RawChunk) {
        let line = self.encode(chunk.to_value());
        // A send error means the consumer dropped the byte stream; the
        // chunk is swallowed and the task winds down on its own.
        if self.chunk_tx.send(line).await.is_err() {
            tracing::trace!(id = chunk.id, "chunk dropped, outgoing stream closed");
        }
    }

    /// Terminal rejection for a promise leaf: observe, format, emit.
    async fn reject(&self, id: ChunkId, error: anyhow::Error, path: &Path) {
        self.observe(&error, path);
        let payload = self.format(&error, path);
        self.emit(RawChunk {
            id,
            status: wire::PROMISE_REJECTED,
            payload: Some(payload),
        })
        .await;
    }

    /// Terminal failure for a sequence leaf: observe, format, emit.
    async fn fail_sequence(&self, id: ChunkId, error: anyhow::Error, path: &Path) {
        self.observe(&error, path);
        let payload = self.format(&error, path);
        self.emit(RawChunk {
            id,
            status: wire::SEQUENCE_ERROR,
            payload: Some(payload),
        })
        .await;
    }

    fn observe(&self, error: &anyhow::Error, path: &Path) {
        if let Some(observer) = &self.on_error {
            observer(error, path);
        }
    }

    fn format(&self, error: &anyhow::Error, path: &Path) -> Json {
        match &self.format_error {
            Some(hook) => hook(error, path),
            None => json!({ "message": error.to_string() }),
        }
    }
}

fn max_depth_error(path: &Path, max_depth: usize) -> anyhow::Error {
    anyhow::Error::new(ProduceError::MaxDepth {
        path: path.clone(),
        max_depth,
    })
}

fn deferred_whole(kind: ChunkKind, id: ChunkId) -> Dehydrated {
    Dehydrated {
        payload: wire::placeholder(),
        descriptors: vec![Descriptor {
            key: DescriptorKey::Whole,
            kind,
            id,
        }],
    }
}

/// Collapse a container subtree with no deferred leaves to plain JSON.
fn flatten_plain(value: Value, path: &Path) -> Result<Json, ProduceError> {
    match value {
        Value::Json(v) => Ok(v),
        Value::Array(items) => {
            let mut flattened = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                flattened.push(flatten_plain(item, &path.child_index(index))?);
            }
            Ok(Json::Array(flattened))
        }
        Value::Object(entries) => {
            let mut flattened = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries {
                let flat = flatten_plain(item, &path.child_key(&key))?;
                flattened.insert(key, flat);
            }
            Ok(Json::Object(flattened))
        }
        Value::Promise(_) | Value::Sequence(_) => Err(ProduceError::DeferredTooDeep {
            path: path.clone(),
        }),
    }
}
