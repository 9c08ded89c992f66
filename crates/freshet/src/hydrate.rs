//! Rehydration — reverses dehydration on the consumer: for each chunk
//! descriptor, materializes a future or lazy sequence bound to the per-id
//! sub-stream the demuxer feeds.
//!
//! Rehydration itself is synchronous; the handles it returns do the
//! waiting. A handle unregisters its id once it observes a terminal, so
//! sub-stream controllers never outlive the leaf they serve (interruption
//! aside, which releases everything at once).

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value as Json;

use freshet_core::wire::{self, ChunkId, ChunkKind, Dehydrated, DescriptorKey, RawChunk};

use crate::demux::{Demux, SubEvent};
use crate::error::ConsumeError;
use crate::sync::ControlledStream;

/// Consumer-side mapping of a wire error payload to a caller error.
pub type FormatRemoteHook = Box<dyn Fn(&Json) -> anyhow::Error + Send + Sync>;

/// Shared context every handle carries: the demuxer plus the consumer's
/// error formatting hook.
#[derive(Clone)]
pub(crate) struct HydrateCtx {
    pub(crate) demux: Demux,
    pub(crate) format_remote: Option<Arc<dyn Fn(&Json) -> anyhow::Error + Send + Sync>>,
}

impl HydrateCtx {
    pub(crate) fn new(demux: Demux, format_remote: Option<FormatRemoteHook>) -> Self {
        HydrateCtx {
            demux,
            format_remote: format_remote.map(Arc::from),
        }
    }

    /// Wrap a transmitted rejection/error payload for the caller.
    fn remote_error(&self, payload: Option<Json>) -> ConsumeError {
        match payload {
            Some(data) => match &self.format_remote {
                Some(hook) => ConsumeError::Custom(hook(&data)),
                None => ConsumeError::Remote { data },
            },
            None => ConsumeError::Protocol("error chunk without payload".into()),
        }
    }
}

/// A reconstructed value: plain JSON where the producer sent plain data,
/// handles where it deferred.
pub enum Hydrated {
    Json(Json),
    Array(Vec<Hydrated>),
    Object(BTreeMap<String, Hydrated>),
    Promise(PromiseHandle),
    Sequence(SequenceHandle),
}

impl Hydrated {
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Hydrated::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<BTreeMap<String, Hydrated>> {
        match self {
            Hydrated::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Hydrated>> {
        match self {
            Hydrated::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_promise(self) -> Option<PromiseHandle> {
        match self {
            Hydrated::Promise(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_sequence(self) -> Option<SequenceHandle> {
        match self {
            Hydrated::Sequence(handle) => Some(handle),
            _ => None,
        }
    }
}

impl fmt::Debug for Hydrated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hydrated::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Hydrated::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Hydrated::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Hydrated::Promise(h) => write!(f, "Promise(id={})", h.id),
            Hydrated::Sequence(h) => write!(f, "Sequence(id={})", h.id),
        }
    }
}

/// Materialize the wrappers a dehydrated value describes.
pub(crate) fn hydrate(dehydrated: Dehydrated, ctx: &HydrateCtx) -> Result<Hydrated, ConsumeError> {
    let Dehydrated {
        payload,
        descriptors,
    } = dehydrated;

    if descriptors.is_empty() {
        return Ok(Hydrated::Json(payload));
    }

    // Whole-payload replacement: the placeholder IS the value.
    if descriptors.len() == 1 && descriptors[0].key == DescriptorKey::Whole {
        let descriptor = &descriptors[0];
        return Ok(wrap(descriptor.kind, descriptor.id, ctx));
    }

    match payload {
        Json::Array(items) => {
            let mut out: Vec<Hydrated> = items.into_iter().map(Hydrated::Json).collect();
            for descriptor in descriptors {
                let index = match descriptor.key {
                    DescriptorKey::Index(i) => i as usize,
                    ref key => {
                        return Err(ConsumeError::Protocol(format!(
                            "descriptor key {key:?} does not address an array payload"
                        )))
                    }
                };
                let slot = out.get_mut(index).ok_or_else(|| {
                    ConsumeError::Protocol(format!("descriptor index {index} out of bounds"))
                })?;
                *slot = wrap(descriptor.kind, descriptor.id, ctx);
            }
            Ok(Hydrated::Array(out))
        }
        Json::Object(entries) => {
            let mut out: BTreeMap<String, Hydrated> = entries
                .into_iter()
                .map(|(key, value)| (key, Hydrated::Json(value)))
                .collect();
            for descriptor in descriptors {
                let key = match descriptor.key {
                    DescriptorKey::Key(k) => k,
                    ref key => {
                        return Err(ConsumeError::Protocol(format!(
                            "descriptor key {key:?} does not address an object payload"
                        )))
                    }
                };
                let slot = out.get_mut(&key).ok_or_else(|| {
                    ConsumeError::Protocol(format!("descriptor key {key:?} missing from payload"))
                })?;
                *slot = wrap(descriptor.kind, descriptor.id, ctx);
            }
            Ok(Hydrated::Object(out))
        }
        other => Err(ConsumeError::Protocol(format!(
            "descriptors address a non-container payload: {other}"
        ))),
    }
}

fn wrap(kind: ChunkKind, id: ChunkId, ctx: &HydrateCtx) -> Hydrated {
    let stream = ctx.demux.register(id);
    match kind {
        ChunkKind::Promise => Hydrated::Promise(PromiseHandle {
            id,
            stream,
            ctx: ctx.clone(),
        }),
        ChunkKind::Sequence => Hydrated::Sequence(SequenceHandle {
            id,
            stream,
            ctx: ctx.clone(),
            finished: false,
        }),
    }
}

// ── Promise wrapper ───────────────────────────────────────────────────────────

/// Consumer-side future backed by a single read of its sub-stream.
pub struct PromiseHandle {
    id: ChunkId,
    stream: ControlledStream<SubEvent>,
    ctx: HydrateCtx,
}

impl PromiseHandle {
    /// Await the transmitted resolution.
    ///
    /// Fulfillment payloads are themselves dehydrated values, so the
    /// resolved value may again contain handles.
    pub async fn resolve(mut self) -> Result<Hydrated, ConsumeError> {
        let event = self.stream.next().await;
        self.ctx.demux.unregister(self.id);

        match event {
            Some(SubEvent::Chunk(chunk)) => self.interpret(chunk),
            Some(SubEvent::Interrupted) => Err(ConsumeError::Interrupted),
            None => Err(ConsumeError::Protocol(
                "sub-stream closed before the promise chunk".into(),
            )),
        }
    }

    fn interpret(&self, chunk: RawChunk) -> Result<Hydrated, ConsumeError> {
        match chunk.status {
            wire::PROMISE_FULFILLED => {
                let payload = chunk.payload.ok_or_else(|| {
                    ConsumeError::Protocol("fulfilled chunk without payload".into())
                })?;
                let dehydrated = Dehydrated::from_value(&payload)?;
                hydrate(dehydrated, &self.ctx)
            }
            wire::PROMISE_REJECTED => Err(self.ctx.remote_error(chunk.payload)),
            other => Err(ConsumeError::Protocol(format!(
                "unexpected promise status {other}"
            ))),
        }
    }
}

// ── Sequence wrapper ──────────────────────────────────────────────────────────

/// Consumer-side lazy sequence backed by its sub-stream.
pub struct SequenceHandle {
    id: ChunkId,
    stream: ControlledStream<SubEvent>,
    ctx: HydrateCtx,
    finished: bool,
}

impl Stream for SequenceHandle {
    type Item = Result<Hydrated, ConsumeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let event = match this.stream.poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(event) => event,
        };

        match event {
            Some(SubEvent::Chunk(chunk)) => match chunk.status {
                wire::SEQUENCE_VALUE => {
                    let item = match chunk.payload {
                        Some(payload) => Dehydrated::from_value(&payload)
                            .map_err(ConsumeError::from)
                            .and_then(|dehydrated| hydrate(dehydrated, &this.ctx)),
                        None => Err(ConsumeError::Protocol(
                            "sequence value chunk without payload".into(),
                        )),
                    };
                    if item.is_err() {
                        this.finish();
                    }
                    Poll::Ready(Some(item))
                }
                wire::SEQUENCE_DONE => {
                    this.finish();
                    Poll::Ready(None)
                }
                wire::SEQUENCE_ERROR => {
                    this.finish();
                    Poll::Ready(Some(Err(this.ctx.remote_error(chunk.payload))))
                }
                other => {
                    this.finish();
                    Poll::Ready(Some(Err(ConsumeError::Protocol(format!(
                        "unexpected sequence status {other}"
                    )))))
                }
            },
            Some(SubEvent::Interrupted) => {
                this.finish();
                Poll::Ready(Some(Err(ConsumeError::Interrupted)))
            }
            None => {
                this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

impl SequenceHandle {
    fn finish(&mut self) {
        self.finished = true;
        self.ctx.demux.unregister(self.id);
    }
}
