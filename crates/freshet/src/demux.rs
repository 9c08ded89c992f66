//! Multiplex demuxer — routes incoming chunks by chunk-id to the per-id
//! sub-stream a wrapper future or sequence is reading.
//!
//! Both maps live under one lock: the route path (driver task) and the
//! register path (wrapper handles on other tasks) race on the same id, and
//! install-then-resolve must be atomic with the lookup that misses. The
//! lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use freshet_core::wire::{ChunkId, RawChunk};

use crate::sync::{controlled, ControlledStream, Controller, Deferred};

/// One event on a per-chunk-id sub-stream.
#[derive(Debug)]
pub(crate) enum SubEvent {
    Chunk(RawChunk),
    /// The byte stream ended or failed before this id's terminal chunk.
    Interrupted,
}

#[derive(Clone)]
pub(crate) struct Demux {
    state: Arc<Mutex<DemuxState>>,
}

struct DemuxState {
    /// Live sub-streams, created when an id is first referenced during
    /// rehydration, removed when the wrapper observes a terminal.
    controllers: HashMap<ChunkId, Controller<SubEvent>>,
    /// Chunk arrivals waiting for the consumer to reference their id.
    pending: HashMap<ChunkId, Arc<Deferred<()>>>,
    interrupted: bool,
}

impl Demux {
    pub(crate) fn new() -> Self {
        Demux {
            state: Arc::new(Mutex::new(DemuxState {
                controllers: HashMap::new(),
                pending: HashMap::new(),
                interrupted: false,
            })),
        }
    }

    /// Deliver a chunk to its sub-stream.
    ///
    /// When the id is not yet registered this suspends until it is. The
    /// await sits inside the driver's write path on purpose: it serializes
    /// the writer until the reader has caught up, so unrouted chunks are
    /// never buffered unboundedly.
    pub(crate) async fn route(&self, chunk: RawChunk) {
        let id = chunk.id;
        let mut chunk = Some(chunk);
        loop {
            let waiter = {
                let mut state = self.state.lock().expect("demux lock poisoned");
                if state.interrupted {
                    return;
                }
                if let Some(controller) = state.controllers.get(&id) {
                    let delivered =
                        controller.enqueue(SubEvent::Chunk(chunk.take().expect("chunk re-routed")));
                    if !delivered {
                        // Wrapper released its sub-stream without draining;
                        // remaining chunks for the id are dropped.
                        tracing::trace!(id, "chunk dropped, sub-stream released");
                    }
                    return;
                }
                Arc::clone(
                    state
                        .pending
                        .entry(id)
                        .or_insert_with(|| Arc::new(Deferred::new())),
                )
            };

            tracing::trace!(id, "chunk before registration, waiting for reader");
            if waiter.wait().await.is_err() {
                // Rejected by interruption.
                return;
            }
        }
    }

    /// Create the sub-stream for an id the consumer just referenced.
    ///
    /// After interruption a fresh registration immediately observes the
    /// sentinel and then end-of-stream.
    pub(crate) fn register(&self, id: ChunkId) -> ControlledStream<SubEvent> {
        let (stream, controller) = controlled();
        let mut state = self.state.lock().expect("demux lock poisoned");

        if state.interrupted {
            controller.enqueue(SubEvent::Interrupted);
            return stream;
        }

        if state.controllers.insert(id, controller).is_some() {
            tracing::warn!(id, "sub-stream registered twice, replacing");
        }
        if let Some(pending) = state.pending.remove(&id) {
            pending.resolve(());
        }
        stream
    }

    /// Release an id whose wrapper observed a terminal chunk.
    pub(crate) fn unregister(&self, id: ChunkId) {
        self.state
            .lock()
            .expect("demux lock poisoned")
            .controllers
            .remove(&id);
    }

    /// Global interruption: reject waiting routes, notify every live
    /// sub-stream, then close them. Idempotent.
    pub(crate) fn interrupt(&self) {
        let mut state = self.state.lock().expect("demux lock poisoned");
        if state.interrupted {
            return;
        }
        state.interrupted = true;

        for (_, pending) in state.pending.drain() {
            pending.reject();
        }
        let controllers: Vec<_> = state.controllers.drain().collect();
        drop(state);

        let live = controllers.len();
        for (_, controller) in controllers {
            controller.enqueue(SubEvent::Interrupted);
        }
        if live > 0 {
            tracing::debug!(live, "demux interrupted with live sub-streams");
        }
    }
}
