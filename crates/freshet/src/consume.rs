//! Consumer entry point — parses the incoming byte stream and rehydrates
//! the head plus every deferred leaf.
//!
//! A spawned driver task frames lines, treats the first as the head, and
//! routes every later line through the demuxer. Clean end-of-stream and
//! transport errors both run the interruption protocol: whatever has not
//! resolved by then never will.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value as Json;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use freshet_core::wire::{self, RawChunk};

use crate::demux::Demux;
use crate::error::ConsumeError;
use crate::frame::{reader_stream, LineFramer};
use crate::hydrate::{hydrate, FormatRemoteHook, Hydrated, HydrateCtx};

/// Unary transform applied to every parsed line before interpretation.
/// The inverse of the producer's serialize hook.
pub type DeserializeHook = Box<dyn Fn(Json) -> Json + Send + Sync>;

/// Observer for stream-fatal consumer errors (malformed lines, transport
/// failures). Leaf-scoped errors surface through the affected handle
/// instead.
pub type ErrorObserver = Box<dyn Fn(&ConsumeError) + Send + Sync>;

/// Options for [`consume`].
#[derive(Default)]
pub struct ConsumeOptions {
    pub deserialize: Option<DeserializeHook>,
    pub on_error: Option<ErrorObserver>,
    /// Maps transmitted error payloads to caller errors. Without it,
    /// rejections surface as [`ConsumeError::Remote`] carrying the raw
    /// payload.
    pub format_error: Option<FormatRemoteHook>,
}

/// The reconstructed root mapping.
pub type Head = BTreeMap<String, Hydrated>;

/// Consume a byte-chunk source (event-emitter-style transports).
///
/// Returns immediately; the driver task runs until the source ends. Await
/// [`Consumed::head`] for the reconstructed root, then resolve its
/// deferred leaves as needed.
pub fn consume<S>(source: S, options: ConsumeOptions) -> Consumed
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let demux = Demux::new();
    let ctx = HydrateCtx::new(demux.clone(), options.format_error);
    let (head_tx, head_rx) = oneshot::channel();

    let driver = tokio::spawn(drive(
        source,
        ctx,
        head_tx,
        options.deserialize,
        options.on_error,
    ));

    Consumed {
        head: HeadFuture { rx: head_rx },
        demux,
        driver,
    }
}

/// Consume a reader-style source.
pub fn consume_reader<R>(reader: R, options: ConsumeOptions) -> Consumed
where
    R: AsyncRead + Send + Unpin + 'static,
{
    consume(reader_stream(reader), options)
}

/// Handle to an in-flight consume: the head future plus local control.
pub struct Consumed {
    pub head: HeadFuture,
    demux: Demux,
    driver: JoinHandle<()>,
}

impl Consumed {
    /// Locally abort: stop the driver and interrupt every unresolved
    /// handle. The remote producer is not informed; dropping the
    /// transport does that.
    pub fn abort(&self) {
        self.demux.interrupt();
        self.driver.abort();
    }
}

/// Resolves once the head line has been parsed and rehydrated; rejects
/// with [`ConsumeError::Interrupted`] when the stream ends first.
pub struct HeadFuture {
    rx: oneshot::Receiver<Result<Head, ConsumeError>>,
}

impl Future for HeadFuture {
    type Output = Result<Head, ConsumeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Driver dropped the sender without a verdict.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ConsumeError::Interrupted)),
        }
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

async fn drive<S>(
    source: S,
    ctx: HydrateCtx,
    head_tx: oneshot::Sender<Result<Head, ConsumeError>>,
    deserialize: Option<DeserializeHook>,
    on_error: Option<ErrorObserver>,
) where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let mut source = Box::pin(source);
    let mut framer = LineFramer::new();
    let mut head_tx = Some(head_tx);

    let outcome: Result<(), ConsumeError> = loop {
        let chunk = match source.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break Err(ConsumeError::Protocol(format!("transport error: {e}"))),
            None => break Ok(()),
        };

        let lines = match framer.push(&chunk) {
            Ok(lines) => lines,
            Err(e) => break Err(e.into()),
        };
        let mut failed = None;
        for line in lines {
            if let Err(e) = process_line(&line, &ctx, &mut head_tx, &deserialize).await {
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            break Err(e);
        }
    };

    match &outcome {
        Ok(()) => {
            if framer.residual_len() > 0 {
                tracing::debug!(
                    residual = framer.residual_len(),
                    "byte stream ended mid-line, residual discarded"
                );
            } else {
                tracing::trace!("byte stream ended");
            }
        }
        Err(error) => {
            tracing::debug!(%error, "consume driver stopping on error");
            if let Some(observer) = &on_error {
                observer(error);
            }
        }
    }

    // Interruption protocol: anything unresolved never will be.
    ctx.demux.interrupt();
    if let Some(tx) = head_tx.take() {
        let _ = tx.send(Err(outcome.err().unwrap_or(ConsumeError::Interrupted)));
    }
}

async fn process_line(
    line: &str,
    ctx: &HydrateCtx,
    head_tx: &mut Option<oneshot::Sender<Result<Head, ConsumeError>>>,
    deserialize: &Option<DeserializeHook>,
) -> Result<(), ConsumeError> {
    let mut value = wire::decode_line(line)?;
    if let Some(hook) = deserialize {
        value = hook(value);
    }

    // First line is the head; everything after is a chunk. On a bad head
    // the sender stays put so the driver's epilogue delivers the error.
    if head_tx.is_some() {
        let head = rehydrate_head(&value, ctx)?;
        // The caller may have dropped the head future; the stream is
        // still driven for whoever holds handles.
        let tx = head_tx.take().expect("head sender vanished");
        let _ = tx.send(Ok(head));
        return Ok(());
    }

    let chunk = RawChunk::from_value(&value)?;
    ctx.demux.route(chunk).await;
    Ok(())
}

fn rehydrate_head(value: &Json, ctx: &HydrateCtx) -> Result<Head, ConsumeError> {
    let entries = wire::decode_head(value)?;
    let mut head = BTreeMap::new();
    for (key, dehydrated) in entries {
        head.insert(key, hydrate(dehydrated, ctx)?);
    }
    tracing::debug!(entries = head.len(), "head rehydrated");
    Ok(head)
}
