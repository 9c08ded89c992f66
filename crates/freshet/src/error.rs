//! Runtime error types for the two codec endpoints.

use freshet_core::{Path, WireError};
use serde_json::Value as Json;

/// Errors surfaced synchronously by [`produce`](crate::produce).
///
/// User errors (promise rejections, sequence failures) are not here: they
/// never abort the stream, only their own leaf, and travel as
/// REJECTED/ERROR chunks.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    /// A deferred leaf sits below one container level inside a single
    /// dehydration unit; the wire format cannot address it. Express deeper
    /// deferral by nesting promises.
    #[error("deferred value at {path} is nested beyond one container level")]
    DeferredTooDeep { path: Path },

    /// Path length exceeded the configured `max_depth`. Reported through
    /// the affected leaf's rejection, never thrown from `produce` itself.
    #[error("depth of {path} exceeds max_depth {max_depth}")]
    MaxDepth { path: Path, max_depth: usize },
}

/// Errors surfaced by consumer-side handles and the head future.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The byte stream ended or failed before this leaf's terminal chunk.
    #[error("stream interrupted before resolution")]
    Interrupted,

    /// The producer transmitted a rejection or sequence error. Carries the
    /// raw wire payload when no `format_error` hook is configured.
    #[error("remote error: {data}")]
    Remote { data: Json },

    /// Product of the consumer `format_error` hook.
    #[error(transparent)]
    Custom(#[from] anyhow::Error),

    /// The producer violated the chunk protocol for this leaf.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A line failed wire-format decoding.
    #[error(transparent)]
    Wire(#[from] WireError),
}
