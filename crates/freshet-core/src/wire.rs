//! freshet wire format — on-wire shapes for the JSON Lines stream.
//!
//! These shapes ARE the protocol. A stream is UTF-8, line-delimited JSON:
//! the first line is the head (a mapping from top-level key to dehydrated
//! value), every following line is a chunk (an array tagged by chunk-id).
//! Changing any encoding here is a breaking change.
//!
//! A dehydrated value is `[[<payload>], [<key>,<kind>,<id>]*]`: the payload
//! wrapped in a one-element array, then zero or more descriptor triples.
//! The literal `0` inside a payload is a placeholder only at a position
//! named by a descriptor key; payload integers are never interpreted
//! outside that frame.

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};

/// Integer handle naming one deferred leaf's lifetime on the wire.
/// Allocated by the producer, strictly increasing from 0, never reused.
pub type ChunkId = u64;

/// The placeholder occupying a deferred leaf's position in a payload.
pub fn placeholder() -> Json {
    json!(0)
}

// ── Status codes ──────────────────────────────────────────────────────────────

/// Promise chunk status: terminal fulfillment, payload is a dehydrated value.
pub const PROMISE_FULFILLED: u8 = 0;
/// Promise chunk status: terminal rejection, payload is an error payload.
pub const PROMISE_REJECTED: u8 = 1;

/// Sequence chunk status: terminal completion, no payload.
pub const SEQUENCE_DONE: u8 = 0;
/// Sequence chunk status: one item, payload is a dehydrated value.
pub const SEQUENCE_VALUE: u8 = 1;
/// Sequence chunk status: terminal failure, payload is an error payload.
pub const SEQUENCE_ERROR: u8 = 2;

/// Which wrapper a chunk-id rehydrates into. The sole tag distinguishing
/// futures from sequences; the consumer never inspects structure to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Promise,
    Sequence,
}

impl ChunkKind {
    pub fn to_wire(self) -> u64 {
        match self {
            ChunkKind::Promise => 0,
            ChunkKind::Sequence => 1,
        }
    }

    pub fn from_wire(raw: u64) -> Result<Self, WireError> {
        match raw {
            0 => Ok(ChunkKind::Promise),
            1 => Ok(ChunkKind::Sequence),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Descriptors ───────────────────────────────────────────────────────────────

/// Where a wrapper lands when a dehydrated value is rehydrated.
///
/// `Whole` (`null` on the wire) replaces the entire payload; `Index` and
/// `Key` address one entry of a container payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorKey {
    Whole,
    Index(u64),
    Key(String),
}

/// One deferred leaf of a dehydrated value: `[<key>, <kind>, <chunk-id>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub key: DescriptorKey,
    pub kind: ChunkKind,
    pub id: ChunkId,
}

// ── Dehydrated values ─────────────────────────────────────────────────────────

/// A payload with its deferred leaves substituted by placeholders, plus the
/// descriptors naming them. Payload and descriptors together completely
/// determine reconstruction; there are no cross-chunk references beyond the
/// chunk-id itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Dehydrated {
    pub payload: Json,
    pub descriptors: Vec<Descriptor>,
}

impl Dehydrated {
    /// A value with no deferred leaves.
    pub fn plain(payload: Json) -> Self {
        Dehydrated {
            payload,
            descriptors: Vec::new(),
        }
    }

    /// Encode as `[[<payload>], [<key>,<kind>,<id>]*]`.
    pub fn to_value(&self) -> Json {
        let mut parts = Vec::with_capacity(1 + self.descriptors.len());
        parts.push(json!([self.payload]));
        for descriptor in &self.descriptors {
            let key = match &descriptor.key {
                DescriptorKey::Whole => Json::Null,
                DescriptorKey::Index(i) => json!(i),
                DescriptorKey::Key(k) => json!(k),
            };
            parts.push(json!([key, descriptor.kind.to_wire(), descriptor.id]));
        }
        Json::Array(parts)
    }

    pub fn from_value(value: &Json) -> Result<Self, WireError> {
        let parts = value.as_array().ok_or(WireError::MalformedDehydrated)?;
        let payload_cell = parts
            .first()
            .and_then(Json::as_array)
            .ok_or(WireError::MalformedDehydrated)?;
        if payload_cell.len() != 1 {
            return Err(WireError::MalformedDehydrated);
        }
        let payload = payload_cell[0].clone();

        let mut descriptors = Vec::with_capacity(parts.len() - 1);
        for part in &parts[1..] {
            descriptors.push(decode_descriptor(part)?);
        }
        Ok(Dehydrated {
            payload,
            descriptors,
        })
    }
}

fn decode_descriptor(value: &Json) -> Result<Descriptor, WireError> {
    let triple = value.as_array().ok_or(WireError::MalformedDescriptor)?;
    if triple.len() != 3 {
        return Err(WireError::MalformedDescriptor);
    }
    let key = match &triple[0] {
        Json::Null => DescriptorKey::Whole,
        Json::Number(n) => DescriptorKey::Index(n.as_u64().ok_or(WireError::MalformedDescriptor)?),
        Json::String(s) => DescriptorKey::Key(s.clone()),
        _ => return Err(WireError::MalformedDescriptor),
    };
    let kind = triple[1]
        .as_u64()
        .ok_or(WireError::MalformedDescriptor)
        .and_then(ChunkKind::from_wire)?;
    let id = triple[2].as_u64().ok_or(WireError::MalformedDescriptor)?;
    Ok(Descriptor { key, kind, id })
}

// ── Chunks ────────────────────────────────────────────────────────────────────

/// One wire line after the head: `[<id>, <status>]` or
/// `[<id>, <status>, <payload>]`.
///
/// Status meaning depends on the kind registered for the id, so a chunk is
/// decoded shape-only here and interpreted by the wrapper that owns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub id: ChunkId,
    pub status: u8,
    pub payload: Option<Json>,
}

impl RawChunk {
    pub fn to_value(&self) -> Json {
        match &self.payload {
            Some(payload) => json!([self.id, self.status, payload]),
            None => json!([self.id, self.status]),
        }
    }

    pub fn from_value(value: &Json) -> Result<Self, WireError> {
        let parts = value.as_array().ok_or(WireError::MalformedChunk)?;
        if parts.len() < 2 || parts.len() > 3 {
            return Err(WireError::MalformedChunk);
        }
        let id = parts[0].as_u64().ok_or(WireError::MalformedChunk)?;
        let status = parts[1]
            .as_u64()
            .and_then(|s| u8::try_from(s).ok())
            .ok_or(WireError::MalformedChunk)?;
        let payload = parts.get(2).cloned();
        Ok(RawChunk {
            id,
            status,
            payload,
        })
    }
}

// ── Head ──────────────────────────────────────────────────────────────────────

/// Encode the head mapping: `{"<key>": <dehydrated>, …}`. Transmitted
/// exactly once per stream, before any chunk.
pub fn encode_head(head: &BTreeMap<String, Dehydrated>) -> Json {
    let map = head
        .iter()
        .map(|(key, value)| (key.clone(), value.to_value()))
        .collect::<serde_json::Map<String, Json>>();
    Json::Object(map)
}

pub fn decode_head(value: &Json) -> Result<BTreeMap<String, Dehydrated>, WireError> {
    let object = value.as_object().ok_or(WireError::MalformedHead)?;
    let mut head = BTreeMap::new();
    for (key, entry) in object {
        head.insert(key.clone(), Dehydrated::from_value(entry)?);
    }
    Ok(head)
}

// ── Lines ─────────────────────────────────────────────────────────────────────

/// Serialize one line: compact JSON plus the terminating newline.
pub fn encode_line(value: &Json) -> String {
    let mut line = value.to_string();
    line.push('\n');
    line
}

/// Parse one framed line (terminator already stripped).
pub fn decode_line(line: &str) -> Result<Json, WireError> {
    serde_json::from_str(line).map_err(|e| WireError::Json(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("line is not valid JSON: {0}")]
    Json(String),

    #[error("head line is not a JSON object")]
    MalformedHead,

    #[error("dehydrated value does not match [[payload], descriptors*]")]
    MalformedDehydrated,

    #[error("descriptor does not match [key, kind, id]")]
    MalformedDescriptor,

    #[error("unknown chunk kind: {0}")]
    UnknownKind(u64),

    #[error("chunk line does not match [id, status, payload?]")]
    MalformedChunk,

    #[error("line is not valid UTF-8")]
    Utf8,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
