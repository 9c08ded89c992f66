//! freshet — a streaming structured-value codec over JSON Lines.
//!
//! A root mapping from string keys to JSON-compatible data may contain
//! *deferred* leaves: single-shot promises and lazy sequences. [`produce`]
//! flattens that tree into one head line plus a multiplex of chunk lines
//! keyed by integer chunk-id, emitted as resolutions occur; [`consume`]
//! parses the stream back and hands out handles that resolve
//! incrementally as bytes arrive.
//!
//! Transport is out of scope: `produce` yields a byte stream and
//! `consume` takes one, and anything that moves newline-terminated UTF-8
//! in order (HTTP body, WebSocket, stdio pipe) works in between.
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use freshet::{consume, produce, ConsumeOptions, ProduceOptions, Promise, Value};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut data = BTreeMap::new();
//! data.insert("answer".to_string(), Value::Promise(Promise::resolved(Value::json(42))));
//! let bytes = produce(ProduceOptions::new(data))?;
//!
//! // ... ship `bytes` across a transport, then on the receiving side:
//! # let transport = futures::stream::empty();
//! let consumed = consume(transport, ConsumeOptions::default());
//! let mut head = consumed.head.await?;
//! let answer = head.remove("answer").unwrap().into_promise().unwrap();
//! let value = answer.resolve().await?;
//! # Ok(())
//! # }
//! ```

pub mod consume;
pub mod error;
pub mod frame;
pub mod hydrate;
pub mod produce;
pub mod sync;

mod dehydrate;
mod demux;

pub use consume::{consume, consume_reader, Consumed, ConsumeOptions, Head, HeadFuture};
pub use error::{ConsumeError, ProduceError};
pub use hydrate::{Hydrated, PromiseHandle, SequenceHandle};
pub use produce::{produce, ByteStream, ProduceOptions};

pub use freshet_core::value::{Path, Promise, Segment, Sequence, Value};
pub use freshet_core::wire;
