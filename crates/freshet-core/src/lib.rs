//! freshet-core — shared types and wire model for the freshet codec.
//! The runtime crate (`freshet`) depends on this one.

pub mod value;
pub mod wire;

pub use value::{Path, Promise, Segment, Sequence, Value};
pub use wire::{ChunkId, ChunkKind, Dehydrated, Descriptor, DescriptorKey, RawChunk, WireError};
