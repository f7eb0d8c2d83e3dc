//! Byte stream and server-sent event plumbing.

mod chunks;
mod sse;

pub use chunks::{ChunkError, Chunks};
pub use sse::{Error as SseError, Sse};
