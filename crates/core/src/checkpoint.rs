//! Per-thread conversation snapshots.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::conversation::Conversation;

const MAX_THREAD_ID_LEN: usize = 128;

/// Identifies one conversation thread.
///
/// Generated ids are UUID v4 strings. Parsed ids must be 1 to 128
/// characters of ASCII letters, digits, `-` and `_`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadId(String);

impl ThreadId {
    /// Generates a new random thread id.
    #[inline]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The error returned when parsing a malformed [`ThreadId`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("thread id must be 1-128 characters of [A-Za-z0-9_-]")]
pub struct InvalidThreadId;

impl FromStr for ThreadId {
    type Err = InvalidThreadId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_THREAD_ID_LEN
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidThreadId)
        }
    }
}

impl TryFrom<String> for ThreadId {
    type Error = InvalidThreadId;

    #[inline]
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ThreadId> for String {
    #[inline]
    fn from(value: ThreadId) -> Self {
        value.0
    }
}

/// A store of conversation snapshots keyed by thread.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Returns the latest snapshot of a thread, if any.
    async fn load(&self, thread_id: &ThreadId) -> Option<Conversation>;

    /// Replaces the snapshot of a thread.
    async fn save(&self, thread_id: &ThreadId, conversation: Conversation);

    /// Forgets a thread. Returns `true` if it existed.
    async fn delete(&self, thread_id: &ThreadId) -> bool;

    /// Lists the known threads in no particular order.
    async fn threads(&self) -> Vec<ThreadId>;
}

/// A [`Checkpointer`] that keeps everything in memory.
///
/// Snapshots live as long as the value does.
#[derive(Default)]
pub struct MemoryCheckpointer {
    snapshots: RwLock<HashMap<ThreadId, Conversation>>,
}

impl MemoryCheckpointer {
    /// Creates an empty store.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn load(&self, thread_id: &ThreadId) -> Option<Conversation> {
        self.snapshots.read().await.get(thread_id).cloned()
    }

    async fn save(&self, thread_id: &ThreadId, conversation: Conversation) {
        trace!("saving {} items for thread {thread_id}", conversation.len());
        self.snapshots
            .write()
            .await
            .insert(thread_id.clone(), conversation);
    }

    async fn delete(&self, thread_id: &ThreadId) -> bool {
        self.snapshots.write().await.remove(thread_id).is_some()
    }

    async fn threads(&self) -> Vec<ThreadId> {
        self.snapshots.read().await.keys().cloned().collect()
    }
}
