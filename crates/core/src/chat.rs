//! Multi-turn chat on top of an [`Agent`] and a [`Checkpointer`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Mutex as AsyncMutex;
use tracing::Instrument;

use crate::agent::Agent;
use crate::checkpoint::{Checkpointer, ThreadId};
use crate::conversation::Turn;
use crate::error::Error;

type ThreadLock = Arc<AsyncMutex<()>>;

/// Runs chat turns against per-thread conversation state.
///
/// Turns on one thread run one after another in arrival order. Turns on
/// different threads run in parallel.
pub struct ChatService {
    agent: Arc<Agent>,
    checkpointer: Arc<dyn Checkpointer>,
    locks: Mutex<HashMap<ThreadId, Weak<AsyncMutex<()>>>>,
}

impl ChatService {
    /// Creates a chat service.
    pub fn new(agent: Arc<Agent>, checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            agent,
            checkpointer,
            locks: Default::default(),
        }
    }

    /// Returns the agent behind this service.
    #[inline]
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Returns a fresh thread id. Nothing is stored until the first turn.
    #[inline]
    pub fn new_thread(&self) -> ThreadId {
        ThreadId::generate()
    }

    /// Sends a user message on a thread and returns the assistant reply.
    ///
    /// The thread is checkpointed only if the turn succeeds. A failed turn
    /// leaves the thread as it was before the call.
    pub async fn send<S: Into<String>>(
        &self,
        thread_id: &ThreadId,
        input: S,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<String, Error> {
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let mut conversation =
            self.checkpointer.load(thread_id).await.unwrap_or_default();
        let span = info_span!("chat turn", thread = %thread_id);
        let reply = self
            .agent
            .run_turn(&mut conversation, input, on_transcript)
            .instrument(span)
            .await;
        match reply {
            Ok(reply) => {
                self.checkpointer.save(thread_id, conversation).await;
                Ok(reply)
            }
            Err(err) => {
                warn!("turn on thread {thread_id} failed: {err}");
                Err(err)
            }
        }
    }

    /// Returns the turns on a thread. Unknown threads have none.
    pub async fn history(&self, thread_id: &ThreadId) -> Vec<Turn> {
        self.checkpointer
            .load(thread_id)
            .await
            .map(|conversation| conversation.turns())
            .unwrap_or_default()
    }

    /// Forgets a thread, waiting for a running turn on it to finish first.
    /// Returns `true` if the thread existed.
    pub async fn reset(&self, thread_id: &ThreadId) -> bool {
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;
        self.checkpointer.delete(thread_id).await
    }

    fn thread_lock(&self, thread_id: &ThreadId) -> ThreadLock {
        // A poisoned map only holds weak handles, so it is safe to reuse.
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = locks.get(thread_id).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = ThreadLock::default();
        locks.insert(thread_id.clone(), Arc::downgrade(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kaiwa_test_model::{PresetResponse, TestModelProvider};

    use super::*;
    use crate::checkpoint::MemoryCheckpointer;
    use crate::conversation::Role;
    use crate::{AgentBuilder, RetryPolicy};

    fn service(model_provider: TestModelProvider) -> ChatService {
        let agent = AgentBuilder::with_model_provider(model_provider)
            .with_retry_policy(RetryPolicy::none())
            .build();
        ChatService::new(Arc::new(agent), Arc::new(MemoryCheckpointer::new()))
    }

    #[tokio::test]
    async fn test_history_persists_across_turns() {
        let mut model_provider = TestModelProvider::default();
        model_provider.add_response(PresetResponse::text("はじめまして。"));
        model_provider.add_response(PresetResponse::text("元気です。"));
        let chat = service(model_provider.clone());

        let thread_id = chat.new_thread();
        assert!(chat.history(&thread_id).await.is_empty());

        let reply = chat.send(&thread_id, "こんにちは", |_| {}).await.unwrap();
        assert_eq!(reply, "はじめまして。");
        let reply = chat.send(&thread_id, "お元気ですか", |_| {}).await.unwrap();
        assert_eq!(reply, "元気です。");

        let history = chat.history(&thread_id).await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::User);
        assert_eq!(history[2].content, "お元気ですか");

        // The second request carried the whole first turn.
        assert_eq!(model_provider.requests()[1].messages.len(), 3);

        // Other threads start from scratch.
        let other = chat.new_thread();
        assert_ne!(other, thread_id);
        assert!(chat.history(&other).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_turn_leaves_thread_unchanged() {
        let mut model_provider = TestModelProvider::default();
        model_provider.add_response(PresetResponse::text("one"));
        let chat = service(model_provider);

        let thread_id = chat.new_thread();
        chat.send(&thread_id, "first", |_| {}).await.unwrap();
        // The script has no second step, so this one fails.
        assert!(chat.send(&thread_id, "second", |_| {}).await.is_err());

        let history = chat.history(&thread_id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "one");
    }

    #[tokio::test]
    async fn test_reset() {
        let mut model_provider = TestModelProvider::default();
        model_provider.add_response(PresetResponse::text("hello"));
        let chat = service(model_provider);

        let thread_id = chat.new_thread();
        assert!(!chat.reset(&thread_id).await);
        chat.send(&thread_id, "hi", |_| {}).await.unwrap();
        assert!(chat.reset(&thread_id).await);
        assert!(chat.history(&thread_id).await.is_empty());

        // After a reset the script starts over.
        let reply = chat.send(&thread_id, "hi again", |_| {}).await.unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_turns_on_one_thread_are_serialized() {
        let mut model_provider = TestModelProvider::default();
        model_provider.add_response(PresetResponse::text("first reply"));
        model_provider.add_response(PresetResponse::text("second reply"));
        model_provider.set_delay(Duration::from_millis(20));
        let chat = Arc::new(service(model_provider));
        let thread_id = chat.new_thread();

        let mut handles = vec![];
        for input in ["a", "b"] {
            let chat = Arc::clone(&chat);
            let thread_id = thread_id.clone();
            handles.push(tokio::spawn(async move {
                chat.send(&thread_id, input, |_| {}).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Had the turns overlapped, both would have seen an empty thread
        // and one snapshot would have overwritten the other.
        let history = chat.history(&thread_id).await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].content, "first reply");
        assert_eq!(history[3].content, "second reply");
    }
}
