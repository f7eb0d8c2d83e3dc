use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A provider-private message kept in the conversation history.
///
/// Provider-neutral messages lose information some APIs need when the
/// history is replayed (function call parts, thought signatures, and so
/// on). A provider wraps its own native message in an `OpaqueMessage`;
/// the agent stores it untouched and hands it back on the next request,
/// where only the provider that created it knows how to read it.
///
/// Cloning is cheap. Equality and hashing only look at the id.
#[derive(Clone)]
pub struct OpaqueMessage {
    id: Arc<str>,
    value: Arc<dyn Any + Send + Sync>,
}

impl OpaqueMessage {
    /// Creates a new `OpaqueMessage`.
    ///
    /// The `id` should be unique within a conversation.
    #[inline]
    pub fn new<ID: Into<String>, T: Send + Sync + 'static>(
        id: ID,
        value: T,
    ) -> Self {
        let id: String = id.into();
        Self {
            id: id.into(),
            value: Arc::new(value),
        }
    }

    /// Returns the id of this message.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the native message if it has type `T`.
    #[inline]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl Debug for OpaqueMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueMessage")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PartialEq for OpaqueMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OpaqueMessage {}

impl Hash for OpaqueMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct NativeContent(Vec<String>);

    #[test]
    fn test_downcast() {
        let opaque = OpaqueMessage::new(
            "resp-1",
            NativeContent(vec!["part".to_owned()]),
        );
        assert_eq!(opaque.id(), "resp-1");
        assert_eq!(
            opaque.downcast_ref::<NativeContent>(),
            Some(&NativeContent(vec!["part".to_owned()]))
        );
        assert!(opaque.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_identity_by_id() {
        let first = OpaqueMessage::new("resp-1", NativeContent(vec![]));
        let same_id = OpaqueMessage::new("resp-1", "different payload");
        let other = OpaqueMessage::new("resp-2", NativeContent(vec![]));

        assert_eq!(first, same_id);
        assert_ne!(first, other);

        let set: HashSet<_> = [first.clone(), same_id, other].into();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&first));
    }
}
