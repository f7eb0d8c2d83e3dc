use kaiwa_model::{TokenUsage, ToolCallRequest};
use serde::{Deserialize, Serialize};

/// The events in a preset response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresetEvent {
    #[serde(rename = "message_delta")]
    MessageDelta(String),
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallRequest),
    #[serde(rename = "usage")]
    Usage(TokenUsage),
}

/// The preset response for one assistant step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresetResponse {
    /// Events in this response.
    pub events: Vec<PresetEvent>,
    /// If set, the request will fail in the first `failures` attempts.
    /// `Some(0)` means the request will fail forever.
    pub failures: Option<u64>,
}

impl PresetResponse {
    /// Creates a `PresetResponse` with the specified events.
    #[inline]
    pub fn with_events(events: impl Into<Vec<PresetEvent>>) -> Self {
        Self {
            events: events.into(),
            failures: None,
        }
    }

    /// Creates a text-only response, streamed as a single delta.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::with_events([PresetEvent::MessageDelta(text.into())])
    }

    /// Sets failure times before a successful response. `0` means the
    /// response will always be a failure.
    #[inline]
    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = Some(failures);
        self
    }

    pub(crate) fn should_fail(&self, attempt: u64) -> bool {
        match self.failures {
            None => false,
            Some(0) => true,
            Some(failures) => attempt < failures,
        }
    }
}
