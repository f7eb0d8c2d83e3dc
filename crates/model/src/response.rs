use std::pin::Pin;
use std::task::{self, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::OpaqueMessage;
use crate::provider::ModelProviderError;

/// A streamed response from the model provider.
pub trait ModelResponse: Sized + Send + 'static {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// Attempts to pull out the next event from the response.
    ///
    /// # Return value
    ///
    /// - `Poll::Pending` means that the next event is not ready yet, and
    ///   the current task will be woken when it may be.
    /// - `Poll::Ready(Ok(Some(event)))` delivers an event. More may
    ///   follow.
    /// - `Poll::Ready(Ok(None))` means the response has completed.
    /// - `Poll::Ready(Err(error))` means the response failed.
    ///
    /// Calling this method after completion should always return `None`.
    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>>;

    /// Makes an [`OpaqueMessage`] that represents the message in this
    /// response.
    ///
    /// Only meaningful after all events have been polled; implementations
    /// should return the same message every time for one response.
    fn make_opaque_message(&self) -> Option<OpaqueMessage> {
        None
    }
}

/// The reason why a model response has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFinishReason {
    /// The model needs to call tools.
    ToolCalls,
    /// The model has finished generating text.
    Stop,
    /// The output token limit was reached.
    Length,
}

/// Describes a tool call request from the model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// The unique identifier for the tool call request.
    pub id: String,
    /// The name of the tool to call.
    pub name: String,
    /// The arguments object to pass to the tool.
    pub arguments: Value,
}

/// Token accounting reported by the provider.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens generated by the model.
    pub output_tokens: u64,
}

/// The event from a model response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelResponseEvent {
    /// The response has been completed.
    Completed(ModelFinishReason),
    /// Received a message delta.
    MessageDelta(String),
    /// Received a tool call request.
    ToolCall(ToolCallRequest),
    /// Received token usage for this response.
    Usage(TokenUsage),
}
