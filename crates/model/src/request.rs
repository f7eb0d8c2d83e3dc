use serde_json::Value;

use crate::OpaqueMessage;

/// A request to be sent to the model provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ModelRequest {
    /// The system instructions, if any.
    pub system: Option<String>,
    /// The history messages, oldest first.
    pub messages: Vec<ModelMessage>,
    /// Tools that are available to the model.
    pub tools: Vec<ModelTool>,
}

/// A complete message in the history.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModelMessage {
    /// A user input text.
    User(String),
    /// An assistant text.
    Assistant(String),
    /// A tool call result.
    Tool(ToolCallResult),
    /// A provider-native message, usually a previous model response.
    Opaque(OpaqueMessage),
}

impl ModelMessage {
    /// Returns `true` if the message was produced by the model.
    #[inline]
    pub fn is_from_model(&self) -> bool {
        matches!(self, ModelMessage::Assistant(_) | ModelMessage::Opaque(_))
    }
}

/// The result of calling a tool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ToolCallResult {
    /// The identifier of the tool call request this result answers.
    pub id: String,
    /// The name of the tool that was called.
    pub name: String,
    /// The output, or the error description if `is_error` is set.
    pub content: String,
    /// Whether the call failed.
    pub is_error: bool,
}

/// Describes a tool that can be used by the model.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelTool {
    /// Name of the tool.
    pub name: String,
    /// Description of the tool.
    pub description: String,
    /// Parameters definition of the tool, as a
    /// [JSON schema](https://json-schema.org/).
    pub parameters: Value,
}
