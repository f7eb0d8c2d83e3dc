//! Conversation-related types.

use kaiwa_model::{ModelMessage, OpaqueMessage, ToolCallRequest, ToolCallResult};
use serde::{Deserialize, Serialize};

/// Who said a [`Turn`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side.
    User,
    /// The model side.
    Assistant,
}

/// One message of a conversation as a human reads it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Turn {
    /// Who sent it.
    pub role: Role,
    /// The text content.
    pub content: String,
}

/// Where a conversation item came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TranscriptSource {
    /// A user input.
    User,
    /// A model response.
    Assistant,
    /// The result of a tool call.
    Tool,
}

/// Represents a conversation.
///
/// Items are only ever appended, in the order they happened.
#[derive(Clone, Default, Debug)]
pub struct Conversation {
    items: Vec<Item>,
}

impl Conversation {
    /// Creates an empty conversation.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all items, oldest first.
    #[inline]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Returns the number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing has been said yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Projects the conversation to the user inputs and the assistant texts.
    ///
    /// Tool results and assistant messages without text (pure tool call
    /// requests) are left out.
    pub fn turns(&self) -> Vec<Turn> {
        self.items
            .iter()
            .filter_map(|item| {
                let role = match item.source {
                    TranscriptSource::User => Role::User,
                    TranscriptSource::Assistant if !item.transcript.is_empty() => {
                        Role::Assistant
                    }
                    _ => return None,
                };
                Some(Turn {
                    role,
                    content: item.transcript.clone(),
                })
            })
            .collect()
    }

    #[inline]
    pub(crate) fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    pub(crate) fn messages(&self) -> Vec<ModelMessage> {
        self.items.iter().map(|item| item.msg.clone()).collect()
    }
}

/// An item in the conversation.
#[derive(Clone, Debug)]
pub struct Item {
    msg: ModelMessage,
    transcript: String,
    source: TranscriptSource,
    tool_calls: Vec<ToolCallRequest>,
}

impl Item {
    pub(crate) fn user(input: String) -> Self {
        Self {
            msg: ModelMessage::User(input.clone()),
            transcript: input,
            source: TranscriptSource::User,
            tool_calls: vec![],
        }
    }

    pub(crate) fn assistant(
        transcript: String,
        opaque_msg: Option<OpaqueMessage>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        let msg = match opaque_msg {
            Some(opaque_msg) => ModelMessage::Opaque(opaque_msg),
            // Downgrade to a text-only message.
            None => ModelMessage::Assistant(transcript.clone()),
        };
        Self {
            msg,
            transcript,
            source: TranscriptSource::Assistant,
            tool_calls,
        }
    }

    pub(crate) fn tool_result(result: ToolCallResult) -> Self {
        Self {
            transcript: result.content.clone(),
            msg: ModelMessage::Tool(result),
            source: TranscriptSource::Tool,
            tool_calls: vec![],
        }
    }

    /// Returns the transcript of this item.
    ///
    /// The transcript is the human-readable text of the item. It is not
    /// enough to rebuild the model message.
    #[inline]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Returns where this item came from.
    #[inline]
    pub fn source(&self) -> TranscriptSource {
        self.source
    }

    /// Returns the tool calls the model requested in this item.
    #[inline]
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        &self.tool_calls
    }

    /// Returns the tool name, if this item is a tool result.
    #[inline]
    pub fn tool_name(&self) -> Option<&str> {
        match &self.msg {
            ModelMessage::Tool(result) => Some(&result.name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_turns_skip_tool_traffic() {
        let mut conversation = Conversation::new();
        conversation.push(Item::user("東京の天気は？".to_owned()));
        conversation.push(Item::assistant(
            String::new(),
            None,
            vec![ToolCallRequest {
                id: "call_0".to_owned(),
                name: "get_weather".to_owned(),
                arguments: json!({ "city": "東京" }),
            }],
        ));
        conversation.push(Item::tool_result(ToolCallResult {
            id: "call_0".to_owned(),
            name: "get_weather".to_owned(),
            content: "It's always sunny in 東京!".to_owned(),
            is_error: false,
        }));
        conversation.push(Item::assistant("晴れです。".to_owned(), None, vec![]));

        assert_eq!(conversation.len(), 4);
        assert_eq!(conversation.items()[2].tool_name(), Some("get_weather"));
        assert_eq!(conversation.items()[1].tool_calls().len(), 1);
        assert_eq!(
            conversation.turns(),
            vec![
                Turn {
                    role: Role::User,
                    content: "東京の天気は？".to_owned(),
                },
                Turn {
                    role: Role::Assistant,
                    content: "晴れです。".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn test_turn_serialization() {
        let turn = Turn {
            role: Role::Assistant,
            content: "hi".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&turn).unwrap(),
            json!({ "role": "assistant", "content": "hi" })
        );
    }
}
