use kaiwa_model::{ModelMessage, ModelRequest, ModelTool, ToolCallResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::GeminiConfig;

pub const ROLE_USER: &str = "user";
pub const ROLE_MODEL: &str = "model";

// --------------------------
// Types shared in both ways
// --------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// A text part without any attachment, safe to merge with neighbours.
    #[inline]
    pub fn is_plain_text(&self) -> bool {
        self.text.is_some()
            && self.thought.is_none()
            && self.thought_signature.is_none()
            && self.function_call.is_none()
            && self.function_response.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

// ------------------------------
// Types received from the server
// ------------------------------

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentChunk {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub prompt_feedback: Option<PromptFeedback>,
    pub usage_metadata: Option<UsageMetadata>,
    pub response_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    pub block_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub status: Option<String>,
}

// ------------------------
// Types sent to the server
// ------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    generation_config: GenerationConfig,
}

// -----------
// Conversions
// -----------

pub fn create_request(
    req: &ModelRequest,
    config: &GeminiConfig,
) -> GenerateContentRequest {
    let declarations: Vec<_> =
        req.tools.iter().map(create_declaration).collect();
    GenerateContentRequest {
        contents: create_contents(&req.messages),
        system_instruction: req.system.as_ref().map(|system| Content {
            role: None,
            parts: vec![Part::text(system.clone())],
        }),
        tools: if declarations.is_empty() {
            vec![]
        } else {
            vec![Tool {
                function_declarations: declarations,
            }]
        },
        generation_config: GenerationConfig {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        },
    }
}

fn create_contents(messages: &[ModelMessage]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::with_capacity(messages.len());
    // Whether the last content holds function responses only. The API wants
    // all responses to one model turn inside a single content.
    let mut last_is_tool_results = false;

    for msg in messages {
        match msg {
            ModelMessage::User(text) => {
                contents.push(Content {
                    role: Some(ROLE_USER.to_owned()),
                    parts: vec![Part::text(text.clone())],
                });
                last_is_tool_results = false;
            }
            ModelMessage::Assistant(text) => {
                contents.push(Content {
                    role: Some(ROLE_MODEL.to_owned()),
                    parts: vec![Part::text(text.clone())],
                });
                last_is_tool_results = false;
            }
            ModelMessage::Tool(result) => {
                let part = create_function_response(result);
                match contents.last_mut() {
                    Some(last) if last_is_tool_results => last.parts.push(part),
                    _ => contents.push(Content {
                        role: Some(ROLE_USER.to_owned()),
                        parts: vec![part],
                    }),
                }
                last_is_tool_results = true;
            }
            ModelMessage::Opaque(opaque) => {
                // Opaque messages from this provider always hold a
                // `Content`. Anything else came from another provider and
                // has no meaning here.
                let Some(content) = opaque.downcast_ref::<Content>() else {
                    warn!("skipping foreign opaque message {}", opaque.id());
                    continue;
                };
                if content.parts.is_empty() {
                    continue;
                }
                contents.push(content.clone());
                last_is_tool_results = false;
            }
        }
    }
    contents
}

fn create_function_response(result: &ToolCallResult) -> Part {
    let key = if result.is_error { "error" } else { "output" };
    let mut response = Map::new();
    response.insert(key.to_owned(), Value::String(result.content.clone()));
    Part {
        function_response: Some(FunctionResponse {
            id: Some(result.id.clone()),
            name: result.name.clone(),
            response: Value::Object(response),
        }),
        ..Default::default()
    }
}

fn create_declaration(tool: &ModelTool) -> FunctionDeclaration {
    FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.trim().to_owned(),
        parameters: sanitize_schema(tool.parameters.clone()),
    }
}

/// Strips the JSON schema keywords the function declaration schema
/// rejects.
fn sanitize_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter(|(key, _)| key != "$schema" && key != "title")
                .map(|(key, value)| {
                    let value = if is_schema_map_keyword(&key) {
                        sanitize_schema_map(value)
                    } else {
                        sanitize_schema(value)
                    };
                    (key, value)
                })
                .collect();
            Value::Object(map)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(sanitize_schema).collect())
        }
        other => other,
    }
}

/// Keywords whose value maps user-chosen names to subschemas.
#[inline]
fn is_schema_map_keyword(key: &str) -> bool {
    matches!(key, "properties" | "patternProperties" | "$defs" | "definitions")
}

/// Keeps every key of a name-to-schema map, sanitizing the schemas.
fn sanitize_schema_map(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(name, schema)| (name, sanitize_schema(schema)))
                .collect(),
        ),
        other => sanitize_schema(other),
    }
}
