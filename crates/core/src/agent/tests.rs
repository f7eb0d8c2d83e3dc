use std::sync::{Arc, Mutex};
use std::time::Duration;

use kaiwa_model::{ErrorKind, ModelMessage, ToolCallRequest};
use kaiwa_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::conversation::TranscriptSource;
use crate::tool::{Tool, ToolResult};
use crate::{AgentBuilder, Error, RetryPolicy};

#[derive(Deserialize)]
struct WeatherInput {
    city: String,
}

struct WeatherTool {
    schema: Value,
}

impl WeatherTool {
    fn new() -> Self {
        Self {
            schema: json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"],
            }),
        }
    }
}

impl Tool for WeatherTool {
    type Input = WeatherInput;

    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get weather for a given city."
    }

    fn parameter_schema(&self) -> &Value {
        &self.schema
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        std::future::ready(Ok(format!("It's always sunny in {}!", input.city)))
    }
}

fn weather_call(id: &str, arguments: Value) -> PresetEvent {
    PresetEvent::ToolCall(ToolCallRequest {
        id: id.to_owned(),
        name: "get_weather".to_owned(),
        arguments,
    })
}

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(2),
    }
}

#[tokio::test]
async fn test_simple_message() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::MessageDelta("Hi, ".to_owned()),
        PresetEvent::MessageDelta("what can I do for you?".to_owned()),
    ]));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_system_prompt("You are a helpful assistant")
        .build();
    let conversation = agent.invoke("Hello").await.unwrap();

    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.items()[0].source(), TranscriptSource::User);
    assert_eq!(conversation.items()[1].transcript(), "Hi, what can I do for you?");

    let requests = model_provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].system.as_deref(),
        Some("You are a helpful assistant")
    );
    assert!(requests[0].tools.is_empty());
}

#[tokio::test]
async fn test_tool_round_trip() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([weather_call(
        "call_0",
        json!({ "city": "東京" }),
    )]));
    model_provider.add_response(PresetResponse::text("東京は晴れです。"));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_tool(WeatherTool::new())
        .build();
    let conversation = agent.invoke("東京の天気はなんですか？").await.unwrap();

    let sources: Vec<_> =
        conversation.items().iter().map(|item| item.source()).collect();
    assert_eq!(
        sources,
        [
            TranscriptSource::User,
            TranscriptSource::Assistant,
            TranscriptSource::Tool,
            TranscriptSource::Assistant,
        ]
    );
    assert_eq!(conversation.items()[1].tool_calls().len(), 1);
    assert_eq!(
        conversation.items()[2].transcript(),
        "It's always sunny in 東京!"
    );
    assert_eq!(conversation.items()[3].transcript(), "東京は晴れです。");

    let requests = model_provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "get_weather");
    let Some(ModelMessage::Tool(result)) = requests[1].messages.last() else {
        panic!("the second request should end with the tool result");
    };
    assert_eq!(result.id, "call_0");
    assert!(!result.is_error);
}

#[tokio::test]
async fn test_tool_errors_go_back_to_the_model() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        weather_call("call_0", json!({ "town": "東京" })),
        PresetEvent::ToolCall(ToolCallRequest {
            id: "call_1".to_owned(),
            name: "get_time".to_owned(),
            arguments: json!({}),
        }),
    ]));
    model_provider.add_response(PresetResponse::text("Sorry."));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_tool(WeatherTool::new())
        .build();
    let conversation = agent.invoke("Weather?").await.unwrap();
    assert_eq!(conversation.len(), 5);

    let requests = model_provider.requests();
    let results: Vec<_> = requests[1]
        .messages
        .iter()
        .filter_map(|msg| match msg {
            ModelMessage::Tool(result) => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.is_error));
    assert!(results[0].content.contains("city"));
    assert_eq!(results[1].name, "get_time");
}

#[tokio::test]
async fn test_too_many_steps() {
    let mut model_provider = TestModelProvider::default();
    for i in 0..3 {
        model_provider.add_response(PresetResponse::with_events([
            weather_call(&format!("call_{i}"), json!({ "city": "大阪" })),
        ]));
    }

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_tool(WeatherTool::new())
        .with_max_steps(2)
        .build();
    let err = agent.invoke("Loop forever").await.err().unwrap();
    assert!(matches!(err, Error::TooManySteps(2)));
    assert_eq!(model_provider.requests().len(), 2);
}

#[tokio::test]
async fn test_retry_then_succeed() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::text("Hello!").with_failures(1));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_retry_policy(fast_retries(3))
        .build();
    let conversation = agent.invoke("Hi").await.unwrap();
    assert_eq!(conversation.items()[1].transcript(), "Hello!");
    assert_eq!(model_provider.requests().len(), 2);
}

#[tokio::test]
async fn test_retry_exhausted() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::text("Hello!").with_failures(0));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_retry_policy(fast_retries(1))
        .build();
    let err = agent.invoke("Hi").await.err().unwrap();
    assert_eq!(err.model_error_kind(), Some(ErrorKind::RateLimitExceeded));
    assert_eq!(model_provider.requests().len(), 2);
}

#[tokio::test]
async fn test_no_retry_for_permanent_errors() {
    let model_provider = TestModelProvider::default();

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_retry_policy(fast_retries(3))
        .build();
    let err = agent.invoke("Hi").await.err().unwrap();
    assert_eq!(err.model_error_kind(), Some(ErrorKind::Other));
    assert_eq!(model_provider.requests().len(), 1);
}

#[tokio::test]
async fn test_streamed_transcript_spans_steps() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::MessageDelta("Checking. ".to_owned()),
        weather_call("call_0", json!({ "city": "札幌" })),
    ]));
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::MessageDelta("It's ".to_owned()),
        PresetEvent::MessageDelta("sunny.".to_owned()),
    ]));

    let agent = AgentBuilder::with_model_provider(model_provider)
        .with_tool(WeatherTool::new())
        .build();

    let deltas = Arc::new(Mutex::new(String::new()));
    let mut conversation = Default::default();
    let reply = agent
        .run_turn(&mut conversation, "Weather in Sapporo?", {
            let deltas = Arc::clone(&deltas);
            move |delta| deltas.lock().unwrap().push_str(delta)
        })
        .await
        .unwrap();

    assert_eq!(reply, "It's sunny.");
    assert_eq!(*deltas.lock().unwrap(), "Checking. It's sunny.");
    assert_eq!(conversation.turns().len(), 3);
}
