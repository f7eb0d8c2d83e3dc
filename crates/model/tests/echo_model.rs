use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::future::{poll_fn, ready};
use std::pin::Pin;
use std::task::{self, Poll, ready};
use std::time::Duration;

use kaiwa_model::{
    ErrorKind, ModelFinishReason, ModelMessage, ModelProvider,
    ModelProviderError, ModelRequest, ModelResponse, ModelResponseEvent,
    TokenUsage,
};
use tokio::time::{Sleep, sleep};

#[derive(Debug)]
struct EchoError(ErrorKind);

impl Display for EchoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "echo failed: {}", self.0)
    }
}

impl Error for EchoError {}

impl ModelProviderError for EchoError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

/// Replies with the last user message, one word per event.
struct EchoResponse {
    words: VecDeque<String>,
    completed: bool,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for EchoResponse {
    type Error = EchoError;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(sleep(Duration::from_millis(1))));
        ready!(sleep.as_mut().poll(cx));
        this.sleep = None;

        if let Some(mut word) = this.words.pop_front() {
            if !this.words.is_empty() {
                word.push(' ');
            }
            return Poll::Ready(Ok(Some(ModelResponseEvent::MessageDelta(
                word,
            ))));
        }
        if !this.completed {
            this.completed = true;
            return Poll::Ready(Ok(Some(ModelResponseEvent::Completed(
                ModelFinishReason::Stop,
            ))));
        }
        Poll::Ready(Ok(None))
    }
}

struct EchoProvider;

impl ModelProvider for EchoProvider {
    type Error = EchoError;
    type Response = EchoResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let last_user = req.messages.iter().rev().find_map(|msg| match msg {
            ModelMessage::User(text) => Some(text.clone()),
            _ => None,
        });
        let result = match last_user {
            Some(text) => Ok(EchoResponse {
                words: text.split(' ').map(ToOwned::to_owned).collect(),
                completed: false,
                sleep: None,
            }),
            None => Err(EchoError(ErrorKind::Other)),
        };
        ready(result)
    }
}

#[tokio::test]
async fn test_streamed_echo() {
    let req = ModelRequest {
        system: Some("Repeat after the user.".to_owned()),
        messages: vec![
            ModelMessage::User("first".to_owned()),
            ModelMessage::Assistant("first".to_owned()),
            ModelMessage::User("good morning Tokyo".to_owned()),
        ],
        tools: vec![],
    };
    let mut resp = EchoProvider.send_request(&req).await.unwrap();

    let mut text = String::new();
    let mut finish_reason = None;
    while let Some(event) = poll_fn(|cx| Pin::new(&mut resp).poll_next_event(cx))
        .await
        .unwrap()
    {
        match event {
            ModelResponseEvent::MessageDelta(delta) => text.push_str(&delta),
            ModelResponseEvent::Completed(reason) => finish_reason = Some(reason),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_eq!(text, "good morning Tokyo");
    assert_eq!(finish_reason, Some(ModelFinishReason::Stop));
    assert!(resp.make_opaque_message().is_none());
}

#[tokio::test]
async fn test_error_kind() {
    let err = EchoProvider
        .send_request(&ModelRequest::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Other);
    assert!(!err.kind().is_retryable());
    assert_eq!(TokenUsage::default().input_tokens, 0);
}
