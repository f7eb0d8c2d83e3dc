use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use kaiwa_model::{
    ModelFinishReason, ModelProvider, ModelProviderError, ModelRequest,
    ModelResponse, ModelResponseEvent, OpaqueMessage, TokenUsage,
    ToolCallRequest,
};
use tracing::Instrument;

type TranscriptFn = Arc<dyn Fn(&str) + Send + Sync>;
type SendRequestResult = Result<ModelClientResponse, RequestFailure>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
#[rustfmt::skip]
type HandlerFn = Arc<
    dyn Fn(ModelRequest, TranscriptFn) -> BoxedSendRequestFuture + Send + Sync
>;

/// How failed model requests are retried.
///
/// Only failures whose [`kaiwa_model::ErrorKind`] is retryable and that
/// happen before any text reached the caller are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Upper bound for the delay between retries.
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[inline]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn backoff(&self) -> impl Backoff + Send {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(8),
        }
    }
}

struct RequestFailure {
    error: Box<dyn ModelProviderError>,
    // Whether some text was already forwarded to the transcript callback.
    streamed: bool,
}

/// A wrapper around a model provider that erases its type and drives its
/// responses to completion.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
    retry_policy: RetryPolicy,
}

impl ModelClient {
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        let handler_fn: HandlerFn = Arc::new(move |req, on_transcript| {
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    trace!("got a request: {:?}", req);
                    let resp_or_err = fut.await;
                    handle_response::<P>(resp_or_err, on_transcript).await
                }
                .instrument(trace_span!("model client req")),
            )
        });
        Self {
            handler_fn,
            retry_policy: RetryPolicy::default(),
        }
    }

    #[inline]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sends a request and returns the complete response.
    ///
    /// `on_transcript` receives text deltas as they arrive.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    pub async fn send_request(
        &self,
        req: ModelRequest,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<ModelClientResponse, Box<dyn ModelProviderError>> {
        let on_transcript: TranscriptFn = Arc::new(on_transcript);
        let max_retries = self.retry_policy.max_retries;
        let mut attempt: u32 = 0;

        backoff::future::retry(self.retry_policy.backoff(), || {
            attempt += 1;
            let current_attempt = attempt;
            let fut = (self.handler_fn)(req.clone(), Arc::clone(&on_transcript));
            async move {
                fut.await.map_err(|failure| {
                    let kind = failure.error.kind();
                    if failure.streamed
                        || !kind.is_retryable()
                        || current_attempt > max_retries
                    {
                        return backoff::Error::permanent(failure.error);
                    }
                    warn!(
                        "model request failed ({kind}), retry {current_attempt}/{max_retries}"
                    );
                    backoff::Error::transient(failure.error)
                })
            }
        })
        .await
    }
}

/// A completely received response from the model client.
#[derive(Clone, Debug)]
pub struct ModelClientResponse {
    pub transcript: String,
    pub opaque_msg: Option<OpaqueMessage>,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCallRequest>,
    /// The reason the model finished generating.
    pub finish_reason: Option<ModelFinishReason>,
    pub usage: Option<TokenUsage>,
}

async fn handle_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
    on_transcript: TranscriptFn,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            error!("got an error: {err}");
            return Err(RequestFailure {
                error: Box::new(err),
                streamed: false,
            });
        }
    };

    let mut transcript = String::new();
    let opaque_msg;
    let mut tool_calls = Vec::new();
    let mut finish_reason = None;
    let mut usage = None;

    trace!("start receiving events");

    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(event) => event,
            Err(err) => {
                error!("got an error: {err}");
                return Err(RequestFailure {
                    error: Box::new(err),
                    streamed: !transcript.is_empty(),
                });
            }
        };

        let Some(event) = event else {
            opaque_msg = pinned_resp.make_opaque_message();
            break;
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::MessageDelta(msg) => {
                transcript.push_str(&msg);
                on_transcript(&msg);
            }
            ModelResponseEvent::ToolCall(req) => {
                tool_calls.push(req);
            }
            ModelResponseEvent::Usage(reported) => {
                debug!(
                    input_tokens = reported.input_tokens,
                    output_tokens = reported.output_tokens,
                    "token usage"
                );
                usage = Some(reported);
            }
            ModelResponseEvent::Completed(reason) => {
                finish_reason = Some(reason);
            }
        }
    }

    trace!("finished a request");

    Ok(ModelClientResponse {
        transcript,
        opaque_msg,
        tool_calls,
        finish_reason,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use kaiwa_model::{ErrorKind, ModelMessage};
    use kaiwa_test_model::{PresetEvent, PresetResponse, TestModelProvider};

    use super::*;

    fn fast_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        }
    }

    fn hello_request() -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::User("Hi".to_owned())],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut model_provider = TestModelProvider::default();
        model_provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("How ".to_owned()),
            PresetEvent::MessageDelta("are ".to_owned()),
            PresetEvent::MessageDelta("you?".to_owned()),
            PresetEvent::Usage(TokenUsage {
                input_tokens: 3,
                output_tokens: 3,
            }),
        ]));

        let model_client =
            ModelClient::new(model_provider).with_retry_policy(RetryPolicy::none());

        for _ in 0..3 {
            let deltas = Arc::new(Mutex::new(Vec::<String>::new()));
            let resp = model_client
                .send_request(hello_request(), {
                    let deltas = Arc::clone(&deltas);
                    move |delta| deltas.lock().unwrap().push(delta.to_owned())
                })
                .await
                .unwrap();
            assert_eq!(resp.transcript, "How are you?");
            assert!(resp.opaque_msg.is_some());
            assert_eq!(resp.finish_reason, Some(ModelFinishReason::Stop));
            assert_eq!(resp.usage.map(|u| u.output_tokens), Some(3));
            assert_eq!(*deltas.lock().unwrap(), ["How ", "are ", "you?"]);
        }
    }

    #[tokio::test]
    async fn test_error_handling() {
        let model_provider = TestModelProvider::default();
        let model_client =
            ModelClient::new(model_provider).with_retry_policy(fast_retries(3));
        let err = model_client
            .send_request(hello_request(), |_| {})
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_retries_rate_limited_requests() {
        let mut model_provider = TestModelProvider::default();
        model_provider
            .add_response(PresetResponse::text("finally").with_failures(2));

        let model_client =
            ModelClient::new(model_provider.clone())
                .with_retry_policy(fast_retries(3));
        let resp = model_client
            .send_request(hello_request(), |_| {})
            .await
            .unwrap();
        assert_eq!(resp.transcript, "finally");
        assert_eq!(model_provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut model_provider = TestModelProvider::default();
        model_provider.add_response(PresetResponse::text("never").with_failures(0));

        let model_client =
            ModelClient::new(model_provider.clone())
                .with_retry_policy(fast_retries(2));
        let err = model_client
            .send_request(hello_request(), |_| {})
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(model_provider.requests().len(), 3);

        let model_client =
            ModelClient::new(model_provider.clone())
                .with_retry_policy(RetryPolicy::none());
        model_client
            .send_request(hello_request(), |_| {})
            .await
            .err()
            .unwrap();
        assert_eq!(model_provider.requests().len(), 4);
    }
}
