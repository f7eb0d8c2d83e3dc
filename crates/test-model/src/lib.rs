//! A local fake model for testing purpose.

mod preset;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use kaiwa_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent, OpaqueMessage,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    step_idx: usize,
    events: Vec<PresetEvent>,
    event_idx: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        if this.event_idx > this.events.len() {
            // In case this method is called after completion.
            return Poll::Ready(Ok(None));
        }

        let delay = this.delay;
        let sleep = this.sleep.get_or_insert_with(|| Box::pin(sleep(delay)));
        ready!(sleep.as_mut().poll(cx));
        this.sleep = None;

        let event = match this.events.get(this.event_idx) {
            Some(PresetEvent::MessageDelta(msg)) => {
                ModelResponseEvent::MessageDelta(msg.clone())
            }
            Some(PresetEvent::ToolCall(req)) => {
                ModelResponseEvent::ToolCall(req.clone())
            }
            Some(PresetEvent::Usage(usage)) => ModelResponseEvent::Usage(*usage),
            None => {
                let has_tool_call = this
                    .events
                    .iter()
                    .any(|event| matches!(event, PresetEvent::ToolCall(_)));
                ModelResponseEvent::Completed(if has_tool_call {
                    ModelFinishReason::ToolCalls
                } else {
                    ModelFinishReason::Stop
                })
            }
        };
        this.event_idx += 1;
        Poll::Ready(Ok(Some(event)))
    }

    fn make_opaque_message(&self) -> Option<OpaqueMessage> {
        let id = format!("msg:{}", self.step_idx);
        Some(OpaqueMessage::new(id.clone(), id))
    }
}

#[derive(Default)]
struct Recorder {
    requests: Vec<ModelRequest>,
    attempts: HashMap<usize, u64>,
}

/// A local fake model for testing purpose.
///
/// The script is a list of assistant responses. A request is answered by
/// the response whose index equals the number of model messages already in
/// the request history, so the first request of a conversation gets the
/// first response, the request after one tool round gets the second, and
/// so on. A request beyond the script fails.
///
/// Every received request is recorded, see [`TestModelProvider::requests`].
/// Clones share the recording.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Vec<PresetResponse>,
    delay: Option<Duration>,
    recorder: Arc<Mutex<Recorder>>,
}

impl TestModelProvider {
    /// Appends the next assistant response to the script.
    #[inline]
    pub fn add_response(&mut self, preset: PresetResponse) {
        self.script.push(preset);
    }

    /// Sets the delay before each event.
    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns every request received so far, oldest first.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.recorder
            .lock()
            .map(|recorder| recorder.requests.clone())
            .unwrap_or_default()
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let step_idx =
            req.messages.iter().filter(|msg| msg.is_from_model()).count();

        let attempt = match self.recorder.lock() {
            Ok(mut recorder) => {
                recorder.requests.push(req.clone());
                let attempt = recorder.attempts.entry(step_idx).or_default();
                *attempt += 1;
                *attempt - 1
            }
            Err(_) => 0,
        };

        let result = match self.script.get(step_idx) {
            None => Err(Error {
                message: "not enough steps",
                kind: ErrorKind::Other,
            }),
            Some(preset) if preset.should_fail(attempt) => Err(Error {
                message: "injected failure",
                kind: ErrorKind::RateLimitExceeded,
            }),
            Some(preset) => Ok(TestModelResponse {
                step_idx,
                events: preset.events.clone(),
                event_idx: 0,
                delay: self.delay.unwrap_or(Duration::from_millis(1)),
                sleep: None,
            }),
        };
        ready(result)
    }
}
