use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use kaiwa_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
    OpaqueMessage, TokenUsage, ToolCallRequest,
};
use pin_project_lite::pin_project;

use crate::Error;
use crate::io::Sse;
use crate::proto::{Content, GenerateContentChunk, Part, ROLE_MODEL};

/// Finish reasons that mean the output was withheld.
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
];

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

struct PartialState {
    sse: Sse,
    id: Option<String>,
    // The model content as it will be replayed in later requests.
    parts: Vec<Part>,
    // Events decoded from a chunk but not yet handed to the caller.
    pending_events: VecDeque<ModelResponseEvent>,
    usage: Option<TokenUsage>,
    finish_reason: Option<ModelFinishReason>,
    tool_call_count: usize,
    received_chunk: bool,
    finished: bool,
}

impl PartialState {
    #[inline]
    fn finish(self) -> (String, Content) {
        let id = self.id.unwrap_or_else(|| {
            format!("gemini-local-{}", NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
        });
        let content = Content {
            role: Some(ROLE_MODEL.to_owned()),
            parts: self.parts,
        };
        (id, content)
    }

    fn push_part(&mut self, part: Part) {
        if part.is_plain_text() {
            if let Some(last) = self.parts.last_mut().filter(|p| p.is_plain_text())
            {
                if let (Some(text), Some(more)) = (&mut last.text, &part.text) {
                    text.push_str(more);
                    return;
                }
            }
        }
        self.parts.push(part);
    }

    fn apply_chunk(&mut self, chunk: GenerateContentChunk) -> Result<(), Error> {
        self.received_chunk = true;
        if self.id.is_none() {
            self.id = chunk.response_id;
        }
        if let Some(reason) =
            chunk.prompt_feedback.and_then(|feedback| feedback.block_reason)
        {
            return Err(Error::new(
                format!("prompt blocked: {reason}"),
                ErrorKind::Moderated,
            ));
        }
        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(TokenUsage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            });
        }

        // Only one candidate is ever requested.
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(());
        };

        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        // Text goes out first, then tool calls, whatever the part order.
        let mut tool_calls = Vec::new();
        for mut part in parts {
            if let Some(call) = &mut part.function_call {
                let id = call
                    .id
                    .get_or_insert_with(|| format!("call_{}", self.tool_call_count))
                    .clone();
                self.tool_call_count += 1;
                tool_calls.push(ToolCallRequest {
                    id,
                    name: call.name.clone(),
                    arguments: call.args.clone(),
                });
            } else if let Some(text) = &part.text {
                let is_thought = part.thought.unwrap_or(false);
                if !is_thought && !text.is_empty() {
                    self.pending_events
                        .push_back(ModelResponseEvent::MessageDelta(text.clone()));
                }
            }
            self.push_part(part);
        }
        self.pending_events
            .extend(tool_calls.into_iter().map(ModelResponseEvent::ToolCall));

        if let Some(reason) = candidate.finish_reason {
            self.finish_reason = Some(map_finish_reason(&reason)?);
        }
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<(), Error> {
        self.finished = true;
        if !self.received_chunk {
            return Err(Error::new(
                "stream ended without any response",
                ErrorKind::Other,
            ));
        }
        if let Some(usage) = self.usage {
            self.pending_events.push_back(ModelResponseEvent::Usage(usage));
        }
        let reason = if self.tool_call_count > 0 {
            ModelFinishReason::ToolCalls
        } else {
            self.finish_reason.unwrap_or(ModelFinishReason::Stop)
        };
        self.pending_events
            .push_back(ModelResponseEvent::Completed(reason));
        Ok(())
    }
}

fn map_finish_reason(reason: &str) -> Result<ModelFinishReason, Error> {
    if BLOCKED_FINISH_REASONS.contains(&reason) {
        return Err(Error::new(
            format!("response blocked: {reason}"),
            ErrorKind::Moderated,
        ));
    }
    match reason {
        "MAX_TOKENS" => Ok(ModelFinishReason::Length),
        "MALFORMED_FUNCTION_CALL" | "UNEXPECTED_TOOL_CALL" => Err(Error::new(
            format!("model produced an invalid tool call: {reason}"),
            ErrorKind::Other,
        )),
        _ => Ok(ModelFinishReason::Stop),
    }
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    /// A streamed `streamGenerateContent` response.
    pub struct GeminiResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
        full_msg: Option<(String, Content)>,
    }
}

impl GeminiResponse {
    #[inline]
    pub(crate) fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            id: None,
            parts: Default::default(),
            pending_events: Default::default(),
            usage: None,
            finish_reason: None,
            tool_call_count: 0,
            received_chunk: false,
            finished: false,
        };
        Self {
            next_event_fut: Some(Box::pin(next_event(partial_state))),
            full_msg: None,
        }
    }
}

impl ModelResponse for GeminiResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, partial_state)) => {
                    *this.next_event_fut = None;
                    *this.full_msg = Some(partial_state.finish());
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        *this.next_event_fut = Some(Box::pin(next_event(partial_state)));
        Poll::Ready(Ok(Some(event)))
    }

    fn make_opaque_message(&self) -> Option<OpaqueMessage> {
        self.full_msg
            .as_ref()
            .map(|(id, content)| OpaqueMessage::new(id, content.clone()))
    }
}

async fn next_event(mut partial_state: PartialState) -> NextEvent {
    loop {
        if let Some(event) = partial_state.pending_events.pop_front() {
            return Ok((Some(event), partial_state));
        }
        if partial_state.finished {
            return Ok((None, partial_state));
        }

        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                partial_state.end_of_stream()?;
                continue;
            }
            Err(err) => {
                return Err(Error::new(
                    format!("broken event stream: {err:?}"),
                    ErrorKind::Unavailable,
                ));
            }
        };
        trace!("got sse event: {sse_event}");

        let chunk = serde_json::from_str::<GenerateContentChunk>(&sse_event)
            .map_err(|err| {
                Error::new(format!("invalid chunk: {err}"), ErrorKind::Other)
            })?;
        partial_state.apply_chunk(chunk)?;
    }
}
