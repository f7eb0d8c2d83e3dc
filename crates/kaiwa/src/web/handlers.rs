use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use kaiwa_core::chat::ChatService;
use kaiwa_core::checkpoint::ThreadId;
use kaiwa_core::conversation::Turn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use super::error::ApiError;

const INDEX_HTML: &str = include_str!("index.html");

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ThreadCreated {
    pub thread_id: ThreadId,
}

#[derive(Debug, Serialize)]
pub struct ThreadHistory {
    pub thread_id: ThreadId,
    pub message_count: usize,
    pub messages: Vec<Turn>,
}

#[derive(Debug, Serialize)]
pub struct MessageReply {
    pub reply: String,
    pub messages: Vec<Turn>,
}

enum StreamUpdate {
    Delta(String),
    Done(String),
    Failed(String),
}

fn parse_thread_id(raw: &str) -> Result<ThreadId, ApiError> {
    Ok(raw.parse()?)
}

fn message_content(
    body: Result<Json<SendMessage>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(body) = body?;
    if body.content.trim().is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    Ok(body.content)
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn create_thread(
    State(chat): State<Arc<ChatService>>,
) -> (StatusCode, Json<ThreadCreated>) {
    let thread_id = chat.new_thread();
    debug!("created thread {thread_id}");
    (StatusCode::CREATED, Json(ThreadCreated { thread_id }))
}

pub async fn get_thread(
    State(chat): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadHistory>, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let messages = chat.history(&thread_id).await;
    Ok(Json(ThreadHistory {
        thread_id,
        message_count: messages.len(),
        messages,
    }))
}

pub async fn delete_thread(
    State(chat): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    if chat.reset(&thread_id).await {
        info!("reset thread {thread_id}");
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn send_message(
    State(chat): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
    body: Result<Json<SendMessage>, JsonRejection>,
) -> Result<Json<MessageReply>, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let content = message_content(body)?;
    let reply = chat.send(&thread_id, content, |_| {}).await?;
    let messages = chat.history(&thread_id).await;
    Ok(Json(MessageReply { reply, messages }))
}

/// Streams the reply as SSE events: `delta` for each text chunk, then one
/// `done` or `error`.
///
/// The turn runs in its own task, so it still completes and is
/// checkpointed when the client goes away.
pub async fn stream_message(
    State(chat): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
    body: Result<Json<SendMessage>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let content = message_content(body)?;

    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let delta_tx = update_tx.clone();
        let on_transcript = move |delta: &str| {
            delta_tx.send(StreamUpdate::Delta(delta.to_owned())).ok();
        };
        let update = match chat.send(&thread_id, content, on_transcript).await
        {
            Ok(reply) => StreamUpdate::Done(reply),
            Err(err) => StreamUpdate::Failed(err.to_string()),
        };
        update_tx.send(update).ok();
    });

    let sse_stream = async_stream::stream! {
        while let Some(update) = update_rx.recv().await {
            let (event, data, last) = match update {
                StreamUpdate::Delta(text) => ("delta", json!({ "text": text }), false),
                StreamUpdate::Done(reply) => ("done", json!({ "reply": reply }), true),
                StreamUpdate::Failed(message) => {
                    ("error", json!({ "message": message }), true)
                }
            };
            yield Ok::<_, Infallible>(Event::default().event(event).data(data.to_string()));
            if last {
                break;
            }
        }
    };

    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
