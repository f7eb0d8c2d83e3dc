//! The chat web server.
//!
//! Serves a single page at `/` and a small JSON API under `/api/threads`.
//! Conversation state lives in the [`ChatService`]; the page only keeps its
//! thread id.

mod error;
mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use kaiwa_core::chat::ChatService;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// Builds the router with all routes and middleware.
pub fn router(chat: Arc<ChatService>) -> Router {
    let api_routes = Router::new()
        .route("/threads", post(handlers::create_thread))
        .route(
            "/threads/{id}",
            get(handlers::get_thread).delete(handlers::delete_thread),
        )
        .route("/threads/{id}/messages", post(handlers::send_message))
        .route(
            "/threads/{id}/messages/stream",
            post(handlers::stream_message),
        );

    Router::new()
        .route("/", get(handlers::index))
        .route("/healthz", get(handlers::healthz))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(chat)
}
