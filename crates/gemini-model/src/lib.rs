//! A model provider for the Gemini API.

#[macro_use]
extern crate tracing;

mod config;
mod io;
mod proto;
mod response;

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;

use kaiwa_model::{ErrorKind, ModelProvider, ModelProviderError, ModelRequest};
use mime::Mime;
use reqwest::{Client, Response, StatusCode, header};

pub use config::{GeminiConfig, GeminiConfigBuilder};
use io::{Chunks, Sse};
use proto::ErrorEnvelope;
pub use response::GeminiResponse;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Error type for [`GeminiProvider`].
#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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

/// Gemini model provider.
#[derive(Clone, Debug)]
pub struct GeminiProvider {
    client: Client,
    config: Arc<GeminiConfig>,
}

impl GeminiProvider {
    /// Creates a new `GeminiProvider` with the given configuration.
    #[inline]
    pub fn new(config: GeminiConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    /// Creates a provider that sends requests through `client`.
    #[inline]
    pub fn with_client(client: Client, config: GeminiConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    /// Returns the configuration of this provider.
    #[inline]
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }
}

impl ModelProvider for GeminiProvider {
    type Error = Error;
    type Response = GeminiResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let body = proto::create_request(req, &self.config);
        let mut builder = self
            .client
            .post(self.config.stream_url())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.header(API_KEY_HEADER, &self.config.api_key);
        }
        let model = self.config.model.clone();
        let resp_fut = builder.send();

        async move {
            debug!("sending request to {model}");
            let resp = resp_fut.await.map_err(|err| {
                let kind = if err.is_connect() || err.is_timeout() {
                    ErrorKind::Unavailable
                } else {
                    ErrorKind::Other
                };
                Error::new(format!("request failed: {err}"), kind)
            })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(error_from_response(resp).await);
            }

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            if !is_event_stream(content_type) {
                return Err(Error::new(
                    format!("unexpected content type: {content_type:?}"),
                    ErrorKind::Other,
                ));
            }

            let chunks = Chunks::from_response(resp);
            Ok(GeminiResponse::from_sse(Sse::new(chunks)))
        }
    }
}

fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|v| v.parse::<Mime>().ok())
        .map(|m| m.type_() == mime::TEXT && m.subtype() == mime::EVENT_STREAM)
        .unwrap_or(false)
}

fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimitExceeded,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ErrorKind::Unauthorized
        }
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Unavailable,
        _ => ErrorKind::Other,
    }
}

async fn error_from_response(resp: Response) -> Error {
    let status = resp.status();
    let kind = kind_for_status(status);
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|envelope| match envelope.error.status {
            Some(code) => format!("{code}: {}", envelope.error.message),
            None => envelope.error.message,
        })
        .unwrap_or(body);
    warn!("gemini returned {status}: {detail}");
    Error::new(format!("HTTP {status}: {detail}"), kind)
}
