use std::fmt::{self, Debug};

pub(crate) const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub(crate) const DEFAULT_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta";
pub(crate) const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Builder for [`GeminiConfig`].
#[derive(Clone, PartialEq)]
pub struct GeminiConfigBuilder {
    api_key: String,
    model: Option<String>,
    base_url: Option<String>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
}

impl GeminiConfigBuilder {
    /// Creates a builder with the given API key.
    ///
    /// The key is sent as is. An empty key is allowed, in which case no
    /// credential header is attached and the API decides what happens.
    #[inline]
    pub fn with_api_key<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
            model: None,
            base_url: None,
            temperature: None,
            max_output_tokens: None,
        }
    }

    /// Sets the model to use.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets a custom base URL, e.g. a local proxy or a mock server.
    #[inline]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the sampling temperature.
    #[inline]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Limits the number of generated tokens per response.
    #[inline]
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> GeminiConfig {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        GeminiConfig {
            api_key: self.api_key,
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            base_url: base_url.trim_end_matches('/').to_owned(),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_output_tokens: self.max_output_tokens,
        }
    }
}

impl Debug for GeminiConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfigBuilder")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

/// Configuration for [`crate::GeminiProvider`].
#[derive(Clone, PartialEq)]
pub struct GeminiConfig {
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) base_url: String,
    pub(crate) temperature: f32,
    pub(crate) max_output_tokens: Option<u32>,
}

impl GeminiConfig {
    /// Returns the model name.
    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }
}

impl Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}
