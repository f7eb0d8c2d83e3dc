use kaiwa_model::{ErrorKind, ModelProviderError};

/// Why an agent turn failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The model provider returned an error, after any retries.
    #[error("model request failed: {0}")]
    Model(Box<dyn ModelProviderError>),
    /// The model kept requesting tools past the step limit.
    #[error("no final answer after {0} model calls")]
    TooManySteps(usize),
}

impl Error {
    /// Returns the provider error kind, if the model request failed.
    #[inline]
    pub fn model_error_kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Model(err) => Some(err.kind()),
            Error::TooManySteps(_) => None,
        }
    }
}
