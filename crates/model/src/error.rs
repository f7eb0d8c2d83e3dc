use std::fmt::{self, Display};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The prompt or the generated content was blocked by the provider.
    Moderated,
    /// The model provider is rate limited.
    RateLimitExceeded,
    /// The credential was missing, invalid or lacks permission.
    Unauthorized,
    /// The provider is temporarily unable to serve the request.
    Unavailable,
    /// Any other errors.
    Other,
}

impl ErrorKind {
    /// Returns `true` if sending the same request again may succeed.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimitExceeded | ErrorKind::Unavailable)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Moderated => "content moderated",
            ErrorKind::RateLimitExceeded => "rate limit exceeded",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Unavailable => "provider unavailable",
            ErrorKind::Other => "other error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimitExceeded.is_retryable());
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(!ErrorKind::Moderated.is_retryable());
        assert!(!ErrorKind::Unauthorized.is_retryable());
        assert!(!ErrorKind::Other.is_retryable());
    }
}
