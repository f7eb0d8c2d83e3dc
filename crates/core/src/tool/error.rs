use std::borrow::Cow;
use std::fmt::{self, Display};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The arguments did not match the tool's input type.
    InvalidInput,
    /// Error occurred while executing the tool.
    ExecutionError,
    /// The model asked for a tool that is not registered.
    NotFound,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidInput => write!(f, "Invalid input"),
            ErrorKind::ExecutionError => write!(f, "Execution error"),
            ErrorKind::NotFound => write!(f, "Tool not found"),
        }
    }
}

/// Describes a tool call error.
///
/// Tool errors never abort a turn. They are reported back to the model as
/// the tool's output, see [`Error::reason`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Error {
    kind: ErrorKind,
    reason: Option<String>,
}

impl Error {
    /// Creates a new error with the `InvalidInput` kind.
    #[inline]
    pub fn invalid_input() -> Self {
        Self::new(ErrorKind::InvalidInput)
    }

    /// Creates a new error with the `ExecutionError` kind.
    #[inline]
    pub fn execution_error() -> Self {
        Self::new(ErrorKind::ExecutionError)
    }

    /// Creates a new error with the `NotFound` kind.
    #[inline]
    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    #[inline]
    fn new(kind: ErrorKind) -> Self {
        Self { kind, reason: None }
    }

    /// Attaches a reason to the error.
    #[inline]
    pub fn with_reason<S: Into<String>>(self, reason: S) -> Self {
        Self {
            kind: self.kind,
            reason: Some(reason.into()),
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> Cow<'_, str> {
        match self.reason.as_deref() {
            Some(reason) => Cow::Borrowed(reason),
            None => Cow::Owned(format!("{}", self.kind)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {reason}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_falls_back_to_kind() {
        let err = Error::not_found();
        assert_eq!(err.reason(), "Tool not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::invalid_input().with_reason("missing field `city`");
        assert_eq!(err.reason(), "missing field `city`");
        assert_eq!(err.to_string(), "Invalid input: missing field `city`");
    }
}
