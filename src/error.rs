//! Error types for the extension host.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the extension host.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manifest errors (the extension is skipped, the host keeps running)
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Malformed or misdirected protocol traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Module resolution escaped the extension root
    #[error("Sandbox violation: {0}")]
    Sandbox(String),

    /// Extension errors
    #[error("Extension error: {0}")]
    Extension(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] Box<serde_json::Error>),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a manifest error.
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a sandbox violation.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    /// Create an extension error.
    pub fn extension(message: impl Into<String>) -> Self {
        Self::Extension(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for failures that must terminate a worker process.
    pub const fn is_fatal_to_worker(&self) -> bool {
        matches!(self, Self::Sandbox(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_map_to_variants() {
        assert!(matches!(Error::config("x"), Error::Config(m) if m == "x"));
        assert!(matches!(Error::protocol("bad"), Error::Protocol(_)));
        assert_eq!(
            Error::sandbox("../etc").to_string(),
            "Sandbox violation: ../etc"
        );
    }

    #[test]
    fn only_sandbox_errors_are_fatal() {
        assert!(Error::sandbox("escape").is_fatal_to_worker());
        assert!(!Error::extension("boom").is_fatal_to_worker());
        assert!(!Error::manifest("missing main").is_fatal_to_worker());
    }

    #[test]
    fn io_and_json_errors_are_boxed() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(Error::from(io), Error::Io(_)));
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json), Error::Json(_)));
    }
}
