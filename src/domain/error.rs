use thiserror::Error;

/// Boxed error raised by a transport adapter (DNS, connect, timeout, ...)
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Non-success HTTP response from the context store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HttpError {
    /// Human-readable description
    pub message: String,

    /// HTTP status code
    pub status: u16,

    /// URL of the request that failed
    pub url: String,

    /// Raw response body, if any
    pub body: Option<String>,
}

/// A mutation rejected because its expected version did not match the server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("version conflict: {http} (expected {expected_version:?}, server at {current_version:?})")]
pub struct ConflictError {
    /// The underlying HTTP failure
    pub http: HttpError,

    /// Version the client sent as its precondition
    pub expected_version: Option<u64>,

    /// Authoritative version reported by the server
    pub current_version: Option<u64>,
}

/// Errors surfaced by the UltraContext client
#[derive(Error, Debug)]
pub enum UltraContextError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("{0}")]
    Conflict(#[from] ConflictError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UltraContextError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// HTTP view of the error; conflicts are HTTP errors too
    pub fn http_error(&self) -> Option<&HttpError> {
        match self {
            Self::Http(error) => Some(error),
            Self::Conflict(conflict) => Some(&conflict.http),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.http_error().map(|error| error.status)
    }

    /// Server version carried by a conflict, the only machine-usable recovery hint
    pub fn current_version(&self) -> Option<u64> {
        match self {
            Self::Conflict(conflict) => conflict.current_version,
            _ => None,
        }
    }
}

/// Result type for UltraContext operations
pub type UltraContextResult<T> = Result<T, UltraContextError>;
