use std::fmt;

/// Coarse failure class used by retry decisions and by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Connection,
    Api,
}

#[derive(Debug)]
pub enum Error {
    /// Panel answered 401.
    Authentication(String),
    /// Host unreachable, timed out, or the transport failed mid-request.
    Connection {
        message: String,
        source: Option<reqwest::Error>,
    },
    /// Well-formed HTTP exchange with an unusable result.
    Api {
        status: Option<u16>,
        message: String,
    },
    /// The session was closed while the request was in flight.
    Closed,
    /// The HTTP client could not be constructed.
    Client(reqwest::Error),
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn api(message: impl Into<String>) -> Self {
        Error::Api {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Connection { .. } | Error::Closed | Error::Client(_) => ErrorKind::Connection,
            Error::Api { .. } | Error::InvalidConfig(_) => ErrorKind::Api,
        }
    }

    /// Only plain connection failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Authentication(msg) => write!(f, "authentication failed: {msg}"),
            Error::Connection { message, .. } => write!(f, "connection error: {message}"),
            Error::Api {
                status: Some(status),
                message,
            } => write!(f, "API error {status}: {message}"),
            Error::Api {
                status: None,
                message,
            } => write!(f, "API error: {message}"),
            Error::Closed => write!(f, "client session closed"),
            Error::Client(e) => write!(f, "failed to build HTTP client: {e}"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection {
                source: Some(e), ..
            } => Some(e),
            Error::Client(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
