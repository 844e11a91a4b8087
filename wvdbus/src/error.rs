use std::fmt;
use std::io;

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timeout")]
    Timeout,
    #[error("Invalid D-Bus address: '{0}'")]
    InvalidAddress(String),
    #[error("Authentication failed: '{0}'")]
    Authentication(String),
    #[error("Connection is not authenticated")]
    NotAuthenticated,
    #[error("Malformed signature '{signature}': {reason}")]
    MalformedSignature {
        signature: String,
        reason: &'static str,
    },
    #[error("Read value {0} while expecting boolean (0/1)")]
    MalformedBoolean(u32),
    #[error("Read non-zero byte at position {0:#x} while expecting padding")]
    NonZeroPadding(usize),
    #[error("Truncated data: need {needed} bytes at position {pos}, have {available}")]
    Truncated {
        pos: usize,
        needed: usize,
        available: usize,
    },
    #[error("{what} length {length} exceeds maximum of {max} bytes")]
    LengthExceeded {
        what: &'static str,
        length: usize,
        max: usize,
    },
    #[error("Unknown D-Bus type code '{0}'")]
    UnknownType(char),
    #[error("D-Bus protocol version {0} is not supported")]
    UnsupportedVersion(u8),
    #[error("Invalid message header: {0}")]
    InvalidHeader(String),
    #[error("Invalid UTF-8 string at position {0:#x}")]
    InvalidUtf8(usize),
    #[error("String at position {0:#x} is not NUL-terminated")]
    UnterminatedString(usize),
    #[error("Invalid object path '{0}'")]
    InvalidObjectPath(String),
    #[error("Type mismatch: expected '{expected}', got '{got}'")]
    TypeMismatch { expected: String, got: String },
    #[error("{name}: {message}")]
    DBusError { name: String, message: String },
    #[error("The event loop is already running")]
    LoopReentered,
    #[error("Scheduled callback failed: {0}")]
    CallbackFailed(String),
}

/// The error type of this crate.
///
/// Carries an [`ErrorKind`] and, where one exists, the underlying error that
/// caused it.
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }

    pub fn with_source<E>(kind: ErrorKind, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error {
            kind,
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// True for errors after which the byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::Timeout | ErrorKind::DBusError { .. } | ErrorKind::TypeMismatch { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.kind, source),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.kind);
        if let Some(source) = &self.source {
            d.field("source", source);
        }
        d.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(e) => Some(e.as_ref()),
            None => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Error::with_source(ErrorKind::ConnectionClosed, e),
            io::ErrorKind::TimedOut => Error::with_source(ErrorKind::Timeout, e),
            kind => Error::with_source(ErrorKind::Io(kind), e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
