//! Error types for the binpq driver.
//!
//! Every failure maps onto one [`ErrorKind`]; callers that only care about the
//! category match on `err.kind()` instead of the concrete variant.

use std::fmt;

use thiserror::Error;

/// Result type for driver operations.
pub type PgResult<T> = std::result::Result<T, PgError>;

/// The suspension point at which a deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Establishing a new session.
    Connect,
    /// Waiting in the pool queue for a lease.
    Queue,
    /// Transmitting a message.
    Send,
    /// Waiting for the server's response.
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Stage::Connect => "connecting",
            Stage::Queue => "waiting for a pooled connection",
            Stage::Send => "sending the request",
            Stage::Response => "awaiting the response",
        };
        f.write_str(stage)
    }
}

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Handshake, authentication or transport failure.
    ConnectionFailure,
    /// A deadline elapsed while connecting, queued, sending or awaiting a response.
    Timeout,
    /// Both the pool capacity and its waiter queue are full.
    PoolExhausted,
    /// Malformed or unexpected server response.
    Protocol,
    /// Server column type incompatible with the requested row shape.
    TypeMismatch,
    /// The server rejected the query (syntax, constraint, permission).
    QueryExecution,
    /// Invalid configuration supplied by the caller.
    Configuration,
}

#[derive(Error, Debug)]
pub enum PgError {
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Operation timed out while {0}")]
    Timeout(Stage),

    #[error("Connection pool exhausted (capacity {capacity}, queue capacity {queue_capacity})")]
    PoolExhausted {
        capacity: usize,
        queue_capacity: usize,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("{severity}: {message} ({code}){}", server_suffix(.detail, .hint))]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<PgError>,
    },
}

impl PgError {
    /// Category of this error, looking through any attached context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PgError::ConnectionFailure(_)
            | PgError::Io(_)
            | PgError::ConnectionClosed
            | PgError::PoolClosed => ErrorKind::ConnectionFailure,
            PgError::Timeout(_) => ErrorKind::Timeout,
            PgError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            PgError::Protocol(_) => ErrorKind::Protocol,
            PgError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            PgError::Server { .. } => ErrorKind::QueryExecution,
            PgError::Config(_) => ErrorKind::Configuration,
            PgError::Context { source, .. } => source.kind(),
        }
    }

    /// Attach a human-readable context string. Empty contexts are dropped.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        if context.is_empty() {
            return self;
        }
        PgError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// The context attached by [`with_context`](Self::with_context), if any.
    pub fn context(&self) -> Option<&str> {
        match self {
            PgError::Context { context, .. } => Some(context),
            _ => None,
        }
    }

    /// SQLSTATE code of a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            PgError::Context { source, .. } => source.code(),
            _ => None,
        }
    }

    /// Whether a connection that produced this error must be discarded.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionFailure | ErrorKind::Timeout | ErrorKind::Protocol
        )
    }
}

fn server_suffix(detail: &Option<String>, hint: &Option<String>) -> String {
    let mut suffix = String::new();
    if let Some(d) = detail {
        suffix.push_str("\nDetail: ");
        suffix.push_str(d);
    }
    if let Some(h) = hint {
        suffix.push_str("\nHint: ");
        suffix.push_str(h);
    }
    suffix
}
