//! Error types for ClickHouse HTTP calls.
//!
//! Every error carries enough context to reproduce the failing call: the HTTP
//! status and database error code for query failures, the offending SQL, and
//! the offending value for conversion failures. [`Error::is_retryable`] is the
//! single place where failures are classified as transient or fatal.

use crate::types::ParseError;
use http::StatusCode;
use std::time::Duration;

/// The main error type for this crate.
///
/// # Examples
///
/// ```no_run
/// use clickhttp::{Client, Error, QuerySettings};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder().build()?;
///
/// match client.execute("SELECT * FROM missing", &QuerySettings::default()).await {
///     Ok(result) => println!("{} rows", result.len()),
///     Err(Error::Query { code, message, sql, .. }) => {
///         eprintln!("query {sql:?} failed with code {code:?}: {message}");
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A transport-level error (connection refused, TLS failure, reset).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A connection could not be established or was found broken.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request timed out.
    #[error("Request timed out")]
    Timeout,

    /// The server rejected the query or reported an exception while running it.
    ///
    /// # Fields
    ///
    /// * `message` - The exception text reported by the server
    /// * `code` - The database error code, when one was reported
    /// * `status` - The HTTP status, absent for errors reported mid-stream
    /// * `sql` - The statement that failed
    #[error("Query failed{}{}: {message}", .status.map(|s| format!(" (HTTP {})", s.as_u16())).unwrap_or_default(), .code.map(|c| format!(" [code {}]", c)).unwrap_or_default())]
    Query {
        /// The exception text
        message: String,
        /// The database error code
        code: Option<u32>,
        /// The HTTP status code
        status: Option<StatusCode>,
        /// The statement that failed
        sql: String,
    },

    /// A host value could not be converted to the declared column type.
    #[error("Cannot cast {value} from {from_type} to {to_type}")]
    TypeCast {
        /// The source type (host value kind or wire form)
        from_type: String,
        /// The target column type
        to_type: String,
        /// The offending value, rendered for display
        value: String,
    },

    /// A type declaration parsed but its arguments make no sense.
    #[error("Invalid type {type_name}: {reason}")]
    InvalidType {
        /// The rendered type declaration
        type_name: String,
        /// Why the declaration was rejected
        reason: String,
    },

    /// A type declaration could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// No pooled connection became available within the checkout timeout.
    #[error("Timed out after {timeout:?} waiting for a connection (pool capacity {capacity})")]
    PoolTimeout {
        /// How long the caller waited
        timeout: Duration,
        /// The pool capacity at the time
        capacity: usize,
    },

    /// The pool has been shut down.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The response body could not be decoded.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to decode
        raw_response: String,
        /// The decoder error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Failed to serialize rows for an insert.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// A gzip-compressed body could not be decompressed.
    #[error("Failed to decompress response: {0}")]
    Decompression(#[source] std::io::Error),

    /// A caller-supplied argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Returns `true` if this error is transient and the call may be retried unchanged.
    ///
    /// Transport failures, timeouts, pool-wait timeouts and query failures that
    /// carry HTTP 429 or 5xx are transient. Everything else, including syntax
    /// errors and other 4xx responses, is fatal.
    ///
    /// # Examples
    ///
    /// ```
    /// use clickhttp::Error;
    /// use http::StatusCode;
    ///
    /// let err = Error::Query {
    ///     message: "Memory limit exceeded".to_string(),
    ///     code: Some(241),
    ///     status: Some(StatusCode::SERVICE_UNAVAILABLE),
    ///     sql: "SELECT 1".to_string(),
    /// };
    /// assert!(err.is_retryable());
    ///
    /// let err = Error::Query {
    ///     message: "Syntax error".to_string(),
    ///     code: Some(62),
    ///     status: Some(StatusCode::BAD_REQUEST),
    ///     sql: "SELEC 1".to_string(),
    /// };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Connection(_) => true,
            Error::Timeout => true,
            Error::PoolTimeout { .. } => true,
            Error::Query { status, .. } => match status {
                // 5xx and 429 (Too Many Requests) are transient
                Some(status) => status.is_server_error() || status.as_u16() == 429,
                None => false,
            },
            Error::TypeCast { .. } => false,
            Error::InvalidType { .. } => false,
            Error::Parse(_) => false,
            Error::PoolClosed => false,
            Error::ConfigurationError(_) => false,
            Error::DeserializationFailed { .. } => false,
            Error::SerializationFailed(_) => false,
            Error::Decompression(_) => false,
            Error::InvalidArgument(_) => false,
            Error::InvalidUrl(_) => false,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Query { status, .. } => *status,
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::Network(e) => e.status(),
            _ => None,
        }
    }

    /// Returns the database error code if the server reported one.
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::Query { code, .. } => *code,
            _ => None,
        }
    }

    /// Returns the SQL statement that failed, for query errors.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Query { message, .. } => Some(message),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    pub(crate) fn type_cast(
        from_type: impl Into<String>,
        to_type: impl Into<String>,
        value: impl std::fmt::Display,
    ) -> Self {
        Error::TypeCast {
            from_type: from_type.into(),
            to_type: to_type.into(),
            value: value.to_string(),
        }
    }

    pub(crate) fn invalid_type(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidType {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }
}

/// Extracts the database error code from an exception text such as
/// `Code: 62. DB::Exception: Syntax error ...`.
pub(crate) fn parse_exception_code(text: &str) -> Option<u32> {
    let rest = &text[text.find("Code: ")? + "Code: ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Returns `true` if the text looks like a server exception report.
pub(crate) fn looks_like_exception(text: &str) -> bool {
    text.contains("DB::Exception") || text.trim_start().starts_with("Code: ")
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
