//! Business error codes and the framework error type.
//!
//! Every failure that reaches the response envelope is an [`Error`]. An error
//! optionally carries a [`Code`]; when it does not, the code is looked up along
//! the chain of wrapped causes and falls back to [`Code::INTERNAL_ERROR`].
//!
//! # Domain Errors
//!
//! For type-safe domain errors, implement the [`IntoError`] trait:
//!
//! ```rust
//! use maltose::error::{Error, IntoError};
//!
//! enum UserError {
//!     NotFound(u64),
//!     Banned,
//! }
//!
//! impl IntoError for UserError {
//!     fn into_error(self) -> Error {
//!         match self {
//!             UserError::NotFound(id) => Error::not_found(format!("user {} not found", id)),
//!             UserError::Banned => Error::forbidden("user is banned"),
//!         }
//!     }
//! }
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A numeric business code with its default message.
///
/// Codes travel inside the response envelope and are decoupled from the
/// HTTP status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code {
    value: i32,
    message: &'static str,
}

impl Code {
    pub const OK: Code = Code::new(0, "OK");
    pub const INVALID_PARAMETER: Code = Code::new(400, "Invalid Parameter");
    pub const UNAUTHORISED: Code = Code::new(401, "Unauthorised");
    pub const FORBIDDEN: Code = Code::new(403, "Forbidden");
    pub const NOT_FOUND: Code = Code::new(404, "Not Found");
    pub const METHOD_NOT_ALLOWED: Code = Code::new(405, "Method Not Allowed");
    pub const VALIDATION_FAILED: Code = Code::new(422, "Validation Failed");
    pub const INTERNAL_ERROR: Code = Code::new(500, "Internal Error");
    pub const SERVER_BUSY: Code = Code::new(503, "Server Busy");

    /// Creates a custom business code.
    pub const fn new(value: i32, message: &'static str) -> Self {
        Self { value, message }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn message(&self) -> &'static str {
        self.message
    }

    /// Maps a response status that carries no error to a business code.
    pub fn from_status(status: StatusCode) -> Code {
        match status {
            s if s.is_success() => Code::OK,
            StatusCode::NOT_FOUND => Code::NOT_FOUND,
            StatusCode::UNAUTHORIZED => Code::UNAUTHORISED,
            StatusCode::FORBIDDEN => Code::FORBIDDEN,
            StatusCode::METHOD_NOT_ALLOWED => Code::METHOD_NOT_ALLOWED,
            _ => Code::INTERNAL_ERROR,
        }
    }

    /// The HTTP status used when responses follow HTTP-native semantics.
    pub fn http_status(&self) -> StatusCode {
        match *self {
            Code::OK => StatusCode::OK,
            Code::INVALID_PARAMETER | Code::VALIDATION_FAILED => StatusCode::BAD_REQUEST,
            Code::UNAUTHORISED => StatusCode::UNAUTHORIZED,
            Code::FORBIDDEN => StatusCode::FORBIDDEN,
            Code::NOT_FOUND => StatusCode::NOT_FOUND,
            Code::METHOD_NOT_ALLOWED => StatusCode::METHOD_NOT_ALLOWED,
            Code::SERVER_BUSY => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.value, self.message)
    }
}

/// The error type handlers and middleware report.
///
/// # Examples
///
/// ```
/// use maltose::error::{Code, Error};
///
/// let err = Error::not_found("user not found");
/// assert_eq!(err.code(), Code::NOT_FOUND);
///
/// let io = std::io::Error::other("disk full");
/// let err = Error::wrap(io, "saving avatar");
/// assert_eq!(err.code(), Code::INTERNAL_ERROR);
/// assert_eq!(err.to_string(), "saving avatar: disk full");
/// ```
#[derive(Debug)]
pub struct Error {
    code: Option<Code>,
    message: String,
    detail: Option<serde_json::Value>,
    status: Option<StatusCode>,
    source: Option<BoxError>,
    stack: Backtrace,
}

impl Error {
    /// Creates an error with an explicit business code.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self::build(Some(code), message.into(), None)
    }

    /// Creates an error without a code.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::build(None, message.into(), None)
    }

    /// Wraps a cause, keeping whatever code the cause chain carries.
    pub fn wrap(cause: impl Into<BoxError>, message: impl Into<String>) -> Self {
        Self::build(None, message.into(), Some(cause.into()))
    }

    /// Wraps a cause and overrides its code.
    pub fn wrap_code(code: Code, cause: impl Into<BoxError>, message: impl Into<String>) -> Self {
        Self::build(Some(code), message.into(), Some(cause.into()))
    }

    fn build(code: Option<Code>, message: String, source: Option<BoxError>) -> Self {
        Self {
            code,
            message,
            detail: None,
            status: None,
            source,
            stack: Backtrace::capture(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(Code::INVALID_PARAMETER, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(Code::VALIDATION_FAILED, message)
    }

    pub fn unauthorised(message: impl Into<String>) -> Self {
        Self::new(Code::UNAUTHORISED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Code::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::INTERNAL_ERROR, message)
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(Code::SERVER_BUSY, message)
    }

    /// Attaches structured detail to the error.
    pub fn with_detail(mut self, detail: impl Into<serde_json::Value>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Requests an explicit HTTP status for the response carrying this error.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// The effective business code: this error's own code, or the first one
    /// found along the cause chain, or `INTERNAL_ERROR`.
    pub fn code(&self) -> Code {
        match (self.code, StdError::source(self)) {
            (Some(code), _) => code,
            (None, Some(source)) => code_of(Some(source)),
            (None, None) => Code::INTERNAL_ERROR,
        }
    }

    /// This error's own message, without causes.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&serde_json::Value> {
        self.detail.as_ref()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The captured call stack, with frames from this module removed.
    ///
    /// Empty unless backtraces are enabled (`RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`).
    pub fn stack(&self) -> String {
        if self.stack.status() != BacktraceStatus::Captured {
            return String::new();
        }
        filter_frames(&self.stack.to_string())
    }
}

/// Returns the business code carried by `err`.
///
/// Walks the `source()` chain and returns the first explicit code. `None`
/// maps to [`Code::OK`]; errors that carry no code map to
/// [`Code::INTERNAL_ERROR`].
pub fn code_of(err: Option<&(dyn StdError + 'static)>) -> Code {
    let Some(mut current) = err else {
        return Code::OK;
    };
    loop {
        if let Some(own) = current.downcast_ref::<Error>()
            && let Some(code) = own.code
        {
            return code;
        }
        match current.source() {
            Some(next) => current = next,
            None => return Code::INTERNAL_ERROR,
        }
    }
}

fn filter_frames(rendered: &str) -> String {
    let mut frames: Vec<Vec<&str>> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim_start();
        let starts_frame = trimmed
            .split_once(':')
            .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        match frames.last_mut() {
            Some(frame) if !starts_frame => frame.push(line),
            _ => frames.push(vec![line]),
        }
    }

    frames
        .into_iter()
        .filter(|frame| !frame[0].contains("maltose::error::"))
        .flatten()
        .collect::<Vec<_>>()
        .join("\n")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) if self.message.is_empty() => write!(f, "{}", source),
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => f.write_str(&self.message),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Trait for converting domain errors into framework errors.
///
/// Implementing it lets handlers use `?` on domain results.
pub trait IntoError {
    fn into_error(self) -> Error;
}

impl<T: IntoError> From<T> for Error {
    fn from(err: T) -> Self {
        err.into_error()
    }
}

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
