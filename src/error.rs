//! Handler errors and the JSON error body.
//!
//! Every handler returns `Result<(), Error>`. Whatever comes back as `Err` is
//! turned into a response by the router's error handler: an [`HttpError`]
//! keeps its own status, anything else becomes `400 Bad Request`.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::binder::BindError;
use crate::http::StatusCode;

/// An error carrying an explicit HTTP status and a client-facing message.
///
/// # Examples
///
/// ```
/// use teta::{HttpError, StatusCode};
///
/// let err = HttpError::new(StatusCode::NotFound, "item 7 not found");
/// assert_eq!(err.code(), StatusCode::NotFound);
/// assert_eq!(err.to_string(), "item 7 not found");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    code: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// The JSON body written for every handled error: `{"message": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorMessage<'a> {
    pub message: &'a str,
}

/// Everything a handler or middleware may fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),

    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Builds an uncategorised error from any displayable value.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Message(message.to_string())
    }

    /// Resolves the status and message the error handler writes.
    ///
    /// [`HttpError`]s keep their own code; everything else maps to
    /// `400 Bad Request` with the error's display text.
    pub fn into_http(self) -> HttpError {
        match self {
            Self::Http(err) => err,
            other => HttpError::new(StatusCode::BadRequest, other.to_string()),
        }
    }
}

/// Result type returned by handlers.
pub type HandlerResult = Result<(), Error>;
