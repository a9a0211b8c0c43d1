//! Error types for the Piper server.
//!
//! Each module owns a `thiserror` enum for its own failures
//! ([`TokenError`], [`StoreError`], [`SessionError`], [`ModelError`],
//! [`MailError`], [`ConfigError`]). Request handlers return [`ServerError`],
//! which every module error converts into and which renders as a JSON
//! response:
//!
//! ```json
//! {"error": "authorization scheme must be Bearer", "code": "bad_scheme"}
//! ```
//!
//! # Status codes
//!
//! | Error | Status |
//! |---|---|
//! | missing `Authorization` header, non-Bearer scheme | 400 |
//! | invalid bearer token, unknown or expired session, bad credentials | 401 |
//! | validation failure, duplicate name or email | 400 |
//! | acting user not allowed (creator/member rules) | 403 |
//! | unknown user, channel or message | 404 |
//! | random source, store, hashing or mail failure | 500 |

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tracing::{debug, error};

use crate::mail::MailError;
use crate::models::ModelError;
use crate::session::store::StoreError;
use crate::session::SessionError;
use crate::token::TokenError;

/// Errors that occur during configuration loading and validation.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required configuration value is missing.
    #[error("missing required configuration: {0}")]
    Missing(String),

    /// A configuration value failed to parse or is invalid.
    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid {
        /// The configuration key that has an invalid value.
        key: String,
        /// Description of why the value is invalid.
        reason: String,
    },
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing(key.into())
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type returned by request handlers.
#[derive(Debug)]
pub enum ServerError {
    /// Bearer authentication failed.
    Session(SessionError),

    /// Sign-in or reset credentials were rejected.
    Unauthorized(String),

    /// The acting user may not perform the operation.
    Forbidden(String),

    /// The named resource does not exist.
    NotFound(String),

    /// The request body or parameters are invalid.
    Validation(String),

    /// A unique field is already taken.
    Duplicate(String),

    /// Unexpected failure. The message is logged, never sent to clients.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(err) => write!(f, "{err}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Duplicate(what) => write!(f, "{what} already exists"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Session(err) => Some(err),
            _ => None,
        }
    }
}

impl ServerError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Session(err) => match err {
                SessionError::NoHeader | SessionError::BadScheme => StatusCode::BAD_REQUEST,
                SessionError::InvalidToken(_) | SessionError::NotFound => StatusCode::UNAUTHORIZED,
                SessionError::Mint(_) | SessionError::Serialization(_) | SessionError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::Duplicate(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Session(err) => match err {
                SessionError::NoHeader => "no_header",
                SessionError::BadScheme => "bad_scheme",
                SessionError::InvalidToken(_) => "invalid_token",
                SessionError::NotFound => "session_not_found",
                _ => "internal",
            },
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Duplicate(_) => "duplicate",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }
}

impl From<SessionError> for ServerError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<ModelError> for ServerError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::UserNotFound => Self::not_found("user"),
            ModelError::ChannelNotFound => Self::not_found("channel"),
            ModelError::MessageNotFound => Self::not_found("message"),
            ModelError::Duplicate(what) => Self::Duplicate(what),
            ModelError::Unauthorized => Self::forbidden("operation not permitted for this user"),
            ModelError::Validation(msg) => Self::Validation(msg),
            ModelError::PasswordHash(msg) => Self::Internal(msg),
        }
    }
}

impl From<TokenError> for ServerError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::RandomSource(_) => Self::Internal(err.to_string()),
            other => Self::Session(SessionError::InvalidToken(other)),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Session(SessionError::from(err))
    }
}

impl From<MailError> for ServerError {
    fn from(err: MailError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// JSON error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "internal server error".to_string()
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse::new(message).with_code(self.code())),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
