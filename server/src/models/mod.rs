//! Users, channels and messages.
//!
//! The store traits here are the seam between request handlers and whatever
//! database holds the records. In-memory implementations ship with the crate
//! so the server runs stand-alone and handlers can be tested without a
//! database.

pub mod messages;
pub mod users;

use thiserror::Error;

/// Errors returned by the user and message stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("user not found")]
    UserNotFound,

    #[error("channel not found")]
    ChannelNotFound,

    #[error("message not found")]
    MessageNotFound,

    /// A unique field (email, user name, channel name) is already taken.
    #[error("{0} already exists")]
    Duplicate(String),

    /// The acting user may not perform this operation.
    #[error("user unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),
}

impl ModelError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true for any of the not-found variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UserNotFound | Self::ChannelNotFound | Self::MessageNotFound
        )
    }
}
