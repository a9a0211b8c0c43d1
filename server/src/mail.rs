//! Outbound delivery of password reset codes.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::token::SignedToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailError {
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

/// Sends reset codes to account holders.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_reset_code(&self, to: &str, code: &SignedToken) -> Result<(), MailError>;
}

/// Logs that a reset code was issued. The code itself is never logged.
///
/// Stands in for SMTP delivery in development and tests.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_reset_code(&self, to: &str, _code: &SignedToken) -> Result<(), MailError> {
        info!(recipient = %to, "Password reset code issued");
        Ok(())
    }
}
