//! Password reset.
//!
//! `POST /v1/resetcodes` mints a [`SignedToken`] as a one-time code, stores
//! it under the account email for the reset TTL and mails it. `PUT
//! /v1/passwords/{email}` checks a submitted code against the stored one and,
//! on a match, removes the code and then replaces the password.

use std::fmt;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{parse_json, AppState, StatusMessage};
use crate::error::{Result, ServerError};
use crate::models::users::{hash_password, validate_password};
use crate::token::{SignedToken, SigningKey};

/// Body of `POST /v1/resetcodes`.
#[derive(Debug, Deserialize)]
struct ResetRequest {
    email: String,
}

/// Body of `PUT /v1/passwords/{email}`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordReset {
    #[serde(alias = "token")]
    code: String,
    password: String,
    password_conf: String,
}

impl fmt::Debug for PasswordReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordReset").finish_non_exhaustive()
    }
}

/// POST /v1/resetcodes - Issue a reset code.
///
/// Answers `202 Accepted` whether or not the email belongs to an account,
/// so the endpoint cannot be used to discover accounts.
pub(super) async fn post_resetcodes(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode> {
    let request: ResetRequest = parse_json(&body)?;

    match state.users.get_by_email(&request.email).await {
        Ok(_) => {}
        Err(err) if err.is_not_found() => {
            debug!("Reset requested for unknown email");
            return Ok(StatusCode::ACCEPTED);
        }
        Err(err) => return Err(err.into()),
    }

    let code = SignedToken::mint(&state.config.session_key)?;
    state
        .resets
        .save(&request.email, code.as_str().to_string())
        .await
        .map_err(|err| ServerError::internal(err.to_string()))?;
    state.mailer.send_reset_code(&request.email, &code).await?;

    info!(recipient = %request.email, "Reset code issued");
    Ok(StatusCode::ACCEPTED)
}

/// PUT /v1/passwords/{email} - Redeem a reset code.
///
/// # Responses
///
/// - `200 OK` - Password replaced; the code can no longer be used
/// - `400 Bad Request` - New password invalid or not confirmed
/// - `401 Unauthorized` - Code forged, expired, already used or not the latest
pub(super) async fn put_password(
    State(state): State<AppState>,
    Path(email): Path<String>,
    body: Bytes,
) -> Result<Json<StatusMessage>> {
    let reset: PasswordReset = parse_json(&body)?;
    let key = &state.config.session_key;

    let submitted = SignedToken::parse(&reset.code, key).map_err(|_| {
        debug!("Reset code failed verification");
        ServerError::unauthorized("invalid reset code")
    })?;

    let stored = match state.resets.get(&email).await {
        Ok(stored) => stored,
        Err(err) if err.is_not_found() => {
            debug!("No outstanding reset code");
            return Err(ServerError::unauthorized("invalid reset code"));
        }
        Err(err) => return Err(ServerError::internal(err.to_string())),
    };
    if !matches_code(&submitted, &stored, key) {
        debug!("Reset code does not match");
        return Err(ServerError::unauthorized("invalid reset code"));
    }

    validate_password(&reset.password, &reset.password_conf)?;

    // Claim the code before touching the password. Of two concurrent
    // redemptions only one can take it, and a code replaced since the read
    // above no longer matches.
    let claimed = match state.resets.take(&email).await {
        Ok(claimed) => claimed,
        Err(err) if err.is_not_found() => {
            debug!("Reset code already redeemed");
            return Err(ServerError::unauthorized("invalid reset code"));
        }
        Err(err) => return Err(ServerError::internal(err.to_string())),
    };
    if !matches_code(&submitted, &claimed, key) {
        debug!("Reset code replaced during redemption");
        return Err(ServerError::unauthorized("invalid reset code"));
    }

    let pass_hash = hash_password(reset.password, state.config.bcrypt_cost).await?;
    state.users.reset_password(&email, pass_hash).await?;

    info!(recipient = %email, "Password reset");
    Ok(StatusMessage::new("password reset"))
}

/// Whether `stored` is a genuine code equal to `submitted`.
fn matches_code(submitted: &SignedToken, stored: &str, key: &SigningKey) -> bool {
    match SignedToken::parse(stored, key) {
        // SignedToken equality is constant-time.
        Ok(stored) => *submitted == stored,
        Err(_) => {
            warn!("Stored reset code failed verification");
            false
        }
    }
}
