//! Accounts and sessions.

use axum::{
    body::Bytes,
    extract::State,
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, info};

use super::{authenticate, client_addr, parse_json, AppState, StatusMessage};
use crate::error::{Result, ServerError};
use crate::models::users::{Credentials, NewUser, User, UserUpdates};
use crate::models::ModelError;
use crate::session::{self, SessionState};
use crate::types::Event;

/// Starts a session for `user` and builds the response carrying its token.
async fn respond_with_session(
    state: &AppState,
    user: User,
    addr: String,
    status: StatusCode,
) -> Result<Response> {
    let session_state = SessionState::new(user.clone(), addr);
    let token = session::begin_session(
        &state.config.session_key,
        state.sessions.as_ref(),
        &session_state,
    )
    .await?;
    let authorization = session::authorization_header(&token)?;
    Ok((status, [authorization], Json(user)).into_response())
}

/// POST /v1/users - Sign up.
///
/// Creates the account, signs it in and announces it with `NEW_USER`.
///
/// # Responses
///
/// - `201 Created` - The new user, with the session token in `Authorization`
/// - `400 Bad Request` - Invalid fields, or email/user name already taken
pub(super) async fn post_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Result<Response> {
    let new_user: NewUser = parse_json(&body)?;
    new_user.validate()?;

    let user = new_user.to_user(state.config.bcrypt_cost).await?;
    let user = state.users.insert(user).await?;
    info!(user_id = %user.id, "User signed up");

    // The account exists from here on, even if the session below fails.
    state.publish(Event::NewUser(user.clone())).await;

    respond_with_session(
        &state,
        user,
        client_addr(&headers, &extensions),
        StatusCode::CREATED,
    )
    .await
}

/// GET /v1/users - Every account.
pub(super) async fn get_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.users.get_all().await?))
}

/// GET /v1/users/me - The caller's session state.
pub(super) async fn get_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionState>> {
    let (_, session) = authenticate(&state, &headers).await?;
    Ok(Json(session))
}

/// PATCH /v1/users/me - Update the caller's names.
///
/// The session's copy of the user is written back so later requests see
/// the change.
pub(super) async fn patch_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<User>> {
    let (token, mut session) = authenticate(&state, &headers).await?;
    let updates: UserUpdates = parse_json(&body)?;

    let user = state.users.update(&session.user.id, &updates).await?;
    session.user = user.clone();
    session::save_state(&token, state.sessions.as_ref(), &session).await?;

    debug!(user_id = %user.id, "User profile updated");
    Ok(Json(user))
}

/// POST /v1/sessions - Sign in.
///
/// # Responses
///
/// - `200 OK` - The user, with a fresh session token in `Authorization`
/// - `401 Unauthorized` - Unknown email or wrong password
pub(super) async fn post_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Result<Response> {
    let credentials: Credentials = parse_json(&body)?;

    let user = match state.users.get_by_email(&credentials.email).await {
        Ok(user) => user,
        Err(ModelError::UserNotFound) => {
            debug!("Sign-in for unknown email");
            return Err(ServerError::unauthorized("invalid credentials"));
        }
        Err(err) => return Err(err.into()),
    };

    if !user.authenticate(credentials.password).await? {
        debug!(user_id = %user.id, "Sign-in with wrong password");
        return Err(ServerError::unauthorized("invalid credentials"));
    }

    info!(user_id = %user.id, "User signed in");
    respond_with_session(
        &state,
        user,
        client_addr(&headers, &extensions),
        StatusCode::OK,
    )
    .await
}

/// DELETE /v1/sessions/mine - Sign out.
pub(super) async fn delete_session_mine(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusMessage>> {
    session::end_session(&headers, &state.config.session_key, state.sessions.as_ref()).await?;
    Ok(StatusMessage::new("user signed out"))
}
