//! Channels, memberships and messages.
//!
//! Authorization lives in the [`MessageStore`](crate::models::messages::MessageStore);
//! these handlers authenticate, decode, call the store and announce the
//! result.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::LINK, HeaderMap, StatusCode},
    Json,
};
use tracing::{debug, info};

use super::{authenticate, parse_json, AppState, StatusMessage};
use crate::error::Result;
use crate::models::messages::{
    Channel, ChannelUpdates, Message, MessageUpdates, NewChannel, NewMessage,
    RECENT_MESSAGE_LIMIT,
};
use crate::models::users::User;
use crate::types::{ChannelRef, Event, Membership, MessageRef};

// ============================================================================
// Channels
// ============================================================================

/// GET /v1/channels - Channels visible to the caller.
pub(super) async fn get_channels(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Channel>>> {
    let (_, session) = authenticate(&state, &headers).await?;
    Ok(Json(state.messages.user_channels(&session.user).await?))
}

/// POST /v1/channels - Create a channel owned by the caller.
pub(super) async fn post_channels(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Channel>)> {
    let (_, session) = authenticate(&state, &headers).await?;
    let new_channel: NewChannel = parse_json(&body)?;
    new_channel.validate()?;

    let channel = state
        .messages
        .insert_channel(&new_channel, &session.user)
        .await?;
    info!(channel_id = %channel.id, user_id = %session.user.id, "Channel created");

    state.publish(Event::NewChannel(channel.clone())).await;
    Ok((StatusCode::CREATED, Json(channel)))
}

/// GET /v1/channels/{id} - The most recent messages, oldest first.
pub(super) async fn get_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>> {
    let (_, session) = authenticate(&state, &headers).await?;
    let messages = state
        .messages
        .recent_messages(&channel_id, &session.user, RECENT_MESSAGE_LIMIT)
        .await?;
    Ok(Json(messages))
}

/// PATCH /v1/channels/{id} - Rename or redescribe. Creator only.
pub(super) async fn patch_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Channel>> {
    let (_, session) = authenticate(&state, &headers).await?;
    let updates: ChannelUpdates = parse_json(&body)?;
    updates.validate()?;

    let channel = state
        .messages
        .update_channel(&channel_id, &updates, &session.user)
        .await?;
    debug!(channel_id = %channel.id, "Channel updated");

    state.publish(Event::UpdateChannel(channel.clone())).await;
    Ok(Json(channel))
}

/// DELETE /v1/channels/{id} - Delete with all its messages. Creator only.
pub(super) async fn delete_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusMessage>> {
    let (_, session) = authenticate(&state, &headers).await?;
    let channel = state
        .messages
        .delete_channel(&channel_id, &session.user)
        .await?;
    info!(channel_id = %channel.id, "Channel deleted");

    state
        .publish(Event::DeleteChannel(ChannelRef {
            channel_id: channel.id,
        }))
        .await;
    Ok(StatusMessage::new("channel deleted"))
}

// ============================================================================
// Members
// ============================================================================

/// The user a membership request is about: the id in the `Link` header, or
/// the caller when there is none.
async fn member_for(state: &AppState, headers: &HeaderMap, caller: &User) -> Result<User> {
    let linked = headers
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match linked {
        Some(id) if id != caller.id => Ok(state.users.get_by_id(id).await?),
        _ => Ok(caller.clone()),
    }
}

/// POST /v1/channels/{id}/members - Add the caller, or the `Link` user.
///
/// Anyone may join a public channel; only the creator may add members to a
/// private one.
pub(super) async fn post_member(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Channel>> {
    let (_, session) = authenticate(&state, &headers).await?;
    let member = member_for(&state, &headers, &session.user).await?;

    let channel = state
        .messages
        .add_member(&channel_id, &member.id, &session.user)
        .await?;
    debug!(channel_id = %channel.id, member_id = %member.id, "Member added");

    state
        .publish(Event::UserJoinedChannel(Membership {
            channel_id: channel.id.clone(),
            user: member,
        }))
        .await;
    Ok(Json(channel))
}

/// DELETE /v1/channels/{id}/members - Remove the caller, or the `Link` user.
///
/// Members may leave; the creator may remove anyone.
pub(super) async fn delete_member(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Channel>> {
    let (_, session) = authenticate(&state, &headers).await?;
    let member = member_for(&state, &headers, &session.user).await?;

    let channel = state
        .messages
        .remove_member(&channel_id, &member.id, &session.user)
        .await?;
    debug!(channel_id = %channel.id, member_id = %member.id, "Member removed");

    state
        .publish(Event::UserLeftChannel(Membership {
            channel_id: channel.id.clone(),
            user: member,
        }))
        .await;
    Ok(Json(channel))
}

// ============================================================================
// Messages
// ============================================================================

/// POST /v1/messages - Post to a channel the caller can see.
pub(super) async fn post_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Message>)> {
    let (_, session) = authenticate(&state, &headers).await?;
    let new_message: NewMessage = parse_json(&body)?;
    new_message.validate()?;

    let message = state
        .messages
        .insert_message(&new_message, &session.user)
        .await?;
    debug!(message_id = %message.id, channel_id = %message.channel_id, "Message posted");

    state.publish(Event::NewMessage(message.clone())).await;
    Ok((StatusCode::CREATED, Json(message)))
}

/// PATCH /v1/messages/{id} - Edit. Creator only.
pub(super) async fn patch_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Message>> {
    let (_, session) = authenticate(&state, &headers).await?;
    let updates: MessageUpdates = parse_json(&body)?;
    updates.validate()?;

    let message = state
        .messages
        .update_message(&message_id, &updates, &session.user)
        .await?;

    state.publish(Event::UpdateMessage(message.clone())).await;
    Ok(Json(message))
}

/// DELETE /v1/messages/{id} - Delete. Creator only.
pub(super) async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusMessage>> {
    let (_, session) = authenticate(&state, &headers).await?;
    let message = state
        .messages
        .delete_message(&message_id, &session.user)
        .await?;

    state
        .publish(Event::DeleteMessage(MessageRef {
            message_id: message.id,
            channel_id: message.channel_id,
        }))
        .await;
    Ok(StatusMessage::new("message deleted"))
}
