//! Events pushed to connected clients.
//!
//! Every event goes over the wire as a JSON object with a `type` tag and a
//! `data` payload:
//!
//! ```json
//! {"type": "NEW_MESSAGE", "data": {"id": "...", "channelID": "...", "body": "hi", ...}}
//! ```
//!
//! Events are immutable once created.

use serde::Serialize;

use crate::models::messages::{Channel, Message};
use crate::models::users::User;

/// A change clients should learn about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    NewUser(User),
    NewChannel(Channel),
    UpdateChannel(Channel),
    DeleteChannel(ChannelRef),
    UserJoinedChannel(Membership),
    UserLeftChannel(Membership),
    NewMessage(Message),
    UpdateMessage(Message),
    DeleteMessage(MessageRef),
}

impl Event {
    /// The wire tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewUser(_) => "NEW_USER",
            Self::NewChannel(_) => "NEW_CHANNEL",
            Self::UpdateChannel(_) => "UPDATE_CHANNEL",
            Self::DeleteChannel(_) => "DELETE_CHANNEL",
            Self::UserJoinedChannel(_) => "USER_JOINED_CHANNEL",
            Self::UserLeftChannel(_) => "USER_LEFT_CHANNEL",
            Self::NewMessage(_) => "NEW_MESSAGE",
            Self::UpdateMessage(_) => "UPDATE_MESSAGE",
            Self::DeleteMessage(_) => "DELETE_MESSAGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRef {
    #[serde(rename = "channelID")]
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRef {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
}
