//! Channels and the messages posted to them.
//!
//! Authorization is decided by the store, using three roles:
//!
//! - the channel or message **creator** may update and delete it
//! - a **member** may read and post to a channel
//! - anyone may read, post to and join a **public** (non-private) channel
//!
//! A member may also remove themselves; only the creator can add members
//! to a private channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::users::User;
use super::ModelError;

/// Number of messages returned when a channel is opened.
pub const RECENT_MESSAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "creatorID")]
    pub creator_id: String,
    pub members: Vec<String>,
    pub private: bool,
}

impl Channel {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }

    /// Whether `user_id` may read from and post to this channel.
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        !self.private || self.is_member(user_id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewChannel {
    pub name: String,
    pub description: String,
    pub members: Option<Vec<String>>,
    pub private: bool,
}

impl NewChannel {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::validation("channel name must not be empty"));
        }
        Ok(())
    }

    /// Builds the channel record. The creator is always a member.
    pub fn to_channel(&self, creator: &User) -> Channel {
        let mut members = self.members.clone().unwrap_or_default();
        if !members.contains(&creator.id) {
            members.insert(0, creator.id.clone());
        }
        Channel {
            id: Uuid::new_v4().to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: Utc::now(),
            creator_id: creator.id.clone(),
            members,
            private: self.private,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelUpdates {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl ChannelUpdates {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ModelError::validation("channel name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "creatorID")]
    pub creator_id: String,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewMessage {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub body: String,
}

impl NewMessage {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.channel_id.is_empty() {
            return Err(ModelError::validation("channelID must not be empty"));
        }
        if self.body.trim().is_empty() {
            return Err(ModelError::validation("message body must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageUpdates {
    pub body: String,
}

impl MessageUpdates {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.body.trim().is_empty() {
            return Err(ModelError::validation("message body must not be empty"));
        }
        Ok(())
    }
}

/// Storage for channels and messages.
///
/// Every mutating operation takes the acting user and enforces the
/// creator/member/public rules described in the module docs.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Channels `user` can see: public ones plus private ones they belong to.
    async fn user_channels(&self, user: &User) -> Result<Vec<Channel>, ModelError>;

    /// Inserts a channel. Names are unique.
    async fn insert_channel(
        &self,
        new_channel: &NewChannel,
        creator: &User,
    ) -> Result<Channel, ModelError>;

    async fn channel_by_id(&self, id: &str) -> Result<Channel, ModelError>;

    /// The last `limit` messages of a channel, oldest first.
    async fn recent_messages(
        &self,
        channel_id: &str,
        user: &User,
        limit: usize,
    ) -> Result<Vec<Message>, ModelError>;

    async fn update_channel(
        &self,
        channel_id: &str,
        updates: &ChannelUpdates,
        user: &User,
    ) -> Result<Channel, ModelError>;

    /// Deletes a channel and every message posted to it.
    async fn delete_channel(&self, channel_id: &str, user: &User) -> Result<Channel, ModelError>;

    async fn add_member(
        &self,
        channel_id: &str,
        member_id: &str,
        actor: &User,
    ) -> Result<Channel, ModelError>;

    async fn remove_member(
        &self,
        channel_id: &str,
        member_id: &str,
        actor: &User,
    ) -> Result<Channel, ModelError>;

    async fn insert_message(
        &self,
        new_message: &NewMessage,
        creator: &User,
    ) -> Result<Message, ModelError>;

    async fn message_by_id(&self, id: &str) -> Result<Message, ModelError>;

    async fn update_message(
        &self,
        message_id: &str,
        updates: &MessageUpdates,
        user: &User,
    ) -> Result<Message, ModelError>;

    async fn delete_message(&self, message_id: &str, user: &User) -> Result<Message, ModelError>;
}

#[derive(Debug, Default)]
struct Tables {
    channels: Vec<Channel>,
    messages: Vec<Message>,
}

impl Tables {
    fn channel(&self, id: &str) -> Result<&Channel, ModelError> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .ok_or(ModelError::ChannelNotFound)
    }

    fn channel_mut(&mut self, id: &str) -> Result<&mut Channel, ModelError> {
        self.channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(ModelError::ChannelNotFound)
    }

    fn message_mut(&mut self, id: &str) -> Result<&mut Message, ModelError> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(ModelError::MessageNotFound)
    }

    fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.channels
            .iter()
            .any(|c| c.name == name && Some(c.id.as_str()) != except_id)
    }
}

/// In-memory [`MessageStore`].
#[derive(Debug, Clone, Default)]
pub struct MemMessageStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemMessageStore {
    async fn user_channels(&self, user: &User) -> Result<Vec<Channel>, ModelError> {
        let tables = self.tables.read().await;
        Ok(tables
            .channels
            .iter()
            .filter(|c| c.is_visible_to(&user.id))
            .cloned()
            .collect())
    }

    async fn insert_channel(
        &self,
        new_channel: &NewChannel,
        creator: &User,
    ) -> Result<Channel, ModelError> {
        let mut tables = self.tables.write().await;
        if tables.name_taken(&new_channel.name, None) {
            return Err(ModelError::Duplicate("channel name".into()));
        }
        let channel = new_channel.to_channel(creator);
        tables.channels.push(channel.clone());
        debug!(channel_id = %channel.id, creator_id = %creator.id, "Inserted channel");
        Ok(channel)
    }

    async fn channel_by_id(&self, id: &str) -> Result<Channel, ModelError> {
        self.tables.read().await.channel(id).cloned()
    }

    async fn recent_messages(
        &self,
        channel_id: &str,
        user: &User,
        limit: usize,
    ) -> Result<Vec<Message>, ModelError> {
        let tables = self.tables.read().await;
        if !tables.channel(channel_id)?.is_visible_to(&user.id) {
            return Err(ModelError::Unauthorized);
        }
        let in_channel: Vec<&Message> = tables
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .collect();
        let skip = in_channel.len().saturating_sub(limit);
        Ok(in_channel.into_iter().skip(skip).cloned().collect())
    }

    async fn update_channel(
        &self,
        channel_id: &str,
        updates: &ChannelUpdates,
        user: &User,
    ) -> Result<Channel, ModelError> {
        let mut tables = self.tables.write().await;
        if tables.channel(channel_id)?.creator_id != user.id {
            return Err(ModelError::Unauthorized);
        }
        if let Some(name) = &updates.name {
            if tables.name_taken(name, Some(channel_id)) {
                return Err(ModelError::Duplicate("channel name".into()));
            }
        }

        let channel = tables.channel_mut(channel_id)?;
        if let Some(name) = &updates.name {
            channel.name = name.clone();
        }
        if let Some(description) = &updates.description {
            channel.description = description.clone();
        }
        Ok(channel.clone())
    }

    async fn delete_channel(&self, channel_id: &str, user: &User) -> Result<Channel, ModelError> {
        let mut tables = self.tables.write().await;
        let channel = tables.channel(channel_id)?.clone();
        if channel.creator_id != user.id {
            return Err(ModelError::Unauthorized);
        }
        tables.channels.retain(|c| c.id != channel_id);
        tables.messages.retain(|m| m.channel_id != channel_id);
        debug!(channel_id = %channel_id, "Deleted channel and its messages");
        Ok(channel)
    }

    async fn add_member(
        &self,
        channel_id: &str,
        member_id: &str,
        actor: &User,
    ) -> Result<Channel, ModelError> {
        let mut tables = self.tables.write().await;
        let channel = tables.channel_mut(channel_id)?;
        if channel.creator_id != actor.id && channel.private {
            return Err(ModelError::Unauthorized);
        }
        if !channel.is_member(member_id) {
            channel.members.push(member_id.to_string());
        }
        Ok(channel.clone())
    }

    async fn remove_member(
        &self,
        channel_id: &str,
        member_id: &str,
        actor: &User,
    ) -> Result<Channel, ModelError> {
        let mut tables = self.tables.write().await;
        let channel = tables.channel_mut(channel_id)?;
        if channel.creator_id != actor.id && member_id != actor.id {
            return Err(ModelError::Unauthorized);
        }
        channel.members.retain(|m| m != member_id);
        Ok(channel.clone())
    }

    async fn insert_message(
        &self,
        new_message: &NewMessage,
        creator: &User,
    ) -> Result<Message, ModelError> {
        let mut tables = self.tables.write().await;
        if !tables
            .channel(&new_message.channel_id)?
            .is_visible_to(&creator.id)
        {
            return Err(ModelError::Unauthorized);
        }
        let message = Message {
            id: Uuid::new_v4().to_string(),
            channel_id: new_message.channel_id.clone(),
            body: new_message.body.clone(),
            created_at: Utc::now(),
            creator_id: creator.id.clone(),
            edited_at: None,
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn message_by_id(&self, id: &str) -> Result<Message, ModelError> {
        self.tables
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(ModelError::MessageNotFound)
    }

    async fn update_message(
        &self,
        message_id: &str,
        updates: &MessageUpdates,
        user: &User,
    ) -> Result<Message, ModelError> {
        let mut tables = self.tables.write().await;
        let message = tables.message_mut(message_id)?;
        if message.creator_id != user.id {
            return Err(ModelError::Unauthorized);
        }
        message.body = updates.body.clone();
        message.edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn delete_message(&self, message_id: &str, user: &User) -> Result<Message, ModelError> {
        let mut tables = self.tables.write().await;
        let message = tables.message_mut(message_id)?.clone();
        if message.creator_id != user.id {
            return Err(ModelError::Unauthorized);
        }
        tables.messages.retain(|m| m.id != message_id);
        Ok(message)
    }
}
