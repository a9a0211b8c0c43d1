//! User accounts.
//!
//! Passwords are hashed with bcrypt on tokio's blocking pool; the hash is
//! kept on [`User`] but is never serialised, so a `User` can be sent to
//! clients or broadcast as-is.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::ModelError;

/// Base URL for Gravatar profile photos.
pub const GRAVATAR_BASE_URL: &str = "https://www.gravatar.com/avatar/";

/// Shortest password accepted at sign-up or reset.
pub const MIN_PASSWORD_LENGTH: usize = 6;

/// bcrypt cost used when none is configured.
pub const DEFAULT_BCRYPT_COST: u32 = 13;

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: String,
    #[serde(skip)]
    pass_hash: String,
}

impl User {
    /// Replaces the password hash with a hash of `password`.
    pub async fn set_password(&mut self, password: String, cost: u32) -> Result<(), ModelError> {
        self.pass_hash = hash_password(password, cost).await?;
        Ok(())
    }

    /// Checks `password` against the stored hash.
    ///
    /// Returns `Ok(false)` for a wrong password; errors only if the stored
    /// hash is unusable.
    pub async fn authenticate(&self, password: String) -> Result<bool, ModelError> {
        if self.pass_hash.is_empty() {
            return Ok(false);
        }
        let hash = self.pass_hash.clone();
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|err| ModelError::PasswordHash(err.to_string()))?
            .map_err(|err| ModelError::PasswordHash(err.to_string()))
    }

    pub fn pass_hash(&self) -> &str {
        &self.pass_hash
    }
}

/// Hashes `password` with bcrypt at `cost`.
pub async fn hash_password(password: String, cost: u32) -> Result<String, ModelError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| ModelError::PasswordHash(err.to_string()))?
        .map_err(|err| ModelError::PasswordHash(err.to_string()))
}

/// Gravatar photo URL for `email`.
pub fn gravatar_url(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{GRAVATAR_BASE_URL}{}", hex::encode(digest))
}

/// Checks a new password and its confirmation.
pub fn validate_password(password: &str, password_conf: &str) -> Result<(), ModelError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ModelError::validation(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    if password != password_conf {
        return Err(ModelError::validation(
            "password and passwordConf do not match",
        ));
    }
    Ok(())
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// Sign-in credentials.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// A sign-up request.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub password_conf: String,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
}

impl NewUser {
    /// Checks the fields a new account needs.
    pub fn validate(&self) -> Result<(), ModelError> {
        if !is_valid_email(&self.email) {
            return Err(ModelError::validation("email address is not valid"));
        }
        validate_password(&self.password, &self.password_conf)?;
        if self.user_name.trim().is_empty() {
            return Err(ModelError::validation("userName must not be empty"));
        }
        Ok(())
    }

    /// Builds the account record, assigning an id and hashing the password.
    pub async fn to_user(&self, cost: u32) -> Result<User, ModelError> {
        let mut user = User {
            id: Uuid::new_v4().to_string(),
            email: self.email.clone(),
            user_name: self.user_name.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            photo_url: gravatar_url(&self.email),
            pass_hash: String::new(),
        };
        user.set_password(self.password.clone(), cost).await?;
        Ok(user)
    }
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("email", &self.email)
            .field("user_name", &self.user_name)
            .finish_non_exhaustive()
    }
}

/// Profile fields a user may change about themselves.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdates {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl UserUpdates {
    pub fn apply(&self, user: &mut User) {
        if let Some(first_name) = &self.first_name {
            user.first_name = first_name.clone();
        }
        if let Some(last_name) = &self.last_name {
            user.last_name = last_name.clone();
        }
    }
}

/// Storage for user accounts.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<User>, ModelError>;

    async fn get_by_id(&self, id: &str) -> Result<User, ModelError>;

    async fn get_by_email(&self, email: &str) -> Result<User, ModelError>;

    async fn get_by_user_name(&self, user_name: &str) -> Result<User, ModelError>;

    /// Inserts `user`. Email and user name must both be unused.
    async fn insert(&self, user: User) -> Result<User, ModelError>;

    /// Applies `updates` to the user with `id` and returns the result.
    async fn update(&self, id: &str, updates: &UserUpdates) -> Result<User, ModelError>;

    /// Replaces the password hash of the user with `email`.
    async fn reset_password(&self, email: &str, pass_hash: String) -> Result<(), ModelError>;
}

/// In-memory [`UserStore`].
#[derive(Debug, Clone, Default)]
pub struct MemUserStore {
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl MemUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemUserStore {
    async fn get_all(&self) -> Result<Vec<User>, ModelError> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        Ok(users)
    }

    async fn get_by_id(&self, id: &str) -> Result<User, ModelError> {
        self.users
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(ModelError::UserNotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User, ModelError> {
        self.users
            .read()
            .await
            .values()
            .find(|user| user.email == email)
            .cloned()
            .ok_or(ModelError::UserNotFound)
    }

    async fn get_by_user_name(&self, user_name: &str) -> Result<User, ModelError> {
        self.users
            .read()
            .await
            .values()
            .find(|user| user.user_name == user_name)
            .cloned()
            .ok_or(ModelError::UserNotFound)
    }

    async fn insert(&self, user: User) -> Result<User, ModelError> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == user.email) {
            return Err(ModelError::Duplicate("email".into()));
        }
        if users.values().any(|u| u.user_name == user.user_name) {
            return Err(ModelError::Duplicate("userName".into()));
        }
        users.insert(user.id.clone(), user.clone());
        debug!(user_id = %user.id, "Inserted user");
        Ok(user)
    }

    async fn update(&self, id: &str, updates: &UserUpdates) -> Result<User, ModelError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(id).ok_or(ModelError::UserNotFound)?;
        updates.apply(user);
        Ok(user.clone())
    }

    async fn reset_password(&self, email: &str, pass_hash: String) -> Result<(), ModelError> {
        let mut users = self.users.write().await;
        let user = users
            .values_mut()
            .find(|user| user.email == email)
            .ok_or(ModelError::UserNotFound)?;
        user.pass_hash = pass_hash;
        Ok(())
    }
}
