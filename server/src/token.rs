//! Signed bearer tokens.
//!
//! A [`SignedToken`] is 32 bytes of operating-system randomness followed by an
//! HMAC-SHA256 tag computed over those bytes with the server's
//! [`SigningKey`]. The 64-byte buffer is base64-url encoded without padding,
//! producing an 86 character string that is safe to carry in an
//! `Authorization` header, a URL, or an email body.
//!
//! Tokens are capabilities, not records: they carry no state of their own.
//! Session data is looked up by token in a [`StateStore`](crate::session::store::StateStore).
//!
//! # Example
//!
//! ```rust
//! use piper_server::token::{SignedToken, SigningKey};
//!
//! let key = SigningKey::new("correct horse battery staple");
//! let token = SignedToken::mint(&key).expect("os randomness available");
//!
//! let parsed = SignedToken::parse(token.as_str(), &key).expect("token verifies");
//! assert_eq!(parsed, token);
//!
//! let other_key = SigningKey::new("a different secret");
//! assert!(SignedToken::parse(token.as_str(), &other_key).is_err());
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes at the start of every token.
pub const TOKEN_BYTES: usize = 32;

/// Length of the HMAC-SHA256 tag appended to the random bytes.
pub const TAG_BYTES: usize = 32;

/// Total decoded length of a signed token.
pub const SIGNED_BYTES: usize = TOKEN_BYTES + TAG_BYTES;

/// Length of the base64-url (unpadded) text form of a signed token.
pub const TOKEN_TEXT_LENGTH: usize = 86;

/// Errors produced while minting or parsing tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The operating system's secure random source failed.
    #[error("secure random source unavailable: {0}")]
    RandomSource(String),

    /// The text is not base64-url or does not decode to the signed length.
    #[error("invalid token format")]
    InvalidFormat,

    /// The trailing tag does not match the random bytes under this key.
    #[error("invalid token signature")]
    InvalidSignature,
}

/// Secret used to sign and verify tokens.
///
/// Cloning is cheap; all clones share one zeroize-on-drop buffer.
#[derive(Clone)]
pub struct SigningKey {
    secret: Arc<Zeroizing<Vec<u8>>>,
}

impl SigningKey {
    /// Creates a signing key from the configured secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::new(Zeroizing::new(secret.as_ref().to_vec())),
        }
    }

    fn tag(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload);
        mac
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("len", &self.secret.len())
            .finish_non_exhaustive()
    }
}

/// An unguessable, tamper-evident bearer credential.
///
/// Equality compares the decoded bytes in constant time.
#[derive(Clone)]
pub struct SignedToken {
    bytes: [u8; SIGNED_BYTES],
    text: String,
}

impl SignedToken {
    /// Mints a new token signed with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::RandomSource`] if the operating system cannot
    /// supply random bytes. This is the only failure mode.
    pub fn mint(key: &SigningKey) -> Result<Self, TokenError> {
        let mut bytes = [0u8; SIGNED_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes[..TOKEN_BYTES])
            .map_err(|err| TokenError::RandomSource(err.to_string()))?;

        let tag = key.tag(&bytes[..TOKEN_BYTES]).finalize().into_bytes();
        bytes[TOKEN_BYTES..].copy_from_slice(&tag);

        Ok(Self::from_bytes(bytes))
    }

    /// Parses and verifies the text form of a token.
    ///
    /// # Errors
    ///
    /// - [`TokenError::InvalidFormat`] if the text is not unpadded base64-url
    ///   or decodes to the wrong length
    /// - [`TokenError::InvalidSignature`] if the tag does not verify under `key`
    pub fn parse(text: &str, key: &SigningKey) -> Result<Self, TokenError> {
        if text.len() != TOKEN_TEXT_LENGTH {
            return Err(TokenError::InvalidFormat);
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|_| TokenError::InvalidFormat)?;
        let bytes: [u8; SIGNED_BYTES] = decoded
            .try_into()
            .map_err(|_| TokenError::InvalidFormat)?;

        // verify_slice compares in constant time
        key.tag(&bytes[..TOKEN_BYTES])
            .verify_slice(&bytes[TOKEN_BYTES..])
            .map_err(|_| TokenError::InvalidSignature)?;

        Ok(Self::from_bytes(bytes))
    }

    fn from_bytes(bytes: [u8; SIGNED_BYTES]) -> Self {
        let text = URL_SAFE_NO_PAD.encode(bytes);
        Self { bytes, text }
    }

    /// Returns the text form, suitable for headers and storage keys.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for SignedToken {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for SignedToken {}

impl Hash for SignedToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignedToken(<redacted>)")
    }
}
