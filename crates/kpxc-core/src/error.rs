use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::message::ErrorResponse;

/// Every failure a [`Client`](crate::Client) operation or an async-error
/// observer can see.
///
/// The type is `Clone` so a single transport failure can be handed to every
/// pending exchange and every observer.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Io(Arc<io::Error>),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("client is closing")]
    Closing,

    /// The reply nonce is not the increment of the request nonce.
    #[error("invalid nonce in response")]
    InvalidNonce,

    /// Authenticated decryption failed (tampering, stale shared key or corruption).
    #[error("response decrypt failed")]
    DecryptFailed,

    #[error(transparent)]
    Daemon(#[from] ErrorResponse),

    /// The operation needs association credentials and none are set.
    #[error("not associated")]
    NotAssociated,

    #[error("handshake not completed")]
    HandshakeIncomplete,

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("request timed out")]
    Timeout,

    #[error("endpoint lookup failed: {0}")]
    Endpoint(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl ClientError {
    /// Numeric code of a daemon-reported error, if this is one.
    pub fn daemon_code(&self) -> Option<i64> {
        match self {
            Self::Daemon(resp) => Some(resp.code),
            _ => None,
        }
    }

    /// True for failures that leave the connection unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed | Self::Closing)
    }
}

/// Error codes reported by the daemon in the `errorCode` field.
pub mod error_code {
    pub const DATABASE_NOT_OPENED: i64 = 1;
    pub const DATABASE_HASH_NOT_RECEIVED: i64 = 2;
    pub const CLIENT_PUBLIC_KEY_NOT_RECEIVED: i64 = 3;
    pub const CANNOT_DECRYPT_MESSAGE: i64 = 4;
    pub const TIMEOUT_OR_NOT_CONNECTED: i64 = 5;
    pub const ACTION_CANCELLED_OR_DENIED: i64 = 6;
    pub const CANNOT_ENCRYPT_MESSAGE: i64 = 7;
    pub const ASSOCIATION_FAILED: i64 = 8;
    pub const KEY_CHANGE_FAILED: i64 = 9;
    pub const ENCRYPTION_KEY_UNRECOGNIZED: i64 = 10;
    pub const NO_SAVED_DATABASES_FOUND: i64 = 11;
    pub const INCORRECT_ACTION: i64 = 12;
    pub const EMPTY_MESSAGE_RECEIVED: i64 = 13;
    pub const NO_URL_PROVIDED: i64 = 14;
    pub const NO_LOGINS_FOUND: i64 = 15;
    pub const NO_GROUPS_FOUND: i64 = 16;
    pub const CANNOT_CREATE_NEW_GROUP: i64 = 17;
    pub const NO_VALID_UUID_PROVIDED: i64 = 18;
    pub const ACCESS_TO_ALL_ENTRIES_DENIED: i64 = 19;
}
