//! Client for the KeePassXC browser protocol.
//!
//! A [`Client`] talks to the running password manager over its local socket
//! (named pipe on Windows). After a Curve25519 key exchange every payload is
//! sealed with XSalsa20-Poly1305, and each reply is bound to its request by
//! nonce. Lock and unlock signals pushed by the daemon reach observers
//! registered on the [`ClientBuilder`].

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod endpoint;
mod engine;
pub mod error;
pub mod message;
pub mod protocol;
pub mod signals;

pub use client::{AssociationCredentials, Client, ClientBuilder};
pub use config::ClientConfig;
pub use endpoint::{DefaultResolver, ResolveEndpoint};
pub use error::{error_code, ClientError};
pub use message::{ErrorResponse, Message};
pub use protocol::{
    AutoTypeRequest, CreateNewGroupRequest, CreateNewGroupResponse, DatabaseGroup,
    DatabaseGroupsResponse, DeleteEntryRequest, GetDatabaseHashResponse, GetLoginsRequest,
    GetLoginsResponse, GetTotpRequest, GetTotpResponse, LoginEntry, LoginKey, SetLoginRequest,
    TestAssociateResponse,
};
pub use signals::{ErrorObserver, LockObserver, Signal};
