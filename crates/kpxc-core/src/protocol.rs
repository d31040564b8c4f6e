//! Typed request and response payloads.
//!
//! Payloads travel sealed inside [`Message::message`](crate::Message). The
//! daemon checks that the decrypted payload carries the same `action` as the
//! envelope, so [`to_plaintext`] injects it into every serialised request.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::message::{base64_bytes, string_bool, ErrorFields};

pub mod action {
    pub const CHANGE_PUBLIC_KEYS: &str = "change-public-keys";
    pub const GET_DATABASE_HASH: &str = "get-databasehash";
    pub const ASSOCIATE: &str = "associate";
    pub const TEST_ASSOCIATE: &str = "test-associate";
    pub const GET_DATABASE_GROUPS: &str = "get-database-groups";
    pub const CREATE_NEW_GROUP: &str = "create-new-group";
    pub const GET_LOGINS: &str = "get-logins";
    pub const SET_LOGIN: &str = "set-login";
    pub const DELETE_ENTRY: &str = "delete-entry";
    pub const GENERATE_PASSWORD: &str = "generate-password";
    pub const LOCK_DATABASE: &str = "lock-database";
    pub const GET_TOTP: &str = "get-totp";
    pub const REQUEST_AUTOTYPE: &str = "request-autotype";
    pub const DATABASE_LOCKED: &str = "database-locked";
    pub const DATABASE_UNLOCKED: &str = "database-unlocked";
}

/// A payload sent sealed under the shared key.
pub trait PlainRequest: Serialize {
    const ACTION: &'static str;
}

/// A decrypted reply payload.
pub trait PlainResponse: DeserializeOwned {
    fn error_fields(&self) -> &ErrorFields;

    fn check(&self) -> Result<(), ClientError> {
        match self.error_fields().as_error() {
            Some(err) => Err(ClientError::Daemon(err)),
            None => Ok(()),
        }
    }
}

/// Serialise `req` and add its `action` tag.
pub fn to_plaintext<R: PlainRequest>(req: &R) -> Result<Vec<u8>, ClientError> {
    let mut value = serde_json::to_value(req).map_err(|e| ClientError::Encode(e.to_string()))?;
    match value.as_object_mut() {
        Some(obj) => {
            obj.insert("action".into(), R::ACTION.into());
        }
        None => {
            return Err(ClientError::Encode(format!(
                "{} payload is not a JSON object",
                R::ACTION
            )))
        }
    }
    serde_json::to_vec(&value).map_err(|e| ClientError::Encode(e.to_string()))
}

pub fn from_plaintext<R: PlainResponse>(bytes: &[u8]) -> Result<R, ClientError> {
    serde_json::from_slice(bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

macro_rules! plain_response {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl PlainResponse for $ty {
                fn error_fields(&self) -> &ErrorFields {
                    &self.error
                }
            }
        )+
    };
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetDatabaseHashRequest {}

impl PlainRequest for GetDatabaseHashRequest {
    const ACTION: &'static str = action::GET_DATABASE_HASH;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GetDatabaseHashResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
    pub hash: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssociateRequest {
    /// Public key from the handshake.
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    /// Public half of the association key pair.
    #[serde(rename = "idKey", with = "base64_bytes")]
    pub id_key: Vec<u8>,
}

impl PlainRequest for AssociateRequest {
    const ACTION: &'static str = action::ASSOCIATE;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AssociateResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
    pub id: String,
    pub hash: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestAssociateRequest {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
}

impl PlainRequest for TestAssociateRequest {
    const ACTION: &'static str = action::TEST_ASSOCIATE;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TestAssociateResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
    pub id: String,
    pub hash: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseGroup {
    pub name: String,
    pub uuid: String,
    pub children: Vec<DatabaseGroup>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseGroupsRequest {}

impl PlainRequest for DatabaseGroupsRequest {
    const ACTION: &'static str = action::GET_DATABASE_GROUPS;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GroupsEmbedded {
    pub groups: Vec<DatabaseGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseGroupsResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
    #[serde(rename = "defaultGroup")]
    pub default_group: String,
    #[serde(rename = "defaultGroupAlwaysAllow")]
    pub default_group_always_allow: bool,
    pub groups: GroupsEmbedded,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateNewGroupRequest {
    /// Slash-separated path; missing parents are created.
    #[serde(rename = "groupName")]
    pub name: String,
}

impl PlainRequest for CreateNewGroupRequest {
    const ACTION: &'static str = action::CREATE_NEW_GROUP;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CreateNewGroupResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
    pub name: String,
    pub uuid: String,
}

/// Association a login lookup may decrypt entries under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginKey {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetLoginsRequest {
    pub url: String,
    #[serde(rename = "submitUrl")]
    pub submit_url: String,
    #[serde(rename = "httpAuth")]
    pub http_auth: String,
    /// Extra associations; the client's own is always prepended.
    pub keys: Vec<LoginKey>,
}

impl PlainRequest for GetLoginsRequest {
    const ACTION: &'static str = action::GET_LOGINS;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoginEntry {
    pub uuid: String,
    pub name: String,
    pub login: String,
    pub password: String,
    /// Set when the entry's expiry time has passed.
    #[serde(with = "string_bool")]
    pub expired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GetLoginsResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
    pub count: usize,
    pub entries: Vec<LoginEntry>,
}

/// Creates a login when `uuid` is empty, updates it otherwise.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SetLoginRequest {
    pub url: String,
    #[serde(rename = "submitUrl")]
    pub submit_url: String,
    pub login: String,
    pub password: String,
    pub group: String,
    #[serde(rename = "groupUuid")]
    pub group_uuid: String,
    pub uuid: String,
    #[serde(rename = "downloadFavicon", with = "string_bool")]
    pub download_favicon: bool,
}

impl PlainRequest for SetLoginRequest {
    const ACTION: &'static str = action::SET_LOGIN;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SetLoginResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteEntryRequest {
    pub uuid: String,
}

impl PlainRequest for DeleteEntryRequest {
    const ACTION: &'static str = action::DELETE_ENTRY;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeleteEntryResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
}

/// Asks the daemon to show its password generator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratePasswordRequest {}

impl PlainRequest for GeneratePasswordRequest {
    const ACTION: &'static str = action::GENERATE_PASSWORD;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GeneratePasswordResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LockDatabaseRequest {}

impl PlainRequest for LockDatabaseRequest {
    const ACTION: &'static str = action::LOCK_DATABASE;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockDatabaseResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetTotpRequest {
    /// Entry uuid.
    pub uuid: String,
}

impl PlainRequest for GetTotpRequest {
    const ACTION: &'static str = action::GET_TOTP;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GetTotpResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
    pub totp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoTypeRequest {
    /// URL or top-level domain to search entries by.
    pub search: String,
}

impl PlainRequest for AutoTypeRequest {
    const ACTION: &'static str = action::REQUEST_AUTOTYPE;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AutoTypeResponse {
    #[serde(flatten)]
    pub error: ErrorFields,
}

plain_response!(
    GetDatabaseHashResponse,
    AssociateResponse,
    TestAssociateResponse,
    DatabaseGroupsResponse,
    CreateNewGroupResponse,
    GetLoginsResponse,
    SetLoginResponse,
    DeleteEntryResponse,
    GeneratePasswordResponse,
    LockDatabaseResponse,
    GetTotpResponse,
    AutoTypeResponse,
);
