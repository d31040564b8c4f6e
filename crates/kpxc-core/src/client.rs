//! The protocol client and its operations.
//!
//! Typical use:
//!
//! 1. Connect; the handshake runs before [`ClientBuilder::connect`] returns.
//! 2. Fetch the database hash with [`Client::get_database_hash`].
//! 3. Look up stored [`AssociationCredentials`] by that hash and hand them to
//!    [`Client::set_association_credentials`], or call [`Client::associate`]
//!    and store what it returns.
//! 4. Issue requests. Any number of tasks may share one client.
//! 5. [`Client::close`].

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::ClientConfig;
use crate::crypto::{generate_nonce, KeyPair, Nonce, Session, KEY_SIZE};
use crate::endpoint::{dial, DefaultResolver, ResolveEndpoint};
use crate::engine::Engine;
use crate::error::ClientError;
use crate::message::Message;
use crate::protocol::{self, action, *};
use crate::signals::Observers;

/// Credentials for one database, returned by [`Client::associate`].
///
/// This is the only state worth persisting between connections. Keys
/// serialise as base64; everything is zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AssociationCredentials {
    pub id: String,
    pub hash: String,
    pub version: String,
    #[serde(with = "key_base64")]
    pub public_key: [u8; KEY_SIZE],
    #[serde(with = "key_base64")]
    pub private_key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for AssociationCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationCredentials")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

mod key_base64 {
    use serde::{de, Deserializer, Serializer};

    use crate::crypto::KEY_SIZE;
    use crate::message::base64_bytes;

    pub fn serialize<S: Serializer>(key: &[u8; KEY_SIZE], s: S) -> Result<S::Ok, S::Error> {
        base64_bytes::serialize(key, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; KEY_SIZE], D::Error> {
        let bytes = base64_bytes::deserialize(d)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| de::Error::custom(format!("key must be {KEY_SIZE} bytes, got {len}")))
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    observers: Observers,
    resolver: Option<Box<dyn ResolveEndpoint>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            config: ClientConfig::default(),
            observers: Observers::default(),
            resolver: None,
        }
    }
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = Some(path.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Replaces [`DefaultResolver`]. Ignored when a socket path is configured.
    pub fn resolver<R: ResolveEndpoint + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn on_lock_change<F>(mut self, f: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.observers.on_lock_change(f);
        self
    }

    /// Errors no caller is waiting for: undecodable traffic, daemon errors in
    /// replies without an action, and the end of the stream.
    pub fn on_async_error<F>(mut self, f: F) -> Self
    where
        F: Fn(ClientError) + Send + Sync + 'static,
    {
        self.observers.on_async_error(f);
        self
    }

    /// Resolve the endpoint, dial it and run the handshake. The stream is
    /// shut down when the client closes.
    pub async fn connect(self) -> Result<Client, ClientError> {
        let path = match (&self.config.socket_path, &self.resolver) {
            (Some(path), _) => path.clone(),
            (None, Some(resolver)) => resolver.resolve()?,
            (None, None) => DefaultResolver.resolve()?,
        };
        let stream = dial(&path).await?;
        self.start(stream, true).await
    }

    /// Run over a caller-supplied stream. Closing the client leaves it open;
    /// [`Client::into_stream`] hands it back.
    pub async fn connect_with<S>(self, stream: S) -> Result<Client, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.start(stream, false).await
    }

    async fn start<S>(self, stream: S, owns_stream: bool) -> Result<Client, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session = Session::generate()?;
        let engine = Engine::spawn(stream, owns_stream, self.observers, self.config.queue_depth);
        let client = Client {
            engine,
            session,
            association: RwLock::new(None),
            daemon_version: OnceLock::new(),
            request_timeout: self.config.request_timeout,
        };

        if let Err(err) = client.handshake().await {
            client.close().await;
            return Err(err);
        }
        Ok(client)
    }
}

pub struct Client {
    engine: Engine,
    session: Session,
    association: RwLock<Option<Arc<AssociationCredentials>>>,
    daemon_version: OnceLock<String>,
    request_timeout: Option<Duration>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Connect with default settings.
    pub async fn connect() -> Result<Self, ClientError> {
        Self::builder().connect().await
    }

    /// Exchange public keys and derive the shared key. A no-op once done.
    pub async fn handshake(&self) -> Result<(), ClientError> {
        if self.session.is_established() {
            return Ok(());
        }

        let nonce = generate_nonce()?;
        let reply = self
            .engine
            .exchange(
                Message {
                    action: action::CHANGE_PUBLIC_KEYS.into(),
                    nonce: nonce.to_vec(),
                    client_id: self.session.client_id().to_vec(),
                    public_key: self.session.public_key().to_vec(),
                    ..Default::default()
                },
                self.request_timeout,
            )
            .await?;

        let daemon_key: [u8; KEY_SIZE] = reply.public_key.as_slice().try_into().map_err(|_| {
            ClientError::Decode(format!(
                "daemon public key is {} bytes, expected {KEY_SIZE}",
                reply.public_key.len()
            ))
        })?;
        self.session.establish(&daemon_key);
        if !reply.version.is_empty() {
            let _ = self.daemon_version.set(reply.version.clone());
        }
        info!(version = %reply.version, "handshake complete");
        Ok(())
    }

    /// Version the daemon reported during the handshake.
    pub fn daemon_version(&self) -> Option<&str> {
        self.daemon_version.get().map(String::as_str)
    }

    /// Hash identifying the open database, optionally asking the daemon to
    /// prompt for unlock.
    pub async fn get_database_hash(
        &self,
        trigger_unlock: bool,
    ) -> Result<GetDatabaseHashResponse, ClientError> {
        self.exchange_encrypted(trigger_unlock, &GetDatabaseHashRequest {})
            .await
    }

    /// Register a new association with the open database and keep it.
    pub async fn associate(&self) -> Result<AssociationCredentials, ClientError> {
        let id_keys = KeyPair::generate();
        let resp: AssociateResponse = self
            .exchange_encrypted(
                false,
                &AssociateRequest {
                    key: self.session.public_key().to_vec(),
                    id_key: id_keys.public_bytes().to_vec(),
                },
            )
            .await?;

        let creds = AssociationCredentials {
            id: resp.id.clone(),
            hash: resp.hash.clone(),
            version: resp.version.clone(),
            public_key: id_keys.public_bytes(),
            private_key: id_keys.secret_bytes(),
        };
        *self.association.write() = Some(Arc::new(creds.clone()));
        info!(id = %creds.id, "associated with database");
        Ok(creds)
    }

    /// Credentials in use. They are valid for one database only.
    pub fn association_credentials(&self) -> Option<AssociationCredentials> {
        self.association.read().as_deref().cloned()
    }

    pub fn set_association_credentials(&self, creds: Option<AssociationCredentials>) {
        *self.association.write() = creds.map(Arc::new);
    }

    /// Check the daemon still accepts the stored association.
    pub async fn test_associate(&self) -> Result<TestAssociateResponse, ClientError> {
        let creds = self.credentials()?;
        self.exchange_encrypted(
            false,
            &TestAssociateRequest {
                id: creds.id.clone(),
                key: creds.public_key.to_vec(),
            },
        )
        .await
    }

    pub async fn get_database_groups(&self) -> Result<DatabaseGroupsResponse, ClientError> {
        self.associated().await?;
        self.exchange_encrypted(false, &DatabaseGroupsRequest {})
            .await
    }

    pub async fn create_new_group(
        &self,
        req: &CreateNewGroupRequest,
    ) -> Result<CreateNewGroupResponse, ClientError> {
        self.associated().await?;
        self.exchange_encrypted(false, req).await
    }

    /// Entries matching `req.url`. Our own association key is sent first,
    /// ahead of any keys already in `req`.
    pub async fn get_logins(&self, req: GetLoginsRequest) -> Result<GetLoginsResponse, ClientError> {
        let creds = self.associated().await?;
        let mut req = req;
        req.keys.insert(
            0,
            LoginKey {
                id: creds.id.clone(),
                key: creds.public_key.to_vec(),
            },
        );
        self.exchange_encrypted(false, &req).await
    }

    /// Create an entry, or update one when `req.uuid` is set.
    pub async fn set_login(&self, req: &SetLoginRequest) -> Result<(), ClientError> {
        self.associated().await?;
        self.exchange_encrypted::<_, SetLoginResponse>(false, req)
            .await
            .map(drop)
    }

    pub async fn delete_entry(&self, req: &DeleteEntryRequest) -> Result<(), ClientError> {
        self.associated().await?;
        self.exchange_encrypted::<_, DeleteEntryResponse>(false, req)
            .await
            .map(drop)
    }

    /// Show the daemon's password generator.
    pub async fn generate_password(&self) -> Result<(), ClientError> {
        self.associated().await?;
        self.exchange_encrypted::<_, GeneratePasswordResponse>(false, &GeneratePasswordRequest {})
            .await
            .map(drop)
    }

    pub async fn lock_database(&self) -> Result<(), ClientError> {
        self.associated().await?;
        self.exchange_encrypted::<_, LockDatabaseResponse>(false, &LockDatabaseRequest {})
            .await
            .map(drop)
    }

    pub async fn get_totp(&self, req: &GetTotpRequest) -> Result<GetTotpResponse, ClientError> {
        self.associated().await?;
        self.exchange_encrypted(false, req).await
    }

    /// Ask the daemon to auto-type the entry matching a URL or domain.
    pub async fn request_autotype(&self, req: &AutoTypeRequest) -> Result<(), ClientError> {
        self.associated().await?;
        self.exchange_encrypted::<_, AutoTypeResponse>(false, req)
            .await
            .map(drop)
    }

    /// Stop the engine. Pending and later operations fail with
    /// [`ClientError::Closing`].
    pub async fn close(&self) {
        self.engine.close().await;
    }

    /// Close and return the stream given to [`ClientBuilder::connect_with`].
    /// `None` for a stream the client dialed itself, or when `S` is not the
    /// stream's type. A request interrupted by the close may have been
    /// partly written.
    pub async fn into_stream<S: 'static>(self) -> Option<S> {
        self.engine.take_stream::<S>().await
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    fn credentials(&self) -> Result<Arc<AssociationCredentials>, ClientError> {
        self.association
            .read()
            .clone()
            .ok_or(ClientError::NotAssociated)
    }

    async fn associated(&self) -> Result<Arc<AssociationCredentials>, ClientError> {
        let creds = self.credentials()?;
        self.test_associate().await?;
        Ok(creds)
    }

    async fn exchange_encrypted<Req, Resp>(
        &self,
        trigger_unlock: bool,
        req: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: PlainRequest,
        Resp: PlainResponse,
    {
        let shared = self.session.shared_key()?;
        let nonce = generate_nonce()?;
        let plaintext = protocol::to_plaintext(req)?;

        let request = Message {
            action: Req::ACTION.into(),
            message: shared.seal(&plaintext, &nonce)?,
            nonce: nonce.to_vec(),
            client_id: self.session.client_id().to_vec(),
            trigger_unlock,
            ..Default::default()
        };
        let reply = self.engine.exchange(request, self.request_timeout).await?;

        let reply_nonce: Nonce = reply
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::InvalidNonce)?;
        let decrypted = shared.open(&reply.message, &reply_nonce)?;
        let resp: Resp = protocol::from_plaintext(&decrypted)?;
        resp.check()?;
        debug!(action = Req::ACTION, "exchange complete");
        Ok(resp)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("associated", &self.association.read().is_some())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
