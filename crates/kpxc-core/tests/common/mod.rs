#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use kpxc_core::codec::JsonFramer;
use kpxc_core::crypto::{increment_nonce, KeyPair, Nonce, SharedKey, KEY_SIZE};
use kpxc_core::message::ErrorFields;
use kpxc_core::{Client, ClientBuilder, ClientError, Message};
use serde_json::{json, Value};
use tokio::io::{
    duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf,
};
use tokio::sync::mpsc;

pub const DAEMON_VERSION: &str = "2.7.4";

/// Scripted daemon on the far end of an in-memory pipe. It keeps its own key
/// pair and seals replies the way KeePassXC does.
pub struct FakeDaemon<S = DuplexStream> {
    io: S,
    framer: JsonFramer,
    keys: KeyPair,
    shared: Option<SharedKey>,
    pub client_public: [u8; KEY_SIZE],
}

impl<S: AsyncRead + AsyncWrite + Unpin> FakeDaemon<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            framer: JsonFramer::new(),
            keys: KeyPair::generate(),
            shared: None,
            client_public: [0; KEY_SIZE],
        }
    }

    pub fn into_io(self) -> S {
        self.io
    }

    /// Next message from the client.
    pub async fn recv(&mut self) -> Message {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return frame.decode().expect("client sent a malformed message");
            }
            let n = self.io.read_buf(self.framer.buffer_mut()).await.unwrap();
            assert!(n > 0, "client closed the stream");
        }
    }

    /// Everything the client writes until it drops its end.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        self.io.read_to_end(&mut rest).await.unwrap();
        rest
    }

    pub async fn send(&mut self, msg: &Message) {
        self.send_raw(&serde_json::to_vec(msg).unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn accept_handshake(&mut self) {
        let req = self.recv().await;
        assert_eq!(req.action, "change-public-keys");
        assert_eq!(req.client_id.len(), 24);
        self.client_public = req.public_key.as_slice().try_into().unwrap();
        self.shared = Some(self.keys.shared_key(&self.client_public));

        self.send(&Message {
            action: req.action.clone(),
            nonce: increment_nonce(&req.nonce),
            public_key: self.keys.public_bytes().to_vec(),
            version: DAEMON_VERSION.into(),
            error: ErrorFields {
                success: Some(true),
                ..Default::default()
            },
            ..Default::default()
        })
        .await;
    }

    /// Next sealed request, opened.
    pub async fn recv_plain(&mut self) -> (Message, Value) {
        let msg = self.recv().await;
        let nonce: Nonce = msg.nonce.as_slice().try_into().unwrap();
        let plain = self.shared().open(&msg.message, &nonce).unwrap();
        let body: Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(body["action"], msg.action.as_str());
        (msg, body)
    }

    pub async fn reply_plain(&mut self, req: &Message, payload: Value) {
        let nonce: Nonce = increment_nonce(&req.nonce).try_into().unwrap();
        self.reply_sealed(req, &nonce, payload).await;
    }

    /// Reply sealed under and carrying an arbitrary nonce.
    pub async fn reply_sealed(&mut self, req: &Message, nonce: &Nonce, payload: Value) {
        let sealed = self
            .shared()
            .seal(payload.to_string().as_bytes(), nonce)
            .unwrap();
        self.send(&Message {
            action: req.action.clone(),
            message: sealed,
            nonce: nonce.to_vec(),
            client_id: req.client_id.clone(),
            ..Default::default()
        })
        .await;
    }

    /// Answer a `test-associate` with success.
    pub async fn approve_association(&mut self) {
        let (req, body) = self.recv_plain().await;
        assert_eq!(req.action, "test-associate");
        self.reply_plain(
            &req,
            json!({
                "id": body["id"],
                "hash": "db-hash",
                "version": DAEMON_VERSION,
                "success": "true",
            }),
        )
        .await;
    }

    fn shared(&self) -> &SharedKey {
        self.shared.as_ref().expect("handshake not done")
    }
}

/// A stream made of two one-way pipes, so each direction can be cut on its
/// own.
pub struct Crossed {
    pub read: DuplexStream,
    pub write: DuplexStream,
}

/// Client and daemon ends of a crossed pair.
pub fn crossed() -> (Crossed, Crossed) {
    let (client_read, daemon_write) = duplex(4096);
    let (daemon_read, client_write) = duplex(4096);
    (
        Crossed {
            read: client_read,
            write: client_write,
        },
        Crossed {
            read: daemon_read,
            write: daemon_write,
        },
    )
}

impl AsyncRead for Crossed {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl AsyncWrite for Crossed {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

/// A client connected to a fake daemon that has completed the handshake.
pub async fn connect(builder: ClientBuilder) -> (Client, FakeDaemon) {
    let (client_io, daemon_io) = duplex(64 * 1024);
    let mut daemon = FakeDaemon::new(daemon_io);
    let (client, ()) = tokio::join!(builder.connect_with(client_io), daemon.accept_handshake());
    (client.unwrap(), daemon)
}

/// Builder whose async errors land in the returned channel.
pub fn observed() -> (ClientBuilder, mpsc::UnboundedReceiver<ClientError>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let builder = Client::builder().on_async_error(move |err| {
        let _ = tx.send(err);
    });
    (builder, rx)
}

/// Nothing further arrives on `rx` within a short grace period.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra notification: {extra:?}");
}
