//! Concurrency engine: one writer task, one reader task and a table of
//! pending exchanges over a single duplex stream.
//!
//! ```text
//! caller ──exchange()──► queue ──► writer task ──► stream
//!   ▲                                                │
//!   └──── oneshot ◄── pending table ◄── reader task ◄┘
//!                                          │
//!                                          └──► observers (signals, async errors)
//! ```
//!
//! Replies are matched to requests by nonce: a request sent with nonce `N`
//! waits under key `increment(N)`. Exchanges may be pipelined from any number
//! of tasks. The daemon answers in order, so a reply whose nonce matches
//! nothing goes to the oldest exchange already on the wire, whose nonce check
//! then rejects it unless it is a daemon error. An exchange abandoned after
//! its request went out leaves a tombstone that swallows its late reply; one
//! abandoned before that is removed and its request never written.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::codec::{decode_message, encode_message, peek_nonce, Frame, JsonFramer};
use crate::crypto::increment_nonce;
use crate::error::ClientError;
use crate::message::Message;
use crate::signals::{Observers, Signal};

type Reply = Result<Message, ClientError>;

/// A caller-supplied stream handed back once both tasks have stopped.
type Released = Box<dyn Any + Send>;
type Reclaim = Pin<Box<dyn Future<Output = Option<Released>> + Send>>;

/// Bound on how long an owned stream gets to shut down cleanly.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct PendingEntry {
    reply_nonce: Vec<u8>,
    /// Set by the writer just before the request goes out.
    sent: bool,
    /// `None` once the caller stopped waiting.
    slot: Option<oneshot::Sender<Reply>>,
}

impl PendingEntry {
    fn is_tombstone(&self) -> bool {
        self.slot.is_none()
    }
}

#[derive(Default)]
struct PendingState {
    entries: VecDeque<PendingEntry>,
    closed: bool,
}

impl PendingState {
    fn position(&self, nonce: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.reply_nonce == nonce)
    }

    /// Drop tombstones queued ahead of `index`; their replies are overdue.
    fn prune_before(&mut self, index: usize) {
        let mut i = 0;
        self.entries.retain(|e| {
            i += 1;
            i > index || !e.is_tombstone()
        });
    }
}

#[derive(Default)]
pub(crate) struct PendingTable {
    state: Mutex<PendingState>,
}

impl PendingTable {
    fn register(&self, reply_nonce: Vec<u8>) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ClientError::Closing);
        }
        let (tx, rx) = oneshot::channel();
        state.entries.push_back(PendingEntry {
            reply_nonce,
            sent: false,
            slot: Some(tx),
        });
        Ok(rx)
    }

    /// Claim the entry for a request about to be written. False when its
    /// caller has already gone.
    fn mark_sent(&self, reply_nonce: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state.position(reply_nonce) {
            Some(i) => {
                state.entries[i].sent = true;
                true
            }
            None => false,
        }
    }

    /// Route a solicited reply carrying `nonce`. With `fallback`, a reply
    /// matching nothing goes to the oldest sent entry. Returns whether an
    /// entry, live or tombstone, took the reply.
    fn deliver(&self, nonce: &[u8], reply: Reply, fallback: bool) -> bool {
        let entry = {
            let mut state = self.state.lock();
            match state.position(nonce) {
                Some(i) => {
                    let entry = state.entries.remove(i);
                    state.prune_before(i);
                    entry
                }
                None if fallback => {
                    let oldest = state.entries.iter().position(|e| e.sent);
                    oldest.and_then(|i| state.entries.remove(i))
                }
                None => return false,
            }
        };

        match entry {
            Some(PendingEntry { slot: Some(tx), .. }) => {
                let _ = tx.send(reply);
                true
            }
            Some(PendingEntry { slot: None, .. }) => {
                debug!("discarded reply for an abandoned exchange");
                true
            }
            None => {
                warn!("reply arrived with no exchange pending; dropped");
                false
            }
        }
    }

    fn fail(&self, reply_nonce: &[u8], err: ClientError) {
        let entry = {
            let mut state = self.state.lock();
            let index = state.position(reply_nonce);
            index.and_then(|i| state.entries.remove(i))
        };
        if let Some(PendingEntry { slot: Some(tx), .. }) = entry {
            let _ = tx.send(Err(err));
        }
    }

    /// The caller stopped waiting. A sent request becomes a tombstone; an
    /// unsent one is removed so the writer skips it.
    fn abandon(&self, reply_nonce: &[u8]) {
        let mut state = self.state.lock();
        let Some(i) = state
            .entries
            .iter()
            .position(|e| e.reply_nonce == reply_nonce && !e.is_tombstone())
        else {
            return;
        };
        if state.entries[i].sent {
            state.entries[i].slot = None;
        } else {
            state.entries.remove(i);
        }
    }

    fn close(&self, reason: &ClientError) {
        let drained: Vec<PendingEntry> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain(..).collect()
        };
        for entry in drained {
            if let Some(tx) = entry.slot {
                let _ = tx.send(Err(reason.clone()));
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Tombstones or removes the pending entry if the exchange is dropped before
/// its reply.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    reply_nonce: Vec<u8>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.abandon(&self.reply_nonce);
    }
}

struct Outgoing {
    message: Message,
    reply_nonce: Vec<u8>,
}

struct Shared {
    pending: PendingTable,
    observers: Observers,
    stop: watch::Sender<bool>,
}

impl Shared {
    fn shutdown(&self, reason: ClientError) {
        if !self.stop.send_replace(true) {
            info!(%reason, "engine shutting down");
        }
        self.pending.close(&reason);
    }
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Outgoing>,
    aborts: Vec<AbortHandle>,
    reclaim: Mutex<Option<Reclaim>>,
    released: Mutex<Option<Released>>,
}

impl Engine {
    /// Start the writer and reader tasks. An owned stream is shut down when
    /// the engine stops; any other stream is kept whole for
    /// [`Engine::take_stream`].
    pub(crate) fn spawn<S>(
        stream: S,
        owns_stream: bool,
        observers: Observers,
        queue_depth: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: PendingTable::default(),
            observers,
            stop,
        });
        let (queue, requests) = mpsc::channel(queue_depth.max(1));

        let write_task = tokio::spawn(write_loop(writer, requests, shared.clone(), owns_stream));
        let read_task = tokio::spawn(read_loop(reader, shared.clone()));
        let aborts = vec![write_task.abort_handle(), read_task.abort_handle()];

        let reclaim: Reclaim = Box::pin(async move {
            let (writer, reader) = (write_task.await, read_task.await);
            match (reader, writer) {
                (Ok(reader), Ok(writer)) if !owns_stream => {
                    Some(Box::new(reader.unsplit(writer)) as Released)
                }
                (Err(err), _) | (_, Err(err)) => {
                    warn!(error = %err, "engine task failed");
                    None
                }
                _ => None,
            }
        });

        Self {
            shared,
            queue,
            aborts,
            reclaim: Mutex::new(Some(reclaim)),
            released: Mutex::new(None),
        }
    }

    /// Send `request` and wait for its reply.
    ///
    /// The reply must carry `increment(request.nonce)`; anything else is
    /// [`ClientError::InvalidNonce`]. A daemon-reported error is returned as
    /// [`ClientError::Daemon`] before the nonce is checked, since the daemon
    /// may omit the nonce on error replies.
    pub(crate) async fn exchange(
        &self,
        request: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, ClientError> {
        let mut stop = self.shared.stop.subscribe();
        if *stop.borrow() {
            return Err(ClientError::Closing);
        }

        let reply_nonce = increment_nonce(&request.nonce);
        let reply = self.shared.pending.register(reply_nonce.clone())?;
        let _guard = PendingGuard {
            table: &self.shared.pending,
            reply_nonce: reply_nonce.clone(),
        };
        let action = request.action.clone();

        let round_trip = async {
            let outgoing = Outgoing {
                message: request,
                reply_nonce: reply_nonce.clone(),
            };
            tokio::select! {
                sent = self.queue.send(outgoing) => sent.map_err(|_| ClientError::Closing)?,
                _ = stop.wait_for(|stopped| *stopped) => return Err(ClientError::Closing),
            }
            // Shutdown completes every pending slot, so this cannot hang.
            reply.await.unwrap_or(Err(ClientError::Closing))
        };

        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, round_trip)
                .await
                .unwrap_or(Err(ClientError::Timeout)),
            None => round_trip.await,
        }?;

        if response.nonce != reply_nonce {
            warn!(%action, "reply nonce does not match request");
            return Err(ClientError::InvalidNonce);
        }
        Ok(response)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shared.stop.borrow()
    }

    /// Stop both tasks and fail every pending exchange with
    /// [`ClientError::Closing`]. Returns once both tasks have finished.
    pub(crate) async fn close(&self) {
        self.shared.shutdown(ClientError::Closing);
        let reclaim = self.reclaim.lock().take();
        if let Some(reclaim) = reclaim {
            let stream = reclaim.await;
            *self.released.lock() = stream;
        }
    }

    /// Close, then hand back a caller-supplied stream of type `S`.
    pub(crate) async fn take_stream<S: 'static>(&self) -> Option<S> {
        self.close().await;
        let stream = self.released.lock().take()?;
        stream.downcast::<S>().ok().map(|s| *s)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.shutdown(ClientError::Closing);
        for task in &self.aborts {
            task.abort();
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut requests: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
    owns_stream: bool,
) -> W
where
    W: AsyncWrite + Unpin,
{
    let mut stop = shared.stop.subscribe();
    loop {
        let outgoing = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            next = requests.recv() => match next {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        if !shared.pending.mark_sent(&outgoing.reply_nonce) {
            debug!(action = %outgoing.message.action, "caller gave up before send; skipped");
            continue;
        }

        // Serialise fully before the first byte goes out.
        let bytes = match encode_message(&outgoing.message) {
            Ok(bytes) => bytes,
            Err(err) => {
                shared.pending.fail(&outgoing.reply_nonce, err);
                continue;
            }
        };

        debug!(action = %outgoing.message.action, len = bytes.len(), "writing request");
        // A write the peer never drains must not hold up shutdown; the stream
        // may then end inside this message.
        let written = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {
                debug!("write interrupted by shutdown");
                break;
            }
            written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            } => written,
        };

        if let Err(err) = written {
            warn!(error = %err, "write failed");
            let err = ClientError::from(err);
            shared.pending.fail(&outgoing.reply_nonce, err.clone());
            shared.shutdown(err);
            break;
        }
    }

    if owns_stream {
        match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "stream shutdown failed"),
            Err(_) => debug!("stream shutdown timed out"),
        }
    }
    writer
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>) -> R
where
    R: AsyncRead + Unpin,
{
    let mut stop = shared.stop.subscribe();
    let mut framer = JsonFramer::new();

    let reason = loop {
        while let Some(frame) = framer.next_frame() {
            dispatch(&shared, frame);
        }

        let read = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {
                if let Some(garbage) = framer.take_garbage() {
                    dispatch(&shared, garbage);
                }
                return reader;
            }
            read = reader.read_buf(framer.buffer_mut()) => read,
        };

        match read {
            Ok(0) => {
                let mut err = ClientError::ConnectionClosed;
                while let Some(frame) = framer.finish() {
                    if let Frame::Truncated { .. } = frame {
                        err = frame.decode().err().unwrap_or(err);
                    } else {
                        dispatch(&shared, frame);
                    }
                }
                info!(reason = %err, "daemon stream ended");
                shared.observers.async_error(&err);
                break err;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "read failed");
                let err = ClientError::from(err);
                shared.observers.async_error(&err);
                break err;
            }
        }
    };

    shared.shutdown(reason);
    reader
}

fn dispatch(shared: &Shared, frame: Frame) {
    let bytes = match frame {
        Frame::Object(bytes) => bytes,
        other => {
            if let Err(err) = other.decode() {
                warn!(error = %err, "unexpected bytes from daemon");
                shared.observers.async_error(&err);
            }
            return;
        }
    };

    let msg = match decode_message(&bytes) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(error = %err, "undecodable message from daemon");
            // A readable nonce ties the object to the exchange waiting on it.
            let claimed = peek_nonce(&bytes)
                .is_some_and(|nonce| shared.pending.deliver(&nonce, Err(err.clone()), false));
            if !claimed {
                shared.observers.async_error(&err);
            }
            return;
        }
    };

    if let Some(signal) = Signal::from_action(&msg.action) {
        shared.observers.signal(signal);
        return;
    }

    debug!(action = %msg.action, "reply received");
    let nonce = msg.nonce.clone();
    let reply = match msg.error.as_error() {
        Some(err) => {
            let err = ClientError::Daemon(err);
            if msg.action.is_empty() {
                shared.observers.async_error(&err);
            }
            Err(err)
        }
        None => Ok(msg),
    };
    shared.pending.deliver(&nonce, reply, true);
}
