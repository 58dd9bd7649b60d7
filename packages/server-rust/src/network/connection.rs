//! Connection handles, the detached-request [`Responder`], and the registry.
//!
//! Every connection gets a bounded outbound channel drained by its writer
//! task. Replies and outbound invocations are encoded to frames and pushed
//! into that channel; nothing on this path blocks a network task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cfgsync_core::frame::error_code;
use cfgsync_core::value::check_signature;
use cfgsync_core::{Frame, ReplyBody, RpcReply, RpcRequest, Value};
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::config::ConnectionConfig;
use crate::error::RpcError;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Message handed to a connection's writer task.
#[derive(Debug)]
pub enum OutboundMessage {
    /// An encoded [`Frame`].
    Frame(Bytes),
    /// Close the connection with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending a message to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    Timeout,
    /// The writer task has exited.
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    Full,
}

/// Handle to one peer connection.
///
/// The writer task holds the receiver end of `tx`; the reader task routes
/// replies back through [`ConnectionHandle::complete`].
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Remote address, for logs and error messages.
    pub peer: String,
    pub connected_at: Instant,
    tx: mpsc::Sender<OutboundMessage>,
    closed: CancellationToken,
    lost_reason: parking_lot::Mutex<Option<String>>,
    pending: DashMap<u64, oneshot::Sender<ReplyBody>>,
    next_request_id: AtomicU64,
    send_timeout: Duration,
}

impl ConnectionHandle {
    /// Attempts to enqueue a message without blocking.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Enqueues a message, waiting at most `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` if the channel stays full and
    /// `SendError::Disconnected` if the writer task is gone.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Whether the connection can still carry traffic.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Why the connection went away, if it has.
    #[must_use]
    pub fn connection_lost_reason(&self) -> Option<String> {
        self.lost_reason.lock().clone()
    }

    /// Token cancelled when the connection closes. Reader and writer tasks
    /// select on it.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Marks the connection as lost and fails every outstanding invocation.
    ///
    /// Only the first reason is kept.
    pub fn close(&self, reason: impl Into<String>) {
        {
            let mut lost = self.lost_reason.lock();
            if lost.is_none() {
                *lost = Some(reason.into());
            }
        }
        self.closed.cancel();
        // Dropping the senders wakes every waiting invoke() with a closed channel.
        self.pending.clear();
    }

    /// Number of outbound invocations awaiting a reply.
    #[must_use]
    pub fn pending_invocations(&self) -> usize {
        self.pending.len()
    }

    /// Invokes `method` on the peer and waits for its reply.
    ///
    /// # Errors
    ///
    /// Fails with [`RpcError::ConnectionLost`] if the connection is invalid
    /// before or during the call, [`RpcError::Timeout`] if no reply arrives
    /// in time, or [`RpcError::Remote`] if the peer answered with an error.
    pub async fn invoke(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>, RpcError> {
        if !self.is_valid() {
            return Err(self.lost_error());
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);
        if self.closed.is_cancelled() {
            self.pending.remove(&id);
            return Err(self.lost_error());
        }

        let frame = Frame::Request(RpcRequest {
            id,
            method: method.to_string(),
            params,
        });
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .send_timeout(OutboundMessage::Frame(bytes), self.send_timeout)
            .await
        {
            self.pending.remove(&id);
            return Err(match e {
                SendError::Timeout | SendError::Full => RpcError::Timeout {
                    timeout: self.send_timeout,
                },
                SendError::Disconnected => self.lost_error(),
            });
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(ReplyBody::Values(values))) => Ok(values),
            Ok(Ok(ReplyBody::Error { code, message })) => Err(RpcError::Remote { code, message }),
            Ok(Err(_)) => Err(self.lost_error()),
            Err(_) => {
                self.pending.remove(&id);
                Err(RpcError::Timeout { timeout })
            }
        }
    }

    /// Routes a reply from the peer to the invocation waiting for it.
    pub fn complete(&self, reply: RpcReply) {
        match self.pending.remove(&reply.id) {
            Some((_, waiter)) => {
                // The waiter may have timed out already.
                let _ = waiter.send(reply.body);
            }
            None => debug!(
                connection = self.id.0,
                request_id = reply.id,
                "Reply for unknown or expired request"
            ),
        }
    }

    /// Encodes and enqueues a reply. Never blocks: if the channel is full the
    /// send continues on a spawned task bounded by the send timeout.
    fn send_reply(&self, reply: RpcReply) {
        let request_id = reply.id;
        let bytes = match Frame::Reply(reply).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(connection = self.id.0, request_id, "Failed to encode reply: {e}");
                return;
            }
        };
        match self.tx.try_send(OutboundMessage::Frame(bytes)) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                let tx = self.tx.clone();
                let timeout = self.send_timeout;
                let connection = self.id.0;
                tokio::spawn(async move {
                    if tokio::time::timeout(timeout, tx.send(msg)).await.is_err() {
                        warn!(connection, request_id, "Outbound channel full, reply dropped");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = self.id.0, request_id, "Connection closed before reply");
            }
        }
    }

    fn lost_error(&self) -> RpcError {
        RpcError::ConnectionLost {
            reason: self
                .connection_lost_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        }
    }
}

/// The right to answer one inbound request.
///
/// Consumed by [`respond`](Responder::respond), [`fail`](Responder::fail) or
/// [`abandon`](Responder::abandon), so a request can be answered at most once.
/// It can be moved to another task, which is how requests are detached from
/// the network task that received them.
#[must_use = "a request must be answered or explicitly abandoned"]
#[derive(Debug)]
pub struct Responder {
    request_id: u64,
    return_types: &'static str,
    connection: Arc<ConnectionHandle>,
    done: bool,
}

impl Responder {
    pub fn new(
        request_id: u64,
        connection: Arc<ConnectionHandle>,
        return_types: &'static str,
    ) -> Self {
        Self {
            request_id,
            return_types,
            connection,
            done: false,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// The connection the request arrived on.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    /// Replies with `values`. Values not matching the method's declared
    /// return types are replaced by a `WRONG_RETURN` error.
    pub fn respond(mut self, values: Vec<Value>) {
        self.done = true;
        let reply = match check_signature(self.return_types, &values) {
            Ok(()) => RpcReply::values(self.request_id, values),
            Err(e) => {
                warn!(request_id = self.request_id, "Handler returned bad values: {e}");
                RpcReply::error(self.request_id, error_code::WRONG_RETURN, e.to_string())
            }
        };
        self.connection.send_reply(reply);
    }

    /// Replies with an error.
    pub fn fail(mut self, code: u32, message: impl Into<String>) {
        self.done = true;
        self.connection
            .send_reply(RpcReply::error(self.request_id, code, message));
    }

    /// Drops the request without replying.
    pub fn abandon(mut self) {
        self.done = true;
        trace!(request_id = self.request_id, "Request abandoned");
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.done {
            debug!(
                connection = self.connection.id.0,
                request_id = self.request_id,
                "Request dropped without a reply"
            );
        }
    }
}

/// Concurrent registry of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection, returning its handle and the receiver the
    /// writer task drains.
    pub fn register(
        &self,
        peer: impl Into<String>,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));

        let handle = Arc::new(ConnectionHandle {
            id,
            peer: peer.into(),
            connected_at: Instant::now(),
            tx,
            closed: CancellationToken::new(),
            lost_reason: parking_lot::Mutex::new(None),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            send_timeout: config.send_timeout,
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Removes and returns all connections. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.connections.remove(&key).map(|(_, h)| h))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
