//! Sends one file to a remote receiver as meta, numbered parts and EOF.

use std::time::Duration;

use async_trait::async_trait;
use cfgsync_core::file::methods;
use cfgsync_core::value::ValuesExt;
use cfgsync_core::{ContentHasher, FileReference, FileReferenceMeta, ReplayStatus, Value, ValueError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use super::source::FileReferenceData;
use crate::error::RpcError;
use crate::network::ConnectionHandle;

/// Remote end of a transfer.
#[async_trait]
pub trait FileReceiverTarget: Send + Sync {
    /// Name for logs and errors.
    fn describe(&self) -> String;

    fn is_valid(&self) -> bool;

    fn connection_lost_reason(&self) -> Option<String>;

    async fn invoke(
        &self,
        method: &'static str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>, RpcError>;
}

#[async_trait]
impl FileReceiverTarget for ConnectionHandle {
    fn describe(&self) -> String {
        self.peer.clone()
    }

    fn is_valid(&self) -> bool {
        ConnectionHandle::is_valid(self)
    }

    fn connection_lost_reason(&self) -> Option<String> {
        ConnectionHandle::connection_lost_reason(self)
    }

    async fn invoke(
        &self,
        method: &'static str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>, RpcError> {
        ConnectionHandle::invoke(self, method, params, timeout).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connection to {target} lost: {reason}")]
    ConnectionLost { target: String, reason: String },
    #[error("{method} for '{reference}' to {target} failed: {source}")]
    Rpc {
        reference: FileReference,
        target: String,
        method: &'static str,
        source: RpcError,
    },
    #[error("{target} rejected {method} for '{reference}' with ack {ack}")]
    Rejected {
        reference: FileReference,
        target: String,
        method: &'static str,
        ack: i32,
    },
    #[error("malformed reply to {method}: {source}")]
    BadReply {
        method: &'static str,
        source: ValueError,
    },
}

/// What a completed transfer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub session_id: i32,
    pub parts: i32,
    pub bytes: u64,
    pub content_hash: i64,
    /// Read-side status reported in EOF.
    pub status: ReplayStatus,
}

/// State of one outbound transfer.
#[derive(Debug)]
struct TransferSession {
    session_id: i32,
    reference: FileReference,
    next_part_id: i32,
}

/// Streams files to one receiver. Each call in the sequence waits for its
/// ack before the next one is made.
pub struct ChunkedFileChannel<'a> {
    target: &'a dyn FileReceiverTarget,
    chunk_size: usize,
    timeout: Duration,
}

impl<'a> ChunkedFileChannel<'a> {
    pub fn new(target: &'a dyn FileReceiverTarget, chunk_size: usize, timeout: Duration) -> Self {
        Self {
            target,
            chunk_size: chunk_size.max(1),
            timeout,
        }
    }

    /// Sends `data` to the target.
    ///
    /// # Errors
    ///
    /// Any invalid connection, transport error or non-zero ack aborts the
    /// transfer. Read errors on the source do not: they end the part stream
    /// early and are reported in the EOF status.
    pub async fn send(&self, data: FileReferenceData) -> Result<TransferSummary, TransferError> {
        let FileReferenceData { meta, mut content } = data;
        let mut session = self.send_meta(&meta).await?;

        let mut hasher = ContentHasher::new();
        let status = self
            .send_parts(&mut session, &mut content, meta.size, &mut hasher)
            .await?;
        let content_hash = hasher.finish();
        self.send_eof(&session, content_hash, &status).await?;

        debug!(
            reference = %meta.reference,
            target = %self.target.describe(),
            parts = session.next_part_id,
            bytes = hasher.len(),
            "File sent"
        );
        Ok(TransferSummary {
            session_id: session.session_id,
            parts: session.next_part_id,
            bytes: hasher.len(),
            content_hash,
            status,
        })
    }

    async fn send_meta(&self, meta: &FileReferenceMeta) -> Result<TransferSession, TransferError> {
        let params = vec![
            Value::String(meta.reference.value().to_string()),
            Value::String(meta.filename.clone()),
            Value::String(meta.file_type.name().to_string()),
            Value::Int64(meta.size),
        ];
        let values = self
            .call(&meta.reference, methods::RECEIVE_META, params)
            .await?;
        let ack = bad_reply(methods::RECEIVE_META, values.int32(0))?;
        self.check_ack(&meta.reference, methods::RECEIVE_META, ack)?;
        let session_id = bad_reply(methods::RECEIVE_META, values.int32(1))?;
        Ok(TransferSession {
            session_id,
            reference: meta.reference.clone(),
            next_part_id: 0,
        })
    }

    async fn send_parts(
        &self,
        session: &mut TransferSession,
        content: &mut (dyn AsyncRead + Send + Unpin),
        expected_size: i64,
        hasher: &mut ContentHasher,
    ) -> Result<ReplayStatus, TransferError> {
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let read = match read_chunk(content, &mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    return Ok(ReplayStatus::read_failed(format!(
                        "read failed after {} bytes: {e}",
                        hasher.len()
                    )));
                }
            };
            let chunk = &buffer[..read];
            hasher.update(chunk);
            let params = vec![
                Value::String(session.reference.value().to_string()),
                Value::Int32(session.session_id),
                Value::Int32(session.next_part_id),
                Value::Data(chunk.to_vec()),
            ];
            let values = self
                .call(&session.reference, methods::RECEIVE_PART, params)
                .await?;
            let ack = bad_reply(methods::RECEIVE_PART, values.int32(0))?;
            self.check_ack(&session.reference, methods::RECEIVE_PART, ack)?;
            trace!(part = session.next_part_id, bytes = read, "Part sent");
            session.next_part_id += 1;
        }

        let sent = i64::try_from(hasher.len()).unwrap_or(i64::MAX);
        if sent == expected_size {
            Ok(ReplayStatus::ok())
        } else {
            Ok(ReplayStatus::read_failed(format!(
                "read {sent} bytes, expected {expected_size}"
            )))
        }
    }

    async fn send_eof(
        &self,
        session: &TransferSession,
        content_hash: i64,
        status: &ReplayStatus,
    ) -> Result<(), TransferError> {
        let params = vec![
            Value::String(session.reference.value().to_string()),
            Value::Int32(session.session_id),
            Value::Int64(content_hash),
            Value::Int32(status.code),
            Value::String(status.description.clone()),
        ];
        let values = self
            .call(&session.reference, methods::RECEIVE_EOF, params)
            .await?;
        let ack = bad_reply(methods::RECEIVE_EOF, values.int32(0))?;
        self.check_ack(&session.reference, methods::RECEIVE_EOF, ack)
    }

    /// Checks the target, then invokes. A connection that dies during the
    /// call is reported the same way as one that was already dead.
    async fn call(
        &self,
        reference: &FileReference,
        method: &'static str,
        params: Vec<Value>,
    ) -> Result<Vec<Value>, TransferError> {
        if !self.target.is_valid() {
            return Err(self.connection_lost());
        }
        match self.target.invoke(method, params, self.timeout).await {
            Ok(values) => Ok(values),
            Err(RpcError::ConnectionLost { reason }) => Err(TransferError::ConnectionLost {
                target: self.target.describe(),
                reason,
            }),
            Err(source) => Err(TransferError::Rpc {
                reference: reference.clone(),
                target: self.target.describe(),
                method,
                source,
            }),
        }
    }

    fn check_ack(
        &self,
        reference: &FileReference,
        method: &'static str,
        ack: i32,
    ) -> Result<(), TransferError> {
        if ack == 0 {
            return Ok(());
        }
        Err(TransferError::Rejected {
            reference: reference.clone(),
            target: self.target.describe(),
            method,
            ack,
        })
    }

    fn connection_lost(&self) -> TransferError {
        TransferError::ConnectionLost {
            target: self.target.describe(),
            reason: self
                .target
                .connection_lost_reason()
                .unwrap_or_else(|| "connection is not valid".to_string()),
        }
    }
}

fn bad_reply<T>(method: &'static str, value: Result<T, ValueError>) -> Result<T, TransferError> {
    value.map_err(|source| TransferError::BadReply { method, source })
}

/// Reads until `buffer` is full or the stream ends.
async fn read_chunk(
    content: &mut (dyn AsyncRead + Send + Unpin),
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = content.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
