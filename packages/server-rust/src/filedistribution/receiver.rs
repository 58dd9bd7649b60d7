//! Receiving side of the chunked file protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cfgsync_core::file::methods;
use cfgsync_core::value::ValuesExt;
use cfgsync_core::{ContentHasher, FileReference, FileType, ReplayStatus, Value, ValueError};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::network::{Method, MethodTable, RpcCall};

/// Ack codes returned to the sender.
pub mod ack {
    pub const OK: i32 = 0;
    pub const UNKNOWN_SESSION: i32 = 1;
    pub const OUT_OF_ORDER: i32 = 2;
    pub const HASH_MISMATCH: i32 = 3;
    pub const SENDER_FAILED: i32 = 4;
}

/// A file that arrived complete and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub reference: FileReference,
    pub filename: String,
    pub file_type: FileType,
    pub content: Vec<u8>,
}

#[derive(Debug)]
struct Session {
    reference: FileReference,
    filename: String,
    file_type: FileType,
    expected_size: i64,
    next_part_id: i32,
    hasher: ContentHasher,
    content: Vec<u8>,
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<i32, Session>,
    completed: HashMap<FileReference, ReceivedFile>,
    failed: HashMap<FileReference, String>,
}

/// Sessions with no traffic for this long are dropped.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Reassembles files pushed by a server.
///
/// A session ends with its EOF, with a rejected part, or when it has been
/// idle longer than the session idle timeout. Idle sessions are evicted
/// whenever a new one starts.
#[derive(Debug)]
pub struct FileReceiver {
    state: Mutex<State>,
    next_session: AtomicI32,
    arrived: Notify,
    session_idle_timeout: Duration,
}

impl Default for FileReceiver {
    fn default() -> Self {
        Self::with_session_idle_timeout(DEFAULT_SESSION_IDLE_TIMEOUT)
    }
}

impl FileReceiver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session_idle_timeout(session_idle_timeout: Duration) -> Self {
        Self {
            state: Mutex::default(),
            next_session: AtomicI32::new(0),
            arrived: Notify::new(),
            session_idle_timeout,
        }
    }

    /// Starts a session and returns its id.
    pub fn receive_meta(
        &self,
        reference: FileReference,
        filename: &str,
        file_type: FileType,
        size: i64,
    ) -> i32 {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let capacity = usize::try_from(size).unwrap_or(0).min(64 * 1024 * 1024);
        debug!(reference = %reference, session_id, size, "Receiving file");
        let mut state = self.state.lock();
        self.evict_idle(&mut state);
        state.sessions.insert(
            session_id,
            Session {
                reference,
                filename: filename.to_string(),
                file_type,
                expected_size: size,
                next_part_id: 0,
                hasher: ContentHasher::new(),
                content: Vec::with_capacity(capacity),
                last_activity: Instant::now(),
            },
        );
        session_id
    }

    fn evict_idle(&self, state: &mut State) {
        let now = Instant::now();
        let failed = &mut state.failed;
        state.sessions.retain(|session_id, session| {
            let idle = now.duration_since(session.last_activity);
            if idle < self.session_idle_timeout {
                return true;
            }
            warn!(
                reference = %session.reference,
                session_id,
                "Dropping file transfer idle for {idle:?}"
            );
            failed.insert(session.reference.clone(), "transfer abandoned by sender".to_string());
            false
        });
    }

    pub fn receive_part(&self, session_id: i32, part_id: i32, bytes: &[u8]) -> i32 {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return ack::UNKNOWN_SESSION;
        };
        if part_id != session.next_part_id {
            warn!(
                reference = %session.reference,
                expected = session.next_part_id,
                got = part_id,
                "Out of order file part"
            );
            // The sender gives up on a non-OK ack.
            let reference = session.reference.clone();
            state.sessions.remove(&session_id);
            state
                .failed
                .insert(reference, format!("part {part_id} out of order"));
            return ack::OUT_OF_ORDER;
        }
        session.last_activity = Instant::now();
        session.next_part_id += 1;
        session.hasher.update(bytes);
        session.content.extend_from_slice(bytes);
        ack::OK
    }

    /// Completes a session, verifying the content against `content_hash`.
    pub fn receive_eof(&self, session_id: i32, content_hash: i64, status: &ReplayStatus) -> i32 {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.remove(&session_id) else {
            return ack::UNKNOWN_SESSION;
        };
        let reference = session.reference.clone();

        let ack = if !status.is_ok() {
            warn!(reference = %reference, "Sender failed: {}", status.description);
            state
                .failed
                .insert(reference.clone(), status.description.clone());
            ack::SENDER_FAILED
        } else if session.hasher.finish() != content_hash {
            warn!(reference = %reference, "Content hash mismatch");
            state
                .failed
                .insert(reference.clone(), "content hash mismatch".to_string());
            ack::HASH_MISMATCH
        } else {
            if i64::try_from(session.content.len()).ok() != Some(session.expected_size) {
                debug!(
                    reference = %reference,
                    expected = session.expected_size,
                    received = session.content.len(),
                    "Size differs from announced size"
                );
            }
            state.failed.remove(&reference);
            state.completed.insert(
                reference.clone(),
                ReceivedFile {
                    reference: reference.clone(),
                    filename: session.filename,
                    file_type: session.file_type,
                    content: session.content,
                },
            );
            ack::OK
        };
        drop(state);
        self.arrived.notify_waiters();
        ack
    }

    #[must_use]
    pub fn file(&self, reference: &FileReference) -> Option<ReceivedFile> {
        self.state.lock().completed.get(reference).cloned()
    }

    /// Why the last transfer of `reference` failed, if it did.
    #[must_use]
    pub fn failure(&self, reference: &FileReference) -> Option<String> {
        self.state.lock().failed.get(reference).cloned()
    }

    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Waits until `reference` has arrived, or `timeout` passes.
    pub async fn wait_for(
        &self,
        reference: &FileReference,
        timeout: Duration,
    ) -> Option<ReceivedFile> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.arrived.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(file) = self.file(reference) {
                    return file;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    /// Adds the three receive methods, bound to this receiver.
    #[must_use]
    pub fn register(self: &Arc<Self>, table: MethodTable) -> MethodTable {
        let meta = Arc::clone(self);
        let part = Arc::clone(self);
        let eof = Arc::clone(self);
        table
            .with(
                Method::new(methods::RECEIVE_META, "sssl", "ii", move |call: RpcCall| {
                    reply(call, |p| {
                        let file_type =
                            FileType::from_name(p.string(2)?).unwrap_or(FileType::File);
                        let session = meta.receive_meta(
                            FileReference::new(p.string(0)?),
                            p.string(1)?,
                            file_type,
                            p.int64(3)?,
                        );
                        Ok(vec![Value::Int32(ack::OK), Value::Int32(session)])
                    });
                })
                .description("Announce a file transfer"),
            )
            .with(
                Method::new(methods::RECEIVE_PART, "siix", "i", move |call: RpcCall| {
                    reply(call, |p| {
                        let ack = part.receive_part(p.int32(1)?, p.int32(2)?, p.data(3)?);
                        Ok(vec![Value::Int32(ack)])
                    });
                })
                .description("Receive one part of a file"),
            )
            .with(
                Method::new(methods::RECEIVE_EOF, "silis", "i", move |call: RpcCall| {
                    reply(call, |p| {
                        let status = ReplayStatus {
                            code: p.int32(3)?,
                            description: p.string(4)?.to_string(),
                        };
                        let ack = eof.receive_eof(p.int32(1)?, p.int64(2)?, &status);
                        Ok(vec![Value::Int32(ack)])
                    });
                })
                .description("Finish a file transfer"),
            )
    }
}

fn reply(call: RpcCall, handle: impl FnOnce(&[Value]) -> Result<Vec<Value>, ValueError>) {
    let RpcCall { params, responder } = call;
    match handle(&params) {
        Ok(values) => responder.respond(values),
        Err(e) => responder.fail(cfgsync_core::frame::error_code::WRONG_PARAMS, e.to_string()),
    }
}
