//! Per-connection reader and writer tasks over length-delimited frames.

use std::sync::Arc;

use cfgsync_core::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::config::ConnectionConfig;
use super::connection::{ConnectionHandle, ConnectionRegistry, OutboundMessage};
use super::methods::MethodTable;
use super::shutdown::ConnectionGuard;

/// Registers `stream` with `registry` and spawns its reader and writer.
///
/// Inbound requests are dispatched through `methods`; inbound replies
/// complete invocations made through the returned handle. When either side
/// stops, the connection is closed with the reason and unregistered.
pub fn spawn_connection<S>(
    stream: S,
    peer: String,
    registry: &Arc<ConnectionRegistry>,
    config: &ConnectionConfig,
    methods: Arc<MethodTable>,
    guard: Option<ConnectionGuard>,
) -> Arc<ConnectionHandle>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (handle, rx) = registry.register(peer, config);
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(config.max_frame_length)
        .new_codec();
    let (sink, stream) = Framed::new(stream, codec).split();

    tokio::spawn(write_loop(sink, rx, Arc::clone(&handle)));
    tokio::spawn(read_loop(
        stream,
        Arc::clone(&handle),
        Arc::clone(registry),
        methods,
        guard,
    ));
    debug!(connection = handle.id.0, peer = %handle.peer, "Connection opened");
    handle
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<OutboundMessage>,
    handle: Arc<ConnectionHandle>,
) where
    W: futures_util::Sink<bytes::Bytes, Error = std::io::Error> + Unpin,
{
    let closed = handle.closed_token();
    let reason = loop {
        tokio::select! {
            () = closed.cancelled() => break None,
            msg = rx.recv() => match msg {
                Some(OutboundMessage::Frame(bytes)) => {
                    if let Err(e) = sink.send(bytes).await {
                        break Some(format!("write failed: {e}"));
                    }
                }
                Some(OutboundMessage::Close(reason)) => {
                    break Some(reason.unwrap_or_else(|| "closed by server".to_string()));
                }
                None => break None,
            },
        }
    };
    let _ = sink.close().await;
    if let Some(reason) = reason {
        handle.close(reason);
    }
}

async fn read_loop<R>(
    mut stream: R,
    handle: Arc<ConnectionHandle>,
    registry: Arc<ConnectionRegistry>,
    methods: Arc<MethodTable>,
    _guard: Option<ConnectionGuard>,
) where
    R: futures_util::Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin,
{
    let closed = handle.closed_token();
    let reason = loop {
        let next = tokio::select! {
            () = closed.cancelled() => break None,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(bytes)) => match Frame::decode(&bytes) {
                Ok(Frame::Request(request)) => methods.dispatch(request, &handle),
                Ok(Frame::Reply(reply)) => handle.complete(reply),
                Err(e) => {
                    warn!(connection = handle.id.0, "Dropping connection on bad frame: {e}");
                    break Some(format!("protocol error: {e}"));
                }
            },
            Some(Err(e)) => break Some(format!("read failed: {e}")),
            None => break Some("connection closed by peer".to_string()),
        }
    };
    if let Some(reason) = reason {
        handle.close(reason);
    }
    registry.remove(handle.id);
    debug!(
        connection = handle.id.0,
        reason = handle.connection_lost_reason().unwrap_or_default(),
        "Connection closed"
    );
}
