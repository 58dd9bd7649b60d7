//! The server's RPC method table.

use std::sync::Arc;

use cfgsync_core::config::error_code;
use cfgsync_core::value::ValuesExt;
use cfgsync_core::{FileReference, GetConfigRequest, Value};
use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use super::dispatcher::Dispatcher;
use super::pool::{Rejection, Task};
use super::request::ConfigRequest;
use crate::network::{Method, MethodTable, Responder, RpcCall};

pub const PING: &str = "ping";
pub const PRINT_STATISTICS: &str = "printStatistics";
pub const GET_CONFIG: &str = "config.v3.getConfig";
pub const SERVE_FILE: &str = "filedistribution.serveFile";
pub const SET_FILE_REFERENCES_TO_DOWNLOAD: &str = "filedistribution.setFileReferencesToDownload";

/// Builds the methods served to clients, bound to `dispatcher`.
#[must_use]
pub fn build_method_table(dispatcher: &Dispatcher) -> MethodTable {
    let stats = dispatcher.clone();
    let config = dispatcher.clone();
    let serve = dispatcher.clone();
    let download = dispatcher.clone();
    MethodTable::new()
        .with(
            Method::new(PING, "", "i", |call: RpcCall| {
                call.responder.respond(vec![Value::Int32(0)]);
            })
            .description("Check that the server is alive"),
        )
        .with(
            Method::new(PRINT_STATISTICS, "", "s", move |call: RpcCall| {
                call.responder
                    .respond(vec![Value::String(stats.statistics())]);
            })
            .description("Internal request queue statistics"),
        )
        .with(
            Method::new(GET_CONFIG, "x", "x", move |call: RpcCall| {
                get_config(&config, call);
            })
            .description("Get a config, waiting for a change if the client asks for it"),
        )
        .with(
            Method::new(SERVE_FILE, "si", "is", move |call: RpcCall| {
                serve_file(&serve, call);
            })
            .description("Send a file to the caller over the receive protocol"),
        )
        .with(
            Method::new(SET_FILE_REFERENCES_TO_DOWNLOAD, "S", "i", move |call: RpcCall| {
                set_file_references_to_download(&download, call);
            })
            .description("Start downloading the given file references"),
        )
}

fn get_config(dispatcher: &Dispatcher, call: RpcCall) {
    let RpcCall { params, responder } = call;
    let body = match params.data(0).map(GetConfigRequest::decode) {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            responder.fail(
                cfgsync_core::frame::error_code::WRONG_PARAMS,
                format!("malformed getConfig request: {e}"),
            );
            return;
        }
        Err(e) => {
            responder.fail(cfgsync_core::frame::error_code::WRONG_PARAMS, e.to_string());
            return;
        }
    };
    trace!("Received {}", body.short_description());
    dispatcher
        .liveness()
        .received_request_from(&body.client_hostname);
    dispatcher.submit_config_request(ConfigRequest::new(body, responder), false);
}

fn serve_file(dispatcher: &Dispatcher, call: RpcCall) {
    let RpcCall { params, responder } = call;
    let (reference, flags) = match (params.string(0), params.int32(1)) {
        (Ok(reference), Ok(flags)) => (FileReference::new(reference), flags),
        (Err(e), _) | (_, Err(e)) => {
            responder.fail(cfgsync_core::frame::error_code::WRONG_PARAMS, e.to_string());
            return;
        }
    };
    dispatcher.submit(Box::new(ServeFileTask {
        dispatcher: dispatcher.clone(),
        reference,
        download_if_missing: flags == 0,
        responder,
    }));
}

fn set_file_references_to_download(dispatcher: &Dispatcher, call: RpcCall) {
    let RpcCall { params, responder } = call;
    let references = match params.string_array(0) {
        Ok(references) => references,
        Err(e) => {
            responder.fail(cfgsync_core::frame::error_code::WRONG_PARAMS, e.to_string());
            return;
        }
    };
    debug!(count = references.len(), "Downloading file references");
    for reference in references {
        dispatcher
            .file_server()
            .start_download(FileReference::new(reference.as_str()));
    }
    responder.respond(vec![Value::Int32(0)]);
}

/// Pushes one file to the caller, holding a worker for the whole transfer.
struct ServeFileTask {
    dispatcher: Dispatcher,
    reference: FileReference,
    download_if_missing: bool,
    responder: Responder,
}

impl Task for ServeFileTask {
    fn name(&self) -> &'static str {
        "serveFile"
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Self {
                dispatcher,
                reference,
                download_if_missing,
                responder,
            } = *self;
            let target = Arc::clone(responder.connection());
            let outcome = dispatcher
                .file_server()
                .serve_file(&reference, download_if_missing, target.as_ref())
                .await;
            if !target.is_valid() {
                responder.abandon();
                return;
            }
            responder.respond(vec![
                Value::Int32(outcome.status.code()),
                Value::String(outcome.message),
            ]);
        })
    }

    fn reject(self: Box<Self>, reason: Rejection) {
        let message = match reason {
            Rejection::QueueFull => {
                "serveFile request queue size is larger than configured max limit"
            }
            Rejection::ShuttingDown => "server is shutting down",
        };
        self.responder.fail(error_code::INTERNAL_ERROR, message);
    }
}
