//! Method table: name lookup, parameter signature checks and hand-off to
//! handlers.

use std::collections::HashMap;
use std::sync::Arc;

use cfgsync_core::frame::error_code;
use cfgsync_core::value::check_signature;
use cfgsync_core::{RpcRequest, Value};
use tracing::trace;

use super::connection::{ConnectionHandle, Responder};

/// An inbound call whose parameters already match the method signature.
#[derive(Debug)]
pub struct RpcCall {
    pub params: Vec<Value>,
    pub responder: Responder,
}

/// Handles calls to one method.
///
/// Runs on the connection's reader task and must not block: either answer
/// immediately or move the [`Responder`] to another task.
pub trait MethodHandler: Send + Sync {
    fn invoke(&self, call: RpcCall);
}

impl<F> MethodHandler for F
where
    F: Fn(RpcCall) + Send + Sync,
{
    fn invoke(&self, call: RpcCall) {
        self(call);
    }
}

/// A registered method.
pub struct Method {
    pub name: &'static str,
    /// Parameter type codes, see [`Value::type_code`].
    pub param_types: &'static str,
    pub return_types: &'static str,
    pub description: &'static str,
    handler: Arc<dyn MethodHandler>,
}

impl Method {
    pub fn new(
        name: &'static str,
        param_types: &'static str,
        return_types: &'static str,
        handler: impl MethodHandler + 'static,
    ) -> Self {
        Self {
            name,
            param_types,
            return_types,
            description: "",
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("param_types", &self.param_types)
            .field("return_types", &self.return_types)
            .finish_non_exhaustive()
    }
}

/// Methods a connection answers to, keyed by name.
#[derive(Debug, Default)]
pub struct MethodTable {
    methods: HashMap<&'static str, Method>,
}

impl MethodTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `method`, replacing any method of the same name.
    #[must_use]
    pub fn with(mut self, method: Method) -> Self {
        self.methods.insert(method.name, method);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Dispatches one inbound request from `connection`.
    ///
    /// Unknown methods get `NO_SUCH_METHOD`, mismatched parameters get
    /// `WRONG_PARAMS`; everything else goes to the handler.
    pub fn dispatch(&self, request: RpcRequest, connection: &Arc<ConnectionHandle>) {
        let Some(method) = self.methods.get(request.method.as_str()) else {
            Responder::new(request.id, Arc::clone(connection), "").fail(
                error_code::NO_SUCH_METHOD,
                format!("No such method: '{}'", request.method),
            );
            return;
        };
        let responder = Responder::new(request.id, Arc::clone(connection), method.return_types);
        if let Err(e) = check_signature(method.param_types, &request.params) {
            responder.fail(
                error_code::WRONG_PARAMS,
                format!("Illegal parameters for '{}': {e}", method.name),
            );
            return;
        }
        trace!(
            connection = connection.id.0,
            request_id = request.id,
            method = method.name,
            "Dispatching request"
        );
        method.handler.invoke(RpcCall {
            params: request.params,
            responder,
        });
    }
}

#[cfg(test)]
mod tests {
    use cfgsync_core::{Frame, ReplyBody};
    use tokio::sync::mpsc;

    use super::*;
    use crate::network::config::ConnectionConfig;
    use crate::network::connection::{ConnectionRegistry, OutboundMessage};

    fn table() -> MethodTable {
        MethodTable::new()
            .with(Method::new("ping", "", "i", |call: RpcCall| {
                call.responder.respond(vec![Value::Int32(0)]);
            }))
            .with(Method::new("echo", "s", "s", |call: RpcCall| {
                let RpcCall { params, responder } = call;
                responder.respond(params);
            }))
    }

    async fn reply(rx: &mut mpsc::Receiver<OutboundMessage>) -> ReplyBody {
        match rx.recv().await.unwrap() {
            OutboundMessage::Frame(bytes) => match Frame::decode(&bytes).unwrap() {
                Frame::Reply(reply) => reply.body,
                Frame::Request(_) => panic!("expected a reply"),
            },
            OutboundMessage::Close(_) => panic!("expected a frame"),
        }
    }

    fn request(method: &str, params: Vec<Value>) -> RpcRequest {
        RpcRequest {
            id: 1,
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn dispatches_to_handler() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = registry.register("peer", &ConnectionConfig::default());
        let table = table();

        table.dispatch(request("ping", vec![]), &conn);
        assert_eq!(reply(&mut rx).await, ReplyBody::Values(vec![Value::Int32(0)]));

        table.dispatch(request("echo", vec![Value::String("hi".into())]), &conn);
        assert_eq!(
            reply(&mut rx).await,
            ReplyBody::Values(vec![Value::String("hi".into())])
        );
    }

    #[tokio::test]
    async fn unknown_method_and_wrong_params() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = registry.register("peer", &ConnectionConfig::default());
        let table = table();

        table.dispatch(request("nope", vec![]), &conn);
        assert!(matches!(
            reply(&mut rx).await,
            ReplyBody::Error { code: error_code::NO_SUCH_METHOD, .. }
        ));

        table.dispatch(request("echo", vec![Value::Int32(1)]), &conn);
        assert!(matches!(
            reply(&mut rx).await,
            ReplyBody::Error { code: error_code::WRONG_PARAMS, .. }
        ));
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(table().names(), vec!["echo", "ping"]);
    }
}
