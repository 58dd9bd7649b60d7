//! Shared fixtures for service tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfgsync_core::{
    ApplicationId, ConfigKey, FileReference, Frame, GetConfigRequest, GetConfigResponse,
    ReplyBody, TenantName, Value,
};
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::request::ConfigRequest;
use crate::filedistribution::FileReferenceData;
use crate::network::{
    ConnectionConfig, ConnectionHandle, ConnectionRegistry, OutboundMessage, Responder,
};
use crate::traits::{ConfigResolver, FileDownloader, FileSource, ResolveError, TenantRouter};

pub fn app(tenant: &str, name: &str) -> ApplicationId {
    ApplicationId::new(TenantName::new(tenant), name, "default")
}

pub fn connection() -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
    ConnectionRegistry::new().register("client", &ConnectionConfig::default())
}

pub fn get_config(host: &str, generation: i64, fingerprint: &str, timeout_ms: i64) -> GetConfigRequest {
    GetConfigRequest {
        key: ConfigKey::new("sentinel", "cloud.config", "search/qrs/0"),
        definition_fingerprint: "def-md5".to_string(),
        client_hostname: host.to_string(),
        current_generation: generation,
        payload_fingerprint: fingerprint.to_string(),
        timeout_ms,
        trace: cfgsync_core::Trace::default(),
    }
}

pub fn config_request(
    connection: &Arc<ConnectionHandle>,
    id: u64,
    body: GetConfigRequest,
) -> ConfigRequest {
    ConfigRequest::new(body, Responder::new(id, Arc::clone(connection), "x"))
}

pub fn response(generation: i64, fingerprint: &str) -> GetConfigResponse {
    GetConfigResponse {
        key: ConfigKey::new("sentinel", "cloud.config", "search/qrs/0"),
        generation,
        payload_fingerprint: fingerprint.to_string(),
        payload: fingerprint.as_bytes().to_vec(),
        internal_redeploy: false,
        trace: cfgsync_core::Trace::default(),
    }
}

/// Next reply written to the connection, with its request id.
pub async fn next_reply(rx: &mut mpsc::Receiver<OutboundMessage>) -> (u64, ReplyBody) {
    match rx.recv().await.expect("connection closed") {
        OutboundMessage::Frame(bytes) => match Frame::decode(&bytes).unwrap() {
            Frame::Reply(reply) => (reply.id, reply.body),
            Frame::Request(request) => panic!("unexpected request {request:?}"),
        },
        OutboundMessage::Close(reason) => panic!("unexpected close {reason:?}"),
    }
}

/// Decodes a successful `getConfig` reply.
pub fn config_of(body: ReplyBody) -> GetConfigResponse {
    match body {
        ReplyBody::Values(values) => match values.as_slice() {
            [Value::Data(bytes)] => GetConfigResponse::decode(bytes).unwrap(),
            other => panic!("unexpected values {other:?}"),
        },
        ReplyBody::Error { code, message } => panic!("error {code}: {message}"),
    }
}

pub fn error_of(body: ReplyBody) -> (u32, String) {
    match body {
        ReplyBody::Error { code, message } => (code, message),
        ReplyBody::Values(values) => panic!("expected error, got {values:?}"),
    }
}

pub fn assert_no_reply(rx: &mut mpsc::Receiver<OutboundMessage>) {
    assert!(rx.try_recv().is_err(), "unexpected outbound message");
}

/// Resolver serving a fixed generation and fingerprint per application,
/// optionally slowed down. The config is read when the call starts.
#[derive(Debug, Default)]
pub struct StaticResolver {
    configs: DashMap<ApplicationId, (i64, String)>,
    pub delay: Option<Duration>,
    pub calls: std::sync::atomic::AtomicUsize,
}

impl StaticResolver {
    pub fn set(&self, application: &ApplicationId, generation: i64, fingerprint: &str) {
        self.configs
            .insert(application.clone(), (generation, fingerprint.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigResolver for StaticResolver {
    async fn resolve(
        &self,
        application: &ApplicationId,
        request: &GetConfigRequest,
    ) -> Result<GetConfigResponse, ResolveError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let current = self.configs.get(application).map(|e| e.value().clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let Some((generation, fingerprint)) = current else {
            return Err(ResolveError::ApplicationNotLoaded(application.clone()));
        };
        let mut response = response(generation, &fingerprint);
        response.key = request.key.clone();
        Ok(response)
    }
}

/// Router with a fixed host table.
#[derive(Debug, Default)]
pub struct StaticRouter {
    pub hosts: DashMap<String, ApplicationId>,
}

impl TenantRouter for StaticRouter {
    fn resolve_application(&self, hostname: &str) -> Option<ApplicationId> {
        self.hosts.get(hostname).map(|e| e.value().clone())
    }

    fn remove_tenant(&self, tenant: &TenantName) {
        self.hosts.retain(|_, app| app.tenant != *tenant);
    }
}

/// File source that stores nothing.
#[derive(Debug, Default)]
pub struct NoFiles;

#[async_trait]
impl FileSource for NoFiles {
    async fn open(&self, _reference: &FileReference) -> anyhow::Result<Option<FileReferenceData>> {
        Ok(None)
    }
}

/// Downloader that records requests and optionally takes a long time.
#[derive(Debug, Default)]
pub struct RecordingDownloader {
    pub requested: parking_lot::Mutex<Vec<FileReference>>,
    pub delay: Option<Duration>,
}

#[async_trait]
impl FileDownloader for RecordingDownloader {
    async fn download_if_needed(&self, reference: FileReference) -> anyhow::Result<()> {
        self.requested.lock().push(reference);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
