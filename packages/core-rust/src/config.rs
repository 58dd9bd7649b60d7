//! Config protocol messages carried as opaque data blobs by `config.v3.getConfig`.

use serde::{Deserialize, Serialize};

use crate::frame::ProtocolError;

/// Config protocol error codes, returned as RPC error replies.
pub mod error_code {
    pub const UNKNOWN_CONFIG: u32 = 100_000;
    pub const UNKNOWN_DEFINITION: u32 = 100_001;
    pub const UNKNOWN_DEF_MD5: u32 = 100_003;
    pub const ILLEGAL_NAME: u32 = 100_100;
    pub const ILLEGAL_CONFIGID: u32 = 100_102;
    pub const OUTDATED_CONFIG: u32 = 100_200;
    pub const INTERNAL_ERROR: u32 = 100_400;
    pub const APPLICATION_NOT_LOADED: u32 = 100_500;
    pub const ILLEGAL_PROTOCOL_VERSION: u32 = 100_600;
    pub const ILLEGAL_CLIENT_HOSTNAME: u32 = 100_700;
}

/// Config id requested by wildcard subscribers.
pub const WILDCARD_CONFIG_ID: &str = "*";

/// Identifies one config instance: definition name + namespace + config id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigKey {
    pub name: String,
    pub namespace: String,
    pub config_id: String,
}

impl ConfigKey {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        config_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            config_id: config_id.into(),
        }
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.config_id == WILDCARD_CONFIG_ID
    }
}

/// Per-request trace: a verbosity level and the messages collected while the
/// request was processed. Echoed back in the response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub level: i32,
    #[serde(default)]
    pub entries: Vec<String>,
}

impl Trace {
    #[must_use]
    pub fn with_level(level: i32) -> Self {
        Self {
            level,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn should_trace(&self, level: i32) -> bool {
        self.level >= level
    }

    /// Records `message` if the trace level is at least `level`.
    pub fn trace(&mut self, level: i32, message: impl Into<String>) {
        if self.should_trace(level) {
            self.entries.push(message.into());
        }
    }
}

/// A client's request for one config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigRequest {
    pub key: ConfigKey,
    /// Fingerprint of the config definition the client was compiled against.
    pub definition_fingerprint: String,
    pub client_hostname: String,
    /// Generation of the config the client already holds (0 if none).
    pub current_generation: i64,
    /// Fingerprint of the payload the client already holds (empty if none).
    #[serde(default)]
    pub payload_fingerprint: String,
    /// How long the server may hold the request waiting for a change.
    /// Zero or negative disables long-polling.
    pub timeout_ms: i64,
    #[serde(default)]
    pub trace: Trace,
}

impl GetConfigRequest {
    #[must_use]
    pub fn wants_long_poll(&self) -> bool {
        self.timeout_ms > 0
    }

    /// One-line description for logs.
    #[must_use]
    pub fn short_description(&self) -> String {
        format!(
            "name={}, namespace={}, configId={}, host={}, generation={}, timeout={}ms",
            self.key.name,
            self.key.namespace,
            self.key.config_id,
            self.client_hostname,
            self.current_generation,
            self.timeout_ms
        )
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// The server's answer to a [`GetConfigRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigResponse {
    pub key: ConfigKey,
    pub generation: i64,
    pub payload_fingerprint: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub internal_redeploy: bool,
    #[serde(default)]
    pub trace: Trace,
}

impl GetConfigResponse {
    /// Whether this response carries something the requester does not have yet.
    #[must_use]
    pub fn is_change_for(&self, request: &GetConfigRequest) -> bool {
        self.generation > request.current_generation
            || self.payload_fingerprint != request.payload_fingerprint
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
