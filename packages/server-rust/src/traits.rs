use async_trait::async_trait;
use cfgsync_core::config::error_code;
use cfgsync_core::{ApplicationId, FileReference, GetConfigRequest, GetConfigResponse, TenantName};

use crate::filedistribution::FileReferenceData;

/// Why a config could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown config '{name}'")]
    UnknownConfig { name: String },
    #[error("application {0} is not loaded")]
    ApplicationNotLoaded(ApplicationId),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ResolveError {
    /// Config protocol error code reported to the client.
    #[must_use]
    pub fn error_code(&self) -> u32 {
        match self {
            Self::UnknownConfig { .. } => error_code::UNKNOWN_CONFIG,
            Self::ApplicationNotLoaded(_) => error_code::APPLICATION_NOT_LOADED,
            Self::Failed(_) => error_code::INTERNAL_ERROR,
        }
    }
}

/// Produces the current config for a request within one application.
/// Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(
        &self,
        application: &ApplicationId,
        request: &GetConfigRequest,
    ) -> Result<GetConfigResponse, ResolveError>;
}

/// Maps a client hostname onto the application serving it.
pub trait TenantRouter: Send + Sync {
    fn resolve_application(&self, hostname: &str) -> Option<ApplicationId>;

    /// Forgets every host and application of `tenant`.
    fn remove_tenant(&self, _tenant: &TenantName) {}
}

/// Local store of distributable files.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Opens `reference` for streaming. `Ok(None)` means it is not stored here.
    async fn open(&self, reference: &FileReference) -> anyhow::Result<Option<FileReferenceData>>;
}

/// Fetches files this node is missing from elsewhere.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    async fn download_if_needed(&self, reference: FileReference) -> anyhow::Result<()>;
}

/// Lifecycle events from the config store.
#[async_trait]
pub trait ReloadListener: Send + Sync {
    /// A new generation of `application` is live.
    async fn config_activated(&self, application: &ApplicationId, generation: i64);

    async fn application_removed(&self, application: &ApplicationId);

    async fn tenant_removed(&self, tenant: &TenantName);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_error_codes() {
        assert_eq!(
            ResolveError::UnknownConfig { name: "x".into() }.error_code(),
            error_code::UNKNOWN_CONFIG
        );
        assert_eq!(
            ResolveError::ApplicationNotLoaded(ApplicationId::default_application()).error_code(),
            error_code::APPLICATION_NOT_LOADED
        );
        assert_eq!(
            ResolveError::from(anyhow::anyhow!("boom")).error_code(),
            error_code::INTERNAL_ERROR
        );
    }
}
