//! Answers `serveFile` requests by pushing the file to the caller.

use std::sync::Arc;
use std::time::Duration;

use cfgsync_core::FileReference;
use tracing::{debug, info, warn};

use super::channel::{ChunkedFileChannel, FileReceiverTarget};
use crate::traits::{FileDownloader, FileSource};

/// Status returned by `serveFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStatus {
    Ok,
    NotFound,
    TransferFailed,
}

impl ServeStatus {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::NotFound => 1,
            Self::TransferFailed => 2,
        }
    }

    fn outcome(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::TransferFailed => "failed",
        }
    }
}

/// Result of one `serveFile` call: status plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOutcome {
    pub status: ServeStatus,
    pub message: String,
}

impl ServeOutcome {
    fn new(status: ServeStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

pub struct FileServer {
    source: Arc<dyn FileSource>,
    downloader: Arc<dyn FileDownloader>,
    chunk_size: usize,
    invoke_timeout: Duration,
}

impl FileServer {
    pub fn new(
        source: Arc<dyn FileSource>,
        downloader: Arc<dyn FileDownloader>,
        chunk_size: usize,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            source,
            downloader,
            chunk_size,
            invoke_timeout,
        }
    }

    /// Sends `reference` to `target`.
    ///
    /// A missing file is reported as [`ServeStatus::NotFound`]. With
    /// `download_if_missing` a download is started in the background first,
    /// so a later request can succeed; this call does not wait for it.
    pub async fn serve_file(
        &self,
        reference: &FileReference,
        download_if_missing: bool,
        target: &dyn FileReceiverTarget,
    ) -> ServeOutcome {
        let outcome = self
            .transfer(reference, download_if_missing, target)
            .await;
        metrics::counter!("cfgsync_file_transfers_total", "outcome" => outcome.status.outcome())
            .increment(1);
        outcome
    }

    async fn transfer(
        &self,
        reference: &FileReference,
        download_if_missing: bool,
        target: &dyn FileReceiverTarget,
    ) -> ServeOutcome {
        let data = match self.source.open(reference).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                if download_if_missing {
                    self.start_download(reference.clone());
                }
                debug!(reference = %reference, "File not found");
                return ServeOutcome::new(
                    ServeStatus::NotFound,
                    format!("file reference '{reference}' not found"),
                );
            }
            Err(e) => {
                warn!(reference = %reference, "Failed to open file: {e:#}");
                return ServeOutcome::new(
                    ServeStatus::TransferFailed,
                    format!("failed to open '{reference}': {e}"),
                );
            }
        };

        let channel = ChunkedFileChannel::new(target, self.chunk_size, self.invoke_timeout);
        match channel.send(data).await {
            Ok(summary) => {
                info!(
                    reference = %reference,
                    target = %target.describe(),
                    bytes = summary.bytes,
                    parts = summary.parts,
                    "File served"
                );
                ServeOutcome::new(ServeStatus::Ok, "OK")
            }
            Err(e) => {
                warn!(reference = %reference, "File transfer failed: {e}");
                ServeOutcome::new(ServeStatus::TransferFailed, e.to_string())
            }
        }
    }

    /// Starts downloading `reference` without waiting for it.
    pub fn start_download(&self, reference: FileReference) {
        let downloader = Arc::clone(&self.downloader);
        tokio::spawn(async move {
            if let Err(e) = downloader.download_if_needed(reference.clone()).await {
                warn!(reference = %reference, "Download failed: {e:#}");
            }
        });
    }
}

impl std::fmt::Debug for FileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServer")
            .field("chunk_size", &self.chunk_size)
            .field("invoke_timeout", &self.invoke_timeout)
            .finish_non_exhaustive()
    }
}
