//! Readable file content and the directory-backed [`FileSource`].

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cfgsync_core::{FileReference, FileReferenceMeta, FileType};
use tokio::io::AsyncRead;

use crate::traits::FileSource;

/// An opened file reference: metadata plus a stream of its bytes.
pub struct FileReferenceData {
    pub meta: FileReferenceMeta,
    pub content: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileReferenceData {
    /// In-memory content, mostly for tests and small generated files.
    #[must_use]
    pub fn from_bytes(
        reference: FileReference,
        filename: impl Into<String>,
        file_type: FileType,
        bytes: Vec<u8>,
    ) -> Self {
        let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        Self {
            meta: FileReferenceMeta {
                reference,
                filename: filename.into(),
                file_type,
                size,
            },
            content: Box::new(Cursor::new(bytes)),
        }
    }
}

impl std::fmt::Debug for FileReferenceData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReferenceData")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Files stored as `<root>/<reference>/<filename>`, one file per reference
/// directory.
#[derive(Debug, Clone)]
pub struct DirectoryFileSource {
    root: PathBuf,
}

impl DirectoryFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn reference_dir(&self, reference: &FileReference) -> anyhow::Result<PathBuf> {
        let name = reference.value();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            anyhow::bail!("invalid file reference '{name}'");
        }
        Ok(self.root.join(name))
    }
}

/// Archives are sent as compressed and unpacked by the receiver.
fn file_type_of(filename: &str) -> FileType {
    const COMPRESSED: [&str; 5] = [".tar.gz", ".tgz", ".lz4", ".zst", ".gz"];
    if COMPRESSED.iter().any(|ext| filename.ends_with(ext)) {
        FileType::Compressed
    } else {
        FileType::File
    }
}

#[async_trait]
impl FileSource for DirectoryFileSource {
    async fn open(&self, reference: &FileReference) -> anyhow::Result<Option<FileReferenceData>> {
        let dir = self.reference_dir(reference)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            let file = tokio::fs::File::open(entry.path()).await?;
            return Ok(Some(FileReferenceData {
                meta: FileReferenceMeta {
                    reference: reference.clone(),
                    file_type: file_type_of(&filename),
                    filename,
                    size: i64::try_from(metadata.len())?,
                },
                content: Box::new(file),
            }));
        }
        Ok(None)
    }
}
