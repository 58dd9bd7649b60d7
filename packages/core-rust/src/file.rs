//! File reference types and the chunked transfer method names.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Method names of the chunked transfer sub-protocol, invoked by the server
/// on the connection of the peer that asked for a file.
pub mod methods {
    pub const RECEIVE_META: &str = "filedistribution.receiveFileMeta";
    pub const RECEIVE_PART: &str = "filedistribution.receiveFilePart";
    pub const RECEIVE_EOF: &str = "filedistribution.receiveFileEof";
}

/// Content-addressed name of an immutable blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileReference(String);

impl FileReference {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the receiver should store the transferred bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// A single plain file.
    File,
    /// A compressed archive of a directory, unpacked by the receiver.
    Compressed,
}

impl FileType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Compressed => "compressed",
        }
    }

    /// Parses the wire name. Unknown names yield `None`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(Self::File),
            "compressed" => Some(Self::Compressed),
            _ => None,
        }
    }
}

/// Metadata sent ahead of the file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReferenceMeta {
    pub reference: FileReference,
    pub filename: String,
    pub file_type: FileType,
    pub size: i64,
}

/// Whether the read side of a transfer completed cleanly, reported in EOF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStatus {
    pub code: i32,
    pub description: String,
}

impl ReplayStatus {
    pub const OK_CODE: i32 = 0;
    pub const READ_FAILED_CODE: i32 = 1;

    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: Self::OK_CODE,
            description: "OK".to_string(),
        }
    }

    #[must_use]
    pub fn read_failed(description: impl Into<String>) -> Self {
        Self {
            code: Self::READ_FAILED_CODE,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Self::OK_CODE
    }
}
