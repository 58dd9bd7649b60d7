//! File distribution: serving stored files to clients over the chunked
//! receive protocol, and the receiving side of that protocol.

pub mod channel;
pub mod receiver;
pub mod server;
pub mod source;

pub use channel::{ChunkedFileChannel, FileReceiverTarget, TransferError, TransferSummary};
pub use receiver::{FileReceiver, ReceivedFile};
pub use server::{FileServer, ServeOutcome, ServeStatus};
pub use source::{DirectoryFileSource, FileReferenceData};
