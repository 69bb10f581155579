//! Streaming payloads: what gets sent or received during the one exchange.
//!
//! [`TransferReader`] is the outbound side (file, stdin or archive of several
//! paths), [`TransferWriter`] the inbound side (file in a directory, or
//! stdout). [`Metered`] wraps either and reports progress to a
//! [`TransferMeter`].

mod archive;
mod progress;
mod reader;
mod writer;

use std::io;

pub use archive::{build_archive, ArchiveMethod};
pub use progress::{Metered, ProgressSample, TransferMeter, SAMPLE_PERIOD};
pub use reader::TransferReader;
pub use writer::TransferWriter;

/// Failures of the payload itself, independent of the HTTP exchange.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer payload used before open()")]
    Unopened,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("archive failed: {0}")]
    Archive(String),

    #[error("archive cancelled")]
    Cancelled,
}

impl TransferError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        TransferError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps this error for `AsyncRead`/`AsyncWrite` signatures.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            TransferError::Io { source, .. } => source,
            other => io::Error::other(other),
        }
    }
}

/// Eight hex characters, used when neither the user nor the client named the payload.
pub(crate) fn random_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
