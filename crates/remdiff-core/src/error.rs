//! Error types for remdiff-core.

use thiserror::Error;

use crate::sftp::consts::FX_NO_SUCH_FILE;

/// Main error type for remdiff operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local operating-system I/O failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// An operand resolves to a directory; comparison refuses.
    #[error("{0}: is a directory")]
    IsDirectory(String),

    /// Inbound SFTP packet malformed, truncated, or of an unexpected type.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The inbound stream reached end-of-file unexpectedly.
    #[error("{host}: connection lost")]
    ConnectionLost { host: String },

    /// A STATUS reply with a nonzero code, carrying the server's message.
    #[error("{message}")]
    Sftp { status: u32, message: String },
}

impl Error {
    /// Construct an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Construct a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Returns true if this is an SFTP `NO_SUCH_FILE` status.
    ///
    /// The comparison driver uses this to substitute `/dev/null` for
    /// missing operands when asked to treat new files as empty.
    pub fn is_no_such_file(&self) -> bool {
        matches!(self, Error::Sftp { status, .. } if *status == FX_NO_SUCH_FILE)
    }
}

/// Convenience result type for remdiff operations.
pub type Result<T> = std::result::Result<T, Error>;
