//! Classification of OS-level socket errors.
//!
//! The I/O engine never looks at raw error codes itself; it asks a [`ClassificationTable`] what a
//! failed attempt means and acts on the answer. The process-wide table is built on first use and
//! never mutated afterwards.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::LazyLock;

/// What a failed (or empty) socket attempt means for the operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// No error code is set.
    ///
    /// On a read this is the end-of-stream signal of a closed peer.
    None,

    /// Transient condition, the attempt may be repeated.
    Retry,

    /// Abort this operation only, the connection stays usable.
    Skip,

    /// The peer is gone, the connection must be torn down.
    Fatal,

    /// Unrecognised code, must never be absorbed silently.
    Unknown,
}

/// The direction of the socket attempt being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Receiving bytes or datagrams.
    Read,

    /// Sending bytes or datagrams.
    Write,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("reading"),
            Self::Write => f.write_str("writing"),
        }
    }
}

static PLATFORM: LazyLock<ClassificationTable> = LazyLock::new(ClassificationTable::platform);

/// Immutable mapping from raw OS error codes to [`Classification`]s.
#[derive(Debug, Clone, Default)]
pub struct ClassificationTable {
    codes: HashMap<i32, Classification>,
}

impl ClassificationTable {
    /// Returns the process-wide table for the current platform.
    pub fn global() -> &'static Self {
        &PLATFORM
    }

    /// Builds a table from `(code, classification)` entries.
    ///
    /// Later entries replace earlier ones. Platforms alias some codes (`EWOULDBLOCK` is `EAGAIN`
    /// on Linux), the order of entries decides which meaning wins.
    pub fn from_entries(entries: impl IntoIterator<Item = (i32, Classification)>) -> Self {
        Self {
            codes: entries.into_iter().collect(),
        }
    }

    /// Builds the table for the current platform.
    pub fn platform() -> Self {
        Self::from_entries([
            (libc::EWOULDBLOCK, Classification::None),
            (libc::EAGAIN, Classification::Retry),
            (libc::EINTR, Classification::Retry),
            (libc::ENOBUFS, Classification::Retry),
            (libc::EMFILE, Classification::Retry),
            (libc::ENFILE, Classification::Retry),
            (libc::EMSGSIZE, Classification::Skip),
            (libc::EHOSTUNREACH, Classification::Skip),
            (libc::ENETUNREACH, Classification::Skip),
            (libc::EPIPE, Classification::Fatal),
            (libc::ENOTCONN, Classification::Fatal),
            (libc::ECONNABORTED, Classification::Fatal),
            (libc::ECONNRESET, Classification::Fatal),
            (libc::ECONNREFUSED, Classification::Fatal),
            (libc::ETIMEDOUT, Classification::Fatal),
        ])
    }

    /// Returns the raw entry for `code`, without logging.
    pub fn lookup(&self, code: i32) -> Option<Classification> {
        self.codes.get(&code).copied()
    }

    /// Classifies a raw OS error `code` observed while performing `operation`.
    ///
    /// Code `0` means no error is set and is always [`Classification::None`].
    pub fn classify(&self, code: i32, operation: Operation) -> Classification {
        if code == 0 {
            return Classification::None;
        }

        match self.lookup(code) {
            Some(classification) => {
                if !matches!(
                    classification,
                    Classification::None | Classification::Retry
                ) {
                    tracing::warn!(
                        code,
                        %operation,
                        error = %io::Error::from_raw_os_error(code),
                        "socket error",
                    );
                }
                classification
            }
            None => {
                tracing::error!(
                    code,
                    %operation,
                    error = %io::Error::from_raw_os_error(code),
                    "unknown socket error",
                );
                Classification::Unknown
            }
        }
    }

    /// Classifies an [`io::Error`] observed while performing `operation`.
    ///
    /// Errors carrying an OS code go through the table; synthetic errors are classified by kind.
    pub fn classify_io(&self, error: &io::Error, operation: Operation) -> Classification {
        if let Some(code) = error.raw_os_error() {
            return self.classify(code, operation);
        }

        match error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Classification::Retry,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Classification::Fatal,
            _ => {
                tracing::error!(?error, %operation, "unknown socket error");
                Classification::Unknown
            }
        }
    }
}
