//! Error types of the socket layer.
//!
//! Expected failures (peer gone, operation skipped, retries exhausted) are not errors: reads
//! return `Ok(None)` and sends return `Ok(false)`. The variants below are the conditions that
//! must reach the caller.

use std::io;

use crate::{AddressFamily, ConfigurationError, Operation, PeerAddress, State};

/// Errors produced by connection resources, channels and virtual connections.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The factory configuration was rejected.
    #[error("invalid configuration")]
    Configuration(#[from] ConfigurationError),

    /// The resource is not in a state that allows the operation.
    #[error("connection resource is {0}")]
    InvalidState(State),

    /// The address does not belong to the configured address family.
    #[error("address {address} is not an {expected} address")]
    AddressFamilyMismatch {
        /// The rejected address.
        address: PeerAddress,

        /// The configured family.
        expected: AddressFamily,
    },

    /// Creating, binding or connecting the socket failed.
    #[error("failed to open socket for {address}")]
    Open {
        /// The address the socket was opened for.
        address: PeerAddress,

        /// The OS error.
        #[source]
        source: io::Error,
    },

    /// The OS reported an error code that has no classification.
    #[error("unrecognised socket error while {operation}")]
    Unknown {
        /// The operation that failed.
        operation: Operation,

        /// The OS error.
        #[source]
        source: io::Error,
    },

    /// A write failed but no error code was set.
    #[error("socket write failed without an error code")]
    Anomalous(#[source] io::Error),

    /// Datagrams must carry at least one byte.
    #[error("can not send an empty datagram")]
    EmptyPayload,

    /// The OS accepted only part of a datagram.
    #[error("could not send the whole datagram: {written} of {expected} bytes")]
    PartialSend {
        /// Bytes accepted by the OS.
        written: usize,

        /// Length of the datagram.
        expected: usize,
    },
}
