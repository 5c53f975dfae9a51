//! Relay mesh error types

use std::io;
use thiserror::Error;

use crate::protocol::RelayErrorCode;

/// Errors on a single relay connection
#[derive(Debug, Error)]
pub enum RelayError {
    /// Network I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An operation did not finish in time
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// A frame could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// A frame exceeded the protocol limit
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Declared size
        size: usize,
        /// Protocol limit
        limit: usize,
    },

    /// An inbound frame declared a length over the protocol limit
    #[error("inbound frame exceeds limit of {limit} bytes")]
    FrameTooLong {
        /// Protocol limit
        limit: usize,
    },

    /// The peer sent something the protocol does not allow here
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peers speak different protocol versions
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Our version
        ours: u8,
        /// Their version
        theirs: u8,
    },

    /// The client's signature did not verify
    #[error("authentication failed")]
    AuthFailed,

    /// The relay refused us with an error frame
    #[error("relay error {code:?}: {message}")]
    Rejected {
        /// Relay error code
        code: RelayErrorCode,
        /// Relay-supplied text
        message: String,
    },

    /// The remote end closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Nothing was received within the liveness window
    #[error("no frames received for {0:?}")]
    LivenessTimeout(std::time::Duration),

    /// The link was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    /// Whether retrying may succeed.
    ///
    /// Every connection failure is transient; only cancellation is final.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RelayError::Cancelled)
    }
}

impl From<bincode::Error> for RelayError {
    fn from(err: bincode::Error) -> Self {
        RelayError::Codec(err.to_string())
    }
}

/// A relay address failed to parse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Input was empty or whitespace
    #[error("empty relay address")]
    Empty,

    /// No port was given
    #[error("relay address {0:?} has no port")]
    MissingPort(String),

    /// Port was zero or out of range
    #[error("relay address {0:?} has an invalid port")]
    InvalidPort(String),

    /// Scheme other than `tcp` or `relay`
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    /// Anything else wrong with the address
    #[error("malformed relay address {0:?}: {1}")]
    Malformed(String, String),
}

/// Identity material could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// Not valid hex
    #[error("identity is not valid hex")]
    InvalidHex,

    /// Wrong number of bytes
    #[error("identity must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Errors from [`crate::AddressMesh`]
#[derive(Debug, Error)]
pub enum MeshError {
    /// The mesh has been closed
    #[error("mesh is closed")]
    Closed,

    /// An address in the set was invalid; nothing was changed
    #[error("invalid relay address: {0}")]
    InvalidAddress(#[from] AddressError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancellation_is_final() {
        assert!(!RelayError::Cancelled.is_transient());
        assert!(RelayError::ConnectionClosed.is_transient());
        assert!(RelayError::AuthFailed.is_transient());
        assert!(RelayError::Timeout("connect").is_transient());
        assert!(RelayError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RelayError::Timeout("handshake").to_string(),
            "timed out during handshake"
        );
        assert_eq!(
            MeshError::from(AddressError::Empty).to_string(),
            "invalid relay address: empty relay address"
        );
    }
}
