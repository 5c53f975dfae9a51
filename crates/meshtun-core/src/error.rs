//! Error types for the meshtun core.
//!
//! Errors that cross the foreign boundary are collapsed into [`ErrorCode`],
//! a closed set of small negative integers. Everything else stays a rich
//! `thiserror` type inside the process.

use std::io;
use thiserror::Error;

/// Stable codes returned across the foreign boundary.
///
/// Values are never reused for a different meaning. `-1` is reserved.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Tunnel opened
    Success = 0,
    /// Duplication of the inbound (read) handle failed
    DupRead = -2,
    /// Duplication of the outbound (write) handle failed
    DupWrite = -3,
    /// The pipe could not be constructed from the duplicated handles
    OpenPipe = -4,
    /// The tunnel session could not be constructed or started
    NewTunnel = -5,
}

impl ErrorCode {
    /// Raw integer value handed to the host
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ErrorCode {
    /// The unrecognized value
    type Error = i32;

    fn try_from(code: i32) -> std::result::Result<Self, i32> {
        match code {
            0 => Ok(ErrorCode::Success),
            -2 => Ok(ErrorCode::DupRead),
            -3 => Ok(ErrorCode::DupWrite),
            -4 => Ok(ErrorCode::OpenPipe),
            -5 => Ok(ErrorCode::NewTunnel),
            other => Err(other),
        }
    }
}

/// Failures while turning host handles into a [`crate::pipe::TunnelPipe`]
#[derive(Debug, Error)]
pub enum PipeError {
    /// Duplicating the read handle failed; nothing is held
    #[error("failed to duplicate read handle {fd}: {source}")]
    DupRead {
        /// The caller's original descriptor
        fd: i32,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// Duplicating the write handle failed; the read duplicate was released
    #[error("failed to duplicate write handle {fd}: {source}")]
    DupWrite {
        /// The caller's original descriptor
        fd: i32,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// Both duplicates exist but could not be turned into async halves
    #[error("failed to open pipe: {0}")]
    Open(#[source] io::Error),
}

impl PipeError {
    /// Boundary code for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            PipeError::DupRead { .. } => ErrorCode::DupRead,
            PipeError::DupWrite { .. } => ErrorCode::DupWrite,
            PipeError::Open(_) => ErrorCode::OpenPipe,
        }
    }
}

/// Handshake failures on the tunnel protocol
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Reading or writing the header line failed
    #[error("handshake failed: {0}")]
    Io(#[from] io::Error),

    /// The header did not arrive in time
    #[error("handshake failed: timed out")]
    Timeout,

    /// The session was cancelled during the handshake
    #[error("handshake failed: cancelled")]
    Cancelled,

    /// The peer sent more than one header line's worth of bytes
    #[error("handshake failed: header exceeds {0} bytes")]
    Oversize(usize),

    /// The peer's header was malformed or incompatible
    #[error("validate header: {0}")]
    InvalidHeader(String),
}

/// Errors from a running tunnel session
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Handshake with the manager failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// I/O on the pipe failed
    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),

    /// A message exceeded the configured maximum size
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Declared size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// An inbound frame declared a length over the configured maximum
    #[error("inbound frame exceeds limit of {limit} bytes")]
    FrameTooLong {
        /// Configured limit
        limit: usize,
    },

    /// A message could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// The session has shut down
    #[error("tunnel closed")]
    Closed,

    /// The network backend rejected a request
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<bincode::Error> for TunnelError {
    fn from(err: bincode::Error) -> Self {
        TunnelError::Codec(err.to_string())
    }
}

/// Failures of the end-to-end open-tunnel operation
#[derive(Debug, Error)]
pub enum OpenTunnelError {
    /// Handle duplication or pipe construction failed
    #[error(transparent)]
    Pipe(#[from] PipeError),

    /// Session construction failed; the pipe has already been closed
    #[error("failed to start tunnel session: {0}")]
    Session(#[source] TunnelError),
}

impl OpenTunnelError {
    /// Boundary code for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            OpenTunnelError::Pipe(err) => err.code(),
            OpenTunnelError::Session(_) => ErrorCode::NewTunnel,
        }
    }
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Success.as_i32(), 0);
        assert_eq!(ErrorCode::DupRead.as_i32(), -2);
        assert_eq!(ErrorCode::DupWrite.as_i32(), -3);
        assert_eq!(ErrorCode::OpenPipe.as_i32(), -4);
        assert_eq!(ErrorCode::NewTunnel.as_i32(), -5);
    }

    #[test]
    fn test_error_code_conversion() {
        for code in [
            ErrorCode::Success,
            ErrorCode::DupRead,
            ErrorCode::DupWrite,
            ErrorCode::OpenPipe,
            ErrorCode::NewTunnel,
        ] {
            assert_eq!(ErrorCode::try_from(code.as_i32()), Ok(code));
        }
    }

    #[test]
    fn test_unknown_codes_are_not_mapped() {
        assert_eq!(ErrorCode::try_from(-1), Err(-1));
        assert_eq!(ErrorCode::try_from(-6), Err(-6));
        assert_eq!(ErrorCode::try_from(42), Err(42));
    }

    #[test]
    fn test_pipe_error_codes() {
        let err = PipeError::DupRead {
            fd: 3,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert_eq!(err.code(), ErrorCode::DupRead);

        let err = PipeError::DupWrite {
            fd: 4,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert_eq!(err.code(), ErrorCode::DupWrite);

        let err = PipeError::Open(io::Error::other("epoll"));
        assert_eq!(err.code(), ErrorCode::OpenPipe);
    }

    #[test]
    fn test_open_tunnel_error_codes() {
        let err: OpenTunnelError = PipeError::Open(io::Error::other("x")).into();
        assert_eq!(err.code(), ErrorCode::OpenPipe);

        let err = OpenTunnelError::Session(TunnelError::Closed);
        assert_eq!(err.code(), ErrorCode::NewTunnel);
    }

    #[test]
    fn test_handshake_error_display() {
        let err = HandshakeError::InvalidHeader("unknown role".into());
        assert_eq!(err.to_string(), "validate header: unknown role");

        let err = HandshakeError::Timeout;
        assert!(err.to_string().starts_with("handshake failed"));
    }
}
