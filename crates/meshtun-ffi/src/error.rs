//! Error handling for the FFI boundary

use std::io;
use std::os::raw::c_int;

use thiserror::Error;

/// Status of calls that do not return a tunnel [`meshtun_core::ErrorCode`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshtunStatus {
    /// Operation succeeded
    Success = 0,
    /// Invalid argument provided
    InvalidArgument = 1,
    /// The boundary could not be created
    InitFailed = 2,
}

impl MeshtunStatus {
    /// Raw value returned to C
    pub fn as_c_int(self) -> c_int {
        self as c_int
    }
}

/// Failures inside the boundary adapter
#[derive(Debug, Error)]
pub enum BoundaryError {
    /// The tokio runtime could not be built
    #[error("failed to build runtime: {0}")]
    Runtime(#[source] io::Error),

    /// A C argument was null or not valid UTF-8
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BoundaryError {
    /// Status reported to C for this failure
    pub fn status(&self) -> MeshtunStatus {
        match self {
            BoundaryError::Runtime(_) => MeshtunStatus::InitFailed,
            BoundaryError::InvalidArgument(_) => MeshtunStatus::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_values() {
        assert_eq!(MeshtunStatus::Success.as_c_int(), 0);
        assert_eq!(MeshtunStatus::InvalidArgument.as_c_int(), 1);
        assert_eq!(MeshtunStatus::InitFailed.as_c_int(), 2);
    }

    #[test]
    fn test_error_status() {
        let err = BoundaryError::Runtime(io::Error::other("no threads"));
        assert_eq!(err.status(), MeshtunStatus::InitFailed);
        assert!(err.to_string().contains("no threads"));

        let err = BoundaryError::InvalidArgument("address 0 is null".into());
        assert_eq!(err.status(), MeshtunStatus::InvalidArgument);
    }
}
