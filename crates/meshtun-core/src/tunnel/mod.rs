//! Tunnel protocol between the host's manager and the network stack.
//!
//! ```text
//! host handles ──dup──▶ TunnelPipe ──▶ Speaker (header + frames) ──▶ session
//!                                          ▲                          │
//!                          TunnelLogLayer ─┘ LogRecord      PeerUpdate ◀┘
//! ```

pub mod log_layer;
pub mod message;
pub mod session;
pub mod speaker;

pub use log_layer::{LogHub, LogQueue, TunnelLogLayer};
pub use message::{
    CommandResponse, LogLevel, LogRecord, ManagerMessage, ManagerPayload, PeerInfo, PeerUpdate,
    StartRequest, TunnelMessage, TunnelPayload,
};
pub use session::{SessionHandle, SessionOptions, TunnelBackend, TunnelSession};
pub use speaker::{ManagerSpeaker, ProtocolVersion, SpeakerRole, TunnelSpeaker};

#[cfg(unix)]
use std::os::fd::RawFd;

#[cfg(unix)]
use crate::config::TunnelConfig;
#[cfg(unix)]
use crate::error::OpenTunnelError;
#[cfg(unix)]
use crate::pipe::{HandleDuplicator, TunnelPipe};

/// Duplicate the host's handles and start a session over the copies.
///
/// Each failure class maps to one [`crate::ErrorCode`] via
/// [`OpenTunnelError::code`]. Nothing acquired by a failed call survives it:
/// a session that fails to start closes its pipe first.
#[cfg(unix)]
pub async fn open_tunnel(
    read_fd: RawFd,
    write_fd: RawFd,
    duplicator: &dyn HandleDuplicator,
    config: TunnelConfig,
    options: SessionOptions,
) -> Result<SessionHandle, OpenTunnelError> {
    let pipe = TunnelPipe::open_with(duplicator, read_fd, write_fd)?;
    tracing::debug!(?pipe, "tunnel pipe opened");
    TunnelSession::start(pipe, config, options)
        .await
        .map_err(OpenTunnelError::Session)
}
