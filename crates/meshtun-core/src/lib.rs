//! # meshtun core
//!
//! Building blocks shared by the relay mesh and the host tunnel:
//!
//! - [`error`]: error types and the stable [`ErrorCode`] taxonomy
//! - [`config`]: per-session configuration
//! - [`presence`]: peer presence reports and the [`PresenceTable`]
//! - [`pipe`]: duplication of host handles into a [`pipe::TunnelPipe`]
//! - [`tunnel`]: the framed manager protocol, log forwarding and sessions

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
#[cfg(unix)]
pub mod pipe;
pub mod presence;
pub mod tunnel;

pub use config::TunnelConfig;
pub use error::{ErrorCode, HandshakeError, OpenTunnelError, PipeError, TunnelError};
pub use presence::{
    PeerChange, PeerKey, PresenceEvent, PresenceKind, PresenceSink, PresenceTable, PresenceUpdate,
};
#[cfg(unix)]
pub use tunnel::open_tunnel;
pub use tunnel::{SessionHandle, SessionOptions, TunnelBackend, TunnelSession};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
