//! Relay mesh for meshtun.
//!
//! Maintains one self-healing connection per configured relay address and
//! forwards the peer presence each relay reports to a
//! [`meshtun_core::PresenceSink`].
//!
//! # Components
//!
//! - [`AddressMesh`] - owns the address set and applies diffs to it
//! - [`RelayLink`] - one connect/watch/reconnect loop per relay
//! - [`protocol`] - the length-prefixed relay wire protocol
//! - [`RelayServer`] - a reference relay for tests and small deployments
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshtun_core::PresenceTable;
//! use meshtun_relay::{AddressMesh, Identity, MeshConfig};
//!
//! # async fn run() -> Result<(), meshtun_relay::MeshError> {
//! let presence = Arc::new(PresenceTable::new());
//! let mesh = AddressMesh::new(
//!     Arc::new(Identity::generate()),
//!     MeshConfig::default(),
//!     presence.clone(),
//! );
//! mesh.set_addresses(["relay-eu.example.com:7400", "relay-us.example.com:7400"])?;
//! // ...
//! mesh.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod backoff;
pub mod config;
pub mod error;
pub mod identity;
pub mod link;
pub mod mesh;
pub mod protocol;
pub mod server;

pub use address::RelayAddress;
pub use backoff::{Backoff, BackoffConfig};
pub use config::MeshConfig;
pub use error::{AddressError, IdentityError, MeshError, RelayError};
pub use identity::Identity;
pub use link::{LinkId, LinkStatus, RelayLink};
pub use mesh::{AddressMesh, LinkSnapshot, MeshDiff};
pub use protocol::{RelayErrorCode, RelayMessage};
pub use server::{RelayServer, RelayServerConfig};
