//! The set of relay links this process maintains.
//!
//! [`AddressMesh::set_addresses`] diffs the requested address set against
//! the running links: new addresses get a link, dropped addresses have
//! theirs cancelled, and links for unchanged addresses are left alone.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use meshtun_core::PresenceSink;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::address::RelayAddress;
use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::identity::Identity;
use crate::link::{LinkId, LinkStatus, RelayLink};

/// Addresses added and removed by one `set_addresses` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshDiff {
    /// Addresses that got a new link
    pub added: Vec<RelayAddress>,
    /// Addresses whose link was cancelled
    pub removed: Vec<RelayAddress>,
}

impl MeshDiff {
    /// Whether the call changed nothing
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Point-in-time view of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// Relay address
    pub address: RelayAddress,
    /// Link identifier
    pub id: LinkId,
    /// Link state
    pub status: LinkStatus,
}

struct MeshState {
    links: HashMap<RelayAddress, RelayLink>,
    /// Status of removed links that may still be shutting down
    retiring: HashMap<RelayAddress, watch::Receiver<LinkStatus>>,
    config: MeshConfig,
    closed: bool,
}

/// Relay mesh manager
pub struct AddressMesh {
    runtime: Handle,
    identity: Arc<Identity>,
    sink: Arc<dyn PresenceSink>,
    state: Mutex<MeshState>,
}

impl AddressMesh {
    /// Create an empty mesh whose links run on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime; use [`AddressMesh::with_runtime`]
    /// from synchronous code.
    pub fn new(identity: Arc<Identity>, config: MeshConfig, sink: Arc<dyn PresenceSink>) -> Self {
        Self::with_runtime(Handle::current(), identity, config, sink)
    }

    /// Create an empty mesh whose links run on `runtime`
    pub fn with_runtime(
        runtime: Handle,
        identity: Arc<Identity>,
        config: MeshConfig,
        sink: Arc<dyn PresenceSink>,
    ) -> Self {
        Self {
            runtime,
            identity,
            sink,
            state: Mutex::new(MeshState {
                links: HashMap::new(),
                retiring: HashMap::new(),
                config,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the relay address set.
    ///
    /// Every address is validated before anything changes; one invalid
    /// address rejects the whole call. Duplicates collapse after
    /// normalization. Connection failures are never reported here.
    pub fn set_addresses<I, S>(&self, addresses: I) -> Result<MeshDiff, MeshError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let wanted = addresses
            .into_iter()
            .map(|a| RelayAddress::parse(a.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()
            .inspect_err(|e| warn!(error = %e, "rejected relay address set"))?;

        let removed_links;
        let diff = {
            let mut state = self.lock();
            if state.closed {
                warn!("set_addresses called on a closed mesh");
                return Err(MeshError::Closed);
            }

            let stale: Vec<RelayAddress> = state
                .links
                .keys()
                .filter(|addr| !wanted.contains(*addr))
                .cloned()
                .collect();
            removed_links = stale
                .iter()
                .filter_map(|addr| state.links.remove(addr))
                .collect::<Vec<_>>();

            state.retiring.retain(|_, status| !is_finished(status));
            for link in &removed_links {
                state.retiring.insert(link.address().clone(), link.subscribe());
            }

            let mut added = Vec::new();
            for address in wanted {
                if state.links.contains_key(&address) {
                    continue;
                }
                let predecessor = state.retiring.remove(&address);
                let link = RelayLink::spawn_after(
                    &self.runtime,
                    address.clone(),
                    self.identity.clone(),
                    state.config.clone(),
                    self.sink.clone(),
                    predecessor,
                );
                debug!(link = %link.id(), %address, "relay link added");
                state.links.insert(address.clone(), link);
                added.push(address);
            }

            MeshDiff {
                added,
                removed: stale,
            }
        };

        for link in removed_links {
            debug!(link = %link.id(), address = %link.address(), "relay link removed");
            link.cancel();
        }

        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                "relay address set updated"
            );
        }
        Ok(diff)
    }

    /// Cancel every link and wait for their tasks to exit.
    ///
    /// Later `set_addresses` calls fail with [`MeshError::Closed`].
    pub async fn close(&self) {
        let links: Vec<RelayLink> = {
            let mut state = self.lock();
            state.closed = true;
            state.retiring.clear();
            state.links.drain().map(|(_, link)| link).collect()
        };

        for link in &links {
            link.cancel();
        }
        let count = links.len();
        for link in links {
            link.shutdown().await;
        }
        debug!(links = count, "address mesh closed");
    }

    /// Whether [`AddressMesh::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Replace the link configuration; applies to links started afterwards
    pub fn update_config(&self, config: MeshConfig) {
        self.lock().config = config;
    }

    /// Current link configuration
    pub fn config(&self) -> MeshConfig {
        self.lock().config.clone()
    }

    /// Addresses with a running link, sorted
    pub fn active_addresses(&self) -> Vec<RelayAddress> {
        let mut addresses: Vec<_> = self.lock().links.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Every link with its current state, sorted by address
    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut links: Vec<_> = self
            .lock()
            .links
            .values()
            .map(|link| LinkSnapshot {
                address: link.address().clone(),
                id: link.id(),
                status: link.status(),
            })
            .collect();
        links.sort_by(|a, b| a.address.cmp(&b.address));
        links
    }

    /// State of the link for `address`, if one is running
    pub fn link_status(&self, address: &RelayAddress) -> Option<LinkStatus> {
        self.lock().links.get(address).map(RelayLink::status)
    }

    /// Status receiver for the link for `address`
    pub fn subscribe_status(&self, address: &RelayAddress) -> Option<watch::Receiver<LinkStatus>> {
        self.lock().links.get(address).map(RelayLink::subscribe)
    }

    /// Number of running links
    pub fn len(&self) -> usize {
        self.lock().links.len()
    }

    /// Whether no links are running
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_finished(status: &watch::Receiver<LinkStatus>) -> bool {
    *status.borrow() == LinkStatus::Closed || status.has_changed().is_err()
}

impl Drop for AddressMesh {
    fn drop(&mut self) {
        for link in self.lock().links.values() {
            link.cancel();
        }
    }
}

impl std::fmt::Debug for AddressMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AddressMesh")
            .field("links", &state.links.len())
            .field("closed", &state.closed)
            .finish()
    }
}
