//! One persistent connection to one relay.
//!
//! A [`RelayLink`] owns a task that connects, authenticates, watches peer
//! presence and reconnects with backoff until cancelled. Its state is a
//! small machine published on a `watch` channel:
//!
//! ```text
//! Connecting ──ok──▶ Connected ──error──▶ Reconnecting ──backoff──▶ Connecting
//!      │                                       ▲
//!      └───────────────error───────────────────┘
//! any state ──cancel──▶ Closed
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use meshtun_core::{PresenceKind, PresenceSink, PresenceUpdate};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::address::RelayAddress;
use crate::backoff::Backoff;
use crate::config::MeshConfig;
use crate::error::RelayError;
use crate::identity::Identity;
use crate::protocol::{self, MessageStream, RelayMessage};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Relay link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    /// First connection attempt, or a retry after backoff
    Connecting,
    /// Authenticated and watching presence
    Connected,
    /// Waiting out backoff after a failure
    Reconnecting,
    /// Cancelled; the task has exited or is exiting
    Closed,
}

/// Handle to a running relay link.
///
/// Dropping the handle cancels the link.
pub struct RelayLink {
    id: LinkId,
    address: RelayAddress,
    status: watch::Receiver<LinkStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RelayLink {
    /// Start a link on `runtime`
    pub fn spawn(
        runtime: &Handle,
        address: RelayAddress,
        identity: Arc<Identity>,
        config: MeshConfig,
        sink: Arc<dyn PresenceSink>,
    ) -> Self {
        Self::spawn_after(runtime, address, identity, config, sink, None)
    }

    /// Start a link that connects only once `predecessor` reports
    /// [`LinkStatus::Closed`] (or its task is gone).
    ///
    /// Used when an address is re-added while its previous link is still
    /// shutting down, so the old link's presence reset cannot land after
    /// the new link's first updates.
    pub fn spawn_after(
        runtime: &Handle,
        address: RelayAddress,
        identity: Arc<Identity>,
        config: MeshConfig,
        sink: Arc<dyn PresenceSink>,
        predecessor: Option<watch::Receiver<LinkStatus>>,
    ) -> Self {
        let id = LinkId::next();
        let (status_tx, status) = watch::channel(LinkStatus::Connecting);
        let cancel = CancellationToken::new();

        let worker = LinkWorker {
            id,
            address: address.clone(),
            identity,
            config,
            sink,
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = runtime.spawn(worker.run(predecessor));

        Self {
            id,
            address,
            status,
            cancel,
            task: Some(task),
        }
    }

    /// Link identifier
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Relay address
    pub fn address(&self) -> &RelayAddress {
        &self.address
    }

    /// Current state
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Wait until the link reaches `target`.
    ///
    /// Returns `false` if the link closed first.
    pub async fn wait_for_status(&self, target: LinkStatus) -> bool {
        wait_for(self.subscribe(), target).await
    }

    /// Signal the link to stop without waiting
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the task to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayLink")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("status", &self.status())
            .finish()
    }
}

/// Wait on a status receiver until it shows `target`; `false` if it closed
pub async fn wait_for(mut rx: watch::Receiver<LinkStatus>, target: LinkStatus) -> bool {
    loop {
        let current = *rx.borrow_and_update();
        if current == target {
            return true;
        }
        if current == LinkStatus::Closed || rx.changed().await.is_err() {
            return *rx.borrow() == target;
        }
    }
}

struct LinkWorker {
    id: LinkId,
    address: RelayAddress,
    identity: Arc<Identity>,
    config: MeshConfig,
    sink: Arc<dyn PresenceSink>,
    status: watch::Sender<LinkStatus>,
    cancel: CancellationToken,
}

impl LinkWorker {
    fn set_status(&self, status: LinkStatus) {
        self.status.send_replace(status);
    }

    async fn run(self, predecessor: Option<watch::Receiver<LinkStatus>>) {
        let address = self.address.to_string();
        let mut backoff = Backoff::new(self.config.backoff.clone());

        // Waited out even when cancelled, so chained links close in order.
        if let Some(previous) = predecessor {
            debug!(link = %self.id, %address, "waiting for previous link to close");
            wait_for(previous, LinkStatus::Closed).await;
        }
        debug!(link = %self.id, %address, "relay link started");

        loop {
            self.set_status(LinkStatus::Connecting);
            let mut connected = false;
            let result = self.connect_and_watch(&mut backoff, &mut connected).await;

            if connected {
                self.sink.relay_reset(&address);
            }

            match result {
                Err(RelayError::Cancelled) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        link = %self.id,
                        %address,
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "relay connection failed, retrying"
                    );
                    self.set_status(LinkStatus::Reconnecting);

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(never) => match never {},
            }
        }

        self.set_status(LinkStatus::Closed);
        debug!(link = %self.id, %address, "relay link closed");
    }

    async fn connect_and_watch(
        &self,
        backoff: &mut Backoff,
        connected: &mut bool,
    ) -> Result<std::convert::Infallible, RelayError> {
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
            stream = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(self.address.authority()),
            ) => stream.map_err(|_| RelayError::Timeout("connect"))??,
        };
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        let mut inbound = MessageStream::new(reader);

        let relay_id = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
            result = tokio::time::timeout(
                self.config.handshake_timeout,
                protocol::client_handshake(&mut inbound, &mut writer, &self.identity, true),
            ) => result.map_err(|_| RelayError::Timeout("handshake"))??,
        };

        backoff.reset();
        *connected = true;
        self.set_status(LinkStatus::Connected);
        info!(
            link = %self.id,
            address = %self.address,
            relay_id = %hex::encode(&relay_id[..8]),
            "relay connected"
        );

        self.watch(inbound, writer).await
    }

    async fn watch(
        &self,
        mut inbound: MessageStream<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) -> Result<std::convert::Infallible, RelayError> {
        let relay = self.address.to_string();
        let keepalive_every = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let liveness = tokio::time::sleep(self.config.liveness_timeout);
        tokio::pin!(liveness);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = &mut liveness => {
                    return Err(RelayError::LivenessTimeout(self.config.liveness_timeout));
                }
                _ = keepalive.tick() => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                        sent = protocol::write_message(&mut writer, &RelayMessage::Keepalive) => sent?,
                    }
                }
                msg = inbound.next() => {
                    liveness.as_mut().reset(Instant::now() + self.config.liveness_timeout);
                    match msg.ok_or(RelayError::ConnectionClosed)?? {
                        RelayMessage::PeerPresent { peer } => {
                            trace!(link = %self.id, peer = %peer.short(), "peer present");
                            self.sink.update(PresenceUpdate {
                                relay: relay.clone(),
                                peer,
                                kind: PresenceKind::Present,
                            });
                        }
                        RelayMessage::PeerGone { peer } => {
                            trace!(link = %self.id, peer = %peer.short(), "peer gone");
                            self.sink.update(PresenceUpdate {
                                relay: relay.clone(),
                                peer,
                                kind: PresenceKind::Gone,
                            });
                        }
                        RelayMessage::Keepalive => {}
                        RelayMessage::Error { code, message } => {
                            return Err(RelayError::Rejected { code, message });
                        }
                        other => {
                            return Err(RelayError::Protocol(format!(
                                "unexpected {} while watching",
                                other.message_type()
                            )));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::server::{RelayServer, RelayServerConfig};
    use meshtun_core::PresenceEvent;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_config() -> MeshConfig {
        MeshConfig {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            keepalive_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_millis(400),
            backoff: BackoffConfig {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
                multiplier: 2.0,
                jitter: false,
            },
        }
    }

    fn fast_server_config() -> RelayServerConfig {
        RelayServerConfig {
            keepalive_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn sink() -> (Arc<dyn PresenceSink>, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    async fn closed_port() -> RelayAddress {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        RelayAddress::parse(&addr.to_string()).unwrap()
    }

    #[test]
    fn test_link_ids_increase() {
        let a = LinkId::next();
        let b = LinkId::next();
        assert!(b > a);
        assert_eq!(format!("{a}"), format!("link-{}", a.get()));
    }

    #[tokio::test]
    async fn test_connects_and_forwards_presence() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), fast_server_config())
            .await
            .unwrap();
        let address = RelayAddress::parse(&server.local_addr().to_string()).unwrap();
        let (sink, mut events) = sink();

        let link = RelayLink::spawn(
            &Handle::current(),
            address.clone(),
            Arc::new(Identity::generate()),
            fast_config(),
            sink,
        );
        assert!(
            tokio::time::timeout(Duration::from_secs(5), link.wait_for_status(LinkStatus::Connected))
                .await
                .unwrap()
        );

        // A plain client attaching to the relay shows up as present.
        let peer = Identity::generate();
        let peer_key = peer.public_key();
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut r = MessageStream::new(r);
        protocol::client_handshake(&mut r, &mut w, &peer, false)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            PresenceEvent::Update(PresenceUpdate {
                relay: address.to_string(),
                peer: peer_key,
                kind: PresenceKind::Present,
            })
        );

        drop((r, w));
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            PresenceEvent::Update(PresenceUpdate { kind: PresenceKind::Gone, peer, .. }) if peer == peer_key
        ));

        link.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_relay_keeps_retrying() {
        let address = closed_port().await;
        let (sink, _events) = sink();
        let link = RelayLink::spawn(
            &Handle::current(),
            address,
            Arc::new(Identity::generate()),
            fast_config(),
            sink,
        );

        let mut status = link.subscribe();
        let mut reconnects = 0;
        while reconnects < 3 {
            tokio::time::timeout(Duration::from_secs(5), status.changed())
                .await
                .unwrap()
                .unwrap();
            if *status.borrow() == LinkStatus::Reconnecting {
                reconnects += 1;
            }
        }
        assert_ne!(link.status(), LinkStatus::Closed);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_during_connect_is_prompt() {
        // Accepts at the TCP level but never speaks, so the handshake stalls.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = RelayAddress::parse(&listener.local_addr().unwrap().to_string()).unwrap();
        let config = MeshConfig {
            handshake_timeout: Duration::from_secs(30),
            ..fast_config()
        };
        let (sink, _events) = sink();
        let link = RelayLink::spawn(
            &Handle::current(),
            address,
            Arc::new(Identity::generate()),
            config,
            sink,
        );
        let status = link.subscribe();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(1), link.shutdown())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*status.borrow(), LinkStatus::Closed);
        drop(listener);
    }

    #[tokio::test]
    async fn test_successor_waits_for_previous_link() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), fast_server_config())
            .await
            .unwrap();
        let address = RelayAddress::parse(&server.local_addr().to_string()).unwrap();
        let (sink, mut events) = sink();
        let (previous_tx, previous) = watch::channel(LinkStatus::Connected);

        let link = RelayLink::spawn_after(
            &Handle::current(),
            address.clone(),
            Arc::new(Identity::generate()),
            fast_config(),
            sink.clone(),
            Some(previous),
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(200), link.wait_for_status(LinkStatus::Connected))
                .await
                .is_err()
        );

        // The previous link's reset lands before anything from the successor.
        sink.relay_reset(&address.to_string());
        previous_tx.send_replace(LinkStatus::Closed);
        assert!(
            tokio::time::timeout(Duration::from_secs(5), link.wait_for_status(LinkStatus::Connected))
                .await
                .unwrap()
        );

        let peer = Identity::generate();
        let peer_key = peer.public_key();
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut r = MessageStream::new(r);
        protocol::client_handshake(&mut r, &mut w, &peer, false)
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first, PresenceEvent::Reset(address.to_string()));
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            second,
            PresenceEvent::Update(PresenceUpdate { kind: PresenceKind::Present, peer, .. }) if peer == peer_key
        ));

        drop((r, w));
        link.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_successor_still_waits_for_previous() {
        let address = closed_port().await;
        let (sink, _events) = sink();
        let (previous_tx, previous) = watch::channel(LinkStatus::Reconnecting);
        let link = RelayLink::spawn_after(
            &Handle::current(),
            address,
            Arc::new(Identity::generate()),
            fast_config(),
            sink,
            Some(previous),
        );
        let status = link.subscribe();
        link.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*status.borrow(), LinkStatus::Connecting);

        drop(previous_tx);
        tokio::time::timeout(Duration::from_secs(1), link.shutdown())
            .await
            .unwrap();
        assert_eq!(*status.borrow(), LinkStatus::Closed);
    }

    #[tokio::test]
    async fn test_relay_loss_resets_presence() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), fast_server_config())
            .await
            .unwrap();
        let address = RelayAddress::parse(&server.local_addr().to_string()).unwrap();
        let (sink, mut events) = sink();
        let link = RelayLink::spawn(
            &Handle::current(),
            address.clone(),
            Arc::new(Identity::generate()),
            fast_config(),
            sink,
        );
        assert!(
            tokio::time::timeout(Duration::from_secs(5), link.wait_for_status(LinkStatus::Connected))
                .await
                .unwrap()
        );

        server.shutdown().await;
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PresenceEvent::Reset(address.to_string()));
        assert!(
            tokio::time::timeout(Duration::from_secs(5), link.wait_for_status(LinkStatus::Reconnecting))
                .await
                .unwrap()
        );
        link.shutdown().await;
    }
}
