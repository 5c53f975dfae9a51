//! Reference relay server.
//!
//! Authenticates clients, treats every non-watching client as a present
//! peer and streams presence changes to clients that asked to watch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meshtun_core::PeerKey;
use rand::RngCore;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::identity::{Identity, verify_signature};
use crate::protocol::{
    self, CHALLENGE_SIZE, MessageStream, PROTOCOL_VERSION, RelayErrorCode, RelayMessage,
};

/// Presence notices buffered per watcher before it lags
const NOTICE_CAPACITY: usize = 1024;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrent connections
    pub max_clients: usize,
    /// Keepalive send interval
    pub keepalive_interval: Duration,
    /// Time a client has to complete the handshake
    pub handshake_timeout: Duration,
    /// Silence after which a client is dropped
    pub client_timeout: Duration,
    /// Shared key required from watching clients, if set
    pub mesh_key: Option<String>,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            keepalive_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            client_timeout: Duration::from_secs(90),
            mesh_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Notice {
    Present(PeerKey),
    Gone(PeerKey),
}

struct ServerState {
    config: RelayServerConfig,
    identity: Identity,
    relay_id: [u8; 32],
    /// Connected non-watching peers and their connection counts
    peers: RwLock<HashMap<PeerKey, usize>>,
    notices: broadcast::Sender<Notice>,
    connections: AtomicUsize,
    clients: AtomicUsize,
    watchers: AtomicUsize,
}

/// TCP relay server
pub struct RelayServer {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl RelayServer {
    /// Bind and start serving with a fresh relay identity
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr, config: RelayServerConfig) -> Result<Self, RelayError> {
        Self::bind_with_identity(bind_addr, config, Identity::generate()).await
    }

    /// Bind and start serving as `identity`
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_identity(
        bind_addr: SocketAddr,
        config: RelayServerConfig,
        identity: Identity,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let relay_id = protocol::relay_id(&identity.public_key());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let state = Arc::new(ServerState {
            config,
            identity,
            relay_id,
            peers: RwLock::new(HashMap::new()),
            notices,
            connections: AtomicUsize::new(0),
            clients: AtomicUsize::new(0),
            watchers: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(accept_loop(
            listener,
            state.clone(),
            cancel.clone(),
            tasks.clone(),
        ));

        info!(
            %local_addr,
            relay_id = %hex::encode(&relay_id[..8]),
            "relay server listening"
        );

        Ok(Self {
            local_addr,
            state,
            cancel,
            tasks,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server relay ID
    #[must_use]
    pub fn relay_id(&self) -> [u8; 32] {
        self.state.relay_id
    }

    /// Authenticated clients
    pub fn client_count(&self) -> usize {
        self.state.clients.load(Ordering::SeqCst)
    }

    /// Authenticated clients watching presence
    pub fn watcher_count(&self) -> usize {
        self.state.watchers.load(Ordering::SeqCst)
    }

    /// Distinct non-watching peers currently present
    pub async fn peer_count(&self) -> usize {
        self.state.peers.read().await.len()
    }

    /// Stop accepting, drop every client and wait for all tasks
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(local_addr = %self.local_addr, "relay server stopped");
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, from)) => {
                tasks.spawn(serve_client(stream, from, state.clone(), cancel.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Decrements a counter when dropped
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Accepted {
    node_key: PeerKey,
    watch_peers: bool,
}

async fn serve_client(
    stream: TcpStream,
    from: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) {
    let _connection = CountGuard::new(&state.connections);
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut inbound = MessageStream::new(reader);

    if state.connections.load(Ordering::SeqCst) > state.config.max_clients {
        send_error(&mut writer, RelayErrorCode::ServerFull, "Server at capacity").await;
        return;
    }

    let accepted = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(
            state.config.handshake_timeout,
            server_handshake(&mut inbound, &mut writer, &state),
        ) => match result {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                debug!(%from, error = %e, "relay handshake failed");
                return;
            }
            Err(_) => {
                debug!(%from, "relay handshake timed out");
                return;
            }
        },
    };

    let _client = CountGuard::new(&state.clients);
    let _watcher = accepted.watch_peers.then(|| CountGuard::new(&state.watchers));
    debug!(%from, peer = %accepted.node_key.short(), watch = accepted.watch_peers, "client connected");

    // Subscribe before snapshotting so nothing is missed.
    let notices = accepted.watch_peers.then(|| state.notices.subscribe());
    if !accepted.watch_peers {
        register(&state, accepted.node_key).await;
    }

    let result = client_loop(
        inbound,
        writer,
        &accepted,
        notices,
        &state,
        &cancel,
    )
    .await;
    if let Err(e) = result {
        debug!(%from, error = %e, "client disconnected");
    }

    if !accepted.watch_peers {
        unregister(&state, accepted.node_key).await;
    }
}

async fn server_handshake(
    inbound: &mut MessageStream<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    state: &ServerState,
) -> Result<Accepted, RelayError> {
    let relay_key = state.identity.public_key();
    let mut challenge = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut challenge);

    protocol::write_message(
        writer,
        &RelayMessage::ServerHello {
            relay_key,
            challenge,
            version: PROTOCOL_VERSION,
        },
    )
    .await?;

    let (node_key, signature, mesh_key, watch_peers, version) =
        match inbound.expect().await? {
            RelayMessage::ClientHello {
                node_key,
                signature,
                mesh_key,
                watch_peers,
                version,
            } => (node_key, signature, mesh_key, watch_peers, version),
            other => {
                send_error(writer, RelayErrorCode::InvalidMessage, "expected ClientHello").await;
                return Err(RelayError::Protocol(format!(
                    "expected ClientHello, got {}",
                    other.message_type()
                )));
            }
        };

    if version != PROTOCOL_VERSION {
        send_error(writer, RelayErrorCode::VersionMismatch, "unsupported version").await;
        return Err(RelayError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: version,
        });
    }

    let message = protocol::auth_message(&relay_key, &challenge);
    if !verify_signature(&node_key, &message, &signature) {
        send_error(writer, RelayErrorCode::AuthFailed, "signature did not verify").await;
        return Err(RelayError::AuthFailed);
    }

    if watch_peers {
        if let Some(required) = &state.config.mesh_key {
            if mesh_key.as_deref() != Some(required.as_str()) {
                send_error(writer, RelayErrorCode::MeshKeyRequired, "mesh key required to watch peers").await;
                return Err(RelayError::AuthFailed);
            }
        }
    }

    protocol::write_message(
        writer,
        &RelayMessage::ServerInfo {
            relay_id: state.relay_id,
        },
    )
    .await?;

    Ok(Accepted {
        node_key,
        watch_peers,
    })
}

async fn client_loop(
    mut inbound: MessageStream<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    client: &Accepted,
    mut notices: Option<broadcast::Receiver<Notice>>,
    state: &ServerState,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    if notices.is_some() {
        let present: Vec<PeerKey> = state.peers.read().await.keys().copied().collect();
        for peer in present.into_iter().filter(|p| *p != client.node_key) {
            protocol::write_message(&mut writer, &RelayMessage::PeerPresent { peer }).await?;
        }
    }

    let every = state.config.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + every, every);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(state.config.client_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = &mut idle => return Err(RelayError::LivenessTimeout(state.config.client_timeout)),
            _ = keepalive.tick() => {
                protocol::write_message(&mut writer, &RelayMessage::Keepalive).await?;
            }
            notice = next_notice(&mut notices) => match notice {
                Ok(Notice::Present(peer)) if peer != client.node_key => {
                    protocol::write_message(&mut writer, &RelayMessage::PeerPresent { peer }).await?;
                }
                Ok(Notice::Gone(peer)) if peer != client.node_key => {
                    protocol::write_message(&mut writer, &RelayMessage::PeerGone { peer }).await?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The watcher missed changes; make it reconnect and resync.
                    warn!(skipped, "watcher lagged behind presence changes");
                    send_error(&mut writer, RelayErrorCode::InternalError, "presence stream lagged").await;
                    return Err(RelayError::Protocol("watcher lagged".into()));
                }
                Err(broadcast::error::RecvError::Closed) => notices = None,
            },
            msg = inbound.next() => {
                idle.as_mut().reset(Instant::now() + state.config.client_timeout);
                match msg {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(RelayMessage::Keepalive)) => {}
                    Some(Ok(other)) => {
                        send_error(&mut writer, RelayErrorCode::InvalidMessage, "unexpected message").await;
                        return Err(RelayError::Protocol(format!(
                            "unexpected {} from client",
                            other.message_type()
                        )));
                    }
                }
            }
        }
    }
}

async fn next_notice(
    notices: &mut Option<broadcast::Receiver<Notice>>,
) -> Result<Notice, broadcast::error::RecvError> {
    match notices {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn register(state: &ServerState, peer: PeerKey) {
    let first = {
        let mut peers = state.peers.write().await;
        let count = peers.entry(peer).or_insert(0);
        *count += 1;
        *count == 1
    };
    if first {
        let _ = state.notices.send(Notice::Present(peer));
    }
}

async fn unregister(state: &ServerState, peer: PeerKey) {
    let last = {
        let mut peers = state.peers.write().await;
        match peers.get_mut(&peer) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                peers.remove(&peer);
                true
            }
            None => false,
        }
    };
    if last {
        let _ = state.notices.send(Notice::Gone(peer));
    }
}

async fn send_error(writer: &mut OwnedWriteHalf, code: RelayErrorCode, message: &str) {
    let error = RelayMessage::Error {
        code,
        message: message.to_string(),
    };
    let _ = protocol::write_message(writer, &error).await;
}
