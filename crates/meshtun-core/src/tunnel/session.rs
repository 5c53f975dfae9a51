//! Tunnel session: the tunnel side of the protocol over a pipe.
//!
//! A session answers the manager's `Start`, `Stop` and `GetPeerUpdate`
//! requests, streams peer reachability changes from a [`PresenceTable`],
//! and forwards log records collected by a [`LogHub`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::log_layer::{LogHub, LogQueue};
use super::message::{
    CommandResponse, ManagerMessage, ManagerPayload, PeerInfo, PeerUpdate, StartRequest,
    TunnelMessage, TunnelPayload,
};
use super::speaker::{Incoming, ProtocolVersion, SpeakerRole, TunnelSpeaker};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::presence::{PeerChange, PresenceTable};

/// How long an orderly stop may take before the stream is cut
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Network stack driven by a tunnel session
#[async_trait]
pub trait TunnelBackend: Send + Sync + 'static {
    /// Bring up networking for a validated start request
    async fn start(&self, request: &StartRequest) -> Result<()>;

    /// Tear networking down
    async fn stop(&self) -> Result<()>;
}

/// Optional collaborators of a session
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Network stack; without one `Start` is acknowledged and nothing else
    pub backend: Option<Arc<dyn TunnelBackend>>,
    /// Source of peer reachability updates
    pub presence: Option<Arc<PresenceTable>>,
    /// Source of forwarded log records
    pub logs: Option<LogHub>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("backend", &self.backend.is_some())
            .field("presence", &self.presence.is_some())
            .field("logs", &self.logs)
            .finish()
    }
}

/// Entry point for starting tunnel sessions
pub struct TunnelSession;

impl TunnelSession {
    /// Start a session over a pipe.
    ///
    /// The pipe is consumed. If the session cannot be started the pipe is
    /// closed before the error is returned.
    #[cfg(unix)]
    pub async fn start(
        pipe: crate::pipe::TunnelPipe,
        config: TunnelConfig,
        options: SessionOptions,
    ) -> Result<SessionHandle> {
        let (reader, writer) = pipe.into_split()?;
        Self::start_with_io(reader, writer, config, options).await
    }

    /// Start a session over any byte stream halves.
    ///
    /// Performs the handshake before returning. Both halves are dropped if
    /// the handshake fails.
    pub async fn start_with_io<Rd, W>(
        reader: Rd,
        writer: W,
        config: TunnelConfig,
        options: SessionOptions,
    ) -> Result<SessionHandle>
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();

        let (speaker, incoming) = match TunnelSpeaker::start(
            reader,
            writer,
            SpeakerRole::Tunnel,
            &config,
            &tasks,
            cancel.clone(),
        )
        .await
        {
            Ok(started) => started,
            Err(err) => {
                warn!(error = %err, "tunnel handshake failed");
                tasks.close();
                return Err(err.into());
            }
        };
        let version = speaker.version();

        let server = Server {
            speaker,
            backend: options.backend,
            presence: options.presence.clone(),
            logs: options
                .logs
                .map(|hub| hub.register(config.log_queue_capacity)),
            running: false,
        };
        let changes = options.presence.as_ref().map(|table| table.subscribe());
        let stop = CancellationToken::new();

        tasks.spawn(server.serve(incoming, changes, stop.clone()));
        tasks.close();
        info!(%version, "tunnel session started");

        Ok(SessionHandle {
            stop,
            cancel,
            tasks,
            version,
        })
    }
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    stop: CancellationToken,
    cancel: CancellationToken,
    tasks: TaskTracker,
    version: ProtocolVersion,
}

impl SessionHandle {
    /// Negotiated protocol version
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Whether any session task is still running
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Resolves when the session has ended and the pipe is closed
    pub async fn wait(&self) {
        self.tasks.wait().await
    }

    /// Stop the session.
    ///
    /// Pending log records are flushed and the stream is finished; if the
    /// manager is not reading, the stream is cut after a short grace period.
    pub async fn stop(&self) {
        self.stop.cancel();
        if tokio::time::timeout(STOP_GRACE, self.wait()).await.is_err() {
            debug!("orderly stop timed out, closing tunnel stream");
            self.cancel.cancel();
            self.wait().await;
        }
    }

    /// Cut the stream immediately without flushing
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("version", &self.version)
            .field("running", &self.is_running())
            .finish()
    }
}

type Request = Incoming<TunnelMessage, ManagerMessage>;

struct Server {
    speaker: TunnelSpeaker,
    backend: Option<Arc<dyn TunnelBackend>>,
    presence: Option<Arc<PresenceTable>>,
    logs: Option<Arc<LogQueue>>,
    running: bool,
}

enum Flow {
    Continue,
    Finish,
}

async fn logs_ready(queue: &Option<Arc<LogQueue>>) {
    match queue {
        Some(queue) => queue.notified().await,
        None => std::future::pending().await,
    }
}

async fn next_change(
    changes: &mut Option<broadcast::Receiver<PeerChange>>,
) -> std::result::Result<PeerChange, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Server {
    async fn serve(
        mut self,
        mut incoming: mpsc::Receiver<Request>,
        mut changes: Option<broadcast::Receiver<PeerChange>>,
        stop: CancellationToken,
    ) {
        loop {
            let flow = tokio::select! {
                _ = self.speaker.closed() => break,
                _ = stop.cancelled() => {
                    debug!("stop requested");
                    if let Err(err) = self.stop_backend().await {
                        warn!(error = %err, "failed to stop tunnel backend");
                    }
                    Flow::Finish
                }
                request = incoming.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = logs_ready(&self.logs) => self.forward_logs().await,
                change = next_change(&mut changes) => match change {
                    Ok(change) => self.forward_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "presence changes lagged, sending snapshot");
                        self.send(TunnelPayload::PeerUpdate(self.peer_snapshot())).await
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        changes = None;
                        Flow::Continue
                    }
                },
            };

            if let Flow::Finish = flow {
                self.forward_logs().await;
                self.speaker.finish().await;
                break;
            }
        }

        // The speaker closes itself after `finish`; make sure it also does on
        // every other exit so the pipe is released.
        self.speaker.closed().await;
        debug!("tunnel session ended");
    }

    async fn handle(&mut self, request: Request) -> Flow {
        match &request.msg.msg {
            ManagerPayload::GetPeerUpdate => {
                let update = self.peer_snapshot();
                self.reply(&request, TunnelPayload::PeerUpdate(update)).await
            }
            ManagerPayload::Start(start) => {
                let result = self.start_backend(start).await;
                if let Err(err) = &result {
                    warn!(error = %err, "failed to start tunnel");
                }
                let response = CommandResponse::from_result(&result);
                self.reply(&request, TunnelPayload::Start(response)).await
            }
            ManagerPayload::Stop => {
                let result = self.stop_backend().await;
                let response = CommandResponse::from_result(&result);
                self.reply(&request, TunnelPayload::Stop(response)).await;
                Flow::Finish
            }
        }
    }

    async fn start_backend(&mut self, request: &StartRequest) -> Result<()> {
        validate_start(request)?;
        if self.running {
            warn!("start requested while already running");
            return Ok(());
        }

        if let Some(backend) = &self.backend {
            backend.start(request).await?;
        } else {
            debug!("no backend configured, acknowledging start");
        }
        self.running = true;
        info!(server_url = %request.server_url, "tunnel started");
        Ok(())
    }

    async fn stop_backend(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        match &self.backend {
            Some(backend) => backend.stop().await,
            None => Ok(()),
        }
    }

    async fn reply(&self, request: &Request, payload: TunnelPayload) -> Flow {
        match request.reply(TunnelMessage::new(payload)).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Finish,
        }
    }

    async fn send(&self, payload: TunnelPayload) -> Flow {
        match self.speaker.send(TunnelMessage::new(payload)).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Finish,
        }
    }

    async fn forward_logs(&self) -> Flow {
        let Some(queue) = &self.logs else {
            return Flow::Continue;
        };
        for record in queue.drain() {
            if let Flow::Finish = self.send(TunnelPayload::Log(record)).await {
                return Flow::Finish;
            }
        }
        Flow::Continue
    }

    async fn forward_change(&self, change: PeerChange) -> Flow {
        let update = match change {
            PeerChange::Reachable(key) => PeerUpdate {
                upserted_peers: vec![PeerInfo {
                    key,
                    relays: self.relays_for(&key),
                }],
                ..Default::default()
            },
            PeerChange::Unreachable(key) => PeerUpdate {
                deleted_peers: vec![PeerInfo {
                    key,
                    relays: Vec::new(),
                }],
                ..Default::default()
            },
        };
        self.send(TunnelPayload::PeerUpdate(update)).await
    }

    fn relays_for(&self, key: &crate::presence::PeerKey) -> Vec<String> {
        self.presence
            .as_ref()
            .map(|table| table.relays_for(key))
            .unwrap_or_default()
    }

    fn peer_snapshot(&self) -> PeerUpdate {
        let upserted_peers = self
            .presence
            .as_ref()
            .map(|table| {
                table
                    .snapshot()
                    .into_iter()
                    .map(|key| PeerInfo {
                        key,
                        relays: table.relays_for(&key),
                    })
                    .collect()
            })
            .unwrap_or_default();

        PeerUpdate {
            upserted_peers,
            deleted_peers: Vec::new(),
            full_snapshot: true,
        }
    }
}

fn validate_start(request: &StartRequest) -> Result<()> {
    if request.server_url.is_empty() {
        return Err(TunnelError::Backend("missing server url".into()));
    }
    let url = url::Url::parse(&request.server_url)
        .map_err(|e| TunnelError::Backend(format!("invalid server url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TunnelError::Backend(format!(
            "unsupported server url scheme {:?}",
            url.scheme()
        )));
    }
    if request.api_token.is_empty() {
        return Err(TunnelError::Backend("missing api token".into()));
    }
    Ok(())
}
