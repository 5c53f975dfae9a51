//! Tunnel protocol speaker.
//!
//! A speaker performs the header exchange on a byte stream and then runs two
//! tasks over it: a send loop draining an outbound queue and a receive loop
//! that routes RPC replies to their waiters and hands everything else to the
//! owner as [`Incoming`] messages. Either loop ending cancels the other.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::message::{self, FrameCodec, ManagerMessage, Rpc, RpcMessage, TunnelMessage};
use crate::config::TunnelConfig;
use crate::error::{HandshakeError, Result, TunnelError};

/// First word of every header line
pub const HEADER_PREAMBLE: &str = "meshtun";

/// Longest accepted header line, newline included
pub const MAX_HEADER_LEN: usize = 256;

/// Version this build speaks
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Side of the tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeakerRole {
    /// The side owning the network stack
    Tunnel,
    /// The host side controlling the tunnel
    Manager,
}

impl SpeakerRole {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerRole::Tunnel => "tunnel",
            SpeakerRole::Manager => "manager",
        }
    }

    /// The role expected on the other end
    pub fn opposite(&self) -> SpeakerRole {
        match self {
            SpeakerRole::Tunnel => SpeakerRole::Manager,
            SpeakerRole::Manager => SpeakerRole::Tunnel,
        }
    }
}

impl fmt::Display for SpeakerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeakerRole {
    type Err = HandshakeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tunnel" => Ok(SpeakerRole::Tunnel),
            "manager" => Ok(SpeakerRole::Manager),
            other => Err(HandshakeError::InvalidHeader(format!(
                "unknown role {other:?}"
            ))),
        }
    }
}

/// `major.minor` protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    /// Incompatible changes
    pub major: u16,
    /// Compatible additions
    pub minor: u16,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = HandshakeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || HandshakeError::InvalidHeader(format!("invalid version {s:?}"));
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(ProtocolVersion {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Parsed header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Role the sender claims
    pub role: SpeakerRole,
    /// Versions the sender supports
    pub versions: Vec<ProtocolVersion>,
}

impl Header {
    /// Header this build sends for `role`
    pub fn current(role: SpeakerRole) -> Self {
        Self {
            role,
            versions: vec![CURRENT_VERSION],
        }
    }

    /// Wire form, newline terminated
    pub fn encode(&self) -> String {
        let versions: Vec<String> = self.versions.iter().map(ToString::to_string).collect();
        format!("{HEADER_PREAMBLE} {} {}\n", self.role, versions.join(","))
    }

    /// Parse a header line without its trailing newline
    pub fn parse(line: &str) -> std::result::Result<Self, HandshakeError> {
        let parts: Vec<&str> = line.trim_end_matches('\r').split(' ').collect();
        if parts.len() != 3 {
            return Err(HandshakeError::InvalidHeader(format!(
                "expected 3 fields, got {}",
                parts.len()
            )));
        }
        if parts[0] != HEADER_PREAMBLE {
            return Err(HandshakeError::InvalidHeader(format!(
                "invalid preamble {:?}",
                parts[0]
            )));
        }

        let role = parts[1].parse()?;
        let versions = parts[2]
            .split(',')
            .map(ProtocolVersion::from_str)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { role, versions })
    }

    /// Check the role and pick the version both sides speak
    pub fn negotiate(
        &self,
        expected_role: SpeakerRole,
    ) -> std::result::Result<ProtocolVersion, HandshakeError> {
        if self.role != expected_role {
            return Err(HandshakeError::InvalidHeader(format!(
                "expected role {expected_role}, got {}",
                self.role
            )));
        }

        self.versions
            .iter()
            .filter(|v| v.major == CURRENT_VERSION.major)
            .max()
            .map(|theirs| ProtocolVersion {
                major: CURRENT_VERSION.major,
                minor: theirs.minor.min(CURRENT_VERSION.minor),
            })
            .ok_or_else(|| {
                HandshakeError::InvalidHeader(format!(
                    "no version compatible with {CURRENT_VERSION}"
                ))
            })
    }
}

async fn read_header_line<Rd>(reader: &mut Rd) -> std::result::Result<String, HandshakeError>
where
    Rd: AsyncRead + Unpin,
{
    // One byte at a time so nothing past the newline is consumed.
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() + 1 >= MAX_HEADER_LEN {
            return Err(HandshakeError::Oversize(MAX_HEADER_LEN));
        }
        line.push(byte);
    }

    String::from_utf8(line)
        .map_err(|_| HandshakeError::InvalidHeader("header is not valid UTF-8".into()))
}

/// Exchange header lines and return the negotiated version
pub async fn handshake<Rd, W>(
    reader: &mut Rd,
    writer: &mut W,
    role: SpeakerRole,
    timeout: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<ProtocolVersion, HandshakeError>
where
    Rd: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        let ours = Header::current(role).encode();
        let ((), line) = tokio::try_join!(
            async {
                writer.write_all(ours.as_bytes()).await?;
                writer.flush().await?;
                Ok::<_, HandshakeError>(())
            },
            read_header_line(reader),
        )?;
        Header::parse(&line)?.negotiate(role.opposite())
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        result = tokio::time::timeout(timeout, exchange) => {
            result.unwrap_or(Err(HandshakeError::Timeout))
        }
    }
}

enum Outbound<S> {
    Message(S),
    Finish,
}

type PendingReplies<R> = Arc<Mutex<HashMap<u64, oneshot::Sender<R>>>>;

/// A message from the peer that is not a reply to one of our requests
pub struct Incoming<S, R> {
    /// The message
    pub msg: R,
    msg_id: u64,
    outbound: mpsc::Sender<Outbound<S>>,
    cancel: CancellationToken,
}

impl<S: RpcMessage, R: RpcMessage> Incoming<S, R> {
    /// Request id if the peer expects a reply
    pub fn msg_id(&self) -> Option<u64> {
        (self.msg_id != 0).then_some(self.msg_id)
    }

    /// Send `reply` answering this message
    pub async fn reply(&self, mut reply: S) -> Result<()> {
        reply.set_rpc(Rpc {
            msg_id: 0,
            response_to: self.msg_id,
        });
        enqueue(&self.outbound, &self.cancel, Outbound::Message(reply)).await
    }
}

impl<S, R: fmt::Debug> fmt::Debug for Incoming<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("msg", &self.msg)
            .field("msg_id", &self.msg_id)
            .finish()
    }
}

async fn enqueue<S>(
    outbound: &mpsc::Sender<Outbound<S>>,
    cancel: &CancellationToken,
    item: Outbound<S>,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TunnelError::Closed),
        sent = outbound.send(item) => sent.map_err(|_| TunnelError::Closed),
    }
}

/// Removes a request's waiter however `unary_rpc` exits
struct PendingGuard<'a, R> {
    pending: &'a PendingReplies<R>,
    msg_id: u64,
}

impl<R> Drop for PendingGuard<'_, R> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.msg_id);
    }
}

/// One end of the tunnel protocol, sending `S` and receiving `R`
pub struct Speaker<S, R> {
    outbound: mpsc::Sender<Outbound<S>>,
    pending: PendingReplies<R>,
    next_id: AtomicU64,
    version: ProtocolVersion,
    cancel: CancellationToken,
}

/// Speaker used by the tunnel
pub type TunnelSpeaker = Speaker<TunnelMessage, ManagerMessage>;

/// Speaker used by a manager (hosts written in Rust, tests)
pub type ManagerSpeaker = Speaker<ManagerMessage, TunnelMessage>;

impl<S: RpcMessage, R: RpcMessage> Speaker<S, R> {
    /// Run the handshake and start the send and receive loops on `tasks`.
    ///
    /// The loops stop when `cancel` fires, when the peer hangs up, or on a
    /// protocol error. On handshake failure both stream halves are dropped.
    pub async fn start<Rd, W>(
        mut reader: Rd,
        mut writer: W,
        role: SpeakerRole,
        config: &TunnelConfig,
        tasks: &TaskTracker,
        cancel: CancellationToken,
    ) -> std::result::Result<(Self, mpsc::Receiver<Incoming<S, R>>), HandshakeError>
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let version = handshake(
            &mut reader,
            &mut writer,
            role,
            config.handshake_timeout,
            &cancel,
        )
        .await?;
        debug!(%role, %version, "tunnel handshake complete");

        let (outbound, outbound_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let (incoming_tx, incoming_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let pending: PendingReplies<R> = Arc::new(Mutex::new(HashMap::new()));

        tasks.spawn(send_loop(
            writer,
            config.max_message_size,
            outbound_rx,
            cancel.clone(),
        ));
        tasks.spawn(recv_loop(
            reader,
            config.max_message_size,
            pending.clone(),
            incoming_tx,
            outbound.clone(),
            cancel.clone(),
        ));

        let speaker = Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            version,
            cancel,
        };
        Ok((speaker, incoming_rx))
    }

    /// Negotiated protocol version
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Queue a message without RPC metadata
    pub async fn send(&self, msg: S) -> Result<()> {
        enqueue(&self.outbound, &self.cancel, Outbound::Message(msg)).await
    }

    /// Send a request and wait for the matching reply.
    ///
    /// Dropping the returned future forgets the request; a late reply is
    /// then logged and discarded.
    pub async fn unary_rpc(&self, mut msg: S) -> Result<R> {
        let msg_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_id, tx);
        let _waiting = PendingGuard {
            pending: &self.pending,
            msg_id,
        };

        msg.set_rpc(Rpc {
            msg_id,
            response_to: 0,
        });
        self.send(msg).await?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TunnelError::Closed),
            reply = rx => reply.map_err(|_| TunnelError::Closed),
        }
    }

    /// Write everything queued so far, then close the stream
    pub async fn finish(&self) {
        let _ = enqueue(&self.outbound, &self.cancel, Outbound::Finish).await;
    }

    /// Close the stream immediately, dropping queued messages
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the loops have stopped or are stopping
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the speaker is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl<S, R> fmt::Debug for Speaker<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Speaker")
            .field("version", &self.version)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn send_loop<W, S>(
    mut writer: W,
    max_message_size: usize,
    mut outbound: mpsc::Receiver<Outbound<S>>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
    S: RpcMessage,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => next,
        };
        let msg = match next {
            Some(Outbound::Message(msg)) => msg,
            Some(Outbound::Finish) | None => {
                debug!("send loop finished");
                break;
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = message::write_frame(&mut writer, &msg, max_message_size) => written,
        };
        match written {
            Ok(()) => trace!(?msg, "sent message"),
            Err(TunnelError::MessageTooLarge { size, limit }) => {
                warn!(size, limit, "dropping oversized outbound message");
            }
            Err(err) => {
                warn!(error = %err, "failed to write message");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    cancel.cancel();
}

async fn recv_loop<Rd, S, R>(
    reader: Rd,
    max_message_size: usize,
    pending: PendingReplies<R>,
    incoming: mpsc::Sender<Incoming<S, R>>,
    outbound: mpsc::Sender<Outbound<S>>,
    cancel: CancellationToken,
) where
    Rd: AsyncRead + Unpin,
    S: RpcMessage,
    R: RpcMessage,
{
    let mut frames = FramedRead::new(reader, FrameCodec::<R>::new(max_message_size));
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            None => {
                debug!("peer closed the tunnel stream");
                break;
            }
            Some(Err(err)) => {
                warn!(error = %err, "failed to read message");
                break;
            }
        };
        trace!(?msg, "received message");

        let rpc = msg.rpc().copied().unwrap_or_default();
        if rpc.response_to != 0 {
            let waiter = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&rpc.response_to);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => warn!(response_to = rpc.response_to, "reply to unknown request"),
            }
            continue;
        }

        let item = Incoming {
            msg,
            msg_id: rpc.msg_id,
            outbound: outbound.clone(),
            cancel: cancel.clone(),
        };
        let delivered = tokio::select! {
            _ = cancel.cancelled() => break,
            delivered = incoming.send(item) => delivered,
        };
        if delivered.is_err() {
            debug!("incoming handler gone");
            break;
        }
    }

    cancel.cancel();
    // Dropping the waiters fails their RPCs with `Closed`.
    pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::message::{
        CommandResponse, LogField, LogLevel, LogRecord, ManagerPayload, StartRequest,
        TunnelPayload,
    };
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    type Halves = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

    fn stream_pair() -> (Halves, Halves) {
        let (a, b) = duplex(16 * 1024);
        (split(a), split(b))
    }

    fn test_config() -> TunnelConfig {
        TunnelConfig {
            handshake_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn speakers() -> (
        (TunnelSpeaker, mpsc::Receiver<Incoming<TunnelMessage, ManagerMessage>>),
        (ManagerSpeaker, mpsc::Receiver<Incoming<ManagerMessage, TunnelMessage>>),
        TaskTracker,
    ) {
        let ((tr, tw), (mr, mw)) = stream_pair();
        let tasks = TaskTracker::new();
        let config = test_config();
        let (tunnel, manager) = tokio::join!(
            TunnelSpeaker::start(tr, tw, SpeakerRole::Tunnel, &config, &tasks, CancellationToken::new()),
            ManagerSpeaker::start(mr, mw, SpeakerRole::Manager, &config, &tasks, CancellationToken::new()),
        );
        (tunnel.unwrap(), manager.unwrap(), tasks)
    }

    fn log(message: &str) -> TunnelMessage {
        TunnelMessage::new(TunnelPayload::Log(LogRecord {
            level: LogLevel::Info,
            message: message.into(),
            logger_names: vec![],
            fields: vec![LogField {
                name: "n".into(),
                value: "1".into(),
            }],
        }))
    }

    #[test]
    fn test_header_encode() {
        assert_eq!(
            Header::current(SpeakerRole::Tunnel).encode(),
            "meshtun tunnel 1.0\n"
        );
    }

    #[test]
    fn test_header_parse_and_negotiate() {
        let header = Header::parse("meshtun manager 1.0,2.1").unwrap();
        assert_eq!(header.role, SpeakerRole::Manager);
        assert_eq!(header.versions.len(), 2);
        assert_eq!(header.negotiate(SpeakerRole::Manager).unwrap(), CURRENT_VERSION);

        // A newer minor of the same major is accepted at our minor.
        let header = Header::parse("meshtun manager 1.7").unwrap();
        assert_eq!(
            header.negotiate(SpeakerRole::Manager).unwrap(),
            ProtocolVersion { major: 1, minor: 0 }
        );
    }

    #[test]
    fn test_header_rejections() {
        let cases = [
            ("meshtun manager", "expected 3 fields"),
            ("othervpn manager 1.0", "invalid preamble"),
            ("meshtun 1.0 manager", "unknown role"),
            ("meshtun manager one", "invalid version"),
            ("meshtun manager 1.", "invalid version"),
        ];
        for (line, needle) in cases {
            let err = Header::parse(line).unwrap_err();
            let text = err.to_string();
            assert!(text.starts_with("validate header"), "{line}: {text}");
            assert!(text.contains(needle), "{line}: {text}");
        }
    }

    #[test]
    fn test_negotiate_rejections() {
        let err = Header::parse("meshtun tunnel 1.0")
            .unwrap()
            .negotiate(SpeakerRole::Manager)
            .unwrap_err();
        assert!(err.to_string().contains("expected role manager"));

        let err = Header::parse("meshtun manager 2.0,3.1")
            .unwrap()
            .negotiate(SpeakerRole::Manager)
            .unwrap_err();
        assert!(err.to_string().contains("no version compatible"));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let ((mut tr, mut tw), _manager_side) = stream_pair();
        let err = handshake(
            &mut tr,
            &mut tw,
            SpeakerRole::Tunnel,
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
        assert!(err.to_string().contains("handshake failed"));
    }

    #[tokio::test]
    async fn test_handshake_cancelled() {
        let ((mut tr, mut tw), _manager_side) = stream_pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handshake(
            &mut tr,
            &mut tw,
            SpeakerRole::Tunnel,
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Cancelled));
    }

    #[tokio::test]
    async fn test_handshake_oversize_header() {
        let ((mut tr, mut tw), (_mr, mut mw)) = stream_pair();
        mw.write_all(&[b'a'; 300]).await.unwrap();

        let err = handshake(
            &mut tr,
            &mut tw,
            SpeakerRole::Tunnel,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Oversize(MAX_HEADER_LEN)));
    }

    #[tokio::test]
    async fn test_handshake_peer_hangs_up() {
        let ((mut tr, mut tw), manager_side) = stream_pair();
        drop(manager_side);

        let err = handshake(
            &mut tr,
            &mut tw,
            SpeakerRole::Tunnel,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Io(_)));
    }

    #[tokio::test]
    async fn test_handshake_wrong_role() {
        let ((mut tr, mut tw), (_mr, mut mw)) = stream_pair();
        mw.write_all(b"meshtun tunnel 1.0\n").await.unwrap();

        let err = handshake(
            &mut tr,
            &mut tw,
            SpeakerRole::Tunnel,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("validate header"));
    }

    #[tokio::test]
    async fn test_unary_rpc() {
        let ((tunnel, mut tunnel_rx), (manager, _manager_rx), _tasks) = speakers().await;
        assert_eq!(tunnel.version(), CURRENT_VERSION);

        let responder = tokio::spawn(async move {
            let request = tunnel_rx.recv().await.unwrap();
            assert!(request.msg_id().is_some());
            assert!(matches!(request.msg.msg, ManagerPayload::Start(_)));
            request
                .reply(TunnelMessage::new(TunnelPayload::Start(CommandResponse {
                    success: true,
                    error_message: String::new(),
                })))
                .await
                .unwrap();
            (tunnel, tunnel_rx)
        });

        let reply = manager
            .unary_rpc(ManagerMessage::new(ManagerPayload::Start(StartRequest {
                server_url: "https://coord.example.com".into(),
                api_token: "t".into(),
                ..Default::default()
            })))
            .await
            .unwrap();
        let rpc = reply.rpc.unwrap();
        assert_eq!(rpc.response_to, 1);
        assert!(matches!(reply.msg, TunnelPayload::Start(CommandResponse { success: true, .. })));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_flushes_queued_messages() {
        let ((tunnel, _tunnel_rx), (_manager, mut manager_rx), tasks) = speakers().await;

        for i in 0..3 {
            tunnel.send(log(&format!("line {i}"))).await.unwrap();
        }
        tunnel.finish().await;

        for i in 0..3 {
            let incoming = manager_rx.recv().await.unwrap();
            assert!(incoming.msg_id().is_none());
            match incoming.msg.msg {
                TunnelPayload::Log(record) => assert_eq!(record.message, format!("line {i}")),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(manager_rx.recv().await.is_none());

        tasks.close();
        tokio::time::timeout(Duration::from_secs(2), tasks.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_rpc() {
        let ((tunnel, _tunnel_rx), (manager, _manager_rx), _tasks) = speakers().await;

        let closer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tunnel.close();
        };
        let (result, ()) = tokio::join!(
            manager.unary_rpc(ManagerMessage::new(ManagerPayload::GetPeerUpdate)),
            closer
        );
        assert!(matches!(result, Err(TunnelError::Closed)));

        tokio::time::timeout(Duration::from_secs(2), manager.closed())
            .await
            .unwrap();
        assert!(manager.send(ManagerMessage::new(ManagerPayload::Stop)).await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_rpc_forgets_waiter() {
        let ((_tunnel, mut tunnel_rx), (manager, _manager_rx), _tasks) = speakers().await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            manager.unary_rpc(ManagerMessage::new(ManagerPayload::GetPeerUpdate)),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(manager.pending.lock().unwrap().is_empty());

        // The late reply finds no waiter and the speaker keeps working.
        let request = tunnel_rx.recv().await.unwrap();
        request
            .reply(TunnelMessage::new(TunnelPayload::Stop(CommandResponse {
                success: true,
                error_message: String::new(),
            })))
            .await
            .unwrap();
        assert!(!manager.is_closed());
    }

    #[test]
    fn test_send_loop_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (_peer, writer) = duplex(64);
        let (_tx, rx) = mpsc::channel::<Outbound<TunnelMessage>>(1);
        let send = send_loop(writer, 1024, rx, CancellationToken::new());
        assert_send(&send);
    }
}
