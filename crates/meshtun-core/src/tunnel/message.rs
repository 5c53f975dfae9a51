//! Tunnel protocol messages and framing.
//!
//! After the header exchange every message is a 4-byte big-endian length
//! followed by the `bincode` encoding of the message.

use std::io;
use std::marker::PhantomData;

use bincode::Options;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::error::{Result, TunnelError};
use crate::presence::PeerKey;

/// Length prefix size
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Unary RPC bookkeeping carried on a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpc {
    /// Non-zero on requests
    pub msg_id: u64,
    /// Non-zero on replies: the `msg_id` being answered
    pub response_to: u64,
}

/// Messages that carry optional RPC metadata
pub trait RpcMessage:
    Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static
{
    /// RPC metadata, if any
    fn rpc(&self) -> Option<&Rpc>;

    /// Attach RPC metadata
    fn set_rpc(&mut self, rpc: Rpc);
}

/// Severity of a forwarded log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace
    Trace,
    /// Debug
    Debug,
    /// Info
    Info,
    /// Warn
    Warn,
    /// Error
    Error,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// One structured field of a log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogField {
    /// Field name
    pub name: String,
    /// Rendered value
    pub value: String,
}

/// A structured log record forwarded to the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity
    pub level: LogLevel,
    /// Message text
    pub message: String,
    /// Event target followed by enclosing span names, outermost first
    pub logger_names: Vec<String>,
    /// Structured fields
    pub fields: Vec<LogField>,
}

/// A peer and the relays it is reachable through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer public key
    pub key: PeerKey,
    /// Relays the peer is attached to
    pub relays: Vec<String>,
}

/// Change in peer reachability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    /// Peers that became (or still are) reachable
    pub upserted_peers: Vec<PeerInfo>,
    /// Peers that are no longer reachable
    pub deleted_peers: Vec<PeerInfo>,
    /// `upserted_peers` is the complete current set
    pub full_snapshot: bool,
}

/// HTTP-style header passed through to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// Manager asks the tunnel to bring up networking
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Coordination server URL
    pub server_url: String,
    /// Credential for the coordination server
    pub api_token: String,
    /// Extra headers for the coordination server
    pub headers: Vec<Header>,
    /// Host device identifier, if known
    pub device_id: Option<String>,
    /// Host operating system, if known
    pub device_os: Option<String>,
}

/// Result of a start or stop request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the request succeeded
    pub success: bool,
    /// Failure description, empty on success
    pub error_message: String,
}

impl CommandResponse {
    /// Build a response from an outcome
    pub fn from_result<E: std::fmt::Display>(result: &std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                error_message: String::new(),
            },
            Err(err) => Self {
                success: false,
                error_message: err.to_string(),
            },
        }
    }
}

/// Payloads sent by the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelPayload {
    /// Forwarded log record
    Log(LogRecord),
    /// Peer reachability change (or reply to `GetPeerUpdate`)
    PeerUpdate(PeerUpdate),
    /// Reply to `Start`
    Start(CommandResponse),
    /// Reply to `Stop`
    Stop(CommandResponse),
}

/// Message sent by the tunnel to the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    /// RPC metadata
    pub rpc: Option<Rpc>,
    /// Payload
    pub msg: TunnelPayload,
}

impl TunnelMessage {
    /// Message without RPC metadata
    pub fn new(msg: TunnelPayload) -> Self {
        Self { rpc: None, msg }
    }
}

impl RpcMessage for TunnelMessage {
    fn rpc(&self) -> Option<&Rpc> {
        self.rpc.as_ref()
    }

    fn set_rpc(&mut self, rpc: Rpc) {
        self.rpc = Some(rpc);
    }
}

/// Payloads sent by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerPayload {
    /// Request the full peer set
    GetPeerUpdate,
    /// Bring up networking
    Start(StartRequest),
    /// Tear down networking and end the session
    Stop,
}

/// Message sent by the manager to the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerMessage {
    /// RPC metadata
    pub rpc: Option<Rpc>,
    /// Payload
    pub msg: ManagerPayload,
}

impl ManagerMessage {
    /// Message without RPC metadata
    pub fn new(msg: ManagerPayload) -> Self {
        Self { rpc: None, msg }
    }
}

impl RpcMessage for ManagerMessage {
    fn rpc(&self) -> Option<&Rpc> {
        self.rpc.as_ref()
    }

    fn set_rpc(&mut self, rpc: Rpc) {
        self.rpc = Some(rpc);
    }
}

fn decode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(limit as u64)
}

/// Encode a message as a length-prefixed frame
pub fn encode_frame<M: Serialize>(msg: &M, max_size: usize) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    if body.len() > max_size || body.len() > u32::MAX as usize {
        return Err(TunnelError::MessageTooLarge {
            size: body.len(),
            limit: max_size,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_LENGTH_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (without the length prefix)
pub fn decode_body<M: DeserializeOwned>(body: &[u8], max_size: usize) -> Result<M> {
    decode_options(max_size)
        .deserialize(body)
        .map_err(TunnelError::from)
}

/// Write one framed message
pub async fn write_frame<W, M>(writer: &mut W, msg: &M, max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let frame = encode_frame(msg, max_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Decoder for a stream of length-prefixed messages of type `M`.
///
/// Used with `FramedRead`, whose `next()` is cancel-safe: a partially read
/// frame stays buffered when the read is abandoned.
pub struct FrameCodec<M> {
    frames: LengthDelimitedCodec,
    max_size: usize,
    _message: PhantomData<fn() -> M>,
}

impl<M> FrameCodec<M> {
    /// Codec rejecting frames longer than `max_size`
    pub fn new(max_size: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(FRAME_LENGTH_SIZE)
                .big_endian()
                .max_frame_length(max_size)
                .new_codec(),
            max_size,
            _message: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for FrameCodec<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl<M: DeserializeOwned> Decoder for FrameCodec<M> {
    type Item = M;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>> {
        match self.frames.decode(src) {
            Ok(Some(body)) => decode_body(&body, self.max_size).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(frame_error(err, self.max_size)),
        }
    }
}

fn frame_error(err: io::Error, limit: usize) -> TunnelError {
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
    {
        TunnelError::FrameTooLong { limit }
    } else {
        TunnelError::Io(err)
    }
}
