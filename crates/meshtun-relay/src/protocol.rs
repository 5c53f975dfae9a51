//! Relay wire protocol.
//!
//! Frames are a 4-byte big-endian length followed by a `bincode`-encoded
//! [`RelayMessage`]. A connection opens with the relay's
//! [`RelayMessage::ServerHello`] carrying a random challenge; the client
//! answers with a signed [`RelayMessage::ClientHello`] and the relay
//! confirms with [`RelayMessage::ServerInfo`].

use std::io;

use bincode::Options;
use bytes::BytesMut;
use futures::StreamExt;
use meshtun_core::PeerKey;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, FramedRead, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::error::RelayError;
use crate::identity::Identity;

/// Protocol version carried in the hellos
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Challenge length
pub const CHALLENGE_SIZE: usize = 32;

const AUTH_CONTEXT: &[u8] = b"meshtun relay auth v1";

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Relay greets a new connection
    ServerHello {
        /// Relay's public key
        relay_key: PeerKey,
        /// Random bytes the client must sign
        challenge: [u8; CHALLENGE_SIZE],
        /// Relay protocol version
        version: u8,
    },

    /// Client authenticates
    ClientHello {
        /// Client's public key
        node_key: PeerKey,
        /// Signature over [`auth_message`]
        signature: Vec<u8>,
        /// Shared mesh key, required to watch peers on keyed relays
        mesh_key: Option<String>,
        /// Stream peer presence to this client
        watch_peers: bool,
        /// Client protocol version
        version: u8,
    },

    /// Relay accepted the client
    ServerInfo {
        /// Relay's identifier
        relay_id: [u8; 32],
    },

    /// A peer is attached to the relay
    PeerPresent {
        /// The peer
        peer: PeerKey,
    },

    /// A peer left the relay
    PeerGone {
        /// The peer
        peer: PeerKey,
    },

    /// Liveness check
    Keepalive,

    /// Relay error response
    Error {
        /// Error code
        code: RelayErrorCode,
        /// Human-readable error message
        message: String,
    },
}

/// Relay error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorCode {
    /// Invalid message format or order
    InvalidMessage = 1,
    /// Server at capacity
    ServerFull = 2,
    /// Signature did not verify
    AuthFailed = 3,
    /// Unsupported protocol version
    VersionMismatch = 4,
    /// Watching requires the mesh key
    MeshKeyRequired = 5,
    /// Internal server error
    InternalError = 6,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_SIZE as u64)
}

impl RelayMessage {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        let bytes = codec().serialize(self)?;
        Ok(bytes)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        let msg = codec().deserialize(bytes)?;
        Ok(msg)
    }

    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::ServerHello { .. } => "ServerHello",
            RelayMessage::ClientHello { .. } => "ClientHello",
            RelayMessage::ServerInfo { .. } => "ServerInfo",
            RelayMessage::PeerPresent { .. } => "PeerPresent",
            RelayMessage::PeerGone { .. } => "PeerGone",
            RelayMessage::Keepalive => "Keepalive",
            RelayMessage::Error { .. } => "Error",
        }
    }
}

/// Bytes a client signs to answer a challenge
pub fn auth_message(relay_key: &PeerKey, challenge: &[u8; CHALLENGE_SIZE]) -> Vec<u8> {
    let mut message = Vec::with_capacity(AUTH_CONTEXT.len() + 32 + CHALLENGE_SIZE);
    message.extend_from_slice(AUTH_CONTEXT);
    message.extend_from_slice(relay_key.as_bytes());
    message.extend_from_slice(challenge);
    message
}

/// Relay identifier derived from its public key
pub fn relay_id(relay_key: &PeerKey) -> [u8; 32] {
    *blake3::hash(relay_key.as_bytes()).as_bytes()
}

/// Encode a message as a length-prefixed frame
pub fn encode_frame(msg: &RelayMessage) -> Result<Vec<u8>, RelayError> {
    let body = msg.to_bytes()?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RelayError::FrameTooLarge {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one framed message
pub async fn write_message<W>(writer: &mut W, msg: &RelayMessage) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Decoder for relay frames
#[derive(Debug)]
pub struct RelayCodec {
    frames: LengthDelimitedCodec,
}

impl RelayCodec {
    /// Codec enforcing [`MAX_FRAME_SIZE`]
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RelayMessage>, RelayError> {
        match self.frames.decode(src) {
            Ok(Some(body)) => RelayMessage::from_bytes(&body).map(Some),
            Ok(None) => Ok(None),
            Err(e) if is_length_error(&e) => Err(RelayError::FrameTooLong {
                limit: MAX_FRAME_SIZE,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_length_error(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}

/// Inbound relay messages.
///
/// [`MessageStream::next`] is cancel-safe: a frame interrupted by another
/// `select!` branch stays buffered for the next call.
#[derive(Debug)]
pub struct MessageStream<R> {
    frames: FramedRead<R, RelayCodec>,
}

impl<R: AsyncRead + Unpin> MessageStream<R> {
    /// Read messages from `reader`
    pub fn new(reader: R) -> Self {
        Self {
            frames: FramedRead::new(reader, RelayCodec::new()),
        }
    }

    /// Next message; `None` once the peer has closed the stream
    pub async fn next(&mut self) -> Option<Result<RelayMessage, RelayError>> {
        self.frames.next().await
    }

    /// Next message, treating a clean close as an error
    pub async fn expect(&mut self) -> Result<RelayMessage, RelayError> {
        self.next().await.unwrap_or(Err(RelayError::ConnectionClosed))
    }
}

/// Client side of the relay handshake; returns the relay id
pub async fn client_handshake<R, W>(
    inbound: &mut MessageStream<R>,
    writer: &mut W,
    identity: &Identity,
    watch_peers: bool,
) -> Result<[u8; 32], RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (relay_key, challenge) = match inbound.expect().await? {
        RelayMessage::ServerHello {
            relay_key,
            challenge,
            version,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(RelayError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: version,
                });
            }
            (relay_key, challenge)
        }
        RelayMessage::Error { code, message } => return Err(RelayError::Rejected { code, message }),
        other => {
            return Err(RelayError::Protocol(format!(
                "expected ServerHello, got {}",
                other.message_type()
            )));
        }
    };

    let hello = RelayMessage::ClientHello {
        node_key: identity.public_key(),
        signature: identity.sign(&auth_message(&relay_key, &challenge)).to_vec(),
        mesh_key: identity.mesh_key().map(str::to_string),
        watch_peers,
        version: PROTOCOL_VERSION,
    };
    write_message(writer, &hello).await?;

    match inbound.expect().await? {
        RelayMessage::ServerInfo { relay_id } => Ok(relay_id),
        RelayMessage::Error { code, message } => Err(RelayError::Rejected { code, message }),
        other => Err(RelayError::Protocol(format!(
            "expected ServerInfo, got {}",
            other.message_type()
        ))),
    }
}
