//! Peer link and call room collaborator interfaces
//!
//! The engine never establishes media links or server-side rooms itself; it
//! drives these two traits and reacts to the callbacks the integration layer
//! feeds back through [`crate::service::CallService`].

use crate::protocol::CallIq;
use crate::types::{CallRoomId, ConnectionId, Geolocation, MediaDirection, MemberId, TerminateReason};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by the transport collaborators
#[derive(Error, Debug)]
pub enum LinkError {
    /// The link does not exist or was already torn down
    #[error("Link not found: {0}")]
    LinkNotFound(ConnectionId),

    /// The link exists but cannot perform the operation right now
    #[error("Invalid link state: {0}")]
    InvalidState(String),

    /// The peer or the server could not be reached
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The server rejected a call room operation
    #[error("Call room error: {0}")]
    CallRoomError(String),
}

/// Transport primitive that establishes and drives one P2P media link.
///
/// Implement this for your specific transport. All methods are asynchronous;
/// completion of the setup steps is reported back through the service
/// callbacks, not through these return values (the `Ok` here only means the
/// request was taken over by the transport).
#[async_trait]
pub trait PeerLinkTransport: Send + Sync {
    /// Start establishing an outgoing link to the peer
    async fn create_outgoing_link(
        &self,
        connection_id: ConnectionId,
        peer_id: Uuid,
        video: bool,
    ) -> Result<(), LinkError>;

    /// Accept an incoming link that was offered to us
    async fn create_incoming_link(&self, connection_id: ConnectionId) -> Result<(), LinkError>;

    /// Initialize the audio path of the link
    async fn init_audio(&self, connection_id: ConnectionId) -> Result<(), LinkError>;

    /// Send a call IQ over the link's data channel
    async fn send_iq(&self, connection_id: ConnectionId, iq: CallIq) -> Result<(), LinkError>;

    /// Negotiate the audio media direction
    async fn set_audio_direction(
        &self,
        connection_id: ConnectionId,
        direction: MediaDirection,
    ) -> Result<(), LinkError>;

    /// Negotiate the video media direction
    async fn set_video_direction(
        &self,
        connection_id: ConnectionId,
        direction: MediaDirection,
    ) -> Result<(), LinkError>;

    /// Relay a conversation descriptor over the link's data channel
    async fn send_descriptor(
        &self,
        connection_id: ConnectionId,
        descriptor_id: Uuid,
    ) -> Result<(), LinkError>;

    /// Push a geolocation update over the link's data channel; `None` tells
    /// the peer that sharing stopped
    async fn send_geolocation(
        &self,
        connection_id: ConnectionId,
        position: Option<Geolocation>,
    ) -> Result<(), LinkError>;

    /// Fingerprint of the session keys securing the link, used by the
    /// in-call key check
    async fn key_fingerprint(&self, connection_id: ConnectionId) -> Result<Vec<u8>, LinkError>;

    /// Tear the link down with the given reason
    async fn terminate_link(
        &self,
        connection_id: ConnectionId,
        reason: TerminateReason,
    ) -> Result<(), LinkError>;
}

/// Server-side call room membership service for group calls.
///
/// Request identifiers tag every operation so a duplicate or stale response
/// can be recognized and dropped by the caller.
#[async_trait]
pub trait CallRoomService: Send + Sync {
    /// Create a call room and return its id together with our member id
    async fn create_call_room(
        &self,
        request_id: i64,
        max_member_count: u32,
    ) -> Result<(CallRoomId, MemberId), LinkError>;

    /// Invite the peer behind the connection into the call room
    async fn invite_call_room(
        &self,
        request_id: i64,
        room_id: CallRoomId,
        connection_id: ConnectionId,
    ) -> Result<MemberId, LinkError>;

    /// Join a call room we were invited to; returns our member id
    async fn join_call_room(
        &self,
        request_id: i64,
        room_id: CallRoomId,
    ) -> Result<MemberId, LinkError>;

    /// Leave the call room
    async fn leave_call_room(
        &self,
        request_id: i64,
        room_id: CallRoomId,
        member_id: MemberId,
    ) -> Result<(), LinkError>;
}

/// Protocol version advertised by a peer, from which its optional
/// capabilities are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerVersion {
    /// Major protocol version
    pub major: u32,
    /// Minor protocol version
    pub minor: u32,
}

impl PeerVersion {
    /// First version supporting mesh group calls
    pub const GROUP_CALLS: PeerVersion = PeerVersion { major: 2, minor: 0 };
    /// First version supporting in-call messages
    pub const MESSAGES: PeerVersion = PeerVersion { major: 2, minor: 1 };
    /// First version supporting geolocation sharing
    pub const GEOLOCATION: PeerVersion = PeerVersion { major: 2, minor: 3 };
    /// First version supporting media streaming
    pub const STREAMING: PeerVersion = PeerVersion { major: 2, minor: 2 };

    /// Create a version
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for PeerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
