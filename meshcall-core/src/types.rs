//! Core call types and data structures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a logical call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one P2P link within a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-tracked call room identifier for group calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallRoomId(pub Uuid);

impl CallRoomId {
    /// Create a new random call room ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CallRoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a member within a call room
pub type MemberId = String;

/// Shared monotonic allocator for wire request identifiers.
///
/// Cloning hands out a handle to the same sequence, so every component of a
/// call draws from one id space and responses can be matched unambiguously.
#[derive(Debug, Clone, Default)]
pub struct RequestIds(std::sync::Arc<std::sync::atomic::AtomicI64>);

impl RequestIds {
    /// Allocate the next request identifier (starting at 1)
    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }
}

/// Small dense integer identifying a participant within one call
pub type ParticipantId = i32;

/// Direction of the call as seen from this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// The peer called us
    Incoming,
    /// We called the peer
    Outgoing,
}

/// Call status as a set of orthogonal named flags.
///
/// Legal progression: `{incoming|outgoing}` -> `accepted` -> `active` ->
/// `terminated`. The hold flags are only meaningful once active and are
/// independent of the main progression. `terminated` is absorbing: once set,
/// no transition mutates the status again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatus {
    direction: CallDirection,
    video: bool,
    bell: bool,
    accepted: bool,
    active: bool,
    terminated: bool,
    on_hold: bool,
    peer_on_hold: bool,
}

impl CallStatus {
    /// An incoming audio call (not yet accepted)
    pub fn incoming_call() -> Self {
        Self::new(CallDirection::Incoming, false, false)
    }

    /// An incoming video call (not yet accepted)
    pub fn incoming_video_call() -> Self {
        Self::new(CallDirection::Incoming, true, false)
    }

    /// An incoming video bell
    pub fn incoming_video_bell() -> Self {
        Self::new(CallDirection::Incoming, false, true)
    }

    /// An outgoing audio call (not yet accepted)
    pub fn outgoing_call() -> Self {
        Self::new(CallDirection::Outgoing, false, false)
    }

    /// An outgoing video call (not yet accepted)
    pub fn outgoing_video_call() -> Self {
        Self::new(CallDirection::Outgoing, true, false)
    }

    /// An outgoing video bell (not yet accepted)
    pub fn outgoing_video_bell() -> Self {
        Self::new(CallDirection::Outgoing, false, true)
    }

    fn new(direction: CallDirection, video: bool, bell: bool) -> Self {
        Self {
            direction,
            video,
            bell,
            accepted: false,
            active: false,
            terminated: false,
            on_hold: false,
            peer_on_hold: false,
        }
    }

    /// True for an incoming call
    pub fn is_incoming(&self) -> bool {
        self.direction == CallDirection::Incoming
    }

    /// True for an outgoing call
    pub fn is_outgoing(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// True once the call was accepted by the callee
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// True once the media connection is established
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True if video is part of the call
    pub fn is_video(&self) -> bool {
        self.video
    }

    /// True for a video bell call
    pub fn is_bell(&self) -> bool {
        self.bell
    }

    /// True when either side paused the call
    pub fn is_on_hold(&self) -> bool {
        self.on_hold || self.peer_on_hold
    }

    /// True when we paused the call
    pub fn is_paused(&self) -> bool {
        self.on_hold
    }

    /// True when the peer paused the call
    pub fn is_peer_on_hold(&self) -> bool {
        self.peer_on_hold
    }

    /// True once the call is terminated (absorbing)
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Move to the accepted state; no-op after termination
    pub fn to_accepted(&mut self) {
        if !self.terminated {
            self.accepted = true;
        }
    }

    /// Move to the active/connected state; no-op after termination
    pub fn to_active(&mut self) {
        if !self.terminated {
            self.active = true;
        }
    }

    /// Enable video on the call; no-op after termination
    pub fn to_video(&mut self) {
        if !self.terminated {
            self.video = true;
        }
    }

    /// Enter the terminal state; every later transition is a no-op
    pub fn to_terminated(&mut self) {
        self.terminated = true;
    }

    /// Record that we put the call on hold; only meaningful while active
    pub fn set_on_hold(&mut self, hold: bool) {
        if !self.terminated && self.active {
            self.on_hold = hold;
        }
    }

    /// Record that the peer put the call on hold; only meaningful while active
    pub fn set_peer_on_hold(&mut self, hold: bool) {
        if !self.terminated && self.active {
            self.peer_on_hold = hold;
        }
    }
}

/// Tri-state capability of a peer, unknown until its protocol version is learned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Support {
    /// Capability not yet learned
    #[default]
    Unknown,
    /// Peer does not support the feature
    No,
    /// Peer supports the feature
    Yes,
}

impl Support {
    /// True only when the capability is positively known
    pub fn is_supported(&self) -> bool {
        matches!(self, Support::Yes)
    }
}

/// Streaming status of a peer's player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamingStatus {
    /// Status not known (peer not yet connected)
    #[default]
    Unknown,
    /// Peer does not support streaming
    NotAvailable,
    /// Peer is ready to receive streaming
    Ready,
    /// Peer is playing the stream we are sending
    Playing,
    /// Peer's player is paused
    Paused,
    /// Peer does not support the media we are sending
    Unsupported,
    /// Other error reported by the peer
    Error,
}

impl StreamingStatus {
    /// True when the peer can receive a stream at all
    pub fn is_supported(&self) -> bool {
        !matches!(self, StreamingStatus::Unknown | StreamingStatus::NotAvailable)
    }
}

/// What kind of media track changed on a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Nothing changed
    None,
    /// An audio track
    Audio,
    /// A video track
    Video,
}

/// Transport-level state of a P2P link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Link not established
    Disconnected,
    /// Link negotiation in progress
    Connecting,
    /// Link established, media can flow
    Connected,
}

/// Why a connection or call was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminateReason {
    /// Normal termination by either side
    Success,
    /// The callee is busy with another call
    Busy,
    /// The call was cancelled before being accepted
    Cancel,
    /// The callee declined the call
    Decline,
    /// Connection setup or media transport failed
    ConnectivityError,
    /// The peer did not answer before the timeout
    NotAnswered,
    /// The peer revoked the relationship
    Revoked,
    /// The call moved to another device
    Transferred,
    /// The two calls were merged into one
    Merged,
    /// Setup step failed after exhausting retries
    SetupError,
}

/// Result of mapping a transport state change onto a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// State change with no call-level significance
    Ignore,
    /// The audio/video is now connected for the first time
    FirstConnection,
    /// Connected and not yet in a call room
    FirstGroup,
    /// New connection is active and we are in a call room
    NewConnection,
}

/// Direction of an in-progress call transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferDirection {
    /// No transfer is taking place
    #[default]
    None,
    /// The call is moving from this device to the browser
    ToBrowser,
    /// The call is moving from the browser to this device
    ToDevice,
}

/// Negotiated media direction for one track of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaDirection {
    /// No media flows
    Inactive,
    /// We only send
    SendOnly,
    /// We only receive
    RecvOnly,
    /// Both directions
    SendRecv,
}

/// Geolocation shared with the other call members
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Altitude in meters
    pub altitude: f64,
}

/// Closed application-level error code carried in response messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No error
    Success,
    /// Malformed or out-of-context request
    BadRequest,
    /// The feature is not supported by this device
    NotSupported,
    /// The device is busy and cannot honor the request
    Busy,
    /// The request was denied
    NoPermission,
    /// Internal failure
    InternalError,
}

/// Events a participant can raise for the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantEvent {
    /// The participant connection is established
    Connected,
    /// Name/description/avatar information changed
    Identity,
    /// The participant unmuted its microphone
    AudioOn,
    /// The participant muted its microphone
    AudioOff,
    /// The participant enabled its camera
    VideoOn,
    /// The participant disabled its camera
    VideoOff,
    /// The participant device is ringing
    Ringing,
    /// The participant put the call on hold
    Hold,
    /// The participant resumed the call
    Resume,
    /// The participant started a key check
    KeyCheckInitiate,
    /// The participant answered our key check request
    OnKeyCheckInitiate,
    /// A word was confirmed by us or the peer
    CurrentWordChanged,
    /// The participant's current word is incorrect
    WordCheckResultKo,
    /// Both sides have finished the key check
    TerminateKeyCheck,
    /// The participant started sharing its screen
    ScreenSharingOn,
    /// The participant stopped sharing its screen
    ScreenSharingOff,
    /// The participant asks to take control of our camera
    AskCameraControl,
    /// The camera control request was denied
    CameraControlDenied,
    /// The peer granted access to its camera
    CameraControlGranted,
    /// The camera control session is over
    CameraControlDone,
}

/// Events of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingEvent {
    /// A streaming has started
    Start,
    /// Player associated with streaming is now playing
    Playing,
    /// Player is now paused
    Paused,
    /// Player has completed playing
    Completed,
    /// Player does not support the streamed content
    Unsupported,
    /// Player had errors while playing streamed content
    Error,
    /// The streaming has stopped
    Stop,
}

/// Call-level events published to subscribers
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An outgoing call was initiated
    CallInitiated {
        /// Call identifier
        call_id: CallId,
        /// Initial status
        status: CallStatus,
    },
    /// An incoming call offer arrived
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Connection carrying the offer
        connection_id: ConnectionId,
        /// Initial status
        status: CallStatus,
    },
    /// The call status progressed
    StatusChanged {
        /// Call identifier
        call_id: CallId,
        /// New status
        status: CallStatus,
    },
    /// A connection reached the connected state for the first time
    FirstConnection {
        /// Call identifier
        call_id: CallId,
        /// Connection that connected
        connection_id: ConnectionId,
    },
    /// A participant joined the call
    ParticipantAdded {
        /// Call identifier
        call_id: CallId,
        /// Participant identifier
        participant_id: ParticipantId,
    },
    /// One or more participants left the call
    ParticipantsRemoved {
        /// Call identifier
        call_id: CallId,
        /// Participants that left
        participant_ids: Vec<ParticipantId>,
    },
    /// A participant-scoped event occurred
    Participant {
        /// Call identifier
        call_id: CallId,
        /// Participant identifier
        participant_id: ParticipantId,
        /// The event
        event: ParticipantEvent,
    },
    /// A streaming event occurred; `participant_id` is `None` for the local
    /// monitor of the content we are sending
    Streaming {
        /// Call identifier
        call_id: CallId,
        /// Remote participant, or None for the local player
        participant_id: Option<ParticipantId>,
        /// The event
        event: StreamingEvent,
    },
    /// A participant with granted control drives our camera; the camera
    /// layer executes the command
    CameraCommand {
        /// Call identifier
        call_id: CallId,
        /// The controlling participant
        participant_id: ParticipantId,
        /// The command to execute
        mode: crate::protocol::CameraControlMode,
        /// Camera selector for a select command
        camera: i32,
        /// Zoom scale for a zoom command
        scale: i32,
    },
    /// The call was put on hold or resumed
    HoldChanged {
        /// Call identifier
        call_id: CallId,
        /// New status with hold flags
        status: CallStatus,
    },
    /// Two calls were merged into one
    CallsMerged {
        /// Surviving call
        call_id: CallId,
    },
    /// The call terminated
    CallTerminated {
        /// Call identifier
        call_id: CallId,
        /// Why the call ended
        reason: TerminateReason,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_call_status_progression() {
        let mut status = CallStatus::outgoing_call();
        assert!(status.is_outgoing());
        assert!(!status.is_accepted());
        assert!(!status.is_active());

        status.to_accepted();
        assert!(status.is_accepted());
        assert!(!status.is_active());

        status.to_active();
        assert!(status.is_active());
        assert!(!status.is_terminated());

        status.to_terminated();
        assert!(status.is_terminated());
    }

    #[test]
    fn test_call_status_terminated_is_absorbing() {
        let mut status = CallStatus::incoming_call();
        status.to_terminated();

        status.to_accepted();
        status.to_active();
        status.to_video();
        status.set_on_hold(true);
        status.set_peer_on_hold(true);

        assert!(status.is_terminated());
        assert!(!status.is_accepted());
        assert!(!status.is_active());
        assert!(!status.is_video());
        assert!(!status.is_on_hold());
    }

    #[test]
    fn test_call_status_hold_requires_active() {
        let mut status = CallStatus::incoming_call();
        status.set_on_hold(true);
        assert!(!status.is_on_hold());

        status.to_accepted();
        status.to_active();
        status.set_on_hold(true);
        assert!(status.is_on_hold());
        assert!(status.is_paused());
        assert!(!status.is_peer_on_hold());

        // The two hold flags are orthogonal
        status.set_peer_on_hold(true);
        assert!(status.is_paused());
        assert!(status.is_peer_on_hold());

        status.set_on_hold(false);
        assert!(!status.is_paused());
        assert!(status.is_peer_on_hold());
        assert!(status.is_on_hold());
    }

    #[test]
    fn test_support_default_unknown() {
        let support = Support::default();
        assert_eq!(support, Support::Unknown);
        assert!(!support.is_supported());
        assert!(Support::Yes.is_supported());
        assert!(!Support::No.is_supported());
    }

    #[test]
    fn test_streaming_status_supported() {
        assert!(!StreamingStatus::Unknown.is_supported());
        assert!(!StreamingStatus::NotAvailable.is_supported());
        assert!(StreamingStatus::Ready.is_supported());
        assert!(StreamingStatus::Playing.is_supported());
        assert!(StreamingStatus::Error.is_supported());
    }
}
