//! Per-link call connection state machine
//!
//! A call connection drives one P2P link from "about to connect" to
//! "connected" or "terminated". Setup is a set of independent, partially
//! ordered asynchronous operations (see [`crate::operations`]) rather than a
//! linear state enum: link creation, audio init, call-room join and avatar
//! fetch can all be in flight concurrently.
//!
//! A connection can carry one participant (device-to-device) or several
//! (when the peer is a media-mixing unit).

use crate::operations::{Operation, OperationSet};
use crate::participant::CallParticipant;
use crate::protocol::{CallIq, CameraControlMode, StreamingControlMode, WordCheckResult};
use crate::streaming::StreamPlayer;
use crate::transport::{LinkError, PeerLinkTransport, PeerVersion};
use crate::types::{
    CallId, CallStatus, ConnectionId, ErrorCode, Geolocation, LinkState, MediaDirection,
    MemberId, RequestIds, StreamingStatus, Support, TerminateReason,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Internal engine notifications produced outside the orchestration path
#[derive(Debug)]
pub(crate) enum EngineEvent {
    /// A connection status timer fired
    ConnectionTimeout {
        /// The connection whose timer fired
        connection_id: ConnectionId,
        /// The status the timer was armed for
        status: CallStatus,
    },
}

/// Progression rank used to decide whether a timer fired too late to matter
fn progress_rank(status: &CallStatus) -> u8 {
    if status.is_terminated() {
        3
    } else if status.is_active() {
        2
    } else if status.is_accepted() {
        1
    } else {
        0
    }
}

#[derive(Debug)]
struct ConnectionCore {
    status: CallStatus,
    link_state: LinkState,
    was_connected: bool,
    peer_version: Option<PeerVersion>,
    group_support: Support,
    message_support: Support,
    geolocation_support: Support,
    streaming_status: StreamingStatus,
    audio_direction: MediaDirection,
    video_direction: MediaDirection,
    invited: bool,
    member_id: Option<MemberId>,
    transfer_to_member_id: Option<MemberId>,
    device_ringing: bool,
    timer_status: Option<CallStatus>,
}

/// One P2P link of an audio/video call
pub struct CallConnection {
    id: ConnectionId,
    call_id: CallId,
    originator_id: uuid::Uuid,
    is_transfer: bool,
    transport: Arc<dyn PeerLinkTransport>,
    request_ids: RequestIds,
    ops: OperationSet,
    core: Mutex<ConnectionCore>,
    timer: Mutex<Option<JoinHandle<()>>>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    participants: Mutex<Vec<Arc<CallParticipant>>>,
    stream_player: Mutex<Option<Arc<StreamPlayer>>>,
}

impl CallConnection {
    /// Create the connection at the beginning of an incoming or outgoing
    /// P2P setup
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        call_id: CallId,
        originator_id: uuid::Uuid,
        mode: CallStatus,
        is_transfer: bool,
        member_id: Option<MemberId>,
        transport: Arc<dyn PeerLinkTransport>,
        request_ids: RequestIds,
        engine_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            call_id,
            originator_id,
            is_transfer,
            transport,
            request_ids,
            ops: OperationSet::new(),
            core: Mutex::new(ConnectionCore {
                status: mode,
                link_state: LinkState::Disconnected,
                was_connected: false,
                peer_version: None,
                group_support: Support::Unknown,
                message_support: Support::Unknown,
                geolocation_support: Support::Unknown,
                streaming_status: StreamingStatus::Unknown,
                audio_direction: MediaDirection::SendRecv,
                video_direction: MediaDirection::Inactive,
                invited: false,
                member_id,
                transfer_to_member_id: None,
                device_ringing: false,
                timer_status: None,
            }),
            timer: Mutex::new(None),
            engine_tx,
            participants: Mutex::new(Vec::new()),
            stream_player: Mutex::new(None),
        })
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The call this connection belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Identity of the remote party the link was created for
    pub fn originator_id(&self) -> uuid::Uuid {
        self.originator_id
    }

    /// Current connection status
    pub fn status(&self) -> CallStatus {
        self.core.lock().status
    }

    /// Current transport-level state
    pub fn link_state(&self) -> LinkState {
        self.core.lock().link_state
    }

    /// True if video is enabled on this link
    pub fn video_enabled(&self) -> bool {
        let core = self.core.lock();
        core.status.is_video() && core.video_direction != MediaDirection::Inactive
    }

    /// Call room member id of the peer, once known
    pub fn member_id(&self) -> Option<MemberId> {
        self.core.lock().member_id.clone()
    }

    /// Record the peer's call room member id
    pub fn set_member_id(&self, member_id: MemberId) {
        self.core.lock().member_id = Some(member_id);
    }

    /// True when we received an invite-call-room before the session accept.
    ///
    /// In that case we are joining an existing call room: we must not create
    /// a new room nor invite this peer, it is already a member.
    pub fn invited(&self) -> bool {
        self.core.lock().invited
    }

    /// Mark the connection as invited into an existing call room
    pub fn set_invited(&self) {
        self.core.lock().invited = true;
    }

    /// True when this connection was created to receive a transferred call
    pub fn is_transfer_connection(&self) -> bool {
        self.is_transfer
    }

    /// Member the call is being transferred to over this connection
    pub fn transfer_to_member_id(&self) -> Option<MemberId> {
        self.core.lock().transfer_to_member_id.clone()
    }

    /// Record the transfer target member
    pub fn set_transfer_to_member_id(&self, member_id: Option<MemberId>) {
        self.core.lock().transfer_to_member_id = member_id;
    }

    // === Operation admission ===

    /// Test-and-set admission of a setup operation. Returns true exactly
    /// when the caller must perform the operation.
    pub fn check_operation(&self, op: Operation) -> bool {
        self.ops.check(op)
    }

    /// True once the operation completed
    pub fn is_done_operation(&self, op: Operation) -> bool {
        self.ops.is_done(op)
    }

    /// Composite fan-in check: reports whether `op` finished and, when it has
    /// not, marks `ready_for` eligible to start from `op`'s completion path
    pub fn is_done_operation_ready_for(&self, op: Operation, ready_for: Operation) -> bool {
        self.ops.is_done_ready_for(op, ready_for)
    }

    /// Record completion of an operation and return the chained operation
    /// that became eligible while we were completing, if any
    pub fn complete_operation(&self, op: Operation, chained: Operation) -> bool {
        self.ops.mark_done(op);
        self.ops.take_ready(chained)
    }

    /// Record completion of an operation with no chained successor
    pub fn done_operation(&self, op: Operation) {
        self.ops.mark_done(op);
    }

    /// Report a failed operation. Returns true when it must be attempted
    /// again, false when the retry budget is exhausted and the connection
    /// must be treated as failed.
    pub fn retry_operation(&self, op: Operation, ceiling: u8) -> bool {
        let again = self.ops.retry(op, ceiling);
        if !again {
            tracing::warn!(
                connection_id = %self.id,
                operation = ?op,
                "Operation retry budget exhausted"
            );
        }
        again
    }

    // === Timer ===

    /// Move the connection to `status` and arm a single-shot timer that
    /// treats the connection as timed out when it fires before the state
    /// progressed past `status`. Re-arming cancels any prior timer.
    pub fn set_timer(&self, status: CallStatus, delay: Duration) {
        {
            let mut core = self.core.lock();
            core.status = status;
            core.timer_status = Some(status);
        }

        let mut timer = self.timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }

        let engine_tx = self.engine_tx.clone();
        let connection_id = self.id;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = engine_tx.send(EngineEvent::ConnectionTimeout {
                connection_id,
                status,
            });
        }));
    }

    /// Cancel the outstanding timer, if any
    pub fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        self.core.lock().timer_status = None;
    }

    /// Decide whether a fired timer still matters: true when the connection
    /// has not progressed past the status it was armed for
    pub(crate) fn is_timed_out(&self, armed: &CallStatus) -> bool {
        let core = self.core.lock();
        if core.status.is_terminated() {
            return false;
        }
        progress_rank(&core.status) <= progress_rank(armed)
    }

    // === Transport state ===

    /// Map the underlying transport state onto the connection. Returns true
    /// exactly on the first transition into `Connected`.
    pub fn update_link_state(&self, state: LinkState) -> bool {
        let mut core = self.core.lock();
        core.link_state = state;
        if state == LinkState::Connected && !core.was_connected {
            core.was_connected = true;
            core.status.to_active();
            core.timer_status = None;
            tracing::debug!(connection_id = %self.id, "Link connected for the first time");
            true
        } else {
            false
        }
    }

    /// Move the status to accepted, keeping the direction flags
    pub fn accept(&self) {
        self.core.lock().status.to_accepted();
    }

    /// Enable video on the connection status
    pub fn enable_video(&self) {
        self.core.lock().status.to_video();
    }

    /// Record that we put the call on hold
    pub fn set_on_hold(&self, hold: bool) {
        self.core.lock().status.set_on_hold(hold);
    }

    /// Record that the peer put the call on hold
    pub fn set_peer_on_hold(&self, hold: bool) {
        self.core.lock().status.set_peer_on_hold(hold);
    }

    /// Record that the peer device is ringing
    pub fn set_device_ringing(&self) {
        self.core.lock().device_ringing = true;
    }

    // === Peer capabilities ===

    /// Record the protocol version used by the peer and derive its
    /// capabilities from it
    pub fn set_peer_version(&self, version: PeerVersion) {
        let mut core = self.core.lock();
        core.peer_version = Some(version);
        core.group_support = if version >= PeerVersion::GROUP_CALLS {
            Support::Yes
        } else {
            Support::No
        };
        core.message_support = if version >= PeerVersion::MESSAGES {
            Support::Yes
        } else {
            Support::No
        };
        core.geolocation_support = if version >= PeerVersion::GEOLOCATION {
            Support::Yes
        } else {
            Support::No
        };
        if core.streaming_status == StreamingStatus::Unknown {
            core.streaming_status = if version >= PeerVersion::STREAMING {
                StreamingStatus::Ready
            } else {
                StreamingStatus::NotAvailable
            };
        }
    }

    /// Whether the peer supports mesh group calls
    pub fn is_group_supported(&self) -> Support {
        self.core.lock().group_support
    }

    /// Whether the peer supports in-call messages
    pub fn is_message_supported(&self) -> Support {
        self.core.lock().message_support
    }

    /// Whether the peer supports geolocation sharing
    pub fn is_geolocation_supported(&self) -> Support {
        self.core.lock().geolocation_support
    }

    /// The peer's streaming status
    pub fn streaming_status(&self) -> StreamingStatus {
        self.core.lock().streaming_status
    }

    /// Update the peer streaming status
    pub fn update_streaming_status(&self, status: StreamingStatus) {
        self.core.lock().streaming_status = status;
    }

    /// Negotiate the audio direction on the link
    pub async fn set_audio_direction(&self, direction: MediaDirection) -> Result<(), LinkError> {
        self.core.lock().audio_direction = direction;
        self.transport.set_audio_direction(self.id, direction).await
    }

    /// Negotiate the video direction on the link
    pub async fn set_video_direction(&self, direction: MediaDirection) -> Result<(), LinkError> {
        self.core.lock().video_direction = direction;
        self.transport.set_video_direction(self.id, direction).await
    }

    // === Participants ===

    /// Attach a participant riding on this connection
    pub fn add_participant(&self, participant: Arc<CallParticipant>) {
        self.participants.lock().push(participant);
    }

    /// The main participant of this connection
    pub fn main_participant(&self) -> Option<Arc<CallParticipant>> {
        self.participants.lock().first().cloned()
    }

    /// Append the participants riding on this connection to the list
    pub fn append_participants(&self, list: &mut Vec<Arc<CallParticipant>>) {
        list.extend(self.participants.lock().iter().cloned());
    }

    /// Number of participants on this connection
    pub fn participant_count(&self) -> usize {
        self.participants.lock().len()
    }

    // === Stream player ===

    /// The player receiving a stream from this peer, if any
    pub fn stream_player(&self) -> Option<Arc<StreamPlayer>> {
        self.stream_player.lock().clone()
    }

    /// Install the player receiving a stream from this peer
    pub fn set_stream_player(&self, player: Option<Arc<StreamPlayer>>) {
        *self.stream_player.lock() = player;
    }

    // === Termination ===

    /// Request teardown of the link
    pub async fn terminate(&self, reason: TerminateReason) {
        {
            let mut core = self.core.lock();
            if core.status.is_terminated() {
                return;
            }
            core.status.to_terminated();
        }
        self.cancel_timer();
        tracing::info!(connection_id = %self.id, reason = ?reason, "Terminating connection");
        if let Err(e) = self.transport.terminate_link(self.id, reason).await {
            tracing::debug!(connection_id = %self.id, error = %e, "Terminate link failed");
        }
    }

    /// Release the resources after termination: detach participants and
    /// stop any player still receiving from this peer
    pub async fn release(&self) {
        self.cancel_timer();
        let player = self.stream_player.lock().take();
        if let Some(player) = player {
            player.stop(false).await;
        }
        let participants = std::mem::take(&mut *self.participants.lock());
        for participant in participants {
            participant.release();
        }
    }

    // === Outbound IQs ===

    /// Send an IQ over the link's data channel
    pub async fn send_iq(&self, iq: CallIq) -> Result<(), LinkError> {
        self.transport.send_iq(self.id, iq).await
    }

    /// Allocate a request id for an outbound IQ
    pub fn allocate_request_id(&self) -> i64 {
        self.request_ids.next()
    }

    /// Notify the peer that we put the call on hold
    pub async fn send_hold_call(&self) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::HoldCall { request_id }).await
    }

    /// Notify the peer that we resumed the call
    pub async fn send_resume_call(&self) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::ResumeCall { request_id }).await
    }

    /// Ask the member to get ready for a call transfer
    pub async fn send_prepare_transfer(&self) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::PrepareTransfer { request_id }).await
    }

    /// Acknowledge a prepare-transfer request
    pub async fn send_on_prepare_transfer(&self, request_id: i64) -> Result<(), LinkError> {
        self.send_iq(CallIq::OnPrepareTransfer { request_id }).await
    }

    /// Announce the member the call is transferred to
    pub async fn send_participant_transfer(&self, member_id: MemberId) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::ParticipantTransfer {
            request_id,
            member_id,
        })
        .await
    }

    /// Tell the old device the transfer completed
    pub async fn send_transfer_done(&self) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::TransferDone { request_id }).await
    }

    /// Describe ourselves to a group call member
    pub async fn send_participant_info(
        &self,
        member_id: MemberId,
        name: String,
        description: Option<String>,
        thumbnail: Option<Vec<u8>>,
    ) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::ParticipantInfo {
            request_id,
            member_id,
            name,
            description,
            thumbnail,
        })
        .await
    }

    /// Start a key check with the peer. Returns the request id so the answer
    /// can be matched against it.
    pub async fn send_key_check_initiate(&self, locale: String) -> Result<i64, LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::KeyCheckInitiate { request_id, locale })
            .await?;
        Ok(request_id)
    }

    /// Answer a key check start request
    pub async fn send_on_key_check_initiate(
        &self,
        request_id: i64,
        error_code: ErrorCode,
    ) -> Result<(), LinkError> {
        self.send_iq(CallIq::OnKeyCheckInitiate {
            request_id,
            error_code,
        })
        .await
    }

    /// Send a local word check outcome to the peer
    pub async fn send_word_check(&self, result: WordCheckResult) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::WordCheck { request_id, result }).await
    }

    /// End the key check with our final verdict
    pub async fn send_terminate_key_check(&self, result: bool) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::TerminateKeyCheck { request_id, result })
            .await
    }

    /// Exchange the identity URI during the key check
    pub async fn send_twincode_uri(&self, uri: String) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::TwincodeUri { request_id, uri }).await
    }

    /// Relay a conversation descriptor to the peer
    pub async fn send_descriptor(&self, descriptor_id: uuid::Uuid) -> Result<(), LinkError> {
        self.transport.send_descriptor(self.id, descriptor_id).await
    }

    /// Push a geolocation update to the peer
    pub async fn send_geolocation(
        &self,
        position: Option<Geolocation>,
    ) -> Result<(), LinkError> {
        self.transport.send_geolocation(self.id, position).await
    }

    /// Send a camera control command to the peer
    pub async fn send_camera_control(
        &self,
        mode: CameraControlMode,
        camera: i32,
        scale: i32,
    ) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::CameraControl {
            request_id,
            mode,
            camera,
            scale,
        })
        .await
    }

    /// Answer a camera control command
    pub async fn send_camera_response(
        &self,
        request_id: i64,
        error_code: ErrorCode,
        camera_bitmap: i64,
        active_camera: i32,
        min_scale: i32,
        max_scale: i32,
    ) -> Result<(), LinkError> {
        self.send_iq(CallIq::CameraResponse {
            request_id,
            error_code,
            camera_bitmap,
            active_camera,
            min_scale,
            max_scale,
        })
        .await
    }

    /// Broadcast helper for the streaming layer
    pub async fn send_streaming_control(
        &self,
        ident: i64,
        mode: StreamingControlMode,
        length: i64,
        position: i64,
        latency: i32,
    ) -> Result<(), LinkError> {
        let request_id = self.request_ids.next();
        self.send_iq(CallIq::StreamingControl {
            request_id,
            ident,
            mode,
            length,
            timestamp: chrono::Utc::now().timestamp_millis(),
            position,
            latency,
        })
        .await
    }
}

impl std::fmt::Debug for CallConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallConnection")
            .field("id", &self.id)
            .field("call_id", &self.call_id)
            .field("status", &self.core.lock().status)
            .finish()
    }
}
