//! Call orchestration service
//!
//! [`CallService`] is the single entry point of the engine. The application
//! drives it with user intents (initiate, accept, hold, transfer, stream)
//! and the integration layer feeds it transport callbacks (link state, data
//! channel messages, media tracks). The service serializes all call mutations
//! behind one async lock and publishes [`CallEvent`]s on a broadcast channel
//! for the presentation layer.

use crate::call::{CallError, CallState, LocalIdentity};
use crate::connection::{CallConnection, EngineEvent};
use crate::keycheck::{KeyCheckVerdict, WordChallenge};
use crate::operations::Operation;
use crate::participant::CallParticipant;
use crate::protocol::{CallIq, CameraControlMode, StreamingControlMode};
use crate::streaming::{MediaSource, StreamInfo, StreamPlayer};
use crate::transport::{CallRoomService, LinkError, PeerLinkTransport};
use crate::types::{
    CallEvent, CallId, CallRoomId, CallStatus, ConnectionId, ConnectionUpdate, ErrorCode,
    Geolocation, LinkState, MemberId, ParticipantEvent, StreamingEvent, TerminateReason,
    TrackKind, TransferDirection,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

/// Errors reported by the service API
#[derive(Error, Debug)]
pub enum ServiceError {
    /// There is no call in progress
    #[error("No current call")]
    NoCurrentCall,

    /// The call does not exist
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// The connection does not belong to any known call
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// A call is already in progress
    #[error("Busy with another call")]
    Busy,

    /// The builder is missing a collaborator
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// Call layer failure
    #[error(transparent)]
    Call(#[from] CallError),

    /// Link layer failure
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Tunables of the call engine
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an incoming call rings before it is treated as not answered
    pub incoming_call_timeout: Duration,
    /// How long an outgoing call rings; longer than the incoming timeout so
    /// the caller side always expires last
    pub outgoing_call_timeout: Duration,
    /// How long an accepted call may take to establish media
    pub connect_timeout: Duration,
    /// Attempts allowed per setup operation before the connection fails
    pub operation_retry_ceiling: u8,
    /// Maximum members of a call room
    pub max_room_members: u32,
    /// Locale for the key check word list
    pub locale: String,
    /// Identity advertised to group call members
    pub identity: LocalIdentity,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            incoming_call_timeout: Duration::from_secs(30),
            outgoing_call_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(20),
            operation_retry_ceiling: 3,
            max_room_members: 8,
            locale: "en".to_string(),
            identity: LocalIdentity::default(),
        }
    }
}

/// Builder for [`CallService`]
#[derive(Default)]
pub struct CallServiceBuilder {
    config: Option<CallConfig>,
    transport: Option<Arc<dyn PeerLinkTransport>>,
    rooms: Option<Arc<dyn CallRoomService>>,
}

impl CallServiceBuilder {
    /// Start a builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration instead of the defaults
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The transport establishing the P2P links
    pub fn with_transport(mut self, transport: Arc<dyn PeerLinkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The server-side call room service
    pub fn with_rooms(mut self, rooms: Arc<dyn CallRoomService>) -> Self {
        self.rooms = Some(rooms);
        self
    }

    /// Build the service
    pub fn build(self) -> Result<Arc<CallService>, ServiceError> {
        let transport = self
            .transport
            .ok_or(ServiceError::MissingCollaborator("transport"))?;
        let rooms = self
            .rooms
            .ok_or(ServiceError::MissingCollaborator("rooms"))?;
        Ok(CallService::new(
            self.config.unwrap_or_default(),
            transport,
            rooms,
        ))
    }
}

/// The call slots of the engine: at most one active and one held call
#[derive(Default)]
struct CallTable {
    current: Option<CallState>,
    held: Option<CallState>,
}

impl CallTable {
    fn call_mut(&mut self, call_id: CallId) -> Option<&mut CallState> {
        match (&mut self.current, &mut self.held) {
            (Some(c), _) if c.id() == call_id => self.current.as_mut(),
            (_, Some(h)) if h.id() == call_id => self.held.as_mut(),
            _ => None,
        }
    }

    fn call_of_connection(&mut self, connection_id: ConnectionId) -> Option<&mut CallState> {
        if let Some(c) = &self.current {
            if c.connection(connection_id).is_some() {
                return self.current.as_mut();
            }
        }
        if let Some(h) = &self.held {
            if h.connection(connection_id).is_some() {
                return self.held.as_mut();
            }
        }
        None
    }

    fn remove(&mut self, call_id: CallId) -> Option<CallState> {
        if self.current.as_ref().map(|c| c.id()) == Some(call_id) {
            return self.current.take();
        }
        if self.held.as_ref().map(|c| c.id()) == Some(call_id) {
            return self.held.take();
        }
        None
    }
}

/// Orchestrates audio/video calls over a peer link transport
pub struct CallService {
    config: CallConfig,
    transport: Arc<dyn PeerLinkTransport>,
    rooms: Arc<dyn CallRoomService>,
    calls: RwLock<CallTable>,
    events: broadcast::Sender<CallEvent>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CallService {
    fn new(
        config: CallConfig,
        transport: Arc<dyn PeerLinkTransport>,
        rooms: Arc<dyn CallRoomService>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            transport,
            rooms,
            calls: RwLock::new(CallTable::default()),
            events,
            engine_tx,
            engine_rx: parking_lot::Mutex::new(Some(engine_rx)),
        })
    }

    /// Subscribe to call events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Start the engine loop consuming internal timer events. Idempotent;
    /// later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let Some(mut engine_rx) = self.engine_rx.lock().take() else {
            return;
        };
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Call engine started");
            while let Some(event) = engine_rx.recv().await {
                match event {
                    EngineEvent::ConnectionTimeout {
                        connection_id,
                        status,
                    } => {
                        service.on_connection_timeout(connection_id, status).await;
                    }
                }
            }
            tracing::info!("Call engine stopped");
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    // === Outgoing and incoming calls ===

    /// Start an outgoing call to a peer
    pub async fn initiate_call(&self, peer_id: Uuid, video: bool) -> Result<CallId, ServiceError> {
        let mut table = self.calls.write().await;
        if table.current.is_some() {
            return Err(ServiceError::Busy);
        }

        let status = if video {
            CallStatus::outgoing_video_call()
        } else {
            CallStatus::outgoing_call()
        };
        let mut call = CallState::new(status, self.transport.clone(), self.engine_tx.clone());
        let connection = call.add_connection(peer_id, status, false, None);
        let call_id = call.id();
        table.current = Some(call);
        drop(table);

        tracing::info!(call_id = %call_id, peer_id = %peer_id, video, "Initiating call");
        self.emit(CallEvent::CallInitiated { call_id, status });
        connection.set_timer(status, self.config.outgoing_call_timeout);
        self.create_link(&connection, peer_id, video, true).await?;
        Ok(call_id)
    }

    /// An incoming call offer arrived from a peer. An active current call is
    /// put on hold (call waiting); with a call already held the offer is
    /// rejected with `Busy`.
    pub async fn on_incoming_call(
        &self,
        peer_id: Uuid,
        video: bool,
        bell: bool,
    ) -> Result<(CallId, ConnectionId), ServiceError> {
        let mut table = self.calls.write().await;
        let mut held_event = None;
        if table.current.is_some() {
            let can_wait = table.held.is_none()
                && table
                    .current
                    .as_ref()
                    .map(|c| c.status().is_active())
                    .unwrap_or(false);
            if !can_wait {
                drop(table);
                self.refuse_offer(peer_id).await;
                return Err(ServiceError::Busy);
            }
            if let Some(current) = table.current.as_mut() {
                current.hold().await?;
                held_event = Some(CallEvent::HoldChanged {
                    call_id: current.id(),
                    status: current.status(),
                });
            }
            table.held = table.current.take();
        }

        let status = match (video, bell) {
            (_, true) => CallStatus::incoming_video_bell(),
            (true, _) => CallStatus::incoming_video_call(),
            (false, false) => CallStatus::incoming_call(),
        };
        let mut call = CallState::new(status, self.transport.clone(), self.engine_tx.clone());
        let connection = call.add_connection(peer_id, status, false, None);
        let call_id = call.id();
        let connection_id = connection.id();
        table.current = Some(call);
        drop(table);

        if let Some(event) = held_event {
            self.emit(event);
        }
        tracing::info!(call_id = %call_id, peer_id = %peer_id, "Incoming call");
        self.emit(CallEvent::IncomingCall {
            call_id,
            connection_id,
            status,
        });
        connection.set_timer(status, self.config.incoming_call_timeout);
        self.create_link(&connection, peer_id, video, false).await?;
        Ok((call_id, connection_id))
    }

    /// Answer an offer we cannot take: bind the offered link and tear it
    /// down right away so the caller hears busy instead of ringing until
    /// its timeout
    async fn refuse_offer(&self, peer_id: Uuid) {
        let refused = ConnectionId::new();
        tracing::info!(peer_id = %peer_id, connection_id = %refused, "Refusing offer while busy");
        if let Err(e) = self.transport.create_incoming_link(refused).await {
            tracing::debug!(connection_id = %refused, error = %e, "Refused offer link setup failed");
            return;
        }
        if let Err(e) = self
            .transport
            .terminate_link(refused, TerminateReason::Busy)
            .await
        {
            tracing::debug!(connection_id = %refused, error = %e, "Busy answer failed");
        }
    }

    async fn create_link(
        &self,
        connection: &Arc<CallConnection>,
        peer_id: Uuid,
        video: bool,
        outgoing: bool,
    ) -> Result<(), ServiceError> {
        let op = if outgoing {
            Operation::CreateOutgoingPeerConnection
        } else {
            Operation::CreateIncomingPeerConnection
        };
        while connection.check_operation(op) {
            let result = if outgoing {
                self.transport
                    .create_outgoing_link(connection.id(), peer_id, video)
                    .await
            } else {
                self.transport.create_incoming_link(connection.id()).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(connection_id = %connection.id(), error = %e, "Link creation failed");
                    if !connection.retry_operation(op, self.config.operation_retry_ceiling) {
                        self.fail_connection(connection.id()).await;
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Accept the incoming call
    pub async fn accept_call(&self, call_id: CallId) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table
            .call_mut(call_id)
            .ok_or(ServiceError::CallNotFound(call_id))?;
        let connection = call
            .main_connection()
            .ok_or(ServiceError::CallNotFound(call_id))?;

        call.status_mut().to_accepted();
        connection.accept();
        let status = call.status();
        connection.set_timer(status, self.config.connect_timeout);

        // Joining the room we were invited into waits for the accept
        if let Some(room_id) = call.take_pending_room() {
            call.join_room(&self.rooms, room_id, &connection).await?;
        }
        drop(table);

        self.emit(CallEvent::StatusChanged { call_id, status });
        if connection.is_done_operation_ready_for(
            Operation::CreatedPeerConnection,
            Operation::InitAudioConnection,
        ) {
            self.init_audio(&connection).await?;
        }
        Ok(())
    }

    /// Decline the incoming call
    pub async fn decline_call(&self, call_id: CallId) -> Result<(), ServiceError> {
        self.terminate_call(call_id, TerminateReason::Decline).await
    }

    /// Terminate a call with the given reason
    pub async fn terminate_call(
        &self,
        call_id: CallId,
        reason: TerminateReason,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let mut call = table
            .remove(call_id)
            .ok_or(ServiceError::CallNotFound(call_id))?;
        call.terminate(reason, &self.rooms).await;
        drop(table);
        self.emit(CallEvent::CallTerminated { call_id, reason });
        Ok(())
    }

    /// The peer accepted our outgoing call
    pub async fn on_session_accept(&self, connection_id: ConnectionId) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table
            .call_of_connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        let connection = call
            .connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;

        call.status_mut().to_accepted();
        connection.accept();
        let call_id = call.id();
        let status = call.status();
        connection.set_timer(status, self.config.connect_timeout);
        drop(table);

        self.emit(CallEvent::StatusChanged { call_id, status });
        if connection.is_done_operation_ready_for(
            Operation::CreatedPeerConnection,
            Operation::InitAudioConnection,
        ) {
            self.init_audio(&connection).await?;
        }
        Ok(())
    }

    /// The peer terminated its side of the call
    pub async fn on_session_terminate(
        &self,
        connection_id: ConnectionId,
        reason: TerminateReason,
    ) -> Result<(), ServiceError> {
        self.drop_connection(connection_id, reason).await
    }

    // === Transport callbacks ===

    /// The transport created the link object; chained setup steps can run
    pub async fn on_link_created(&self, connection_id: ConnectionId) -> Result<(), ServiceError> {
        let connection = self.find_connection(connection_id).await?;
        connection.check_operation(Operation::CreatedPeerConnection);
        if connection.complete_operation(
            Operation::CreatedPeerConnection,
            Operation::InitAudioConnection,
        ) {
            self.init_audio(&connection).await?;
        }
        Ok(())
    }

    async fn init_audio(&self, connection: &Arc<CallConnection>) -> Result<(), ServiceError> {
        while connection.check_operation(Operation::InitAudioConnection) {
            match self.transport.init_audio(connection.id()).await {
                Ok(()) => {
                    connection.done_operation(Operation::InitAudioConnection);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(connection_id = %connection.id(), error = %e, "Audio init failed");
                    if !connection
                        .retry_operation(Operation::InitAudioConnection, self.config.operation_retry_ceiling)
                    {
                        self.fail_connection(connection.id()).await;
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// The protocol version of the peer behind a connection was learned;
    /// derives its optional capabilities
    pub async fn on_peer_version(
        &self,
        connection_id: ConnectionId,
        version: crate::transport::PeerVersion,
    ) -> Result<(), ServiceError> {
        let connection = self.find_connection(connection_id).await?;
        connection.set_peer_version(version);
        Ok(())
    }

    /// The transport-level link state changed
    pub async fn on_link_state(
        &self,
        connection_id: ConnectionId,
        state: LinkState,
    ) -> Result<(), ServiceError> {
        if state != LinkState::Connected {
            let connection = self.find_connection(connection_id).await?;
            connection.update_link_state(state);
            return Ok(());
        }

        let mut table = self.calls.write().await;
        let Some(call) = table.call_of_connection(connection_id) else {
            return Err(ServiceError::ConnectionNotFound(connection_id));
        };
        let call_id = call.id();
        let update = call.on_link_connected(connection_id);
        let connection = call
            .connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        connection.cancel_timer();

        match update {
            ConnectionUpdate::Ignore => {}
            ConnectionUpdate::FirstConnection => {
                let status = call.status();
                drop(table);
                self.emit(CallEvent::FirstConnection {
                    call_id,
                    connection_id,
                });
                self.emit(CallEvent::StatusChanged { call_id, status });
                self.participant_connected(&connection, call_id);
                return Ok(());
            }
            ConnectionUpdate::FirstGroup => {
                call.ensure_room(&self.rooms, self.config.max_room_members)
                    .await?;
                self.after_group_connect(table, call_id, &connection).await?;
                return Ok(());
            }
            ConnectionUpdate::NewConnection => {
                let replaced = if connection.is_transfer_connection() {
                    call.finish_peer_transfer(&connection).await?
                } else {
                    Vec::new()
                };
                self.after_group_connect(table, call_id, &connection).await?;
                if !replaced.is_empty() {
                    self.emit(CallEvent::ParticipantsRemoved {
                        call_id,
                        participant_ids: replaced,
                    });
                }
                return Ok(());
            }
        }
        Ok(())
    }

    async fn after_group_connect(
        &self,
        mut table: tokio::sync::RwLockWriteGuard<'_, CallTable>,
        call_id: CallId,
        connection: &Arc<CallConnection>,
    ) -> Result<(), ServiceError> {
        let Some(call) = table.call_mut(call_id) else {
            return Ok(());
        };
        if call.room_id().is_some() {
            call.invite_member(&self.rooms, connection).await?;
        }
        call.broadcast_identity(&self.config.identity, self.config.operation_retry_ceiling)
            .await?;
        let participant_id = connection.main_participant().map(|p| p.id());
        drop(table);

        if let Some(participant_id) = participant_id {
            self.emit(CallEvent::ParticipantAdded {
                call_id,
                participant_id,
            });
        }
        self.participant_connected(connection, call_id);
        Ok(())
    }

    fn participant_connected(&self, connection: &Arc<CallConnection>, call_id: CallId) {
        if let Some(participant) = connection.main_participant() {
            if let Some(event) = participant.set_connected() {
                self.emit(CallEvent::Participant {
                    call_id,
                    participant_id: participant.id(),
                    event,
                });
            }
        }
    }

    /// A media track of a connection appeared
    pub async fn on_track_added(
        &self,
        connection_id: ConnectionId,
        track_id: String,
        kind: TrackKind,
    ) -> Result<(), ServiceError> {
        let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
        if let Some(participant) = connection.main_participant() {
            if let Some(event) = participant.add_track(track_id, kind) {
                self.emit(CallEvent::Participant {
                    call_id,
                    participant_id: participant.id(),
                    event,
                });
            }
        }
        Ok(())
    }

    /// A media track of a connection disappeared
    pub async fn on_track_removed(
        &self,
        connection_id: ConnectionId,
        track_id: &str,
    ) -> Result<(), ServiceError> {
        let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
        if let Some(participant) = connection.main_participant() {
            if let Some(event) = participant.remove_track(track_id) {
                self.emit(CallEvent::Participant {
                    call_id,
                    participant_id: participant.id(),
                    event,
                });
            }
        }
        Ok(())
    }

    /// The media layer detected that the peer muted or unmuted its microphone
    pub async fn on_peer_audio_mute(
        &self,
        connection_id: ConnectionId,
        muted: bool,
    ) -> Result<(), ServiceError> {
        let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
        if let Some(participant) = connection.main_participant() {
            if let Some(event) = participant.set_audio_muted(muted) {
                self.emit(CallEvent::Participant {
                    call_id,
                    participant_id: participant.id(),
                    event,
                });
            }
        }
        Ok(())
    }

    /// The media layer detected that the peer started or stopped sharing its
    /// screen
    pub async fn on_peer_screen_sharing(
        &self,
        connection_id: ConnectionId,
        sharing: bool,
    ) -> Result<(), ServiceError> {
        let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
        if let Some(participant) = connection.main_participant() {
            if let Some(event) = participant.set_screen_sharing(sharing) {
                self.emit(CallEvent::Participant {
                    call_id,
                    participant_id: participant.id(),
                    event,
                });
            }
        }
        Ok(())
    }

    /// The signaling layer learned that the peer device is ringing
    pub async fn on_device_ringing(&self, connection_id: ConnectionId) -> Result<(), ServiceError> {
        let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
        connection.set_device_ringing();
        if let Some(participant) = connection.main_participant() {
            self.emit(CallEvent::Participant {
                call_id,
                participant_id: participant.id(),
                event: ParticipantEvent::Ringing,
            });
        }
        Ok(())
    }

    /// Ask a participant for remote control of its camera. A no-op while a
    /// session with that participant is already in progress.
    pub async fn ask_camera_control(
        &self,
        participant_id: crate::types::ParticipantId,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let participant = call
            .participant(participant_id)
            .ok_or(ServiceError::NoCurrentCall)?;
        let connection = call
            .connection(participant.connection_id())
            .ok_or(ServiceError::ConnectionNotFound(participant.connection_id()))?;
        drop(table);

        if participant.camera_control_asked() {
            connection
                .send_camera_control(CameraControlMode::Check, 0, 0)
                .await?;
        }
        Ok(())
    }

    /// End the camera control session with a participant
    pub async fn release_camera_control(
        &self,
        participant_id: crate::types::ParticipantId,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let participant = call
            .participant(participant_id)
            .ok_or(ServiceError::NoCurrentCall)?;
        let connection = call
            .connection(participant.connection_id())
            .ok_or(ServiceError::ConnectionNotFound(participant.connection_id()))?;
        drop(table);

        connection
            .send_camera_control(CameraControlMode::Stop, 0, 0)
            .await?;
        Ok(())
    }

    /// Zoom the peer camera we control. Rejected locally unless the
    /// participant granted us control.
    pub async fn remote_camera_zoom(
        &self,
        participant_id: crate::types::ParticipantId,
        scale: i32,
    ) -> Result<(), ServiceError> {
        self.send_camera_command(participant_id, CameraControlMode::Zoom, 0, scale)
            .await
    }

    /// Switch the peer camera we control to another device camera
    pub async fn remote_camera_select(
        &self,
        participant_id: crate::types::ParticipantId,
        camera: i32,
    ) -> Result<(), ServiceError> {
        self.send_camera_command(participant_id, CameraControlMode::Select, camera, 0)
            .await
    }

    /// Turn the peer camera we control on or off
    pub async fn remote_camera_mute(
        &self,
        participant_id: crate::types::ParticipantId,
        muted: bool,
    ) -> Result<(), ServiceError> {
        let mode = if muted {
            CameraControlMode::Off
        } else {
            CameraControlMode::On
        };
        self.send_camera_command(participant_id, mode, 0, 0).await
    }

    async fn send_camera_command(
        &self,
        participant_id: crate::types::ParticipantId,
        mode: CameraControlMode,
        camera: i32,
        scale: i32,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let participant = call
            .participant(participant_id)
            .ok_or(ServiceError::NoCurrentCall)?;
        let connection = call
            .connection(participant.connection_id())
            .ok_or(ServiceError::ConnectionNotFound(participant.connection_id()))?;
        drop(table);

        if participant.camera_control_state() != crate::participant::CameraControlState::Granted {
            return Err(ServiceError::Call(CallError::InvalidState(
                "camera control not granted".into(),
            )));
        }
        connection.send_camera_control(mode, camera, scale).await?;
        Ok(())
    }

    /// Answer a participant's pending request to control our camera.
    /// Granting shares our camera inventory and zoom bounds so the
    /// controller can pick and zoom; denying answers with no-permission.
    pub async fn answer_camera_control(
        &self,
        participant_id: crate::types::ParticipantId,
        grant: bool,
        camera_bitmap: i64,
        active_camera: i32,
        min_scale: i32,
        max_scale: i32,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let participant = call
            .participant(participant_id)
            .ok_or(ServiceError::NoCurrentCall)?;
        let connection = call
            .connection(participant.connection_id())
            .ok_or(ServiceError::ConnectionNotFound(participant.connection_id()))?;
        drop(table);

        let Some(request_id) = participant.answer_peer_control(grant) else {
            return Ok(());
        };
        if grant {
            connection
                .send_camera_response(
                    request_id,
                    ErrorCode::Success,
                    camera_bitmap,
                    active_camera,
                    min_scale,
                    max_scale,
                )
                .await?;
        } else {
            connection
                .send_camera_response(request_id, ErrorCode::NoPermission, 0, 0, 0, 0)
                .await?;
        }
        Ok(())
    }

    /// The server invited us into a call room. Before the accept the room is
    /// only remembered; we must neither create a room nor join yet.
    pub async fn on_invite_call_room(
        &self,
        connection_id: ConnectionId,
        room_id: CallRoomId,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table
            .call_of_connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        let connection = call
            .connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        connection.set_invited();

        if call.status().is_accepted() || call.status().is_active() {
            call.join_room(&self.rooms, room_id, &connection).await?;
        } else {
            call.set_pending_room(room_id);
        }
        Ok(())
    }

    // === Group calls ===

    /// Add another party to the current call, turning it into a group call
    pub async fn add_party(&self, peer_id: Uuid, video: bool) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        if !call.status().is_active() {
            return Err(ServiceError::Call(CallError::InvalidState(
                "call not active".into(),
            )));
        }

        let status = if video {
            CallStatus::outgoing_video_call()
        } else {
            CallStatus::outgoing_call()
        };
        let connection = call.add_connection(peer_id, status, false, None);
        if call
            .ensure_room(&self.rooms, self.config.max_room_members)
            .await?
        {
            // Members already in the call join the fresh room
            for member in call.connected_connections() {
                call.invite_member(&self.rooms, &member).await?;
            }
            call.broadcast_identity(&self.config.identity, self.config.operation_retry_ceiling)
                .await?;
        }
        drop(table);

        connection.set_timer(status, self.config.outgoing_call_timeout);
        self.create_link(&connection, peer_id, video, true).await
    }

    // === Hold / resume ===

    /// Put the current call on hold
    pub async fn hold_call(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.hold().await?;
        let call_id = call.id();
        let status = call.status();
        drop(table);
        self.emit(CallEvent::HoldChanged { call_id, status });
        Ok(())
    }

    /// Resume the current call
    pub async fn resume_call(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.resume().await?;
        let call_id = call.id();
        let status = call.status();
        drop(table);
        self.emit(CallEvent::HoldChanged { call_id, status });
        Ok(())
    }

    /// Hold the current call and make the held call current
    pub async fn swap_calls(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let table = &mut *table;
        if table.held.is_none() || table.current.is_none() {
            return Err(ServiceError::NoCurrentCall);
        }
        if let Some(call) = table.current.as_mut() {
            call.hold().await?;
        }
        std::mem::swap(&mut table.current, &mut table.held);
        if let Some(call) = table.current.as_mut() {
            call.resume().await?;
        }
        Ok(())
    }

    /// Merge the held call into the current one, forming a group call
    pub async fn merge_calls(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let mut held = table.held.take().ok_or(ServiceError::NoCurrentCall)?;
        held.resume().await?;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.merge(held);
        call.ensure_room(&self.rooms, self.config.max_room_members)
            .await?;
        let call_id = call.id();
        drop(table);
        self.emit(CallEvent::CallsMerged { call_id });
        Ok(())
    }

    // === Device controls ===

    /// Mute or unmute the microphone for every connection of the current call
    pub async fn set_audio_muted(&self, muted: bool) -> Result<(), ServiceError> {
        let connections = self.current_connections().await?;
        let direction = if muted {
            crate::types::MediaDirection::RecvOnly
        } else {
            crate::types::MediaDirection::SendRecv
        };
        for connection in connections {
            connection.set_audio_direction(direction).await?;
        }
        Ok(())
    }

    /// Enable or disable the camera for every connection of the current call
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        if enabled {
            call.status_mut().to_video();
        }
        let call_id = call.id();
        let status = call.status();
        let connections = call.connected_connections();
        drop(table);

        let direction = if enabled {
            crate::types::MediaDirection::SendRecv
        } else {
            crate::types::MediaDirection::Inactive
        };
        for connection in connections {
            if enabled {
                connection.enable_video();
            }
            connection.set_video_direction(direction).await?;
        }
        self.emit(CallEvent::StatusChanged { call_id, status });
        Ok(())
    }

    /// Relay a conversation message descriptor to every member of the
    /// current call whose device supports in-call messages
    pub async fn send_descriptor(&self, descriptor_id: Uuid) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.send_descriptor(descriptor_id).await?;
        Ok(())
    }

    /// Share or update our geolocation with the members of the current call
    pub async fn send_geolocation(&self, position: Geolocation) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.send_geolocation(position).await?;
        Ok(())
    }

    /// Stop sharing our geolocation with the current call
    pub async fn stop_geolocation(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.stop_geolocation().await?;
        Ok(())
    }

    // === Transfer ===

    /// Transfer the current call to another of our devices
    pub async fn transfer_call(
        &self,
        direction: TransferDirection,
        target_member: MemberId,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let old = call
            .main_connection()
            .ok_or(ServiceError::NoCurrentCall)?;
        call.begin_transfer(direction, target_member, old.id())
            .await?;
        // With no other member to wait for, the transfer proceeds at once
        if call.transfer_ready() {
            call.announce_transfer().await?;
        }
        Ok(())
    }

    /// The member taking over a transferred call is connecting to us. The
    /// connection joins the existing call; the device it replaces is dropped
    /// once the link is established.
    pub async fn on_incoming_transfer(
        &self,
        peer_id: Uuid,
        member_id: MemberId,
    ) -> Result<ConnectionId, ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let status = call.status();
        let connection = call.add_connection(peer_id, status, true, Some(member_id));
        drop(table);

        connection.set_timer(status, self.config.connect_timeout);
        self.create_link(&connection, peer_id, false, false).await?;
        Ok(connection.id())
    }

    /// Abort a transfer that did not complete
    pub async fn cancel_transfer(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.cancel_transfer();
        Ok(())
    }

    // === Key check ===

    /// Start a key check with the main peer of the current call
    pub async fn start_key_check(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let connection = call
            .main_connection()
            .ok_or(ServiceError::NoCurrentCall)?;
        let fingerprint = self.transport.key_fingerprint(connection.id()).await?;
        call.start_key_check(connection.id(), &self.config.locale, &fingerprint)
            .await?;
        Ok(())
    }

    /// The word the user must verify next
    pub async fn key_check_challenge(&self) -> Option<WordChallenge> {
        let mut table = self.calls.write().await;
        table.current.as_mut().and_then(|c| c.key_check_challenge())
    }

    /// The user confirmed or rejected the current key check word
    pub async fn confirm_key_check_word(&self, matched: bool) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        call.confirm_key_check_word(matched).await?;
        Ok(())
    }

    /// Send our identity URI to the main peer, the side channel used while
    /// a key check is in progress
    pub async fn send_twincode_uri(&self, uri: String) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let connection = call
            .main_connection()
            .ok_or(ServiceError::NoCurrentCall)?;
        drop(table);
        connection.send_twincode_uri(uri).await?;
        Ok(())
    }

    /// Combined verdict of the key check
    pub async fn key_check_verdict(&self) -> KeyCheckVerdict {
        let mut table = self.calls.write().await;
        table
            .current
            .as_mut()
            .map(|c| c.key_check_verdict())
            .unwrap_or_default()
    }

    // === Streaming ===

    /// Start streaming a media item to every capable peer of the current call
    pub async fn start_streaming(
        &self,
        ident: i64,
        source: Arc<dyn MediaSource>,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let call_id = call.id();
        call.start_streaming(ident, source).await?;
        drop(table);
        self.emit(CallEvent::Streaming {
            call_id,
            participant_id: None,
            event: StreamingEvent::Start,
        });
        Ok(())
    }

    /// Stop the stream we are sending
    pub async fn stop_streaming(&self) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let call_id = call.id();
        call.stop_streaming().await?;
        drop(table);
        self.emit(CallEvent::Streaming {
            call_id,
            participant_id: None,
            event: StreamingEvent::Stop,
        });
        Ok(())
    }

    /// Report the playback state of the local player monitoring the stream
    /// we send. An unrecoverable state there ends the session for everyone.
    pub async fn update_local_player(
        &self,
        mode: StreamingControlMode,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table.current.as_mut().ok_or(ServiceError::NoCurrentCall)?;
        let Some(streamer) = call.streamer() else {
            return Ok(());
        };
        let call_id = call.id();
        let connections = call.connected_connections();
        let stopped = streamer
            .update_local_player(&connections, mode)
            .await
            .map_err(CallError::from)?;
        if stopped {
            call.clear_streamer();
            drop(table);
            self.emit(CallEvent::Streaming {
                call_id,
                participant_id: None,
                event: StreamingEvent::Stop,
            });
        }
        Ok(())
    }

    /// Metadata of the stream we receive, once the streamer announced it
    pub async fn streaming_info(&self) -> Option<StreamInfo> {
        let table = self.calls.read().await;
        let call = table.current.as_ref()?;
        call.connections()
            .iter()
            .find_map(|c| c.stream_player().and_then(|p| p.info()))
    }

    // === Inbound IQ dispatch ===

    /// Feed a message received over a connection's data channel
    pub async fn on_incoming_iq(
        &self,
        connection_id: ConnectionId,
        iq: CallIq,
    ) -> Result<(), ServiceError> {
        tracing::debug!(connection_id = %connection_id, schema = iq.schema(), "Incoming IQ");
        match iq {
            CallIq::HoldCall { .. } => self.on_peer_hold(connection_id, true).await,
            CallIq::ResumeCall { .. } => self.on_peer_hold(connection_id, false).await,

            CallIq::PrepareTransfer { request_id } => {
                let connection = self.find_connection(connection_id).await?;
                connection.send_on_prepare_transfer(request_id).await?;
                Ok(())
            }
            CallIq::OnPrepareTransfer { request_id } => {
                let mut table = self.calls.write().await;
                let Some(call) = table.call_of_connection(connection_id) else {
                    return Ok(());
                };
                if call.on_prepare_transfer_ack(request_id) {
                    call.announce_transfer().await?;
                }
                Ok(())
            }
            CallIq::ParticipantTransfer { member_id, .. } => {
                let connection = self.find_connection(connection_id).await?;
                connection.set_transfer_to_member_id(Some(member_id));
                Ok(())
            }
            CallIq::TransferDone { .. } => {
                // We are the old device: the new one took over
                let (_, call_id) = self.find_connection_and_call(connection_id).await?;
                self.terminate_call(call_id, TerminateReason::Transferred)
                    .await
            }

            CallIq::KeyCheckInitiate { request_id, locale } => {
                let fingerprint = self.transport.key_fingerprint(connection_id).await?;
                let mut table = self.calls.write().await;
                let Some(call) = table.call_of_connection(connection_id) else {
                    return Ok(());
                };
                let call_id = call.id();
                let participant_id =
                    main_participant_id(call, connection_id);
                call.on_key_check_initiate(connection_id, request_id, &locale, &fingerprint)
                    .await?;
                drop(table);
                if let Some(participant_id) = participant_id {
                    self.emit(CallEvent::Participant {
                        call_id,
                        participant_id,
                        event: ParticipantEvent::KeyCheckInitiate,
                    });
                }
                Ok(())
            }
            CallIq::OnKeyCheckInitiate {
                request_id,
                error_code,
            } => {
                let mut table = self.calls.write().await;
                let Some(call) = table.call_of_connection(connection_id) else {
                    return Ok(());
                };
                if !call.on_key_check_initiate_answer(request_id) {
                    tracing::debug!(
                        connection_id = %connection_id,
                        request_id,
                        "Unmatched key check answer dropped"
                    );
                    return Ok(());
                }
                let call_id = call.id();
                let participant_id = main_participant_id(call, connection_id);
                if error_code != ErrorCode::Success {
                    call.end_key_check();
                }
                drop(table);
                if let Some(participant_id) = participant_id {
                    self.emit(CallEvent::Participant {
                        call_id,
                        participant_id,
                        event: ParticipantEvent::OnKeyCheckInitiate,
                    });
                }
                Ok(())
            }
            CallIq::WordCheck { result, .. } => {
                let mut table = self.calls.write().await;
                let Some(call) = table.call_of_connection(connection_id) else {
                    return Ok(());
                };
                let call_id = call.id();
                let participant_id = main_participant_id(call, connection_id);
                let ok = result.ok;
                call.on_word_check(connection_id, result).await?;
                drop(table);
                if let Some(participant_id) = participant_id {
                    self.emit(CallEvent::Participant {
                        call_id,
                        participant_id,
                        event: if ok {
                            ParticipantEvent::CurrentWordChanged
                        } else {
                            ParticipantEvent::WordCheckResultKo
                        },
                    });
                }
                Ok(())
            }
            CallIq::TerminateKeyCheck { result, .. } => {
                let mut table = self.calls.write().await;
                let Some(call) = table.call_of_connection(connection_id) else {
                    return Ok(());
                };
                let call_id = call.id();
                let participant_id = main_participant_id(call, connection_id);
                call.on_terminate_key_check(connection_id, result);
                drop(table);
                if let Some(participant_id) = participant_id {
                    self.emit(CallEvent::Participant {
                        call_id,
                        participant_id,
                        event: ParticipantEvent::TerminateKeyCheck,
                    });
                }
                Ok(())
            }
            CallIq::TwincodeUri { uri, .. } => {
                tracing::debug!(connection_id = %connection_id, uri, "Twincode URI received");
                Ok(())
            }

            CallIq::ParticipantInfo {
                member_id,
                name,
                description,
                thumbnail,
                ..
            } => {
                let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
                connection.set_member_id(member_id.clone());
                if let Some(participant) = connection.main_participant() {
                    participant.set_member_id(member_id);
                    if let Some(event) = participant.set_identity(name, description, thumbnail) {
                        self.emit(CallEvent::Participant {
                            call_id,
                            participant_id: participant.id(),
                            event,
                        });
                    }
                }
                Ok(())
            }

            CallIq::CameraControl {
                request_id,
                mode,
                camera,
                scale,
            } => {
                let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
                let Some(participant) = connection.main_participant() else {
                    connection
                        .send_camera_response(request_id, ErrorCode::NotSupported, 0, 0, 0, 0)
                        .await?;
                    return Ok(());
                };
                match mode {
                    CameraControlMode::Check => {
                        // The answer waits for the user's decision
                        if participant.peer_asked_control(request_id) {
                            self.emit(CallEvent::Participant {
                                call_id,
                                participant_id: participant.id(),
                                event: ParticipantEvent::AskCameraControl,
                            });
                        }
                        Ok(())
                    }
                    CameraControlMode::Stop => {
                        participant.peer_control_stopped();
                        connection
                            .send_camera_response(request_id, ErrorCode::Success, 0, 0, 0, 0)
                            .await?;
                        self.emit(CallEvent::Participant {
                            call_id,
                            participant_id: participant.id(),
                            event: ParticipantEvent::CameraControlDone,
                        });
                        Ok(())
                    }
                    _ => {
                        // Concrete commands only act inside a granted session
                        if !participant.is_peer_controlled() {
                            connection
                                .send_camera_response(
                                    request_id,
                                    ErrorCode::NoPermission,
                                    0,
                                    0,
                                    0,
                                    0,
                                )
                                .await?;
                            return Ok(());
                        }
                        connection
                            .send_camera_response(request_id, ErrorCode::Success, 0, camera, 0, 0)
                            .await?;
                        self.emit(CallEvent::CameraCommand {
                            call_id,
                            participant_id: participant.id(),
                            mode,
                            camera,
                            scale,
                        });
                        Ok(())
                    }
                }
            }
            CallIq::CameraResponse {
                error_code,
                camera_bitmap,
                active_camera,
                min_scale,
                max_scale,
                ..
            } => {
                let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
                if let Some(participant) = connection.main_participant() {
                    let mode = if participant.camera_control_state()
                        == crate::participant::CameraControlState::Asked
                    {
                        CameraControlMode::Check
                    } else {
                        CameraControlMode::Select
                    };
                    if let Some(event) = participant.on_camera_response(
                        mode,
                        error_code,
                        camera_bitmap,
                        active_camera,
                        min_scale,
                        max_scale,
                    ) {
                        self.emit(CallEvent::Participant {
                            call_id,
                            participant_id: participant.id(),
                            event,
                        });
                    }
                }
                Ok(())
            }

            CallIq::StreamingControl {
                ident,
                mode,
                length,
                position,
                ..
            } => {
                self.on_streaming_control(connection_id, ident, mode, length, position)
                    .await
            }
            CallIq::StreamingData {
                request_id,
                offset,
                data,
                start,
                length,
                ..
            } => {
                let (connection, call_id) = self.find_connection_and_call(connection_id).await?;
                let Some(player) = connection.stream_player() else {
                    return Ok(());
                };
                let event = player
                    .on_streaming_data(request_id, offset, data.as_ref(), start, length)
                    .await
                    .map_err(CallError::from)?;
                if let Some(event) = event {
                    let participant_id = connection.main_participant().map(|p| p.id());
                    self.emit(CallEvent::Streaming {
                        call_id,
                        participant_id,
                        event,
                    });
                }
                Ok(())
            }
            CallIq::StreamingInfo {
                ident,
                title,
                album,
                artist,
                artwork,
                duration,
                ..
            } => {
                let (connection, _) = self.find_connection_and_call(connection_id).await?;
                let Some(player) = connection.stream_player() else {
                    return Ok(());
                };
                if player.ident() != ident {
                    return Ok(());
                }
                tracing::debug!(connection_id = %connection_id, ident, title, "Stream metadata");
                player.set_info(StreamInfo {
                    title,
                    album,
                    artist,
                    artwork,
                    duration,
                    length: player.length(),
                    video: player.is_video(),
                });
                Ok(())
            }
            CallIq::StreamingRequest {
                request_id,
                ident,
                offset,
                length,
                player_position,
                ..
            } => {
                let mut table = self.calls.write().await;
                let Some(call) = table.call_of_connection(connection_id) else {
                    return Ok(());
                };
                let Some(streamer) = call.streamer() else {
                    return Ok(());
                };
                let Some(connection) = call.connection(connection_id) else {
                    return Ok(());
                };
                streamer
                    .on_streaming_request(
                        &connection,
                        request_id,
                        ident,
                        offset,
                        length,
                        player_position,
                    )
                    .await
                    .map_err(CallError::from)?;
                Ok(())
            }
        }
    }

    async fn on_peer_hold(
        &self,
        connection_id: ConnectionId,
        hold: bool,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let Some(call) = table.call_of_connection(connection_id) else {
            return Ok(());
        };
        call.on_peer_hold(connection_id, hold)?;
        let call_id = call.id();
        let status = call.status();
        let participant_id = main_participant_id(call, connection_id);
        drop(table);

        self.emit(CallEvent::HoldChanged { call_id, status });
        if let Some(participant_id) = participant_id {
            self.emit(CallEvent::Participant {
                call_id,
                participant_id,
                event: if hold {
                    ParticipantEvent::Hold
                } else {
                    ParticipantEvent::Resume
                },
            });
        }
        Ok(())
    }

    async fn on_streaming_control(
        &self,
        connection_id: ConnectionId,
        ident: i64,
        mode: StreamingControlMode,
        length: i64,
        position: i64,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let Some(call) = table.call_of_connection(connection_id) else {
            return Ok(());
        };
        let call_id = call.id();
        let participant_id = main_participant_id(call, connection_id);
        let connection = call
            .connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;

        match mode {
            StreamingControlMode::StartAudio | StreamingControlMode::StartVideo => {
                let player = StreamPlayer::new(
                    ident,
                    mode == StreamingControlMode::StartVideo,
                    length,
                    connection_id,
                    self.transport.clone(),
                    call.request_ids(),
                );
                connection.set_stream_player(Some(player.clone()));
                drop(table);
                self.emit(CallEvent::Streaming {
                    call_id,
                    participant_id,
                    event: StreamingEvent::Start,
                });
                player.request_next_chunk().await.map_err(CallError::from)?;
                Ok(())
            }
            m if m.is_ask() => {
                let Some(streamer) = call.streamer() else {
                    return Ok(());
                };
                let connections = call.connected_connections();
                drop(table);
                streamer
                    .on_ask(&connections, m, position)
                    .await
                    .map_err(CallError::from)?;
                Ok(())
            }
            m if m.is_status() => {
                let Some(streamer) = call.streamer() else {
                    return Ok(());
                };
                let event = streamer.on_player_status(&connection, m);
                drop(table);
                if let Some(event) = event {
                    self.emit(CallEvent::Streaming {
                        call_id,
                        participant_id,
                        event,
                    });
                }
                Ok(())
            }
            m => {
                let Some(player) = connection.stream_player() else {
                    return Ok(());
                };
                drop(table);
                let event = player
                    .on_control(m, position)
                    .await
                    .map_err(CallError::from)?;
                if let Some(event) = event {
                    self.emit(CallEvent::Streaming {
                        call_id,
                        participant_id,
                        event,
                    });
                }
                Ok(())
            }
        }
    }

    // === Timeouts and failures ===

    async fn on_connection_timeout(&self, connection_id: ConnectionId, status: CallStatus) {
        let timed_out = {
            let mut table = self.calls.write().await;
            match table.call_of_connection(connection_id) {
                Some(call) => call
                    .connection(connection_id)
                    .map(|c| c.is_timed_out(&status))
                    .unwrap_or(false),
                None => false,
            }
        };
        if !timed_out {
            return;
        }

        let reason = if status.is_accepted() {
            TerminateReason::ConnectivityError
        } else {
            TerminateReason::NotAnswered
        };
        tracing::info!(connection_id = %connection_id, reason = ?reason, "Connection timed out");
        if let Err(e) = self.drop_connection(connection_id, reason).await {
            tracing::debug!(connection_id = %connection_id, error = %e, "Timeout teardown failed");
        }
    }

    async fn fail_connection(&self, connection_id: ConnectionId) {
        if let Err(e) = self
            .drop_connection(connection_id, TerminateReason::SetupError)
            .await
        {
            tracing::debug!(connection_id = %connection_id, error = %e, "Failure teardown failed");
        }
    }

    /// Terminate one connection; when it was the last the whole call ends
    async fn drop_connection(
        &self,
        connection_id: ConnectionId,
        reason: TerminateReason,
    ) -> Result<(), ServiceError> {
        let mut table = self.calls.write().await;
        let Some(call) = table.call_of_connection(connection_id) else {
            return Err(ServiceError::ConnectionNotFound(connection_id));
        };
        let call_id = call.id();
        let participant_ids: Vec<_> = call
            .connection(connection_id)
            .map(|c| {
                let mut list = Vec::new();
                c.append_participants(&mut list);
                list.iter().map(|p| p.id()).collect()
            })
            .unwrap_or_default();

        if let Some(connection) = call.connection(connection_id) {
            connection.terminate(reason).await;
        }
        let empty = call.remove_connection(connection_id).await;

        if empty {
            if let Some(mut call) = table.remove(call_id) {
                call.terminate(reason, &self.rooms).await;
            }
            drop(table);
            self.emit(CallEvent::CallTerminated { call_id, reason });
        } else {
            drop(table);
            self.emit(CallEvent::ParticipantsRemoved {
                call_id,
                participant_ids,
            });
        }
        Ok(())
    }

    // === Lookups ===

    async fn find_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Arc<CallConnection>, ServiceError> {
        self.find_connection_and_call(connection_id)
            .await
            .map(|(c, _)| c)
    }

    async fn find_connection_and_call(
        &self,
        connection_id: ConnectionId,
    ) -> Result<(Arc<CallConnection>, CallId), ServiceError> {
        let mut table = self.calls.write().await;
        let call = table
            .call_of_connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        let call_id = call.id();
        let connection = call
            .connection(connection_id)
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        Ok((connection, call_id))
    }

    async fn current_connections(&self) -> Result<Vec<Arc<CallConnection>>, ServiceError> {
        let table = self.calls.read().await;
        let call = table.current.as_ref().ok_or(ServiceError::NoCurrentCall)?;
        Ok(call.connected_connections())
    }

    /// Identifier of the current call, if any
    pub async fn current_call_id(&self) -> Option<CallId> {
        self.calls.read().await.current.as_ref().map(|c| c.id())
    }

    /// Status of the current call, if any
    pub async fn current_call_status(&self) -> Option<CallStatus> {
        self.calls.read().await.current.as_ref().map(|c| c.status())
    }

    /// Participants of the current call
    pub async fn participants(&self) -> Vec<Arc<CallParticipant>> {
        self.calls
            .read()
            .await
            .current
            .as_ref()
            .map(|c| c.participants())
            .unwrap_or_default()
    }
}

fn main_participant_id(call: &mut CallState, connection_id: ConnectionId) -> Option<i32> {
    call.connection(connection_id)
        .and_then(|c| c.main_participant())
        .map(|p| p.id())
}
