//! Per-call state aggregate
//!
//! A call owns its connections, its participants, the call room membership
//! for group calls and the in-call sub-protocols (key check, transfer,
//! streaming). The service serializes access to the call, so methods take
//! `&mut self` and never lock; the connections themselves are shared and can
//! be driven concurrently by media callbacks.

use crate::connection::{CallConnection, EngineEvent};
use crate::keycheck::{KeyCheckError, KeyCheckSession, KeyCheckStep, KeyCheckVerdict, WordChallenge};
use crate::operations::{Operation, OperationSet};
use crate::participant::CallParticipant;
use crate::protocol::WordCheckResult;
use crate::streaming::{MediaSource, StreamError, Streamer};
use crate::transport::{CallRoomService, LinkError, PeerLinkTransport};
use crate::types::{
    CallId, CallRoomId, CallStatus, ConnectionId, ConnectionUpdate, Geolocation, MemberId,
    ParticipantId, RequestIds, Support, TerminateReason, TransferDirection,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors of the call layer
#[derive(Error, Debug)]
pub enum CallError {
    /// The connection is not part of this call
    #[error("Connection not part of call: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The operation is not legal in the current call state
    #[error("Invalid call state: {0}")]
    InvalidState(String),

    /// The call has no room although the operation requires one
    #[error("Call has no call room")]
    NoRoom,

    /// Underlying link failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Key check failure
    #[error(transparent)]
    KeyCheck(#[from] KeyCheckError),

    /// Streaming failure
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Local identity advertised to group call members
#[derive(Debug, Clone, Default)]
pub struct LocalIdentity {
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Optional avatar thumbnail
    pub thumbnail: Option<Vec<u8>>,
}

struct CallRoom {
    id: CallRoomId,
    member_id: MemberId,
}

struct KeyCheckState {
    session: KeyCheckSession,
    connection_id: ConnectionId,
    /// Request id of our outstanding initiate; None once answered and on
    /// the responder side
    initiate_request_id: Option<i64>,
}

struct TransferState {
    direction: TransferDirection,
    target_member: MemberId,
    pending_acks: HashMap<i64, ConnectionId>,
    old_connection_id: ConnectionId,
}

/// State of one logical call, 1:1 or group
pub struct CallState {
    id: CallId,
    status: CallStatus,
    transport: Arc<dyn PeerLinkTransport>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    request_ids: RequestIds,
    ops: OperationSet,
    connections: Vec<Arc<CallConnection>>,
    room: Option<CallRoom>,
    pending_room: Option<CallRoomId>,
    is_group: bool,
    next_participant_id: ParticipantId,
    keycheck: Option<KeyCheckState>,
    streamer: Option<Arc<Streamer>>,
    transfer: Option<TransferState>,
    descriptors: Vec<uuid::Uuid>,
    geolocation: Option<Geolocation>,
}

impl CallState {
    /// Create an empty call
    pub(crate) fn new(
        status: CallStatus,
        transport: Arc<dyn PeerLinkTransport>,
        engine_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            id: CallId::new(),
            status,
            transport,
            engine_tx,
            request_ids: RequestIds::default(),
            ops: OperationSet::new(),
            connections: Vec::new(),
            room: None,
            pending_room: None,
            is_group: false,
            next_participant_id: 0,
            keycheck: None,
            streamer: None,
            transfer: None,
            descriptors: Vec::new(),
            geolocation: None,
        }
    }

    /// Call identifier
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Aggregated call status
    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Mutable access to the aggregated status
    pub fn status_mut(&mut self) -> &mut CallStatus {
        &mut self.status
    }

    /// Shared request id allocator of this call
    pub fn request_ids(&self) -> RequestIds {
        self.request_ids.clone()
    }

    /// True once a second party joined or the call runs over a call room
    pub fn is_group_call(&self) -> bool {
        self.is_group
    }

    /// The call room id, once created or joined
    pub fn room_id(&self) -> Option<CallRoomId> {
        self.room.as_ref().map(|r| r.id)
    }

    /// Our member id within the call room
    pub fn member_id(&self) -> Option<MemberId> {
        self.room.as_ref().map(|r| r.member_id.clone())
    }

    // === Connections ===

    /// All connections of the call
    pub fn connections(&self) -> Vec<Arc<CallConnection>> {
        self.connections.clone()
    }

    /// Connections whose link is established
    pub fn connected_connections(&self) -> Vec<Arc<CallConnection>> {
        self.connections
            .iter()
            .filter(|c| c.status().is_active())
            .cloned()
            .collect()
    }

    /// Look up a connection by id
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<CallConnection>> {
        self.connections.iter().find(|c| c.id() == id).cloned()
    }

    /// Look up a connection by the peer's member id
    pub fn connection_by_member(&self, member_id: &str) -> Option<Arc<CallConnection>> {
        self.connections
            .iter()
            .find(|c| c.member_id().as_deref() == Some(member_id))
            .cloned()
    }

    /// The main connection (first added)
    pub fn main_connection(&self) -> Option<Arc<CallConnection>> {
        self.connections.first().cloned()
    }

    /// Add a connection for a new party. The second party flips the call to
    /// a group call, exactly once.
    pub fn add_connection(
        &mut self,
        originator_id: uuid::Uuid,
        mode: CallStatus,
        is_transfer: bool,
        member_id: Option<MemberId>,
    ) -> Arc<CallConnection> {
        let connection = CallConnection::new(
            self.id,
            originator_id,
            mode,
            is_transfer,
            member_id,
            self.transport.clone(),
            self.request_ids.clone(),
            self.engine_tx.clone(),
        );
        self.connections.push(connection.clone());
        if self.connections.len() > 1 && !self.is_group && !is_transfer {
            self.is_group = true;
            tracing::info!(call_id = %self.id, "Call became a group call");
        }
        let participant = self.allocate_participant(connection.id());
        connection.add_participant(participant);
        connection
    }

    /// Remove a terminated connection and release it. Returns true when the
    /// call has no connection left.
    pub async fn remove_connection(&mut self, id: ConnectionId) -> bool {
        if let Some(pos) = self.connections.iter().position(|c| c.id() == id) {
            let connection = self.connections.remove(pos);
            connection.release().await;
        }
        self.connections.is_empty()
    }

    /// Map a transport state change onto the call. Returns what the change
    /// means at call level.
    pub fn on_link_connected(&mut self, connection_id: ConnectionId) -> ConnectionUpdate {
        let Some(connection) = self.connection(connection_id) else {
            return ConnectionUpdate::Ignore;
        };
        if !connection.update_link_state(crate::types::LinkState::Connected) {
            return ConnectionUpdate::Ignore;
        }
        self.status.to_active();
        if connection.is_transfer_connection() {
            // The call itself was already connected before the transfer
            ConnectionUpdate::NewConnection
        } else if !self.is_group {
            ConnectionUpdate::FirstConnection
        } else if self.room.is_none() {
            ConnectionUpdate::FirstGroup
        } else {
            ConnectionUpdate::NewConnection
        }
    }

    // === Participants ===

    fn allocate_participant(&mut self, connection_id: ConnectionId) -> Arc<CallParticipant> {
        self.next_participant_id += 1;
        CallParticipant::new(self.next_participant_id, connection_id)
    }

    /// All participants across every connection
    pub fn participants(&self) -> Vec<Arc<CallParticipant>> {
        let mut list = Vec::new();
        for connection in &self.connections {
            connection.append_participants(&mut list);
        }
        list
    }

    /// Look up a participant by id
    pub fn participant(&self, id: ParticipantId) -> Option<Arc<CallParticipant>> {
        self.participants().into_iter().find(|p| p.id() == id)
    }

    /// Number of remote parties in the call
    pub fn participant_count(&self) -> usize {
        self.connections
            .iter()
            .map(|c| c.participant_count())
            .sum()
    }

    // === Call room ===

    /// Create the call room if this device is responsible for it. Invited
    /// connections never create a room: the room already exists and they are
    /// already members of it. Returns true when the room was created by this
    /// invocation.
    pub async fn ensure_room(
        &mut self,
        rooms: &Arc<dyn CallRoomService>,
        max_member_count: u32,
    ) -> Result<bool, CallError> {
        if self.room.is_some() {
            return Ok(false);
        }
        if self.connections.iter().any(|c| c.invited()) {
            return Ok(false);
        }
        if !self.ops.check(Operation::CreateCallRoom) {
            return Ok(false);
        }

        let request_id = self.request_ids.next();
        match rooms.create_call_room(request_id, max_member_count).await {
            Ok((room_id, member_id)) => {
                tracing::info!(call_id = %self.id, room_id = %room_id, "Call room created");
                self.ops.mark_done(Operation::CreateCallRoom);
                self.room = Some(CallRoom {
                    id: room_id,
                    member_id,
                });
                Ok(true)
            }
            Err(e) => {
                self.ops.retry(Operation::CreateCallRoom, u8::MAX);
                Err(e.into())
            }
        }
    }

    /// Invite the peer behind `connection` into the call room. Invited
    /// connections are already members and are skipped.
    pub async fn invite_member(
        &mut self,
        rooms: &Arc<dyn CallRoomService>,
        connection: &Arc<CallConnection>,
    ) -> Result<(), CallError> {
        let room = self.room.as_ref().ok_or(CallError::NoRoom)?;
        if connection.invited() || !connection.check_operation(Operation::InviteCallRoom) {
            return Ok(());
        }

        let request_id = self.request_ids.next();
        match rooms
            .invite_call_room(request_id, room.id, connection.id())
            .await
        {
            Ok(member_id) => {
                connection.done_operation(Operation::InviteCallRoom);
                connection.set_member_id(member_id);
                Ok(())
            }
            Err(e) => {
                connection.retry_operation(Operation::InviteCallRoom, u8::MAX);
                Err(e.into())
            }
        }
    }

    /// Join the room we were invited into
    pub async fn join_room(
        &mut self,
        rooms: &Arc<dyn CallRoomService>,
        room_id: CallRoomId,
        connection: &Arc<CallConnection>,
    ) -> Result<(), CallError> {
        if self.room.is_some() || !connection.check_operation(Operation::JoinCallRoom) {
            return Ok(());
        }

        let request_id = self.request_ids.next();
        match rooms.join_call_room(request_id, room_id).await {
            Ok(member_id) => {
                tracing::info!(call_id = %self.id, room_id = %room_id, "Joined call room");
                connection.done_operation(Operation::JoinCallRoom);
                self.room = Some(CallRoom {
                    id: room_id,
                    member_id,
                });
                self.is_group = true;
                Ok(())
            }
            Err(e) => {
                connection.retry_operation(Operation::JoinCallRoom, u8::MAX);
                Err(e.into())
            }
        }
    }

    /// Remember a room we were invited into before the call was accepted.
    /// The join happens when the call is accepted.
    pub fn set_pending_room(&mut self, room_id: CallRoomId) {
        self.pending_room = Some(room_id);
    }

    /// Take the room waiting to be joined, if any
    pub fn take_pending_room(&mut self) -> Option<CallRoomId> {
        self.pending_room.take()
    }

    /// Leave the call room, if any
    pub async fn leave_room(&mut self, rooms: &Arc<dyn CallRoomService>) {
        if let Some(room) = self.room.take() {
            let request_id = self.request_ids.next();
            if let Err(e) = rooms
                .leave_call_room(request_id, room.id, room.member_id)
                .await
            {
                tracing::debug!(call_id = %self.id, error = %e, "Leave call room failed");
            }
        }
    }

    /// Describe ourselves to every connected group member. The exchange
    /// carries our avatar, so each connection receives it once; a failed
    /// send is re-admitted on the next broadcast within the retry ceiling.
    pub async fn broadcast_identity(
        &self,
        identity: &LocalIdentity,
        retry_ceiling: u8,
    ) -> Result<(), CallError> {
        let Some(room) = self.room.as_ref() else {
            return Ok(());
        };
        let member_id = room.member_id.clone();
        let targets: Vec<_> = self
            .connected_connections()
            .into_iter()
            .filter(|connection| connection.check_operation(Operation::GetParticipantAvatar))
            .collect();
        let sends = targets.iter().map(|connection| {
            let member_id = member_id.clone();
            let identity = identity.clone();
            async move {
                match connection
                    .send_participant_info(
                        member_id,
                        identity.name,
                        identity.description,
                        identity.thumbnail,
                    )
                    .await
                {
                    Ok(()) => {
                        connection.done_operation(Operation::GetParticipantAvatar);
                        Ok(())
                    }
                    Err(e) => {
                        connection.retry_operation(Operation::GetParticipantAvatar, retry_ceiling);
                        Err(e)
                    }
                }
            }
        });
        futures::future::try_join_all(sends).await?;
        Ok(())
    }

    // === Descriptor and geolocation relay ===

    /// Descriptors relayed during the call, in send order
    pub fn descriptors(&self) -> &[uuid::Uuid] {
        &self.descriptors
    }

    /// Relay a conversation descriptor to every connected member whose
    /// device supports in-call messages. A peer whose capability is still
    /// unknown is treated as unsupported and skipped. Returns the number of
    /// peers the descriptor was relayed to.
    pub async fn send_descriptor(
        &mut self,
        descriptor_id: uuid::Uuid,
    ) -> Result<usize, CallError> {
        self.descriptors.push(descriptor_id);
        let mut sent = 0;
        for connection in self.connected_connections() {
            if connection.is_message_supported() != Support::Yes {
                continue;
            }
            connection.send_descriptor(descriptor_id).await?;
            sent += 1;
        }
        tracing::debug!(call_id = %self.id, %descriptor_id, sent, "Descriptor relayed");
        Ok(sent)
    }

    /// Share or update our geolocation with every connected member whose
    /// device supports it
    pub async fn send_geolocation(&mut self, position: Geolocation) -> Result<(), CallError> {
        self.geolocation = Some(position);
        for connection in self.connected_connections() {
            if connection.is_geolocation_supported() != Support::Yes {
                continue;
            }
            connection.send_geolocation(Some(position)).await?;
        }
        Ok(())
    }

    /// Stop sharing our geolocation. A no-op when nothing was shared.
    pub async fn stop_geolocation(&mut self) -> Result<(), CallError> {
        if self.geolocation.take().is_none() {
            return Ok(());
        }
        for connection in self.connected_connections() {
            if connection.is_geolocation_supported() != Support::Yes {
                continue;
            }
            connection.send_geolocation(None).await?;
        }
        Ok(())
    }

    // === Hold / resume ===

    /// Put the call on hold: notify every peer and pause the media
    pub async fn hold(&mut self) -> Result<(), CallError> {
        if !self.status.is_active() || self.status.is_paused() {
            return Ok(());
        }
        self.status.set_on_hold(true);
        for connection in self.connected_connections() {
            connection.set_on_hold(true);
            if let Err(e) = connection.send_hold_call().await {
                tracing::warn!(connection_id = %connection.id(), error = %e, "Hold notification failed");
                continue;
            }
            if let Err(e) = connection
                .set_audio_direction(crate::types::MediaDirection::Inactive)
                .await
            {
                tracing::warn!(connection_id = %connection.id(), error = %e, "Pausing audio failed");
            }
        }
        tracing::info!(call_id = %self.id, "Call put on hold");
        Ok(())
    }

    /// Resume a held call
    pub async fn resume(&mut self) -> Result<(), CallError> {
        if !self.status.is_paused() {
            return Ok(());
        }
        self.status.set_on_hold(false);
        for connection in self.connected_connections() {
            connection.set_on_hold(false);
            if let Err(e) = connection.send_resume_call().await {
                tracing::warn!(connection_id = %connection.id(), error = %e, "Resume notification failed");
                continue;
            }
            if let Err(e) = connection
                .set_audio_direction(crate::types::MediaDirection::SendRecv)
                .await
            {
                tracing::warn!(connection_id = %connection.id(), error = %e, "Resuming audio failed");
            }
        }
        tracing::info!(call_id = %self.id, "Call resumed");
        Ok(())
    }

    /// The peer behind `connection_id` paused or resumed the call
    pub fn on_peer_hold(&mut self, connection_id: ConnectionId, hold: bool) -> Result<(), CallError> {
        let connection = self
            .connection(connection_id)
            .ok_or(CallError::ConnectionNotFound(connection_id))?;
        connection.set_peer_on_hold(hold);
        if !self.is_group {
            self.status.set_peer_on_hold(hold);
        }
        Ok(())
    }

    // === Transfer ===

    /// Direction of the transfer in progress, if any
    pub fn transfer_direction(&self) -> TransferDirection {
        self.transfer
            .as_ref()
            .map(|t| t.direction)
            .unwrap_or_default()
    }

    /// Start transferring the call to another of our devices. Asks every
    /// connected member to get ready; the transfer proceeds once they all
    /// acknowledged.
    pub async fn begin_transfer(
        &mut self,
        direction: TransferDirection,
        target_member: MemberId,
        old_connection_id: ConnectionId,
    ) -> Result<(), CallError> {
        if self.transfer.is_some() {
            return Err(CallError::InvalidState("transfer already in progress".into()));
        }
        let mut pending_acks = HashMap::new();
        for connection in self.connected_connections() {
            if connection.id() == old_connection_id {
                continue;
            }
            let request_id = self.request_ids.next();
            connection
                .send_iq(crate::protocol::CallIq::PrepareTransfer { request_id })
                .await?;
            pending_acks.insert(request_id, connection.id());
        }
        tracing::info!(
            call_id = %self.id,
            direction = ?direction,
            pending = pending_acks.len(),
            "Transfer started"
        );
        self.transfer = Some(TransferState {
            direction,
            target_member,
            pending_acks,
            old_connection_id,
        });
        Ok(())
    }

    /// True when a transfer is in progress and every member acknowledged
    pub fn transfer_ready(&self) -> bool {
        self.transfer
            .as_ref()
            .map(|t| t.pending_acks.is_empty())
            .unwrap_or(false)
    }

    /// A member acknowledged our prepare-transfer. Acks with an unknown
    /// request id are ignored. Returns true once every member is ready.
    pub fn on_prepare_transfer_ack(&mut self, request_id: i64) -> bool {
        let Some(transfer) = self.transfer.as_mut() else {
            return false;
        };
        if transfer.pending_acks.remove(&request_id).is_none() {
            return false;
        }
        transfer.pending_acks.is_empty()
    }

    /// Every member is ready: announce the member taking over the call
    pub async fn announce_transfer(&mut self) -> Result<(), CallError> {
        let Some(transfer) = self.transfer.as_ref() else {
            return Err(CallError::InvalidState("no transfer in progress".into()));
        };
        for connection in self.connected_connections() {
            if connection.id() == transfer.old_connection_id {
                continue;
            }
            connection
                .send_participant_transfer(transfer.target_member.clone())
                .await?;
        }
        Ok(())
    }

    /// Abort a transfer that cannot proceed
    pub fn cancel_transfer(&mut self) {
        self.transfer = None;
    }

    /// A transfer connection became active on our side: notify the device
    /// being replaced, tear its connection down and remove it. Returns the
    /// participants that left with the old connection.
    pub async fn finish_peer_transfer(
        &mut self,
        new_connection: &Arc<CallConnection>,
    ) -> Result<Vec<ParticipantId>, CallError> {
        let Some(member_id) = new_connection.member_id() else {
            return Ok(Vec::new());
        };
        let Some(old) = self
            .connections
            .iter()
            .find(|c| {
                c.id() != new_connection.id() && c.transfer_to_member_id() == Some(member_id.clone())
            })
            .cloned()
        else {
            return Ok(Vec::new());
        };

        let mut participants = Vec::new();
        old.append_participants(&mut participants);
        old.send_transfer_done().await?;
        old.terminate(TerminateReason::Transferred).await;
        self.remove_connection(old.id()).await;
        tracing::info!(call_id = %self.id, old = %old.id(), "Peer transfer completed");
        Ok(participants.iter().map(|p| p.id()).collect())
    }

    // === Key check ===

    /// Start a key check over `connection_id` as the initiator
    pub async fn start_key_check(
        &mut self,
        connection_id: ConnectionId,
        locale: &str,
        fingerprint: &[u8],
    ) -> Result<(), CallError> {
        if self.keycheck.is_some() {
            return Err(CallError::InvalidState("key check already running".into()));
        }
        let connection = self
            .connection(connection_id)
            .ok_or(CallError::ConnectionNotFound(connection_id))?;
        let session = KeyCheckSession::new(true, locale, fingerprint)?;
        let request_id = connection.send_key_check_initiate(locale.to_string()).await?;
        self.keycheck = Some(KeyCheckState {
            session,
            connection_id,
            initiate_request_id: Some(request_id),
        });
        Ok(())
    }

    /// The peer asked to start a key check; accept it as the responder
    pub async fn on_key_check_initiate(
        &mut self,
        connection_id: ConnectionId,
        request_id: i64,
        locale: &str,
        fingerprint: &[u8],
    ) -> Result<(), CallError> {
        let connection = self
            .connection(connection_id)
            .ok_or(CallError::ConnectionNotFound(connection_id))?;
        if self.keycheck.is_some() {
            connection
                .send_on_key_check_initiate(request_id, crate::types::ErrorCode::Busy)
                .await?;
            return Ok(());
        }
        match KeyCheckSession::new(false, locale, fingerprint) {
            Ok(session) => {
                connection
                    .send_on_key_check_initiate(request_id, crate::types::ErrorCode::Success)
                    .await?;
                self.keycheck = Some(KeyCheckState {
                    session,
                    connection_id,
                    initiate_request_id: None,
                });
                Ok(())
            }
            Err(KeyCheckError::UnsupportedLocale(_)) => {
                connection
                    .send_on_key_check_initiate(request_id, crate::types::ErrorCode::NotSupported)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The peer answered our key check initiate. Answers matching no
    /// outstanding request are stale or duplicated; they return false and
    /// must be dropped by the caller.
    pub fn on_key_check_initiate_answer(&mut self, request_id: i64) -> bool {
        let Some(keycheck) = self.keycheck.as_mut() else {
            return false;
        };
        if keycheck.initiate_request_id != Some(request_id) {
            return false;
        }
        keycheck.initiate_request_id = None;
        true
    }

    /// The word currently displayed for the key check
    pub fn key_check_challenge(&self) -> Option<WordChallenge> {
        self.keycheck
            .as_ref()
            .and_then(|k| k.session.current_challenge().cloned())
    }

    /// The user confirmed or rejected the current word
    pub async fn confirm_key_check_word(&mut self, matched: bool) -> Result<(), CallError> {
        let Some(keycheck) = self.keycheck.as_mut() else {
            return Err(CallError::InvalidState("no key check running".into()));
        };
        let steps = keycheck.session.confirm_word(matched)?;
        let connection_id = keycheck.connection_id;
        self.apply_key_check_steps(connection_id, steps).await
    }

    /// A word result arrived from the peer
    pub async fn on_word_check(
        &mut self,
        connection_id: ConnectionId,
        result: WordCheckResult,
    ) -> Result<(), CallError> {
        let Some(keycheck) = self.keycheck.as_mut() else {
            return Ok(());
        };
        if keycheck.connection_id != connection_id {
            return Ok(());
        }
        let steps = keycheck.session.on_word_check(result);
        self.apply_key_check_steps(connection_id, steps).await
    }

    /// The peer's final verdict arrived
    pub fn on_terminate_key_check(&mut self, connection_id: ConnectionId, result: bool) {
        if let Some(keycheck) = self.keycheck.as_mut() {
            if keycheck.connection_id == connection_id {
                keycheck.session.on_terminate(result);
            }
        }
    }

    /// Combined key check verdict
    pub fn key_check_verdict(&self) -> KeyCheckVerdict {
        self.keycheck
            .as_ref()
            .map(|k| k.session.verdict())
            .unwrap_or_default()
    }

    /// Drop the key check session
    pub fn end_key_check(&mut self) {
        self.keycheck = None;
    }

    async fn apply_key_check_steps(
        &mut self,
        connection_id: ConnectionId,
        steps: Vec<KeyCheckStep>,
    ) -> Result<(), CallError> {
        let connection = self
            .connection(connection_id)
            .ok_or(CallError::ConnectionNotFound(connection_id))?;
        for step in steps {
            match step {
                KeyCheckStep::SendWordCheck(result) => {
                    connection.send_word_check(result).await?;
                }
                KeyCheckStep::SendTerminate(verdict) => {
                    connection.send_terminate_key_check(verdict).await?;
                }
                KeyCheckStep::WordAdvanced | KeyCheckStep::Ignored => {}
            }
        }
        Ok(())
    }

    // === Streaming ===

    /// The streamer we own, if we are sharing media
    pub fn streamer(&self) -> Option<Arc<Streamer>> {
        self.streamer.clone()
    }

    /// Start streaming a media item to every capable peer
    pub async fn start_streaming(
        &mut self,
        ident: i64,
        source: Arc<dyn MediaSource>,
    ) -> Result<Arc<Streamer>, CallError> {
        if self.streamer.is_some() {
            return Err(CallError::InvalidState("already streaming".into()));
        }
        let streamer = Streamer::new(ident, source);
        streamer.start(&self.connected_connections()).await?;
        self.streamer = Some(streamer.clone());
        Ok(streamer)
    }

    /// Stop the stream we are sending
    pub async fn stop_streaming(&mut self) -> Result<(), CallError> {
        if let Some(streamer) = self.streamer.take() {
            streamer.stop(&self.connected_connections()).await?;
        }
        Ok(())
    }

    /// Forget a streamer whose session already ended
    pub fn clear_streamer(&mut self) {
        self.streamer = None;
    }

    // === Termination ===

    /// Tear down every connection and leave the room
    pub async fn terminate(
        &mut self,
        reason: TerminateReason,
        rooms: &Arc<dyn CallRoomService>,
    ) {
        self.status.to_terminated();
        if let Some(streamer) = self.streamer.take() {
            let _ = streamer.stop(&self.connected_connections()).await;
        }
        for connection in self.connections.clone() {
            connection.terminate(reason).await;
            connection.release().await;
        }
        self.connections.clear();
        self.keycheck = None;
        self.transfer = None;
        self.leave_room(rooms).await;
        tracing::info!(call_id = %self.id, reason = ?reason, "Call terminated");
    }

    /// Fold another call into this one. The merged call becomes a group
    /// call; the other call's connections keep their state.
    pub fn merge(&mut self, mut other: CallState) {
        for connection in other.connections.drain(..) {
            self.connections.push(connection);
        }
        self.is_group = true;
        if other.room.is_some() && self.room.is_none() {
            self.room = other.room.take();
        }
        self.descriptors.append(&mut other.descriptors);
        tracing::info!(call_id = %self.id, merged = %other.id, "Calls merged");
    }
}

impl std::fmt::Debug for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallState")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("connections", &self.connections.len())
            .field("is_group", &self.is_group)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::tests_support::NullTransport;
    use crate::types::{ErrorCode, LinkState};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeRooms {
        created: Mutex<u32>,
        invited: Mutex<Vec<ConnectionId>>,
        joined: Mutex<Vec<CallRoomId>>,
        left: Mutex<Vec<CallRoomId>>,
    }

    #[async_trait]
    impl CallRoomService for FakeRooms {
        async fn create_call_room(
            &self,
            _request_id: i64,
            _max_member_count: u32,
        ) -> Result<(CallRoomId, MemberId), LinkError> {
            *self.created.lock() += 1;
            Ok((CallRoomId::new(), "member-self".to_string()))
        }

        async fn invite_call_room(
            &self,
            _request_id: i64,
            _room_id: CallRoomId,
            connection_id: ConnectionId,
        ) -> Result<MemberId, LinkError> {
            self.invited.lock().push(connection_id);
            Ok(format!("member-{connection_id}"))
        }

        async fn join_call_room(
            &self,
            _request_id: i64,
            room_id: CallRoomId,
        ) -> Result<MemberId, LinkError> {
            self.joined.lock().push(room_id);
            Ok("member-joined".to_string())
        }

        async fn leave_call_room(
            &self,
            _request_id: i64,
            room_id: CallRoomId,
            _member_id: MemberId,
        ) -> Result<(), LinkError> {
            self.left.lock().push(room_id);
            Ok(())
        }
    }

    fn test_call(transport: Arc<NullTransport>) -> CallState {
        let (engine_tx, _engine_rx) = mpsc::unbounded_channel();
        CallState::new(CallStatus::outgoing_call(), transport, engine_tx)
    }

    #[tokio::test]
    async fn test_second_party_flips_group_once() {
        let mut call = test_call(Arc::new(NullTransport::default()));
        call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        assert!(!call.is_group_call());

        call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        assert!(call.is_group_call());

        call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        assert!(call.is_group_call());
        assert_eq!(call.participant_count(), 3);
    }

    #[tokio::test]
    async fn test_participant_ids_are_dense_and_unique() {
        let mut call = test_call(Arc::new(NullTransport::default()));
        for _ in 0..3 {
            call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        }
        let mut ids: Vec<_> = call.participants().iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_first_connection_classification() {
        let mut call = test_call(Arc::new(NullTransport::default()));
        let c1 = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );

        assert_eq!(
            call.on_link_connected(c1.id()),
            ConnectionUpdate::FirstConnection
        );
        assert!(call.status().is_active());
        // A repeat connect of the same link means nothing
        assert_eq!(call.on_link_connected(c1.id()), ConnectionUpdate::Ignore);
    }

    #[tokio::test]
    async fn test_group_connection_classification() {
        let rooms: Arc<dyn CallRoomService> = Arc::new(FakeRooms::default());
        let mut call = test_call(Arc::new(NullTransport::default()));
        let c1 = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        let c2 = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );

        // No room yet: the first group connect asks for a room
        assert_eq!(call.on_link_connected(c1.id()), ConnectionUpdate::FirstGroup);
        assert!(call.ensure_room(&rooms, 8).await.unwrap());

        assert_eq!(
            call.on_link_connected(c2.id()),
            ConnectionUpdate::NewConnection
        );
    }

    #[tokio::test]
    async fn test_descriptor_relay_respects_capability() {
        use crate::transport::PeerVersion;

        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        let capable =
            call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        let unknown =
            call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        call.on_link_connected(capable.id());
        call.on_link_connected(unknown.id());
        capable.set_peer_version(PeerVersion::new(2, 3));

        let descriptor_id = uuid::Uuid::new_v4();
        let sent = call.send_descriptor(descriptor_id).await.unwrap();

        // The peer whose capability is still unknown was skipped
        assert_eq!(sent, 1);
        assert_eq!(
            transport.descriptors.lock().as_slice(),
            &[(capable.id(), descriptor_id)]
        );
        assert_eq!(call.descriptors(), &[descriptor_id]);
    }

    #[tokio::test]
    async fn test_geolocation_stop_notifies_shared_peers() {
        use crate::transport::PeerVersion;

        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        let connection =
            call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        call.on_link_connected(connection.id());
        connection.set_peer_version(PeerVersion::new(2, 3));

        let position = Geolocation {
            latitude: 48.86,
            longitude: 2.35,
            altitude: 35.0,
        };
        call.send_geolocation(position).await.unwrap();
        call.stop_geolocation().await.unwrap();
        // Stopping again without an active share is silent
        call.stop_geolocation().await.unwrap();

        let pushes = transport.geolocations.lock().clone();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0], (connection.id(), Some(position)));
        assert_eq!(pushes[1], (connection.id(), None));
    }

    #[tokio::test]
    async fn test_room_created_once() {
        let fake = Arc::new(FakeRooms::default());
        let rooms: Arc<dyn CallRoomService> = fake.clone();
        let mut call = test_call(Arc::new(NullTransport::default()));
        call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);

        assert!(call.ensure_room(&rooms, 8).await.unwrap());
        assert!(!call.ensure_room(&rooms, 8).await.unwrap());
        assert_eq!(*fake.created.lock(), 1);
        assert!(call.room_id().is_some());
        assert_eq!(call.member_id().as_deref(), Some("member-self"));
    }

    #[tokio::test]
    async fn test_invited_connection_never_creates_room() {
        let fake = Arc::new(FakeRooms::default());
        let rooms: Arc<dyn CallRoomService> = fake.clone();
        let mut call = test_call(Arc::new(NullTransport::default()));
        let connection = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::incoming_call(),
            false,
            None,
        );
        connection.set_invited();

        assert!(!call.ensure_room(&rooms, 8).await.unwrap());
        assert_eq!(*fake.created.lock(), 0);

        // Instead the invited side joins the existing room
        let room_id = CallRoomId::new();
        call.join_room(&rooms, room_id, &connection).await.unwrap();
        assert_eq!(call.room_id(), Some(room_id));
        assert!(call.is_group_call());
    }

    #[tokio::test]
    async fn test_invite_skips_invited_members() {
        let fake = Arc::new(FakeRooms::default());
        let rooms: Arc<dyn CallRoomService> = fake.clone();
        let mut call = test_call(Arc::new(NullTransport::default()));
        let fresh = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        let invited = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        invited.set_invited();

        // Room exists before the invited connection was added
        {
            let fresh_only = &fresh;
            call.ops.check(Operation::CreateCallRoom);
            call.room = Some(CallRoom {
                id: CallRoomId::new(),
                member_id: "member-self".into(),
            });
            call.invite_member(&rooms, fresh_only).await.unwrap();
        }
        call.invite_member(&rooms, &invited).await.unwrap();

        assert_eq!(fake.invited.lock().clone(), vec![fresh.id()]);
        assert_eq!(fresh.member_id(), Some(format!("member-{}", fresh.id())));

        // A second invite of the same member is a no-op
        call.invite_member(&rooms, &fresh).await.unwrap();
        assert_eq!(fake.invited.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_hold_resume_round_trip() {
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        let connection = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        call.on_link_connected(connection.id());

        call.hold().await.unwrap();
        assert!(call.status().is_paused());
        // A second hold is a no-op
        call.hold().await.unwrap();

        call.resume().await.unwrap();
        assert!(!call.status().is_paused());

        let holds = transport
            .sent
            .lock()
            .iter()
            .filter(|(_, iq)| matches!(iq, crate::protocol::CallIq::HoldCall { .. }))
            .count();
        assert_eq!(holds, 1);
    }

    #[tokio::test]
    async fn test_hold_keeps_notifying_after_one_peer_fails() {
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        let broken = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        let healthy = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        call.on_link_connected(broken.id());
        call.on_link_connected(healthy.id());
        *transport.fail_sends_to.lock() = Some(broken.id());

        call.hold().await.unwrap();
        assert!(call.status().is_paused());

        // The healthy peer still learned about the hold
        let notified: Vec<ConnectionId> = transport
            .sent
            .lock()
            .iter()
            .filter(|(_, iq)| matches!(iq, crate::protocol::CallIq::HoldCall { .. }))
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(notified, vec![healthy.id()]);

        *transport.fail_sends_to.lock() = None;
        call.resume().await.unwrap();
        assert!(!call.status().is_paused());
    }

    fn participant_info_counts(
        transport: &NullTransport,
        id: ConnectionId,
    ) -> usize {
        transport
            .sent
            .lock()
            .iter()
            .filter(|(to, iq)| {
                *to == id && matches!(iq, crate::protocol::CallIq::ParticipantInfo { .. })
            })
            .count()
    }

    #[tokio::test]
    async fn test_identity_broadcast_once_per_connection() {
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        call.room = Some(CallRoom {
            id: CallRoomId::new(),
            member_id: "member-self".into(),
        });
        let identity = LocalIdentity {
            name: "Alice".into(),
            ..LocalIdentity::default()
        };

        let c1 = call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        call.on_link_connected(c1.id());
        call.broadcast_identity(&identity, 3).await.unwrap();
        call.broadcast_identity(&identity, 3).await.unwrap();
        assert_eq!(participant_info_counts(&transport, c1.id()), 1);

        // A later joiner gets the identity without resending to c1
        let c2 = call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        call.on_link_connected(c2.id());
        call.broadcast_identity(&identity, 3).await.unwrap();
        assert_eq!(participant_info_counts(&transport, c1.id()), 1);
        assert_eq!(participant_info_counts(&transport, c2.id()), 1);
    }

    #[tokio::test]
    async fn test_identity_broadcast_retries_failed_send() {
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        call.room = Some(CallRoom {
            id: CallRoomId::new(),
            member_id: "member-self".into(),
        });
        let identity = LocalIdentity {
            name: "Alice".into(),
            ..LocalIdentity::default()
        };
        let connection =
            call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        call.on_link_connected(connection.id());

        *transport.fail_sends_to.lock() = Some(connection.id());
        assert!(call.broadcast_identity(&identity, 3).await.is_err());

        // The failed exchange is re-admitted once the link recovers
        *transport.fail_sends_to.lock() = None;
        call.broadcast_identity(&identity, 3).await.unwrap();
        assert_eq!(participant_info_counts(&transport, connection.id()), 1);
    }

    #[tokio::test]
    async fn test_transfer_waits_for_all_acks() {
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        let old = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        let m1 = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        let m2 = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        for c in [&old, &m1, &m2] {
            call.on_link_connected(c.id());
        }

        call.begin_transfer(TransferDirection::ToDevice, "member-new".into(), old.id())
            .await
            .unwrap();

        let request_ids: Vec<i64> = transport
            .sent
            .lock()
            .iter()
            .filter_map(|(_, iq)| match iq {
                crate::protocol::CallIq::PrepareTransfer { request_id } => Some(*request_id),
                _ => None,
            })
            .collect();
        assert_eq!(request_ids.len(), 2);

        // Unknown ack ids are ignored
        assert!(!call.on_prepare_transfer_ack(999_999));
        assert!(!call.on_prepare_transfer_ack(request_ids[0]));
        // Duplicate ack is ignored too
        assert!(!call.on_prepare_transfer_ack(request_ids[0]));
        assert!(call.on_prepare_transfer_ack(request_ids[1]));

        call.announce_transfer().await.unwrap();
        let transfers = transport
            .sent
            .lock()
            .iter()
            .filter(|(_, iq)| {
                matches!(iq, crate::protocol::CallIq::ParticipantTransfer { .. })
            })
            .count();
        assert_eq!(transfers, 2);

        // The replacement connection joins before the old one is removed
        old.set_transfer_to_member_id(Some("member-new".into()));
        let new = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            true,
            Some("member-new".into()),
        );
        assert_eq!(call.on_link_connected(new.id()), ConnectionUpdate::NewConnection);
        assert_eq!(call.connections().len(), 4);

        let removed = call.finish_peer_transfer(&new).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(call.connections().len(), 3);
        assert!(call.connection(new.id()).is_some());
        assert!(call.connection(old.id()).is_none());

        // A repeat activation finds nothing left to replace
        assert!(call.finish_peer_transfer(&new).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_check_busy_when_already_running() {
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        let connection = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::outgoing_call(),
            false,
            None,
        );
        call.on_link_connected(connection.id());

        call.start_key_check(connection.id(), "en", &[1, 2, 3, 4])
            .await
            .unwrap();
        call.on_key_check_initiate(connection.id(), 77, "en", &[1, 2, 3, 4])
            .await
            .unwrap();

        let (_, iq) = transport.sent.lock().last().cloned().unwrap();
        let crate::protocol::CallIq::OnKeyCheckInitiate {
            request_id,
            error_code,
        } = iq
        else {
            panic!("expected an on-key-check-initiate");
        };
        assert_eq!(request_id, 77);
        assert_eq!(error_code, ErrorCode::Busy);
    }

    #[tokio::test]
    async fn test_key_check_unsupported_locale_rejected() {
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        let connection = call.add_connection(
            uuid::Uuid::new_v4(),
            CallStatus::incoming_call(),
            false,
            None,
        );

        call.on_key_check_initiate(connection.id(), 5, "xx", &[1, 2])
            .await
            .unwrap();
        let (_, iq) = transport.sent.lock().last().cloned().unwrap();
        let crate::protocol::CallIq::OnKeyCheckInitiate { error_code, .. } = iq else {
            panic!("expected an on-key-check-initiate");
        };
        assert_eq!(error_code, ErrorCode::NotSupported);
        assert_eq!(call.key_check_verdict(), KeyCheckVerdict::Unknown);
    }

    #[tokio::test]
    async fn test_terminate_releases_everything() {
        let fake = Arc::new(FakeRooms::default());
        let rooms: Arc<dyn CallRoomService> = fake.clone();
        let transport = Arc::new(NullTransport::default());
        let mut call = test_call(transport.clone());
        call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        call.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);
        call.ensure_room(&rooms, 8).await.unwrap();

        call.terminate(TerminateReason::Success, &rooms).await;
        assert!(call.status().is_terminated());
        assert!(call.connections().is_empty());
        assert_eq!(fake.left.lock().len(), 1);
        assert_eq!(transport.terminated.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_folds_connections() {
        let transport = Arc::new(NullTransport::default());
        let mut a = test_call(transport.clone());
        a.add_connection(uuid::Uuid::new_v4(), CallStatus::outgoing_call(), false, None);

        let mut b = test_call(transport);
        b.add_connection(uuid::Uuid::new_v4(), CallStatus::incoming_call(), false, None);

        a.merge(b);
        assert!(a.is_group_call());
        assert_eq!(a.connections().len(), 2);
    }
}
