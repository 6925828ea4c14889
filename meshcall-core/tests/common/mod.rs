//! Shared transport and room doubles for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use meshcall_core::{
    CallConfig, CallEvent, CallIq, CallRoomId, CallRoomService, CallService, CallServiceBuilder,
    ConnectionId, Geolocation, LinkError, MediaDirection, MemberId, PeerLinkTransport,
    TerminateReason,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Transport double that records every call and accepts everything
#[derive(Default)]
pub struct RecordingTransport {
    pub outgoing_links: Mutex<Vec<(ConnectionId, Uuid, bool)>>,
    pub incoming_links: Mutex<Vec<ConnectionId>>,
    pub audio_inits: Mutex<Vec<ConnectionId>>,
    pub sent: Mutex<Vec<(ConnectionId, CallIq)>>,
    pub descriptors: Mutex<Vec<(ConnectionId, Uuid)>>,
    pub geolocations: Mutex<Vec<(ConnectionId, Option<Geolocation>)>>,
    pub terminated: Mutex<Vec<(ConnectionId, TerminateReason)>>,
}

impl RecordingTransport {
    /// Count the sent IQs matching the predicate
    pub fn sent_matching(&self, predicate: impl Fn(&CallIq) -> bool) -> usize {
        self.sent.lock().iter().filter(|(_, iq)| predicate(iq)).count()
    }

    /// The last sent IQ matching the predicate
    pub fn last_sent(&self, predicate: impl Fn(&CallIq) -> bool) -> Option<CallIq> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|(_, iq)| predicate(iq))
            .map(|(_, iq)| iq.clone())
    }
}

#[async_trait]
impl PeerLinkTransport for RecordingTransport {
    async fn create_outgoing_link(
        &self,
        connection_id: ConnectionId,
        peer_id: Uuid,
        video: bool,
    ) -> Result<(), LinkError> {
        self.outgoing_links.lock().push((connection_id, peer_id, video));
        Ok(())
    }

    async fn create_incoming_link(&self, connection_id: ConnectionId) -> Result<(), LinkError> {
        self.incoming_links.lock().push(connection_id);
        Ok(())
    }

    async fn init_audio(&self, connection_id: ConnectionId) -> Result<(), LinkError> {
        self.audio_inits.lock().push(connection_id);
        Ok(())
    }

    async fn send_iq(&self, connection_id: ConnectionId, iq: CallIq) -> Result<(), LinkError> {
        self.sent.lock().push((connection_id, iq));
        Ok(())
    }

    async fn set_audio_direction(
        &self,
        _connection_id: ConnectionId,
        _direction: MediaDirection,
    ) -> Result<(), LinkError> {
        Ok(())
    }

    async fn set_video_direction(
        &self,
        _connection_id: ConnectionId,
        _direction: MediaDirection,
    ) -> Result<(), LinkError> {
        Ok(())
    }

    async fn send_descriptor(
        &self,
        connection_id: ConnectionId,
        descriptor_id: Uuid,
    ) -> Result<(), LinkError> {
        self.descriptors.lock().push((connection_id, descriptor_id));
        Ok(())
    }

    async fn send_geolocation(
        &self,
        connection_id: ConnectionId,
        position: Option<Geolocation>,
    ) -> Result<(), LinkError> {
        self.geolocations.lock().push((connection_id, position));
        Ok(())
    }

    async fn key_fingerprint(&self, _connection_id: ConnectionId) -> Result<Vec<u8>, LinkError> {
        Ok(vec![11, 42, 97, 3, 250, 18, 77, 128])
    }

    async fn terminate_link(
        &self,
        connection_id: ConnectionId,
        reason: TerminateReason,
    ) -> Result<(), LinkError> {
        self.terminated.lock().push((connection_id, reason));
        Ok(())
    }
}

/// Call room double handing out deterministic member ids
#[derive(Default)]
pub struct RecordingRooms {
    pub created: Mutex<u32>,
    pub invited: Mutex<Vec<ConnectionId>>,
    pub joined: Mutex<Vec<CallRoomId>>,
    pub left: Mutex<u32>,
}

#[async_trait]
impl CallRoomService for RecordingRooms {
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
        _room_id: CallRoomId,
        _member_id: MemberId,
    ) -> Result<(), LinkError> {
        *self.left.lock() += 1;
        Ok(())
    }
}

/// Build a service wired to recording doubles
pub fn build_service(
    config: CallConfig,
) -> (Arc<CallService>, Arc<RecordingTransport>, Arc<RecordingRooms>) {
    init_tracing();
    let transport = Arc::new(RecordingTransport::default());
    let rooms = Arc::new(RecordingRooms::default());
    let service = CallServiceBuilder::new()
        .with_config(config)
        .with_transport(transport.clone())
        .with_rooms(rooms.clone())
        .build()
        .expect("service builds with both collaborators");
    (service, transport, rooms)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("meshcall_core=debug")
        .with_test_writer()
        .try_init();
}

/// Receive the next event, failing the test after one second
pub async fn next_event(events: &mut broadcast::Receiver<CallEvent>) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for a call event")
        .expect("event channel closed")
}

/// Collect exactly `count` events from the subscription
pub async fn collect_events(
    events: broadcast::Receiver<CallEvent>,
    count: usize,
) -> Vec<CallEvent> {
    use tokio_stream::StreamExt;
    let stream = tokio_stream::wrappers::BroadcastStream::new(events);
    tokio::time::timeout(
        Duration::from_secs(2),
        stream.filter_map(Result::ok).take(count).collect::<Vec<_>>(),
    )
    .await
    .expect("timed out collecting call events")
}
