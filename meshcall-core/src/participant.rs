//! Remote call participants
//!
//! A participant is one remote person in the call. On a device-to-device
//! connection there is exactly one; a connection to a media mixer can carry
//! several. The participant tracks identity, media state and the remote
//! camera control session, and reports changes as [`ParticipantEvent`]s for
//! the call to fan out. Media callbacks may arrive after the participant was
//! released; every mutation is a silent no-op from then on.

use crate::protocol::CameraControlMode;
use crate::types::{ConnectionId, ErrorCode, MemberId, ParticipantEvent, ParticipantId, TrackKind};
use parking_lot::Mutex;
use std::sync::Arc;

/// Sink for the video frames of a participant's track.
///
/// Implemented by the presentation layer; attached when a view starts
/// displaying the participant.
pub trait VideoRenderer: Send + Sync {
    /// A video track became available for rendering
    fn on_track_added(&self, participant_id: ParticipantId, track_id: &str);

    /// The video track was removed
    fn on_track_removed(&self, participant_id: ParticipantId, track_id: &str);
}

/// State of a remote camera control session with this participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraControlState {
    /// No session in progress
    #[default]
    None,
    /// We asked the peer for control, waiting for the response
    Asked,
    /// The peer granted control of its camera
    Granted,
}

#[derive(Default)]
struct ParticipantCore {
    member_id: Option<MemberId>,
    name: Option<String>,
    description: Option<String>,
    thumbnail: Option<Vec<u8>>,
    connected: bool,
    audio_muted: bool,
    screen_sharing: bool,
    audio_track: Option<String>,
    video_track: Option<String>,
    renderer: Option<Arc<dyn VideoRenderer>>,
    camera_state: CameraControlState,
    camera_bitmap: i64,
    active_camera: i32,
    min_scale: i32,
    max_scale: i32,
    peer_control_request: Option<i64>,
    peer_controlled: bool,
    released: bool,
}

/// One remote person in a call
pub struct CallParticipant {
    id: ParticipantId,
    connection_id: ConnectionId,
    core: Mutex<ParticipantCore>,
}

impl CallParticipant {
    pub(crate) fn new(id: ParticipantId, connection_id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            connection_id,
            core: Mutex::new(ParticipantCore::default()),
        })
    }

    /// Participant identifier, dense within the call
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// The connection this participant rides on
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Display name, once known
    pub fn name(&self) -> Option<String> {
        self.core.lock().name.clone()
    }

    /// Description, once known
    pub fn description(&self) -> Option<String> {
        self.core.lock().description.clone()
    }

    /// Avatar thumbnail, once known
    pub fn thumbnail(&self) -> Option<Vec<u8>> {
        self.core.lock().thumbnail.clone()
    }

    /// Call room member id of this participant
    pub fn member_id(&self) -> Option<MemberId> {
        self.core.lock().member_id.clone()
    }

    pub(crate) fn set_member_id(&self, member_id: MemberId) {
        let mut core = self.core.lock();
        if !core.released {
            core.member_id = Some(member_id);
        }
    }

    /// Record the identity received in a participant-info message
    pub(crate) fn set_identity(
        &self,
        name: String,
        description: Option<String>,
        thumbnail: Option<Vec<u8>>,
    ) -> Option<ParticipantEvent> {
        let mut core = self.core.lock();
        if core.released {
            return None;
        }
        core.name = Some(name);
        core.description = description;
        core.thumbnail = thumbnail;
        Some(ParticipantEvent::Identity)
    }

    /// True once media is flowing with this participant
    pub fn is_connected(&self) -> bool {
        self.core.lock().connected
    }

    /// Mark the participant connected. Reports the event only on the first
    /// transition.
    pub(crate) fn set_connected(&self) -> Option<ParticipantEvent> {
        let mut core = self.core.lock();
        if core.released || core.connected {
            return None;
        }
        core.connected = true;
        Some(ParticipantEvent::Connected)
    }

    /// True while the participant microphone is muted
    pub fn is_audio_muted(&self) -> bool {
        self.core.lock().audio_muted
    }

    /// True while the participant has a live video track
    pub fn is_video_on(&self) -> bool {
        self.core.lock().video_track.is_some()
    }

    /// True while the participant shares its screen
    pub fn is_screen_sharing(&self) -> bool {
        self.core.lock().screen_sharing
    }

    pub(crate) fn set_audio_muted(&self, muted: bool) -> Option<ParticipantEvent> {
        let mut core = self.core.lock();
        if core.released || core.audio_muted == muted {
            return None;
        }
        core.audio_muted = muted;
        Some(if muted {
            ParticipantEvent::AudioOff
        } else {
            ParticipantEvent::AudioOn
        })
    }

    pub(crate) fn set_screen_sharing(&self, sharing: bool) -> Option<ParticipantEvent> {
        let mut core = self.core.lock();
        if core.released || core.screen_sharing == sharing {
            return None;
        }
        core.screen_sharing = sharing;
        Some(if sharing {
            ParticipantEvent::ScreenSharingOn
        } else {
            ParticipantEvent::ScreenSharingOff
        })
    }

    /// Attach the renderer displaying this participant's video
    pub fn set_renderer(&self, renderer: Arc<dyn VideoRenderer>) {
        let mut core = self.core.lock();
        if core.released {
            return;
        }
        if let Some(track) = core.video_track.clone() {
            renderer.on_track_added(self.id, &track);
        }
        core.renderer = Some(renderer);
    }

    /// A media track appeared for this participant. Safe at any time; a track
    /// arriving after release is dropped silently.
    pub(crate) fn add_track(&self, track_id: String, kind: TrackKind) -> Option<ParticipantEvent> {
        let mut core = self.core.lock();
        if core.released {
            return None;
        }
        match kind {
            TrackKind::Audio => {
                core.audio_track = Some(track_id);
                Some(ParticipantEvent::AudioOn)
            }
            TrackKind::Video => {
                if let Some(renderer) = &core.renderer {
                    renderer.on_track_added(self.id, &track_id);
                }
                core.video_track = Some(track_id);
                Some(ParticipantEvent::VideoOn)
            }
            TrackKind::None => None,
        }
    }

    /// A media track disappeared. Safe at any time.
    pub(crate) fn remove_track(&self, track_id: &str) -> Option<ParticipantEvent> {
        let mut core = self.core.lock();
        if core.released {
            return None;
        }
        if core.audio_track.as_deref() == Some(track_id) {
            core.audio_track = None;
            return Some(ParticipantEvent::AudioOff);
        }
        if core.video_track.as_deref() == Some(track_id) {
            if let Some(renderer) = &core.renderer {
                renderer.on_track_removed(self.id, track_id);
            }
            core.video_track = None;
            return Some(ParticipantEvent::VideoOff);
        }
        None
    }

    // === Remote camera control ===

    /// State of the camera control session with this participant
    pub fn camera_control_state(&self) -> CameraControlState {
        self.core.lock().camera_state
    }

    /// Bitmap of the peer's available cameras, valid once control was granted
    pub fn camera_bitmap(&self) -> i64 {
        self.core.lock().camera_bitmap
    }

    /// Currently active peer camera
    pub fn active_camera(&self) -> i32 {
        self.core.lock().active_camera
    }

    /// Zoom range of the active peer camera
    pub fn zoom_range(&self) -> (i32, i32) {
        let core = self.core.lock();
        (core.min_scale, core.max_scale)
    }

    /// Record that we asked the peer for camera control. Returns false when a
    /// session is already in progress.
    pub(crate) fn camera_control_asked(&self) -> bool {
        let mut core = self.core.lock();
        if core.released || core.camera_state != CameraControlState::None {
            return false;
        }
        core.camera_state = CameraControlState::Asked;
        true
    }

    /// True while this participant was granted control of our camera
    pub fn is_peer_controlled(&self) -> bool {
        self.core.lock().peer_controlled
    }

    /// The peer asked to control our camera. The request stays pending until
    /// the user answers it. Returns false after release.
    pub(crate) fn peer_asked_control(&self, request_id: i64) -> bool {
        let mut core = self.core.lock();
        if core.released {
            return false;
        }
        core.peer_control_request = Some(request_id);
        true
    }

    /// The user answered the pending control request. Returns the request id
    /// the answer must carry, or None when nothing is pending.
    pub(crate) fn answer_peer_control(&self, grant: bool) -> Option<i64> {
        let mut core = self.core.lock();
        if core.released {
            return None;
        }
        let request_id = core.peer_control_request.take()?;
        core.peer_controlled = grant;
        Some(request_id)
    }

    /// The peer ended its control session over our camera
    pub(crate) fn peer_control_stopped(&self) {
        let mut core = self.core.lock();
        core.peer_controlled = false;
        core.peer_control_request = None;
    }

    /// Apply a camera-response message from the peer
    pub(crate) fn on_camera_response(
        &self,
        mode: CameraControlMode,
        error_code: ErrorCode,
        camera_bitmap: i64,
        active_camera: i32,
        min_scale: i32,
        max_scale: i32,
    ) -> Option<ParticipantEvent> {
        let mut core = self.core.lock();
        if core.released {
            return None;
        }
        if error_code != ErrorCode::Success {
            core.camera_state = CameraControlState::None;
            return Some(ParticipantEvent::CameraControlDenied);
        }
        match mode {
            CameraControlMode::Check => {
                core.camera_state = CameraControlState::Granted;
                core.camera_bitmap = camera_bitmap;
                core.active_camera = active_camera;
                core.min_scale = min_scale;
                core.max_scale = max_scale;
                Some(ParticipantEvent::CameraControlGranted)
            }
            CameraControlMode::Stop => {
                core.camera_state = CameraControlState::None;
                Some(ParticipantEvent::CameraControlDone)
            }
            _ => {
                core.active_camera = active_camera;
                None
            }
        }
    }

    /// True once the participant was released
    pub fn is_released(&self) -> bool {
        self.core.lock().released
    }

    /// Release the participant: detach tracks and renderer. Every later
    /// mutation becomes a no-op.
    pub(crate) fn release(&self) {
        let mut core = self.core.lock();
        if core.released {
            return;
        }
        if let (Some(renderer), Some(track)) = (&core.renderer, core.video_track.clone()) {
            renderer.on_track_removed(self.id, &track);
        }
        core.audio_track = None;
        core.video_track = None;
        core.renderer = None;
        core.camera_state = CameraControlState::None;
        core.peer_control_request = None;
        core.peer_controlled = false;
        core.released = true;
    }
}

impl std::fmt::Debug for CallParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallParticipant")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
