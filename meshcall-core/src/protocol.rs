//! Wire protocol messages exchanged over an established P2P data channel
//!
//! Every message ("IQ") carries a `request_id`; a response echoes the
//! `request_id` of the request it answers. Responses whose `request_id`
//! matches no outstanding request are ignored without side effects, which
//! makes the protocol idempotent under duplicate delivery.

use crate::types::{ErrorCode, MemberId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Remote camera command mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraControlMode {
    /// Ask the peer whether control is possible and request it
    Check,
    /// Turn the peer camera on
    On,
    /// Turn the peer camera off
    Off,
    /// Select the active peer camera
    Select,
    /// Zoom the peer camera
    Zoom,
    /// Release the camera control session
    Stop,
}

/// Streaming control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingControlMode {
    /// Sender starts streaming an audio item
    StartAudio,
    /// Sender starts streaming a video item
    StartVideo,
    /// Sender pauses the stream for every player
    Pause,
    /// Sender resumes the stream
    Resume,
    /// Sender seeks the stream to `position`
    Seek,
    /// Sender stops the stream
    Stop,
    /// Receiver asks the sender to pause
    AskPause,
    /// Receiver asks the sender to resume
    AskResume,
    /// Receiver asks the sender to seek
    AskSeek,
    /// Receiver asks the sender to stop
    AskStop,
    /// Receiver reports its player is playing
    StatusPlaying,
    /// Receiver reports its player is paused
    StatusPaused,
    /// Receiver reports it is ready to play
    StatusReady,
    /// Receiver reports the content is not supported
    StatusUnsupported,
    /// Receiver reports a player error
    StatusError,
    /// Receiver reports its player stopped
    StatusStopped,
    /// Receiver reports playback completed
    StatusCompleted,
}

impl StreamingControlMode {
    /// True for the receiver-to-sender ask operations
    pub fn is_ask(&self) -> bool {
        matches!(
            self,
            Self::AskPause | Self::AskResume | Self::AskSeek | Self::AskStop
        )
    }

    /// True for the receiver status feedback operations
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Self::StatusPlaying
                | Self::StatusPaused
                | Self::StatusReady
                | Self::StatusUnsupported
                | Self::StatusError
                | Self::StatusStopped
                | Self::StatusCompleted
        )
    }
}

/// Result of checking one key-check word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordCheckResult {
    /// Index of the word in the challenge list
    pub word_index: i32,
    /// Whether the spoken word matched
    pub ok: bool,
}

/// Fixed-schema messages carried over the call signaling/data channel.
///
/// Each variant is versioned by schema name + integer version; see
/// [`CallIq::schema`] and [`CallIq::schema_version`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CallIq {
    /// Remote camera command
    CameraControl {
        /// Request identifier echoed by the response
        request_id: i64,
        /// Command mode
        mode: CameraControlMode,
        /// Camera index (1=front, 2=back)
        camera: i32,
        /// Zoom scale for `Zoom` mode
        scale: i32,
    },
    /// Camera command acknowledgment
    CameraResponse {
        /// Echoed request identifier
        request_id: i64,
        /// Command outcome
        error_code: ErrorCode,
        /// Bitmap of the peer's available cameras
        camera_bitmap: i64,
        /// Currently active peer camera
        active_camera: i32,
        /// Minimum zoom scale
        min_scale: i32,
        /// Maximum zoom scale
        max_scale: i32,
    },
    /// Start a key check session
    KeyCheckInitiate {
        /// Request identifier echoed by the response
        request_id: i64,
        /// Locale for the challenge word list (BCP 47 tag)
        locale: String,
    },
    /// Key check start acknowledgment
    OnKeyCheckInitiate {
        /// Echoed request identifier
        request_id: i64,
        /// Whether the peer accepts the key check
        error_code: ErrorCode,
    },
    /// Per-word verification result
    WordCheck {
        /// Request identifier
        request_id: i64,
        /// The word outcome
        result: WordCheckResult,
    },
    /// End the key check with a final verdict
    TerminateKeyCheck {
        /// Request identifier
        request_id: i64,
        /// True when every word matched on this side
        result: bool,
    },
    /// Side-channel identity URI exchange during the key check
    TwincodeUri {
        /// Request identifier
        request_id: i64,
        /// The identity URI
        uri: String,
    },
    /// Group member self-description
    ParticipantInfo {
        /// Request identifier
        request_id: i64,
        /// The member within the call room
        member_id: MemberId,
        /// Display name
        name: String,
        /// Optional description
        description: Option<String>,
        /// Optional avatar thumbnail
        thumbnail: Option<Vec<u8>>,
    },
    /// Announce the transfer target member
    ParticipantTransfer {
        /// Request identifier
        request_id: i64,
        /// Member that will take over the call
        member_id: MemberId,
    },
    /// Ask connected members to get ready for a transfer
    PrepareTransfer {
        /// Request identifier
        request_id: i64,
    },
    /// Acknowledge readiness for a transfer
    OnPrepareTransfer {
        /// Echoed request identifier
        request_id: i64,
    },
    /// The transfer completed; the old connection can be discarded
    TransferDone {
        /// Request identifier
        request_id: i64,
    },
    /// We put the call on hold
    HoldCall {
        /// Request identifier
        request_id: i64,
    },
    /// We resumed the call
    ResumeCall {
        /// Request identifier
        request_id: i64,
    },
    /// Stream lifecycle and status control
    StreamingControl {
        /// Request identifier
        request_id: i64,
        /// Streamed item identifier
        ident: i64,
        /// Operation
        mode: StreamingControlMode,
        /// Total content length in bytes
        length: i64,
        /// Sender clock at emission, milliseconds
        timestamp: i64,
        /// Playback position in milliseconds
        position: i64,
        /// Measured one-way latency estimate, milliseconds
        latency: i32,
    },
    /// A pushed media chunk answering a streaming request
    StreamingData {
        /// Echoed request identifier of the matching request
        request_id: i64,
        /// Streamed item identifier
        ident: i64,
        /// Byte offset of the chunk
        offset: i64,
        /// Sender playback position when the chunk was produced
        streamer_position: i64,
        /// Latency estimate, milliseconds
        latency: i32,
        /// Sender clock at emission, milliseconds
        timestamp: i64,
        /// The chunk payload
        data: Bytes,
        /// Start of valid bytes within `data`
        start: i64,
        /// Number of valid bytes within `data`
        length: i64,
    },
    /// Stream metadata
    StreamingInfo {
        /// Request identifier
        request_id: i64,
        /// Streamed item identifier
        ident: i64,
        /// Track title
        title: String,
        /// Optional album
        album: Option<String>,
        /// Optional artist
        artist: Option<String>,
        /// Optional artwork bytes
        artwork: Option<Vec<u8>>,
        /// Content duration, milliseconds
        duration: i64,
    },
    /// Pull request for a bounded chunk of stream data
    StreamingRequest {
        /// Request identifier echoed by the data answer
        request_id: i64,
        /// Streamed item identifier
        ident: i64,
        /// Byte offset requested
        offset: i64,
        /// Number of bytes requested
        length: i64,
        /// Receiver playback position, milliseconds
        player_position: i64,
        /// Receiver clock at emission, milliseconds
        timestamp: i64,
        /// Last measured round-trip time, milliseconds
        last_rtt: i32,
    },
}

impl CallIq {
    /// Schema name of this message
    pub fn schema(&self) -> &'static str {
        match self {
            Self::CameraControl { .. } => "call:camera-control",
            Self::CameraResponse { .. } => "call:camera-response",
            Self::KeyCheckInitiate { .. } => "call:key-check-initiate",
            Self::OnKeyCheckInitiate { .. } => "call:on-key-check-initiate",
            Self::WordCheck { .. } => "call:word-check",
            Self::TerminateKeyCheck { .. } => "call:terminate-key-check",
            Self::TwincodeUri { .. } => "call:twincode-uri",
            Self::ParticipantInfo { .. } => "call:participant-info",
            Self::ParticipantTransfer { .. } => "call:participant-transfer",
            Self::PrepareTransfer { .. } => "call:prepare-transfer",
            Self::OnPrepareTransfer { .. } => "call:on-prepare-transfer",
            Self::TransferDone { .. } => "call:transfer-done",
            Self::HoldCall { .. } => "call:hold-call",
            Self::ResumeCall { .. } => "call:resume-call",
            Self::StreamingControl { .. } => "call:streaming-control",
            Self::StreamingData { .. } => "call:streaming-data",
            Self::StreamingInfo { .. } => "call:streaming-info",
            Self::StreamingRequest { .. } => "call:streaming-request",
        }
    }

    /// Schema version of this message
    pub fn schema_version(&self) -> u32 {
        match self {
            Self::StreamingControl { .. }
            | Self::StreamingData { .. }
            | Self::StreamingInfo { .. }
            | Self::StreamingRequest { .. } => 2,
            _ => 1,
        }
    }

    /// The request identifier carried by this message
    pub fn request_id(&self) -> i64 {
        match self {
            Self::CameraControl { request_id, .. }
            | Self::CameraResponse { request_id, .. }
            | Self::KeyCheckInitiate { request_id, .. }
            | Self::OnKeyCheckInitiate { request_id, .. }
            | Self::WordCheck { request_id, .. }
            | Self::TerminateKeyCheck { request_id, .. }
            | Self::TwincodeUri { request_id, .. }
            | Self::ParticipantInfo { request_id, .. }
            | Self::ParticipantTransfer { request_id, .. }
            | Self::PrepareTransfer { request_id, .. }
            | Self::OnPrepareTransfer { request_id, .. }
            | Self::TransferDone { request_id, .. }
            | Self::HoldCall { request_id, .. }
            | Self::ResumeCall { request_id, .. }
            | Self::StreamingControl { request_id, .. }
            | Self::StreamingData { request_id, .. }
            | Self::StreamingInfo { request_id, .. }
            | Self::StreamingRequest { request_id, .. } => *request_id,
        }
    }

    /// True for messages answering a request of ours
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::CameraResponse { .. }
                | Self::OnKeyCheckInitiate { .. }
                | Self::OnPrepareTransfer { .. }
                | Self::StreamingData { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_schema_names_are_distinct() {
        let messages = [
            CallIq::HoldCall { request_id: 1 },
            CallIq::ResumeCall { request_id: 1 },
            CallIq::PrepareTransfer { request_id: 1 },
            CallIq::TransferDone { request_id: 1 },
        ];
        let mut names: Vec<_> = messages.iter().map(|m| m.schema()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), messages.len());
    }

    #[test]
    fn test_word_check_serialization() {
        let iq = CallIq::WordCheck {
            request_id: 42,
            result: WordCheckResult {
                word_index: 3,
                ok: true,
            },
        };

        let serialized = serde_json::to_string(&iq).unwrap();
        assert!(serialized.contains("\"type\":\"word-check\""));

        let deserialized: CallIq = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, iq);
        assert_eq!(deserialized.request_id(), 42);
    }

    #[test]
    fn test_streaming_request_round_trip() {
        let iq = CallIq::StreamingRequest {
            request_id: 7,
            ident: 7,
            offset: 0,
            length: 4096,
            player_position: 0,
            timestamp: 123_456,
            last_rtt: 12,
        };

        let serialized = serde_json::to_string(&iq).unwrap();
        let deserialized: CallIq = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, iq);
        assert_eq!(iq.schema(), "call:streaming-request");
        assert_eq!(iq.schema_version(), 2);
    }

    #[test]
    fn test_response_classification() {
        assert!(CallIq::OnPrepareTransfer { request_id: 1 }.is_response());
        assert!(CallIq::CameraResponse {
            request_id: 1,
            error_code: ErrorCode::Success,
            camera_bitmap: 3,
            active_camera: 1,
            min_scale: 1,
            max_scale: 10,
        }
        .is_response());
        assert!(!CallIq::PrepareTransfer { request_id: 1 }.is_response());
        assert!(!CallIq::HoldCall { request_id: 1 }.is_response());
    }

    #[test]
    fn test_streaming_mode_classification() {
        assert!(StreamingControlMode::AskPause.is_ask());
        assert!(StreamingControlMode::AskStop.is_ask());
        assert!(!StreamingControlMode::Pause.is_ask());

        assert!(StreamingControlMode::StatusPlaying.is_status());
        assert!(StreamingControlMode::StatusCompleted.is_status());
        assert!(!StreamingControlMode::Resume.is_status());
    }
}
