//! Core call orchestration engine for P2P audio/video calls
//!
//! This crate drives the lifecycle of 1:1 and group calls on top of a
//! pluggable peer link transport: connection setup as a set of concurrent
//! idempotent operations, call room membership for group calls, hold and
//! resume, device-to-device call transfer, in-call key verification and
//! media streaming between participants.
//!
//! # Example
//!
//! ```no_run
//! use meshcall_core::{CallServiceBuilder, CallConfig};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     transport: Arc<dyn meshcall_core::PeerLinkTransport>,
//! #     rooms: Arc<dyn meshcall_core::CallRoomService>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let service = CallServiceBuilder::new()
//!     .with_config(CallConfig::default())
//!     .with_transport(transport)
//!     .with_rooms(rooms)
//!     .build()?;
//! service.start();
//!
//! let mut events = service.subscribe();
//! let call_id = service.initiate_call(uuid::Uuid::new_v4(), false).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::significant_drop_tightening)]

pub mod call;
pub mod connection;
pub mod keycheck;
pub mod operations;
pub mod participant;
pub mod protocol;
pub mod service;
pub mod streaming;
pub mod transport;
pub mod types;

pub use call::{CallError, CallState, LocalIdentity};
pub use connection::CallConnection;
pub use keycheck::{KeyCheckError, KeyCheckSession, KeyCheckVerdict, WordChallenge};
pub use operations::{Operation, OperationSet};
pub use participant::{CallParticipant, CameraControlState, VideoRenderer};
pub use protocol::{CallIq, CameraControlMode, StreamingControlMode, WordCheckResult};
pub use service::{CallConfig, CallService, CallServiceBuilder, ServiceError};
pub use streaming::{
    MediaSink, MediaSource, PlayerState, StreamError, StreamInfo, StreamPlayer, Streamer,
};
pub use transport::{CallRoomService, LinkError, PeerLinkTransport, PeerVersion};
pub use types::{
    CallEvent, CallId, CallRoomId, CallStatus, ConnectionId, ConnectionUpdate, ErrorCode,
    Geolocation, LinkState, MediaDirection, MemberId, ParticipantEvent, ParticipantId,
    RequestIds, StreamingEvent, StreamingStatus, Support, TerminateReason, TrackKind,
    TransferDirection,
};

/// Commonly used types for working with the call engine
pub mod prelude {
    pub use crate::service::{CallConfig, CallService, CallServiceBuilder, ServiceError};
    pub use crate::transport::{CallRoomService, PeerLinkTransport};
    pub use crate::types::{
        CallEvent, CallId, CallStatus, ConnectionId, LinkState, TerminateReason,
    };
}
