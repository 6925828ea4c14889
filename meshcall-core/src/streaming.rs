//! In-call media streaming
//!
//! One participant (the streamer) shares a media item with every connected
//! peer over the call data channels. Content moves with a pull protocol: each
//! player requests bounded chunks and the streamer answers them, so a slow
//! receiver never forces buffering on the others. Control messages
//! (start/pause/resume/seek/stop) flow from the streamer to the players;
//! players send status feedback and can ask the streamer to act, but never
//! change the stream state themselves.

use crate::connection::CallConnection;
use crate::protocol::{CallIq, StreamingControlMode};
use crate::transport::{LinkError, PeerLinkTransport};
use crate::types::{ConnectionId, RequestIds, StreamingEvent, StreamingStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Number of bytes pulled per streaming request
pub const CHUNK_SIZE: i64 = 16 * 1024;

/// Errors of the streaming layer
#[derive(Error, Debug)]
pub enum StreamError {
    /// The media source failed to produce content
    #[error("Media source error: {0}")]
    SourceError(String),

    /// The content cannot be played on this device
    #[error("Unsupported content: {0}")]
    Unsupported(String),

    /// The underlying link failed
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Description of a streamed media item
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    /// Track title
    pub title: String,
    /// Optional album
    pub album: Option<String>,
    /// Optional artist
    pub artist: Option<String>,
    /// Optional artwork bytes
    pub artwork: Option<Vec<u8>>,
    /// Content duration, milliseconds
    pub duration: i64,
    /// Content length in bytes
    pub length: i64,
    /// True for video content
    pub video: bool,
}

/// Content provider for the streamer side
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Metadata of the item
    fn info(&self) -> StreamInfo;

    /// Read up to `length` bytes at `offset`. An empty result means end of
    /// content.
    async fn read(&self, offset: i64, length: i64) -> Result<bytes::Bytes, StreamError>;
}

/// Output of the player side; implemented by the platform media pipeline
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Append a chunk of content at the given offset
    async fn write(&self, offset: i64, data: &[u8]) -> Result<(), StreamError>;

    /// All content was received
    async fn completed(&self);
}

#[derive(Debug)]
struct StreamerCore {
    position: i64,
    paused: bool,
    stopped: bool,
    local_state: PlayerState,
}

/// Sender side of a streaming session, shared with every connected peer
pub struct Streamer {
    ident: i64,
    source: Arc<dyn MediaSource>,
    core: Mutex<StreamerCore>,
}

impl Streamer {
    /// Create a streamer for a media item
    pub fn new(ident: i64, source: Arc<dyn MediaSource>) -> Arc<Self> {
        Arc::new(Self {
            ident,
            source,
            core: Mutex::new(StreamerCore {
                position: 0,
                paused: false,
                stopped: false,
                local_state: PlayerState::Starting,
            }),
        })
    }

    /// Streamed item identifier
    pub fn ident(&self) -> i64 {
        self.ident
    }

    /// Current playback position of the sender, milliseconds
    pub fn position(&self) -> i64 {
        self.core.lock().position
    }

    /// True while the stream is paused for every player
    pub fn is_paused(&self) -> bool {
        self.core.lock().paused
    }

    /// Announce the stream to every capable peer: a start control followed by
    /// the item metadata. Peers that do not support streaming are skipped.
    pub async fn start(&self, connections: &[Arc<CallConnection>]) -> Result<(), StreamError> {
        let info = self.source.info();
        let mode = if info.video {
            StreamingControlMode::StartVideo
        } else {
            StreamingControlMode::StartAudio
        };

        for connection in capable(connections) {
            connection
                .send_streaming_control(self.ident, mode, info.length, 0, 0)
                .await?;
            let request_id = connection.allocate_request_id();
            connection
                .send_iq(CallIq::StreamingInfo {
                    request_id,
                    ident: self.ident,
                    title: info.title.clone(),
                    album: info.album.clone(),
                    artist: info.artist.clone(),
                    artwork: info.artwork.clone(),
                    duration: info.duration,
                })
                .await?;
        }
        tracing::info!(ident = self.ident, video = info.video, "Streaming started");
        Ok(())
    }

    /// Pause the stream for every player. The position paused at is
    /// recorded so a resume or late joiner picks up from there.
    pub async fn pause(&self, connections: &[Arc<CallConnection>]) -> Result<(), StreamError> {
        let position = {
            let mut core = self.core.lock();
            core.paused = true;
            core.position
        };
        self.broadcast(connections, StreamingControlMode::Pause, position)
            .await
    }

    /// Resume the stream for every player
    pub async fn resume(&self, connections: &[Arc<CallConnection>]) -> Result<(), StreamError> {
        let position = {
            let mut core = self.core.lock();
            core.paused = false;
            core.position
        };
        self.broadcast(connections, StreamingControlMode::Resume, position)
            .await
    }

    /// Seek every player to `position` (milliseconds)
    pub async fn seek(
        &self,
        connections: &[Arc<CallConnection>],
        position: i64,
    ) -> Result<(), StreamError> {
        self.core.lock().position = position;
        self.broadcast(connections, StreamingControlMode::Seek, position)
            .await
    }

    /// Stop the stream for every player
    pub async fn stop(&self, connections: &[Arc<CallConnection>]) -> Result<(), StreamError> {
        self.core.lock().stopped = true;
        self.broadcast(connections, StreamingControlMode::Stop, 0)
            .await
    }

    async fn broadcast(
        &self,
        connections: &[Arc<CallConnection>],
        mode: StreamingControlMode,
        position: i64,
    ) -> Result<(), StreamError> {
        let info = self.source.info();
        for connection in capable(connections) {
            connection
                .send_streaming_control(self.ident, mode, info.length, position, 0)
                .await?;
        }
        Ok(())
    }

    /// Answer a pull request from a player with the requested chunk. Requests
    /// for another item or arriving after stop are ignored. The player's
    /// reported position becomes the stream position, so a pause freezes the
    /// stream where playback actually is.
    pub async fn on_streaming_request(
        &self,
        connection: &Arc<CallConnection>,
        request_id: i64,
        ident: i64,
        offset: i64,
        length: i64,
        player_position: i64,
    ) -> Result<(), StreamError> {
        if ident != self.ident || self.core.lock().stopped {
            return Ok(());
        }

        let data = self
            .source
            .read(offset, length.min(CHUNK_SIZE))
            .await?;
        let position = {
            let mut core = self.core.lock();
            if player_position > core.position {
                core.position = player_position;
            }
            core.position
        };
        let data_len = data.len() as i64;
        connection
            .send_iq(CallIq::StreamingData {
                request_id,
                ident: self.ident,
                offset,
                streamer_position: position,
                latency: 0,
                timestamp: chrono::Utc::now().timestamp_millis(),
                data,
                start: 0,
                length: data_len,
            })
            .await?;
        Ok(())
    }

    /// Apply a status feedback message from a player and map it onto the
    /// connection's streaming status
    pub fn on_player_status(
        &self,
        connection: &Arc<CallConnection>,
        mode: StreamingControlMode,
    ) -> Option<StreamingEvent> {
        let (status, event) = match mode {
            StreamingControlMode::StatusPlaying => {
                (StreamingStatus::Playing, Some(StreamingEvent::Playing))
            }
            StreamingControlMode::StatusPaused => {
                (StreamingStatus::Paused, Some(StreamingEvent::Paused))
            }
            StreamingControlMode::StatusReady => (StreamingStatus::Ready, None),
            StreamingControlMode::StatusUnsupported => (
                StreamingStatus::Unsupported,
                Some(StreamingEvent::Unsupported),
            ),
            StreamingControlMode::StatusError => (StreamingStatus::Error, Some(StreamingEvent::Error)),
            StreamingControlMode::StatusStopped => (StreamingStatus::Ready, Some(StreamingEvent::Stop)),
            StreamingControlMode::StatusCompleted => {
                (StreamingStatus::Ready, Some(StreamingEvent::Completed))
            }
            _ => return None,
        };
        connection.update_streaming_status(status);
        event
    }

    /// Honor an ask operation from a player by applying the corresponding
    /// stream-wide control
    pub async fn on_ask(
        &self,
        connections: &[Arc<CallConnection>],
        mode: StreamingControlMode,
        position: i64,
    ) -> Result<(), StreamError> {
        match mode {
            StreamingControlMode::AskPause => {
                // Freeze at the asker's playback position when it reported one
                if position > 0 {
                    self.core.lock().position = position;
                }
                self.pause(connections).await
            }
            StreamingControlMode::AskResume => self.resume(connections).await,
            StreamingControlMode::AskSeek => self.seek(connections, position).await,
            StreamingControlMode::AskStop => self.stop(connections).await,
            _ => Ok(()),
        }
    }

    /// Playback state of the sender's own monitoring player
    pub fn local_player_state(&self) -> PlayerState {
        self.core.lock().local_state
    }

    /// Report the state of the local player monitoring the stream on the
    /// sender's device. A playback error there cannot be recovered from, so
    /// the whole session is stopped for every player. Returns true when the
    /// stream was stopped.
    pub async fn update_local_player(
        &self,
        connections: &[Arc<CallConnection>],
        mode: StreamingControlMode,
    ) -> Result<bool, StreamError> {
        let state = match mode {
            StreamingControlMode::StatusPlaying => PlayerState::Playing,
            StreamingControlMode::StatusPaused => PlayerState::Paused,
            StreamingControlMode::StatusCompleted => PlayerState::Completed,
            StreamingControlMode::StatusStopped => PlayerState::Stopped,
            StreamingControlMode::StatusUnsupported => PlayerState::Unsupported,
            StreamingControlMode::StatusError => PlayerState::Error,
            _ => return Ok(false),
        };
        self.core.lock().local_state = state;
        if matches!(state, PlayerState::Error | PlayerState::Unsupported) {
            tracing::warn!(ident = self.ident, state = ?state, "Local playback failed, stopping the stream");
            self.stop(connections).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn capable(connections: &[Arc<CallConnection>]) -> impl Iterator<Item = &Arc<CallConnection>> {
    connections
        .iter()
        .filter(|c| c.streaming_status().is_supported())
}

/// Playback state of the receiver side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Waiting for the first chunk
    Starting,
    /// Receiving and playing
    Playing,
    /// Paused by the streamer
    Paused,
    /// Stopped; no more requests will be sent
    Stopped,
    /// All content received
    Completed,
    /// Playback failed; no more requests will be sent
    Error,
    /// The content cannot be played on this device
    Unsupported,
}

#[derive(Debug)]
struct PlayerCore {
    state: PlayerState,
    position: i64,
    length: i64,
    received: i64,
    pending_request: Option<i64>,
}

/// Receiver side of a streaming session, one per streaming peer
pub struct StreamPlayer {
    ident: i64,
    video: bool,
    connection_id: ConnectionId,
    transport: Arc<dyn PeerLinkTransport>,
    request_ids: RequestIds,
    core: Mutex<PlayerCore>,
    sink: Mutex<Option<Arc<dyn MediaSink>>>,
    info: Mutex<Option<StreamInfo>>,
}

impl StreamPlayer {
    /// Create a player for an announced stream
    pub fn new(
        ident: i64,
        video: bool,
        length: i64,
        connection_id: ConnectionId,
        transport: Arc<dyn PeerLinkTransport>,
        request_ids: RequestIds,
    ) -> Arc<Self> {
        Arc::new(Self {
            ident,
            video,
            connection_id,
            transport,
            request_ids,
            core: Mutex::new(PlayerCore {
                state: PlayerState::Starting,
                position: 0,
                length,
                received: 0,
                pending_request: None,
            }),
            sink: Mutex::new(None),
            info: Mutex::new(None),
        })
    }

    /// Streamed item identifier
    pub fn ident(&self) -> i64 {
        self.ident
    }

    /// True for video content
    pub fn is_video(&self) -> bool {
        self.video
    }

    /// Current playback state
    pub fn state(&self) -> PlayerState {
        self.core.lock().state
    }

    /// Receiver playback position, milliseconds
    pub fn position(&self) -> i64 {
        self.core.lock().position
    }

    /// Content length announced by the streamer, bytes
    pub fn length(&self) -> i64 {
        self.core.lock().length
    }

    /// Attach the platform media sink
    pub fn set_sink(&self, sink: Arc<dyn MediaSink>) {
        *self.sink.lock() = Some(sink);
    }

    /// Metadata of the streamed item, once announced by the streamer
    pub fn info(&self) -> Option<StreamInfo> {
        self.info.lock().clone()
    }

    pub(crate) fn set_info(&self, info: StreamInfo) {
        *self.info.lock() = Some(info);
    }

    /// Pull the next chunk from the streamer. No-op while a request is
    /// outstanding or after stop.
    pub async fn request_next_chunk(&self) -> Result<(), StreamError> {
        let (request_id, offset, position) = {
            let mut core = self.core.lock();
            if core.pending_request.is_some()
                || matches!(
                    core.state,
                    PlayerState::Stopped
                        | PlayerState::Completed
                        | PlayerState::Error
                        | PlayerState::Unsupported
                )
            {
                return Ok(());
            }
            let request_id = self.request_ids.next();
            core.pending_request = Some(request_id);
            (request_id, core.received, core.position)
        };

        self.transport
            .send_iq(
                self.connection_id,
                CallIq::StreamingRequest {
                    request_id,
                    ident: self.ident,
                    offset,
                    length: CHUNK_SIZE,
                    player_position: position,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    last_rtt: 0,
                },
            )
            .await?;
        Ok(())
    }

    /// Feed a data chunk received from the streamer. Chunks whose request id
    /// matches no outstanding request are duplicates or stale and are
    /// dropped without side effects. Returns the event to publish, if any.
    pub async fn on_streaming_data(
        &self,
        request_id: i64,
        offset: i64,
        data: &[u8],
        start: i64,
        length: i64,
    ) -> Result<Option<StreamingEvent>, StreamError> {
        let (first, completed) = {
            let mut core = self.core.lock();
            if core.pending_request != Some(request_id) {
                return Ok(None);
            }
            core.pending_request = None;
            core.received = offset + length;
            let first = core.state == PlayerState::Starting;
            if first {
                core.state = PlayerState::Playing;
            }
            let completed = length == 0 || (core.length > 0 && core.received >= core.length);
            if completed {
                core.state = PlayerState::Completed;
            }
            (first, completed)
        };

        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            let end = (start + length) as usize;
            let begin = start as usize;
            if begin < end && end <= data.len() {
                if let Err(e) = sink.write(offset, &data[begin..end]).await {
                    tracing::warn!(ident = self.ident, error = %e, "Media sink failed");
                    self.core.lock().state = PlayerState::Error;
                    self.send_status(StreamingControlMode::StatusError).await?;
                    return Ok(Some(StreamingEvent::Error));
                }
            }
            if completed {
                sink.completed().await;
            }
        }

        if completed {
            self.send_status(StreamingControlMode::StatusCompleted).await?;
            Ok(Some(StreamingEvent::Completed))
        } else {
            self.request_next_chunk().await?;
            if first {
                self.send_status(StreamingControlMode::StatusPlaying).await?;
                Ok(Some(StreamingEvent::Playing))
            } else {
                Ok(None)
            }
        }
    }

    /// Apply a control message from the streamer. Returns the event to
    /// publish, if any.
    pub async fn on_control(
        &self,
        mode: StreamingControlMode,
        position: i64,
    ) -> Result<Option<StreamingEvent>, StreamError> {
        match mode {
            StreamingControlMode::Pause => {
                self.core.lock().state = PlayerState::Paused;
                self.send_status(StreamingControlMode::StatusPaused).await?;
                Ok(Some(StreamingEvent::Paused))
            }
            StreamingControlMode::Resume => {
                self.core.lock().state = PlayerState::Playing;
                self.send_status(StreamingControlMode::StatusPlaying).await?;
                self.request_next_chunk().await?;
                Ok(Some(StreamingEvent::Playing))
            }
            StreamingControlMode::Seek => {
                self.core.lock().position = position;
                Ok(None)
            }
            StreamingControlMode::Stop => {
                self.stop(false).await;
                Ok(Some(StreamingEvent::Stop))
            }
            _ => Ok(None),
        }
    }

    /// Ask the streamer to pause the stream for everyone
    pub async fn ask_pause(&self) -> Result<(), StreamError> {
        self.send_ask(StreamingControlMode::AskPause, 0).await
    }

    /// Ask the streamer to resume the stream
    pub async fn ask_resume(&self) -> Result<(), StreamError> {
        self.send_ask(StreamingControlMode::AskResume, 0).await
    }

    /// Ask the streamer to seek the stream
    pub async fn ask_seek(&self, position: i64) -> Result<(), StreamError> {
        self.send_ask(StreamingControlMode::AskSeek, position).await
    }

    /// Ask the streamer to stop the stream for everyone
    pub async fn ask_stop(&self) -> Result<(), StreamError> {
        self.send_ask(StreamingControlMode::AskStop, 0).await
    }

    /// The platform cannot play this content. The streamer is told so it
    /// stops producing for this connection; no more chunks are requested.
    pub async fn report_unsupported(&self) -> Result<(), StreamError> {
        {
            let mut core = self.core.lock();
            core.state = PlayerState::Unsupported;
            core.pending_request = None;
        }
        self.send_status(StreamingControlMode::StatusUnsupported)
            .await
    }

    /// Stop the player. When `notify` is set the streamer is told so it can
    /// stop producing for this connection.
    pub async fn stop(&self, notify: bool) {
        {
            let mut core = self.core.lock();
            if core.state == PlayerState::Stopped {
                return;
            }
            core.state = PlayerState::Stopped;
            core.pending_request = None;
        }
        if notify {
            if let Err(e) = self.send_status(StreamingControlMode::StatusStopped).await {
                tracing::debug!(ident = self.ident, error = %e, "Stop notification failed");
            }
        }
    }

    async fn send_status(&self, mode: StreamingControlMode) -> Result<(), StreamError> {
        let (position, length) = {
            let core = self.core.lock();
            (core.position, core.length)
        };
        self.transport
            .send_iq(
                self.connection_id,
                CallIq::StreamingControl {
                    request_id: self.request_ids.next(),
                    ident: self.ident,
                    mode,
                    length,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    position,
                    latency: 0,
                },
            )
            .await?;
        Ok(())
    }

    async fn send_ask(&self, mode: StreamingControlMode, position: i64) -> Result<(), StreamError> {
        let length = self.core.lock().length;
        self.transport
            .send_iq(
                self.connection_id,
                CallIq::StreamingControl {
                    request_id: self.request_ids.next(),
                    ident: self.ident,
                    mode,
                    length,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    position,
                    latency: 0,
                },
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for StreamPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPlayer")
            .field("ident", &self.ident)
            .field("connection_id", &self.connection_id)
            .field("state", &self.core.lock().state)
            .finish()
    }
}
