//! Streaming tests: announcement to capable peers, the pull protocol, ask
//! operations and player status feedback.

mod common;

use async_trait::async_trait;
use common::{build_service, next_event, RecordingTransport};
use meshcall_core::{
    CallConfig, CallEvent, CallIq, CallService, ConnectionId, LinkState, MediaSource, PeerVersion,
    StreamError, StreamInfo, StreamingControlMode, StreamingEvent,
};
use std::sync::Arc;
use uuid::Uuid;

struct StaticSource {
    content: Vec<u8>,
}

#[async_trait]
impl MediaSource for StaticSource {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            title: "summer mix".to_string(),
            length: self.content.len() as i64,
            duration: 30_000,
            video: false,
            ..Default::default()
        }
    }

    async fn read(&self, offset: i64, length: i64) -> Result<bytes::Bytes, StreamError> {
        let begin = (offset as usize).min(self.content.len());
        let end = (begin + length as usize).min(self.content.len());
        Ok(bytes::Bytes::copy_from_slice(&self.content[begin..end]))
    }
}

async fn connected_call(
    service: &Arc<CallService>,
    transport: &Arc<RecordingTransport>,
) -> anyhow::Result<ConnectionId> {
    service.initiate_call(Uuid::new_v4(), false).await?;
    let connection_id = transport.outgoing_links.lock()[0].0;
    service.on_session_accept(connection_id).await?;
    service
        .on_link_state(connection_id, LinkState::Connected)
        .await?;
    service
        .on_peer_version(connection_id, PeerVersion::new(2, 2))
        .await?;
    Ok(connection_id)
}

#[tokio::test]
async fn test_start_streaming_announces_and_serves_chunks() -> anyhow::Result<()> {
    let (service, transport, _) = build_service(CallConfig::default());
    let connection_id = connected_call(&service, &transport).await?;

    let mut events = service.subscribe();
    service
        .start_streaming(5, Arc::new(StaticSource { content: (0..40).collect() }))
        .await?;

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        CallEvent::Streaming {
            participant_id: None,
            event: StreamingEvent::Start,
            ..
        }
    ));
    assert_eq!(
        transport.sent_matching(|iq| matches!(
            iq,
            CallIq::StreamingControl {
                mode: StreamingControlMode::StartAudio,
                ..
            }
        )),
        1
    );
    assert_eq!(
        transport.sent_matching(|iq| matches!(iq, CallIq::StreamingInfo { .. })),
        1
    );

    // A player pulls a chunk and gets the exact bytes back
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingRequest {
                request_id: 77,
                ident: 5,
                offset: 8,
                length: 16,
                player_position: 0,
                timestamp: 0,
                last_rtt: 0,
            },
        )
        .await?;
    let Some(CallIq::StreamingData {
        request_id,
        offset,
        data,
        length,
        ..
    }) = transport.last_sent(|iq| matches!(iq, CallIq::StreamingData { .. }))
    else {
        panic!("expected a streaming-data answer");
    };
    assert_eq!(request_id, 77);
    assert_eq!(offset, 8);
    assert_eq!(length, 16);
    assert_eq!(data.as_ref(), (8..24u8).collect::<Vec<_>>().as_slice());
    Ok(())
}

#[tokio::test]
async fn test_ask_pause_pauses_the_stream() -> anyhow::Result<()> {
    let (service, transport, _) = build_service(CallConfig::default());
    let connection_id = connected_call(&service, &transport).await?;
    service
        .start_streaming(5, Arc::new(StaticSource { content: vec![0; 16] }))
        .await?;

    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingControl {
                request_id: 1,
                ident: 5,
                mode: StreamingControlMode::AskPause,
                length: 0,
                timestamp: 0,
                position: 0,
                latency: 0,
            },
        )
        .await?;

    assert_eq!(
        transport.sent_matching(|iq| matches!(
            iq,
            CallIq::StreamingControl {
                mode: StreamingControlMode::Pause,
                ..
            }
        )),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_player_status_feedback_raises_events() -> anyhow::Result<()> {
    let (service, transport, _) = build_service(CallConfig::default());
    let connection_id = connected_call(&service, &transport).await?;
    service
        .start_streaming(5, Arc::new(StaticSource { content: vec![0; 16] }))
        .await?;

    let mut events = service.subscribe();
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingControl {
                request_id: 2,
                ident: 5,
                mode: StreamingControlMode::StatusPlaying,
                length: 0,
                timestamp: 0,
                position: 0,
                latency: 0,
            },
        )
        .await?;

    let event = next_event(&mut events).await;
    let CallEvent::Streaming {
        participant_id,
        event,
        ..
    } = event
    else {
        panic!("expected a streaming event");
    };
    assert!(participant_id.is_some());
    assert_eq!(event, StreamingEvent::Playing);
    Ok(())
}

#[tokio::test]
async fn test_local_player_failure_stops_the_session() -> anyhow::Result<()> {
    let (service, transport, _) = build_service(CallConfig::default());
    let connection_id = connected_call(&service, &transport).await?;
    service
        .start_streaming(5, Arc::new(StaticSource { content: vec![0; 16] }))
        .await?;

    let mut events = service.subscribe();
    // Our own monitoring player keeps the session alive while healthy
    service
        .update_local_player(StreamingControlMode::StatusPlaying)
        .await?;
    assert_eq!(
        transport.sent_matching(|iq| matches!(
            iq,
            CallIq::StreamingControl {
                mode: StreamingControlMode::Stop,
                ..
            }
        )),
        0
    );

    service
        .update_local_player(StreamingControlMode::StatusError)
        .await?;
    assert_eq!(
        transport.sent_matching(|iq| matches!(
            iq,
            CallIq::StreamingControl {
                mode: StreamingControlMode::Stop,
                ..
            }
        )),
        1
    );
    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        CallEvent::Streaming {
            participant_id: None,
            event: StreamingEvent::Stop,
            ..
        }
    ));

    // The session is gone; the streamer no longer answers pulls
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingRequest {
                request_id: 80,
                ident: 5,
                offset: 0,
                length: 16,
                player_position: 0,
                timestamp: 0,
                last_rtt: 0,
            },
        )
        .await?;
    assert_eq!(
        transport.sent_matching(|iq| matches!(iq, CallIq::StreamingData { .. })),
        0
    );
    Ok(())
}

#[tokio::test]
async fn test_announced_metadata_is_kept_for_the_player() -> anyhow::Result<()> {
    let (service, transport, _) = build_service(CallConfig::default());
    let connection_id = connected_call(&service, &transport).await?;

    // The peer starts streaming to us
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingControl {
                request_id: 1,
                ident: 9,
                mode: StreamingControlMode::StartAudio,
                length: 64,
                timestamp: 0,
                position: 0,
                latency: 0,
            },
        )
        .await?;
    assert!(service.streaming_info().await.is_none());

    // Metadata for another item is not ours
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingInfo {
                request_id: 2,
                ident: 12,
                title: "wrong".to_string(),
                album: None,
                artist: None,
                artwork: None,
                duration: 1,
            },
        )
        .await?;
    assert!(service.streaming_info().await.is_none());

    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingInfo {
                request_id: 3,
                ident: 9,
                title: "summer mix".to_string(),
                album: Some("singles".to_string()),
                artist: Some("the band".to_string()),
                artwork: None,
                duration: 30_000,
            },
        )
        .await?;

    let info = service.streaming_info().await.unwrap();
    assert_eq!(info.title, "summer mix");
    assert_eq!(info.album.as_deref(), Some("singles"));
    assert_eq!(info.length, 64);
    Ok(())
}

#[tokio::test]
async fn test_receiver_pulls_until_completed() -> anyhow::Result<()> {
    let (service, transport, _) = build_service(CallConfig::default());
    let connection_id = connected_call(&service, &transport).await?;

    let mut events = service.subscribe();
    // The peer starts streaming a 4-byte item to us
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingControl {
                request_id: 1,
                ident: 9,
                mode: StreamingControlMode::StartAudio,
                length: 4,
                timestamp: 0,
                position: 0,
                latency: 0,
            },
        )
        .await?;
    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        CallEvent::Streaming {
            event: StreamingEvent::Start,
            ..
        }
    ));

    // Our player asked for the first chunk
    let Some(CallIq::StreamingRequest {
        request_id, ident, ..
    }) = transport.last_sent(|iq| matches!(iq, CallIq::StreamingRequest { .. }))
    else {
        panic!("expected a streaming-request");
    };
    assert_eq!(ident, 9);

    // A chunk with a stale request id is dropped without side effects
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingData {
                request_id: request_id + 1000,
                ident: 9,
                offset: 0,
                streamer_position: 0,
                latency: 0,
                timestamp: 0,
                data: bytes::Bytes::from_static(b"junk"),
                start: 0,
                length: 4,
            },
        )
        .await?;
    assert_eq!(
        transport.sent_matching(|iq| matches!(
            iq,
            CallIq::StreamingControl {
                mode: StreamingControlMode::StatusCompleted,
                ..
            }
        )),
        0
    );

    // The real chunk completes the item
    service
        .on_incoming_iq(
            connection_id,
            CallIq::StreamingData {
                request_id,
                ident: 9,
                offset: 0,
                streamer_position: 0,
                latency: 0,
                timestamp: 0,
                data: bytes::Bytes::from_static(b"data"),
                start: 0,
                length: 4,
            },
        )
        .await?;
    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        CallEvent::Streaming {
            event: StreamingEvent::Completed,
            ..
        }
    ));
    assert_eq!(
        transport.sent_matching(|iq| matches!(
            iq,
            CallIq::StreamingControl {
                mode: StreamingControlMode::StatusCompleted,
                ..
            }
        )),
        1
    );
    Ok(())
}
