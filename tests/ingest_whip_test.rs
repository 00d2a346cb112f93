//! Publishing through the real HTTP client and str0m peer against the local
//! ingest sink.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use livecast_rtc::{
    media::synthetic::SyntheticDevices,
    model::tracks::{MediaTrack, TrackKind},
    peer::{
        rtc::{RtcPeer, RtcPeerFactory},
        PeerConnection, PeerSettings,
    },
    server::{self, IngestConfig, IngestHandle},
    whip::{HttpWhipClient, WhipSignaling},
    BroadcastError, LinkState, Phase, PublisherConfig, StreamDescriptor,
    StreamingSessionCoordinator,
};

const TOKEN: &str = "secret-jwt";

fn sink() -> IngestHandle {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    server::start(IngestConfig {
        bind: SocketAddr::new(loopback, 0),
        media_ip: Some(loopback),
        token: Some(TOKEN.to_string()),
    })
    .unwrap()
}

fn client() -> HttpWhipClient {
    HttpWhipClient::new(Duration::from_secs(5)).unwrap()
}

fn video_peer() -> RtcPeer {
    let settings = PeerSettings::from_config(&PublisherConfig::default(), "1");
    let mut peer = RtcPeer::new(&settings).unwrap();
    peer.add_send_transceiver(&MediaTrack::new(TrackKind::Video, "test"))
        .unwrap();
    peer
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_token_is_rejected() {
    let sink = sink();
    let mut peer = video_peer();
    let offer = peer.create_offer().unwrap();

    let err = client()
        .publish(&sink.whip_url(1), "not-the-token", &offer)
        .await
        .unwrap_err();
    assert!(matches!(err, BroadcastError::AuthRejected(_)));
    assert_eq!(sink.stats().published.load(Ordering::Relaxed), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn offer_is_answered_and_resource_released() {
    let sink = sink();
    let whip = client();
    let mut peer = video_peer();
    let offer = peer.create_offer().unwrap();

    let answer = whip.publish(&sink.whip_url(1), TOKEN, &offer).await.unwrap();
    peer.set_remote_answer(&answer.sdp).unwrap();

    let resource = answer.resource_url.unwrap();
    assert!(resource.starts_with(&format!("http://127.0.0.1:{}/stream/1/whip/r", sink.addr().port())));
    assert_eq!(sink.stats().published.load(Ordering::Relaxed), 1);

    whip.terminate(&resource, TOKEN).await.unwrap();
    // Already released counts as success.
    whip.terminate(&resource, TOKEN).await.unwrap();
    peer.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_goes_live_against_the_sink() {
    let sink = sink();
    let config = PublisherConfig {
        whip_port: sink.addr().port(),
        ..PublisherConfig::default()
    };
    let descriptor = StreamDescriptor {
        stream_id: 3,
        stream_url: "127.0.0.1:1935".to_string(),
        mediamtx_jwt: TOKEN.to_string(),
    };

    let mut coordinator = StreamingSessionCoordinator::new(
        Arc::new(SyntheticDevices::new().with_frames()),
        RtcPeerFactory,
        Arc::new(client()),
        config,
    );
    coordinator.select_camera();
    coordinator.process_next().await;
    coordinator.go_live(&descriptor).await.unwrap();
    assert_eq!(coordinator.phase(), Phase::Live);

    let session = coordinator.sessions().session().unwrap();
    assert!(session.resource_url().unwrap().contains("/stream/3/whip/r"));
    assert_eq!(sink.stats().published.load(Ordering::Relaxed), 1);

    tokio::time::timeout(Duration::from_secs(10), async {
        while coordinator.status().link == Some(LinkState::Connecting) {
            assert!(coordinator.process_next().await);
        }
    })
    .await
    .expect("link never left connecting");
    let status = coordinator.status();
    assert_eq!(status.link, Some(LinkState::Connected));
    assert_eq!(status.phase, Phase::Live);

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.stats().frames.load(Ordering::Relaxed) == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no media reached the sink");

    coordinator.release_source().await;
    assert_eq!(coordinator.phase(), Phase::NoSource);
}
