//! str0m-backed peer connection
//!
//! str0m is sans-IO: a driver task owns the UDP socket, feeds received
//! datagrams and timeouts into the shared [`Rtc`], and flushes its output.
//! Each sender gets a pump task that forwards frames from whichever track
//! is currently attached to the sender's media line, so replacing a track
//! never touches SDP.

use std::{
    net::UdpSocket as StdUdpSocket,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use str0m::{
    bwe::Bitrate,
    change::{SdpAnswer, SdpPendingOffer},
    format::Codec,
    media::{Direction, MediaKind, MediaTime, Mid},
    net::{Protocol, Receive},
    Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::{
    net::UdpSocket,
    runtime::Handle,
    sync::{broadcast::error::RecvError, watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{BroadcastError, Result},
    model::tracks::{MediaFrame, MediaTrack, TrackKind},
    peer::{
        ConnectionState, PeerConnection, PeerConnectionFactory, PeerSettings, SendParameters,
        SenderId, StateProbe,
    },
    util::host_candidates,
};

/// Initial bandwidth estimate before any feedback arrives.
const INITIAL_BITRATE_BPS: u64 = 1_000_000;

/// Creates [`RtcPeer`]s. Must be used from within a tokio runtime.
///
/// Only host candidates are gathered: `PeerSettings::ice_servers` is logged
/// but no STUN or TURN server is contacted, so the ingest endpoint has to be
/// reachable from a local interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcPeerFactory;

impl PeerConnectionFactory for RtcPeerFactory {
    type Peer = RtcPeer;

    fn create(&self, settings: &PeerSettings) -> Result<RtcPeer> {
        RtcPeer::new(settings)
    }
}

struct Shared {
    rtc: Mutex<Rtc>,
    wake: Notify,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Rtc>> {
        self.rtc
            .lock()
            .map_err(|_| BroadcastError::TransportError("peer connection state poisoned".into()))
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            let allowed = match (*current, next) {
                (a, b) if a == b => false,
                (ConnectionState::Closed, _) => false,
                (ConnectionState::Failed, b) => b == ConnectionState::Closed,
                (ConnectionState::Connected, ConnectionState::Connecting) => false,
                _ => true,
            };
            if allowed {
                debug!("Peer connection state {} -> {}", current, next);
                *current = next;
            }
            allowed
        });
    }

    /// Flush transmits and events. Returns the next timeout, or `None` once
    /// the connection is dead.
    fn drain(&self, socket: &UdpSocket) -> Option<Instant> {
        let mut rtc = self.rtc.lock().ok()?;
        loop {
            if !rtc.is_alive() {
                drop(rtc);
                self.set_state(ConnectionState::Failed);
                return None;
            }

            match rtc.poll_output() {
                Ok(Output::Timeout(t)) => return Some(t),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = socket.try_send_to(&transmit.contents, transmit.destination) {
                        debug!("Dropped datagram to {}: {}", transmit.destination, e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(&mut rtc, event),
                Err(e) => {
                    warn!("Peer connection poll_output failed: {:?}", e);
                    rtc.disconnect();
                    drop(rtc);
                    self.set_state(ConnectionState::Failed);
                    return None;
                }
            }
        }
    }

    fn handle_event(&self, rtc: &mut Rtc, event: Event) {
        match event {
            Event::Connected => {
                info!("Peer connection established");
                self.set_state(ConnectionState::Connected);
            }
            Event::IceConnectionStateChange(state) => {
                info!("ICE connection state: {:?}", state);
                match state {
                    IceConnectionState::New => {}
                    IceConnectionState::Checking => self.set_state(ConnectionState::Connecting),
                    // DTLS still has to complete; `Event::Connected` follows.
                    IceConnectionState::Connected | IceConnectionState::Completed => {}
                    IceConnectionState::Disconnected => {
                        // No ICE restart for a publish-only client.
                        rtc.disconnect();
                        self.set_state(ConnectionState::Failed);
                    }
                }
            }
            other => debug!("Peer event: {:?}", other),
        }
    }

    fn handle_input(&self, input: Input) {
        let Ok(mut rtc) = self.rtc.lock() else {
            return;
        };
        if !rtc.is_alive() {
            return;
        }
        if let Err(e) = rtc.handle_input(input) {
            warn!("Peer connection input failed: {:?}", e);
            rtc.disconnect();
        }
    }

    fn write(&self, mid: Mid, preferred: Option<Codec>, frame: &MediaFrame) {
        {
            let Ok(mut rtc) = self.rtc.lock() else {
                return;
            };
            let Some(writer) = rtc.writer(mid) else {
                return;
            };

            let chosen = writer
                .payload_params()
                .find(|p| preferred.map(|c| p.spec().codec == c).unwrap_or(true))
                .or_else(|| writer.payload_params().next())
                .map(|p| (p.pt(), p.spec().clock_rate));
            let Some((pt, clock_rate)) = chosen else {
                return;
            };

            let rtp_time = MediaTime::new(frame.rtp_time, clock_rate);
            if let Err(e) = writer.write(pt, frame.captured_at, rtp_time, frame.data.to_vec()) {
                debug!("Frame for {:?} not written: {:?}", mid, e);
            }
        }
        self.wake.notify_one();
    }
}

/// Which media line a sender writes to, and which track feeds it.
#[derive(Clone, Default)]
struct Route {
    mid: Option<Mid>,
    track: Option<MediaTrack>,
}

struct SenderSlot {
    kind: TrackKind,
    mid: Option<Mid>,
    params: SendParameters,
    route: watch::Sender<Route>,
    pump: JoinHandle<()>,
}

pub struct RtcPeer {
    shared: Arc<Shared>,
    senders: Vec<SenderSlot>,
    pending: Option<SdpPendingOffer>,
    runtime: Handle,
    driver: JoinHandle<()>,
    video_codec: Option<Codec>,
    stream_label: String,
}

impl RtcPeer {
    pub fn new(settings: &PeerSettings) -> Result<RtcPeer> {
        let runtime = Handle::try_current().map_err(|_| {
            BroadcastError::TransportError("peer connection needs a tokio runtime".into())
        })?;
        let _entered = runtime.enter();

        let video_codec = codec_from_name(&settings.preferred_video_codec);
        let mut rtc = build_rtc(video_codec);

        let socket = StdUdpSocket::bind("0.0.0.0:0")
            .map_err(|e| BroadcastError::TransportError(format!("binding UDP socket: {e}")))?;
        for candidate in host_candidates(&socket) {
            rtc.add_local_candidate(candidate);
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| BroadcastError::TransportError(e.to_string()))?;
        let socket = UdpSocket::from_std(socket)
            .map_err(|e| BroadcastError::TransportError(e.to_string()))?;

        // str0m gathers host candidates only; STUN servers are not queried.
        debug!(
            "Peer settings: ice servers {:?}, bundle {:?}",
            settings.ice_servers, settings.bundle_policy
        );

        let (state, _) = watch::channel(ConnectionState::New);
        let shared = Arc::new(Shared {
            rtc: Mutex::new(rtc),
            wake: Notify::new(),
            state,
        });

        let driver = runtime.spawn(drive(shared.clone(), socket));

        Ok(RtcPeer {
            shared,
            senders: vec![],
            pending: None,
            runtime,
            driver,
            video_codec,
            stream_label: settings.stream_label.clone(),
        })
    }

    fn slot(&self, sender: SenderId) -> Result<&SenderSlot> {
        self.senders
            .get(sender.0)
            .ok_or_else(|| BroadcastError::SourceMismatch(format!("unknown sender {:?}", sender)))
    }

    fn apply_bitrate(&self) -> Result<()> {
        let total: u64 = self
            .senders
            .iter()
            .filter_map(|s| s.params.max_bitrate_bps)
            .sum();
        if total == 0 {
            return Ok(());
        }
        let mut rtc = self.shared.lock()?;
        rtc.bwe().set_desired_bitrate(Bitrate::bps(total));
        Ok(())
    }
}

impl PeerConnection for RtcPeer {
    fn add_send_transceiver(&mut self, track: &MediaTrack) -> Result<SenderId> {
        let id = SenderId(self.senders.len());
        let kind = track.kind();
        let preferred = match kind {
            TrackKind::Video => self.video_codec,
            TrackKind::Audio => Some(Codec::Opus),
        };

        let (route, rx) = watch::channel(Route {
            mid: None,
            track: Some(track.clone()),
        });
        let pump = self.runtime.spawn(pump(self.shared.clone(), preferred, rx));

        self.senders.push(SenderSlot {
            kind,
            mid: None,
            params: SendParameters::default(),
            route,
            pump,
        });
        Ok(id)
    }

    fn set_codec_preferences(&mut self, _sender: SenderId, codec: &str) -> bool {
        // Codec order is fixed when the Rtc is built; see `build_rtc`.
        debug!("Transceiver codec preference for {} not available", codec);
        false
    }

    fn create_offer(&mut self) -> Result<String> {
        let mut rtc = self.shared.lock()?;
        let mut change = rtc.sdp_api();

        for slot in self.senders.iter_mut().filter(|s| s.mid.is_none()) {
            let mid = change.add_media(
                media_kind(slot.kind),
                Direction::SendOnly,
                Some(self.stream_label.clone()),
                None,
                None,
            );
            slot.mid = Some(mid);
        }

        let Some((offer, pending)) = change.apply() else {
            return Err(BroadcastError::NegotiationFailed(
                "no media to negotiate".into(),
            ));
        };
        drop(rtc);

        for slot in &self.senders {
            let mid = slot.mid;
            slot.route.send_modify(|r| r.mid = mid);
        }
        self.pending = Some(pending);
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.wake.notify_one();

        Ok(offer.to_sdp_string())
    }

    fn set_remote_answer(&mut self, sdp: &str) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| BroadcastError::NegotiationFailed("no offer pending".into()))?;
        let answer = SdpAnswer::from_sdp_string(sdp)
            .map_err(|e| BroadcastError::NegotiationFailed(format!("invalid answer: {e:?}")))?;

        self.shared
            .lock()?
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| BroadcastError::NegotiationFailed(format!("answer rejected: {e:?}")))?;

        self.shared.wake.notify_one();
        Ok(())
    }

    fn replace_track(&mut self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        let slot = self.slot(sender)?;
        if slot.kind != track.kind() {
            return Err(BroadcastError::SourceMismatch(format!(
                "sender carries {}, track is {}",
                slot.kind,
                track.kind()
            )));
        }
        slot.route.send_modify(|r| r.track = Some(track.clone()));
        Ok(())
    }

    fn sender_kind(&self, sender: SenderId) -> Option<TrackKind> {
        self.senders.get(sender.0).map(|s| s.kind)
    }

    fn parameters(&self, sender: SenderId) -> Option<SendParameters> {
        self.senders.get(sender.0).map(|s| s.params.clone())
    }

    fn set_parameters(&mut self, sender: SenderId, params: SendParameters) -> Result<()> {
        let slot = self
            .senders
            .get_mut(sender.0)
            .ok_or_else(|| BroadcastError::SourceMismatch(format!("unknown sender {:?}", sender)))?;
        slot.params = params;
        self.apply_bitrate()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn state_probe(&self) -> StateProbe {
        self.shared.state.subscribe()
    }

    fn close(&mut self) {
        for slot in &self.senders {
            slot.pump.abort();
        }
        if let Ok(mut rtc) = self.shared.rtc.lock() {
            rtc.disconnect();
        }
        self.shared.set_state(ConnectionState::Closed);
        self.driver.abort();
    }
}

impl Drop for RtcPeer {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_rtc(video_codec: Option<Codec>) -> Rtc {
    let mut config = Rtc::builder()
        .clear_codecs()
        .enable_opus(true)
        .enable_bwe(Some(Bitrate::bps(INITIAL_BITRATE_BPS)));

    // Payload types are offered in the order codecs are enabled.
    let video_order = match video_codec {
        Some(Codec::Vp8) => [Codec::Vp8, Codec::H264],
        _ => [Codec::H264, Codec::Vp8],
    };
    for codec in video_order {
        config = match codec {
            Codec::H264 => config.enable_h264(true),
            _ => config.enable_vp8(true),
        };
    }

    config.build()
}

fn codec_from_name(name: &str) -> Option<Codec> {
    match name.to_ascii_lowercase().as_str() {
        "h264" => Some(Codec::H264),
        "vp8" => Some(Codec::Vp8),
        "vp9" => Some(Codec::Vp9),
        "opus" => Some(Codec::Opus),
        _ => None,
    }
}

fn media_kind(kind: TrackKind) -> MediaKind {
    match kind {
        TrackKind::Audio => MediaKind::Audio,
        TrackKind::Video => MediaKind::Video,
    }
}

async fn drive(shared: Arc<Shared>, socket: UdpSocket) {
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("UDP socket has no local address: {}", e);
            shared.set_state(ConnectionState::Failed);
            return;
        }
    };
    info!("Peer connection bound to {}", local);

    let mut buf = vec![0; 2000];
    loop {
        let Some(timeout) = shared.drain(&socket) else {
            break;
        };

        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(timeout)) => {
                shared.handle_input(Input::Timeout(Instant::now()));
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    // Preparse to demultiplex STUN/DTLS/RTP on the one port.
                    let Ok(contents) = (&buf[..n]).try_into() else {
                        continue;
                    };
                    shared.handle_input(Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: local,
                            contents,
                        },
                    ));
                }
                Err(e) => warn!("UDP receive failed: {}", e),
            }
        }
    }

    debug!("Peer connection driver stopped");
}

async fn pump(shared: Arc<Shared>, preferred: Option<Codec>, mut route: watch::Receiver<Route>) {
    loop {
        let current = route.borrow_and_update().clone();
        let (Some(mid), Some(track)) = (current.mid, current.track) else {
            if route.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut frames = track.subscribe();
        loop {
            tokio::select! {
                changed = route.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        // A disabled track keeps its media line but sends nothing.
                        if track.is_enabled() {
                            shared.write(mid, preferred, &frame);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Sender on {:?} skipped {} frames", mid, skipped);
                    }
                    Err(RecvError::Closed) => {
                        if route.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PublisherConfig, sdp};

    fn settings() -> PeerSettings {
        PeerSettings::from_config(&PublisherConfig::default(), "stream-1")
    }

    #[tokio::test]
    async fn offer_is_send_only_with_h264_first() {
        let mut peer = RtcPeer::new(&settings()).unwrap();
        let video = MediaTrack::new(TrackKind::Video, "cam");
        let audio = MediaTrack::new(TrackKind::Audio, "mic");
        peer.add_send_transceiver(&video).unwrap();
        peer.add_send_transceiver(&audio).unwrap();

        let offer = peer.create_offer().unwrap();
        assert!(offer.contains("m=video"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("a=sendonly"));
        assert!(!offer.contains("a=recvonly"));
        assert!(offer.contains("H264/90000"));

        // str0m interleaves each H264 payload type with its rtx type.
        let h264: Vec<String> = offer
            .lines()
            .filter_map(|l| l.strip_prefix("a=rtpmap:"))
            .filter_map(|rest| rest.split_once(' '))
            .filter(|(_, encoding)| encoding.starts_with("H264/"))
            .map(|(pt, _)| pt.to_string())
            .collect();
        assert!(!h264.is_empty());
        let expected: Vec<String> = sdp::video_payload_order(&offer)
            .into_iter()
            .filter(|pt| h264.contains(pt))
            .collect();

        let patched = sdp::prefer_codec(&offer, "H264");
        let order = sdp::video_payload_order(&patched);
        assert_eq!(&order[..expected.len()], &expected[..]);
        assert_eq!(order.len(), sdp::video_payload_order(&offer).len());
        assert_eq!(sdp::prefer_codec(&patched, "H264"), patched);
        peer.close();
    }

    #[tokio::test]
    async fn accepts_answer_from_remote_rtc() {
        let mut peer = RtcPeer::new(&settings()).unwrap();
        peer.add_send_transceiver(&MediaTrack::new(TrackKind::Video, "cam"))
            .unwrap();
        let offer = peer.create_offer().unwrap();

        let mut remote = Rtc::builder().build();
        let offer = str0m::change::SdpOffer::from_sdp_string(&offer).unwrap();
        let answer = remote.sdp_api().accept_offer(offer).unwrap();

        peer.set_remote_answer(&answer.to_sdp_string()).unwrap();
        assert_eq!(peer.connection_state(), ConnectionState::Connecting);
        peer.close();
        assert_eq!(peer.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn garbage_answer_is_negotiation_failure() {
        let mut peer = RtcPeer::new(&settings()).unwrap();
        peer.add_send_transceiver(&MediaTrack::new(TrackKind::Audio, "mic"))
            .unwrap();
        peer.create_offer().unwrap();
        assert!(matches!(
            peer.set_remote_answer("not sdp"),
            Err(BroadcastError::NegotiationFailed(_))
        ));
    }

    #[tokio::test]
    async fn bitrate_and_replacement_stay_on_sender() {
        let mut peer = RtcPeer::new(&settings()).unwrap();
        let sender = peer
            .add_send_transceiver(&MediaTrack::new(TrackKind::Video, "cam"))
            .unwrap();
        peer.set_parameters(
            sender,
            SendParameters {
                max_bitrate_bps: Some(5_000_000),
            },
        )
        .unwrap();

        peer.replace_track(sender, &MediaTrack::new(TrackKind::Video, "screen"))
            .unwrap();
        assert!(matches!(
            peer.replace_track(sender, &MediaTrack::new(TrackKind::Audio, "mic")),
            Err(BroadcastError::SourceMismatch(_))
        ));
        assert_eq!(
            peer.parameters(sender).unwrap().max_bitrate_bps,
            Some(5_000_000)
        );
        assert_eq!(peer.sender_kind(sender), Some(TrackKind::Video));
    }
}
