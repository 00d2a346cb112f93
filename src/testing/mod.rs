//! In-memory doubles for the peer-connection and signaling seams.
//!
//! [`FakePeerFactory`] hands out [`FakePeer`]s that record everything done to
//! them in a shared [`PeerLog`], and lets a test drive the connection state
//! of the newest peer, with or without a change notification.
//! [`ScriptedWhip`] answers publishes from a script.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    error::{BroadcastError, Result},
    model::tracks::{MediaTrack, TrackId, TrackKind},
    peer::{
        ConnectionState, PeerConnection, PeerConnectionFactory, PeerSettings, SendParameters,
        SenderId, StateProbe,
    },
    whip::{WhipAnswer, WhipSignaling},
};

/// Everything the fakes observed.
#[derive(Debug, Default, Clone)]
pub struct PeerLog {
    pub peers_created: usize,
    pub offers_created: usize,
    pub answers_applied: usize,
    pub closed: usize,
    /// Settings each peer was created with.
    pub settings: Vec<PeerSettings>,
    /// `(sender, new track)` for every successful replacement.
    pub replaced: Vec<(SenderId, TrackId)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct FakePeerFactory {
    log: Arc<Mutex<PeerLog>>,
    states: Arc<Mutex<Vec<watch::Sender<ConnectionState>>>>,
    codec_preferences: bool,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers report transceiver-level codec preference support.
    pub fn with_codec_preferences(mut self) -> Self {
        self.codec_preferences = true;
        self
    }

    pub fn log(&self) -> PeerLog {
        lock(&self.log).clone()
    }

    /// Move the newest peer to `state` and notify observers.
    pub fn set_state(&self, state: ConnectionState) {
        if let Some(tx) = lock(&self.states).last() {
            tx.send_replace(state);
        }
    }

    /// Move the newest peer to `state` without a change notification, like
    /// a runtime whose state events never fire.
    pub fn set_state_silently(&self, state: ConnectionState) {
        if let Some(tx) = lock(&self.states).last() {
            tx.send_if_modified(|current| {
                *current = state;
                false
            });
        }
    }
}

impl PeerConnectionFactory for FakePeerFactory {
    type Peer = FakePeer;

    fn create(&self, settings: &PeerSettings) -> Result<FakePeer> {
        let (state, _) = watch::channel(ConnectionState::New);
        lock(&self.states).push(state.clone());

        let mut log = lock(&self.log);
        log.peers_created += 1;
        log.settings.push(settings.clone());

        Ok(FakePeer {
            index: log.peers_created,
            log: self.log.clone(),
            senders: vec![],
            state,
            offer_pending: false,
            codec_preferences: self.codec_preferences,
        })
    }
}

struct FakeSender {
    kind: TrackKind,
    track: MediaTrack,
    params: SendParameters,
}

pub struct FakePeer {
    index: usize,
    log: Arc<Mutex<PeerLog>>,
    senders: Vec<FakeSender>,
    state: watch::Sender<ConnectionState>,
    offer_pending: bool,
    codec_preferences: bool,
}

impl FakePeer {
    /// 1-based creation order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Track currently attached to `sender`.
    pub fn track(&self, sender: SenderId) -> Option<&MediaTrack> {
        self.senders.get(sender.0).map(|s| &s.track)
    }

    fn offer(&self) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.index
        );
        for (mid, sender) in self.senders.iter().enumerate() {
            match sender.kind {
                TrackKind::Video => sdp.push_str(&format!(
                    "m=video 9 UDP/TLS/RTP/SAVPF 96 97 102\r\na=mid:{mid}\r\na=sendonly\r\n\
a=rtpmap:96 VP8/90000\r\na=rtpmap:97 rtx/90000\r\na=fmtp:97 apt=96\r\n\
a=rtpmap:102 H264/90000\r\n"
                )),
                TrackKind::Audio => sdp.push_str(&format!(
                    "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:{mid}\r\na=sendonly\r\n\
a=rtpmap:111 opus/48000/2\r\n"
                )),
            }
        }
        sdp
    }
}

impl PeerConnection for FakePeer {
    fn add_send_transceiver(&mut self, track: &MediaTrack) -> Result<SenderId> {
        self.senders.push(FakeSender {
            kind: track.kind(),
            track: track.clone(),
            params: SendParameters::default(),
        });
        Ok(SenderId(self.senders.len() - 1))
    }

    fn set_codec_preferences(&mut self, _sender: SenderId, _codec: &str) -> bool {
        self.codec_preferences
    }

    fn create_offer(&mut self) -> Result<String> {
        if self.senders.is_empty() {
            return Err(BroadcastError::NegotiationFailed("no media".into()));
        }
        self.offer_pending = true;
        lock(&self.log).offers_created += 1;
        self.state.send_replace(ConnectionState::Connecting);
        Ok(self.offer())
    }

    fn set_remote_answer(&mut self, sdp: &str) -> Result<()> {
        if !self.offer_pending {
            return Err(BroadcastError::NegotiationFailed("no offer pending".into()));
        }
        if !sdp.starts_with("v=0") {
            return Err(BroadcastError::NegotiationFailed("answer is not SDP".into()));
        }
        self.offer_pending = false;
        lock(&self.log).answers_applied += 1;
        Ok(())
    }

    fn replace_track(&mut self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        let slot = self
            .senders
            .get_mut(sender.0)
            .ok_or_else(|| BroadcastError::SourceMismatch("unknown sender".into()))?;
        if slot.kind != track.kind() {
            return Err(BroadcastError::SourceMismatch("kind differs".into()));
        }
        slot.track = track.clone();
        // Some runtimes drop encoding parameters on replacement.
        slot.params = SendParameters::default();
        lock(&self.log).replaced.push((sender, track.id()));
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
            .ok_or_else(|| BroadcastError::SourceMismatch("unknown sender".into()))?;
        slot.params = params;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn state_probe(&self) -> StateProbe {
        self.state.subscribe()
    }

    fn close(&mut self) {
        if *self.state.borrow() == ConnectionState::Closed {
            return;
        }
        self.state.send_replace(ConnectionState::Closed);
        lock(&self.log).closed += 1;
    }
}

enum Step {
    Reply(Result<WhipAnswer>),
    Hang,
}

/// WHIP signaling that answers from a script, then with a default answer.
#[derive(Default)]
pub struct ScriptedWhip {
    script: Mutex<VecDeque<Step>>,
    offers: Mutex<Vec<(String, String, String)>>,
    terminated: Mutex<Vec<String>>,
    fail_terminate: bool,
}

impl ScriptedWhip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_reply(self, result: Result<WhipAnswer>) -> Self {
        lock(&self.script).push_back(Step::Reply(result));
        self
    }

    pub fn then_reject_auth(self) -> Self {
        self.then_reply(Err(BroadcastError::AuthRejected("401 Unauthorized".into())))
    }

    /// Next publish never answers.
    pub fn then_hang(self) -> Self {
        lock(&self.script).push_back(Step::Hang);
        self
    }

    pub fn failing_terminate(mut self) -> Self {
        self.fail_terminate = true;
        self
    }

    /// `(endpoint, token, offer)` of every publish.
    pub fn offers(&self) -> Vec<(String, String, String)> {
        lock(&self.offers).clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        lock(&self.terminated).clone()
    }

    fn default_answer(n: usize) -> WhipAnswer {
        WhipAnswer {
            sdp: "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string(),
            resource_url: Some(format!("http://ingest.test/whip/resource/{n}")),
        }
    }
}

#[async_trait]
impl WhipSignaling for ScriptedWhip {
    async fn publish(&self, endpoint: &str, token: &str, offer: &str) -> Result<WhipAnswer> {
        let n = {
            let mut offers = lock(&self.offers);
            offers.push((endpoint.to_string(), token.to_string(), offer.to_string()));
            offers.len()
        };

        let step = lock(&self.script).pop_front();
        match step {
            Some(Step::Reply(result)) => result,
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err(BroadcastError::NegotiationFailed("hung".into()))
            }
            None => Ok(Self::default_answer(n)),
        }
    }

    async fn terminate(&self, resource_url: &str, _token: &str) -> Result<()> {
        lock(&self.terminated).push(resource_url.to_string());
        if self.fail_terminate {
            return Err(BroadcastError::TransportError("connection refused".into()));
        }
        Ok(())
    }
}
