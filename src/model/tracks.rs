//! Local media tracks and the source handles that group them
//!
//! A [`MediaTrack`] is a cheap, cloneable reference to one live capture
//! track. Senders hold clones but never decide the track's lifetime; only
//! the [`MediaSourceHandle`] owner stops it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Buffered frames per subscriber before a slow consumer starts lagging.
const FRAME_BUFFER: usize = 64;

/// The kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// The physical origin of a source handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Screen,
}

/// Lifecycle of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    /// Stopped locally via [`MediaTrack::stop`].
    Stopped,
    /// Ended by the capture side, e.g. the user stopped sharing.
    Ended,
}

/// One encoded media sample.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    /// Media timestamp in the codec's clock rate.
    pub rtp_time: u64,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: TrackId,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    frames: broadcast::Sender<MediaFrame>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> MediaTrack {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        let (state, _) = watch::channel(TrackState::Live);
        let (frames, _) = broadcast::channel(FRAME_BUFFER);

        MediaTrack {
            inner: Arc::new(TrackInner {
                id: TrackId(ID_COUNTER.fetch_add(1, Ordering::SeqCst)),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
                frames,
            }),
        }
    }

    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without releasing the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stop the track locally. Idempotent; does not count as "ended".
    pub fn stop(&self) {
        self.finish(TrackState::Stopped);
    }

    /// Mark the track as ended by the capture side.
    pub fn end(&self) {
        self.finish(TrackState::Ended);
    }

    fn finish(&self, to: TrackState) {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the track leaves [`TrackState::Live`].
    pub async fn ended(&self) -> TrackState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != TrackState::Live).await {
            Ok(state) => *state,
            // The sender lives inside `self`, so this is unreachable in practice.
            Err(_) => TrackState::Stopped,
        };
        state
    }

    /// Receive frames pushed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    /// Feed a captured frame. Returns `false` once the track is no longer live.
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        if !self.is_live() {
            return false;
        }
        // No subscribers is fine: nobody is previewing or sending yet.
        let _ = self.inner.frames.send(frame);
        true
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

/// A live set of tracks from one physical source.
#[derive(Debug, Clone)]
pub struct MediaSourceHandle {
    kind: SourceKind,
    video: Option<MediaTrack>,
    audio: Option<MediaTrack>,
}

impl MediaSourceHandle {
    pub fn new(kind: SourceKind, video: Option<MediaTrack>, audio: Option<MediaTrack>) -> Self {
        Self { kind, video, audio }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn video(&self) -> Option<&MediaTrack> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Audio => self.audio(),
            TrackKind::Video => self.video(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.video.iter().chain(self.audio.iter())
    }

    /// True while at least one track is live.
    pub fn is_live(&self) -> bool {
        self.tracks().any(MediaTrack::is_live)
    }

    /// Stop every track. Idempotent.
    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}
