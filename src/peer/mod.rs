//! Peer-connection seam
//!
//! The session manager talks to a WebRTC runtime through [`PeerConnection`],
//! shaped after the browser's `RTCPeerConnection`: send-only transceivers,
//! an offer applied as local description, a remote answer, in-place track
//! replacement and per-sender encoding parameters. [`rtc::RtcPeer`] is the
//! str0m-backed implementation.

pub mod rtc;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    config::PublisherConfig,
    error::Result,
    model::tracks::{MediaTrack, TrackKind},
};

/// Index of an outbound sender within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub(crate) usize);

/// Encoding parameters of one sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendParameters {
    pub max_bitrate_bps: Option<u64>,
}

/// Normalized connection state, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Watch on the connection state. `borrow()` reads the current value
/// whether or not a change notification was delivered.
pub type StateProbe = watch::Receiver<ConnectionState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    /// All media multiplexed on one transport.
    MaxBundle,
}

#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub ice_servers: Vec<String>,
    pub bundle_policy: BundlePolicy,
    pub preferred_video_codec: String,
    pub stream_label: String,
}

impl PeerSettings {
    pub fn from_config(config: &PublisherConfig, stream_label: impl Into<String>) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            bundle_policy: BundlePolicy::MaxBundle,
            preferred_video_codec: config.preferred_video_codec.clone(),
            stream_label: stream_label.into(),
        }
    }
}

/// A single WebRTC connection used for publishing.
pub trait PeerConnection: Send {
    /// Add a send-only transceiver carrying `track`.
    fn add_send_transceiver(&mut self, track: &MediaTrack) -> Result<SenderId>;

    /// Transceiver-level codec preference. Returns `false` when the runtime
    /// has no such control, in which case only the SDP rewrite applies.
    fn set_codec_preferences(&mut self, sender: SenderId, codec: &str) -> bool;

    /// Create an offer and apply it as the local description.
    fn create_offer(&mut self) -> Result<String>;

    /// Apply the remote answer for the pending offer.
    fn set_remote_answer(&mut self, sdp: &str) -> Result<()>;

    /// Swap the sender's track without renegotiating.
    fn replace_track(&mut self, sender: SenderId, track: &MediaTrack) -> Result<()>;

    fn sender_kind(&self, sender: SenderId) -> Option<TrackKind>;

    fn parameters(&self, sender: SenderId) -> Option<SendParameters>;

    fn set_parameters(&mut self, sender: SenderId, params: SendParameters) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    fn state_probe(&self) -> StateProbe;

    /// Tear the connection down. Idempotent.
    fn close(&mut self);
}

/// Builds fresh connections; a connection is never reused after `close`.
pub trait PeerConnectionFactory: Send + Sync {
    type Peer: PeerConnection + 'static;

    fn create(&self, settings: &PeerSettings) -> Result<Self::Peer>;
}
