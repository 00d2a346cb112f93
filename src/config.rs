//! Publisher configuration
//!
//! Defaults match what the broadcast page ships with; a JSON file and
//! `LIVECAST_*` environment variables can override individual fields.

use std::{env, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::stream::StreamDescriptor;

/// Target capture resolution handed to the capture backend as an ideal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// STUN/TURN urls offered to the peer connection.
    pub ice_servers: Vec<String>,
    /// Codec moved to the front of the video payload list.
    pub preferred_video_codec: String,
    /// Encoding cap applied to the video sender.
    pub max_video_bitrate_bps: u64,
    pub camera_resolution: Resolution,
    pub screen_resolution: Resolution,
    pub state_poll_interval_ms: u64,
    pub state_poll_window_secs: u64,
    pub negotiation_timeout_secs: u64,
    /// Extra attempts after a retryable publish failure.
    pub publish_retries: u32,
    pub retry_backoff_ms: u64,
    pub whip_scheme: String,
    pub whip_port: u16,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            preferred_video_codec: "H264".to_string(),
            max_video_bitrate_bps: 5_000_000,
            camera_resolution: Resolution {
                width: 1280,
                height: 720,
            },
            screen_resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            state_poll_interval_ms: 1000,
            state_poll_window_secs: 30,
            negotiation_timeout_secs: 15,
            publish_retries: 2,
            retry_backoff_ms: 500,
            whip_scheme: "http".to_string(),
            whip_port: 8889,
        }
    }
}

impl PublisherConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `LIVECAST_*` environment overrides on top of `self`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(servers) = env::var("LIVECAST_ICE_SERVERS") {
            self.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(codec) = env::var("LIVECAST_VIDEO_CODEC") {
            self.preferred_video_codec = codec;
        }
        if let Ok(scheme) = env::var("LIVECAST_WHIP_SCHEME") {
            self.whip_scheme = scheme;
        }
        override_parsed("LIVECAST_MAX_VIDEO_BITRATE", &mut self.max_video_bitrate_bps);
        override_parsed("LIVECAST_WHIP_PORT", &mut self.whip_port);
        override_parsed("LIVECAST_PUBLISH_RETRIES", &mut self.publish_retries);
        override_parsed(
            "LIVECAST_NEGOTIATION_TIMEOUT_SECS",
            &mut self.negotiation_timeout_secs,
        );
        self
    }

    pub fn state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.state_poll_interval_ms.max(1))
    }

    pub fn state_poll_window(&self) -> Duration {
        Duration::from_secs(self.state_poll_window_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// WHIP endpoint on the media server for `descriptor`.
    ///
    /// The descriptor's ingest address is `host[:rtmp_port]`; the WebRTC
    /// listener lives on the same host at `whip_port`.
    pub fn whip_url(&self, descriptor: &StreamDescriptor) -> String {
        format!(
            "{}://{}:{}/stream/{}/whip",
            self.whip_scheme,
            descriptor.ingest_host(),
            self.whip_port,
            descriptor.stream_id
        )
    }
}

fn override_parsed<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_broadcast_page() {
        let config = PublisherConfig::default();
        assert_eq!(config.max_video_bitrate_bps, 5_000_000);
        assert_eq!(config.preferred_video_codec, "H264");
        assert_eq!(config.state_poll_window(), Duration::from_secs(30));
        assert!(!config.ice_servers.is_empty());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PublisherConfig =
            serde_json::from_str(r#"{"whip_port": 9000, "publish_retries": 0}"#).unwrap();
        assert_eq!(config.whip_port, 9000);
        assert_eq!(config.publish_retries, 0);
        assert_eq!(config.camera_resolution.width, 1280);
    }

    #[test]
    fn backoff_doubles() {
        let config = PublisherConfig::default();
        assert_eq!(config.retry_backoff(1), Duration::from_millis(500));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(1000));
        assert_eq!(config.retry_backoff(3), Duration::from_millis(2000));
    }

    #[test]
    fn whip_url_uses_ingest_host() {
        let descriptor = StreamDescriptor {
            stream_id: 42,
            stream_url: "media.example.com:1935".to_string(),
            mediamtx_jwt: "jwt".to_string(),
        };
        let config = PublisherConfig::default();
        assert_eq!(
            config.whip_url(&descriptor),
            "http://media.example.com:8889/stream/42/whip"
        );
    }
}
