//! Stream descriptor handed over by the backend REST layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity and credential of the stream being published.
///
/// Read-only input to the publisher; it is never mutated locally.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    pub stream_id: u64,
    /// Ingest address as `host[:port]`.
    pub stream_url: String,
    /// Short-lived broadcast credential (JWT).
    pub mediamtx_jwt: String,
}

impl StreamDescriptor {
    /// RTMP url for external broadcasting software. Display only.
    pub fn rtmp_url(&self) -> String {
        format!(
            "rtmp://{}/stream/{}?jwt={}",
            self.stream_url, self.stream_id, self.mediamtx_jwt
        )
    }

    /// Host part of `stream_url`, without scheme, port or path.
    pub fn ingest_host(&self) -> &str {
        let rest = self
            .stream_url
            .split_once("://")
            .map(|(_, r)| r)
            .unwrap_or(&self.stream_url);
        let authority = rest.split('/').next().unwrap_or(rest);

        if authority.starts_with('[') {
            // [v6]:port
            return match authority.find(']') {
                Some(end) => &authority[..=end],
                None => authority,
            };
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => authority,
        }
    }
}

impl fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("stream_id", &self.stream_id)
            .field("stream_url", &self.stream_url)
            .field("mediamtx_jwt", &"[REDACTED]")
            .finish()
    }
}
