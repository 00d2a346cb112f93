//! WHIP signaling
//!
//! One `POST` of the SDP offer creates the publish resource; the answer comes
//! back in the body and the resource location in the `Location` header. A
//! `DELETE` to that location ends the publish.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{BroadcastError, Result};

/// What the ingest endpoint returned for an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhipAnswer {
    pub sdp: String,
    /// Absolute url of the created resource, if the server named one.
    pub resource_url: Option<String>,
}

#[async_trait]
pub trait WhipSignaling: Send + Sync {
    /// Send `offer` to `endpoint` authorized with `token`.
    async fn publish(&self, endpoint: &str, token: &str, offer: &str) -> Result<WhipAnswer>;

    /// Release the publish resource.
    async fn terminate(&self, resource_url: &str, token: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpWhipClient {
    http: reqwest::Client,
}

impl HttpWhipClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BroadcastError::TransportError(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WhipSignaling for HttpWhipClient {
    async fn publish(&self, endpoint: &str, token: &str, offer: &str) -> Result<WhipAnswer> {
        info!("WHIP publish to {}", endpoint);

        let response = self
            .http
            .post(endpoint)
            .header(header::CONTENT_TYPE, "application/sdp")
            .header(header::ACCEPT, "application/sdp")
            .bearer_auth(token)
            .body(offer.to_string())
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let resource_url = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| resolve_location(endpoint, location));
        debug!("WHIP resource: {:?}", resource_url);

        let sdp = response.text().await.map_err(map_request_error)?;
        if sdp.trim().is_empty() {
            return Err(BroadcastError::NegotiationFailed(
                "empty answer from ingest endpoint".into(),
            ));
        }

        Ok(WhipAnswer { sdp, resource_url })
    }

    async fn terminate(&self, resource_url: &str, token: &str) -> Result<()> {
        let response = self
            .http
            .delete(resource_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        // Already gone counts as released.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!("WHIP resource {} released", resource_url);
            return Ok(());
        }
        Err(classify_status(status, ""))
    }
}

/// Map a non-success status to the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> BroadcastError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BroadcastError::AuthRejected(detail),
        _ => BroadcastError::NegotiationFailed(detail),
    }
}

fn map_request_error(e: reqwest::Error) -> BroadcastError {
    if e.is_timeout() {
        BroadcastError::NegotiationFailed(format!("ingest endpoint timed out: {e}"))
    } else {
        BroadcastError::TransportError(e.to_string())
    }
}

/// `Location` may be absolute or relative to the endpoint.
fn resolve_location(endpoint: &str, location: &str) -> Option<String> {
    match Url::parse(endpoint).and_then(|base| base.join(location)) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            warn!("Ignoring unusable Location {:?}: {}", location, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_rejections() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            BroadcastError::AuthRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "bad jwt"),
            BroadcastError::AuthRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "malformed sdp"),
            BroadcastError::NegotiationFailed(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            BroadcastError::NegotiationFailed(_)
        ));
    }

    #[test]
    fn relative_location_is_resolved() {
        assert_eq!(
            resolve_location("http://media:8889/stream/1/whip", "/stream/1/whip/abc").as_deref(),
            Some("http://media:8889/stream/1/whip/abc")
        );
        assert_eq!(
            resolve_location("http://media:8889/stream/1/whip", "https://other/res").as_deref(),
            Some("https://other/res")
        );
    }
}
