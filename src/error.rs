//! Error taxonomy for capture, negotiation and publishing.

use thiserror::Error;

/// Errors surfaced by the publishing pipeline.
///
/// Every variant is recoverable from the user's point of view: the
/// coordinator downgrades its phase and the user may retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The user declined the capture prompt or the platform blocked it.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No capture device, or the device failed.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The remote rejected the offer, or the exchange timed out.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The broadcast credential was refused (HTTP 401/403).
    #[error("Credential rejected: {0}")]
    AuthRejected(String),

    /// Network-level failure while talking to the ingest endpoint.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A replacement source lacks a track kind the session was started with.
    #[error("Source mismatch: {0}")]
    SourceMismatch(String),
}

impl BroadcastError {
    /// Whether a fresh attempt has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BroadcastError::NegotiationFailed(_) | BroadcastError::TransportError(_)
        )
    }

    /// Short message suitable for showing next to the preview.
    pub fn user_message(&self) -> String {
        match self {
            BroadcastError::PermissionDenied(_) => {
                "Camera or microphone access was denied. Check the permission settings and try again."
                    .to_string()
            }
            BroadcastError::DeviceUnavailable(_) => {
                "No usable capture device was found.".to_string()
            }
            BroadcastError::NegotiationFailed(_) => {
                "The media server did not accept the broadcast. Try again.".to_string()
            }
            BroadcastError::AuthRejected(_) => {
                "The stream key was rejected. Request a new one and try again.".to_string()
            }
            BroadcastError::TransportError(_) => {
                "Could not reach the media server. Check the connection.".to_string()
            }
            BroadcastError::SourceMismatch(_) => {
                "The new source does not provide the same audio/video tracks as the broadcast."
                    .to_string()
            }
        }
    }
}

/// Result type alias using [`BroadcastError`].
pub type Result<T> = std::result::Result<T, BroadcastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_side_errors_are_retryable() {
        assert!(BroadcastError::NegotiationFailed("x".into()).is_retryable());
        assert!(BroadcastError::TransportError("x".into()).is_retryable());
        assert!(!BroadcastError::AuthRejected("x".into()).is_retryable());
        assert!(!BroadcastError::PermissionDenied("x".into()).is_retryable());
        assert!(!BroadcastError::SourceMismatch("x".into()).is_retryable());
    }

    #[test]
    fn display_includes_detail() {
        let err = BroadcastError::AuthRejected("401 Unauthorized".into());
        assert_eq!(err.to_string(), "Credential rejected: 401 Unauthorized");
    }
}
