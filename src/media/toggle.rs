//! Mute / camera-off state for the current source.

use serde::Serialize;

use crate::model::tracks::{MediaSourceHandle, TrackKind};

/// Whether the camera and microphone tracks of the current handle are
/// enabled. Disabling keeps the capture running; only the track's
/// `enabled` flag flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackToggleState {
    pub camera_enabled: bool,
    pub mic_enabled: bool,
}

impl Default for TrackToggleState {
    fn default() -> Self {
        Self {
            camera_enabled: true,
            mic_enabled: true,
        }
    }
}

impl TrackToggleState {
    /// Toggle state for a freshly acquired handle, read from its tracks.
    pub fn for_handle(handle: &MediaSourceHandle) -> Self {
        Self {
            camera_enabled: handle.video().map(|t| t.is_enabled()).unwrap_or(false),
            mic_enabled: handle.audio().map(|t| t.is_enabled()).unwrap_or(false),
        }
    }

    pub fn toggle_camera(&mut self, handle: &MediaSourceHandle) -> bool {
        self.set(handle, TrackKind::Video, !self.camera_enabled)
    }

    pub fn toggle_mic(&mut self, handle: &MediaSourceHandle) -> bool {
        self.set(handle, TrackKind::Audio, !self.mic_enabled)
    }

    /// Set one kind's flag and push it onto the track. A handle without that
    /// track kind leaves the state untouched. Returns the resulting flag.
    pub fn set(&mut self, handle: &MediaSourceHandle, kind: TrackKind, enabled: bool) -> bool {
        let Some(track) = handle.track(kind) else {
            return self.get(kind);
        };
        track.set_enabled(enabled);
        match kind {
            TrackKind::Video => self.camera_enabled = enabled,
            TrackKind::Audio => self.mic_enabled = enabled,
        }
        enabled
    }

    pub fn get(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.camera_enabled,
            TrackKind::Audio => self.mic_enabled,
        }
    }
}
