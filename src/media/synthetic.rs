//! Synthetic capture backend
//!
//! Produces camera/screen handles without hardware. Outcomes, prompt delays
//! and frame generation are configurable, which makes it suitable for tests
//! and for exercising a media server from the command line.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::{
    error::{BroadcastError, Result},
    media::{CaptureConstraints, MediaDevices},
    model::tracks::{MediaFrame, MediaSourceHandle, MediaTrack, SourceKind, TrackKind},
};

const VIDEO_CLOCK_RATE: u64 = 90_000;
/// 20 ms of 48 kHz audio.
const AUDIO_FRAME_TICKS: u64 = 960;
const KEYFRAME_INTERVAL: u64 = 60;

/// How a capture prompt resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Grant,
    Deny,
    NoDevice,
    /// The prompt is never answered.
    Pending,
}

#[derive(Debug, Clone, Copy)]
struct Behaviour {
    outcome: Outcome,
    delay: Duration,
}

#[derive(Debug)]
pub struct SyntheticDevices {
    camera: Behaviour,
    screen: Behaviour,
    screen_audio: bool,
    generate_frames: bool,
    opened: AtomicUsize,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        let grant = Behaviour {
            outcome: Outcome::Grant,
            delay: Duration::ZERO,
        };
        Self {
            camera: grant,
            screen: grant,
            screen_audio: true,
            generate_frames: false,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn with_camera(mut self, outcome: Outcome) -> Self {
        self.camera.outcome = outcome;
        self
    }

    pub fn with_screen(mut self, outcome: Outcome) -> Self {
        self.screen.outcome = outcome;
        self
    }

    pub fn with_camera_delay(mut self, delay: Duration) -> Self {
        self.camera.delay = delay;
        self
    }

    pub fn with_screen_delay(mut self, delay: Duration) -> Self {
        self.screen.delay = delay;
        self
    }

    /// Whether display capture also yields a tab/system audio track.
    pub fn with_screen_audio(mut self, enabled: bool) -> Self {
        self.screen_audio = enabled;
        self
    }

    /// Push generated frames into every granted track while it is live.
    pub fn with_frames(mut self) -> Self {
        self.generate_frames = true;
        self
    }

    /// Number of granted captures so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    async fn open(
        &self,
        kind: SourceKind,
        behaviour: Behaviour,
        constraints: &CaptureConstraints,
    ) -> Result<MediaSourceHandle> {
        if !behaviour.delay.is_zero() {
            tokio::time::sleep(behaviour.delay).await;
        }

        match behaviour.outcome {
            Outcome::Deny => {
                return Err(BroadcastError::PermissionDenied(format!(
                    "{:?} capture was declined",
                    kind
                )))
            }
            Outcome::NoDevice => {
                return Err(BroadcastError::DeviceUnavailable(format!(
                    "no {:?} device present",
                    kind
                )))
            }
            Outcome::Pending => std::future::pending::<()>().await,
            Outcome::Grant => {}
        }

        let with_audio = constraints.audio && (kind == SourceKind::Camera || self.screen_audio);
        let (video_label, audio_label) = match kind {
            SourceKind::Camera => ("synthetic camera", "synthetic microphone"),
            SourceKind::Screen => ("synthetic screen", "synthetic tab audio"),
        };

        let video = MediaTrack::new(TrackKind::Video, video_label);
        let audio = with_audio.then(|| MediaTrack::new(TrackKind::Audio, audio_label));

        if self.generate_frames {
            spawn_video_frames(video.clone(), constraints.frame_rate.max(1));
            if let Some(audio) = &audio {
                spawn_audio_frames(audio.clone());
            }
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Synthetic {:?} opened at {}x{}",
            kind, constraints.ideal.width, constraints.ideal.height
        );

        Ok(MediaSourceHandle::new(kind, Some(video), audio))
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_camera(&self, constraints: &CaptureConstraints) -> Result<MediaSourceHandle> {
        self.open(SourceKind::Camera, self.camera, constraints).await
    }

    async fn open_screen(&self, constraints: &CaptureConstraints) -> Result<MediaSourceHandle> {
        self.open(SourceKind::Screen, self.screen, constraints).await
    }
}

/// Annex B access unit with a single NAL unit: IDR every
/// `KEYFRAME_INTERVAL` frames, non-IDR slices otherwise.
pub fn synthetic_video_frame(frame_number: u64, frame_rate: u32) -> MediaFrame {
    let nal_header = if frame_number % KEYFRAME_INTERVAL == 0 {
        0x65
    } else {
        0x41
    };

    let mut data = BytesMut::with_capacity(512);
    data.put_slice(&[0, 0, 0, 1, nal_header]);
    let base = (frame_number % 256) as u8;
    for i in 0..507u32 {
        data.put_u8(base.wrapping_add((i % 251) as u8));
    }

    MediaFrame {
        data: data.freeze(),
        rtp_time: frame_number * VIDEO_CLOCK_RATE / u64::from(frame_rate.max(1)),
        captured_at: Instant::now(),
    }
}

/// A 20 ms Opus packet carrying silence.
pub fn synthetic_audio_frame(frame_number: u64) -> MediaFrame {
    MediaFrame {
        data: Bytes::from_static(&[0xf8, 0xff, 0xfe]),
        rtp_time: frame_number * AUDIO_FRAME_TICKS,
        captured_at: Instant::now(),
    }
}

fn spawn_video_frames(track: MediaTrack, frame_rate: u32) {
    let period = Duration::from_secs(1) / frame_rate;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        for n in 0.. {
            ticker.tick().await;
            if !track.push_frame(synthetic_video_frame(n, frame_rate)) {
                break;
            }
        }
    });
}

fn spawn_audio_frames(track: MediaTrack) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        for n in 0.. {
            ticker.tick().await;
            if !track.push_frame(synthetic_audio_frame(n)) {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Resolution;

    fn constraints() -> CaptureConstraints {
        CaptureConstraints {
            ideal: Resolution {
                width: 1280,
                height: 720,
            },
            audio: true,
            frame_rate: 30,
        }
    }

    #[tokio::test]
    async fn screen_audio_is_optional() {
        let devices = SyntheticDevices::new().with_screen_audio(false);
        let handle = devices.open_screen(&constraints()).await.unwrap();
        assert!(handle.video().is_some());
        assert!(handle.audio().is_none());
        assert_eq!(devices.opened(), 1);
    }

    #[tokio::test]
    async fn outcomes_map_to_error_taxonomy() {
        let devices = SyntheticDevices::new()
            .with_camera(Outcome::Deny)
            .with_screen(Outcome::NoDevice);
        assert!(matches!(
            devices.open_camera(&constraints()).await,
            Err(BroadcastError::PermissionDenied(_))
        ));
        assert!(matches!(
            devices.open_screen(&constraints()).await,
            Err(BroadcastError::DeviceUnavailable(_))
        ));
        assert_eq!(devices.opened(), 0);
    }

    #[tokio::test]
    async fn generated_frames_reach_subscribers() {
        let devices = SyntheticDevices::new().with_frames();
        let handle = devices.open_camera(&constraints()).await.unwrap();
        let mut frames = handle.video().unwrap().subscribe();

        let frame = frames.recv().await.unwrap();
        assert_eq!(&frame.data[..4], &[0, 0, 0, 1]);
        handle.stop();
    }

    #[test]
    fn keyframes_are_periodic() {
        assert_eq!(synthetic_video_frame(0, 30).data[4], 0x65);
        assert_eq!(synthetic_video_frame(1, 30).data[4], 0x41);
        assert_eq!(synthetic_video_frame(KEYFRAME_INTERVAL, 30).rtp_time, 180_000);
    }
}
