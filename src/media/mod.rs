//! Local media source acquisition
//!
//! [`MediaSourceController`] owns the single current [`MediaSourceHandle`].
//! Capture backends implement [`MediaDevices`]; permission prompts make
//! their calls arbitrarily slow, so every request carries a generation
//! number and a completion that arrives after a newer request is discarded.

pub mod synthetic;
pub mod toggle;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    config::{PublisherConfig, Resolution},
    error::{BroadcastError, Result},
    model::{
        event::{BroadcastEvent, EventSender},
        tracks::{MediaSourceHandle, SourceKind, TrackState},
    },
};

pub use toggle::TrackToggleState;

/// What the caller asks the capture backend for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Preferred resolution; backends may deliver something else.
    pub ideal: Resolution,
    pub audio: bool,
    pub frame_rate: u32,
}

/// A capture backend: camera/microphone and display capture.
///
/// Both calls may suspend indefinitely while a permission prompt is open.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open camera and microphone. Fails with `PermissionDenied` or
    /// `DeviceUnavailable`.
    async fn open_camera(&self, constraints: &CaptureConstraints) -> Result<MediaSourceHandle>;

    /// Open display capture, with system/tab audio where available.
    async fn open_screen(&self, constraints: &CaptureConstraints) -> Result<MediaSourceHandle>;
}

/// What to do with the current source while a new one is being acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Stop the current tracks before asking for the new source.
    Immediately,
    /// Keep the current tracks until the new source is installed.
    OnInstall,
}

/// A pending capture request. Run it inline or spawn it.
pub struct AcquireRequest {
    generation: u64,
    kind: SourceKind,
    constraints: CaptureConstraints,
    devices: Arc<dyn MediaDevices>,
}

impl AcquireRequest {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn run(self) -> Acquisition {
        let result = match self.kind {
            SourceKind::Camera => self.devices.open_camera(&self.constraints).await,
            SourceKind::Screen => self.devices.open_screen(&self.constraints).await,
        };
        Acquisition {
            generation: self.generation,
            kind: self.kind,
            result,
        }
    }

    /// Run the request on the runtime and report the outcome as an event.
    pub fn spawn(self, events: EventSender) -> JoinHandle<()> {
        tokio::spawn(async move {
            let acquisition = self.run().await;
            if let Err(rejected) = events.send(BroadcastEvent::SourceAcquired(acquisition)) {
                // Nobody listens anymore; do not leak the capture.
                if let BroadcastEvent::SourceAcquired(acquisition) = rejected.0 {
                    acquisition.discard();
                }
            }
        })
    }
}

/// Outcome of one capture request.
#[derive(Debug)]
pub struct Acquisition {
    pub generation: u64,
    pub kind: SourceKind,
    pub result: Result<MediaSourceHandle>,
}

impl Acquisition {
    /// Stop whatever this acquisition captured.
    pub fn discard(self) {
        if let Ok(handle) = self.result {
            debug!("Discarding stale {:?} acquisition {}", self.kind, self.generation);
            handle.stop();
        }
    }
}

struct Current {
    generation: u64,
    handle: MediaSourceHandle,
    watcher: Option<JoinHandle<()>>,
}

pub struct MediaSourceController {
    devices: Arc<dyn MediaDevices>,
    camera: CaptureConstraints,
    screen: CaptureConstraints,
    latest_request: u64,
    current: Option<Current>,
    events: Option<EventSender>,
}

impl MediaSourceController {
    pub fn new(devices: Arc<dyn MediaDevices>, config: &PublisherConfig) -> Self {
        Self {
            devices,
            camera: CaptureConstraints {
                ideal: config.camera_resolution,
                audio: true,
                frame_rate: 30,
            },
            screen: CaptureConstraints {
                ideal: config.screen_resolution,
                audio: true,
                frame_rate: 30,
            },
            latest_request: 0,
            current: None,
            events: None,
        }
    }

    /// Report capture-side track endings on `events`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn current(&self) -> Option<&MediaSourceHandle> {
        self.current.as_ref().map(|c| &c.handle)
    }

    /// Generation of the installed handle, if any.
    pub fn current_generation(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.generation)
    }

    /// True if `generation` belongs to the newest request.
    pub fn is_latest(&self, generation: u64) -> bool {
        generation == self.latest_request
    }

    pub async fn acquire_camera(&mut self) -> Result<&MediaSourceHandle> {
        self.acquire(SourceKind::Camera).await
    }

    pub async fn acquire_screen(&mut self) -> Result<&MediaSourceHandle> {
        self.acquire(SourceKind::Screen).await
    }

    async fn acquire(&mut self, kind: SourceKind) -> Result<&MediaSourceHandle> {
        let request = self.request(kind, ReleasePolicy::Immediately);
        let generation = request.generation();
        let acquisition = request.run().await;
        let handle = acquisition.result?;
        self.install(generation, handle);
        // `install` cannot reject: `&mut self` kept every other request out.
        self.current()
            .ok_or_else(|| BroadcastError::DeviceUnavailable("source was released".to_string()))
    }

    /// Start a new capture request, invalidating any in-flight one.
    pub fn request(&mut self, kind: SourceKind, policy: ReleasePolicy) -> AcquireRequest {
        if policy == ReleasePolicy::Immediately {
            self.stop_current();
        }
        self.latest_request += 1;

        let constraints = match kind {
            SourceKind::Camera => self.camera,
            SourceKind::Screen => self.screen,
        };
        info!("Requesting {:?} source (generation {})", kind, self.latest_request);

        AcquireRequest {
            generation: self.latest_request,
            kind,
            constraints,
            devices: self.devices.clone(),
        }
    }

    /// Make `handle` current. The previous handle is stopped first. A
    /// handle from a superseded request is stopped instead and `false`
    /// returned.
    pub fn install(&mut self, generation: u64, handle: MediaSourceHandle) -> bool {
        if !self.is_latest(generation) {
            debug!(
                "Dropping stale acquisition {} (latest is {})",
                generation, self.latest_request
            );
            handle.stop();
            return false;
        }

        self.stop_current();

        let watcher = self.watch_capture_end(generation, &handle);
        info!(
            "Installed {:?} source (generation {}, video: {}, audio: {})",
            handle.kind(),
            generation,
            handle.video().is_some(),
            handle.audio().is_some()
        );
        self.current = Some(Current {
            generation,
            handle,
            watcher,
        });
        true
    }

    /// Stop the current source and invalidate in-flight requests. Idempotent.
    pub fn release(&mut self) {
        self.latest_request += 1;
        self.stop_current();
    }

    fn stop_current(&mut self) {
        if let Some(current) = self.current.take() {
            if let Some(watcher) = current.watcher {
                watcher.abort();
            }
            current.handle.stop();
            debug!("Stopped source generation {}", current.generation);
        }
    }

    fn watch_capture_end(
        &self,
        generation: u64,
        handle: &MediaSourceHandle,
    ) -> Option<JoinHandle<()>> {
        let events = self.events.clone()?;
        let track = handle.video().or_else(|| handle.audio())?.clone();
        let runtime = tokio::runtime::Handle::try_current().ok()?;

        Some(runtime.spawn(async move {
            if track.ended().await == TrackState::Ended {
                info!("Capture ended from the capture side (generation {})", generation);
                let _ = events.send(BroadcastEvent::CaptureEnded { generation });
            }
        }))
    }
}

impl Drop for MediaSourceController {
    fn drop(&mut self) {
        self.stop_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        media::synthetic::{Outcome, SyntheticDevices},
        model::event,
    };

    fn controller(devices: SyntheticDevices) -> MediaSourceController {
        MediaSourceController::new(Arc::new(devices), &PublisherConfig::default())
    }

    #[tokio::test]
    async fn acquiring_stops_previous_source() {
        let mut sources = controller(SyntheticDevices::new());

        let first = sources.acquire_camera().await.unwrap().clone();
        assert!(first.is_live());

        let second = sources.acquire_screen().await.unwrap().clone();
        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(second.kind(), SourceKind::Screen);
    }

    #[tokio::test]
    async fn denied_permission_leaves_no_source() {
        let mut sources = controller(SyntheticDevices::new().with_camera(Outcome::Deny));
        let err = sources.acquire_camera().await.unwrap_err();
        assert!(matches!(err, BroadcastError::PermissionDenied(_)));
        assert!(sources.current().is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let mut sources = controller(SyntheticDevices::new());
        let handle = sources.acquire_camera().await.unwrap().clone();
        sources.release();
        sources.release();
        assert!(!handle.is_live());
        assert!(sources.current().is_none());
    }

    #[tokio::test]
    async fn stale_completion_is_discarded() {
        let mut sources = controller(SyntheticDevices::new());

        let slow = sources.request(SourceKind::Camera, ReleasePolicy::Immediately);
        let fast = sources.request(SourceKind::Screen, ReleasePolicy::Immediately);

        let fast = fast.run().await;
        let fast_handle = fast.result.unwrap();
        assert!(sources.install(fast.generation, fast_handle.clone()));

        let slow = slow.run().await;
        let slow_handle = slow.result.unwrap();
        assert!(!sources.install(slow.generation, slow_handle.clone()));

        assert!(!slow_handle.is_live());
        assert!(fast_handle.is_live());
        assert_eq!(sources.current().unwrap().kind(), SourceKind::Screen);
    }

    #[tokio::test]
    async fn capture_end_is_reported_once_for_current_generation() {
        let (tx, mut rx) = event::channel();
        let mut sources = controller(SyntheticDevices::new()).with_events(tx);

        let handle = sources.acquire_screen().await.unwrap().clone();
        let generation = sources.current_generation().unwrap();
        handle.video().unwrap().end();

        match rx.recv().await {
            Some(BroadcastEvent::CaptureEnded { generation: g }) => assert_eq!(g, generation),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn local_release_is_not_a_capture_end() {
        let (tx, mut rx) = event::channel();
        let mut sources = controller(SyntheticDevices::new()).with_events(tx);

        sources.acquire_camera().await.unwrap();
        sources.release();

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
