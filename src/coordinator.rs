//! Broadcast page state machine
//!
//! [`StreamingSessionCoordinator`] is the only writer of "which source" and
//! "which publish session" is current. User actions call into it directly;
//! everything asynchronous (capture prompts, capture endings, connection
//! state) comes back as a [`BroadcastEvent`] that is applied by
//! [`StreamingSessionCoordinator::process_next`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::PublisherConfig,
    error::{BroadcastError, Result},
    media::{Acquisition, MediaDevices, MediaSourceController, ReleasePolicy, TrackToggleState},
    model::{
        event::{self, BroadcastEvent, EventReceiver, EventSender, SessionEvent, SessionEventKind},
        stream::StreamDescriptor,
        tracks::{MediaSourceHandle, SourceKind},
    },
    peer::PeerConnectionFactory,
    session::PeerSessionManager,
    whip::WhipSignaling,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NoSource,
    SourceReady,
    Live,
    Stopped,
}

/// What is known about the publish connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    /// Not confirmed within the monitoring window. Not an error.
    Unknown,
    Down,
}

/// Snapshot of everything the page renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub phase: Phase,
    pub camera_on: bool,
    pub mic_on: bool,
    pub screen_sharing: bool,
    pub loading: bool,
    pub link: Option<LinkState>,
    pub error: Option<String>,
    /// For external broadcasting software.
    pub rtmp_url: Option<String>,
}

/// The on-screen video element. It may come and go independently of the
/// source.
pub trait PreviewSink: Send {
    fn attach(&mut self, handle: &MediaSourceHandle);
    fn detach(&mut self);
}

pub struct StreamingSessionCoordinator<F: PeerConnectionFactory> {
    config: PublisherConfig,
    sources: MediaSourceController,
    sessions: PeerSessionManager<F>,
    events_tx: EventSender,
    events: EventReceiver,
    descriptor: Option<StreamDescriptor>,
    toggles: TrackToggleState,
    phase: Phase,
    loading: bool,
    link: Option<LinkState>,
    error: Option<String>,
    preview: Option<Box<dyn PreviewSink>>,
    /// Generation last handed to the current preview sink.
    preview_attached: Option<u64>,
}

impl<F: PeerConnectionFactory> StreamingSessionCoordinator<F> {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        factory: F,
        whip: Arc<dyn WhipSignaling>,
        config: PublisherConfig,
    ) -> Self {
        let (events_tx, events) = event::channel();
        let sources = MediaSourceController::new(devices, &config).with_events(events_tx.clone());
        let sessions = PeerSessionManager::new(factory, whip, config.clone(), events_tx.clone());

        Self {
            config,
            sources,
            sessions,
            events_tx,
            events,
            descriptor: None,
            toggles: TrackToggleState::default(),
            phase: Phase::NoSource,
            loading: false,
            link: None,
            error: None,
            preview: None,
            preview_attached: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sources(&self) -> &MediaSourceController {
        &self.sources
    }

    pub fn sessions(&self) -> &PeerSessionManager<F> {
        &self.sessions
    }

    pub fn status(&self) -> CoordinatorStatus {
        let current = self.sources.current();
        CoordinatorStatus {
            phase: self.phase,
            camera_on: current.is_some() && self.toggles.camera_enabled,
            mic_on: current.is_some() && self.toggles.mic_enabled,
            screen_sharing: current.map(|h| h.kind() == SourceKind::Screen).unwrap_or(false),
            loading: self.loading,
            link: self.link,
            error: self.error.clone(),
            rtmp_url: self.descriptor.as_ref().map(StreamDescriptor::rtmp_url),
        }
    }

    /// Stream the page publishes to. Only used for display until going live.
    pub fn set_stream(&mut self, descriptor: StreamDescriptor) {
        self.descriptor = Some(descriptor);
    }

    pub fn select_camera(&mut self) -> u64 {
        self.select(SourceKind::Camera)
    }

    pub fn select_screen(&mut self) -> u64 {
        self.select(SourceKind::Screen)
    }

    /// Start acquiring a source. Returns the request's generation.
    ///
    /// While live the current tracks keep flowing until the new ones are
    /// attached to the senders. Otherwise the current device is released
    /// before the prompt.
    fn select(&mut self, kind: SourceKind) -> u64 {
        let policy = if self.phase == Phase::Live {
            ReleasePolicy::OnInstall
        } else {
            ReleasePolicy::Immediately
        };

        if policy == ReleasePolicy::Immediately {
            self.detach_preview();
            self.phase = Phase::NoSource;
        }

        let request = self.sources.request(kind, policy);
        let generation = request.generation();
        self.loading = true;
        self.error = None;
        request.spawn(self.events_tx.clone());
        generation
    }

    /// Wait for the next event and apply it. Returns `false` if the event
    /// stream is closed.
    pub async fn process_next(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Apply every event already queued, without waiting.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_event(&mut self, event: BroadcastEvent) {
        match event {
            BroadcastEvent::SourceAcquired(acquisition) => self.on_acquired(acquisition),
            BroadcastEvent::CaptureEnded { generation } => self.on_capture_ended(generation).await,
            BroadcastEvent::Session(event) => self.on_session_event(event).await,
        }
    }

    fn on_acquired(&mut self, acquisition: Acquisition) {
        let generation = acquisition.generation;
        if !self.sources.is_latest(generation) {
            acquisition.discard();
            return;
        }
        self.loading = false;

        let handle = match acquisition.result {
            Ok(handle) => handle,
            Err(e) => {
                warn!("{:?} acquisition {} failed: {}", acquisition.kind, generation, e);
                self.set_error(&e);
                if self.phase != Phase::Live && self.sources.current().is_none() {
                    self.phase = Phase::NoSource;
                }
                return;
            }
        };

        if self.phase == Phase::Live {
            if let Err(e) = self.sessions.replace_source(&handle) {
                warn!("Keeping current source: {}", e);
                handle.stop();
                self.set_error(&e);
                return;
            }
        }

        if !self.sources.install(generation, handle) {
            return;
        }
        self.toggles = self
            .sources
            .current()
            .map(TrackToggleState::for_handle)
            .unwrap_or_default();

        self.preview_attached = None;
        self.attach_preview();

        if self.phase != Phase::Live {
            self.phase = Phase::SourceReady;
        }
    }

    async fn on_capture_ended(&mut self, generation: u64) {
        if self.sources.current_generation() != Some(generation) {
            debug!("Ignoring capture end of stale generation {}", generation);
            return;
        }

        info!("Source ended from the capture side, going idle");
        self.sessions.stop_session().await;
        self.detach_preview();
        self.sources.release();
        self.toggles = TrackToggleState::default();
        self.phase = Phase::NoSource;
        self.link = None;
        self.loading = false;
        self.error = Some("The shared source was closed.".to_string());
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        if !self.sessions.apply_event(&event) {
            return;
        }

        match event.kind {
            SessionEventKind::Live => {
                self.link = Some(LinkState::Connected);
            }
            SessionEventKind::ConfirmationTimedOut => {
                if self.link == Some(LinkState::Connecting) {
                    self.link = Some(LinkState::Unknown);
                }
            }
            SessionEventKind::Failed(reason) => {
                warn!("{}: {}", event.session, reason);
                self.sessions.stop_session().await;
                self.link = Some(LinkState::Down);
                self.set_error(&BroadcastError::TransportError(reason));
                self.phase = self.idle_phase();
            }
            SessionEventKind::Ended => {
                self.sessions.stop_session().await;
                self.link = Some(LinkState::Down);
                if self.phase == Phase::Live {
                    self.phase = Phase::Stopped;
                }
            }
        }
    }

    pub fn toggle_camera(&mut self) -> bool {
        match self.sources.current() {
            Some(handle) => self.toggles.toggle_camera(handle),
            None => false,
        }
    }

    pub fn toggle_mic(&mut self) -> bool {
        match self.sources.current() {
            Some(handle) => self.toggles.toggle_mic(handle),
            None => false,
        }
    }

    /// Publish the current source to `descriptor`'s ingest endpoint.
    ///
    /// Retryable failures are retried with a doubling backoff, each time on a
    /// fresh connection. A failure leaves the source in place.
    pub async fn go_live(&mut self, descriptor: &StreamDescriptor) -> Result<()> {
        if self.phase == Phase::Live {
            return Ok(());
        }
        let Some(handle) = self.sources.current().cloned() else {
            let e = BroadcastError::DeviceUnavailable("no source selected".into());
            self.set_error(&e);
            return Err(e);
        };

        self.descriptor = Some(descriptor.clone());
        self.loading = true;
        self.error = None;

        let mut attempt = 0;
        let result = loop {
            match self.sessions.start_session(&handle, descriptor).await {
                Ok(id) => break Ok(id),
                Err(e) if e.is_retryable() && attempt < self.config.publish_retries => {
                    attempt += 1;
                    let wait = self.config.retry_backoff(attempt);
                    warn!("Publish attempt {} failed ({}), retrying in {:?}", attempt, e, wait);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => break Err(e),
            }
        };
        self.loading = false;

        match result {
            Ok(id) => {
                info!("Live on stream {} ({})", descriptor.stream_id, id);
                self.phase = Phase::Live;
                self.link = Some(LinkState::Connecting);
                Ok(())
            }
            Err(e) => {
                self.set_error(&e);
                self.link = None;
                self.phase = self.idle_phase();
                Err(e)
            }
        }
    }

    /// End the broadcast and keep the source for a later `go_live`.
    pub async fn stop_broadcast(&mut self) {
        self.sessions.stop_session().await;
        self.link = None;
        if self.phase == Phase::Live {
            self.phase = Phase::Stopped;
        }
    }

    /// End any broadcast and turn the capture off.
    pub async fn release_source(&mut self) {
        self.sessions.stop_session().await;
        self.detach_preview();
        self.sources.release();
        self.toggles = TrackToggleState::default();
        self.link = None;
        self.loading = false;
        self.phase = Phase::NoSource;
    }

    /// The preview element became available. The current source, if any,
    /// is attached to it right away.
    pub fn set_preview(&mut self, sink: Box<dyn PreviewSink>) {
        self.detach_preview();
        self.preview = Some(sink);
        self.attach_preview();
    }

    /// The preview element went away.
    pub fn clear_preview(&mut self) {
        self.detach_preview();
        self.preview = None;
    }

    fn attach_preview(&mut self) {
        let Some(generation) = self.sources.current_generation() else {
            return;
        };
        if self.preview_attached == Some(generation) {
            return;
        }
        let (Some(sink), Some(handle)) = (self.preview.as_mut(), self.sources.current()) else {
            debug!("No preview yet, deferring attachment of generation {}", generation);
            return;
        };
        sink.attach(handle);
        self.preview_attached = Some(generation);
    }

    fn detach_preview(&mut self) {
        if self.preview_attached.take().is_some() {
            if let Some(sink) = self.preview.as_mut() {
                sink.detach();
            }
        }
    }

    fn idle_phase(&self) -> Phase {
        if self.sources.current().is_some() {
            Phase::SourceReady
        } else {
            Phase::NoSource
        }
    }

    fn set_error(&mut self, e: &BroadcastError) {
        self.error = Some(e.user_message());
    }
}
