//! Publish session management
//!
//! [`PeerSessionManager`] owns at most one [`PublishSession`]: a peer
//! connection plus the WHIP resource it was published to. Connection-state
//! changes are watched by a monitor task that turns them into
//! [`SessionEvent`]s. Notifications are backed by polling for a bounded
//! window after the session starts, since some runtimes never deliver them.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    config::PublisherConfig,
    error::{BroadcastError, Result},
    model::{
        event::{BroadcastEvent, EventSender, SessionEvent, SessionEventKind, SessionId},
        stream::StreamDescriptor,
        tracks::{MediaSourceHandle, TrackKind},
    },
    peer::{
        ConnectionState, PeerConnection, PeerConnectionFactory, PeerSettings, SenderId,
        StateProbe,
    },
    sdp,
    whip::WhipSignaling,
};

/// Lifecycle of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
    Idle,
    Negotiating,
    Live,
    Ended,
    Failed,
}

impl PublishState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PublishState::Ended | PublishState::Failed)
    }

    fn accepts(self, next: PublishState) -> bool {
        use PublishState::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Negotiating, Live)
                | (Negotiating, Failed)
                | (Negotiating, Ended)
                | (Live, Failed)
                | (Live, Ended)
        )
    }
}

pub struct PublishSession<P> {
    id: SessionId,
    endpoint: String,
    token: String,
    peer: P,
    resource_url: Option<String>,
    state: PublishState,
    senders: BTreeMap<TrackKind, SenderId>,
    started_at: DateTime<Utc>,
    monitor: Option<JoinHandle<()>>,
}

impl<P: PeerConnection> PublishSession<P> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn resource_url(&self) -> Option<&str> {
        self.resource_url.as_deref()
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn sender(&self, kind: TrackKind) -> Option<SenderId> {
        self.senders.get(&kind).copied()
    }

    /// Track kinds this session publishes. Fixed at creation.
    pub fn kinds(&self) -> impl Iterator<Item = TrackKind> + '_ {
        self.senders.keys().copied()
    }

    /// Max bitrate currently set on the video sender.
    pub fn video_bitrate_cap(&self) -> Option<u64> {
        let sender = self.sender(TrackKind::Video)?;
        self.peer.parameters(sender)?.max_bitrate_bps
    }

    fn transition(&mut self, next: PublishState) -> bool {
        if !self.state.accepts(next) {
            return false;
        }
        info!("{}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        true
    }

    fn apply_video_cap(&mut self, max_bitrate_bps: u64) -> Result<()> {
        let Some(sender) = self.sender(TrackKind::Video) else {
            return Ok(());
        };
        let mut params = self.peer.parameters(sender).unwrap_or_default();
        params.max_bitrate_bps = Some(max_bitrate_bps);
        self.peer.set_parameters(sender, params)
    }
}

pub struct PeerSessionManager<F: PeerConnectionFactory> {
    factory: F,
    whip: Arc<dyn WhipSignaling>,
    config: PublisherConfig,
    events: EventSender,
    session: Option<PublishSession<F::Peer>>,
    next_id: u64,
}

impl<F: PeerConnectionFactory> PeerSessionManager<F> {
    pub fn new(
        factory: F,
        whip: Arc<dyn WhipSignaling>,
        config: PublisherConfig,
        events: EventSender,
    ) -> Self {
        Self {
            factory,
            whip,
            config,
            events,
            session: None,
            next_id: 0,
        }
    }

    pub fn session(&self) -> Option<&PublishSession<F::Peer>> {
        self.session.as_ref()
    }

    pub fn state(&self) -> PublishState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(PublishState::Idle)
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Publish `handle` to the ingest endpoint of `descriptor`.
    ///
    /// Any previous session is stopped first and a fresh peer connection is
    /// always created. On failure nothing is retained.
    pub async fn start_session(
        &mut self,
        handle: &MediaSourceHandle,
        descriptor: &StreamDescriptor,
    ) -> Result<SessionId> {
        self.stop_session().await;

        if handle.tracks().next().is_none() {
            return Err(BroadcastError::SourceMismatch(
                "source has no tracks to publish".into(),
            ));
        }

        self.next_id += 1;
        let id = SessionId(self.next_id);
        let settings = PeerSettings::from_config(&self.config, descriptor.stream_id.to_string());
        let peer = self.factory.create(&settings)?;

        let mut session = PublishSession {
            id,
            endpoint: self.config.whip_url(descriptor),
            token: descriptor.mediamtx_jwt.clone(),
            peer,
            resource_url: None,
            state: PublishState::Idle,
            senders: BTreeMap::new(),
            started_at: Utc::now(),
            monitor: None,
        };
        session.transition(PublishState::Negotiating);

        if let Err(e) = self.negotiate(&mut session, handle).await {
            warn!("{}: publish failed: {}", id, e);
            session.transition(PublishState::Failed);
            self.teardown(&mut session).await;
            return Err(e);
        }

        session.monitor = Some(tokio::spawn(monitor(
            id,
            session.peer.state_probe(),
            self.events.clone(),
            self.config.state_poll_interval(),
            self.config.state_poll_window(),
        )));
        info!(
            "{}: published stream {} to {}",
            id, descriptor.stream_id, session.endpoint
        );
        self.session = Some(session);
        Ok(id)
    }

    async fn negotiate(
        &self,
        session: &mut PublishSession<F::Peer>,
        handle: &MediaSourceHandle,
    ) -> Result<()> {
        let codec = &self.config.preferred_video_codec;

        for track in handle.tracks() {
            let sender = session.peer.add_send_transceiver(track)?;
            if track.kind() == TrackKind::Video && !session.peer.set_codec_preferences(sender, codec)
            {
                debug!("Transceiver codec preference unsupported, relying on SDP rewrite");
            }
            session.senders.insert(track.kind(), sender);
        }

        let offer = session.peer.create_offer()?;
        let offer = sdp::prefer_codec(&offer, codec);

        let answer = tokio::time::timeout(
            self.config.negotiation_timeout(),
            self.whip.publish(&session.endpoint, &session.token, &offer),
        )
        .await
        .map_err(|_| {
            BroadcastError::NegotiationFailed(format!(
                "no answer within {}s",
                self.config.negotiation_timeout_secs
            ))
        })??;

        session.resource_url = answer.resource_url;
        session.peer.set_remote_answer(&answer.sdp)?;
        session.apply_video_cap(self.config.max_video_bitrate_bps)
    }

    /// Feed the tracks of `handle` into the existing senders in place.
    ///
    /// No renegotiation happens. If `handle` lacks a kind the session
    /// publishes, nothing is changed. Without a session this is a no-op.
    pub fn replace_source(&mut self, handle: &MediaSourceHandle) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if let Some(missing) = session.kinds().find(|k| handle.track(*k).is_none()) {
            return Err(BroadcastError::SourceMismatch(format!(
                "new {:?} source has no {} track",
                handle.kind(),
                missing
            )));
        }

        for (kind, sender) in &session.senders {
            if let Some(track) = handle.track(*kind) {
                session.peer.replace_track(*sender, track)?;
            }
        }
        session.apply_video_cap(self.config.max_video_bitrate_bps)?;

        info!("{}: switched to {:?} source", session.id, handle.kind());
        Ok(())
    }

    /// Close the connection and release the remote resource. Idempotent.
    pub async fn stop_session(&mut self) -> Option<SessionId> {
        let mut session = self.session.take()?;
        session.transition(PublishState::Ended);
        self.teardown(&mut session).await;

        let elapsed = Utc::now() - session.started_at;
        info!("{}: stopped after {}s", session.id, elapsed.num_seconds());
        Some(session.id)
    }

    async fn teardown(&self, session: &mut PublishSession<F::Peer>) {
        if let Some(monitor) = session.monitor.take() {
            monitor.abort();
        }
        session.peer.close();

        let Some(resource) = session.resource_url.take() else {
            return;
        };
        let released = tokio::time::timeout(
            self.config.negotiation_timeout(),
            self.whip.terminate(&resource, &session.token),
        )
        .await;
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: releasing {} failed: {}", session.id, resource, e),
            Err(_) => warn!("{}: releasing {} timed out", session.id, resource),
        }
    }

    /// Fold a monitor event into the current session's state. Returns
    /// `false` for events of a session that is no longer current.
    pub fn apply_event(&mut self, event: &SessionEvent) -> bool {
        let Some(session) = self.session.as_mut().filter(|s| s.id == event.session) else {
            debug!("Ignoring event of stale {}: {:?}", event.session, event.kind);
            return false;
        };

        match &event.kind {
            SessionEventKind::Live => {
                session.transition(PublishState::Live);
            }
            SessionEventKind::Failed(_) => {
                session.transition(PublishState::Failed);
            }
            SessionEventKind::Ended => {
                session.transition(PublishState::Ended);
            }
            SessionEventKind::ConfirmationTimedOut => {}
        }
        true
    }
}

/// Watch one connection and report what it does.
///
/// Polling runs alongside change notifications until the connection is
/// confirmed or `window` elapses; after that only notifications count.
async fn monitor(
    session: SessionId,
    mut probe: StateProbe,
    events: EventSender,
    poll_interval: Duration,
    window: Duration,
) {
    let emit = |kind: SessionEventKind| {
        let _ = events.send(BroadcastEvent::Session(SessionEvent { session, kind }));
    };

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut polling = true;
    let mut confirmed = false;

    loop {
        let observed = tokio::select! {
            changed = probe.changed() => {
                if changed.is_err() {
                    break;
                }
                *probe.borrow_and_update()
            }
            _ = ticker.tick(), if polling => *probe.borrow(),
            _ = &mut deadline, if polling => {
                polling = false;
                if !confirmed {
                    info!("{}: connection not confirmed within {:?}", session, window);
                    emit(SessionEventKind::ConfirmationTimedOut);
                }
                continue;
            }
        };

        match observed {
            ConnectionState::Connected if !confirmed => {
                confirmed = true;
                polling = false;
                emit(SessionEventKind::Live);
            }
            ConnectionState::Disconnected => {
                info!("{}: connection interrupted", session);
            }
            ConnectionState::Failed => {
                emit(SessionEventKind::Failed("connection failed".into()));
                break;
            }
            ConnectionState::Closed => {
                emit(SessionEventKind::Ended);
                break;
            }
            _ => {}
        }
    }

    debug!("{}: monitor stopped", session);
}
