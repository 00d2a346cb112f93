use std::{
    collections::HashMap,
    fmt,
    net::UdpSocket,
    ops::Deref,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use str0m::{
    media::{MediaData, MediaKind, Mid},
    Event, IceConnectionState, Input, Output, Rtc,
};
use tracing::{debug, info, warn};

use crate::server::IngestStats;

/// One publisher connected to the ingest sink.
#[derive(Debug)]
pub struct IngestClient {
    pub id: ResourceId,
    pub rtc: Rtc,
    media: HashMap<Mid, MediaKind>,
    frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u64);

impl ResourceId {
    pub fn next() -> ResourceId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        ResourceId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for ResourceId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl IngestClient {
    pub fn new(id: ResourceId, rtc: Rtc) -> IngestClient {
        IngestClient {
            id,
            rtc,
            media: HashMap::new(),
            frames: 0,
        }
    }

    pub fn accepts(&self, input: &Input) -> bool {
        self.rtc.accepts(input)
    }

    pub fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Publisher {} disconnected: {:?}", self.id, e);
            self.rtc.disconnect();
        }
    }

    /// Drive output until str0m asks to be woken at a timeout.
    pub fn poll_until_timeout(&mut self, socket: &UdpSocket, stats: &IngestStats) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                // Removed on the next pass of the media loop.
                return Instant::now();
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return t,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = socket.send_to(&transmit.contents, transmit.destination) {
                        warn!("Publisher {}: send to {} failed: {}", self.id, transmit.destination, e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event, stats),
                Err(e) => {
                    warn!("Publisher {} poll_output failed: {:?}", self.id, e);
                    self.rtc.disconnect();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event, stats: &IngestStats) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("Publisher {}: ICE state = {:?}", self.id, state);
                if state == IceConnectionState::Disconnected {
                    self.rtc.disconnect();
                }
            }
            Event::Connected => info!("Publisher {} connected", self.id),
            Event::MediaAdded(added) => {
                info!("Publisher {}: {:?} on {:?}", self.id, added.kind, added.mid);
                self.media.insert(added.mid, added.kind);
            }
            Event::MediaData(data) => self.handle_media_data(data, stats),
            other => debug!("Publisher {}: {:?}", self.id, other),
        }
    }

    fn handle_media_data(&mut self, data: MediaData, stats: &IngestStats) {
        self.frames += 1;
        stats.frames.fetch_add(1, Ordering::Relaxed);

        if self.frames == 1 {
            let kind = self.media.get(&data.mid).copied();
            info!(
                "Publisher {}: first media on {:?} ({:?}, {} bytes)",
                self.id,
                data.mid,
                kind,
                data.data.len()
            );
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}
