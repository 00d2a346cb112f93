//! Events flowing back into the coordinator
//!
//! Capture prompts, track endings and connection-state changes all arrive
//! asynchronously. Each event names the acquisition generation or publish
//! session it belongs to, so the coordinator can drop stale ones.

use std::{fmt, ops::Deref};

use tokio::sync::mpsc;

use crate::media::Acquisition;

pub type EventSender = mpsc::UnboundedSender<BroadcastEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BroadcastEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug)]
pub enum BroadcastEvent {
    /// A capture request finished, successfully or not.
    SourceAcquired(Acquisition),

    /// The capture side ended the video track of the given acquisition.
    CaptureEnded { generation: u64 },

    /// A publish session changed state.
    Session(SessionEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

impl Deref for SessionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// The connection is confirmed established.
    Live,

    /// ICE/DTLS failure after the answer was applied.
    Failed(String),

    /// The connection closed.
    Ended,

    /// The monitoring window elapsed without a confirmed connection.
    ConfirmationTimedOut,
}
