//! Browser-style WebRTC publishing over WHIP
//!
//! Capture a camera or screen source, publish it to a WHIP ingest endpoint
//! with H.264 preferred and a capped video bitrate, swap sources while live
//! without renegotiating, and follow the connection until it ends.
//!
//! [`coordinator::StreamingSessionCoordinator`] ties the pieces together.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod model;
pub mod peer;
pub mod sdp;
pub mod server;
pub mod session;
pub mod testing;
pub mod util;
pub mod whip;

pub use config::PublisherConfig;
pub use coordinator::{CoordinatorStatus, LinkState, Phase, StreamingSessionCoordinator};
pub use error::{BroadcastError, Result};
pub use media::MediaSourceController;
pub use model::stream::StreamDescriptor;
pub use session::{PeerSessionManager, PublishState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
