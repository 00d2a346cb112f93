//! Data models for the publishing pipeline
//!
//! Tracks and source handles, the backend stream descriptor, and the
//! events the coordinator consumes.

pub mod event;
pub mod stream;
pub mod tracks;
