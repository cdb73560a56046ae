//! Peerdrop Tracker - JSON control-plane server

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
//!
//! Exposes the peer registry over HTTP: one JSON POST route per control
//! message, plus descriptor publishing and a peer listing.

pub mod handlers;
pub mod server;

// Re-export main types
pub use server::{TrackerHandle, build_router, spawn_tracker};
