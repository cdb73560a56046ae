//! Integration tests for Peerdrop
//!
//! These tests exercise component interactions over loopback: the HTTP
//! tracker with its client, and the scheduler with the TCP piece protocol.

#[path = "integration/control_plane.rs"]
mod control_plane;
#[path = "integration/piece_transfer.rs"]
mod piece_transfer;
