//! End-to-end tests for Peerdrop
//!
//! Complete workflows with a real tracker and real peers on loopback.

mod scenarios;
