//! Squirrel relays log lines from one broadcaster to any number of remote
//! subscribers over websockets.
//!
//! A single [`hub::Hub`] task owns the connection registry; each accepted
//! socket runs a read pump feeding the hub and a write pump draining its
//! outbound queue.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod telemetry;
