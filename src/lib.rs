//! ws-fanout: a WebSocket echo benchmark server
//!
//! For every inbound JSON message the server computes one-way latency
//! against its own clock and replies with an augmented copy of the message
//! `write_factor` times (default 4). The write amplification is the point:
//! the server is a stress generator for client receive paths, not a
//! reliable delivery system.
//!
//! Features:
//! - Fan-out echo with a configurable write factor
//! - Per-connection buffered-write ceiling with silent drop past the limit
//! - Configuration via CLI arguments or TOML file
//! - Load generator binary (`loadgen`) for driving the server

pub mod config;
pub mod protocol;
pub mod server;
