//! The `transport` module exposes the broker to remote clients over
//! WebSockets.
//!
//! It defines the JSON frames exchanged with clients and the server that
//! feeds them to per-connection sessions.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod websocket_tests;
