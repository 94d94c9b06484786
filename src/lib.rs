//! # PopMQ
//!
//! `popmq` is the core of a message broker: queues and topics with bounded
//! memory, producer flow control, durable storage, redelivery and
//! dead-lettering. Clients reach it in-process through [`broker::Broker`] or
//! over WebSockets.
//!
//! ## Core Modules
//!
//! - `broker`: destinations, subscriptions, dispatch, transactions and the
//!   `Broker` registry with its inactive-destination GC.
//! - `cursor`: ordered pending messages with a bounded in-memory window.
//! - `store`: the `MessageStore` abstraction, in memory or backed by sled.
//! - `usage`: hierarchical byte accounting with blocking reservations.
//! - `client`: per-connection sessions.
//! - `config`: loading and defaults of the server configuration.
//! - `transport`: the JSON-over-WebSocket protocol and server.
//! - `utils`: errors and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod cursor;
pub mod store;
pub mod transport;
pub mod usage;
pub mod utils;
