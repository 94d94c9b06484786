//! The `client` module holds the broker-side state of one connected client.
//!
//! A `Session` translates protocol frames into broker calls on behalf of a
//! connection and cleans up after it when the connection goes away.

pub mod session;
pub use session::{Session, WsDelivery};
