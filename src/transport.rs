//! Relay transport abstraction.
//!
//! The protocol core only consumes this interface; WebSocket framing and
//! reconnection policy belong to the transport implementation. Inbound
//! `(topic, ciphertext)` pairs are fed back into
//! [`WalletConnectSession::handle_transport_message`](crate::session::WalletConnectSession::handle_transport_message)
//! by whatever task drives the transport.
//!
//! Methods take `&self` so the session, holding one transport value, can run
//! concurrent sends without external synchronization; implementations use
//! interior mutability.

use crate::error::Result;

pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Must be safe to call even if `connect` was never called.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
}
