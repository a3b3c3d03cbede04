//! The AP (accesspoint) packet transport boundary.
//!
//! The AP handshake and low-level packet framing are this crate's caller's
//! concern, not this crate's: this trait is an interface contract only,
//! the way the rest of the engine depends on small capability traits at
//! its edges. A host provides a concrete implementation once it has
//! completed the AP handshake.

use async_trait::async_trait;

use crate::error::SessionError;

/// A single inbound AP packet: its command byte and payload.
#[derive(Debug, Clone)]
pub struct ApPacket {
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

/// Sends packets over, and receives packets from, an established AP
/// session. `Session` is the sole owner of a transport instance.
#[async_trait]
pub trait ApTransport: Send + Sync {
    /// Sends a packet of the given type with the given payload.
    async fn send_packet(&self, packet_type: u8, payload: Vec<u8>) -> Result<(), SessionError>;

    /// Receives the next inbound packet, or `None` once the session has
    /// been gracefully disposed.
    async fn recv_packet(&self) -> Option<ApPacket>;
}
