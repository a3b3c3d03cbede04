//! The dealer: Spotify's WebSocket message bus.
//!
//! [`connection::Dealer`] is a single authenticated connection; [`session::
//! DealerSession`] wraps it with reconnect orchestration kept out of the
//! Dealer itself.

pub mod connection;
pub mod frame;
pub mod session;

pub use connection::{ApResolveDealerResolver, Dealer, DealerResolver};
pub use frame::{DealerFrame, MessageFrame, RequestFrame};
pub use session::DealerSession;
