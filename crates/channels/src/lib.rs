//! Messaging-network transports.
//!
//! A transport owns the actual sessions to the network (WhatsApp and
//! friends). The gateway only sees the [`ChannelTransport`] trait: connect,
//! disconnect, send, and a stream of session events.

pub mod error;
pub mod loopback;
pub mod transport;

pub use {
    error::TransportError,
    loopback::LoopbackTransport,
    transport::{ChannelTransport, ConnectionHandle, OutboundText, SendReceipt, TransportEvent},
};
