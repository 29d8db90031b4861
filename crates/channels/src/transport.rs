use std::fmt;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio::sync::broadcast,
};

use crate::error::TransportError;

/// Opaque reference to a live (or in-progress) transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(String);

impl ConnectionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A text message addressed to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundText {
    pub to: String,
    pub text: String,
}

/// What the network acknowledged for a sent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Asynchronous notifications from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The network dropped a session on its own (logout from the phone,
    /// stream error, ban).
    Disconnected {
        instance: String,
        handle: ConnectionHandle,
        reason: String,
    },
}

/// Connection to the external messaging network.
///
/// One session per instance. `connect` may take as long as the network
/// handshake needs; bounding it is the implementation's job.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Transport identifier (e.g. "loopback", "whatsapp").
    fn id(&self) -> &str;

    /// Open a session for `instance`, returning its handle once logged in.
    async fn connect(&self, instance: &str) -> Result<ConnectionHandle, TransportError>;

    /// Tear a session down. Unknown handles are ignored.
    async fn disconnect(&self, handle: &ConnectionHandle);

    /// Send a text message through an open session.
    async fn send(
        &self,
        handle: &ConnectionHandle,
        message: &OutboundText,
    ) -> Result<SendReceipt, TransportError>;

    /// Subscribe to session events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
