/// Failures reported by a [`ChannelTransport`](crate::ChannelTransport).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("send rejected: {0}")]
    Rejected(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}
