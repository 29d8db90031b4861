//! In-process transport that simulates a messaging network.
//!
//! Sessions live in memory; sent messages are recorded instead of leaving
//! the process. Used by the development server and by tests.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::Utc,
    dashmap::DashMap,
    tokio::sync::broadcast,
    tracing::{debug, info},
};

use switchboard_config::TransportConfig;

use crate::{
    error::TransportError,
    transport::{ChannelTransport, ConnectionHandle, OutboundText, SendReceipt, TransportEvent},
};

const EVENT_CAPACITY: usize = 64;
/// Only the most recent messages are kept for inspection.
const SENT_LOG_CAPACITY: usize = 256;

/// A message the loopback transport accepted.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub instance: String,
    pub handle: ConnectionHandle,
    pub message: OutboundText,
    pub message_id: String,
}

pub struct LoopbackTransport {
    /// handle → instance name
    sessions: DashMap<ConnectionHandle, String>,
    latency: Duration,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
    connect_calls: AtomicUsize,
    send_calls: AtomicUsize,
    sent: Mutex<VecDeque<SentMessage>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: DashMap::new(),
            latency: Duration::ZERO,
            fail_connect: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            sent: Mutex::new(VecDeque::with_capacity(SENT_LOG_CAPACITY)),
            events,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        let transport = Self::new().with_latency(Duration::from_millis(config.connect_latency_ms));
        transport.set_fail_connect(config.fail_connect);
        transport
    }

    /// Delay every handshake by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_open(&self, handle: &ConnectionHandle) -> bool {
        self.sessions.contains_key(handle)
    }

    /// The most recently accepted messages, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate the network dropping a session. Returns false if the handle
    /// was not open.
    pub fn drop_session(&self, handle: &ConnectionHandle, reason: &str) -> bool {
        let Some((handle, instance)) = self.sessions.remove(handle) else {
            return false;
        };
        info!(instance = %instance, handle = %handle, reason, "loopback session dropped");
        // No subscribers is fine.
        let _ = self.events.send(TransportEvent::Disconnected {
            instance,
            handle,
            reason: reason.to_string(),
        });
        true
    }
}

#[async_trait]
impl ChannelTransport for LoopbackTransport {
    fn id(&self) -> &str {
        "loopback"
    }

    async fn connect(&self, instance: &str) -> Result<ConnectionHandle, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        // The outcome is fixed when the handshake starts.
        let refuse = self.fail_connect.load(Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if refuse {
            return Err(TransportError::Handshake(format!(
                "loopback refused session for {instance}"
            )));
        }
        let handle = ConnectionHandle::new(format!("loopback:{}", uuid::Uuid::new_v4()));
        self.sessions.insert(handle.clone(), instance.to_string());
        debug!(instance, handle = %handle, "loopback session opened");
        Ok(handle)
    }

    async fn disconnect(&self, handle: &ConnectionHandle) {
        if self.sessions.remove(handle).is_some() {
            debug!(handle = %handle, "loopback session closed");
        }
    }

    async fn send(
        &self,
        handle: &ConnectionHandle,
        message: &OutboundText,
    ) -> Result<SendReceipt, TransportError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let instance = self
            .sessions
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::SessionClosed(handle.to_string()))?;
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!(
                "loopback refused message to {}",
                message.to
            )));
        }

        let receipt = SendReceipt {
            message_id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            timestamp: Utc::now(),
        };
        if let Ok(mut sent) = self.sent.lock() {
            if sent.len() == SENT_LOG_CAPACITY {
                sent.pop_front();
            }
            sent.push_back(SentMessage {
                instance,
                handle: handle.clone(),
                message: message.clone(),
                message_id: receipt.message_id.clone(),
            });
        }
        Ok(receipt)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(to: &str) -> OutboundText {
        OutboundText {
            to: to.into(),
            text: "hi".into(),
        }
    }

    #[tokio::test]
    async fn connect_send_disconnect() {
        let transport = LoopbackTransport::new();
        let handle = transport.connect("acct1").await.unwrap();
        assert!(transport.is_open(&handle));

        let receipt = transport.send(&handle, &text("15550001")).await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].instance, "acct1");
        assert_eq!(sent[0].message_id, receipt.message_id);

        transport.disconnect(&handle).await;
        assert!(!transport.is_open(&handle));
        let err = transport.send(&handle, &text("15550001")).await.unwrap_err();
        assert!(matches!(err, TransportError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn sent_log_is_bounded() {
        let transport = LoopbackTransport::new();
        let handle = transport.connect("acct1").await.unwrap();
        let mut last = String::new();
        for i in 0..SENT_LOG_CAPACITY + 10 {
            last = transport
                .send(&handle, &text(&i.to_string()))
                .await
                .unwrap()
                .message_id;
        }
        let sent = transport.sent();
        assert_eq!(sent.len(), SENT_LOG_CAPACITY);
        assert_eq!(sent[0].message.to, "10");
        assert_eq!(sent[SENT_LOG_CAPACITY - 1].message_id, last);
        assert_eq!(transport.send_calls(), SENT_LOG_CAPACITY + 10);
    }

    #[tokio::test]
    async fn failing_handshake() {
        let transport = LoopbackTransport::new();
        transport.set_fail_connect(true);
        let err = transport.connect("acct1").await.unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)));
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(transport.session_count(), 0);
    }

    #[tokio::test]
    async fn dropped_session_emits_event() {
        let transport = LoopbackTransport::new();
        let mut events = transport.subscribe();
        let handle = transport.connect("acct1").await.unwrap();

        assert!(transport.drop_session(&handle, "logged out from phone"));
        assert!(!transport.drop_session(&handle, "again"));

        let TransportEvent::Disconnected {
            instance,
            handle: dropped,
            ..
        } = events.recv().await.unwrap();
        assert_eq!(instance, "acct1");
        assert_eq!(dropped, handle);
    }

    #[tokio::test]
    async fn config_enables_failure_injection() {
        let transport = LoopbackTransport::from_config(&TransportConfig {
            connect_latency_ms: 0,
            fail_connect: true,
        });
        assert!(transport.connect("acct1").await.is_err());
    }
}
