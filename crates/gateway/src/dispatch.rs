//! Outbound messages through a logged-in instance.

use std::{sync::Arc, time::Duration};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use {
    switchboard_channels::{ChannelTransport, OutboundText},
    switchboard_config::DispatchConfig,
};

use crate::{
    error::{GatewayError, NotLoggedIn},
    guards::Admission,
    registry::{InstanceRegistry, InstanceState},
};

/// Per-call send options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    /// Pause before transmitting, in milliseconds. Pacing bursts keeps the
    /// network from flagging the account. Unset means the configured default.
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTextRequest {
    pub number: String,
    pub text: String,
    #[serde(default)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub message_id: String,
    pub instance: String,
    pub to: String,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

pub struct DispatchController {
    registry: Arc<InstanceRegistry>,
    transport: Arc<dyn ChannelTransport>,
    max_delay: Duration,
    default_delay: Duration,
}

/// Accepts `+15550001234`-style numbers, or a full address containing `@`
/// which is passed through untouched.
fn validate_recipient(number: &str) -> Result<String, GatewayError> {
    let number = number.trim();
    if number.contains('@') {
        return Ok(number.to_string());
    }
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(GatewayError::InvalidPayload(format!(
            "\"{number}\" is not a phone number"
        )));
    }
    Ok(digits.to_string())
}

impl DispatchController {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        transport: Arc<dyn ChannelTransport>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            max_delay: Duration::from_millis(config.max_delay_ms),
            default_delay: Duration::from_millis(config.default_delay_ms),
        }
    }

    /// Send a text message through an admitted, logged-in instance.
    ///
    /// After the delay the instance is re-read: unless it is still connected
    /// on the session it was admitted with, the send fails with `Forbidden`
    /// instead of reaching the transport. Transport failures are returned
    /// as-is, never retried.
    pub async fn send_text(
        &self,
        admission: &Admission,
        request: SendTextRequest,
    ) -> Result<SendResult, GatewayError> {
        let name = admission.instance().name();
        if !admission.logged_in() {
            return Err(GatewayError::Forbidden {
                name: name.to_string(),
                reason: NotLoggedIn::for_state(admission.instance().state())
                    .unwrap_or(NotLoggedIn::NeverConnected),
            });
        }
        let to = validate_recipient(&request.number)?;
        if request.text.trim().is_empty() {
            return Err(GatewayError::InvalidPayload("text is empty".into()));
        }

        let delay = request
            .options
            .delay
            .map_or(self.default_delay, Duration::from_millis)
            .min(self.max_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let current = self.registry.get(name).await?;
        let admitted = admission.instance().handle();
        let handle = match (current.state(), current.handle()) {
            (InstanceState::Connected, Some(handle)) if Some(handle) == admitted => handle.clone(),
            (InstanceState::Connected, _) => {
                // Reconnected on a session this request was never admitted to.
                return Err(GatewayError::Forbidden {
                    name: name.to_string(),
                    reason: NotLoggedIn::Disconnected,
                });
            },
            (state, _) => {
                return Err(GatewayError::Forbidden {
                    name: name.to_string(),
                    reason: NotLoggedIn::for_state(state).unwrap_or(NotLoggedIn::Disconnected),
                });
            },
        };

        let message = OutboundText {
            to: to.clone(),
            text: request.text,
        };
        let receipt = self.transport.send(&handle, &message).await.map_err(|e| {
            warn!(instance = name, to = %to, error = %e, "send failed");
            GatewayError::from(e)
        })?;
        info!(
            instance = name,
            message_id = %receipt.message_id,
            delay_ms = delay.as_millis() as u64,
            "message sent"
        );

        Ok(SendResult {
            message_id: receipt.message_id,
            instance: name.to_string(),
            to,
            status: "sent",
            timestamp: receipt.timestamp,
        })
    }
}
