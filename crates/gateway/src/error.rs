use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde::Serialize,
};

use switchboard_channels::TransportError;

use crate::registry::InstanceState;

/// Why a credential was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    Missing,
    Invalid,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
        })
    }
}

/// Why an existing instance cannot serve a logged-in operation yet.
///
/// Clients use this to decide between waiting (`Connecting`) and issuing a
/// connect (`NeverConnected`, `Disconnected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotLoggedIn {
    NeverConnected,
    Connecting,
    Disconnected,
}

impl NotLoggedIn {
    /// The block that applies to `state`, or `None` when it is logged in.
    pub fn for_state(state: InstanceState) -> Option<Self> {
        match state {
            InstanceState::Connected => None,
            InstanceState::Connecting => Some(Self::Connecting),
            InstanceState::Disconnected => Some(Self::Disconnected),
            InstanceState::Uncreated | InstanceState::Created => Some(Self::NeverConnected),
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::NeverConnected => "instance_not_connected",
            Self::Connecting => "instance_connecting",
            Self::Disconnected => "instance_disconnected",
        }
    }
}

/// Every failure an instance operation can end with.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("instance \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("instance \"{0}\" not found")]
    NotFound(String),

    #[error("instance \"{name}\" cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("credential {0}")]
    Unauthorized(AuthFailure),

    #[error("instance \"{name}\" is not logged in ({})", .reason.reason())]
    Forbidden { name: String, reason: NotLoggedIn },

    #[error("invalid instance name: {0}")]
    InvalidName(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AlreadyExists(_) | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::InvalidName(_) | Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "instance_already_exists",
            Self::NotFound(_) => "instance_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Unauthorized(AuthFailure::Missing) => "credential_missing",
            Self::Unauthorized(AuthFailure::Invalid) => "credential_invalid",
            Self::Forbidden { reason, .. } => reason.reason(),
            Self::InvalidName(_) => "invalid_instance_name",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Transport(_) => "transport_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorShape<'a>,
}

#[derive(Serialize)]
struct ErrorShape<'a> {
    status: u16,
    reason: &'a str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorShape {
                status: status.as_u16(),
                reason: self.reason(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
