use std::{sync::Arc, time::Instant};

use axum::http::HeaderMap;

use {switchboard_channels::ChannelTransport, switchboard_config::DispatchConfig};

use crate::{
    auth::{AuthContext, AuthStrategy},
    dispatch::DispatchController,
    guards::GuardPipeline,
    instances::InstanceController,
    registry::InstanceRegistry,
};

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// Server version string.
    pub version: String,
    pub started_at: Instant,
    /// Selected once at startup; never swapped.
    pub strategy: Arc<dyn AuthStrategy>,
    pub registry: Arc<InstanceRegistry>,
    pub transport: Arc<dyn ChannelTransport>,
    pub instances: Arc<InstanceController>,
    pub dispatch: DispatchController,
    /// existence → login → auth
    pub logged_in: GuardPipeline,
    /// existence → auth
    pub lifecycle: GuardPipeline,
}

impl GatewayState {
    pub fn new(
        strategy: Arc<dyn AuthStrategy>,
        transport: Arc<dyn ChannelTransport>,
        dispatch: &DispatchConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(InstanceRegistry::new());
        Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            instances: Arc::new(InstanceController::new(
                Arc::clone(&registry),
                Arc::clone(&transport),
                Arc::clone(&strategy),
            )),
            dispatch: DispatchController::new(
                Arc::clone(&registry),
                Arc::clone(&transport),
                dispatch,
            ),
            logged_in: GuardPipeline::logged_in(Arc::clone(&registry), Arc::clone(&strategy)),
            lifecycle: GuardPipeline::lifecycle(Arc::clone(&registry), Arc::clone(&strategy)),
            strategy,
            registry,
            transport,
        })
    }

    /// Auth context for one request.
    pub fn auth_context(&self, headers: &HeaderMap) -> AuthContext {
        AuthContext::from_headers(headers)
    }

    /// Number of live instances.
    pub async fn instance_count(&self) -> usize {
        self.registry.len().await
    }
}
