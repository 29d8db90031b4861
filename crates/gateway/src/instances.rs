//! Instance lifecycle: create, connect, query, logout, delete, and the
//! reaction to sessions the network drops on its own.

use std::sync::Arc;

use {
    serde::Serialize,
    tokio::{sync::broadcast::error::RecvError, task::JoinHandle},
    tracing::{debug, info, warn},
};

use switchboard_channels::{ChannelTransport, ConnectionHandle, TransportEvent};

use crate::{
    auth::AuthStrategy,
    error::GatewayError,
    registry::{Instance, InstanceRegistry, InstanceState},
};

const MAX_NAME_LEN: usize = 64;

/// Result of a create: the instance plus its credential when the active
/// strategy issues one.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedInstance {
    pub instance: Instance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Result of a successful connect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionResult {
    pub instance: Instance,
}

/// Result of [`InstanceController::init_instance`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum InitOutcome {
    /// Already registered; returned untouched.
    Existing { instance: Instance },
    /// Registered by this call and connected.
    Created {
        instance: Instance,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

pub struct InstanceController {
    registry: Arc<InstanceRegistry>,
    transport: Arc<dyn ChannelTransport>,
    strategy: Arc<dyn AuthStrategy>,
}

/// Names are used in URL paths and logs.
pub fn validate_name(name: &str) -> Result<(), GatewayError> {
    if name.is_empty() {
        return Err(GatewayError::InvalidName("name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(GatewayError::InvalidName(format!(
            "name is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(GatewayError::InvalidName(format!(
            "character {c:?} is not allowed"
        )));
    }
    Ok(())
}

impl InstanceController {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        transport: Arc<dyn ChannelTransport>,
        strategy: Arc<dyn AuthStrategy>,
    ) -> Self {
        Self {
            registry,
            transport,
            strategy,
        }
    }

    /// Register a new instance. Does not connect it.
    pub fn create_instance(&self, name: &str) -> Result<CreatedInstance, GatewayError> {
        validate_name(name)?;
        let instance = self.registry.create(name)?;
        Ok(CreatedInstance {
            instance,
            token: self.strategy.issue(name),
        })
    }

    /// Open a session for `name` through the transport.
    ///
    /// Allowed from `Created` and `Disconnected`. The instance sits in
    /// `Connecting` (holding an attempt handle) while the handshake runs; no
    /// lock is held across the handshake, and the outcome is only applied if
    /// that attempt is still the current one.
    pub async fn connect_to_whatsapp(&self, name: &str) -> Result<ConnectionResult, GatewayError> {
        // Re-validate existence before every attempt, including reconnects.
        self.registry.get(name).await?;

        let attempt = ConnectionHandle::new(format!("attempt:{}", uuid::Uuid::new_v4()));
        self.registry
            .transition(name, InstanceState::Connecting, Some(attempt.clone()))
            .await?;
        info!(instance = name, transport = self.transport.id(), "connecting");

        match self.transport.connect(name).await {
            Ok(session) => {
                match self
                    .registry
                    .transition_if(name, &attempt, InstanceState::Connected, Some(session.clone()))
                    .await
                {
                    Ok(instance) => {
                        info!(instance = name, handle = %session, "connected");
                        Ok(ConnectionResult { instance })
                    },
                    Err(e) => {
                        warn!(instance = name, error = %e, "discarding superseded session");
                        self.transport.disconnect(&session).await;
                        Err(e)
                    },
                }
            },
            Err(transport_error) => {
                warn!(instance = name, error = %transport_error, "handshake failed");
                if let Err(e) = self
                    .registry
                    .fail_if(name, &attempt, &transport_error.to_string())
                    .await
                {
                    debug!(instance = name, error = %e, "rollback skipped");
                }
                Err(transport_error.into())
            },
        }
    }

    /// Get-or-create: an existing instance is returned as it is, a missing
    /// one is created and connected straight away.
    ///
    /// A connect failure after a fresh create is returned as the error; the
    /// instance stays registered (rolled back to `Disconnected`).
    pub async fn init_instance(&self, name: &str) -> Result<InitOutcome, GatewayError> {
        match self.registry.get(name).await {
            Ok(instance) => return Ok(InitOutcome::Existing { instance }),
            Err(GatewayError::NotFound(_)) => {},
            Err(e) => return Err(e),
        }
        let token = match self.create_instance(name) {
            Ok(created) => created.token,
            // Lost a race with another create; treat it as existing.
            Err(GatewayError::AlreadyExists(_)) => {
                let instance = self.registry.get(name).await?;
                return Ok(InitOutcome::Existing { instance });
            },
            Err(e) => return Err(e),
        };
        let connected = self.connect_to_whatsapp(name).await?;
        Ok(InitOutcome::Created {
            instance: connected.instance,
            token,
        })
    }

    /// All instances, or exactly the one named by `filter`.
    pub async fn fetch_instances(&self, filter: Option<&str>) -> Result<Vec<Instance>, GatewayError> {
        match filter {
            Some(name) => Ok(vec![self.registry.get(name).await?]),
            None => Ok(self.registry.list().await),
        }
    }

    pub async fn connection_state(&self, name: &str) -> Result<Instance, GatewayError> {
        self.registry.get(name).await
    }

    /// Close the session of a connected (or connecting) instance.
    pub async fn logout(&self, name: &str) -> Result<Instance, GatewayError> {
        let current = self.registry.get(name).await?;
        let Some(handle) = current.handle().cloned() else {
            return Err(GatewayError::InvalidTransition {
                name: name.to_string(),
                from: current.state(),
                to: InstanceState::Disconnected,
            });
        };
        let instance = self
            .registry
            .transition_if(name, &handle, InstanceState::Disconnected, None)
            .await?;
        self.transport.disconnect(&handle).await;
        info!(instance = name, "logged out");
        Ok(instance)
    }

    /// Remove the instance, tearing down its session first.
    pub async fn delete_instance(&self, name: &str) -> Result<Instance, GatewayError> {
        self.registry.remove(name, self.transport.as_ref()).await
    }

    /// Apply a transport event. Events for sessions that are no longer
    /// current are ignored.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected {
                instance,
                handle,
                reason,
            } => {
                match self.registry.fail_if(&instance, &handle, &reason).await {
                    Ok(_) => info!(instance = %instance, reason = %reason, "session lost"),
                    Err(e) => debug!(instance = %instance, error = %e, "stale transport event"),
                }
            },
        }
    }

    /// Feed transport events into [`handle_transport_event`](Self::handle_transport_event)
    /// until the transport goes away.
    pub fn spawn_event_listener(self: Arc<Self>) -> JoinHandle<()> {
        let controller = self;
        let mut events = controller.transport.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => controller.handle_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport events lagged");
                    },
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("transport event listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {
        super::*,
        crate::auth::{IssuedTokenStrategy, StaticKeyStrategy},
        secrecy::Secret,
        switchboard_channels::{LoopbackTransport, TransportError},
    };

    fn setup_with(transport: LoopbackTransport) -> (Arc<InstanceController>, Arc<LoopbackTransport>) {
        let transport = Arc::new(transport);
        let controller = Arc::new(InstanceController::new(
            Arc::new(InstanceRegistry::new()),
            transport.clone(),
            Arc::new(StaticKeyStrategy::new(Secret::new("k".into()))),
        ));
        (controller, transport)
    }

    fn setup() -> (Arc<InstanceController>, Arc<LoopbackTransport>) {
        setup_with(LoopbackTransport::new())
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("acct_1.main-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("slash/no").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn create_then_connect() {
        let (controller, transport) = setup();
        let created = controller.create_instance("acct1").unwrap();
        assert_eq!(created.instance.state(), InstanceState::Created);
        assert!(created.token.is_none());
        assert_eq!(transport.connect_calls(), 0);

        let result = controller.connect_to_whatsapp("acct1").await.unwrap();
        assert_eq!(result.instance.state(), InstanceState::Connected);
        let handle = result.instance.handle().unwrap();
        assert!(transport.is_open(handle));

        let state = controller.connection_state("acct1").await.unwrap();
        assert_eq!(state.state(), InstanceState::Connected);
    }

    #[tokio::test]
    async fn token_strategy_issues_on_create() {
        let controller = InstanceController::new(
            Arc::new(InstanceRegistry::new()),
            Arc::new(LoopbackTransport::new()),
            Arc::new(IssuedTokenStrategy::new(
                Secret::new("admin".into()),
                Secret::new("s".into()),
                60,
            )),
        );
        let created = controller.create_instance("acct1").unwrap();
        assert!(created.token.is_some());
    }

    #[tokio::test]
    async fn connect_unknown_instance() {
        let (controller, transport) = setup();
        let err = controller.connect_to_whatsapp("ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn failed_handshake_rolls_back() {
        let (controller, transport) = setup();
        controller.create_instance("acct1").unwrap();
        transport.set_fail_connect(true);

        let err = controller.connect_to_whatsapp("acct1").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Transport(TransportError::Handshake(_))
        ));
        let instance = controller.connection_state("acct1").await.unwrap();
        assert_eq!(instance.state(), InstanceState::Disconnected);
        assert!(instance.handle().is_none());
        assert!(instance.last_error().is_some());

        // Explicit reconnect works once the network cooperates.
        transport.set_fail_connect(false);
        let result = controller.connect_to_whatsapp("acct1").await.unwrap();
        assert_eq!(result.instance.state(), InstanceState::Connected);
        assert!(result.instance.last_error().is_none());
    }

    #[tokio::test]
    async fn connect_when_connected_is_invalid() {
        let (controller, _) = setup();
        controller.create_instance("acct1").unwrap();
        controller.connect_to_whatsapp("acct1").await.unwrap();
        let err = controller.connect_to_whatsapp("acct1").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTransition {
            from: InstanceState::Connected,
            ..
        }));
    }

    #[tokio::test]
    async fn concurrent_connects_have_one_winner() {
        let (controller, transport) =
            setup_with(LoopbackTransport::new().with_latency(Duration::from_millis(50)));
        controller.create_instance("acct1").unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move { controller.connect_to_whatsapp("acct1").await })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(result) => winners.push(result.instance.handle().cloned()),
                Err(e) => assert!(matches!(e, GatewayError::InvalidTransition { .. }), "{e}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(transport.session_count(), 1);
    }

    #[tokio::test]
    async fn delete_during_handshake_discards_session() {
        let (controller, transport) =
            setup_with(LoopbackTransport::new().with_latency(Duration::from_millis(50)));
        controller.create_instance("acct1").unwrap();

        let connecting = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.connect_to_whatsapp("acct1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.delete_instance("acct1").await.unwrap();

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(transport.session_count(), 0);
    }

    #[tokio::test]
    async fn failed_handshake_after_delete_still_reports_transport_error() {
        let (controller, transport) =
            setup_with(LoopbackTransport::new().with_latency(Duration::from_millis(50)));
        controller.create_instance("acct1").unwrap();
        transport.set_fail_connect(true);

        let connecting = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.connect_to_whatsapp("acct1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.delete_instance("acct1").await.unwrap();

        let err = connecting.await.unwrap().unwrap_err();
        assert!(
            matches!(err, GatewayError::Transport(TransportError::Handshake(_))),
            "{err}"
        );
    }

    #[tokio::test]
    async fn stale_failure_does_not_touch_newer_attempt() {
        let (controller, transport) =
            setup_with(LoopbackTransport::new().with_latency(Duration::from_millis(50)));
        controller.create_instance("acct1").unwrap();
        transport.set_fail_connect(true);

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.connect_to_whatsapp("acct1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Supersede the failing attempt before its handshake returns.
        controller.logout("acct1").await.unwrap();
        transport.set_fail_connect(false);
        let second = controller.connect_to_whatsapp("acct1").await.unwrap();
        assert!(first.await.unwrap().is_err());

        let instance = controller.connection_state("acct1").await.unwrap();
        assert_eq!(instance.state(), InstanceState::Connected);
        assert_eq!(instance.handle(), second.instance.handle());
        assert!(instance.last_error().is_none());
    }

    #[tokio::test]
    async fn init_creates_and_connects_missing_instance() {
        let (controller, transport) = setup();
        let outcome = controller.init_instance("acct1").await.unwrap();
        let InitOutcome::Created { instance, token } = outcome else {
            panic!("expected a fresh instance");
        };
        assert_eq!(instance.state(), InstanceState::Connected);
        assert!(token.is_none());
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(transport.session_count(), 1);
    }

    #[tokio::test]
    async fn init_returns_existing_instance_untouched() {
        let (controller, transport) = setup();
        controller.create_instance("acct1").unwrap();

        let outcome = controller.init_instance("acct1").await.unwrap();
        let InitOutcome::Existing { instance } = outcome else {
            panic!("expected the existing instance");
        };
        assert_eq!(instance.state(), InstanceState::Created);
        assert_eq!(transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn init_rejects_bad_name_and_reports_connect_failure() {
        let (controller, transport) = setup();
        assert!(matches!(
            controller.init_instance("no spaces").await,
            Err(GatewayError::InvalidName(_))
        ));

        transport.set_fail_connect(true);
        let err = controller.init_instance("acct1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        let instance = controller.connection_state("acct1").await.unwrap();
        assert_eq!(instance.state(), InstanceState::Disconnected);
    }

    #[tokio::test]
    async fn fetch_instances_filters() {
        let (controller, _) = setup();
        assert!(controller.fetch_instances(None).await.unwrap().is_empty());
        controller.create_instance("a").unwrap();
        controller.create_instance("b").unwrap();

        assert_eq!(controller.fetch_instances(None).await.unwrap().len(), 2);
        let only = controller.fetch_instances(Some("b")).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name(), "b");
        assert!(matches!(
            controller.fetch_instances(Some("zzz")).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn logout_closes_session() {
        let (controller, transport) = setup();
        controller.create_instance("acct1").unwrap();
        let result = controller.connect_to_whatsapp("acct1").await.unwrap();
        let handle = result.instance.handle().cloned().unwrap();

        let instance = controller.logout("acct1").await.unwrap();
        assert_eq!(instance.state(), InstanceState::Disconnected);
        assert!(!transport.is_open(&handle));

        let err = controller.logout("acct1").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn network_drop_marks_disconnected() {
        let (controller, transport) = setup();
        let listener = Arc::clone(&controller).spawn_event_listener();
        controller.create_instance("acct1").unwrap();
        let result = controller.connect_to_whatsapp("acct1").await.unwrap();
        let handle = result.instance.handle().cloned().unwrap();

        assert!(transport.drop_session(&handle, "logged out from phone"));
        let mut state = InstanceState::Connected;
        for _ in 0..50 {
            state = controller.connection_state("acct1").await.unwrap().state();
            if state == InstanceState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, InstanceState::Disconnected);
        let instance = controller.connection_state("acct1").await.unwrap();
        assert_eq!(instance.last_error(), Some("logged out from phone"));
        listener.abort();
    }

    #[tokio::test]
    async fn stale_drop_event_is_ignored() {
        let (controller, _) = setup();
        controller.create_instance("acct1").unwrap();
        controller.connect_to_whatsapp("acct1").await.unwrap();

        controller
            .handle_transport_event(TransportEvent::Disconnected {
                instance: "acct1".into(),
                handle: ConnectionHandle::new("some-old-session"),
                reason: "old".into(),
            })
            .await;
        let instance = controller.connection_state("acct1").await.unwrap();
        assert_eq!(instance.state(), InstanceState::Connected);
    }
}
