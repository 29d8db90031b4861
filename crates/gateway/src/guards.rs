//! Guard pipeline run in front of every instance-scoped operation.
//!
//! Guards are evaluated in a fixed order (existence, login, auth) and the
//! first failure ends the request. Cheap local checks run first, so a
//! request for a missing instance reports `NotFound` even when its
//! credential is also wrong.

use std::sync::Arc;

use {async_trait::async_trait, tracing::debug};

use crate::{
    auth::{AuthContext, AuthStrategy},
    error::{AuthFailure, GatewayError, NotLoggedIn},
    registry::{Instance, InstanceRegistry},
};

pub type GuardResult = Result<(), GatewayError>;

/// What guards see for one request.
pub struct GuardContext<'a> {
    pub instance_name: &'a str,
    pub auth: &'a AuthContext,
    /// Filled in by [`ExistenceGuard`].
    pub instance: Option<Instance>,
}

impl GuardContext<'_> {
    fn instance(&self) -> Result<&Instance, GatewayError> {
        self.instance
            .as_ref()
            .ok_or_else(|| GatewayError::NotFound(self.instance_name.to_string()))
    }
}

#[async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &mut GuardContext<'_>) -> GuardResult;
}

/// The instance must be registered.
pub struct ExistenceGuard {
    registry: Arc<InstanceRegistry>,
}

#[async_trait]
impl Guard for ExistenceGuard {
    fn name(&self) -> &'static str {
        "existence"
    }

    async fn check(&self, ctx: &mut GuardContext<'_>) -> GuardResult {
        ctx.instance = Some(self.registry.get(ctx.instance_name).await?);
        Ok(())
    }
}

/// The instance must be logged in to the network.
pub struct LoginGuard;

#[async_trait]
impl Guard for LoginGuard {
    fn name(&self) -> &'static str {
        "login"
    }

    async fn check(&self, ctx: &mut GuardContext<'_>) -> GuardResult {
        let instance = ctx.instance()?;
        match NotLoggedIn::for_state(instance.state()) {
            None => Ok(()),
            Some(reason) => Err(GatewayError::Forbidden {
                name: instance.name().to_string(),
                reason,
            }),
        }
    }
}

/// The request credential must satisfy the active strategy.
pub struct AuthGuard {
    strategy: Arc<dyn AuthStrategy>,
}

#[async_trait]
impl Guard for AuthGuard {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn check(&self, ctx: &mut GuardContext<'_>) -> GuardResult {
        let credential = ctx
            .auth
            .credential
            .as_deref()
            .ok_or(GatewayError::Unauthorized(AuthFailure::Missing))?;
        if self.strategy.validate(credential, ctx.instance_name) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized(AuthFailure::Invalid))
        }
    }
}

/// Proof that a request passed a pipeline, carrying the instance snapshot
/// taken while doing so. Only [`GuardPipeline::admit`] creates one.
#[derive(Debug, Clone)]
pub struct Admission {
    instance: Instance,
    logged_in: bool,
}

impl Admission {
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Whether the login guard was part of the pipeline that admitted this
    /// request.
    pub fn logged_in(&self) -> bool {
        self.logged_in
    }
}

/// An ordered, fixed list of guards.
pub struct GuardPipeline {
    guards: Vec<Box<dyn Guard>>,
    requires_login: bool,
}

impl GuardPipeline {
    /// existence → login → auth; used for operations that talk to the
    /// network through the instance.
    pub fn logged_in(registry: Arc<InstanceRegistry>, strategy: Arc<dyn AuthStrategy>) -> Self {
        Self {
            guards: vec![
                Box::new(ExistenceGuard { registry }),
                Box::new(LoginGuard),
                Box::new(AuthGuard { strategy }),
            ],
            requires_login: true,
        }
    }

    /// existence → auth; used for lifecycle operations (connect, state,
    /// logout, delete) that must work before login.
    pub fn lifecycle(registry: Arc<InstanceRegistry>, strategy: Arc<dyn AuthStrategy>) -> Self {
        Self {
            guards: vec![
                Box::new(ExistenceGuard { registry }),
                Box::new(AuthGuard { strategy }),
            ],
            requires_login: false,
        }
    }

    pub fn guard_names(&self) -> Vec<&'static str> {
        self.guards.iter().map(|g| g.name()).collect()
    }

    /// Run every guard in order, stopping at the first failure.
    pub async fn admit(
        &self,
        instance_name: &str,
        auth: &AuthContext,
    ) -> Result<Admission, GatewayError> {
        let mut ctx = GuardContext {
            instance_name,
            auth,
            instance: None,
        };
        for guard in &self.guards {
            if let Err(e) = guard.check(&mut ctx).await {
                debug!(
                    instance = instance_name,
                    guard = guard.name(),
                    reason = e.reason(),
                    "request rejected"
                );
                return Err(e);
            }
        }
        let instance = ctx
            .instance
            .ok_or_else(|| GatewayError::NotFound(instance_name.to_string()))?;
        Ok(Admission {
            instance,
            logged_in: self.requires_login,
        })
    }
}

/// Gate for operations that are not scoped to one instance.
pub fn require_admin(strategy: &dyn AuthStrategy, auth: &AuthContext) -> Result<(), GatewayError> {
    let credential = auth
        .credential
        .as_deref()
        .ok_or(GatewayError::Unauthorized(AuthFailure::Missing))?;
    if strategy.validate_admin(credential) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized(AuthFailure::Invalid))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            auth::{IssuedTokenStrategy, StaticKeyStrategy},
            registry::InstanceState,
        },
        secrecy::Secret,
        switchboard_channels::ConnectionHandle,
    };

    fn setup() -> (Arc<InstanceRegistry>, GuardPipeline, GuardPipeline) {
        let registry = Arc::new(InstanceRegistry::new());
        let strategy: Arc<dyn AuthStrategy> =
            Arc::new(StaticKeyStrategy::new(Secret::new("good".into())));
        let full = GuardPipeline::logged_in(Arc::clone(&registry), Arc::clone(&strategy));
        let lifecycle = GuardPipeline::lifecycle(Arc::clone(&registry), strategy);
        (registry, full, lifecycle)
    }

    fn key(k: Option<&str>) -> AuthContext {
        AuthContext::new(k.map(String::from))
    }

    async fn connect(registry: &InstanceRegistry, name: &str) {
        registry
            .transition(
                name,
                InstanceState::Connecting,
                Some(ConnectionHandle::new("attempt")),
            )
            .await
            .unwrap();
        registry
            .transition(
                name,
                InstanceState::Connected,
                Some(ConnectionHandle::new("session")),
            )
            .await
            .unwrap();
    }

    #[test]
    fn order_is_fixed() {
        let (_, full, lifecycle) = setup();
        assert_eq!(full.guard_names(), ["existence", "login", "auth"]);
        assert_eq!(lifecycle.guard_names(), ["existence", "auth"]);
    }

    #[tokio::test]
    async fn missing_instance_beats_bad_credential() {
        let (_, full, lifecycle) = setup();
        for pipeline in [&full, &lifecycle] {
            for cred in [None, Some("bad")] {
                let err = pipeline.admit("ghost", &key(cred)).await.unwrap_err();
                assert!(matches!(err, GatewayError::NotFound(_)), "{err}");
            }
        }
    }

    #[tokio::test]
    async fn not_logged_in_beats_bad_credential() {
        let (registry, full, _) = setup();
        registry.create("acct1").unwrap();
        let err = full.admit("acct1", &key(Some("bad"))).await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden {
            reason: NotLoggedIn::NeverConnected,
            ..
        }));
    }

    #[tokio::test]
    async fn login_reasons_follow_state() {
        let (registry, full, _) = setup();
        registry.create("acct1").unwrap();
        registry
            .transition(
                "acct1",
                InstanceState::Connecting,
                Some(ConnectionHandle::new("attempt")),
            )
            .await
            .unwrap();
        let err = full.admit("acct1", &key(Some("good"))).await.unwrap_err();
        assert_eq!(err.reason(), "instance_connecting");

        registry
            .transition("acct1", InstanceState::Disconnected, None)
            .await
            .unwrap();
        let err = full.admit("acct1", &key(Some("good"))).await.unwrap_err();
        assert_eq!(err.reason(), "instance_disconnected");
    }

    #[tokio::test]
    async fn auth_runs_last() {
        let (registry, full, _) = setup();
        registry.create("acct1").unwrap();
        connect(&registry, "acct1").await;

        let err = full.admit("acct1", &key(None)).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Unauthorized(AuthFailure::Missing)
        ));
        let err = full.admit("acct1", &key(Some("bad"))).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Unauthorized(AuthFailure::Invalid)
        ));

        let admission = full.admit("acct1", &key(Some("good"))).await.unwrap();
        assert_eq!(admission.instance().state(), InstanceState::Connected);
        assert!(admission.logged_in());
    }

    #[tokio::test]
    async fn lifecycle_admits_unconnected_instances() {
        let (registry, _, lifecycle) = setup();
        registry.create("acct1").unwrap();
        let admission = lifecycle.admit("acct1", &key(Some("good"))).await.unwrap();
        assert_eq!(admission.instance().state(), InstanceState::Created);
        assert!(!admission.logged_in());
    }

    #[tokio::test]
    async fn token_strategy_plugs_into_same_pipeline() {
        let registry = Arc::new(InstanceRegistry::new());
        let tokens = Arc::new(IssuedTokenStrategy::new(
            Secret::new("admin".into()),
            Secret::new("secret".into()),
            600,
        ));
        let pipeline = GuardPipeline::lifecycle(Arc::clone(&registry), tokens.clone());
        registry.create("acct1").unwrap();
        registry.create("acct2").unwrap();
        let token = tokens.issue("acct1").unwrap();
        let ctx = AuthContext::new(Some(token));

        assert!(pipeline.admit("acct1", &ctx).await.is_ok());
        let err = pipeline.admit("acct2", &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Unauthorized(AuthFailure::Invalid)
        ));
    }

    #[test]
    fn admin_gate() {
        let strategy = StaticKeyStrategy::new(Secret::new("good".into()));
        assert!(require_admin(&strategy, &key(Some("good"))).is_ok());
        assert!(matches!(
            require_admin(&strategy, &key(None)),
            Err(GatewayError::Unauthorized(AuthFailure::Missing))
        ));
        assert!(matches!(
            require_admin(&strategy, &key(Some("nope"))),
            Err(GatewayError::Unauthorized(AuthFailure::Invalid))
        ));
    }
}
