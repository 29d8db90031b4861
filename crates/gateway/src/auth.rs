//! Authentication strategies and the process-wide strategy selection.
//!
//! The configured `auth.mode` is resolved into one [`AuthStrategy`] at
//! startup and installed once; guards only ever talk to the trait.

use std::sync::Arc;

use {
    axum::http::{HeaderMap, header},
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    chrono::Utc,
    hmac::{Hmac, Mac},
    once_cell::sync::OnceCell,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    sha2::Sha256,
    subtle::ConstantTimeEq,
    tracing::{debug, info, warn},
};

use switchboard_config::{AuthConfig, AuthMode};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying a static key.
pub const API_KEY_HEADER: &str = "apikey";

// ── Types ────────────────────────────────────────────────────────────────────

/// Per-request authentication input. Built fresh for every request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub credential: Option<String>,
}

impl AuthContext {
    pub fn new(credential: Option<String>) -> Self {
        Self { credential }
    }

    /// Pull the credential from the `apikey` header, falling back to
    /// `Authorization: Bearer <credential>`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let from_key = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let from_bearer = || {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let credential = from_key.or_else(from_bearer).map(String::from);
        Self::new(credential)
    }
}

/// One interchangeable way of checking credentials.
pub trait AuthStrategy: Send + Sync {
    fn mode(&self) -> AuthMode;

    /// Whether `credential` grants access to the instance named `instance`.
    fn validate(&self, credential: &str, instance: &str) -> bool;

    /// Whether `credential` grants access to operations that are not scoped
    /// to a single instance (create, list).
    fn validate_admin(&self, credential: &str) -> bool;

    /// Credential to hand back when `instance` is created, if this strategy
    /// issues per-instance credentials.
    fn issue(&self, _instance: &str) -> Option<String> {
        None
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn safe_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── Static key ───────────────────────────────────────────────────────────────

/// One shared key for everything.
pub struct StaticKeyStrategy {
    key: Secret<String>,
}

impl StaticKeyStrategy {
    pub fn new(key: Secret<String>) -> Self {
        Self { key }
    }
}

impl AuthStrategy for StaticKeyStrategy {
    fn mode(&self) -> AuthMode {
        AuthMode::ApiKey
    }

    fn validate(&self, credential: &str, _instance: &str) -> bool {
        self.validate_admin(credential)
    }

    fn validate_admin(&self, credential: &str) -> bool {
        safe_equal(credential, self.key.expose_secret())
    }
}

// ── Issued tokens ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    instance: String,
    iat: i64,
    exp: i64,
}

/// Signed, expiring tokens bound to one instance.
///
/// Format: `base64url(claims).base64url(hmac_sha256(secret, claims_b64))`.
/// The administrative key is accepted everywhere as well, so an operator can
/// reach any instance without its token.
pub struct IssuedTokenStrategy {
    admin_key: Secret<String>,
    secret: Secret<String>,
    ttl_secs: i64,
}

impl IssuedTokenStrategy {
    pub fn new(admin_key: Secret<String>, secret: Secret<String>, ttl_secs: u64) -> Self {
        Self {
            admin_key,
            secret,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()).ok()
    }

    /// Sign a token for `instance` with issue time `iat`.
    pub fn sign(&self, instance: &str, iat: i64) -> Option<String> {
        let claims = TokenClaims {
            instance: instance.to_string(),
            iat,
            exp: iat.saturating_add(self.ttl_secs),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).ok()?);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Some(format!("{payload}.{signature}"))
    }

    fn verify(&self, token: &str) -> Option<TokenClaims> {
        let (payload, signature) = token.split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            debug!("token signature mismatch");
            return None;
        }
        let claims: TokenClaims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;
        if Utc::now().timestamp() >= claims.exp {
            debug!(instance = %claims.instance, exp = claims.exp, "token expired");
            return None;
        }
        Some(claims)
    }
}

impl AuthStrategy for IssuedTokenStrategy {
    fn mode(&self) -> AuthMode {
        AuthMode::Token
    }

    fn validate(&self, credential: &str, instance: &str) -> bool {
        if self.validate_admin(credential) {
            return true;
        }
        self.verify(credential)
            .is_some_and(|claims| safe_equal(&claims.instance, instance))
    }

    fn validate_admin(&self, credential: &str) -> bool {
        safe_equal(credential, self.admin_key.expose_secret())
    }

    fn issue(&self, instance: &str) -> Option<String> {
        let token = self.sign(instance, Utc::now().timestamp());
        if token.is_none() {
            warn!(instance, "failed to sign instance token");
        }
        token
    }
}

// ── Selection ────────────────────────────────────────────────────────────────

static ACTIVE_STRATEGY: OnceCell<Arc<dyn AuthStrategy>> = OnceCell::new();

fn required(secret: &Option<Secret<String>>, what: &str) -> anyhow::Result<Secret<String>> {
    secret
        .as_ref()
        .map(|s| Secret::new(s.expose_secret().clone()))
        .ok_or_else(|| anyhow::anyhow!("{what} is not configured"))
}

/// Build the strategy named by `config.mode`.
pub fn select_strategy(config: &AuthConfig) -> anyhow::Result<Arc<dyn AuthStrategy>> {
    config.validate()?;
    let admin_key = required(&config.api_key, "auth.api_key")?;
    let strategy: Arc<dyn AuthStrategy> = match config.mode {
        AuthMode::ApiKey => Arc::new(StaticKeyStrategy::new(admin_key)),
        AuthMode::Token => Arc::new(IssuedTokenStrategy::new(
            admin_key,
            required(&config.token.secret, "auth.token.secret")?,
            config.token.ttl_secs,
        )),
    };
    Ok(strategy)
}

/// Resolve and install the process-wide strategy. Fails if one is already
/// installed; the selection never changes after startup.
pub fn install(config: &AuthConfig) -> anyhow::Result<Arc<dyn AuthStrategy>> {
    let strategy = select_strategy(config)?;
    ACTIVE_STRATEGY
        .set(Arc::clone(&strategy))
        .map_err(|_| anyhow::anyhow!("auth strategy already installed"))?;
    info!(mode = strategy.mode().as_str(), "auth strategy installed");
    Ok(strategy)
}
