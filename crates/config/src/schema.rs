/// Config schema types (server, auth, transport, dispatch).
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

/// Which authentication strategy guards instance-scoped requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// A single shared key, sent in the `apikey` header.
    #[default]
    ApiKey,
    /// Per-instance tokens issued by the gateway at creation time.
    Token,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "apikey",
            Self::Token => "token",
        }
    }
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apikey" | "api_key" | "key" => Ok(Self::ApiKey),
            "token" | "jwt" => Ok(Self::Token),
            other => Err(format!("unknown auth mode: {other}")),
        }
    }
}

/// Authentication settings.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Administrative key. Required in every mode: it gates instance
    /// creation and listing, and is the only credential in `apikey` mode.
    #[serde(serialize_with = "redact")]
    pub api_key: Option<Secret<String>>,
    pub token: TokenConfig,
}

/// Issued-token settings, only consulted when `mode = "token"`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC signing secret.
    #[serde(serialize_with = "redact")]
    pub secret: Option<Secret<String>>,
    /// Lifetime of an issued token, in seconds.
    pub ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Settings for the built-in loopback transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Simulated handshake latency.
    pub connect_latency_ms: u64,
    /// Make every handshake fail (useful for exercising rollback paths).
    pub fail_connect: bool,
}

/// Outbound message pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on the per-call `options.delay`.
    pub max_delay_ms: u64,
    /// Pause applied when a send does not set `options.delay`.
    pub default_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: 60_000,
            default_delay_ms: 1_200,
        }
    }
}

impl AuthConfig {
    /// Check that the secrets the active mode needs are present.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !has_value(&self.api_key) {
            anyhow::bail!("auth.api_key must be set (or SWITCHBOARD_API_KEY)");
        }
        if self.mode == AuthMode::Token && !has_value(&self.token.secret) {
            anyhow::bail!("auth.token.secret must be set when auth.mode = \"token\"");
        }
        Ok(())
    }
}

fn has_value(secret: &Option<Secret<String>>) -> bool {
    secret
        .as_ref()
        .is_some_and(|s| !s.expose_secret().trim().is_empty())
}

fn redact<S: Serializer>(value: &Option<Secret<String>>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("[REDACTED]"),
        None => serializer.serialize_none(),
    }
}
