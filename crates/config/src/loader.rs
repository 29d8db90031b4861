use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{env_subst::substitute_env, schema::SwitchboardConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchboard.toml",
    "switchboard.yaml",
    "switchboard.yml",
    "switchboard.json",
];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, discovery only looks in this
/// directory (project-local and user-global paths are skipped).
pub fn set_config_dir(path: PathBuf) {
    if let Ok(mut dir) = CONFIG_DIR_OVERRIDE.lock() {
        *dir = Some(path);
    }
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.lock().ok().and_then(|dir| dir.clone())
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. the directory given to [`set_config_dir`], exclusively, if any
/// 2. `./switchboard.{toml,yaml,yml,json}` (project-local)
/// 3. `~/.config/switchboard/switchboard.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to defaults (plus env overrides) when nothing is found.
/// A file that exists but fails to parse is an error: silently running
/// with defaults would also drop the configured auth secrets.
pub fn discover_and_load() -> anyhow::Result<SwitchboardConfig> {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        return load_config(&path);
    }
    debug!("no config file found, using defaults");
    let mut config = SwitchboardConfig::default();
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables take precedence over file values.
pub fn apply_env_overrides(config: &mut SwitchboardConfig) {
    if let Some(key) = env_value("SWITCHBOARD_API_KEY") {
        config.auth.api_key = Some(Secret::new(key));
    }
    if let Some(secret) = env_value("SWITCHBOARD_TOKEN_SECRET") {
        config.auth.token.secret = Some(Secret::new(secret));
    }
    if let Some(mode) = env_value("SWITCHBOARD_AUTH_MODE") {
        match mode.parse() {
            Ok(mode) => config.auth.mode = mode,
            Err(e) => warn!(error = %e, "ignoring SWITCHBOARD_AUTH_MODE"),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        // Override is set, don't fall through to other locations.
        return first_existing(&dir);
    }

    // Project-local
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    config_dir().and_then(|dir| first_existing(&dir))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/switchboard/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("switchboard"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
