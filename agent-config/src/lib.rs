//! Load configuration from XDG `config.toml` and project `.env`, then apply to the process
//! environment with priority: **existing env > .env > XDG**. On top of that, resolve the
//! small set of named settings the agent loop and its adapters care about (API credentials,
//! base URL, model name, SMTP/email-callback settings), each accepting a primary and a legacy
//! environment variable name.

mod dotenv;
mod xdg_toml;

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

pub const ENV_API_KEY: &str = "AGENT_API_KEY";
pub const ENV_API_KEY_LEGACY: &str = "ANTHROPIC_API_KEY";
pub const ENV_BASE_URL: &str = "AGENT_BASE_URL";
pub const ENV_BASE_URL_LEGACY: &str = "ANTHROPIC_BASE_URL";
pub const ENV_MODEL: &str = "AGENT_MODEL";

pub const ENV_SMTP_HOST: &str = "AGENT_SMTP_HOST";
pub const ENV_SMTP_PORT: &str = "AGENT_SMTP_PORT";
pub const ENV_SMTP_USERNAME: &str = "AGENT_SMTP_USERNAME";
pub const ENV_SMTP_PASSWORD: &str = "AGENT_SMTP_PASSWORD";
pub const ENV_EMAIL_CALLBACK_ADDR: &str = "AGENT_EMAIL_CALLBACK_ADDR";

/// Loads config from XDG `config.toml` and optional project `.env`, then sets environment
/// variables only for keys that are **not** already set (so existing env has highest priority).
///
/// * `app_name`: e.g. `"agent"` — used for XDG path `~/.config/<app_name>/config.toml`.
/// * `override_dir`: if `Some`, look for `.env` in this directory instead of `std::env::current_dir()`.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<String> = xdg_map.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue;
        }
        let value = dotenv_map.get(&key).or_else(|| xdg_map.get(&key)).cloned();
        if let Some(v) = value {
            std::env::set_var(&key, v);
        }
    }

    Ok(())
}

/// Reads the first of `(primary, legacy)` that is set in the process environment.
fn resolve_env(primary: &str, legacy: &str) -> Option<String> {
    std::env::var(primary).ok().or_else(|| std::env::var(legacy).ok())
}

#[derive(Clone, Debug, Default)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub callback_addr: Option<String>,
}

/// Settings resolved from the environment, honoring the primary/legacy name pairs. CLI flags
/// take precedence over all of this — callers should overwrite fields with explicit CLI values
/// before use.
#[derive(Clone, Debug, Default)]
pub struct ResolvedSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub smtp: SmtpSettings,
}

pub fn resolve_settings() -> ResolvedSettings {
    ResolvedSettings {
        api_key: resolve_env(ENV_API_KEY, ENV_API_KEY_LEGACY),
        base_url: resolve_env(ENV_BASE_URL, ENV_BASE_URL_LEGACY),
        model: std::env::var(ENV_MODEL).ok(),
        smtp: SmtpSettings {
            host: std::env::var(ENV_SMTP_HOST).ok(),
            port: std::env::var(ENV_SMTP_PORT).ok().and_then(|p| p.parse().ok()),
            username: std::env::var(ENV_SMTP_USERNAME).ok(),
            password: std::env::var(ENV_SMTP_PASSWORD).ok(),
            callback_addr: std::env::var(ENV_EMAIL_CALLBACK_ADDR).ok(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins() {
        env::set_var("CONFIG_TEST_EXISTING", "from_env");
        let _ = load_and_apply("agent", None);
        assert_eq!(env::var("CONFIG_TEST_EXISTING").as_deref(), Ok("from_env"));
        env::remove_var("CONFIG_TEST_EXISTING");
    }

    #[test]
    fn load_and_apply_no_config_ok() {
        let r = load_and_apply("config-crate-nonexistent-app-xyz", None::<&std::path::Path>);
        assert!(r.is_ok());
    }

    #[test]
    fn dotenv_overrides_xdg() {
        let xdg_dir = tempfile::tempdir().unwrap();
        let app_dir = xdg_dir.path().join("agent");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "[env]\nCONFIG_TEST_PRIORITY = \"from_xdg\"\n").unwrap();

        let dotenv_dir = tempfile::tempdir().unwrap();
        std::fs::write(dotenv_dir.path().join(".env"), "CONFIG_TEST_PRIORITY=from_dotenv\n").unwrap();

        let prev_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg_dir.path());
        env::remove_var("CONFIG_TEST_PRIORITY");

        let _ = load_and_apply("agent", Some(dotenv_dir.path()));
        let val = env::var("CONFIG_TEST_PRIORITY").unwrap();
        env::remove_var("CONFIG_TEST_PRIORITY");
        restore_var("XDG_CONFIG_HOME", prev_xdg);

        assert_eq!(val, "from_dotenv");
    }

    #[test]
    fn resolve_settings_falls_back_to_legacy_name() {
        let prev = env::var(ENV_API_KEY).ok();
        env::remove_var(ENV_API_KEY);
        env::set_var(ENV_API_KEY_LEGACY, "legacy-key");

        let settings = resolve_settings();
        assert_eq!(settings.api_key.as_deref(), Some("legacy-key"));

        env::remove_var(ENV_API_KEY_LEGACY);
        restore_var(ENV_API_KEY, prev);
    }

    #[test]
    fn resolve_settings_prefers_primary_name() {
        let prev_primary = env::var(ENV_BASE_URL).ok();
        let prev_legacy = env::var(ENV_BASE_URL_LEGACY).ok();
        env::set_var(ENV_BASE_URL, "https://primary.example");
        env::set_var(ENV_BASE_URL_LEGACY, "https://legacy.example");

        let settings = resolve_settings();
        assert_eq!(settings.base_url.as_deref(), Some("https://primary.example"));

        restore_var(ENV_BASE_URL, prev_primary);
        restore_var(ENV_BASE_URL_LEGACY, prev_legacy);
    }
}
