//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration. File: ~/.config/beam/signal.toml or /etc/beam/signal.toml.
/// Env overrides: BEAM_SIGNAL_PORT, BEAM_HEARTBEAT_SECS, BEAM_SESSION_TIMEOUT_SECS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// WebSocket listen port (default 8080).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between heartbeat probes (default 30).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Seconds of silence before a session is dropped (default 60).
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_heartbeat_secs() -> u64 {
    beam_core::hub::DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}
fn default_session_timeout_secs() -> u64 {
    beam_core::hub::DEFAULT_SESSION_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            heartbeat_secs: default_heartbeat_secs(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/beam/signal.toml"));
    }
    out.push(PathBuf::from("/etc/beam/signal.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = parsed(&var, "BEAM_SIGNAL_PORT") {
        c.port = p;
    }
    if let Some(s) = parsed(&var, "BEAM_HEARTBEAT_SECS") {
        c.heartbeat_secs = s;
    }
    if let Some(s) = parsed(&var, "BEAM_SESSION_TIMEOUT_SECS") {
        c.session_timeout_secs = s;
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_server() {
        let c = Config::default();
        assert_eq!(c.port, 8080);
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(c.session_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("port = 9001").unwrap();
        assert_eq!(c.port, 9001);
        assert_eq!(c.heartbeat_secs, 30);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("prot = 9001").is_err());
    }

    #[test]
    fn env_overrides_file_and_ignores_garbage() {
        let mut c = Config::default();
        apply_env(&mut c, |key| match key {
            "BEAM_SIGNAL_PORT" => Some("7070".into()),
            "BEAM_HEARTBEAT_SECS" => Some("soon".into()),
            _ => None,
        });
        assert_eq!(c.port, 7070);
        assert_eq!(c.heartbeat_secs, 30);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load(Some(Path::new("/nonexistent/beam/signal.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
