//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How peers are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// LAN multicast presence.
    Local,
    /// Signaling server, falling back to LAN presence when unreachable.
    Global,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "global" => Ok(Mode::Global),
            other => Err(format!("unknown mode {other}")),
        }
    }
}

/// Node configuration. File: ~/.config/beam/node.toml or /etc/beam/node.toml.
/// Env overrides: BEAM_MODE, BEAM_SIGNAL_URL, BEAM_DISCOVERY_PORT, BEAM_TRANSPORT_PORT,
/// BEAM_DOWNLOAD_DIR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery mode (default local).
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Signaling server URL for global mode (default ws://127.0.0.1:8080).
    #[serde(default = "default_signal_url")]
    pub signal_url: String,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Direct channel TCP port (default 45679, 0 picks a free port).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Where received files are written (default ./beam-downloads).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Host advertised to the signaling server; detected when absent.
    #[serde(default)]
    pub advertise_host: Option<String>,
    /// Chunk size in bytes (default 16384).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Connection attempt timeout in seconds (default 5).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Listener bind attempts before giving up (default 10, 3 s apart).
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,
}

fn default_mode() -> Mode {
    Mode::Local
}
fn default_signal_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_transport_port() -> u16 {
    45679
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("beam-downloads")
}
fn default_chunk_size() -> usize {
    beam_core::DEFAULT_CHUNK_SIZE
}
fn default_connect_timeout_secs() -> u64 {
    beam_core::connection::DEFAULT_CONNECT_TIMEOUT.as_secs()
}
fn default_register_attempts() -> u32 {
    beam_core::init::DEFAULT_REGISTER_ATTEMPTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            signal_url: default_signal_url(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            download_dir: default_download_dir(),
            advertise_host: None,
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            register_attempts: default_register_attempts(),
        }
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
        out.push(h.join(".config/beam/node.toml"));
    }
    out.push(PathBuf::from("/etc/beam/node.toml"));
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
    if let Some(m) = parsed(&var, "BEAM_MODE") {
        c.mode = m;
    }
    if let Some(url) = var("BEAM_SIGNAL_URL").filter(|s| !s.trim().is_empty()) {
        c.signal_url = url.trim().to_string();
    }
    if let Some(p) = parsed(&var, "BEAM_DISCOVERY_PORT") {
        c.discovery_port = p;
    }
    if let Some(p) = parsed(&var, "BEAM_TRANSPORT_PORT") {
        c.transport_port = p;
    }
    if let Some(dir) = var("BEAM_DOWNLOAD_DIR").filter(|s| !s.trim().is_empty()) {
        c.download_dir = PathBuf::from(dir);
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
    fn file_values_and_defaults_merge() {
        let c: Config = toml::from_str(
            r#"
            mode = "global"
            signal_url = "ws://signal.lan:8080"
            "#,
        )
        .unwrap();
        assert_eq!(c.mode, Mode::Global);
        assert_eq!(c.signal_url, "ws://signal.lan:8080");
        assert_eq!(c.transport_port, 45679);
        assert_eq!(c.chunk_size, 16 * 1024);
        assert_eq!(c.register_attempts, 10);
    }

    #[test]
    fn register_attempts_configurable() {
        let c: Config = toml::from_str("register_attempts = 2").unwrap();
        assert_eq!(c.register_attempts, 2);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |key| match key {
            "BEAM_MODE" => Some("GLOBAL".into()),
            "BEAM_TRANSPORT_PORT" => Some("0".into()),
            "BEAM_DISCOVERY_PORT" => Some("not-a-port".into()),
            "BEAM_DOWNLOAD_DIR" => Some("/tmp/inbox".into()),
            _ => None,
        });
        assert_eq!(c.mode, Mode::Global);
        assert_eq!(c.transport_port, 0);
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.download_dir, PathBuf::from("/tmp/inbox"));
    }
}
