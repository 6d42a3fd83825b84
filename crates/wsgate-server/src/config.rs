//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use wsgate_core::{CaptureLevel, GateError, GateResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub proxy: ProxySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_timeout")]
    pub handshake_timeout: u64,
    #[serde(default = "default_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            handshake_timeout: default_timeout(),
            write_timeout: default_timeout(),
            shutdown_timeout: default_timeout(),
        }
    }
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// Destination map file (`name,address` per line).
    #[serde(default)]
    pub map: Option<String>,
    /// PEM-encoded RSA public key; authentication is off without it.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default = "default_freshness")]
    pub freshness: u64,
    #[serde(default = "default_timeout")]
    pub dial_timeout: u64,
    #[serde(default)]
    pub dump_tcp: u8,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            map: None,
            public_key: None,
            freshness: default_freshness(),
            dial_timeout: default_timeout(),
            dump_tcp: 0,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8086".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_freshness() -> u64 {
    3600
}

/// Values given on the command line; `None` leaves the file/default value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub map: Option<String>,
    pub public_key: Option<String>,
    pub freshness: Option<u64>,
    pub dial_timeout: Option<u64>,
    pub handshake_timeout: Option<u64>,
    pub write_timeout: Option<u64>,
    pub shutdown_timeout: Option<u64>,
    pub dump_tcp: Option<u8>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub map_path: Option<PathBuf>,
    pub public_key_path: Option<PathBuf>,
    pub freshness: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub capture_level: CaptureLevel,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::merge(file_config, cli)
    }

    /// Merge CLI overrides over file values.
    pub fn merge(file: ConfigFile, cli: CliOverrides) -> GateResult<Self> {
        let listen_str = cli.listen.unwrap_or(file.server.listen);
        let listen = listen_str
            .parse::<SocketAddr>()
            .map_err(|e| GateError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;

        let map = cli.map.or(file.proxy.map).filter(|s| !s.is_empty());
        let public_key = cli
            .public_key
            .or(file.proxy.public_key)
            .filter(|s| !s.is_empty());

        Ok(Self {
            listen,
            map_path: map.as_deref().map(expand_tilde_str),
            public_key_path: public_key.as_deref().map(expand_tilde_str),
            freshness: secs(cli.freshness.unwrap_or(file.proxy.freshness)),
            dial_timeout: secs(cli.dial_timeout.unwrap_or(file.proxy.dial_timeout)),
            handshake_timeout: secs(cli.handshake_timeout.unwrap_or(file.server.handshake_timeout)),
            write_timeout: secs(cli.write_timeout.unwrap_or(file.server.write_timeout)),
            shutdown_timeout: secs(cli.shutdown_timeout.unwrap_or(file.server.shutdown_timeout)),
            capture_level: CaptureLevel(cli.dump_tcp.unwrap_or(file.proxy.dump_tcp)),
        })
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::merge(ConfigFile::default(), CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:8086".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.dial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
        assert_eq!(cfg.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(cfg.freshness, Duration::from_secs(3600));
        assert_eq!(cfg.capture_level, CaptureLevel::OFF);
        assert!(cfg.map_path.is_none());
        assert!(cfg.public_key_path.is_none());
    }

    #[test]
    fn file_values_apply() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            shutdown_timeout = 30

            [proxy]
            map = "/etc/wsgate/map.csv"
            public_key = "/etc/wsgate/key.pem"
            freshness = 120
            dump_tcp = 2
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::merge(file, CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen.port(), 9000);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(cfg.map_path, Some(PathBuf::from("/etc/wsgate/map.csv")));
        assert_eq!(cfg.public_key_path, Some(PathBuf::from("/etc/wsgate/key.pem")));
        assert_eq!(cfg.freshness, Duration::from_secs(120));
        assert_eq!(cfg.capture_level, CaptureLevel(2));
        // Untouched keys keep their defaults.
        assert_eq!(cfg.dial_timeout, Duration::from_secs(10));
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            [proxy]
            dump_tcp = 2
            dial_timeout = 3
            "#,
        )
        .unwrap();
        let cli = CliOverrides {
            listen: Some("127.0.0.1:9100".into()),
            dump_tcp: Some(1),
            ..Default::default()
        };
        let cfg = ServerConfig::merge(file, cli).unwrap();
        assert_eq!(cfg.listen.port(), 9100);
        assert_eq!(cfg.capture_level, CaptureLevel(1));
        assert_eq!(cfg.dial_timeout, Duration::from_secs(3));
    }

    #[test]
    fn empty_paths_mean_unset() {
        let cli = CliOverrides {
            map: Some(String::new()),
            public_key: Some(String::new()),
            ..Default::default()
        };
        let cfg = ServerConfig::merge(ConfigFile::default(), cli).unwrap();
        assert!(cfg.map_path.is_none());
        assert!(cfg.public_key_path.is_none());
    }

    #[test]
    fn invalid_listen_address() {
        let cli = CliOverrides {
            listen: Some("not-an-address".into()),
            ..Default::default()
        };
        let err = ServerConfig::merge(ConfigFile::default(), cli).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn load_reads_file_and_tolerates_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[proxy]\nfreshness = 42").unwrap();
        let cfg = ServerConfig::load(Some(file.path()), CliOverrides::default()).unwrap();
        assert_eq!(cfg.freshness, Duration::from_secs(42));

        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/wsgate.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.freshness, Duration::from_secs(3600));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[proxy\nfreshness = ").unwrap();
        let err = ServerConfig::load(Some(file.path()), CliOverrides::default()).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }
}
