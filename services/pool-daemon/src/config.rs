//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults.
//! Only the listen address and store path can be overridden from the
//! environment; everything else lives in the TOML file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use account_pool::DEFAULT_SESSION_SUFFIX_MARKERS;

const LISTEN_ADDR_ENV: &str = "ACCOUNT_POOL_LISTEN_ADDR";
const STORE_PATH_ENV: &str = "ACCOUNT_POOL_STORE_PATH";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Where the pool document is persisted
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Recovery poller settings
#[derive(Debug, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Usage ingest settings
#[derive(Debug, Deserialize)]
pub struct UsageConfig {
    /// Markers separating a base session id from a multiplexed suffix
    #[serde(default = "default_suffix_markers")]
    pub session_suffix_markers: Vec<String>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9191))
}

fn default_max_connections() -> usize {
    256
}

fn default_store_path() -> PathBuf {
    PathBuf::from("accounts.json")
}

fn default_poll_interval() -> u64 {
    60
}

fn default_suffix_markers() -> Vec<String> {
    DEFAULT_SESSION_SUFFIX_MARKERS
        .iter()
        .map(|m| m.to_string())
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            session_suffix_markers: default_suffix_markers(),
        }
    }
}

impl RecoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(addr) = std::env::var(LISTEN_ADDR_ENV) {
            config.server.listen_addr =
                addr.parse().map_err(|_| common::Error::InvalidEnv {
                    var: LISTEN_ADDR_ENV.into(),
                    value: addr.clone(),
                })?;
        }
        if let Ok(path) = std::env::var(STORE_PATH_ENV) {
            if path.trim().is_empty() {
                return Err(common::Error::InvalidEnv {
                    var: STORE_PATH_ENV.into(),
                    value: path,
                });
            }
            config.store.path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.recovery.poll_interval_secs == 0 {
            return Err(common::Error::Config(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.store.path.as_os_str().is_empty() {
            return Err(common::Error::Config("store path must not be empty".into()));
        }

        if self.usage.session_suffix_markers.iter().any(|m| m.is_empty()) {
            return Err(common::Error::Config(
                "session_suffix_markers must not contain empty markers".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("account-pool.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that read or mutate process environment.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_overrides() {
        unsafe {
            remove_env(LISTEN_ADDR_ENV);
            remove_env(STORE_PATH_ENV);
        }
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const FULL_TOML: &str = r#"
[server]
listen_addr = "0.0.0.0:7000"
max_connections = 32

[store]
path = "/var/lib/account-pool/accounts.json"

[recovery]
poll_interval_secs = 15

[usage]
session_suffix_markers = ["-worker-"]
"#;

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, FULL_TOML);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.server.max_connections, 32);
        assert_eq!(
            config.store.path,
            PathBuf::from("/var/lib/account-pool/accounts.json")
        );
        assert_eq!(config.recovery.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.usage.session_suffix_markers, vec!["-worker-"]);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.store.path, PathBuf::from("accounts.json"));
        assert_eq!(config.recovery.poll_interval_secs, 60);
        assert_eq!(
            config.usage.session_suffix_markers,
            vec!["-ai-", "-terminal"]
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");

        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, FULL_TOML);

        unsafe {
            set_env(LISTEN_ADDR_ENV, "127.0.0.1:9999");
            set_env(STORE_PATH_ENV, "/tmp/override.json");
        }
        let config = Config::load(&path).unwrap();
        clear_overrides();

        assert_eq!(config.server.listen_addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.store.path, PathBuf::from("/tmp/override.json"));
    }

    #[test]
    fn test_invalid_listen_addr_env_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, FULL_TOML);

        unsafe { set_env(LISTEN_ADDR_ENV, "not-an-addr") };
        let result = Config::load(&path);
        clear_overrides();

        let err = result.unwrap_err();
        assert!(
            matches!(&err, common::Error::InvalidEnv { var, value }
                if var == LISTEN_ADDR_ENV && value == "not-an-addr"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[recovery]\npoll_interval_secs = 0\n");

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("poll_interval_secs must be greater than 0"),
            "error message should name the field, got: {err}"
        );
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[server]\nmax_connections = 0\n");

        let result = Config::load(&path);
        assert!(result.is_err(), "max_connections = 0 must be rejected");
    }

    #[test]
    fn test_empty_suffix_marker_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[usage]\nsession_suffix_markers = [\"\"]\n");

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("account-pool.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
