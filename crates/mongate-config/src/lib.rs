//! Layered configuration for mongate connections.
//!
//! Settings for an environment are merged in this order, later layers
//! winning:
//!
//! 1. built-in defaults
//! 2. `<dir>/<env>.toml`
//! 3. `<dir>/local.toml`, or `<dir>/test-local.toml` when `env` is `test`
//! 4. `MONGATE_*` environment variables, `__` separating nested keys
//!    (`MONGATE_MONGO__CONNECTION` sets `mongo.connection`)
//!
//! The result translates into [`mongate_core::ConnectOptions`] plus the
//! connection string handed to `Client::connect`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mongate_core::ConnectOptions;

/// Selects the environment. Unset or blank means [`DEFAULT_ENV`].
pub const ENV_VAR: &str = "MONGATE_ENV";
/// Overrides the directory config files are read from.
pub const CONFIG_DIR_VAR: &str = "MONGATE_CONFIG_DIR";
pub const ENV_PREFIX: &str = "MONGATE_";
pub const DEFAULT_ENV: &str = "development";

const TEST_ENV: &str = "test";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Config structs ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Environment these settings were loaded for.
    #[serde(default = "default_env")]
    pub env: String,

    #[serde(default)]
    pub mongo: MongoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: default_env(),
            mongo: MongoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MongoConfig {
    /// Connection string, e.g. `mongodb://localhost:27017/app`.
    #[serde(default = "default_connection")]
    pub connection: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pool_size: Option<u32>,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            connection: default_connection(),
            connect_timeout_ms: default_connect_timeout_ms(),
            app_name: None,
            max_pool_size: None,
        }
    }
}

fn default_env() -> String {
    DEFAULT_ENV.into()
}
fn default_connection() -> String {
    "mongodb://localhost:27017/test".into()
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}

impl Config {
    pub fn is_dev(&self) -> bool {
        self.env == DEFAULT_ENV
    }

    pub fn is_test(&self) -> bool {
        self.env == TEST_ENV
    }

    pub fn connection_uri(&self) -> &str {
        &self.mongo.connection
    }

    pub fn to_connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_millis(self.mongo.connect_timeout_ms),
            app_name: self.mongo.app_name.clone(),
            max_pool_size: self.mongo.max_pool_size,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let uri = self.mongo.connection.trim();
        if uri.is_empty() || !uri.contains("://") {
            return Err(ConfigError::Validation {
                field: "mongo.connection".into(),
                reason: format!("expected a connection string, got '{uri}'"),
            });
        }
        if self.mongo.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                field: "mongo.connect_timeout_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.mongo.max_pool_size == Some(0) {
            return Err(ConfigError::Validation {
                field: "mongo.max_pool_size".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ── Environment and paths ───────────────────────────────────────────

/// The environment named by `MONGATE_ENV`.
pub fn environment() -> String {
    environment_from(std::env::var(ENV_VAR).ok())
}

fn environment_from(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(default_env)
}

/// Directory holding the per-environment files: `MONGATE_CONFIG_DIR` if
/// set, else the platform config directory.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_VAR).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    ProjectDirs::from("io", "mongate", "mongate")
        .map_or_else(|| PathBuf::from("config"), |dirs| dirs.config_dir().to_path_buf())
}

/// Name of the untracked override file for `env`.
pub fn local_file_name(env: &str) -> &'static str {
    if env == TEST_ENV {
        "test-local.toml"
    } else {
        "local.toml"
    }
}

// ── Loading ─────────────────────────────────────────────────────────

/// The merged provider stack for `env`, before extraction.
pub fn figment_for(dir: &Path, env: &str) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(dir.join(format!("{env}.toml"))))
        .merge(Toml::file(dir.join(local_file_name(env))))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate the config for `env` from `dir`. Missing files are
/// skipped.
pub fn load_config_from(dir: &Path, env: &str) -> Result<Config, ConfigError> {
    let mut config: Config = figment_for(dir, env).extract()?;
    config.env = env.to_owned();
    config.validate()?;
    Ok(config)
}

/// Load the config for the current environment from [`config_dir`].
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_dir(), &environment())
}

// ── Saving ──────────────────────────────────────────────────────────

/// Serialize `config` to TOML at `path`, creating parent directories.
pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(config)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    // Every test that loads runs inside a `Jail`: it owns a scratch
    // directory and the process environment until it returns.

    fn load(jail: &Jail, env: &str) -> Result<Config, ConfigError> {
        load_config_from(jail.directory(), env)
    }

    #[test]
    fn defaults_without_files() {
        Jail::expect_with(|jail| {
            let config = load(jail, "development").unwrap();

            assert!(config.is_dev());
            assert_eq!(config.connection_uri(), "mongodb://localhost:27017/test");
            assert_eq!(
                config.to_connect_options().connect_timeout,
                Duration::from_secs(20)
            );
            Ok(())
        });
    }

    #[test]
    fn env_file_then_local_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "staging.toml",
                "[mongo]\nconnection = \"mongodb://staging/app\"\napp_name = \"api\"\n",
            )?;
            jail.create_file("local.toml", "[mongo]\nconnection = \"mongodb://localhost/app\"\n")?;

            let config = load(jail, "staging").unwrap();
            assert_eq!(config.env, "staging");
            assert!(!config.is_dev());
            assert_eq!(config.connection_uri(), "mongodb://localhost/app");
            assert_eq!(config.mongo.app_name.as_deref(), Some("api"));
            Ok(())
        });
    }

    #[test]
    fn test_env_reads_test_local_only() {
        Jail::expect_with(|jail| {
            jail.create_file("test.toml", "[mongo]\nconnect_timeout_ms = 500\n")?;
            jail.create_file("local.toml", "[mongo]\nconnection = \"mongodb://ignored/x\"\n")?;
            jail.create_file("test-local.toml", "[mongo]\nconnection = \"mongodb://ci/test\"\n")?;

            let config = load(jail, "test").unwrap();
            assert!(config.is_test());
            assert_eq!(config.connection_uri(), "mongodb://ci/test");
            assert_eq!(
                config.to_connect_options().connect_timeout,
                Duration::from_millis(500)
            );
            Ok(())
        });
    }

    #[test]
    fn environment_variables_override_files() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "development.toml",
                "[mongo]\nconnection = \"mongodb://file/app\"\nconnect_timeout_ms = 1000\n",
            )?;
            jail.set_env("MONGATE_MONGO__CONNECTION", "mongodb://env/app");
            jail.set_env("MONGATE_MONGO__MAX_POOL_SIZE", "4");

            let config = load(jail, "development").unwrap();
            assert_eq!(config.connection_uri(), "mongodb://env/app");
            assert_eq!(config.mongo.connect_timeout_ms, 1000);
            assert_eq!(config.mongo.max_pool_size, Some(4));
            Ok(())
        });
    }

    #[test]
    fn load_config_follows_env_and_dir_variables() {
        Jail::expect_with(|jail| {
            jail.create_file("test-local.toml", "[mongo]\nconnection = \"mongodb://ci/test\"\n")?;
            jail.set_env(ENV_VAR, "test");
            let dir = jail.directory().display().to_string();
            jail.set_env(CONFIG_DIR_VAR, dir);

            let config = load_config().unwrap();
            assert!(config.is_test());
            assert_eq!(config.connection_uri(), "mongodb://ci/test");
            Ok(())
        });
    }

    #[test]
    fn files_cannot_change_the_environment() {
        Jail::expect_with(|jail| {
            jail.create_file("production.toml", "env = \"development\"\n")?;

            let config = load(jail, "production").unwrap();
            assert_eq!(config.env, "production");
            Ok(())
        });
    }

    #[test]
    fn malformed_file_is_a_load_error() {
        Jail::expect_with(|jail| {
            jail.create_file("development.toml", "[mongo\n")?;

            let err = load(jail, "development").unwrap_err();
            assert!(matches!(err, ConfigError::Figment(_)));
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("development.toml", "[mongo]\nconnection = \"localhost\"\n")?;
            let err = load(jail, "development").unwrap_err();
            assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "mongo.connection"));

            jail.create_file("development.toml", "[mongo]\nconnect_timeout_ms = 0\n")?;
            let err = load(jail, "development").unwrap_err();
            assert_eq!(err.to_string(), "invalid mongo.connect_timeout_ms: must be greater than zero");
            Ok(())
        });
    }

    #[test]
    fn written_config_loads_back() {
        Jail::expect_with(|jail| {
            let mut config = Config::default();
            config.mongo.connection = "mongodb://db.internal/orders".into();
            config.mongo.max_pool_size = Some(8);
            write_config(&jail.directory().join("development.toml"), &config).unwrap();

            let loaded = load(jail, "development").unwrap();
            assert_eq!(loaded, config);
            assert_eq!(loaded.to_connect_options().max_pool_size, Some(8));
            Ok(())
        });
    }

    #[test]
    fn write_config_creates_parent_directories() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested/dir/development.toml");
            write_config(&path, &Config::default()).unwrap();
            assert!(path.is_file());
            Ok(())
        });
    }

    #[test]
    fn environment_name_fallback() {
        assert_eq!(environment_from(None), "development");
        assert_eq!(environment_from(Some("  ".into())), "development");
        assert_eq!(environment_from(Some(" test ".into())), "test");
    }

    #[test]
    fn local_override_file_names() {
        assert_eq!(local_file_name("test"), "test-local.toml");
        assert_eq!(local_file_name("development"), "local.toml");
    }
}
