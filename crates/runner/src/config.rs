use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::RunnerError;

/// Whether the runner keeps one application process for its whole lifetime
/// or launches a fresh one for every dispatched batch.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPolicy {
    /// One lazily started process shared by every batch.
    #[default]
    Reuse,
    /// A new process per batch, kept alive until its handles are dropped.
    PerBatch,
}

/// Runner configuration, loaded from `PARALLEL_*` environment variables or
/// built in code with [`RunnerConfig::new`].
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Application entry point, invoked as `<binary> <args..> --host H --port P`.
    pub binary: PathBuf,

    /// Arguments placed before `--host`/`--port`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Interface the application binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Fixed port. An ephemeral one is allocated when unset.
    #[serde(default)]
    pub port: Option<u16>,

    /// Per-request ceiling in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// How long a launched process may take to accept connections.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    #[serde(default)]
    pub process_policy: ProcessPolicy,

    /// Echo the child's stdout/stderr into this process's own output.
    #[serde(default = "default_passthrough")]
    pub passthrough_output: bool,

    /// Shared secret exported to the child as `APP_KEY` and used to sign
    /// acting-as identities.
    #[serde(default = "default_app_key")]
    pub app_key: String,

    /// Extra environment for the child process.
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
}

pub type RunnerConfig = Config;

fn default_args() -> Vec<String> { vec!["serve".to_string()] }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_request_timeout() -> u64 { 30_000 }
fn default_ready_timeout() -> u64 { 5_000 }
fn default_passthrough() -> bool { true }
fn default_app_key() -> String { "parallel-runner-insecure-app-key".to_string() }

/// Environment variable the child reads its signing key from.
pub const APP_KEY_ENV: &str = "APP_KEY";

impl Config {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: default_args(),
            host: default_host(),
            port: None,
            request_timeout_ms: default_request_timeout(),
            ready_timeout_ms: default_ready_timeout(),
            process_policy: ProcessPolicy::default(),
            passthrough_output: default_passthrough(),
            app_key: default_app_key(),
            env: BTreeMap::new(),
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, RunnerError> {
        for (key, value) in std::env::vars() {
            if key.starts_with("PARALLEL_") {
                tracing::debug!("Environment variable: {}={}", key, value);
            }
        }
        Ok(envy::prefixed("PARALLEL_").from_env::<Config>()?)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.binary.as_os_str().is_empty() {
            return Err(RunnerError::Config("No binary configured. Please set PARALLEL_BINARY.".to_string()));
        }
        if self.host.is_empty() {
            return Err(RunnerError::Config("Host must not be empty.".to_string()));
        }
        if self.request_timeout_ms == 0 || self.ready_timeout_ms == 0 {
            return Err(RunnerError::Config("Timeouts must be greater than zero.".to_string()));
        }
        if self.port == Some(0) {
            return Err(RunnerError::Config("Port 0 is reserved; leave the port unset for an ephemeral one.".to_string()));
        }
        if self.app_key.is_empty() {
            return Err(RunnerError::Config("App key must not be empty.".to_string()));
        }
        if let Some(key) = self.env.get(APP_KEY_ENV) {
            if *key != self.app_key {
                return Err(RunnerError::Config(format!(
                    "{} in the child environment differs from the app key used to sign identities.",
                    APP_KEY_ENV
                )));
            }
        }
        Ok(())
    }

    /// Adds a variable to the child environment. `APP_KEY` sets the app key
    /// instead, so the child and the identity encoder agree on it.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        if key == APP_KEY_ENV {
            self.app_key = value;
        } else {
            self.env.insert(key, value);
        }
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_policy(mut self, policy: ProcessPolicy) -> Self {
        self.process_policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough_output = passthrough;
        self
    }

    pub fn with_app_key(mut self, key: impl Into<String>) -> Self {
        self.app_key = key.into();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Child environment including the signing key.
    pub(crate) fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert(APP_KEY_ENV.to_string(), self.app_key.clone());
        env
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Binary: {}, Host: {}, Port: {}, Policy: {:?}",
            self.binary.display(),
            self.host,
            self.port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "ephemeral".to_string()),
            self.process_policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Tests that touch the process environment must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[tracing_test::traced_test]
    #[test]
    fn test_load_config_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();

        env::set_var("PARALLEL_BINARY", "/usr/local/bin/app");
        env::set_var("PARALLEL_PORT", "18123");
        env::set_var("PARALLEL_PROCESS_POLICY", "per_batch");
        env::set_var("PARALLEL_REQUEST_TIMEOUT_MS", "750");
        env::remove_var("PARALLEL_HOST");

        let config = Config::from_env().expect("Failed to load config from env");
        config.validate().expect("Config validation failed");

        assert_eq!(config.binary, PathBuf::from("/usr/local/bin/app"));
        assert_eq!(config.port, Some(18123));
        assert_eq!(config.process_policy, ProcessPolicy::PerBatch);
        assert_eq!(config.request_timeout(), Duration::from_millis(750));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.args, vec!["serve".to_string()]);

        env::remove_var("PARALLEL_BINARY");
        env::remove_var("PARALLEL_PORT");
        env::remove_var("PARALLEL_PROCESS_POLICY");
        env::remove_var("PARALLEL_REQUEST_TIMEOUT_MS");
    }

    #[test]
    fn test_missing_binary_is_a_config_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var("PARALLEL_BINARY");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::new("").validate().is_err());
        assert!(Config::new("app").with_port(0).validate().is_err());
        assert!(Config::new("app")
            .with_request_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(Config::new("app").validate().is_ok());
    }

    #[test]
    fn test_child_env_exports_app_key() {
        let config = Config::new("app")
            .with_app_key("secret")
            .with_env("DB_CONNECTION", "testbench");
        let env = config.child_env();
        assert_eq!(env.get(APP_KEY_ENV).map(String::as_str), Some("secret"));
        assert_eq!(env.get("DB_CONNECTION").map(String::as_str), Some("testbench"));

        let explicit = Config::new("app").with_env(APP_KEY_ENV, "explicit");
        assert_eq!(explicit.app_key, "explicit");
        assert!(explicit.validate().is_ok());
        assert_eq!(
            explicit.child_env().get(APP_KEY_ENV).map(String::as_str),
            Some("explicit")
        );
    }

    #[test]
    fn test_conflicting_app_key_is_rejected() {
        let mut config = Config::new("app").with_app_key("signing-key");
        config.env.insert(APP_KEY_ENV.to_string(), "other-key".to_string());

        let err = config.validate().unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
        assert!(Config::new("app").with_app_key("").validate().is_err());
    }
}
