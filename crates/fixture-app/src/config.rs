use serde::Deserialize;
use std::fmt;

/// Application settings read from the environment the runner launches us with.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Secret shared with the runner for verifying acting-as tokens.
    pub app_key: String,

    /// Reported back by `/server_variables`.
    #[serde(default = "default_db_connection")]
    pub db_connection: String,

    /// How long `/sleep` takes to answer.
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,
}

fn default_db_connection() -> String { "sqlite".to_string() }
fn default_sleep_ms() -> u64 { 1_000 }

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env::<Config>()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.app_key.is_empty() {
            return Err("APP_KEY is empty. The runner exports it to every launched process.".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DB connection: {}, Sleep: {}ms",
            self.db_connection, self.sleep_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[tracing_test::traced_test]
    #[test]
    fn test_load_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();

        env::set_var("APP_KEY", "secret");
        env::set_var("DB_CONNECTION", "testbench");
        env::remove_var("SLEEP_MS");

        let config = Config::from_env().expect("Failed to load config from env");
        config.validate().expect("Config validation failed");

        assert_eq!(config.app_key, "secret");
        assert_eq!(config.db_connection, "testbench");
        assert_eq!(config.sleep_ms, 1_000);

        env::remove_var("APP_KEY");
        env::remove_var("DB_CONNECTION");
    }

    #[test]
    fn test_empty_app_key_is_invalid() {
        let config = Config {
            app_key: String::new(),
            db_connection: default_db_connection(),
            sleep_ms: 0,
        };
        assert!(config.validate().is_err());
    }
}
