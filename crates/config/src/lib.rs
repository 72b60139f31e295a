use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the backend.
///
/// The configuration is loaded from environment variables (optionally via a `.env`
/// file) or falls back to defaults suitable for local runs. Fields cover the
/// database connection, the HTTP server, and timeout settings. This struct is
/// deserializable via Serde.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose,
    /// "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,
    /// Per-statement timeout on the store. Kept generous because inventory
    /// writes go to a remote endpoint (default: 40s).
    #[serde(deserialize_with = "deserialize_duration")]
    pub db_statement_timeout: Duration,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

/// Custom deserializer for human-readable durations like "5s", "40s", "1m".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from a
    /// `.env` file). Fields not set via env are filled with defaults.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "cafeteria_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "cafeteria_db")?
            .set_default("db_statement_timeout", "40s")?
            // HTTP
            .set_default("http_port", 8080)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            .add_source(config::Environment::default())
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Postgres DSN assembled from the database fields. The statement timeout is
    /// applied server-side for every connection drawn from the pool.
    pub fn db_dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable options='-c statement_timeout={}'",
            self.db_host,
            self.db_port,
            self.db_user,
            self.db_password,
            self.db_name,
            self.db_statement_timeout.as_millis(),
        )
    }
}
