use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use libraryservice_repository::records_repository::PostgresRecordStoreConfig;

use crate::reservation_manager::LendingPolicy;

pub const ENV_PREFIX: &str = "LIBRARY";

/// Service settings, read from `LIBRARY__*` environment variables,
/// e.g. `LIBRARY__PORT=8002` or `LIBRARY__LENDING__LOAN_PERIOD_DAYS=14`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReservationsSettings {
    #[serde(default)]
    pub use_in_memory_db: bool,
    pub database: PostgresRecordStoreConfig,
    pub bind_address: String,
    pub port: u16,
    #[serde(default)]
    pub lending: LendingPolicy,
}

impl ReservationsSettings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_environment(environment())
    }

    pub fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("database.hostname", "127.0.0.1")?
            .set_default("database.username", "postgres")?
            .set_default("database.password", "postgres")?
            .set_default("bind_address", "0.0.0.0")?
            .set_default("port", 8080)?
            .add_source(environment)
            .build()?
            .try_deserialize()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
