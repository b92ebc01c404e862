use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use libraryservice_repository::records_repository::PostgresRecordStoreConfig;

use crate::catalog_fetcher::CatalogFetcherConfig;
use crate::crawl_scheduler::CrawlConfig;

pub const ENV_PREFIX: &str = "LIBRARY";

/// Crawler settings, read from `LIBRARY__*` environment variables,
/// e.g. `LIBRARY__DATABASE__HOSTNAME` or `LIBRARY__CRAWL__KEYWORDS=0,1,2`.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionSettings {
    #[serde(default)]
    pub use_in_memory_db: bool,
    pub database: PostgresRecordStoreConfig,
    #[serde(default)]
    pub catalog: CatalogFetcherConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
}

impl IngestionSettings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_environment(environment())
    }

    pub fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("database.hostname", "127.0.0.1")?
            .set_default("database.username", "postgres")?
            .set_default("database.password", "postgres")?
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
        .list_separator(",")
        .with_list_parse_key("crawl.keywords")
}
