use std::sync::Arc;

use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use libraryservice_ingestion::catalog_fetcher::CatalogFetcher;
use libraryservice_ingestion::crawl_scheduler::CrawlScheduler;
use libraryservice_ingestion::settings::IngestionSettings;
use libraryservice_repository::records_repository::{
    InMemoryRecordStore, PostgresRecordStore, RecordStore,
};

fn init_telemetry() {
    let app_name = "libraryservice_crawler";

    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_telemetry();

    let settings = IngestionSettings::load()?;
    tracing::info!(
        use_in_memory_db = settings.use_in_memory_db,
        catalog_url = settings.catalog.base_url.as_str(),
        "Starting catalog crawler"
    );

    let postgres_store = if settings.use_in_memory_db {
        None
    } else {
        Some(Arc::new(
            PostgresRecordStore::init(settings.database.clone()).await?,
        ))
    };
    let store: Arc<dyn RecordStore> = match &postgres_store {
        Some(postgres_store) => postgres_store.clone(),
        None => Arc::new(InMemoryRecordStore::default()),
    };

    let fetcher = Arc::new(CatalogFetcher::new(settings.catalog.clone())?);
    let scheduler = CrawlScheduler::new(fetcher, store, settings.crawl.clone());
    let report = scheduler.run().await;

    for keyword in report.keywords.iter() {
        tracing::info!(
            keyword = keyword.keyword.as_str(),
            total_count = keyword.total_count,
            pages_processed = keyword.pages_processed,
            pages_abandoned = keyword.pages_abandoned,
            pages_store_failed = keyword.pages_store_failed,
            records_stored = keyword.records_stored,
            skipped = ?keyword.skipped,
            "Keyword summary"
        );
    }

    if let Some(postgres_store) = postgres_store {
        postgres_store.close();
    }

    global::shutdown_tracer_provider();
    Ok(())
}
