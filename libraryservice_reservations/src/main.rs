use std::sync::Arc;

use actix_web::{App, HttpServer};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use paperclip::actix::{web, OpenApiExt};
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use libraryservice_repository::records_repository::{
    InMemoryRecordStore, PostgresRecordStore, RecordStore,
};
use libraryservice_reservations::app_config::config_app;
use libraryservice_reservations::reservation_manager::ReservationManager;
use libraryservice_reservations::settings::ReservationsSettings;

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry() {
    let app_name = "libraryservice_reservations";

    // Spans are exported in batch
    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Filter based on level - trace, debug, info, warn, error
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

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    let settings = ReservationsSettings::load().expect("Failed to load settings");
    tracing::info!(
        "starting HTTP server at http://{}:{}",
        settings.bind_address,
        settings.port
    );

    let records_store: Arc<dyn RecordStore> = if settings.use_in_memory_db {
        Arc::new(InMemoryRecordStore::default())
    } else {
        Arc::new(
            PostgresRecordStore::init(settings.database.clone())
                .await
                .expect("Failed to init postgres"),
        )
    };
    let reservation_manager = web::Data::new(ReservationManager::new(
        records_store.clone(),
        settings.lending,
    ));

    HttpServer::new(move || {
        App::new()
            .wrap_api()
            .app_data(web::Data::new(records_store.clone()))
            .app_data(reservation_manager.clone())
            .wrap(TracingLogger::default())
            .configure(config_app)
            .with_json_spec_at("/apispec/v2")
            .build()
    })
    .bind((settings.bind_address.as_str(), settings.port))?
    .run()
    .await?;

    global::shutdown_tracer_provider();
    Ok(())
}
