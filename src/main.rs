use figment::providers::Format;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use strmgen::{build_router, config, db, processor, settings, AppState};

#[tokio::main]
async fn main() {
    // Reloadable filter: the settings row can change the level at runtime
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "strmgen=info,tower_http=warn".into()),
    );
    let (filter_layer, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    settings::logging::set_reload_handle(reload_handle);

    tracing::info!("Starting strmgen v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config::ensure_appdata_dirs() {
        tracing::warn!(
            "Failed to create appData directories: {}. Continuing with legacy paths.",
            e
        );
    }

    let config_path = config::get_config_path();
    let db_path = config::get_db_path();

    tracing::info!("Loading config from: {}", config_path.display());
    tracing::info!("Using database at: {}", db_path.display());

    let config: config::Config = figment::Figment::new()
        .merge(figment::providers::Serialized::defaults(config::Config::default()))
        .merge(figment::providers::Toml::file(config_path))
        .merge(figment::providers::Env::prefixed("STRMGEN_"))
        .extract()
        .expect("Failed to load configuration");

    let db = Arc::new(db::Db::new(&db_path).expect("Failed to initialize database"));

    // Apply the persisted logging fields (level, SQL echo) process-wide
    match db.get_settings() {
        Ok(settings) => settings::logging::apply_settings(&settings),
        Err(e) => tracing::warn!("Could not read settings row: {}", e),
    }

    let processor = Arc::new(processor::Processor::new(Arc::clone(&db)));

    // Background singletons: retries re-armed, orphans healed
    let retry_service = processor::RetryService::new(Arc::clone(&processor));
    retry_service.start();

    let recovery_service = processor::RecoveryService::new(Arc::clone(&db));
    match recovery_service.start().await {
        Ok(report) => tracing::info!(
            "Startup recovery: {} checked, {} recovered, {} timed out",
            report.checked_tasks,
            report.recovered_tasks,
            report.timeout_tasks
        ),
        Err(e) => tracing::error!("Startup recovery failed: {}", e),
    }

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        processor,
        retry_service,
        recovery_service,
    });

    let app = build_router(state);

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| [0, 0, 0, 0].into()),
        config.server.port,
    ));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.unwrap();
}
