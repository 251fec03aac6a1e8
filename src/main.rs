use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fhir_bridge::api::{api_router, AppContext};
use fhir_bridge::config::AppConfig;
use fhir_bridge::db;
use fhir_bridge::llm::OpenAiChatClient;
use fhir_bridge::storage::FileStore;

/// Files with no submission row older than this are reclaimed at startup.
const ORPHAN_GRACE: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!(
        endpoint = %config.llm_endpoint,
        model = %config.llm_model,
        bind = %config.bind_addr,
        "Starting fhir-bridge"
    );

    let files = FileStore::new(config.upload_dir.clone())?;
    let conn = db::open_database(&config.db_path)?;

    // Reap uploads whose ingest never reached the database.
    let known: HashSet<String> = db::all_submission_ids(&conn)?.into_iter().collect();
    let reaped = files.reap_orphans(&known, ORPHAN_GRACE);
    if reaped > 0 {
        tracing::info!(reaped, "Removed orphaned upload directories");
    }

    let chat = Arc::new(OpenAiChatClient::new(&config)?);
    let bind_addr = config.bind_addr.clone();
    let ctx = AppContext::new(config, conn, files, chat);
    let app = api_router(ctx);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app).await?;
    Ok(())
}
