use std::sync::Arc;

use catchup::ai::AnthropicClient;
use catchup::api::{triage_routes, ApiState};
use catchup::config::{AiConfig, TriageConfig};
use catchup::pipeline::TriagePipeline;
use catchup::store::{LibSqlBackend, TriageStore};
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let ai_config = AiConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    let port: u16 = std::env::var("CATCHUP_PORT")
        .unwrap_or_else(|_| "8085".to_string())
        .parse()
        .unwrap_or(8085);

    let db_path =
        std::env::var("CATCHUP_DB_PATH").unwrap_or_else(|_| "./data/catchup.db".to_string());

    eprintln!("📬 Catchup v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", ai_config.model);
    eprintln!("   Triage API: http://0.0.0.0:{port}/api/triage/run");
    eprintln!("   Database: {db_path}");

    // ── Storage ──────────────────────────────────────────────────────
    let store: Arc<dyn TriageStore> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );

    // ── AI client + pipeline ─────────────────────────────────────────
    let client = Arc::new(AnthropicClient::new(ai_config)?);
    let pipeline = Arc::new(TriagePipeline::new(
        Arc::clone(&store),
        client,
        TriageConfig::default(),
    ));

    // ── HTTP server ──────────────────────────────────────────────────
    let app = triage_routes(ApiState { pipeline, store }).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "Triage server started");
    axum::serve(listener, app).await?;

    Ok(())
}
