mod logging;
mod routes;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use clauselens_core::{analysis::Analyzer, config::Config, db::Db, rag::RagPipeline};
use clauselens_llm::{HttpLlmClient, LanguageModel};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

use logging::BroadcastLayer;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LanguageModel>,
    pub rag: Arc<RagPipeline>,
    pub analyzer: Arc<Analyzer>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(std::sync::Mutex::new(VecDeque::new()));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "clauselens_server=info,clauselens_core=info,clauselens_llm=info,tower_http=warn".into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Arc::new(Config::from_env()?);

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/clauselens.db", config.data_dir);
    let db = Arc::new(Db::open(&db_path)?);
    db.migrate()?;

    let llm: Arc<dyn LanguageModel> = Arc::new(
        HttpLlmClient::new(&config.api_key, &config.chat_url, &config.embed_url)
            .with_chat_model(&config.chat_model)
            .with_embed_model(&config.embed_model),
    );

    let rag = Arc::new(RagPipeline::new(Arc::clone(&db), Arc::clone(&llm)));
    let analyzer = Arc::new(
        Analyzer::new(Arc::clone(&llm)).with_map_concurrency(config.map_concurrency),
    );

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        llm,
        rag,
        analyzer,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let app = Router::new()
        // Health + status + logs
        .route("/api/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        .route("/api/logs", get(routes::sse_logs))
        // Documents
        .route("/documents/upload", post(routes::upload_document))
        .route("/documents/analyze-sync/:id", post(routes::analyze_sync))
        .route("/documents/analyze/:id", post(routes::analyze_stream))
        .route("/documents/query", post(routes::query_document))
        .route("/documents/reindex/:id", post(routes::reindex_document))
        .route("/documents/index-stats/:id", get(routes::index_stats))
        .route("/documents/export-docx", post(routes::export_docx))
        .route("/documents/assist", post(routes::assist))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = config.bind_addr();
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
