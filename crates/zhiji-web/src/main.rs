mod error;
mod routes;

use std::sync::Arc;

use anyhow::Result;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use zhiji_core::config::ZhijiConfig;
use zhiji_core::embedding::EmbeddingService;
use zhiji_core::events::EventExtractor;
use zhiji_core::graph::ConversationEngine;
use zhiji_core::llm::{LlmService, TextGenerator};
use zhiji_core::mood::MoodAnalyzer;
use zhiji_core::rag::RagService;
use zhiji_core::report::ReportService;
use zhiji_core::search::SearchService;
use zhiji_core::storage::JsonStore;

pub struct AppState {
    pub store: Arc<JsonStore>,
    pub engine: ConversationEngine,
    pub mood: MoodAnalyzer,
    pub events: EventExtractor,
    pub reports: ReportService,
    pub rag: Option<Arc<RagService>>,
    pub search: Arc<SearchService>,
    pub llm: Option<Arc<dyn TextGenerator>>,
    pub embedding_provider: String,
}

impl AppState {
    /// Wire every service from one config. `rag` is passed in so the caller
    /// decides whether to build and index the knowledge base.
    pub fn new(
        config: &ZhijiConfig,
        llm: Option<Arc<dyn TextGenerator>>,
        rag: Option<Arc<RagService>>,
        embedding_provider: impl Into<String>,
    ) -> Result<Self> {
        let store = Arc::new(JsonStore::new(&config.storage.data_dir, config.timeouts.db));
        let search = Arc::new(SearchService::from_config(&config.search, &config.timeouts)?);
        let t = &config.timeouts;
        Ok(Self {
            engine: ConversationEngine::new(config, store.clone(), llm.clone(), rag.clone(), search.clone()),
            mood: MoodAnalyzer::new(llm.clone(), t.mood),
            events: EventExtractor::new(llm.clone(), t.event),
            reports: ReportService::new(llm.clone(), store.clone(), t.analysis),
            store,
            rag,
            search,
            llm,
            embedding_provider: embedding_provider.into(),
        })
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("zhiji_web=info,zhiji_core=info"));
    if std::env::var("ZHIJI_LOG_JSON").is_ok_and(|v| v == "1") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cwd = std::env::current_dir().ok();
    let config = ZhijiConfig::load(cwd.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("failed to load config, using defaults: {e}");
        ZhijiConfig::default_config()
    });

    let llm: Option<Arc<dyn TextGenerator>> = if config.llm.enabled {
        match LlmService::from_config(&config.llm) {
            Ok(service) => Some(Arc::new(service)),
            Err(e) => {
                tracing::warn!("LLM unavailable, replies will use fallbacks: {e}");
                None
            }
        }
    } else {
        None
    };

    let embedder = Arc::new(EmbeddingService::from_config(&config.embedding)?);
    let embedding_provider = embedder.provider_name().to_string();

    let rag = if config.rag.enabled {
        let rag = Arc::new(RagService::from_config(&config, embedder)?);
        match rag.initialize().await {
            Ok(report) => tracing::info!(
                files = report.files_indexed,
                removed = report.files_removed,
                chunks = report.chunks_added,
                "knowledge base ready"
            ),
            Err(e) => tracing::warn!("knowledge base initialization failed: {e}"),
        }
        Some(rag)
    } else {
        None
    };

    let state = Arc::new(AppState::new(&config, llm, rag, embedding_provider)?);

    let app = routes::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.web.host, config.web.port);
    tracing::info!("zhiji-web listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
