// Módulos de la aplicación
mod api;
mod app_state;
mod audit;
mod chunk_index;
mod config;
mod double_check;
mod error;
mod evidence_gate;
mod llm;
mod models;
mod neo4j_client;
mod rerun;
mod store;
mod text;
mod transcript_tools;

#[cfg(test)]
mod test_support;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, Status};
use crate::audit::AuditRunner;
use crate::neo4j_client::Neo4jStore;
use crate::rerun::RerunService;
use crate::store::{CachedTranscriptSource, InMemoryTranscriptCache, ProductContextProvider};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Conectar a Neo4j y asegurar esquemas
    let graph = neo4j_client::connect_from_config(&cfg)
        .await
        .context("Error conectando a Neo4j")?;
    neo4j_client::ensure_schema(&graph)
        .await
        .context("Error asegurando el esquema de Neo4j")?;
    let store = Neo4jStore::new(Arc::new(graph));

    // 4. Inicializar gestor de LLMs
    let llm_manager = Arc::new(llm::LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?);

    // 5. Auditorías (transcripciones cacheadas) y re-ejecuciones (siempre
    //    desde el almacenamiento)
    let shared_store = Arc::new(store.clone());
    let products: Arc<dyn ProductContextProvider> = shared_store.clone();
    let cached_transcripts = CachedTranscriptSource::new(
        shared_store.clone(),
        Arc::new(InMemoryTranscriptCache::new(cfg.transcript_cache_capacity)),
    );

    let runner = AuditRunner {
        transcripts: Arc::new(cached_transcripts),
        configs: shared_store.clone(),
        store: shared_store.clone(),
        products: Some(products.clone()),
        evaluator: llm_manager.clone(),
        gate_policy: cfg.gate_policy,
        double_check_policy: cfg.double_check_policy,
        max_concurrency: cfg.audit_max_concurrency,
    };
    let reruns = RerunService {
        transcripts: shared_store.clone(),
        configs: shared_store.clone(),
        store: shared_store,
        products: Some(products),
        evaluator: llm_manager,
        gate_policy: cfg.gate_policy,
    };

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 6. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        store,
        runner: Arc::new(runner),
        reruns: Arc::new(reruns),
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            in_flight: 0,
        })),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 7. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 8. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {server_addr}"))?;
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
