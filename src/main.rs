mod config;
mod frame;
mod llm;
mod persona;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 3000;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    if let Ok(path) = dotenv {
        tracing::info!(path = %path.display(), "loaded .env");
    }

    let port = match std::env::var("PORT") {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(%raw, "invalid PORT, using default");
            DEFAULT_PORT
        }),
        Err(_) => DEFAULT_PORT,
    };

    let settings = config::Settings::from_env();
    tracing::info!(
        session_secs = settings.session_duration_secs,
        extension_secs = settings.extension_duration_secs,
        warning_secs = settings.extension_warning_secs,
        auto_reconnect = settings.auto_reconnect,
        "settings loaded"
    );

    // Non-fatal: without a completion backend replies fall back to the apology
    // and extension decisions to the rule-based coin.
    let llm: Option<Arc<dyn llm::LlmChat>> = match llm::LlmClient::from_env() {
        Ok(client) => {
            tracing::info!(model = client.model(), "LLM client initialized");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!(error = %e, "LLM client not configured, persona replies disabled");
            None
        }
    };

    let personas = Arc::new(persona::StaticPersonaStore::from_env());
    let state = state::AppState::new(personas, llm, settings);

    let _sweeper = services::lifecycle::spawn_sweeper(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "ephemera listening");
    axum::serve(listener, app).await
}
