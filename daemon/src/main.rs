//! slidemanagerd - the SlideManager indexing daemon.
//!
//! Binds a localhost HTTP control surface and runs indexing jobs in the
//! background. The desktop shell talks to it over `POST /jobs/index`,
//! the job control endpoints, and the SSE event stream.

mod error;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use slidemanager_core::{EventBus, JobManager, OpenAiEmbeddingApi};

#[derive(Debug, Parser)]
#[command(name = "slidemanagerd", about = "SlideManager indexing daemon")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind.
    #[arg(long, default_value_t = 8731)]
    port: u16,

    /// OpenAI API key for text embeddings. Jobs run without it, but
    /// text-vector tasks will fail with OPENAI_AUTH.
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    openai_api_key: String,

    /// Override the embeddings API base URL (proxies, self-hosted gateways).
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    /// Path to the headless office converter binary.
    #[arg(long, default_value = "soffice")]
    soffice_bin: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.openai_api_key.is_empty() {
        tracing::warn!("no OpenAI API key configured; text embeddings will fail with OPENAI_AUTH");
    }

    let embedding_api = Arc::new(OpenAiEmbeddingApi::with_base_url(
        args.openai_api_key,
        args.openai_base_url,
    ));
    let manager = Arc::new(JobManager::new(
        Arc::new(EventBus::new()),
        embedding_api,
        args.soffice_bin,
    ));

    let app = server::router(manager);
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    tracing::info!(host = %args.host, port = args.port, "slidemanagerd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    tracing::info!("shutdown requested");
}
