//! LightRAG server - main entry point
//!
//! Serves the multi-collection RAG HTTP API.

use std::net::TcpListener as StdListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lightrag_server::constants::{DEFAULT_PORT, PORT_SEARCH_ATTEMPTS, VERSION};
use lightrag_server::paths::default_storage_dir;
use lightrag_server::{api, metrics, Error, LightRagManager, ServiceManager, StorageLayout, StorageLock};

#[derive(Parser)]
#[command(name = "lightrag_server")]
#[command(about = "LightRAG knowledge-graph RAG server", long_about = None)]
#[command(version)]
struct Cli {
    /// Port to listen on (0 picks the first free port from 9621)
    #[arg(long, env = "PORT", default_value_t = 0)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Storage root for collections, inputs and config
    #[arg(long, env = "LIGHTRAG_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Explicit config file path
    #[arg(long, env = "LIGHTRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: debug | info | warning | error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn tracing_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warning" | "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// First port in `start..start+attempts` that can be bound on localhost.
/// First port in `start..start + attempts` that `host` can bind.
fn find_free_port(host: &str, start: u16, attempts: u16) -> lightrag_server::Result<u16> {
    let end = start.saturating_add(attempts);
    (start..end)
        .find(|port| StdListener::bind((host, *port)).is_ok())
        .ok_or(Error::NoFreePort { start, end })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env for local development
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let directive = format!("lightrag_server={}", tracing_level(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let root = cli.storage_dir.unwrap_or_else(default_storage_dir);
    let layout = StorageLayout::new(root).with_config_file(cli.config);
    let lock = StorageLock::acquire(&layout)?;

    let port = match cli.port {
        0 => find_free_port(&cli.host, DEFAULT_PORT, PORT_SEARCH_ATTEMPTS)?,
        port => port,
    };

    metrics::init_collectors();
    let manager = Arc::new(LightRagManager::new(layout).await?);
    let service = Arc::new(ServiceManager::new(manager.working_dir().await));
    service.add_shutdown_callback("storage_lock", move || drop(lock));
    let app = api::router(api::AppState::new(Arc::clone(&manager), Arc::clone(&service)));

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), port)).await?;
    let base = format!("http://{}:{port}", cli.host);
    info!(version = VERSION, storage = %manager.layout().root().display(), "LightRAG server starting");
    println!("LightRAG server v{VERSION}");
    println!("  API:      {base}/");
    println!("  Overview: {base}/overview");
    println!("  Config:   {base}/config");
    println!("  Metrics:  {base}/metrics");

    service.set_running();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(service.shutdown_signal())
        .await;
    if let Err(err) = &served {
        error!("Server error: {err}");
        service.set_error(err.to_string());
        service.initiate_shutdown("server error");
    }

    service.graceful_shutdown().await;
    println!(
        "LightRAG server stopped after {:.1}s. Goodbye!",
        service.uptime().as_secs_f64()
    );
    served.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_to_tracing() {
        assert_eq!(tracing_level("WARNING"), "warn");
        assert_eq!(tracing_level("debug"), "debug");
        assert_eq!(tracing_level("verbose"), "info");
    }

    #[test]
    fn bound_port_is_not_free() {
        let held = StdListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = held.local_addr().unwrap().port();
        assert!(matches!(
            find_free_port("127.0.0.1", taken, 1),
            Err(Error::NoFreePort { .. })
        ));
    }

    #[test]
    fn port_search_uses_the_serving_host() {
        let held = StdListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = held.local_addr().unwrap().port();
        assert!(matches!(
            find_free_port("0.0.0.0", taken, 1),
            Err(Error::NoFreePort { .. })
        ));
    }
}
