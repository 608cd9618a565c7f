mod config;
mod lock;
mod paths;
mod provider;
mod service;
mod shutdown;
mod storage;

use std::sync::Arc;

use clap::Parser;
use tfstate_storage_core::{MemoryProvider, StateStorage};
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use std::path::Path;
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(unix)]
use tokio_stream::wrappers::UnixListenerStream;

use config::{Config, Transport};
use provider::LocalProvider;
use service::proto::state_storage_server::StateStorageServer;
use service::StateStorageService;

/// File descriptor set for gRPC reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("storage_descriptor");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting tfstate-storage-local server");
    info!("  Transport: {}", config.transport);
    if let Some(ppid) = config.parent_pid {
        info!("  Parent PID: {} (will exit when parent dies)", ppid);
    }

    let dir = config.effective_local_storage_dir();
    info!("  Default local storage dir: {}", dir.display());

    // Nothing is opened until ConfigureStorage picks one of these.
    let storage = StateStorage::new(vec![
        Arc::new(LocalProvider::new(&dir)),
        Arc::new(MemoryProvider),
    ]);
    info!("  Storage types: {}", storage.storage_names().join(", "));

    let storage_svc = StateStorageServer::new(StateStorageService::new(Arc::new(storage)));

    if config.parent_pid.is_some() {
        shutdown::request_parent_death_signal();
    }
    let mut shutdown_rx = shutdown::watch_for_shutdown(config.parent_pid);
    let shutdown_future = async move {
        let _ = shutdown_rx.wait_for(|&v| v).await;
    };

    let reflection_svc = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let router = Server::builder()
        .add_service(reflection_svc)
        .add_service(storage_svc);

    match config.transport {
        Transport::Tcp => {
            let addr = format!("{}:{}", config.host, config.port).parse()?;
            info!("Listening on tcp://{}", addr);
            router.serve_with_shutdown(addr, shutdown_future).await?;
        }
        #[cfg(unix)]
        Transport::Unix => {
            let socket_path = config.effective_unix_socket();
            let incoming = UnixListenerStream::new(bind_unix_socket(&socket_path)?);
            info!("Listening on unix://{}", socket_path.display());

            let served = router
                .serve_with_incoming_shutdown(incoming, shutdown_future)
                .await;
            if let Err(e) = std::fs::remove_file(&socket_path) {
                warn!("Failed to remove {}: {}", socket_path.display(), e);
            }
            served?;
        }
        #[cfg(not(unix))]
        Transport::Unix => {
            anyhow::bail!("Unix socket transport is not supported on Windows. Use TCP instead.");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Bind a fresh socket at `path`, replacing a stale one from an earlier run.
#[cfg(unix)]
fn bind_unix_socket(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}
