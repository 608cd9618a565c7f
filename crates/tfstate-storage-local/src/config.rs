use std::path::PathBuf;

use clap::Parser;

/// Configuration for the tfstate-storage-local plugin server.
#[derive(Parser, Debug, Clone)]
#[command(name = "tfstate-storage-local")]
#[command(about = "Local filesystem state storage plugin (gRPC)")]
pub struct Config {
    /// Transport type: tcp or unix
    #[arg(long, default_value = "tcp", env = "GRPC_TRANSPORT")]
    pub transport: Transport,

    /// TCP host to bind to (only used with --transport tcp)
    #[arg(long, default_value = "127.0.0.1", env = "GRPC_HOST")]
    pub host: String,

    /// TCP port to bind to (only used with --transport tcp)
    #[arg(long, default_value = "50051", env = "GRPC_PORT")]
    pub port: u16,

    /// Unix socket path (only used with --transport unix)
    #[arg(long, env = "GRPC_UNIX_SOCKET")]
    pub unix_socket: Option<PathBuf>,

    /// Directory used by the "local" storage when its configuration has no path
    #[arg(long, env = "LOCAL_STORAGE_DIR")]
    pub local_storage_dir: Option<PathBuf>,

    /// Parent process PID to watch. If set, server will exit when parent dies.
    /// The orchestrator that spawned the plugin passes its own PID here.
    #[arg(long)]
    pub parent_pid: Option<u32>,
}

impl Config {
    /// Get the effective local storage directory.
    pub fn effective_local_storage_dir(&self) -> PathBuf {
        self.local_storage_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tfstate-storage")
        })
    }

    /// Get the effective Unix socket path.
    #[cfg(unix)]
    pub fn effective_unix_socket(&self) -> PathBuf {
        self.unix_socket.clone().unwrap_or_else(|| {
            std::env::var("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join("tfstate-storage-local.sock")
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    Tcp,
    Unix,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Unix => write!(f, "unix"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["tfstate-storage-local"]).unwrap();
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.port, 50051);
        assert!(config.parent_pid.is_none());
    }

    #[test]
    fn test_explicit_storage_dir() {
        let config = Config::try_parse_from([
            "tfstate-storage-local",
            "--transport",
            "unix",
            "--local-storage-dir",
            "/srv/tfstate",
        ])
        .unwrap();
        assert_eq!(config.transport, Transport::Unix);
        assert_eq!(
            config.effective_local_storage_dir(),
            PathBuf::from("/srv/tfstate")
        );
    }
}
