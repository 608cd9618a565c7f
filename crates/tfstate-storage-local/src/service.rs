use std::sync::Arc;

use tfstate_storage_core::{Diagnostics, Severity, StateStorage, StorageConfig, StorageServer};
use tonic::{Request, Response, Status};
use tracing::{debug, instrument};

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("tfstate.storage");
}

use proto::state_storage_server::StateStorage as StateStorageRpc;
use proto::{
    configure_storage, delete_state, get_states, health_check, lock_state, read_state,
    unlock_state, validate_storage_config, write_state,
};

/// gRPC front for a `StateStorage`.
///
/// Decodes each request, calls the matching storage operation, and encodes
/// its diagnostics. Storage problems never surface as a `Status`.
pub struct StateStorageService {
    storage: Arc<StateStorage>,
    version: String,
}

impl StateStorageService {
    pub fn new(storage: Arc<StateStorage>) -> Self {
        Self {
            storage,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Decode the wire configuration value. Only the JSON encoding is accepted.
fn decode_config(value: Option<&proto::DynamicValue>) -> Result<StorageConfig, Diagnostics> {
    let Some(value) = value else {
        return Ok(StorageConfig::default());
    };
    if !value.json.is_empty() {
        return StorageConfig::from_json(&value.json).map_err(|e| {
            let mut diags = Diagnostics::new();
            diags.error("Invalid storage configuration", e.to_string());
            diags
        });
    }
    if !value.msgpack.is_empty() {
        let mut diags = Diagnostics::new();
        diags.error(
            "Unsupported configuration encoding",
            "this plugin decodes JSON-encoded configuration only; msgpack was received",
        );
        return Err(diags);
    }
    Ok(StorageConfig::default())
}

/// Translate diagnostics to their wire form.
fn to_proto(diagnostics: Diagnostics) -> Vec<proto::Diagnostic> {
    diagnostics
        .into_iter()
        .map(|d| proto::Diagnostic {
            severity: match d.severity {
                Severity::Error => proto::diagnostic::Severity::Error,
                Severity::Warning => proto::diagnostic::Severity::Warning,
            } as i32,
            summary: d.summary,
            detail: d.detail,
            attribute: d.attribute.unwrap_or_default(),
        })
        .collect()
}

#[tonic::async_trait]
impl StateStorageRpc for StateStorageService {
    #[instrument(skip(self, request), level = "debug")]
    async fn validate_storage_config(
        &self,
        request: Request<validate_storage_config::Request>,
    ) -> Result<Response<validate_storage_config::Response>, Status> {
        let req = request.into_inner();
        let diagnostics = match decode_config(req.config.as_ref()) {
            Ok(config) => self.storage.validate_config(&req.storage_name, &config).await,
            Err(diags) => diags,
        };

        Ok(Response::new(validate_storage_config::Response {
            diagnostics: to_proto(diagnostics),
        }))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn configure_storage(
        &self,
        request: Request<configure_storage::Request>,
    ) -> Result<Response<configure_storage::Response>, Status> {
        let req = request.into_inner();
        let diagnostics = match decode_config(req.config.as_ref()) {
            Ok(config) => self.storage.configure(&req.storage_name, &config).await,
            Err(diags) => diags,
        };

        Ok(Response::new(configure_storage::Response {
            diagnostics: to_proto(diagnostics),
        }))
    }

    #[instrument(skip(self, _request), level = "debug")]
    async fn get_states(
        &self,
        _request: Request<get_states::Request>,
    ) -> Result<Response<get_states::Response>, Status> {
        let result = self.storage.list_states().await;

        Ok(Response::new(get_states::Response {
            state_names: result.value,
            diagnostics: to_proto(result.diagnostics),
        }))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn read_state(
        &self,
        request: Request<read_state::Request>,
    ) -> Result<Response<read_state::Response>, Status> {
        let req = request.into_inner();
        let result = self.storage.read_state(&req.state_name).await;

        Ok(Response::new(read_state::Response {
            state: result.value,
            diagnostics: to_proto(result.diagnostics),
        }))
    }

    #[instrument(skip(self, request), level = "debug", fields(state_len = request.get_ref().state.len()))]
    async fn write_state(
        &self,
        request: Request<write_state::Request>,
    ) -> Result<Response<write_state::Response>, Status> {
        let req = request.into_inner();
        debug!("Writing state {} ({} bytes)", req.state_name, req.state.len());
        let diagnostics = self.storage.write_state(&req.state_name, &req.state).await;

        Ok(Response::new(write_state::Response {
            diagnostics: to_proto(diagnostics),
        }))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn lock_state(
        &self,
        request: Request<lock_state::Request>,
    ) -> Result<Response<lock_state::Response>, Status> {
        let req = request.into_inner();
        let diagnostics = self.storage.lock_state(&req.state_name, &req.holder).await;

        Ok(Response::new(lock_state::Response {
            diagnostics: to_proto(diagnostics),
        }))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn unlock_state(
        &self,
        request: Request<unlock_state::Request>,
    ) -> Result<Response<unlock_state::Response>, Status> {
        let req = request.into_inner();
        let diagnostics = self
            .storage
            .unlock_state(&req.state_name, &req.holder, req.force)
            .await;

        Ok(Response::new(unlock_state::Response {
            diagnostics: to_proto(diagnostics),
        }))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn delete_state(
        &self,
        request: Request<delete_state::Request>,
    ) -> Result<Response<delete_state::Response>, Status> {
        let req = request.into_inner();
        let holder = Some(req.holder.as_str()).filter(|h| !h.is_empty());
        let diagnostics = self.storage.delete_state(&req.state_name, holder).await;

        Ok(Response::new(delete_state::Response {
            diagnostics: to_proto(diagnostics),
        }))
    }

    #[instrument(skip(self, _request), level = "debug")]
    async fn health_check(
        &self,
        _request: Request<health_check::Request>,
    ) -> Result<Response<health_check::Response>, Status> {
        debug!("Health check requested");
        Ok(Response::new(health_check::Response {
            healthy: true,
            backend: self
                .storage
                .configured_storage()
                .unwrap_or_default()
                .to_string(),
            configured: self.storage.is_configured(),
            version: self.version.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LocalProvider;
    use proto::diagnostic::Severity as WireSeverity;
    use proto::state_storage_client::StateStorageClient;
    use proto::state_storage_server::StateStorageServer;
    use tempfile::TempDir;
    use tfstate_storage_core::MemoryProvider;

    fn service(dir: &TempDir) -> StateStorageService {
        let storage = StateStorage::new(vec![
            Arc::new(LocalProvider::new(dir.path())),
            Arc::new(MemoryProvider),
        ]);
        StateStorageService::new(Arc::new(storage))
    }

    fn json_config(json: &str) -> Option<proto::DynamicValue> {
        Some(proto::DynamicValue {
            msgpack: vec![],
            json: json.as_bytes().to_vec(),
        })
    }

    async fn configure(svc: &StateStorageService, storage_name: &str) {
        let resp = svc
            .configure_storage(Request::new(configure_storage::Request {
                storage_name: storage_name.to_string(),
                config: json_config("{}"),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.diagnostics.is_empty(), "{:?}", resp.diagnostics);
    }

    async fn lock(svc: &StateStorageService, name: &str, holder: &str) -> Vec<proto::Diagnostic> {
        svc.lock_state(Request::new(lock_state::Request {
            state_name: name.to_string(),
            holder: holder.to_string(),
        }))
        .await
        .unwrap()
        .into_inner()
        .diagnostics
    }

    async fn unlock(
        svc: &StateStorageService,
        name: &str,
        holder: &str,
        force: bool,
    ) -> Vec<proto::Diagnostic> {
        svc.unlock_state(Request::new(unlock_state::Request {
            state_name: name.to_string(),
            holder: holder.to_string(),
            force,
        }))
        .await
        .unwrap()
        .into_inner()
        .diagnostics
    }

    #[test]
    fn test_decode_config() {
        assert!(decode_config(None).unwrap().is_empty());

        let config = decode_config(json_config(r#"{"path": "/srv"}"#).as_ref()).unwrap();
        assert_eq!(config.get_string("path"), Some("/srv"));

        let msgpack = proto::DynamicValue {
            msgpack: vec![0x80],
            json: vec![],
        };
        assert!(decode_config(Some(&msgpack)).unwrap_err().has_errors());
        assert!(decode_config(json_config("{oops").as_ref()).is_err());
    }

    #[tokio::test]
    async fn test_validate_reports_attribute() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);

        let resp = svc
            .validate_storage_config(Request::new(validate_storage_config::Request {
                storage_name: "local".to_string(),
                config: json_config(r#"{"path": 7}"#),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.diagnostics.len(), 1);
        let diag = &resp.diagnostics[0];
        assert_eq!(diag.severity, WireSeverity::Error as i32);
        assert_eq!(diag.attribute, "path");
    }

    #[tokio::test]
    async fn test_state_operations_require_configure() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);

        let resp = svc
            .read_state(Request::new(read_state::Request {
                state_name: "dev".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.state.is_empty());
        assert_eq!(resp.diagnostics[0].summary, "Backend not configured");

        let health = svc
            .health_check(Request::new(health_check::Request {}))
            .await
            .unwrap()
            .into_inner();
        assert!(!health.configured);
        assert!(health.backend.is_empty());
    }

    #[tokio::test]
    async fn test_lock_scenario_over_local_storage() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        configure(&svc, "local").await;

        assert!(lock(&svc, "prod", "cli-123").await.is_empty());

        let conflict = lock(&svc, "prod", "cli-456").await;
        assert_eq!(conflict[0].severity, WireSeverity::Error as i32);
        assert!(conflict[0].detail.contains("held by cli-123"));

        let mismatch = unlock(&svc, "prod", "cli-456", false).await;
        assert_eq!(mismatch[0].summary, "Lock holder mismatch");

        let forced = unlock(&svc, "prod", "cli-456", true).await;
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].severity, WireSeverity::Warning as i32);

        assert!(lock(&svc, "prod", "cli-456").await.is_empty());
        assert!(temp.path().join("locks").join("prod.lock").is_file());
    }

    #[tokio::test]
    async fn test_force_unlock_of_unreadable_lock() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        configure(&svc, "local").await;
        std::fs::write(temp.path().join("locks").join("prod.lock"), b"{torn").unwrap();

        let refused = lock(&svc, "prod", "cli-123").await;
        assert_eq!(refused[0].severity, WireSeverity::Error as i32);

        let forced = unlock(&svc, "prod", "cli-123", true).await;
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].severity, WireSeverity::Warning as i32);
        assert_eq!(forced[0].summary, "Unreadable lock removed");

        assert!(lock(&svc, "prod", "cli-123").await.is_empty());
    }

    #[tokio::test]
    async fn test_write_read_delete_over_local_storage() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        configure(&svc, "local").await;

        let write = svc
            .write_state(Request::new(write_state::Request {
                state_name: "dev".to_string(),
                state: b"v1".to_vec(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(write.diagnostics.is_empty());

        let states = svc
            .get_states(Request::new(get_states::Request {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(states.state_names, vec!["dev"]);

        assert!(lock(&svc, "dev", "cli-123").await.is_empty());
        let refused = svc
            .delete_state(Request::new(delete_state::Request {
                state_name: "dev".to_string(),
                holder: "cli-456".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(refused.diagnostics[0].severity, WireSeverity::Error as i32);

        assert!(unlock(&svc, "dev", "cli-123", false).await.is_empty());
        let deleted = svc
            .delete_state(Request::new(delete_state::Request {
                state_name: "dev".to_string(),
                holder: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(deleted.diagnostics.is_empty());

        let read = svc
            .read_state(Request::new(read_state::Request {
                state_name: "dev".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(read.state.is_empty());
        assert!(read.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_over_grpc() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        let server = tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(StateStorageServer::new(svc))
                .serve_with_incoming(incoming),
        );

        let mut client = StateStorageClient::connect(format!("http://{}", addr))
            .await
            .unwrap();

        let configured = client
            .configure_storage(configure_storage::Request {
                storage_name: "inmem".to_string(),
                config: None,
            })
            .await
            .unwrap()
            .into_inner();
        assert!(configured.diagnostics.is_empty());

        let blob = br#"{"version":4,"serial":1}"#.to_vec();
        client
            .write_state(write_state::Request {
                state_name: "prod".to_string(),
                state: blob.clone(),
            })
            .await
            .unwrap();

        let read = client
            .read_state(read_state::Request {
                state_name: "prod".to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(read.state, blob);

        let health = client
            .health_check(health_check::Request {})
            .await
            .unwrap()
            .into_inner();
        assert!(health.configured);
        assert_eq!(health.backend, "inmem");

        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lock_requests() {
        let temp = TempDir::new().unwrap();
        let svc = Arc::new(service(&temp));
        configure(&svc, "local").await;

        let attempts = (0..8).map(|i| {
            let svc = Arc::clone(&svc);
            async move { lock(&svc, "shared", &format!("holder-{}", i)).await }
        });
        let results = futures::future::join_all(attempts).await;

        let winners = results.iter().filter(|d| d.is_empty()).count();
        assert_eq!(winners, 1);
    }
}
