//! Tracker HTTP server and its lifecycle.
//!
//! The registry handle is the router state; the liveness sweep runs beside
//! the server and stops with it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use peerdrop_core::config::TrackerConfig;
use peerdrop_core::{PeerRegistry, Tracker};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    complete_transfer, disconnect, file_idle_peers, get_descriptor, heartbeat, idle_peers,
    list_files, list_peers, publish_descriptor, register, request_file,
};

/// Builds the control-plane router over a registry handle.
pub fn build_router(registry: Arc<PeerRegistry>) -> Router {
    Router::new()
        // Control messages
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/disconnect", post(disconnect))
        .route("/idle-peers", post(idle_peers))
        .route("/file-idle-peers", post(file_idle_peers))
        .route("/request-file", post(request_file))
        .route("/complete-transfer", post(complete_transfer))
        // Catalog and listing
        .route("/descriptors", post(publish_descriptor))
        .route("/descriptors/{filename}", get(get_descriptor))
        .route("/peers", get(list_peers))
        .route("/files", get(list_files))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Running tracker: server task plus liveness sweep.
pub struct TrackerHandle {
    local_addr: SocketAddr,
    tracker: Tracker,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl TrackerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.tracker.registry()
    }

    /// Stops accepting requests, waits for the server to drain and stops
    /// the sweep.
    pub async fn close(self) {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Tracker server exited with error"),
            Err(e) => tracing::warn!(error = %e, "Tracker server task failed"),
        }
        self.tracker.close().await;
        tracing::info!(address = %self.local_addr, "Tracker closed");
    }
}

/// Binds the tracker on `config.bind_address` and starts serving and
/// sweeping in the background.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn spawn_tracker(config: &TrackerConfig) -> std::io::Result<TrackerHandle> {
    let listener = TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let mut tracker = Tracker::new(config);
    tracker.start();

    let app = build_router(tracker.registry());
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    tracing::info!(
        address = %local_addr,
        eviction_timeout = ?config.eviction_timeout,
        sweep_interval = ?config.sweep_interval,
        "Tracker listening"
    );

    Ok(TrackerHandle {
        local_addr,
        tracker,
        shutdown,
        task,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use peerdrop_core::FileDescriptor;
    use peerdrop_core::tracker::PeerKey;
    use peerdrop_core::tracker::messages::{
        ErrorBody, FileIdlePeersResponse, FilesResponse, PeersResponse, RequestFileResponse,
    };
    use serde::de::DeserializeOwned;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    fn registry() -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry::from_config(&TrackerConfig::default()))
    }

    fn app(registry: &Arc<PeerRegistry>, remote: [u8; 4]) -> Router {
        build_router(Arc::clone(registry))
            .layer(MockConnectInfo(SocketAddr::from((remote, 40000))))
    }

    async fn call<R: DeserializeOwned>(app: Router, request: Request<Body>) -> (StatusCode, R) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(path: &str, body: Value) -> Request<Body> {
        Request::post(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_uses_connection_ip_and_advertised_port() {
        let registry = registry();
        let (status, body): (_, Value) = call(
            app(&registry, [10, 0, 0, 1]),
            post_json(
                "/register",
                json!({"port": 7001, "files": ["f1"], "file_sizes": [100]}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"type": "ok"}));
        let record = registry
            .peer(PeerKey::new("10.0.0.1:7001".parse().unwrap()))
            .unwrap();
        assert!(record.holds("f1"));
    }

    #[tokio::test]
    async fn test_invalid_registration_is_bad_request() {
        let registry = registry();
        let (status, body): (_, ErrorBody) = call(
            app(&registry, [10, 0, 0, 1]),
            post_json(
                "/register",
                json!({"port": 7001, "files": ["f1", "f2"], "file_sizes": [100]}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_registration");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_with_missing_fields_is_invalid_registration() {
        let registry = registry();
        let (status, body): (_, ErrorBody) = call(
            app(&registry, [10, 0, 0, 1]),
            post_json("/register", json!({"port": 7001})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_registration");
        assert!(body.message.contains("files"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_json_bad_request() {
        let registry = registry();
        let (status, body): (_, ErrorBody) = call(
            app(&registry, [10, 0, 0, 1]),
            post_json("/heartbeat", json!({"port": "not a port"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "protocol");
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_peer_is_not_found() {
        let registry = registry();
        let (status, body): (_, ErrorBody) = call(
            app(&registry, [10, 0, 0, 9]),
            post_json("/heartbeat", json!({"port": 7009})),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "not_registered");
        assert_eq!(body.peer, Some(PeerKey::new("10.0.0.9:7009".parse().unwrap())));
    }

    #[tokio::test]
    async fn test_file_idle_peers_reserves_and_then_runs_out() {
        let registry = registry();
        for (ip, port) in [([10, 0, 0, 1], 7001), ([10, 0, 0, 2], 7002)] {
            registry
                .register(
                    PeerKey::new(SocketAddr::from((ip, port))),
                    &["f2".to_string()],
                    &[10],
                )
                .unwrap();
        }

        let mut served = Vec::new();
        for requester in [[10, 0, 0, 3], [10, 0, 0, 4]] {
            let (status, response): (_, FileIdlePeersResponse) = call(
                app(&registry, requester),
                post_json("/file-idle-peers", json!({"port": 7100, "filenames": ["f2"]})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            match response {
                FileIdlePeersResponse::PeersAvailable(assignment) => {
                    assert_eq!(assignment.file_sizes, BTreeMap::from([("f2".to_string(), 10)]));
                    served.push(assignment.peers["f2"]);
                }
                other => panic!("unexpected response: {other:?}"),
            }
        }
        assert_ne!(served[0], served[1]);

        let (_, response): (_, FileIdlePeersResponse) = call(
            app(&registry, [10, 0, 0, 5]),
            post_json("/file-idle-peers", json!({"port": 7100, "filenames": ["f2"]})),
        )
        .await;
        assert_eq!(
            response,
            FileIdlePeersResponse::NotEnough {
                requested: 1,
                matched: 0
            }
        );
    }

    #[tokio::test]
    async fn test_request_file_then_complete_transfer() {
        let registry = registry();
        let target = PeerKey::new("10.0.0.1:7001".parse().unwrap());
        registry.register(target, &["f1".to_string()], &[10]).unwrap();
        let request = json!({"peer_address": "10.0.0.1:7001", "filename": "f1"});

        let (_, first): (_, RequestFileResponse) = call(
            app(&registry, [10, 0, 0, 2]),
            post_json("/request-file", request.clone()),
        )
        .await;
        assert_eq!(
            first,
            RequestFileResponse::PeerContact {
                ip: "10.0.0.1".parse().unwrap(),
                port: 7001
            }
        );

        let (_, second): (_, RequestFileResponse) = call(
            app(&registry, [10, 0, 0, 3]),
            post_json("/request-file", request),
        )
        .await;
        assert_eq!(second, RequestFileResponse::PeerBusy);

        let (status, _): (_, Value) = call(
            app(&registry, [10, 0, 0, 2]),
            post_json("/complete-transfer", json!({"peer_address": "10.0.0.1:7001"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(registry.peer(target).unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_descriptor_publish_fetch_and_conflict() {
        let registry = registry();
        let descriptor = FileDescriptor::from_bytes("f1.bin", b"0123456789", 4).unwrap();

        let (status, body): (_, Value) = call(
            app(&registry, [10, 0, 0, 1]),
            post_json("/descriptors", serde_json::to_value(&descriptor).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"stored": true}));

        let (status, fetched): (_, FileDescriptor) = call(
            app(&registry, [10, 0, 0, 2]),
            Request::get("/descriptors/f1.bin").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, descriptor);

        let other = FileDescriptor::from_bytes("f1.bin", b"abcdefghij", 4).unwrap();
        let (status, body): (_, ErrorBody) = call(
            app(&registry, [10, 0, 0, 3]),
            post_json("/descriptors", serde_json::to_value(&other).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "descriptor_conflict");

        let (status, body): (_, ErrorBody) = call(
            app(&registry, [10, 0, 0, 2]),
            Request::get("/descriptors/missing.bin").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.filename.as_deref(), Some("missing.bin"));
    }

    #[tokio::test]
    async fn test_peer_listing() {
        let registry = registry();
        registry
            .register(
                PeerKey::new("10.0.0.1:7001".parse().unwrap()),
                &["f1".to_string()],
                &[10],
            )
            .unwrap();

        let (status, listing): (_, PeersResponse) = call(
            app(&registry, [10, 0, 0, 2]),
            Request::get("/peers").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing.peers.len(), 1);
        assert_eq!(listing.peers[0].files, vec!["f1".to_string()]);
    }

    #[tokio::test]
    async fn test_file_listing() {
        let registry = registry();
        registry
            .register(
                PeerKey::new("10.0.0.1:7001".parse().unwrap()),
                &["f1".to_string(), "f2".to_string()],
                &[10, 20],
            )
            .unwrap();
        registry
            .register(
                PeerKey::new("10.0.0.2:7001".parse().unwrap()),
                &["f1".to_string()],
                &[10],
            )
            .unwrap();

        let (status, listing): (_, FilesResponse) = call(
            app(&registry, [10, 0, 0, 3]),
            Request::get("/files").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let summary: Vec<_> = listing
            .files
            .iter()
            .map(|file| (file.name.as_str(), file.size, file.holders))
            .collect();
        assert_eq!(summary, vec![("f1", 10, 2), ("f2", 20, 1)]);
    }

    #[tokio::test]
    async fn test_spawned_tracker_closes_cleanly() {
        let config = TrackerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..TrackerConfig::default()
        };
        let handle = spawn_tracker(&config).await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        let address = handle.local_addr();
        handle.close().await;

        assert!(tokio::net::TcpStream::connect(address).await.is_err());
    }
}
