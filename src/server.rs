use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::node::NodeRegistry;
use crate::status::{MemoryReporter, NodeStatus, OutputMessage};

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<NodeRegistry>,
    pub reporter: Arc<MemoryReporter>,
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub id: String,
    pub status: NodeStatus,
    pub outputs: Vec<OutputMessage>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/remote-deploy/:id", get(remote_deploy))
        .route("/status/:id", get(node_status))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin router until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AdminState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Admin server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn remote_deploy(
    Path(id): Path<String>,
    Extension(state): Extension<AdminState>,
) -> StatusCode {
    match state.registry.trigger(&id) {
        Some(_) => {
            info!(node = %id, "remote deploy triggered");
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn node_status(
    Path(id): Path<String>,
    Extension(state): Extension<AdminState>,
) -> Result<Json<StatusBody>, StatusCode> {
    if state.registry.get(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(StatusBody {
        status: state.reporter.current(&id),
        outputs: state.reporter.outputs(&id),
        id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::config::{DispatcherConfig, Settings};
    use crate::dispatch::Dispatcher;
    use crate::node::DispatcherNode;
    use crate::status::StatusReporter;
    use crate::transport::HttpTransport;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt; // for `app.oneshot()`

    fn state() -> AdminState {
        let reporter = Arc::new(MemoryReporter::new());
        let dispatcher = Dispatcher::new(Arc::new(HttpTransport::new()), reporter.clone());
        let registry = Arc::new(NodeRegistry::new(dispatcher));
        registry.register(DispatcherNode::new(
            // port 9 (discard) on loopback: nothing answers, the dispatch fails fast
            DispatcherConfig::new("n1", "Sheet 1", "127.0.0.1:9"),
            &Settings {
                local_url: "127.0.0.1:9".into(),
                ..Settings::default()
            },
            Credentials::default(),
        ));
        AdminState { registry, reporter }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).method("GET").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let app = router(state());
        let response = app.oneshot(get("/remote-deploy/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let app = router(state());
        let response = app.oneshot(get("/status/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_node_is_triggered() {
        let app = router(state());
        let response = app.oneshot(get("/remote-deploy/n1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_returns_reporter_view() {
        let state = state();
        state
            .reporter
            .status("n1", NodeStatus::error("Not Found", Some("404")));
        state
            .reporter
            .output("n1", OutputMessage::new(Some("404".into()), "[ERROR] Not Found".into()));

        let response = router(state).oneshot(get("/status/n1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["id"], "n1");
        assert_eq!(body["status"]["state"], "error");
        assert_eq!(body["status"]["text"], "404: Not Found");
        assert_eq!(body["outputs"][0]["payload"], "[ERROR] Not Found");
    }
}
