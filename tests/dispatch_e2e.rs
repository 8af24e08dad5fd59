use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mockito::{Matcher, Server};
use serde_json::{Value, json};

use sheet_dispatch::auth::Credentials;
use sheet_dispatch::dispatch::{DispatchError, DispatchTarget, Dispatcher};
use sheet_dispatch::graph::ConfigGraph;
use sheet_dispatch::prune::{PruneMode, PrunedSheet};
use sheet_dispatch::status::{MemoryReporter, NodeStatus};
use sheet_dispatch::transport::HttpTransport;

fn source_flows() -> String {
    json!([
        {"id": "t1", "type": "tab", "label": "Sheet 1"},
        {"id": "broker", "type": "mqtt-broker", "broker": "localhost"},
        {"id": "in1", "type": "flow-dlg-in", "z": "t1", "x": 100, "y": 80, "wires": [["mq"]]},
        {"id": "mq", "type": "mqtt out", "z": "t1", "broker": "broker", "x": 250, "y": 80, "wires": []},
        {"id": "out1", "type": "flow-dlg-out", "z": "t1", "x": 400, "y": 80},
        {"id": "t2", "type": "tab", "label": "Elsewhere"},
        {"id": "dbg", "type": "debug", "z": "t2", "x": 10, "y": 10}
    ])
    .to_string()
}

fn dispatcher() -> (Dispatcher, Arc<MemoryReporter>) {
    let reporter = Arc::new(MemoryReporter::new());
    (
        Dispatcher::new(Arc::new(HttpTransport::new()), reporter.clone()),
        reporter,
    )
}

#[tokio::test]
async fn authenticated_dispatch_between_two_runtimes() {
    let mut source = Server::new_async().await;
    let mut dest = Server::new_async().await;

    let src_denied = source
        .mock("GET", "/flows")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let src_token = source
        .mock("POST", "/auth/token")
        .match_body(Matcher::PartialJson(json!({"username": "admin", "password": "pw"})))
        .with_status(200)
        .with_body(r#"{"access_token":"tok-src","expires_in":604800,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;
    let src_flows = source
        .mock("GET", "/flows")
        .match_header("authorization", "Bearer tok-src")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(source_flows())
        .expect(1)
        .create_async()
        .await;
    let src_revoke = source
        .mock("POST", "/auth/revoke")
        .match_body(Matcher::Json(json!({"token": "tok-src"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dst_denied = dest
        .mock("POST", "/flows")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let dst_token = dest
        .mock("POST", "/auth/token")
        .with_status(200)
        .with_body(r#"{"access_token":"tok-dst"}"#)
        .expect(1)
        .create_async()
        .await;
    let dst_flows = dest
        .mock("POST", "/flows")
        .match_header("authorization", "Bearer tok-dst")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Regex("websocket in".into()))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let dst_revoke = dest
        .mock("POST", "/auth/revoke")
        .match_body(Matcher::Json(json!({"token": "tok-dst"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (dispatcher, reporter) = dispatcher();
    let target = DispatchTarget::new(
        "e2e",
        "Sheet 1",
        source.host_with_port(),
        dest.url(),
    )
    .with_auth(Credentials::new(" admin ", "pw"));

    let report = dispatcher.dispatch(&target).await.unwrap();

    let dest_url = format!("{}/flows", dest.url());
    assert_eq!(report.status, 204);
    assert_eq!(report.destination_url, dest_url);
    assert!(report.finished >= report.started);

    for mock in [
        &src_denied, &src_token, &src_flows, &src_revoke, &dst_denied, &dst_token, &dst_flows,
        &dst_revoke,
    ] {
        mock.assert_async().await;
    }

    assert_eq!(reporter.current("e2e"), NodeStatus::Clear);
    let out = reporter.last_output("e2e").unwrap();
    assert_eq!(out.status_code.as_deref(), Some("204"));
    assert!(out.payload.starts_with("[DONE] message: set destination flow OK"));
    assert!(out.payload.contains(&format!("url: {dest_url}")));
}

#[tokio::test]
async fn pushed_sheet_is_closed_and_rewired() {
    let mut source = Server::new_async().await;
    let mut dest = Server::new_async().await;
    let _flows = source
        .mock("GET", "/flows")
        .with_status(200)
        .with_body(source_flows())
        .create_async()
        .await;
    let pushed = dest
        .mock("POST", "/flows")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let (dispatcher, _reporter) = dispatcher();
    let target = DispatchTarget::new("relay7", "Sheet 1", source.url(), dest.host_with_port());
    let sheet = dispatcher.fetch_sheet(&target).await.unwrap();
    dispatcher.push_flows(&target, &sheet).await.unwrap();
    pushed.assert_async().await;

    let nodes: Value = serde_json::from_str(&sheet.to_json().unwrap()).unwrap();
    let nodes = nodes.as_array().unwrap();
    let ids = nodes
        .iter()
        .map(|n| n["id"].as_str().unwrap())
        .collect::<Vec<_>>();
    assert!(ids.contains(&"t1"));
    assert!(ids.contains(&"broker"));
    assert!(!ids.contains(&"t2"));
    assert!(!ids.contains(&"dbg"));

    let relay = nodes.iter().find(|n| n["type"] == "websocket-client").unwrap();
    assert_eq!(
        relay["path"],
        format!("ws://{}/relay7", source.host_with_port())
    );
    let adapter = nodes.iter().find(|n| n["name"] == "reset-ws-sess").unwrap();
    assert_eq!(adapter["wires"], json!([["mq"]]));
    assert_eq!(adapter["y"], json!(130));
    let relay_in = nodes.iter().find(|n| n["id"] == "in1").unwrap();
    assert_eq!(relay_in["type"], "websocket in");
    assert_eq!(relay_in["wires"], json!([[adapter["id"].clone()]]));
}

#[tokio::test]
async fn destination_failure_is_reported_with_status() {
    let mut source = Server::new_async().await;
    let mut dest = Server::new_async().await;
    let _flows = source
        .mock("GET", "/flows")
        .with_status(200)
        .with_body(source_flows())
        .create_async()
        .await;
    let _push = dest
        .mock("POST", "/flows")
        .with_status(500)
        .create_async()
        .await;

    let (dispatcher, reporter) = dispatcher();
    let target = DispatchTarget::new("d", "Sheet 1", source.url(), dest.url());
    let err = dispatcher.dispatch(&target).await.unwrap_err();

    assert!(matches!(err, DispatchError::RemoteStatus { status: 500, .. }));
    assert_eq!(
        reporter.current("d"),
        NodeStatus::error("Internal Server Error", Some("500"))
    );
    assert_eq!(
        reporter.last_output("d").unwrap().payload,
        format!(
            "[ERROR] Internal Server Error (code: 500, url: {}/flows)",
            dest.url()
        )
    );
}

#[tokio::test]
async fn hung_up_source_gets_one_https_attempt() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let (dispatcher, reporter) = dispatcher();
    let target = DispatchTarget::new("hup", "Sheet 1", addr.to_string(), "127.0.0.1:9");
    let err = dispatcher.dispatch(&target).await.unwrap_err();

    assert!(matches!(err, DispatchError::Transport(_)));
    let https_url = format!("https://{addr}/flows");
    assert_eq!(err.url(), Some(https_url.as_str()));
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert!(reporter.current("hup").is_error());
}

#[tokio::test]
async fn plain_sheet_is_saved_and_pushed_back() {
    let mut source = Server::new_async().await;
    let mut dest = Server::new_async().await;
    let _flows = source
        .mock("GET", "/flows")
        .with_status(200)
        .with_body(source_flows())
        .create_async()
        .await;
    let pushed = dest
        .mock("POST", "/flows")
        .match_body(Matcher::Regex("flow-dlg-in".into()))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let (dispatcher, _reporter) = dispatcher();
    let target = DispatchTarget::new("clone", "Sheet 1", source.url(), dest.url())
        .with_mode(PruneMode::Plain);
    let fetched = dispatcher.fetch_sheet(&target).await.unwrap();

    let saved = serde_json::to_string_pretty(&fetched.nodes).unwrap();
    let sheet = PrunedSheet::from_graph(ConfigGraph::from_json(&saved).unwrap()).unwrap();
    assert_eq!(sheet, fetched);
    assert!(!saved.contains("websocket"));
    assert!(!sheet.nodes.iter().any(|n| n.id == "broker" || n.id == "t2"));

    dispatcher.push_flows(&target, &sheet).await.unwrap();
    pushed.assert_async().await;
}
