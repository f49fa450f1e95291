use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

use geotorget_core::{EngineConfig, ManifestStore, OrderFile, OrderId};
use geotorget_sync::{
    CommitStatus, FileBody, HttpOrderClient, OrderSynchronizer, RemoteError, RemoteOrderClient,
    SyncOptions,
};

const ORDER: &str = "fe76535a-1b2c-4d3e-8f90-a1b2c3d4e5f6";
const MISSING: &str = "00000000-0000-4000-8000-000000000404";
const DENIED: &str = "00000000-0000-4000-8000-000000000401";
const BODY: &[u8] = b"0123456789";

async fn listing(State(base): State<Arc<String>>, Path(order): Path<String>) -> Response {
    match order.as_str() {
        MISSING => StatusCode::NOT_FOUND.into_response(),
        DENIED => StatusCode::UNAUTHORIZED.into_response(),
        _ => Json(json!([
            {
                "title": "a.gpkg",
                "href": format!("{base}/files/a.gpkg"),
                "length": BODY.len(),
                "displaySize": "10 B",
                "updated": "2024-05-01T10:00:00"
            },
            {
                "title": "b.gpkg",
                "href": format!("{base}/plain/b.gpkg"),
                "length": BODY.len(),
                "updated": "2024-04-01T10:00:00"
            }
        ]))
        .into_response(),
    }
}

async fn ranged_file(Path(name): Path<String>, headers: HeaderMap) -> Response {
    match name.as_str() {
        "gone.gpkg" => return StatusCode::NOT_FOUND.into_response(),
        "secret.gpkg" => return StatusCode::FORBIDDEN.into_response(),
        "busy.gpkg" => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ => {}
    }
    let start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());
    match start {
        Some(s) if s < BODY.len() => (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {s}-{}/{}", BODY.len() - 1, BODY.len()),
            )],
            BODY[s..].to_vec(),
        )
            .into_response(),
        Some(_) => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => BODY.to_vec().into_response(),
    }
}

async fn plain_file() -> Vec<u8> {
    BODY.to_vec()
}

async fn silent_file() -> Vec<u8> {
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    BODY.to_vec()
}

async fn subscriptions() -> Json<serde_json::Value> {
    Json(json!([ORDER, {"id": MISSING}]))
}

/// Serve the fake order API on an ephemeral port; returns its base URL.
async fn spawn_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new()
        .route("/download/:order/files", get(listing))
        .route("/files/:name", get(ranged_file))
        .route("/plain/:name", get(plain_file))
        .route("/silent/:name", get(silent_file))
        .route("/subscriptions", get(subscriptions))
        .with_state(Arc::new(base.clone()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

fn client(base: &str) -> HttpOrderClient {
    let config = EngineConfig {
        base_url: format!("{base}/download/"),
        subscriptions_url: Some(format!("{base}/subscriptions")),
        ..EngineConfig::default()
    };
    HttpOrderClient::new(&config).unwrap()
}

fn remote_file(base: &str, path: &str) -> OrderFile {
    OrderFile {
        name: path.rsplit('/').next().unwrap().to_owned(),
        remote_url: format!("{base}/{path}"),
        expected_size: Some(BODY.len() as u64),
        checksum: None,
        updated: None,
        display_size: None,
    }
}

async fn collect(body: FileBody) -> Vec<u8> {
    let mut stream = body.stream;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

#[tokio::test]
async fn listing_is_parsed_into_an_order() {
    let base = spawn_server().await;
    let id: OrderId = ORDER.parse().unwrap();

    let order = client(&base).fetch_manifest(&id).await.unwrap();

    assert_eq!(order.order_id, id);
    assert_eq!(order.files.len(), 2);
    assert_eq!(order.files[0].name, "a.gpkg");
    assert_eq!(order.files[0].expected_size, Some(10));
    assert_eq!(order.release_id.0, "2024-05-01T10:00:00");
}

#[tokio::test]
async fn listing_url_has_no_double_slash() {
    let id: OrderId = ORDER.parse().unwrap();
    assert_eq!(
        client("http://h").listing_url(&id),
        format!("http://h/download/{ORDER}/files")
    );
}

#[tokio::test]
async fn listing_status_codes_map_to_error_kinds() {
    let base = spawn_server().await;
    let http = client(&base);

    let missing = http.fetch_manifest(&MISSING.parse().unwrap()).await.unwrap_err();
    assert!(matches!(missing, RemoteError::NotFound { .. }));

    let denied = http.fetch_manifest(&DENIED.parse().unwrap()).await.unwrap_err();
    assert_eq!(denied, RemoteError::Unauthorized { status: 401 });
}

#[tokio::test]
async fn full_and_ranged_file_bodies() {
    let base = spawn_server().await;
    let http = client(&base);
    let file = remote_file(&base, "files/a.gpkg");

    let full = http.fetch_file(&file, 0).await.unwrap();
    assert_eq!((full.offset, full.total), (0, Some(10)));
    assert_eq!(collect(full).await, BODY);

    let tail = http.fetch_file(&file, 4).await.unwrap();
    assert_eq!((tail.offset, tail.total), (4, Some(10)));
    assert_eq!(collect(tail).await, b"456789");
}

#[tokio::test]
async fn unsatisfiable_range_restarts_from_zero() {
    let base = spawn_server().await;
    let file = remote_file(&base, "files/a.gpkg");

    let body = client(&base).fetch_file(&file, 50).await.unwrap();

    assert_eq!(body.offset, 0);
    assert_eq!(collect(body).await, BODY);
}

#[tokio::test]
async fn range_ignored_by_server_starts_at_zero() {
    let base = spawn_server().await;
    let file = remote_file(&base, "plain/b.gpkg");

    let body = client(&base).fetch_file(&file, 4).await.unwrap();

    assert_eq!(body.offset, 0);
    assert_eq!(collect(body).await, BODY);
}

#[tokio::test]
async fn file_status_codes_map_to_error_kinds() {
    let base = spawn_server().await;
    let http = client(&base);

    let gone = http.fetch_file(&remote_file(&base, "files/gone.gpkg"), 0).await.unwrap_err();
    assert!(matches!(gone, RemoteError::Permanent { status: Some(404), .. }));

    let secret = http.fetch_file(&remote_file(&base, "files/secret.gpkg"), 0).await.unwrap_err();
    assert_eq!(secret, RemoteError::Unauthorized { status: 403 });

    let busy = http.fetch_file(&remote_file(&base, "files/busy.gpkg"), 0).await.unwrap_err();
    assert!(busy.is_retryable());
}

#[tokio::test]
async fn connection_refused_is_transient() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = client(&base)
        .fetch_manifest(&ORDER.parse().unwrap())
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

#[tokio::test]
async fn subscriptions_are_fetched_and_sorted() {
    let base = spawn_server().await;

    let ids = client(&base).list_subscribed_orders().await.unwrap();

    let expected: Vec<OrderId> = vec![MISSING.parse().unwrap(), ORDER.parse().unwrap()];
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn configured_subscriptions_need_no_request() {
    let id: OrderId = ORDER.parse().unwrap();
    let config = EngineConfig {
        base_url: "http://127.0.0.1:9/download".into(),
        subscriptions: vec![id, id],
        subscriptions_url: None,
        ..EngineConfig::default()
    };

    let ids = HttpOrderClient::new(&config)
        .unwrap()
        .list_subscribed_orders()
        .await
        .unwrap();
    assert_eq!(ids, vec![id]);
}

#[tokio::test]
async fn sync_over_http_commits_order() {
    let base = spawn_server().await;
    let root = TempDir::new().unwrap();
    let id: OrderId = ORDER.parse().unwrap();
    let sync = OrderSynchronizer::new(
        Arc::new(client(&base)),
        ManifestStore::new(root.path()),
        SyncOptions::default(),
    );

    let report = sync.sync_order(&id, 2).await.unwrap();

    assert_eq!(report.commit, CommitStatus::Committed);
    let dir = root.path().join(ORDER);
    assert_eq!(std::fs::read(dir.join("a.gpkg")).unwrap(), BODY);
    assert_eq!(std::fs::read(dir.join("b.gpkg")).unwrap(), BODY);
    let record = sync.store().load(&id).unwrap().unwrap();
    assert_eq!(record.total_bytes, 20);
}

#[tokio::test]
async fn file_request_without_response_headers_times_out_as_transient() {
    let base = spawn_server().await;
    let config = EngineConfig {
        base_url: format!("{base}/download/"),
        request_timeout_secs: 1,
        ..EngineConfig::default()
    };
    let client = HttpOrderClient::new(&config).unwrap();

    let started = std::time::Instant::now();
    let err = client
        .fetch_file(&remote_file(&base, "silent/a.gpkg"), 0)
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::Transient(ref m) if m.contains("no response")), "{err:?}");
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}
