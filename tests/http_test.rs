use axum::body::Body;
use axum::http::{Request, StatusCode};
use scorecmp::comparison::ComparisonEngine;
use scorecmp::config::{AnalyticsConfig, DatabaseConfig, IngestConfig};
use scorecmp::ingest::IngestState;
use scorecmp::routes::build_router;
use scorecmp::store::{MemoryStore, ScoreStore};
use scorecmp::types::{ScoreDataType, ScoreRecord};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;

const BASE_MS: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

fn seeded_store() -> MemoryStore {
    let mut records = Vec::new();
    for (i, (a, h)) in [(0.2, 0.3), (0.5, 0.4), (0.9, 0.8)].into_iter().enumerate() {
        for (name, value) in [("accuracy", a), ("helpfulness", h)] {
            records.push(ScoreRecord {
                id: format!("{name}-{i}"),
                project_id: "p1".to_string(),
                name: name.to_string(),
                source: "API".to_string(),
                data_type: ScoreDataType::Numeric,
                value: Some(value),
                string_value: None,
                trace_id: Some(format!("trace-{i}")),
                observation_id: None,
                session_id: None,
                dataset_run_id: None,
                timestamp: BASE_MS + 3_600_000,
                created_at: BASE_MS,
            });
        }
    }
    MemoryStore::with_records(records)
}

struct TestServer {
    addr: SocketAddr,
    pool: deadpool_sqlite::Pool,
    _dir: tempfile::TempDir,
}

async fn app() -> (axum::Router, deadpool_sqlite::Pool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let database = DatabaseConfig {
        path: dir.path().join("scores.db"),
        pool_size: 2,
    };
    let pool = scorecmp::storage::sqlite::create_pool(&database).unwrap();
    scorecmp::storage::sqlite::init_pool(&pool).await.unwrap();

    let ingest = Arc::new(IngestState {
        pool: pool.clone(),
        config: IngestConfig {
            max_batch_size: 3,
            max_payload_bytes: 64 * 1024,
        },
    });
    let store: Arc<dyn ScoreStore> = Arc::new(seeded_store());
    let engine = Arc::new(ComparisonEngine::new(store, AnalyticsConfig::default()));
    (build_router(ingest, engine), pool, dir)
}

async fn spawn_server() -> TestServer {
    let (router, pool, dir) = app().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    TestServer {
        addr,
        pool,
        _dir: dir,
    }
}

fn comparison_body(n_bins: u32) -> serde_json::Value {
    serde_json::json!({
        "projectId": "p1",
        "score1": {"name": "accuracy", "dataType": "NUMERIC", "source": "API"},
        "score2": {"name": "helpfulness", "dataType": "NUMERIC", "source": "API"},
        "fromTimestamp": "2024-01-01T00:00:00Z",
        "toTimestamp": "2024-01-02T00:00:00Z",
        "nBins": n_bins
    })
}

async fn stored_ids(pool: &deadpool_sqlite::Pool) -> Vec<String> {
    let conn = pool.get().await.unwrap();
    conn.interact(|conn| {
        let mut stmt = conn.prepare("SELECT id FROM scores ORDER BY id").unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_health() {
    let server = spawn_server().await;
    let resp = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_ok"], true);
}

#[tokio::test]
async fn test_router_serves_health_without_listener() {
    let (router, _pool, _dir) = app().await;
    let resp = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["db_ok"], true);
}

#[tokio::test]
async fn test_ingest_single_score() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/v1/scores", server.addr))
        .json(&serde_json::json!({
            "id": "s-1",
            "projectId": "p1",
            "name": "accuracy",
            "dataType": "NUMERIC",
            "value": 0.75,
            "traceId": "trace-9",
            "timestamp": "2024-01-01T01:00:00Z"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["id"], "s-1");
    assert_eq!(stored_ids(&server.pool).await, vec!["s-1".to_string()]);
}

#[tokio::test]
async fn test_ingest_rejects_invalid_score() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/v1/scores", server.addr))
        .json(&serde_json::json!({
            "projectId": "p1",
            "name": "accuracy",
            "dataType": "NUMERIC",
            "traceId": "trace-9"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("value"));
    assert!(stored_ids(&server.pool).await.is_empty());
}

#[tokio::test]
async fn test_batch_reports_rejected_entries_by_index() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/v1/scores/batch", server.addr))
        .json(&serde_json::json!({
            "scores": [
                {"id": "b-1", "projectId": "p1", "name": "correct", "dataType": "BOOLEAN",
                 "value": 1, "traceId": "t1"},
                {"id": "b-2", "projectId": "p1", "name": "correct", "dataType": "BOOLEAN",
                 "value": 0.5, "traceId": "t2"},
                {"id": "b-3", "projectId": "p1", "name": "verdict", "dataType": "CATEGORICAL",
                 "stringValue": "good", "sessionId": "sess-1"}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 2);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["index"], 1);
    assert_eq!(
        stored_ids(&server.pool).await,
        vec!["b-1".to_string(), "b-3".to_string()]
    );
}

#[tokio::test]
async fn test_batch_over_max_size_is_rejected() {
    let server = spawn_server().await;
    let score = serde_json::json!({
        "projectId": "p1", "name": "accuracy", "dataType": "NUMERIC",
        "value": 1.0, "traceId": "t1"
    });
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/v1/scores/batch", server.addr))
        .json(&serde_json::json!({ "scores": vec![score; 4] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(stored_ids(&server.pool).await.is_empty());
}

#[tokio::test]
async fn test_post_comparison() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/v1/scores/comparison", server.addr))
        .json(&comparison_body(10))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["counts"]["score1Total"], 3);
    assert_eq!(body["counts"]["matchedCount"], 3);
    assert_eq!(body["samplingMetadata"]["isSampled"], false);
    assert_eq!(body["samplingMetadata"]["samplingMethod"], "none");
    assert_eq!(body["distribution1"].as_array().unwrap().len(), 10);
    assert!(body["statistics"]["pearsonCorrelation"].is_number());
    assert_eq!(body["bucket"]["unit"], "second");
}

#[tokio::test]
async fn test_post_comparison_rejects_bad_input() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/v1/scores/comparison", server.addr);

    for n_bins in [3, 100] {
        let resp = client
            .post(&url)
            .json(&comparison_body(n_bins))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("nBins"));
    }

    let mut bad_type = comparison_body(10);
    bad_type["score2"]["dataType"] = serde_json::json!("TEXT");
    let resp = client.post(&url).json(&bad_type).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_get_comparison_query() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/v1/scores/comparison", server.addr);
    let params = [
        ("project_id", "p1"),
        ("score1_name", "accuracy"),
        ("score1_data_type", "NUMERIC"),
        ("score1_source", "API"),
        ("score2_name", "helpfulness"),
        ("score2_data_type", "numeric"),
        ("score2_source", "API"),
        ("from", "2024-01-01T00:00:00Z"),
        ("to", "2024-01-03T00:00:00Z"),
        ("interval_unit", "day"),
        ("object_type", "trace"),
    ];
    let resp = client.get(&url).query(&params).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["counts"]["matchedCount"], 3);
    assert_eq!(body["bucket"]["unit"], "day");
    assert_eq!(body["timeSeries"].as_array().unwrap().len(), 3);

    let mut bad = params.to_vec();
    bad.retain(|(k, _)| *k != "object_type");
    bad.push(("object_type", "span"));
    let resp = client.get(&url).query(&bad).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_unknown_route_returns_json_not_found() {
    let (router, _pool, _dir) = app().await;
    let resp = router
        .oneshot(
            Request::builder()
                .uri("/v1/scores/unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].as_str().unwrap().contains("/v1/scores/unknown"));
}
