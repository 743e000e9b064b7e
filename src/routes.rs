use crate::comparison::handler as comparison_handler;
use crate::comparison::ComparisonEngine;
use crate::error::AppError;
use crate::ingest::handler as ingest_handler;
use crate::ingest::IngestState;
use axum::extract::DefaultBodyLimit;
use axum::http::Uri;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Assemble the HTTP surface: health, score ingestion and comparison.
pub fn build_router(ingest: Arc<IngestState>, engine: Arc<ComparisonEngine>) -> Router {
    let max_payload_bytes = ingest.config.max_payload_bytes;

    let health_route = Router::new()
        .route("/health", get(ingest_handler::health))
        .with_state(ingest.clone());

    let ingest_routes = Router::new()
        .route("/v1/scores", post(ingest_handler::ingest_score))
        .route("/v1/scores/batch", post(ingest_handler::ingest_batch))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .with_state(ingest);

    let comparison_routes = Router::new()
        .route(
            "/v1/scores/comparison",
            get(comparison_handler::compare_scores_query).post(comparison_handler::compare_scores),
        )
        .with_state(engine);

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .merge(health_route)
        .merge(ingest_routes)
        .merge(comparison_routes)
        .fallback(not_found)
        .layer(cors)
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("no route for {}", uri.path()))
}
