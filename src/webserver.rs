//! HTTP server for bulk block transport: serves block files for the `http`
//! p2p block encoding and for `pull` bootstrapping.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::node::Node;

pub fn build_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/block/{height}", get(send_block))
        .route("/chainparams.json", get(chain_params))
        .with_state(node)
}

/// GET /block/{height}: the raw block file.
async fn send_block(
    State(node): State<Arc<Node>>,
    Path(height): Path<i64>,
) -> impl IntoResponse {
    let filename = node.chain.block_filename(height);
    match tokio::fs::read(&filename).await {
        Ok(bytes) => {
            tracing::info!(height, "Serving block");
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/x-sqlite3".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{:08x}.db\"", height),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => {
            tracing::info!(height, "Block file not found");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// GET /chainparams.json: the chain parameters, verbatim.
async fn chain_params(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.params.clone())
}

pub async fn serve(node: Arc<Node>, listener: TcpListener) {
    let app = build_router(node);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Block web server failed: {}", e);
    }
}
