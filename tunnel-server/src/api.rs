use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;

use crate::runtime::ServerPool;

struct ApiState {
    pool: Arc<ServerPool>,
    uptime: Instant,
}

/// start http server
///
/// Create an http server and start it; broker snapshots can be read
/// through the http interface.
///
/// Warn: This http server does not contain any means of authentication,
/// and sensitive information can be obtained through this service,
/// please do not expose it directly to an unsafe environment.
pub async fn start_server(listen: SocketAddr, pool: Arc<ServerPool>) -> anyhow::Result<()> {
    let state = Arc::new(ApiState {
        pool,
        uptime: Instant::now(),
    });

    let app = Router::new()
        .route(
            "/info",
            get(|State(state): State<Arc<ApiState>>| async move {
                Json(json!({
                    "software": crate::SOFTWARE,
                    "uptime": state.uptime.elapsed().as_secs(),
                    "servers": state.pool.ids().await,
                }))
            }),
        )
        .route(
            "/servers/{id}",
            get(
                |Path(id): Path<String>, State(state): State<Arc<ApiState>>| async move {
                    match state.pool.server_snapshot(&id).await {
                        Some(snapshot) => Json(snapshot).into_response(),
                        None => StatusCode::NOT_FOUND.into_response(),
                    }
                },
            ),
        )
        .with_state(state);

    let listener = TcpListener::bind(listen).await?;

    log::info!("api server listening={:?}", listen);

    axum::serve(listener, app).await?;
    Ok(())
}
