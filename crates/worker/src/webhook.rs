//! HTTP surface for mint notifications.
//!
//! `POST /webhooks/mint` feeds the ingestion listener; `GET /health` is a
//! liveness probe. Everything else goes through the job store.

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use mintforge_core::{OwnerRef, TokenId};
use mintforge_infra::IngestionListener;
use mintforge_infra::jobs::InsertOutcome;

/// Body of a mint notification.
#[derive(Debug, Clone, Deserialize)]
pub struct MintNotification {
    pub token_id: u64,
    pub owner: String,
}

#[derive(Debug, Serialize)]
struct MintAccepted {
    token_id: TokenId,
    status: InsertOutcome,
}

pub fn router(listener: IngestionListener) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/mint", post(on_mint))
        .layer(Extension(listener))
}

/// Serve `app` on an already-bound listener until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "webhook listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("webhook stopped");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn on_mint(
    Extension(listener): Extension<IngestionListener>,
    payload: Result<Json<MintNotification>, JsonRejection>,
) -> Response {
    let Json(notification) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let id = match TokenId::new(notification.token_id) {
        Ok(id) => id,
        Err(e) => return bad_request(e.to_string()),
    };
    let owner = match OwnerRef::parse(&notification.owner) {
        Ok(owner) => owner,
        Err(e) => return bad_request(e.to_string()),
    };

    match listener.on_token_minted(id, owner).await {
        Ok(status) => (
            StatusCode::ACCEPTED,
            Json(MintAccepted {
                token_id: id,
                status,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(token_id = %id, error = %e, "mint notification not recorded");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "job store unavailable" })),
            )
                .into_response()
        }
    }
}

fn bad_request(message: String) -> Response {
    warn!(%message, "rejected mint notification");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
