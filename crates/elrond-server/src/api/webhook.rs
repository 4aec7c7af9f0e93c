//! Webhook registration endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use elrond_core::model::{CreateWebhookRequest, Paging, Webhook, WebhookFilter};

use super::{ApiError, AppState};

/// `POST /api/webhooks`: register a webhook.
pub(super) async fn create(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<Webhook>), ApiError> {
    request.validate()?;

    let mut webhook = Webhook {
        id: String::new(),
        owner_id: request.owner_id,
        url: request.url,
        create_at: 0,
        delete_at: 0,
    };
    state.store.create_webhook(&mut webhook)?;

    info!(webhook = %webhook.id, url = %webhook.url, "registered webhook");
    Ok((StatusCode::ACCEPTED, Json(webhook)))
}

/// `GET /api/webhook/{id}`: webhook detail.
pub(super) async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>, ApiError> {
    let webhook = state.store.get_webhook(&id)?.ok_or(ApiError::NotFound)?;
    Ok(Json(webhook))
}

/// `GET /api/webhooks`: the requested page of webhooks.
pub(super) async fn list(
    State(state): State<Arc<AppState>>,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<Webhook>>, ApiError> {
    let webhooks = state.store.get_webhooks(&WebhookFilter {
        page: paging.page,
        per_page: paging.per_page,
        include_deleted: paging.include_deleted,
    })?;
    Ok(Json(webhooks))
}

/// `DELETE /api/webhook/{id}`: delete a webhook.
pub(super) async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.get_webhook(&id)?.is_none() {
        return Err(ApiError::NotFound);
    }
    state.store.delete_webhook(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
