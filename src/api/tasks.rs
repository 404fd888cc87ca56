//! Task, history and balance endpoints.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    Json,
};

use super::auth::AuthUser;
use super::error::ApiError;
use super::routes::AppState;
use super::types::{CompleteTaskRequest, CompleteTaskResponse, HistoryResponse};
use crate::service::{current_day, Balance, DailyTasks};

/// `GET /tasks/daily`
pub async fn daily_tasks(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<DailyTasks>, ApiError> {
    let tasks = state.service.get_daily_tasks(&user.id, current_day()).await?;
    Ok(Json(tasks))
}

/// `POST /tasks/complete`
pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<CompleteTaskRequest>, JsonRejection>,
) -> Result<Json<CompleteTaskResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    let task_id = req.task_id.unwrap_or_default();
    let proof = req.proof.unwrap_or(serde_json::Value::Null);

    let outcome = state
        .service
        .complete_task(&user.id, &task_id, proof, current_day())
        .await?;

    Ok(Json(CompleteTaskResponse {
        success: true,
        task_id: outcome.task_id,
        reward: outcome.reward,
        message: outcome.message,
    }))
}

/// `GET /tasks/history`
pub async fn history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let history = state.service.get_history(&user.id).await?;
    Ok(Json(HistoryResponse { history }))
}

/// `GET /user/balance`
pub async fn balance(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Balance>, ApiError> {
    let balance = state.service.get_balance(&user.id).await?;
    Ok(Json(balance))
}
