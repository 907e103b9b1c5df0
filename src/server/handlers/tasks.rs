use crate::error::AdmissionError;
use crate::progress::ProgressSnapshot;
use crate::queue::{admission_message, QueuePosition};
use crate::server::AppState;
use crate::task::{OwnerId, SourceDescriptor, TaskSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiResponse, CancelRequest};

/// 提交任务请求
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub owner_id: OwnerId,
    /// 链接及可选的 cookie / authorization
    #[serde(flatten)]
    pub source: SourceDescriptor,
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

/// 进度视图
#[derive(Debug, Serialize)]
pub struct TaskProgressResponse {
    pub progress: ProgressSnapshot,
    /// 与状态消息相同的渲染文本
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct CancelTaskResponse {
    pub cancelled: bool,
}

fn admission_code(error: &AdmissionError) -> i32 {
    match error {
        AdmissionError::DailyLimitReached { .. } => 429,
        AdmissionError::Store(_) | AdmissionError::ShuttingDown => 503,
    }
}

/// POST /api/v1/tasks
/// 提交链接
pub async fn submit_task(
    State(app_state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<ApiResponse<SubmitTaskResponse>>, StatusCode> {
    if req.source.url.trim().is_empty() {
        return Ok(Json(ApiResponse::error(400, "url is required".to_string())));
    }

    info!("API: 提交任务 owner={}, url={}", req.owner_id, req.source.url);
    match app_state.queue.submit(req.owner_id, req.source).await {
        Ok(task_id) => Ok(Json(ApiResponse::success(SubmitTaskResponse { task_id }))),
        Err(e) => Ok(Json(ApiResponse::error(
            admission_code(&e),
            admission_message(&e),
        ))),
    }
}

/// GET /api/v1/tasks/:id
pub async fn get_task(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    app_state
        .queue
        .status(&task_id)
        .map(|snapshot| Json(ApiResponse::success(snapshot)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/v1/tasks/:id/progress
pub async fn get_task_progress(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskProgressResponse>>, StatusCode> {
    let queue = &app_state.queue;
    let progress = queue.progress(&task_id).ok_or(StatusCode::NOT_FOUND)?;
    let text = queue
        .render_progress(&task_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ApiResponse::success(TaskProgressResponse {
        progress,
        text,
    })))
}

/// GET /api/v1/tasks/:id/position
/// 排队位置，已开始或已结束的任务返回 409
pub async fn get_task_position(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<QueuePosition>>, StatusCode> {
    let queue = &app_state.queue;
    queue.status(&task_id).ok_or(StatusCode::NOT_FOUND)?;
    match queue.queue_position(&task_id) {
        Some(position) => Ok(Json(ApiResponse::success(position))),
        None => Ok(Json(ApiResponse::error(
            409,
            "Task is not waiting in the queue".to_string(),
        ))),
    }
}

/// POST /api/v1/tasks/:id/cancel
pub async fn cancel_task(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<ApiResponse<CancelTaskResponse>>, StatusCode> {
    let queue = &app_state.queue;
    let snapshot = queue.status(&task_id).ok_or(StatusCode::NOT_FOUND)?;

    if snapshot.owner_id != req.requester_id && !queue.is_admin(req.requester_id) {
        warn!(
            "API: 用户 {} 尝试取消他人任务 {}",
            req.requester_id, task_id
        );
        return Ok(Json(ApiResponse::error(
            403,
            "Not allowed to cancel this task".to_string(),
        )));
    }

    if queue.cancel(&task_id, req.requester_id).await {
        Ok(Json(ApiResponse::success(CancelTaskResponse {
            cancelled: true,
        })))
    } else {
        Ok(Json(ApiResponse::error(
            409,
            "Task has already finished".to_string(),
        )))
    }
}
