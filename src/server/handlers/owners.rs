use crate::queue::OwnerStats;
use crate::quota::UsageSummary;
use crate::server::AppState;
use crate::task::{OwnerId, TaskSnapshot, Tier};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{ApiResponse, CancelRequest};

#[derive(Debug, Serialize)]
pub struct CancelAllResponse {
    pub cancelled: usize,
}

/// 设置用户等级请求（仅管理员）
#[derive(Debug, Deserialize)]
pub struct SetTierRequest {
    pub requester_id: OwnerId,
    pub tier: Tier,
    #[serde(default)]
    pub premium_expiry: Option<DateTime<Utc>>,
}

/// GET /api/v1/owners/:owner_id/tasks
pub async fn list_owner_tasks(
    State(app_state): State<AppState>,
    Path(owner_id): Path<OwnerId>,
) -> Result<Json<ApiResponse<Vec<TaskSnapshot>>>, StatusCode> {
    Ok(Json(ApiResponse::success(
        app_state.queue.owner_tasks(owner_id),
    )))
}

/// 用户任务统计
#[derive(Debug, Serialize)]
pub struct OwnerStatsResponse {
    pub stats: OwnerStats,
    /// 汇总文本
    pub summary: String,
}

/// GET /api/v1/owners/:owner_id/stats
pub async fn get_owner_stats(
    State(app_state): State<AppState>,
    Path(owner_id): Path<OwnerId>,
) -> Result<Json<ApiResponse<OwnerStatsResponse>>, StatusCode> {
    let queue = &app_state.queue;
    Ok(Json(ApiResponse::success(OwnerStatsResponse {
        stats: queue.owner_stats(owner_id),
        summary: queue.owner_summary(owner_id),
    })))
}

/// POST /api/v1/owners/:owner_id/cancel
/// 取消用户全部未完成任务
pub async fn cancel_owner_tasks(
    State(app_state): State<AppState>,
    Path(owner_id): Path<OwnerId>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<ApiResponse<CancelAllResponse>>, StatusCode> {
    let queue = &app_state.queue;
    if owner_id != req.requester_id && !queue.is_admin(req.requester_id) {
        return Ok(Json(ApiResponse::error(
            403,
            "Not allowed to cancel these tasks".to_string(),
        )));
    }

    let cancelled = queue.cancel_all(owner_id, req.requester_id).await;
    info!("API: 用户 {} 批量取消 {} 个任务", owner_id, cancelled);
    Ok(Json(ApiResponse::success(CancelAllResponse { cancelled })))
}

/// GET /api/v1/owners/:owner_id/quota
pub async fn get_owner_quota(
    State(app_state): State<AppState>,
    Path(owner_id): Path<OwnerId>,
) -> Result<Json<ApiResponse<UsageSummary>>, StatusCode> {
    match app_state.queue.quota().usage(owner_id).await {
        Ok(summary) => Ok(Json(ApiResponse::success(summary))),
        Err(e) => {
            error!("查询用户 {} 配额失败: {:#}", owner_id, e);
            Ok(Json(ApiResponse::error(
                500,
                "Failed to load quota".to_string(),
            )))
        }
    }
}

/// PUT /api/v1/owners/:owner_id/tier
pub async fn set_owner_tier(
    State(app_state): State<AppState>,
    Path(owner_id): Path<OwnerId>,
    Json(req): Json<SetTierRequest>,
) -> Result<Json<ApiResponse<UsageSummary>>, StatusCode> {
    let queue = &app_state.queue;
    if !queue.is_admin(req.requester_id) {
        return Ok(Json(ApiResponse::error(
            403,
            "Only administrators can change tiers".to_string(),
        )));
    }

    let quota = queue.quota();
    let result = match quota.set_tier(owner_id, req.tier, req.premium_expiry).await {
        Ok(()) => quota.usage(owner_id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(summary) => Ok(Json(ApiResponse::success(summary))),
        Err(e) => {
            error!("更新用户 {} 等级失败: {:#}", owner_id, e);
            Ok(Json(ApiResponse::error(
                500,
                "Failed to update tier".to_string(),
            )))
        }
    }
}
