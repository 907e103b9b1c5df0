// Web服务器模块

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::{
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

// 健康检查响应结构
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "link-relay".to_string(),
    })
}

/// 构建完整路由
pub fn build_router(app_state: AppState) -> Router {
    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let api_routes = Router::new()
        // 任务API
        .route("/tasks", post(handlers::submit_task))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/tasks/:id/progress", get(handlers::get_task_progress))
        .route("/tasks/:id/position", get(handlers::get_task_position))
        .route("/tasks/:id/cancel", post(handlers::cancel_task))
        // 用户API
        .route("/owners/:owner_id/tasks", get(handlers::list_owner_tasks))
        .route("/owners/:owner_id/cancel", post(handlers::cancel_owner_tasks))
        .route("/owners/:owner_id/quota", get(handlers::get_owner_quota))
        .route("/owners/:owner_id/stats", get(handlers::get_owner_stats))
        .route("/owners/:owner_id/tier", put(handlers::set_owner_tier))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}
