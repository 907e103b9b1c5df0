use link_relay::{
    common::sweep_staging_dir,
    config::{AppConfig, LogConfig},
    logging,
    server::{build_router, AppState},
};
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 先加载日志配置（必须保持 _log_guard 存活）
    let log_config = load_log_config().await;
    let _log_guard = logging::init_logging(&log_config);

    info!("link-relay v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // 清理上次运行遗留的暂存文件
    if let Err(e) = sweep_staging_dir(&config.download.work_dir) {
        warn!("暂存目录清理失败: {:#}", e);
    }

    let app_state = AppState::from_config(config)?;
    info!("应用状态初始化完成");

    let app = build_router(app_state.clone());

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("正在取消进行中的任务...");
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
