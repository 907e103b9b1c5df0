// 配置管理模块

use crate::task::Tier;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 配额配置
    #[serde(default)]
    pub quota: QuotaConfig,
    /// 队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 进度展示配置
    #[serde(default)]
    pub progress: ProgressConfig,
    /// 缩略图配置
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 消息通道配置
    #[serde(default)]
    pub channel: ChannelConfig,
    /// 链接解析配置
    #[serde(default)]
    pub source: SourceConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18990
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 配额配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// 免费用户每日任务数
    #[serde(default = "default_free_daily_limit")]
    pub free_daily_limit: u32,
    /// 高级用户每日任务数（None 表示不限）
    #[serde(default)]
    pub premium_daily_limit: Option<u32>,
    /// 免费用户单文件上限（字节）
    #[serde(default = "default_free_max_size")]
    pub free_max_size: u64,
    /// 高级用户单文件上限（字节）
    #[serde(default = "default_premium_max_size")]
    pub premium_max_size: u64,
}

fn default_free_daily_limit() -> u32 {
    5
}

fn default_free_max_size() -> u64 {
    200 * 1024 * 1024 // 200MB
}

fn default_premium_max_size() -> u64 {
    4 * 1024 * 1024 * 1024 // 4GB
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_daily_limit: default_free_daily_limit(),
            premium_daily_limit: None,
            free_max_size: default_free_max_size(),
            premium_max_size: default_premium_max_size(),
        }
    }
}

impl QuotaConfig {
    /// 等级对应的每日次数上限
    pub fn daily_limit(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::Free => Some(self.free_daily_limit),
            Tier::Premium => self.premium_daily_limit,
        }
    }

    /// 等级对应的单文件上限
    pub fn max_size(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => self.free_max_size,
            Tier::Premium => self.premium_max_size,
        }
    }
}

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 工作池大小（全局并发上限）
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// 单个用户并发上限
    #[serde(default = "default_per_owner_cap")]
    pub per_owner_cap: usize,
    /// 免费用户合计并发上限（None 表示只受全局上限约束）
    #[serde(default)]
    pub free_tier_cap: Option<usize>,
    /// 终态任务保留时长（秒），到期后不再可查询
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// 清理终态任务的间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 可以取消任意任务的管理员
    #[serde(default)]
    pub admin_ids: Vec<i64>,
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_per_owner_cap() -> usize {
    1
}

fn default_retention_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            per_owner_cap: default_per_owner_cap(),
            free_tier_cap: None,
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            admin_ids: Vec::new(),
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避（毫秒）
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 最大退避（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 暂存目录（下载产物在上传完成后删除）
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// 分块大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 单次读取超时（秒），同时决定取消检查的粒度
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 链接解析超时（秒）
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 免费用户下载限速（字节/秒，None 表示不限）
    #[serde(default)]
    pub free_rate_limit: Option<u64>,
    /// 高级用户下载限速（字节/秒，None 表示不限）
    #[serde(default)]
    pub premium_rate_limit: Option<u64>,
    /// 下载产物的最小有效大小（字节），更小的文件视为错误页
    #[serde(default = "default_min_valid_size")]
    pub min_valid_size: u64,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("data/staging")
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_resolve_timeout_secs() -> u64 {
    60
}

fn default_min_valid_size() -> u64 {
    1000
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            chunk_size: default_chunk_size(),
            read_timeout_secs: default_read_timeout_secs(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            retry: RetryConfig::default(),
            free_rate_limit: None,
            premium_rate_limit: None,
            min_valid_size: default_min_valid_size(),
        }
    }
}

impl DownloadConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs.max(1))
    }

    /// 等级对应的限速
    pub fn rate_limit(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Free => self.free_rate_limit,
            Tier::Premium => self.premium_rate_limit,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 读取产物文件的缓冲大小（字节）
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_read_chunk_size() -> usize {
    512 * 1024
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

/// 进度展示配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// 两次状态消息编辑之间的最小间隔（毫秒）
    #[serde(default = "default_edit_interval_ms")]
    pub edit_interval_ms: u64,
    /// 速度统计窗口（秒）
    #[serde(default = "default_speed_window_secs")]
    pub speed_window_secs: u64,
    /// 进度条分段数
    #[serde(default = "default_bar_segments")]
    pub bar_segments: usize,
}

fn default_edit_interval_ms() -> u64 {
    3000
}

fn default_speed_window_secs() -> u64 {
    5
}

fn default_bar_segments() -> usize {
    10
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            edit_interval_ms: default_edit_interval_ms(),
            speed_window_secs: default_speed_window_secs(),
            bar_segments: default_bar_segments(),
        }
    }
}

impl ProgressConfig {
    pub fn edit_interval(&self) -> Duration {
        Duration::from_millis(self.edit_interval_ms)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_secs(self.speed_window_secs.max(1))
    }
}

/// 缩略图配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    /// 是否生成缩略图
    #[serde(default = "default_thumbnail_enabled")]
    pub enabled: bool,
    /// ffmpeg 可执行文件
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// pdftoppm 可执行文件
    #[serde(default = "default_pdftoppm_path")]
    pub pdftoppm_path: String,
    /// 缩略图最大边长（像素）
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// 外部工具超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 默认缩略图地址，生成失败时在上传阶段替换
    #[serde(default)]
    pub default_url: Option<String>,
}

fn default_thumbnail_enabled() -> bool {
    true
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_pdftoppm_path() -> String {
    "pdftoppm".to_string()
}

fn default_max_dimension() -> u32 {
    320
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            enabled: default_thumbnail_enabled(),
            ffmpeg_path: default_ffmpeg_path(),
            pdftoppm_path: default_pdftoppm_path(),
            max_dimension: default_max_dimension(),
            tool_timeout_secs: default_tool_timeout_secs(),
            default_url: None,
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 配额数据库路径（未设置时使用内存存储）
    #[serde(default)]
    pub quota_db_path: Option<PathBuf>,
}

/// 消息通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// 投递目录
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
    /// 审计日志接收方，任务完成或失败时发送一条记录（None 表示不发送）
    #[serde(default)]
    pub log_target: Option<i64>,
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("data/outbox")
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbox_dir: default_outbox_dir(),
            log_target: None,
        }
    }
}

/// 链接解析配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// 按域名路由的平台解析器，先声明的优先；未匹配的链接走直链解析
    #[serde(default)]
    pub routes: Vec<SourceRoute>,
}

/// 一个平台的解析路由
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRoute {
    pub name: String,
    /// 域名，匹配自身及其子域名
    pub hosts: Vec<String>,
    /// 附加到该平台每个请求上的请求头（如 Referer、Cookie）
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时使用默认配置并写回文件
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                } else {
                    tracing::info!("已写入默认配置: {}", path);
                }

                default_config
            }
        }
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.queue.worker_pool_size == 0 {
            anyhow::bail!("queue.worker_pool_size 必须大于 0");
        }
        if self.queue.per_owner_cap == 0 {
            anyhow::bail!("queue.per_owner_cap 必须大于 0");
        }
        if self.queue.free_tier_cap == Some(0) {
            anyhow::bail!("queue.free_tier_cap 不能为 0");
        }
        if self.download.chunk_size == 0 {
            anyhow::bail!("download.chunk_size 必须大于 0");
        }
        if self.upload.read_chunk_size == 0 {
            anyhow::bail!("upload.read_chunk_size 必须大于 0");
        }
        if self.progress.bar_segments == 0 {
            anyhow::bail!("progress.bar_segments 必须大于 0");
        }
        for route in &self.source.routes {
            if route.hosts.iter().all(|h| h.trim().is_empty()) {
                anyhow::bail!("source.routes[{}] 没有配置域名", route.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 18990);
        assert_eq!(config.quota.free_daily_limit, 5);
        assert_eq!(config.quota.free_max_size, 200 * 1024 * 1024);
        assert_eq!(config.quota.premium_max_size, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.queue.per_owner_cap, 1);
        assert_eq!(config.progress.edit_interval_ms, 3000);
        assert!(config.download.free_rate_limit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tier_limits() {
        let quota = QuotaConfig::default();
        assert_eq!(quota.daily_limit(Tier::Free), Some(5));
        assert_eq!(quota.daily_limit(Tier::Premium), None);
        assert!(quota.max_size(Tier::Premium) > quota.max_size(Tier::Free));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let content = r#"
            [quota]
            free_daily_limit = 3

            [queue]
            worker_pool_size = 8
            admin_ids = [1, 2]
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.quota.free_daily_limit, 3);
        assert_eq!(config.quota.free_max_size, 200 * 1024 * 1024);
        assert_eq!(config.queue.worker_pool_size, 8);
        assert_eq!(config.queue.admin_ids, vec![1, 2]);
        assert_eq!(config.download.retry.max_retries, 3);
        assert!(config.source.routes.is_empty());
    }

    #[test]
    fn test_source_routes_from_toml() {
        let content = r#"
            [[source.routes]]
            name = "drive"
            hosts = ["drive.example.com"]
            headers = { referer = "https://drive.example.com/" }

            [[source.routes]]
            name = "mirror"
            hosts = ["mirror.example.org", "cdn.example.org"]
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.source.routes.len(), 2);
        assert_eq!(config.source.routes[0].name, "drive");
        assert_eq!(
            config.source.routes[0].headers.get("referer").map(String::as_str),
            Some("https://drive.example.com/")
        );
        assert!(config.source.routes[1].headers.is_empty());
        assert!(config.validate().is_ok());

        let mut config = config;
        config.source.routes[1].hosts.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.queue.worker_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queue.free_tier_cap = Some(0);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.quota.premium_daily_limit = Some(100);
        config.thumbnail.default_url = Some("https://example.com/thumb.jpg".to_string());
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.quota.premium_daily_limit, Some(100));
        assert_eq!(
            loaded.thumbnail.default_url.as_deref(),
            Some("https://example.com/thumb.jpg")
        );
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert_eq!(config.server.port, 18990);
        assert!(path.exists());
    }
}
