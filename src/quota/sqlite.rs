//! SQLite 配额存储

use super::{QuotaStore, UserQuota};
use crate::task::{OwnerId, Tier};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::info;

/// SQLite 配额存储
///
/// 数据库调用放在 `spawn_blocking` 中执行
#[derive(Clone)]
pub struct SqliteQuotaStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteQuotaStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("创建数据库连接池失败")?;

        let store = Self { pool };
        store.init_tables()?;
        info!("配额数据库已打开: {:?}", db_path);
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.pool.get().context("获取数据库连接失败")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_quota (
                owner_id INTEGER PRIMARY KEY,
                tier TEXT NOT NULL,
                premium_expiry TEXT,
                tasks_used_today INTEGER NOT NULL DEFAULT 0,
                day_window_start TEXT NOT NULL
            );
            "#,
        )
        .context("初始化配额表失败")?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context("获取数据库连接失败")?;
            f(&*conn)
        })
        .await
        .map_err(|e| anyhow!("数据库任务异常退出: {}", e))?
    }
}

fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("无效的时间字段: {}", s))?
        .with_timezone(&Utc))
}

fn decode_tier(s: &str) -> Tier {
    match s {
        "premium" => Tier::Premium,
        _ => Tier::Free,
    }
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn load(&self, owner_id: OwnerId) -> Result<Option<UserQuota>> {
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT tier, premium_expiry, tasks_used_today, day_window_start
                     FROM user_quota WHERE owner_id = ?1",
                    params![owner_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((tier, expiry, used, window)) = row else {
                return Ok(None);
            };

            Ok(Some(UserQuota {
                owner_id,
                tier: decode_tier(&tier),
                premium_expiry: expiry.as_deref().map(decode_time).transpose()?,
                tasks_used_today: used,
                day_window_start: decode_time(&window)?,
            }))
        })
        .await
    }

    async fn save(&self, quota: &UserQuota) -> Result<()> {
        let quota = quota.clone();
        self.blocking(move |conn| {
            conn.execute(
                r#"
                INSERT INTO user_quota (owner_id, tier, premium_expiry, tasks_used_today, day_window_start)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(owner_id) DO UPDATE SET
                    tier = excluded.tier,
                    premium_expiry = excluded.premium_expiry,
                    tasks_used_today = excluded.tasks_used_today,
                    day_window_start = excluded.day_window_start
                "#,
                params![
                    quota.owner_id,
                    quota.tier.as_str(),
                    quota.premium_expiry.as_ref().map(encode_time),
                    quota.tasks_used_today,
                    encode_time(&quota.day_window_start),
                ],
            )?;
            Ok(())
        })
        .await
    }
}
