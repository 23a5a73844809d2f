use anyhow::Result;
use sqlx::Row;

use super::Database;

/// 按内容哈希统计分析失败次数的键值存储
///
/// 独立于 image_search_data 表，清理任务会修剪掉
/// 不再对应任何可重试图片的计数
#[derive(Clone)]
pub struct FailureStore {
    pool: Database,
}

impl FailureStore {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    pub async fn get(&self, sha1: &str) -> Result<i64> {
        let count: Option<i32> =
            sqlx::query_scalar("SELECT count FROM analysis_failures WHERE sha1 = $1")
                .bind(sha1)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0) as i64)
    }

    pub async fn increment(&self, sha1: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_failures (sha1, count, updated_at)
            VALUES ($1, 1, now())
            ON CONFLICT (sha1) DO UPDATE SET
                count = analysis_failures.count + 1,
                updated_at = now()
            "#,
        )
        .bind(sha1)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 分析成功后清除对应的失败计数
    pub async fn clear(&self, sha1: &str) -> Result<()> {
        sqlx::query("DELETE FROM analysis_failures WHERE sha1 = $1")
            .bind(sha1)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT sha1 FROM analysis_failures")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("sha1")).collect())
    }

    /// 只保留给定哈希对应的计数，返回删除的行数
    pub async fn retain(&self, keep: &[String]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM analysis_failures WHERE NOT (sha1 = ANY($1))")
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
