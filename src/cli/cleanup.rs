use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{AnalysisOptions, Opts};
use crate::db::{FailureStore, init_db};
use crate::filter;

#[derive(Parser, Debug, Clone)]
pub struct CleanupCommand {
    #[command(flatten)]
    pub analysis: AnalysisOptions,
}

impl SubCommandExtend for CleanupCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let db = init_db(&opts.database_url).await?;
        let settings = self.analysis.resolve(false);

        info!("清理孤儿搜索数据……");
        let orphans = filter::image_search_data_need_remove(&db, &settings).await?;
        if !orphans.is_empty() {
            let ids: Vec<i64> = orphans.iter().map(|(upload_id, _)| *upload_id).collect();
            let deleted = sqlx::query("DELETE FROM image_search_data WHERE upload_id = ANY($1)")
                .bind(ids)
                .execute(&db)
                .await?
                .rows_affected();
            info!("删除 {deleted} 行搜索数据");
        }

        // 失败计数只为还会被重试的图片保留
        let failures = FailureStore::new(db.clone());
        let keys = failures.keys().await?;
        if !keys.is_empty() {
            let keep = filter::retryable_sha1s(&db, &settings, &keys).await?;
            let pruned = failures.retain(&keep).await?;
            info!("修剪 {pruned} 条失败计数");
        }

        info!("清理完成");
        Ok(())
    }
}
