use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use log::info;

use crate::analysis::{AnalysisClient, ImageAnalysis};
use crate::cli::SubCommandExtend;
use crate::config::{AnalysisOptions, Opts, ServiceOptions};
use crate::db::init_db;

#[derive(Parser, Debug, Clone)]
pub struct AnalyzeCommand {
    #[command(flatten)]
    pub service: ServiceOptions,
    #[command(flatten)]
    pub analysis: AnalysisOptions,
    /// 要分析的帖子 ID
    #[arg(long, value_name = "ID", conflicts_with = "upload")]
    pub post: Option<i64>,
    /// 要分析的图片 ID
    #[arg(long, value_name = "ID")]
    pub upload: Option<i64>,
    /// 忽略筛选规则与已有数据，强制重新分析
    #[arg(long)]
    pub force: bool,
}

impl SubCommandExtend for AnalyzeCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let db = init_db(&opts.database_url).await?;
        let client = Arc::new(AnalysisClient::new(&self.service)?);
        let settings = self.analysis.resolve(self.force);
        let analysis =
            ImageAnalysis::new(db, client, settings, self.service.instance_url.clone());

        let outcome = match (self.post, self.upload) {
            (Some(post_id), None) => {
                info!("分析帖子 {post_id}");
                analysis.process_post(post_id).await?
            }
            (None, Some(upload_id)) => {
                info!("分析图片 {upload_id}");
                analysis.process_image(upload_id).await?
            }
            _ => bail!("需要 --post 或 --upload 之一"),
        };
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        Ok(())
    }
}
