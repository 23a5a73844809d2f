use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use indicatif::ProgressBar;
use log::{info, warn};

use crate::analysis::{AnalysisClient, ImageAnalysis, ProcessOutcome};
use crate::cli::SubCommandExtend;
use crate::config::{AnalysisOptions, Opts, ServiceOptions};
use crate::db::init_db;
use crate::filter;
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct BackfillCommand {
    #[command(flatten)]
    pub service: ServiceOptions,
    #[command(flatten)]
    pub analysis: AnalysisOptions,
    /// 以图片为单位回填，而不是以帖子为单位
    #[arg(long)]
    pub by_upload: bool,
    /// 本次扫描的时间预算（秒）
    #[arg(long, value_name = "SECS", default_value_t = 3000)]
    pub budget: u64,
    /// 本次失败达到该次数时中止，避免持续冲击故障中的服务
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub max_failures: usize,
    /// 本次最多处理的目标数量，0 表示不限制
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub limit: usize,
}

impl SubCommandExtend for BackfillCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let db = init_db(&opts.database_url).await?;
        let client = Arc::new(AnalysisClient::new(&self.service)?);
        let settings = self.analysis.resolve(false);
        let analysis = ImageAnalysis::new(
            db.clone(),
            client,
            settings.clone(),
            self.service.instance_url.clone(),
        );

        let targets = if self.by_upload {
            filter::uploads_need_analysis(&db, &settings, true).await?
        } else {
            filter::posts_need_analysis(&db, &settings, true).await?
        };
        info!("待回填目标: {}", targets.len());

        let deadline = Instant::now() + Duration::from_secs(self.budget);
        let mut processed = 0usize;
        let mut analyzed = 0usize;
        let mut failures = 0usize;

        let pb = ProgressBar::new(targets.len() as u64).with_style(pb_style());
        for target in targets {
            if Instant::now() >= deadline {
                info!("时间预算用完，提前结束");
                break;
            }
            if failures >= self.max_failures {
                warn!("本次失败 {failures} 次，疑似分析服务故障，提前结束");
                break;
            }
            if self.limit > 0 && processed >= self.limit {
                break;
            }

            let outcome = if self.by_upload {
                analysis.process_image(target).await?
            } else {
                analysis.process_post(target).await?
            };
            processed += 1;
            if outcome.is_failure() {
                failures += 1;
            }
            if matches!(outcome, ProcessOutcome::Analyzed { .. }) {
                analyzed += 1;
            }
            pb.inc(1);
        }
        pb.finish_with_message("回填结束");

        info!("本次处理 {processed} 个目标，完成分析 {analyzed} 个，请求失败 {failures} 次");
        Ok(())
    }
}
