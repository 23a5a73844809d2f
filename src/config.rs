use clap::{Parser, Subcommand};

use crate::cli::*;

#[derive(Parser, Debug, Clone)]
#[command(name = "imboard", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 论坛 PostgreSQL 连接地址，需要 pgvector 扩展
    #[arg(short = 'd', long, env = "IMBOARD_DATABASE_URL", value_name = "URL")]
    pub database_url: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动 HTTP 搜索与分析服务
    Serve(ServeCommand),
    /// 回填历史帖子中尚未分析的图片
    Backfill(BackfillCommand),
    /// 清理不再对应任何可见帖子的搜索数据
    Cleanup(CleanupCommand),
    /// 分析单个帖子或单张图片
    Analyze(AnalyzeCommand),
}

/// 外部分析服务的连接配置
#[derive(Parser, Debug, Clone)]
pub struct ServiceOptions {
    /// 分析服务地址
    #[arg(long, env = "IMBOARD_SERVICE_ENDPOINT", value_name = "URL")]
    pub service_endpoint: String,
    /// 分析服务的 API key，随请求头发送
    #[arg(long, env = "IMBOARD_SERVICE_KEY", value_name = "KEY", default_value_t = String::new())]
    pub service_key: String,
    /// 本论坛的对外地址，用于补全相对图片链接和标识请求来源
    #[arg(long, value_name = "URL", default_value = "http://localhost")]
    pub instance_url: String,
    /// 单次请求的总超时时间（秒）
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,
    /// 建立连接的超时时间（秒）
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub connect_timeout: u64,
}

/// 图片分析与筛选配置
#[derive(Parser, Debug, Clone)]
pub struct AnalysisOptions {
    /// 参与分析的图片最大体积（KB）
    #[arg(long, value_name = "KB", default_value_t = 1024)]
    pub max_image_size_kb: i64,
    /// 参与分析的图片最小宽度
    #[arg(long, value_name = "PX", default_value_t = 100)]
    pub min_image_width: i32,
    /// 参与分析的图片最小高度
    #[arg(long, value_name = "PX", default_value_t = 100)]
    pub min_image_height: i32,
    /// 单个帖子允许分析的最大图片数量，0 或负数表示不限制
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub max_images_per_post: i64,
    /// 单张图片分析失败后的最大重试次数，负数表示不限制
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub max_retry_times: i32,
    /// 是否进行 OCR 分析，不填则使用默认值
    #[arg(long, value_name = "BOOL")]
    pub analyze_ocr: Option<bool>,
    /// 是否进行 embedding 分析，不填则使用默认值
    #[arg(long, value_name = "BOOL")]
    pub analyze_embedding: Option<bool>,
    /// OCR 结果命中违禁词时是否自动举报帖子，不填则使用默认值
    #[arg(long, value_name = "BOOL")]
    pub auto_flag_ocr: Option<bool>,
    /// 不统计分析失败次数
    #[arg(long)]
    pub no_record_failed: bool,
    /// 将图片以 base64 data URI 形式内联发送，而不是发送下载链接
    #[arg(long)]
    pub image_base64: bool,
    /// 不参与分析与搜索的分类 ID，多个用逗号分隔
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub ignored_categories: Vec<i64>,
    /// 不参与分析与搜索的话题标签，多个用逗号分隔
    #[arg(long, value_name = "TAGS", value_delimiter = ',')]
    pub ignored_tags: Vec<String>,
    /// 论坛未启用标签功能时跳过标签过滤
    #[arg(long)]
    pub disable_tagging: bool,
    /// 构建全文索引使用的文本搜索配置
    #[arg(long, value_name = "REGCONFIG", default_value = "english")]
    pub ts_config: String,
}

impl AnalysisOptions {
    /// 把三态开关一次性解析为完整配置，之后不再读取默认值
    pub fn resolve(&self, force: bool) -> AnalysisSettings {
        AnalysisSettings {
            analyze_ocr: self.analyze_ocr.unwrap_or(true),
            analyze_embedding: self.analyze_embedding.unwrap_or(true),
            auto_flag_ocr: self.auto_flag_ocr.unwrap_or(false),
            record_failed: !self.no_record_failed,
            force,
            image_base64: self.image_base64,
            max_image_size_kb: self.max_image_size_kb,
            min_image_width: self.min_image_width,
            min_image_height: self.min_image_height,
            max_images_per_post: self.max_images_per_post,
            max_retry_times: self.max_retry_times,
            ignored_categories: self.ignored_categories.clone(),
            ignored_tags: self.ignored_tags.clone(),
            tagging_enabled: !self.disable_tagging,
            ts_config: self.ts_config.clone(),
        }
    }
}

/// 解析后的分析配置，所有开关均已确定
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub analyze_ocr: bool,
    pub analyze_embedding: bool,
    pub auto_flag_ocr: bool,
    pub record_failed: bool,
    /// 忽略筛选规则与已有数据，强制重新分析
    pub force: bool,
    pub image_base64: bool,
    pub max_image_size_kb: i64,
    pub min_image_width: i32,
    pub min_image_height: i32,
    pub max_images_per_post: i64,
    pub max_retry_times: i32,
    pub ignored_categories: Vec<i64>,
    pub ignored_tags: Vec<String>,
    pub tagging_enabled: bool,
    pub ts_config: String,
}

/// 搜索配置选项
#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 每页结果数量
    #[arg(long, value_name = "N", default_value_t = 20)]
    pub limit: usize,
    /// 按文本搜索时的 embedding 相似度阈值
    #[arg(long, value_name = "SCORE", default_value_t = 0.6)]
    pub text_similarity_threshold: f32,
    /// 按图搜图时的 embedding 相似度阈值
    #[arg(long, value_name = "SCORE", default_value_t = 0.8)]
    pub image_similarity_threshold: f32,
    /// embedding 查询结果的缓存时间（秒）
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub embed_cache_ttl: u64,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn resolve_defaults() {
        let opts = AnalysisOptions::parse_from(["test"]);
        let settings = opts.resolve(false);
        assert!(settings.analyze_ocr);
        assert!(settings.analyze_embedding);
        assert!(!settings.auto_flag_ocr);
        assert!(settings.record_failed);
        assert!(!settings.force);
        assert!(settings.tagging_enabled);
    }

    #[test]
    fn resolve_explicit_off() {
        let opts =
            AnalysisOptions::parse_from(["test", "--analyze-ocr", "false", "--auto-flag-ocr", "true"]);
        let settings = opts.resolve(true);
        assert!(!settings.analyze_ocr);
        assert!(settings.analyze_embedding);
        assert!(settings.auto_flag_ocr);
        assert!(settings.force);
    }
}
