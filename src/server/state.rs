use std::sync::Arc;
use std::time::Duration;

use crate::analysis::{AnalysisClient, ImageAnalysis};
use crate::cli::serve::ServeCommand;
use crate::config::{AnalysisSettings, SearchOptions};
use crate::db::Database;
use crate::embedding::Embedder;
use crate::search::advanced::DirectiveTable;

/// 应用状态
pub struct AppState {
    /// 数据库连接池
    pub db: Database,
    /// 查询向量缓存
    pub embedder: Embedder,
    /// 分析编排器
    pub analysis: ImageAnalysis,
    /// 高级筛选指令表，启动时构建一次
    pub directives: DirectiveTable,
    /// 解析后的分析配置
    pub settings: AnalysisSettings,
    /// 搜索配置选项
    pub search: SearchOptions,
    /// 鉴权 token
    pub token: String,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(db: Database, client: Arc<AnalysisClient>, opts: &ServeCommand) -> Arc<Self> {
        let settings = opts.analysis.resolve(false);
        let embedder =
            Embedder::new(client.clone(), Duration::from_secs(opts.search.embed_cache_ttl));
        let analysis = ImageAnalysis::new(
            db.clone(),
            client,
            settings.clone(),
            opts.service.instance_url.clone(),
        );
        Arc::new(AppState {
            db,
            embedder,
            analysis,
            directives: DirectiveTable::builtin(),
            settings,
            search: opts.search.clone(),
            token: opts.token.clone(),
        })
    }
}
