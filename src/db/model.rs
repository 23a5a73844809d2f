use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// 图片搜索数据记录
///
/// tsvector 与 halfvec 列无法直接映射到 Rust 类型，
/// 查询时以 `IS NOT NULL` 投影为布尔值
#[derive(Debug, Clone, FromRow)]
pub struct ImageSearchDataRecord {
    /// 关联的 upload ID
    pub upload_id: i64,
    /// 图片内容哈希
    pub sha1: String,
    /// OCR 识别出的文本
    pub ocr_text: Option<String>,
    /// 失败重试次数
    pub retry_times: i32,
    /// 是否已建立全文索引
    pub has_ocr_index: bool,
    /// 是否已存储 embedding
    pub has_embeddings: bool,
}

/// 论坛侧的图片上传记录
#[derive(Debug, Clone, FromRow)]
pub struct UploadRecord {
    pub id: i64,
    pub sha1: Option<String>,
    /// 重新编码前的原始内容哈希
    pub original_sha1: Option<String>,
    pub url: String,
    pub original_filename: String,
    pub extension: Option<String>,
    pub secure: bool,
}

impl UploadRecord {
    /// 图片的稳定内容哈希，优先使用重新编码前的哈希
    pub fn content_sha1(&self) -> Option<&str> {
        self.original_sha1.as_deref().or(self.sha1.as_deref())
    }
}

/// 搜索结果中的帖子摘要，连带作者与话题信息
#[derive(Debug, Clone, FromRow)]
pub struct PostSummary {
    pub id: i64,
    pub post_number: i32,
    pub topic_id: i64,
    pub created_at: DateTime<Utc>,
    pub user_id: i64,
    pub username: String,
    pub user_name: Option<String>,
    pub avatar_template: Option<String>,
    pub topic_title: String,
    pub topic_slug: String,
    pub category_id: Option<i64>,
}

/// 搜索结果中的图片摘要
#[derive(Debug, Clone, FromRow)]
pub struct UploadSummary {
    pub id: i64,
    pub url: String,
    pub width: i32,
    pub height: i32,
    pub extension: Option<String>,
}

/// 图片的缩略图记录
#[derive(Debug, Clone, FromRow)]
pub struct OptimizedImageSummary {
    pub upload_id: i64,
    pub url: String,
    pub width: i32,
    pub height: i32,
}
