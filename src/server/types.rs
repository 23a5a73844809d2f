use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use serde::Deserialize;
use utoipa::ToSchema;

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    pub term: Option<String>,
    /// 查询图片，存在时按图搜图
    pub image: Option<FieldData<Bytes>>,
    pub ocr: Option<bool>,
    pub embed: Option<bool>,
    pub page: Option<usize>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 搜索词，可包含 topic:/before:/after:/@user/tags:/#category 指令
    pub term: Option<String>,
    /// 按图搜图时上传的图片，与文本搜索互斥
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub image: Option<String>,
    /// 是否搜索 OCR 文本
    pub ocr: Option<bool>,
    /// 是否搜索 embedding
    pub embed: Option<bool>,
    /// 页码，从 0 开始
    pub page: Option<usize>,
}

/// 触发分析的请求，post_id 与 upload_id 二选一
#[derive(Debug, Deserialize, ToSchema)]
pub struct AnalyzeApiRequest {
    #[serde(default)]
    pub post_id: Option<i64>,
    #[serde(default)]
    pub upload_id: Option<i64>,
}
