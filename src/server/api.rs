use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use log::info;
use prometheus::TextEncoder;
use serde_json::{Value, json};

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::search::{ImageSearch, ImageSearchResult, SearchQuery};

/// 搜索图片
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = ImageSearchResult),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<SearchRequest>,
) -> Result<Json<ImageSearchResult>> {
    let image = data.image.as_ref().map(|file| {
        let content_type =
            file.metadata.content_type.clone().unwrap_or_else(|| "image/jpeg".to_string());
        (file.contents.to_vec(), content_type)
    });
    let query = SearchQuery {
        term: data.term.clone().unwrap_or_default(),
        image,
        ocr: data.ocr.unwrap_or(true),
        embeddings: data.embed.unwrap_or(true),
        page: data.page.unwrap_or(0),
        current_user: None,
    };

    info!("正在搜索: {:?}", query.term);

    let search = ImageSearch::new(
        &state.db,
        &state.embedder,
        &state.directives,
        &state.settings,
        &state.search,
    );
    let result = search.execute(query).await?;
    Ok(Json(result))
}

/// 触发帖子或单张图片的分析，帖子图片抓取完成后的回调入口
#[utoipa::path(
    post,
    path = "/analyze",
    request_body = AnalyzeApiRequest,
    responses(
        (status = 200, description = "分析结果概要"),
    )
)]
pub async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
    Json(data): Json<AnalyzeApiRequest>,
) -> Result<Json<Value>> {
    if token != state.token {
        return Err(AppError::unauthorized());
    }
    let outcome = match (data.post_id, data.upload_id) {
        (Some(post_id), _) => state.analysis.process_post(post_id).await?,
        (None, Some(upload_id)) => state.analysis.process_image(upload_id).await?,
        (None, None) => {
            return Err(AppError::bad_request("post_id 与 upload_id 至少提供一个"));
        }
    };
    Ok(Json(json!({ "outcome": outcome })))
}

/// prometheus 指标
pub async fn metrics_handler() -> Result<String> {
    let encoder = TextEncoder::new();
    Ok(encoder.encode_to_string(&prometheus::gather())?)
}
