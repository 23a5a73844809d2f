//! OCR 全文与 embedding 向量的混合搜索
//!
//! 两种打分方式不可比，组合模式下各取半页结果后统一按帖子 ID
//! 降序排列。向量检索先用二值量化做粗筛，再用原向量精排。

pub mod advanced;
pub mod result;

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use log::{error, warn};
use sqlx::QueryBuilder;

pub use self::result::*;
use self::advanced::{DirectiveTable, ResolvedClause};
use crate::config::{AnalysisSettings, SearchOptions};
use crate::db::{Database, EMBEDDING_DIM, encode_vector};
use crate::embedding::Embedder;
use crate::filter;
use crate::metrics;
use crate::utils::ts_query_expression;

/// 一次搜索请求的输入
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub term: String,
    /// 查询图片的内容与 MIME 类型，存在时触发按图搜图
    pub image: Option<(Vec<u8>, String)>,
    pub ocr: bool,
    pub embeddings: bool,
    pub page: usize,
    /// 发起请求的用户，`@me` 指令解析到此
    pub current_user: Option<i64>,
}

const DEFAULT_HNSW_EF_SEARCH: usize = 40;

pub struct ImageSearch<'a> {
    pool: &'a Database,
    embedder: &'a Embedder,
    directives: &'a DirectiveTable,
    settings: &'a AnalysisSettings,
    options: &'a SearchOptions,
}

impl<'a> ImageSearch<'a> {
    pub fn new(
        pool: &'a Database,
        embedder: &'a Embedder,
        directives: &'a DirectiveTable,
        settings: &'a AnalysisSettings,
        options: &'a SearchOptions,
    ) -> Self {
        Self { pool, embedder, directives, settings, options }
    }

    pub async fn execute(&self, query: SearchQuery) -> Result<ImageSearchResult> {
        let search_by_image = query.image.is_some();
        let mut search_ocr = query.ocr;
        let mut search_embeddings = query.embeddings;
        if search_by_image && (search_ocr || search_embeddings) {
            warn!("按图搜图与文本搜索互斥，忽略文本模式");
            search_ocr = false;
            search_embeddings = false;
        }

        let parsed = advanced::parse(self.directives, &query.term);
        let processed_term = parsed.residual.clone();
        let clauses =
            advanced::resolve_clauses(self.pool, &parsed.clauses, query.current_user).await?;

        let limit = self.options.limit;
        let page = query.page;
        let has_term = !processed_term.is_empty();
        let start = Instant::now();

        let (results, has_more, mode) = if search_ocr && search_embeddings && has_term {
            let half = limit / 2;
            let embedding = self.embedder.embed_text(&processed_term).await?;
            let res_embedding = self
                .search_posts_embedding(
                    &embedding,
                    &clauses,
                    half,
                    page * half,
                    self.options.text_similarity_threshold,
                )
                .await?;
            let res_ocr =
                self.search_posts_ocr(&processed_term, &clauses, half, page * half).await?;
            let has_more = page_is_full(res_embedding.len(), half) || page_is_full(res_ocr.len(), half);
            (merge_combined(res_embedding, res_ocr), has_more, "combined")
        } else if search_ocr && has_term {
            let res = self.search_posts_ocr(&processed_term, &clauses, limit, page * limit).await?;
            let has_more = page_is_full(res.len(), limit);
            (res, has_more, "ocr")
        } else if search_embeddings && has_term {
            let embedding = self.embedder.embed_text(&processed_term).await?;
            let res = self
                .search_posts_embedding(
                    &embedding,
                    &clauses,
                    limit,
                    page * limit,
                    self.options.text_similarity_threshold,
                )
                .await?;
            let has_more = page_is_full(res.len(), limit);
            (res, has_more, "embeddings")
        } else if let Some((bytes, content_type)) = &query.image {
            let embedding = self.embedder.embed_image(bytes, content_type).await?;
            let res = self
                .search_posts_embedding(
                    &embedding,
                    &clauses,
                    limit,
                    page * limit,
                    self.options.image_similarity_threshold,
                )
                .await?;
            let has_more = page_is_full(res.len(), limit);
            (res, has_more, "by_image")
        } else {
            (Vec::new(), false, "none")
        };

        metrics::inc_search_count(mode);
        metrics::observe_search_duration(mode, start.elapsed().as_secs_f64());

        let results = dedup_pairs(results);
        let (posts_id, uploads_id): (Vec<i64>, Vec<i64>) = results.into_iter().unzip();
        let grouped_results = result::assemble(self.pool, &posts_id, &uploads_id).await?;

        Ok(ImageSearchResult {
            term: query.term,
            processed_term,
            search_ocr,
            search_embeddings,
            search_by_image,
            page,
            limit,
            has_more,
            grouped_results,
        })
    }

    /// OCR 全文检索：只判断是否匹配，不做相关度排序，按帖子新旧排列
    async fn search_posts_ocr(
        &self,
        term: &str,
        clauses: &[ResolvedClause],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(i64, i64)>> {
        let ts_expr = ts_query_expression(term);
        if ts_expr.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new("SELECT posts.id, uploads.id FROM posts");
        qb.push(" JOIN topics ON topics.id = posts.topic_id");
        qb.push(" JOIN categories ON categories.id = topics.category_id");
        qb.push(" JOIN post_uploads ON post_uploads.post_id = posts.id");
        qb.push(" JOIN uploads ON uploads.id = post_uploads.upload_id");
        qb.push(" JOIN image_search_data AS isd ON isd.upload_id = uploads.id");
        qb.push(" WHERE TRUE");
        filter::push_post_conditions(&mut qb, self.settings);
        advanced::push_clause_conditions(&mut qb, clauses);
        qb.push(" AND isd.ocr_text_search_data @@ to_tsquery(");
        qb.push_bind(self.settings.ts_config.clone());
        qb.push("::regconfig, ");
        qb.push_bind(ts_expr);
        qb.push(")");
        qb.push(" ORDER BY posts.id DESC");
        qb.push(" LIMIT ").push_bind(limit as i64);
        qb.push(" OFFSET ").push_bind(offset as i64);
        Ok(qb.build_query_as::<(i64, i64)>().fetch_all(self.pool).await?)
    }

    /// 候选图片先出，再关联到可见帖子，保持向量距离的排序
    async fn search_posts_embedding(
        &self,
        embedding: &[f32],
        clauses: &[ResolvedClause],
        limit: usize,
        offset: usize,
        threshold: f32,
    ) -> Result<Vec<(i64, i64)>> {
        let image_ids = self.search_images_embedding(embedding, limit, offset, threshold).await?;
        if image_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new("SELECT posts.id, uploads.id FROM posts");
        qb.push(" JOIN topics ON topics.id = posts.topic_id");
        qb.push(" JOIN categories ON categories.id = topics.category_id");
        qb.push(" JOIN post_uploads ON post_uploads.post_id = posts.id");
        qb.push(" JOIN uploads ON uploads.id = post_uploads.upload_id");
        qb.push(" WHERE TRUE");
        filter::push_post_conditions(&mut qb, self.settings);
        advanced::push_clause_conditions(&mut qb, clauses);
        qb.push(" AND uploads.id = ANY(").push_bind(image_ids.clone()).push(")");
        qb.push(" ORDER BY array_position(").push_bind(image_ids).push(", uploads.id)");
        Ok(qb.build_query_as::<(i64, i64)>().fetch_all(self.pool).await?)
    }

    /// 两段式向量检索：二值量化粗筛出候选窗口，原向量精排并过滤阈值
    async fn search_images_embedding(
        &self,
        embedding: &[f32],
        limit: usize,
        offset: usize,
        threshold: f32,
    ) -> Result<Vec<i64>> {
        let vector_literal = encode_vector(embedding);
        let candidates_limit = (limit * 2 + offset) as i64;

        let mut tx = self.pool.begin().await?;
        if let Some(statement) = hnsw_search_workaround(limit) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT upload_id, embeddings
                FROM image_search_data
                WHERE embeddings IS NOT NULL
                ORDER BY binary_quantize(embeddings)::bit({dim}) <~> binary_quantize($1::halfvec({dim}))
                LIMIT $2
            )
            SELECT upload_id FROM candidates
            WHERE (1 - (embeddings <=> $1::halfvec({dim}))) >= $3
            ORDER BY embeddings <=> $1::halfvec({dim})
            LIMIT $4 OFFSET $5
            "#,
            dim = EMBEDDING_DIM,
        );
        // 向量索引坏掉时没有可用的降级路径，记录后原样抛出
        let rows = sqlx::query_scalar::<_, i64>(&sql)
            .bind(&vector_literal)
            .bind(candidates_limit)
            .bind(threshold)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                error!("embedding 查询失败: {e}");
                e
            })?;
        tx.commit().await?;
        Ok(rows)
    }
}

/// 候选窗口大于默认的 ef_search 时放宽索引扫描宽度
///
/// SET 语句不支持绑定参数，这里的值是内部计算出的整数
fn hnsw_search_workaround(limit: usize) -> Option<String> {
    let threshold = limit * 2;
    if threshold < DEFAULT_HNSW_EF_SEARCH {
        return None;
    }
    Some(format!("SET LOCAL hnsw.ef_search = {threshold}"))
}

/// 连接帖子前的原始命中填满一页即认为还有下一页
///
/// 不做精确计数，帖子侧过滤可能让当前页不满，但上游仍有候选
fn page_is_full(hits: usize, limit: usize) -> bool {
    hits >= limit
}

/// 组合模式的归并：两种得分不可比，统一回退到帖子 ID 降序
fn merge_combined(embedding: Vec<(i64, i64)>, ocr: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    let mut merged = embedding;
    merged.extend(ocr);
    merged.sort_by(|a, b| b.0.cmp(&a.0));
    merged
}

/// 同一 (post, upload) 组合只保留首次出现
fn dedup_pairs(pairs: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    let mut seen = HashSet::new();
    pairs.into_iter().filter(|pair| seen.insert(*pair)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_results_sorted_by_post_id_desc() {
        let embedding = vec![(3, 30), (9, 90)];
        let ocr = vec![(7, 70), (1, 10)];
        let merged = merge_combined(embedding, ocr);
        assert_eq!(merged, vec![(9, 90), (7, 70), (3, 30), (1, 10)]);
    }

    #[test]
    fn combined_merge_keeps_both_sources() {
        let merged = merge_combined(vec![(5, 50)], vec![(5, 51)]);
        assert_eq!(merged, vec![(5, 50), (5, 51)]);
    }

    #[test]
    fn dedup_preserves_first_occurrence() {
        let pairs = vec![(2, 20), (1, 10), (2, 20), (1, 11)];
        assert_eq!(dedup_pairs(pairs), vec![(2, 20), (1, 10), (1, 11)]);
    }

    #[test]
    fn full_page_means_has_more() {
        assert!(page_is_full(20, 20));
        assert!(!page_is_full(19, 20));
        assert!(!page_is_full(0, 20));
    }

    #[test]
    fn hnsw_workaround_only_for_wide_windows() {
        assert_eq!(hnsw_search_workaround(10), None);
        assert_eq!(hnsw_search_workaround(20), Some("SET LOCAL hnsw.ef_search = 40".to_string()));
        assert_eq!(hnsw_search_workaround(50), Some("SET LOCAL hnsw.ef_search = 100".to_string()));
    }
}
