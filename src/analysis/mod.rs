//! 图片分析编排
//!
//! 对单个帖子或单张图片提取符合条件的图片，调用外部分析服务，
//! 幂等地写回搜索数据并记录失败次数。持久化只依赖 upsert 合并，
//! 同一目标被并发分析时最终结果为各维度成功值的并集。

mod client;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use anyhow::{Result, bail};
use log::{info, warn};
use regex::Regex;

pub use self::client::*;
use crate::config::AnalysisSettings;
use crate::db::{
    Database, EMBEDDING_DIM, FailureStore, ImageSearchDataRecord, UploadRecord, encode_vector,
};
use crate::filter::{self, UploadFilterOpts};
use crate::metrics;
use crate::utils::{image_data_uri, prepare_text, resolve_upload_url};

/// 论坛系统账号，用于自动举报
const SYSTEM_USER_ID: i64 = -1;
/// 举报类型：不当内容
const POST_ACTION_TYPE_INAPPROPRIATE: i64 = 4;

/// 一次分析调用的结果，调度方据此统计失败并熔断
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// 目标不满足筛选条件，或没有需要分析的维度
    Skipped,
    /// 帖子中没有符合条件的图片
    NoImages,
    /// 图片数量超出单帖上限，不发起请求
    TooManyImages,
    /// 请求级失败：网络错误、超时或非 200 响应
    ServiceFailed,
    /// 服务返回 200，按图片粒度统计结果
    Analyzed { succeeded: usize, failed: usize },
}

impl ProcessOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ProcessOutcome::ServiceFailed)
    }
}

pub struct ImageAnalysis {
    pool: Database,
    client: Arc<AnalysisClient>,
    failures: FailureStore,
    settings: AnalysisSettings,
    instance_url: String,
}

impl ImageAnalysis {
    pub fn new(
        pool: Database,
        client: Arc<AnalysisClient>,
        settings: AnalysisSettings,
        instance_url: String,
    ) -> Self {
        let failures = FailureStore::new(pool.clone());
        Self { pool, client, failures, settings, instance_url }
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// 分析一个帖子下的所有符合条件的图片
    pub async fn process_post(&self, post_id: i64) -> Result<ProcessOutcome> {
        if !self.should_analyze_post(post_id).await? {
            return Ok(ProcessOutcome::Skipped);
        }
        let uploads = filter::eligible_uploads_of_post(
            &self.pool,
            &self.settings,
            post_id,
            &UploadFilterOpts {
                exclude_existing: !self.settings.force,
                include_partially_analyzed: true,
                max_retry_times: if self.settings.force { -1 } else { self.settings.max_retry_times },
            },
        )
        .await?;
        if uploads.is_empty() {
            return Ok(ProcessOutcome::NoImages);
        }
        if self.settings.max_images_per_post > 0
            && uploads.len() as i64 > self.settings.max_images_per_post
        {
            info!("帖子 {post_id} 包含 {} 张图片，超出单帖上限，跳过", uploads.len());
            return Ok(ProcessOutcome::TooManyImages);
        }
        let images = self.build_image_info(&uploads).await;
        if images.is_empty() {
            return Ok(ProcessOutcome::NoImages);
        }
        let outcome = self
            .analyze_images(&images, self.settings.analyze_ocr, self.settings.analyze_embedding)
            .await?;
        if self.settings.auto_flag_ocr && matches!(outcome, ProcessOutcome::Analyzed { .. }) {
            // 举报只是尽力而为，失败不影响已写入的分析结果
            if let Err(e) = self.check_for_flag(post_id).await {
                warn!("帖子 {post_id} 自动举报检查失败: {e}");
            }
        }
        Ok(outcome)
    }

    /// 分析单张图片，回填任务的入口
    pub async fn process_image(&self, upload_id: i64) -> Result<ProcessOutcome> {
        let upload = if self.settings.force {
            filter::get_upload(&self.pool, upload_id).await?
        } else {
            filter::eligible_upload(
                &self.pool,
                &self.settings,
                upload_id,
                &UploadFilterOpts {
                    exclude_existing: false,
                    include_partially_analyzed: true,
                    max_retry_times: self.settings.max_retry_times,
                },
            )
            .await?
        };
        let Some(upload) = upload else {
            return Ok(ProcessOutcome::Skipped);
        };
        let Some(sha1) = upload.content_sha1().map(str::to_string) else {
            return Ok(ProcessOutcome::Skipped);
        };

        let mut ocr = self.settings.analyze_ocr;
        let mut embedding = self.settings.analyze_embedding;
        if !self.settings.force {
            // 内容哈希去重：同样的字节在别的 upload 下已分析完则直接复制，不发请求
            let copied = sqlx::query(
                r#"
                INSERT INTO image_search_data (upload_id, sha1, ocr_text, ocr_text_search_data, embeddings, retry_times)
                SELECT $1, src.sha1, src.ocr_text, src.ocr_text_search_data, src.embeddings, 0
                FROM image_search_data src
                WHERE src.sha1 = $2 AND src.upload_id <> $1
                  AND src.ocr_text_search_data IS NOT NULL AND src.embeddings IS NOT NULL
                LIMIT 1
                ON CONFLICT (upload_id) DO UPDATE SET
                    ocr_text = COALESCE(EXCLUDED.ocr_text, image_search_data.ocr_text),
                    ocr_text_search_data = COALESCE(EXCLUDED.ocr_text_search_data, image_search_data.ocr_text_search_data),
                    embeddings = COALESCE(EXCLUDED.embeddings, image_search_data.embeddings),
                    retry_times = 0
                "#,
            )
            .bind(upload.id)
            .bind(&sha1)
            .execute(&self.pool)
            .await?;
            if copied.rows_affected() > 0 {
                info!("图片 {upload_id} 复用了相同内容的分析结果");
                return Ok(ProcessOutcome::Analyzed { succeeded: 1, failed: 0 });
            }

            // 已有的维度不再重复分析，只补齐缺失部分
            let existing: Option<ImageSearchDataRecord> = sqlx::query_as(
                r#"
                SELECT upload_id, sha1, ocr_text, retry_times,
                       ocr_text_search_data IS NOT NULL AS has_ocr_index,
                       embeddings IS NOT NULL AS has_embeddings
                FROM image_search_data WHERE upload_id = $1
                "#,
            )
            .bind(upload.id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(record) = existing {
                ocr = ocr && !record.has_ocr_index;
                embedding = embedding && !record.has_embeddings;
            }
            if !ocr && !embedding {
                return Ok(ProcessOutcome::Skipped);
            }
        }

        let images = self.build_image_info(std::slice::from_ref(&upload)).await;
        if images.is_empty() {
            return Ok(ProcessOutcome::NoImages);
        }
        self.analyze_images(&images, ocr, embedding).await
    }

    /// 把一批图片交给分析服务，逐张持久化结果
    ///
    /// 请求级失败整批视为失败但不计重试；200 响应内未成功的图片
    /// 逐张累加重试次数，成功的照常写入
    pub async fn analyze_images(
        &self,
        images: &[ImageInfo],
        ocr: bool,
        embedding: bool,
    ) -> Result<ProcessOutcome> {
        if images.is_empty() || (!ocr && !embedding) {
            return Ok(ProcessOutcome::Skipped);
        }
        let response = match self.client.analyze(images, ocr, embedding).await {
            Ok(response) => response,
            Err(e) => {
                warn!("分析请求失败: {e}");
                metrics::inc_analyze_request("failed");
                return Ok(ProcessOutcome::ServiceFailed);
            }
        };
        metrics::inc_analyze_request("ok");

        let upload_by_sha1: HashMap<&str, i64> =
            images.iter().map(|i| (i.sha1.as_str(), i.id)).collect();
        let mut succeeded_sha1 = HashSet::new();
        let mut persisted = 0usize;
        for image in &response.images {
            if !image.success {
                continue;
            }
            let Some(&upload_id) = upload_by_sha1.get(image.sha1.as_str()) else {
                continue;
            };
            succeeded_sha1.insert(image.sha1.as_str());
            // 重新读取记录，校验期间图片没有被替换
            let Some(upload) = filter::get_upload(&self.pool, upload_id).await? else {
                continue;
            };
            if self.save_analyzed_image_data(image, &upload, ocr, embedding).await? {
                persisted += 1;
            }
        }

        let failed = images.len() - succeeded_sha1.len();
        if self.settings.record_failed {
            for info in images {
                if !succeeded_sha1.contains(info.sha1.as_str()) {
                    self.record_failure(info.id, &info.sha1).await?;
                }
            }
        }
        metrics::inc_analyzed_images("ok", persisted as u64);
        metrics::inc_analyzed_images("failed", failed as u64);
        Ok(ProcessOutcome::Analyzed { succeeded: persisted, failed })
    }

    /// 写回单张图片的分析结果
    ///
    /// 返回的哈希与记录不一致说明请求期间发生了重新上传，
    /// 此时放弃写入；新值只覆盖对应维度，不清空旧数据
    async fn save_analyzed_image_data(
        &self,
        image: &AnalyzedImage,
        upload: &UploadRecord,
        ocr: bool,
        embedding: bool,
    ) -> Result<bool> {
        if !verify_response_sha1(upload, &image.sha1)? {
            return Ok(false);
        }

        let ocr_text = if ocr { image.ocr_result.as_ref().map(|lines| lines.join("\n")) } else { None };
        let search_text = ocr_text.as_deref().map(prepare_text);
        let embedding_literal =
            if embedding { image.embedding.as_deref().map(encode_vector) } else { None };
        if ocr_text.is_none() && embedding_literal.is_none() {
            return Ok(false);
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO image_search_data (upload_id, sha1, ocr_text, ocr_text_search_data, embeddings, retry_times)
            VALUES ($1, $2, $3, to_tsvector($4::regconfig, $5), $6::halfvec({EMBEDDING_DIM}), 0)
            ON CONFLICT (upload_id) DO UPDATE SET
                ocr_text = COALESCE(EXCLUDED.ocr_text, image_search_data.ocr_text),
                ocr_text_search_data = COALESCE(EXCLUDED.ocr_text_search_data, image_search_data.ocr_text_search_data),
                embeddings = COALESCE(EXCLUDED.embeddings, image_search_data.embeddings),
                retry_times = 0
            "#
        ))
        .bind(upload.id)
        .bind(&image.sha1)
        .bind(ocr_text)
        .bind(&self.settings.ts_config)
        .bind(search_text)
        .bind(embedding_literal)
        .execute(&self.pool)
        .await?;
        self.failures.clear(&image.sha1).await?;
        Ok(true)
    }

    /// 累加单张图片的失败计数
    async fn record_failure(&self, upload_id: i64, sha1: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_search_data (upload_id, sha1, retry_times)
            VALUES ($1, $2, 1)
            ON CONFLICT (upload_id) DO UPDATE SET
                retry_times = image_search_data.retry_times + 1
            "#,
        )
        .bind(upload_id)
        .bind(sha1)
        .execute(&self.pool)
        .await?;
        self.failures.increment(sha1).await?;
        Ok(())
    }

    /// 帖子图片的 OCR 文本命中违禁词时自动举报
    pub async fn check_for_flag(&self, post_id: i64) -> Result<()> {
        let ocr_text: Option<String> = sqlx::query_scalar(
            r#"
            SELECT string_agg(isd.ocr_text, E'\n')
            FROM image_search_data isd
            WHERE isd.ocr_text IS NOT NULL AND isd.sha1 IN (
                SELECT DISTINCT COALESCE(u.original_sha1, u.sha1)
                FROM uploads u
                JOIN post_uploads pu ON pu.upload_id = u.id
                WHERE pu.post_id = $1
            )
            "#,
        )
        .bind(post_id)
        .fetch_one(&self.pool)
        .await?;
        let Some(text) = ocr_text else {
            return Ok(());
        };

        let words: Vec<String> =
            sqlx::query_scalar("SELECT word FROM watched_words WHERE action = 'flag'")
                .fetch_all(&self.pool)
                .await?;
        let Some(matcher) = word_matcher(&words) else {
            return Ok(());
        };
        if matcher.is_match(&text) {
            sqlx::query(
                r#"
                INSERT INTO post_actions (post_id, user_id, post_action_type_id, created_at, updated_at)
                VALUES ($1, $2, $3, now(), now())
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(post_id)
            .bind(SYSTEM_USER_ID)
            .bind(POST_ACTION_TYPE_INAPPROPRIATE)
            .execute(&self.pool)
            .await?;
            info!("帖子 {post_id} 的图片文本命中违禁词，已自动举报");
        }
        Ok(())
    }

    async fn should_analyze_post(&self, post_id: i64) -> Result<bool> {
        if self.settings.force {
            return Ok(true);
        }
        filter::post_eligible(&self.pool, &self.settings, post_id).await
    }

    /// 构造请求体中的图片列表，单张图片的链接解析失败只跳过自身
    async fn build_image_info(&self, uploads: &[UploadRecord]) -> Vec<ImageInfo> {
        let mut images = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let Some(sha1) = upload.content_sha1() else {
                continue;
            };
            match self.extract_image_url(upload).await {
                Ok(url) => images.push(ImageInfo { id: upload.id, sha1: sha1.to_string(), url }),
                Err(e) => warn!("图片 {} 链接解析失败: {e}", upload.id),
            }
        }
        images
    }

    /// 得到可供分析服务获取的图片地址
    ///
    /// 受保护的图片没有公开可取的链接，与 base64 模式一样内联内容
    async fn extract_image_url(&self, upload: &UploadRecord) -> Result<String> {
        let resolved = resolve_upload_url(&self.instance_url, &upload.url);
        if self.settings.image_base64 || upload.secure {
            let bytes = self.client.fetch_image(&resolved).await?;
            let content_type = image_content_type(upload.extension.as_deref());
            Ok(image_data_uri(content_type, &bytes))
        } else {
            Ok(resolved)
        }
    }
}

/// 校验响应哈希与记录一致，不一致说明请求期间图片被替换
///
/// 生产环境记录警告并放弃写入，测试环境视为硬错误
fn verify_response_sha1(upload: &UploadRecord, response_sha1: &str) -> Result<bool> {
    let Some(expected) = upload.content_sha1() else {
        return Ok(false);
    };
    if expected != response_sha1 {
        if cfg!(test) {
            bail!("图片内容哈希不一致: {} != {}", expected, response_sha1);
        }
        warn!("图片 {} 内容哈希不一致: {} != {}，跳过写入", upload.id, expected, response_sha1);
        return Ok(false);
    }
    Ok(true)
}

/// 扩展名对应的 MIME 类型
fn image_content_type(extension: Option<&str>) -> &'static str {
    match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

static WORD_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// 把违禁词表编译为一个整词匹配的正则，`*` 作为词内通配符
pub fn word_matcher(words: &[String]) -> Option<Regex> {
    let patterns: Vec<String> = words
        .iter()
        .map(|w| WORD_SEPARATOR.replace_all(w.trim(), " ").to_string())
        .filter(|w| !w.is_empty())
        .map(|w| regex::escape(&w).replace(r"\*", r"\w*"))
        .collect();
    if patterns.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", patterns.join("|"))).ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn word_matcher_matches_whole_words() {
        let re = word_matcher(&words(&["spam", "scam"])).unwrap();
        assert!(re.is_match("this is SPAM text"));
        assert!(re.is_match("a scam!"));
        assert!(!re.is_match("spammer"));
    }

    #[test]
    fn word_matcher_supports_wildcard() {
        let re = word_matcher(&words(&["spam*"])).unwrap();
        assert!(re.is_match("spammer strikes again"));
        assert!(!re.is_match("antispam"));
    }

    #[test]
    fn word_matcher_empty_list() {
        assert!(word_matcher(&[]).is_none());
        assert!(word_matcher(&words(&["  "])).is_none());
    }

    #[rstest]
    #[case(Some("jpg"), "image/jpeg")]
    #[case(Some("JPEG"), "image/jpeg")]
    #[case(Some("png"), "image/png")]
    #[case(Some("webp"), "image/webp")]
    #[case(Some("bmp"), "application/octet-stream")]
    #[case(None, "application/octet-stream")]
    fn content_type_by_extension(#[case] ext: Option<&str>, #[case] expected: &str) {
        assert_eq!(image_content_type(ext), expected);
    }

    fn upload(sha1: Option<&str>, original_sha1: Option<&str>) -> UploadRecord {
        UploadRecord {
            id: 1,
            sha1: sha1.map(str::to_string),
            original_sha1: original_sha1.map(str::to_string),
            url: "/uploads/x.jpg".to_string(),
            original_filename: "x.jpg".to_string(),
            extension: Some("jpg".to_string()),
            secure: false,
        }
    }

    #[test]
    fn sha1_match_allows_write() {
        assert!(verify_response_sha1(&upload(Some("abc"), None), "abc").unwrap());
        // 重新编码过的图片以原始哈希为准
        assert!(verify_response_sha1(&upload(Some("abc"), Some("def")), "def").unwrap());
    }

    #[test]
    fn sha1_mismatch_is_fatal_under_test() {
        assert!(verify_response_sha1(&upload(Some("abc"), None), "zzz").is_err());
        assert!(verify_response_sha1(&upload(Some("abc"), Some("def")), "abc").is_err());
    }

    #[test]
    fn missing_sha1_skips_write() {
        assert!(!verify_response_sha1(&upload(None, None), "abc").unwrap());
    }

    #[test]
    fn outcome_failure_classification() {
        assert!(ProcessOutcome::ServiceFailed.is_failure());
        assert!(!ProcessOutcome::Skipped.is_failure());
        assert!(!ProcessOutcome::Analyzed { succeeded: 0, failed: 3 }.is_failure());
    }
}
