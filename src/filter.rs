//! 帖子与图片的可分析性筛选
//!
//! 所有函数只负责声明式地拼装查询，自身不做任何兜底处理，
//! 数据库错误由调用方向上传播。用户输入一律通过绑定参数传入。

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use sqlx::{Postgres, QueryBuilder};

use crate::config::AnalysisSettings;
use crate::db::{Database, UploadRecord};

/// 支持分析的图片扩展名
pub static SUPPORTED_IMAGES: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// 文件名匹配用的正则，大小写不敏感
static SUPPORTED_IMAGES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\.({})$", SUPPORTED_IMAGES.join("|"))).unwrap());

/// SQL `~*` 匹配用的同一模式
pub fn supported_images_pattern() -> String {
    format!(r"\.({})$", SUPPORTED_IMAGES.join("|"))
}

pub fn supported_image(filename: &str) -> bool {
    SUPPORTED_IMAGES_RE.is_match(filename)
}

/// 图片尺寸与体积是否在可分析范围内
pub fn upload_dimensions_ok(
    settings: &AnalysisSettings,
    width: i32,
    height: i32,
    filesize: i64,
) -> bool {
    filesize <= settings.max_image_size_kb * 1024
        && width >= settings.min_image_width
        && height >= settings.min_image_height
}

/// filter_upload 的可选条件
#[derive(Debug, Clone, Copy)]
pub struct UploadFilterOpts {
    /// 排除已有搜索数据的图片
    pub exclude_existing: bool,
    /// 只排除所有维度都已分析完的图片，用于补齐缺失维度
    pub include_partially_analyzed: bool,
    /// 达到该次数的图片不再重试，负数表示忽略重试记录
    pub max_retry_times: i32,
}

/// 需要分析的维度，关闭的维度不触发重新分析
#[derive(Debug, Clone, Copy)]
pub struct AnalysisDims {
    pub ocr: bool,
    pub embedding: bool,
}

impl AnalysisDims {
    pub fn from_settings(settings: &AnalysisSettings) -> Self {
        Self { ocr: settings.analyze_ocr, embedding: settings.analyze_embedding }
    }
}

/// 追加帖子可见性条件，要求 FROM 中已有 posts/topics/categories
pub fn push_post_conditions(qb: &mut QueryBuilder<'_, Postgres>, settings: &AnalysisSettings) {
    qb.push(" AND posts.deleted_at IS NULL AND NOT posts.hidden");
    qb.push(" AND topics.deleted_at IS NULL AND topics.visible");
    qb.push(" AND topics.archetype = 'regular'");
    qb.push(" AND NOT categories.read_restricted");
    if !settings.ignored_categories.is_empty() {
        qb.push(" AND NOT (categories.id = ANY(")
            .push_bind(settings.ignored_categories.clone())
            .push("))");
    }
    if settings.tagging_enabled && !settings.ignored_tags.is_empty() {
        qb.push(" AND NOT EXISTS (")
            .push("SELECT 1 FROM topic_tags")
            .push(" INNER JOIN tags ON topic_tags.tag_id = tags.id")
            .push(" WHERE topic_tags.topic_id = topics.id AND tags.name = ANY(")
            .push_bind(settings.ignored_tags.clone())
            .push("))");
    }
}

/// 追加图片筛选条件，要求 FROM 中已有 uploads，
/// 且以 `LEFT JOIN image_search_data AS isd` 连接搜索数据
pub fn push_upload_conditions(
    qb: &mut QueryBuilder<'_, Postgres>,
    settings: &AnalysisSettings,
    opts: &UploadFilterOpts,
) {
    qb.push(" AND uploads.filesize <= ").push_bind(settings.max_image_size_kb * 1024);
    qb.push(" AND uploads.width >= ").push_bind(settings.min_image_width);
    qb.push(" AND uploads.height >= ").push_bind(settings.min_image_height);
    qb.push(" AND uploads.original_filename ~* ").push_bind(supported_images_pattern());
    qb.push(" AND uploads.id NOT IN (SELECT upload_id FROM custom_emojis WHERE upload_id IS NOT NULL)");
    if opts.exclude_existing {
        if opts.include_partially_analyzed {
            qb.push(" AND (isd.upload_id IS NULL");
            qb.push(" OR isd.ocr_text_search_data IS NULL");
            qb.push(" OR isd.embeddings IS NULL)");
        } else {
            qb.push(" AND (isd.upload_id IS NULL");
            qb.push(" OR (isd.ocr_text_search_data IS NULL AND isd.embeddings IS NULL))");
        }
    }
    if opts.max_retry_times >= 0 {
        qb.push(" AND (isd.retry_times IS NULL OR isd.retry_times < ")
            .push_bind(opts.max_retry_times)
            .push(")");
    }
}

/// 拼装 uploads_need_analysis 的完整 SELECT，可内嵌为子查询
fn push_uploads_need_analysis(
    qb: &mut QueryBuilder<'_, Postgres>,
    settings: &AnalysisSettings,
    opts: &UploadFilterOpts,
    dims: &AnalysisDims,
) {
    qb.push("SELECT DISTINCT uploads.id FROM uploads");
    qb.push(" JOIN post_uploads ON post_uploads.upload_id = uploads.id");
    qb.push(" JOIN posts ON posts.id = post_uploads.post_id");
    qb.push(" JOIN topics ON topics.id = posts.topic_id");
    qb.push(" JOIN categories ON categories.id = topics.category_id");
    qb.push(" LEFT JOIN image_search_data AS isd ON isd.upload_id = uploads.id");
    qb.push(" WHERE TRUE");
    push_upload_conditions(qb, settings, opts);
    push_post_conditions(qb, settings);
    if opts.exclude_existing {
        // 只有某个已启用的维度缺失时才需要分析，全部关闭则为空集
        qb.push(" AND (0=1");
        if dims.ocr {
            qb.push(" OR isd.ocr_text_search_data IS NULL");
        }
        if dims.embedding {
            qb.push(" OR isd.embeddings IS NULL");
        }
        qb.push(")");
    }
}

/// 有待分析图片的可见帖子，按图片数量上限截断
pub async fn posts_need_analysis(
    pool: &Database,
    settings: &AnalysisSettings,
    exclude_existing: bool,
) -> Result<Vec<i64>> {
    let mut qb = QueryBuilder::new("SELECT posts.id FROM posts");
    qb.push(" JOIN topics ON topics.id = posts.topic_id");
    qb.push(" JOIN categories ON categories.id = topics.category_id");
    qb.push(" JOIN post_uploads ON post_uploads.post_id = posts.id");
    qb.push(" JOIN uploads ON uploads.id = post_uploads.upload_id");
    qb.push(" LEFT JOIN image_search_data AS isd ON isd.upload_id = uploads.id");
    qb.push(" WHERE TRUE");
    push_post_conditions(&mut qb, settings);
    push_upload_conditions(
        &mut qb,
        settings,
        &UploadFilterOpts {
            exclude_existing,
            include_partially_analyzed: false,
            max_retry_times: settings.max_retry_times,
        },
    );
    qb.push(" GROUP BY posts.id HAVING COUNT(uploads.id) > 0");
    if settings.max_images_per_post > 0 {
        // 上限按帖子附带的全部图片数计算，过大的帖子整体跳过，
        // 避免单次分析请求的体积不可控
        qb.push(" AND (SELECT COUNT(*) FROM post_uploads pu2 WHERE pu2.post_id = posts.id) <= ")
            .push_bind(settings.max_images_per_post);
    }
    qb.push(" ORDER BY posts.id DESC");
    Ok(qb.build_query_scalar::<i64>().fetch_all(pool).await?)
}

/// 属于可见帖子且有维度缺失的图片，回填任务的上传视角入口
pub async fn uploads_need_analysis(
    pool: &Database,
    settings: &AnalysisSettings,
    exclude_existing: bool,
) -> Result<Vec<i64>> {
    let mut qb = QueryBuilder::new("");
    push_uploads_need_analysis(
        &mut qb,
        settings,
        &UploadFilterOpts {
            exclude_existing,
            include_partially_analyzed: true,
            max_retry_times: settings.max_retry_times,
        },
        &AnalysisDims::from_settings(settings),
    );
    Ok(qb.build_query_scalar::<i64>().fetch_all(pool).await?)
}

/// 已不属于任何可见可分析图片的搜索数据，即待清理的孤儿行
///
/// 判定时关闭存在性排除并忽略重试记录：只要图片本身还在范围内，
/// 即使已经分析完或重试耗尽，数据也应保留
pub async fn image_search_data_need_remove(
    pool: &Database,
    settings: &AnalysisSettings,
) -> Result<Vec<(i64, String)>> {
    let mut qb = QueryBuilder::new(
        "SELECT image_search_data.upload_id, image_search_data.sha1 FROM image_search_data WHERE image_search_data.upload_id NOT IN (",
    );
    push_uploads_need_analysis(
        &mut qb,
        settings,
        &UploadFilterOpts {
            exclude_existing: false,
            include_partially_analyzed: true,
            max_retry_times: -1,
        },
        &AnalysisDims { ocr: true, embedding: true },
    );
    qb.push(")");
    Ok(qb.build_query_as::<(i64, String)>().fetch_all(pool).await?)
}

/// 单个帖子是否通过可见性筛选
pub async fn post_eligible(
    pool: &Database,
    settings: &AnalysisSettings,
    post_id: i64,
) -> Result<bool> {
    let mut qb = QueryBuilder::new("SELECT EXISTS (SELECT 1 FROM posts");
    qb.push(" JOIN topics ON topics.id = posts.topic_id");
    qb.push(" JOIN categories ON categories.id = topics.category_id");
    qb.push(" WHERE posts.id = ");
    qb.push_bind(post_id);
    push_post_conditions(&mut qb, settings);
    qb.push(")");
    Ok(qb.build_query_scalar::<bool>().fetch_one(pool).await?)
}

const UPLOAD_COLUMNS: &str = "uploads.id, uploads.sha1, uploads.original_sha1, uploads.url, uploads.original_filename, uploads.extension, uploads.secure";

/// 帖子下通过筛选的图片列表
pub async fn eligible_uploads_of_post(
    pool: &Database,
    settings: &AnalysisSettings,
    post_id: i64,
    opts: &UploadFilterOpts,
) -> Result<Vec<UploadRecord>> {
    let mut qb = QueryBuilder::new(format!("SELECT {UPLOAD_COLUMNS} FROM uploads"));
    qb.push(" JOIN post_uploads ON post_uploads.upload_id = uploads.id");
    qb.push(" LEFT JOIN image_search_data AS isd ON isd.upload_id = uploads.id");
    qb.push(" WHERE post_uploads.post_id = ");
    qb.push_bind(post_id);
    push_upload_conditions(&mut qb, settings, opts);
    qb.push(" ORDER BY uploads.id");
    Ok(qb.build_query_as::<UploadRecord>().fetch_all(pool).await?)
}

/// 单张图片通过筛选时返回其记录
pub async fn eligible_upload(
    pool: &Database,
    settings: &AnalysisSettings,
    upload_id: i64,
    opts: &UploadFilterOpts,
) -> Result<Option<UploadRecord>> {
    let mut qb = QueryBuilder::new(format!("SELECT {UPLOAD_COLUMNS} FROM uploads"));
    qb.push(" LEFT JOIN image_search_data AS isd ON isd.upload_id = uploads.id");
    qb.push(" WHERE uploads.id = ");
    qb.push_bind(upload_id);
    push_upload_conditions(&mut qb, settings, opts);
    Ok(qb.build_query_as::<UploadRecord>().fetch_optional(pool).await?)
}

/// 不做任何筛选地读取图片记录，用于强制分析
pub async fn get_upload(pool: &Database, upload_id: i64) -> Result<Option<UploadRecord>> {
    let record = sqlx::query_as::<_, UploadRecord>(
        "SELECT id, sha1, original_sha1, url, original_filename, extension, secure FROM uploads WHERE id = $1",
    )
    .bind(upload_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// 给定哈希集合中仍可能被重试的部分，用于修剪失败计数
pub async fn retryable_sha1s(
    pool: &Database,
    settings: &AnalysisSettings,
    sha1s: &[String],
) -> Result<Vec<String>> {
    let mut qb = QueryBuilder::new(
        "SELECT DISTINCT COALESCE(uploads.original_sha1, uploads.sha1) FROM uploads",
    );
    qb.push(" LEFT JOIN image_search_data AS isd ON isd.upload_id = uploads.id");
    qb.push(" WHERE COALESCE(uploads.original_sha1, uploads.sha1) = ANY(");
    qb.push_bind(sha1s.to_vec());
    qb.push(")");
    push_upload_conditions(
        &mut qb,
        settings,
        &UploadFilterOpts {
            exclude_existing: false,
            include_partially_analyzed: true,
            max_retry_times: -1,
        },
    );
    Ok(qb.build_query_scalar::<String>().fetch_all(pool).await?)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::rstest;

    use super::*;
    use crate::config::AnalysisOptions;

    fn settings() -> AnalysisSettings {
        AnalysisOptions::parse_from(["test"]).resolve(false)
    }

    #[rstest]
    #[case("photo.jpg", true)]
    #[case("photo.JPEG", true)]
    #[case("x.PNG", true)]
    #[case("anim.webp", true)]
    #[case("anim.gif", false)]
    #[case("doc.pdf", false)]
    #[case("jpg", false)]
    fn supported_image_extensions(#[case] filename: &str, #[case] expected: bool) {
        assert_eq!(supported_image(filename), expected);
    }

    #[test]
    fn dimensions_within_limits() {
        // 150x150、500KB，默认上限 1024KB、下限 100x100
        assert!(upload_dimensions_ok(&settings(), 150, 150, 500 * 1024));
    }

    #[test]
    fn dimensions_oversized_file() {
        assert!(!upload_dimensions_ok(&settings(), 150, 150, 2048 * 1024));
    }

    #[test]
    fn dimensions_too_small() {
        assert!(!upload_dimensions_ok(&settings(), 99, 150, 1024));
        assert!(!upload_dimensions_ok(&settings(), 150, 99, 1024));
    }

    #[test]
    fn retry_sentinel_disables_condition() {
        let settings = settings();
        let opts = UploadFilterOpts {
            exclude_existing: false,
            include_partially_analyzed: false,
            max_retry_times: -1,
        };
        let mut qb = QueryBuilder::new("SELECT 1 FROM uploads WHERE TRUE");
        push_upload_conditions(&mut qb, &settings, &opts);
        assert!(!qb.sql().contains("retry_times"));

        let mut qb = QueryBuilder::new("SELECT 1 FROM uploads WHERE TRUE");
        push_upload_conditions(&mut qb, &settings, &UploadFilterOpts { max_retry_times: 3, ..opts });
        assert!(qb.sql().contains("isd.retry_times < "));
    }

    #[test]
    fn partial_analysis_weakens_exclusion() {
        // 补齐模式下只排除全部维度齐备的图片
        let settings = settings();
        let mut qb = QueryBuilder::new("SELECT 1 FROM uploads WHERE TRUE");
        push_upload_conditions(
            &mut qb,
            &settings,
            &UploadFilterOpts {
                exclude_existing: true,
                include_partially_analyzed: true,
                max_retry_times: -1,
            },
        );
        assert!(qb.sql().contains(" OR isd.embeddings IS NULL)"));

        let mut qb = QueryBuilder::new("SELECT 1 FROM uploads WHERE TRUE");
        push_upload_conditions(
            &mut qb,
            &settings,
            &UploadFilterOpts {
                exclude_existing: true,
                include_partially_analyzed: false,
                max_retry_times: -1,
            },
        );
        assert!(qb.sql().contains("isd.ocr_text_search_data IS NULL AND isd.embeddings IS NULL"));
    }

    #[test]
    fn ignored_tags_only_when_tagging_enabled() {
        let mut s = settings();
        s.ignored_tags = vec!["nsfw".to_string()];
        let mut qb = QueryBuilder::new("SELECT 1 FROM posts WHERE TRUE");
        push_post_conditions(&mut qb, &s);
        assert!(qb.sql().contains("topic_tags"));

        s.tagging_enabled = false;
        let mut qb = QueryBuilder::new("SELECT 1 FROM posts WHERE TRUE");
        push_post_conditions(&mut qb, &s);
        assert!(!qb.sql().contains("topic_tags"));
    }
}
