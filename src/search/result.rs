//! 搜索结果的装配
//!
//! 命中的 (post, upload) 对按原有名次补全展示所需的实体。
//! 批量读取是无序的，装配时按名次重新对位，读取瞬间已被删除的
//! 实体直接跳过，不视为错误。

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::{Database, OptimizedImageSummary, PostSummary, UploadSummary};

/// 一条搜索结果，帖子与图片成对出现
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GroupedResult {
    pub post: PostView,
    pub user: UserView,
    pub topic: TopicView,
    pub image: ImageView,
    pub optimized_images: Vec<OptimizedImageView>,
    /// 站内跳转地址
    pub link_target: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PostView {
    pub id: i64,
    pub post_number: i32,
    pub topic_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserView {
    pub id: i64,
    pub username: String,
    pub name: Option<String>,
    pub avatar_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TopicView {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub category_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ImageView {
    pub id: i64,
    pub url: String,
    pub width: i32,
    pub height: i32,
    pub extension: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OptimizedImageView {
    pub url: String,
    pub width: i32,
    pub height: i32,
}

/// 搜索响应整体
#[derive(Debug, Serialize, ToSchema)]
pub struct ImageSearchResult {
    pub term: String,
    pub processed_term: String,
    pub search_ocr: bool,
    pub search_embeddings: bool,
    pub search_by_image: bool,
    pub page: usize,
    pub limit: usize,
    pub has_more: bool,
    pub grouped_results: Vec<GroupedResult>,
}

/// 按名次成对补全帖子与图片
pub async fn assemble(
    pool: &Database,
    posts_id: &[i64],
    uploads_id: &[i64],
) -> Result<Vec<GroupedResult>> {
    if posts_id.is_empty() {
        return Ok(Vec::new());
    }
    let posts: Vec<PostSummary> = sqlx::query_as(
        r#"
        SELECT posts.id, posts.post_number, posts.topic_id, posts.created_at, posts.user_id,
               users.username, users.name AS user_name, users.avatar_template,
               topics.title AS topic_title, topics.slug AS topic_slug, topics.category_id
        FROM posts
        JOIN users ON users.id = posts.user_id
        JOIN topics ON topics.id = posts.topic_id
        WHERE posts.id = ANY($1)
        "#,
    )
    .bind(posts_id.to_vec())
    .fetch_all(pool)
    .await?;

    let uploads: Vec<UploadSummary> =
        sqlx::query_as("SELECT id, url, width, height, extension FROM uploads WHERE id = ANY($1)")
            .bind(uploads_id.to_vec())
            .fetch_all(pool)
            .await?;

    let optimized: Vec<OptimizedImageSummary> = sqlx::query_as(
        "SELECT upload_id, url, width, height FROM optimized_images WHERE upload_id = ANY($1)",
    )
    .bind(uploads_id.to_vec())
    .fetch_all(pool)
    .await?;

    Ok(zip_results(posts_id, uploads_id, &posts, &uploads, &optimized))
}

/// 无序的批量读取结果按名次重新对位，缺失的实体跳过
fn zip_results(
    posts_id: &[i64],
    uploads_id: &[i64],
    posts: &[PostSummary],
    uploads: &[UploadSummary],
    optimized: &[OptimizedImageSummary],
) -> Vec<GroupedResult> {
    let posts_by_id: HashMap<i64, &PostSummary> = posts.iter().map(|p| (p.id, p)).collect();
    let uploads_by_id: HashMap<i64, &UploadSummary> = uploads.iter().map(|u| (u.id, u)).collect();
    let mut optimized_by_upload: HashMap<i64, Vec<&OptimizedImageSummary>> = HashMap::new();
    for image in optimized {
        optimized_by_upload.entry(image.upload_id).or_default().push(image);
    }

    posts_id
        .iter()
        .zip(uploads_id)
        .filter_map(|(post_id, upload_id)| {
            let post = posts_by_id.get(post_id)?;
            let upload = uploads_by_id.get(upload_id)?;
            let optimized_images = optimized_by_upload
                .get(upload_id)
                .map(|images| {
                    images
                        .iter()
                        .map(|o| OptimizedImageView {
                            url: o.url.clone(),
                            width: o.width,
                            height: o.height,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(GroupedResult {
                post: PostView {
                    id: post.id,
                    post_number: post.post_number,
                    topic_id: post.topic_id,
                    created_at: post.created_at,
                },
                user: UserView {
                    id: post.user_id,
                    username: post.username.clone(),
                    name: post.user_name.clone(),
                    avatar_template: post.avatar_template.clone(),
                },
                topic: TopicView {
                    id: post.topic_id,
                    title: post.topic_title.clone(),
                    slug: post.topic_slug.clone(),
                    category_id: post.category_id,
                },
                image: ImageView {
                    id: upload.id,
                    url: upload.url.clone(),
                    width: upload.width,
                    height: upload.height,
                    extension: upload.extension.clone(),
                },
                optimized_images,
                link_target: format!("/t/{}/{}/{}", post.topic_slug, post.topic_id, post.post_number),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: i64) -> PostSummary {
        PostSummary {
            id,
            post_number: 2,
            topic_id: id * 10,
            created_at: Utc::now(),
            user_id: 1,
            username: "alice".to_string(),
            user_name: None,
            avatar_template: None,
            topic_title: "话题".to_string(),
            topic_slug: "topic".to_string(),
            category_id: Some(3),
        }
    }

    fn upload(id: i64) -> UploadSummary {
        UploadSummary {
            id,
            url: format!("/uploads/{id}.jpg"),
            width: 200,
            height: 100,
            extension: Some("jpg".to_string()),
        }
    }

    #[test]
    fn zip_preserves_ranked_order() {
        // 批量读取按主键返回，装配必须回到名次顺序
        let posts = vec![post(1), post(2), post(3)];
        let uploads = vec![upload(10), upload(20), upload(30)];
        let zipped = zip_results(&[3, 1, 2], &[30, 10, 20], &posts, &uploads, &[]);
        let ids: Vec<(i64, i64)> = zipped.iter().map(|g| (g.post.id, g.image.id)).collect();
        assert_eq!(ids, vec![(3, 30), (1, 10), (2, 20)]);
    }

    #[test]
    fn zip_skips_missing_entities() {
        let posts = vec![post(1)];
        let uploads = vec![upload(10), upload(20)];
        let zipped = zip_results(&[1, 2], &[10, 20], &posts, &uploads, &[]);
        assert_eq!(zipped.len(), 1);
        assert_eq!(zipped[0].post.id, 1);
    }

    #[test]
    fn zip_attaches_optimized_images() {
        let posts = vec![post(1)];
        let uploads = vec![upload(10)];
        let optimized = vec![OptimizedImageSummary {
            upload_id: 10,
            url: "/optimized/10.jpg".to_string(),
            width: 100,
            height: 50,
        }];
        let zipped = zip_results(&[1], &[10], &posts, &uploads, &optimized);
        assert_eq!(zipped[0].optimized_images.len(), 1);
        assert_eq!(zipped[0].link_target, "/t/topic/10/2");
    }
}
