//! 查询向量的获取与缓存
//!
//! 文本与图片的 embedding 都由外部分析服务计算，这里按内容哈希
//! 做短暂缓存，避免翻页或重复搜索时反复调用。相同键的并发请求
//! 不做合并：TTL 很短，多出的一次外部调用可以接受。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::debug;

use crate::analysis::AnalysisClient;
use crate::utils::image_data_uri;

struct EmbedCache {
    ttl: Duration,
    entries: HashMap<String, (Instant, Vec<f32>)>,
}

impl EmbedCache {
    fn new(ttl: Duration) -> Self {
        Self { ttl, entries: HashMap::new() }
    }

    fn get(&self, key: &str, now: Instant) -> Option<Vec<f32>> {
        let (stored_at, value) = self.entries.get(key)?;
        if now.duration_since(*stored_at) < self.ttl { Some(value.clone()) } else { None }
    }

    fn insert(&mut self, key: String, value: Vec<f32>, now: Instant) {
        // 顺手清掉过期条目，缓存规模与活跃查询数同阶
        self.entries.retain(|_, (stored_at, _)| now.duration_since(*stored_at) < self.ttl);
        self.entries.insert(key, (now, value));
    }
}

pub struct Embedder {
    client: Arc<AnalysisClient>,
    cache: Mutex<EmbedCache>,
}

impl Embedder {
    pub fn new(client: Arc<AnalysisClient>, ttl: Duration) -> Self {
        Self { client, cache: Mutex::new(EmbedCache::new(ttl)) }
    }

    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let key = format!("text_embedding_{}", blake3::hash(text.as_bytes()).to_hex());
        self.embed_cached(key, || self.client.text_embedding(text)).await
    }

    pub async fn embed_image(&self, bytes: &[u8], content_type: &str) -> Result<Vec<f32>> {
        let key = format!("image_embedding_{}", blake3::hash(bytes).to_hex());
        let data_uri = image_data_uri(content_type, bytes);
        self.embed_cached(key, || self.client.image_embedding(&data_uri)).await
    }

    async fn embed_cached<F, Fut>(&self, key: String, request: F) -> Result<Vec<f32>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>>>,
    {
        if let Some(hit) = self.cache.lock().expect("embedding 缓存锁被毒化").get(&key, Instant::now())
        {
            debug!("embedding 缓存命中: {key}");
            return Ok(hit);
        }
        let embedding = request().await?;
        self.cache
            .lock()
            .expect("embedding 缓存锁被毒化")
            .insert(key, embedding.clone(), Instant::now());
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_within_ttl() {
        let mut cache = EmbedCache::new(Duration::from_secs(300));
        let now = Instant::now();
        cache.insert("k".to_string(), vec![1.0, 2.0], now);
        assert_eq!(cache.get("k", now + Duration::from_secs(299)), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn cache_expires_after_ttl() {
        let mut cache = EmbedCache::new(Duration::from_secs(300));
        let now = Instant::now();
        cache.insert("k".to_string(), vec![1.0], now);
        assert_eq!(cache.get("k", now + Duration::from_secs(300)), None);
    }

    #[test]
    fn insert_prunes_expired_entries() {
        let mut cache = EmbedCache::new(Duration::from_secs(10));
        let now = Instant::now();
        cache.insert("old".to_string(), vec![1.0], now);
        cache.insert("new".to_string(), vec![2.0], now + Duration::from_secs(11));
        assert!(!cache.entries.contains_key("old"));
        assert!(cache.entries.contains_key("new"));
    }
}
