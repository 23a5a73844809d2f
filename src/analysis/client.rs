use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::config::ServiceOptions;

/// 请求体里单张图片的描述
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub id: i64,
    pub sha1: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    images: &'a [ImageInfo],
    ocr: bool,
    embedding: bool,
}

/// 分析服务返回的单张图片结果
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzedImage {
    pub sha1: String,
    pub success: bool,
    /// OCR 识别出的文本行，顺序即版面顺序
    #[serde(default)]
    pub ocr_result: Option<Vec<String>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeResponse {
    pub images: Vec<AnalyzedImage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    success: bool,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

/// 外部分析服务的 HTTP 客户端
///
/// 连接与总超时都在构造时固定，超时与传输错误不在此处区分，
/// 统一以 Err 交由调用方降级
pub struct AnalysisClient {
    http: Client,
    endpoint: Url,
    instance_url: String,
    api_key: String,
}

impl AnalysisClient {
    pub fn new(opts: &ServiceOptions) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(opts.timeout))
            .connect_timeout(Duration::from_secs(opts.connect_timeout))
            .user_agent(concat!("imboard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut endpoint = Url::parse(&opts.service_endpoint)?;
        // join 会替换掉不以斜杠结尾的最后一段路径
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            http,
            endpoint,
            instance_url: opts.instance_url.clone(),
            api_key: opts.service_key.clone(),
        })
    }

    /// 批量分析图片，非 200 状态与传输错误都转换为 Err
    pub async fn analyze(
        &self,
        images: &[ImageInfo],
        ocr: bool,
        embedding: bool,
    ) -> Result<AnalyzeResponse> {
        let url = self.endpoint.join("analyze/")?;
        let body = serde_json::to_string(&AnalyzeRequest { images, ocr, embedding })?;
        let response =
            self.http.post(url).headers(self.json_headers(body.len())?).body(body).send().await?;
        let status = response.status();
        if status.as_u16() != 200 {
            let text = response.text().await.unwrap_or_default();
            bail!("分析服务返回 {}: {}", status, snippet(&text));
        }
        Ok(response.json().await?)
    }

    pub async fn text_embedding(&self, text: &str) -> Result<Vec<f32>> {
        self.embedding_request("text_embedding/", &serde_json::json!({ "text": text })).await
    }

    /// 图片以 base64 data URI 形式发送
    pub async fn image_embedding(&self, data_uri: &str) -> Result<Vec<f32>> {
        self.embedding_request("image_embedding/", &serde_json::json!({ "image": data_uri })).await
    }

    async fn embedding_request(&self, path: &str, body: &serde_json::Value) -> Result<Vec<f32>> {
        let url = self.endpoint.join(path)?;
        let body = serde_json::to_string(body)?;
        let response =
            self.http.post(url).headers(self.json_headers(body.len())?).body(body).send().await?;
        let status = response.status();
        if status.as_u16() != 200 {
            let text = response.text().await.unwrap_or_default();
            bail!("embedding 请求返回 {}: {}", status, snippet(&text));
        }
        let result: EmbeddingResponse = response.json().await?;
        if !result.success {
            bail!("embedding 请求未成功");
        }
        result.embedding.ok_or_else(|| anyhow!("embedding 响应缺少向量"))
    }

    /// 下载图片内容，用于 base64 内联模式
    pub async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status.as_u16() != 200 {
            bail!("下载图片失败 {}: {}", status, url);
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn json_headers(&self, content_length: usize) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
        headers.insert("x-forum-instance", HeaderValue::from_str(&self.instance_url)?);
        if !self.api_key.is_empty() {
            headers.insert("api-key", HeaderValue::from_str(&self.api_key)?);
        }
        Ok(headers)
    }
}

/// 截取响应体前缀用于日志
fn snippet(body: &str) -> &str {
    let mut end = body.len().min(200);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let long = "错".repeat(100);
        let cut = snippet(&long);
        assert!(cut.len() <= 200);
        assert!(long.starts_with(cut));
        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn analyze_request_shape() {
        let images = vec![ImageInfo {
            id: 7,
            sha1: "abc".to_string(),
            url: "https://example.com/x.jpg".to_string(),
        }];
        let body =
            serde_json::to_value(AnalyzeRequest { images: &images, ocr: true, embedding: false })
                .unwrap();
        assert_eq!(body["images"][0]["sha1"], "abc");
        assert_eq!(body["ocr"], true);
        assert_eq!(body["embedding"], false);
    }

    #[test]
    fn analyzed_image_tolerates_missing_fields() {
        let parsed: AnalyzedImage =
            serde_json::from_str(r#"{"sha1": "abc", "success": false}"#).unwrap();
        assert!(!parsed.success);
        assert!(parsed.ocr_result.is_none());
        assert!(parsed.embedding.is_none());
    }
}
