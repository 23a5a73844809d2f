use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indicatif::ProgressStyle;

/// 进度条样式
pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .expect("进度条模板不合法")
    .progress_chars("=>-")
}

/// 清洗写入全文索引或查询的文本：去掉 NUL 并压缩空白
pub fn prepare_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.replace('\0', ""))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 把查询词转换为 tsquery 表达式，整体作为绑定参数传给 to_tsquery
///
/// 词位用单引号包裹并做转义，因此词本身不会被当作语法解析
pub fn ts_query_expression(term: &str) -> String {
    prepare_text(term)
        .split_whitespace()
        .map(|word| format!("'{}'", word.replace('\\', "\\\\").replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(" & ")
}

/// 补全图片链接：协议相对与站内相对路径都以论坛地址为准
pub fn resolve_upload_url(instance_url: &str, url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else if url.starts_with('/') {
        format!("{}{}", instance_url.trim_end_matches('/'), url)
    } else {
        url.to_string()
    }
}

/// 构造 data URI，用于内联发送图片内容
pub fn image_data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn prepare_text_normalizes_whitespace() {
        assert_eq!(prepare_text("  cat \t dog\ncar  "), "cat dog car");
        assert_eq!(prepare_text("a\0b"), "ab");
        assert_eq!(prepare_text("   "), "");
    }

    #[test]
    fn ts_query_quotes_lexemes() {
        assert_eq!(ts_query_expression("cat dog"), "'cat' & 'dog'");
        assert_eq!(ts_query_expression("it's"), "'it''s'");
        assert_eq!(ts_query_expression(""), "");
    }

    #[rstest]
    #[case("//cdn.example.com/a.jpg", "https://cdn.example.com/a.jpg")]
    #[case("/uploads/a.jpg", "https://forum.example.com/uploads/a.jpg")]
    #[case("https://other.com/a.jpg", "https://other.com/a.jpg")]
    fn resolve_upload_url_cases(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(resolve_upload_url("https://forum.example.com/", url), expected);
    }

    #[test]
    fn image_data_uri_shape() {
        let uri = image_data_uri("image/png", b"abc");
        assert_eq!(uri, "data:image/png;base64,YWJj");
    }
}
