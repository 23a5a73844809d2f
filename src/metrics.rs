use std::sync::LazyLock;

use prometheus::*;

static METRIC_ANALYZE_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "im_analyze_requests_total",
        "count of batch requests sent to the analysis service",
        &["status"]
    )
    .unwrap()
});

static METRIC_ANALYZED_IMAGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "im_analyzed_images_total",
        "count of per-image analysis results",
        &["status"]
    )
    .unwrap()
});

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("im_search_total", "count of search requests", &["mode"]).unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "im_search_duration_seconds",
        "duration of search requests in seconds",
        &["mode"]
    )
    .unwrap()
});

/// 记录一次分析服务请求
pub fn inc_analyze_request(status: &str) {
    METRIC_ANALYZE_REQUESTS.with_label_values(&[status]).inc();
}

/// 按图片粒度累计分析结果
pub fn inc_analyzed_images(status: &str, count: u64) {
    METRIC_ANALYZED_IMAGES.with_label_values(&[status]).inc_by(count);
}

pub fn inc_search_count(mode: &str) {
    METRIC_SEARCH_COUNT.with_label_values(&[mode]).inc();
}

pub fn observe_search_duration(mode: &str, seconds: f64) {
    METRIC_SEARCH_DURATION.with_label_values(&[mode]).observe(seconds);
}
