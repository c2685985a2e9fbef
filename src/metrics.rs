//! Prometheus metrics and the scrape listener.

use axum::routing::get;
use axum::Router;
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, TextEncoder};

static MIRROR_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("mirror_requests_total", "Total number of mirror requests."),
        &["registry", "cache", "source"],
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Count a completed mirror request. `cache=hit` iff the response was 200.
pub fn record_mirror_request(registry: &str, status: StatusCode, external: bool) {
    let cache = if status == StatusCode::OK { "hit" } else { "miss" };
    let source = if external { "external" } else { "internal" };
    MIRROR_REQUESTS_TOTAL
        .with_label_values(&[registry, cache, source])
        .inc();
}

pub fn make_router() -> Router {
    Router::new().route("/metrics", get(serve_metrics))
}

async fn serve_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::default_registry().gather(), &mut buffer) {
        tracing::warn!(%err, "could not encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Labels private to this test; the counter is process-wide and other
    // tests record docker.io traffic.
    #[test]
    fn mirror_requests_are_counted_by_label() {
        record_mirror_request("counted.example.com", StatusCode::OK, false);
        record_mirror_request("counted.example.com", StatusCode::OK, false);
        record_mirror_request("counted.example.com", StatusCode::NOT_FOUND, true);

        assert_eq!(
            MIRROR_REQUESTS_TOTAL
                .with_label_values(&["counted.example.com", "hit", "internal"])
                .get(),
            2
        );
        assert_eq!(
            MIRROR_REQUESTS_TOTAL
                .with_label_values(&["counted.example.com", "miss", "external"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn scrape_output_is_text_exposition() {
        record_mirror_request("quay.io", StatusCode::OK, false);
        let body = serve_metrics().await;
        assert!(body.contains("# TYPE mirror_requests_total counter"));
        assert!(body.contains("registry=\"quay.io\""));
    }
}
