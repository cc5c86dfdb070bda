//! Quota headers and the structured 429 rejection payload.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::admission::AdmissionResult;
use crate::config::Environment;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Writes quota headers on every annotated response and builds the
/// rejection payload for denials.
#[derive(Debug, Clone)]
pub struct ResponseAnnotator {
    environment: Environment,
}

impl ResponseAnnotator {
    pub fn new(environment: Environment) -> Self {
        Self { environment }
    }

    /// Set `X-RateLimit-*` headers from an admission result.
    pub fn annotate(&self, headers: &mut HeaderMap, result: &AdmissionResult) {
        headers.insert(HEADER_LIMIT, int_header(result.limit as i64));
        headers.insert(HEADER_REMAINING, int_header(result.remaining as i64));
        headers.insert(HEADER_RESET, int_header(result.reset_at.timestamp()));
    }

    /// Build the full 429 response for a denial: quota headers,
    /// `Retry-After`, and a JSON body with a fresh correlation id. The
    /// body carries tier details only outside production.
    pub fn reject(&self, result: &AdmissionResult) -> Response<Body> {
        let retry_after_secs = result
            .retry_after
            .map(|d| {
                let mut secs = d.as_secs();
                if d.subsec_nanos() > 0 {
                    secs += 1;
                }
                secs.max(1)
            })
            .unwrap_or(1);

        let correlation_id = Uuid::new_v4();
        let mut body = json!({
            "error": "Too many requests",
            "correlationId": correlation_id,
            "timestamp": Utc::now().to_rfc3339(),
            "retryAfter": retry_after_secs,
        });
        if self.environment != Environment::Production {
            body["details"] = json!({
                "tier": result.violated_tier,
                "limit": result.limit,
                "resetAt": result.reset_at.timestamp(),
            });
        }

        let mut response = Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::RETRY_AFTER, retry_after_secs)
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| {
                Response::new(Body::from("Too many requests"))
            });
        self.annotate(response.headers_mut(), result);
        response
    }
}

fn int_header(value: i64) -> HeaderValue {
    // Decimal integers are always valid header values.
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn denied_result() -> AdmissionResult {
        AdmissionResult {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: Utc.timestamp_opt(1_700_000_060, 0).unwrap(),
            retry_after: Some(Duration::from_millis(59_500)),
            violated_tier: Some("endpoint".to_string()),
        }
    }

    #[test]
    fn test_annotate_sets_quota_headers() {
        let annotator = ResponseAnnotator::new(Environment::Production);
        let result = AdmissionResult {
            allowed: true,
            limit: 10,
            remaining: 7,
            reset_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            retry_after: None,
            violated_tier: None,
        };

        let mut headers = HeaderMap::new();
        annotator.annotate(&mut headers, &result);
        assert_eq!(headers[HEADER_LIMIT], "10");
        assert_eq!(headers[HEADER_REMAINING], "7");
        assert_eq!(headers[HEADER_RESET], "1700000000");
    }

    #[test]
    fn test_reject_sets_status_and_retry_after_ceiling() {
        let annotator = ResponseAnnotator::new(Environment::Production);
        let response = annotator.reject(&denied_result());

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // 59.5s rounds up to 60.
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert_eq!(response.headers()[HEADER_REMAINING], "0");
    }

    #[tokio::test]
    async fn test_reject_body_shape() {
        let annotator = ResponseAnnotator::new(Environment::Development);
        let response = annotator.reject(&denied_result());

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["error"], "Too many requests");
        assert_eq!(body["retryAfter"], 60);
        assert!(body["correlationId"].as_str().unwrap().len() >= 32);
        assert!(body["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(body["details"]["tier"], "endpoint");
    }

    #[tokio::test]
    async fn test_reject_body_omits_details_in_production() {
        let annotator = ResponseAnnotator::new(Environment::Production);
        let response = annotator.reject(&denied_result());

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn test_correlation_ids_are_fresh() {
        let annotator = ResponseAnnotator::new(Environment::Production);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let response = annotator.reject(&denied_result());
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            ids.push(body["correlationId"].as_str().unwrap().to_string());
        }
        assert_ne!(ids[0], ids[1]);
    }
}
