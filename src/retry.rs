//! Retry with exponential backoff, and classification of upstream failures.
//!
//! Only [`ProxyError::is_transient`] failures are retried. Cancellation aborts
//! both an attempt in flight and a backoff sleep, and is never retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ProxyError, Result};
use crate::translate::gemini_types::{ApiError, ApiErrorResponse};

const MAX_DETAIL_LEN: usize = 2000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based), with random jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.backoff_delay_with_jitter(attempt, jitter)
    }

    /// `min(base * 2^attempt + base * jitter, max)`, jitter in `[0, 1)`.
    pub fn backoff_delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let exponential = base * 2_f64.powi(attempt.min(30) as i32);
        let delay = (exponential + base * jitter.clamp(0.0, 1.0))
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay as u64)
    }

    /// Run `operation` until it succeeds, fails for good, or retries run out.
    /// The closure receives the 0-based attempt number.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                result = operation(attempt) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= self.max_retries {
                return Err(err);
            }

            let delay = self.backoff_delay(attempt);
            warn!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient upstream failure, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Classify a non-success upstream HTTP status.
pub fn classify_status(status: u16, body: &str) -> ProxyError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|r| r.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("upstream returned HTTP {status}"));
    let detail = (!body.trim().is_empty()).then(|| truncate(body, MAX_DETAIL_LEN).to_string());

    if is_transient_status(status) {
        ProxyError::UpstreamTransient {
            status: Some(status),
            timed_out: matches!(status, 408 | 504),
            message,
            detail,
        }
    } else {
        ProxyError::UpstreamFatal {
            status,
            message,
            detail,
        }
    }
}

/// Classify an error object delivered inside a response body or stream.
pub fn classify_api_error(error: &ApiError) -> ProxyError {
    let detail = serde_json::to_string(error).ok();
    let message = if error.message.is_empty() {
        error
            .status
            .clone()
            .unwrap_or_else(|| "upstream reported an error".to_string())
    } else {
        error.message.clone()
    };

    match error.code {
        Some(code) if !is_transient_status(code) => ProxyError::UpstreamFatal {
            status: code,
            message,
            detail,
        },
        code => ProxyError::UpstreamTransient {
            status: code,
            timed_out: matches!(code, Some(408 | 504)),
            message,
            detail,
        },
    }
}

/// Classify a transport-level failure from reqwest.
pub fn classify_transport(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        return ProxyError::timeout(format!("upstream request timed out: {err}"));
    }
    if err.is_connect() || err.is_request() || err.is_body() {
        return ProxyError::UpstreamTransient {
            status: None,
            timed_out: false,
            message: format!("upstream transport error: {err}"),
            detail: None,
        };
    }
    if err.is_decode() {
        return ProxyError::upstream_shape(format!("could not decode upstream body: {err}"));
    }
    ProxyError::Http(err)
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn transient() -> ProxyError {
        classify_status(503, "")
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
        };
        assert_eq!(p.backoff_delay_with_jitter(0, 0.0), Duration::from_millis(500));
        assert_eq!(p.backoff_delay_with_jitter(1, 0.0), Duration::from_millis(1000));
        assert_eq!(p.backoff_delay_with_jitter(2, 0.5), Duration::from_millis(2250));
        assert_eq!(p.backoff_delay_with_jitter(10, 0.9), Duration::from_millis(8000));

        let jittered = p.backoff_delay(1);
        assert!(jittered >= Duration::from_millis(1000));
        assert!(jittered < Duration::from_millis(1500));
    }

    #[test]
    fn test_classify_status() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(classify_status(status, "").is_transient(), "{status}");
        }
        for status in [400, 401, 403, 404] {
            assert!(!classify_status(status, "").is_transient(), "{status}");
        }
        assert!(matches!(
            classify_status(504, ""),
            ProxyError::UpstreamTransient { timed_out: true, .. }
        ));
    }

    #[test]
    fn test_classify_status_keeps_upstream_message() {
        let body = r#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#;
        match classify_status(400, body) {
            ProxyError::UpstreamFatal {
                status,
                message,
                detail,
            } => {
                assert_eq!(status, 400);
                assert_eq!(message, "API key not valid");
                assert_eq!(detail.as_deref(), Some(body));
            }
            other => panic!("Expected fatal error, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_api_error() {
        let overloaded = ApiError {
            code: Some(503),
            message: "overloaded".to_string(),
            status: Some("UNAVAILABLE".to_string()),
            details: None,
        };
        assert!(classify_api_error(&overloaded).is_transient());

        let denied = ApiError {
            code: Some(403),
            message: String::new(),
            status: Some("PERMISSION_DENIED".to_string()),
            details: None,
        };
        let err = classify_api_error(&denied);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("PERMISSION_DENIED"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy(2)
            .execute(&CancellationToken::new(), move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = policy(3)
            .execute(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(classify_status(401, ""))
                }
            })
            .await;
        assert!(matches!(result, Err(ProxyError::UpstreamFatal { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = policy(2)
            .execute(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_without_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = policy(5)
            .execute(&cancel, |_| async { Err(transient()) })
            .await;
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let trigger = cancel.clone();
        let result: Result<()> = slow
            .execute(&cancel, move |_| {
                trigger.cancel();
                async { Err(transient()) }
            })
            .await;
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }
}
