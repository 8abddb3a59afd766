use crate::cache::{CacheStats, ContentCache};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::models::{ModelRouter, Route};
use crate::retry::{classify_api_error, classify_status, classify_transport, truncate, RetryPolicy};
use crate::translate::anthropic_types::{
    CountTokensRequest, CountTokensResponse, MessagesRequest, MessagesResponse, StopReason,
    StreamEvent,
};
use crate::translate::gemini_types::{self as gemini, GenerateContentResponse, ModelScopedRequest};
use crate::translate::request::{anthropic_to_gemini, TranslatedRequest};
use crate::translate::response::gemini_to_anthropic;
use crate::translate::streaming::StreamReconstructor;

use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::Stream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Anthropic SSE events produced for a streaming request
pub type SseStream = Pin<Box<dyn Stream<Item = std::result::Result<SseEvent, std::io::Error>> + Send>>;

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    fn from_stream_event(event: &StreamEvent) -> Option<Self> {
        match serde_json::to_string(event) {
            Ok(data) => Some(Self {
                event: event.event_name().to_string(),
                data,
            }),
            Err(e) => {
                warn!(error = %e, "Failed to serialize stream event");
                None
            }
        }
    }
}

/// Forwards Anthropic requests to Gemini.
///
/// One gateway serves the whole process. It owns the shared HTTP client, the
/// admission semaphore and the optional response cache; everything else it
/// reads from the immutable [`ProxyConfig`].
pub struct Gateway {
    config: Arc<ProxyConfig>,
    client: reqwest::Client,
    router: ModelRouter,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    cache: Option<ContentCache>,
    logger: SharedLogger,
    api_key: String,
}

impl Gateway {
    pub fn new(config: Arc<ProxyConfig>, api_key: String, logger: SharedLogger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(config.upstream.max_concurrent_requests)
            .build()?;

        Ok(Self {
            router: ModelRouter::new(&config.models),
            retry: RetryPolicy::from_config(&config.retry),
            permits: Arc::new(Semaphore::new(config.upstream.max_concurrent_requests)),
            cache: config.cache.enabled.then(|| ContentCache::new(&config.cache)),
            client,
            logger,
            api_key,
            config,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(ContentCache::stats)
    }

    /// Non-streaming request: one upstream `generateContent` call, retried when transient.
    pub async fn complete(
        &self,
        req: &MessagesRequest,
        cancel: &CancellationToken,
    ) -> Result<MessagesResponse> {
        let request_id = new_request_id();
        let started = Instant::now();
        let (route, translated) = self.prepare(req, &request_id)?;
        let _permit = self.admit(cancel).await?;

        let cache_key = self
            .cache
            .as_ref()
            .filter(|c| c.eligible(&translated.body))
            .map(|_| ContentCache::key(&route.target, &translated.body));
        if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key.as_deref()) {
            if let Some(hit) = cache.get(key) {
                debug!(request_id = %request_id, "Serving response from cache");
                self.logger
                    .request(LogLevel::Info, &request_id, "cache hit", json!({ "key": key }));
                return gemini_to_anthropic(&hit, &req.model, &translated.tools);
            }
        }

        let url = self.endpoint(&route.target, "generateContent");
        let url = url.as_str();
        let body = &translated.body;
        let upstream = self
            .retry
            .execute(cancel, move |_| self.generate(url, body))
            .await?;

        let resp = gemini_to_anthropic(&upstream, &req.model, &translated.tools)?;

        if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key) {
            cache.insert(key, upstream);
        }

        info!(
            request_id = %request_id,
            target = %route.target,
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Completed"
        );
        self.logger.request(
            LogLevel::Info,
            &request_id,
            "completed",
            json!({
                "stop_reason": resp.stop_reason,
                "usage": resp.usage,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );

        Ok(resp)
    }

    /// Streaming request. Errors before the upstream stream opens are returned
    /// directly; after that every failure is reported inside the event stream.
    pub async fn stream(&self, req: &MessagesRequest, cancel: CancellationToken) -> Result<SseStream> {
        let request_id = new_request_id();
        let (route, translated) = self.prepare(req, &request_id)?;
        let permit = self.admit(&cancel).await?;

        let url = format!(
            "{}?alt=sse",
            self.endpoint(&route.target, "streamGenerateContent")
        );
        let url = url.as_str();
        let body = &translated.body;
        let response = self
            .retry
            .execute(&cancel, move |_| self.open_stream(url, body))
            .await?;

        info!(request_id = %request_id, target = %route.target, "Upstream stream opened");

        let TranslatedRequest { tools, .. } = translated;
        let events = reconstruct(
            response,
            StreamReconstructor::new(&req.model, tools),
            StreamContext {
                idle_timeout: self.config.upstream.request_timeout(),
                cancel,
                permit,
                logger: self.logger.clone(),
                request_id,
            },
        );
        Ok(Box::pin(events))
    }

    /// Token count via Gemini `countTokens`, falling back to a character estimate.
    pub async fn count_tokens(
        &self,
        req: CountTokensRequest,
        cancel: &CancellationToken,
    ) -> Result<CountTokensResponse> {
        let request_id = new_request_id();
        let messages = req.into_messages_request(self.config.limits.min_tokens);
        let (route, translated) = self.prepare(&messages, &request_id)?;
        let estimate = translated.body.prompt_chars().div_ceil(4) as u64;

        let url = self.endpoint(&route.target, "countTokens");
        let body = gemini::CountTokensRequest {
            generate_content_request: ModelScopedRequest {
                model: format!("models/{}", route.target),
                request: translated.body,
            },
        };

        let counted = async {
            let _permit = self.admit(cancel).await?;
            self.post_json::<gemini::CountTokensResponse, _>(&url, &body)
                .await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            result = counted => result,
        };

        match result {
            Ok(counted) => Ok(CountTokensResponse {
                input_tokens: counted.total_tokens,
            }),
            Err(ProxyError::Cancelled) => Err(ProxyError::Cancelled),
            Err(e) => {
                warn!(request_id = %request_id, error = %e, estimate, "countTokens failed, using estimate");
                Ok(CountTokensResponse {
                    input_tokens: estimate,
                })
            }
        }
    }

    fn prepare(&self, req: &MessagesRequest, request_id: &str) -> Result<(Route, TranslatedRequest)> {
        let route = self.router.resolve(&req.model);
        let translated = anthropic_to_gemini(req, &route, &self.config)?;

        info!(
            request_id = %request_id,
            model = %req.model,
            target = %route.target,
            tier = ?route.tier,
            streaming = req.stream.unwrap_or(false),
            "Routed request"
        );
        self.logger.request(
            LogLevel::Info,
            request_id,
            "routed",
            json!({
                "model": req.model,
                "target": route.target,
                "tier": route.tier,
                "stream": req.stream.unwrap_or(false),
                "messages": req.messages.len(),
            }),
        );
        for warning in &translated.schema_warnings {
            self.logger.request(
                LogLevel::Warn,
                request_id,
                "schema feature dropped",
                json!({
                    "tool": warning.tool,
                    "path": warning.feature.path,
                    "keyword": warning.feature.keyword,
                }),
            );
        }

        Ok((route, translated))
    }

    /// Wait for an upstream slot, at most the request timeout.
    async fn admit(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        let timeout = self.config.upstream.request_timeout();
        let acquire = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            acquired = acquire => match acquired {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(ProxyError::other("admission semaphore closed")),
                Err(_) => Err(ProxyError::resource_exhausted(format!(
                    "no upstream slot became free within {}s",
                    timeout.as_secs()
                ))),
            },
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.upstream.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.config.upstream.request_timeout())
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(classify_transport)?;
        debug!(url, status, body_len = text.len(), "Upstream response");

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            ProxyError::upstream_shape(format!(
                "could not parse upstream response: {}. Body: {}",
                e,
                truncate(&text, 300)
            ))
        })
    }

    async fn generate(
        &self,
        url: &str,
        body: &gemini::GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let resp: GenerateContentResponse = self.post_json(url, body).await?;
        match resp.error {
            Some(ref error) => Err(classify_api_error(error)),
            None => Ok(resp),
        }
    }

    /// Send the streaming request and wait for the response head.
    async fn open_stream(
        &self,
        url: &str,
        body: &gemini::GenerateContentRequest,
    ) -> Result<reqwest::Response> {
        let timeout = self.config.upstream.request_timeout();
        let send = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send();

        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| {
                ProxyError::timeout(format!(
                    "upstream did not answer within {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        Ok(response)
    }
}

struct StreamContext {
    idle_timeout: Duration,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
    logger: SharedLogger,
    request_id: String,
}

enum Step {
    Data(String),
    End,
    Fail(ProxyError),
}

/// Drive the reconstructor over the upstream SSE body. The admission permit
/// is held until the stream is dropped.
fn reconstruct(
    response: reqwest::Response,
    mut reconstructor: StreamReconstructor,
    ctx: StreamContext,
) -> impl Stream<Item = std::result::Result<SseEvent, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let StreamContext { idle_timeout, cancel, permit, logger, request_id } = ctx;
        let _permit = permit;
        let started = Instant::now();
        let mut chunks = 0usize;
        let mut failure_logged = false;

        let upstream = tokio_stream::StreamExt::timeout(
            response.bytes_stream().eventsource(),
            idle_timeout,
        );
        tokio::pin!(upstream);

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Fail(ProxyError::Cancelled),
                next = upstream.next() => match next {
                    None => Step::End,
                    Some(Err(_elapsed)) => Step::Fail(ProxyError::timeout(format!(
                        "no upstream chunk within {}s",
                        idle_timeout.as_secs()
                    ))),
                    Some(Ok(Err(EventStreamError::Transport(e)))) => Step::Fail(classify_transport(e)),
                    Some(Ok(Err(e))) => Step::Fail(ProxyError::stream_integrity(format!(
                        "malformed upstream event stream: {e}"
                    ))),
                    Some(Ok(Ok(event))) => Step::Data(event.data),
                },
            };

            let events = match step {
                Step::End => reconstructor.finish(),
                Step::Fail(err) => {
                    warn!(request_id = %request_id, error = %err, "Stream failed");
                    failure_logged = true;
                    logger.request(
                        LogLevel::Error,
                        &request_id,
                        "stream failed",
                        json!({ "kind": err.kind(), "error": err.to_string(), "chunks": chunks }),
                    );
                    reconstructor.fail(&err)
                }
                Step::Data(data) => {
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    chunks += 1;
                    match serde_json::from_str::<GenerateContentResponse>(data) {
                        Ok(chunk) => reconstructor.process_chunk(&chunk),
                        Err(e) => {
                            let err = ProxyError::stream_integrity(format!(
                                "unparseable upstream chunk: {}. Data: {}",
                                e,
                                truncate(data, 300)
                            ));
                            failure_logged = true;
                            logger.request(
                                LogLevel::Error,
                                &request_id,
                                "stream failed",
                                json!({ "kind": err.kind(), "error": err.to_string(), "chunks": chunks }),
                            );
                            reconstructor.fail(&err)
                        }
                    }
                }
            };

            for event in &events {
                if let Some(sse) = SseEvent::from_stream_event(event) {
                    yield Ok(sse);
                }
            }

            if reconstructor.is_terminal() {
                break;
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match reconstructor.stop_reason() {
            Some(StopReason::Error) => {
                warn!(request_id = %request_id, chunks, elapsed_ms, "Stream ended with error");
                if !failure_logged {
                    logger.request(
                        LogLevel::Error,
                        &request_id,
                        "stream failed",
                        json!({ "chunks": chunks, "elapsed_ms": elapsed_ms, "stop_reason": "error" }),
                    );
                }
            }
            stop_reason => {
                info!(request_id = %request_id, chunks, elapsed_ms, ?stop_reason, "Stream completed");
                logger.request(
                    LogLevel::Info,
                    &request_id,
                    "stream completed",
                    json!({ "chunks": chunks, "elapsed_ms": elapsed_ms, "stop_reason": stop_reason }),
                );
            }
        }
    }
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}
