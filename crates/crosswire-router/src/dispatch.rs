//! End-to-end dispatch: parse the client dialect, normalize, render for the
//! upstream, route across the fallback chain, translate the answer back,
//! and feed the usage pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use serde::Serialize;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crosswire_common::{ChainStep, CoreConfig};
use crosswire_pool::{
    AcquireError, Credential, CredentialLease, CredentialMetadata, CredentialPool, ErrorClass,
};
use crosswire_protocol::gemini::{GenerateContentResponse, UsageMetadata};
use crosswire_protocol::ndjson::NdjsonParser;
use crosswire_protocol::{claude, openai};
use crosswire_transform::dialect::{ChatRequest, TokenUsage};
use crosswire_transform::fingerprint::fingerprint;
use crosswire_transform::normalize;
use crosswire_transform::render::gemini_cli::{RenderOptions, render};
use crosswire_transform::respond;
use crosswire_transform::stream::{ClaudeStreamAdapter, GeminiStreamAdapter, OpenAiStreamAdapter};
use crosswire_usage::{TokenCounts, UsagePipeline, UsageRecord};

use crate::auth::AuthProvider;
use crate::cache::{CachedResponse, ResponseCache};
use crate::error::{RouterError, backoff_delay, classify_status, parse_retry_after};
use crate::transport::{RoundTrip, TransportBody, TransportRequest};

const DEFAULT_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com/v1internal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDialect {
    OpenAi,
    Claude,
    Gemini,
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Client-facing key identity; becomes the `api` grouping key of usage
    /// records.
    pub api_key: String,
    pub source: String,
    /// Elapsing deadline cancels the request (and, for streams, the
    /// pre-commit phase).
    pub deadline: Option<Duration>,
}

/// One client-dialect stream event, serialized. `event` carries the SSE
/// event name for dialects that use named events.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub event: Option<&'static str>,
    pub data: Bytes,
}

pub struct Router {
    config: CoreConfig,
    pool: Arc<CredentialPool>,
    transport: Arc<dyn RoundTrip>,
    provider_transports: HashMap<String, Arc<dyn RoundTrip>>,
    endpoints: HashMap<String, String>,
    auth: Arc<dyn AuthProvider>,
    usage: Option<Arc<UsagePipeline>>,
    cache: Option<ResponseCache>,
    safety_settings: Option<JsonValue>,
}

/// How a step attempt ended, as seen by the chain loop.
enum StepError {
    /// Move to the next chain step.
    Advance(RouterError),
    /// Stop and hand the error to the client.
    Surface(RouterError),
}

impl Router {
    pub fn new(
        config: CoreConfig,
        pool: Arc<CredentialPool>,
        transport: Arc<dyn RoundTrip>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let cache = config
            .response_cache
            .enabled
            .then(|| ResponseCache::new(config.response_cache.capacity, config.response_cache.ttl()));
        Self {
            config,
            pool,
            transport,
            provider_transports: HashMap::new(),
            endpoints: HashMap::new(),
            auth,
            usage: None,
            cache,
            safety_settings: None,
        }
    }

    pub fn with_usage(mut self, usage: Arc<UsagePipeline>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Inject an alternate transport (e.g. TLS-fingerprinting) for one
    /// provider.
    pub fn with_provider_transport(
        mut self,
        provider: &str,
        transport: Arc<dyn RoundTrip>,
    ) -> Self {
        self.provider_transports
            .insert(provider.to_string(), transport);
        self
    }

    pub fn with_endpoint(mut self, provider: &str, base: &str) -> Self {
        self.endpoints
            .insert(provider.to_string(), base.trim_end_matches('/').to_string());
        self
    }

    /// Safety-settings table from the config collaborator.
    pub fn with_safety_settings(mut self, settings: JsonValue) -> Self {
        self.safety_settings = Some(settings);
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Heuristic dialect detection from the body shape, for callers whose
    /// HTTP layer cannot tell. Prefer passing the dialect explicitly.
    pub fn detect_dialect(body: &[u8]) -> ClientDialect {
        let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
            return ClientDialect::OpenAi;
        };
        if value.get("contents").is_some() {
            return ClientDialect::Gemini;
        }
        if value.get("anthropic_version").is_some()
            || matches!(value.get("system"), Some(JsonValue::Array(_)))
        {
            return ClientDialect::Claude;
        }
        ClientDialect::OpenAi
    }

    /// Non-streaming entry point: client-dialect request bytes in,
    /// client-dialect response bytes out.
    pub async fn execute(
        &self,
        dialect: ClientDialect,
        body: &[u8],
        ctx: &RequestContext,
    ) -> Result<Bytes, RouterError> {
        let mut canonical = parse_request(dialect, body)?;
        canonical.stream = false;

        let run = self.execute_canonical(dialect, canonical, ctx);
        match ctx.deadline {
            Some(deadline) => tokio::time::timeout(deadline, run)
                .await
                .map_err(|_| RouterError::Cancelled)?,
            None => run.await,
        }
    }

    async fn execute_canonical(
        &self,
        dialect: ClientDialect,
        canonical: ChatRequest,
        ctx: &RequestContext,
    ) -> Result<Bytes, RouterError> {
        let Some(cache) = &self.cache else {
            return self.run_chain(dialect, &canonical, ctx).await;
        };

        let key = fingerprint(&canonical);
        let cached = cache
            .get_or_fill(&key, || async {
                let body = self.run_chain(dialect, &canonical, ctx).await?;
                Ok(CachedResponse {
                    body,
                    content_type: "application/json".to_string(),
                })
            })
            .await?;
        Ok(cached.body)
    }

    async fn run_chain(
        &self,
        dialect: ClientDialect,
        canonical: &ChatRequest,
        ctx: &RequestContext,
    ) -> Result<Bytes, RouterError> {
        let chain = self.config.chain_for(&canonical.model);
        if chain.is_empty() {
            return Err(RouterError::NoRoute(canonical.model.clone()));
        }

        let requested_at = OffsetDateTime::now_utc();
        let mut last = None;
        for step in &chain {
            match self.run_step(step, canonical, dialect, ctx, requested_at).await {
                Ok(bytes) => return Ok(bytes),
                Err(StepError::Advance(error)) => {
                    debug!(provider = %step.provider, model = %step.model, error = %error,
                        "fallback chain advances");
                    last = Some(error);
                }
                Err(StepError::Surface(error)) => {
                    self.record_usage(ctx, step, requested_at, None, true, String::new());
                    return Err(error);
                }
            }
        }

        if let Some(step) = chain.last() {
            self.record_usage(ctx, step, requested_at, None, true, String::new());
        }
        Err(last.unwrap_or_else(|| RouterError::NoCredential(chain[0].provider.clone())))
    }

    async fn run_step(
        &self,
        step: &ChainStep,
        canonical: &ChatRequest,
        dialect: ClientDialect,
        ctx: &RequestContext,
        requested_at: OffsetDateTime,
    ) -> Result<Bytes, StepError> {
        let mut request = canonical.clone();
        request.model = step.model.clone();

        let mut attempts = 0u32;
        let mut refreshed = false;

        loop {
            let lease = self.acquire(step)?;
            let auth_index = lease.id().to_string();

            let upstream = self
                .build_upstream(&request, lease.credential(), false)
                .map_err(StepError::Surface)?;

            match self.transport_for(&step.provider).round_trip(upstream).await {
                Ok(response) if response.is_success() => {
                    let body = response.into_bytes().await;
                    lease.succeed();
                    let upstream_response = parse_upstream_response(&body)
                        .map_err(StepError::Surface)?;
                    let chat = respond::from_gemini(&upstream_response);
                    self.record_usage(ctx, step, requested_at, chat.usage, false, auth_index);
                    return encode_response(dialect, &chat, &canonical.model)
                        .map_err(StepError::Surface);
                }
                Ok(response) => {
                    let status = response.status;
                    let retry_after = parse_retry_after(response.header("retry-after"));
                    let body = response.into_bytes().await;
                    match self
                        .handle_http_failure(
                            step, lease, status, retry_after, body, &mut refreshed, &mut attempts,
                        )
                        .await
                    {
                        Ok(()) => continue,
                        Err(error) => return Err(error),
                    }
                }
                Err(failure) => {
                    match self.handle_transport_failure(lease, &failure, &mut attempts).await {
                        Ok(()) => continue,
                        Err(error) => return Err(error),
                    }
                }
            }
        }
    }

    fn acquire(&self, step: &ChainStep) -> Result<CredentialLease, StepError> {
        self.pool
            .acquire(&step.provider, &step.model, &self.config.routing)
            .map_err(|error| {
                StepError::Advance(match error {
                    AcquireError::ProviderUnknown => RouterError::NoRoute(step.provider.clone()),
                    AcquireError::NoActiveCredentials => {
                        RouterError::NoCredential(step.provider.clone())
                    }
                })
            })
    }

    /// Applies the per-error-class policy. `Ok(())` means retry the step
    /// loop (the lease has been resolved); `Err` advances or surfaces.
    async fn handle_http_failure(
        &self,
        step: &ChainStep,
        lease: CredentialLease,
        status: u16,
        retry_after: Option<Duration>,
        body: Bytes,
        refreshed: &mut bool,
        attempts: &mut u32,
    ) -> Result<(), StepError> {
        let policy = &self.config.retry_policy;
        match classify_status(status) {
            ErrorClass::Auth => {
                if !*refreshed {
                    *refreshed = true;
                    match self.auth.refresh(lease.credential()).await {
                        Ok(new_credential) => {
                            debug!(provider = %step.provider, "credential refreshed after auth failure");
                            self.pool.update_credential(new_credential);
                            lease.cancel();
                            return Ok(());
                        }
                        Err(error) => {
                            warn!(provider = %step.provider, error = %error, "credential refresh failed");
                        }
                    }
                }
                lease.fail(ErrorClass::Auth, None);
                Err(StepError::Advance(RouterError::Upstream { status, body }))
            }
            ErrorClass::RateLimited => {
                lease.fail(ErrorClass::RateLimited, retry_after);
                Err(StepError::Advance(RouterError::Upstream { status, body }))
            }
            ErrorClass::Upstream => {
                lease.fail(ErrorClass::Upstream, None);
                if *attempts + 1 < policy.max_attempts {
                    *attempts += 1;
                    tokio::time::sleep(backoff_delay(policy, *attempts)).await;
                    return Ok(());
                }
                Err(StepError::Advance(RouterError::Upstream { status, body }))
            }
            ErrorClass::Transient => {
                if *attempts + 1 < policy.max_attempts {
                    lease.cancel();
                    *attempts += 1;
                    tokio::time::sleep(backoff_delay(policy, *attempts)).await;
                    return Ok(());
                }
                lease.fail(ErrorClass::Transient, None);
                Err(StepError::Advance(RouterError::Upstream { status, body }))
            }
            // Other 4xx: the credential is fine, the request is not.
            ErrorClass::Permanent => {
                lease.cancel();
                Err(StepError::Surface(RouterError::Upstream { status, body }))
            }
        }
    }

    async fn handle_transport_failure(
        &self,
        lease: CredentialLease,
        failure: &crate::transport::TransportError,
        attempts: &mut u32,
    ) -> Result<(), StepError> {
        let policy = &self.config.retry_policy;
        if *attempts + 1 < policy.max_attempts {
            // Retries in flight stay out of the health window; only an
            // exhausted step counts against the credential.
            lease.cancel();
            *attempts += 1;
            tokio::time::sleep(backoff_delay(policy, *attempts)).await;
            return Ok(());
        }
        lease.fail(ErrorClass::Transient, None);
        Err(StepError::Advance(RouterError::Transport(
            failure.to_string(),
        )))
    }

    // ---- Streaming ----

    /// Streaming entry point. Failover is possible until the upstream
    /// answers 2xx; from the first forwarded frame on, errors are terminal
    /// events (at-most-once successful emission).
    pub async fn execute_stream(
        &self,
        dialect: ClientDialect,
        body: &[u8],
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<StreamFrame>, RouterError> {
        let mut canonical = parse_request(dialect, body)?;
        canonical.stream = true;

        let open = self.open_stream(dialect, &canonical, ctx);
        match ctx.deadline {
            Some(deadline) => tokio::time::timeout(deadline, open)
                .await
                .map_err(|_| RouterError::Cancelled)?,
            None => open.await,
        }
    }

    async fn open_stream(
        &self,
        dialect: ClientDialect,
        canonical: &ChatRequest,
        ctx: &RequestContext,
    ) -> Result<mpsc::Receiver<StreamFrame>, RouterError> {
        let chain = self.config.chain_for(&canonical.model);
        if chain.is_empty() {
            return Err(RouterError::NoRoute(canonical.model.clone()));
        }

        let requested_at = OffsetDateTime::now_utc();
        let mut last = None;
        for step in &chain {
            match self
                .open_stream_step(step, canonical, dialect, ctx, requested_at)
                .await
            {
                Ok(rx) => return Ok(rx),
                Err(StepError::Advance(error)) => last = Some(error),
                Err(StepError::Surface(error)) => return Err(error),
            }
        }
        Err(last.unwrap_or_else(|| RouterError::NoCredential(chain[0].provider.clone())))
    }

    async fn open_stream_step(
        &self,
        step: &ChainStep,
        canonical: &ChatRequest,
        dialect: ClientDialect,
        ctx: &RequestContext,
        requested_at: OffsetDateTime,
    ) -> Result<mpsc::Receiver<StreamFrame>, StepError> {
        let mut request = canonical.clone();
        request.model = step.model.clone();

        let mut attempts = 0u32;
        let mut refreshed = false;

        loop {
            let lease = self.acquire(step)?;

            let upstream = self
                .build_upstream(&request, lease.credential(), true)
                .map_err(StepError::Surface)?;

            match self.transport_for(&step.provider).round_trip(upstream).await {
                Ok(response) if response.is_success() => {
                    let (tx, rx) = mpsc::channel(32);
                    let forwarder = StreamForwarder {
                        adapter: Adapter::new(dialect, &step.model),
                        auth_index: lease.id().to_string(),
                        lease: Some(lease),
                        usage: self.usage.clone(),
                        ctx: ctx.clone(),
                        step: step.clone(),
                        requested_at,
                    };
                    tokio::spawn(forwarder.run(response.body, tx));
                    return Ok(rx);
                }
                Ok(response) => {
                    let status = response.status;
                    let retry_after = parse_retry_after(response.header("retry-after"));
                    let body = response.into_bytes().await;
                    match self
                        .handle_http_failure(
                            step, lease, status, retry_after, body, &mut refreshed, &mut attempts,
                        )
                        .await
                    {
                        Ok(()) => continue,
                        Err(error) => return Err(error),
                    }
                }
                Err(failure) => {
                    match self.handle_transport_failure(lease, &failure, &mut attempts).await {
                        Ok(()) => continue,
                        Err(error) => return Err(error),
                    }
                }
            }
        }
    }

    // ---- Shared plumbing ----

    fn transport_for(&self, provider: &str) -> &Arc<dyn RoundTrip> {
        self.provider_transports
            .get(provider)
            .unwrap_or(&self.transport)
    }

    fn endpoint_for(&self, provider: &str, streaming: bool) -> String {
        let base = self
            .endpoints
            .get(provider)
            .map(String::as_str)
            .unwrap_or(DEFAULT_ENDPOINT);
        if streaming {
            format!("{base}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}:generateContent")
        }
    }

    fn build_upstream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
        streaming: bool,
    ) -> Result<TransportRequest, RouterError> {
        let options = RenderOptions {
            project: credential.project_id().unwrap_or_default().to_string(),
            safety_settings: self.safety_settings.clone(),
        };
        let rendered = render(request, &options)?;
        let body = serde_json::to_vec(&rendered)
            .map_err(|error| RouterError::Translation(error.to_string()))?;

        Ok(TransportRequest {
            method: Method::POST,
            url: self.endpoint_for(&credential.provider, streaming),
            headers: auth_headers(credential),
            body: Some(Bytes::from(body)),
            streaming,
        })
    }

    fn record_usage(
        &self,
        ctx: &RequestContext,
        step: &ChainStep,
        requested_at: OffsetDateTime,
        usage: Option<TokenUsage>,
        failed: bool,
        auth_index: String,
    ) {
        let Some(pipeline) = &self.usage else {
            return;
        };
        let tokens = usage.map(token_counts).unwrap_or_default();
        pipeline.record(UsageRecord {
            requested_at,
            provider: step.provider.clone(),
            model: step.model.clone(),
            api_key: ctx.api_key.clone(),
            source: ctx.source.clone(),
            auth_index,
            failed,
            tokens,
        });
    }
}

fn auth_headers(credential: &Credential) -> Vec<(String, String)> {
    let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
    match &credential.metadata {
        CredentialMetadata::ApiKey { api_key } => {
            headers.push(("x-goog-api-key".to_string(), api_key.clone()));
        }
        CredentialMetadata::OAuth { access_token, .. } => {
            headers.push(("authorization".to_string(), format!("Bearer {access_token}")));
        }
        // Service-account and profile credentials are exchanged for tokens
        // by the auth subsystem; nothing to attach here.
        CredentialMetadata::ServiceAccount { .. } | CredentialMetadata::ProfileArn { .. } => {}
    }
    headers
}

fn parse_request(dialect: ClientDialect, body: &[u8]) -> Result<ChatRequest, RouterError> {
    let validation = |error: serde_json::Error| RouterError::Validation(error.to_string());
    match dialect {
        ClientDialect::OpenAi => {
            let request: openai::ChatCompletionRequest =
                serde_json::from_slice(body).map_err(validation)?;
            Ok(normalize::openai::normalize(request)?)
        }
        ClientDialect::Claude => {
            let request: claude::MessagesRequest =
                serde_json::from_slice(body).map_err(validation)?;
            Ok(normalize::claude::normalize(request)?)
        }
        ClientDialect::Gemini => {
            // The HTTP layer carries the model in the path; library callers
            // put it in a top-level `model` field next to `contents`.
            let value: JsonValue = serde_json::from_slice(body).map_err(validation)?;
            let model = value
                .get("model")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| RouterError::Validation("model is required".to_string()))?
                .to_string();
            let stream = value
                .get("stream")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            let request: crosswire_protocol::gemini::GenerateContentRequest =
                serde_json::from_value(value).map_err(validation)?;
            Ok(normalize::gemini::normalize(&model, request, stream)?)
        }
    }
}

/// CLI responses may arrive bare or wrapped under a `response` key.
fn parse_upstream_response(body: &[u8]) -> Result<GenerateContentResponse, RouterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|error| RouterError::Translation(format!("upstream response: {error}")))?;
    let inner = match value {
        JsonValue::Object(ref object) if object.contains_key("response") => {
            object.get("response").cloned().unwrap_or(JsonValue::Null)
        }
        other => other,
    };
    serde_json::from_value(inner)
        .map_err(|error| RouterError::Translation(format!("upstream response: {error}")))
}

fn encode_response(
    dialect: ClientDialect,
    chat: &crosswire_transform::dialect::ChatResponse,
    model: &str,
) -> Result<Bytes, RouterError> {
    let created = OffsetDateTime::now_utc().unix_timestamp();
    let encoded = match dialect {
        ClientDialect::OpenAi => serde_json::to_vec(&respond::to_openai(chat, model, created)),
        ClientDialect::Claude => serde_json::to_vec(&respond::to_claude(chat, model)),
        ClientDialect::Gemini => serde_json::to_vec(&respond::to_gemini(chat)),
    }
    .map_err(|error| RouterError::Translation(error.to_string()))?;
    Ok(Bytes::from(encoded))
}

fn token_counts(usage: TokenUsage) -> TokenCounts {
    TokenCounts {
        input: usage.input as i64,
        output: usage.output as i64,
        reasoning: usage.reasoning as i64,
        cached: usage.cached as i64,
        total: usage.total as i64,
    }
}

fn metadata_usage(metadata: &UsageMetadata) -> TokenUsage {
    let input = metadata.prompt_token_count.unwrap_or(0);
    let output = metadata.candidates_token_count.unwrap_or(0);
    let reasoning = metadata.thoughts_token_count.unwrap_or(0);
    TokenUsage {
        input,
        output,
        reasoning,
        cached: metadata.cached_content_token_count.unwrap_or(0),
        total: metadata.total_token_count.unwrap_or(input + output + reasoning),
    }
}

// ---- Stream forwarding ----

enum Adapter {
    OpenAi(OpenAiStreamAdapter),
    Claude(ClaudeStreamAdapter),
    Gemini(GeminiStreamAdapter),
}

impl Adapter {
    fn new(dialect: ClientDialect, model: &str) -> Self {
        match dialect {
            ClientDialect::OpenAi => Adapter::OpenAi(OpenAiStreamAdapter::new(
                model,
                OffsetDateTime::now_utc().unix_timestamp(),
            )),
            ClientDialect::Claude => Adapter::Claude(ClaudeStreamAdapter::new(model)),
            ClientDialect::Gemini => Adapter::Gemini(GeminiStreamAdapter::new()),
        }
    }

    fn on_frame(&mut self, frame: &GenerateContentResponse) -> Vec<StreamFrame> {
        match self {
            Adapter::OpenAi(adapter) => vec![frame_json(None, &adapter.on_frame(frame))],
            Adapter::Claude(adapter) => adapter
                .on_frame(frame)
                .into_iter()
                .map(|event| frame_json(Some(event.event_name()), &event))
                .collect(),
            Adapter::Gemini(adapter) => vec![frame_json(None, &adapter.on_frame(frame))],
        }
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        match self {
            Adapter::OpenAi(adapter) => adapter
                .finish()
                .map(|chunk| frame_json(None, &chunk))
                .into_iter()
                .collect(),
            Adapter::Claude(adapter) => adapter
                .finish()
                .into_iter()
                .map(|event| frame_json(Some(event.event_name()), &event))
                .collect(),
            Adapter::Gemini(adapter) => adapter
                .finish()
                .map(|frame| frame_json(None, &frame))
                .into_iter()
                .collect(),
        }
    }

    fn error(&mut self, code: Option<i64>, message: &str) -> StreamFrame {
        match self {
            Adapter::OpenAi(adapter) => frame_json(None, &adapter.error(code, message)),
            Adapter::Claude(adapter) => {
                let event = adapter.error(message);
                frame_json(Some(event.event_name()), &event)
            }
            Adapter::Gemini(adapter) => frame_json(None, &adapter.error(code, message)),
        }
    }
}

fn frame_json<T: Serialize>(event: Option<&'static str>, value: &T) -> StreamFrame {
    StreamFrame {
        event,
        data: Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
    }
}

struct StreamForwarder {
    adapter: Adapter,
    auth_index: String,
    lease: Option<CredentialLease>,
    usage: Option<Arc<UsagePipeline>>,
    ctx: RequestContext,
    step: ChainStep,
    requested_at: OffsetDateTime,
}

impl StreamForwarder {
    async fn run(mut self, body: TransportBody, tx: mpsc::Sender<StreamFrame>) {
        let mut parser = NdjsonParser::new();
        let mut usage: Option<TokenUsage> = None;

        let mut chunks = match body {
            TransportBody::Stream(rx) => rx,
            TransportBody::Bytes(bytes) => {
                let (chunk_tx, chunk_rx) = mpsc::channel(1);
                let _ = chunk_tx.try_send(bytes);
                chunk_rx
            }
        };

        while let Some(chunk) = chunks.recv().await {
            for line in parser.push_bytes(&chunk) {
                if !self.handle_line(&line, &mut usage, &tx).await {
                    return;
                }
            }
        }
        if let Some(line) = parser.finish()
            && !self.handle_line(&line, &mut usage, &tx).await
        {
            return;
        }

        // Clean close: synthesize the terminal event if the upstream never
        // sent a finish reason.
        for frame in self.adapter.finish() {
            let _ = tx.send(frame).await;
        }
        if let Some(lease) = self.lease.take() {
            lease.succeed();
        }
        self.record(usage, false);
    }

    /// Returns false when the stream ended in a terminal error.
    async fn handle_line(
        &mut self,
        line: &str,
        usage: &mut Option<TokenUsage>,
        tx: &mpsc::Sender<StreamFrame>,
    ) -> bool {
        let Ok(value) = serde_json::from_str::<JsonValue>(line) else {
            warn!("skipping unparsable upstream stream frame");
            return true;
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(JsonValue::as_i64);
            let message = error
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("upstream error");
            let frame = self.adapter.error(code, message);
            let _ = tx.send(frame).await;
            if let Some(lease) = self.lease.take() {
                let class = classify_status(code.unwrap_or(500).clamp(0, u16::MAX as i64) as u16);
                lease.fail(class, None);
            }
            self.record(*usage, true);
            return false;
        }

        let inner = match value {
            JsonValue::Object(ref object) if object.contains_key("response") => {
                object.get("response").cloned().unwrap_or(JsonValue::Null)
            }
            other => other,
        };
        let Ok(frame) = serde_json::from_value::<GenerateContentResponse>(inner) else {
            warn!("skipping upstream stream frame with unexpected shape");
            return true;
        };

        if let Some(metadata) = &frame.usage_metadata {
            *usage = Some(metadata_usage(metadata));
        }

        for out in self.adapter.on_frame(&frame) {
            if tx.send(out).await.is_err() {
                // Client went away; the lease drop records a cancellation.
                self.lease.take();
                return false;
            }
        }
        true
    }

    fn record(&self, usage: Option<TokenUsage>, failed: bool) {
        let Some(pipeline) = &self.usage else {
            return;
        };
        let tokens = usage.map(token_counts).unwrap_or_default();
        pipeline.record(UsageRecord {
            requested_at: self.requested_at,
            provider: self.step.provider.clone(),
            model: self.step.model.clone(),
            api_key: self.ctx.api_key.clone(),
            source: self.ctx.source.clone(),
            auth_index: self.auth_index.clone(),
            failed,
            tokens,
        });
    }
}
