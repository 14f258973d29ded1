//! Routing policy against a scripted transport: retry discipline, cooldown,
//! auth refresh, and the streaming commit point.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value as JsonValue, json};

use crosswire_common::{ChainStep, CoreConfig, RetryPolicy};
use crosswire_pool::{
    Credential, CredentialMetadata, CredentialPool, CredentialStatus, HealthTracker,
};
use crosswire_router::{
    AuthProvider, ClientDialect, RequestContext, RoundTrip, Router, RouterError, TransportBody,
    TransportError, TransportErrorKind, TransportRequest, TransportResponse,
};

type Reply = Box<dyn FnOnce() -> Result<TransportResponse, TransportError> + Send>;

#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn push(&self, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .push_back(reply);
    }

    fn push_status(&self, status: u16, headers: Vec<(String, String)>, body: &str) {
        let body = body.to_string();
        self.push(Box::new(move || {
            Ok(TransportResponse {
                status,
                headers,
                body: TransportBody::Bytes(Bytes::from(body)),
            })
        }));
    }

    fn push_success(&self, body: JsonValue) {
        self.push_status(200, Vec::new(), &body.to_string());
    }

    fn push_transport_error(&self, kind: TransportErrorKind) {
        self.push(Box::new(move || {
            Err(TransportError {
                kind,
                message: "scripted".to_string(),
            })
        }));
    }

    fn seen(&self) -> Vec<TransportRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl RoundTrip for ScriptedTransport {
    fn round_trip<'a>(
        &'a self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>> {
        self.seen.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        Box::pin(async move {
            match reply {
                Some(reply) => reply(),
                None => panic!("transport called more times than scripted"),
            }
        })
    }
}

struct CountingAuth {
    calls: AtomicUsize,
}

#[async_trait]
impl AuthProvider for CountingAuth {
    async fn refresh(&self, credential: &Credential) -> Result<Credential, crosswire_router::AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut refreshed = credential.clone();
        refreshed.metadata = CredentialMetadata::OAuth {
            access_token: "fresh".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: 0,
            project_id: Some("p-1".to_string()),
        };
        Ok(refreshed)
    }
}

fn upstream_success(text: &str) -> JsonValue {
    json!({
        "response": {
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {
                "promptTokenCount": 3,
                "candidatesTokenCount": 2,
                "totalTokenCount": 5
            },
            "responseId": "resp-1"
        }
    })
}

fn test_config() -> CoreConfig {
    CoreConfig {
        fallback_chains: HashMap::from([(
            "gemini-2.5-pro".to_string(),
            vec![ChainStep {
                provider: "gemini-cli".to_string(),
                model: "gemini-2.5-pro".to_string(),
            }],
        )]),
        retry_policy: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..CoreConfig::default()
    }
}

fn pool_with(ids: &[i64]) -> Arc<CredentialPool> {
    let pool = Arc::new(CredentialPool::new(Arc::new(HealthTracker::new(
        Default::default(),
    ))));
    for id in ids {
        pool.insert(Credential {
            id: *id,
            provider: "gemini-cli".to_string(),
            label: format!("cred-{id}"),
            metadata: CredentialMetadata::OAuth {
                access_token: format!("token-{id}"),
                refresh_token: "rt".to_string(),
                expires_at: 0,
                project_id: Some("p-1".to_string()),
            },
        });
    }
    pool
}

fn router(
    transport: Arc<ScriptedTransport>,
    pool: Arc<CredentialPool>,
    auth: Arc<CountingAuth>,
) -> Router {
    Router::new(test_config(), pool, transport, auth)
}

fn chat_body() -> Vec<u8> {
    json!({
        "model": "gemini-2.5-pro",
        "messages": [{"role": "user", "content": "hi"}]
    })
    .to_string()
    .into_bytes()
}

fn auth_token(request: &TransportRequest) -> String {
    request
        .headers
        .iter()
        .find(|(key, _)| key == "authorization")
        .map(|(_, value)| value.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn success_translates_to_client_dialect() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_success(upstream_success("hello"));
    let router = router(
        transport.clone(),
        pool_with(&[1]),
        Arc::new(CountingAuth { calls: AtomicUsize::new(0) }),
    );

    let bytes = router
        .execute(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap();
    let response: JsonValue = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(response["choices"][0]["message"]["content"], "hello");
    assert_eq!(response["usage"]["total_tokens"], 5);

    let seen = transport.seen();
    assert_eq!(seen.len(), 1);
    let sent: JsonValue = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["project"], "p-1");
    assert_eq!(sent["request"]["contents"][0]["parts"][0]["text"], "hi");
}

#[tokio::test]
async fn rate_limit_cools_credential_and_next_request_uses_the_other() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_status(
        429,
        vec![("retry-after".to_string(), "30".to_string())],
        "{\"error\":{\"message\":\"slow down\"}}",
    );
    transport.push_success(upstream_success("from B"));

    let pool = pool_with(&[1, 2]);
    let router = router(
        transport.clone(),
        pool.clone(),
        Arc::new(CountingAuth { calls: AtomicUsize::new(0) }),
    );

    // First request: A answers 429; chain has one step, so the error
    // surfaces after the cooldown is recorded.
    let error = router
        .execute(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::Upstream { status: 429, .. }));
    assert_eq!(pool.snapshot()[0].status, CredentialStatus::Cooldown);

    // Next request: B serves while A cools down.
    let bytes = router
        .execute(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap();
    let response: JsonValue = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(response["choices"][0]["message"]["content"], "from B");

    let seen = transport.seen();
    assert_eq!(auth_token(&seen[0]), "Bearer token-1");
    assert_eq!(auth_token(&seen[1]), "Bearer token-2");
}

#[tokio::test]
async fn auth_failure_refreshes_once_then_retries() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_status(401, Vec::new(), "{}");
    transport.push_success(upstream_success("after refresh"));

    let auth = Arc::new(CountingAuth { calls: AtomicUsize::new(0) });
    let router = router(transport.clone(), pool_with(&[1]), auth.clone());

    let bytes = router
        .execute(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap();
    let response: JsonValue = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(response["choices"][0]["message"]["content"], "after refresh");
    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

    // The retry used the refreshed token.
    let seen = transport.seen();
    assert_eq!(auth_token(&seen[1]), "Bearer fresh");
}

#[tokio::test]
async fn transient_transport_error_retries_same_step() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_transport_error(TransportErrorKind::Timeout);
    transport.push_success(upstream_success("second try"));

    let router = router(
        transport.clone(),
        pool_with(&[1]),
        Arc::new(CountingAuth { calls: AtomicUsize::new(0) }),
    );

    let bytes = router
        .execute(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap();
    let response: JsonValue = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(response["choices"][0]["message"]["content"], "second try");
    assert_eq!(transport.seen().len(), 2);
}

#[tokio::test]
async fn permanent_client_error_surfaces_without_retry() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_status(404, Vec::new(), "{\"error\":{\"message\":\"no model\"}}");

    let pool = pool_with(&[1, 2]);
    let router = router(
        transport.clone(),
        pool.clone(),
        Arc::new(CountingAuth { calls: AtomicUsize::new(0) }),
    );

    let error = router
        .execute(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::Upstream { status: 404, .. }));
    assert_eq!(transport.seen().len(), 1);
    // The credential is unaffected.
    assert_eq!(pool.snapshot()[0].status, CredentialStatus::Active);
}

fn stream_reply(frames: Vec<String>) -> Reply {
    Box::new(move || {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(async move {
            for frame in frames {
                if tx.send(Bytes::from(frame)).await.is_err() {
                    return;
                }
            }
        });
        Ok(TransportResponse {
            status: 200,
            headers: Vec::new(),
            body: TransportBody::Stream(rx),
        })
    })
}

#[tokio::test]
async fn stream_forwards_frames_and_synthesizes_stop() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push(stream_reply(vec![
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [{"text": "he"}]}}]}})
            .to_string()
            + "\n",
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [{"text": "llo"}]}}]}})
            .to_string()
            + "\n",
    ]));

    let router = router(
        transport.clone(),
        pool_with(&[1]),
        Arc::new(CountingAuth { calls: AtomicUsize::new(0) }),
    );

    let mut rx = router
        .execute_stream(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap();

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(serde_json::from_slice::<JsonValue>(&frame.data).unwrap());
    }

    // One event per upstream frame plus a synthesized terminal stop.
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["choices"][0]["delta"]["content"], "he");
    assert_eq!(frames[1]["choices"][0]["delta"]["content"], "llo");
    assert_eq!(frames[2]["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn midstream_error_becomes_terminal_event() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push(stream_reply(vec![
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [{"text": "partial"}]}}]}})
            .to_string()
            + "\n",
        json!({"error": {"code": 503, "message": "backend unavailable"}}).to_string() + "\n",
    ]));

    let router = router(
        transport.clone(),
        pool_with(&[1, 2]),
        Arc::new(CountingAuth { calls: AtomicUsize::new(0) }),
    );

    let mut rx = router
        .execute_stream(ClientDialect::OpenAi, &chat_body(), &RequestContext::default())
        .await
        .unwrap();

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(serde_json::from_slice::<JsonValue>(&frame.data).unwrap());
    }

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["choices"][0]["delta"]["content"], "partial");
    assert_eq!(frames[1]["error"]["code"], 503);
    // A partial response was already emitted: no failover to credential 2.
    assert_eq!(transport.seen().len(), 1);
}

#[tokio::test]
async fn claude_stream_carries_event_names() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push(stream_reply(vec![
        json!({"response": {"candidates": [{
            "content": {"role": "model", "parts": [{"text": "hi"}]},
            "finishReason": "STOP"
        }]}})
        .to_string()
            + "\n",
    ]));

    let router = router(
        transport.clone(),
        pool_with(&[1]),
        Arc::new(CountingAuth { calls: AtomicUsize::new(0) }),
    );

    let body = json!({
        "model": "gemini-2.5-pro",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "hi"}]
    })
    .to_string();

    let mut rx = router
        .execute_stream(ClientDialect::Claude, body.as_bytes(), &RequestContext::default())
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Some(frame) = rx.recv().await {
        names.push(frame.event.unwrap());
    }
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}
