//! The `RoundTrip` seam and its default `wreq` implementation.
//!
//! Providers that need TLS-fingerprint impersonation get their own transport
//! injected per provider; everything else shares the default client.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::Method;
use wreq::{Client, Proxy};

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub streaming: bool,
}

#[derive(Debug)]
pub enum TransportBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: TransportBody,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Collects the body, whichever form it arrived in.
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            TransportBody::Bytes(bytes) => bytes,
            TransportBody::Stream(mut rx) => {
                let mut buffer = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    buffer.extend_from_slice(&chunk);
                }
                Bytes::from(buffer)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// The single capability the router needs from HTTP.
pub trait RoundTrip: Send + Sync {
    fn round_trip<'a>(
        &'a self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct WreqTransportConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// A streaming body that stalls longer than this is closed; the
    /// streaming adapter then synthesizes a terminal event.
    pub stream_idle_timeout: Duration,
}

impl Default for WreqTransportConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

pub struct WreqTransport {
    client: Client,
    stream_idle_timeout: Duration,
}

impl WreqTransport {
    pub fn new(config: WreqTransportConfig) -> Result<Self, wreq::Error> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            stream_idle_timeout: config.stream_idle_timeout,
        })
    }
}

impl RoundTrip for WreqTransport {
    fn round_trip<'a>(
        &'a self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let method = wreq_method(&request.method);
            let mut builder = self.client.request(method, &request.url);
            for (key, value) in &request.headers {
                builder = builder.header(key, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(map_wreq_error)?;
            convert_response(response, request.streaming, self.stream_idle_timeout).await
        })
    }
}

fn wreq_method(method: &Method) -> wreq::Method {
    if *method == Method::GET {
        wreq::Method::GET
    } else if *method == Method::PUT {
        wreq::Method::PUT
    } else if *method == Method::DELETE {
        wreq::Method::DELETE
    } else if *method == Method::PATCH {
        wreq::Method::PATCH
    } else {
        wreq::Method::POST
    }
}

async fn convert_response(
    response: wreq::Response,
    want_stream: bool,
    idle_timeout: Duration,
) -> Result<TransportResponse, TransportError> {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(key, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (key.as_str().to_string(), value.to_string()))
        })
        .collect();

    let success = (200..300).contains(&status);
    if !success || !want_stream {
        let body = response.bytes().await.map_err(map_wreq_error)?;
        return Ok(TransportResponse {
            status,
            headers,
            body: TransportBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let Ok(item) = next else {
                break;
            };
            let Some(item) = item else {
                break;
            };
            let Ok(chunk) = item else {
                break;
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(TransportResponse {
        status,
        headers,
        body: TransportBody::Stream(rx),
    })
}

fn map_wreq_error(error: wreq::Error) -> TransportError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    let kind = if error.is_timeout() {
        if lower.contains("read") || lower.contains("idle") {
            TransportErrorKind::ReadTimeout
        } else {
            TransportErrorKind::Timeout
        }
    } else if error.is_connect() {
        if lower.contains("dns") || lower.contains("resolve") {
            TransportErrorKind::Dns
        } else if lower.contains("tls") || lower.contains("ssl") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if lower.contains("tls") || lower.contains("ssl") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    TransportError { kind, message }
}
