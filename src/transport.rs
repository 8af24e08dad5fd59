// src/transport.rs

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use async_trait::async_trait;
use reqwest::{Client, Method};
use thiserror::Error;
use tracing::{debug, trace};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime's admin API base: scheme plus `host[:port][/prefix]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl AsRef<str>) -> Self {
        Self {
            scheme,
            host: normalize_host(host.as_ref()),
        }
    }

    pub fn with_scheme(&self, scheme: Scheme) -> Self {
        Self {
            scheme,
            host: self.host.clone(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

/// Strip a leading `http://` / `https://` and any trailing `/` from an
/// operator-supplied runtime URL.
pub fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let without_scheme = if lower.starts_with("https://") {
        &trimmed[8..]
    } else if lower.starts_with("http://") {
        &trimmed[7..]
    } else {
        trimmed
    };
    without_scheme.trim_end_matches('/').to_string()
}

/// Certificate handling for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    #[default]
    Verify,
    /// Tolerate self-signed certificates between development runtimes.
    /// Scoped to the request carrying it.
    AcceptInvalidCerts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub tls: TlsPolicy,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            tls: TlsPolicy::Verify,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: vec![("Content-type".to_string(), CONTENT_TYPE_JSON.to_string())],
            body: Some(body.into()),
            tls: TlsPolicy::Verify,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn headers<I>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        headers.into_iter().fold(self, |req, (k, v)| req.header(k, v))
    }

    pub fn tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub status_message: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        let status_message = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            status,
            status_message,
            headers: HashMap::new(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    Other,
}

impl TransportErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorCode::ConnectionReset => "ECONNRESET",
            TransportErrorCode::ConnectionRefused => "ECONNREFUSED",
            TransportErrorCode::Timeout => "ETIMEDOUT",
            TransportErrorCode::Other => "EREQUEST",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Request Fail ({code}, url: {url}): {message}")]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub url: String,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn is_connection_reset(&self) -> bool {
        self.code == TransportErrorCode::ConnectionReset
    }
}

/// One HTTP(S) request/response exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// `reqwest`-backed transport. The shared client verifies certificates; a
/// request carrying [`TlsPolicy::AcceptInvalidCerts`] gets a throwaway client
/// of its own.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn client_for(&self, tls: TlsPolicy, url: &str) -> Result<Client, TransportError> {
        match tls {
            TlsPolicy::Verify => Ok(self.client.clone()),
            TlsPolicy::AcceptInvalidCerts => Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| TransportError::new(TransportErrorCode::Other, url, e.to_string())),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(name = "transport_send", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client_for(request.tls, &request.url)?;

        let mut builder = client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.method == Method::POST {
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| classify(&request.url, &e))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect::<HashMap<_, _>>();

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify(&request.url, &e))?
        {
            trace!(len = chunk.len(), "response chunk");
            bytes.extend_from_slice(&chunk);
        }

        debug!(status = status.as_u16(), "response complete");
        Ok(TransportResponse {
            status: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

fn classify(url: &str, err: &reqwest::Error) -> TransportError {
    let message = error_chain(err);
    let code = if err.is_timeout() {
        TransportErrorCode::Timeout
    } else if let Some(kind) = io_error_kind(err) {
        match kind {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportErrorCode::ConnectionReset,
            io::ErrorKind::ConnectionRefused => TransportErrorCode::ConnectionRefused,
            io::ErrorKind::TimedOut => TransportErrorCode::Timeout,
            _ => TransportErrorCode::Other,
        }
    } else if message.contains("connection closed before message completed")
        || message.contains("connection reset")
    {
        // hyper reports a peer hanging up mid-exchange without an io::Error
        TransportErrorCode::ConnectionReset
    } else {
        TransportErrorCode::Other
    };
    TransportError::new(code, url, message)
}

fn io_error_kind(err: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = e.source();
    }
    None
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[test]
    fn normalizes_operator_urls() {
        assert_eq!(normalize_host("http://127.0.0.1:1880/"), "127.0.0.1:1880");
        assert_eq!(normalize_host("HTTPS://box:1880"), "box:1880");
        assert_eq!(normalize_host("box:1880/admin/"), "box:1880/admin");
        assert_eq!(
            Endpoint::new(Scheme::Https, "http://box:1880/").url("/flows"),
            "https://box:1880/flows"
        );
    }

    #[test]
    fn header_replaces_case_insensitively() {
        let req = TransportRequest::post("http://x/flows", "[]").header("content-type", "text/plain");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header_value("Content-Type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn get_returns_status_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/flows")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":"t1","type":"tab"}]"#)
            .create_async()
            .await;

        let resp = HttpTransport::new()
            .send(TransportRequest::get(format!("{}/flows", server.url())))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.status_message, "OK");
        assert_eq!(resp.body, r#"[{"id":"t1","type":"tab"}]"#);
        assert_eq!(resp.headers.get("content-type").map(String::as_str), Some("application/json"));
    }

    #[tokio::test]
    async fn post_sends_headers_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/flows")
            .match_header("authorization", "Bearer abc")
            .match_header("content-type", CONTENT_TYPE_JSON)
            .match_body(Matcher::Exact("[]".into()))
            .with_status(204)
            .create_async()
            .await;

        let resp = HttpTransport::new()
            .send(
                TransportRequest::post(format!("{}/flows", server.url()), "[]")
                    .header("Authorization", "Bearer abc"),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_still_a_response() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/flows")
            .with_status(401)
            .create_async()
            .await;

        let resp = HttpTransport::new()
            .send(TransportRequest::get(format!("{}/flows", server.url())))
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
        assert_eq!(resp.status_message, "Unauthorized");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpTransport::new()
            .send(TransportRequest::get(format!("http://{addr}/flows")))
            .await
            .unwrap_err();
        assert_eq!(err.code, TransportErrorCode::ConnectionRefused);
        assert!(!err.is_connection_reset());
    }

    #[tokio::test]
    async fn peer_hanging_up_is_a_connection_reset() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let err = HttpTransport::new()
            .send(TransportRequest::get(format!("http://{addr}/flows")))
            .await
            .unwrap_err();
        assert!(err.is_connection_reset(), "unexpected error: {err:?}");
    }
}
