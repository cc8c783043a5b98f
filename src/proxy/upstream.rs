//! Upstream connection and request forwarding
//!
//! Opens a fresh connection per forwarded request (plain TCP for `http`,
//! rustls for `https`), writes the request with `Connection: close`, and
//! buffers the complete response. The whole exchange runs under one
//! timeout.

use crate::config::Config;
use crate::http::chunked::{self, ChunkError};
use crate::http::headers::Headers;
use crate::http::parser::{self, MAX_HEADER_SIZE};
use crate::http::request::Method;
use crate::http::response::StatusCode;
use crate::proxy::forward::{ForwardRequest, ForwardResponse};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

/// Default buffer size for reads
const BUFFER_SIZE: usize = 8192;

/// Failures of a single upstream exchange.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("DNS resolution failed: {0}")]
    Resolve(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("sending request failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("connection lost before a response arrived: {0}")]
    Disconnected(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("reading response body failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl UpstreamError {
    /// True for failures reaching the upstream at all, as opposed to
    /// failures handling what it sent back.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            UpstreamError::Resolve(_)
                | UpstreamError::Connect(_)
                | UpstreamError::Tls(_)
                | UpstreamError::Send(_)
                | UpstreamError::Disconnected(_)
                | UpstreamError::Timeout(_)
        )
    }
}

type Result<T> = std::result::Result<T, UpstreamError>;

trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Sends forward requests to upstream servers.
pub struct UpstreamClient {
    /// Shared TLS connector, built once with the webpki root store
    tls_connector: TlsConnector,

    /// TCP connect timeout per address
    connect_timeout: Duration,

    /// Bound on the whole exchange
    request_timeout: Duration,

    /// Largest response body buffered
    max_response_body: usize,

    /// Hostname to address overrides (lower-cased keys)
    resolve: HashMap<String, SocketAddr>,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
            connect_timeout: cfg.connect_timeout(),
            request_timeout: cfg.upstream_timeout(),
            max_response_body: cfg.max_response_body,
            resolve: cfg
                .resolve
                .iter()
                .map(|(host, addr)| (host.to_ascii_lowercase(), *addr))
                .collect(),
        })
    }

    /// Forwards `request` and returns the buffered upstream response.
    ///
    /// At most once: a failed exchange is reported, never retried.
    pub async fn send(&self, request: &ForwardRequest) -> Result<ForwardResponse> {
        timeout(self.request_timeout, self.exchange(request))
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout))?
    }

    async fn exchange(&self, request: &ForwardRequest) -> Result<ForwardResponse> {
        let mut stream = self.connect(&request.url).await?;

        let request_bytes = build_http_request(request);
        stream
            .write_all(&request_bytes)
            .await
            .map_err(UpstreamError::Send)?;
        stream.flush().await.map_err(UpstreamError::Send)?;

        tracing::trace!(host = request.host(), "Request sent to upstream");

        let head_request = request.method == Method::HEAD;
        self.read_http_response(&mut stream, head_request).await
    }

    async fn connect(&self, url: &Url) -> Result<Box<dyn UpstreamIo>> {
        let port = url
            .port_or_known_default()
            .ok_or_else(|| UpstreamError::Connect("no port for scheme".to_string()))?;
        let (server_name, addrs) = self.resolve_target(url, port).await?;

        let tcp = self.connect_any(&addrs).await?;

        if url.scheme() != "https" {
            return Ok(Box::new(tcp));
        }

        let name = rustls::pki_types::ServerName::try_from(server_name)
            .map_err(|_| UpstreamError::Tls("invalid server name".to_string()))?;
        let tls = self
            .tls_connector
            .connect(name, tcp)
            .await
            .map_err(|e| UpstreamError::Tls(e.to_string()))?;
        Ok(Box::new(tls))
    }

    /// Returns the TLS server name and the addresses to try.
    async fn resolve_target(&self, url: &Url, port: u16) -> Result<(String, Vec<SocketAddr>)> {
        match url.host() {
            Some(Host::Domain(domain)) => {
                if let Some(addr) = self.resolve.get(&domain.to_ascii_lowercase()) {
                    return Ok((domain.to_string(), vec![*addr]));
                }
                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain, port))
                    .await
                    .map_err(|e| UpstreamError::Resolve(e.to_string()))?
                    .collect();
                if addrs.is_empty() {
                    return Err(UpstreamError::Resolve(format!("no addresses for {domain}")));
                }
                Ok((domain.to_string(), addrs))
            }
            Some(Host::Ipv4(ip)) => Ok((ip.to_string(), vec![SocketAddr::new(ip.into(), port)])),
            Some(Host::Ipv6(ip)) => Ok((ip.to_string(), vec![SocketAddr::new(ip.into(), port)])),
            None => Err(UpstreamError::Resolve("target has no host".to_string())),
        }
    }

    async fn connect_any(&self, addrs: &[SocketAddr]) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    tracing::debug!(%addr, error = %e, "Upstream connect failed");
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    tracing::debug!(%addr, "Upstream connect timed out");
                    last_err = Some("connection timed out".to_string());
                }
            }
        }
        Err(UpstreamError::Connect(
            last_err.unwrap_or_else(|| "no addresses to connect to".to_string()),
        ))
    }

    /// Read HTTP response from upstream
    async fn read_http_response<S>(&self, stream: &mut S, head_request: bool) -> Result<ForwardResponse>
    where
        S: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            if let Some(headers_end) = parser::find_headers_end(&buffer) {
                let head = buffer.split_to(headers_end + 4);
                let (status, headers) = parse_response_head(&head)?;

                // Interim responses precede the real one.
                if (100..200).contains(&status.as_u16()) {
                    continue;
                }

                let body = if head_request || status.is_bodyless() {
                    Vec::new()
                } else {
                    self.read_response_body(stream, &mut buffer, &headers).await?
                };

                return Ok(ForwardResponse {
                    status,
                    headers,
                    body,
                });
            }

            // Prevent unbounded header growth
            if buffer.len() > MAX_HEADER_SIZE {
                return Err(UpstreamError::Protocol("response headers too large".to_string()));
            }

            let n = stream
                .read_buf(&mut buffer)
                .await
                .map_err(|e| UpstreamError::Disconnected(e.to_string()))?;
            if n == 0 {
                return Err(UpstreamError::Disconnected(
                    "connection closed before complete response headers".to_string(),
                ));
            }
        }
    }

    /// Read the body using whichever framing the upstream chose
    async fn read_response_body<S>(
        &self,
        stream: &mut S,
        buffer: &mut BytesMut,
        headers: &Headers,
    ) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        let limit = self.max_response_body;

        if headers.has_token("Transfer-Encoding", "chunked") {
            return read_chunked_body(stream, buffer, limit).await;
        }

        let content_length = parser::content_length(headers)
            .map_err(|_| UpstreamError::Protocol("invalid Content-Length".to_string()))?;

        let Some(content_length) = content_length else {
            // No framing: the body runs until the connection closes.
            let mut body = buffer.to_vec();
            buffer.clear();
            loop {
                if body.len() > limit {
                    return Err(UpstreamError::BodyTooLarge(limit));
                }
                let n = stream.read_buf(buffer).await.map_err(UpstreamError::Read)?;
                if n == 0 {
                    return Ok(body);
                }
                body.extend_from_slice(&buffer[..]);
                buffer.clear();
            }
        };

        if content_length > limit {
            return Err(UpstreamError::BodyTooLarge(limit));
        }

        let mut body = Vec::with_capacity(content_length);

        // Use existing buffer data first
        let from_buffer = buffer.len().min(content_length);
        body.extend_from_slice(&buffer[..from_buffer]);
        buffer.advance(from_buffer);

        // Read remaining bytes
        let mut chunk = [0u8; BUFFER_SIZE];
        while body.len() < content_length {
            let to_read = (content_length - body.len()).min(BUFFER_SIZE);
            let n = stream
                .read(&mut chunk[..to_read])
                .await
                .map_err(UpstreamError::Read)?;

            if n == 0 {
                return Err(UpstreamError::Protocol(
                    "connection closed before complete body received".to_string(),
                ));
            }

            body.extend_from_slice(&chunk[..n]);
        }

        Ok(body)
    }
}

async fn read_chunked_body<S>(stream: &mut S, buffer: &mut BytesMut, limit: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut decoder = chunked::Decoder::new();
    loop {
        match decoder.feed(buffer, limit) {
            Ok(Some((body, _))) => return Ok(body),
            Ok(None) => {}
            Err(ChunkError::TooLarge) => return Err(UpstreamError::BodyTooLarge(limit)),
            Err(e) => return Err(UpstreamError::Protocol(format!("bad chunk: {e:?}"))),
        }

        if buffer.len() > limit.saturating_add(MAX_HEADER_SIZE) {
            return Err(UpstreamError::BodyTooLarge(limit));
        }

        let n = stream.read_buf(buffer).await.map_err(UpstreamError::Read)?;
        if n == 0 {
            return Err(UpstreamError::Protocol(
                "connection closed inside chunked body".to_string(),
            ));
        }
    }
}

/// Parse the status line and header fields of a response
fn parse_response_head(head: &[u8]) -> Result<(StatusCode, Headers)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| UpstreamError::Protocol("invalid UTF-8 in response headers".to_string()))?;

    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| UpstreamError::Protocol("empty response".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");

    if !version.starts_with("HTTP/") || code.len() != 3 {
        return Err(UpstreamError::Protocol(format!(
            "invalid status line: {status_line}"
        )));
    }

    let status = code
        .parse::<u16>()
        .ok()
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| UpstreamError::Protocol(format!("invalid status code: {code}")))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.append(key.trim(), value.trim());
        }
    }

    Ok((status, headers))
}

/// Builds the bytes of the outbound request.
///
/// `Host` comes from the target URL, `Content-Length` from the body that is
/// actually sent, and the connection is closed after one exchange.
pub fn build_http_request(request: &ForwardRequest) -> Vec<u8> {
    let mut buffer = Vec::new();

    let mut target = request.url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = request.url.query() {
        target.push('?');
        target.push_str(query);
    }

    buffer.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, target).as_bytes());
    buffer.extend_from_slice(format!("Host: {}\r\n", host_header(&request.url)).as_bytes());

    for (key, value) in request.headers.iter() {
        buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }

    if let Some(body) = &request.body {
        buffer.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buffer.extend_from_slice(b"Connection: close\r\n");

    // End of headers
    buffer.extend_from_slice(b"\r\n");

    if let Some(body) = &request.body {
        buffer.extend_from_slice(body);
    }

    buffer
}

/// `host[:port]`, with the port only when it differs from the scheme default.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> UpstreamClient {
        UpstreamClient::new(&Config::default()).unwrap()
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let raw = b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello".to_vec();
        let resp = client().read_http_response(&mut raw.as_slice(), false).await.unwrap();

        assert_eq!(resp.status.as_u16(), 201);
        assert_eq!(resp.body, b"hello");
        assert_eq!(resp.headers.get("x-a"), Some("b"));
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n0\r\n\r\n".to_vec();
        let resp = client().read_http_response(&mut raw.as_slice(), false).await.unwrap();

        assert_eq!(resp.body, b"{}");
    }

    #[tokio::test]
    async fn reads_until_eof_without_framing() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nstreamed until close".to_vec();
        let resp = client().read_http_response(&mut raw.as_slice(), false).await.unwrap();

        assert_eq!(resp.body, b"streamed until close");
    }

    #[tokio::test]
    async fn skips_interim_responses() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n".to_vec();
        let resp = client().read_http_response(&mut raw.as_slice(), false).await.unwrap();

        assert_eq!(resp.status.as_u16(), 204);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n".to_vec();
        let resp = client().read_http_response(&mut raw.as_slice(), true).await.unwrap();

        assert!(resp.body.is_empty());
        assert_eq!(resp.headers.get("content-length"), Some("42"));
    }

    #[tokio::test]
    async fn enforces_body_limit() {
        let cfg = Config {
            max_response_body: 4,
            ..Config::default()
        };
        let client = UpstreamClient::new(&cfg).unwrap();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789".to_vec();
        let err = client.read_http_response(&mut raw.as_slice(), false).await.unwrap_err();

        assert!(matches!(err, UpstreamError::BodyTooLarge(4)));
        assert!(!err.is_network());
    }

    #[tokio::test]
    async fn early_close_is_a_network_failure() {
        let raw: Vec<u8> = Vec::new();
        let err = client().read_http_response(&mut raw.as_slice(), false).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Disconnected(_)));
        assert!(err.is_network());
    }

    #[test]
    fn rejects_garbage_status_line() {
        assert!(parse_response_head(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 20 OK\r\n\r\n").is_err());
    }

    #[test]
    fn host_header_keeps_non_default_port() {
        assert_eq!(host_header(&Url::parse("https://api.example.com/x").unwrap()), "api.example.com");
        assert_eq!(host_header(&Url::parse("https://api.example.com:443/x").unwrap()), "api.example.com");
        assert_eq!(host_header(&Url::parse("http://127.0.0.1:9000/").unwrap()), "127.0.0.1:9000");
    }
}
