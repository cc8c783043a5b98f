//! In-process mock upstream and a raw HTTP client for end-to-end tests.

#![allow(dead_code)]

use corsgate::config::Config;
use corsgate::http::headers::Headers;
use corsgate::http::parser::{ParseError, parse_http_request};
use corsgate::http::request::Request;
use corsgate::proxy::ForwardProxy;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What the mock upstream does with each request.
#[derive(Clone)]
pub enum Behavior {
    /// Reply with a fixed status and JSON body
    Respond { status: u16, body: &'static [u8] },
    /// Reply 200 with the request body
    Echo,
    /// Read the request, then never answer
    Hang,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Request>>>,
}

impl MockUpstream {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (conns, reqs) = (connections.clone(), received.clone());
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                conns.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                let reqs = reqs.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut socket).await else {
                        return;
                    };
                    let body = request.body.clone();
                    reqs.lock().unwrap().push(request);

                    let (status, body) = match behavior {
                        Behavior::Respond { status, body } => (status, body.to_vec()),
                        Behavior::Echo => (200, body),
                        Behavior::Hang => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            return;
                        }
                    };
                    let head = format!(
                        "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    socket.write_all(head.as_bytes()).await.ok();
                    socket.write_all(&body).await.ok();
                    socket.shutdown().await.ok();
                });
            }
        });

        Self {
            addr,
            connections,
            received,
        }
    }

    /// Number of connections the upstream has accepted.
    pub fn hits(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.received.lock().unwrap().clone()
    }
}

/// Largest request body the mock upstream accepts.
const MOCK_BODY_LIMIT: usize = 64 * 1024 * 1024;

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match parse_http_request(&buf, MOCK_BODY_LIMIT) {
            Ok((request, _)) => return Some(request),
            Err(ParseError::Incomplete) => {}
            Err(_) => return None,
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Config allowing only `api.example.com`, with hostnames pinned to mocks.
pub fn config(resolve: &[(&str, SocketAddr)]) -> Config {
    Config {
        allowed_hosts: vec!["api.example.com".to_string()],
        resolve: resolve
            .iter()
            .map(|(host, addr)| (host.to_string(), *addr))
            .collect::<HashMap<_, _>>(),
        ..Config::default()
    }
}

/// Starts the proxy on an ephemeral port and returns its address.
pub async fn start_proxy(cfg: Config) -> SocketAddr {
    let proxy = Arc::new(ForwardProxy::new(&cfg).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(corsgate::server::serve(listener, proxy, cfg.max_request_body));
    addr
}

/// `/p?url=<target>` with the target percent-encoded.
pub fn proxy_target(target: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    format!("/p?url={encoded}")
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Writes `raw` to the proxy and reads one response until the proxy closes
/// the connection. Callers send `Connection: close`.
pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    parse_response(&buf).0
}

/// Sends a request with `Connection: close` and the given extra headers.
pub async fn send(
    addr: SocketAddr,
    method: &str,
    target: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> RawResponse {
    let mut raw = format!("{method} {target} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    for (k, v) in headers {
        raw.push_str(&format!("{k}: {v}\r\n"));
    }
    if !body.is_empty() {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    raw.push_str("\r\n");
    let mut bytes = raw.into_bytes();
    bytes.extend_from_slice(body);
    send_raw(addr, &bytes).await
}

/// Parses one response from the front of `buf`, framed by Content-Length.
/// Returns the response and the bytes consumed.
pub fn parse_response(buf: &[u8]) -> (RawResponse, usize) {
    let end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head");
    let head = std::str::from_utf8(&buf[..end]).unwrap();
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .unwrap()
        .split(' ')
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let mut headers = Headers::new();
    for line in lines {
        let (k, v) = line.split_once(':').unwrap();
        headers.append(k.trim(), v.trim());
    }
    let len: usize = headers
        .get("content-length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);
    let start = end + 4;
    let body = buf[start..start + len].to_vec();
    (
        RawResponse {
            status,
            headers,
            body,
        },
        start + len,
    )
}
