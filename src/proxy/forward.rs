//! The forwarding operation.
//!
//! A request to the proxy endpoint is checked in a fixed order (target
//! parameter present, target parses, host allowed) and only then re-issued
//! upstream. Every stage short-circuits, so rejected requests never cause
//! network activity.

use crate::config::Config;
use crate::error::{ErrorKind, ProxyError, Result};
use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::proxy::allow_list::AllowList;
use crate::proxy::cors;
use crate::proxy::upstream::{UpstreamClient, UpstreamError};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Query parameter carrying the target URL.
pub const TARGET_PARAM: &str = "url";

/// Headers that describe one connection and are never relayed.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "TE",
    "Trailer",
    "Upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A request about to be re-issued upstream.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub url: Url,
    /// Inbound headers minus `Host`, hop-by-hop headers, `Expect` and
    /// `Content-Length`
    pub headers: Headers,
    /// `None` for GET and HEAD
    pub body: Option<Vec<u8>>,
}

impl ForwardRequest {
    /// Derives the outbound request from an inbound one.
    pub fn new(inbound: &Request, url: Url) -> Self {
        let mut headers = inbound.headers.clone();
        // Tokens listed in Connection name further per-hop headers.
        let listed: Vec<String> = headers
            .get_all("Connection")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        headers.retain(|name, _| {
            !is_hop_by_hop(name)
                && !name.eq_ignore_ascii_case("Host")
                && !name.eq_ignore_ascii_case("Content-Length")
                && !name.eq_ignore_ascii_case("Expect")
                && !listed.iter().any(|t| t.eq_ignore_ascii_case(name))
        });

        let body = inbound
            .method
            .allows_body()
            .then(|| inbound.body.clone());

        Self {
            method: inbound.method.clone(),
            url,
            headers,
            body,
        }
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// An upstream reply, buffered.
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ForwardResponse {
    /// Converts into the response for the original caller: status and body
    /// unchanged, end-to-end headers relayed, CORS headers ours.
    ///
    /// For HEAD the upstream `Content-Length` is kept since no body follows.
    pub fn into_response(self, head_request: bool) -> Response {
        let mut headers = self.headers;
        headers.retain(|name, _| {
            !is_hop_by_hop(name) && (head_request || !name.eq_ignore_ascii_case("Content-Length"))
        });
        cors::apply(&mut headers);

        ResponseBuilder::new(self.status)
            .headers(headers)
            .body(self.body)
            .build()
    }
}

/// Stage 1 and 2: the target parameter is present and is an absolute
/// `http`/`https` URL with a host.
pub fn parse_target(request: &Request) -> Result<Url> {
    let raw = request
        .query_param(TARGET_PARAM)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ProxyError::MissingTarget {
            param: TARGET_PARAM,
        })?;

    let url = Url::parse(raw.trim()).map_err(|e| ProxyError::InvalidTarget {
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidTarget {
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProxyError::InvalidTarget {
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

/// The forwarding proxy: allow-list, endpoint and upstream client.
///
/// Read-only after construction; one instance is shared by all
/// connection tasks.
pub struct ForwardProxy {
    allow_list: AllowList,
    endpoint: String,
    client: UpstreamClient,
}

impl ForwardProxy {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let allow_list = AllowList::new(&cfg.allowed_hosts);
        if allow_list.is_empty() {
            anyhow::bail!("allow-list is empty");
        }
        Ok(Self {
            allow_list,
            endpoint: cfg.endpoint.clone(),
            client: UpstreamClient::new(cfg)?,
        })
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Answers one inbound request. Never fails: errors become JSON error
    /// responses, and every response carries the CORS headers.
    pub async fn handle(&self, request: &Request) -> Response {
        let started = Instant::now();

        if request.path() != self.endpoint {
            let err = ProxyError::NotFound {
                path: request.path().to_string(),
            };
            debug!(method = %request.method, path = request.path(), "No route");
            return error_response(&err);
        }

        if cors::is_preflight(request) {
            debug!("Answered CORS preflight");
            return cors::preflight_response(request);
        }

        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                log_failure(request, &err, started);
                error_response(&err)
            }
        }
    }

    /// Validates and forwards `request`, relaying the upstream reply.
    pub async fn forward(&self, request: &Request) -> Result<Response> {
        let outbound = self.authorize(request)?;

        debug!(
            method = %outbound.method,
            host = outbound.host(),
            path = outbound.url.path(),
            "Forwarding request upstream"
        );

        let started = Instant::now();
        let reply = self
            .client
            .send(&outbound)
            .await
            .map_err(|e| classify(outbound.host(), e))?;

        info!(
            method = %outbound.method,
            host = outbound.host(),
            status = reply.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request forwarded"
        );

        Ok(reply.into_response(request.method == Method::HEAD))
    }

    /// Stages 1 to 3. Returns the outbound request only if every check
    /// passes.
    pub fn authorize(&self, request: &Request) -> Result<ForwardRequest> {
        let url = parse_target(request)?;

        if !self.allow_list.permits(&url) {
            return Err(ProxyError::HostDenied {
                host: url.host_str().unwrap_or_default().to_string(),
                allowed: self.allow_list.hosts().to_vec(),
            });
        }

        Ok(ForwardRequest::new(request, url))
    }
}

/// JSON error response with CORS headers.
pub fn error_response(err: &ProxyError) -> Response {
    let mut response = err.to_response();
    cors::apply(&mut response.headers);
    response
}

fn classify(host: &str, err: UpstreamError) -> ProxyError {
    match err {
        UpstreamError::Timeout(after) => ProxyError::UpstreamTimeout {
            host: host.to_string(),
            after,
        },
        e if e.is_network() => ProxyError::Upstream {
            host: host.to_string(),
            reason: e.to_string(),
        },
        e => ProxyError::Internal {
            host: host.to_string(),
            reason: e.to_string(),
        },
    }
}

/// Logs a failed request. Only the method, target host and error are
/// recorded: bodies, header values and query strings may carry API keys.
fn log_failure(request: &Request, err: &ProxyError, started: Instant) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let host = match err {
        ProxyError::HostDenied { host, .. }
        | ProxyError::Upstream { host, .. }
        | ProxyError::UpstreamTimeout { host, .. }
        | ProxyError::Internal { host, .. } => host.as_str(),
        _ => "",
    };

    match err.kind() {
        ErrorKind::InvalidRequest | ErrorKind::NotFound => {
            debug!(method = %request.method, error = %err, "Rejected invalid request");
        }
        ErrorKind::Forbidden => {
            warn!(method = %request.method, host, "Rejected request to host outside allow-list");
        }
        ErrorKind::UpstreamFailure => {
            error!(method = %request.method, host, elapsed_ms, error = %err, "Upstream request failed");
        }
        ErrorKind::InternalError => {
            error!(method = %request.method, host, elapsed_ms, error = %err, "Forwarding failed");
        }
    }
}
