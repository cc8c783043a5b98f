//! Permissive CORS headers.
//!
//! Added to every response the proxy writes, error responses included, so
//! browser callers can always read the result.

use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::Response;

pub const ALLOW_ORIGIN: &str = "*";
pub const ALLOW_HEADERS: &str = "Content-Type, Authorization, x-api-key";
pub const ALLOW_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Replaces any upstream `Access-Control-*` headers with ours.
pub fn apply(headers: &mut Headers) {
    headers.retain(|name, _| !is_cors_header(name));
    headers.append("Access-Control-Allow-Origin", ALLOW_ORIGIN);
    headers.append("Access-Control-Allow-Headers", ALLOW_HEADERS);
}

pub fn is_cors_header(name: &str) -> bool {
    name.get(..15)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("access-control-"))
}

/// A browser preflight: `OPTIONS` with `Access-Control-Request-Method`.
pub fn is_preflight(request: &Request) -> bool {
    request.method == Method::OPTIONS && request.headers.contains("Access-Control-Request-Method")
}

/// Answers a preflight locally. Headers the browser announced are allowed
/// on top of the default list.
pub fn preflight_response(request: &Request) -> Response {
    let mut allowed: Vec<String> = ALLOW_HEADERS.split(", ").map(str::to_string).collect();
    for requested in request
        .headers
        .get_all("Access-Control-Request-Headers")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|h| !h.is_empty())
    {
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(requested)) {
            allowed.push(requested.to_string());
        }
    }

    let mut response = Response::no_content();
    apply(&mut response.headers);
    response
        .headers
        .insert("Access-Control-Allow-Headers", allowed.join(", "));
    response
        .headers
        .append("Access-Control-Allow-Methods", ALLOW_METHODS);
    response
}
