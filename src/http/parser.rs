use crate::http::chunked::{self, ChunkError};
use crate::http::headers::Headers;
use crate::http::request::{Method, Request};

/// Upper bound on the request line plus header section.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidVersion,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    HeadersTooLarge,
    BodyTooLarge,
    Incomplete,
}

/// Parses one request from the front of `buf`.
///
/// On success returns the request and the number of bytes it occupied, so a
/// keep-alive connection can keep any pipelined bytes that follow. Bodies
/// longer than `max_body` are refused with [`ParseError::BodyTooLarge`].
pub fn parse_http_request(buf: &[u8], max_body: usize) -> Result<(Request, usize), ParseError> {
    RequestParser::new(max_body).parse(buf)
}

/// Incremental request parser for one connection.
///
/// Once the head of a request is parsed it is kept, together with the body
/// decoding progress, until the body is complete. Between calls the buffer
/// may only grow at the end; after a request is returned the caller drops
/// the consumed bytes and the next call starts a new request.
#[derive(Debug)]
pub struct RequestParser {
    max_body: usize,
    pending: Option<PendingRequest>,
}

/// A parsed head waiting for its body.
#[derive(Debug)]
struct PendingRequest {
    method: Method,
    target: String,
    version: String,
    headers: Headers,
    body_start: usize,
    framing: BodyFraming,
}

#[derive(Debug)]
enum BodyFraming {
    Length(usize),
    Chunked(chunked::Decoder),
}

impl RequestParser {
    pub fn new(max_body: usize) -> Self {
        Self {
            max_body,
            pending: None,
        }
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }

    /// True while a head carrying `Expect: 100-continue` waits for its body.
    pub fn expects_continue(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| {
            p.version == "HTTP/1.1" && p.headers.has_token("Expect", "100-continue")
        })
    }

    /// Parses the request at the front of `buf`, resuming where the last
    /// call stopped. [`ParseError::Incomplete`] asks for more input.
    pub fn parse(&mut self, buf: &[u8]) -> Result<(Request, usize), ParseError> {
        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => parse_head(buf, self.max_body)?,
        };

        let body_bytes = &buf[pending.body_start..];
        let complete = match &mut pending.framing {
            BodyFraming::Length(len) => (body_bytes.len() >= *len)
                .then(|| (body_bytes[..*len].to_vec(), *len)),
            BodyFraming::Chunked(decoder) => {
                decoder
                    .feed(body_bytes, self.max_body)
                    .map_err(|e| match e {
                        ChunkError::TooLarge => ParseError::BodyTooLarge,
                        _ => ParseError::InvalidChunk,
                    })?
            }
        };

        let Some((body, used)) = complete else {
            self.pending = Some(pending);
            return Err(ParseError::Incomplete);
        };

        let consumed = pending.body_start + used;
        let request = Request {
            method: pending.method,
            target: pending.target,
            version: pending.version,
            headers: pending.headers,
            body,
        };
        Ok((request, consumed))
    }
}

/// Parses the request line and header section.
fn parse_head(buf: &[u8], max_body: usize) -> Result<PendingRequest, ParseError> {
    // Look for header/body separator
    let Some(headers_end) = find_headers_end(buf) else {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(ParseError::HeadersTooLarge);
        }
        return Err(ParseError::Incomplete);
    };
    if headers_end > MAX_HEADER_SIZE {
        return Err(ParseError::HeadersTooLarge);
    }

    let header_bytes = &buf[..headers_end];

    let headers_str = std::str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(ParseError::InvalidVersion);
    }

    // Headers
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    // Body framing
    let framing = if headers.has_token("Transfer-Encoding", "chunked") {
        BodyFraming::Chunked(chunked::Decoder::new())
    } else {
        let content_length = content_length(&headers)?.unwrap_or(0);
        if content_length > max_body {
            return Err(ParseError::BodyTooLarge);
        }
        BodyFraming::Length(content_length)
    };

    Ok(PendingRequest {
        method,
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body_start: headers_end + 4,
        framing,
    })
}

/// Reads `Content-Length`, refusing conflicting duplicate values.
pub fn content_length(headers: &Headers) -> Result<Option<usize>, ParseError> {
    let mut found = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        if found.is_some_and(|prev| prev != parsed) {
            return Err(ParseError::InvalidContentLength);
        }
        found = Some(parsed);
    }
    Ok(found)
}

pub(crate) fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
