use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;
use crate::http::parser::{ParseError, RequestParser};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::forward::{ForwardProxy, error_response};

/// Interim answer to `Expect: 100-continue`.
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

pub struct Connection<S> {
    stream: S,
    buffer: Vec<u8>,
    state: ConnectionState,
    proxy: Arc<ForwardProxy>,
    parser: RequestParser,
    continue_sent: bool,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, proxy: Arc<ForwardProxy>, max_body: usize) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            proxy,
            parser: RequestParser::new(max_body),
            continue_sent: false,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match &mut self.state {
                ConnectionState::Reading => match self.read_request().await {
                    Ok(Some(req)) => {
                        self.state = ConnectionState::Processing(req);
                    }
                    Ok(None) => {
                        self.state = ConnectionState::Closed;
                    }
                    Err(err) => {
                        // Answer, then drop the connection: the stream
                        // position is unknown after a bad request.
                        tracing::debug!(error = %err, "Rejecting malformed request");
                        let mut response = error_response(&err);
                        response.headers.insert("Connection", "close");
                        let writer = ResponseWriter::new(&response, true);
                        self.state = ConnectionState::Writing(writer, false);
                    }
                },

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let mut response = self.proxy.handle(req).await;
                    finish_headers(&mut response, keep_alive);

                    let include_body = req.method != Method::HEAD;
                    let writer = ResponseWriter::new(&response, include_body);
                    self.state = ConnectionState::Writing(writer, keep_alive);
                }

                ConnectionState::Writing(writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if *keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Reads until one full request is buffered. `Ok(None)` means the client
    /// closed the connection between requests.
    pub async fn read_request(&mut self) -> Result<Option<Request>, ProxyError> {
        loop {
            // Try parsing whatever we already have
            if !self.buffer.is_empty() {
                match self.parser.parse(&self.buffer) {
                    Ok((request, consumed)) => {
                        // Remove consumed bytes
                        self.buffer.drain(..consumed);
                        self.continue_sent = false;
                        return Ok(Some(request));
                    }

                    Err(ParseError::Incomplete) => {
                        // Need more data → fall through to read
                        if self.parser.expects_continue() && !self.continue_sent {
                            self.send_continue().await?;
                        }
                    }

                    Err(e) => return Err(parse_failure(e, self.parser.max_body())),
                }
            }

            // Read more data
            let mut temp = [0u8; 4096];
            let n = self
                .stream
                .read(&mut temp)
                .await
                .map_err(|e| ProxyError::MalformedRequest {
                    reason: e.to_string(),
                })?;

            if n == 0 {
                if self.buffer.is_empty() {
                    // Client closed connection
                    return Ok(None);
                }
                return Err(ProxyError::MalformedRequest {
                    reason: "connection closed mid-request".to_string(),
                });
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }

    async fn send_continue(&mut self) -> Result<(), ProxyError> {
        let io_failure = |e: std::io::Error| ProxyError::MalformedRequest {
            reason: e.to_string(),
        };
        self.stream.write_all(CONTINUE).await.map_err(io_failure)?;
        self.stream.flush().await.map_err(io_failure)?;
        self.continue_sent = true;
        Ok(())
    }
}

fn finish_headers(response: &mut Response, keep_alive: bool) {
    if !keep_alive {
        response.headers.insert("Connection", "close");
    }
}

fn parse_failure(err: ParseError, max_body: usize) -> ProxyError {
    match err {
        ParseError::BodyTooLarge => ProxyError::PayloadTooLarge { limit: max_body },
        ParseError::HeadersTooLarge => ProxyError::HeadersTooLarge,
        other => ProxyError::MalformedRequest {
            reason: format!("{other:?}"),
        },
    }
}
