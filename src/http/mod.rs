//! HTTP/1.1 server side of the proxy.
//!
//! # Architecture
//!
//! - **`connection`**: per-client request/response state machine
//! - **`parser`**: parses requests out of the connection buffer
//! - **`chunked`**: `Transfer-Encoding: chunked` decoding, shared with the upstream client
//! - **`headers`**: ordered, case-insensitive header map
//! - **`request`** / **`response`**: message types and builders
//! - **`writer`**: serializes and writes responses
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received (malformed → error response, close)
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Validate and forward upstream
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod chunked;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
