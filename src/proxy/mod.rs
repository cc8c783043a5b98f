//! Allow-listed forwarding
//!
//! This module implements the proxy itself: the hostname allow-list, CORS
//! handling, request validation and forwarding, and the upstream client.

pub mod allow_list;
pub mod cors;
pub mod forward;
pub mod upstream;

pub use allow_list::AllowList;
pub use forward::{ForwardProxy, ForwardRequest, ForwardResponse};
pub use upstream::{UpstreamClient, UpstreamError};
