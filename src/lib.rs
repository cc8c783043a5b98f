//! corsgate - allow-listed HTTP forwarding proxy
//!
//! Accepts `<endpoint>?url=<target>`, checks the target's hostname against
//! a configured allow-list, re-issues the request there and relays the
//! reply with permissive CORS headers, so browser code can reach APIs that
//! do not serve CORS themselves.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod server;
