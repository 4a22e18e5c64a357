//! A programmable HTTP/HTTPS/WebSocket reverse-proxy core library, modeled
//! on the pass-pipeline design of node-http-proxy: inbound requests run
//! through an ordered, spliceable list of named passes that compute an
//! outgoing request descriptor, dispatch it upstream, and replay the
//! response back to the client.
//!
//! Built on `hyper`/`hyper-util` for connection pooling, upgrade splicing,
//! and CONNECT tunneling, with a configurable `target`/`forward` model so
//! embedding applications can point the proxy at whatever upstream they
//! need rather than a fixed routing table.

pub mod client;
pub mod cookies;
pub mod error;
pub mod events;
pub mod options;
pub mod outgoing;
pub mod pass;
pub mod passes;
pub mod server;

pub use client::{boxed, BoxBody, ProxyClient};
pub use error::ProxyError;
pub use events::{ProxyEvents, RequestInfo, ResponseInfo};
pub use options::{CookieRewrite, ProxyOptions, ResolvedOptions, SslConfig, Target, TargetSpec, TlsMaterial};
pub use server::{ListenHandle, Pipeline, PipelinePass, ProxyServer};
