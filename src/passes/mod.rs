//! The three pass pipelines: `web-incoming`, `ws-incoming`, and
//! `web-outgoing`. Each submodule holds one pipeline's passes, run in a
//! fixed order; `ProxyServer` (see [`crate::server`]) owns per-instance
//! `Vec<Box<dyn _>>` copies built by `default_*_passes()` below and spliced
//! via [`crate::pass::insert_before`] / [`crate::pass::insert_after`].

pub mod web_incoming;
pub mod web_outgoing;
pub mod ws_incoming;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ProxyClient;
use crate::events::ProxyEvents;

pub use web_incoming::{default_web_passes, WebPass};
pub use web_outgoing::{default_web_outgoing_passes, WebOutgoingPass};
pub use ws_incoming::{default_ws_passes, WsPass};

/// Per-call error callback, matching `web(req, res, opts?, cb?)`'s trailing
/// error callback: when set, it wins over emitting the `error` event.
pub type ErrorCallback = Arc<dyn Fn(&crate::error::ProxyError) + Send + Sync>;

/// State shared by every pass in one `web()`/`ws()` call: the pooled
/// upstream clients, the event hook table, the pre-built `web-outgoing`
/// pipeline, and the optional per-call error callback.
#[derive(Clone)]
pub struct Shared {
    pub client: ProxyClient,
    pub events: Arc<ProxyEvents>,
    pub outgoing_passes: Arc<Vec<Box<dyn WebOutgoingPass>>>,
    pub error_callback: Option<ErrorCallback>,
    pub remote_addr: SocketAddr,
}

impl Shared {
    /// Route an error to the per-call callback if one is set, else the
    /// `error`/`econnreset` event.
    pub fn report_error(&self, err: &crate::error::ProxyError, info: &crate::events::RequestInfo) {
        if let Some(cb) = &self.error_callback {
            cb(err);
        } else if err.is_econnreset() {
            self.events.emit_econnreset(err, info);
        } else {
            self.events.emit_error(err, info);
        }
    }
}
