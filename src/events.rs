//! The event surface as a typed hook table rather than a string-keyed
//! emitter. Each slot is an optional boxed callback; `ProxyServer` owns one
//! `ProxyEvents` and consults it at well-defined points in the request
//! lifecycle (start, dispatch, response, end, and any error along the way).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::ProxyError;
use crate::outgoing::OutgoingRequest;

/// Snapshot of the inbound request, passed to hooks instead of the live
/// `hyper::Request` so hooks can't fight the pipeline over body ownership.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
}

/// Snapshot of the upstream response at `proxyRes` time.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Per-[`crate::server::ProxyServer`] event hooks. Unset slots are `None`;
/// `error` additionally tracks whether a caller has installed a listener
/// yet, so a fresh server can still report "no listener registered".
#[derive(Default)]
pub struct ProxyEvents {
    pub on_start: Option<Box<dyn Fn(&RequestInfo) + Send + Sync>>,
    pub on_proxy_req: Option<Box<dyn Fn(&OutgoingRequest, &RequestInfo) + Send + Sync>>,
    pub on_proxy_req_ws: Option<Box<dyn Fn(&OutgoingRequest, &RequestInfo) + Send + Sync>>,
    pub on_proxy_res: Option<Box<dyn Fn(&ResponseInfo, &RequestInfo) + Send + Sync>>,
    pub on_open: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_close: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_end: Option<Box<dyn Fn(&RequestInfo) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(&ProxyError, &RequestInfo) + Send + Sync>>,
    error_listener_set: AtomicBool,
}

impl std::fmt::Debug for ProxyEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEvents")
            .field(
                "has_default_error_listener",
                &self.has_default_error_listener(),
            )
            .finish()
    }
}

impl ProxyEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the `error` hook, leaving the "default listener" state.
    /// Once a caller installs a hook, errors stop being logged by the
    /// default listener and are routed to the caller's hook instead.
    pub fn on_error(&mut self, f: impl Fn(&ProxyError, &RequestInfo) + Send + Sync + 'static) {
        self.on_error = Some(Box::new(f));
        self.error_listener_set.store(true, Ordering::SeqCst);
    }

    pub fn has_default_error_listener(&self) -> bool {
        !self.error_listener_set.load(Ordering::SeqCst)
    }

    /// Emit `error`. The caller (the `stream` pass) still propagates the
    /// error via `Result` regardless of whether a hook is installed, so a
    /// caller with no hook installed still observes it synchronously
    /// instead of it vanishing silently.
    pub fn emit_error(&self, err: &ProxyError, info: &RequestInfo) {
        match &self.on_error {
            Some(hook) => hook(err, info),
            None => {
                tracing::error!(error = %err, uri = %info.uri, "unhandled proxy error (no error listener registered)");
            }
        }
    }

    pub fn emit_econnreset(&self, err: &ProxyError, info: &RequestInfo) {
        tracing::debug!(error = %err, uri = %info.uri, "econnreset after client disconnect");
        self.emit_error(err, info);
    }

    pub fn emit_start(&self, info: &RequestInfo) {
        if let Some(hook) = &self.on_start {
            hook(info);
        }
    }

    pub fn emit_proxy_req(&self, outgoing: &OutgoingRequest, info: &RequestInfo) {
        if let Some(hook) = &self.on_proxy_req {
            hook(outgoing, info);
        }
    }

    pub fn emit_proxy_req_ws(&self, outgoing: &OutgoingRequest, info: &RequestInfo) {
        if let Some(hook) = &self.on_proxy_req_ws {
            hook(outgoing, info);
        }
    }

    pub fn emit_proxy_res(&self, res: &ResponseInfo, info: &RequestInfo) {
        if let Some(hook) = &self.on_proxy_res {
            hook(res, info);
        }
    }

    pub fn emit_open(&self) {
        if let Some(hook) = &self.on_open {
            hook();
        }
    }

    pub fn emit_close(&self) {
        if let Some(hook) = &self.on_close {
            hook();
        }
    }

    pub fn emit_end(&self, info: &RequestInfo) {
        if let Some(hook) = &self.on_end {
            hook(info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_events_table_has_default_listener() {
        let events = ProxyEvents::new();
        assert!(events.has_default_error_listener());
    }

    #[test]
    fn registering_error_hook_clears_default_listener() {
        let mut events = ProxyEvents::new();
        events.on_error(|_, _| {});
        assert!(!events.has_default_error_listener());
    }
}
