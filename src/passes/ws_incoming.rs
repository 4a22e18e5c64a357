//! WebSocket-incoming pipeline: `check_method_and_header` -> `x_headers` ->
//! `stream`. Validates the upgrade request, dials upstream, then splices the
//! client and upstream connections after both sides confirm
//! `101 Switching Protocols`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderValue, Method, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

use super::Shared;
use crate::client::{boxed, BoxBody};
use crate::error::ProxyError;
use crate::events::RequestInfo;
use crate::options::{ResolvedOptions, Role};
use crate::outgoing::{connection_has_upgrade_token, setup_outgoing};
use crate::pass::{Named, PassOutcome};

#[async_trait]
pub trait WsPass: Named + Send + Sync {
    /// On `Halt`, the carried response is what goes back to the client —
    /// for the `stream` pass that's the relayed upstream `101` handshake,
    /// not a synthesized one, so the `Sec-WebSocket-Accept` the client
    /// computed its key against matches.
    async fn run(
        &self,
        req: &mut Request<Incoming>,
        remote_addr: SocketAddr,
        resolved: &ResolvedOptions,
        shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError>;
}

/// Reject anything that is not a `GET` carrying `Connection: Upgrade` /
/// `Upgrade: websocket` before any upstream dial happens — a pass can
/// short-circuit the pipeline by returning `MalformedUpgrade`.
pub struct CheckMethodAndHeader;
impl Named for CheckMethodAndHeader {
    fn name(&self) -> &'static str {
        "checkMethodAndHeader"
    }
}
/// Pure validation, factored out so it can be unit-tested without
/// constructing a live `Request<Incoming>` (which only a real connection
/// can produce).
fn is_valid_upgrade_request(method: &Method, headers: &http::HeaderMap) -> bool {
    if method != Method::GET {
        return false;
    }
    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

#[async_trait]
impl WsPass for CheckMethodAndHeader {
    async fn run(
        &self,
        req: &mut Request<Incoming>,
        _remote_addr: SocketAddr,
        _resolved: &ResolvedOptions,
        _shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError> {
        if !is_valid_upgrade_request(req.method(), req.headers()) {
            return Err(ProxyError::MalformedUpgrade);
        }
        Ok(PassOutcome::Continue)
    }
}

/// XFWD headers for the ws pipeline, same fields as the web pipeline's
/// `x_headers` pass.
pub struct XHeaders;
impl Named for XHeaders {
    fn name(&self) -> &'static str {
        "xHeaders"
    }
}
#[async_trait]
impl WsPass for XHeaders {
    async fn run(
        &self,
        req: &mut Request<Incoming>,
        remote_addr: SocketAddr,
        resolved: &ResolvedOptions,
        _shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError> {
        if !resolved.xfwd {
            return Ok(PassOutcome::Continue);
        }
        let proto = if req.uri().scheme_str() == Some("wss") { "wss" } else { "ws" };
        super::web_incoming::apply_xfwd_headers(req.headers_mut(), remote_addr, proto);
        Ok(PassOutcome::Continue)
    }
}

/// Dial upstream, replay the client's upgrade request, then splice the two
/// raw byte streams once both ends report `101 Switching Protocols`, using
/// `hyper::upgrade::on` on both the client and upstream legs.
pub struct Stream;
impl Named for Stream {
    fn name(&self) -> &'static str {
        "stream"
    }
}
#[async_trait]
impl WsPass for Stream {
    async fn run(
        &self,
        req: &mut Request<Incoming>,
        remote_addr: SocketAddr,
        resolved: &ResolvedOptions,
        shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError> {
        let info = RequestInfo {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
            remote_addr,
        };
        shared.events.emit_start(&info);

        let outgoing = setup_outgoing(resolved, req.method(), req.headers(), req.uri(), Role::Target)?;
        shared.events.emit_proxy_req_ws(&outgoing, &info);

        let upstream_req = build_upstream_request(&outgoing, req.headers())?;

        let upstream_stream = tokio::net::TcpStream::connect((outgoing.hostname.as_str(), outgoing.port))
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                source: e,
                target: format!("{}:{}", outgoing.hostname, outgoing.port),
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream_stream)).await?;
        let upstream_conn_task = tokio::spawn(conn.with_upgrades());

        let upstream_res = sender.send_request(upstream_req).await?;

        if upstream_res.status() != http::StatusCode::SWITCHING_PROTOCOLS {
            // A real response, not an upgrade: the upstream declined (e.g.
            // `404`). Relay its status, headers, and body to the client
            // verbatim rather than synthesizing an error — the client asked
            // to upgrade and got a normal HTTP answer instead.
            let _upstream_conn_task = upstream_conn_task;
            let (parts, incoming_body) = upstream_res.into_parts();
            let mut builder = Response::builder().status(parts.status);
            if let Some(headers) = builder.headers_mut() {
                *headers = parts.headers;
            }
            let response = builder.body(boxed(incoming_body))?;
            return Ok(PassOutcome::Halt(response));
        }

        if !looks_like_upgrade(&upstream_res) {
            // Claims `101` but never actually negotiated the upgrade (no
            // `Connection: upgrade` / `Upgrade` headers on its own
            // response) — should not happen against a well-behaved
            // upstream, kept defensively.
            return Err(ProxyError::MalformedUpgrade);
        }

        // The upstream's `101` carries `Sec-WebSocket-Accept` computed from
        // the same `Sec-WebSocket-Key` the client sent us (we forwarded the
        // client's handshake headers verbatim), so relaying its status and
        // headers back is what lets the client's own handshake validation
        // pass. Grab the upgrade future before moving `upstream_res` into
        // that relay.
        let upstream_status = upstream_res.status();
        let upstream_headers = upstream_res.headers().clone();
        let upstream_upgraded_fut = hyper::upgrade::on(upstream_res);
        let client_upgrade_fut = hyper::upgrade::on(req);

        let events = shared.events.clone();
        tokio::spawn(async move {
            let _upstream_conn_task = upstream_conn_task;
            match futures_util::future::try_join(upstream_upgraded_fut, client_upgrade_fut).await {
                Ok((upstream_upgraded, client_upgrade)) => {
                    events.emit_open();
                    let client_io = TokioIo::new(client_upgrade);
                    let upstream_io = TokioIo::new(upstream_upgraded);
                    if let Err(e) = splice(client_io, upstream_io).await {
                        tracing::debug!(error = %e, "websocket splice ended");
                    }
                    events.emit_close();
                }
                Err(e) => tracing::warn!(error = %e, "websocket upgrade handshake failed"),
            }
        });

        let mut builder = Response::builder().status(upstream_status);
        if let Some(headers) = builder.headers_mut() {
            *headers = upstream_headers;
        }
        let response = builder.body(boxed(http_body_util::Empty::<bytes::Bytes>::new()))?;
        Ok(PassOutcome::Halt(response))
    }
}

fn looks_like_upgrade(res: &http::Response<Incoming>) -> bool {
    let has_conn_upgrade = res
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(connection_has_upgrade_token)
        .unwrap_or(false);
    has_conn_upgrade && res.headers().contains_key(http::header::UPGRADE)
}

async fn splice<A, B>(mut a: A, mut b: B) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    copy_bidirectional(&mut a, &mut b).await.map(|_| ())
}

fn build_upstream_request(
    outgoing: &crate::outgoing::OutgoingRequest,
    _client_headers: &http::HeaderMap,
) -> Result<Request<BoxBody>, ProxyError> {
    let mut builder = Request::builder().method(Method::GET).uri(outgoing.uri_string());
    for (name, value) in outgoing.headers.iter() {
        builder = builder.header(name, value);
    }
    builder = builder
        .header(http::header::CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(http::header::UPGRADE, HeaderValue::from_static("websocket"));
    Ok(builder.body(boxed(http_body_util::Empty::<bytes::Bytes>::new()))?)
}

/// The fixed ws-incoming pipeline.
pub fn default_ws_passes() -> Vec<Box<dyn WsPass>> {
    vec![Box::new(CheckMethodAndHeader), Box::new(XHeaders), Box::new(Stream)]
}

#[allow(dead_code)]
fn _type_check(_: Arc<dyn WsPass>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_get_method_is_rejected() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_valid_upgrade_request(&Method::POST, &headers));
        assert!(is_valid_upgrade_request(&Method::GET, &headers));
    }

    #[test]
    fn missing_upgrade_header_is_rejected() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(!is_valid_upgrade_request(&Method::GET, &headers));
    }
}
