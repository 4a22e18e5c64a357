//! Web-incoming pipeline plus the HTTP streaming pass: dispatch the request
//! upstream, then run the `setupOutgoing`/`webOutgoingPasses` round trip over
//! the response on its way back to the client.

use std::net::SocketAddr;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body_util::Empty;
use hyper::body::Incoming;

use super::Shared;
use super::web_outgoing::{ClientResponseDraft, OutgoingPassContext};
use crate::client::{boxed, BoxBody};
use crate::error::ProxyError;
use crate::events::{RequestInfo, ResponseInfo};
use crate::options::{ResolvedOptions, Role};
use crate::outgoing::setup_outgoing;
use crate::pass::{Named, PassOutcome};

#[async_trait]
pub trait WebPass: Named + Send + Sync {
    async fn run(
        &self,
        req: &mut Request<BoxBody>,
        remote_addr: SocketAddr,
        resolved: &ResolvedOptions,
        shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError>;
}

/// Convert a just-accepted `Request<Incoming>` into the `Request<BoxBody>`
/// the web pipeline operates on, so the `stream` pass can move the body out
/// for forwarding without fighting the borrow checker over the earlier
/// header-only passes.
pub fn boxed_request(req: Request<Incoming>) -> Request<BoxBody> {
    req.map(boxed)
}

pub struct DeleteLength;
impl Named for DeleteLength {
    fn name(&self) -> &'static str {
        "deleteLength"
    }
}
#[async_trait]
impl WebPass for DeleteLength {
    async fn run(
        &self,
        req: &mut Request<BoxBody>,
        _remote_addr: SocketAddr,
        _resolved: &ResolvedOptions,
        _shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError> {
        let method = req.method().clone();
        if (method == http::Method::DELETE || method == http::Method::OPTIONS)
            && !req.headers().contains_key(http::header::CONTENT_LENGTH)
        {
            req.headers_mut()
                .insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            req.headers_mut().remove(http::header::TRANSFER_ENCODING);
        }
        Ok(PassOutcome::Continue)
    }
}

/// Enforcement of `options.timeout` happens inside `stream` (it has to wrap
/// the whole async round trip); this pass only validates the setting is
/// sane and keeps `timeout` as its own named, spliceable pass.
pub struct Timeout;
impl Named for Timeout {
    fn name(&self) -> &'static str {
        "timeout"
    }
}
#[async_trait]
impl WebPass for Timeout {
    async fn run(
        &self,
        _req: &mut Request<BoxBody>,
        _remote_addr: SocketAddr,
        _resolved: &ResolvedOptions,
        _shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError> {
        Ok(PassOutcome::Continue)
    }
}

/// Append (never overwrite) the `X-Forwarded-For`/`-Port`/`-Proto` chain.
/// Shared between the web and ws `XHeaders` passes; only the web pipeline
/// additionally sets `X-Forwarded-Host`, which callers apply themselves
/// since the ws pipeline must not.
pub(crate) fn apply_xfwd_headers(headers: &mut HeaderMap, remote_addr: SocketAddr, proto: &str) {
    append_comma(headers, "x-forwarded-for", &remote_addr.ip().to_string());

    let port = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.rsplit_once(':'))
        .and_then(|(_, p)| p.parse::<u16>().ok())
        .unwrap_or(if proto.ends_with('s') { 443 } else { 80 });
    append_comma(headers, "x-forwarded-port", &port.to_string());

    append_comma(headers, "x-forwarded-proto", proto);
}

fn append_comma(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let header_name = http::HeaderName::from_static(name);
    let combined = match headers.get(&header_name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {value}"),
        _ => value.to_string(),
    };
    if let Ok(hv) = HeaderValue::from_str(&combined) {
        headers.insert(header_name, hv);
    }
}

pub struct XHeaders;
impl Named for XHeaders {
    fn name(&self) -> &'static str {
        "xHeaders"
    }
}
#[async_trait]
impl WebPass for XHeaders {
    async fn run(
        &self,
        req: &mut Request<BoxBody>,
        remote_addr: SocketAddr,
        resolved: &ResolvedOptions,
        _shared: &Shared,
    ) -> Result<PassOutcome<Response<BoxBody>>, ProxyError> {
        if !resolved.xfwd {
            return Ok(PassOutcome::Continue);
        }
        let proto = req.uri().scheme_str().unwrap_or("http");
        let proto = if proto.is_empty() { "http" } else { proto };
        apply_xfwd_headers(req.headers_mut(), remote_addr, proto);
        let host_value = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if !req.headers().contains_key("x-forwarded-host") {
            if let Some(host) = host_value {
                if let Ok(hv) = HeaderValue::from_str(&host) {
                    req.headers_mut()
                        .insert(http::HeaderName::from_static("x-forwarded-host"), hv);
                }
            }
        }
        Ok(PassOutcome::Continue)
    }
}

/// The HTTP streaming pass. Dials (and, if `forward` is set, fire-and-forgets
/// a mirrored request to) the upstream, runs `webOutgoingPasses` over the
/// response, and returns the finished client response.
pub struct Stream;
impl Named for Stream {
    fn name(&self) -> &'static str {
        "stream"
    }
}
#[async_trait]
impl WebPass for Stream {
    async fn run(
        &self,
        req: &mut Request<BoxBody>,
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

        let req_version = req.version();
        let req_connection_header = req
            .headers()
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let req_host_header = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = std::mem::replace(req.body_mut(), boxed(Empty::new()));

        if resolved.forward.is_some() {
            if let Ok(forward_outgoing) =
                setup_outgoing(resolved, req.method(), req.headers(), req.uri(), Role::Forward)
            {
                let forward_body = resolved
                    .buffer
                    .clone()
                    .map(|b| boxed(http_body_util::Full::new(b)))
                    .unwrap_or_else(|| boxed(Empty::new()));
                if let Ok(forward_req) = build_request(&forward_outgoing, forward_body) {
                    let client = shared.client.clone();
                    let target = forward_outgoing.host.clone();
                    let is_ssl = forward_outgoing.is_ssl();
                    let reject_unauthorized = forward_outgoing.reject_unauthorized;
                    // Fire-and-forget: `forward` has no response path back to the
                    // client, so failures are logged only.
                    tokio::spawn(async move {
                        if let Err(e) = client.request(is_ssl, reject_unauthorized, forward_req).await {
                            tracing::debug!(error = %e, %target, "fire-and-forget forward request failed");
                        }
                    });
                }
            }
            if resolved.target.is_none() {
                return Ok(PassOutcome::Halt(
                    Response::builder().status(http::StatusCode::OK).body(boxed(Empty::new()))?,
                ));
            }
        }

        let outgoing = setup_outgoing(resolved, req.method(), req.headers(), req.uri(), Role::Target)?;
        shared.events.emit_proxy_req(&outgoing, &info);

        let buffered_body = resolved
            .buffer
            .clone()
            .map(|b| boxed(http_body_util::Full::new(b)))
            .unwrap_or(body);
        let upstream_req = build_request(&outgoing, buffered_body)?;

        let dispatch = shared
            .client
            .request(outgoing.is_ssl(), outgoing.reject_unauthorized, upstream_req);

        let upstream_res = match resolved.proxy_timeout_duration() {
            Some(d) => tokio::time::timeout(d, dispatch)
                .await
                .map_err(|_| ProxyError::Timeout)?,
            None => dispatch.await,
        };

        let upstream_res = upstream_res.map_err(|e| {
            if e.is_connect() {
                ProxyError::UpstreamConnect {
                    source: std::io::Error::other(e.to_string()),
                    target: outgoing.host.clone(),
                }
            } else {
                ProxyError::UpstreamReset { source: None }
            }
        })?;

        let response_info = ResponseInfo {
            status: upstream_res.status(),
            headers: upstream_res.headers().clone(),
        };
        shared.events.emit_proxy_res(&response_info, &info);

        let (parts, incoming_body) = upstream_res.into_parts();
        let mut draft = ClientResponseDraft {
            status: parts.status,
            headers: parts.headers,
        };

        if !resolved.self_handle_response {
            let ctx = OutgoingPassContext {
                req_version,
                req_connection_header: req_connection_header.as_deref(),
                req_host_header: req_host_header.as_deref(),
            };
            for pass in shared.outgoing_passes.iter() {
                if let PassOutcome::Halt(()) = pass.run(&mut draft, &ctx, resolved)? {
                    break;
                }
            }
        }

        shared.events.emit_end(&info);

        if resolved.self_handle_response {
            return Ok(PassOutcome::Halt(
                Response::builder().status(draft.status).body(boxed(Empty::new()))?,
            ));
        }

        let mut builder = Response::builder().status(draft.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = draft.headers;
        }
        let response = builder.body(boxed(incoming_body))?;
        Ok(PassOutcome::Halt(response))
    }
}

fn build_request(
    outgoing: &crate::outgoing::OutgoingRequest,
    body: BoxBody,
) -> Result<Request<BoxBody>, ProxyError> {
    let mut builder = Request::builder()
        .method(outgoing.method.clone())
        .uri(outgoing.uri_string());
    for (name, value) in outgoing.headers.iter() {
        builder = builder.header(name, value);
    }
    Ok(builder.body(body)?)
}

/// The fixed web-incoming pipeline.
pub fn default_web_passes() -> Vec<Box<dyn WebPass>> {
    vec![Box::new(DeleteLength), Box::new(Timeout), Box::new(XHeaders), Box::new(Stream)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xfwd_for_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        apply_xfwd_headers(&mut headers, "127.0.0.1:9000".parse().unwrap(), "http");
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "1.2.3.4, 127.0.0.1"
        );
    }

    #[test]
    fn xfwd_port_falls_back_to_scheme_default() {
        let mut headers = HeaderMap::new();
        apply_xfwd_headers(&mut headers, "127.0.0.1:9000".parse().unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-port").unwrap(), "443");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }
}
