//! [`ProxyServer`]: the `web`/`ws` request-handling facade, plus the
//! listener and CONNECT-tunnel convenience built on top of it. The accept
//! loop and per-connection task shape follow hyper-util's
//! auto-HTTP/1-or-2 connection builder with upgrade support.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::client::{boxed, BoxBody, ProxyClient};
use crate::error::ProxyError;
use crate::events::{ProxyEvents, RequestInfo};
use crate::options::{ProxyOptions, ResolvedOptions};
use crate::pass::{insert_after, insert_before, PassOutcome};
use crate::passes::web_incoming::{boxed_request, default_web_passes, WebPass};
use crate::passes::web_outgoing::{default_web_outgoing_passes, WebOutgoingPass};
use crate::passes::ws_incoming::{default_ws_passes, WsPass};
use crate::passes::Shared;

/// A programmable HTTP/HTTPS/WebSocket reverse proxy instance. Holds the
/// per-instance pass pipelines (spliceable via [`Self::before`]/
/// [`Self::after`]), the shared upstream client pool, and the event table.
pub struct ProxyServer {
    default_options: ProxyOptions,
    web_passes: Vec<Box<dyn WebPass>>,
    ws_passes: Vec<Box<dyn WsPass>>,
    outgoing_passes: Arc<Vec<Box<dyn WebOutgoingPass>>>,
    client: ProxyClient,
    events: Arc<ProxyEvents>,
}

/// Which pipeline a `before`/`after` splice targets.
pub enum Pipeline {
    Web,
    Ws,
    WebOutgoing,
}

impl ProxyServer {
    /// Construct with `options` as the default, merged into every `web()`/
    /// `ws()` call. Each instance owns its own copies of the three
    /// pipelines so splicing on one server never affects another.
    pub fn new(options: ProxyOptions) -> Self {
        ProxyServer {
            default_options: options,
            web_passes: default_web_passes(),
            ws_passes: default_ws_passes(),
            outgoing_passes: Arc::new(default_web_outgoing_passes()),
            client: ProxyClient::new(),
            events: Arc::new(ProxyEvents::new()),
        }
    }

    pub fn events_mut(&mut self) -> &mut ProxyEvents {
        Arc::get_mut(&mut self.events).expect("events table mutated before any clone escaped")
    }

    /// Splice a named pass into a pipeline, identity-by-name, targeting the
    /// last match if the name appears more than once.
    pub fn before(&mut self, pipeline: Pipeline, name: &str, pass: PipelinePass) -> Result<(), ProxyError> {
        self.splice(pipeline, name, pass, true)
    }

    pub fn after(&mut self, pipeline: Pipeline, name: &str, pass: PipelinePass) -> Result<(), ProxyError> {
        self.splice(pipeline, name, pass, false)
    }

    fn splice(&mut self, pipeline: Pipeline, name: &str, pass: PipelinePass, before: bool) -> Result<(), ProxyError> {
        match (pipeline, pass) {
            (Pipeline::Web, PipelinePass::Web(p)) => {
                if before {
                    insert_before(&mut self.web_passes, name, p)
                } else {
                    insert_after(&mut self.web_passes, name, p)
                }
            }
            (Pipeline::Ws, PipelinePass::Ws(p)) => {
                if before {
                    insert_before(&mut self.ws_passes, name, p)
                } else {
                    insert_after(&mut self.ws_passes, name, p)
                }
            }
            (Pipeline::WebOutgoing, PipelinePass::WebOutgoing(p)) => {
                let passes = Arc::get_mut(&mut self.outgoing_passes)
                    .expect("outgoing pipeline spliced before any request borrowed it");
                if before {
                    insert_before(passes, name, p)
                } else {
                    insert_after(passes, name, p)
                }
            }
            _ => Err(ProxyError::configuration(
                "pass type does not match the targeted pipeline",
            )),
        }
    }

    /// Handle one HTTP request: merge `call_options` over the defaults,
    /// resolve targets, and run the web-incoming pipeline to completion.
    pub async fn web(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        call_options: Option<&ProxyOptions>,
    ) -> Result<Response<BoxBody>, ProxyError> {
        self.web_with_error_callback(req, remote_addr, call_options, None).await
    }

    /// Same as [`Self::web`], but `error_callback`, when set, receives every
    /// error instead of it going through the `error`/`econnreset` events —
    /// the per-call callback from `web(req, res, opts?, cb?)`.
    pub async fn web_with_error_callback(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        call_options: Option<&ProxyOptions>,
        error_callback: Option<crate::passes::ErrorCallback>,
    ) -> Result<Response<BoxBody>, ProxyError> {
        let merged = match call_options {
            Some(o) => self.default_options.merge(o),
            None => self.default_options.clone(),
        };
        let resolved = merged.resolve()?;
        let shared = self.shared_for(remote_addr, error_callback);

        let info = RequestInfo {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
            remote_addr,
        };

        let timeout_duration = resolved.timeout_duration();
        let mut req = boxed_request(req);
        let run = self.run_web_pipeline(&mut req, remote_addr, &resolved, &shared);

        let outcome = match timeout_duration {
            Some(d) => tokio::time::timeout(d, run).await.map_err(|_| ProxyError::Timeout),
            None => Ok(run.await),
        };

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) | Err(e) => {
                shared.report_error(&e, &info);
                Err(e)
            }
        }
    }

    async fn run_web_pipeline(
        &self,
        req: &mut Request<BoxBody>,
        remote_addr: SocketAddr,
        resolved: &ResolvedOptions,
        shared: &Shared,
    ) -> Result<Response<BoxBody>, ProxyError> {
        for pass in &self.web_passes {
            match pass.run(req, remote_addr, resolved, shared).await? {
                PassOutcome::Continue => continue,
                PassOutcome::Halt(response) => return Ok(response),
            }
        }
        Err(ProxyError::configuration("web pipeline exhausted without a response"))
    }

    /// Handle one WebSocket upgrade. On success, the returned response is
    /// the relayed upstream `101` handshake that the `stream` pass built —
    /// not a synthesized one.
    pub async fn ws(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        call_options: Option<&ProxyOptions>,
    ) -> Result<Response<BoxBody>, ProxyError> {
        self.ws_with_error_callback(req, remote_addr, call_options, None).await
    }

    /// Same as [`Self::ws`], but `error_callback`, when set, receives every
    /// error instead of it going through the `error`/`econnreset` events —
    /// the per-call callback from `ws(req, socket, head, opts?, cb?)`.
    pub async fn ws_with_error_callback(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        call_options: Option<&ProxyOptions>,
        error_callback: Option<crate::passes::ErrorCallback>,
    ) -> Result<Response<BoxBody>, ProxyError> {
        let merged = match call_options {
            Some(o) => self.default_options.merge(o),
            None => self.default_options.clone(),
        };
        let resolved = merged.resolve()?;
        let shared = self.shared_for(remote_addr, error_callback);

        let info = RequestInfo {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
            remote_addr,
        };

        for pass in &self.ws_passes {
            match pass.run(&mut req, remote_addr, &resolved, &shared).await {
                Ok(PassOutcome::Continue) => continue,
                Ok(PassOutcome::Halt(response)) => return Ok(response),
                Err(e) => {
                    shared.report_error(&e, &info);
                    return Err(e);
                }
            }
        }
        Err(ProxyError::configuration("ws pipeline exhausted without a response"))
    }

    /// CONNECT tunneling: establish the tunnel by dialing `resolved.target`,
    /// replying `200 Connection Established`, then splicing raw bytes.
    pub async fn connect(
        &self,
        mut req: Request<Incoming>,
        resolved: &ResolvedOptions,
    ) -> Result<Response<BoxBody>, ProxyError> {
        let target = resolved
            .target
            .as_ref()
            .ok_or_else(|| ProxyError::configuration("connect() requires a resolved target"))?;
        let dial_addr = format!("{}:{}", target.hostname, target.effective_port());

        let response = Response::builder()
            .status(StatusCode::OK)
            .body(boxed(Empty::<Bytes>::new()))?;

        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    let mut client_io = TokioIo::new(upgraded);
                    match TcpStream::connect(&dial_addr).await {
                        Ok(mut upstream) => {
                            if let Err(e) = copy_bidirectional(&mut client_io, &mut upstream).await {
                                tracing::debug!(error = %e, "CONNECT tunnel ended");
                            }
                            let _ = client_io.shutdown().await;
                            let _ = upstream.shutdown().await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, %dial_addr, "CONNECT upstream dial failed");
                            let _ = client_io
                                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                                .await;
                            let _ = client_io.shutdown().await;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "CONNECT upgrade failed"),
            }
        });

        Ok(response)
    }

    fn shared_for(&self, remote_addr: SocketAddr, error_callback: Option<crate::passes::ErrorCallback>) -> Shared {
        Shared {
            client: self.client.clone(),
            events: self.events.clone(),
            outgoing_passes: self.outgoing_passes.clone(),
            error_callback,
            remote_addr,
        }
    }

    /// `listen(port)` convenience wrapper. Binds, accepts in a loop, and
    /// dispatches each connection through [`Self::web`]/[`Self::ws`]/
    /// [`Self::connect`] depending on the request shape.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<ListenHandle, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let shutdown_accept = shutdown.clone();
        let server = self.clone();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote_addr)) => {
                                let server = server.clone();
                                tokio::spawn(async move {
                                    server.serve_connection(stream, remote_addr).await;
                                });
                            }
                            Err(e) => tracing::warn!(error = %e, "accept failed"),
                        }
                    }
                    _ = shutdown_accept.notified() => break,
                }
            }
        });

        Ok(ListenHandle {
            addr: bound_addr,
            shutdown,
            join,
        })
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let io = TokioIo::new(stream);
        let server = self.clone();
        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move { server.dispatch(req, remote_addr).await }
        });

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder.http1().title_case_headers(true).preserve_header_case(true);
        if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
            tracing::debug!(error = %e, %remote_addr, "connection closed with error");
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody>, std::convert::Infallible> {
        if req.method() == Method::CONNECT {
            let resolved = match self.default_options.resolve() {
                Ok(r) => r,
                Err(e) => return Ok(error_response(&e)),
            };
            return Ok(self.connect(req, &resolved).await.unwrap_or_else(|e| error_response(&e)));
        }

        if is_upgrade_request(&req) {
            match self.ws(req, remote_addr, None).await {
                Ok(response) => Ok(response),
                Err(e) => Ok(error_response(&e)),
            }
        } else {
            match self.web(req, remote_addr, None).await {
                Ok(response) => Ok(response),
                Err(e) => Ok(error_response(&e)),
            }
        }
    }
}

/// One of the three pass trait objects, used by [`ProxyServer::before`]/
/// [`ProxyServer::after`] to stay generic over which pipeline is targeted.
pub enum PipelinePass {
    Web(Box<dyn WebPass>),
    Ws(Box<dyn WsPass>),
    WebOutgoing(Box<dyn WebOutgoingPass>),
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_conn_upgrade = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(crate::outgoing::connection_has_upgrade_token)
        .unwrap_or(false);
    let has_upgrade_hdr = req.headers().contains_key(http::header::UPGRADE);
    has_conn_upgrade && has_upgrade_hdr
}

fn error_response(err: &ProxyError) -> Response<BoxBody> {
    let status = match err {
        ProxyError::Configuration(_) | ProxyError::NoSuchPass(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ProxyError::MalformedUpgrade => StatusCode::BAD_REQUEST,
        ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    Response::builder()
        .status(status)
        .body(boxed(Empty::new()))
        .unwrap_or_else(|_| Response::new(boxed(Empty::new())))
}

/// Returned by [`ProxyServer::listen`]: the bound address and a way to stop
/// accepting new connections.
pub struct ListenHandle {
    addr: SocketAddr,
    shutdown: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl ListenHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn close(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_rejects_mismatched_pass_type() {
        let mut server = ProxyServer::new(ProxyOptions::new());
        let result = server.before(
            Pipeline::Web,
            "xHeaders",
            PipelinePass::Ws(Box::new(crate::passes::ws_incoming::XHeaders)),
        );
        assert!(result.is_err());
    }
}
