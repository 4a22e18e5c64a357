//! Configuration surface: `ProxyOptions` is the typed configuration a caller
//! builds up before handing a request to [`crate::server::ProxyServer`];
//! `resolve()` turns any string targets into structured [`Target`]s by
//! parsing the host up front with `url::Url::parse` rather than lazily on
//! every request.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::ProxyError;

/// TLS material carried by a structured target: `pfx`/`key`/`passphrase`/
/// `cert`/`ca`/`ciphers`/`secure_protocol`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct TlsMaterial {
    pub pfx: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    pub cert: Option<Vec<u8>>,
    pub ca: Option<Vec<u8>>,
    pub ciphers: Option<String>,
    pub secure_protocol: Option<String>,
}

/// A resolved upstream (or forward) target: protocol, host, optional port,
/// and an outgoing path prefix.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Target {
    /// Normalized without trailing colon: `"http"`, `"https"`, `"ws"`, `"wss"`.
    pub protocol: String,
    pub host: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub path: String,
    pub socket_path: Option<String>,
    pub tls: TlsMaterial,
}

impl Target {
    pub fn is_ssl(&self) -> bool {
        matches!(self.protocol.as_str(), "https" | "wss")
    }

    /// Port to use on the wire: explicit port, else 443/80 by scheme.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.is_ssl() { 443 } else { 80 })
    }

    fn from_url(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::configuration(format!("invalid target url {raw:?}: {e}")))?;
        let hostname = url
            .host_str()
            .ok_or_else(|| ProxyError::configuration(format!("target url has no host: {raw:?}")))?
            .to_string();
        let protocol = url.scheme().trim_end_matches(':').to_string();
        let port = url.port();
        let host = match port {
            Some(p) => format!("{hostname}:{p}"),
            None => hostname.clone(),
        };
        Ok(Target {
            protocol,
            host,
            hostname,
            port,
            path: url.path().to_string(),
            socket_path: None,
            tls: TlsMaterial::default(),
        })
    }
}

/// Either a bare URL string, or a fully structured target with TLS material
/// and/or a Unix domain socket path.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Url(String),
    Structured(Target),
}

impl TargetSpec {
    pub fn url(s: impl Into<String>) -> Self {
        TargetSpec::Url(s.into())
    }

    pub fn resolve(&self) -> Result<Target, ProxyError> {
        match self {
            TargetSpec::Url(s) => Target::from_url(s),
            TargetSpec::Structured(t) => Ok(t.clone()),
        }
    }
}

impl From<&str> for TargetSpec {
    fn from(s: &str) -> Self {
        TargetSpec::Url(s.to_string())
    }
}

impl From<String> for TargetSpec {
    fn from(s: String) -> Self {
        TargetSpec::Url(s)
    }
}

/// `false` disables rewriting; `Single` is sugar for `{"*": s}`; `Map` maps
/// old value -> new value with `"*"` as wildcard fallback.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum CookieRewrite {
    Disabled,
    Single(String),
    Map(HashMap<String, String>),
}

impl CookieRewrite {
    /// Look up the replacement for `old`, matching the exact key first and
    /// falling back to the `"*"` wildcard. `None` means "leave unchanged".
    pub fn lookup(&self, old: &str) -> Option<&str> {
        match self {
            CookieRewrite::Disabled => None,
            CookieRewrite::Single(s) => Some(s.as_str()),
            CookieRewrite::Map(m) => m.get(old).or_else(|| m.get("*")).map(|s| s.as_str()),
        }
    }
}

/// TLS configuration for the *listening* side, consumed only by the
/// `listen()` convenience helper (kept deliberately minimal).
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub ca_path: Option<String>,
    /// Raw CA bytes propagated to the upstream request's `tls.ca` by
    /// `setup_outgoing` (distinct from the listener's own `ca_path`).
    pub ca: Option<Vec<u8>>,
}

/// Configuration for a single `web`/`ws` call. Global options and per-call
/// options are merged by [`ProxyOptions::merge`] (per-call wins), so a
/// caller can set defaults on the server and override them per request.
///
/// Derives `Deserialize` so an embedding application can load it from its
/// own config file (the core crate owns no config file format itself);
/// `buffer` is runtime-only and is never part of that on-disk shape.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    pub target: Option<TargetSpec>,
    pub forward: Option<TargetSpec>,
    /// `true` keeps the connection alive on a pooled client; `false` (the
    /// default) forces
    /// `Connection: close` on the outgoing request.
    pub use_pooling: bool,
    pub ssl: Option<SslConfig>,
    pub ws: bool,
    pub xfwd: bool,
    pub secure: bool,
    pub to_proxy: bool,
    pub prepend_path: bool,
    pub ignore_path: bool,
    pub local_address: Option<String>,
    pub change_origin: bool,
    pub preserve_header_key_case: bool,
    pub auth: Option<String>,
    pub host_rewrite: Option<String>,
    pub auto_rewrite: bool,
    pub protocol_rewrite: Option<String>,
    pub cookie_domain_rewrite: Option<CookieRewrite>,
    pub cookie_path_rewrite: Option<CookieRewrite>,
    pub headers: HashMap<String, String>,
    pub method: Option<String>,
    pub proxy_timeout_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub follow_redirects: bool,
    pub self_handle_response: bool,
    #[serde(skip)]
    pub buffer: Option<Bytes>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            target: None,
            forward: None,
            use_pooling: false,
            ssl: None,
            ws: false,
            xfwd: false,
            secure: true,
            to_proxy: false,
            prepend_path: true,
            ignore_path: false,
            local_address: None,
            change_origin: false,
            preserve_header_key_case: false,
            auth: None,
            host_rewrite: None,
            auto_rewrite: false,
            protocol_rewrite: None,
            cookie_domain_rewrite: None,
            cookie_path_rewrite: None,
            headers: HashMap::new(),
            method: None,
            proxy_timeout_ms: None,
            timeout_ms: None,
            follow_redirects: false,
            self_handle_response: false,
            buffer: None,
        }
    }
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: impl Into<TargetSpec>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn forward(mut self, forward: impl Into<TargetSpec>) -> Self {
        self.forward = Some(forward.into());
        self
    }

    pub fn xfwd(mut self, on: bool) -> Self {
        self.xfwd = on;
        self
    }

    pub fn ws(mut self, on: bool) -> Self {
        self.ws = on;
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(d.as_millis() as u64);
        self
    }

    pub fn proxy_timeout(mut self, d: Duration) -> Self {
        self.proxy_timeout_ms = Some(d.as_millis() as u64);
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn proxy_timeout_duration(&self) -> Option<Duration> {
        self.proxy_timeout_ms.map(Duration::from_millis)
    }

    /// Overlay `other` (per-call options) on top of `self` (global/default
    /// options); `other`'s explicitly-set fields win. Since Rust has no
    /// "undefined" to distinguish "not set" from "set to default", the
    /// per-call struct is taken to always win wholesale for non-collection
    /// fields, and headers are merged (per-call overwriting same keys).
    pub fn merge(&self, other: &ProxyOptions) -> ProxyOptions {
        let mut merged = other.clone();
        let mut headers = self.headers.clone();
        headers.extend(other.headers.clone());
        merged.headers = headers;
        if merged.target.is_none() {
            merged.target = self.target.clone();
        }
        if merged.forward.is_none() {
            merged.forward = self.forward.clone();
        }
        merged
    }

    /// Resolve string targets into structured [`Target`]s. `target` or
    /// `forward` must be set before the `stream` pass runs.
    pub fn resolve(&self) -> Result<ResolvedOptions, ProxyError> {
        if self.target.is_none() && self.forward.is_none() {
            return Err(ProxyError::configuration(
                "either target or forward must be set",
            ));
        }
        Ok(ResolvedOptions {
            target: self.target.as_ref().map(|t| t.resolve()).transpose()?,
            forward: self.forward.as_ref().map(|t| t.resolve()).transpose()?,
            opts: self.clone(),
        })
    }
}

/// Configuration after string targets have been parsed into structured
/// form.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub target: Option<Target>,
    pub forward: Option<Target>,
    pub opts: ProxyOptions,
}

impl std::ops::Deref for ResolvedOptions {
    type Target = ProxyOptions;
    fn deref(&self) -> &ProxyOptions {
        &self.opts
    }
}

/// Which of `target`/`forward` a given outgoing-request build is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Target,
    Forward,
}

impl ResolvedOptions {
    pub fn target_for(&self, role: Role) -> Option<&Target> {
        match role {
            Role::Target => self.target.as_ref(),
            Role::Forward => self.forward.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_by_scheme() {
        let t = Target::from_url("https://example.com/a").unwrap();
        assert_eq!(t.effective_port(), 443);
        let t = Target::from_url("http://example.com/a").unwrap();
        assert_eq!(t.effective_port(), 80);
        let t = Target::from_url("wss://example.com/a").unwrap();
        assert_eq!(t.effective_port(), 443);
        let t = Target::from_url("ws://example.com/a").unwrap();
        assert_eq!(t.effective_port(), 80);
    }

    #[test]
    fn explicit_port_is_kept() {
        let t = Target::from_url("http://example.com:9000/a").unwrap();
        assert_eq!(t.effective_port(), 9000);
    }

    #[test]
    fn cookie_rewrite_wildcard_fallback() {
        let mut m = HashMap::new();
        m.insert("old.com".to_string(), "new.com".to_string());
        m.insert("*".to_string(), "wild.com".to_string());
        let cfg = CookieRewrite::Map(m);
        assert_eq!(cfg.lookup("old.com"), Some("new.com"));
        assert_eq!(cfg.lookup("other.com"), Some("wild.com"));
    }

    #[test]
    fn resolve_requires_target_or_forward() {
        let opts = ProxyOptions::new();
        assert!(opts.resolve().is_err());
    }
}
