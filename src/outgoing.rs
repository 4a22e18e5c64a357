//! `setup_outgoing` and `url_join`. These are pure functions: given
//! configuration and the inbound request, they compute the upstream
//! request descriptor. Rather than mutating a shared `outgoing` object in
//! place, this crate returns a fresh [`OutgoingRequest`], which the
//! `stream` pass turns into a real `hyper::Request`.

use std::collections::HashMap;

use base64::Engine;
use http::{HeaderMap, HeaderValue, Method};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ProxyError;
use crate::options::ResolvedOptions;
use crate::options::{Role, TlsMaterial};

static UPGRADE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|,)\s*upgrade\s*(,|$)").unwrap());

/// Matches a `Connection` header value that carries the `upgrade` token,
/// delimited by commas or start/end of string — the literal string
/// `"not upgrade"` must NOT match.
pub fn connection_has_upgrade_token(value: &str) -> bool {
    UPGRADE_TOKEN_RE.is_match(value)
}

/// The standard port for a scheme, used by the `changeOrigin`/X-Forwarded-Port
/// "non-standard port" heuristic.
pub fn is_standard_port(protocol: &str, port: u16) -> bool {
    match protocol {
        "https" | "wss" => port == 443,
        _ => port == 80,
    }
}

/// The outgoing-request descriptor `setup_outgoing` fills in. The `stream`
/// pass consumes this to build the real `hyper::Request` / raw TCP dial.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub protocol: String,
    pub host: String,
    pub hostname: String,
    pub port: u16,
    pub socket_path: Option<String>,
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub local_address: Option<String>,
    pub reject_unauthorized: bool,
    pub tls: TlsMaterial,
    pub basic_auth: Option<String>,
}

impl OutgoingRequest {
    pub fn is_ssl(&self) -> bool {
        matches!(self.protocol.as_str(), "https" | "wss")
    }

    pub fn uri_string(&self) -> String {
        let scheme = if self.is_ssl() { "https" } else { "http" };
        format!("{scheme}://{}:{}{}", self.hostname, self.port, self.path)
    }
}

/// Concatenate non-empty path segments with `/`, collapsing repeated
/// slashes to one while preserving the scheme's `://`, and pass the query
/// string of the *last* segment through untouched.
pub fn url_join(parts: &[&str]) -> String {
    if parts.is_empty() {
        return String::new();
    }
    let mut parts: Vec<&str> = parts.to_vec();
    let last_idx = parts.len() - 1;
    let mut last_segs: Vec<&str> = parts[last_idx].splitn(2, '?').collect();
    let last_path = last_segs.remove(0);
    parts[last_idx] = last_path;

    let joined = parts
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/");

    let mut result = collapse_and_restore_scheme(&joined);
    if !last_segs.is_empty() {
        result.push('?');
        result.push_str(&last_segs.join("?"));
    }
    result
}

fn collapse_and_restore_scheme(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_slash = false;
    for c in s.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out.replace(":/", "://")
}

/// Minimal `path + search` extraction from a client-supplied `req.uri()`.
pub fn path_and_query(uri: &http::Uri, to_proxy: bool) -> String {
    if to_proxy {
        return uri.to_string();
    }
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default()
}

/// Build the outgoing request descriptor for `target` or `forward`.
pub fn setup_outgoing(
    resolved: &ResolvedOptions,
    req_method: &Method,
    req_headers: &HeaderMap,
    req_uri: &http::Uri,
    role: Role,
) -> Result<OutgoingRequest, ProxyError> {
    let target = resolved.target_for(role).ok_or_else(|| {
        ProxyError::configuration(format!("setup_outgoing: no target resolved for {role:?}"))
    })?;

    // Step 1: port.
    let port = target.effective_port();

    // Step 2: TLS / connection fields copied verbatim from the target.
    let mut tls = target.tls.clone();

    // Step 2b: TLS CA — `options.ssl.ca`, if set, overrides the upstream CA.
    if let Some(ca) = resolved.ssl.as_ref().and_then(|s| s.ca.clone()) {
        tls.ca = Some(ca);
    }

    // Step 3: method.
    let method = resolved
        .method
        .as_ref()
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .unwrap_or_else(|| req_method.clone());

    // Step 4: headers — shallow copy, then options.headers overwrites,
    // then Basic auth.
    let mut headers = req_headers.clone();
    for (k, v) in &resolved.headers {
        if let Ok(hv) = HeaderValue::from_str(v) {
            if let Ok(name) = http::HeaderName::from_bytes(k.as_bytes()) {
                headers.insert(name, hv);
            }
        }
    }
    let basic_auth = resolved.auth.as_ref().map(|auth| {
        let encoded = base64::engine::general_purpose::STANDARD.encode(auth.as_bytes());
        format!("Basic {encoded}")
    });
    if let Some(auth_header) = &basic_auth {
        if let Ok(hv) = HeaderValue::from_str(auth_header) {
            headers.insert(http::header::AUTHORIZATION, hv);
        }
    }

    // Step 5/6: reject_unauthorized only matters when the target is TLS.
    let reject_unauthorized = if target.is_ssl() {
        resolved.secure
    } else {
        true
    };

    // Step 7: agent / Connection: close.
    if !resolved.use_pooling {
        let keep_upgrade = headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(connection_has_upgrade_token)
            .unwrap_or(false);
        if !keep_upgrade {
            headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        }
    }

    // Step 8: local address.
    let local_address = resolved.local_address.clone();

    // Step 9: path.
    let target_path = if resolved.prepend_path && !target.path.is_empty() {
        target.path.as_str()
    } else {
        ""
    };
    let client_path = if resolved.ignore_path {
        String::new()
    } else {
        path_and_query(req_uri, resolved.to_proxy)
    };
    let path = url_join(&[target_path, &client_path]);

    // Step 10: changeOrigin host rewrite.
    if resolved.change_origin {
        let host_value = if is_standard_port(&target.protocol, port) {
            target.host.clone()
        } else {
            format!("{}:{}", target.hostname, port)
        };
        if let Ok(hv) = HeaderValue::from_str(&host_value) {
            headers.insert(http::header::HOST, hv);
        }
    }

    Ok(OutgoingRequest {
        protocol: target.protocol.clone(),
        host: target.host.clone(),
        hostname: target.hostname.clone(),
        port,
        socket_path: target.socket_path.clone(),
        path,
        method,
        headers,
        local_address,
        reject_unauthorized,
        tls,
        basic_auth,
    })
}

#[allow(dead_code)]
pub(crate) fn header_map_to_plain(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_preserves_query() {
        assert_eq!(url_join(&["", "x"]), "x");
        assert_eq!(url_join(&["http://a", "/b"]), "http://a/b");
        assert_eq!(url_join(&["/a/", "/b?x=1&y=2"]), "/a/b?x=1&y=2");
        assert_eq!(url_join(&["/a", "/b?x=1?y=2"]), "/a/b?x=1?y=2");
    }

    #[test]
    fn connection_upgrade_token_matches_only_whole_token() {
        assert!(connection_has_upgrade_token("upgrade"));
        assert!(connection_has_upgrade_token("Keep-Alive, Upgrade"));
        assert!(connection_has_upgrade_token("upgrade, keep-alive"));
        assert!(!connection_has_upgrade_token("not upgrade"));
        assert!(!connection_has_upgrade_token("keep-alive"));
    }

    #[test]
    fn standard_port_heuristic() {
        assert!(is_standard_port("http", 80));
        assert!(is_standard_port("https", 443));
        assert!(!is_standard_port("http", 8080));
        assert!(!is_standard_port("https", 8443));
    }
}
