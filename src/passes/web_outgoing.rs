//! Web-outgoing pipeline: five passes run on the upstream response before
//! the client sees it. Unlike the incoming pipelines these are synchronous
//! pure transforms over a response draft — plain functions over owned data
//! rather than trait objects with I/O.

use http::{HeaderMap, HeaderValue, StatusCode, Version};
use url::Url;

use crate::cookies::rewrite_set_cookie_values;
use crate::error::ProxyError;
use crate::options::ResolvedOptions;
use crate::pass::{Named, PassOutcome};

/// The client response being assembled. `write_headers`/`write_status_code`
/// are the last passes to touch it before [`ClientResponseDraft::into_response`]
/// is called by the `stream` pass.
#[derive(Debug, Clone)]
pub struct ClientResponseDraft {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// What the `stream` pass knows about the upstream response and the
/// original client request, handed to each outgoing pass.
pub struct OutgoingPassContext<'a> {
    pub req_version: Version,
    pub req_connection_header: Option<&'a str>,
    pub req_host_header: Option<&'a str>,
}

pub trait WebOutgoingPass: Named + Send + Sync {
    fn run(
        &self,
        draft: &mut ClientResponseDraft,
        ctx: &OutgoingPassContext<'_>,
        resolved: &ResolvedOptions,
    ) -> Result<PassOutcome<()>, ProxyError>;
}

pub struct RemoveChunked;
impl Named for RemoveChunked {
    fn name(&self) -> &'static str {
        "removeChunked"
    }
}
impl WebOutgoingPass for RemoveChunked {
    fn run(
        &self,
        draft: &mut ClientResponseDraft,
        ctx: &OutgoingPassContext<'_>,
        _resolved: &ResolvedOptions,
    ) -> Result<PassOutcome<()>, ProxyError> {
        if ctx.req_version == Version::HTTP_10 {
            draft.headers.remove(http::header::TRANSFER_ENCODING);
        }
        Ok(PassOutcome::Continue)
    }
}

pub struct SetConnection;
impl Named for SetConnection {
    fn name(&self) -> &'static str {
        "setConnection"
    }
}
impl WebOutgoingPass for SetConnection {
    fn run(
        &self,
        draft: &mut ClientResponseDraft,
        ctx: &OutgoingPassContext<'_>,
        _resolved: &ResolvedOptions,
    ) -> Result<PassOutcome<()>, ProxyError> {
        if ctx.req_version == Version::HTTP_10 {
            let value = ctx.req_connection_header.unwrap_or("close");
            draft
                .headers
                .insert(http::header::CONNECTION, HeaderValue::from_str(value).unwrap());
        } else if ctx.req_version != Version::HTTP_2 && !draft.headers.contains_key(http::header::CONNECTION) {
            let value = ctx.req_connection_header.unwrap_or("keep-alive");
            if let Ok(hv) = HeaderValue::from_str(value) {
                draft.headers.insert(http::header::CONNECTION, hv);
            }
        }
        Ok(PassOutcome::Continue)
    }
}

const REDIRECT_STATUSES: [u16; 5] = [201, 301, 302, 307, 308];

pub struct SetRedirectHostRewrite;
impl Named for SetRedirectHostRewrite {
    fn name(&self) -> &'static str {
        "setRedirectHostRewrite"
    }
}
impl WebOutgoingPass for SetRedirectHostRewrite {
    fn run(
        &self,
        draft: &mut ClientResponseDraft,
        ctx: &OutgoingPassContext<'_>,
        resolved: &ResolvedOptions,
    ) -> Result<PassOutcome<()>, ProxyError> {
        let rewrite_requested =
            resolved.host_rewrite.is_some() || resolved.auto_rewrite || resolved.protocol_rewrite.is_some();
        if !rewrite_requested {
            return Ok(PassOutcome::Continue);
        }
        let Some(target) = &resolved.target else {
            return Ok(PassOutcome::Continue);
        };
        if !REDIRECT_STATUSES.contains(&draft.status.as_u16()) {
            return Ok(PassOutcome::Continue);
        }
        let Some(location) = draft.headers.get(http::header::LOCATION).cloned() else {
            return Ok(PassOutcome::Continue);
        };
        let Ok(location_str) = location.to_str() else {
            return Ok(PassOutcome::Continue);
        };
        let Ok(mut location_url) = Url::parse(location_str) else {
            return Ok(PassOutcome::Continue);
        };
        if location_url.host_str() != Some(target.hostname.as_str()) {
            // Off-target redirect: never rewrite.
            return Ok(PassOutcome::Continue);
        }

        if let Some(host_rewrite) = &resolved.host_rewrite {
            let _ = location_url.set_host(Some(host_rewrite));
        } else if resolved.auto_rewrite {
            if let Some(incoming_host) = ctx.req_host_header {
                let host_only = incoming_host.split(':').next().unwrap_or(incoming_host);
                let _ = location_url.set_host(Some(host_only));
            }
        }
        if let Some(protocol) = &resolved.protocol_rewrite {
            let _ = location_url.set_scheme(protocol.trim_end_matches(':'));
        }

        if let Ok(hv) = HeaderValue::from_str(location_url.as_str()) {
            draft.headers.insert(http::header::LOCATION, hv);
        }
        Ok(PassOutcome::Continue)
    }
}

pub struct WriteHeaders;
impl Named for WriteHeaders {
    fn name(&self) -> &'static str {
        "writeHeaders"
    }
}
impl WebOutgoingPass for WriteHeaders {
    fn run(
        &self,
        draft: &mut ClientResponseDraft,
        ctx: &OutgoingPassContext<'_>,
        resolved: &ResolvedOptions,
    ) -> Result<PassOutcome<()>, ProxyError> {
        if resolved.cookie_domain_rewrite.is_some() || resolved.cookie_path_rewrite.is_some() {
            let set_cookie_values: Vec<String> = draft
                .headers
                .get_all(http::header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok().map(|s| s.to_string()))
                .collect();
            if !set_cookie_values.is_empty() {
                let rewritten = rewrite_set_cookie_values(
                    &set_cookie_values,
                    resolved.cookie_domain_rewrite.as_ref(),
                    resolved.cookie_path_rewrite.as_ref(),
                );
                draft.headers.remove(http::header::SET_COOKIE);
                for v in rewritten {
                    if let Ok(hv) = HeaderValue::from_str(&v) {
                        draft.headers.append(http::header::SET_COOKIE, hv);
                    }
                }
            }
        }

        // `preserveHeaderKeyCase` is honored below this pass, at the
        // connection-serialization layer: the listener's
        // `auto::Builder::http1().title_case_headers(true)
        // .preserve_header_case(true)` (set once in `ProxyServer::
        // serve_connection`) makes hyper itself preserve the original
        // casing of every response header it writes to the client socket.
        // `http::HeaderMap` is case-insensitive-keyed, so there is nothing
        // left for this pass to do per-response.

        Ok(PassOutcome::Continue)
    }
}

/// Always a no-op here: `draft.status` is already the upstream status by
/// construction. Kept as its own named, spliceable pass for parity with the
/// rest of the pipeline — `http::Response` has no custom reason-phrase slot,
/// so there is nothing else left for this pass to do.
pub struct WriteStatusCode;
impl Named for WriteStatusCode {
    fn name(&self) -> &'static str {
        "writeStatusCode"
    }
}
impl WebOutgoingPass for WriteStatusCode {
    fn run(
        &self,
        _draft: &mut ClientResponseDraft,
        _ctx: &OutgoingPassContext<'_>,
        _resolved: &ResolvedOptions,
    ) -> Result<PassOutcome<()>, ProxyError> {
        Ok(PassOutcome::Continue)
    }
}

/// The fixed web-outgoing pipeline, built fresh per `ProxyServer`.
pub fn default_web_outgoing_passes() -> Vec<Box<dyn WebOutgoingPass>> {
    vec![
        Box::new(RemoveChunked),
        Box::new(SetConnection),
        Box::new(SetRedirectHostRewrite),
        Box::new(WriteHeaders),
        Box::new(WriteStatusCode),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ProxyOptions, TargetSpec};

    fn ctx<'a>() -> OutgoingPassContext<'a> {
        OutgoingPassContext {
            req_version: Version::HTTP_11,
            req_connection_header: None,
            req_host_header: None,
        }
    }

    #[test]
    fn redirect_rewrite_skips_off_target_host() {
        let mut opts = ProxyOptions::new().target(TargetSpec::url("http://example.com"));
        opts.auto_rewrite = true;
        let resolved = opts.resolve().unwrap();

        let mut draft = ClientResponseDraft {
            status: StatusCode::FOUND,
            headers: HeaderMap::new(),
        };
        draft.headers.insert(
            http::header::LOCATION,
            HeaderValue::from_static("http://other.example/path"),
        );

        let pass = SetRedirectHostRewrite;
        pass.run(&mut draft, &ctx(), &resolved).unwrap();
        assert_eq!(
            draft.headers.get(http::header::LOCATION).unwrap(),
            "http://other.example/path"
        );
    }

    #[test]
    fn redirect_rewrite_requires_redirect_status() {
        let mut opts = ProxyOptions::new().target(TargetSpec::url("http://example.com"));
        opts.auto_rewrite = true;
        let resolved = opts.resolve().unwrap();

        let mut draft = ClientResponseDraft {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        };
        draft.headers.insert(
            http::header::LOCATION,
            HeaderValue::from_static("http://example.com/path"),
        );

        let pass = SetRedirectHostRewrite;
        pass.run(&mut draft, &ctx(), &resolved).unwrap();
        assert_eq!(
            draft.headers.get(http::header::LOCATION).unwrap(),
            "http://example.com/path"
        );
    }

    #[test]
    fn remove_chunked_only_for_http_10() {
        let opts = ProxyOptions::new().target(TargetSpec::url("http://example.com"));
        let resolved = opts.resolve().unwrap();
        let mut draft = ClientResponseDraft {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        };
        draft
            .headers
            .insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let mut c = ctx();
        c.req_version = Version::HTTP_11;
        RemoveChunked.run(&mut draft, &c, &resolved).unwrap();
        assert!(draft.headers.contains_key(http::header::TRANSFER_ENCODING));

        c.req_version = Version::HTTP_10;
        RemoveChunked.run(&mut draft, &c, &resolved).unwrap();
        assert!(!draft.headers.contains_key(http::header::TRANSFER_ENCODING));
    }
}
