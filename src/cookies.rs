//! Cookie domain/path rewriting for `Set-Cookie` response headers: no
//! cookie-jar crate, just a targeted regex over the one attribute we care
//! about.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::options::CookieRewrite;

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i);\s*domain=([^;]+)").unwrap());
static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i);\s*path=([^;]+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieProperty {
    Domain,
    Path,
}

fn regex_for(property: CookieProperty) -> &'static Lazy<Regex> {
    match property {
        CookieProperty::Domain => &DOMAIN_RE,
        CookieProperty::Path => &PATH_RE,
    }
}

/// Rewrite one `Set-Cookie` header value's domain or path attribute
/// according to `config`. A mapped value of `""` removes the clause
/// entirely; an unmatched value is returned unchanged.
pub fn rewrite_cookie_property(value: &str, config: &CookieRewrite, property: CookieProperty) -> String {
    let re = regex_for(property);
    let Some(caps) = re.captures(value) else {
        return value.to_string();
    };
    let old = caps.get(1).unwrap().as_str().trim().to_string();
    let Some(new_value) = config.lookup(&old) else {
        return value.to_string();
    };
    let whole_match = caps.get(0).unwrap();
    if new_value.is_empty() {
        let mut out = String::with_capacity(value.len());
        out.push_str(&value[..whole_match.start()]);
        out.push_str(&value[whole_match.end()..]);
        out
    } else {
        let attr = match property {
            CookieProperty::Domain => "domain",
            CookieProperty::Path => "path",
        };
        let mut out = String::with_capacity(value.len());
        out.push_str(&value[..whole_match.start()]);
        out.push_str(&format!("; {attr}={new_value}"));
        out.push_str(&value[whole_match.end()..]);
        out
    }
}

/// Apply domain and/or path rewriting to every element of a (possibly
/// multi-valued) `Set-Cookie` header.
pub fn rewrite_set_cookie_values(
    values: &[String],
    domain_cfg: Option<&CookieRewrite>,
    path_cfg: Option<&CookieRewrite>,
) -> Vec<String> {
    values
        .iter()
        .map(|v| {
            let mut v = v.clone();
            if let Some(cfg) = domain_cfg {
                v = rewrite_cookie_property(&v, cfg, CookieProperty::Domain);
            }
            if let Some(cfg) = path_cfg {
                v = rewrite_cookie_property(&v, cfg, CookieProperty::Path);
            }
            v
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn wildcard_delete_removes_clause() {
        let mut m = HashMap::new();
        m.insert("*".to_string(), "".to_string());
        let cfg = CookieRewrite::Map(m);
        let out = rewrite_cookie_property(
            "sid=abc; Domain=example.com; Path=/",
            &cfg,
            CookieProperty::Domain,
        );
        assert_eq!(out, "sid=abc; Path=/");
    }

    #[test]
    fn unmatched_value_is_unchanged() {
        let cfg = CookieRewrite::Single("new.com".to_string());
        let out = rewrite_cookie_property("sid=abc; Path=/", &cfg, CookieProperty::Domain);
        assert_eq!(out, "sid=abc; Path=/");
    }

    #[test]
    fn single_sugar_rewrites_any_domain() {
        let cfg = CookieRewrite::Single("new.com".to_string());
        let out = rewrite_cookie_property(
            "sid=abc; Domain=old.com; Path=/",
            &cfg,
            CookieProperty::Domain,
        );
        assert_eq!(out, "sid=abc; Domain=new.com; Path=/");
    }
}
