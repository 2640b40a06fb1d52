//! Request rewriting
//! Turns a matched prefix rule and the inbound path/query into the outbound target

use crate::registry::PrefixTarget;
use hyper::Uri;
use std::fmt;

/// Outbound protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a single request is forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    pub scheme: Scheme,
    /// Authority of the origin, also sent as the Host header
    pub host: String,
    pub path: String,
    /// Inbound query string without the `?`, possibly empty
    pub query: String,
}

impl RewriteResult {
    /// Origin-form request target (`/path?query`)
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Absolute target URL
    pub fn target_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path_and_query())
    }

    /// Parse the absolute target URL
    pub fn target_uri(&self) -> Result<Uri, hyper::http::uri::InvalidUri> {
        self.target_url().parse()
    }
}

/// Compute the outbound target for a request matched to `target`.
///
/// With an explicit target domain the path is forwarded unchanged, prefix
/// included. When the domain is borrowed from the prefix, the prefix
/// segment is stripped.
pub fn rewrite(target: &PrefixTarget, original_path: &str, original_query: &str) -> RewriteResult {
    let scheme = if target.use_secure_transport {
        Scheme::Https
    } else {
        Scheme::Http
    };

    let path = if target.has_explicit_domain() {
        if original_path.starts_with('/') {
            original_path.to_string()
        } else {
            format!("/{}", original_path)
        }
    } else {
        strip_prefix_segment(original_path)
    };

    RewriteResult {
        scheme,
        host: target.effective_domain().to_string(),
        path,
        query: original_query.to_string(),
    }
}

/// Drop the first path segment, keeping everything after it
fn strip_prefix_segment(path: &str) -> String {
    let rest = path.strip_prefix('/').unwrap_or(path);
    match rest.split_once('/') {
        Some((_, remaining)) => format!("/{}", remaining),
        None => "/".to_string(),
    }
}
