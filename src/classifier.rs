//! Route classification
//! Decides from the first path segment whether a request is proxied or served from disk

use crate::registry::PrefixRegistry;

/// Outcome of classifying a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// Forward to the origin registered for this prefix
    Proxy(&'a str),
    /// Hand the request to the static file server
    Static,
}

/// First segment of `path` after a single leading `/`, if it is non-empty.
///
/// No case folding or percent-decoding is applied.
pub fn first_segment(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    match rest.split('/').next() {
        Some(segment) if !segment.is_empty() => Some(segment),
        _ => None,
    }
}

/// Classify a request path against the registry
pub fn classify<'a>(registry: &PrefixRegistry, path: &'a str) -> Route<'a> {
    match first_segment(path) {
        Some(prefix) if registry.lookup(prefix).is_some() => Route::Proxy(prefix),
        _ => Route::Static,
    }
}
