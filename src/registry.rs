//! Prefix registry
//! Maps the first path segment of a request to the origin it is forwarded to

use std::collections::HashMap;

/// A single proxy rule keyed by path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixTarget {
    pub prefix: String,
    /// Empty means the prefix itself is used as the origin domain
    pub target_domain: String,
    pub use_secure_transport: bool,
    /// Only honoured when `use_secure_transport` is set
    pub skip_certificate_verification: bool,
}

impl PrefixTarget {
    /// Whether the target domain was given explicitly
    pub fn has_explicit_domain(&self) -> bool {
        !self.target_domain.is_empty()
    }

    /// Domain the request is forwarded to
    pub fn effective_domain(&self) -> &str {
        if self.has_explicit_domain() {
            &self.target_domain
        } else {
            &self.prefix
        }
    }

    /// Whether outbound certificate verification is actually disabled
    pub fn skips_verification(&self) -> bool {
        self.use_secure_transport && self.skip_certificate_verification
    }
}

/// Prefix to target lookup table.
///
/// Built once during startup and shared read-only afterwards, so lookups
/// need no synchronization.
#[derive(Debug, Clone, Default)]
pub struct PrefixRegistry {
    targets: HashMap<String, PrefixTarget>,
}

impl PrefixRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prefix, replacing any earlier entry for it
    pub fn insert(
        &mut self,
        prefix: impl Into<String>,
        target_domain: impl Into<String>,
        use_secure_transport: bool,
        skip_certificate_verification: bool,
    ) {
        let prefix = prefix.into();
        self.targets.insert(
            prefix.clone(),
            PrefixTarget {
                prefix,
                target_domain: target_domain.into(),
                use_secure_transport,
                skip_certificate_verification,
            },
        );
    }

    pub fn lookup(&self, prefix: &str) -> Option<&PrefixTarget> {
        self.targets.get(prefix)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Iterate over registered targets in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &PrefixTarget> {
        self.targets.values()
    }
}
