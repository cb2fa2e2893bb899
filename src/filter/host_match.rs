//! Shared host-pattern matching for the allow-list and deny-list stages.
//! Patterns support a `*.` prefix wildcard (subdomain match); anything
//! else is an exact, case-insensitive match.

#[derive(Debug, Clone)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into().to_ascii_lowercase())
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if let Some(suffix) = self.0.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == self.0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostMatchList {
    patterns: Vec<HostPattern>,
}

impl HostMatchList {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            patterns: patterns.into_iter().map(HostPattern::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_subdomains_but_not_bare_domain_mismatch() {
        let list = HostMatchList::new(["*.internal.example.com".to_string()]);
        assert!(list.matches("svc.internal.example.com"));
        assert!(list.matches("internal.example.com"));
        assert!(!list.matches("evilinternal.example.com"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let list = HostMatchList::new(["Api.Example.com".to_string()]);
        assert!(list.matches("api.example.com"));
    }
}
