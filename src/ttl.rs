//! Rule-driven TTL calculation.
//!
//! `calculate_ttl` is a pure function of path, content type, and status code
//! over an ordered rule set built once from [`crate::config::Config`]. Match
//! order is fixed: path patterns, then status code, then content type, then
//! the configured default. A rule with TTL `<= 0` means "do not cache" and is
//! returned as-is — it is the caller's job (the cache layer) to treat a
//! non-positive TTL as a no-op write.

use crate::config::Config;

/// The compiled rule set used by [`TtlCalculator::calculate`].
///
/// Built once from [`Config`] at startup and shared (it is cheap to clone —
/// a handful of small vectors and maps) rather than re-read from `Config` on
/// every request.
#[derive(Debug, Clone)]
pub struct TtlCalculator {
    path_rules: Vec<(String, i64)>,
    status_rules: std::collections::HashMap<u16, i64>,
    content_type_rules: std::collections::HashMap<String, i64>,
    default_ttl: i64,
}

impl TtlCalculator {
    /// Builds a calculator from the proxy's configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut path_rules = Vec::with_capacity(config.ttl_by_path_pattern.len());
        for rule in &config.ttl_by_path_pattern {
            path_rules.push((rule.pattern.clone(), rule.ttl));
        }
        Self {
            path_rules,
            status_rules: config
                .ttl_by_status_code
                .iter()
                .map(|(&k, &v)| (k, v))
                .collect(),
            content_type_rules: config.ttl_by_content_type.clone(),
            default_ttl: config.cache_default_ttl,
        }
    }

    /// Calculates the TTL, in seconds, for a response.
    ///
    /// `content_type` and `status_code` are `None` when the caller has not
    /// yet received an origin response (e.g. when pre-checking whether a
    /// path is cacheable by pattern alone).
    pub fn calculate(
        &self,
        path: &str,
        content_type: Option<&str>,
        status_code: Option<u16>,
    ) -> i64 {
        for (pattern, ttl) in &self.path_rules {
            if path_matches(pattern, path) {
                return *ttl;
            }
        }

        if let Some(status) = status_code {
            if let Some(ttl) = self.status_rules.get(&status) {
                return *ttl;
            }
        }

        if let Some(ct) = content_type {
            if let Some(ttl) = self.content_type_rules.get(ct) {
                return *ttl;
            }
        }

        self.default_ttl
    }
}

/// Matches a single path-pattern rule against a request path.
///
/// `"<prefix>/*"` matches when `path` starts with `<prefix>/`; any other
/// pattern is a case-sensitive glob supporting `*` and `?`, falling back to
/// an exact match when the pattern has no wildcards at all.
fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let base = format!("{prefix}/");
        return path.starts_with(&base);
    }
    glob_match(pattern, path)
}

/// A small `*`/`?` glob matcher, the Rust equivalent of Python's `fnmatch`
/// for the subset of syntax this proxy needs (no character classes).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_inner(&p, &t)
}

fn glob_match_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            // Match zero characters, or one and recurse on the remainder.
            glob_match_inner(&pattern[1..], text)
                || (!text.is_empty() && glob_match_inner(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && glob_match_inner(&pattern[1..], &text[1..]),
        Some(c) => {
            !text.is_empty() && *c == text[0] && glob_match_inner(&pattern[1..], &text[1..])
        }
    }
}
