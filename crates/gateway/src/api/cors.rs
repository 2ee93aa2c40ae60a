//! CORS policy for the control surface.
//!
//! Configured origins are either exact (`https://ops.example.com`) or
//! any-port for a host (`http://localhost:*`). A `"*"` entry opens the
//! API to every origin, which drops credentials support.

use axum::http::{header, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use vox_domain::config::CorsConfig;

const METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

/// Build the CORS layer from the configured origin list.
pub fn layer(cfg: &CorsConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods(METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    match OriginPolicy::parse(&cfg.allowed_origins) {
        OriginPolicy::AllowAny => {
            tracing::warn!("CORS allows every origin");
            base.allow_origin(Any)
        }
        policy => base
            .allow_origin(AllowOrigin::predicate(move |origin, _| {
                policy.allows(origin.to_str().unwrap_or(""))
            }))
            .allow_credentials(true),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Origin rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum OriginPolicy {
    AllowAny,
    Rules(Vec<OriginRule>),
}

enum OriginRule {
    Exact(String),
    /// Scheme+host prefix ending in `:`; any numeric port matches.
    AnyPort(String),
}

impl OriginPolicy {
    fn parse(origins: &[String]) -> Self {
        if origins.iter().any(|o| o == "*") {
            return OriginPolicy::AllowAny;
        }
        let rules = origins
            .iter()
            .map(|origin| match origin.strip_suffix(":*") {
                Some(host) => OriginRule::AnyPort(format!("{host}:")),
                None => OriginRule::Exact(origin.clone()),
            })
            .collect();
        OriginPolicy::Rules(rules)
    }

    fn allows(&self, origin: &str) -> bool {
        let rules = match self {
            OriginPolicy::AllowAny => return true,
            OriginPolicy::Rules(rules) => rules,
        };
        rules.iter().any(|rule| match rule {
            OriginRule::Exact(expected) => origin == expected,
            OriginRule::AnyPort(prefix) => match origin.strip_prefix(prefix.as_str()) {
                // The whole remainder must be the port number; anything
                // else is a lookalike host such as `localhost:80.evil.com`.
                Some(port) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
                None => false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str]) -> OriginPolicy {
        let owned: Vec<String> = origins.iter().map(|s| s.to_string()).collect();
        OriginPolicy::parse(&owned)
    }

    #[test]
    fn exact_origin_matches_itself_only() {
        let p = policy(&["https://ops.example.com"]);
        assert!(p.allows("https://ops.example.com"));
        assert!(!p.allows("https://ops.example.com.evil.com"));
        assert!(!p.allows("http://ops.example.com"));
    }

    #[test]
    fn any_port_accepts_numeric_ports_only() {
        let p = policy(&["http://localhost:*"]);
        assert!(p.allows("http://localhost:3000"));
        assert!(p.allows("http://localhost:8"));
        assert!(!p.allows("http://localhost:"));
        assert!(!p.allows("http://localhost"));
    }

    #[test]
    fn any_port_rejects_lookalike_hosts() {
        let p = policy(&["http://localhost:*"]);
        assert!(!p.allows("http://localhost:3000.evil.com"));
        assert!(!p.allows("http://localhost:3000evil"));
    }

    #[test]
    fn wildcard_entry_allows_everything() {
        let p = policy(&["https://a.example", "*"]);
        assert!(matches!(p, OriginPolicy::AllowAny));
        assert!(p.allows("https://anything.example"));
    }

    #[test]
    fn mixed_rules_check_each() {
        let p = policy(&["https://a.example", "http://127.0.0.1:*"]);
        assert!(p.allows("https://a.example"));
        assert!(p.allows("http://127.0.0.1:9999"));
        assert!(!p.allows("https://b.example"));
    }
}
