use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::CorsConfig;

/// Build the CORS layer described by `server.cors`.
///
/// Origins may be exact (`https://app.example.com`), `*`, or subdomain
/// wildcards (`*.example.com`). With credentials enabled the matching origin
/// is echoed back instead of `*`.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins = config.allow_origins.clone();
    let any_origin = origins.iter().any(|o| o == "*");
    let allow_origin = if any_origin && !config.allow_credentials {
        AllowOrigin::any()
    } else {
        AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| origin_allowed(&origins, o))
                .unwrap_or(false)
        })
    };

    let methods: Vec<Method> = config
        .allow_methods
        .iter()
        .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
        .collect();
    let headers: Vec<HeaderName> = config
        .allow_headers
        .iter()
        .filter_map(|h| HeaderName::from_bytes(h.trim().as_bytes()).ok())
        .collect();
    let expose: Vec<HeaderName> = config
        .expose_headers
        .iter()
        .filter_map(|h| HeaderName::from_bytes(h.trim().as_bytes()).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(expose)
        .allow_credentials(config.allow_credentials)
        .max_age(Duration::from_secs(config.max_age))
}

/// Whether `origin` matches one of the configured patterns.
pub fn origin_allowed(patterns: &[String], origin: &str) -> bool {
    let host = strip_scheme(origin);
    let host = host.split(':').next().unwrap_or(host);
    patterns.iter().any(|pattern| {
        let pattern = pattern.trim();
        if pattern == "*" {
            return true;
        }
        if pattern.eq_ignore_ascii_case(origin) {
            return true;
        }
        match strip_scheme(pattern).strip_prefix("*.") {
            Some(domain) => {
                host.len() > domain.len()
                    && host.to_ascii_lowercase().ends_with(&format!(".{}", domain.to_ascii_lowercase()))
            }
            None => strip_scheme(pattern).eq_ignore_ascii_case(host),
        }
    })
}

fn strip_scheme(s: &str) -> &str {
    s.split_once("://").map(|(_, rest)| rest).unwrap_or(s)
}
