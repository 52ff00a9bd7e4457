//! Renaming of reserved query parameters.
//!
//! Layers in front of the proxy interpret some parameters themselves, most
//! notably `dryRun`. On inbound proxy requests these are renamed with a fixed
//! prefix and restored right before the request is forwarded, so they reach
//! the backend untouched.
use axum::{extract::Request, middleware::Next, response::Response};
use http::uri::PathAndQuery;

use super::forward::backend_path;

pub const ESCAPED_PARAMETERS: &[&str] = &["dryRun"];
pub const ESCAPE_PREFIX: &str = "__";

/// Renames reserved parameters to their escaped form. Already escaped
/// queries are left as they are.
pub fn escape_query(query: &str) -> String {
    rewrite_keys(query, |key| {
        ESCAPED_PARAMETERS
            .contains(&key)
            .then(|| format!("{ESCAPE_PREFIX}{key}"))
    })
}

/// Restores escaped parameters to their original name.
pub fn unescape_query(query: &str) -> String {
    rewrite_keys(query, |key| {
        key.strip_prefix(ESCAPE_PREFIX)
            .filter(|original| ESCAPED_PARAMETERS.contains(original))
            .map(ToOwned::to_owned)
    })
}

/// Rewrites parameter names, leaving every other byte of the query alone.
fn rewrite_keys(query: &str, rename: impl Fn(&str) -> Option<String>) -> String {
    query
        .split('&')
        .map(|pair| {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (pair, None),
            };
            match (rename(key), value) {
                (Some(key), Some(value)) => format!("{key}={value}"),
                (Some(key), None) => key,
                (None, _) => pair.to_owned(),
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

pub fn is_proxy_path(path: &str) -> bool {
    backend_path(path).is_some()
}

/// Middleware escaping the query of inbound proxy requests.
pub async fn escape_proxy_queries(mut request: Request, next: Next) -> Response {
    let uri = request.uri();
    if let Some(query) = uri.query().filter(|_| is_proxy_path(uri.path())) {
        let escaped = format!("{}?{}", uri.path(), escape_query(query));
        if let Ok(path_and_query) = PathAndQuery::try_from(escaped) {
            let mut parts = uri.clone().into_parts();
            parts.path_and_query = Some(path_and_query);
            if let Ok(escaped) = http::Uri::from_parts(parts) {
                *request.uri_mut() = escaped;
            }
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("dryRun=All", "__dryRun=All")]
    #[case("timeout=5s&dryRun=All&x", "timeout=5s&__dryRun=All&x")]
    #[case("dryRun", "__dryRun")]
    #[case("dryRunner=1", "dryRunner=1")]
    fn escapes_reserved_parameters(#[case] query: &str, #[case] escaped: &str) {
        assert_eq!(escape_query(query), escaped);
        assert_eq!(unescape_query(escaped), query);
    }

    #[rstest]
    #[case("")]
    #[case("watch=true&resourceVersion=10")]
    #[case("labelSelector=app%3Dweb&limit=500")]
    fn other_queries_are_unchanged(#[case] query: &str) {
        assert_eq!(escape_query(query), query);
        assert_eq!(unescape_query(query), query);
    }

    #[test]
    fn escaping_is_idempotent() {
        let once = escape_query("dryRun=All");
        assert_eq!(escape_query(&once), once);

        let restored = unescape_query(&once);
        assert_eq!(unescape_query(&restored), restored);
    }

    #[rstest]
    #[case("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/proxy", true)]
    #[case(
        "/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/proxy/api/v1/pods",
        true
    )]
    #[case("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/health", false)]
    #[case("/apis/gatewayXopen-cluster-management.io/v1alpha1/clustergateways/c1/proxy", false)]
    #[case("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways//proxy", false)]
    #[case("/healthz", false)]
    fn matches_proxy_paths(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_proxy_path(path), expected);
    }
}
