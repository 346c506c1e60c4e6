//! Header filtering and Location rewriting for the reverse proxy (§4.3).

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Headers that are meaningful only for a single hop and must never be
/// forwarded in either direction, plus `host` — removed outbound so the HTTP
/// client sets one matching the upstream registry (the registry's
/// blob-upload session JWT is bound to the Host header it saw).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

const OCI_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// For `GET`/`HEAD` requests under `/manifests/`, widen the `Accept` header
/// so OCI-only images aren't rejected by clients that only asked for Docker
/// media types.
pub fn widen_oci_accept(headers: &mut HeaderMap, path: &str, is_pull: bool) {
    if !is_pull || !path.contains("/manifests/") {
        return;
    }
    let existing = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mut widened = if existing.is_empty() {
        String::new()
    } else {
        format!("{existing}, ")
    };
    widened.push_str(OCI_MANIFEST_TYPE);
    widened.push_str(", ");
    widened.push_str(OCI_INDEX_TYPE);
    if let Ok(value) = HeaderValue::from_str(&widened) {
        headers.insert(axum::http::header::ACCEPT, value);
    }
}

/// Replace the upstream base URL in a `Location` header with the proxy's own
/// public base URL, preserving the trailing path so clients follow upload
/// session hops through the proxy rather than straight to the registry.
pub fn rewrite_location(location: &str, upstream_base: &str, public_base: &str) -> String {
    let upstream_base = upstream_base.trim_end_matches('/');
    let public_base = public_base.trim_end_matches('/');
    if let Some(rest) = location.strip_prefix(upstream_base) {
        return format!("{public_base}{rest}");
    }
    // Some registries emit a path-only Location; leave host-relative values alone.
    location.to_string()
}

pub fn location_header_name() -> HeaderName {
    axum::http::header::LOCATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_all_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("registry:5000"));
        headers.insert("x-custom", HeaderValue::from_static("keep-me"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("host").is_none());
        assert!(headers.get("x-custom").is_some());
    }

    #[test]
    fn widens_accept_only_for_manifest_pulls() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ACCEPT, HeaderValue::from_static("application/json"));
        widen_oci_accept(&mut headers, "/library/alpine/manifests/3.19", true);
        let value = headers.get(axum::http::header::ACCEPT).unwrap().to_str().unwrap();
        assert!(value.contains("application/json"));
        assert!(value.contains(OCI_MANIFEST_TYPE));
        assert!(value.contains(OCI_INDEX_TYPE));
    }

    #[test]
    fn does_not_widen_accept_for_blob_requests() {
        let mut headers = HeaderMap::new();
        widen_oci_accept(&mut headers, "/library/alpine/blobs/sha256:abc", true);
        assert!(headers.get(axum::http::header::ACCEPT).is_none());
    }

    #[test]
    fn does_not_widen_accept_for_pushes() {
        let mut headers = HeaderMap::new();
        widen_oci_accept(&mut headers, "/library/alpine/manifests/3.19", false);
        assert!(headers.get(axum::http::header::ACCEPT).is_none());
    }

    #[test]
    fn rewrites_location_preserving_trailing_path() {
        let rewritten = rewrite_location(
            "http://registry-internal:5000/v2/library/alpine/blobs/uploads/abc?_state=xyz",
            "http://registry-internal:5000",
            "https://portalcrane.example.com",
        );
        assert_eq!(
            rewritten,
            "https://portalcrane.example.com/v2/library/alpine/blobs/uploads/abc?_state=xyz"
        );
    }
}
