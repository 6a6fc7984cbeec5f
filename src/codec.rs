use crate::error::{ProxyError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::HashMap;
use url::Url;

/// Path prefixes of our own endpoints. Anything already pointing at one of
/// these must never be wrapped a second time.
pub const RESOURCE_PATH: &str = "/webpage/resource";
pub const MEDIA_PATH: &str = "/media/proxy";

/// Sentinel prefix the attribute rewriter puts on anchor hrefs so the
/// injected click handler can recognize them.
pub const EXTERNAL_ANCHOR_SENTINEL: &str = "#external:";

/// Encode a URL as an opaque token safe to embed inside further proxied
/// URLs. Raw URLs as query parameters are ambiguous to re-parse once they
/// themselves contain query strings or entity-escaped ampersands; an opaque
/// token is not.
pub fn encode_url(url: &str) -> String {
    STANDARD.encode(url.as_bytes())
}

/// Reverse of [`encode_url`]. Must reproduce the exact original bytes.
pub fn decode_url(token: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(token.trim())
        .map_err(|e| ProxyError::Decode(format!("{}: {}", token, e)))?;
    String::from_utf8(bytes).map_err(|_| ProxyError::Decode("token is not valid utf-8".into()))
}

/// Validate a proxy target: absolute http/https only. `data:`, `blob:`,
/// `javascript:`, `file:` and friends are rejected before any I/O happens.
pub fn validate_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProxyError::InvalidUrl(format!(
            "scheme '{}' is not allowed",
            other
        ))),
    }
}

/// True for values that already route through one of our endpoints.
pub fn is_already_proxied(value: &str) -> bool {
    value.starts_with(RESOURCE_PATH)
        || value.starts_with(MEDIA_PATH)
        || value.starts_with(EXTERNAL_ANCHOR_SENTINEL)
}

/// Build the sub-resource proxy path for an absolute URL, carrying the
/// document base along as the referer token.
pub fn resource_proxy_path(absolute: &str, referer: &str) -> String {
    format!(
        "{}?url_b64={}&referer_b64={}",
        RESOURCE_PATH,
        urlencoding::encode(&encode_url(absolute)),
        urlencoding::encode(&encode_url(referer))
    )
}

/// One validated inbound proxy request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub target: Url,
    pub referer: Option<String>,
}

impl ProxyRequest {
    /// Extract a target and optional referer from query parameters. The
    /// encoded forms (`url_b64`, `referer_b64`) win over the plain ones.
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self> {
        let raw_target = match params.get("url_b64") {
            Some(token) => decode_url(token)?,
            None => params
                .get("url")
                .cloned()
                .ok_or_else(|| ProxyError::InvalidUrl("missing 'url' parameter".into()))?,
        };
        let target = validate_target(&raw_target)?;

        let referer = match params.get("referer_b64") {
            Some(token) => Some(decode_url(token)?),
            None => params.get("referer").cloned(),
        };
        let referer = referer.filter(|r| !r.is_empty());

        Ok(ProxyRequest { target, referer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_exact() {
        let urls = [
            "https://site.test/a/b.jpg",
            "https://site.test/page?id=1&x=2#frag",
            "http://host.test/path%20with%20escapes?q=a%26b",
        ];
        for url in urls {
            assert_eq!(decode_url(&encode_url(url)).unwrap(), url);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_url("!!not-base64!!"),
            Err(ProxyError::Decode(_))
        ));
    }

    #[test]
    fn validate_accepts_http_https_only() {
        assert!(validate_target("https://x.test/a.png").is_ok());
        assert!(validate_target("http://x.test/").is_ok());
        for bad in [
            "file:///etc/passwd",
            "javascript:alert(1)",
            "ftp://x.test/a",
            "data:text/html,hi",
            "relative/path.png",
        ] {
            assert!(
                matches!(validate_target(bad), Err(ProxyError::InvalidUrl(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn proxied_paths_are_recognized() {
        assert!(is_already_proxied("/webpage/resource?url_b64=aHR0cA=="));
        assert!(is_already_proxied("/media/proxy?url=https%3A%2F%2Fx"));
        assert!(is_already_proxied("#external:aHR0cA=="));
        assert!(!is_already_proxied("https://site.test/img.png"));
    }

    #[test]
    fn from_query_prefers_encoded_form() {
        let mut params = HashMap::new();
        params.insert("url".to_string(), "https://plain.test/".to_string());
        params.insert(
            "url_b64".to_string(),
            encode_url("https://encoded.test/img.png"),
        );
        let req = ProxyRequest::from_query(&params).unwrap();
        assert_eq!(req.target.as_str(), "https://encoded.test/img.png");
    }

    #[test]
    fn from_query_rejects_bad_scheme() {
        let mut params = HashMap::new();
        params.insert("url".to_string(), "file:///etc/hosts".to_string());
        assert!(ProxyRequest::from_query(&params).is_err());
    }
}
