//! Outbound fetching for proxied media and sub-resources. Presents a
//! browser identity and the page referer so hotlink-protected origins serve
//! us, and routes through the user's outbound proxy when one is configured.

use crate::error::{ProxyError, Result};
use crate::mime;
use crate::settings::SharedSettings;
use axum::http::StatusCode;
use bytes::Bytes;
use reqwest::header;
use std::time::Duration;
use url::Url;

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Clone)]
pub struct MediaFetcher {
    settings: SharedSettings,
}

impl MediaFetcher {
    pub fn new(settings: SharedSettings) -> Self {
        MediaFetcher { settings }
    }

    /// Client configured the same way for every upstream request: bounded
    /// timeouts so a hung origin cannot pin a worker, transparent
    /// decompression, and the outbound proxy when enabled.
    fn client(&self) -> Result<reqwest::Client> {
        let settings = self
            .settings
            .read()
            .map_err(|_| ProxyError::UpstreamFetch("settings lock poisoned".into()))?
            .clone();

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true)
            .deflate(true);

        if let Some(proxy_url) = settings.outbound_proxy_url() {
            let mut proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| ProxyError::UpstreamFetch(format!("bad proxy config: {}", e)))?;
            if !settings.proxy_username.is_empty() {
                proxy = proxy.basic_auth(&settings.proxy_username, &settings.proxy_password);
            }
            builder = builder.proxy(proxy);
        }

        Ok(builder.build()?)
    }

    fn request(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        url: &Url,
        referer: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = client
            .request(method, url.clone())
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .header(header::CONNECTION, "keep-alive");
        // Referer defeats anti-hotlinking; fall back to the target itself,
        // which many image hosts accept as a same-site request.
        match referer {
            Some(referer) => req = req.header(header::REFERER, referer),
            None => req = req.header(header::REFERER, url.as_str()),
        }
        req
    }

    /// Fully buffered fetch, used when the bytes also need to be persisted
    /// to the media cache. Returns body and effective content type.
    pub async fn fetch_buffered(&self, url: &Url, referer: Option<&str>) -> Result<(Bytes, String)> {
        let client = self.client()?;
        let response = self
            .request(&client, reqwest::Method::GET, url, referer)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::UpstreamStatus(
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            ));
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = mime::resolve(content_type.as_deref(), url.as_str());
        let bytes = response.bytes().await?;
        Ok((bytes, content_type))
    }

    /// Streaming fetch for the uncached fallback path; the caller wraps the
    /// response body with `Body::from_stream` instead of buffering it.
    pub async fn fetch_streaming(
        &self,
        url: &Url,
        referer: Option<&str>,
    ) -> Result<reqwest::Response> {
        let client = self.client()?;
        let response = self
            .request(&client, reqwest::Method::GET, url, referer)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::UpstreamStatus(
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            ));
        }
        Ok(response)
    }

    /// Sub-resource passthrough with an arbitrary method and body, used by
    /// the `/webpage/resource` endpoint for POST form submissions.
    pub async fn fetch_subresource(
        &self,
        method: reqwest::Method,
        url: &Url,
        referer: Option<&str>,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let client = self.client()?;
        let request =
            self.subresource_request(&client, method, url, referer, content_type, body)?;
        Ok(client.execute(request).await?)
    }

    /// The caller's Content-Type travels with the forwarded body; a form
    /// post arriving upstream without it gets parsed as an empty form.
    fn subresource_request(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        url: &Url,
        referer: Option<&str>,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<reqwest::Request> {
        let mut req = self.request(client, method, url, referer);
        if let Some(content_type) = content_type {
            req = req.header(header::CONTENT_TYPE, content_type);
        }
        if !body.is_empty() {
            req = req.body(body);
        }
        Ok(req.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{shared, Settings};

    #[test]
    fn client_builds_without_proxy() {
        let fetcher = MediaFetcher::new(shared(Settings::default()));
        assert!(fetcher.client().is_ok());
    }

    #[test]
    fn client_builds_with_socks_proxy() {
        let mut settings = Settings::default();
        settings.proxy_enabled = true;
        settings.proxy_type = "socks5".into();
        settings.proxy_host = "127.0.0.1".into();
        settings.proxy_port = 9050;
        settings.proxy_username = "user".into();
        settings.proxy_password = "pass".into();
        let fetcher = MediaFetcher::new(shared(settings));
        assert!(fetcher.client().is_ok());
    }

    #[test]
    fn subresource_request_forwards_the_inbound_content_type() {
        let fetcher = MediaFetcher::new(shared(Settings::default()));
        let client = fetcher.client().unwrap();
        let url = Url::parse("https://forms.test/submit").unwrap();

        let req = fetcher
            .subresource_request(
                &client,
                reqwest::Method::POST,
                &url,
                Some("https://site.test/page"),
                Some("application/x-www-form-urlencoded"),
                Bytes::from_static(b"q=rust"),
            )
            .unwrap();
        assert_eq!(
            req.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert!(req.body().is_some());

        // GET without a body stays free of a Content-Type of its own.
        let req = fetcher
            .subresource_request(&client, reqwest::Method::GET, &url, None, None, Bytes::new())
            .unwrap();
        assert!(req.headers().get(header::CONTENT_TYPE).is_none());
    }
}
