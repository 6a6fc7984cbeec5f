//! The HTTP surface of the proxying engine: media proxy, webpage proxy,
//! sub-resource proxy, and cache administration.

use crate::codec::{self, ProxyRequest};
use crate::error::{ProxyError, Result};
use crate::mime;
use crate::rewrite::{rewrite_document, RewriteContext};
use crate::AppState;
use axum::{
    body::{to_bytes, Body},
    extract::{Query, State},
    http::{header, HeaderName, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::collections::HashMap;
use tower_http::trace::TraceLayer;
use url::Url;

// Middleware to log all incoming requests
async fn log_requests(uri: Uri, req: axum::http::Request<Body>, next: Next) -> Response {
    tracing::info!(method = %req.method(), %uri, "proxy request");
    next.run(req).await
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/media/proxy", get(media_proxy))
        .route("/media/proxy-webpage", get(proxy_webpage))
        .route(
            "/webpage/resource",
            get(webpage_resource)
                .post(webpage_resource)
                .options(webpage_resource),
        )
        .route("/webpage/open-external", get(open_external))
        .route("/media/cache/info", get(cache_info))
        .route("/media/cache/cleanup", post(cache_cleanup))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
}

/// Upstream response headers that must not reach the sandboxed viewer. The
/// proxy is the trust boundary now: framing restrictions, CSP, cookies and
/// the origin's own CORS answer all get replaced.
const STRIPPED_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "content-encoding",
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "set-cookie",
    "access-control-allow-origin",
];

fn passthrough_headers(upstream: &reqwest::header::HeaderMap) -> Vec<(HeaderName, String)> {
    let mut out = Vec::new();
    for (name, value) in upstream {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            value.to_str().map(str::to_string),
        ) {
            out.push((name, value));
        }
    }
    out
}

fn permissive_response(status: StatusCode) -> axum::http::response::Builder {
    Response::builder()
        .status(status)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::X_FRAME_OPTIONS, "SAMEORIGIN")
}

fn build_err() -> ProxyError {
    ProxyError::Rewrite("response build failed".into())
}

/// GET /media/proxy — single media file via cache/fetcher.
///
/// 403 when both the cache and the direct fallback are disabled, 400 on a
/// missing or disallowed URL, 500 when every fetch path failed.
async fn media_proxy(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    let req = ProxyRequest::from_query(&params)?;
    let (cache_enabled, fallback_enabled) = {
        let settings = state
            .settings
            .read()
            .map_err(|_| ProxyError::UpstreamFetch("settings lock poisoned".into()))?;
        (settings.media_cache_enabled, settings.media_proxy_fallback)
    };

    if !cache_enabled && !fallback_enabled {
        return Err(ProxyError::ProxyDisabled);
    }

    if cache_enabled {
        match state
            .cache
            .get(&req.target, req.referer.as_deref(), &state.fetcher)
            .await
        {
            Ok((bytes, content_type)) => {
                return permissive_response(StatusCode::OK)
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(bytes))
                    .map_err(|_| build_err());
            }
            Err(err) if fallback_enabled => {
                tracing::warn!(url = %req.target, %err, "cached media fetch failed, falling back to direct streaming");
            }
            Err(err) => return Err(err),
        }
    }

    // Uncached path: stream straight through without buffering.
    let response = state
        .fetcher
        .fetch_streaming(&req.target, req.referer.as_deref())
        .await?;
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_type = mime::resolve(content_type.as_deref(), req.target.as_str());

    permissive_response(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|_| build_err())
}

/// GET /media/proxy-webpage — fetch a page, rewrite it for the sandboxed
/// viewer, serve it. Upstream non-2xx statuses pass through unchanged.
async fn proxy_webpage(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    let req = ProxyRequest::from_query(&params)?;

    let response = state
        .fetcher
        .fetch_subresource(
            Method::GET,
            &req.target,
            req.referer.as_deref(),
            None,
            bytes::Bytes::new(),
        )
        .await?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    // Redirects may have moved us; rewrite against where we ended up.
    let final_url = Url::parse(response.url().as_str()).unwrap_or_else(|_| req.target.clone());
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        return permissive_response(status)
            .body(Body::from(body))
            .map_err(|_| build_err());
    }

    if !mime::is_html(&content_type) {
        // A feed entry can link straight to a PDF or image; stream it.
        let mut builder = permissive_response(status);
        for (name, value) in passthrough_headers(response.headers()) {
            builder = builder.header(name, value);
        }
        return builder
            .body(Body::from_stream(response.bytes_stream()))
            .map_err(|_| build_err());
    }

    let html = response.text().await?;
    let ctx = RewriteContext::new(&final_url);
    let rewritten = rewrite_document(&html, &ctx)?;

    permissive_response(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(rewritten))
        .map_err(|_| build_err())
}

/// GET|POST|OPTIONS /webpage/resource — one sub-resource for a rewritten
/// page. CSS responses are themselves rewritten before being served, so
/// stylesheet-internal imports and fonts keep routing through the proxy.
async fn webpage_resource(
    State(state): State<AppState>,
    method: Method,
    Query(params): Query<HashMap<String, String>>,
    request: axum::http::Request<Body>,
) -> Result<Response> {
    if method == Method::OPTIONS {
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "*")
            .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
            .body(Body::empty())
            .map_err(|_| build_err());
    }

    let req = ProxyRequest::from_query(&params)?;
    // The viewer's own Content-Type must reach the origin with the body.
    let inbound_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body_bytes = to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| ProxyError::UpstreamFetch(e.to_string()))?;

    let response = state
        .fetcher
        .fetch_subresource(
            method,
            &req.target,
            req.referer.as_deref(),
            inbound_type.as_deref(),
            body_bytes,
        )
        .await?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let resource_url = Url::parse(response.url().as_str()).unwrap_or_else(|_| req.target.clone());
    let upstream_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_type = mime::resolve(upstream_type.as_deref(), resource_url.as_str());

    let mut builder = permissive_response(status);
    for (name, value) in passthrough_headers(response.headers()) {
        if name == header::CONTENT_TYPE {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(header::CONTENT_TYPE, content_type.as_str());

    if mime::is_css(&content_type) && status.is_success() {
        let css = response.text().await?;
        let rewritten = crate::css::rewrite_css(&css, &resource_url);
        return builder.body(Body::from(rewritten)).map_err(|_| build_err());
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|_| build_err())
}

/// GET /webpage/open-external — handoff point for sentinel anchor clicks.
/// The host application watches these to open the URL in the system
/// browser; the proxy itself only acknowledges.
async fn open_external(Query(params): Query<HashMap<String, String>>) -> Result<Response> {
    let token = params
        .get("url_b64")
        .ok_or_else(|| ProxyError::InvalidUrl("missing 'url_b64' parameter".into()))?;
    let url = codec::decode_url(token)?;
    codec::validate_target(&url)?;
    tracing::info!(%url, "external navigation handed off to host application");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET /media/cache/info
async fn cache_info(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let bytes = state.cache.size_bytes().await?;
    let mb = bytes as f64 / (1024.0 * 1024.0);
    Ok(Json(json!({ "cache_size_mb": mb })))
}

/// POST /media/cache/cleanup?all=true|false
///
/// Age sweep first, then size sweep; `all=true` expresses "clear
/// everything" as an age sweep with a zero bound, which leaves nothing for
/// the size pass to do.
async fn cache_cleanup(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>> {
    let all = params.get("all").map(|v| v == "true").unwrap_or(false);

    let (max_age_days, max_size_mb) = {
        let settings = state
            .settings
            .read()
            .map_err(|_| ProxyError::UpstreamFetch("settings lock poisoned".into()))?;
        (
            settings.media_cache_max_age_days,
            settings.media_cache_max_size_mb,
        )
    };

    let cleaned = if all {
        state.cache.cleanup_old_files(0).await?
    } else {
        let by_age = state.cache.cleanup_old_files(max_age_days).await?;
        let by_size = state.cache.cleanup_by_size(max_size_mb).await?;
        by_age + by_size
    };

    Ok(Json(json!({ "success": true, "files_cleaned": cleaned })))
}
