//! HTML rewriting for the sandboxed viewer: every external reference in a
//! fixed set of tag/attribute pairs is replaced with a sub-resource proxy
//! path, anchors are diverted to the host application, lazy-loaded images
//! are normalized, and the interception runtime is injected into `<head>`.
//!
//! Targeted streaming rewriting via lol_html; everything outside the
//! handled attributes passes through byte-identical.

use crate::codec::{self, EXTERNAL_ANCHOR_SENTINEL};
use crate::css::rewrite_css;
use crate::error::{ProxyError, Result};
use lol_html::html_content::{ContentType, Element};
use lol_html::{element, text, HtmlRewriter, Settings};
use std::cell::RefCell;
use std::rc::Rc;
use url::Url;

const INTERCEPT_SCRIPT_TEMPLATE: &str = include_str!("../assets/intercept.js");

/// Hostnames the interception script must leave alone: analytics and ad
/// endpoints that are expected to fail and contribute nothing to rendering.
pub const DEFAULT_SKIP_DOMAINS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "googlesyndication.com",
    "doubleclick.net",
    "adservice.google.com",
    "facebook.net",
    "facebook.com",
    "hotjar.com",
    "scorecardresearch.com",
    "quantserve.com",
    "criteo.com",
    "outbrain.com",
    "taboola.com",
    "amazon-adsystem.com",
    "chartbeat.com",
    "parsely.com",
    "newrelic.com",
    "sentry.io",
];

/// Immutable inputs for one rewrite pass.
pub struct RewriteContext<'a> {
    pub base: &'a Url,
    pub skip_domains: &'a [&'a str],
}

impl<'a> RewriteContext<'a> {
    pub fn new(base: &'a Url) -> Self {
        RewriteContext {
            base,
            skip_domains: DEFAULT_SKIP_DOMAINS,
        }
    }

    /// Tests swap in their own list here; production code uses the default.
    pub fn with_skip_domains(base: &'a Url, skip_domains: &'a [&'a str]) -> Self {
        RewriteContext { base, skip_domains }
    }
}

/// Resolve an attribute value against the page base and wrap it in a
/// sub-resource proxy path. None means "leave the attribute untouched".
fn proxied_value(value: &str, base: &Url) -> Option<String> {
    let value = value.trim();
    if value.is_empty()
        || value.starts_with('#')
        || value.starts_with("data:")
        || value.starts_with("blob:")
        || value.starts_with("javascript:")
        || value.starts_with("mailto:")
        || value.starts_with("about:")
        || codec::is_already_proxied(value)
    {
        return None;
    }
    let absolute = base.join(value).ok()?;
    if !matches!(absolute.scheme(), "http" | "https") {
        return None;
    }
    Some(codec::resource_proxy_path(absolute.as_str(), base.as_str()))
}

fn rewrite_attr(el: &mut Element, attr: &str, base: &Url) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(value) = el.get_attribute(attr) {
        if let Some(rewritten) = proxied_value(&value, base) {
            el.set_attribute(attr, &rewritten)?;
        }
    }
    Ok(())
}

/// `srcset` carries several comma-separated "url descriptor" pairs; each
/// URL is rewritten independently, descriptors kept verbatim.
fn rewrite_srcset(srcset: &str, base: &Url) -> String {
    srcset
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            let mut parts = entry.splitn(2, char::is_whitespace);
            let url = parts.next().unwrap_or("");
            let descriptor = parts.next();
            let rewritten = proxied_value(url, base).unwrap_or_else(|| url.to_string());
            match descriptor {
                Some(d) => format!("{} {}", rewritten, d.trim()),
                None => rewritten,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Promote `data-src`/`data-original` into the real `src` and drop the
/// `lazy` class token, so images render without the page's own lazy-load
/// script ever running inside the sandbox.
///
/// Selector matching is computed from the tag as parsed, so an image that
/// had no `src` attribute will never reach the `img[src]` handler even
/// after promotion; the promoted URL must be proxied right here.
fn normalize_lazy_image(el: &mut Element, base: &Url) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let deferred = el
        .get_attribute("data-src")
        .or_else(|| el.get_attribute("data-original"));
    if let Some(real_src) = deferred {
        if !real_src.trim().is_empty() {
            let src = proxied_value(&real_src, base).unwrap_or(real_src);
            el.set_attribute("src", &src)?;
            el.remove_attribute("data-src");
            el.remove_attribute("data-original");
        }
    }
    if let Some(class) = el.get_attribute("class") {
        let kept: Vec<&str> = class
            .split_whitespace()
            .filter(|c| !c.eq_ignore_ascii_case("lazy"))
            .collect();
        if kept.is_empty() {
            el.remove_attribute("class");
        } else if kept.len() != class.split_whitespace().count() {
            el.set_attribute("class", &kept.join(" "))?;
        }
    }
    Ok(())
}

/// Divert an anchor: the resolved absolute target goes base64-encoded into
/// `data-external-href`, the href itself becomes a sentinel fragment the
/// injected click handler recognizes. The sandbox never navigates.
fn rewrite_anchor(el: &mut Element, base: &Url) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(href) = el.get_attribute("href") else {
        return Ok(());
    };
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("data:")
        || href.starts_with("blob:")
        || codec::is_already_proxied(href)
    {
        return Ok(());
    }
    let Ok(absolute) = base.join(href) else {
        return Ok(());
    };
    if !matches!(absolute.scheme(), "http" | "https") {
        return Ok(());
    }
    let token = codec::encode_url(absolute.as_str());
    el.set_attribute("data-external-href", &token)?;
    el.set_attribute("href", &format!("{}{}", EXTERNAL_ANCHOR_SENTINEL, token))?;
    Ok(())
}

/// Render the interception script for this document. Kept as a versioned
/// template with delimited substitution points rather than concatenation,
/// so the emitted JS stays auditable on its own.
pub fn interception_script(ctx: &RewriteContext) -> String {
    let base_json =
        serde_json::to_string(ctx.base.as_str()).unwrap_or_else(|_| "\"\"".to_string());
    let skip_json =
        serde_json::to_string(ctx.skip_domains).unwrap_or_else(|_| "[]".to_string());
    INTERCEPT_SCRIPT_TEMPLATE
        .replace("{{BASE_URL}}", &base_json)
        .replace("{{SKIP_DOMAINS}}", &skip_json)
}

/// Rewrite a complete HTML document for display inside the sandboxed
/// viewer. Pure and request-scoped; safe to run concurrently.
pub fn rewrite_document(html: &str, ctx: &RewriteContext) -> Result<String> {
    let base = ctx.base;
    let script_block = format!("<script>{}</script>", interception_script(ctx));
    // An already-rewritten document carries the runtime's version marker;
    // injecting a second copy would double-patch fetch and XHR.
    let inject_runtime = !html.contains("__proxyRuntimeVersion");

    // <style> text arrives in chunks; buffer until the final chunk of the
    // text node before running the CSS rewriter over it.
    let style_buffer: Rc<RefCell<String>> = Rc::new(RefCell::new(String::new()));
    let style_buffer_handler = style_buffer.clone();

    let mut output = Vec::new();
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                // Interception runtime goes first inside <head>, ahead of
                // the page's own scripts.
                element!("head", {
                    let script_block = script_block.clone();
                    move |el| {
                        if inject_runtime {
                            el.prepend(&script_block, ContentType::Html);
                        }
                        Ok(())
                    }
                }),
                // Lazy-image normalization runs before the src handler on
                // the same element (handler registration order).
                element!("img", move |el| normalize_lazy_image(el, base)),
                element!(
                    "img[src], script[src], iframe[src], video[src], audio[src], source[src], track[src], embed[src]",
                    move |el| rewrite_attr(el, "src", base)
                ),
                element!("video[poster]", move |el| rewrite_attr(el, "poster", base)),
                element!("link[href]", move |el| rewrite_attr(el, "href", base)),
                element!("object[data]", move |el| rewrite_attr(el, "data", base)),
                element!("form[action]", move |el| rewrite_attr(el, "action", base)),
                element!("a[href]", move |el| rewrite_anchor(el, base)),
                element!("img[srcset], source[srcset]", move |el| {
                    if let Some(srcset) = el.get_attribute("srcset") {
                        el.set_attribute("srcset", &rewrite_srcset(&srcset, base))?;
                    }
                    Ok(())
                }),
                element!("[style]", move |el| {
                    if let Some(style) = el.get_attribute("style") {
                        el.set_attribute("style", &rewrite_css(&style, base))?;
                    }
                    Ok(())
                }),
                text!("style", move |chunk| {
                    style_buffer_handler.borrow_mut().push_str(chunk.as_str());
                    if chunk.last_in_text_node() {
                        let buffered = style_buffer_handler.replace(String::new());
                        // Html keeps the CSS raw; Text would entity-escape
                        // child combinators and ampersands.
                        chunk.replace(&rewrite_css(&buffered, base), ContentType::Html);
                    } else {
                        chunk.remove();
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter
        .write(html.as_bytes())
        .map_err(|e| ProxyError::Rewrite(e.to_string()))?;
    rewriter
        .end()
        .map_err(|e| ProxyError::Rewrite(e.to_string()))?;

    String::from_utf8(output).map_err(|e| ProxyError::Rewrite(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_url;

    fn base() -> Url {
        Url::parse("https://site.test/a/index.html").unwrap()
    }

    fn rewrite(html: &str) -> String {
        rewrite_document(html, &RewriteContext::new(&base())).unwrap()
    }

    /// Decode the target hidden inside the first rewritten attribute. The
    /// full prefix keeps this from matching the injected runtime, whose
    /// source mentions `url_b64` on its own.
    fn first_decoded_target(html: &str) -> String {
        let marker = "/webpage/resource?url_b64=";
        let start = html.find(marker).unwrap() + marker.len();
        let token = html[start..].split(['&', '"', '\'']).next().unwrap();
        decode_url(&urlencoding::decode(token).unwrap()).unwrap()
    }

    #[test]
    fn relative_img_src_resolves_against_base() {
        let out = rewrite(r#"<html><head></head><body><img src="b.jpg"></body></html>"#);
        assert!(out.contains("/webpage/resource?url_b64="));
        assert_eq!(first_decoded_target(&out), "https://site.test/a/b.jpg");
    }

    #[test]
    fn absolute_and_protocol_relative_srcs_are_rewritten() {
        let out = rewrite(r#"<img src="https://cdn.test/x.png"><img src="//cdn.test/y.png">"#);
        assert_eq!(first_decoded_target(&out), "https://cdn.test/x.png");
        assert!(out.contains(&codec::encode_url("https://cdn.test/y.png")[..8]));
    }

    #[test]
    fn data_and_fragment_values_are_untouched() {
        let html = r##"<img src="data:image/png;base64,AA"><a href="#top">up</a>"##;
        let out = rewrite(html);
        assert!(out.contains(r#"src="data:image/png;base64,AA""#));
        assert!(out.contains(r##"href="#top""##));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let once = rewrite(r#"<html><head></head><body><img src="b.jpg"><a href="next.html">n</a></body></html>"#);
        let twice = rewrite_document(&once, &RewriteContext::new(&base())).unwrap();
        // second pass may re-inject nothing and re-wrap nothing
        assert_eq!(
            once.matches("/webpage/resource?url_b64=").count(),
            twice.matches("/webpage/resource?url_b64=").count()
        );
        assert_eq!(
            once.matches("data-external-href=\"").count(),
            twice.matches("data-external-href=\"").count()
        );
    }

    #[test]
    fn runtime_is_injected_exactly_once_across_passes() {
        let once = rewrite(r#"<html><head></head><body></body></html>"#);
        assert_eq!(once.matches("Proxy interception runtime").count(), 1);
        let twice = rewrite_document(&once, &RewriteContext::new(&base())).unwrap();
        assert_eq!(twice.matches("Proxy interception runtime").count(), 1);
    }

    #[test]
    fn lazy_image_is_promoted_before_rewriting() {
        let out = rewrite(r#"<img data-src="https://cdn.test/img.png" class="lazy thumb">"#);
        assert!(!out.contains("data-src="));
        assert!(out.contains(r#"class="thumb""#));
        assert_eq!(first_decoded_target(&out), "https://cdn.test/img.png");
    }

    // An image that never had a src does not match the src selector after
    // promotion, so the promoted URL must come out proxied regardless.
    #[test]
    fn promoted_lazy_src_is_proxied_without_an_original_src() {
        let out = rewrite(r#"<img data-original="deferred/pic.jpg" class="lazy">"#);
        assert!(!out.contains("data-original="));
        assert!(!out.contains("class="));
        assert!(out.contains("/webpage/resource?url_b64="));
        assert_eq!(first_decoded_target(&out), "https://site.test/a/deferred/pic.jpg");
    }

    #[test]
    fn anchor_becomes_sentinel_with_marker_attribute() {
        let out = rewrite(r#"<a href="article.html">read</a>"#);
        assert!(out.contains("data-external-href=\""));
        assert!(out.contains("href=\"#external:"));
        let token_start = out.find("data-external-href=\"").unwrap() + "data-external-href=\"".len();
        let token = out[token_start..].split('"').next().unwrap();
        assert_eq!(
            decode_url(token).unwrap(),
            "https://site.test/a/article.html"
        );
    }

    #[test]
    fn style_block_and_inline_style_are_rewritten() {
        let out = rewrite(
            r#"<html><head><style>body{background:url(bg.png)}</style></head><body><div style="background:url('deep/tile.gif')"></div></body></html>"#,
        );
        assert_eq!(out.matches("/webpage/resource?url_b64=").count(), 2);
    }

    #[test]
    fn interception_script_is_prepended_to_head() {
        let out = rewrite(r#"<html><head><script src="app.js"></script></head><body></body></html>"#);
        let injected_pos = out.find("Proxy interception runtime").unwrap();
        // the page's own script, now proxied, must come after the runtime
        let page_script_pos = out.find("/webpage/resource?url_b64=").unwrap();
        assert!(injected_pos < page_script_pos);
        assert!(out.contains(r#"var BASE_URL = "https://site.test/a/index.html""#));
    }

    #[test]
    fn skip_domains_are_substituted_into_script() {
        let base = base();
        let skip = ["tracker.test"];
        let ctx = RewriteContext::with_skip_domains(&base, &skip);
        let script = interception_script(&ctx);
        assert!(script.contains(r#"["tracker.test"]"#));
        assert!(!script.contains("{{SKIP_DOMAINS}}"));
        assert!(!script.contains("{{BASE_URL}}"));
    }

    // The guard must cover both lookup paths a page can take to pushState.
    #[test]
    fn history_guard_is_pinned_on_the_instance() {
        let base = base();
        let script = interception_script(&RewriteContext::new(&base));
        assert!(script.contains("History.prototype.pushState = guardHistory"));
        assert!(script.contains("window.history.pushState = History.prototype.pushState"));
        assert!(script.contains("window.history.replaceState = History.prototype.replaceState"));
    }

    #[test]
    fn form_action_and_object_data_are_rewritten() {
        let out = rewrite(r#"<form action="/submit"></form><object data="movie.swf"></object>"#);
        assert_eq!(out.matches("/webpage/resource?url_b64=").count(), 2);
    }

    #[test]
    fn srcset_descriptors_survive() {
        let out = rewrite(r#"<img srcset="small.jpg 1x, large.jpg 2x">"#);
        assert!(out.contains(" 1x,"));
        assert!(out.contains(" 2x"));
        assert_eq!(out.matches("/webpage/resource?url_b64=").count(), 2);
    }

    #[test]
    fn unquoted_and_single_quoted_attributes_are_handled() {
        let out = rewrite(r#"<img src=b.jpg><img src='c.jpg'>"#);
        assert_eq!(out.matches("/webpage/resource?url_b64=").count(), 2);
    }
}
