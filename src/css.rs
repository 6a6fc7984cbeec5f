//! Rewrites URL references inside CSS text: `@import` rules (both forms),
//! `@font-face` sources, and generic `url(...)` values. Applied to `<style>`
//! blocks, inline `style` attributes, and proxied stylesheet responses.

use crate::codec;
use regex::{Captures, Regex};
use url::Url;

/// Resolve one CSS URL value against the document base and wrap it in a
/// sub-resource proxy path. Returns None for values that must be left alone.
fn proxied(raw: &str, base: &Url) -> Option<String> {
    let value = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    if value.is_empty()
        || value.starts_with("data:")
        || value.starts_with("blob:")
        || value.starts_with('#')
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

/// Rewrite every external reference in a CSS fragment. Quoting style of the
/// original value is preserved where it matters for `@import "..."`.
pub fn rewrite_css(css: &str, base: &Url) -> String {
    // Pass 1: bare-string @import ("foo.css" without url()). The url() form
    // is picked up by the generic pass below.
    let import_re = Regex::new(r#"@import\s+(['"])([^'"]+)(['"])"#).unwrap();
    let css = import_re.replace_all(css, |caps: &Captures| {
        match proxied(&caps[2], base) {
            Some(path) => format!("@import {}{}{}", &caps[1], path, &caps[3]),
            None => caps[0].to_string(),
        }
    });

    // Pass 2: every url(...) value, which also covers @font-face src lists
    // and background images.
    let url_re = Regex::new(r#"url\(\s*(['"]?)([^'")]+)(['"]?)\s*\)"#).unwrap();
    url_re
        .replace_all(&css, |caps: &Captures| match proxied(&caps[2], base) {
            Some(path) => format!("url({}{}{})", &caps[1], path, &caps[3]),
            None => caps[0].to_string(),
        })
        .to_string()
}
