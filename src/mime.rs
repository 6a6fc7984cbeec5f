//! Content-type inference from file extensions. Upstream servers routinely
//! serve stylesheets as `text/plain` or fonts as `application/octet-stream`,
//! which makes browsers refuse to apply them inside the sandboxed viewer.

/// Extensions whose content type we trust over a missing, generic, or
/// contradicting upstream header.
const KNOWN_TYPES: &[(&str, &str)] = &[
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("mjs", "application/javascript"),
    ("json", "application/json"),
    ("svg", "image/svg+xml"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
    ("eot", "application/vnd.ms-fontobject"),
];

/// Lowercased file extension of a URL path, query/fragment ignored.
fn extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Infer a content type from the URL's file extension alone.
pub fn from_extension(url: &str) -> Option<String> {
    let ext = extension(url)?;
    if let Some((_, mime)) = KNOWN_TYPES.iter().find(|(e, _)| *e == ext) {
        return Some((*mime).to_string());
    }
    mime_guess::from_ext(&ext).first().map(|m| m.to_string())
}

/// Resolve the effective content type: upstream header first, extension
/// inference second, octet-stream last.
pub fn resolve(upstream: Option<&str>, url: &str) -> String {
    let upstream = upstream.map(str::trim).filter(|s| !s.is_empty());
    match upstream {
        Some(ct) => correct(ct, url),
        None => from_extension(url).unwrap_or_else(|| "application/octet-stream".to_string()),
    }
}

/// Correct an upstream content type that is generic or known-wrong for the
/// requested extension.
pub fn correct(upstream: &str, url: &str) -> String {
    let declared = upstream
        .split(';')
        .next()
        .unwrap_or(upstream)
        .trim()
        .to_ascii_lowercase();

    let Some(ext) = extension(url) else {
        return upstream.to_string();
    };
    let Some((_, expected)) = KNOWN_TYPES.iter().find(|(e, _)| *e == ext) else {
        return upstream.to_string();
    };

    let generic = declared.is_empty()
        || declared == "application/octet-stream"
        || declared == "text/plain"
        || declared == "binary/octet-stream";
    // text/html for a .css or .js request is almost always an error page
    // from a misconfigured origin, but rewriting it to text/css would be
    // worse; only fix the generic and near-miss cases.
    let near_miss = (ext == "js" && declared == "text/javascript")
        || (ext == "json" && declared == "text/json");

    if generic || near_miss {
        (*expected).to_string()
    } else {
        upstream.to_string()
    }
}

/// True when the effective type is CSS, which the sub-resource endpoint
/// must recursively rewrite.
pub fn is_css(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .eq_ignore_ascii_case("text/css")
}

pub fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
}
