use url::Url;

/// Extensions that are never worth a fetch: static assets, archives and
/// binaries.
const BLOCKED_EXTENSIONS: [&str; 19] = [
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".mp4", ".mp3", ".pdf", ".zip", ".rar",
    ".exe", ".apk", ".iso", ".tar", ".gz", ".7z", ".css", ".js",
];

/// Resolve `raw` against `base` and canonicalize it: http(s) only, fragment
/// dropped, tracking parameters removed, duplicate slashes collapsed and the
/// trailing slash trimmed (except on the root path). Returns `None` for
/// anything that cannot become a crawlable URL.
pub fn normalize(base: &Url, raw: &str) -> Option<Url> {
    let mut url = base.join(raw.trim()).ok()?;

    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        url.set_query(Some(&query));
    }

    let path = url.path().to_string();
    let mut collapsed = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        collapsed.push(ch);
    }
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }
    if collapsed.is_empty() {
        collapsed.push('/');
    }
    url.set_path(&collapsed);

    Some(url)
}

/// Session and campaign parameters that only create duplicate URLs.
fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("utm_")
        || matches!(lower.as_str(), "sessionid" | "fbclid" | "ref" | "gclid")
}

/// Lowercased host without port, or `""` for host-less URLs.
pub fn get_domain(url: &Url) -> &str {
    url.host_str().unwrap_or("")
}

/// Whether a normalized URL should enter the frontier for `base_domain`.
/// Subdomains count as off-domain.
pub fn is_valid_link(base_domain: &str, url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }

    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    if has_blocked_extension(&path_and_query) {
        return false;
    }

    !base_domain.is_empty() && get_domain(url) == base_domain
}

/// True when a blocked extension appears at the end of the path-with-query
/// or immediately before a `?`, `#` or `&`.
fn has_blocked_extension(path_and_query: &str) -> bool {
    let lower = path_and_query.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    BLOCKED_EXTENSIONS.iter().any(|ext| {
        let mut from = 0;
        while let Some(found) = lower[from..].find(ext) {
            let end = from + found + ext.len();
            if end == lower.len() || matches!(bytes[end], b'?' | b'#' | b'&') {
                return true;
            }
            from += found + 1;
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    #[test]
    fn normalize_resolves_relative_links() {
        let url = normalize(&base(), "/articles/intro").unwrap();
        assert_eq!(url.as_str(), "https://example.com/articles/intro");
    }

    #[test]
    fn normalize_strips_tracking_fragment_and_trailing_slash() {
        let base = Url::parse("https://Example.com/").unwrap();
        let url = normalize(&base, "https://Sub.Example.com/path/?utm_source=x#frag").unwrap();
        assert_eq!(url.as_str(), "https://sub.example.com/path");
    }

    #[test]
    fn normalize_keeps_non_tracking_params() {
        let url = normalize(&base(), "/search?q=rust&utm_campaign=spring&page=2").unwrap();
        assert_eq!(url.as_str(), "https://example.com/search?q=rust&page=2");
    }

    #[test]
    fn normalize_collapses_duplicate_slashes() {
        let url = normalize(&base(), "/a//b///c").unwrap();
        assert_eq!(url.path(), "/a/b/c");
    }

    #[test]
    fn normalize_preserves_root_slash() {
        let url = normalize(&base(), "https://example.com/").unwrap();
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn tracking_params_match_case_insensitively_and_exactly() {
        let url = normalize(&base(), "/p?UTM_SOURCE=mail&Ref=sidebar&q=1").unwrap();
        assert_eq!(url.as_str(), "https://example.com/p?q=1");

        // "refresh" is not "ref"
        let url = normalize(&base(), "/p?refresh=1").unwrap();
        assert_eq!(url.as_str(), "https://example.com/p?refresh=1");
    }

    #[test]
    fn default_port_is_dropped_but_custom_ports_survive() {
        let url = normalize(&base(), "https://example.com:443/a").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a");

        let url = normalize(&base(), "https://example.com:8080/a/").unwrap();
        assert_eq!(url.as_str(), "https://example.com:8080/a");
    }

    #[test]
    fn normalize_rejects_non_http_schemes() {
        assert!(normalize(&base(), "javascript:void(0)").is_none());
        assert!(normalize(&base(), "mailto:someone@example.com").is_none());
        assert!(normalize(&base(), "ftp://example.com/file").is_none());
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "https://Sub.Example.com/path/?utm_source=x&q=1#frag",
            "/a//b/",
            "https://example.com/search?q=a+b&ref=x",
            "https://example.com/",
        ] {
            let once = normalize(&base(), raw).unwrap();
            let twice = normalize(&once, once.as_str()).unwrap();
            assert_eq!(once, twice, "normalize not idempotent for {raw}");
        }
    }

    #[test]
    fn valid_link_accepts_internal_html_pages() {
        let url = Url::parse("https://example.com/articles/intro").unwrap();
        assert!(is_valid_link("example.com", &url));
    }

    #[test]
    fn valid_link_rejects_assets_and_external_domains() {
        let asset = Url::parse("https://example.com/image.jpg").unwrap();
        let asset_with_query = Url::parse("https://example.com/image.png?v=2").unwrap();
        let queried_asset = Url::parse("https://example.com/dl?file=a.zip&x=1").unwrap();
        let external = Url::parse("https://external.com/page").unwrap();
        let subdomain = Url::parse("https://blog.example.com/page").unwrap();

        assert!(!is_valid_link("example.com", &asset));
        assert!(!is_valid_link("example.com", &asset_with_query));
        assert!(!is_valid_link("example.com", &queried_asset));
        assert!(!is_valid_link("example.com", &external));
        assert!(!is_valid_link("example.com", &subdomain));
    }

    #[test]
    fn valid_link_does_not_block_extension_in_the_middle_of_a_word() {
        let url = Url::parse("https://example.com/jsonly/page").unwrap();
        assert!(is_valid_link("example.com", &url));
    }

    #[test]
    fn get_domain_lowercases_and_drops_port() {
        let url = Url::parse("https://Example.COM:8443/x").unwrap();
        assert_eq!(get_domain(&url), "example.com");
    }
}
