use once_cell::sync::Lazy;
use regex::Regex;

/// Title substring of the Cloudflare interstitial page.
pub const CF_TITLE_MARKER: &str = "Just a moment";
/// Body substring of the older Cloudflare interstitial variant.
pub const CF_BODY_MARKER: &str = "Checking your browser";

/// Cookie names issued by the Aliyun WAF layer.
pub const WAF_COOKIE_NAMES: &[&str] = &["acw_tc", "cdn_sec_tc", "acw_sc__v2"];

/// Cookie names issued by Cloudflare. Only `cf_clearance` proves the
/// challenge was actually passed; the rest ride along.
pub const CF_COOKIE_NAMES: &[&str] = &["cf_clearance", "__cf_bm", "cf_chl_2", "cf_chl_prog"];

static TRACE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)TraceID:\s*([a-f0-9]+)").expect("failed to compile trace id regex")
});

/// Returns true when the page title/content carries the Cloudflare
/// interstitial signature.
pub fn is_cloudflare_challenge(title: &str, content: &str) -> bool {
    title.contains(CF_TITLE_MARKER) || content.contains(CF_BODY_MARKER)
}

/// Extracts the regional-CAPTCHA verification trace id from the text of
/// the `#traceid` element, if present.
pub fn extract_trace_id(text: &str) -> Option<String> {
    TRACE_ID_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Matches a URL against a wildcard pattern where `**` stands for any
/// sequence of characters. Patterns look like
/// `**https://example.com/oauth/**` or `**https://example.com/oauth-redirect.html**`.
pub fn url_matches_pattern(url: &str, pattern: &str) -> bool {
    let mut regex_src = String::with_capacity(pattern.len() + 8);
    regex_src.push('^');
    let mut rest = pattern;
    while let Some(idx) = rest.find("**") {
        regex_src.push_str(&regex::escape(&rest[..idx]));
        regex_src.push_str(".*");
        rest = &rest[idx + 2..];
    }
    regex_src.push_str(&regex::escape(rest));
    regex_src.push('$');
    match Regex::new(&regex_src) {
        Ok(re) => re.is_match(url),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cloudflare_by_title_or_body() {
        assert!(is_cloudflare_challenge("Just a moment...", ""));
        assert!(is_cloudflare_challenge("", "<p>Checking your browser before accessing</p>"));
        assert!(!is_cloudflare_challenge("Login", "<html>ok</html>"));
    }

    #[test]
    fn extracts_trace_id_case_insensitively() {
        assert_eq!(
            extract_trace_id("TraceID: 0a1b2c3d4e"),
            Some("0a1b2c3d4e".to_string())
        );
        assert_eq!(extract_trace_id("traceid: ff00"), Some("ff00".to_string()));
        assert_eq!(extract_trace_id("no marker here"), None);
    }

    #[test]
    fn wildcard_pattern_matches_callback_urls() {
        assert!(url_matches_pattern(
            "https://example.com/oauth/github?code=abc&state=xyz",
            "**https://example.com/oauth/**"
        ));
        assert!(url_matches_pattern(
            "https://example.com/oauth-redirect.html?code=abc",
            "**https://example.com/oauth-redirect.html**"
        ));
        assert!(!url_matches_pattern(
            "https://evil.com/oauth/github",
            "**https://example.com/oauth/**"
        ));
    }
}
