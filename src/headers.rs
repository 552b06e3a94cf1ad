use std::collections::HashMap;

use log::info;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;

/// Client-Hint header set captured from a Chromium-family browser.
/// Firefox never sends these, so a Firefox capture carries `None` and the
/// direct-HTTP side must not fabricate them: Cloudflare rejects a
/// `sec-ch-ua` set paired with a non-Chromium User-Agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHints {
    pub ua: String,
    pub mobile: String,
    pub platform: String,
    pub platform_version: String,
    pub arch: String,
    pub bitness: String,
    pub full_version: String,
    pub full_version_list: String,
    pub model: String,
}

/// Browser identity captured during a bypass or OAuth flow. Once present
/// in an account run, the same User-Agent (and hints, if any) must be
/// reused verbatim for every subsequent request of that run.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintHeaders {
    pub user_agent: String,
    pub client_hints: Option<ClientHints>,
}

impl FingerprintHeaders {
    /// Parses the JSON map produced by [`CAPTURE_FINGERPRINT_JS`].
    pub fn from_capture(map: &HashMap<String, String>) -> Option<Self> {
        let user_agent = map.get("User-Agent")?.clone();
        let client_hints = map.get("sec-ch-ua").map(|ua| ClientHints {
            ua: ua.clone(),
            mobile: map.get("sec-ch-ua-mobile").cloned().unwrap_or_else(|| "?0".into()),
            platform: map.get("sec-ch-ua-platform").cloned().unwrap_or_default(),
            platform_version: map
                .get("sec-ch-ua-platform-version")
                .cloned()
                .unwrap_or_default(),
            arch: map.get("sec-ch-ua-arch").cloned().unwrap_or_default(),
            bitness: map.get("sec-ch-ua-bitness").cloned().unwrap_or_default(),
            full_version: map.get("sec-ch-ua-full-version").cloned().unwrap_or_default(),
            full_version_list: map
                .get("sec-ch-ua-full-version-list")
                .cloned()
                .unwrap_or_default(),
            model: map.get("sec-ch-ua-model").cloned().unwrap_or_else(|| "\"\"".into()),
        });
        Some(FingerprintHeaders { user_agent, client_hints })
    }
}

/// Page script that reads the effective browser identity. Platform data is
/// derived from the User-Agent rather than `navigator.platform`, which can
/// disagree with the UA on CI runners and trips bot detection.
pub const CAPTURE_FINGERPRINT_JS: &str = r#"() => {
    const ua = navigator.userAgent;
    const hints = { 'User-Agent': ua };

    if (ua.includes('Firefox')) {
        return hints;
    }

    const chromeMatch = ua.match(/Chrome\/([\d.]+)/);
    if (!chromeMatch) {
        return hints;
    }

    const chromeVersion = chromeMatch[1];
    const chromeMajor = chromeVersion.split('.')[0];

    let platformName = 'Unknown';
    let platformVersion = '10.0.0';
    let arch = 'x86';
    let isMobile = false;

    if (ua.includes('Windows NT')) {
        platformName = 'Windows';
        platformVersion = '10.0.0';
    } else if (ua.includes('Macintosh') || ua.includes('Mac OS X')) {
        platformName = 'macOS';
        platformVersion = '15.0.0';
        arch = 'arm';
    } else if (ua.includes('Linux') && !ua.includes('Android')) {
        platformName = 'Linux';
        platformVersion = '6.5.0';
    } else if (ua.includes('Android')) {
        platformName = 'Android';
        platformVersion = '14.0.0';
        isMobile = true;
    }

    hints['sec-ch-ua'] = `"Google Chrome";v="${chromeMajor}", "Chromium";v="${chromeMajor}", "Not A(Brand";v="24"`;
    hints['sec-ch-ua-mobile'] = isMobile ? '?1' : '?0';
    hints['sec-ch-ua-platform'] = `"${platformName}"`;
    hints['sec-ch-ua-platform-version'] = `"${platformVersion}"`;
    hints['sec-ch-ua-arch'] = `"${arch}"`;
    hints['sec-ch-ua-bitness'] = '"64"';
    hints['sec-ch-ua-full-version'] = `"${chromeVersion}"`;
    hints['sec-ch-ua-full-version-list'] = `"Google Chrome";v="${chromeVersion}", "Chromium";v="${chromeVersion}", "Not A(Brand";v="24.0.0.0"`;
    hints['sec-ch-ua-model'] = '""';

    return hints;
}"#;

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:134.0) Gecko/20100101 Firefox/134.0",
    ]
});

/// Picks one realistic desktop User-Agent. Called at most once per account
/// run; the result is reused for every request of that run.
pub fn random_user_agent() -> String {
    let mut rng = rand::thread_rng();
    USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(USER_AGENTS[0])
        .to_string()
}

/// Builds the shared header set for one account run. `Referer`/`Origin`
/// are not set here; each call site adds them for the actual target.
pub fn build_common_headers(fingerprint: Option<&FingerprintHeaders>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(
        "Accept".into(),
        "application/json, text/plain, */*".into(),
    );
    headers.insert(
        "Accept-Language".into(),
        "en,en-US;q=0.9,zh;q=0.8,en-CN;q=0.7,zh-CN;q=0.6".into(),
    );
    headers.insert("Cache-Control".into(), "no-store".into());
    headers.insert("Pragma".into(), "no-cache".into());
    headers.insert("sec-fetch-dest".into(), "empty".into());
    headers.insert("sec-fetch-mode".into(), "cors".into());
    headers.insert("sec-fetch-site".into(), "same-origin".into());

    match fingerprint {
        Some(fp) => {
            headers.insert("User-Agent".into(), fp.user_agent.clone());
            if let Some(ch) = &fp.client_hints {
                headers.insert("sec-ch-ua".into(), ch.ua.clone());
                headers.insert("sec-ch-ua-mobile".into(), ch.mobile.clone());
                headers.insert("sec-ch-ua-platform".into(), ch.platform.clone());
                headers.insert(
                    "sec-ch-ua-platform-version".into(),
                    ch.platform_version.clone(),
                );
                headers.insert("sec-ch-ua-arch".into(), ch.arch.clone());
                headers.insert("sec-ch-ua-bitness".into(), ch.bitness.clone());
                headers.insert("sec-ch-ua-full-version".into(), ch.full_version.clone());
                headers.insert(
                    "sec-ch-ua-full-version-list".into(),
                    ch.full_version_list.clone(),
                );
                headers.insert("sec-ch-ua-model".into(), ch.model.clone());
            }
        }
        None => {
            headers.insert("User-Agent".into(), random_user_agent());
        }
    }
    headers
}

pub fn log_fingerprint(account_name: &str, fingerprint: &FingerprintHeaders) {
    let ua = &fingerprint.user_agent;
    let shown = if ua.len() > 100 { &ua[..100] } else { ua };
    info!("{}: captured browser fingerprint, User-Agent: {}", account_name, shown);
    if fingerprint.client_hints.is_some() {
        info!("{}: fingerprint includes Client-Hint headers", account_name);
    }
}

static FIREFOX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Firefox/(\d+)").unwrap());
static CHROME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Chrome/(\d+)").unwrap());
static SAFARI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Version/(\d+)\.(\d+)").unwrap());
static EDGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Edg/(\d+)").unwrap());

/// TLS/HTTP fingerprint preset of the HTTP client layer. A captured
/// User-Agent is mapped to the closest supported profile so the direct
/// calls present the same browser identity the bypass cookie was earned
/// under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpersonationProfile {
    Firefox133,
    Firefox135,
    Firefox144,
    Chrome99,
    Chrome100,
    Chrome101,
    Chrome104,
    Chrome107,
    Chrome110,
    Chrome116,
    Chrome119,
    Chrome120,
    Chrome123,
    Chrome124,
    Chrome131,
    Chrome133,
    Chrome136,
    Chrome142,
    Safari153,
    Safari155,
    Safari170,
    Safari180,
    Safari184,
    Safari260,
    SafariIos172,
    SafariIos180,
    SafariIos184,
    Edge99,
    Edge101,
}

impl ImpersonationProfile {
    /// Maps a User-Agent onto the closest supported profile. Defaults to
    /// Firefox 135, matching the bypass browser's own default identity.
    pub fn from_user_agent(user_agent: &str) -> Self {
        use ImpersonationProfile::*;

        if let Some(caps) = FIREFOX_RE.captures(user_agent) {
            let version: u32 = caps[1].parse().unwrap_or(0);
            return if version >= 144 {
                Firefox144
            } else if version >= 135 {
                Firefox135
            } else {
                Firefox133
            };
        }

        if let Some(caps) = CHROME_RE.captures(user_agent) {
            let version: u32 = caps[1].parse().unwrap_or(0);
            // Edge carries a Chrome token too; check Edg/ first.
            if let Some(edge) = EDGE_RE.captures(user_agent) {
                let edge_version: u32 = edge[1].parse().unwrap_or(0);
                return if edge_version >= 101 { Edge101 } else { Edge99 };
            }
            return match version {
                142.. => Chrome142,
                136..=141 => Chrome136,
                133..=135 => Chrome133,
                131..=132 => Chrome131,
                124..=130 => Chrome124,
                123 => Chrome123,
                120..=122 => Chrome120,
                119 => Chrome119,
                116..=118 => Chrome116,
                110..=115 => Chrome110,
                107..=109 => Chrome107,
                104..=106 => Chrome104,
                101..=103 => Chrome101,
                100 => Chrome100,
                _ => Chrome99,
            };
        }

        if user_agent.contains("Safari") && !user_agent.contains("Chrome") {
            if let Some(caps) = SAFARI_RE.captures(user_agent) {
                let major: u32 = caps[1].parse().unwrap_or(0);
                let minor: u32 = caps[2].parse().unwrap_or(0);
                let version = major * 10 + minor;
                if user_agent.contains("iPhone") || user_agent.contains("iPad") {
                    return if version >= 184 {
                        SafariIos184
                    } else if version >= 180 {
                        SafariIos180
                    } else {
                        SafariIos172
                    };
                }
                return if version >= 260 {
                    Safari260
                } else if version >= 184 {
                    Safari184
                } else if version >= 180 {
                    Safari180
                } else if version >= 170 {
                    Safari170
                } else if version >= 155 {
                    Safari155
                } else {
                    Safari153
                };
            }
        }

        Firefox135
    }

    pub fn as_str(&self) -> &'static str {
        use ImpersonationProfile::*;
        match self {
            Firefox133 => "firefox133",
            Firefox135 => "firefox135",
            Firefox144 => "firefox144",
            Chrome99 => "chrome99",
            Chrome100 => "chrome100",
            Chrome101 => "chrome101",
            Chrome104 => "chrome104",
            Chrome107 => "chrome107",
            Chrome110 => "chrome110",
            Chrome116 => "chrome116",
            Chrome119 => "chrome119",
            Chrome120 => "chrome120",
            Chrome123 => "chrome123",
            Chrome124 => "chrome124",
            Chrome131 => "chrome131",
            Chrome133 => "chrome133",
            Chrome136 => "chrome136",
            Chrome142 => "chrome142",
            Safari153 => "safari153",
            Safari155 => "safari155",
            Safari170 => "safari170",
            Safari180 => "safari180",
            Safari184 => "safari184",
            Safari260 => "safari260",
            SafariIos172 => "safari172_ios",
            SafariIos180 => "safari180_ios",
            SafariIos184 => "safari184_ios",
            Edge99 => "edge99",
            Edge101 => "edge101",
        }
    }
}

impl Default for ImpersonationProfile {
    fn default() -> Self {
        ImpersonationProfile::Firefox135
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_user_agents_to_closest_profile() {
        assert_eq!(
            ImpersonationProfile::from_user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:134.0) Gecko/20100101 Firefox/134.0"
            ),
            ImpersonationProfile::Firefox133
        );
        assert_eq!(
            ImpersonationProfile::from_user_agent(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/131.0.0.0 Safari/537.36"
            ),
            ImpersonationProfile::Chrome131
        );
        assert_eq!(
            ImpersonationProfile::from_user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91"
            ),
            ImpersonationProfile::Edge101
        );
        assert_eq!(
            ImpersonationProfile::from_user_agent("curl/8.0"),
            ImpersonationProfile::Firefox135
        );
    }

    #[test]
    fn firefox_capture_has_no_client_hints() {
        let mut capture = HashMap::new();
        capture.insert(
            "User-Agent".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:135.0) Gecko/20100101 Firefox/135.0"
                .to_string(),
        );
        let fp = FingerprintHeaders::from_capture(&capture).unwrap();
        assert!(fp.client_hints.is_none());

        let headers = build_common_headers(Some(&fp));
        assert_eq!(headers.get("User-Agent"), Some(&fp.user_agent));
        assert!(!headers.contains_key("sec-ch-ua"));
    }

    #[test]
    fn chromium_capture_keeps_client_hints_together() {
        let mut capture = HashMap::new();
        capture.insert(
            "User-Agent".to_string(),
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
        );
        capture.insert("sec-ch-ua".to_string(), "\"Google Chrome\";v=\"131\"".to_string());
        capture.insert("sec-ch-ua-platform".to_string(), "\"Linux\"".to_string());
        let fp = FingerprintHeaders::from_capture(&capture).unwrap();
        let hints = fp.client_hints.as_ref().unwrap();
        assert_eq!(hints.platform, "\"Linux\"");

        // The shared header set must carry the captured UA, not a fresh
        // random one, whenever hints are present.
        let headers = build_common_headers(Some(&fp));
        assert_eq!(headers.get("User-Agent"), Some(&fp.user_agent));
        assert_eq!(headers.get("sec-ch-ua"), Some(&hints.ua));
    }

    #[test]
    fn random_user_agent_is_stable_within_a_run_when_reused() {
        let headers = build_common_headers(None);
        let ua = headers.get("User-Agent").cloned().unwrap();
        // Re-deriving headers from a fingerprint built around the chosen
        // UA keeps it pinned.
        let fp = FingerprintHeaders { user_agent: ua.clone(), client_hints: None };
        let again = build_common_headers(Some(&fp));
        assert_eq!(again.get("User-Agent"), Some(&ua));
    }
}
