use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, GetCookiesParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use url::Url;

use crate::challenge::url_matches_pattern;
use crate::config::ProxyConfig;
use crate::headers::{FingerprintHeaders, CAPTURE_FINGERPRINT_JS};
use crate::utils::{sanitize_name, save_text_artifact, screenshot_path};

#[derive(Debug)]
pub enum BrowserError {
    Cdp(chromiumoxide::error::CdpError),
    Launch(String),
    Cookie(String),
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for BrowserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserError::Cdp(e) => write!(f, "browser protocol error: {}", e),
            BrowserError::Launch(e) => write!(f, "browser launch error: {}", e),
            BrowserError::Cookie(e) => write!(f, "cookie error: {}", e),
            BrowserError::Io(e) => write!(f, "browser io error: {}", e),
            BrowserError::Serde(e) => write!(f, "storage state error: {}", e),
        }
    }
}

impl std::error::Error for BrowserError {}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(err: chromiumoxide::error::CdpError) -> BrowserError {
        BrowserError::Cdp(err)
    }
}

impl From<std::io::Error> for BrowserError {
    fn from(err: std::io::Error) -> BrowserError {
        BrowserError::Io(err)
    }
}

impl From<serde_json::Error> for BrowserError {
    fn from(err: serde_json::Error) -> BrowserError {
        BrowserError::Serde(err)
    }
}

/// Minimal cookie view used for origin filtering and bypass harvesting.
#[derive(Debug, Clone)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Serialized browser context snapshot: cookies plus per-origin
/// localStorage. Written after interactive logins, read before the next
/// sign-in attempt for the same identity.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<StoredOrigin>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredOrigin {
    pub origin: String,
    pub local_storage: Vec<StoredKv>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredKv {
    pub name: String,
    pub value: String,
}

const CHROME_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-background-networking",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-sync",
    "--no-first-run",
    "--lang=en-US",
];

/// One disposable browser: isolated temp profile, its own process, both
/// removed when the session is shut down. Never reused across accounts.
pub struct DriverSession {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    _profile_dir: TempDir,
}

impl DriverSession {
    /// Launches a browser against a fresh temporary profile directory.
    /// The directory is deleted when the session is dropped.
    pub async fn launch(
        account_name: &str,
        purpose: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<DriverSession, BrowserError> {
        let profile_dir = tempfile::Builder::new()
            .prefix(&format!("checkin_{}_{}_", sanitize_name(account_name), purpose))
            .tempdir()?;
        info!(
            "{}: launching browser for {} (profile: {}, proxy: {})",
            account_name,
            purpose,
            profile_dir.path().display(),
            proxy.is_some()
        );

        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile_dir.path())
            .window_size(1280, 900);
        for arg in CHROME_ARGS {
            builder = builder.arg(*arg);
        }
        if let Some(proxy_config) = proxy {
            // Chromium takes the proxy endpoint only; embedded basic-auth
            // credentials are not supported on the command line.
            builder = builder.arg(format!("--proxy-server={}", proxy_config.server));
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(DriverSession { browser, handler_task, _profile_dir: profile_dir })
    }

    pub async fn new_page(&self) -> Result<Page, BrowserError> {
        Ok(self.browser.new_page("about:blank").await?)
    }

    /// All cookies of the browser context, across every visited origin.
    pub async fn cookies(&self, page: &Page) -> Result<Vec<CookieRecord>, BrowserError> {
        let response = page.execute(GetCookiesParams::default()).await?;
        Ok(response
            .result
            .cookies
            .iter()
            .map(|c| CookieRecord {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
            })
            .collect())
    }

    pub async fn set_cookies(
        &self,
        page: &Page,
        cookies: Vec<CookieParam>,
    ) -> Result<(), BrowserError> {
        if cookies.is_empty() {
            return Ok(());
        }
        page.set_cookies(cookies).await?;
        Ok(())
    }

    /// Persists cookies and the current origin's localStorage to `path`.
    pub async fn save_storage_state(
        &self,
        page: &Page,
        path: &Path,
    ) -> Result<(), BrowserError> {
        let response = page.execute(GetCookiesParams::default()).await?;
        let cookies = response
            .result
            .cookies
            .iter()
            .map(|c| StoredCookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: c.path.clone(),
                expires: Some(c.expires),
                http_only: c.http_only,
                secure: c.secure,
            })
            .collect();

        let origins = match page
            .evaluate_function(
                r#"() => {
                    const entries = [];
                    for (let i = 0; i < localStorage.length; i++) {
                        const name = localStorage.key(i);
                        entries.push({ name, value: localStorage.getItem(name) });
                    }
                    return { origin: location.origin, local_storage: entries };
                }"#,
            )
            .await
            .ok()
            .and_then(|r| r.into_value::<StoredOrigin>().ok())
        {
            Some(origin_state) if !origin_state.origin.is_empty() => vec![origin_state],
            _ => Vec::new(),
        };

        let state = StorageState { cookies, origins };
        tokio::fs::write(path, serde_json::to_vec_pretty(&state)?).await?;
        debug!("storage state saved to {}", path.display());
        Ok(())
    }

    /// Restores cookies from a storage-state file. Returns the parsed
    /// state so callers can re-apply localStorage after navigating to a
    /// matching origin. A missing or unreadable file is not an error; a
    /// stale state simply causes a fresh interactive login.
    pub async fn restore_storage_state(
        &self,
        page: &Page,
        path: &Path,
    ) -> Result<Option<StorageState>, BrowserError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        let state: StorageState = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("ignoring unreadable storage state {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        let mut params = Vec::new();
        for cookie in &state.cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone())
                .secure(cookie.secure)
                .http_only(cookie.http_only);
            if let Some(expires) = cookie.expires {
                if expires > 0.0 {
                    builder = builder.expires(TimeSinceEpoch::new(expires));
                }
            }
            params.push(builder.build().map_err(BrowserError::Cookie)?);
        }
        self.set_cookies(page, params).await?;
        Ok(Some(state))
    }

    /// Writes the stored localStorage entries matching the page's current
    /// origin back into the page.
    pub async fn apply_local_storage(
        &self,
        page: &Page,
        state: &StorageState,
    ) -> Result<(), BrowserError> {
        let current_origin = match self.page_url(page).await? {
            Some(url) => match Url::parse(&url) {
                Ok(parsed) => parsed.origin().unicode_serialization(),
                Err(_) => return Ok(()),
            },
            None => return Ok(()),
        };
        for origin_state in &state.origins {
            if origin_state.origin != current_origin {
                continue;
            }
            for kv in &origin_state.local_storage {
                let js = format!(
                    "localStorage.setItem({}, {})",
                    serde_json::to_string(&kv.name)?,
                    serde_json::to_string(&kv.value)?
                );
                let _ = page.evaluate(js).await;
            }
        }
        Ok(())
    }

    /// Navigates and waits for the load to settle.
    pub async fn goto(&self, page: &Page, url: &str) -> Result<(), BrowserError> {
        page.goto(url).await?;
        let _ = page.wait_for_navigation().await;
        Ok(())
    }

    pub async fn page_title(&self, page: &Page) -> Result<String, BrowserError> {
        Ok(page.get_title().await?.unwrap_or_default())
    }

    pub async fn page_content(&self, page: &Page) -> Result<String, BrowserError> {
        Ok(page.content().await?)
    }

    pub async fn page_url(&self, page: &Page) -> Result<Option<String>, BrowserError> {
        Ok(page.url().await?)
    }

    /// Evaluates an arrow-function page script and deserializes its
    /// return value.
    pub async fn evaluate<T: serde::de::DeserializeOwned>(
        &self,
        page: &Page,
        script: &str,
    ) -> Result<T, BrowserError> {
        let result = page.evaluate_function(script).await?;
        Ok(result.into_value::<T>()?)
    }

    /// Polls the page URL until it matches the wildcard pattern or the
    /// timeout elapses.
    pub async fn wait_for_url(
        &self,
        page: &Page,
        pattern: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError> {
        let start = Instant::now();
        loop {
            if let Some(url) = self.page_url(page).await? {
                if url_matches_pattern(&url, pattern) {
                    return Ok(true);
                }
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn element_exists(&self, page: &Page, selector: &str) -> bool {
        page.find_element(selector).await.is_ok()
    }

    pub async fn fill(&self, page: &Page, selector: &str, text: &str) -> Result<(), BrowserError> {
        let element = page.find_element(selector).await?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }

    pub async fn click(&self, page: &Page, selector: &str) -> Result<(), BrowserError> {
        let element = page.find_element(selector).await?;
        element.click().await?;
        Ok(())
    }

    /// Reads an element's bounding box via the page's own layout, which
    /// survives iframes and shadow roots better than protocol box models.
    pub async fn bounding_box(
        &self,
        page: &Page,
        selector: &str,
    ) -> Result<Option<BoundingBox>, BrowserError> {
        let js = format!(
            r#"() => {{
                const el = document.querySelector({});
                if (!el) return null;
                const rect = el.getBoundingClientRect();
                return {{ x: rect.x, y: rect.y, width: rect.width, height: rect.height }};
            }}"#,
            serde_json::to_string(selector)?
        );
        let result = page.evaluate_function(js).await?;
        Ok(result.into_value::<Option<BoundingBox>>()?)
    }

    /// Clicks at a point in page coordinates via raw input events, which
    /// also lands inside cross-origin iframes.
    pub async fn click_at(&self, page: &Page, x: f64, y: f64) -> Result<(), BrowserError> {
        let press = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Launch)?;
        page.execute(press).await?;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let release = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Launch)?;
        page.execute(release).await?;
        Ok(())
    }

    /// Performs a press-move-release drag between two points.
    pub async fn drag(
        &self,
        page: &Page,
        from: (f64, f64),
        to: (f64, f64),
        steps: u32,
    ) -> Result<(), BrowserError> {
        let press = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(from.0)
            .y(from.1)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Launch)?;
        page.execute(press).await?;

        let steps = steps.max(1);
        for i in 1..=steps {
            let t = f64::from(i) / f64::from(steps);
            let step = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(from.0 + (to.0 - from.0) * t)
                .y(from.1 + (to.1 - from.1) * t)
                .button(MouseButton::Left)
                .build()
                .map_err(BrowserError::Launch)?;
            page.execute(step).await?;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let release = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(to.0)
            .y(to.1)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Launch)?;
        page.execute(release).await?;
        Ok(())
    }

    /// Reads the effective browser identity for later direct-HTTP reuse.
    pub async fn capture_fingerprint(&self, page: &Page) -> Option<FingerprintHeaders> {
        let captured: HashMap<String, String> =
            self.evaluate(page, CAPTURE_FINGERPRINT_JS).await.ok()?;
        FingerprintHeaders::from_capture(&captured)
    }

    /// Full-page screenshot into `screenshots/`; failures only logged.
    pub async fn take_screenshot(&self, page: &Page, reason: &str, account_name: &str) {
        let Some(path) = screenshot_path(account_name, reason) else {
            return;
        };
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        match page.save_screenshot(params, &path).await {
            Ok(_) => info!("{}: screenshot saved to {}", account_name, path.display()),
            Err(e) => warn!("{}: failed to take screenshot: {}", account_name, e),
        }
    }

    /// Saves the page HTML under `logs/` for post-hoc diagnosis.
    pub async fn save_page_html(&self, page: &Page, reason: &str, account_name: &str) {
        if let Ok(content) = self.page_content(page).await {
            save_text_artifact(account_name, reason, "html", &content);
        }
    }

    /// Closes the browser process; the temp profile is removed on drop.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("browser close reported: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

/// Keeps the cookies whose domain equals, is a parent of, or is a
/// subdomain of `origin`'s host; everything else (identity-provider
/// cookies and the like) is dropped.
pub fn filter_cookies(cookies: &[CookieRecord], origin: &str) -> HashMap<String, String> {
    let host = Url::parse(origin)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default();
    let host = host.trim_start_matches('.');

    let mut matched = Vec::new();
    let mut dropped = Vec::new();
    let mut result = HashMap::new();

    for cookie in cookies {
        let cookie_domain = cookie.domain.trim_start_matches('.');
        let related = host == cookie_domain
            || host.ends_with(&format!(".{}", cookie_domain))
            || cookie_domain.ends_with(&format!(".{}", host));
        if related {
            result.insert(cookie.name.clone(), cookie.value.clone());
            matched.push(format!("{}({})", cookie.name, cookie.domain));
        } else {
            dropped.push(format!("{}({})", cookie.name, cookie.domain));
        }
    }

    debug!(
        "cookie filtering for {}: {} matched {:?}, {} dropped {:?}",
        host,
        matched.len(),
        matched,
        dropped.len(),
        dropped
    );
    result
}

/// Element bounding box in page coordinates.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, domain: &str) -> CookieRecord {
        CookieRecord {
            name: name.to_string(),
            value: "v".to_string(),
            domain: domain.to_string(),
        }
    }

    #[test]
    fn filter_keeps_exact_parent_and_subdomain_matches() {
        let cookies = vec![
            record("session", "api.example.com"),
            record("shared", ".example.com"),
            record("deep", "internal.api.example.com"),
            record("github", "github.com"),
            record("idp", ".linux.do"),
        ];
        let filtered = filter_cookies(&cookies, "https://api.example.com");
        assert_eq!(filtered.len(), 3);
        assert!(filtered.contains_key("session"));
        assert!(filtered.contains_key("shared"));
        assert!(filtered.contains_key("deep"));
        assert!(!filtered.contains_key("github"));
        assert!(!filtered.contains_key("idp"));
    }

    #[test]
    fn filter_excludes_lookalike_domains() {
        let cookies = vec![record("evil", "notexample.com"), record("ok", "example.com")];
        let filtered = filter_cookies(&cookies, "https://example.com");
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("ok"));
    }

    #[test]
    fn storage_state_round_trips_through_json() {
        let state = StorageState {
            cookies: vec![StoredCookie {
                name: "user_session".to_string(),
                value: "abc".to_string(),
                domain: "github.com".to_string(),
                path: "/".to_string(),
                expires: Some(1760000000.0),
                http_only: true,
                secure: true,
            }],
            origins: vec![StoredOrigin {
                origin: "https://github.com".to_string(),
                local_storage: vec![StoredKv {
                    name: "color-mode".to_string(),
                    value: "dark".to_string(),
                }],
            }],
        };
        let bytes = serde_json::to_vec(&state).unwrap();
        let parsed: StorageState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.cookies.len(), 1);
        assert_eq!(parsed.cookies[0].name, "user_session");
        assert_eq!(parsed.origins[0].local_storage[0].value, "dark");
    }
}
