use std::collections::HashMap;
use std::time::Duration;

use chromiumoxide::page::Page;
use log::{info, warn};

use crate::browser::{BrowserError, DriverSession};
use crate::challenge::{
    extract_trace_id, is_cloudflare_challenge, CF_COOKIE_NAMES, WAF_COOKIE_NAMES,
};
use crate::config::{BypassMethod, ProviderProfile, ProxyConfig};
use crate::headers::FingerprintHeaders;

const PAGE_SETTLE: Duration = Duration::from_secs(3);
const CF_SETTLE: Duration = Duration::from_secs(5);
const CF_POST_SOLVE_WAIT: Duration = Duration::from_secs(10);
const CLEARANCE_MAX_WAIT: Duration = Duration::from_secs(60);
const CLEARANCE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SOLVE_ATTEMPTS: u32 = 5;
const SOLVE_ATTEMPT_DELAY: Duration = Duration::from_secs(3);
const SLIDER_WAIT: Duration = Duration::from_secs(60);
const SLIDER_SETTLE: Duration = Duration::from_secs(20);

const TRACE_ID_PROBE_JS: &str = r#"() => {
    const traceElement = document.getElementById('traceid');
    if (traceElement) {
        return traceElement.innerText || traceElement.textContent || '';
    }
    return '';
}"#;

/// Cookies and, for Cloudflare flows, the browser identity that earned
/// them. Consumed immediately by the session bootstrap; never persisted.
#[derive(Debug, Default, Clone)]
pub struct BypassCredential {
    pub cookies: HashMap<String, String>,
    pub fingerprint: Option<FingerprintHeaders>,
}

impl BypassCredential {
    pub fn empty() -> BypassCredential {
        BypassCredential::default()
    }
}

/// Runs the provider's configured bypass strategy. Every failure path
/// degrades to an empty credential; the account run continues either way.
pub async fn acquire(
    provider: &ProviderProfile,
    account_name: &str,
    proxy: Option<&ProxyConfig>,
) -> BypassCredential {
    match provider.bypass_method {
        None => {
            info!("{}: bypass not required, using user cookies directly", account_name);
            BypassCredential::empty()
        }
        Some(BypassMethod::WafCookies) => match acquire_waf_cookies(provider, account_name, proxy).await {
            Ok(Some(cookies)) => {
                info!("{}: WAF cookies obtained: {:?}", account_name, cookies.keys().collect::<Vec<_>>());
                BypassCredential { cookies, fingerprint: None }
            }
            Ok(None) => {
                warn!("{}: no WAF cookies obtained, continuing with empty cookies", account_name);
                BypassCredential::empty()
            }
            Err(e) => {
                warn!("{}: error getting WAF cookies: {}, continuing with empty cookies", account_name, e);
                BypassCredential::empty()
            }
        },
        Some(BypassMethod::CfClearance) => {
            match acquire_cf_clearance(&provider.login_url(), account_name, proxy).await {
                Ok((cookies, fingerprint)) => {
                    if let Some(cookies) = cookies {
                        info!("{}: Cloudflare cookies obtained", account_name);
                        BypassCredential { cookies, fingerprint }
                    } else {
                        warn!(
                            "{}: unable to get Cloudflare cookies, continuing with empty cookies",
                            account_name
                        );
                        BypassCredential { cookies: HashMap::new(), fingerprint }
                    }
                }
                Err(e) => {
                    warn!(
                        "{}: error getting cf_clearance: {}, continuing with empty cookies",
                        account_name, e
                    );
                    BypassCredential::empty()
                }
            }
        }
    }
}

/// Opens the login page in a throwaway profile and harvests the WAF
/// marker cookies it sets. Returns `None` when not a single marker cookie
/// appeared.
async fn acquire_waf_cookies(
    provider: &ProviderProfile,
    account_name: &str,
    proxy: Option<&ProxyConfig>,
) -> Result<Option<HashMap<String, String>>, BrowserError> {
    let driver = DriverSession::launch(account_name, "waf", proxy).await?;
    let result = async {
        let page = driver.new_page().await?;
        info!("{}: opening login page for WAF cookies", account_name);
        driver.goto(&page, &provider.login_url()).await?;
        tokio::time::sleep(PAGE_SETTLE).await;

        if provider.aliyun_captcha && solve_slider_captcha(&driver, &page, account_name).await {
            tokio::time::sleep(PAGE_SETTLE).await;
        }

        let cookies = driver.cookies(&page).await?;
        let mut waf_cookies = HashMap::new();
        for cookie in cookies {
            if WAF_COOKIE_NAMES.contains(&cookie.name.as_str()) {
                waf_cookies.insert(cookie.name, cookie.value);
            }
        }
        Ok(if waf_cookies.is_empty() { None } else { Some(waf_cookies) })
    }
    .await;
    driver.shutdown().await;
    result
}

/// Visits `url`, clears the Cloudflare interstitial if one shows up, and
/// returns the clearance cookies together with the captured fingerprint.
/// The fingerprint is captured on the happy path too: later direct calls
/// must present the identity this browser showed, challenge or not.
pub async fn acquire_cf_clearance(
    url: &str,
    account_name: &str,
    proxy: Option<&ProxyConfig>,
) -> Result<(Option<HashMap<String, String>>, Option<FingerprintHeaders>), BrowserError> {
    let driver = DriverSession::launch(account_name, "cf_clearance", proxy).await?;
    let result = async {
        let page = driver.new_page().await?;
        info!("{}: accessing {} to trigger Cloudflare challenge", account_name, url);
        driver.goto(&page, url).await?;
        tokio::time::sleep(CF_SETTLE).await;

        let title = driver.page_title(&page).await.unwrap_or_default();
        let content = driver.page_content(&page).await.unwrap_or_default();

        if is_cloudflare_challenge(&title, &content) {
            info!("{}: Cloudflare challenge detected, auto-solving", account_name);
            if solve_cloudflare_interstitial(&driver, &page, account_name).await {
                info!("{}: Cloudflare challenge auto-solved", account_name);
                tokio::time::sleep(CF_POST_SOLVE_WAIT).await;
            } else {
                warn!("{}: auto-solve failed, waiting for clearance cookie", account_name);
                wait_for_clearance(&driver, &page, account_name).await;
            }
        } else {
            info!("{}: no Cloudflare challenge detected", account_name);
            // Background validation may still be in flight.
            wait_for_clearance(&driver, &page, account_name).await;
        }

        let cookies = driver.cookies(&page).await?;
        let mut cf_cookies = HashMap::new();
        for cookie in cookies {
            if CF_COOKIE_NAMES.contains(&cookie.name.as_str()) {
                cf_cookies.insert(cookie.name, cookie.value);
            }
        }

        let fingerprint = driver.capture_fingerprint(&page).await;
        if let Some(fp) = &fingerprint {
            crate::headers::log_fingerprint(account_name, fp);
        }

        if !cf_cookies.contains_key("cf_clearance") {
            warn!("{}: cf_clearance cookie not obtained", account_name);
            return Ok((None, fingerprint));
        }
        Ok((Some(cf_cookies), fingerprint))
    }
    .await;
    driver.shutdown().await;
    result
}

/// Attempts the interstitial's interactive checkbox a few times. Returns
/// true once the challenge signature is gone.
pub async fn solve_cloudflare_interstitial(
    driver: &DriverSession,
    page: &Page,
    account_name: &str,
) -> bool {
    for attempt in 1..=SOLVE_ATTEMPTS {
        let widget = driver
            .bounding_box(page, "iframe")
            .await
            .ok()
            .flatten();
        if let Some(widget) = widget {
            // The checkbox sits at the left edge of the Turnstile widget.
            let x = widget.x + 30.0;
            let y = widget.y + widget.height / 2.0;
            if let Err(e) = driver.click_at(page, x, y).await {
                warn!("{}: challenge click failed: {}", account_name, e);
            }
        }
        tokio::time::sleep(SOLVE_ATTEMPT_DELAY).await;

        let title = driver.page_title(page).await.unwrap_or_default();
        let content = driver.page_content(page).await.unwrap_or_default();
        if !is_cloudflare_challenge(&title, &content) {
            return true;
        }
        info!(
            "{}: challenge still present after attempt {}/{}",
            account_name, attempt, SOLVE_ATTEMPTS
        );
    }
    false
}

/// Polls for the `cf_clearance` cookie. Absence of the challenge
/// signature counts as "still in progress" until the cookie shows up or
/// the deadline passes.
async fn wait_for_clearance(driver: &DriverSession, page: &Page, account_name: &str) -> bool {
    let mut elapsed = Duration::ZERO;
    while elapsed < CLEARANCE_MAX_WAIT {
        if let Ok(cookies) = driver.cookies(page).await {
            if cookies.iter().any(|c| c.name == "cf_clearance") {
                info!("{}: cf_clearance cookie obtained", account_name);
                return true;
            }
        }
        let title = driver.page_title(page).await.unwrap_or_default();
        let content = driver.page_content(page).await.unwrap_or_default();
        if is_cloudflare_challenge(&title, &content) {
            info!("{}: Cloudflare challenge in progress, waiting", account_name);
        } else {
            info!("{}: page loaded, waiting for cf_clearance", account_name);
        }
        tokio::time::sleep(CLEARANCE_POLL_INTERVAL).await;
        elapsed += CLEARANCE_POLL_INTERVAL;
    }
    warn!("{}: timeout waiting for cf_clearance cookie", account_name);
    false
}

/// Detects the regional slide-to-verify CAPTCHA by its trace-id marker
/// and performs the drag gesture. Returns true when no CAPTCHA was shown
/// or the verification cleared the marker.
pub async fn solve_slider_captcha(
    driver: &DriverSession,
    page: &Page,
    account_name: &str,
) -> bool {
    let trace_text: String = match driver.evaluate(page, TRACE_ID_PROBE_JS).await {
        Ok(text) => text,
        Err(e) => {
            warn!("{}: error probing for captcha trace id: {}", account_name, e);
            return false;
        }
    };
    let Some(trace_id) = extract_trace_id(&trace_text) else {
        return true;
    };
    warn!("{}: slider captcha detected, trace id {}", account_name, trace_id);

    // Wait for the widget to render.
    let mut waited = Duration::ZERO;
    while !driver.element_exists(page, "#nocaptcha").await {
        if waited >= SLIDER_WAIT {
            warn!("{}: slider widget never appeared", account_name);
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        waited += Duration::from_secs(1);
    }

    let track = driver.bounding_box(page, "#nocaptcha .nc_scale").await.ok().flatten();
    let handle = driver.bounding_box(page, "#nocaptcha .btn_slide").await.ok().flatten();
    let (Some(track), Some(handle)) = (track, handle) else {
        warn!("{}: slider or handle not found", account_name);
        driver.take_screenshot(page, "slider_captcha_error", account_name).await;
        return false;
    };

    driver.take_screenshot(page, "slider_captcha_start", account_name).await;
    let start = handle.center();
    let end = (handle.x + track.width, start.1);
    if let Err(e) = driver.drag(page, start, end, 2).await {
        warn!("{}: error moving slider: {}", account_name, e);
        driver.take_screenshot(page, "slider_captcha_error", account_name).await;
        return false;
    }
    tokio::time::sleep(SLIDER_SETTLE).await;
    driver.take_screenshot(page, "slider_captcha_result", account_name).await;

    // A cleared marker means the verification passed.
    match driver.evaluate::<String>(page, TRACE_ID_PROBE_JS).await {
        Ok(text) if extract_trace_id(&text).is_some() => {
            warn!("{}: slider verification failed, trace id still present", account_name);
            false
        }
        _ => {
            info!("{}: slider verification successful", account_name);
            true
        }
    }
}
