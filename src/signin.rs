use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use log::{info, warn};
use sha2::{Digest, Sha256};
use url::Url;

use crate::browser::{filter_cookies, BrowserError, DriverSession};
use crate::bypass::solve_cloudflare_interstitial;
use crate::challenge::is_cloudflare_challenge;
use crate::config::{IdpKind, ProviderProfile};
use crate::headers::FingerprintHeaders;
use crate::secrets::{SecretRequest, WaitForSecrets};

const POST_LOGIN_WAIT: Duration = Duration::from_secs(10);
const SWITCH_ACCOUNT_WAIT: Duration = Duration::from_secs(5);
const MANUAL_OTP_WAIT: Duration = Duration::from_secs(30);
const OTP_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(300);
const CALLBACK_WAIT: Duration = Duration::from_secs(30);
const CALLBACK_SETTLE: Duration = Duration::from_secs(5);
const USER_STORAGE_WAIT: Duration = Duration::from_secs(10);
const CF_POST_SOLVE_WAIT: Duration = Duration::from_secs(10);

/// Static description of one identity provider's login machinery.
pub struct IdentityProvider {
    pub kind: IdpKind,
    pub login_url: &'static str,
    pub username_selector: &'static str,
    pub password_selector: &'static str,
    pub submit_selector: &'static str,
    /// Two-factor one-time-code input, when the provider has one.
    pub otp_selector: Option<&'static str>,
    /// Account-disambiguation form shown after login for some accounts.
    pub switch_account_form: Option<&'static str>,
    pub authorize_origin: &'static str,
    pub scope: &'static str,
    /// Prefix of the storage-state cache file name.
    pub cache_prefix: &'static str,
}

impl IdentityProvider {
    pub fn github() -> IdentityProvider {
        IdentityProvider {
            kind: IdpKind::GitHub,
            login_url: "https://github.com/login",
            username_selector: "#login_field",
            password_selector: "#password",
            submit_selector: "input[type=\"submit\"][value=\"Sign in\"]",
            otp_selector: Some("input[name=\"otp\"]"),
            switch_account_form: Some("form[action=\"/switch_account\"]"),
            authorize_origin: "https://github.com",
            scope: "user:email",
            cache_prefix: "github",
        }
    }

    pub fn linuxdo() -> IdentityProvider {
        IdentityProvider {
            kind: IdpKind::LinuxDo,
            login_url: "https://linux.do/login",
            username_selector: "#login-account-name",
            password_selector: "#login-account-password",
            submit_selector: "#login-button",
            otp_selector: None,
            switch_account_form: None,
            authorize_origin: "https://connect.linux.do",
            scope: "user",
            cache_prefix: "linuxdo",
        }
    }

    pub fn authorize_url(&self, client_id: &str, state: &str) -> String {
        format!(
            "{}/login/oauth/authorize?response_type=code&client_id={}&state={}&scope={}",
            self.authorize_origin, client_id, state, self.scope
        )
    }
}

/// Outcome of a browser sign-in: either a usable application session, or
/// the OAuth code the caller must exchange itself over direct HTTP.
#[derive(Debug)]
pub enum AuthOutcome {
    Authenticated {
        cookies: HashMap<String, String>,
        api_user: String,
    },
    NeedsCallback {
        params: Vec<(String, String)>,
    },
}

#[derive(Debug)]
pub enum SignInError {
    Browser(BrowserError),
    LoginFailed(String),
    CallbackFailed(String),
}

impl std::fmt::Display for SignInError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignInError::Browser(e) => write!(f, "sign-in browser error: {}", e),
            SignInError::LoginFailed(m) => write!(f, "sign-in failed: {}", m),
            SignInError::CallbackFailed(m) => write!(f, "OAuth callback failed: {}", m),
        }
    }
}

impl std::error::Error for SignInError {}

impl From<BrowserError> for SignInError {
    fn from(err: BrowserError) -> SignInError {
        SignInError::Browser(err)
    }
}

/// Query parameters of a callback URL, but only when it actually carries
/// an OAuth `code` to exchange.
fn callback_code_params(url: &str) -> Option<Vec<(String, String)>> {
    let parsed = Url::parse(url).ok()?;
    let params: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if params.iter().any(|(k, _)| k == "code") {
        Some(params)
    } else {
        None
    }
}

/// Storage-state cache file for one identity, keyed by a short hash of
/// the username so credentials never appear in file names.
pub fn cache_file_path(storage_dir: &Path, idp: &IdentityProvider, username: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(username.as_bytes()));
    storage_dir.join(format!("{}_{}_storage_state.json", idp.cache_prefix, &digest[..8]))
}

/// Drives one identity provider's full login + consent flow in a
/// disposable browser, reusing cached storage state when available.
pub struct SignInAgent<'a> {
    pub account_name: &'a str,
    pub provider: &'a ProviderProfile,
    pub idp: IdentityProvider,
    pub username: &'a str,
    pub password: &'a str,
}

impl SignInAgent<'_> {
    pub async fn signin(
        &self,
        client_id: &str,
        auth_state: &str,
        auth_cookies: &HashMap<String, String>,
        cache_path: &Path,
    ) -> Result<(AuthOutcome, Option<FingerprintHeaders>), SignInError> {
        info!(
            "{}: signing in via {} (client_id: {}, cache: {})",
            self.account_name,
            self.idp.cache_prefix,
            client_id,
            cache_path.display()
        );

        let driver = DriverSession::launch(self.account_name, "oauth", None).await?;
        let result = self
            .signin_inner(&driver, client_id, auth_state, auth_cookies, cache_path)
            .await;
        driver.shutdown().await;
        result
    }

    async fn signin_inner(
        &self,
        driver: &DriverSession,
        client_id: &str,
        auth_state: &str,
        auth_cookies: &HashMap<String, String>,
        cache_path: &Path,
    ) -> Result<(AuthOutcome, Option<FingerprintHeaders>), SignInError> {
        let page = driver.new_page().await?;

        let cached_state = driver.restore_storage_state(&page, cache_path).await?;
        let had_cache = cached_state.is_some();
        if had_cache {
            info!("{}: restored storage state from cache", self.account_name);
        } else {
            info!("{}: no cached storage state, starting fresh", self.account_name);
        }

        // The application's own session cookies must be in place before
        // the provider redirects back, even though this browser never
        // visits the application's login page.
        self.inject_auth_cookies(driver, &page, auth_cookies).await?;

        let oauth_url = self.idp.authorize_url(client_id, auth_state);

        let mut logged_in = false;
        if had_cache {
            match self
                .try_cached_authorization(driver, &page, &oauth_url, cached_state.as_ref())
                .await
            {
                Ok(ok) => logged_in = ok,
                Err(e) => warn!("{}: failed to check cached login: {}", self.account_name, e),
            }
        }

        if !logged_in {
            self.interactive_login(driver, &page, cache_path).await?;

            info!("{}: navigating to authorization page", self.account_name);
            driver.goto(&page, &oauth_url).await?;
            if !self.current_url_on_app_origin(driver, &page).await {
                if driver.element_exists(&page, "button[type=\"submit\"]").await {
                    info!("{}: clicking authorize button", self.account_name);
                    if let Err(e) = driver.click(&page, "button[type=\"submit\"]").await {
                        warn!("{}: authorize click failed: {}", self.account_name, e);
                    }
                } else {
                    info!("{}: authorize button not found", self.account_name);
                }
            }
        }

        // From here the flow is the same whether the login was cached or
        // interactive: wait out the redirect, then prove the session.
        let mut cloudflare_detected = false;
        let pattern = self.provider.oauth_redirect_pattern(self.idp.kind);
        info!("{}: waiting for OAuth callback to {}", self.account_name, pattern);
        let reached = driver.wait_for_url(&page, &pattern, CALLBACK_WAIT).await?;
        tokio::time::sleep(CALLBACK_SETTLE).await;

        if reached {
            let title = driver.page_title(&page).await.unwrap_or_default();
            let content = driver.page_content(&page).await.unwrap_or_default();
            if is_cloudflare_challenge(&title, &content) {
                cloudflare_detected = true;
                info!("{}: Cloudflare challenge at callback, auto-solving", self.account_name);
                if solve_cloudflare_interstitial(driver, &page, self.account_name).await {
                    tokio::time::sleep(CF_POST_SOLVE_WAIT).await;
                } else {
                    warn!("{}: callback challenge auto-solve failed", self.account_name);
                }
            }
        } else {
            let current = driver.page_url(&page).await?.unwrap_or_default();
            if current.contains("code=") {
                info!(
                    "{}: redirect wait timed out but OAuth code found in URL, continuing",
                    self.account_name
                );
            } else {
                warn!(
                    "{}: callback never reached, current page is {}",
                    self.account_name, current
                );
                driver
                    .take_screenshot(&page, "oauth_callback_missing", self.account_name)
                    .await;
            }
        }

        // The user-id probe is the real signal that the session works;
        // the authorize-button heuristic above is only best-effort.
        let api_user = self.read_api_user(driver, &page).await;

        let fingerprint = if cloudflare_detected {
            driver.capture_fingerprint(&page).await
        } else {
            // No challenge was presented, so no fingerprint to pin; the
            // caller keeps whatever header set it already had.
            None
        };

        if let Some(api_user) = api_user {
            info!("{}: OAuth authorization successful, api user {}", self.account_name, api_user);
            let cookies = driver.cookies(&page).await?;
            let user_cookies = filter_cookies(&cookies, &self.provider.origin);
            return Ok((
                AuthOutcome::Authenticated { cookies: user_cookies, api_user },
                fingerprint,
            ));
        }

        // No user object in storage; fall back to the code/state in the
        // callback URL and let the caller finish the exchange itself.
        let current = driver.page_url(&page).await?.unwrap_or_default();
        if let Some(params) = callback_code_params(&current) {
            info!("{}: OAuth code received in callback URL", self.account_name);
            return Ok((AuthOutcome::NeedsCallback { params }, fingerprint));
        }

        driver
            .take_screenshot(&page, "oauth_failed_no_user_id", self.account_name)
            .await;
        Err(SignInError::CallbackFailed("no user id and no code in callback".to_string()))
    }

    async fn inject_auth_cookies(
        &self,
        driver: &DriverSession,
        page: &Page,
        auth_cookies: &HashMap<String, String>,
    ) -> Result<(), SignInError> {
        if auth_cookies.is_empty() {
            info!("{}: no auth cookies to set", self.account_name);
            return Ok(());
        }
        let host = self.provider.host();
        let mut params = Vec::new();
        for (name, value) in auth_cookies {
            params.push(
                CookieParam::builder()
                    .name(name.clone())
                    .value(value.clone())
                    .domain(host.clone())
                    .path("/")
                    .build()
                    .map_err(|e| SignInError::Browser(BrowserError::Cookie(e)))?,
            );
        }
        info!("{}: set {} auth cookies from provider", self.account_name, params.len());
        driver.set_cookies(page, params).await?;
        Ok(())
    }

    /// Visits the authorize URL with the cached session. The provider
    /// either bounces straight back to the application or shows a
    /// one-click consent button.
    async fn try_cached_authorization(
        &self,
        driver: &DriverSession,
        page: &Page,
        oauth_url: &str,
        cached_state: Option<&crate::browser::StorageState>,
    ) -> Result<bool, SignInError> {
        info!("{}: checking cached login at authorize URL", self.account_name);
        driver.goto(page, oauth_url).await?;
        if let Some(state) = cached_state {
            driver.apply_local_storage(page, state).await?;
        }
        driver.save_page_html(page, "sign_in_check", self.account_name).await;

        if self.current_url_on_app_origin(driver, page).await {
            info!("{}: already logged in via cache, redirected to app", self.account_name);
            return Ok(true);
        }
        if driver.element_exists(page, "button[type=\"submit\"]").await {
            info!("{}: already logged in via cache, clicking authorize", self.account_name);
            driver.click(page, "button[type=\"submit\"]").await?;
            return Ok(true);
        }
        info!("{}: authorize button not found, need to log in again", self.account_name);
        Ok(false)
    }

    async fn interactive_login(
        &self,
        driver: &DriverSession,
        page: &Page,
        cache_path: &Path,
    ) -> Result<(), SignInError> {
        info!("{}: starting interactive {} login", self.account_name, self.idp.cache_prefix);

        let login = async {
            driver.goto(page, self.idp.login_url).await?;
            driver.fill(page, self.idp.username_selector, self.username).await?;
            driver.fill(page, self.idp.password_selector, self.password).await?;
            driver.click(page, self.idp.submit_selector).await?;
            tokio::time::sleep(POST_LOGIN_WAIT).await;
            driver.save_page_html(page, "sign_in_result", self.account_name).await;

            if let Some(form_selector) = self.idp.switch_account_form {
                self.handle_account_selection(driver, page, form_selector).await;
            }
            if let Some(otp_selector) = self.idp.otp_selector {
                self.handle_two_factor(driver, page, otp_selector).await;
            }
            Ok::<(), SignInError>(())
        }
        .await;

        // Persist whatever progress was made, success or not, so a retry
        // can resume past the password step.
        if let Err(e) = driver.save_storage_state(page, cache_path).await {
            warn!("{}: failed to save storage state: {}", self.account_name, e);
        } else {
            info!("{}: storage state saved to cache file", self.account_name);
        }

        if let Err(e) = login {
            driver.take_screenshot(page, "signin_error", self.account_name).await;
            return Err(SignInError::LoginFailed(e.to_string()));
        }
        Ok(())
    }

    async fn handle_account_selection(
        &self,
        driver: &DriverSession,
        page: &Page,
        form_selector: &str,
    ) {
        if !driver.element_exists(page, form_selector).await {
            return;
        }
        info!("{}: account selection required, submitting default", self.account_name);
        let submit = format!("{} input[type=\"submit\"]", form_selector);
        match driver.click(page, &submit).await {
            Ok(()) => {
                tokio::time::sleep(SWITCH_ACCOUNT_WAIT).await;
                driver.save_page_html(page, "account_selected", self.account_name).await;
            }
            Err(e) => warn!("{}: account selection submit failed: {}", self.account_name, e),
        }
    }

    async fn handle_two_factor(&self, driver: &DriverSession, page: &Page, otp_selector: &str) {
        if !driver.element_exists(page, otp_selector).await {
            return;
        }
        info!("{}: two-factor authentication required", self.account_name);
        let url_before = driver.page_url(page).await.ok().flatten().unwrap_or_default();

        let secrets = WaitForSecrets::new();
        let requests = [SecretRequest {
            key: "OTP",
            name: format!("{} 2FA OTP", self.idp.cache_prefix),
            description: "One-time code from the authenticator app".to_string(),
        }];
        let otp_code = secrets
            .get(
                &requests,
                OTP_EXCHANGE_TIMEOUT,
                "Two-factor code required",
                &format!("{}: enter the current one-time code", self.account_name),
            )
            .await
            .and_then(|mut values| values.remove("OTP"));

        match otp_code {
            Some(code) => {
                info!("{}: auto-filling one-time code", self.account_name);
                if let Err(e) = driver.fill(page, otp_selector, &code).await {
                    warn!("{}: failed to fill one-time code: {}", self.account_name, e);
                    return;
                }
                driver.save_page_html(page, "otp_filled", self.account_name).await;
                // The input auto-submits; wait for the page to move on.
                let deadline = std::time::Instant::now() + Duration::from_secs(10);
                while std::time::Instant::now() < deadline {
                    let current = driver.page_url(page).await.ok().flatten().unwrap_or_default();
                    if current != url_before {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            None => {
                info!(
                    "{}: code retrieval unavailable, waiting for manual entry",
                    self.account_name
                );
                tokio::time::sleep(MANUAL_OTP_WAIT).await;
            }
        }
    }

    async fn current_url_on_app_origin(&self, driver: &DriverSession, page: &Page) -> bool {
        match driver.page_url(page).await {
            Ok(Some(url)) => url.starts_with(&self.provider.origin),
            _ => false,
        }
    }

    /// Reads `localStorage.user.id`, waiting briefly for the application
    /// to populate it after the callback.
    async fn read_api_user(&self, driver: &DriverSession, page: &Page) -> Option<String> {
        let deadline = std::time::Instant::now() + USER_STORAGE_WAIT;
        loop {
            let user_data: Option<String> = driver
                .evaluate(page, "() => localStorage.getItem('user')")
                .await
                .ok()
                .flatten();
            if let Some(raw) = user_data {
                match serde_json::from_str::<serde_json::Value>(&raw) {
                    Ok(user) => match user.get("id") {
                        Some(id) if !id.is_null() => {
                            let id = if let Some(s) = id.as_str() {
                                s.to_string()
                            } else {
                                id.to_string()
                            };
                            return Some(id);
                        }
                        _ => {
                            warn!("{}: user id not found in localStorage", self.account_name);
                            return None;
                        }
                    },
                    Err(e) => {
                        warn!("{}: unreadable user object in localStorage: {}", self.account_name, e);
                        return None;
                    }
                }
            }
            if std::time::Instant::now() >= deadline {
                warn!("{}: user data not found in localStorage", self.account_name);
                return None;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_client_id_state_and_scope() {
        let idp = IdentityProvider::github();
        let url = idp.authorize_url("Ov23liABC", "state123");
        assert_eq!(
            url,
            "https://github.com/login/oauth/authorize?response_type=code&client_id=Ov23liABC&state=state123&scope=user:email"
        );
    }

    #[test]
    fn cache_path_is_keyed_by_username_hash() {
        let idp = IdentityProvider::github();
        let a = cache_file_path(Path::new("storage-states"), &idp, "alice");
        let b = cache_file_path(Path::new("storage-states"), &idp, "bob");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("github_"));
        assert!(name.ends_with("_storage_state.json"));
        // Raw username never appears in the file name.
        assert!(!name.contains("alice"));
        // Stable across calls.
        assert_eq!(a, cache_file_path(Path::new("storage-states"), &idp, "alice"));
    }

    #[test]
    fn callback_url_with_code_yields_all_query_params() {
        let params =
            callback_code_params("https://example.com/oauth/github?code=abc&state=xyz").unwrap();
        assert!(params.contains(&("code".to_string(), "abc".to_string())));
        assert!(params.contains(&("state".to_string(), "xyz".to_string())));
    }

    #[test]
    fn callback_url_without_code_is_rejected() {
        assert!(callback_code_params("https://example.com/oauth/github?error=denied").is_none());
        assert!(callback_code_params("not a url").is_none());
    }

    #[test]
    fn linuxdo_descriptor_has_no_two_factor_flow() {
        let idp = IdentityProvider::linuxdo();
        assert!(idp.otp_selector.is_none());
        assert!(idp.switch_account_form.is_none());
        assert_eq!(idp.kind, IdpKind::LinuxDo);
    }
}
