use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use url::Url;

use crate::bypass::{self, BypassCredential};
use crate::config::{AccountConfig, IdpKind, OAuthAccount, ProviderProfile, ProxyConfig};
use crate::headers::{build_common_headers, ImpersonationProfile};
use crate::http::{resolve_json, ApiSession};
use crate::session::{SessionContext, UserInfo};
use crate::signin::{cache_file_path, AuthOutcome, IdentityProvider, SignInAgent};

/// Outcome of one authentication method for one account. Never mutated
/// after creation.
#[derive(Debug, Clone)]
pub struct CheckInResult {
    pub method: String,
    pub success: bool,
    pub detail: MethodDetail,
}

#[derive(Debug, Clone)]
pub enum MethodDetail {
    Balance(UserInfo),
    Error(String),
}

impl CheckInResult {
    fn succeeded(method: String, info: UserInfo) -> CheckInResult {
        CheckInResult { method, success: true, detail: MethodDetail::Balance(info) }
    }

    fn failed(method: String, error: String) -> CheckInResult {
        CheckInResult { method, success: false, detail: MethodDetail::Error(error) }
    }
}

/// Overall signal for a result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Full,
    Partial,
    Failed,
}

pub fn summarize(results: &[CheckInResult]) -> RunStatus {
    let successes = results.iter().filter(|r| r.success).count();
    if results.is_empty() || successes == 0 {
        RunStatus::Failed
    } else if successes == results.len() {
        RunStatus::Full
    } else {
        RunStatus::Partial
    }
}

/// Sequential per-account state machine: bypass once, pin the header
/// identity, then try every configured authentication method in order.
/// One method's failure never prevents the next from running.
pub struct AccountRunner<'a> {
    pub account_name: String,
    pub account: &'a AccountConfig,
    pub provider: &'a ProviderProfile,
    pub global_proxy: Option<&'a ProxyConfig>,
    pub storage_dir: &'a Path,
    pub topup_interval: Duration,
}

impl AccountRunner<'_> {
    /// Account proxy wins over the global one.
    fn proxy(&self) -> Option<&ProxyConfig> {
        self.account.proxy.as_ref().or(self.global_proxy)
    }

    fn session_context(&self) -> SessionContext<'_> {
        SessionContext {
            account_name: &self.account_name,
            provider: self.provider,
            account: self.account,
            proxy: self.proxy(),
            topup_interval: self.topup_interval,
        }
    }

    pub async fn execute(&self) -> Vec<CheckInResult> {
        info!("starting to process {}", self.account_name);

        let bypass = bypass::acquire(self.provider, &self.account_name, self.proxy()).await;

        // One shared header set for the whole run. If the bypass captured
        // a browser fingerprint it is pinned here; otherwise one random
        // User-Agent is chosen and reused. Never regenerated mid-run.
        let common_headers = build_common_headers(bypass.fingerprint.as_ref());
        if bypass.fingerprint.is_some() {
            info!("{}: using captured browser fingerprint headers", self.account_name);
        } else {
            info!("{}: using random User-Agent (generated once)", self.account_name);
        }

        let mut results = Vec::new();

        if !self.account.cookies.is_empty() {
            info!("{}: trying cookies authentication", self.account_name);
            let result = match self.run_cookie_method(&bypass, &common_headers).await {
                Ok(info) => CheckInResult::succeeded("cookies".to_string(), info),
                Err(error) => CheckInResult::failed("cookies".to_string(), error),
            };
            log_method(&self.account_name, &result);
            results.push(result);
        }

        if let Some(token) = self.account.token.clone() {
            info!("{}: trying token authentication", self.account_name);
            let profile = profile_of(&common_headers);
            let result = match self
                .session_context()
                .check_in_with_token(&token, &common_headers, profile)
                .await
            {
                Ok(info) => CheckInResult::succeeded("token".to_string(), info),
                Err(error) => CheckInResult::failed("token".to_string(), error),
            };
            log_method(&self.account_name, &result);
            results.push(result);
        }

        for (index, oauth_account) in self.account.github.iter().enumerate() {
            let label = method_label(IdpKind::GitHub.key(), index, self.account.github.len());
            let result = self
                .run_oauth_labelled(
                    IdentityProvider::github(),
                    oauth_account,
                    label,
                    &bypass,
                    &common_headers,
                )
                .await;
            log_method(&self.account_name, &result);
            results.push(result);
        }

        for (index, oauth_account) in self.account.linux_do.iter().enumerate() {
            let label = method_label(IdpKind::LinuxDo.key(), index, self.account.linux_do.len());
            let result = self
                .run_oauth_labelled(
                    IdentityProvider::linuxdo(),
                    oauth_account,
                    label,
                    &bypass,
                    &common_headers,
                )
                .await;
            log_method(&self.account_name, &result);
            results.push(result);
        }

        if results.is_empty() {
            warn!("{}: no valid authentication method found in configuration", self.account_name);
            return results;
        }

        let successes = results.iter().filter(|r| r.success).count();
        info!(
            "{}: {}/{} authentication methods successful",
            self.account_name,
            successes,
            results.len()
        );
        results
    }

    async fn run_cookie_method(
        &self,
        bypass: &BypassCredential,
        common_headers: &HashMap<String, String>,
    ) -> Result<UserInfo, String> {
        if self.account.api_user.is_empty() {
            return Err("API user identifier not found".to_string());
        }
        let mut merged = bypass.cookies.clone();
        merged.extend(self.account.cookies.clone());
        self.session_context()
            .check_in_with_cookies(
                &merged,
                common_headers,
                &self.account.api_user,
                profile_of(common_headers),
            )
            .await
    }

    async fn run_oauth_labelled(
        &self,
        idp: IdentityProvider,
        oauth_account: &OAuthAccount,
        label: String,
        bypass: &BypassCredential,
        common_headers: &HashMap<String, String>,
    ) -> CheckInResult {
        info!(
            "{}: trying {} authentication ({})",
            self.account_name,
            idp.cache_prefix,
            oauth_account.username
        );
        if oauth_account.username.is_empty() || oauth_account.password.is_empty() {
            return CheckInResult::failed(label, "Incomplete OAuth account information".to_string());
        }
        match self
            .run_oauth_method(idp, oauth_account, bypass, common_headers)
            .await
        {
            Ok(info) => CheckInResult::succeeded(label, info),
            Err(error) => CheckInResult::failed(label, error),
        }
    }

    /// The OAuth chain: client-id resolution, auth-state discovery,
    /// browser sign-in, then either the direct cookie path or the
    /// code-exchange callback, and finally the shared cookie check-in.
    async fn run_oauth_method(
        &self,
        idp: IdentityProvider,
        oauth_account: &OAuthAccount,
        bypass: &BypassCredential,
        common_headers: &HashMap<String, String>,
    ) -> Result<UserInfo, String> {
        let profile = profile_of(common_headers);
        let session = ApiSession::new(self.proxy(), profile)
            .map_err(|e| format!("Failed to build HTTP session: {}", e))?;
        session
            .add_cookies(&self.provider.origin, &bypass.cookies)
            .map_err(|e| format!("Failed to load bypass cookies: {}", e))?;

        let mut headers = common_headers.clone();
        headers.insert(self.provider.api_user_key.clone(), "-1".to_string());
        headers.insert("Referer".to_string(), self.provider.login_url());
        headers.insert("Origin".to_string(), self.provider.origin.clone());

        // Configured client id wins over discovery.
        let client_id = match &self.provider.oauth(idp.kind).client_id {
            Some(id) => {
                info!("{}: using {} client id from config", self.account_name, idp.cache_prefix);
                id.clone()
            }
            None => self.fetch_client_id(&session, &headers, idp.kind).await?,
        };

        let (auth_state, auth_cookies) = self.fetch_auth_state(&session, &headers).await?;
        info!("{}: got auth state for {}", self.account_name, idp.cache_prefix);

        let kind = idp.kind;
        let cache_path = cache_file_path(self.storage_dir, &idp, &oauth_account.username);
        let agent = SignInAgent {
            account_name: &self.account_name,
            provider: self.provider,
            idp,
            username: &oauth_account.username,
            password: &oauth_account.password,
        };
        let (outcome, oauth_fingerprint) = agent
            .signin(&client_id, &auth_state, &auth_cookies, &cache_path)
            .await
            .map_err(|e| e.to_string())?;

        // A fingerprint observed mid-OAuth replaces the header identity
        // for everything that follows; without one, the existing set is
        // kept rather than fabricating an identity never shown upstream.
        let updated_headers = match &oauth_fingerprint {
            Some(fingerprint) => {
                info!("{}: updating headers with OAuth browser fingerprint", self.account_name);
                build_common_headers(Some(fingerprint))
            }
            None => common_headers.clone(),
        };
        let updated_profile = profile_of(&updated_headers);

        match outcome {
            AuthOutcome::Authenticated { cookies, api_user } => {
                let mut merged = bypass.cookies.clone();
                merged.extend(cookies);
                self.session_context()
                    .check_in_with_cookies(&merged, &updated_headers, &api_user, updated_profile)
                    .await
            }
            AuthOutcome::NeedsCallback { params } => {
                info!("{}: received OAuth code, calling callback API", self.account_name);
                self.exchange_callback(
                    &session,
                    &updated_headers,
                    kind,
                    &params,
                    &auth_cookies,
                    bypass,
                    updated_profile,
                )
                .await
            }
        }
    }

    /// Completes the OAuth exchange over direct HTTP when the browser
    /// could not: GET the application's callback endpoint with the code
    /// and state, read `api_user` from the JSON, and harvest the session
    /// cookies the response sets.
    #[allow(clippy::too_many_arguments)]
    async fn exchange_callback(
        &self,
        session: &ApiSession,
        headers: &HashMap<String, String>,
        kind: IdpKind,
        params: &[(String, String)],
        auth_cookies: &HashMap<String, String>,
        bypass: &BypassCredential,
        profile: ImpersonationProfile,
    ) -> Result<UserInfo, String> {
        let base = self
            .provider
            .oauth_callback_url(kind)
            .ok_or_else(|| "No OAuth callback endpoint configured".to_string())?;
        let callback_url = Url::parse_with_params(&base, params)
            .map_err(|e| format!("Invalid callback URL: {}", e))?;
        info!("{}: callback URL: {}", self.account_name, callback_url);

        session
            .add_cookies(&self.provider.origin, auth_cookies)
            .map_err(|e| format!("Failed to load auth cookies: {}", e))?;

        let response = session
            .get(callback_url.as_str(), headers)
            .await
            .map_err(|e| format!("OAuth callback error: {}", e))?;
        if response.status.as_u16() != 200 {
            return Err(format!("OAuth callback HTTP {}", response.status));
        }
        let Some(json) = resolve_json(&response, "oauth_callback", &self.account_name) else {
            return Err("OAuth callback failed: Invalid response".to_string());
        };
        if !json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            let message = json
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            return Err(format!("OAuth callback failed: {}", message));
        }

        let api_user = match json.get("data").and_then(|d| d.get("id")) {
            Some(id) if !id.is_null() => id
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| id.to_string()),
            _ => return Err("No user ID in OAuth callback response".to_string()),
        };
        info!("{}: got api_user from callback: {}", self.account_name, api_user);

        let user_cookies: HashMap<String, String> = response.cookies.iter().cloned().collect();
        info!(
            "{}: extracted {} user cookies from callback",
            self.account_name,
            user_cookies.len()
        );

        let mut merged = bypass.cookies.clone();
        merged.extend(user_cookies);
        self.session_context()
            .check_in_with_cookies(&merged, headers, &api_user, profile)
            .await
    }

    async fn fetch_client_id(
        &self,
        session: &ApiSession,
        headers: &HashMap<String, String>,
        kind: IdpKind,
    ) -> Result<String, String> {
        let response = session
            .get(&self.provider.status_url(), headers)
            .await
            .map_err(|e| format!("Failed to get client id, {}", e))?;
        if response.status.as_u16() != 200 {
            return Err(format!("Failed to get client id: HTTP {}", response.status));
        }
        let context = format!("get_auth_client_id_{}", kind.status_prefix());
        let Some(json) = resolve_json(&response, &context, &self.account_name) else {
            return Err("Failed to get client id: Invalid response type (saved to logs)".to_string());
        };
        if !json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            let message = json
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            return Err(format!("Failed to get client id: {}", message));
        }
        let data = json.get("data").cloned().unwrap_or_default();
        let oauth_enabled = data
            .get(format!("{}_oauth", kind.status_prefix()))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !oauth_enabled {
            return Err(format!("{} OAuth is not enabled.", kind.status_prefix()));
        }
        let client_id = data
            .get(format!("{}_client_id", kind.status_prefix()))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        info!("{}: got client id for {}: {}", self.account_name, kind.status_prefix(), client_id);
        Ok(client_id)
    }

    /// GET the auth-state endpoint: returns the opaque state plus the
    /// application-issued cookies the response carries, which the sign-in
    /// browser needs before the provider can redirect back.
    async fn fetch_auth_state(
        &self,
        session: &ApiSession,
        headers: &HashMap<String, String>,
    ) -> Result<(String, HashMap<String, String>), String> {
        let response = session
            .get(&self.provider.auth_state_url(), headers)
            .await
            .map_err(|e| format!("Failed to get auth state, {}", e))?;
        if response.status.as_u16() != 200 {
            return Err(format!("Failed to get auth state: HTTP {}", response.status));
        }
        let Some(json) = resolve_json(&response, "get_auth_state", &self.account_name) else {
            return Err("Failed to get auth state: Invalid response type (saved to logs)".to_string());
        };
        if !json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            let message = json
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            return Err(format!("Failed to get auth state: {}", message));
        }
        let state = match json.get("data") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err("Failed to get auth state: empty data".to_string()),
        };
        let cookies: HashMap<String, String> = response.cookies.iter().cloned().collect();
        info!(
            "{}: got {} cookies from auth state request",
            self.account_name,
            cookies.len()
        );
        Ok((state, cookies))
    }
}

fn profile_of(headers: &HashMap<String, String>) -> ImpersonationProfile {
    headers
        .get("User-Agent")
        .map(|ua| ImpersonationProfile::from_user_agent(ua))
        .unwrap_or_default()
}

fn method_label(base: &str, index: usize, total: usize) -> String {
    if total > 1 {
        format!("{}[{}]", base, index)
    } else {
        base.to_string()
    }
}

fn log_method(account_name: &str, result: &CheckInResult) {
    if result.success {
        info!("{}: {} authentication successful", account_name, result.method);
    } else {
        warn!("{}: {} authentication failed", account_name, result.method);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(method: &str) -> CheckInResult {
        CheckInResult::succeeded(
            method.to_string(),
            UserInfo {
                quota: 1.0,
                used_quota: 0.0,
                bonus_quota: 0.0,
                display: "Current balance: $1, Used: $0, Bonus: $0".to_string(),
            },
        )
    }

    fn failure(method: &str) -> CheckInResult {
        CheckInResult::failed(method.to_string(), "boom".to_string())
    }

    #[test]
    fn mixed_results_are_partial_and_keep_both_outcomes() {
        let results = vec![failure("cookies"), success("github")];
        assert_eq!(summarize(&results), RunStatus::Partial);
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
    }

    #[test]
    fn all_or_nothing_statuses() {
        assert_eq!(summarize(&[success("a"), success("b")]), RunStatus::Full);
        assert_eq!(summarize(&[failure("a"), failure("b")]), RunStatus::Failed);
        assert_eq!(summarize(&[]), RunStatus::Failed);
    }

    #[test]
    fn method_labels_index_only_with_multiple_accounts() {
        assert_eq!(method_label("github", 0, 1), "github");
        assert_eq!(method_label("github", 0, 2), "github[0]");
        assert_eq!(method_label("linux.do", 1, 3), "linux.do[1]");
    }

    #[test]
    fn profile_follows_the_shared_user_agent() {
        let mut headers = HashMap::new();
        headers.insert(
            "User-Agent".to_string(),
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
        );
        assert_eq!(profile_of(&headers), ImpersonationProfile::Chrome131);
        assert_eq!(profile_of(&HashMap::new()), ImpersonationProfile::Firefox135);
    }
}
