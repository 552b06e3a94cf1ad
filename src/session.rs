use std::collections::HashMap;
use std::time::Duration;

use chrono::Local;
use log::{info, warn};
use serde_json::Value;

use crate::cdk::{self, CdkContext};
use crate::checkin::{execute_check_in, quota_display, CheckInOutcome};
use crate::config::{AccountConfig, ProviderProfile, ProxyConfig};
use crate::headers::ImpersonationProfile;
use crate::http::{resolve_json, ApiSession};
use crate::topup::{redeem_codes, submit_topup};

/// Balance figures reported back as the success detail of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub quota: f64,
    pub used_quota: f64,
    pub bonus_quota: f64,
    pub display: String,
}

/// What to do about the explicit check-in call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInPlan {
    /// Check-in happens as a side effect of the user-info fetch.
    NotRequired,
    /// The status probe says today's check-in already happened.
    Skip,
    Execute,
}

/// Decides the check-in step from the profile shape and the status
/// probe's answer (`None` when no probe is configured).
pub fn plan_check_in(needs_manual: bool, already_checked_in: Option<bool>) -> CheckInPlan {
    if !needs_manual {
        return CheckInPlan::NotRequired;
    }
    match already_checked_in {
        Some(true) => CheckInPlan::Skip,
        // No probe, or not yet checked in: the call is idempotent either
        // way, "already checked in" replies count as success.
        Some(false) | None => CheckInPlan::Execute,
    }
}

pub fn user_info_from_json(json: &Value) -> Result<UserInfo, String> {
    if !json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        let message = json
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error");
        return Err(format!("Failed to get user info: {}", message));
    }
    let data = json.get("data").cloned().unwrap_or(Value::Null);
    let raw = |key: &str| data.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
    let quota = quota_display(raw("quota"));
    let used_quota = quota_display(raw("used_quota"));
    let bonus_quota = quota_display(raw("bonus_quota"));
    Ok(UserInfo {
        quota,
        used_quota,
        bonus_quota,
        display: format!(
            "Current balance: ${}, Used: ${}, Bonus: ${}",
            quota, used_quota, bonus_quota
        ),
    })
}

/// Everything one authentication method needs that does not change
/// between its steps.
pub struct SessionContext<'a> {
    pub account_name: &'a str,
    pub provider: &'a ProviderProfile,
    pub account: &'a AccountConfig,
    pub proxy: Option<&'a ProxyConfig>,
    pub topup_interval: Duration,
}

impl SessionContext<'_> {
    /// Runs the whole direct-HTTP phase for one validated credential set:
    /// optional status probe, check-in, optional reward redemption, and
    /// the final balance fetch. Every failure is converted to an error
    /// string at this boundary; nothing propagates past it.
    pub async fn check_in_with_cookies(
        &self,
        cookies: &HashMap<String, String>,
        common_headers: &HashMap<String, String>,
        api_user: &str,
        profile: ImpersonationProfile,
    ) -> Result<UserInfo, String> {
        info!(
            "{}: executing check-in with cookies (proxy: {}, impersonate: {})",
            self.account_name,
            self.proxy.is_some(),
            profile.as_str()
        );

        let session = ApiSession::new(self.proxy, profile)
            .map_err(|e| format!("Failed to build HTTP session: {}", e))?;
        session
            .add_cookies(&self.provider.origin, cookies)
            .map_err(|e| format!("Failed to load cookies: {}", e))?;

        let mut headers = common_headers.clone();
        headers.insert(self.provider.api_user_key.clone(), api_user.to_string());
        headers.insert("Referer".to_string(), self.provider.login_url());
        headers.insert("Origin".to_string(), self.provider.origin.clone());

        let probe_result = match self.provider.check_in_status_path() {
            Some(path) => Some(self.query_check_in_status(&session, &headers, path).await),
            None => None,
        };

        match plan_check_in(self.provider.needs_manual_check_in(), probe_result) {
            CheckInPlan::NotRequired => {
                info!(
                    "{}: check-in completes automatically with the user info request",
                    self.account_name
                );
            }
            CheckInPlan::Skip => {
                info!("{}: already checked in today, skipping check-in", self.account_name);
            }
            CheckInPlan::Execute => {
                let outcome = execute_check_in(
                    &session,
                    &headers,
                    self.provider,
                    api_user,
                    self.account_name,
                )
                .await
                .map_err(|e| format!("Check-in request failed: {}", e))?;
                if let CheckInOutcome::Failure { error } = outcome {
                    return Err(error);
                }
                // Re-query purely so the fresh state shows in the logs.
                if let Some(path) = self.provider.check_in_status_path() {
                    let _ = self.query_check_in_status(&session, &headers, path).await;
                }
            }
        }

        if self.provider.needs_manual_topup() {
            info!("{}: provider requires manual topup, executing", self.account_name);
            self.run_redemption(&session, &headers).await?;
        }

        self.fetch_user_info(&session, &headers).await
    }

    /// Bearer-token variant: check-in authorized by `Authorization:
    /// Bearer` instead of session cookies.
    pub async fn check_in_with_token(
        &self,
        token: &str,
        common_headers: &HashMap<String, String>,
        profile: ImpersonationProfile,
    ) -> Result<UserInfo, String> {
        info!(
            "{}: executing check-in with bearer token (proxy: {})",
            self.account_name,
            self.proxy.is_some()
        );

        let session = ApiSession::new(self.proxy, profile)
            .map_err(|e| format!("Failed to build HTTP session: {}", e))?;

        let mut headers = common_headers.clone();
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        headers.insert("Referer".to_string(), self.provider.login_url());
        headers.insert("Origin".to_string(), self.provider.origin.clone());

        let outcome = execute_check_in(&session, &headers, self.provider, "", self.account_name)
            .await
            .map_err(|e| format!("Check-in request failed: {}", e))?;
        if let CheckInOutcome::Failure { error } = outcome {
            return Err(error);
        }

        self.fetch_user_info(&session, &headers).await
    }

    /// Standard status probe: GET `{check_in_path}?month=YYYY-MM`, read
    /// `data.stats.checked_in_today`. Any failure reads as "not checked
    /// in" so the idempotent check-in call still runs.
    async fn query_check_in_status(
        &self,
        session: &ApiSession,
        headers: &HashMap<String, String>,
        path: &str,
    ) -> bool {
        let month = Local::now().format("%Y-%m");
        let url = format!("{}{}?month={}", self.provider.origin, path, month);
        info!("{}: getting check-in status", self.account_name);

        let response = match session.get(&url, headers).await {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: error getting check-in status: {}", self.account_name, e);
                return false;
            }
        };
        if response.status.as_u16() != 200 {
            warn!(
                "{}: failed to get check-in status: HTTP {}",
                self.account_name, response.status
            );
            return false;
        }
        let Some(json) = resolve_json(&response, "check_in_status", self.account_name) else {
            return false;
        };
        if !json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            warn!(
                "{}: failed to get check-in status: {}",
                self.account_name,
                json.get("message").and_then(|v| v.as_str()).unwrap_or("Unknown error")
            );
            return false;
        }

        let stats = json
            .get("data")
            .and_then(|d| d.get("stats"))
            .cloned()
            .unwrap_or(Value::Null);
        let checked_in_today = stats
            .get("checked_in_today")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let checkin_count = stats.get("checkin_count").and_then(|v| v.as_i64()).unwrap_or(0);
        let total_quota = stats.get("total_quota").and_then(|v| v.as_f64()).unwrap_or(0.0);
        info!(
            "{}: check-in status - today: {}, count: {}, total quota: ${}",
            self.account_name,
            checked_in_today,
            checkin_count,
            quota_display(total_quota)
        );
        checked_in_today
    }

    async fn run_redemption(
        &self,
        session: &ApiSession,
        headers: &HashMap<String, String>,
    ) -> Result<(), String> {
        let Some(source_name) = self.provider.cdk_source.as_deref() else {
            return Ok(());
        };
        let Some(source) = cdk::source_by_name(source_name) else {
            return Err(format!("Unknown cdk source: {}", source_name));
        };
        let Some(topup_url) = self.provider.topup_url() else {
            return Err("No topup URL configured".to_string());
        };

        let mut topup_headers = headers.clone();
        topup_headers.insert(
            "Referer".to_string(),
            format!("{}/console/topup", self.provider.origin),
        );
        topup_headers.insert("Origin".to_string(), self.provider.origin.clone());

        let feed = source(CdkContext {
            account_name: self.account_name.to_string(),
            settings: self.account.cdk.clone().unwrap_or_default(),
            proxy: self.proxy.cloned(),
        });

        let account_name = self.account_name;
        let report = redeem_codes(account_name, feed, self.topup_interval, move |code| {
            let topup_url = topup_url.clone();
            let topup_headers = topup_headers.clone();
            async move {
                submit_topup(session, &topup_url, &topup_headers, &code, account_name).await
            }
        })
        .await;

        if report.topup_count > 0 {
            info!(
                "{}: topup completed - {}/{} successful",
                self.account_name, report.topup_success_count, report.topup_count
            );
        }
        if !report.success {
            let error = if report.error.is_empty() {
                "Topup failed".to_string()
            } else {
                report.error
            };
            warn!("{}: topup failed, stopping check-in process", self.account_name);
            return Err(error);
        }
        Ok(())
    }

    async fn fetch_user_info(
        &self,
        session: &ApiSession,
        headers: &HashMap<String, String>,
    ) -> Result<UserInfo, String> {
        let response = session
            .get(&self.provider.user_info_url(), headers)
            .await
            .map_err(|e| format!("Failed to get user info, {}", e))?;
        if response.status.as_u16() != 200 {
            return Err(format!("Failed to get user info: HTTP {}", response.status));
        }
        let Some(json) = resolve_json(&response, "get_user_info", self.account_name) else {
            return Err("Failed to get user info: Invalid response type (saved to logs)".to_string());
        };
        let user_info = user_info_from_json(&json)?;
        info!("{}: {}", self.account_name, user_info.display);
        Ok(user_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn probe_says_checked_in_skips_the_post() {
        assert_eq!(plan_check_in(true, Some(true)), CheckInPlan::Skip);
    }

    #[test]
    fn unchecked_or_unprobed_executes() {
        assert_eq!(plan_check_in(true, Some(false)), CheckInPlan::Execute);
        assert_eq!(plan_check_in(true, None), CheckInPlan::Execute);
    }

    #[test]
    fn automatic_check_in_needs_no_call() {
        assert_eq!(plan_check_in(false, None), CheckInPlan::NotRequired);
        // A configured probe is irrelevant without a check-in endpoint.
        assert_eq!(plan_check_in(false, Some(false)), CheckInPlan::NotRequired);
    }

    #[test]
    fn user_info_scales_quota_for_display() {
        let json = json!({
            "success": true,
            "data": {"quota": 1_000_000_000i64, "used_quota": 250_000, "bonus_quota": 0}
        });
        let info = user_info_from_json(&json).unwrap();
        assert_eq!(info.quota, 2000.0);
        assert_eq!(info.used_quota, 0.5);
        assert_eq!(info.display, "Current balance: $2000, Used: $0.5, Bonus: $0");
    }

    #[test]
    fn user_info_failure_carries_message() {
        let json = json!({"success": false, "message": "无权进行此操作，未登录"});
        let err = user_info_from_json(&json).unwrap_err();
        assert!(err.contains("无权进行此操作"));
    }
}
