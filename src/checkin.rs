use std::collections::HashMap;

use log::{info, warn};
use reqwest::StatusCode;
use serde_json::Value;

use crate::config::ProviderProfile;
use crate::http::{resolve_json, ApiSession, NetworkError};

/// Raw quota units per display currency unit.
pub const QUOTA_SCALE: f64 = 500_000.0;

/// Scales a raw quota integer to the display currency, rounded to two
/// decimals.
pub fn quota_display(raw: f64) -> f64 {
    (raw / QUOTA_SCALE * 100.0).round() / 100.0
}

/// Interpreted check-in response.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckInOutcome {
    Success {
        message: String,
        checkin_date: String,
        quota_awarded: i64,
    },
    Failure {
        error: String,
    },
}

impl CheckInOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CheckInOutcome::Success { .. })
    }
}

/// Maps the target APIs' heterogeneous response shapes onto one outcome.
/// Business errors arrive as HTTP 400 with a JSON body, so both 200 and
/// 400 are treated as JSON carriers; "already checked in" is a success.
pub fn interpret_check_in(status: StatusCode, json: Option<&Value>, raw_body: &str) -> CheckInOutcome {
    if status != StatusCode::OK && status != StatusCode::BAD_REQUEST {
        return CheckInOutcome::Failure { error: format!("HTTP {}", status.as_u16()) };
    }

    let Some(json) = json else {
        // Some deployments answer with an HTML page; look for the word.
        if raw_body.to_lowercase().contains("success") {
            return CheckInOutcome::Success {
                message: "Check-in successful".to_string(),
                checkin_date: String::new(),
                quota_awarded: 0,
            };
        }
        return CheckInOutcome::Failure { error: "Invalid response format".to_string() };
    };

    let message = json
        .get("message")
        .or_else(|| json.get("msg"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let succeeded = json.get("ret").and_then(|v| v.as_i64()) == Some(1)
        || json.get("code").and_then(|v| v.as_i64()) == Some(0)
        || json.get("success").and_then(|v| v.as_bool()).unwrap_or(false)
        || message.contains("已经签到")
        || message.contains("签到成功");

    if succeeded {
        let data = json.get("data");
        let checkin_date = data
            .and_then(|d| d.get("checkin_date"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let quota_awarded = data
            .and_then(|d| d.get("quota_awarded"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let message = if message.is_empty() {
            "Check-in successful".to_string()
        } else {
            message
        };
        CheckInOutcome::Success { message, checkin_date, quota_awarded }
    } else {
        let error = json
            .get("msg")
            .or_else(|| json.get("message"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown error")
            .to_string();
        CheckInOutcome::Failure { error }
    }
}

/// POSTs the check-in call and interprets the reply.
pub async fn execute_check_in(
    session: &ApiSession,
    headers: &HashMap<String, String>,
    provider: &ProviderProfile,
    api_user: &str,
    account_name: &str,
) -> Result<CheckInOutcome, NetworkError> {
    info!("{}: executing check-in", account_name);

    let Some(url) = provider.check_in_url(api_user) else {
        warn!("{}: no check-in URL configured", account_name);
        return Ok(CheckInOutcome::Failure { error: "No check-in URL configured".to_string() });
    };

    let mut checkin_headers = headers.clone();
    checkin_headers.insert("Content-Type".to_string(), "application/json".to_string());
    checkin_headers.insert("X-Requested-With".to_string(), "XMLHttpRequest".to_string());

    let response = session.post_empty(&url, &checkin_headers).await?;
    info!("{}: check-in response status {}", account_name, response.status);

    let json = if response.status == StatusCode::OK || response.status == StatusCode::BAD_REQUEST {
        resolve_json(&response, "execute_check_in", account_name)
    } else {
        None
    };

    let outcome = interpret_check_in(response.status, json.as_ref(), &response.text);
    match &outcome {
        CheckInOutcome::Success { message, checkin_date, quota_awarded } => {
            if *quota_awarded > 0 {
                info!(
                    "{}: check-in successful, date: {}, quota awarded: ${}",
                    account_name,
                    checkin_date,
                    quota_display(*quota_awarded as f64)
                );
            } else {
                info!("{}: check-in successful, {}", account_name, message);
            }
        }
        CheckInOutcome::Failure { error } => {
            warn!("{}: check-in failed - {}", account_name, error);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_400_with_success_sentinel_is_success() {
        let body = json!({"ret": 1, "message": "签到成功"});
        let outcome = interpret_check_in(
            StatusCode::BAD_REQUEST,
            Some(&body),
            &body.to_string(),
        );
        assert_eq!(
            outcome,
            CheckInOutcome::Success {
                message: "签到成功".to_string(),
                checkin_date: String::new(),
                quota_awarded: 0,
            }
        );
    }

    #[test]
    fn already_checked_in_is_idempotent_success() {
        let body = json!({"success": false, "message": "今天已经签到过了"});
        let outcome = interpret_check_in(StatusCode::OK, Some(&body), "");
        assert!(outcome.is_success());
    }

    #[test]
    fn code_zero_sentinel_with_data() {
        let body = json!({
            "code": 0,
            "msg": "ok",
            "data": {"checkin_date": "2026-08-08", "quota_awarded": 2500000}
        });
        match interpret_check_in(StatusCode::OK, Some(&body), "") {
            CheckInOutcome::Success { checkin_date, quota_awarded, .. } => {
                assert_eq!(checkin_date, "2026-08-08");
                assert_eq!(quota_awarded, 2_500_000);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn html_body_falls_back_to_substring_heuristic() {
        let outcome = interpret_check_in(
            StatusCode::OK,
            None,
            "<html><body>Operation SUCCESS</body></html>",
        );
        assert!(outcome.is_success());

        let failure = interpret_check_in(StatusCode::OK, None, "<html>blocked</html>");
        assert_eq!(
            failure,
            CheckInOutcome::Failure { error: "Invalid response format".to_string() }
        );
    }

    #[test]
    fn business_error_surfaces_message() {
        let body = json!({"success": false, "message": "not eligible"});
        assert_eq!(
            interpret_check_in(StatusCode::BAD_REQUEST, Some(&body), ""),
            CheckInOutcome::Failure { error: "not eligible".to_string() }
        );
    }

    #[test]
    fn unexpected_status_is_failure() {
        assert_eq!(
            interpret_check_in(StatusCode::FORBIDDEN, None, ""),
            CheckInOutcome::Failure { error: "HTTP 403".to_string() }
        );
    }

    #[test]
    fn quota_scales_to_display_currency() {
        assert_eq!(quota_display(1_000_000_000.0), 2000.0);
        assert_eq!(quota_display(1_250_000.0), 2.5);
        assert_eq!(quota_display(0.0), 0.0);
    }
}
