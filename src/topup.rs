use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use log::{info, warn};
use serde_json::json;

use crate::cdk::{CdkEvent, CdkStream};
use crate::http::{resolve_json, ApiSession};

/// Default cooldown between consecutive code submissions.
pub const TOPUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TopupOutcome {
    pub success: bool,
    pub message: String,
    /// The code had been redeemed before; treated as success.
    pub already_used: bool,
}

/// Submits one redemption code to the top-up endpoint. A response saying
/// the code was already used counts as success, making retries safe.
pub async fn submit_topup(
    session: &ApiSession,
    topup_url: &str,
    headers: &HashMap<String, String>,
    key: &str,
    account_name: &str,
) -> TopupOutcome {
    let mut topup_headers = headers.clone();
    topup_headers.insert("Content-Type".to_string(), "application/json".to_string());
    topup_headers.insert("Cache-Control".to_string(), "no-store".to_string());
    topup_headers.insert("Pragma".to_string(), "no-cache".to_string());

    let response = match session
        .post_json(topup_url, &topup_headers, &json!({ "key": key }))
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!("{}: topup error - {}", account_name, e);
            return TopupOutcome {
                success: false,
                message: format!("Topup failed: {}(key: {})", e, key),
                already_used: false,
            };
        }
    };

    if !matches!(response.status.as_u16(), 200 | 400) {
        warn!("{}: topup failed - HTTP {}", account_name, response.status);
        return TopupOutcome {
            success: false,
            message: format!("Topup failed: HTTP {}(key: {})", response.status, key),
            already_used: false,
        };
    }

    let Some(body) = resolve_json(&response, "topup", account_name) else {
        return TopupOutcome {
            success: false,
            message: "Failed to topup: Invalid response type (saved to logs)".to_string(),
            already_used: false,
        };
    };

    if body.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        let message = body
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Topup successful")
            .to_string();
        info!("{}: topup successful - {}", account_name, message);
        return TopupOutcome { success: true, message, already_used: false };
    }

    let error_msg = body
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown error")
        .to_string();
    if error_msg.contains("已被使用")
        || error_msg.contains("已使用")
        || error_msg.to_lowercase().contains("already")
    {
        info!("{}: code already used - {}", account_name, error_msg);
        return TopupOutcome { success: true, message: error_msg, already_used: true };
    }

    warn!("{}: topup failed - {}", account_name, error_msg);
    TopupOutcome {
        success: false,
        message: format!("Topup failed: {}(key: {})", error_msg, key),
        already_used: false,
    }
}

/// Aggregate result of one redemption loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeemReport {
    pub success: bool,
    pub topup_count: u32,
    pub topup_success_count: u32,
    pub error: String,
}

impl RedeemReport {
    pub fn nothing_to_do() -> RedeemReport {
        RedeemReport { success: true, topup_count: 0, topup_success_count: 0, error: String::new() }
    }
}

/// Pulls codes from the feed and submits each through `submit`, waiting
/// `interval` between consecutive submissions (not before the first). A
/// `Stop` event or a failed submission ends the loop; `Skip` rounds pass
/// through without counting.
pub async fn redeem_codes<F, Fut>(
    account_name: &str,
    mut feed: CdkStream,
    interval: Duration,
    mut submit: F,
) -> RedeemReport
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = TopupOutcome>,
{
    let mut report = RedeemReport::nothing_to_do();

    while let Some(event) = feed.next().await {
        match event {
            CdkEvent::Stop(error) => {
                warn!("{}: code source failed - {}, stopping topup", account_name, error);
                report.success = false;
                report.error = error;
                break;
            }
            CdkEvent::Skip => {
                info!("{}: no code to redeem this round, continuing", account_name);
            }
            CdkEvent::Code(code) => {
                if report.topup_count > 0 && !interval.is_zero() {
                    info!(
                        "{}: waiting {}s before next topup",
                        account_name,
                        interval.as_secs()
                    );
                    tokio::time::sleep(interval).await;
                }
                report.topup_count += 1;
                info!("{}: executing topup #{} with code {}", account_name, report.topup_count, code);

                let outcome = submit(code).await;
                if outcome.success {
                    report.topup_success_count += 1;
                } else {
                    report.success = false;
                    report.error = outcome.message;
                    warn!(
                        "{}: topup #{} failed, stopping topup",
                        account_name, report.topup_count
                    );
                    break;
                }
            }
        }
    }

    if report.topup_count == 0 {
        info!("{}: no code available for topup", account_name);
    } else {
        info!(
            "{}: {}/{} topup(s) successful",
            account_name, report.topup_success_count, report.topup_count
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdk::stream_of;

    fn ok() -> TopupOutcome {
        TopupOutcome { success: true, message: "ok".to_string(), already_used: false }
    }

    fn used() -> TopupOutcome {
        TopupOutcome { success: true, message: "already used".to_string(), already_used: true }
    }

    fn failed(msg: &str) -> TopupOutcome {
        TopupOutcome { success: false, message: msg.to_string(), already_used: false }
    }

    #[tokio::test]
    async fn stops_at_producer_failure_with_counts_preserved() {
        let feed = stream_of(vec![
            CdkEvent::Code("one".to_string()),
            CdkEvent::Code("two".to_string()),
            CdkEvent::Stop("x".to_string()),
            CdkEvent::Code("never".to_string()),
        ]);
        let report = redeem_codes("test", feed, Duration::ZERO, |_| async { ok() }).await;
        assert!(!report.success);
        assert_eq!(report.error, "x");
        assert_eq!(report.topup_count, 2);
        assert_eq!(report.topup_success_count, 2);
    }

    #[tokio::test]
    async fn skip_rounds_do_not_count_as_submissions() {
        let feed = stream_of(vec![
            CdkEvent::Skip,
            CdkEvent::Code("one".to_string()),
            CdkEvent::Skip,
        ]);
        let report = redeem_codes("test", feed, Duration::ZERO, |_| async { ok() }).await;
        assert!(report.success);
        assert_eq!(report.topup_count, 1);
        assert_eq!(report.topup_success_count, 1);
    }

    #[tokio::test]
    async fn failed_submission_short_circuits() {
        let feed = stream_of(vec![
            CdkEvent::Code("bad".to_string()),
            CdkEvent::Code("never".to_string()),
        ]);
        let report = redeem_codes("test", feed, Duration::ZERO, |code| async move {
            if code == "bad" {
                failed("Topup failed: invalid(key: bad)")
            } else {
                ok()
            }
        })
        .await;
        assert!(!report.success);
        assert_eq!(report.topup_count, 1);
        assert_eq!(report.topup_success_count, 0);
        assert!(report.error.contains("bad"));
    }

    #[tokio::test]
    async fn already_used_code_counts_as_success() {
        let feed = stream_of(vec![CdkEvent::Code("dup".to_string())]);
        let report = redeem_codes("test", feed, Duration::ZERO, |_| async { used() }).await;
        assert!(report.success);
        assert_eq!(report.topup_success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_applies_between_submissions_not_before_first() {
        let start = tokio::time::Instant::now();
        let feed = stream_of(vec![
            CdkEvent::Code("one".to_string()),
            CdkEvent::Code("two".to_string()),
        ]);
        let report = redeem_codes("test", feed, Duration::from_secs(60), |_| async { ok() }).await;
        assert!(report.success);
        assert_eq!(report.topup_count, 2);
        // Exactly one cooldown elapsed: none before the first code, one
        // before the second.
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn empty_feed_reports_nothing_to_do() {
        let report = redeem_codes("test", stream_of(vec![]), Duration::ZERO, |_| async { ok() }).await;
        assert_eq!(report, RedeemReport::nothing_to_do());
    }
}
