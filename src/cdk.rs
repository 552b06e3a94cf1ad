use std::collections::HashMap;
use std::pin::Pin;

use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::{self, Stream};
use log::{info, warn};
use serde_json::Value;

use crate::config::{CdkSettings, ProxyConfig};
use crate::headers::ImpersonationProfile;
use crate::http::{resolve_json, ApiSession};

const PORTAL_ORIGIN: &str = "https://fuli.hxi.me";
const SPIN_ORIGIN: &str = "https://up.x666.me";

/// One element of a reward-code feed.
#[derive(Debug, Clone, PartialEq)]
pub enum CdkEvent {
    /// A redemption code to submit to the top-up endpoint.
    Code(String),
    /// Nothing to redeem this round (e.g. the reward was credited
    /// directly); the loop continues.
    Skip,
    /// Producer failure; the loop stops and surfaces the error.
    Stop(String),
}

/// Uniform feed type: synchronous and asynchronous producers both
/// surface as the same stream, so the consuming loop never inspects the
/// producer's scheduling.
pub type CdkStream = Pin<Box<dyn Stream<Item = CdkEvent> + Send>>;

/// What a source needs from the account: its secrets and the resolved
/// proxy.
#[derive(Clone)]
pub struct CdkContext {
    pub account_name: String,
    pub settings: CdkSettings,
    pub proxy: Option<ProxyConfig>,
}

pub type CdkSourceFn = fn(CdkContext) -> CdkStream;

/// Resolves a provider profile's `cdk_source` name. Profiles stay plain
/// configuration data; behavior is attached here by name.
pub fn source_by_name(name: &str) -> Option<CdkSourceFn> {
    match name {
        "portal_wheel" => Some(portal_wheel),
        "bearer_spin" => Some(bearer_spin),
        _ => None,
    }
}

/// Wraps a fixed event list as a feed.
pub fn stream_of(events: Vec<CdkEvent>) -> CdkStream {
    Box::pin(stream::iter(events))
}

fn channel_stream<F, Fut>(run: F) -> CdkStream
where
    F: FnOnce(UnboundedSender<CdkEvent>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded();
    tokio::spawn(run(tx));
    Box::pin(rx)
}

fn portal_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("Accept".into(), "*/*".into());
    headers.insert(
        "Accept-Language".into(),
        "en,en-US;q=0.9,zh;q=0.8".into(),
    );
    headers.insert("Cache-Control".into(), "no-cache".into());
    headers.insert("Pragma".into(), "no-cache".into());
    headers.insert(
        "sec-ch-ua".into(),
        "\"Google Chrome\";v=\"143\", \"Chromium\";v=\"143\", \"Not A(Brand\";v=\"24\"".into(),
    );
    headers.insert("sec-ch-ua-mobile".into(), "?0".into());
    headers.insert("sec-ch-ua-platform".into(), "\"macOS\"".into());
    headers.insert(
        "User-Agent".into(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36"
            .into(),
    );
    headers.insert("sec-fetch-dest".into(), "empty".into());
    headers.insert("sec-fetch-mode".into(), "cors".into());
    headers.insert("sec-fetch-site".into(), "same-origin".into());
    headers
}

fn message_of(json: &Value) -> String {
    json.get("message")
        .or_else(|| json.get("msg"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Companion-portal source: a daily check-in plus a prize wheel, both of
/// which hand out redemption codes for the main site's top-up endpoint.
pub fn portal_wheel(ctx: CdkContext) -> CdkStream {
    channel_stream(move |tx| async move {
        let account_name = ctx.account_name.clone();
        if ctx.settings.cookies.is_empty() {
            warn!("{}: portal cookies not found in account cdk settings", account_name);
            let _ = tx.unbounded_send(CdkEvent::Stop(
                "portal cookies not found in account cdk settings".to_string(),
            ));
            return;
        }

        let session = match ApiSession::new(ctx.proxy.as_ref(), ImpersonationProfile::default()) {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.unbounded_send(CdkEvent::Stop(format!("portal session error: {}", e)));
                return;
            }
        };
        if session.add_cookies(PORTAL_ORIGIN, &ctx.settings.cookies).is_err() {
            let _ = tx.unbounded_send(CdkEvent::Stop("invalid portal cookies".to_string()));
            return;
        }
        let mut lang = HashMap::new();
        lang.insert("i18next".to_string(), "en".to_string());
        let _ = session.add_cookies(PORTAL_ORIGIN, &lang);

        let base_headers = portal_headers();

        // Daily check-in first.
        let mut status_headers = base_headers.clone();
        status_headers.insert("Referer".into(), format!("{}/", PORTAL_ORIGIN));
        let mut already_checked_in = false;
        match session
            .get(&format!("{}/api/checkin/status", PORTAL_ORIGIN), &status_headers)
            .await
        {
            Ok(response) if response.status.as_u16() == 200 => {
                if let Some(json) = resolve_json(&response, "portal_checkin_status", &account_name) {
                    if json.get("checked").and_then(|v| v.as_bool()).unwrap_or(false) {
                        info!("{}: portal already checked in today", account_name);
                        already_checked_in = true;
                    }
                }
            }
            Ok(_) | Err(_) => {}
        }

        if !already_checked_in {
            let mut checkin_headers = base_headers.clone();
            checkin_headers.insert("Origin".into(), PORTAL_ORIGIN.into());
            checkin_headers.insert("Referer".into(), format!("{}/", PORTAL_ORIGIN));
            match session
                .post_empty(&format!("{}/api/checkin", PORTAL_ORIGIN), &checkin_headers)
                .await
            {
                Ok(response) if matches!(response.status.as_u16(), 200 | 400) => {
                    if let Some(json) = resolve_json(&response, "portal_checkin", &account_name) {
                        if json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
                            if let Some(code) =
                                json.get("code").and_then(|v| v.as_str()).filter(|c| !c.is_empty())
                            {
                                info!("{}: portal check-in successful, code {}", account_name, code);
                                let _ = tx.unbounded_send(CdkEvent::Code(code.to_string()));
                            }
                        } else {
                            let message = message_of(&json);
                            if message.to_lowercase().contains("already")
                                || message.contains("已经")
                                || message.contains("已签")
                            {
                                info!("{}: portal already checked in today", account_name);
                            } else {
                                warn!("{}: portal check-in failed - {}", account_name, message);
                            }
                        }
                    }
                }
                Ok(response) => {
                    warn!("{}: portal check-in HTTP {}", account_name, response.status);
                }
                Err(e) => {
                    let _ = tx.unbounded_send(CdkEvent::Stop(format!("portal check-in error: {}", e)));
                    return;
                }
            }
        }

        // Then the prize wheel, as long as spins remain.
        let mut wheel_status_headers = base_headers.clone();
        wheel_status_headers.insert("Referer".into(), format!("{}/wheel", PORTAL_ORIGIN));
        let mut remaining: i64 = 0;
        match session
            .get(&format!("{}/api/wheel/status", PORTAL_ORIGIN), &wheel_status_headers)
            .await
        {
            Ok(response) if response.status.as_u16() == 200 => {
                if let Some(json) = resolve_json(&response, "portal_wheel_status", &account_name) {
                    remaining = json.get("remaining").and_then(|v| v.as_i64()).unwrap_or(0);
                    if remaining > 0 {
                        info!("{}: {} wheel spin(s) remaining", account_name, remaining);
                    } else {
                        info!("{}: no wheel spins remaining", account_name);
                    }
                }
            }
            Ok(_) | Err(_) => {}
        }

        let mut wheel_headers = base_headers;
        wheel_headers.insert("Origin".into(), PORTAL_ORIGIN.into());
        wheel_headers.insert("Referer".into(), format!("{}/wheel", PORTAL_ORIGIN));
        let mut spin_count = 0u32;
        while remaining > 0 {
            let response = match session
                .post_empty(&format!("{}/api/wheel", PORTAL_ORIGIN), &wheel_headers)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.unbounded_send(CdkEvent::Stop(format!("wheel spin error: {}", e)));
                    return;
                }
            };
            if !matches!(response.status.as_u16(), 200 | 400) {
                break;
            }
            let Some(json) = resolve_json(&response, "portal_wheel_spin", &account_name) else {
                break;
            };
            if json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
                remaining = json
                    .get("remaining")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(remaining - 1);
                if let Some(code) =
                    json.get("code").and_then(|v| v.as_str()).filter(|c| !c.is_empty())
                {
                    spin_count += 1;
                    info!(
                        "{}: wheel spin #{} successful, code {}, remaining {}",
                        account_name, spin_count, code, remaining
                    );
                    let _ = tx.unbounded_send(CdkEvent::Code(code.to_string()));
                    continue;
                }
                continue;
            }
            let message = message_of(&json);
            if message.to_lowercase().contains("already")
                || message.to_lowercase().contains("no more")
                || message.contains("已经")
                || message.contains("次数")
            {
                info!("{}: no more wheel spins remaining", account_name);
            } else {
                warn!("{}: wheel spin failed - {}", account_name, message);
            }
            break;
        }

        if spin_count > 0 {
            info!("{}: {} code(s) obtained from wheel", account_name, spin_count);
        }
    })
}

/// Bearer-token daily spin whose reward is credited straight to the
/// account; successful rounds yield [`CdkEvent::Skip`] because there is
/// nothing to redeem.
pub fn bearer_spin(ctx: CdkContext) -> CdkStream {
    channel_stream(move |tx| async move {
        let account_name = ctx.account_name.clone();
        let Some(access_token) = ctx.settings.access_token.clone() else {
            warn!("{}: access token not found in account cdk settings", account_name);
            let _ = tx.unbounded_send(CdkEvent::Stop(
                "access token not found in account cdk settings".to_string(),
            ));
            return;
        };

        let session = match ApiSession::new(ctx.proxy.as_ref(), ImpersonationProfile::default()) {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.unbounded_send(CdkEvent::Stop(format!("spin session error: {}", e)));
                return;
            }
        };
        let mut lang = HashMap::new();
        lang.insert("i18next".to_string(), "en".to_string());
        let _ = session.add_cookies(SPIN_ORIGIN, &lang);

        let mut headers = portal_headers();
        headers.insert("Authorization".into(), format!("Bearer {}", access_token));
        headers.insert("Referer".into(), format!("{}/", SPIN_ORIGIN));

        let response = match session
            .get(&format!("{}/api/checkin/status", SPIN_ORIGIN), &headers)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.unbounded_send(CdkEvent::Stop(format!("spin status error: {}", e)));
                return;
            }
        };
        if response.status.as_u16() != 200 {
            let _ = tx.unbounded_send(CdkEvent::Stop(format!(
                "failed to get spin status, HTTP {}",
                response.status
            )));
            return;
        }
        let Some(status) = resolve_json(&response, "spin_status", &account_name) else {
            let _ = tx.unbounded_send(CdkEvent::Stop("invalid spin status response".to_string()));
            return;
        };
        if !status.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            let message = message_of(&status);
            let _ = tx.unbounded_send(CdkEvent::Stop(format!(
                "failed to get spin status: {}",
                if message.is_empty() { "Unknown error".into() } else { message }
            )));
            return;
        }
        if !status.get("can_spin").and_then(|v| v.as_bool()).unwrap_or(false) {
            let today_quota = status
                .get("today_record")
                .and_then(|r| r.get("quota_amount"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            info!(
                "{}: already spun today, today's prize: {}",
                account_name,
                (today_quota as f64 / 500.0 * 100.0).round() / 100.0
            );
            let _ = tx.unbounded_send(CdkEvent::Skip);
            return;
        }

        let mut spin_headers = headers;
        spin_headers.insert("Origin".into(), SPIN_ORIGIN.into());
        spin_headers.insert("Content-Type".into(), "application/json".into());
        let response = match session
            .post_empty(&format!("{}/api/checkin/spin", SPIN_ORIGIN), &spin_headers)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.unbounded_send(CdkEvent::Stop(format!("spin error: {}", e)));
                return;
            }
        };
        if !matches!(response.status.as_u16(), 200 | 400) {
            let _ = tx.unbounded_send(CdkEvent::Stop(format!("spin failed, HTTP {}", response.status)));
            return;
        }
        let Some(json) = resolve_json(&response, "spin", &account_name) else {
            return;
        };
        if json.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            info!("{}: spin successful, {}", account_name, message_of(&json));
            let _ = tx.unbounded_send(CdkEvent::Skip);
            return;
        }
        let message = message_of(&json);
        if message.to_lowercase().contains("already") || message.contains("已签到") {
            info!("{}: already spun today, {}", account_name, message);
            let _ = tx.unbounded_send(CdkEvent::Skip);
            return;
        }
        let _ = tx.unbounded_send(CdkEvent::Stop(format!("spin failed - {}", message)));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn registry_resolves_known_sources_only() {
        assert!(source_by_name("portal_wheel").is_some());
        assert!(source_by_name("bearer_spin").is_some());
        assert!(source_by_name("unknown").is_none());
    }

    #[tokio::test]
    async fn fixed_stream_preserves_order() {
        let mut stream = stream_of(vec![
            CdkEvent::Code("a".to_string()),
            CdkEvent::Skip,
            CdkEvent::Stop("x".to_string()),
        ]);
        assert_eq!(stream.next().await, Some(CdkEvent::Code("a".to_string())));
        assert_eq!(stream.next().await, Some(CdkEvent::Skip));
        assert_eq!(stream.next().await, Some(CdkEvent::Stop("x".to_string())));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn portal_source_stops_without_cookies() {
        let ctx = CdkContext {
            account_name: "test".to_string(),
            settings: CdkSettings::default(),
            proxy: None,
        };
        let mut stream = portal_wheel(ctx);
        match stream.next().await {
            Some(CdkEvent::Stop(error)) => assert!(error.contains("portal cookies")),
            other => panic!("expected stop event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn bearer_source_stops_without_token() {
        let ctx = CdkContext {
            account_name: "test".to_string(),
            settings: CdkSettings::default(),
            proxy: None,
        };
        let mut stream = bearer_spin(ctx);
        match stream.next().await {
            Some(CdkEvent::Stop(error)) => assert!(error.contains("access token")),
            other => panic!("expected stop event, got {:?}", other),
        }
    }
}
