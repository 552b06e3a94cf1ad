use std::env;
use std::time::Duration;

use log::{info, warn};
use serde_json::json;

/// Pushes a text message to the webhook configured via `NOTIFY_WEBHOOK`.
/// A missing webhook silently disables delivery; a failed delivery is
/// logged and swallowed, since notification must never fail a run.
pub async fn push_message(title: &str, content: &str) {
    let Ok(webhook) = env::var("NOTIFY_WEBHOOK") else {
        info!("NOTIFY_WEBHOOK not set, skipping notification");
        return;
    };
    if webhook.is_empty() {
        return;
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to build notification client: {}", e);
            return;
        }
    };

    let body = json!({
        "title": title,
        "content": content,
        "msg_type": "text",
    });

    match client.post(&webhook).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            info!("notification sent: {}", title);
        }
        Ok(response) => {
            warn!("notification webhook returned HTTP {}", response.status());
        }
        Err(e) => {
            warn!("failed to send notification: {}", e);
        }
    }
}
