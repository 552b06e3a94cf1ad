use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde_json::Value;

use crate::notify;

const SECRETS_API: &str = "https://prod.api.stepsecurity.io/v1/secrets";
const POLL_BACKOFF: Duration = Duration::from_secs(9);

/// One secret to request interactively, e.g. a 2FA one-time code.
pub struct SecretRequest {
    pub key: &'static str,
    pub name: String,
    pub description: String,
}

/// Client for the external secret-exchange service used to hand one-time
/// codes into a headless CI run. Only works inside GitHub Actions, where
/// an OIDC token is mintable; anywhere else `get` returns `None` fast and
/// the caller falls back to a manual wait.
pub struct WaitForSecrets {
    client: reqwest::Client,
}

impl WaitForSecrets {
    pub fn new() -> WaitForSecrets {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        WaitForSecrets { client }
    }

    async fn oidc_token(&self) -> Option<String> {
        let request_token = env::var("ACTIONS_ID_TOKEN_REQUEST_TOKEN").ok()?;
        let request_url = env::var("ACTIONS_ID_TOKEN_REQUEST_URL").ok()?;

        let audience_url = format!("{}&audience=api://ActionsOIDCGateway/Certify", request_url);
        let response = self
            .client
            .get(&audience_url)
            .header("Authorization", format!("Bearer {}", request_token))
            .header("Accept", "application/json; api-version=2.0")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            warn!("failed to get OIDC token: HTTP {}", response.status());
            return None;
        }
        let body: Value = response.json().await.ok()?;
        body.get("value").and_then(|v| v.as_str()).map(|s| s.to_string())
    }

    fn secret_input_url() -> Option<String> {
        let repository = env::var("GITHUB_REPOSITORY").ok()?;
        let run_id = env::var("GITHUB_RUN_ID").ok()?;
        let (owner, repo) = repository.split_once('/')?;
        Some(format!(
            "https://app.stepsecurity.io/secrets/{}/{}/{}",
            owner, repo, run_id
        ))
    }

    /// Registers the secret request, notifies the operator with the input
    /// URL, polls until the secrets are provided or `timeout` elapses,
    /// then clears them from the datastore.
    pub async fn get(
        &self,
        requests: &[SecretRequest],
        timeout: Duration,
        notification_title: &str,
        notification_content: &str,
    ) -> Option<HashMap<String, String>> {
        let secret_url = match Self::secret_input_url() {
            Some(url) => url,
            None => {
                info!("not running in a CI environment, secret exchange unavailable");
                return None;
            }
        };

        let token = self.oidc_token().await?;

        let mut payload: Vec<String> = Vec::new();
        for request in requests {
            payload.push(format!("{}:", request.key));
            payload.push(format!("name: {}", request.name));
            payload.push(format!("description: {}", request.description));
        }

        let register = self
            .client
            .put(SECRETS_API)
            .header("Authorization", format!("Bearer {}", token))
            .json(&payload)
            .send()
            .await
            .ok()?;
        if !register.status().is_success() {
            warn!("failed to register secret request: HTTP {}", register.status());
            return None;
        }
        info!("secret request registered, input URL: {}", secret_url);

        let content = format!(
            "{}\nPlease visit this URL to input secrets within {} minute(s):\n{}",
            notification_content,
            timeout.as_secs() / 60,
            secret_url
        );
        notify::push_message(notification_title, &content).await;

        let deadline = Instant::now() + timeout;
        let mut secrets = None;
        while Instant::now() < deadline {
            let Some(token) = self.oidc_token().await else {
                break;
            };
            let response = match self
                .client
                .get(SECRETS_API)
                .header("Authorization", format!("Bearer {}", token))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("secret polling error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if response.status().is_success() {
                if let Ok(body) = response.json::<Value>().await {
                    if body.get("areSecretsSet").and_then(|v| v.as_bool()).unwrap_or(false) {
                        let mut values = HashMap::new();
                        if let Some(items) = body.get("secrets").and_then(|v| v.as_array()) {
                            for item in items {
                                if let (Some(name), Some(value)) = (
                                    item.get("Name").and_then(|v| v.as_str()),
                                    item.get("Value").and_then(|v| v.as_str()),
                                ) {
                                    values.insert(name.to_string(), value.to_string());
                                }
                            }
                        }
                        info!("secrets received: {:?}", values.keys().collect::<Vec<_>>());
                        secrets = Some(values);
                        break;
                    }
                }
                tokio::time::sleep(POLL_BACKOFF).await;
            } else {
                let body = response.text().await.unwrap_or_default();
                // "Token used before issued" means the OIDC token is not
                // valid yet; anything else ends the wait.
                if body != "Token used before issued" {
                    warn!("unexpected secret poll response: {}", body);
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        if secrets.is_none() {
            warn!("timed out waiting for secrets, input URL was {}", secret_url);
        }

        if let Some(token) = self.oidc_token().await {
            let cleared = self
                .client
                .delete(SECRETS_API)
                .header("Authorization", format!("Bearer {}", token))
                .send()
                .await;
            match cleared {
                Ok(r) if r.status().is_success() => info!("secrets cleared from datastore"),
                Ok(r) => warn!("failed to clear secrets: HTTP {}", r.status()),
                Err(e) => warn!("failed to clear secrets: {}", e),
            }
        }

        secrets
    }
}
