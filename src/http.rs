use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use url::Url;

use crate::config::ProxyConfig;
use crate::headers::ImpersonationProfile;
use crate::utils::save_text_artifact;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum NetworkError {
    Reqwest(reqwest::Error),
    UrlParse(url::ParseError),
    InvalidProxy(String),
    InvalidHeader(String),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Reqwest(e) => write!(f, "HTTP request error: {}", e),
            NetworkError::UrlParse(e) => write!(f, "URL parsing error: {}", e),
            NetworkError::InvalidProxy(p) => write!(f, "Invalid proxy configuration: {}", p),
            NetworkError::InvalidHeader(h) => write!(f, "Invalid header: {}", h),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> NetworkError {
        NetworkError::Reqwest(err)
    }
}

impl From<url::ParseError> for NetworkError {
    fn from(err: url::ParseError) -> NetworkError {
        NetworkError::UrlParse(err)
    }
}

/// Response snapshot with the pieces the callers interpret: status, body
/// text, and cookies the server set on this exchange.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub text: String,
    pub cookies: Vec<(String, String)>,
}

impl ApiResponse {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.text).ok()
    }
}

/// One provider-scoped HTTP session: cookie jar, proxy, impersonation
/// profile. Owned by a single authentication-method attempt and dropped
/// with it; never shared across accounts.
pub struct ApiSession {
    client: Client,
    jar: Arc<Jar>,
    profile: ImpersonationProfile,
}

impl ApiSession {
    pub fn new(
        proxy: Option<&ProxyConfig>,
        profile: ImpersonationProfile,
    ) -> Result<ApiSession, NetworkError> {
        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .cookie_provider(jar.clone())
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy_config) = proxy {
            if let Some(proxy_url) = proxy_config.to_url() {
                let proxy = reqwest::Proxy::all(&proxy_url)
                    .map_err(|_| NetworkError::InvalidProxy(proxy_config.server.clone()))?;
                builder = builder.proxy(proxy);
            }
        }

        debug!("building HTTP session with impersonation profile {}", profile.as_str());
        Ok(ApiSession { client: builder.build()?, jar, profile })
    }

    pub fn profile(&self) -> ImpersonationProfile {
        self.profile
    }

    /// Loads cookies into the jar, scoped to `origin`.
    pub fn add_cookies(&self, origin: &str, cookies: &HashMap<String, String>) -> Result<(), NetworkError> {
        let url = Url::parse(origin)?;
        for (name, value) in cookies {
            self.jar.add_cookie_str(&format!("{}={}", name, value), &url);
        }
        Ok(())
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ApiResponse, NetworkError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .headers(to_header_map(headers)?)
            .send()
            .await?;
        info!("[TIMING] GET {} took {:.2?}", url, start.elapsed());
        snapshot(response).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) -> Result<ApiResponse, NetworkError> {
        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .headers(to_header_map(headers)?)
            .json(body)
            .send()
            .await?;
        info!("[TIMING] POST {} took {:.2?}", url, start.elapsed());
        snapshot(response).await
    }

    /// POST with an empty body, as the check-in endpoints expect.
    pub async fn post_empty(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ApiResponse, NetworkError> {
        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .headers(to_header_map(headers)?)
            .send()
            .await?;
        info!("[TIMING] POST {} took {:.2?}", url, start.elapsed());
        snapshot(response).await
    }
}

async fn snapshot(response: reqwest::Response) -> Result<ApiResponse, NetworkError> {
    let status = response.status();
    let cookies = response
        .cookies()
        .map(|c| (c.name().to_string(), c.value().to_string()))
        .collect();
    let text = response.text().await?;
    Ok(ApiResponse { status, text, cookies })
}

fn to_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, NetworkError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| NetworkError::InvalidHeader(name.clone()))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| NetworkError::InvalidHeader(name.clone()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Parses a response body as JSON; a non-JSON body is saved to `logs/`
/// for diagnosis and `None` is returned so the caller can degrade.
pub fn resolve_json(response: &ApiResponse, context: &str, account_name: &str) -> Option<Value> {
    match response.json() {
        Some(value) => Some(value),
        None => {
            warn!(
                "{}: non-JSON response for {} (HTTP {}), saving body",
                account_name, context, response.status
            );
            let extension = if response.text.contains("<html") { "html" } else { "txt" };
            save_text_artifact(account_name, context, extension, &response.text);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_conversion_keeps_dynamic_keys() {
        let mut headers = HashMap::new();
        headers.insert("new-api-user".to_string(), "42".to_string());
        headers.insert("User-Agent".to_string(), "test".to_string());
        let map = to_header_map(&headers).unwrap();
        assert_eq!(map.get("new-api-user").unwrap(), "42");
        assert_eq!(map.get("user-agent").unwrap(), "test");
    }

    #[test]
    fn json_snapshot_parses_body() {
        let response = ApiResponse {
            status: StatusCode::BAD_REQUEST,
            text: "{\"ret\":1}".to_string(),
            cookies: vec![("session".to_string(), "abc".to_string())],
        };
        assert_eq!(response.json().unwrap()["ret"], 1);
    }
}
