use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::Duration;

use crate::constants;
use crate::error::{AppError, AppResult};
use crate::modules::config;
use crate::proxy::rate_limit::RateLimiter;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    // The auth endpoint may rotate the refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaInfo {
    #[serde(rename = "remainingFraction")]
    pub remaining_fraction: Option<f64>,
    #[serde(rename = "resetTime")]
    pub reset_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableModel {
    #[serde(rename = "quotaInfo")]
    pub quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Deserialize)]
struct AvailableModelsResponse {
    #[serde(default)]
    models: HashMap<String, AvailableModel>,
}

#[derive(Debug, Deserialize)]
struct LoadCodeAssistResponse {
    #[serde(rename = "cloudaicompanionProject")]
    project_id: Option<String>,
}

// Stateless transport for the upstream operations. Endpoint URLs are
// injectable so tests can point at a local mock.
pub struct UpstreamClient {
    client: Client,
    token_url: String,
    userinfo_url: String,
    cloudcode_base: String,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self::with_base_urls(
            constants::OAUTH_TOKEN_URL,
            constants::USERINFO_URL,
            constants::CLOUD_CODE_BASE_URL,
        )
    }

    pub fn with_base_urls(token_url: &str, userinfo_url: &str, cloudcode_base: &str) -> Self {
        Self {
            client: Self::build_client(),
            token_url: token_url.to_string(),
            userinfo_url: userinfo_url.to_string(),
            cloudcode_base: cloudcode_base.to_string(),
        }
    }

    fn build_client() -> Client {
        Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(constants::USER_AGENT.as_str())
            .build()
            .expect("Failed to create upstream HTTP client")
    }

    fn build_url(&self, method: &str, query_string: Option<&str>) -> String {
        match query_string {
            Some(qs) if !qs.is_empty() => format!("{}:{}?{}", self.cloudcode_base, method, qs),
            _ => format!("{}:{}", self.cloudcode_base, method),
        }
    }

    // Exchange a refresh token for fresh credentials. Any non-2xx from the
    // auth endpoint (and any transport failure) surfaces as refresh_failed.
    pub async fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenResponse> {
        let client_id = config::oauth_client_id().map_err(AppError::Config)?;
        let mut params: Vec<(&str, String)> = vec![
            ("client_id", client_id),
            ("refresh_token", refresh_token.to_string()),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(secret) = config::oauth_client_secret() {
            params.push(("client_secret", secret));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::RefreshFailed(format!("token endpoint unreachable: {}", e)))?;

        if response.status().is_success() {
            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| AppError::RefreshFailed(format!("token response parse failed: {}", e)))
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AppError::RefreshFailed(format!(
                "token endpoint returned {}: {}",
                status, body
            )))
        }
    }

    pub async fn fetch_user_info(
        &self,
        access_token: &str,
        limiter: Option<&RateLimiter>,
    ) -> AppResult<UserInfo> {
        if let Some(limiter) = limiter {
            limiter.wait().await;
        }
        let response = self
            .client
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json::<UserInfo>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AppError::Account(format!(
                "userinfo returned {}: {}",
                status, body
            )))
        }
    }

    // Resolve the backend project id via loadCodeAssist. Retries transient
    // failures (5xx, network) with a fixed backoff; a 4xx is terminal.
    pub async fn fetch_project_id(
        &self,
        access_token: &str,
        limiter: Option<&RateLimiter>,
        max_attempts: u32,
    ) -> AppResult<String> {
        let url = self.build_url("loadCodeAssist", None);
        let body = serde_json::json!({ "metadata": { "ideType": "ANTIGRAVITY" } });
        let max_attempts = max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if let Some(limiter) = limiter {
                limiter.wait().await;
            }
            match self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response.json::<LoadCodeAssistResponse>().await;
                        match parsed {
                            Ok(data) => match data.project_id {
                                Some(id) if !id.is_empty() => return Ok(id),
                                _ => {
                                    last_error = "loadCodeAssist returned no project".to_string();
                                }
                            },
                            Err(e) => {
                                last_error = format!("loadCodeAssist parse failed: {}", e);
                            }
                        }
                    } else if status.is_client_error() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(AppError::ProjectIdUnresolved(format!(
                            "loadCodeAssist returned {}: {}",
                            status, text
                        )));
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        last_error = format!("loadCodeAssist returned {}: {}", status, text);
                        tracing::warn!(
                            attempt,
                            max_attempts,
                            status = status.as_u16(),
                            "loadCodeAssist failed"
                        );
                    }
                }
                Err(e) => {
                    last_error = format!("loadCodeAssist network error: {}", e);
                    tracing::warn!(attempt, max_attempts, error = %e, "loadCodeAssist network error");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(Duration::from_millis(constants::PROJECT_ID_RETRY_DELAY_MS))
                    .await;
            }
        }

        Err(AppError::ProjectIdUnresolved(last_error))
    }

    // Canonical source for quota observations. Missing quota fields degrade
    // to "unknown" on the caller side, never to errors here.
    pub async fn fetch_available_models(
        &self,
        access_token: &str,
        limiter: Option<&RateLimiter>,
    ) -> AppResult<HashMap<String, AvailableModel>> {
        if let Some(limiter) = limiter {
            limiter.wait().await;
        }
        let url = self.build_url("fetchAvailableModels", None);
        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        if response.status().is_success() {
            let parsed: AvailableModelsResponse = response.json().await?;
            Ok(parsed.models)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AppError::Account(format!(
                "fetchAvailableModels returned {}: {}",
                status, body
            )))
        }
    }

    // Raw v1internal exchange. Does not interpret the response status; 429
    // policy belongs to the dispatcher.
    pub async fn call_v1_internal(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query_string: Option<&str>,
        extra_headers: &HashMap<String, String>,
        limiter: Option<&RateLimiter>,
    ) -> AppResult<Response> {
        if let Some(limiter) = limiter {
            limiter.wait().await;
        }
        let url = self.build_url(method, query_string);
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        Ok(request.json(body).send().await?)
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

// Convenience check used by the dispatcher's disposition logic.
pub fn is_rate_limited_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
}
