//! HTTP-backed `RepositoryProvider`: mints installation tokens, detects build
//! profiles, and posts commit statuses against the configured hosting
//! provider. Grounded on `HttpClient`'s retry/backoff idiom (exponential
//! backoff, bounded retry count, structured per-attempt logging) generalized
//! from the Panel's `/api/remote/*` surface to the four repository-provider
//! operations §6 names.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, warn};

use super::errors::{ApiError, ApiResult};
use super::types::{CommitState, CommitStatusRequest, InstallationTokenResponse, ProfileDetectionResponse};
use crate::config::RepositoryProviderConfiguration;

const MAX_RETRIES: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

fn retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: BASE_RETRY_DELAY,
        max_interval: MAX_RETRY_DELAY,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// The four repository-provider operations the core consumes (§6). Mirrors
/// the trait-plus-one-HTTP-implementation shape the daemon uses for its own
/// upstream integration.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Mints an installation-scoped access token for `repo_full_name`.
    /// Returns a short-lived credential; never persisted by the caller.
    async fn mint_installation_token(
        &self,
        installation_id: Option<i64>,
        repo_full_name: &str,
    ) -> ApiResult<String>;

    /// Detects the build-script profiles declared by `repo_full_name` at
    /// `branch`.
    async fn detect_profiles(&self, repo_full_name: &str, branch: &str) -> ApiResult<Vec<String>>;

    /// Posts a commit-status update. Failures here are logged by the caller
    /// and never change a build's outcome (§4.1, §7).
    async fn post_commit_status(
        &self,
        repo_full_name: &str,
        commit_sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> ApiResult<()>;
}

pub struct HttpRepositoryProvider {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpRepositoryProvider {
    pub fn new(config: &RepositoryProviderConfiguration) -> ApiResult<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(30));
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(ApiError::Request)?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !base_url.is_empty() && !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ApiError::InvalidUrl(
                "repository provider base_url must start with http:// or https://".to_string(),
            ));
        }

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Retries a transient failure with the exponential backoff `backoff`
    /// computes, bailing out permanently once `MAX_RETRIES` attempts have
    /// been made or the error is not retryable (§6, §7: `StatusEmissionFailed`
    /// and friends are the caller's problem to swallow, not this layer's).
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<impl Serialize>,
    ) -> ApiResult<T> {
        let url = self.url(path);
        let mut attempt: u32 = 0;

        let outcome = backoff::future::retry(retry_policy(), || async {
            if attempt > 0 {
                debug!(path, attempt, "retrying repository-provider request");
            }
            attempt += 1;

            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", self.auth_header())
                .header("Accept", "application/json")
                .header("Content-Type", "application/json");

            if let Some(ref body) = body {
                request = request.json(body);
            }

            match self.execute_request(request).await {
                Ok(response) => Ok(response),
                Err(e) if e.is_retryable() && attempt <= MAX_RETRIES => {
                    warn!(path, attempt, error = %e, "repository-provider request failed, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await;

        match outcome {
            Ok(response) => self.parse_response(response).await,
            Err(backoff::Error::Permanent(e)) => Err(e),
            Err(backoff::Error::Transient { err, .. }) => Err(ApiError::RetryExhausted(err.to_string())),
        }
    }

    async fn execute_request(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Request(e)
            }
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(ApiError::RateLimited { retry_after });
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Authentication("invalid repository provider token".to_string()));
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound("resource not found".to_string()));
        }

        if status.is_server_error() || status.is_client_error() {
            let message = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ApiError::Server { status: status.as_u16(), message });
        }

        Ok(response)
    }

    async fn parse_response<T: DeserializeOwned>(&self, response: Response) -> ApiResult<T> {
        let text = response.text().await.map_err(ApiError::Request)?;
        serde_json::from_str(&text).map_err(|e| {
            error!(error = %e, body = %text, "failed to parse repository-provider response");
            ApiError::Parse(e)
        })
    }

}

#[async_trait]
impl RepositoryProvider for HttpRepositoryProvider {
    async fn mint_installation_token(
        &self,
        installation_id: Option<i64>,
        repo_full_name: &str,
    ) -> ApiResult<String> {
        let path = match installation_id {
            Some(id) => format!("installations/{}/tokens?repo={}", id, repo_full_name),
            None => format!("tokens?repo={}", repo_full_name),
        };
        let response: InstallationTokenResponse = self.request(Method::POST, &path, None::<()>).await?;
        Ok(response.token)
    }

    async fn detect_profiles(&self, repo_full_name: &str, branch: &str) -> ApiResult<Vec<String>> {
        let path = format!("repos/{}/profiles?branch={}", repo_full_name, branch);
        let response: ProfileDetectionResponse = self.request(Method::GET, &path, None::<()>).await?;
        Ok(response.profiles)
    }

    async fn post_commit_status(
        &self,
        repo_full_name: &str,
        commit_sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> ApiResult<()> {
        let path = format!("repos/{}/commits/{}/status", repo_full_name, commit_sha);
        let body = CommitStatusRequest {
            state: state.as_str(),
            description,
            target_url,
        };
        self.request::<serde_json::Value>(Method::POST, &path, Some(body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> RepositoryProviderConfiguration {
        RepositoryProviderConfiguration {
            base_url: url.to_string(),
            token: "secret-token".to_string(),
            timeout_seconds: Some(30),
        }
    }

    #[test]
    fn url_building_trims_slashes() {
        let provider = HttpRepositoryProvider::new(&config("https://provider.example.com/")).unwrap();
        assert_eq!(provider.url("repos/x"), "https://provider.example.com/repos/x");
        assert_eq!(provider.url("/repos/x"), "https://provider.example.com/repos/x");
    }

    #[test]
    fn auth_header_is_bearer_token() {
        let provider = HttpRepositoryProvider::new(&config("https://provider.example.com")).unwrap();
        assert_eq!(provider.auth_header(), "Bearer secret-token");
    }

    #[test]
    fn retry_policy_starts_at_base_delay_and_caps_below_max() {
        let mut policy = retry_policy();
        assert_eq!(policy.next_backoff(), Some(BASE_RETRY_DELAY));
        for _ in 0..20 {
            if let Some(delay) = policy.next_backoff() {
                assert!(delay <= MAX_RETRY_DELAY);
            }
        }
    }

    #[test]
    fn rejects_url_without_scheme() {
        assert!(HttpRepositoryProvider::new(&config("provider.example.com")).is_err());
    }
}
