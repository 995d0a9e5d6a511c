//! API client for communicating with the operator

use anyhow::{Context, Result};
use operator_lib::{OptimizationPolicy, PolicyKey, PolicySpec};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for the operator's policy endpoints
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

/// Result of a delete request
#[derive(Debug)]
pub enum DeleteOutcome {
    /// Deletion accepted; the operator finalizes after rolling back
    Pending(Box<OptimizationPolicy>),
    /// Object removed immediately
    Removed,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid path")
    }

    pub async fn list_policies(&self) -> Result<Vec<OptimizationPolicy>> {
        let response = self
            .client
            .get(self.url("api/v1/policies")?)
            .send()
            .await
            .context("Failed to send request")?;
        parse(response).await
    }

    /// `None` when the operator has no such policy
    pub async fn get_policy(&self, key: &PolicyKey) -> Result<Option<OptimizationPolicy>> {
        let response = self
            .client
            .get(self.url(&policy_path(key))?)
            .send()
            .await
            .context("Failed to send request")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse(response).await.map(Some)
    }

    pub async fn create_policy(&self, policy: &OptimizationPolicy) -> Result<OptimizationPolicy> {
        let response = self
            .client
            .post(self.url("api/v1/policies")?)
            .json(policy)
            .send()
            .await
            .context("Failed to send request")?;
        parse(response).await
    }

    pub async fn update_policy(
        &self,
        key: &PolicyKey,
        spec: &PolicySpec,
    ) -> Result<OptimizationPolicy> {
        let response = self
            .client
            .put(self.url(&policy_path(key))?)
            .json(spec)
            .send()
            .await
            .context("Failed to send request")?;
        parse(response).await
    }

    pub async fn delete_policy(&self, key: &PolicyKey, force: bool) -> Result<DeleteOutcome> {
        let mut url = self.url(&policy_path(key))?;
        if force {
            url.query_pairs_mut().append_pair("force", "true");
        }
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .context("Failed to send request")?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(DeleteOutcome::Removed);
        }
        parse(response)
            .await
            .map(|policy| DeleteOutcome::Pending(Box::new(policy)))
    }

    pub async fn validate(&self, policy: &OptimizationPolicy) -> Result<ValidationResponse> {
        let response = self
            .client
            .post(self.url("api/v1/validate")?)
            .json(policy)
            .send()
            .await
            .context("Failed to send request")?;
        parse(response).await
    }
}

fn policy_path(key: &PolicyKey) -> String {
    format!("api/v1/policies/{}/{}", key.namespace, key.name)
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) if err.violations.len() > 1 => err.violations.join("; "),
            Ok(err) => err.error,
            Err(_) => body,
        };
        anyhow::bail!("API error ({}): {}", status, message);
    }

    response.json().await.context("Failed to parse response")
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub allowed: bool,
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub violations: Vec<String>,
}
