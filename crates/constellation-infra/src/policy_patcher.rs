//! Attestation policy of the Microsoft Azure Attestation provider
//!
//! Clusters on `azure-sev-snp` get their own MAA provider. Its default
//! policy is replaced right after apply with an unsigned JWS:
//!
//! ```text
//! base64url({"alg":"none"}) . base64url({"AttestationPolicy": base64url(policy)}) .
//! ```

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use constellation_common::retry::{retry_with_backoff, RetryConfig};
use constellation_common::{BackendStep, CloudProvider, Error, Result};

/// Token audience of the attestation service
pub const ATTESTATION_RESOURCE: &str = "https://attest.azure.net";

/// Policy API version
pub const POLICY_API_VERSION: &str = "2020-10-01";

/// Policy text for the `AzureGuest` attestation type
pub fn azure_guest_policy(secure_boot: bool) -> String {
    let secure_boot_rule = if secure_boot {
        "    [type==\"secureboot\", value==false] => deny();\n"
    } else {
        ""
    };
    format!(
        "version= 1.0;\n\
         authorizationrules\n\
         {{\n    \
         [type==\"x-ms-azurevm-default-securebootkeysvalidated\", value==false] => deny();\n    \
         [type==\"x-ms-azurevm-debuggersdisabled\", value==false] => deny();\n\
         {}    \
         [type==\"x-ms-azurevm-signingdisabled\", value==false] => deny();\n    \
         [type==\"x-ms-azurevm-dbvalidated\", value==false] => deny();\n    \
         [type==\"x-ms-azurevm-dbxvalidated\", value==false] => deny();\n    \
         => permit();\n\
         }};\n",
        secure_boot_rule
    )
}

/// Unsigned JWS carrying `policy`
pub fn encode_policy_jws(policy: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let body = json!({ "AttestationPolicy": URL_SAFE_NO_PAD.encode(policy) }).to_string();
    format!("{}.{}.", header, URL_SAFE_NO_PAD.encode(body))
}

/// URL the policy is PUT to
pub fn policy_url(attestation_url: &str) -> String {
    format!(
        "{}/policies/AzureGuest?api-version={}",
        attestation_url.trim_end_matches('/'),
        POLICY_API_VERSION
    )
}

/// Bearer tokens for the attestation service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Token valid for `resource`
    async fn token(&self, resource: &str) -> Result<String>;
}

/// Tokens from the logged in Azure CLI
#[derive(Clone, Debug, Default)]
pub struct AzureCliTokenProvider;

#[async_trait]
impl AccessTokenProvider for AzureCliTokenProvider {
    async fn token(&self, resource: &str) -> Result<String> {
        let output = Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                resource,
                "--query",
                "accessToken",
                "--output",
                "tsv",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::config_validation(format!("running az: {}", e)))?;
        if !output.status.success() {
            return Err(Error::config_validation(format!(
                "az account get-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// PUT of a policy document
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyEndpoint: Send + Sync {
    /// Send `jws` to `url` with `token`
    async fn put(&self, url: &str, token: &str, jws: &str) -> Result<()>;
}

/// [`PolicyEndpoint`] backed by reqwest
pub struct ReqwestPolicyEndpoint {
    client: reqwest::Client,
}

impl ReqwestPolicyEndpoint {
    /// Wrap an existing client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PolicyEndpoint for ReqwestPolicyEndpoint {
    async fn put(&self, url: &str, token: &str, jws: &str) -> Result<()> {
        let resp = self
            .client
            .put(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(jws.to_string())
            .send()
            .await
            .map_err(|e| Error::transport(url, e.to_string()))?;
        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::transport_status(url, status.as_u16()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::cloud_backend(
                BackendStep::Apply,
                CloudProvider::Azure,
                format!("attestation policy update returned {}: {}", status, body),
            ));
        }
        Ok(())
    }
}

/// Replaces the policy of a freshly created attestation provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyPatcher: Send + Sync {
    /// Patch the provider at `attestation_url`
    async fn patch(&self, attestation_url: &str, cancel: &CancellationToken) -> Result<()>;
}

/// [`PolicyPatcher`] for Microsoft Azure Attestation
pub struct AzurePolicyPatcher {
    tokens: Arc<dyn AccessTokenProvider>,
    endpoint: Arc<dyn PolicyEndpoint>,
    policy: String,
    retry: RetryConfig,
}

impl AzurePolicyPatcher {
    /// Patcher writing `policy`
    pub fn new(
        tokens: Arc<dyn AccessTokenProvider>,
        endpoint: Arc<dyn PolicyEndpoint>,
        policy: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            endpoint,
            policy: policy.into(),
            retry: RetryConfig::network(),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl PolicyPatcher for AzurePolicyPatcher {
    async fn patch(&self, attestation_url: &str, cancel: &CancellationToken) -> Result<()> {
        if attestation_url.is_empty() {
            return Err(Error::internal_with_context(
                "patch_attestation_policy",
                "no attestation URL in the IaC outputs",
            ));
        }
        let token = self.tokens.token(ATTESTATION_RESOURCE).await?;
        let url = policy_url(attestation_url);
        let jws = encode_policy_jws(&self.policy);
        retry_with_backoff(&self.retry, "patch_attestation_policy", cancel, || {
            self.endpoint.put(&url, &token, &jws)
        })
        .await?;
        info!(url = %attestation_url, "Attestation policy patched");
        Ok(())
    }
}
