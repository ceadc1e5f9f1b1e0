//! Transparency log lookups
//!
//! A measurement document is only trusted if the transparency log holds an
//! entry for its SHA-256 digest. The log is searched by hash, which returns
//! entry UUIDs in log order. Only the first entry whose recorded hash
//! matches is considered; later entries with the same hash are ignored. The
//! chosen entry must carry the pinned log id and a signed entry timestamp
//! that verifies against the pinned log key.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use constellation_common::{Error, Result};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::signature::PublicKey;

/// Total budget for one transparency check
pub const TRANSPARENCY_TIMEOUT: Duration = Duration::from_secs(30);

/// One log entry as returned by `get-entry-by-uuid`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Base64 of the canonical entry body
    pub body: String,
    /// Unix time the entry was integrated
    pub integrated_time: i64,
    /// Hex SHA-256 of the log's public key
    #[serde(rename = "logID")]
    pub log_id: String,
    /// Position in the log
    pub log_index: i64,
    /// Log signatures over the entry
    pub verification: Option<EntryVerification>,
}

/// Proof material attached to an entry
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryVerification {
    /// Base64 DER signature over the canonical entry payload
    pub signed_entry_timestamp: String,
}

/// Payload the signed entry timestamp covers; field order is canonical
#[derive(Serialize)]
struct SignedPayload<'a> {
    body: &'a str,
    #[serde(rename = "integratedTime")]
    integrated_time: i64,
    #[serde(rename = "logID")]
    log_id: &'a str,
    #[serde(rename = "logIndex")]
    log_index: i64,
}

#[derive(Deserialize)]
struct HashedRekordBody {
    spec: HashedRekordSpec,
}

#[derive(Deserialize)]
struct HashedRekordSpec {
    data: HashedRekordData,
}

#[derive(Deserialize)]
struct HashedRekordData {
    hash: HashedRekordHash,
}

#[derive(Deserialize)]
struct HashedRekordHash {
    algorithm: String,
    value: String,
}

impl LogEntry {
    /// Digest recorded in the entry body, if it is a SHA-256 hashed record
    pub fn recorded_sha256(&self) -> Option<String> {
        let body = STANDARD.decode(&self.body).ok()?;
        let parsed: HashedRekordBody = serde_json::from_slice(&body).ok()?;
        let hash = parsed.spec.data.hash;
        (hash.algorithm == "sha256").then(|| hash.value.to_lowercase())
    }

    /// Check log id and signed entry timestamp against the pinned log key
    pub fn verify(&self, log_key: &PublicKey) -> Result<()> {
        if self.log_id != log_key.log_id() {
            return Err(Error::verification(
                "transparency log",
                format!("entry was logged by unknown log {}", self.log_id),
            ));
        }
        let verification = self.verification.as_ref().ok_or_else(|| {
            Error::verification("transparency log", "entry carries no signed entry timestamp")
        })?;
        let set = STANDARD
            .decode(&verification.signed_entry_timestamp)
            .map_err(|e| {
                Error::verification("transparency log", format!("invalid entry timestamp: {}", e))
            })?;
        let payload = serde_json::to_vec(&SignedPayload {
            body: &self.body,
            integrated_time: self.integrated_time,
            log_id: &self.log_id,
            log_index: self.log_index,
        })
        .map_err(|e| Error::internal_with_context("transparency log", e.to_string()))?;
        log_key.verify(&payload, &set).map_err(|_| {
            Error::verification(
                "transparency log",
                "signed entry timestamp does not verify against pinned log key",
            )
        })
    }
}

/// Transparency log API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransparencyLog: Send + Sync {
    /// UUIDs of entries recording `sha256_hex`, in log order
    async fn search_by_hash(&self, sha256_hex: &str) -> Result<Vec<String>>;

    /// Fetch one entry
    async fn get_entry(&self, uuid: &str) -> Result<LogEntry>;
}

/// Verify that `sha256_hex` is recorded in the log
///
/// The first entry whose recorded hash matches decides the outcome.
pub async fn verify_transparency(
    log: &dyn TransparencyLog,
    log_key: &PublicKey,
    sha256_hex: &str,
) -> Result<()> {
    let check = async {
        let uuids = log.search_by_hash(sha256_hex).await?;
        if uuids.is_empty() {
            return Err(Error::verification(
                "transparency log",
                format!("no entry for sha256:{}", sha256_hex),
            ));
        }

        for uuid in &uuids {
            let entry = log.get_entry(uuid).await?;
            match entry.recorded_sha256() {
                Some(recorded) if recorded == sha256_hex.to_lowercase() => {
                    debug!(uuid = %uuid, log_index = entry.log_index, "Found transparency log entry");
                    if uuids.len() > 1 {
                        warn!(
                            entries = uuids.len(),
                            "Multiple transparency log entries for one hash, using the first"
                        );
                    }
                    return entry.verify(log_key);
                }
                _ => debug!(uuid = %uuid, "Skipping log entry with different hash"),
            }
        }

        Err(Error::verification(
            "transparency log",
            format!("no entry records sha256:{}", sha256_hex),
        ))
    };

    tokio::time::timeout(TRANSPARENCY_TIMEOUT, check)
        .await
        .map_err(|_| {
            Error::transport(
                "transparency log",
                format!("no answer within {:?}", TRANSPARENCY_TIMEOUT),
            )
        })?
}

/// Rekor REST client
pub struct RekorClient {
    base_url: String,
    http: reqwest::Client,
}

impl RekorClient {
    /// Client for the log at `base_url`
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }
}

fn map_reqwest(target: &str, e: reqwest::Error) -> Error {
    Error::transport(target, e.to_string())
}

#[async_trait]
impl TransparencyLog for RekorClient {
    async fn search_by_hash(&self, sha256_hex: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/v1/index/retrieve", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "hash": format!("sha256:{}", sha256_hex) }))
            .send()
            .await
            .map_err(|e| map_reqwest(&url, e))?;
        if !resp.status().is_success() {
            return Err(Error::transport_status(url, resp.status().as_u16()));
        }
        resp.json::<Vec<String>>()
            .await
            .map_err(|e| Error::malformed("transparency log search result", e.to_string()))
    }

    async fn get_entry(&self, uuid: &str) -> Result<LogEntry> {
        let url = format!("{}/api/v1/log/entries/{}", self.base_url, uuid);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| map_reqwest(&url, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("transparency log entry", uuid.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Error::transport_status(url, resp.status().as_u16()));
        }
        let mut entries = resp
            .json::<std::collections::HashMap<String, LogEntry>>()
            .await
            .map_err(|e| Error::malformed("transparency log entry", e.to_string()))?;
        entries
            .remove(uuid)
            .or_else(|| entries.into_values().next())
            .ok_or_else(|| Error::malformed("transparency log entry", "empty response"))
    }
}
