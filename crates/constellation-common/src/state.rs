//! Persisted cluster identity files
//!
//! `constellation-state.json` records how to reach the cluster after
//! `create`; `constellation-mastersecret.base64` holds the root secret all
//! cluster identities are derived from. Both are written atomically.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::fs::atomic_write;
use crate::provider::CloudProvider;
use crate::{Error, Result};

/// Length of the master secret and the measurement salt
pub const SECRET_LEN: usize = 32;

mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Identity of a created cluster
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdFile {
    /// Provider hosting the cluster
    pub cloud_provider: CloudProvider,
    /// Host or IP of the API server / init endpoint
    pub cluster_endpoint: String,
    /// Unique id the IaC backend assigned to the cluster resources
    pub uid: String,
    /// Secret required to initialise the first control plane node
    #[serde(rename = "init_secret_b64", with = "b64")]
    pub init_secret: Vec<u8>,
    /// Azure attestation provider URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_url: Option<String>,
    /// Salt used for cluster id derivation
    #[serde(
        default,
        rename = "measurement_salt_b64",
        with = "b64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub measurement_salt: Option<Vec<u8>>,
    /// Hex encoded owner id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Hex encoded cluster id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl std::fmt::Debug for IdFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdFile")
            .field("cloud_provider", &self.cloud_provider)
            .field("cluster_endpoint", &self.cluster_endpoint)
            .field("uid", &self.uid)
            .field("init_secret", &"[REDACTED]")
            .field("attestation_url", &self.attestation_url)
            .field("owner_id", &self.owner_id)
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}

impl IdFile {
    /// Read from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| Error::io("read_id_file", path, e))?;
        serde_json::from_slice(&raw).map_err(|e| {
            Error::config_validation(format!("parsing {}: {}", path.display(), e))
        })
    }

    /// Write to `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            Error::internal_with_context("write_id_file", format!("serializing: {}", e))
        })?;
        atomic_write(path, &json)
    }
}

/// Write the master secret file
pub fn save_master_secret(path: &Path, secret: &[u8]) -> Result<()> {
    if secret.len() != SECRET_LEN {
        return Err(Error::internal_with_context(
            "save_master_secret",
            format!("master secret must be {} bytes, got {}", SECRET_LEN, secret.len()),
        ));
    }
    atomic_write(path, STANDARD.encode(secret).as_bytes())
}

/// Read the master secret file, `None` if it does not exist
pub fn load_master_secret(path: &Path) -> Result<Option<[u8; SECRET_LEN]>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io("load_master_secret", path, e)),
    };
    let decoded = STANDARD.decode(raw.trim()).map_err(|e| {
        Error::config_validation(format!("{} is not valid base64: {}", path.display(), e))
    })?;
    let secret: [u8; SECRET_LEN] = decoded.as_slice().try_into().map_err(|_| {
        Error::config_validation(format!(
            "{} must contain {} bytes, got {}",
            path.display(),
            SECRET_LEN,
            decoded.len()
        ))
    })?;
    Ok(Some(secret))
}
