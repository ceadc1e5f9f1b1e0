//! Cluster identity derived from the master secret
//!
//! ```text
//! owner_id        = SHA256(salt || master_secret)
//! cluster_id      = HKDF-SHA256(master_secret, salt, "cluster-id", 32)
//! state_disk_key  = HKDF-SHA256(master_secret, node_salt, "key", 32)
//! ```
//!
//! The master secret stays on the operator's machine. Only the salt and
//! the derived ids are shared with the cluster.

use std::fmt;

use aws_lc_rs::digest::{Context, SHA256};
use aws_lc_rs::hkdf::{KeyType, Salt, HKDF_SHA256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use constellation_common::state::SECRET_LEN;
use constellation_common::{Error, Result};

/// HKDF info label for the cluster id
pub const CLUSTER_ID_INFO: &[u8] = b"cluster-id";

/// HKDF info label for per-node state disk keys
pub const STATE_DISK_KEY_INFO: &[u8] = b"key";

struct OutLen(usize);

impl KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-SHA256 extract-and-expand into `len` bytes
pub fn hkdf_sha256(secret: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let prk = Salt::new(HKDF_SHA256, salt).extract(secret);
    let info = [info];
    let okm = prk
        .expand(&info, OutLen(len))
        .map_err(|_| Error::internal_with_context("hkdf", format!("cannot expand {} bytes", len)))?;
    let mut out = vec![0u8; len];
    okm.fill(&mut out)
        .map_err(|_| Error::internal_with_context("hkdf", "fill failed"))?;
    Ok(out)
}

/// 32 bytes from the system RNG
pub fn generate_secret() -> Result<[u8; SECRET_LEN]> {
    let mut buf = [0u8; SECRET_LEN];
    aws_lc_rs::rand::fill(&mut buf)
        .map_err(|_| Error::internal_with_context("rng", "system RNG unavailable"))?;
    Ok(buf)
}

fn to_array(v: Vec<u8>) -> Result<[u8; SECRET_LEN]> {
    v.try_into()
        .map_err(|_| Error::internal_with_context("hkdf", "unexpected output length"))
}

/// Master secret plus the salt its identities are derived with
#[derive(Clone, PartialEq, Eq)]
pub struct MasterSecret {
    key: [u8; SECRET_LEN],
    salt: [u8; SECRET_LEN],
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterSecret")
            .field("key", &"[REDACTED]")
            .field("salt", &hex::encode(self.salt))
            .finish()
    }
}

impl MasterSecret {
    /// Fresh secret and salt
    pub fn generate() -> Result<Self> {
        Ok(Self {
            key: generate_secret()?,
            salt: generate_secret()?,
        })
    }

    /// Existing secret with an existing salt
    pub fn from_parts(key: [u8; SECRET_LEN], salt: [u8; SECRET_LEN]) -> Self {
        Self { key, salt }
    }

    /// Existing secret with a freshly generated salt
    pub fn with_new_salt(key: [u8; SECRET_LEN]) -> Result<Self> {
        Ok(Self {
            key,
            salt: generate_secret()?,
        })
    }

    /// Raw key bytes, for persisting to the master secret file
    pub fn key(&self) -> &[u8; SECRET_LEN] {
        &self.key
    }

    /// Measurement salt
    pub fn salt(&self) -> &[u8; SECRET_LEN] {
        &self.salt
    }

    /// `SHA256(salt || master_secret)`
    pub fn owner_id(&self) -> [u8; SECRET_LEN] {
        let mut ctx = Context::new(&SHA256);
        ctx.update(&self.salt);
        ctx.update(&self.key);
        let mut out = [0u8; SECRET_LEN];
        out.copy_from_slice(ctx.finish().as_ref());
        out
    }

    /// HKDF of the master secret under the measurement salt
    pub fn cluster_id(&self) -> Result<[u8; SECRET_LEN]> {
        to_array(hkdf_sha256(&self.key, &self.salt, CLUSTER_ID_INFO, SECRET_LEN)?)
    }

    /// State disk key of the node identified by `node_salt`
    pub fn state_disk_key(&self, node_salt: &[u8]) -> Result<[u8; SECRET_LEN]> {
        to_array(hkdf_sha256(&self.key, node_salt, STATE_DISK_KEY_INFO, SECRET_LEN)?)
    }

    /// Owner and cluster id as base64, the form they are extended into PCRs with
    pub fn identity_b64(&self) -> Result<(String, String)> {
        Ok((
            STANDARD.encode(self.owner_id()),
            STANDARD.encode(self.cluster_id()?),
        ))
    }
}
