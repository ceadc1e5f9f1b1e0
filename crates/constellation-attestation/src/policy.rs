//! Per-cluster attestation policy
//!
//! A policy starts from the measurements of an image and is then bound to
//! one cluster by extending the owner and cluster id into their PCRs, the
//! same way a node extends them once it has been initialized:
//!
//! ```text
//! expected' = SHA256(expected || SHA256(input))
//! ```
//!
//! PCRs absent from the policy are not checked by verifiers.

use std::collections::BTreeMap;

use aws_lc_rs::digest::{digest, Context, SHA256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use constellation_common::{AttestationVariant, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::MasterSecret;
use crate::measurements::{
    decode_pcr_value, Measurement, MeasurementBundle, Measurements, PCR_INDEX_CLUSTER_ID,
    PCR_INDEX_OWNER_ID, PCR_LEN,
};

/// Expected PCR values for one cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttestationPolicy {
    /// Variant the policy applies to
    pub variant: AttestationVariant,
    /// Expectations by PCR index
    pub measurements: Measurements,
}

#[derive(Deserialize)]
struct RawPolicy {
    variant: AttestationVariant,
    measurements: BTreeMap<u32, RawEntry>,
}

#[derive(Deserialize)]
struct RawEntry {
    expected: String,
    #[serde(default, alias = "warnOnly")]
    warn_only: bool,
}

impl AttestationPolicy {
    /// Policy holding every measurement of `bundle`
    pub fn from_bundle(bundle: &MeasurementBundle) -> Self {
        Self {
            variant: bundle.variant,
            measurements: bundle.measurements.clone(),
        }
    }

    /// Canonical JSON: keys sorted, values hex encoded
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::internal_with_context("attestation policy", e.to_string()))
    }

    /// Parse canonical JSON; any value that is not 32 bytes is rejected
    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: RawPolicy = serde_json::from_str(raw)
            .map_err(|e| Error::malformed("attestation policy", e.to_string()))?;
        let mut measurements = Measurements::new();
        for (index, entry) in parsed.measurements {
            let expected = decode_pcr_value(&entry.expected).map_err(|e| {
                Error::verification("attestation policy", format!("PCR[{}]: {}", index, e))
            })?;
            measurements.insert(
                index,
                Measurement {
                    expected,
                    warn_only: entry.warn_only,
                },
            );
        }
        Ok(Self {
            variant: parsed.variant,
            measurements,
        })
    }

    /// Extend PCR `index` with base64 `input`; empty input removes the PCR
    pub fn extend(&mut self, index: u32, input_b64: &str) -> Result<()> {
        if input_b64.is_empty() {
            self.measurements.remove(&index);
            return Ok(());
        }
        let data = STANDARD.decode(input_b64).map_err(|e| {
            Error::config_validation(format!("PCR[{}] input is not base64: {}", index, e))
        })?;
        self.extend_raw(index, &data);
        Ok(())
    }

    /// Extend PCR `index` with raw bytes; an absent PCR starts at zero
    pub fn extend_raw(&mut self, index: u32, data: &[u8]) {
        let hashed = digest(&SHA256, data);
        let old = self.measurements.get(&index).copied();
        let mut ctx = Context::new(&SHA256);
        ctx.update(&old.map(|m| m.expected).unwrap_or([0u8; PCR_LEN]));
        ctx.update(hashed.as_ref());
        let mut expected = [0u8; PCR_LEN];
        expected.copy_from_slice(ctx.finish().as_ref());
        self.measurements.insert(
            index,
            Measurement {
                expected,
                warn_only: old.map(|m| m.warn_only).unwrap_or(false),
            },
        );
    }

    /// Every PCR the bundle enforces must still be present
    pub fn validate_against(&self, bundle: &MeasurementBundle) -> Result<()> {
        if self.variant != bundle.variant {
            return Err(Error::verification(
                "attestation policy",
                format!(
                    "policy is for {}, measurements are for {}",
                    self.variant, bundle.variant
                ),
            ));
        }
        let missing: Vec<String> = bundle
            .enforced_indices()
            .filter(|i| !self.measurements.contains_key(i))
            .map(|i| i.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::verification(
                "attestation policy",
                format!("enforced PCRs missing from policy: {}", missing.join(", ")),
            ));
        }
        Ok(())
    }

    /// Indices a verifier will not check
    pub fn unchecked_indices<'a>(
        &'a self,
        bundle: &'a MeasurementBundle,
    ) -> impl Iterator<Item = u32> + 'a {
        bundle
            .measurements
            .keys()
            .copied()
            .filter(|i| !self.measurements.contains_key(i))
    }
}

/// Builds the policy of one cluster from image measurements
pub struct AttestationConfigBuilder<'a> {
    bundle: &'a MeasurementBundle,
    identity: Option<(String, String)>,
}

impl<'a> AttestationConfigBuilder<'a> {
    /// Start from the measurements of an image
    pub fn new(bundle: &'a MeasurementBundle) -> Self {
        Self {
            bundle,
            identity: None,
        }
    }

    /// Bind to an owner and cluster id (base64)
    pub fn with_identity(mut self, owner_id_b64: impl Into<String>, cluster_id_b64: impl Into<String>) -> Self {
        self.identity = Some((owner_id_b64.into(), cluster_id_b64.into()));
        self
    }

    /// Bind to the identity derived from `secret`
    pub fn with_master_secret(self, secret: &MasterSecret) -> Result<Self> {
        let (owner, cluster) = secret.identity_b64()?;
        Ok(self.with_identity(owner, cluster))
    }

    /// Build and validate the policy
    pub fn build(self) -> Result<AttestationPolicy> {
        let mut policy = AttestationPolicy::from_bundle(self.bundle);
        if let Some((owner, cluster)) = &self.identity {
            policy.extend(PCR_INDEX_OWNER_ID, owner)?;
            policy.extend(PCR_INDEX_CLUSTER_ID, cluster)?;
        }
        policy.validate_against(self.bundle)?;
        for index in policy.unchecked_indices(self.bundle) {
            debug!(pcr = index, "PCR will not be checked");
        }
        Ok(policy)
    }
}
