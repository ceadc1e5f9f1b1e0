//! Join service contract: verifying a node and handing out its secrets
//!
//! A joining node presents attestation evidence. The PCR values extracted
//! from it are checked against the policy in the join configuration. On
//! success the node receives its state disk key, the cluster identities and
//! a bootstrap token for kubeadm.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use rand::Rng;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use constellation_attestation::measurements::PCR_LEN;
use constellation_attestation::MasterSecret;
use constellation_common::state::SECRET_LEN;
use constellation_common::{AttestationVariant, Error, Result};

use crate::join_config::read_join_config;
use crate::store::ClusterStore;

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Extracts PCR values from hardware specific evidence
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EvidenceVerifier: Send + Sync {
    /// Check the evidence signature chain and return the PCR values it attests
    async fn verify(
        &self,
        variant: AttestationVariant,
        evidence: &[u8],
    ) -> Result<BTreeMap<u32, [u8; PCR_LEN]>>;
}

/// Role a node asks to join as
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Runs the Kubernetes control plane
    ControlPlane,
    /// Runs workloads
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => f.write_str("control-plane"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// What a joining node presents
#[derive(Clone, Debug)]
pub struct ActivationRequest {
    /// UUID of the node's state disk; salts its key
    pub disk_uuid: String,
    /// Raw attestation evidence
    pub evidence: Vec<u8>,
    /// Requested role
    pub role: NodeRole,
}

/// What a verified node receives
#[derive(Clone)]
pub struct ActivationResponse {
    /// Key of the node's state disk
    pub state_disk_key: [u8; SECRET_LEN],
    /// Owner id of the cluster
    pub owner_id: [u8; SECRET_LEN],
    /// Cluster id
    pub cluster_id: [u8; SECRET_LEN],
    /// Where the node reaches the API server
    pub api_server_endpoint: String,
    /// kubeadm bootstrap token, `[a-z0-9]{6}.[a-z0-9]{16}`
    pub kubeadm_token: String,
    /// `sha256:<hex>` of the cluster CA public key
    pub discovery_ca_cert_hash: String,
}

impl fmt::Debug for ActivationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationResponse")
            .field("state_disk_key", &"[REDACTED]")
            .field("owner_id", &hex::encode(self.owner_id))
            .field("cluster_id", &hex::encode(self.cluster_id))
            .field("api_server_endpoint", &self.api_server_endpoint)
            .field("kubeadm_token", &"[REDACTED]")
            .field("discovery_ca_cert_hash", &self.discovery_ca_cert_hash)
            .finish()
    }
}

/// Verifies joining nodes against the cluster's join configuration
pub struct NodeActivationService {
    store: Arc<dyn ClusterStore>,
    verifier: Arc<dyn EvidenceVerifier>,
    master_key: [u8; SECRET_LEN],
    api_server_endpoint: String,
    discovery_ca_cert_hash: String,
}

impl NodeActivationService {
    /// Service for the cluster at `api_server_endpoint`
    ///
    /// `ca_public_key_der` is the DER encoded public key of the cluster CA.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        verifier: Arc<dyn EvidenceVerifier>,
        master_key: [u8; SECRET_LEN],
        api_server_endpoint: impl Into<String>,
        ca_public_key_der: &[u8],
    ) -> Self {
        Self {
            store,
            verifier,
            master_key,
            api_server_endpoint: api_server_endpoint.into(),
            discovery_ca_cert_hash: format!(
                "sha256:{}",
                hex::encode(digest(&SHA256, ca_public_key_der))
            ),
        }
    }

    /// Verify `request` and issue the node's join material
    pub async fn activate(&self, request: &ActivationRequest) -> Result<ActivationResponse> {
        if request.disk_uuid.is_empty() {
            return Err(Error::malformed("activation request", "empty disk uuid"));
        }

        let join = read_join_config(self.store.as_ref()).await?;
        let salt: [u8; SECRET_LEN] = join.measurement_salt.as_slice().try_into().map_err(|_| {
            Error::malformed(
                "join configuration",
                format!("measurement salt has {} bytes", join.measurement_salt.len()),
            )
        })?;

        let pcrs = self
            .verifier
            .verify(join.policy.variant, &request.evidence)
            .await?;

        let mut rejected = Vec::new();
        for (index, measurement) in &join.policy.measurements {
            if pcrs.get(index) == Some(&measurement.expected) {
                continue;
            }
            if measurement.warn_only {
                warn!(pcr = index, disk_uuid = %request.disk_uuid, "Warn-only measurement mismatch");
            } else {
                rejected.push(index.to_string());
            }
        }
        if !rejected.is_empty() {
            return Err(Error::verification(
                format!("node {}", request.disk_uuid),
                format!("enforced PCRs do not match: {}", rejected.join(", ")),
            ));
        }

        let secret = MasterSecret::from_parts(self.master_key, salt);
        let response = ActivationResponse {
            state_disk_key: secret.state_disk_key(request.disk_uuid.as_bytes())?,
            owner_id: secret.owner_id(),
            cluster_id: secret.cluster_id()?,
            api_server_endpoint: self.api_server_endpoint.clone(),
            kubeadm_token: bootstrap_token(),
            discovery_ca_cert_hash: self.discovery_ca_cert_hash.clone(),
        };
        info!(disk_uuid = %request.disk_uuid, role = %request.role, "Activated node");
        Ok(response)
    }
}

fn random_chars(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Fresh kubeadm bootstrap token
pub fn bootstrap_token() -> String {
    let mut rng = rand::thread_rng();
    format!("{}.{}", random_chars(&mut rng, 6), random_chars(&mut rng, 16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join_config::provision_join_config;
    use crate::testing::MemoryStore;
    use constellation_attestation::{AttestationPolicy, Measurement, Measurements};
    use constellation_common::ErrorKind;

    const KEY: [u8; 32] = [0x4b; 32];
    const SALT: [u8; 32] = [0x53; 32];

    async fn service(verifier: MockEvidenceVerifier) -> (Arc<MemoryStore>, NodeActivationService) {
        let store = Arc::new(MemoryStore::default());
        let policy = AttestationPolicy {
            variant: AttestationVariant::QemuVtpm,
            measurements: Measurements::from([
                (4, Measurement::enforced([0x44; 32])),
                (12, Measurement::warn_only([0x12; 32])),
            ]),
        };
        provision_join_config(store.clone(), &policy, &SALT)
            .await
            .unwrap();
        let svc = NodeActivationService::new(
            store.clone(),
            Arc::new(verifier),
            KEY,
            "192.0.2.1:6443",
            b"ca-public-key",
        );
        (store, svc)
    }

    fn reporting(pcrs: Vec<(u32, [u8; 32])>) -> MockEvidenceVerifier {
        let mut verifier = MockEvidenceVerifier::new();
        verifier
            .expect_verify()
            .returning(move |variant, evidence| {
                assert_eq!(variant, AttestationVariant::QemuVtpm);
                assert_eq!(evidence, b"quote");
                Ok(pcrs.iter().copied().collect())
            });
        verifier
    }

    fn request(disk_uuid: &str) -> ActivationRequest {
        ActivationRequest {
            disk_uuid: disk_uuid.to_string(),
            evidence: b"quote".to_vec(),
            role: NodeRole::Worker,
        }
    }

    #[tokio::test]
    async fn story_matching_node_receives_its_join_material() {
        let (_store, svc) = service(reporting(vec![(4, [0x44; 32]), (12, [0x12; 32])])).await;
        let response = svc.activate(&request("disk-a")).await.unwrap();

        let secret = MasterSecret::from_parts(KEY, SALT);
        assert_eq!(response.state_disk_key, secret.state_disk_key(b"disk-a").unwrap());
        assert_eq!(response.owner_id, secret.owner_id());
        assert_eq!(response.cluster_id, secret.cluster_id().unwrap());
        assert_eq!(response.api_server_endpoint, "192.0.2.1:6443");
        assert_eq!(
            response.discovery_ca_cert_hash,
            format!("sha256:{}", hex::encode(digest(&SHA256, b"ca-public-key")))
        );

        let (id, secret) = response.kubeadm_token.split_once('.').unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert!(response
            .kubeadm_token
            .chars()
            .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn disks_get_distinct_keys() {
        let (_store, svc) = service(reporting(vec![(4, [0x44; 32]), (12, [0x12; 32])])).await;
        let a = svc.activate(&request("disk-a")).await.unwrap();
        let b = svc.activate(&request("disk-b")).await.unwrap();
        assert_ne!(a.state_disk_key, b.state_disk_key);
        assert_eq!(a.cluster_id, b.cluster_id);
    }

    #[tokio::test]
    async fn warn_only_mismatch_is_tolerated() {
        let (_store, svc) = service(reporting(vec![(4, [0x44; 32]), (12, [0xff; 32])])).await;
        assert!(svc.activate(&request("disk-a")).await.is_ok());
    }

    #[tokio::test]
    async fn enforced_mismatch_is_rejected() {
        let (_store, svc) = service(reporting(vec![(4, [0x00; 32]), (12, [0x12; 32])])).await;
        let err = svc.activate(&request("disk-a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerificationFailed);
        assert!(err.to_string().contains('4'));
    }

    #[tokio::test]
    async fn missing_enforced_pcr_is_rejected() {
        let (_store, svc) = service(reporting(vec![(12, [0x12; 32])])).await;
        let err = svc.activate(&request("disk-a")).await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn missing_join_config_is_not_found() {
        let mut verifier = MockEvidenceVerifier::new();
        verifier.expect_verify().never();
        let svc = NodeActivationService::new(
            Arc::new(MemoryStore::default()),
            Arc::new(verifier),
            KEY,
            "192.0.2.1:6443",
            b"ca",
        );
        let err = svc.activate(&request("disk-a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn tokens_differ() {
        assert_ne!(bootstrap_token(), bootstrap_token());
    }
}
