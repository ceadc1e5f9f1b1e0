//! Join configuration read by the cluster's join service
//!
//! The `join-config` ConfigMap carries the attestation policy joining nodes
//! are verified against, plus the measurement salt. It never carries the
//! master secret.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use constellation_attestation::AttestationPolicy;
use constellation_common::retry::{retry_with_backoff, RetryConfig};
use constellation_common::rollback::Compensation;
use constellation_common::{Error, Result, CONSTELLATION_NAMESPACE};

use crate::store::{within_budget, ClusterStore};

/// Name of the join configuration ConfigMap
pub const JOIN_CONFIG_MAP: &str = "join-config";

/// Data key of the serialized attestation policy
pub const ATTESTATION_CONFIG_KEY: &str = "attestationConfig";

/// Data key of the policy that was replaced last
pub const ATTESTATION_CONFIG_BACKUP_KEY: &str = "attestationConfig_backup";

/// Binary data key of the measurement salt
pub const MEASUREMENT_SALT_KEY: &str = "measurementSalt";

/// Expected measurement salt length
pub const MEASUREMENT_SALT_LEN: usize = 32;

/// Parsed content of the join configuration
#[derive(Clone, Debug, PartialEq)]
pub struct JoinConfig {
    /// Policy joining nodes are verified against
    pub policy: AttestationPolicy,
    /// Salt of the cluster's identities
    pub measurement_salt: Vec<u8>,
}

/// Read and parse the join configuration
pub async fn read_join_config(store: &dyn ClusterStore) -> Result<JoinConfig> {
    let cm = store.get_config_map(JOIN_CONFIG_MAP).await?;
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(ATTESTATION_CONFIG_KEY))
        .ok_or_else(|| {
            Error::malformed(JOIN_CONFIG_MAP, format!("missing key {}", ATTESTATION_CONFIG_KEY))
        })?;
    let policy = AttestationPolicy::from_json(raw)?;
    let measurement_salt = cm
        .binary_data
        .as_ref()
        .and_then(|d| d.get(MEASUREMENT_SALT_KEY))
        .map(|b| b.0.clone())
        .ok_or_else(|| {
            Error::malformed(JOIN_CONFIG_MAP, format!("missing key {}", MEASUREMENT_SALT_KEY))
        })?;
    Ok(JoinConfig {
        policy,
        measurement_salt,
    })
}

type Data = Option<BTreeMap<String, String>>;
type BinaryData = Option<BTreeMap<String, ByteString>>;

enum Undo {
    Delete,
    Restore { data: Data, binary_data: BinaryData },
}

/// Undoes a write of the join configuration
///
/// A map that did not exist is deleted. A map that existed gets back the
/// exact data and binary data it held before the write.
pub struct JoinConfigCompensation {
    store: Arc<dyn ClusterStore>,
    undo: Undo,
}

impl JoinConfigCompensation {
    fn restore(store: Arc<dyn ClusterStore>, previous: &ConfigMap) -> Self {
        Self {
            store,
            undo: Undo::Restore {
                data: previous.data.clone(),
                binary_data: previous.binary_data.clone(),
            },
        }
    }
}

#[async_trait]
impl Compensation for JoinConfigCompensation {
    fn name(&self) -> String {
        match self.undo {
            Undo::Delete => format!("delete {}", JOIN_CONFIG_MAP),
            Undo::Restore { .. } => format!("restore {}", JOIN_CONFIG_MAP),
        }
    }

    async fn compensate(&self) -> Result<()> {
        match &self.undo {
            Undo::Delete => Ok(self.store.delete_config_map(JOIN_CONFIG_MAP).await?),
            Undo::Restore { data, binary_data } => {
                let mut cm = match self.store.get_config_map(JOIN_CONFIG_MAP).await {
                    Ok(cm) => cm,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                if cm.data == *data && cm.binary_data == *binary_data {
                    return Ok(());
                }
                cm.data = data.clone();
                cm.binary_data = binary_data.clone();
                self.store.update_config_map(&cm).await?;
                info!("Restored previous join configuration");
                Ok(())
            }
        }
    }
}

/// Write `policy` and `measurement_salt` for a freshly created cluster
///
/// An existing map keeps its previous policy under the backup key. The
/// returned compensation deletes a new map or restores the previous content
/// of an existing one.
pub async fn provision_join_config(
    store: Arc<dyn ClusterStore>,
    policy: &AttestationPolicy,
    measurement_salt: &[u8],
) -> Result<JoinConfigCompensation> {
    if measurement_salt.len() != MEASUREMENT_SALT_LEN {
        return Err(Error::config_validation(format!(
            "measurement salt must be {} bytes, got {}",
            MEASUREMENT_SALT_LEN,
            measurement_salt.len()
        )));
    }
    let json = policy.to_json()?;
    let salt = BTreeMap::from([(
        MEASUREMENT_SALT_KEY.to_string(),
        ByteString(measurement_salt.to_vec()),
    )]);

    match store.get_config_map(JOIN_CONFIG_MAP).await {
        Err(e) if e.is_not_found() => {
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(JOIN_CONFIG_MAP.to_string()),
                    namespace: Some(CONSTELLATION_NAMESPACE.to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(ATTESTATION_CONFIG_KEY.to_string(), json)])),
                binary_data: Some(salt),
                ..Default::default()
            };
            store.create_config_map(&cm).await?;
            info!(variant = %policy.variant, "Created join configuration");
            Ok(JoinConfigCompensation {
                store,
                undo: Undo::Delete,
            })
        }
        Err(e) => Err(e.into()),
        Ok(mut cm) => {
            let undo = JoinConfigCompensation::restore(store.clone(), &cm);
            let data = cm.data.get_or_insert_with(BTreeMap::new);
            if let Some(previous) = data.remove(ATTESTATION_CONFIG_KEY) {
                data.insert(ATTESTATION_CONFIG_BACKUP_KEY.to_string(), previous);
            }
            data.insert(ATTESTATION_CONFIG_KEY.to_string(), json);
            cm.binary_data = Some(salt);
            store.update_config_map(&cm).await?;
            info!(variant = %policy.variant, "Replaced existing join configuration");
            Ok(undo)
        }
    }
}

/// Converge the join configuration to `policy`
///
/// Returns `None` when the stored policy already equals `policy`. Before
/// writing, the stored policy is copied to the backup key; the returned
/// compensation puts the map back the way it was read.
pub async fn update_attestation_config(
    store: Arc<dyn ClusterStore>,
    policy: &AttestationPolicy,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<Option<JoinConfigCompensation>> {
    let desired = policy.to_json()?;
    let desired = &desired;
    let store_ref = store.as_ref();
    let transaction = retry_with_backoff(retry, "update_attestation_config", cancel, || async move {
        let mut cm = store_ref.get_config_map(JOIN_CONFIG_MAP).await?;
        let previous = cm.clone();
        let data = cm.data.get_or_insert_with(BTreeMap::new);
        if let Some(raw) = data.get(ATTESTATION_CONFIG_KEY).cloned() {
            match AttestationPolicy::from_json(&raw) {
                Ok(current) if current == *policy => return Ok(None),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Stored attestation config is unreadable, replacing it"),
            }
            data.insert(ATTESTATION_CONFIG_BACKUP_KEY.to_string(), raw);
        }
        data.insert(ATTESTATION_CONFIG_KEY.to_string(), desired.clone());
        store_ref.update_config_map(&cm).await?;
        Ok::<Option<ConfigMap>, Error>(Some(previous))
    });

    match within_budget("update_attestation_config", transaction).await {
        Ok(Some(previous)) => {
            info!(variant = %policy.variant, "Updated attestation config");
            Ok(Some(JoinConfigCompensation::restore(store, &previous)))
        }
        Ok(None) => {
            info!("Attestation config is up to date");
            Ok(None)
        }
        Err(e @ Error::Cancelled { .. }) => Err(e),
        Err(e) => Err(Error::attestation_update(e.to_string())),
    }
}
