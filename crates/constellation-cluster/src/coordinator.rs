//! Converges the cluster's NodeVersion to a requested image and Kubernetes
//! version
//!
//! The node operator inside the cluster does the actual rollout. This module
//! only validates the request, records it in the NodeVersion object, and
//! checks that what was stored is what was asked for.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use constellation_attestation::AttestationPolicy;
use constellation_common::retry::{retry_with_backoff, RetryConfig};
use constellation_common::rollback::RollbackComposer;
use constellation_common::version::{check_kubernetes_upgrade, check_upgrade};
use constellation_common::{Error, Result};

use crate::components::{components_config_map, KubernetesComponent};
use crate::crd::{NodeVersion, NodeVersionSpec, NODE_VERSION_NAME};
use crate::join_config::{update_attestation_config, JoinConfigCompensation};
use crate::store::{within_budget, ClusterStore};

/// Versions an upgrade should converge to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredVersions {
    /// Provider specific node image reference
    pub image_reference: String,
    /// Node image version, e.g. `v2.3.0`
    pub image_version: String,
    /// Kubernetes version, e.g. `v1.27.4`
    pub kubernetes_version: String,
    /// Components nodes install for `kubernetes_version`
    pub kubernetes_components: Vec<KubernetesComponent>,
}

/// What an upgrade changed
#[derive(Debug)]
pub struct UpgradeReport {
    /// The image fields were written
    pub image_updated: bool,
    /// The Kubernetes fields were written
    pub kubernetes_updated: bool,
    /// Parts of the request that were not applied, and why
    pub skipped: Vec<Error>,
    /// NodeVersion as read back after the write
    pub node_version: NodeVersion,
}

struct Gate {
    image_eligible: bool,
    kubernetes_eligible: bool,
    skipped: Vec<Error>,
}

struct FieldSet<'a>(&'a NodeVersionSpec);

impl fmt::Display for FieldSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "image={} ({}), kubernetes={} ({})",
            self.0.image_version,
            self.0.image_reference,
            self.0.kubernetes_cluster_version,
            self.0.kubernetes_components_reference
        )
    }
}

/// Writes upgrade requests to the cluster
pub struct UpgradeCoordinator {
    store: Arc<dyn ClusterStore>,
    retry: RetryConfig,
}

impl UpgradeCoordinator {
    /// Coordinator retrying write conflicts with [`RetryConfig::conflict`]
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            retry: RetryConfig::conflict(),
        }
    }

    /// Override the conflict retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check the upgrade preconditions without writing anything
    ///
    /// Runs the in-progress gate and the version rules against the stored
    /// NodeVersion. Returns the parts that would be skipped. Fails when an
    /// upgrade is running or when nothing would be applied, unless `force`.
    pub async fn preflight(
        &self,
        image_version: &str,
        kubernetes_version: &str,
        force: bool,
    ) -> Result<Vec<Error>> {
        let current = self.store.get_node_version().await?;
        let gate = self.gate(&current, image_version, kubernetes_version, force)?;
        Ok(gate.skipped)
    }

    /// Converge the join configuration and then the NodeVersion
    ///
    /// When the NodeVersion step fails, the join configuration is put back
    /// the way it was before this call.
    pub async fn converge(
        &self,
        policy: &AttestationPolicy,
        desired: &DesiredVersions,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(bool, UpgradeReport)> {
        let mut rollback = RollbackComposer::new();
        let policy_changed = match self.update_attestation(policy, cancel).await? {
            Some(undo) => {
                rollback.push(Box::new(undo));
                true
            }
            None => false,
        };
        match self.apply(desired, force, cancel).await {
            Ok(report) => {
                rollback.commit();
                Ok((policy_changed, report))
            }
            Err(e) => Err(rollback.rollback(e).await),
        }
    }

    /// Request `desired` from the node operator
    ///
    /// `force` skips the in-progress check and the version compatibility
    /// rules. It does not suppress a readback mismatch.
    pub async fn apply(
        &self,
        desired: &DesiredVersions,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<UpgradeReport> {
        let current = self.store.get_node_version().await?;
        let Gate {
            image_eligible,
            kubernetes_eligible,
            skipped,
        } = self.gate(
            &current,
            &desired.image_version,
            &desired.kubernetes_version,
            force,
        )?;

        let components_reference = if kubernetes_eligible {
            Some(self.create_components(&desired.kubernetes_components).await?)
        } else {
            None
        };

        let store = self.store.as_ref();
        let components_reference = components_reference.as_deref();
        let transaction = retry_with_backoff(&self.retry, "update_node_version", cancel, || async move {
            let mut nv = store.get_node_version().await?;
            if image_eligible {
                nv.spec.image_reference = desired.image_reference.clone();
                nv.spec.image_version = desired.image_version.clone();
            }
            if let Some(reference) = components_reference {
                nv.spec.kubernetes_components_reference = reference.to_string();
                nv.spec.kubernetes_cluster_version = desired.kubernetes_version.clone();
            }
            store.update_node_version(&nv).await?;
            Ok::<NodeVersionSpec, Error>(nv.spec)
        });
        let expected = within_budget("update_node_version", transaction).await?;

        let node_version = self.store.get_node_version().await?;
        if node_version.spec != expected {
            return Err(Error::apply_divergence(
                NODE_VERSION_NAME,
                FieldSet(&expected).to_string(),
                FieldSet(&node_version.spec).to_string(),
            ));
        }

        info!(
            image = %node_version.spec.image_version,
            kubernetes = %node_version.spec.kubernetes_cluster_version,
            skipped = skipped.len(),
            "Requested node upgrade"
        );
        Ok(UpgradeReport {
            image_updated: image_eligible,
            kubernetes_updated: kubernetes_eligible,
            skipped,
            node_version,
        })
    }

    /// Converge the join configuration to `policy`
    ///
    /// Returns the compensation of the write, or `None` if nothing changed.
    pub async fn update_attestation(
        &self,
        policy: &AttestationPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<JoinConfigCompensation>> {
        update_attestation_config(self.store.clone(), policy, &self.retry, cancel).await
    }

    fn gate(
        &self,
        current: &NodeVersion,
        image_version: &str,
        kubernetes_version: &str,
        force: bool,
    ) -> Result<Gate> {
        if current.upgrade_in_progress() {
            if !force {
                return Err(Error::upgrade_in_progress(
                    "nodes are still being upgraded to the previously requested version",
                ));
            }
            warn!("Upgrade in progress, continuing because of --force");
        }

        let mut skipped = Vec::new();
        let image_eligible = self.eligible(
            check_upgrade("image", &current.spec.image_version, image_version),
            force,
            &mut skipped,
        );
        let kubernetes_eligible = self.eligible(
            check_kubernetes_upgrade(&current.spec.kubernetes_cluster_version, kubernetes_version),
            force,
            &mut skipped,
        );
        if !image_eligible && !kubernetes_eligible {
            return Err(Error::join(skipped)
                .unwrap_or_else(|| Error::internal("nothing to upgrade")));
        }
        Ok(Gate {
            image_eligible,
            kubernetes_eligible,
            skipped,
        })
    }

    fn eligible(&self, check: Result<()>, force: bool, skipped: &mut Vec<Error>) -> bool {
        match check {
            Ok(()) => true,
            Err(e) if force => {
                warn!(error = %e, "Ignoring version check because of --force");
                true
            }
            Err(e) => {
                warn!(error = %e, "Skipping part of the upgrade");
                skipped.push(e);
                false
            }
        }
    }

    async fn create_components(&self, components: &[KubernetesComponent]) -> Result<String> {
        let cm = components_config_map(components)?;
        let name = cm.metadata.name.clone().unwrap_or_default();
        match self.store.create_config_map(&cm).await {
            Ok(_) => info!(name = %name, "Created Kubernetes components"),
            Err(e) if e.is_already_exists() => {
                info!(name = %name, "Kubernetes components already exist")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::default_components;
    use crate::join_config::{provision_join_config, read_join_config};
    use constellation_attestation::{Measurement, Measurements};
    use constellation_common::AttestationVariant;
    use crate::store::{MockClusterStore, StoreError};
    use crate::testing::{outdated, MemoryStore};
    use constellation_common::ErrorKind;
    use std::time::Duration;

    fn current() -> NodeVersionSpec {
        NodeVersionSpec {
            image_reference: "/images/v2.3.0".to_string(),
            image_version: "v2.3.0".to_string(),
            kubernetes_components_reference: "k8s-components-00000000".to_string(),
            kubernetes_cluster_version: "v1.27.0".to_string(),
        }
    }

    fn desired() -> DesiredVersions {
        DesiredVersions {
            image_reference: "/images/v2.3.1".to_string(),
            image_version: "v2.3.1".to_string(),
            kubernetes_version: "v1.27.4".to_string(),
            kubernetes_components: default_components("v1.27.4"),
        }
    }

    fn policy(pcr4: u8) -> AttestationPolicy {
        AttestationPolicy {
            variant: AttestationVariant::QemuVtpm,
            measurements: Measurements::from([(4, Measurement::enforced([pcr4; 32]))]),
        }
    }

    fn coordinator(store: Arc<MemoryStore>) -> UpgradeCoordinator {
        UpgradeCoordinator::new(store).with_retry(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
    }

    // =========================================================================
    // Stories
    // =========================================================================

    #[tokio::test]
    async fn story_concurrent_upgrade_needs_force() {
        let store = Arc::new(MemoryStore::with_node_version(current(), Some(outdated())));
        let coordinator = coordinator(store.clone());
        let cancel = CancellationToken::new();

        let err = coordinator.apply(&desired(), false, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpgradeInProgress);
        assert_eq!(store.node_version_writes(), 0);

        let report = coordinator.apply(&desired(), true, &cancel).await.unwrap();
        assert!(report.image_updated);
        assert!(report.kubernetes_updated);
        let stored = store.stored_node_version();
        assert_eq!(stored.spec.image_version, "v2.3.1");
        assert_eq!(stored.spec.image_reference, "/images/v2.3.1");
        assert_eq!(stored.spec.kubernetes_cluster_version, "v1.27.4");
        assert_eq!(report.node_version.spec, stored.spec);

        let components = stored.spec.kubernetes_components_reference;
        assert!(store.config_map(&components).is_some());
    }

    #[tokio::test]
    async fn story_write_conflict_is_retried_from_a_fresh_read() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        store.conflict_next(2);

        let report = coordinator(store.clone())
            .apply(&desired(), false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.node_version.spec.image_version, "v2.3.1");
        assert_eq!(store.node_version_writes(), 1);
    }

    #[tokio::test]
    async fn story_failed_node_upgrade_restores_the_join_config() {
        let store = Arc::new(MemoryStore::with_node_version(current(), Some(outdated())));
        provision_join_config(store.clone(), &policy(0xaa), &[7u8; 32])
            .await
            .unwrap();

        let err = coordinator(store.clone())
            .converge(&policy(0xbb), &desired(), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpgradeInProgress);
        assert_eq!(store.node_version_writes(), 0);

        let join = read_join_config(store.as_ref()).await.unwrap();
        assert_eq!(join.policy, policy(0xaa));
    }

    #[tokio::test]
    async fn story_converge_writes_policy_then_node_version() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        provision_join_config(store.clone(), &policy(0xaa), &[7u8; 32])
            .await
            .unwrap();

        let (policy_changed, report) = coordinator(store.clone())
            .converge(&policy(0xbb), &desired(), false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(policy_changed);
        assert!(report.image_updated);
        let join = read_join_config(store.as_ref()).await.unwrap();
        assert_eq!(join.policy, policy(0xbb));
    }

    // =========================================================================
    // Preflight
    // =========================================================================

    #[tokio::test]
    async fn preflight_rejects_a_running_upgrade_without_writing() {
        let store = Arc::new(MemoryStore::with_node_version(current(), Some(outdated())));
        let coordinator = coordinator(store.clone());

        let err = coordinator.preflight("v2.3.1", "v1.27.4", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpgradeInProgress);
        assert!(coordinator.preflight("v2.3.1", "v1.27.4", true).await.unwrap().is_empty());
        assert_eq!(store.node_version_writes(), 0);
    }

    #[tokio::test]
    async fn preflight_reports_soft_skips_and_rejects_empty_upgrades() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        let coordinator = coordinator(store.clone());

        let skipped = coordinator.preflight("v2.3.1", "v1.99.0", false).await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].kind(), ErrorKind::InvalidUpgrade);

        let err = coordinator.preflight("v2.3.0", "v1.27.0", false).await.unwrap_err();
        assert_eq!(err.members().len(), 2);
    }

    // =========================================================================
    // Budget
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn endless_conflicts_exhaust_the_transaction_budget() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        store.conflict_next(usize::MAX);
        let coordinator = UpgradeCoordinator::new(store.clone()).with_retry(RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        });

        let err = coordinator
            .apply(&desired(), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("did not complete within"));
        assert_eq!(store.node_version_writes(), 0);
    }

    // =========================================================================
    // Version rules
    // =========================================================================

    #[tokio::test]
    async fn unsupported_kubernetes_is_skipped_but_image_proceeds() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        let mut request = desired();
        request.kubernetes_version = "v1.99.0".to_string();

        let report = coordinator(store.clone())
            .apply(&request, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.image_updated);
        assert!(!report.kubernetes_updated);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].kind(), ErrorKind::InvalidUpgrade);

        let stored = store.stored_node_version();
        assert_eq!(stored.spec.image_version, "v2.3.1");
        assert_eq!(stored.spec.kubernetes_cluster_version, "v1.27.0");
        assert_eq!(stored.spec.kubernetes_components_reference, "k8s-components-00000000");
    }

    #[tokio::test]
    async fn both_parts_invalid_returns_both_errors() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        let mut request = desired();
        request.image_version = "v2.2.0".to_string();
        request.kubernetes_version = "v1.27.0".to_string();

        let err = coordinator(store.clone())
            .apply(&request, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUpgrade);
        assert_eq!(err.members().len(), 2);
        assert_eq!(store.node_version_writes(), 0);
    }

    #[tokio::test]
    async fn force_overrides_version_rules() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        let mut request = desired();
        request.image_version = "v2.3.0".to_string();

        let report = coordinator(store.clone())
            .apply(&request, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.image_updated);
        assert!(report.skipped.is_empty());
    }

    // =========================================================================
    // Readback
    // =========================================================================

    #[tokio::test]
    async fn mutated_write_is_reported_as_divergence() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        store.tamper_writes(|nv| nv.spec.image_version = "v2.3.0".to_string());

        let err = coordinator(store.clone())
            .apply(&desired(), true, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::ApplyDivergence {
                resource,
                expected,
                actual,
            } => {
                assert_eq!(resource, NODE_VERSION_NAME);
                assert!(expected.contains("image=v2.3.1"));
                assert!(actual.contains("image=v2.3.0"));
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn existing_components_are_reused() {
        let store = Arc::new(MemoryStore::with_node_version(current(), None));
        let cm = components_config_map(&desired().kubernetes_components).unwrap();
        store.insert_config_map(cm.clone());

        let report = coordinator(store.clone())
            .apply(&desired(), false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            Some(report.node_version.spec.kubernetes_components_reference),
            cm.metadata.name
        );
    }

    #[tokio::test]
    async fn missing_node_version_is_not_found() {
        let mut store = MockClusterStore::new();
        store.expect_get_node_version().times(1).returning(|| {
            Err(StoreError::NotFound {
                kind: "NodeVersion",
                name: NODE_VERSION_NAME.to_string(),
            })
        });
        store.expect_update_node_version().never();

        let err = UpgradeCoordinator::new(Arc::new(store))
            .apply(&desired(), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
