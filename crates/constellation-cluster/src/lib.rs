//! Cluster side state of a Constellation cluster
//!
//! - **NodeVersion**: the custom resource the node operator rolls nodes
//!   towards, and the [`UpgradeCoordinator`] that writes it
//! - **Join configuration**: attestation policy and measurement salt that
//!   joining nodes are verified against
//! - **Activation**: the join service contract handing out state disk keys

#![deny(missing_docs)]

pub mod activation;
pub mod components;
pub mod coordinator;
pub mod crd;
pub mod join_config;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use activation::{
    ActivationRequest, ActivationResponse, EvidenceVerifier, NodeActivationService, NodeRole,
};
pub use components::{components_config_map, default_components, KubernetesComponent};
pub use coordinator::{DesiredVersions, UpgradeCoordinator, UpgradeReport};
pub use crd::{NodeVersion, NodeVersionSpec, NodeVersionStatus};
pub use join_config::{
    provision_join_config, read_join_config, JoinConfig, JoinConfigCompensation,
};
pub use store::{create_client, ClusterStore, KubeClusterStore, StoreError};
