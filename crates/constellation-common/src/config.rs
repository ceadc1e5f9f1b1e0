//! Declarative cluster configuration
//!
//! The user edits `constellation-conf.yaml`; the engine only consumes the
//! validated [`ClusterConfig`]. Validation enforces the structural rules the
//! rest of the engine relies on:
//!
//! - exactly one provider block is set and it matches `cloudProvider`
//! - at least one control-plane and one worker group, each with
//!   `initialCount >= 1`
//! - the image short path and Kubernetes version are canonical

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::provider::{AttestationVariant, CloudProvider};
use crate::version::{self, ImageVersion};
use crate::{Error, Result};

/// Smallest state disk the node image accepts
pub const MIN_STATE_DISK_SIZE_GIB: u32 = 10;

/// Role of the nodes in a node group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Kubernetes control plane
    ControlPlane,
    /// Workload nodes
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// One group of identically configured nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    /// Control plane or worker
    pub role: NodeRole,
    /// Number of nodes created with the cluster
    pub initial_count: u32,
    /// Availability zone; for Azure a comma separated list
    #[serde(default)]
    pub zone: String,
    /// Provider specific machine type
    #[serde(default)]
    pub instance_type: String,
    /// Provider specific state disk type
    #[serde(default)]
    pub disk_type: String,
}

// =============================================================================
// Provider blocks
// =============================================================================

/// AWS settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsConfig {
    /// Region, e.g. `eu-central-1`
    pub region: String,
    /// Zone, e.g. `eu-central-1a`
    pub zone: String,
    /// Instance profile for control plane nodes
    pub iam_profile_control_plane: String,
    /// Instance profile for worker nodes
    pub iam_profile_worker_nodes: String,
}

/// Azure settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    /// Subscription id
    pub subscription: String,
    /// Tenant id
    pub tenant: String,
    /// Location, e.g. `westeurope`
    pub location: String,
    /// Resource group the cluster is created in
    pub resource_group: String,
    /// Resource id of the user assigned identity
    pub user_assigned_identity: String,
    /// Enable secure boot on nodes
    #[serde(default)]
    pub secure_boot: bool,
}

/// GCP settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpConfig {
    /// Project id
    pub project: String,
    /// Region, e.g. `europe-west3`
    pub region: String,
    /// Zone, e.g. `europe-west3-b`
    pub zone: String,
    /// Path to the service account key file
    #[serde(default)]
    pub service_account_key_path: String,
}

/// OpenStack settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackConfig {
    /// Cloud name in `clouds.yaml`
    #[serde(default)]
    pub cloud: String,
    /// Pool floating IPs are allocated from
    pub floating_ip_pool_id: String,
}

/// QEMU settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QemuConfig {
    /// Image format of the node image (`raw` or `qcow2`)
    pub image_format: String,
    /// vCPUs per node
    pub vcpus: u32,
    /// Memory per node in MiB
    pub memory: u32,
    /// Container image of the metadata API server
    pub metadata_api_server: String,
    /// Libvirt connection URI; empty starts a local libvirt container
    #[serde(default)]
    pub libvirt_socket: String,
    /// Container image used when libvirt runs in a container
    pub libvirt_container_image: String,
    /// NVRAM template preset
    #[serde(default = "default_nvram")]
    pub nvram: String,
    /// Custom firmware path
    #[serde(default)]
    pub firmware: String,
}

fn default_nvram() -> String {
    "production".to_string()
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            image_format: "raw".to_string(),
            vcpus: 2,
            memory: 2048,
            metadata_api_server: "ghcr.io/edgelesssys/constellation/qemu-metadata-api:latest"
                .to_string(),
            libvirt_socket: String::new(),
            libvirt_container_image: "ghcr.io/edgelesssys/constellation/libvirt:latest"
                .to_string(),
            nvram: default_nvram(),
            firmware: String::new(),
        }
    }
}

/// Provider blocks; exactly one must be set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigs {
    /// AWS block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsConfig>,
    /// Azure block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureConfig>,
    /// GCP block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpConfig>,
    /// OpenStack block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<OpenStackConfig>,
    /// QEMU block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu: Option<QemuConfig>,
}

impl ProviderConfigs {
    fn set_providers(&self) -> Vec<CloudProvider> {
        let mut set = Vec::new();
        if self.aws.is_some() {
            set.push(CloudProvider::Aws);
        }
        if self.azure.is_some() {
            set.push(CloudProvider::Azure);
        }
        if self.gcp.is_some() {
            set.push(CloudProvider::Gcp);
        }
        if self.openstack.is_some() {
            set.push(CloudProvider::OpenStack);
        }
        if self.qemu.is_some() {
            set.push(CloudProvider::Qemu);
        }
        set
    }
}

// =============================================================================
// ClusterConfig
// =============================================================================

/// Validated declarative cluster description
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name, used as resource name prefix
    pub name: String,
    /// Provider hosting the cluster
    pub cloud_provider: CloudProvider,
    /// Image short path, e.g. `stream/debug/v2.3.0`
    pub image: String,
    /// Kubernetes version, e.g. `v1.27.0`
    pub kubernetes_version: String,
    /// State disk size per node
    #[serde(rename = "stateDiskSizeGiB")]
    pub state_disk_size_gib: u32,
    /// Debug images and verbose logging on nodes
    #[serde(default)]
    pub debug: bool,
    /// Additional DNS name for the API server certificate
    #[serde(default)]
    pub custom_endpoint: String,
    /// Expose the API server on an internal load balancer only
    #[serde(default)]
    pub internal_load_balancer: bool,
    /// Provider blocks
    pub provider: ProviderConfigs,
    /// Node groups by name
    pub node_groups: BTreeMap<String, NodeGroup>,
    /// Attestation variant; defaults per provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_variant: Option<AttestationVariant>,
}

impl ClusterConfig {
    /// Read and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config_validation(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate YAML
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: ClusterConfig = serde_yaml::from_str(raw)
            .map_err(|e| Error::config_validation(format!("parsing config: {}", e)))?;
        config.kubernetes_version = version::with_v_prefix(&config.kubernetes_version);
        config.validate()?;
        Ok(config)
    }

    /// Attestation variant, defaulted from the provider
    pub fn attestation_variant(&self) -> AttestationVariant {
        self.attestation_variant
            .unwrap_or_else(|| AttestationVariant::default_for(self.cloud_provider))
    }

    /// Parsed image version
    pub fn image_version(&self) -> Result<ImageVersion> {
        ImageVersion::parse(&self.image)
    }

    /// Node groups with the given role
    pub fn groups_with_role(&self, role: NodeRole) -> impl Iterator<Item = (&String, &NodeGroup)> {
        self.node_groups.iter().filter(move |(_, g)| g.role == role)
    }

    /// Check the structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || self.name.len() > 32
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.name.starts_with('-')
        {
            return Err(Error::config_field(
                "name",
                format!(
                    "cluster name {:?} must be 1-32 lowercase alphanumerics or '-'",
                    self.name
                ),
            ));
        }

        let set = self.provider.set_providers();
        if set.len() != 1 {
            return Err(Error::config_field(
                "provider",
                format!("exactly one provider block must be set, found {}", set.len()),
            ));
        }
        if set[0] != self.cloud_provider {
            return Err(Error::config_field(
                "provider",
                format!(
                    "provider block {} does not match cloudProvider {}",
                    set[0], self.cloud_provider
                ),
            ));
        }

        let variant = self.attestation_variant();
        let variant_provider = variant.provider();
        let variant_ok = variant_provider == self.cloud_provider
            || (self.cloud_provider == CloudProvider::OpenStack
                && variant == AttestationVariant::QemuVtpm);
        if !variant_ok {
            return Err(Error::config_field(
                "attestationVariant",
                format!(
                    "attestation variant {} cannot run on {}",
                    variant, self.cloud_provider
                ),
            ));
        }

        self.image_version()?;
        version::parse_canonical(&self.kubernetes_version).map_err(|_| {
            Error::config_field(
                "kubernetesVersion",
                format!("invalid Kubernetes version {:?}", self.kubernetes_version),
            )
        })?;

        if self.state_disk_size_gib < MIN_STATE_DISK_SIZE_GIB {
            return Err(Error::config_field(
                "stateDiskSizeGiB",
                format!(
                    "state disk must be at least {} GiB, got {}",
                    MIN_STATE_DISK_SIZE_GIB, self.state_disk_size_gib
                ),
            ));
        }

        for (name, group) in &self.node_groups {
            if group.initial_count < 1 {
                return Err(Error::config_field(
                    format!("nodeGroups.{}.initialCount", name),
                    "initialCount must be at least 1",
                ));
            }
        }
        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            if self.groups_with_role(role).next().is_none() {
                return Err(Error::config_field(
                    "nodeGroups",
                    format!("at least one {} node group is required", role),
                ));
            }
        }

        if let Some(openstack) = &self.provider.openstack {
            if openstack.cloud.is_empty() && std::env::var("OS_AUTH_URL").is_err() {
                return Err(Error::config_field(
                    "provider.openstack.cloud",
                    "either a cloud name or OS_AUTH_URL must be set",
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// IAM configuration
// =============================================================================

/// Input for creating the IAM resources a cluster needs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum IamConfig {
    /// AWS instance profiles
    Aws {
        /// Name prefix of all created resources
        prefix: String,
        /// Region
        region: String,
    },
    /// Azure service principal and managed identity
    Azure {
        /// Service principal name
        service_principal: String,
        /// Region
        region: String,
        /// Resource group to create
        resource_group: String,
    },
    /// GCP service account
    Gcp {
        /// Project id
        project_id: String,
        /// Region
        region: String,
        /// Zone
        zone: String,
        /// Service account id to create
        service_account_id: String,
    },
}

impl IamConfig {
    /// Provider the IAM resources are created on
    pub fn provider(&self) -> CloudProvider {
        match self {
            Self::Aws { .. } => CloudProvider::Aws,
            Self::Azure { .. } => CloudProvider::Azure,
            Self::Gcp { .. } => CloudProvider::Gcp,
        }
    }
}
