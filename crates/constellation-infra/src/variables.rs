//! Per-provider IaC variables
//!
//! One builder per provider turns a validated [`ClusterConfig`] plus the
//! resolved image reference into the variables record of that provider's
//! template. Builders are pure: every field comes from exactly one config
//! field or a fixed constant. These are the only provider specific inputs
//! to the IaC workspace.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use constellation_common::config::{ClusterConfig, IamConfig, NodeGroup, NodeRole};
use constellation_common::{AttestationVariant, CloudProvider, Error, Result};

use crate::tfvars;

/// Libvirt URI of the local libvirt container
pub const LIBVIRT_TCP_CONNECT_URI: &str = "qemu+tcp://localhost:16599/system";

/// System libvirt socket
pub const LIBVIRT_SYSTEM_SOCKET: &str = "/var/run/libvirt/libvirt-sock";

/// NVRAM template for production images
pub const NVRAM_PRODUCTION: &str = "/usr/share/OVMF/constellation_vars.production.fd";

/// NVRAM template for debug images
pub const NVRAM_TESTING: &str = "/usr/share/OVMF/constellation_vars.testing.fd";

fn role_name(role: NodeRole) -> String {
    role.to_string()
}

// =============================================================================
// Azure URI normalisation
// =============================================================================

struct CasingRule {
    pattern: Regex,
    canonical: &'static str,
}

fn rule(pattern: &str, canonical: &'static str) -> CasingRule {
    CasingRule {
        pattern: Regex::new(pattern).expect("static regex is valid"),
        canonical,
    }
}

static IDENTITY_RULES: LazyLock<Vec<CasingRule>> = LazyLock::new(|| {
    vec![
        rule(r"(?i)/subscriptions/", "/subscriptions/"),
        rule(r"(?i)/resourcegroups/", "/resourceGroups/"),
        rule(r"(?i)/providers/", "/providers/"),
        rule(r"(?i)/userassignedidentities/", "/userAssignedIdentities/"),
        rule(r"(?i)/microsoft\.managedidentity/", "/Microsoft.ManagedIdentity/"),
    ]
});

static IMAGE_RULES: LazyLock<Vec<CasingRule>> = LazyLock::new(|| {
    vec![
        rule(r"(?i)/communitygalleries/", "/communityGalleries/"),
        rule(r"(?i)/images/", "/images/"),
        rule(r"(?i)/versions/", "/versions/"),
    ]
});

fn apply_rules(rules: &[CasingRule], uri: &str) -> String {
    rules.iter().fold(uri.to_string(), |acc, r| {
        r.pattern.replace_all(&acc, r.canonical).into_owned()
    })
}

/// Canonical casing of a user assigned identity resource id
pub fn normalize_azure_identity(uri: &str) -> String {
    apply_rules(&IDENTITY_RULES, uri)
}

/// Canonical casing of a community gallery image id
pub fn normalize_azure_image(uri: &str) -> String {
    apply_rules(&IMAGE_RULES, uri)
}

// =============================================================================
// AWS
// =============================================================================

/// AWS node group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsNodeGroup {
    /// `control-plane` or `worker`
    pub role: String,
    /// Number of instances
    pub initial_count: u32,
    /// EC2 instance type
    pub instance_type: String,
    /// State disk size in GiB
    pub disk_size: u32,
    /// EBS volume type
    pub disk_type: String,
    /// Availability zone
    pub zone: String,
}

/// Variables of the AWS cluster template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsClusterVariables {
    /// Cluster name
    pub name: String,
    /// Region
    pub region: String,
    /// Default zone
    pub zone: String,
    /// AMI id
    pub ami: String,
    /// Instance profile of control plane nodes
    pub iam_instance_profile_control_plane: String,
    /// Instance profile of worker nodes
    pub iam_instance_profile_worker_nodes: String,
    /// Debug image
    pub debug: bool,
    /// Enable AMD SEV-SNP on instances
    pub enable_snp: bool,
    /// Additional API server SAN
    pub custom_endpoint: String,
    /// Internal load balancer only
    pub internal_load_balancer: bool,
    /// Node groups by name
    pub node_groups: BTreeMap<String, AwsNodeGroup>,
}

/// Build AWS variables
pub fn aws_variables(config: &ClusterConfig, image_ref: &str) -> Result<AwsClusterVariables> {
    let aws = config
        .provider
        .aws
        .as_ref()
        .ok_or_else(|| Error::config_field("provider.aws", "AWS block is missing"))?;
    let node_groups = config
        .node_groups
        .iter()
        .map(|(name, g)| {
            (
                name.clone(),
                AwsNodeGroup {
                    role: role_name(g.role),
                    initial_count: g.initial_count,
                    instance_type: g.instance_type.clone(),
                    disk_size: config.state_disk_size_gib,
                    disk_type: g.disk_type.clone(),
                    zone: g.zone.clone(),
                },
            )
        })
        .collect();
    Ok(AwsClusterVariables {
        name: config.name.clone(),
        region: aws.region.clone(),
        zone: aws.zone.clone(),
        ami: image_ref.to_string(),
        iam_instance_profile_control_plane: aws.iam_profile_control_plane.clone(),
        iam_instance_profile_worker_nodes: aws.iam_profile_worker_nodes.clone(),
        debug: config.debug,
        enable_snp: config.attestation_variant() == AttestationVariant::AwsSevSnp,
        custom_endpoint: config.custom_endpoint.clone(),
        internal_load_balancer: config.internal_load_balancer,
        node_groups,
    })
}

// =============================================================================
// GCP
// =============================================================================

/// GCP node group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpNodeGroup {
    /// `control-plane` or `worker`
    pub role: String,
    /// Number of instances
    pub initial_count: u32,
    /// Machine type
    pub instance_type: String,
    /// State disk size in GiB
    pub disk_size: u32,
    /// Persistent disk type
    pub disk_type: String,
    /// Zone
    pub zone: String,
}

/// Variables of the GCP cluster template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpClusterVariables {
    /// Cluster name
    pub name: String,
    /// Project id
    pub project: String,
    /// Region
    pub region: String,
    /// Default zone
    pub zone: String,
    /// Image id
    pub image_id: String,
    /// Debug image
    pub debug: bool,
    /// `SEV` or `SEV_SNP`
    pub cc_technology: String,
    /// Additional API server SAN
    pub custom_endpoint: String,
    /// Internal load balancer only
    pub internal_load_balancer: bool,
    /// Node groups by name
    pub node_groups: BTreeMap<String, GcpNodeGroup>,
}

/// Build GCP variables
pub fn gcp_variables(config: &ClusterConfig, image_ref: &str) -> Result<GcpClusterVariables> {
    let gcp = config
        .provider
        .gcp
        .as_ref()
        .ok_or_else(|| Error::config_field("provider.gcp", "GCP block is missing"))?;
    let node_groups = config
        .node_groups
        .iter()
        .map(|(name, g)| {
            (
                name.clone(),
                GcpNodeGroup {
                    role: role_name(g.role),
                    initial_count: g.initial_count,
                    instance_type: g.instance_type.clone(),
                    disk_size: config.state_disk_size_gib,
                    disk_type: g.disk_type.clone(),
                    zone: g.zone.clone(),
                },
            )
        })
        .collect();
    let cc_technology = match config.attestation_variant() {
        AttestationVariant::GcpSevSnp => "SEV_SNP",
        _ => "SEV",
    };
    Ok(GcpClusterVariables {
        name: config.name.clone(),
        project: gcp.project.clone(),
        region: gcp.region.clone(),
        zone: gcp.zone.clone(),
        image_id: image_ref.to_string(),
        debug: config.debug,
        cc_technology: cc_technology.to_string(),
        custom_endpoint: config.custom_endpoint.clone(),
        internal_load_balancer: config.internal_load_balancer,
        node_groups,
    })
}

// =============================================================================
// Azure
// =============================================================================

/// Azure node group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureNodeGroup {
    /// `control-plane` or `worker`
    pub role: String,
    /// Number of instances
    pub initial_count: u32,
    /// VM size
    pub instance_type: String,
    /// State disk size in GiB
    pub disk_size: u32,
    /// Managed disk type
    pub disk_type: String,
    /// Availability zones; `None` lets Azure choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
}

/// Variables of the Azure cluster template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureClusterVariables {
    /// Cluster name
    pub name: String,
    /// Community gallery image id
    pub image_id: String,
    /// Create a Microsoft Azure Attestation provider
    pub create_maa: bool,
    /// Debug image
    pub debug: bool,
    /// Resource group
    pub resource_group: String,
    /// Location
    pub location: String,
    /// User assigned identity resource id
    pub user_assigned_identity: String,
    /// Confidential VMs (false for trusted launch)
    pub confidential_vm: bool,
    /// Secure boot
    pub secure_boot: bool,
    /// Additional API server SAN
    pub custom_endpoint: String,
    /// Internal load balancer only
    pub internal_load_balancer: bool,
    /// Node groups by name
    pub node_groups: BTreeMap<String, AzureNodeGroup>,
}

fn split_zones(zone: &str) -> Option<Vec<String>> {
    let zones: Vec<String> = zone
        .split(',')
        .map(str::trim)
        .filter(|z| !z.is_empty())
        .map(str::to_string)
        .collect();
    (!zones.is_empty()).then_some(zones)
}

/// Build Azure variables; resource ids are normalised
pub fn azure_variables(config: &ClusterConfig, image_ref: &str) -> Result<AzureClusterVariables> {
    let azure = config
        .provider
        .azure
        .as_ref()
        .ok_or_else(|| Error::config_field("provider.azure", "Azure block is missing"))?;
    let node_groups = config
        .node_groups
        .iter()
        .map(|(name, g)| {
            (
                name.clone(),
                AzureNodeGroup {
                    role: role_name(g.role),
                    initial_count: g.initial_count,
                    instance_type: g.instance_type.clone(),
                    disk_size: config.state_disk_size_gib,
                    disk_type: g.disk_type.clone(),
                    zones: split_zones(&g.zone),
                },
            )
        })
        .collect();
    let variant = config.attestation_variant();
    Ok(AzureClusterVariables {
        name: config.name.clone(),
        image_id: normalize_azure_image(image_ref),
        create_maa: variant == AttestationVariant::AzureSevSnp,
        debug: config.debug,
        resource_group: azure.resource_group.clone(),
        location: azure.location.clone(),
        user_assigned_identity: normalize_azure_identity(&azure.user_assigned_identity),
        confidential_vm: variant != AttestationVariant::AzureTrustedLaunch,
        secure_boot: azure.secure_boot,
        custom_endpoint: config.custom_endpoint.clone(),
        internal_load_balancer: config.internal_load_balancer,
        node_groups,
    })
}

// =============================================================================
// OpenStack
// =============================================================================

/// OpenStack node group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenStackNodeGroup {
    /// `control-plane` or `worker`
    pub role: String,
    /// Number of instances
    pub initial_count: u32,
    /// Flavor id
    pub flavor_id: String,
    /// Availability zone
    pub zone: String,
    /// State disk size in GiB
    pub state_disk_size: u32,
    /// Volume type
    pub state_disk_type: String,
}

/// Variables of the OpenStack cluster template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenStackClusterVariables {
    /// Cluster name
    pub name: String,
    /// Cloud in `clouds.yaml`; unset uses `OS_*` environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<String>,
    /// Floating IP pool
    pub floating_ip_pool_id: String,
    /// Image id
    pub image_id: String,
    /// Debug image
    pub debug: bool,
    /// Additional API server SAN
    pub custom_endpoint: String,
    /// Internal load balancer only
    pub internal_load_balancer: bool,
    /// Node groups by name
    pub node_groups: BTreeMap<String, OpenStackNodeGroup>,
}

/// Build OpenStack variables
pub fn openstack_variables(
    config: &ClusterConfig,
    image_ref: &str,
) -> Result<OpenStackClusterVariables> {
    let openstack = config
        .provider
        .openstack
        .as_ref()
        .ok_or_else(|| Error::config_field("provider.openstack", "OpenStack block is missing"))?;
    let node_groups = config
        .node_groups
        .iter()
        .map(|(name, g)| {
            (
                name.clone(),
                OpenStackNodeGroup {
                    role: role_name(g.role),
                    initial_count: g.initial_count,
                    flavor_id: g.instance_type.clone(),
                    zone: g.zone.clone(),
                    state_disk_size: config.state_disk_size_gib,
                    state_disk_type: g.disk_type.clone(),
                },
            )
        })
        .collect();
    Ok(OpenStackClusterVariables {
        name: config.name.clone(),
        cloud: (!openstack.cloud.is_empty()).then(|| openstack.cloud.clone()),
        floating_ip_pool_id: openstack.floating_ip_pool_id.clone(),
        image_id: image_ref.to_string(),
        debug: config.debug,
        custom_endpoint: config.custom_endpoint.clone(),
        internal_load_balancer: config.internal_load_balancer,
        node_groups,
    })
}

// =============================================================================
// QEMU
// =============================================================================

/// Where the QEMU template reaches libvirt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibvirtTarget {
    /// Connection URI used by the IaC provider
    pub uri: String,
    /// Unix socket mounted into the metadata container, if any
    pub socket_path: Option<String>,
    /// Connection URI used by the metadata container
    pub metadata_uri: String,
    /// The local libvirt container has to be started first
    pub start_container: bool,
}

/// Resolve the configured libvirt URI for user `uid`
pub fn resolve_libvirt(uri: &str, uid: u32) -> Result<LibvirtTarget> {
    let (uri, socket_path, start_container) = match uri {
        "" => (LIBVIRT_TCP_CONNECT_URI.to_string(), None, true),
        "qemu:///system" => (uri.to_string(), Some(LIBVIRT_SYSTEM_SOCKET.to_string()), false),
        "qemu:///session" => (
            uri.to_string(),
            Some(format!("/run/user/{}/libvirt/libvirt-sock", uid)),
            false,
        ),
        u if u.starts_with("qemu+unix://") => {
            let socket = u
                .split_once('?')
                .map(|(_, query)| query)
                .into_iter()
                .flat_map(|q| q.split('&'))
                .find_map(|pair| pair.strip_prefix("socket="))
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    Error::config_field(
                        "provider.qemu.libvirtSocket",
                        format!("socket path not specified in qemu+unix URI {}", u),
                    )
                })?;
            (u.to_string(), Some(socket.to_string()), false)
        }
        u => (u.to_string(), None, false),
    };
    let metadata_uri = if socket_path.is_some() {
        "qemu:///system".to_string()
    } else {
        uri.clone()
    };
    Ok(LibvirtTarget {
        uri,
        socket_path,
        metadata_uri,
        start_container,
    })
}

/// Uid of the current process
pub fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// QEMU node group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuNodeGroup {
    /// `control-plane` or `worker`
    pub role: String,
    /// Number of VMs
    pub initial_count: u32,
    /// State disk size in GiB
    pub disk_size: u32,
    /// vCPUs per VM
    pub vcpus: u32,
    /// Memory per VM in MiB
    pub memory: u32,
}

/// Variables of the QEMU cluster template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuClusterVariables {
    /// Cluster name
    pub name: String,
    /// Libvirt connection URI
    pub libvirt_uri: String,
    /// Libvirt socket path, if connecting through a socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libvirt_socket_path: Option<String>,
    /// Path or URL of the node image
    pub constellation_os_image: String,
    /// `raw` or `qcow2`
    pub image_format: String,
    /// Always `uefi`
    pub constellation_boot_mode: String,
    /// Always `q35`
    pub machine: String,
    /// Metadata API container image
    pub metadata_api_image: String,
    /// Libvirt URI of the metadata container
    pub metadata_libvirt_uri: String,
    /// NVRAM template path
    pub nvram: String,
    /// Custom firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Node groups by name
    pub node_groups: BTreeMap<String, QemuNodeGroup>,
}

fn nvram_path(preset: &str, debug: bool) -> String {
    match (preset, debug) {
        ("production", false) => NVRAM_PRODUCTION.to_string(),
        ("production", true) | ("testing", _) => NVRAM_TESTING.to_string(),
        (path, _) => path.to_string(),
    }
}

/// Build QEMU variables for an already resolved libvirt target
pub fn qemu_variables(
    config: &ClusterConfig,
    image_ref: &str,
    libvirt: &LibvirtTarget,
) -> Result<QemuClusterVariables> {
    let qemu = config
        .provider
        .qemu
        .as_ref()
        .ok_or_else(|| Error::config_field("provider.qemu", "QEMU block is missing"))?;
    let node_groups = config
        .node_groups
        .iter()
        .map(|(name, g): (&String, &NodeGroup)| {
            (
                name.clone(),
                QemuNodeGroup {
                    role: role_name(g.role),
                    initial_count: g.initial_count,
                    disk_size: config.state_disk_size_gib,
                    vcpus: qemu.vcpus,
                    memory: qemu.memory,
                },
            )
        })
        .collect();
    Ok(QemuClusterVariables {
        name: config.name.clone(),
        libvirt_uri: libvirt.uri.clone(),
        libvirt_socket_path: libvirt.socket_path.clone(),
        constellation_os_image: image_ref.to_string(),
        image_format: qemu.image_format.clone(),
        constellation_boot_mode: "uefi".to_string(),
        machine: "q35".to_string(),
        metadata_api_image: qemu.metadata_api_server.clone(),
        metadata_libvirt_uri: libvirt.metadata_uri.clone(),
        nvram: nvram_path(&qemu.nvram, config.debug),
        firmware: (!qemu.firmware.is_empty()).then(|| qemu.firmware.clone()),
        node_groups,
    })
}

// =============================================================================
// Dispatch
// =============================================================================

/// Variables of any cluster template
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterVariables {
    /// AWS
    Aws(AwsClusterVariables),
    /// Azure
    Azure(AzureClusterVariables),
    /// GCP
    Gcp(GcpClusterVariables),
    /// OpenStack
    OpenStack(OpenStackClusterVariables),
    /// QEMU
    Qemu(QemuClusterVariables),
}

impl ClusterVariables {
    /// Provider of the template these variables belong to
    pub fn provider(&self) -> CloudProvider {
        match self {
            Self::Aws(_) => CloudProvider::Aws,
            Self::Azure(_) => CloudProvider::Azure,
            Self::Gcp(_) => CloudProvider::Gcp,
            Self::OpenStack(_) => CloudProvider::OpenStack,
            Self::Qemu(_) => CloudProvider::Qemu,
        }
    }

    /// Render as `terraform.tfvars`
    pub fn render(&self) -> Result<String> {
        let rendered = match self {
            Self::Aws(v) => tfvars::render(v),
            Self::Azure(v) => tfvars::render(v),
            Self::Gcp(v) => tfvars::render(v),
            Self::OpenStack(v) => tfvars::render(v),
            Self::Qemu(v) => tfvars::render(v),
        };
        Ok(rendered?)
    }
}

/// Build the variables for `config`; QEMU needs a resolved libvirt target
pub fn variables_for(
    config: &ClusterConfig,
    image_ref: &str,
    libvirt: Option<&LibvirtTarget>,
) -> Result<ClusterVariables> {
    Ok(match config.cloud_provider {
        CloudProvider::Aws => ClusterVariables::Aws(aws_variables(config, image_ref)?),
        CloudProvider::Azure => ClusterVariables::Azure(azure_variables(config, image_ref)?),
        CloudProvider::Gcp => ClusterVariables::Gcp(gcp_variables(config, image_ref)?),
        CloudProvider::OpenStack => {
            ClusterVariables::OpenStack(openstack_variables(config, image_ref)?)
        }
        CloudProvider::Qemu => {
            let libvirt = libvirt.ok_or_else(|| {
                Error::internal_with_context("variables_for", "QEMU requires a libvirt target")
            })?;
            ClusterVariables::Qemu(qemu_variables(config, image_ref, libvirt)?)
        }
    })
}

// =============================================================================
// IAM
// =============================================================================

/// Variables of the AWS IAM template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsIamVariables {
    /// Prefix of all resource names
    pub name_prefix: String,
    /// Region
    pub region: String,
}

/// Variables of the GCP IAM template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpIamVariables {
    /// Project id
    pub project_id: String,
    /// Region
    pub region: String,
    /// Zone
    pub zone: String,
    /// Service account to create
    pub service_account_id: String,
}

/// Variables of the Azure IAM template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureIamVariables {
    /// Service principal to create
    pub service_principal_name: String,
    /// Region
    pub region: String,
    /// Resource group to create
    pub resource_group_name: String,
}

/// Variables of any IAM template
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IamVariables {
    /// AWS
    Aws(AwsIamVariables),
    /// Azure
    Azure(AzureIamVariables),
    /// GCP
    Gcp(GcpIamVariables),
}

impl IamVariables {
    /// Build from the IAM input
    pub fn from_config(config: &IamConfig) -> Self {
        match config {
            IamConfig::Aws { prefix, region } => Self::Aws(AwsIamVariables {
                name_prefix: prefix.clone(),
                region: region.clone(),
            }),
            IamConfig::Azure {
                service_principal,
                region,
                resource_group,
            } => Self::Azure(AzureIamVariables {
                service_principal_name: service_principal.clone(),
                region: region.clone(),
                resource_group_name: resource_group.clone(),
            }),
            IamConfig::Gcp {
                project_id,
                region,
                zone,
                service_account_id,
            } => Self::Gcp(GcpIamVariables {
                project_id: project_id.clone(),
                region: region.clone(),
                zone: zone.clone(),
                service_account_id: service_account_id.clone(),
            }),
        }
    }

    /// Render as `terraform.tfvars`
    pub fn render(&self) -> Result<String> {
        let rendered = match self {
            Self::Aws(v) => tfvars::render(v),
            Self::Azure(v) => tfvars::render(v),
            Self::Gcp(v) => tfvars::render(v),
        };
        Ok(rendered?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use constellation_common::config::{
        AwsConfig, AzureConfig, GcpConfig, OpenStackConfig, ProviderConfigs, QemuConfig,
    };

    pub(crate) fn config_for(provider: CloudProvider) -> ClusterConfig {
        let mut node_groups = BTreeMap::new();
        node_groups.insert(
            "control_plane_default".to_string(),
            NodeGroup {
                role: NodeRole::ControlPlane,
                initial_count: 1,
                zone: "1,2".to_string(),
                instance_type: "m1".to_string(),
                disk_type: "ssd".to_string(),
            },
        );
        node_groups.insert(
            "worker_default".to_string(),
            NodeGroup {
                role: NodeRole::Worker,
                initial_count: 1,
                zone: String::new(),
                instance_type: "m1".to_string(),
                disk_type: "ssd".to_string(),
            },
        );
        let mut providers = ProviderConfigs::default();
        match provider {
            CloudProvider::Aws => {
                providers.aws = Some(AwsConfig {
                    region: "eu-central-1".to_string(),
                    zone: "eu-central-1a".to_string(),
                    iam_profile_control_plane: "cp".to_string(),
                    iam_profile_worker_nodes: "wk".to_string(),
                })
            }
            CloudProvider::Azure => {
                providers.azure = Some(AzureConfig {
                    subscription: "sub".to_string(),
                    tenant: "tenant".to_string(),
                    location: "westeurope".to_string(),
                    resource_group: "rg".to_string(),
                    user_assigned_identity: "/SUBSCRIPTIONS/sub/RESOURCEGROUPS/rg/PROVIDERS/MICROSOFT.MANAGEDIDENTITY/USERASSIGNEDIDENTITIES/id".to_string(),
                    secure_boot: false,
                })
            }
            CloudProvider::Gcp => {
                providers.gcp = Some(GcpConfig {
                    project: "proj".to_string(),
                    region: "europe-west3".to_string(),
                    zone: "europe-west3-b".to_string(),
                    service_account_key_path: String::new(),
                })
            }
            CloudProvider::OpenStack => {
                providers.openstack = Some(OpenStackConfig {
                    cloud: "stackit".to_string(),
                    floating_ip_pool_id: "pool".to_string(),
                })
            }
            CloudProvider::Qemu => providers.qemu = Some(QemuConfig::default()),
        }
        ClusterConfig {
            name: "c1".to_string(),
            cloud_provider: provider,
            image: "stream/debug/v2.3.0".to_string(),
            kubernetes_version: "v1.27.0".to_string(),
            state_disk_size_gib: 30,
            debug: false,
            custom_endpoint: String::new(),
            internal_load_balancer: false,
            provider: providers,
            node_groups,
            attestation_variant: None,
        }
    }

    fn local_libvirt() -> LibvirtTarget {
        resolve_libvirt("", 1000).unwrap()
    }

    // =========================================================================
    // Rendering round trips through the parser
    // =========================================================================

    #[test]
    fn every_provider_round_trips_through_tfvars() {
        for provider in CloudProvider::ALL {
            let config = config_for(provider);
            config.validate().unwrap();
            let vars = variables_for(&config, "image-ref", Some(&local_libvirt())).unwrap();
            let rendered = vars.render().unwrap();
            let reparsed = match &vars {
                ClusterVariables::Aws(_) => {
                    ClusterVariables::Aws(tfvars::from_str(&rendered).unwrap())
                }
                ClusterVariables::Azure(_) => {
                    ClusterVariables::Azure(tfvars::from_str(&rendered).unwrap())
                }
                ClusterVariables::Gcp(_) => {
                    ClusterVariables::Gcp(tfvars::from_str(&rendered).unwrap())
                }
                ClusterVariables::OpenStack(_) => {
                    ClusterVariables::OpenStack(tfvars::from_str(&rendered).unwrap())
                }
                ClusterVariables::Qemu(_) => {
                    ClusterVariables::Qemu(tfvars::from_str(&rendered).unwrap())
                }
            };
            assert_eq!(reparsed, vars, "{provider}");
            assert_eq!(vars.provider(), provider);
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let config = config_for(CloudProvider::Gcp);
        let a = variables_for(&config, "img", None).unwrap().render().unwrap();
        let b = variables_for(&config, "img", None).unwrap().render().unwrap();
        assert_eq!(a, b);
    }

    // =========================================================================
    // Provider specifics
    // =========================================================================

    #[test]
    fn azure_ids_are_normalised_and_zones_split() {
        let config = config_for(CloudProvider::Azure);
        let vars = azure_variables(
            &config,
            "/COMMUNITYGALLERIES/gallery/IMAGES/img/VERSIONS/1.0.0",
        )
        .unwrap();
        assert_eq!(
            vars.user_assigned_identity,
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/id"
        );
        assert_eq!(vars.image_id, "/communityGalleries/gallery/images/img/versions/1.0.0");
        assert_eq!(
            vars.node_groups["control_plane_default"].zones,
            Some(vec!["1".to_string(), "2".to_string()])
        );
        assert_eq!(vars.node_groups["worker_default"].zones, None);
        assert!(vars.confidential_vm);
        assert!(!vars.create_maa);
    }

    #[test]
    fn azure_variant_controls_maa_and_confidential_vm() {
        let mut config = config_for(CloudProvider::Azure);
        config.attestation_variant = Some(AttestationVariant::AzureSevSnp);
        let snp = azure_variables(&config, "img").unwrap();
        assert!(snp.create_maa);
        assert!(snp.confidential_vm);

        config.attestation_variant = Some(AttestationVariant::AzureTrustedLaunch);
        let tl = azure_variables(&config, "img").unwrap();
        assert!(!tl.create_maa);
        assert!(!tl.confidential_vm);
    }

    #[test]
    fn normalisation_is_idempotent() {
        let inputs = [
            "/subscriptions/a/resourcegroups/b/providers/microsoft.managedidentity/userassignedidentities/c",
            "/Subscriptions/A/ResourceGroups/B/Providers/Microsoft.ManagedIdentity/UserAssignedIdentities/C",
            "/communitygalleries/g/Images/i/VERSIONS/v",
            "no-slashes-at-all",
            "",
        ];
        for input in inputs {
            let once = normalize_azure_identity(input);
            assert_eq!(normalize_azure_identity(&once), once);
            let once = normalize_azure_image(input);
            assert_eq!(normalize_azure_image(&once), once);
        }
    }

    #[test]
    fn variant_flags_for_aws_and_gcp() {
        let mut aws = config_for(CloudProvider::Aws);
        assert!(!aws_variables(&aws, "ami").unwrap().enable_snp);
        aws.attestation_variant = Some(AttestationVariant::AwsSevSnp);
        assert!(aws_variables(&aws, "ami").unwrap().enable_snp);

        let mut gcp = config_for(CloudProvider::Gcp);
        assert_eq!(gcp_variables(&gcp, "img").unwrap().cc_technology, "SEV");
        gcp.attestation_variant = Some(AttestationVariant::GcpSevSnp);
        assert_eq!(gcp_variables(&gcp, "img").unwrap().cc_technology, "SEV_SNP");
    }

    #[test]
    fn openstack_without_cloud_omits_it() {
        let mut config = config_for(CloudProvider::OpenStack);
        config.provider.openstack.as_mut().unwrap().cloud = String::new();
        let vars = openstack_variables(&config, "img").unwrap();
        assert_eq!(vars.cloud, None);
        assert!(!tfvars::render(&vars).unwrap().contains("cloud ="));
    }

    // =========================================================================
    // QEMU
    // =========================================================================

    #[test]
    fn libvirt_uri_resolution() {
        let local = resolve_libvirt("", 1000).unwrap();
        assert!(local.start_container);
        assert_eq!(local.uri, LIBVIRT_TCP_CONNECT_URI);
        assert_eq!(local.metadata_uri, LIBVIRT_TCP_CONNECT_URI);
        assert_eq!(local.socket_path, None);

        let system = resolve_libvirt("qemu:///system", 1000).unwrap();
        assert_eq!(system.socket_path.as_deref(), Some(LIBVIRT_SYSTEM_SOCKET));
        assert_eq!(system.metadata_uri, "qemu:///system");

        let session = resolve_libvirt("qemu:///session", 1000).unwrap();
        assert_eq!(
            session.socket_path.as_deref(),
            Some("/run/user/1000/libvirt/libvirt-sock")
        );

        let unix = resolve_libvirt("qemu+unix:///system?socket=/tmp/sock&x=1", 0).unwrap();
        assert_eq!(unix.socket_path.as_deref(), Some("/tmp/sock"));

        let remote = resolve_libvirt("qemu+ssh://host/system", 0).unwrap();
        assert_eq!(remote.socket_path, None);
        assert_eq!(remote.metadata_uri, "qemu+ssh://host/system");
        assert!(!remote.start_container);
    }

    #[test]
    fn unix_uri_without_socket_is_rejected() {
        let err = resolve_libvirt("qemu+unix:///system", 0).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn session_socket_belongs_to_the_invoking_user() {
        use std::os::unix::fs::MetadataExt;

        let owned = tempfile::NamedTempFile::new().unwrap();
        let uid = owned.as_file().metadata().unwrap().uid();
        assert_eq!(current_uid(), uid);

        let session = resolve_libvirt("qemu:///session", current_uid()).unwrap();
        assert_eq!(
            session.socket_path.as_deref(),
            Some(format!("/run/user/{}/libvirt/libvirt-sock", uid).as_str())
        );
    }

    #[test]
    fn nvram_preset_follows_debug() {
        let mut config = config_for(CloudProvider::Qemu);
        let vars = qemu_variables(&config, "file:///img.raw", &local_libvirt()).unwrap();
        assert_eq!(vars.nvram, NVRAM_PRODUCTION);
        assert_eq!(vars.constellation_boot_mode, "uefi");
        assert_eq!(vars.machine, "q35");

        config.debug = true;
        let vars = qemu_variables(&config, "file:///img.raw", &local_libvirt()).unwrap();
        assert_eq!(vars.nvram, NVRAM_TESTING);
    }

    #[test]
    fn qemu_without_libvirt_target_is_internal_error() {
        let config = config_for(CloudProvider::Qemu);
        let err = variables_for(&config, "img", None).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    // =========================================================================
    // IAM
    // =========================================================================

    #[test]
    fn iam_variables_render_expected_names() {
        let vars = IamVariables::from_config(&IamConfig::Azure {
            service_principal: "sp".to_string(),
            region: "westeurope".to_string(),
            resource_group: "rg".to_string(),
        });
        let rendered = vars.render().unwrap();
        assert_eq!(
            rendered,
            "region = \"westeurope\"\nresource_group_name = \"rg\"\nservice_principal_name = \"sp\"\n"
        );
    }
}
