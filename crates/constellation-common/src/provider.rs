//! Cloud providers and attestation variants

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Cloud service provider hosting the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// Google Cloud Platform
    Gcp,
    /// OpenStack
    OpenStack,
    /// Local QEMU/libvirt
    Qemu,
}

impl CloudProvider {
    /// All providers in a stable order
    pub const ALL: [CloudProvider; 5] = [
        CloudProvider::Aws,
        CloudProvider::Azure,
        CloudProvider::Gcp,
        CloudProvider::OpenStack,
        CloudProvider::Qemu,
    ];

    /// Lowercase identifier used in paths, image lists, and template names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
            Self::OpenStack => "openstack",
            Self::Qemu => "qemu",
        }
    }

    /// Whether an IAM workspace exists for this provider
    pub fn supports_iam(&self) -> bool {
        matches!(self, Self::Aws | Self::Azure | Self::Gcp)
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
            Self::Gcp => "GCP",
            Self::OpenStack => "OpenStack",
            Self::Qemu => "QEMU",
        };
        f.write_str(s)
    }
}

impl FromStr for CloudProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            "openstack" => Ok(Self::OpenStack),
            "qemu" => Ok(Self::Qemu),
            _ => Err(Error::config_field(
                "cloudProvider",
                format!("unknown cloud provider '{}'", s),
            )),
        }
    }
}

/// Pairing of cloud provider and attestation hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttestationVariant {
    /// AWS Nitro with vTPM
    AwsNitroTpm,
    /// AWS SEV-SNP
    AwsSevSnp,
    /// Azure confidential VM with SEV-SNP
    AzureSevSnp,
    /// Azure confidential VM with TDX
    AzureTdx,
    /// Azure trusted launch (no memory encryption)
    AzureTrustedLaunch,
    /// GCP SEV-ES
    GcpSevEs,
    /// GCP SEV-SNP
    GcpSevSnp,
    /// QEMU with a virtual TPM
    QemuVtpm,
    /// QEMU with TDX
    QemuTdx,
}

impl AttestationVariant {
    /// Every known variant
    pub const ALL: [AttestationVariant; 9] = [
        Self::AwsNitroTpm,
        Self::AwsSevSnp,
        Self::AzureSevSnp,
        Self::AzureTdx,
        Self::AzureTrustedLaunch,
        Self::GcpSevEs,
        Self::GcpSevSnp,
        Self::QemuVtpm,
        Self::QemuTdx,
    ];

    /// Wire tag, e.g. `azure-sev-snp`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwsNitroTpm => "aws-nitro-tpm",
            Self::AwsSevSnp => "aws-sev-snp",
            Self::AzureSevSnp => "azure-sev-snp",
            Self::AzureTdx => "azure-tdx",
            Self::AzureTrustedLaunch => "azure-trustedlaunch",
            Self::GcpSevEs => "gcp-sev-es",
            Self::GcpSevSnp => "gcp-sev-snp",
            Self::QemuVtpm => "qemu-vtpm",
            Self::QemuTdx => "qemu-tdx",
        }
    }

    /// Cloud provider this variant runs on
    pub fn provider(&self) -> CloudProvider {
        match self {
            Self::AwsNitroTpm | Self::AwsSevSnp => CloudProvider::Aws,
            Self::AzureSevSnp | Self::AzureTdx | Self::AzureTrustedLaunch => CloudProvider::Azure,
            Self::GcpSevEs | Self::GcpSevSnp => CloudProvider::Gcp,
            Self::QemuVtpm | Self::QemuTdx => CloudProvider::Qemu,
        }
    }

    /// Variant used when the configuration does not name one
    pub fn default_for(provider: CloudProvider) -> Self {
        match provider {
            CloudProvider::Aws => Self::AwsSevSnp,
            CloudProvider::Azure => Self::AzureSevSnp,
            CloudProvider::Gcp => Self::GcpSevEs,
            CloudProvider::OpenStack | CloudProvider::Qemu => Self::QemuVtpm,
        }
    }
}

impl fmt::Display for AttestationVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttestationVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == lower)
            .ok_or_else(|| {
                Error::config_field(
                    "attestationVariant",
                    format!("unknown attestation variant '{}'", s),
                )
            })
    }
}

impl Serialize for AttestationVariant {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AttestationVariant {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
