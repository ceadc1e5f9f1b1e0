//! Kubernetes components a node installs for a cluster version

use std::collections::BTreeMap;

use aws_lc_rs::digest::{digest, SHA256};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

use constellation_common::version::with_v_prefix;
use constellation_common::{Error, Result, CONSTELLATION_NAMESPACE};

/// Prefix of components ConfigMap names
pub const COMPONENTS_PREFIX: &str = "k8s-components-";

/// Data key holding the component list
pub const COMPONENTS_KEY: &str = "components";

const RELEASE_URL: &str = "https://dl.k8s.io/release";

/// One downloadable component
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesComponent {
    /// Download location
    pub url: String,
    /// `sha256:<hex>` of the download; empty when not pinned
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Where the node places the file
    pub install_path: String,
    /// Whether the download is an archive to unpack
    #[serde(default)]
    pub extract: bool,
}

/// kubelet, kubeadm and kubectl of `version`
pub fn default_components(version: &str) -> Vec<KubernetesComponent> {
    let version = with_v_prefix(version);
    ["kubelet", "kubeadm", "kubectl"]
        .iter()
        .map(|binary| KubernetesComponent {
            url: format!("{}/{}/bin/linux/amd64/{}", RELEASE_URL, version, binary),
            hash: String::new(),
            install_path: format!("/run/state/bin/{}", binary),
            extract: false,
        })
        .collect()
}

/// Immutable ConfigMap listing `components`, named after their digest
///
/// Equal component lists always map to the same name, so creating the map
/// twice is harmless.
pub fn components_config_map(components: &[KubernetesComponent]) -> Result<ConfigMap> {
    let json = serde_json::to_string(components)
        .map_err(|e| Error::internal_with_context("kubernetes components", e.to_string()))?;
    let hashed = hex::encode(digest(&SHA256, json.as_bytes()));
    let name = format!("{}{}", COMPONENTS_PREFIX, &hashed[..8]);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(CONSTELLATION_NAMESPACE.to_string()),
            ..Default::default()
        },
        immutable: Some(true),
        data: Some(BTreeMap::from([(COMPONENTS_KEY.to_string(), json)])),
        ..Default::default()
    })
}
