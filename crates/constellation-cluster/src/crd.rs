//! NodeVersion custom resource
//!
//! The node operator inside the cluster rolls nodes towards the versions in
//! the spec. While it does so it reports an `Outdated` condition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the single NodeVersion object of a cluster
pub const NODE_VERSION_NAME: &str = "constellation-version";

/// Condition type set while nodes still run an older version
pub const CONDITION_OUTDATED: &str = "Outdated";

/// Desired node image and Kubernetes version of the cluster
///
/// Example:
/// ```yaml
/// apiVersion: update.edgeless.systems/v1alpha1
/// kind: NodeVersion
/// metadata:
///   name: constellation-version
/// spec:
///   imageReference: /communityGalleries/.../versions/2.3.0
///   imageVersion: v2.3.0
///   kubernetesComponentsReference: k8s-components-1a2b3c4d
///   kubernetesClusterVersion: v1.27.0
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "update.edgeless.systems",
    version = "v1alpha1",
    kind = "NodeVersion",
    plural = "nodeversions",
    status = "NodeVersionStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.imageVersion"}"#,
    printcolumn = r#"{"name":"Kubernetes","type":"string","jsonPath":".spec.kubernetesClusterVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionSpec {
    /// Provider specific reference of the node image
    #[serde(default)]
    pub image_reference: String,
    /// Version of the node image
    #[serde(default)]
    pub image_version: String,
    /// Name of the ConfigMap listing the Kubernetes components
    #[serde(default)]
    pub kubernetes_components_reference: String,
    /// Kubernetes version of the cluster
    #[serde(default)]
    pub kubernetes_cluster_version: String,
}

/// Progress reported by the node operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionStatus {
    /// Conditions of the rollout
    #[serde(default)]
    pub conditions: Vec<NodeVersionCondition>,
    /// Whether a Kubernetes cluster version upgrade is running
    #[serde(default)]
    pub active_cluster_version_upgrade: bool,
}

/// One status condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionCondition {
    /// Condition type, e.g. `Outdated`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl NodeVersion {
    /// Whether the node operator is still working on an earlier request
    pub fn upgrade_in_progress(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        status.active_cluster_version_upgrade
            || status
                .conditions
                .iter()
                .any(|c| c.type_ == CONDITION_OUTDATED && c.status == "True")
    }
}
