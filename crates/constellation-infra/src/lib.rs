//! Infrastructure for Constellation clusters: IaC workspaces, per-provider
//! variables, and the orchestrator driving create, upgrade and destroy

#![deny(missing_docs)]

pub mod backend;
pub mod image;
pub mod libvirt;
pub mod orchestrator;
pub mod policy_patcher;
pub mod rollback;
pub mod templates;
pub mod tfvars;
pub mod variables;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{IacBackend, LogLevel, TerraformCli};
pub use image::{ImageFetcher, ImageReferenceSource};
pub use libvirt::{DockerLibvirtRunner, LibvirtRunner};
pub use orchestrator::{
    AutoApprove, ClusterHandoff, CreateOutcome, InfraOrchestrator, PlanConfirmer, UpgradeOutcome,
};
pub use policy_patcher::{AzureCliTokenProvider, AzurePolicyPatcher, PolicyPatcher, ReqwestPolicyEndpoint};
pub use workspace::{IacWorkspace, IamOutput, InfraState, WorkspaceLock};
