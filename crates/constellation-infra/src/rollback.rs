//! Compensations for infrastructure steps

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use constellation_common::rollback::Compensation;
use constellation_common::Error;

use crate::libvirt::LibvirtRunner;
use crate::workspace::IacWorkspace;

/// Destroy whatever a workspace created, then delete the workspace
pub struct WorkspaceCompensation {
    workspace: IacWorkspace,
    cancel: CancellationToken,
}

impl WorkspaceCompensation {
    /// Compensation for `workspace`
    ///
    /// `cancel` should be a fresh token: the operation's own token may be
    /// the reason the rollback is running.
    pub fn new(workspace: IacWorkspace, cancel: CancellationToken) -> Self {
        Self { workspace, cancel }
    }
}

#[async_trait]
impl Compensation for WorkspaceCompensation {
    fn name(&self) -> String {
        format!("destroy {}", self.workspace.dir().display())
    }

    async fn compensate(&self) -> Result<(), Error> {
        self.workspace.destroy(&self.cancel).await?;
        self.workspace.cleanup_workspace()
    }
}

/// Stop the local libvirt container
pub struct LibvirtCompensation {
    runner: Arc<dyn LibvirtRunner>,
}

impl LibvirtCompensation {
    /// Compensation stopping `runner`
    pub fn new(runner: Arc<dyn LibvirtRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Compensation for LibvirtCompensation {
    fn name(&self) -> String {
        "stop libvirt".to_string()
    }

    async fn compensate(&self) -> Result<(), Error> {
        self.runner.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libvirt::MockLibvirtRunner;
    use crate::templates::template_for;
    use crate::testing::StubBackend;
    use constellation_common::rollback::RollbackComposer;
    use constellation_common::CloudProvider;
    use tempfile::TempDir;

    #[tokio::test]
    async fn story_qemu_rollback_destroys_before_stopping_libvirt() {
        let tmp = TempDir::new().unwrap();
        let stub = Arc::new(StubBackend::new());
        let ws = IacWorkspace::new(tmp.path().join("tf"), stub.clone(), CloudProvider::Qemu);
        ws.prepare(&template_for(CloudProvider::Qemu), "name = \"c1\"\n").unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut runner = MockLibvirtRunner::new();
        let seen = order.clone();
        let stub_for_stop = stub.clone();
        runner.expect_stop().times(1).returning(move || {
            seen.lock().unwrap().push(stub_for_stop.count("destroy"));
            Ok(())
        });

        let mut composer = RollbackComposer::new();
        composer.push(Box::new(LibvirtCompensation::new(Arc::new(runner))));
        composer.push(Box::new(WorkspaceCompensation::new(ws.clone(), CancellationToken::new())));
        let failures = composer.run().await;

        assert!(failures.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![1]);
        assert!(!ws.dir().exists());
    }

    #[tokio::test]
    async fn workspace_compensation_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let stub = Arc::new(StubBackend::new());
        let ws = IacWorkspace::new(tmp.path().join("tf"), stub.clone(), CloudProvider::Gcp);
        ws.prepare(&template_for(CloudProvider::Gcp), "name = \"c1\"\n").unwrap();

        let compensation = WorkspaceCompensation::new(ws, CancellationToken::new());
        compensation.compensate().await.unwrap();
        compensation.compensate().await.unwrap();
        assert_eq!(stub.count("destroy"), 1);
    }
}
