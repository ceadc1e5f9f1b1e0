//! Ordered, failure-tolerant rollback
//!
//! Each lifecycle step registers a compensating action once it has
//! succeeded. When a later step fails, [`RollbackComposer::rollback`] runs
//! the registered actions newest first. A failing compensation does not stop
//! the remaining ones; all failures are joined behind the original error.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::Error;

/// Undo action for a step that already succeeded
///
/// Implementations must be idempotent: running a compensation twice, or
/// after the resource disappeared on its own, succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Compensation: Send + Sync {
    /// Short human readable name for logs
    fn name(&self) -> String;

    /// Undo the step
    async fn compensate(&self) -> Result<(), Error>;
}

/// Collects compensations as steps succeed
#[derive(Default)]
pub struct RollbackComposer {
    actions: Vec<Box<dyn Compensation>>,
}

impl RollbackComposer {
    /// Empty composer
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the compensation of a step that just succeeded
    pub fn push(&mut self, action: Box<dyn Compensation>) {
        self.actions.push(action);
    }

    /// Number of registered compensations
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing was registered
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Forget all compensations (the whole operation succeeded)
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Run all compensations in reverse order and return their failures
    pub async fn run(self) -> Vec<Error> {
        let mut failures = Vec::new();
        for action in self.actions.into_iter().rev() {
            let name = action.name();
            info!(action = %name, "Rolling back");
            if let Err(e) = action.compensate().await {
                warn!(action = %name, error = %e, "Rollback step failed, continuing");
                failures.push(Error::internal_with_context(
                    format!("rollback:{}", name),
                    e.to_string(),
                ));
            }
        }
        failures
    }

    /// Roll back and attach rollback failures behind `cause`
    pub async fn rollback(self, cause: Error) -> Error {
        if self.is_empty() {
            return cause;
        }
        warn!(error = %cause, steps = self.len(), "Operation failed, rolling back");
        let failures = self.run().await;
        cause.with_followups(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendStep, ErrorKind};
    use crate::provider::CloudProvider;
    use std::sync::{Arc, Mutex};

    fn recording(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Box<dyn Compensation> {
        let mut mock = MockCompensation::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_compensate().times(1).returning(move || {
            log.lock().unwrap().push(name);
            if fail {
                Err(Error::internal("boom"))
            } else {
                Ok(())
            }
        });
        Box::new(mock)
    }

    #[tokio::test]
    async fn story_compensations_run_newest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut composer = RollbackComposer::new();
        composer.push(recording("first", log.clone(), false));
        composer.push(recording("second", log.clone(), false));
        composer.push(recording("third", log.clone(), false));

        let failures = composer.run().await;
        assert!(failures.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn story_failed_compensation_does_not_stop_rollback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut composer = RollbackComposer::new();
        composer.push(recording("destroy", log.clone(), false));
        composer.push(recording("stop-libvirt", log.clone(), true));

        let cause = Error::cloud_backend(BackendStep::Apply, CloudProvider::Qemu, "failed");
        let err = composer.rollback(cause).await;

        assert_eq!(*log.lock().unwrap(), vec!["stop-libvirt", "destroy"]);
        assert_eq!(err.kind(), ErrorKind::CloudBackend);
        assert_eq!(err.members().len(), 2);
    }

    #[tokio::test]
    async fn story_empty_rollback_returns_cause_unchanged() {
        let composer = RollbackComposer::new();
        let err = composer.rollback(Error::cancelled("apply")).await;
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
