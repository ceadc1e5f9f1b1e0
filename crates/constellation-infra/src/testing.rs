//! Filesystem-only IaC backend and helpers for tests

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use constellation_attestation::{FetchedMeasurements, HttpGetter, Measurement, MeasurementBundle, MeasurementSource};
use constellation_common::version::ImageVersion;
use constellation_common::{AttestationVariant, BackendStep};

use crate::backend::{BackendError, IacBackend};
use crate::workspace::{STATE_FILE, VARS_FILE};

pub(crate) const STUB_ENDPOINT: &str = "192.0.2.1";
pub(crate) const STUB_UID: &str = "stub-uid";
pub(crate) const STUB_INIT_SECRET: &str = "0123456789abcdef0123456789abcdef";

/// "Applies" by copying the variables file into the state file
///
/// A plan has a diff whenever state and variables differ, which makes
/// apply idempotent the same way a real backend is.
pub(crate) struct StubBackend {
    fail_apply: AtomicBool,
    fail_destroy: AtomicBool,
    outputs: Mutex<BTreeMap<String, Value>>,
    calls: Mutex<Vec<String>>,
}

impl StubBackend {
    pub(crate) fn new() -> Self {
        let mut outputs = BTreeMap::new();
        outputs.insert("ip".to_string(), Value::from(STUB_ENDPOINT));
        outputs.insert("uid".to_string(), Value::from(STUB_UID));
        outputs.insert("initSecret".to_string(), Value::from(STUB_INIT_SECRET));
        outputs.insert(
            "api_server_cert_sans".to_string(),
            Value::Array(vec![Value::from(STUB_ENDPOINT)]),
        );
        Self {
            fail_apply: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            outputs: Mutex::new(outputs),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_destroy(&self) {
        self.fail_destroy.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_output(&self, key: &str, value: Value) {
        self.outputs.lock().unwrap().insert(key.to_string(), value);
    }

    /// Subcommands in call order
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

fn read(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn failed(step: BackendStep, message: &str) -> BackendError {
    BackendError::Failed {
        step,
        message: message.to_string(),
    }
}

#[async_trait]
impl IacBackend for StubBackend {
    async fn init(&self, _dir: &Path, _cancel: &CancellationToken) -> Result<(), BackendError> {
        self.record("init");
        Ok(())
    }

    async fn plan(
        &self,
        dir: &Path,
        plan_file: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool, BackendError> {
        self.record("plan");
        let vars = read(&dir.join(VARS_FILE)).ok_or_else(|| failed(BackendStep::Plan, "no variables"))?;
        std::fs::write(dir.join(plan_file), &vars).map_err(|e| failed(BackendStep::Plan, &e.to_string()))?;
        Ok(read(&dir.join(STATE_FILE)).as_deref() != Some(vars.as_str()))
    }

    async fn show_plan(&self, dir: &Path, plan_file: &str) -> Result<String, BackendError> {
        self.record("show");
        let plan = read(&dir.join(plan_file)).ok_or_else(|| failed(BackendStep::Show, "no plan"))?;
        Ok(format!("Planned variables:\n{}", plan))
    }

    async fn apply(&self, dir: &Path, _cancel: &CancellationToken) -> Result<(), BackendError> {
        self.record("apply");
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(failed(BackendStep::Apply, "quota exceeded"));
        }
        let vars = read(&dir.join(VARS_FILE)).ok_or_else(|| failed(BackendStep::Apply, "no variables"))?;
        std::fs::write(dir.join(STATE_FILE), vars).map_err(|e| failed(BackendStep::Apply, &e.to_string()))
    }

    async fn destroy(&self, dir: &Path, _cancel: &CancellationToken) -> Result<(), BackendError> {
        self.record("destroy");
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(failed(BackendStep::Destroy, "resource locked"));
        }
        match std::fs::remove_file(dir.join(STATE_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(failed(BackendStep::Destroy, &e.to_string())),
        }
    }

    async fn output(&self, _dir: &Path) -> Result<BTreeMap<String, Value>, BackendError> {
        self.record("output");
        Ok(self.outputs.lock().unwrap().clone())
    }
}

mockall::mock! {
    pub(crate) Http {}

    #[async_trait]
    impl HttpGetter for Http {
        async fn get(&self, url: &str) -> constellation_common::Result<Vec<u8>>;
    }
}

/// Measurements source answering every request with two enforced PCRs
pub(crate) struct StaticMeasurements;

#[async_trait]
impl MeasurementSource for StaticMeasurements {
    async fn fetch(
        &self,
        image: &ImageVersion,
        variant: AttestationVariant,
        _cancel: &CancellationToken,
    ) -> constellation_common::Result<FetchedMeasurements> {
        let mut measurements = BTreeMap::new();
        measurements.insert(4, Measurement::enforced([0x44; 32]));
        measurements.insert(9, Measurement::enforced([0x99; 32]));
        measurements.insert(12, Measurement::warn_only([0x12; 32]));
        Ok(FetchedMeasurements {
            bundle: MeasurementBundle {
                image: image.clone(),
                variant,
                measurements,
            },
            document_sha256: "00".repeat(32),
            from_cache: false,
        })
    }
}

/// Every file below `root` keyed by its `/`-separated relative path
pub(crate) fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out);
            } else if let Ok(bytes) = std::fs::read(&path) {
                let rel = path
                    .strip_prefix(base)
                    .unwrap()
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.insert(rel, bytes);
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}
