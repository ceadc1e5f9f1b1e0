//! IaC backend driving the `terraform` CLI
//!
//! The backend only knows about directories and subcommands. What goes into
//! a directory is decided by [`crate::workspace::IacWorkspace`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use constellation_common::{BackendStep, CloudProvider, Error};

/// Failure of a single backend invocation
#[derive(Debug, Error)]
pub enum BackendError {
    /// Process could not be started or exited unsuccessfully
    #[error("{step}: {message}")]
    Failed {
        /// Subcommand that failed
        step: BackendStep,
        /// Captured stderr or spawn error
        message: String,
    },
    /// Cancellation token fired; the process was killed
    #[error("{step} cancelled")]
    Cancelled {
        /// Subcommand that was interrupted
        step: BackendStep,
    },
}

impl BackendError {
    fn failed(step: BackendStep, message: impl Into<String>) -> Self {
        Self::Failed {
            step,
            message: message.into(),
        }
    }

    /// Lift into the engine error for a workspace of `provider`
    pub fn into_error(self, provider: CloudProvider) -> Error {
        match self {
            Self::Failed { step, message } => Error::cloud_backend(step, provider, message),
            Self::Cancelled { step } => Error::cancelled(step.to_string()),
        }
    }
}

/// Verbosity of the backend's own log file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// No log file
    #[default]
    Off,
    /// Errors only
    Error,
    /// Warnings and errors
    Warn,
    /// Informational
    Info,
    /// Debug
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    fn as_env(&self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Error => Some("ERROR"),
            Self::Warn => Some("WARN"),
            Self::Info => Some("INFO"),
            Self::Debug => Some("DEBUG"),
            Self::Trace => Some("TRACE"),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_env().unwrap_or("OFF"))
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "" | "OFF" | "NONE" => Ok(Self::Off),
            "ERROR" => Ok(Self::Error),
            "WARN" => Ok(Self::Warn),
            "INFO" => Ok(Self::Info),
            "DEBUG" => Ok(Self::Debug),
            "TRACE" => Ok(Self::Trace),
            other => Err(Error::config_field(
                "tf-log",
                format!("unknown log level {:?}", other),
            )),
        }
    }
}

/// Operations on one IaC directory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IacBackend: Send + Sync {
    /// Download providers and modules
    async fn init(&self, dir: &Path, cancel: &CancellationToken) -> Result<(), BackendError>;

    /// Compute a plan into `plan_file`; `true` when it contains changes
    async fn plan(
        &self,
        dir: &Path,
        plan_file: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, BackendError>;

    /// Human readable rendering of a saved plan
    async fn show_plan(&self, dir: &Path, plan_file: &str) -> Result<String, BackendError>;

    /// Apply the configuration
    async fn apply(&self, dir: &Path, cancel: &CancellationToken) -> Result<(), BackendError>;

    /// Destroy every resource in the state
    async fn destroy(&self, dir: &Path, cancel: &CancellationToken) -> Result<(), BackendError>;

    /// Output values by name
    async fn output(&self, dir: &Path) -> Result<BTreeMap<String, Value>, BackendError>;
}

#[derive(Deserialize)]
struct OutputEntry {
    value: Value,
}

/// [`IacBackend`] running the `terraform` binary
#[derive(Clone, Debug)]
pub struct TerraformCli {
    program: PathBuf,
    leading_args: Vec<String>,
    log_level: LogLevel,
    log_path: Option<PathBuf>,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

impl TerraformCli {
    /// Run `binary` for every subcommand
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            program: binary.into(),
            leading_args: Vec::new(),
            log_level: LogLevel::Off,
            log_path: None,
        }
    }

    /// Run `program args... <subcommand>`, e.g. an interpreter plus a script
    pub fn with_program(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            leading_args: args,
            ..Self::new(program)
        }
    }

    /// Write the backend's own log at `level` to `path`
    pub fn with_log(mut self, level: LogLevel, path: impl Into<PathBuf>) -> Self {
        self.log_level = level;
        self.log_path = Some(path.into());
        self
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let (Some(level), Some(path)) = (self.log_level.as_env(), &self.log_path) {
            cmd.env("TF_LOG", level).env("TF_LOG_PATH", path);
        }
        cmd
    }

    async fn run(
        &self,
        step: BackendStep,
        dir: &Path,
        args: &[&str],
        cancel: Option<&CancellationToken>,
    ) -> Result<Output, BackendError> {
        debug!(step = %step, dir = %dir.display(), ?args, "running terraform");
        let child = self
            .command(dir, args)
            .spawn()
            .map_err(|e| BackendError::failed(step, format!("starting {}: {}", self.program.display(), e)))?;

        let waited = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(BackendError::Cancelled { step }),
                out = child.wait_with_output() => out,
            },
            None => child.wait_with_output().await,
        };
        waited.map_err(|e| BackendError::failed(step, e.to_string()))
    }

    async fn run_checked(
        &self,
        step: BackendStep,
        dir: &Path,
        args: &[&str],
        cancel: Option<&CancellationToken>,
    ) -> Result<Output, BackendError> {
        let output = self.run(step, dir, args, cancel).await?;
        if !output.status.success() {
            return Err(BackendError::failed(step, failure_message(&output)));
        }
        Ok(output)
    }
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    match output.status.code() {
        Some(code) if stderr.is_empty() => format!("exit status {}", code),
        Some(code) => format!("exit status {}: {}", code, stderr),
        None => format!("terminated by signal: {}", stderr),
    }
}

#[async_trait]
impl IacBackend for TerraformCli {
    async fn init(&self, dir: &Path, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.run_checked(BackendStep::Init, dir, &["init", "-input=false", "-no-color"], Some(cancel))
            .await?;
        Ok(())
    }

    async fn plan(
        &self,
        dir: &Path,
        plan_file: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, BackendError> {
        let out_arg = format!("-out={}", plan_file);
        let output = self
            .run(
                BackendStep::Plan,
                dir,
                &["plan", "-input=false", "-no-color", "-detailed-exitcode", &out_arg],
                Some(cancel),
            )
            .await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(2) => Ok(true),
            _ => Err(BackendError::failed(BackendStep::Plan, failure_message(&output))),
        }
    }

    async fn show_plan(&self, dir: &Path, plan_file: &str) -> Result<String, BackendError> {
        let output = self
            .run_checked(BackendStep::Show, dir, &["show", "-no-color", plan_file], None)
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn apply(&self, dir: &Path, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.run_checked(
            BackendStep::Apply,
            dir,
            &["apply", "-input=false", "-no-color", "-auto-approve"],
            Some(cancel),
        )
        .await?;
        Ok(())
    }

    async fn destroy(&self, dir: &Path, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.run_checked(
            BackendStep::Destroy,
            dir,
            &["destroy", "-input=false", "-no-color", "-auto-approve"],
            Some(cancel),
        )
        .await?;
        Ok(())
    }

    async fn output(&self, dir: &Path) -> Result<BTreeMap<String, Value>, BackendError> {
        let output = self
            .run_checked(BackendStep::Output, dir, &["output", "-json"], None)
            .await?;
        let parsed: BTreeMap<String, OutputEntry> = serde_json::from_slice(&output.stdout)
            .map_err(|e| BackendError::failed(BackendStep::Output, format!("parsing outputs: {}", e)))?;
        Ok(parsed.into_iter().map(|(k, v)| (k, v.value)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Shell script standing in for the terraform binary
    fn fake_terraform(dir: &Path, body: &str) -> TerraformCli {
        let script = dir.join("fake-terraform.sh");
        std::fs::write(&script, format!("set -u\n{}\n", body)).unwrap();
        TerraformCli::with_program("sh", vec![script.to_string_lossy().into_owned()])
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert_eq!("loud".parse::<LogLevel>().unwrap_err().exit_code(), 2);
        assert_eq!(LogLevel::Trace.to_string(), "TRACE");
    }

    #[tokio::test]
    async fn plan_maps_detailed_exit_codes() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let changes = fake_terraform(tmp.path(), "exit 2");
        assert!(changes.plan(tmp.path(), "plan.zip", &cancel).await.unwrap());

        let clean = fake_terraform(tmp.path(), "exit 0");
        assert!(!clean.plan(tmp.path(), "plan.zip", &cancel).await.unwrap());

        let broken = fake_terraform(tmp.path(), "echo 'provider crashed' >&2; exit 1");
        let err = broken.plan(tmp.path(), "plan.zip", &cancel).await.unwrap_err();
        assert!(err.to_string().contains("provider crashed"));
    }

    #[tokio::test]
    async fn subcommand_and_arguments_are_passed_through() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_terraform(tmp.path(), "echo \"$@\" > args.txt");
        cli.apply(tmp.path(), &CancellationToken::new()).await.unwrap();
        let args = std::fs::read_to_string(tmp.path().join("args.txt")).unwrap();
        assert_eq!(args.trim(), "apply -input=false -no-color -auto-approve");
    }

    #[tokio::test]
    async fn log_environment_is_set_when_enabled() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_terraform(tmp.path(), "echo \"$TF_LOG $TF_IN_AUTOMATION\" > env.txt")
            .with_log(LogLevel::Info, tmp.path().join("terraform.log"));
        cli.init(tmp.path(), &CancellationToken::new()).await.unwrap();
        let env = std::fs::read_to_string(tmp.path().join("env.txt")).unwrap();
        assert_eq!(env.trim(), "INFO 1");
    }

    #[tokio::test]
    async fn output_values_are_unwrapped() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_terraform(
            tmp.path(),
            r#"echo '{"ip":{"sensitive":false,"type":"string","value":"192.0.2.1"},"uid":{"sensitive":false,"type":"string","value":"abc"}}'"#,
        );
        let outputs = cli.output(tmp.path()).await.unwrap();
        assert_eq!(outputs["ip"], Value::String("192.0.2.1".to_string()));
        assert_eq!(outputs["uid"], Value::String("abc".to_string()));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_running_apply() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_terraform(tmp.path(), "sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = cli.apply(tmp.path(), &cancel).await.unwrap_err();
        assert!(matches!(err, BackendError::Cancelled { step: BackendStep::Apply }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(err.into_error(CloudProvider::Qemu), Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_backend_failure() {
        let tmp = TempDir::new().unwrap();
        let cli = TerraformCli::new(tmp.path().join("no-such-terraform"));
        let err = cli.init(tmp.path(), &CancellationToken::new()).await.unwrap_err();
        let err = err.into_error(CloudProvider::Gcp);
        assert!(matches!(
            err,
            Error::CloudBackend { step: BackendStep::Init, provider: CloudProvider::Gcp, .. }
        ));
    }
}
