//! External workflow dispatch.
//!
//! Once an acquisition's frames and metadata artifact are on disk, the
//! data-management pipeline takes over: an external command-line tool is
//! invoked with a workflow name and `key:value` arguments pointing at the
//! artifact. Dispatch is fire-and-forget: the spawned task retries a
//! bounded number of times, logs stderr from the external process, and
//! records the outcome in a ledger. Failures never surface to the
//! acquisition caller; the scientific data is already on disk by the time
//! dispatch happens.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::acquire::documents::now_ns;
use crate::config::WorkflowConfig;
use crate::retry::RetryPolicy;
use crate::signal::Signal;

/// Which pipeline leg to run after transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Move the data to storage only
    Transfer,
    /// Move the data and submit it for XPCS analysis
    Analysis,
}

impl DispatchMode {
    /// Mode from the request's submit-for-analysis flag
    pub fn from_analysis_flag(analysis: bool) -> Self {
        if analysis {
            DispatchMode::Analysis
        } else {
            DispatchMode::Transfer
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchMode::Transfer => "transfer",
            DispatchMode::Analysis => "analysis",
        }
    }
}

/// Outcome of one dispatch, success or not
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    /// Artifact the workflow was pointed at
    pub artifact: PathBuf,
    /// Workflow name passed to the external tool
    pub workflow: String,
    pub mode: &'static str,
    /// Attempts consumed, including the successful one
    pub attempts: u32,
    pub succeeded: bool,
    /// Last stderr captured from the external process
    pub stderr: String,
    /// Nanoseconds since Unix epoch when the dispatch concluded
    pub completed_ns: u64,
}

/// Shared record of every dispatch this process has made
#[derive(Debug, Clone, Default)]
pub struct DispatchLedger {
    inner: Arc<parking_lot::Mutex<Vec<DispatchRecord>>>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: DispatchRecord) {
        self.inner.lock().push(record);
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Bridge to the out-of-process data-management pipeline
#[derive(Debug, Clone)]
pub struct WorkflowBridge {
    command: String,
    transfer_workflow: String,
    analysis_workflow: String,
    group_name: String,
    retry: RetryPolicy,
    ledger: DispatchLedger,
    in_flight: Signal<u32>,
}

impl WorkflowBridge {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            command: config.command.clone(),
            transfer_workflow: config.transfer_workflow.clone(),
            analysis_workflow: config.analysis_workflow.clone(),
            group_name: config.group_name.clone(),
            retry: RetryPolicy::new(config.max_attempts, config.retry_backoff),
            ledger: DispatchLedger::new(),
            in_flight: Signal::new("workflow.in_flight", 0u32)
                .with_description("dispatch tasks not yet concluded"),
        }
    }

    /// Ledger handle; clones share the same records
    pub fn ledger(&self) -> DispatchLedger {
        self.ledger.clone()
    }

    /// Dispatches issued but not yet recorded in the ledger
    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.get()
    }

    /// Wait until every dispatch issued so far has concluded.
    ///
    /// Returns `false` if dispatches are still in flight when `timeout`
    /// elapses. One-shot callers drain here before returning from `main`;
    /// a detached dispatch task is cancelled by runtime teardown, losing
    /// the handoff and its ledger record.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.in_flight.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.in_flight.get() == 0;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return self.in_flight.get() == 0;
                }
            }
        }
    }

    fn workflow_for(&self, mode: DispatchMode) -> &str {
        match mode {
            DispatchMode::Transfer => &self.transfer_workflow,
            DispatchMode::Analysis => &self.analysis_workflow,
        }
    }

    /// `<workflow> filePath:<artifact> [qmapFile:<qmap>] xpcsGroupName:<group>`
    fn build_args(&self, workflow: &str, artifact: &Path, qmap: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            workflow.to_string(),
            format!("filePath:{}", artifact.display()),
        ];
        if let Some(qmap) = qmap {
            args.push(format!("qmapFile:{}", qmap.display()));
        }
        args.push(format!("xpcsGroupName:{}", self.group_name));
        args
    }

    /// Start the pipeline for `artifact` without blocking.
    ///
    /// The returned handle is only useful to tests; production callers
    /// drop it and rely on the ledger and logs.
    pub fn dispatch(
        &self,
        artifact: &Path,
        qmap: Option<&Path>,
        mode: DispatchMode,
    ) -> tokio::task::JoinHandle<()> {
        let workflow = self.workflow_for(mode).to_string();
        let args = self.build_args(&workflow, artifact, qmap);
        let command = self.command.clone();
        let retry = self.retry;
        let ledger = self.ledger.clone();
        let artifact = artifact.to_path_buf();
        // Counted before the task exists so a wait_idle between dispatch
        // and first poll cannot observe an idle gap
        self.in_flight.update(|n| *n += 1);
        let in_flight = self.in_flight.clone();

        info!(
            workflow = %workflow,
            mode = mode.label(),
            artifact = %artifact.display(),
            "dispatching workflow"
        );
        tokio::spawn(async move {
            let mut attempts = 0;
            let mut succeeded = false;
            let mut last_stderr = String::new();

            for attempt in 1..=retry.max_attempts {
                attempts = attempt;
                match Command::new(&command).args(&args).output().await {
                    Ok(output) => {
                        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                        if !stderr.is_empty() {
                            error!(
                                workflow = %workflow,
                                artifact = %artifact.display(),
                                stderr = %stderr,
                                "workflow emitted stderr"
                            );
                            last_stderr = stderr;
                        }
                        if output.status.success() {
                            succeeded = true;
                            break;
                        }
                        warn!(
                            workflow = %workflow,
                            status = ?output.status.code(),
                            attempt,
                            "workflow exited nonzero"
                        );
                    }
                    Err(e) => {
                        warn!(
                            command = %command,
                            error = %e,
                            attempt,
                            "failed to launch workflow command"
                        );
                        last_stderr = e.to_string();
                    }
                }
                if retry.has_next(attempt) {
                    tokio::time::sleep(retry.backoff).await;
                }
            }

            if succeeded {
                info!(workflow = %workflow, artifact = %artifact.display(), attempts, "workflow dispatched");
            } else {
                error!(
                    workflow = %workflow,
                    artifact = %artifact.display(),
                    attempts,
                    "workflow dispatch failed; data remains on disk"
                );
            }
            ledger.push(DispatchRecord {
                artifact,
                workflow,
                mode: mode.label(),
                attempts,
                succeeded,
                stderr: last_stderr,
                completed_ns: now_ns(),
            });
            in_flight.update(|n| *n = n.saturating_sub(1));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bridge_with(command: &str, max_attempts: u32) -> WorkflowBridge {
        WorkflowBridge {
            command: command.to_string(),
            transfer_workflow: "xpcs-transfer".to_string(),
            analysis_workflow: "xpcs-analysis".to_string(),
            group_name: "xpcs".to_string(),
            retry: RetryPolicy::new(max_attempts, Duration::from_millis(1)),
            ledger: DispatchLedger::new(),
            in_flight: Signal::new("workflow.in_flight", 0u32),
        }
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("dm.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn args_follow_the_key_value_contract() {
        let bridge = bridge_with("dm-start-processing-job", 1);
        let args = bridge.build_args(
            "xpcs-analysis",
            Path::new("/data/A001_metadata.json"),
            Some(Path::new("/data/qmap.h5")),
        );
        assert_eq!(
            args,
            vec![
                "xpcs-analysis".to_string(),
                "filePath:/data/A001_metadata.json".to_string(),
                "qmapFile:/data/qmap.h5".to_string(),
                "xpcsGroupName:xpcs".to_string(),
            ]
        );

        let args = bridge.build_args("xpcs-transfer", Path::new("/data/meta.json"), None);
        assert!(!args.iter().any(|a| a.starts_with("qmapFile:")));
    }

    #[test]
    fn mode_selects_the_workflow() {
        let bridge = bridge_with("dm", 1);
        assert_eq!(bridge.workflow_for(DispatchMode::Transfer), "xpcs-transfer");
        assert_eq!(bridge.workflow_for(DispatchMode::Analysis), "xpcs-analysis");
        assert_eq!(
            DispatchMode::from_analysis_flag(true),
            DispatchMode::Analysis
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_captured_without_failing_the_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "echo \"$@\" >&2\nexit 0");
        let bridge = bridge_with(cmd.to_str().unwrap(), 3);

        bridge
            .dispatch(
                Path::new("/data/meta.json"),
                None,
                DispatchMode::Analysis,
            )
            .await
            .unwrap();

        let records = bridge.ledger().records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.succeeded);
        assert_eq!(record.attempts, 1);
        assert!(record.stderr.contains("filePath:/data/meta.json"));
        assert!(record.stderr.contains("xpcsGroupName:xpcs"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_consumes_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "exit 3");
        let bridge = bridge_with(cmd.to_str().unwrap(), 2);

        bridge
            .dispatch(Path::new("/data/meta.json"), None, DispatchMode::Transfer)
            .await
            .unwrap();

        let records = bridge.ledger().records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].succeeded);
        assert_eq!(records[0].attempts, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_idle_holds_until_the_outcome_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "sleep 0.3\nexit 0");
        let bridge = bridge_with(cmd.to_str().unwrap(), 1);

        // Nothing dispatched yet: already idle
        assert!(bridge.wait_idle(Duration::from_millis(1)).await);

        let _handle = bridge.dispatch(Path::new("/data/meta.json"), None, DispatchMode::Transfer);
        assert_eq!(bridge.in_flight_count(), 1);

        // A caller that returns now would lose the outcome
        assert!(!bridge.wait_idle(Duration::from_millis(20)).await);
        assert!(bridge.ledger().is_empty());

        assert!(bridge.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(bridge.in_flight_count(), 0);
        let records = bridge.ledger().records();
        assert_eq!(records.len(), 1);
        assert!(records[0].succeeded);
    }

    #[tokio::test]
    async fn missing_command_is_logged_not_raised() {
        let bridge = bridge_with("/nonexistent/dm-start-processing-job", 2);
        bridge
            .dispatch(Path::new("/data/meta.json"), None, DispatchMode::Transfer)
            .await
            .unwrap();

        let records = bridge.ledger().records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].succeeded);
        assert!(!records[0].stderr.is_empty());
    }
}
