//! Dry-Run Sessions
//!
//! A preview runs every command in test mode and collects what each host
//! reported. Only one preview may be in flight; starting one discards the
//! leftovers of the previous, and dropping an unfinished guard abandons
//! its results.

use crate::domain::ports::CommandOutput;
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-host outputs collected during a preview
pub type PreviewSink = Arc<DashMap<String, Vec<CommandOutput>>>;

/// Serializes previews and owns their result map
#[derive(Debug)]
pub struct DryRunSession {
    gate: Arc<tokio::sync::Mutex<()>>,
    results: PreviewSink,
    current: Mutex<Option<CancellationToken>>,
}

impl Default for DryRunSession {
    fn default() -> Self {
        Self {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            results: Arc::new(DashMap::new()),
            current: Mutex::new(None),
        }
    }
}

impl DryRunSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a preview, waiting for a running one to finish
    pub async fn begin(self: &Arc<Self>) -> DryRunGuard {
        let permit = self.gate.clone().lock_owned().await;
        self.results.clear();

        let token = CancellationToken::new();
        *self.current.lock() = Some(token.clone());
        debug!("Dry run started");

        DryRunGuard {
            session: Arc::clone(self),
            token,
            finished: false,
            _permit: permit,
        }
    }

    /// Cancel the preview in flight, if any
    pub fn cancel(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(token) => {
                info!("Cancelling dry run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }

    fn close(&self) {
        *self.current.lock() = None;
    }
}

/// Held while a preview runs
#[derive(Debug)]
pub struct DryRunGuard {
    session: Arc<DryRunSession>,
    token: CancellationToken,
    finished: bool,
    _permit: OwnedMutexGuard<()>,
}

impl DryRunGuard {
    pub fn sink(&self) -> PreviewSink {
        Arc::clone(&self.session.results)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close the preview and hand out what was collected
    pub fn finish(mut self) -> Result<DryRunReport> {
        self.finished = true;
        self.session.close();
        if self.token.is_cancelled() {
            self.session.results.clear();
            return Err(Error::DryRunCancelled);
        }

        let outputs: BTreeMap<String, Vec<CommandOutput>> = self
            .session
            .results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.session.results.clear();
        debug!("Dry run finished with {} host(s)", outputs.len());
        Ok(DryRunReport { outputs })
    }
}

impl Drop for DryRunGuard {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Dry run abandoned");
            self.token.cancel();
            self.session.results.clear();
            self.session.close();
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Everything a preview would have done, per host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DryRunReport {
    pub outputs: BTreeMap<String, Vec<CommandOutput>>,
}

impl DryRunReport {
    pub fn host(&self, host: &str) -> &[CommandOutput] {
        self.outputs.get(host).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hosts where at least one step did not exit cleanly
    pub fn failed_hosts(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .filter(|(_, outputs)| outputs.iter().any(|o| !o.success()))
            .map(|(host, _)| host.as_str())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_hosts().is_empty()
    }

    /// Human readable summary
    pub fn render_text(&self) -> String {
        let mut text = String::new();
        for (host, outputs) in &self.outputs {
            let _ = writeln!(text, "== {} ==", host);
            for output in outputs {
                let _ = writeln!(text, "$ {}", output.line);
                for line in output.output.lines() {
                    let _ = writeln!(text, "  {}", line);
                }
                if !output.success() {
                    let _ = writeln!(text, "  (exit code {})", output.exit_code);
                }
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ExecMode;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn output(host: &str, line: &str, exit_code: i32) -> CommandOutput {
        CommandOutput {
            host: host.into(),
            line: line.into(),
            exit_code,
            output: "ok".into(),
            mode: ExecMode::Test,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_finish_collects_results() {
        let session = DryRunSession::new();
        let guard = session.begin().await;
        assert!(session.is_running());
        guard
            .sink()
            .entry("alpha".into())
            .or_default()
            .push(output("alpha", "drbdadm -d adjust r0", 0));
        guard
            .sink()
            .entry("beta".into())
            .or_default()
            .push(output("beta", "drbdadm -d adjust r0", 10));

        let report = guard.finish().unwrap();
        assert!(!session.is_running());
        assert_eq!(report.host("alpha").len(), 1);
        assert_eq!(report.failed_hosts(), vec!["beta"]);
        assert!(report.render_text().contains("== beta ==\n$ drbdadm -d adjust r0"));
    }

    #[tokio::test]
    async fn test_second_preview_waits_for_first() {
        let session = DryRunSession::new();
        let first = session.begin().await;

        let mut second = tokio_test::task::spawn(session.begin());
        tokio_test::assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        let guard = tokio_test::assert_ready!(second.poll());
        assert!(session.is_running());
        assert!(guard.finish().unwrap().outputs.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_and_abandoned_runs_leave_nothing() {
        let session = DryRunSession::new();

        let guard = session.begin().await;
        guard.sink().entry("alpha".into()).or_default().push(output("alpha", "x", 0));
        assert!(session.cancel());
        assert_matches!(guard.finish(), Err(Error::DryRunCancelled));

        {
            let guard = session.begin().await;
            guard.sink().entry("alpha".into()).or_default().push(output("alpha", "x", 0));
        }
        assert!(!session.is_running());

        let guard = session.begin().await;
        assert!(guard.finish().unwrap().outputs.is_empty());
    }
}
