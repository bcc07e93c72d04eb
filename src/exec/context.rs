//! Execution Context
//!
//! Every operation takes one [`ExecContext`]. It carries the mode and, for
//! previews, the sink that collects per-host output, so the same code path
//! serves live runs and dry runs.

use super::session::{DryRunGuard, PreviewSink};
use crate::domain::ports::{
    CommandExecutorRef, CommandOutput, CommandRequest, DeployRequest, ExecMode,
};
use crate::error::{Error, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ExecContext {
    mode: ExecMode,
    executor: CommandExecutorRef,
    sink: Option<PreviewSink>,
    cancel: CancellationToken,
}

impl ExecContext {
    pub fn live(executor: CommandExecutorRef) -> Self {
        Self {
            mode: ExecMode::Live,
            executor,
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Test-mode context feeding a running preview
    pub fn preview(executor: CommandExecutorRef, guard: &DryRunGuard) -> Self {
        Self {
            mode: ExecMode::Test,
            executor,
            sink: Some(guard.sink()),
            cancel: guard.token(),
        }
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn is_test(&self) -> bool {
        self.mode.is_test()
    }

    pub fn executor(&self) -> &CommandExecutorRef {
        &self.executor
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::DryRunCancelled);
        }
        Ok(())
    }

    fn record(&self, output: &CommandOutput) {
        if let Some(sink) = &self.sink {
            sink.entry(output.host.clone()).or_default().push(output.clone());
        }
    }

    fn record_failure(&self, host: &str, line: &str, err: &Error) {
        self.record(&CommandOutput {
            host: host.to_string(),
            line: line.to_string(),
            exit_code: -1,
            output: err.to_string(),
            mode: self.mode,
            finished_at: Utc::now(),
        });
    }

    /// Handle a finished step: live failures become errors, test results
    /// are collected whatever their exit status
    fn settle(
        &self,
        command: &str,
        result: Result<CommandOutput>,
        host: &str,
        line: &str,
    ) -> Result<CommandOutput> {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                warn!("{} on {} failed: {}", command, host, err);
                if self.is_test() {
                    self.record_failure(host, line, &err);
                }
                return Err(err);
            }
        };

        match self.mode {
            ExecMode::Live if !output.success() => Err(Error::CommandFailed {
                host: output.host.clone(),
                command: output.line.clone(),
                exit_code: output.exit_code,
                output: output.output.clone(),
            }),
            ExecMode::Live => Ok(output),
            ExecMode::Test => {
                self.record(&output);
                Ok(output)
            }
        }
    }

    /// Run a command through the executor
    pub async fn run(&self, request: CommandRequest) -> Result<CommandOutput> {
        self.check_cancelled()?;
        if request.mode != self.mode {
            return Err(Error::Internal(format!(
                "{} request issued in {} context",
                request.mode, self.mode
            )));
        }
        info!("Running '{}' on {} ({})", request.line, request.host, self.mode);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::DryRunCancelled),
            result = self.executor.execute(&request) => result,
        };
        self.settle(&request.command.to_string(), result, &request.host, &request.line)
    }

    /// Push a file through the executor
    pub async fn deploy(&self, request: DeployRequest) -> Result<CommandOutput> {
        self.check_cancelled()?;
        let line = format!("write {}", request.path);
        debug!("Deploying {} to {} ({})", request.path, request.host, self.mode);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::DryRunCancelled),
            result = self.executor.deploy(&request) => result,
        };
        self.settle("deploy", result, &request.host, &line)
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("mode", &self.mode)
            .field("collecting", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{CommandExecutor, DrbdCommand};
    use crate::exec::session::DryRunSession;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedExit(i32);

    #[async_trait]
    impl CommandExecutor for FixedExit {
        async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
            Ok(CommandOutput {
                host: request.host.clone(),
                line: request.line.clone(),
                exit_code: self.0,
                output: String::new(),
                mode: request.mode,
                finished_at: Utc::now(),
            })
        }

        async fn deploy(&self, request: &DeployRequest) -> Result<CommandOutput> {
            Err(Error::HostUnreachable {
                host: request.host.clone(),
            })
        }

        async fn fetch_status(&self, _host: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn request(mode: ExecMode) -> CommandRequest {
        CommandRequest {
            host: "alpha".into(),
            command: DrbdCommand::Connect,
            resource: Some("r0".into()),
            volume: None,
            minor: None,
            config_file: None,
            line: "drbdadm connect r0".into(),
            mode,
        }
    }

    #[tokio::test]
    async fn test_live_failure_is_an_error() {
        let ctx = ExecContext::live(Arc::new(FixedExit(1)));
        assert_matches!(
            ctx.run(request(ExecMode::Live)).await,
            Err(Error::CommandFailed { exit_code: 1, .. })
        );
        assert_matches!(ctx.run(request(ExecMode::Test)).await, Err(Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_preview_collects_failures() {
        let session = DryRunSession::new();
        let guard = session.begin().await;
        let ctx = ExecContext::preview(Arc::new(FixedExit(3)), &guard);

        let output = ctx.run(request(ExecMode::Test)).await.unwrap();
        assert_eq!(output.exit_code, 3);

        let deploy = DeployRequest {
            host: "alpha".into(),
            path: "/etc/drbd.d/r0.res.dry".into(),
            contents: String::new(),
            file_mode: 0o644,
            backup: false,
            pre_command: None,
            post_command: None,
            mode: ExecMode::Test,
        };
        assert_matches!(ctx.deploy(deploy).await, Err(Error::HostUnreachable { .. }));

        let report = guard.finish().unwrap();
        assert_eq!(report.host("alpha").len(), 2);
        assert_eq!(report.failed_hosts(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_cancelled_preview_stops_running() {
        let session = DryRunSession::new();
        let guard = session.begin().await;
        let ctx = ExecContext::preview(Arc::new(FixedExit(0)), &guard);
        guard.cancel();
        assert_matches!(ctx.run(request(ExecMode::Test)).await, Err(Error::DryRunCancelled));
    }
}
