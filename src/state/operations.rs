//! Device Operations
//!
//! Operator commands against replicated devices. Each command is checked
//! against the guard table using the last observed state, then issued
//! through the [`ExecContext`]. After a live command the host's status is
//! fetched again; a preview leaves observed state alone.

use super::device::DeviceStatus;
use super::guards;
use crate::domain::ports::{CommandOutput, DrbdCommand, ParameterSchemaRef};
use crate::error::{Error, Result};
use crate::exec::commands::{CommandBuilder, CommandTarget};
use crate::exec::context::ExecContext;
use crate::model::cluster::{SharedCluster, UnbindOutcome};
use crate::params::resolver::{parse_bool, ParamResolver, ScopeChain};
use futures::future::join_all;
use std::fmt;
use tracing::{debug, info, warn};

const ALLOW_TWO_PRIMARIES: &str = "allow-two-primaries";

/// One side of a replicated device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRef {
    pub host: String,
    pub resource: String,
    /// Volume for per-volume commands; resource-level when absent
    pub volume: Option<u32>,
}

impl DeviceRef {
    pub fn resource(host: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            resource: resource.into(),
            volume: None,
        }
    }

    pub fn volume(host: impl Into<String>, resource: impl Into<String>, volume: u32) -> Self {
        Self {
            host: host.into(),
            resource: resource.into(),
            volume: Some(volume),
        }
    }

    fn on(&self, host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..self.clone()
        }
    }

    fn target(&self) -> CommandTarget {
        match self.volume {
            Some(volume) => CommandTarget::volume(&self.resource, volume),
            None => CommandTarget::resource(&self.resource),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.volume {
            Some(volume) => write!(f, "{}:{}/{}", self.host, self.resource, volume),
            None => write!(f, "{}:{}", self.host, self.resource),
        }
    }
}

/// Guarded operator commands over a shared cluster
pub struct DeviceOperations {
    cluster: SharedCluster,
    schema: ParameterSchemaRef,
    commands: CommandBuilder,
}

impl DeviceOperations {
    pub fn new(cluster: SharedCluster, schema: ParameterSchemaRef) -> Self {
        let commands = CommandBuilder::new(schema.syntax());
        Self {
            cluster,
            schema,
            commands,
        }
    }

    pub fn cluster(&self) -> &SharedCluster {
        &self.cluster
    }

    // =========================================================================
    // Observed state
    // =========================================================================

    /// Last observed state of a device. Resource-level references use the
    /// lowest volume.
    pub fn status(&self, device: &DeviceRef) -> Result<DeviceStatus> {
        let cluster = self.cluster.read();
        let resource = cluster.resource(&device.resource)?;
        let volume = match device.volume {
            Some(number) => cluster.volume(&device.resource, number)?,
            None => resource
                .volumes
                .values()
                .next()
                .ok_or_else(|| Error::VolumeNotFound {
                    resource: device.resource.clone(),
                    volume: 0,
                })?,
        };
        let path = volume
            .block_device_on(&device.host)
            .ok_or_else(|| Error::HostNotInResource {
                resource: device.resource.clone(),
                host: device.host.clone(),
            })?;
        Ok(cluster.block_device(&device.host, path)?.observed.clone())
    }

    /// Commands the guards allow right now
    pub fn available_commands(&self, device: &DeviceRef) -> Result<Vec<DrbdCommand>> {
        Ok(guards::available_commands(&self.status(device)?))
    }

    /// Fetch and observe the status of a host
    pub async fn refresh(&self, ctx: &ExecContext, host: &str) -> Result<usize> {
        let text = ctx.executor().fetch_status(host).await?;
        self.cluster.write().observe_status_text(host, &text)
    }

    // =========================================================================
    // Issuing
    // =========================================================================

    async fn issue(&self, ctx: &ExecContext, command: DrbdCommand, device: &DeviceRef) -> Result<CommandOutput> {
        let request = self
            .commands
            .request(&device.host, command, &device.target(), ctx.mode(), None)?;
        let output = ctx.run(request).await?;
        if !ctx.is_test() {
            if let Err(err) = self.refresh(ctx, &device.host).await {
                warn!("Status refresh of {} failed after {}: {}", device.host, command, err);
            }
        }
        Ok(output)
    }

    /// Check `command` against the device's state and issue it
    pub async fn run(&self, ctx: &ExecContext, command: DrbdCommand, device: &DeviceRef) -> Result<CommandOutput> {
        let status = self.status(device)?;
        guards::require(command, &status, &device.to_string())?;
        debug!("Issuing {} on {}", command, device);
        self.issue(ctx, command, device).await
    }

    pub async fn attach(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Attach, device).await
    }

    pub async fn detach(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Detach, device).await
    }

    pub async fn connect(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Connect, device).await
    }

    pub async fn disconnect(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Disconnect, device).await
    }

    pub async fn up(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Up, device).await
    }

    pub async fn down(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Down, device).await
    }

    pub async fn set_secondary(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::SetSecondary, device).await
    }

    pub async fn invalidate(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Invalidate, device).await
    }

    pub async fn discard_data(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::DiscardData, device).await
    }

    pub async fn resize(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Resize, device).await
    }

    pub async fn verify(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::Verify, device).await
    }

    pub async fn pause_sync(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::PauseSync, device).await
    }

    pub async fn resume_sync(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::ResumeSync, device).await
    }

    pub async fn skip_initial_full_sync(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        self.run(ctx, DrbdCommand::SkipInitialFullSync, device).await
    }

    pub async fn proxy_up(&self, ctx: &ExecContext, host: &str, resource: &str) -> Result<CommandOutput> {
        self.issue(ctx, DrbdCommand::ProxyUp, &DeviceRef::resource(host, resource)).await
    }

    pub async fn proxy_down(&self, ctx: &ExecContext, host: &str, resource: &str) -> Result<CommandOutput> {
        self.issue(ctx, DrbdCommand::ProxyDown, &DeviceRef::resource(host, resource)).await
    }

    /// Load the kernel module
    pub async fn load(&self, ctx: &ExecContext, host: &str) -> Result<CommandOutput> {
        let request = self.commands.request(
            host,
            DrbdCommand::Load,
            &CommandTarget::default(),
            ctx.mode(),
            None,
        )?;
        ctx.run(request).await
    }

    pub async fn del_minor(&self, ctx: &ExecContext, host: &str, minor: u32) -> Result<CommandOutput> {
        let request = self.commands.request(
            host,
            DrbdCommand::DelMinor,
            &CommandTarget::minor(minor),
            ctx.mode(),
            None,
        )?;
        ctx.run(request).await
    }

    pub async fn del_connection(&self, ctx: &ExecContext, host: &str, resource: &str) -> Result<CommandOutput> {
        self.issue(ctx, DrbdCommand::DelConnection, &DeviceRef::resource(host, resource)).await
    }

    // =========================================================================
    // Compound operations
    // =========================================================================

    fn allows_two_primaries(&self, resource: &str) -> Result<bool> {
        let cluster = self.cluster.read();
        let res = cluster.resource(resource)?;
        let chain = ScopeChain::for_resource(&cluster, res);
        let resolver = ParamResolver::new(self.schema.as_ref());
        Ok(match resolver.resolve(ALLOW_TWO_PRIMARIES, &chain) {
            Ok(resolved) => parse_bool(&resolved.value).unwrap_or(false),
            Err(_) => false,
        })
    }

    /// Promote a device. A primary peer is demoted first unless the
    /// resource allows two primaries.
    pub async fn set_primary(&self, ctx: &ExecContext, device: &DeviceRef) -> Result<CommandOutput> {
        let status = self.status(device)?;
        guards::require(DrbdCommand::SetPrimary, &status, &device.to_string())?;

        if status.is_peer_primary() && !self.allows_two_primaries(&device.resource)? {
            let peers = self.cluster.read().peer_hosts(&device.resource, &device.host)?;
            for peer in peers {
                let peer_device = device.on(&peer);
                if self.status(&peer_device)?.is_secondary() {
                    continue;
                }
                info!("Demoting {} before promoting {}", peer_device, device);
                self.issue(ctx, DrbdCommand::SetSecondary, &peer_device).await?;
            }
        }

        self.issue(ctx, DrbdCommand::SetPrimary, device).await
    }

    async fn tear_down(&self, ctx: &ExecContext, device: DeviceRef, last_volume: bool) -> Result<()> {
        let status = self.status(&device)?;
        if last_volume && status.is_connected_or_waiting() {
            let connection = DeviceRef::resource(&device.host, &device.resource);
            guards::require(DrbdCommand::Disconnect, &status, &connection.to_string())?;
            self.issue(ctx, DrbdCommand::Disconnect, &connection).await?;
        }
        if status.is_attached() {
            guards::require(DrbdCommand::Detach, &status, &device.to_string())?;
            self.issue(ctx, DrbdCommand::Detach, &device).await?;
        }
        Ok(())
    }

    /// Detach a volume on every host, disconnecting as well when it is the
    /// resource's last volume, then drop it from the model. A preview only
    /// reports the commands and returns `None`.
    pub async fn remove_volume(
        &self,
        ctx: &ExecContext,
        resource: &str,
        volume: u32,
    ) -> Result<Option<UnbindOutcome>> {
        let (hosts, last_volume) = {
            let cluster = self.cluster.read();
            let res = cluster.resource(resource)?;
            let vol = cluster.volume(resource, volume)?;
            (
                vol.hosts().map(str::to_string).collect::<Vec<_>>(),
                res.volumes.len() == 1,
            )
        };

        let results = join_all(
            hosts
                .iter()
                .map(|host| self.tear_down(ctx, DeviceRef::volume(host, resource, volume), last_volume)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<_>>>()?;

        if ctx.is_test() {
            return Ok(None);
        }
        let outcome = self.cluster.write().unbind_volume(resource, volume)?;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{CommandExecutor, CommandRequest, DeployRequest, DrbdSyntax, ExecMode};
    use crate::exec::session::DryRunSession;
    use crate::model::{BindVolume, BlockDevice, Cluster, Host};
    use crate::params::schema::DrbdSchema;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<(String, String)>>,
        status: Mutex<HashMap<String, String>>,
    }

    impl Recorder {
        fn lines(&self) -> Vec<(String, String)> {
            self.lines.lock().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for Recorder {
        async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
            self.lines
                .lock()
                .push((request.host.clone(), request.line.clone()));
            Ok(CommandOutput {
                host: request.host.clone(),
                line: request.line.clone(),
                exit_code: 0,
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

        async fn fetch_status(&self, host: &str) -> Result<String> {
            Ok(self.status.lock().get(host).cloned().unwrap_or_default())
        }
    }

    fn setup(alpha: &str, beta: &str) -> (DeviceOperations, Arc<Recorder>) {
        let mut cluster = Cluster::new("test", DrbdSyntax::Modern);
        for name in ["alpha", "beta"] {
            let mut host = Host::new(name);
            host.block_devices.insert("/dev/sdb".into(), BlockDevice::new("/dev/sdb"));
            cluster.add_host(host).unwrap();
        }
        cluster
            .bind_volume(BindVolume {
                resource: "r0".into(),
                volume: None,
                device: None,
                members: vec![
                    ("alpha".into(), "/dev/sdb".into()),
                    ("beta".into(), "/dev/sdb".into()),
                ],
            })
            .unwrap();
        cluster.observe_status_text("alpha", alpha).unwrap();
        cluster.observe_status_text("beta", beta).unwrap();

        let recorder = Arc::new(Recorder::default());
        recorder.status.lock().insert("alpha".into(), alpha.into());
        recorder.status.lock().insert("beta".into(), beta.into());
        let ops = DeviceOperations::new(cluster.into_shared(), Arc::new(DrbdSchema::modern()));
        (ops, recorder)
    }

    const SECONDARY: &str = " 0: cs:Connected ro:Secondary/Primary ds:UpToDate/UpToDate C r-----\n";
    const PRIMARY: &str = " 0: cs:Connected ro:Primary/Secondary ds:UpToDate/UpToDate C r-----\n";
    const SYNC_TARGET: &str = " 0: cs:SyncTarget ro:Secondary/Secondary ds:Inconsistent/UpToDate C r-----\n";
    const SYNC_SOURCE: &str = " 0: cs:SyncSource ro:Secondary/Secondary ds:UpToDate/Inconsistent C r-----\n";

    #[tokio::test]
    async fn test_set_primary_demotes_peer() {
        let (ops, recorder) = setup(SECONDARY, PRIMARY);
        let ctx = ExecContext::live(recorder.clone());

        ops.set_primary(&ctx, &DeviceRef::resource("alpha", "r0")).await.unwrap();
        assert_eq!(
            recorder.lines(),
            vec![
                ("beta".to_string(), "drbdadm secondary r0".to_string()),
                ("alpha".to_string(), "drbdadm primary r0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_set_primary_with_two_primaries_allowed() {
        let (ops, recorder) = setup(SECONDARY, PRIMARY);
        ops.cluster()
            .write()
            .resource_mut("r0")
            .unwrap()
            .params
            .insert(ALLOW_TWO_PRIMARIES.into(), "yes".into());
        let ctx = ExecContext::live(recorder.clone());

        ops.set_primary(&ctx, &DeviceRef::resource("alpha", "r0")).await.unwrap();
        assert_eq!(recorder.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_guard_uses_observed_state() {
        let (ops, recorder) = setup(SYNC_TARGET, SYNC_SOURCE);
        let ctx = ExecContext::live(recorder.clone());

        assert_matches!(
            ops.disconnect(&ctx, &DeviceRef::resource("alpha", "r0")).await,
            Err(Error::CommandNotPermitted { .. })
        );
        ops.disconnect(&ctx, &DeviceRef::resource("beta", "r0")).await.unwrap();
        assert_eq!(
            recorder.lines(),
            vec![("beta".to_string(), "drbdadm disconnect r0".to_string())]
        );
    }

    #[tokio::test]
    async fn test_live_command_refreshes_status() {
        let (ops, recorder) = setup(SECONDARY, PRIMARY);
        let ctx = ExecContext::live(recorder.clone());
        recorder.status.lock().insert(
            "beta".into(),
            " 0: cs:StandAlone ro:Primary/Unknown ds:UpToDate/DUnknown r-----\n".into(),
        );

        ops.disconnect(&ctx, &DeviceRef::resource("beta", "r0")).await.unwrap();
        let status = ops.status(&DeviceRef::resource("beta", "r0")).unwrap();
        assert!(!status.is_connected_or_waiting());
    }

    #[tokio::test]
    async fn test_preview_leaves_model_alone() {
        let (ops, recorder) = setup(SECONDARY, PRIMARY);
        let session = DryRunSession::new();
        let guard = session.begin().await;
        let ctx = ExecContext::preview(recorder.clone(), &guard);

        let outcome = ops.remove_volume(&ctx, "r0", 0).await.unwrap();
        assert!(outcome.is_none());
        assert!(ops.cluster().read().resource("r0").is_ok());
        assert!(ops.status(&DeviceRef::volume("alpha", "r0", 0)).unwrap().is_connected());

        let report = guard.finish().unwrap();
        let lines: Vec<_> = report.host("alpha").iter().map(|o| o.line.as_str()).collect();
        assert_eq!(lines, vec!["drbdadm -d disconnect r0", "drbdadm -d detach r0/0"]);
        assert!(recorder.lines().iter().all(|(_, line)| line.contains(" -d ")));
    }

    #[tokio::test]
    async fn test_remove_volume_live_unbinds() {
        let (ops, recorder) = setup(SECONDARY, PRIMARY);
        let ctx = ExecContext::live(recorder.clone());

        let outcome = ops.remove_volume(&ctx, "r0", 0).await.unwrap().unwrap();
        assert!(outcome.resource_removed);
        assert!(ops.cluster().read().resource("r0").is_err());
        assert_eq!(recorder.lines().len(), 4);
        assert_eq!(ExecMode::Live, ctx.mode());
    }
}
