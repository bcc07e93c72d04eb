//! End-to-end flows over a recording executor: allocate, render, apply in
//! both modes, guard commands, and reload rendered text.

use async_trait::async_trait;
use chrono::Utc;
use drbd_manager::config::parse::import_resource;
use drbd_manager::params::resolver::values_equal;
use drbd_manager::{
    ApplyCoordinator, BindVolume, BlockDevice, Cluster, CommandExecutor, CommandOutput,
    CommandRequest, ConfigDocument, ConfigRenderer, DeployRequest, DeviceRef, DrbdSchema,
    DrbdSyntax, DryRunSession, Error, ExecContext, ExecMode, Host, ManagerConfig, MetaDisk,
    MetaDiskIndex, ParamResolver, ParameterSchema, Resource, Result, ScopeChain, Volume,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct RecordingExecutor {
    commands: Mutex<Vec<CommandRequest>>,
    deploys: Mutex<Vec<DeployRequest>>,
    status: Mutex<HashMap<String, String>>,
}

impl RecordingExecutor {
    fn output(host: &str, line: &str, mode: ExecMode) -> CommandOutput {
        CommandOutput {
            host: host.to_string(),
            line: line.to_string(),
            exit_code: 0,
            output: String::new(),
            mode,
            finished_at: Utc::now(),
        }
    }

    fn set_status(&self, host: &str, text: &str) {
        self.status.lock().insert(host.to_string(), text.to_string());
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
        self.commands.lock().push(request.clone());
        Ok(Self::output(&request.host, &request.line, request.mode))
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<CommandOutput> {
        self.deploys.lock().push(request.clone());
        Ok(Self::output(&request.host, &request.path, request.mode))
    }

    async fn fetch_status(&self, host: &str) -> Result<String> {
        Ok(self.status.lock().get(host).cloned().unwrap_or_default())
    }
}

fn two_host_cluster() -> Cluster {
    cluster_with(DrbdSyntax::Modern)
}

fn cluster_with(syntax: DrbdSyntax) -> Cluster {
    let mut cluster = Cluster::new("lab", syntax);
    for name in ["alpha", "beta"] {
        let mut host = Host::new(name);
        host.block_devices
            .insert("/dev/vg0/data".into(), BlockDevice::new("/dev/vg0/data"));
        host.block_devices
            .insert("/dev/vg0/logs".into(), BlockDevice::new("/dev/vg0/logs"));
        cluster.add_host(host).unwrap();
    }
    cluster
        .bind_volume(BindVolume {
            resource: "data".into(),
            volume: None,
            device: None,
            members: vec![
                ("alpha".into(), "/dev/vg0/data".into()),
                ("beta".into(), "/dev/vg0/data".into()),
            ],
        })
        .unwrap();
    cluster.set_address("data", "alpha", "192.168.10.1").unwrap();
    cluster.set_address("data", "beta", "192.168.10.2").unwrap();
    cluster
}

fn coordinator(cluster: Cluster) -> Arc<ApplyCoordinator> {
    let coordinator = ApplyCoordinator::new(
        ManagerConfig::default(),
        Arc::new(DrbdSchema::modern()),
        cluster.into_shared(),
    );
    coordinator
        .allocator()
        .assign_resource_port(coordinator.cluster(), "data")
        .unwrap();
    coordinator
}

#[test]
fn default_two_host_resource_renders_bare_structure() {
    let coordinator = coordinator(two_host_cluster());
    let files = coordinator.render_host_files("alpha").unwrap();
    let text = &files
        .iter()
        .find(|f| f.path == "/etc/drbd.d/data.res")
        .unwrap()
        .contents;

    assert_eq!(text.matches("\ton ").count(), 2);
    assert!(text.contains("\ton alpha {"));
    assert!(text.contains("\ton beta {"));
    assert_eq!(text.matches("address ").count(), 2);
    assert!(text.contains("address 192.168.10.1:7788;"));
    assert!(text.contains("address 192.168.10.2:7788;"));
    assert!(!text.contains("proxy"));
    assert!(!text.contains("protocol"));
    assert!(!text.contains("net {"));
}

#[test]
fn configure_render_reload_round_trips() {
    let schema = DrbdSchema::modern();
    let mut cluster = two_host_cluster();
    cluster.resource_mut("data").unwrap().port = Some(7790);
    let edits = [
        ("protocol", "A"),
        ("allow-two-primaries", "yes"),
        ("sndbuf-size", "512K"),
    ];
    let volume_edits = [("resync-rate", "100M"), ("disk-barrier", "yes")];
    let meta_disk = MetaDisk::External {
        device: "/dev/vg0/meta".into(),
        index: MetaDiskIndex::Fixed(1),
    };
    {
        let resource = cluster.resource_mut("data").unwrap();
        for (name, value) in edits {
            resource.params.insert(name.into(), value.into());
        }
        let volume = resource.volumes.get_mut(&0).unwrap();
        for (name, value) in volume_edits {
            volume.params.insert(name.into(), value.into());
        }
    }
    cluster
        .host_mut("beta")
        .unwrap()
        .block_device_mut("/dev/vg0/data")
        .unwrap()
        .meta_disk = meta_disk.clone();

    let text = {
        let renderer = ConfigRenderer::new(&schema, &cluster);
        renderer
            .render_resource(cluster.resource("data").unwrap(), "alpha")
            .unwrap()
    };
    let document = ConfigDocument::parse(&text).unwrap();
    let imported = import_resource(&schema, document.resource("data").unwrap()).unwrap();
    assert_eq!(imported.port, Some(7790));
    assert_eq!(imported.addresses.len(), 2);
    assert_eq!(
        imported.volumes[&0].device.as_deref(),
        Some("/dev/drbd0")
    );

    assert_eq!(imported.volumes[&0].meta_disks.get("beta"), Some(&meta_disk));
    assert_eq!(imported.volumes[&0].meta_disks.get("alpha"), Some(&MetaDisk::Internal));

    let mut reloaded = Resource::new("data");
    reloaded.params = imported.params;
    let mut volume = Volume::new(0);
    volume.params = imported.volumes[&0].params.clone();
    reloaded.volumes.insert(0, volume);

    let resolver = ParamResolver::new(&schema);
    let original = cluster.resource("data").unwrap();
    for (name, _) in edits.iter().chain(volume_edits.iter()) {
        let before = resolver
            .resolve(name, &ScopeChain::for_volume(&cluster, original, 0))
            .unwrap();
        let after = resolver
            .resolve(name, &ScopeChain::for_volume(&cluster, &reloaded, 0))
            .unwrap();
        let info = schema.param(name).unwrap();
        assert!(
            values_equal(info, &before.value, &after.value),
            "{}: {} != {}",
            name,
            before.value,
            after.value
        );
    }
}

#[test]
fn legacy_flags_round_trip_or_are_rejected() {
    let schema = DrbdSchema::legacy();
    let mut cluster = cluster_with(DrbdSyntax::Legacy);
    cluster.resource_mut("data").unwrap().port = Some(7788);
    cluster
        .resource_mut("data")
        .unwrap()
        .params
        .insert("allow-two-primaries".into(), "yes".into());

    let text = ConfigRenderer::new(&schema, &cluster)
        .render_resource(cluster.resource("data").unwrap(), "beta")
        .unwrap();
    let document = ConfigDocument::parse(&text).unwrap();
    let imported = import_resource(&schema, document.resource("data").unwrap()).unwrap();
    assert_eq!(
        imported.params.get("allow-two-primaries").map(String::as_str),
        Some("yes")
    );

    // a flag set in common cannot be switched off per resource
    cluster.common.insert("allow-two-primaries".into(), "yes".into());
    cluster
        .resource_mut("data")
        .unwrap()
        .params
        .insert("allow-two-primaries".into(), "no".into());
    let result = ConfigRenderer::new(&schema, &cluster)
        .render_resource(cluster.resource("data").unwrap(), "beta");
    assert!(matches!(result, Err(Error::InvalidParameter { .. })));
}

#[tokio::test]
async fn preview_then_live_apply() {
    let coordinator = coordinator(two_host_cluster());
    coordinator
        .cluster()
        .write()
        .resource_mut("data")
        .unwrap()
        .stage("protocol", "B");
    let executor = Arc::new(RecordingExecutor::default());
    executor.set_status(
        "alpha",
        " 0: cs:Connected ro:Secondary/Secondary ds:UpToDate/UpToDate C r-----\n",
    );

    let session = DryRunSession::new();
    let preview = coordinator
        .preview(&session, executor.clone(), "data")
        .await
        .unwrap();
    assert!(preview.is_clean());
    assert!(preview.render_text().contains("drbdadm -d"));
    assert!(executor
        .deploys
        .lock()
        .iter()
        .all(|d| d.mode == ExecMode::Test && d.path.ends_with(".dry")));
    {
        let cluster = coordinator.cluster().read();
        assert!(!cluster.resource("data").unwrap().committed);
        assert!(!cluster.host("alpha").unwrap().is_port_used(7788));
    }

    let ctx = ExecContext::live(executor.clone());
    let report = coordinator.apply(&ctx, "data").await.unwrap();
    assert!(report.committed);
    let res_file = report
        .files
        .iter()
        .find(|f| f.host == "beta" && f.path.ends_with("data.res"))
        .unwrap();
    assert!(res_file.contents.contains("protocol B;"));

    let cluster = coordinator.cluster().read();
    assert!(cluster.resource("data").unwrap().committed);
    assert!(cluster.host("beta").unwrap().is_port_used(7788));
    assert!(cluster
        .block_device("alpha", "/dev/vg0/data")
        .unwrap()
        .observed
        .is_connected());

    let live: Vec<_> = executor
        .commands
        .lock()
        .iter()
        .filter(|c| c.mode == ExecMode::Live)
        .map(|c| c.line.clone())
        .collect();
    assert_eq!(live, vec!["drbdadm adjust data", "drbdadm adjust data"]);
}

#[tokio::test]
async fn disconnect_is_gated_on_sync_direction() {
    let coordinator = coordinator(two_host_cluster());
    let executor = Arc::new(RecordingExecutor::default());
    let target = " 0: cs:SyncTarget ro:Secondary/Secondary ds:Inconsistent/UpToDate C r-----\n\
                  \t[==>.................] sync'ed: 12.5% (900/1024)M\n";
    let source = " 0: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----\n";
    executor.set_status("alpha", target);
    executor.set_status("beta", source);

    let ctx = ExecContext::live(executor.clone());
    for host in ["alpha", "beta"] {
        coordinator.refresh_host(&ctx, host).await.unwrap();
    }

    let ops = coordinator.operations();
    let alpha = DeviceRef::resource("alpha", "data");
    assert_eq!(ops.status(&alpha).unwrap().sync_percent, Some(12.5));
    match ops.disconnect(&ctx, &alpha).await {
        Err(Error::CommandNotPermitted { reason, .. }) => {
            assert_eq!(reason, "it is being full-synced")
        }
        other => panic!("unexpected {:?}", other.map(|o| o.line)),
    }
    assert!(executor.commands.lock().is_empty());

    ops.disconnect(&ctx, &DeviceRef::resource("beta", "data"))
        .await
        .unwrap();
    assert_eq!(executor.commands.lock()[0].line, "drbdadm disconnect data");
}
