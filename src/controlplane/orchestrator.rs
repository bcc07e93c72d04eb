//! Apply Coordinator
//!
//! Drives an "apply" from the model to the hosts:
//! - validate the resource with its pending edits (every problem at once)
//! - render `global_common.conf` and `<resource>.res` for every involved host
//! - deploy the files and run `drbdadm adjust` on all hosts concurrently
//! - in live mode commit the edits and ports, then re-read device status
//!
//! The whole sequence runs under one status lock so two applies never
//! interleave partial writes.

use super::config::ManagerConfig;
use crate::allocation::{PortAllocator, ProxyPortPair};
use crate::config::render::ConfigRenderer;
use crate::domain::ports::{
    CommandExecutorRef, CommandOutput, DeployRequest, DrbdCommand, ExecMode, ParameterSchemaRef,
};
use crate::error::{Error, Result};
use crate::exec::commands::{CommandBuilder, CommandTarget};
use crate::exec::context::ExecContext;
use crate::exec::session::{DryRunReport, DryRunSession};
use crate::model::cluster::{Cluster, SharedCluster};
use crate::params::validation::{check_common, check_resource};
use crate::state::operations::DeviceOperations;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

// =============================================================================
// Plan / Report
// =============================================================================

/// A configuration file destined for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFile {
    pub host: String,
    /// Live path; previews append the dry-run suffix
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Clone)]
struct PlanHost {
    name: String,
    /// Holds a block device; relay-only hosts start the proxy instead
    member: bool,
}

#[derive(Debug, Clone)]
struct ApplyPlan {
    files: Vec<RenderedFile>,
    hosts: Vec<PlanHost>,
}

/// Outcome of one apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub resource: String,
    pub mode: ExecMode,
    pub files: Vec<RenderedFile>,
    pub outputs: Vec<CommandOutput>,
    /// Host -> error, for hosts that could not be reached or failed a step
    pub failures: BTreeMap<String, String>,
    /// Whether the model was updated
    pub committed: bool,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Coordinator status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub hosts: usize,
    pub resources: usize,
    pub committed_resources: usize,
    pub pending_resources: usize,
    pub resync_cycles: usize,
    pub applying: bool,
}

// =============================================================================
// Apply Coordinator
// =============================================================================

pub struct ApplyCoordinator {
    config: ManagerConfig,
    schema: ParameterSchemaRef,
    cluster: SharedCluster,
    allocator: PortAllocator,
    commands: CommandBuilder,
    /// Held from render to re-derive
    status_lock: Mutex<()>,
}

impl ApplyCoordinator {
    pub fn new(config: ManagerConfig, schema: ParameterSchemaRef, cluster: SharedCluster) -> Arc<Self> {
        let allocator = config.allocator();
        let commands = CommandBuilder::new(schema.syntax());
        Arc::new(Self {
            config,
            schema,
            cluster,
            allocator,
            commands,
            status_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn cluster(&self) -> &SharedCluster {
        &self.cluster
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Guarded device commands over the same cluster
    pub fn operations(&self) -> DeviceOperations {
        DeviceOperations::new(self.cluster.clone(), self.schema.clone())
    }

    // =========================================================================
    // Validation / Rendering
    // =========================================================================

    /// Every problem with a resource and the common section
    pub fn validate(&self, resource: &str) -> Result<()> {
        let cluster = self.cluster.read();
        cluster.resource(resource)?;
        let mut errors = check_resource(self.schema.as_ref(), &cluster, resource);
        errors.extend(check_common(self.schema.as_ref(), &cluster));
        errors.into_result()
    }

    fn plan(&self, resource: &str) -> Result<ApplyPlan> {
        self.validate(resource)?;

        let cluster = self.cluster.read();
        let preview = cluster.resource(resource)?.with_pending_applied();
        let renderer = ConfigRenderer::new(self.schema.as_ref(), &cluster);
        let global_common = renderer.render_global_and_common()?;
        let members = preview.hosts();

        let mut files = Vec::new();
        let mut hosts = Vec::new();
        for host in preview.involved_hosts() {
            let contents = renderer.render_resource(&preview, &host)?;
            files.push(RenderedFile {
                host: host.clone(),
                path: self.config.global_common_path(),
                contents: global_common.clone(),
            });
            files.push(RenderedFile {
                host: host.clone(),
                path: self.config.resource_path(resource),
                contents,
            });
            hosts.push(PlanHost {
                member: members.contains(&host),
                name: host,
            });
        }
        Ok(ApplyPlan { files, hosts })
    }

    /// Every file a host should carry, rendered from the current model with
    /// pending edits folded in
    pub fn render_host_files(&self, host: &str) -> Result<Vec<RenderedFile>> {
        let cluster = self.cluster.read();
        cluster.host(host)?;
        let renderer = ConfigRenderer::new(self.schema.as_ref(), &cluster);

        let mut files = vec![RenderedFile {
            host: host.to_string(),
            path: self.config.global_common_path(),
            contents: renderer.render_global_and_common()?,
        }];
        for resource in cluster.resources.values() {
            if !resource.involved_hosts().contains(host) {
                continue;
            }
            let preview = resource.with_pending_applied();
            files.push(RenderedFile {
                host: host.to_string(),
                path: self.config.resource_path(&resource.name),
                contents: renderer.render_resource(&preview, host)?,
            });
        }
        Ok(files)
    }

    /// Top-level file a preview points `drbdadm -c` at
    fn dry_main_config(&self) -> RenderedFile {
        let dir = self.config.config_dir.trim_end_matches('/');
        let suffix = &self.config.dry_run_suffix;
        RenderedFile {
            host: String::new(),
            path: self.config.main_config_file.clone(),
            contents: format!(
                "include \"{}{}\";\ninclude \"{}/*{}{}\";\n",
                self.config.global_common_path(),
                suffix,
                dir,
                self.config.resource_suffix,
                suffix
            ),
        }
    }

    // =========================================================================
    // Apply
    // =========================================================================

    async fn push_host(
        &self,
        ctx: &ExecContext,
        host: &PlanHost,
        plan: &ApplyPlan,
        resource: &str,
    ) -> Result<Vec<CommandOutput>> {
        let test = ctx.is_test();
        let dry_main = self.dry_main_config();
        let mut files: Vec<&RenderedFile> = plan.files.iter().filter(|f| f.host == host.name).collect();
        if test {
            files.push(&dry_main);
        }

        let mut outputs = Vec::new();
        for file in files {
            let request = DeployRequest {
                host: host.name.clone(),
                path: self.config.target_path(&file.path, test),
                contents: file.contents.clone(),
                file_mode: self.config.file_mode,
                backup: self.config.backup && !test,
                pre_command: None,
                post_command: None,
                mode: ctx.mode(),
            };
            outputs.push(ctx.deploy(request).await?);
        }

        let command = if host.member {
            DrbdCommand::Adjust
        } else {
            DrbdCommand::ProxyUp
        };
        let config_file = test.then(|| self.config.target_path(&dry_main.path, true));
        let request = self.commands.request(
            &host.name,
            command,
            &CommandTarget::resource(resource),
            ctx.mode(),
            config_file.as_deref(),
        )?;
        outputs.push(ctx.run(request).await?);
        Ok(outputs)
    }

    /// Mark the resource's ports used on its hosts. Ports already marked by
    /// an earlier apply are left alone.
    fn mark_ports_used(&self, cluster: &mut Cluster, resource: &str) -> Result<()> {
        let res = cluster.resource(resource)?;
        let hosts: Vec<String> = res.hosts().into_iter().collect();
        let port = res.port;
        let links: Vec<_> = res.proxy_links.values().cloned().collect();

        if let Some(port) = port {
            let mut missing = Vec::new();
            for host in &hosts {
                if !cluster.host(host)?.is_port_used(port) {
                    missing.push(host.as_str());
                }
            }
            if !missing.is_empty() {
                self.allocator.commit_port(cluster, &missing, port)?;
            }
        }

        for link in links {
            let relay = cluster.host(&link.proxy_host)?;
            if relay.is_proxy_port_used(link.inside.port) && relay.is_proxy_port_used(link.outside.port) {
                continue;
            }
            let pair = ProxyPortPair {
                inside: link.inside.port,
                outside: link.outside.port,
            };
            self.allocator.commit_proxy_ports(cluster, &link.proxy_host, pair)?;
        }
        Ok(())
    }

    /// Fold pending edits in, mark ports used and flag the resource as
    /// committed. Nothing changes when any step fails.
    fn commit(&self, resource: &str) -> Result<()> {
        let mut cluster = self.cluster.write();
        let mut next = cluster.clone();
        self.mark_ports_used(&mut next, resource)?;
        let res = next.resource_mut(resource)?;
        res.commit_pending();
        res.mark_committed();
        *cluster = next;
        info!("Committed resource {}", resource);
        Ok(())
    }

    async fn refresh_hosts(&self, ctx: &ExecContext, hosts: &BTreeSet<String>) {
        let results = join_all(hosts.iter().map(|host| async move {
            let text = ctx.executor().fetch_status(host).await?;
            let count = self.cluster.write().observe_status_text(host, &text)?;
            Ok::<_, Error>(count)
        }))
        .await;
        for (host, result) in hosts.iter().zip(results) {
            match result {
                Ok(count) => debug!("Re-derived {} device(s) on {}", count, host),
                Err(e) => warn!("Could not refresh status of {}: {}", host, e),
            }
        }
    }

    /// Apply one resource. A live apply fails on the first host error and
    /// leaves the model as it was; a preview always reports every host.
    pub async fn apply(&self, ctx: &ExecContext, resource: &str) -> Result<ApplyReport> {
        let _status = self.status_lock.lock().await;
        info!("Applying {} ({})", resource, ctx.mode());

        let plan = self.plan(resource)?;
        let results = join_all(plan.hosts.iter().map(|host| {
            let plan = &plan;
            async move { (host.name.clone(), self.push_host(ctx, host, plan, resource).await) }
        }))
        .await;

        let mut outputs = Vec::new();
        let mut failures = BTreeMap::new();
        let mut first_error = None;
        for (host, result) in results {
            match result {
                Ok(mut host_outputs) => outputs.append(&mut host_outputs),
                Err(e) => {
                    error!("Apply of {} failed on {}: {}", resource, host, e);
                    failures.insert(host, e.to_string());
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(Error::DryRunCancelled) = first_error {
            return Err(Error::DryRunCancelled);
        }

        let mut committed = false;
        if !ctx.is_test() {
            if let Some(e) = first_error {
                return Err(e);
            }
            self.commit(resource)?;
            committed = true;

            let members: BTreeSet<String> = plan
                .hosts
                .iter()
                .filter(|h| h.member)
                .map(|h| h.name.clone())
                .collect();
            self.refresh_hosts(ctx, &members).await;
        }

        Ok(ApplyReport {
            resource: resource.to_string(),
            mode: ctx.mode(),
            files: plan.files,
            outputs,
            failures,
            committed,
        })
    }

    /// Apply every resource in name order
    pub async fn apply_all(&self, ctx: &ExecContext) -> Result<Vec<ApplyReport>> {
        let names: Vec<String> = self.cluster.read().resources.keys().cloned().collect();
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(self.apply(ctx, &name).await?);
        }
        Ok(reports)
    }

    /// Run an apply as a dry-run preview inside `session`
    pub async fn preview(
        &self,
        session: &Arc<DryRunSession>,
        executor: CommandExecutorRef,
        resource: &str,
    ) -> Result<DryRunReport> {
        let guard = session.begin().await;
        let ctx = ExecContext::preview(executor, &guard);
        self.apply(&ctx, resource).await?;
        guard.finish()
    }

    /// Re-read device status of one host
    pub async fn refresh_host(&self, ctx: &ExecContext, host: &str) -> Result<usize> {
        let _status = self.status_lock.lock().await;
        let text = ctx.executor().fetch_status(host).await?;
        self.cluster.write().observe_status_text(host, &text)
    }

    /// Get overall coordinator status
    pub fn status(&self) -> CoordinatorStatus {
        let cluster = self.cluster.read();
        CoordinatorStatus {
            hosts: cluster.hosts.len(),
            resources: cluster.resources.len(),
            committed_resources: cluster.resources.values().filter(|r| r.committed).count(),
            pending_resources: cluster.resources.values().filter(|r| r.has_pending()).count(),
            resync_cycles: cluster.persisted_resync_cycles().len(),
            applying: self.status_lock.try_lock().is_err(),
        }
    }
}
