//! DRBD Manager
//!
//! Offline front end to the configuration layer: renders the files each
//! host would receive, reports every validation problem, and proposes
//! ports. It never contacts a host.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drbd_manager::params::{check_common, check_resource};
use drbd_manager::{ApplyCoordinator, Cluster, ManagerConfig, ValidationErrors};

// =============================================================================
// CLI Arguments
// =============================================================================

/// DRBD Manager - configuration and orchestration for replicated block storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster description (YAML)
    #[arg(long, env = "DRBD_CLUSTER", default_value = "cluster.yaml", global = true)]
    cluster: PathBuf,

    /// Manager configuration (YAML); built-in defaults when absent
    #[arg(long, env = "DRBD_MANAGER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the configuration files a host would receive
    Render {
        #[arg(long)]
        host: String,
        /// Only this resource's file
        #[arg(long)]
        resource: Option<String>,
        /// Print the files as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print every validation problem and persisted resync-after cycle
    Check {
        #[arg(long)]
        resource: Option<String>,
    },
    /// Propose replication and proxy ports for a set of hosts
    Ports {
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,
        /// First port to offer
        #[arg(long)]
        preferred: Option<u16>,
        /// Also propose an inside/outside pair on this relay host
        #[arg(long)]
        relay: Option<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);
    info!("DRBD Manager {}", drbd_manager::VERSION);

    let config = match &args.config {
        Some(path) => ManagerConfig::load(path)
            .with_context(|| format!("loading manager configuration {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    let cluster = Cluster::load(&args.cluster)
        .with_context(|| format!("loading cluster {}", args.cluster.display()))?;
    if cluster.syntax != config.syntax {
        warn!(
            "Cluster {} uses {:?} syntax, overriding the configured {:?}",
            cluster.name, cluster.syntax, config.syntax
        );
    }
    let schema = Arc::new(drbd_manager::DrbdSchema::builtin(cluster.syntax));
    let coordinator = ApplyCoordinator::new(config, schema.clone(), cluster.into_shared());

    match args.command {
        Command::Render {
            host,
            resource,
            json,
        } => {
            let wanted = resource.map(|r| coordinator.config().resource_path(&r));
            let files: Vec<_> = coordinator
                .render_host_files(&host)?
                .into_iter()
                .filter(|f| wanted.as_ref().map_or(true, |path| *path == f.path))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else {
                for file in files {
                    println!("# {}", file.path);
                    print!("{}", file.contents);
                }
            }
        }

        Command::Check { resource } => {
            let cluster = coordinator.cluster().read();
            let names: Vec<String> = match resource {
                Some(name) => {
                    cluster.resource(&name)?;
                    vec![name]
                }
                None => cluster.resources.keys().cloned().collect(),
            };

            let mut problems = ValidationErrors::new();
            problems.extend(check_common(schema.as_ref(), &cluster));
            for name in &names {
                problems.extend(check_resource(schema.as_ref(), &cluster, name));
            }
            for problem in problems.iter() {
                println!("{}", problem);
            }
            for cycle in cluster.persisted_resync_cycles() {
                println!("warning: resync-after cycle {}", cycle.join(" -> "));
            }
            if !problems.is_empty() {
                bail!("{} problem(s) found", problems.len());
            }
            println!("{} resource(s) ok", names.len());
        }

        Command::Ports {
            hosts,
            preferred,
            relay,
        } => {
            let cluster = coordinator.cluster().read();
            let allocator = coordinator.allocator();
            let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();

            let port = allocator.lowest_unused_port(&cluster, &hosts)?;
            let candidates = allocator.port_candidates(&cluster, &hosts, preferred)?;
            println!("lowest unused port: {}", port);
            println!(
                "candidates: {}",
                candidates
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if let Some(relay) = relay {
                let pair = allocator.propose_proxy_ports(&cluster, &[relay.as_str()])?;
                println!("proxy on {}: inside {} outside {}", relay, pair.inside, pair.outside);
            }
        }
    }

    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
