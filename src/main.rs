//! Instancer - per-client ephemeral VM/container instances with HTTP API.
//!
//! Usage:
//!   instancer serve [--listen-port 30003] [--timeout 30] [--spawn-grace 30]
//!   instancer purge                      # kill and forget every recorded instance

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use instancer::config::{parse_port_range, Config, WorkloadConfig};
use instancer::http_server;
use instancer::identity::{ClientIdentifier, IdentityMode};
use instancer::state::{AppState, ChallengeInfo};
use instancer::verify::{AllowAll, TurnstileVerifier, Verifier};
use instancer::{InstanceStore, LifecycleManager, ProcessSupervisor};
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "instancer")]
#[command(about = "One ephemeral, isolated instance per client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Instance database
    #[arg(long, global = true, env = "INSTANCE_DB", default_value = "instances.db")]
    db: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Kill every recorded workload and clear the database
    Purge,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "CHALLENGE_PORT", default_value = "30003")]
    listen_port: u16,

    /// Instance lifetime after it becomes ready, in minutes
    #[arg(long, env = "TIMEOUT", default_value = "30")]
    timeout: u64,

    /// Seconds between launch and the instance being reported ready
    #[arg(long, env = "SPAWN_GRACE", default_value = "30")]
    spawn_grace: u64,

    /// Host port range for instances, LOW-HIGH
    #[arg(long, env = "PORT_RANGE", default_value = "49152-65535", value_parser = parse_port_range)]
    port_range: RangeInclusive<u16>,

    /// Ports to try before giving up on a launch
    #[arg(long, default_value = "5")]
    max_spawn_attempts: u32,

    /// How clients are told apart
    #[arg(long, env = "IDENTITY_MODE", value_enum, default_value = "address")]
    identity: IdentityMode,

    /// Take the client address from X-Forwarded-For
    #[arg(long, env = "TRUST_PROXY")]
    trust_proxy: bool,

    /// Title shown by the frontend
    #[arg(long, env = "CHALLENGE_TITLE", default_value = "Seccomp Hell")]
    title: String,

    /// Host clients connect to
    #[arg(long, env = "CHALLENGE_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "TURNSTILE_SITE_KEY")]
    turnstile_site_key: Option<String>,

    /// Without a secret, human verification is disabled
    #[arg(long, env = "TURNSTILE_SECRET_KEY")]
    turnstile_secret_key: Option<String>,

    #[command(flatten)]
    workload: WorkloadArgs,
}

#[derive(Args, Debug)]
struct WorkloadArgs {
    /// Workload program
    #[arg(long, env = "WORKLOAD_PROGRAM", default_value = "qemu-system-x86_64")]
    program: String,

    /// Guest kernel image
    #[arg(long, env = "WORKLOAD_KERNEL", default_value = "bzImage")]
    kernel: String,

    /// Guest initrd
    #[arg(long, env = "WORKLOAD_INITRD", default_value = "initramfs.cpio.gz")]
    initrd: String,

    /// Guest memory
    #[arg(long, env = "WORKLOAD_MEMORY", default_value = "4096M")]
    memory: String,

    /// Service port inside the workload
    #[arg(long, env = "WORKLOAD_INTERNAL_PORT", default_value = "22222")]
    internal_port: u16,

    /// Guest kernel command line
    #[arg(long, env = "WORKLOAD_CMDLINE")]
    kernel_cmdline: Option<String>,

    /// Replace the qemu arguments; {port}, {internal_port} and {client} are substituted
    #[arg(long = "workload-arg", allow_hyphen_values = true)]
    args_template: Vec<String>,
}

impl WorkloadArgs {
    fn into_config(self) -> WorkloadConfig {
        let defaults = WorkloadConfig::default();
        WorkloadConfig {
            program: self.program,
            kernel: self.kernel,
            initrd: self.initrd,
            memory: self.memory,
            internal_port: self.internal_port,
            kernel_cmdline: self.kernel_cmdline.unwrap_or(defaults.kernel_cmdline),
            args_template: (!self.args_template.is_empty()).then_some(self.args_template),
            extra_args: defaults.extra_args,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let store = InstanceStore::open(&cli.db)
        .with_context(|| format!("opening {}", cli.db.display()))?;

    match cli.command {
        Commands::Serve(args) => serve(args, store).await,
        Commands::Purge => {
            // Only kills by recorded pid, so launch settings do not matter.
            let supervisor = Arc::new(ProcessSupervisor::new(WorkloadConfig::default()));
            let manager = LifecycleManager::new(Config::default(), store, supervisor)?;
            let purged = manager.reconcile().await?;
            info!(purged, "Purged recorded instances");
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs, store: InstanceStore) -> anyhow::Result<()> {
    let config = Config {
        spawn_grace: Duration::from_secs(args.spawn_grace),
        session_duration: Duration::from_secs(args.timeout * 60),
        port_range: args.port_range,
        max_spawn_attempts: args.max_spawn_attempts,
        workload: args.workload.into_config(),
    };
    let supervisor = Arc::new(ProcessSupervisor::new(config.workload.clone()));
    let manager = LifecycleManager::new(config, store, supervisor)?;

    let purged = manager.reconcile().await?;
    if purged > 0 {
        warn!(purged, "Killed instances left over from a previous run");
    }

    let verifier: Arc<dyn Verifier> = match args.turnstile_secret_key {
        Some(secret) => Arc::new(TurnstileVerifier::new(secret)?),
        None => {
            warn!("No TURNSTILE_SECRET_KEY set, human verification disabled");
            Arc::new(AllowAll)
        }
    };

    let state = AppState::new(
        manager.clone(),
        ClientIdentifier::new(args.identity, args.trust_proxy),
        verifier,
        ChallengeInfo {
            title: args.title,
            host: args.host,
            turnstile_site_key: args.turnstile_site_key,
        },
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], args.listen_port));
    http_server::run_server(addr, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await
    .context("HTTP server failed")?;

    manager.shutdown();
    Ok(())
}
