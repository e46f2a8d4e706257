//! Remote Test Harness CLI.
//!
//! Provisions build resources, dispatches playbooks to the player CLI,
//! persists results for file-based retries, and reports host/device
//! state for fleet management.

#![forbid(unsafe_code)]

mod cache;
mod events;
mod launcher;
mod provider;
mod results;
mod unpack;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rth_common::cancel::{CancelToken, Cancellation};
use rth_common::config::InvocationConfig;
use rth_common::types::DeviceDescriptor;
use rth_common::{LogConfig, init_logging};
use rth_telemetry::collect::{BatteryCollector, ResourceMetricCollector, StorageAgeCollector};
use rth_telemetry::shell::AdbShell;

use crate::cache::{HttpDownloader, LocalFileDownloader, ResourceCache};
use crate::events::{DeviceSnapshot, HostEvent, HostEventType, HostInfo};
use crate::launcher::{LauncherConfig, PlaybookLauncher};
use crate::provider::{ProvisionedBuild, ResourceProvider, SessionResources};
use crate::results::FileResultReporter;
use crate::unpack::detect_unpacker;

#[derive(Parser)]
#[command(name = "rth")]
#[command(author, version, about = "Remote Test Harness - playbook dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision resources and run the configured playbooks
    Run {
        /// Invocation config (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Download and decompress the configured build resources, then print
    /// the resource map
    Provision {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print a device snapshot host event as JSON
    Snapshot {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Collect device health metrics once and print them as JSON
    Metrics {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Run { config } => run_invocation(&config).await,
        Commands::Provision { config } => provision_only(&config).await,
        Commands::Snapshot { config } => print_snapshot(&config),
        Commands::Metrics { config } => collect_metrics(&config).await,
    }
}

/// Dispatches to the HTTP downloader for remote URLs and the local-file
/// downloader for everything else.
struct UrlDownloader {
    http: HttpDownloader,
}

#[async_trait::async_trait]
impl cache::Downloader for UrlDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
    ) -> std::result::Result<(), rth_common::RetrievalError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.download(url, dest).await
        } else {
            LocalFileDownloader.download(url, dest).await
        }
    }
}

fn build_provider(config: &InvocationConfig, session: Arc<SessionResources>) -> ResourceProvider {
    ResourceProvider::new(
        config.resources.root_dir.clone(),
        config.resources.normalized_entries(),
        config.resources.build_id.clone(),
        config.resources.build_target.clone(),
        session,
        detect_unpacker(config.resources.mount_zip),
    )
}

fn configured_devices(config: &InvocationConfig) -> Vec<DeviceDescriptor> {
    config
        .devices
        .serials
        .iter()
        .map(|serial| DeviceDescriptor::new(serial.clone()))
        .collect()
}

/// Wire ctrl-c to the invocation's cancellation.
fn install_interrupt_handler() -> CancelToken {
    let (cancellation, token) = Cancellation::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling invocation");
            cancellation.cancel();
        }
    });
    token
}

async fn run_invocation(config_path: &Path) -> Result<()> {
    let config = InvocationConfig::load(config_path)?;
    let filters = config.filters.compile()?;
    let token = install_interrupt_handler();

    let cache = ResourceCache::new();
    let session = Arc::new(SessionResources::new());
    let provider = build_provider(&config, session);
    let downloader = UrlDownloader {
        http: HttpDownloader::new(),
    };

    info!("Provisioning {} resource(s)", config.resources.entries.len());
    let build = provider.fetch_build(&cache, &downloader).await?;

    let launcher_config = LauncherConfig {
        player_cli: config.player.cli.clone(),
        play_mode: config.player.mode,
        test_timeout: config.player.test_timeout,
        work_dir: config.player.work_dir.clone(),
        previous_results: config.player.previous_results.clone(),
        binaries: config.player.binaries.clone(),
        global_variables: config.global_variables.clone(),
        tests: config.tests.clone(),
    };
    let mut launcher = PlaybookLauncher::new(launcher_config, filters);
    let mut reporter = FileResultReporter::new(config.player.output_path.clone());

    let devices = configured_devices(&config);
    let run_result = launcher.run(&devices, &mut reporter, &token).await;

    clean_up(&provider, &build, &cache).await;

    run_result?;
    let total = reporter.recorder().test_count();
    let failures = reporter.recorder().failure_count();
    info!("Executed {total} test case(s), {failures} failure(s)");
    if failures > 0 {
        anyhow::bail!("{failures} of {total} test case(s) failed");
    }
    Ok(())
}

async fn clean_up(provider: &ResourceProvider, build: &ProvisionedBuild, cache: &ResourceCache) {
    provider.clean_up(build, cache).await;
    cache.clear();
}

async fn provision_only(config_path: &Path) -> Result<()> {
    let config = InvocationConfig::load(config_path)?;
    let cache = ResourceCache::new();
    let provider = build_provider(&config, Arc::new(SessionResources::new()));
    let downloader = UrlDownloader {
        http: HttpDownloader::new(),
    };

    let build = provider.fetch_build(&cache, &downloader).await?;
    let map: std::collections::BTreeMap<_, _> = build
        .files
        .iter()
        .map(|(name, path)| (name.clone(), path.display().to_string()))
        .collect();
    println!("{}", serde_json::to_string_pretty(&map)?);
    Ok(())
}

fn print_snapshot(config_path: &Path) -> Result<()> {
    let config = InvocationConfig::load(config_path)?;
    let host = HostInfo::detect();

    let mut builder = HostEvent::builder(&host, HostEventType::DeviceSnapshot)
        .cluster_id(&config.invocation.cluster)
        .host_state(rth_common::HostState::Running);
    for serial in &config.devices.serials {
        let mut device = DeviceDescriptor::new(serial.clone());
        device.state = "Available".to_string();
        builder = builder.add_device(DeviceSnapshot::of(&device, &host.hostname));
    }
    if let Some(lab_name) = &config.invocation.lab_name {
        builder = builder.lab_name(lab_name);
    }

    println!("{}", serde_json::to_string_pretty(&builder.build().to_json())?);
    Ok(())
}

async fn collect_metrics(config_path: &Path) -> Result<()> {
    let config = InvocationConfig::load(config_path)?;
    let token = install_interrupt_handler();
    let shell = AdbShell::new();
    let collectors: Vec<Box<dyn ResourceMetricCollector>> = vec![
        Box::new(BatteryCollector::new()),
        Box::new(StorageAgeCollector::new()),
    ];

    let mut snapshots = Vec::new();
    for device in configured_devices(&config) {
        for collector in &collectors {
            // The poll owner enforces the collector timeout; late
            // results are discarded, not awaited.
            let collected = tokio::time::timeout(
                collector.device_timeout(),
                collector.device_metrics(&device, &shell, &token),
            )
            .await;
            match collected {
                Ok(resources) => snapshots.extend(resources),
                Err(_) => warn!(
                    "Collector timed out for {}; discarding late results",
                    device.serial
                ),
            }
        }
    }
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}
