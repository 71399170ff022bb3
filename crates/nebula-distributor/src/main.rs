//! Command line entry point: builds every host config, then distributes
//! configs and certificates over SSH.

use anyhow::{Context, Result};
use clap::Parser;
use fleet_orchestration::{
    FleetOrchestrator, KeyringStore, LocalAddresses, NebulaCert, OrchestratorSettings,
    RunOptions, ServiceAction, SshConnector, build_plan, connection_plan, gather_passwords,
};
use nebula_config::{CertsConfig, Composer, IpChangeMap, SourcePaths, SourceStore, parser};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

mod logging;
mod summary;

/// Change-IP map picked up from the working directory when not given
const DEFAULT_CHANGE_IP: &str = "change_ip.yml";

#[derive(Parser)]
#[command(name = "nebula-distributor")]
#[command(about = "Build Nebula configs and distribute them to the fleet")]
#[command(version)]
struct Cli {
    /// Network configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Root of the config sources and certificates
    #[arg(short, long, default_value = "files")]
    files: PathBuf,

    /// Only process these hosts or lighthouses
    #[arg(long, num_args = 1..)]
    hosts: Vec<String>,

    /// Connect to each host and print its hostname, nothing else
    #[arg(long)]
    ping: bool,

    /// Write configs and certificates locally, never connect
    #[arg(long, conflicts_with = "ping")]
    generate_only: bool,

    /// Issue fresh certificates and install them
    #[arg(long)]
    generate_certs: bool,

    /// How nebula picks up the new config
    #[arg(long, default_value = "reload")]
    restart_type: ServiceAction,

    /// Do not reload hosts whose installed config fails verification
    #[arg(long)]
    strict_verify: bool,

    /// Prompt for sudo passwords even when the keyring has them
    #[arg(long)]
    overwrite_pw: bool,

    /// Hosts moving to a new mesh address
    #[arg(long)]
    change_ip: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log to this file instead of stdout
    #[arg(long)]
    log: Option<PathBuf>,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            ping: self.ping,
            generate_only: self.generate_only,
            generate_certs: self.generate_certs,
            restart_type: self.restart_type,
            strict_verify: self.strict_verify,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = logging::init(cli.verbose, cli.log.as_deref())?;

    let success = smol::block_on(run(&cli))?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(cli: &Cli) -> Result<bool> {
    let network = parser::parse_file(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    let paths = SourcePaths::new(&cli.files);
    let store = SourceStore::load(&paths).context("cannot load config sources")?;
    let changes = load_changes(cli)?;
    if !changes.is_empty() {
        info!(hosts = changes.len(), "address changes pending");
    }

    let selection = (!cli.hosts.is_empty()).then_some(cli.hosts.as_slice());
    let plan = if cli.ping {
        let plan = connection_plan(&network, &changes, selection);
        println!("Pinging {} hosts", plan.records.len());
        plan
    } else {
        let plan = build_plan(&network, &Composer::new(&store), &changes, selection)
            .context("cannot build distribution plan")?;
        println!(
            "Built {} configs in {}",
            plan.records.len(),
            network.config_output_dir.display()
        );
        plan
    };

    let certs = network.certs.clone().unwrap_or_else(|| CertsConfig {
        ca_cert: paths.certs_dir.join("ca.crt"),
        ca_key: paths.certs_dir.join("ca.key"),
        output_dir: paths.certs_dir.clone(),
    });
    std::fs::create_dir_all(&certs.output_dir)
        .with_context(|| format!("cannot create {}", certs.output_dir.display()))?;
    let identities = NebulaCert::new(certs.ca_cert, certs.ca_key, certs.output_dir);

    let timeout = Duration::from_secs(network.ssh.timeout);
    let settings = OrchestratorSettings {
        probe_timeout: timeout,
        connect_timeout: timeout,
        ..OrchestratorSettings::default()
    };
    let mut orchestrator = FleetOrchestrator::new(SshConnector::default(), &identities, settings);

    if !cli.generate_only {
        orchestrator = orchestrator.with_local_addresses(LocalAddresses::discover()?);
        if network.ssh.ask_sudo && !cli.ping {
            let usernames = plan
                .records
                .iter()
                .filter(|record| record.use_sudo && !record.skip_connection)
                .map(|record| record.username.as_str());
            let credentials = gather_passwords(
                &KeyringStore::default(),
                usernames,
                cli.overwrite_pw,
                prompt_password,
            )?;
            orchestrator = orchestrator.with_credentials(credentials);
        }
    }

    let summary = orchestrator.run(&plan, &cli.run_options()).await;
    summary::print(&summary);
    Ok(summary.is_success())
}

/// Address changes apply to real distributions only; generated artifacts keep
/// the addresses from the network config.
fn load_changes(cli: &Cli) -> Result<IpChangeMap> {
    if cli.generate_only {
        return Ok(IpChangeMap::default());
    }
    let path = match &cli.change_ip {
        Some(path) => path.clone(),
        None if Path::new(DEFAULT_CHANGE_IP).exists() => PathBuf::from(DEFAULT_CHANGE_IP),
        None => return Ok(IpChangeMap::default()),
    };
    IpChangeMap::load(&path).with_context(|| format!("cannot load {}", path.display()))
}

fn prompt_password(username: &str) -> fleet_orchestration::Result<String> {
    warn!(%username, "sudo password needed");
    dialoguer::Password::new()
        .with_prompt(format!("sudo password for {}", username))
        .interact()
        .map_err(|e| fleet_orchestration::Error::Credentials(e.to_string()))
}
