//! End-to-end distribution runs against a simulated fleet

use async_trait::async_trait;
use command_executor::{Command, ExitResult, ExitStatus};
use fleet_orchestration::{
    Connector, DistributionError, DistributionPlan, DistributionRecord, FleetOrchestrator,
    HostState, IdentityMaterial, IdentityProvider, IdentityRequest, LocalAddresses,
    OrchestratorSettings, RetryPolicy, RunOptions, ServiceAction, Transport, build_plan,
    remote_paths,
};
use nebula_config::{Composer, IpChange, IpChangeMap, NetworkConfig, Role, SourceStore, parser};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, TcpListener};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// What the simulated hosts look like and what was done to them
#[derive(Default)]
struct World {
    files: HashMap<(String, String), String>,
    commands: Vec<(String, String, bool)>,
    remote_opened: Vec<String>,
    local_opened: usize,
    fail_writes: HashSet<(String, String)>,
    refuse_connect: HashSet<String>,
    panic_on_run: HashSet<String>,
    stale_readback: HashSet<String>,
    reload_exit: i32,
}

#[derive(Clone, Default)]
struct FakeFleet {
    world: Arc<Mutex<World>>,
    real_probe: bool,
}

impl FakeFleet {
    fn commands_for(&self, host: &str) -> Vec<String> {
        self.world
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(h, _, _)| h == host)
            .map(|(_, cmd, _)| cmd.clone())
            .collect()
    }

    fn file(&self, host: &str, path: &str) -> Option<String> {
        self.world
            .lock()
            .unwrap()
            .files
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }
}

struct FakeTransport {
    host: String,
    world: Arc<Mutex<World>>,
}

fn exit(code: i32, stdout: impl Into<String>) -> ExitResult {
    ExitResult {
        status: ExitStatus {
            code: Some(code),
            #[cfg(unix)]
            signal: None,
        },
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn target(&self) -> String {
        self.host.clone()
    }

    async fn connect(&mut self) -> fleet_orchestration::Result<()> {
        if self.world.lock().unwrap().refuse_connect.contains(&self.host) {
            return Err(fleet_orchestration::Error::Network(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> fleet_orchestration::Result<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn run(&self, command: Command, privileged: bool) -> fleet_orchestration::Result<ExitResult> {
        let program = command.get_program().to_string_lossy().into_owned();
        let args: Vec<String> = command
            .get_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        // Checked apart from the main lock so the panic does not poison it
        let explode = self.world.lock().unwrap().panic_on_run.contains(&self.host);
        if explode {
            panic!("transport fell over");
        }

        let mut world = self.world.lock().unwrap();
        world
            .commands
            .push((self.host.clone(), command.to_shell_string(), privileged));

        let result = match program.as_str() {
            "hostname" => exit(0, format!("{}\n", self.host)),
            "sh" => {
                let path = args[3].clone();
                if world.fail_writes.contains(&(self.host.clone(), path.clone())) {
                    exit(1, "")
                } else {
                    let content =
                        String::from_utf8(command.get_stdin().unwrap_or_default().to_vec()).unwrap();
                    world.files.insert((self.host.clone(), path), content);
                    exit(0, "")
                }
            }
            "cat" => {
                if world.stale_readback.contains(&self.host) {
                    exit(0, "# an older build\n")
                } else {
                    match world.files.get(&(self.host.clone(), args[0].clone())) {
                        Some(content) => exit(0, content.clone()),
                        None => exit(1, ""),
                    }
                }
            }
            "service" => exit(world.reload_exit, ""),
            _ => exit(127, ""),
        };
        Ok(result)
    }

    async fn push_key(&self) -> fleet_orchestration::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Connector for FakeFleet {
    async fn probe(&self, record: &DistributionRecord, timeout: Duration) -> bool {
        if self.real_probe {
            fleet_orchestration::port_open(record.address, record.port, timeout).await
        } else {
            true
        }
    }

    fn remote(
        &self,
        record: &DistributionRecord,
        _sudo_password: Option<String>,
        _connect_timeout: Duration,
    ) -> Box<dyn Transport> {
        self.world
            .lock()
            .unwrap()
            .remote_opened
            .push(record.hostname.clone());
        Box::new(FakeTransport {
            host: record.hostname.clone(),
            world: self.world.clone(),
        })
    }

    fn local(&self, _sudo_password: Option<String>) -> Box<dyn Transport> {
        self.world.lock().unwrap().local_opened += 1;
        Box::new(FakeTransport {
            host: "localhost".to_string(),
            world: self.world.clone(),
        })
    }
}

#[derive(Default)]
struct FakeIdentities {
    existing: bool,
    issued: Mutex<Vec<IdentityRequest>>,
}

#[async_trait]
impl IdentityProvider for FakeIdentities {
    fn has_identity(&self, _role: Role, _hostname: &str) -> bool {
        self.existing
    }

    async fn issue(&self, request: &IdentityRequest) -> fleet_orchestration::Result<()> {
        self.issued.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn material(&self, _role: Role, hostname: &str) -> fleet_orchestration::Result<IdentityMaterial> {
        Ok(IdentityMaterial {
            ca_cert: "CA CERT".to_string(),
            host_cert: format!("{} CERT", hostname),
            host_key: format!("{} KEY", hostname),
        })
    }
}

fn network(dir: &Path, hosts: &str) -> NetworkConfig {
    parser::parse_str(&format!(
        "subnet_prefix_size: 16\nconfig_output_dir: {}\nssh:\n  username: ops\nhosts:\n{}lighthouses:\n",
        dir.display(),
        hosts
    ))
    .unwrap()
}

fn store() -> SourceStore {
    SourceStore::new(
        serde_yaml::from_str("listen: {port: 4242}\nfirewall: {outbound: [], inbound: []}").unwrap(),
        serde_yaml::from_str("lighthouse: {am_lighthouse: false}").unwrap(),
        serde_yaml::from_str("lighthouse: {am_lighthouse: true}").unwrap(),
    )
}

fn plan_for(network: &NetworkConfig, changes: &IpChangeMap) -> DistributionPlan {
    let store = store();
    build_plan(network, &Composer::new(&store), changes, None).unwrap()
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        probe_timeout: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::immediate()
        },
        reload_settle: Duration::ZERO,
        local_settle: Duration::ZERO,
    }
}

fn existing_identities() -> FakeIdentities {
    FakeIdentities {
        existing: true,
        ..FakeIdentities::default()
    }
}

const TWO_HOSTS: &str = "  web1:\n    nebula_ip: 10.42.0.10\n    groups: [public]\n  web2:\n    nebula_ip: 10.42.0.11\n";

#[smol_potat::test]
async fn test_full_distribution_installs_everything() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    let identities = FakeIdentities::default();

    let options = RunOptions {
        generate_certs: true,
        ..RunOptions::default()
    };
    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &options)
        .await;

    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
    assert!(summary.outcomes.iter().all(|o| o.state == HostState::Reloaded));
    assert_eq!(identities.issued.lock().unwrap().len(), 2);

    let record = &plan.records[0];
    let installed = fleet.file("web1", remote_paths::CONFIG).unwrap();
    assert!(installed.contains(&record.token));
    assert_eq!(
        installed,
        std::fs::read_to_string(&record.config_path).unwrap()
    );
    assert_eq!(
        fleet.file("web1", remote_paths::HOST_KEY).as_deref(),
        Some("web1 KEY")
    );

    let commands = fleet.commands_for("web1");
    assert_eq!(
        commands,
        vec![
            "hostname".to_string(),
            "sh -c 'cat > \"$1\"' sh /etc/nebula/ca.crt".to_string(),
            "sh -c 'cat > \"$1\"' sh /etc/nebula/host.crt".to_string(),
            "sh -c 'cat > \"$1\"' sh /etc/nebula/host.key".to_string(),
            "sh -c 'cat > \"$1\"' sh /etc/nebula/config.yaml".to_string(),
            "cat /etc/nebula/config.yaml".to_string(),
            "service nebula reload".to_string(),
        ]
    );
}

#[smol_potat::test]
async fn test_closed_port_records_one_failure_and_never_connects() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dir = TempDir::new().unwrap();
    let hosts = format!(
        "  down1:\n    nebula_ip: 127.0.0.1\n    ssh:\n      port: {}\n",
        port
    );
    let plan = plan_for(&network(dir.path(), &hosts), &IpChangeMap::default());
    let fleet = FakeFleet {
        real_probe: true,
        ..FakeFleet::default()
    };
    let identities = existing_identities();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;

    assert_eq!(summary.failures.len(), 1);
    let failure = &summary.failures[0];
    assert_eq!(failure.hostname, "down1");
    assert_eq!(failure.error, DistributionError::PortDown { port });
    assert!(failure.reason().contains("down"));
    assert!(failure.hard);

    let world = fleet.world.lock().unwrap();
    assert!(world.remote_opened.is_empty());
    assert!(world.commands.is_empty());
}

#[smol_potat::test]
async fn test_verify_mismatch_still_reloads() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    fleet
        .world
        .lock()
        .unwrap()
        .stale_readback
        .insert("web1".to_string());
    let identities = existing_identities();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;

    assert!(summary.is_success());
    let warnings: Vec<_> = summary.integrity_warnings().collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].hostname, "web1");
    assert_eq!(warnings[0].error, DistributionError::VerifyMismatch);

    assert_eq!(
        fleet.commands_for("web1").last().map(String::as_str),
        Some("service nebula reload")
    );
    assert_eq!(summary.outcomes[0].state, HostState::Reloaded);
}

#[smol_potat::test]
async fn test_strict_verify_blocks_reload() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    fleet
        .world
        .lock()
        .unwrap()
        .stale_readback
        .insert("web1".to_string());
    let identities = existing_identities();

    let options = RunOptions {
        strict_verify: true,
        ..RunOptions::default()
    };
    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &options)
        .await;

    assert_eq!(summary.hard_failures().count(), 1);
    assert!(
        !fleet
            .commands_for("web1")
            .iter()
            .any(|cmd| cmd.starts_with("service"))
    );
    assert_eq!(summary.outcomes[1].state, HostState::Reloaded);
}

#[smol_potat::test]
async fn test_failed_host_does_not_stop_the_next() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    fleet
        .world
        .lock()
        .unwrap()
        .fail_writes
        .insert(("web1".to_string(), remote_paths::CONFIG.to_string()));
    let identities = existing_identities();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;

    let failures: Vec<_> = summary.hard_failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].error,
        DistributionError::ConfigInstallFailed(_)
    ));

    // Both attempts of the install were made, nothing after it
    let web1 = fleet.commands_for("web1");
    assert_eq!(web1.len(), 3);
    assert!(web1.iter().all(|cmd| !cmd.starts_with("service")));

    assert_eq!(summary.outcomes[0].state, HostState::Failed);
    assert_eq!(summary.outcomes[1].state, HostState::Reloaded);
}

#[smol_potat::test]
async fn test_reload_failure_is_soft() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    fleet.world.lock().unwrap().reload_exit = 3;
    let identities = existing_identities();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;

    assert!(summary.is_success());
    assert_eq!(summary.integrity_warnings().count(), 2);
    assert!(
        summary
            .failures
            .iter()
            .all(|f| f.error == DistributionError::ReloadFailed { code: 3 })
    );
}

#[smol_potat::test]
async fn test_skip_connection_and_generate_only_stay_offline() {
    let dir = TempDir::new().unwrap();
    let hosts = "  web1:\n    nebula_ip: 10.42.0.10\n    skip_connection: true\n  web2:\n    nebula_ip: 10.42.0.11\n";
    let plan = plan_for(&network(dir.path(), hosts), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    let identities = FakeIdentities::default();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;
    assert_eq!(summary.outcomes[0].state, HostState::Done);
    assert_eq!(fleet.world.lock().unwrap().remote_opened, vec!["web2"]);
    assert_eq!(identities.issued.lock().unwrap().len(), 2);

    let offline = FakeFleet::default();
    let options = RunOptions {
        generate_only: true,
        ..RunOptions::default()
    };
    let summary = FleetOrchestrator::new(offline.clone(), &identities, settings())
        .run(&plan, &options)
        .await;
    assert!(summary.outcomes.iter().all(|o| o.state == HostState::Done));
    assert!(offline.world.lock().unwrap().commands.is_empty());
}

#[smol_potat::test]
async fn test_ping_connects_without_installing() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    let identities = FakeIdentities::default();

    let options = RunOptions {
        ping: true,
        ..RunOptions::default()
    };
    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &options)
        .await;

    assert!(summary.is_success());
    assert!(identities.issued.lock().unwrap().is_empty());
    assert_eq!(fleet.commands_for("web1"), vec!["hostname"]);
    assert!(summary.outcomes.iter().all(|o| o.state == HostState::Connected));
}

#[smol_potat::test]
async fn test_local_machine_skips_the_network() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet {
        real_probe: true,
        ..FakeFleet::default()
    };
    let identities = existing_identities();
    let local: LocalAddresses = ["10.42.0.10".parse::<IpAddr>().unwrap()].into_iter().collect();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .with_local_addresses(local)
        .run(&plan, &RunOptions::default())
        .await;

    let world = fleet.world.lock().unwrap();
    assert_eq!(world.local_opened, 1);
    assert_eq!(summary.outcomes[0].state, HostState::Reloaded);
    // web2 is probed for real and nothing listens on 10.42.0.11
    assert!(summary.failures.iter().all(|f| f.hostname == "web2"));
}

#[smol_potat::test]
async fn test_ip_change_restarts_and_issues_for_new_address() {
    let dir = TempDir::new().unwrap();
    let changes: IpChangeMap = [(
        "web1".to_string(),
        IpChange {
            new_ip: "10.42.1.10".parse().unwrap(),
            nebula_ip: "10.42.0.10".parse().unwrap(),
        },
    )]
    .into_iter()
    .collect();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &changes);
    let fleet = FakeFleet::default();
    let identities = FakeIdentities::default();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;
    assert!(summary.is_success());

    let issued = identities.issued.lock().unwrap();
    assert_eq!(issued[0].ip, "10.42.1.10".parse::<IpAddr>().unwrap());
    assert_eq!(issued[1].ip, "10.42.0.11".parse::<IpAddr>().unwrap());

    assert_eq!(
        fleet.commands_for("web1").last().map(String::as_str),
        Some("service nebula restart")
    );
    assert_eq!(
        fleet.commands_for("web2").last().map(String::as_str),
        Some("service nebula reload")
    );
    assert_eq!(
        plan.records[0].service_action(ServiceAction::Reload),
        ServiceAction::Restart
    );
}

#[smol_potat::test]
async fn test_identity_install_stops_at_first_failed_write() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    fleet
        .world
        .lock()
        .unwrap()
        .fail_writes
        .insert(("web1".to_string(), remote_paths::HOST_CERT.to_string()));
    let identities = FakeIdentities::default();

    let options = RunOptions {
        generate_certs: true,
        ..RunOptions::default()
    };
    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &options)
        .await;

    let failures: Vec<_> = summary.hard_failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hostname, "web1");
    assert_eq!(
        failures[0].error,
        DistributionError::IdentityInstallFailed {
            command: "write /etc/nebula/host.crt".to_string(),
        }
    );
    assert!(failures[0].reason().contains("/etc/nebula/host.crt"));

    assert_eq!(
        fleet.commands_for("web1"),
        vec![
            "hostname".to_string(),
            "sh -c 'cat > \"$1\"' sh /etc/nebula/ca.crt".to_string(),
            "sh -c 'cat > \"$1\"' sh /etc/nebula/host.crt".to_string(),
            "sh -c 'cat > \"$1\"' sh /etc/nebula/host.crt".to_string(),
        ]
    );
    assert!(fleet.file("web1", remote_paths::HOST_KEY).is_none());
    assert!(fleet.file("web1", remote_paths::CONFIG).is_none());

    assert_eq!(summary.outcomes[0].state, HostState::Failed);
    assert_eq!(summary.outcomes[1].state, HostState::Reloaded);
}

#[smol_potat::test]
async fn test_refused_connection_is_recorded() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    fleet
        .world
        .lock()
        .unwrap()
        .refuse_connect
        .insert("web1".to_string());
    let identities = existing_identities();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;

    let failures: Vec<_> = summary.hard_failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hostname, "web1");
    assert!(matches!(
        &failures[0].error,
        DistributionError::ConnectFailed(reason) if reason.contains("connection refused")
    ));
    assert!(fleet.commands_for("web1").is_empty());
    assert_eq!(summary.outcomes[0].state, HostState::Reachable);
    assert_eq!(summary.outcomes[1].state, HostState::Reloaded);
}

#[smol_potat::test]
async fn test_panicking_host_is_contained() {
    let dir = TempDir::new().unwrap();
    let plan = plan_for(&network(dir.path(), TWO_HOSTS), &IpChangeMap::default());
    let fleet = FakeFleet::default();
    fleet
        .world
        .lock()
        .unwrap()
        .panic_on_run
        .insert("web1".to_string());
    let identities = existing_identities();

    let summary = FleetOrchestrator::new(fleet.clone(), &identities, settings())
        .run(&plan, &RunOptions::default())
        .await;

    let failures: Vec<_> = summary.hard_failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hostname, "web1");
    assert_eq!(failures[0].address, "10.42.0.10".parse::<IpAddr>().unwrap());
    assert!(matches!(
        &failures[0].error,
        DistributionError::Unhandled(message) if message.contains("transport fell over")
    ));

    assert_eq!(summary.outcomes[0].state, HostState::Failed);
    assert_eq!(summary.outcomes[1].state, HostState::Reloaded);
    assert_eq!(
        fleet.commands_for("web2").last().map(String::as_str),
        Some("service nebula reload")
    );
}
