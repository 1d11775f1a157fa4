//! Parallel rollout of commands across cluster hosts.
//!
//! Work is pushed into a shared channel and a fixed pool of worker tasks pulls from it,
//! so at most `parallelism` remote commands are in flight regardless of how many hosts
//! or roles a rollout covers.

use std::sync::Arc;

use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{HostFailure, LaunchError, Result};
use crate::host::Host;
use crate::session::{argv, Transport};
use crate::topology::{ClusterTopology, Role};

/// One command to run on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub host: String,
    pub argv: Vec<String>,
}

impl WorkUnit {
    pub fn new(host: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            host: host.into(),
            argv,
        }
    }

    /// Runs `script` through `bash -c`.
    pub fn script(host: impl Into<String>, script: &str) -> Self {
        Self::new(host, argv(&["bash", "-c", script]))
    }
}

/// Outcome of a [`WorkUnit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub host: String,
    /// -1 if the host could not be reached.
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Runs every unit with at most `parallelism` in flight, waiting for all of them.
///
/// Results come back in the order the units were given. Failing to reach a host does
/// not stop the rollout; it is recorded as a failed result.
pub async fn run_fan_out(
    transport: Arc<dyn Transport>,
    units: Vec<WorkUnit>,
    parallelism: usize,
) -> Result<Vec<CommandResult>> {
    if parallelism == 0 {
        return Err(LaunchError::validation("parallelism", "must be at least 1"));
    }
    let num_units = units.len();
    // MPMC channel (used as SPMC) handing units to whichever worker is free.
    let (unit_tx, unit_rx) = flume::bounded::<(usize, WorkUnit)>(parallelism);

    let mut workers = Vec::with_capacity(parallelism);
    for _ in 0..parallelism.min(num_units) {
        let unit_rx = unit_rx.clone();
        let transport = Arc::clone(&transport);
        workers.push(tokio::spawn(async move {
            let mut results = Vec::new();
            while let Ok((index, unit)) = unit_rx.recv_async().await {
                let result = match transport.run(&unit.host, &unit.argv).await {
                    Ok(output) => CommandResult {
                        host: unit.host,
                        returncode: output.returncode,
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    },
                    Err(e) => {
                        tracing::warn!(host = %unit.host, error = %e, "Remote command did not run");
                        CommandResult {
                            host: unit.host,
                            returncode: -1,
                            stdout: String::new(),
                            stderr: e.to_string(),
                        }
                    }
                };
                results.push((index, result));
            }
            results
        }));
    }
    drop(unit_rx);

    for (index, unit) in units.into_iter().enumerate() {
        // Fails only if every worker is gone, which join_all below reports.
        if unit_tx.send_async((index, unit)).await.is_err() {
            break;
        }
    }
    // After this, workers drain what is queued and exit.
    drop(unit_tx);

    let mut results = Vec::with_capacity(num_units);
    for worker in join_all(workers).await {
        results.extend(worker?);
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, result)| result).collect())
}

/// Fails with every non-zero result if there is at least one.
pub fn check_results(action: &str, results: &[CommandResult]) -> Result<()> {
    let failures: Vec<HostFailure> = results
        .iter()
        .filter(|result| !result.success())
        .map(|result| HostFailure {
            host: result.host.clone(),
            returncode: result.returncode,
            stderr: result.stderr.clone(),
        })
        .collect();
    if failures.is_empty() {
        tracing::info!(action, hosts = results.len(), "Succeeded on every host");
        Ok(())
    } else {
        Err(LaunchError::DeploymentFailure {
            action: action.to_string(),
            failures,
        })
    }
}

/// One work unit per cluster host, built from its role.
pub fn units_by_role<F>(topology: &ClusterTopology, mut build: F) -> Result<Vec<WorkUnit>>
where
    F: FnMut(Role, &Host) -> Result<WorkUnit>,
{
    let mut units = Vec::new();
    for role in Role::ALL {
        for host in topology.hosts_for(role) {
            units.push(build(role, host)?);
        }
    }
    Ok(units)
}

/// Runs the install script on every cluster host with its role argument.
///
/// Masters and agents share a single pool, so the ceiling holds across roles.
pub async fn deploy(
    transport: Arc<dyn Transport>,
    topology: &ClusterTopology,
    remote_script_path: &str,
    parallelism: usize,
) -> Result<()> {
    let units = units_by_role(topology, |role, host| {
        Ok(WorkUnit::new(
            host.public_ip.clone(),
            argv(&["sudo", "bash", remote_script_path, role.install_arg()]),
        ))
    })?;
    tracing::info!(hosts = units.len(), parallelism, "Deploying");
    let results = run_fan_out(transport, units, parallelism).await?;
    check_results("deploy", &results)
}

/// Hosts of one role, in the order they are visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub role: Role,
    pub hosts: Vec<Host>,
}

impl PlanEntry {
    pub fn display_name(&self) -> &'static str {
        self.role.display_name()
    }
}

/// Order in which hosts are taken down during an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutPlan {
    pub entries: Vec<PlanEntry>,
}

impl RolloutPlan {
    /// Masters in random order, then private agents, then public agents.
    pub fn for_upgrade<R: Rng + ?Sized>(topology: &ClusterTopology, rng: &mut R) -> Self {
        let mut masters = topology.masters.clone();
        masters.shuffle(rng);
        Self {
            entries: vec![
                PlanEntry {
                    role: Role::Master,
                    hosts: masters,
                },
                PlanEntry {
                    role: Role::PrivateAgent,
                    hosts: topology.private_agents.clone(),
                },
                PlanEntry {
                    role: Role::PublicAgent,
                    hosts: topology.public_agents.clone(),
                },
            ],
        }
    }

    pub fn steps(&self) -> impl Iterator<Item = (Role, &Host)> {
        self.entries
            .iter()
            .flat_map(|entry| entry.hosts.iter().map(move |host| (entry.role, host)))
    }
}
