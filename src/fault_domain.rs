//! Synthesized fault-domain detection.
//!
//! Given a per-region quota of hosts and zones, every cluster host is pinned to a
//! region and zone by hostname, and a `fault-domain-detect` script reporting that
//! pinning is generated.

use std::collections::BTreeMap;

use crate::config::FaultDomainRegion;
use crate::error::{LaunchError, Result};
use crate::host::Host;
use crate::session::{argv, Transport};
use crate::templates::{FaultDomainAssignment, ScriptTemplates};
use crate::topology::ClusterTopology;

/// Hostnames available for assignment, per role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostnamePools {
    pub masters: Vec<String>,
    pub private_agents: Vec<String>,
    pub public_agents: Vec<String>,
}

pub fn validate_helper(helper: &BTreeMap<String, FaultDomainRegion>) -> Result<()> {
    let local: Vec<&String> = helper
        .iter()
        .filter(|(_, region)| region.local)
        .map(|(name, _)| name)
        .collect();
    if local.len() > 1 {
        return Err(LaunchError::validation(
            "fault_domain_helper",
            format!("only one region may be local, found {:?}", local),
        ));
    }
    if let Some((name, _)) = helper.iter().find(|(_, region)| region.num_zones == 0) {
        return Err(LaunchError::validation(
            format!("fault_domain_helper.{}.num_zones", name),
            "must be at least 1",
        ));
    }
    Ok(())
}

/// Assigns hosts to regions (in region name order) and zones (round-robin within a
/// region). A local region takes every master first; each region then takes its
/// public and private agent quotas from the shared pools. Hosts left over once every
/// quota is met stay unassigned.
pub fn assign_fault_domains(
    helper: &BTreeMap<String, FaultDomainRegion>,
    pools: HostnamePools,
) -> Vec<FaultDomainAssignment> {
    let mut masters = pools.masters.into_iter();
    let mut public_agents = pools.public_agents.into_iter();
    let mut private_agents = pools.private_agents.into_iter();

    let mut assignments = Vec::new();
    for (region_name, region) in helper {
        let mut region_hosts = Vec::new();
        if region.local {
            region_hosts.extend(masters.by_ref());
        }
        region_hosts.extend(public_agents.by_ref().take(region.num_public_agents));
        region_hosts.extend(private_agents.by_ref().take(region.num_private_agents));
        let num_zones = region.num_zones.max(1);
        for (i, hostname) in region_hosts.into_iter().enumerate() {
            assignments.push(FaultDomainAssignment {
                hostname,
                region: region_name.clone(),
                zone: format!("{}-{}", region_name, i % num_zones + 1),
            });
        }
    }
    assignments
}

/// Hostnames from `pools` that no region took.
pub fn unassigned_hostnames(
    pools: &HostnamePools,
    assignments: &[FaultDomainAssignment],
) -> Vec<String> {
    pools
        .masters
        .iter()
        .chain(&pools.public_agents)
        .chain(&pools.private_agents)
        .filter(|name| !assignments.iter().any(|a| &a.hostname == *name))
        .cloned()
        .collect()
}

async fn fetch_hostnames(transport: &dyn Transport, hosts: &[Host]) -> Result<Vec<String>> {
    let mut hostnames = Vec::with_capacity(hosts.len());
    for host in hosts {
        let out = transport
            .command(&host.public_ip, &argv(&["hostname"]))
            .await?;
        hostnames.push(String::from_utf8_lossy(&out).trim().to_string());
    }
    Ok(hostnames)
}

/// Looks up every cluster host's hostname and renders the detection script.
pub async fn synthesize_script(
    transport: &dyn Transport,
    topology: &ClusterTopology,
    helper: &BTreeMap<String, FaultDomainRegion>,
    templates: &ScriptTemplates,
) -> Result<String> {
    let pools = HostnamePools {
        masters: fetch_hostnames(transport, &topology.masters).await?,
        private_agents: fetch_hostnames(transport, &topology.private_agents).await?,
        public_agents: fetch_hostnames(transport, &topology.public_agents).await?,
    };
    let assignments = assign_fault_domains(helper, pools.clone());
    tracing::debug!(assigned = assignments.len(), "Fault domains assigned");
    let unassigned = unassigned_hostnames(&pools, &assignments);
    if !unassigned.is_empty() {
        // fault-domain-detect fails on these hosts, so their install will too.
        tracing::warn!(
            hosts = ?unassigned,
            "Hosts exceed the fault domain helper quotas and have no fault domain"
        );
    }
    templates.fault_domain(&assignments)
}
