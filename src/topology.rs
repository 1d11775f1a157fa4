//! Partitioning of provisioned hosts into cluster roles.

use std::fmt;

use crate::error::{LaunchError, Result};
use crate::host::Host;

/// Node roles a cluster host can be installed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    PrivateAgent,
    PublicAgent,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Master, Role::PrivateAgent, Role::PublicAgent];

    /// Argument the installer scripts take to select the role.
    pub fn install_arg(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::PrivateAgent => "slave",
            Role::PublicAgent => "slave_public",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::PrivateAgent => "agent",
            Role::PublicAgent => "public agent",
        }
    }

    /// Port of the Mesos process whose metrics reflect this node's health.
    pub fn metrics_port(self) -> u16 {
        match self {
            Role::Master => 5050,
            Role::PrivateAgent | Role::PublicAgent => 5051,
        }
    }

    /// Metric that reaches 1 once a node of this role has (re)joined the cluster.
    pub fn rejoin_metric(self) -> &'static str {
        match self {
            Role::Master => "registrar/log/recovered",
            Role::PrivateAgent | Role::PublicAgent => "slave/registered",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    pub bootstrap: Host,
    pub masters: Vec<Host>,
    pub private_agents: Vec<Host>,
    pub public_agents: Vec<Host>,
}

impl ClusterTopology {
    /// Sorts `hosts` and slices them into bootstrap, masters, private agents and
    /// public agents, in that order. The same host list always yields the same
    /// assignment.
    pub fn from_hosts(
        mut hosts: Vec<Host>,
        num_masters: usize,
        num_private_agents: usize,
        num_public_agents: usize,
    ) -> Result<Self> {
        let needed = 1 + num_masters + num_private_agents + num_public_agents;
        if hosts.len() < needed {
            return Err(LaunchError::validation(
                "hosts",
                format!(
                    "{} hosts required (1 bootstrap, {} masters, {} private agents, {} public agents) but only {} provided",
                    needed,
                    num_masters,
                    num_private_agents,
                    num_public_agents,
                    hosts.len()
                ),
            ));
        }
        if hosts.len() > needed {
            tracing::warn!(
                provided = hosts.len(),
                needed,
                "Ignoring hosts beyond the requested cluster size"
            );
        }
        hosts.sort();
        let mut hosts = hosts.into_iter();
        let bootstrap = hosts
            .next()
            .ok_or_else(|| LaunchError::validation("hosts", "no bootstrap host provided"))?;
        let masters: Vec<Host> = hosts.by_ref().take(num_masters).collect();
        let private_agents: Vec<Host> = hosts.by_ref().take(num_private_agents).collect();
        let public_agents: Vec<Host> = hosts.by_ref().take(num_public_agents).collect();

        let topology = Self {
            bootstrap,
            masters,
            private_agents,
            public_agents,
        };
        if let Some(host) = topology
            .all_hosts()
            .find(|h| h.private_ip.as_deref().map_or(true, str::is_empty))
        {
            return Err(LaunchError::validation(
                "hosts",
                format!("all cluster hosts require a private IP, {} has none", host),
            ));
        }
        Ok(topology)
    }

    pub fn hosts_for(&self, role: Role) -> &[Host] {
        match role {
            Role::Master => &self.masters,
            Role::PrivateAgent => &self.private_agents,
            Role::PublicAgent => &self.public_agents,
        }
    }

    /// Masters and agents, without the bootstrap host.
    pub fn cluster_hosts(&self) -> impl Iterator<Item = &Host> {
        self.masters
            .iter()
            .chain(self.private_agents.iter())
            .chain(self.public_agents.iter())
    }

    /// Every host, the bootstrap host last.
    pub fn all_hosts(&self) -> impl Iterator<Item = &Host> {
        self.cluster_hosts().chain(std::iter::once(&self.bootstrap))
    }

    pub fn private_ips(&self, role: Role) -> Vec<String> {
        self.hosts_for(role)
            .iter()
            .map(|h| h.private_addr().to_string())
            .collect()
    }

    pub fn role_of(&self, public_ip: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| {
            self.hosts_for(*role)
                .iter()
                .any(|h| h.public_ip == public_ip)
        })
    }
}
