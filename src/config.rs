//! Configuration for onprem-launch.
//!
//! Holds the clap structs for command line arguments and the YAML launch
//! configuration. Everything environment-derived is collected here once and passed
//! down as plain data.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, Result};

#[derive(Parser)]
#[command(version, author, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Launch configuration file
    #[arg(long, short, global = true, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Host file listing the provisioned hosts. Defaults to `hosts.yaml`
    #[arg(long, global = true, default_value = "hosts.yaml")]
    pub hosts_file: PathBuf,

    /// How often to print remote output. Giving 0 will suppress stdout/stderr.
    #[arg(long, short, global = true, default_value = "1")]
    pub print_period: usize,

    /// SSH private key, overriding the one named in the launch configuration
    #[arg(long, global = true, env = "ONPREM_SSH_KEY_FILE")]
    pub ssh_key_file: Option<PathBuf>,

    /// Log filter directive
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    pub log: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Install the cluster, resuming from the last completed stage
    Install,
    /// Upgrade a running cluster in place, one node at a time
    Upgrade {
        /// Version the cluster is currently running
        #[arg(long)]
        starting_version: String,
        /// Installer for the version to upgrade to
        #[arg(long)]
        installer_url: String,
        /// YAML mapping of extra installer configuration for the upgrade
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Print the last completed install stage
    Status,
    /// Print the cluster layout
    Describe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Aws,
    Gce,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Aws => "aws",
            Platform::Gce => "gce",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aws" => Ok(Platform::Aws),
            "gce" => Ok(Platform::Gce),
            other => Err(LaunchError::validation(
                "platform",
                format!("'{}' is not supported for onprem, use 'aws' or 'gce'", other),
            )),
        }
    }
}

/// How the stage work is carried out on the bootstrap host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMethod {
    /// Drive `dcos_generate_config.sh` and the node install script over SSH.
    #[default]
    Ssh,
    /// Drive the installer's web API.
    Web,
}

/// Fault-domain layout of one region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FaultDomainRegion {
    pub num_zones: usize,
    #[serde(default)]
    pub num_private_agents: usize,
    #[serde(default)]
    pub num_public_agents: usize,
    /// The region the masters live in. Must be stated for every region.
    pub local: bool,
}

/// Installer configuration as given by the user.
///
/// Keys this crate interprets are typed; everything else passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DcosConfig {
    pub exhibitor_storage_backend: Option<String>,
    pub exhibitor_zk_hosts: Option<String>,
    pub ip_detect_contents: Option<String>,
    pub ip_detect_filename: Option<PathBuf>,
    pub ip_detect_public_contents: Option<String>,
    pub ip_detect_public_filename: Option<PathBuf>,
    pub fault_domain_detect_contents: Option<String>,
    pub fault_domain_detect_filename: Option<PathBuf>,
    pub ssh_key: Option<String>,
    pub ssh_user: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Keys derived from the topology that users may not set.
pub const READONLY_DCOS_KEYS: [&str; 3] = ["master_list", "agent_list", "public_agent_list"];

fn default_installer_port() -> u16 {
    9000
}

fn default_ssh_user() -> String {
    "core".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_parallelism() -> usize {
    10
}

fn default_ssh_timeout_secs() -> u64 {
    600
}

fn default_rejoin_timeout_secs() -> u64 {
    1200
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LaunchConfig {
    pub platform: String,
    pub installer_url: String,
    #[serde(default = "default_installer_port")]
    pub installer_port: u16,
    #[serde(default)]
    pub install_method: InstallMethod,
    #[serde(default)]
    pub offline_mode: bool,
    pub num_masters: usize,
    pub num_private_agents: usize,
    pub num_public_agents: usize,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_private_key_filename: Option<PathBuf>,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
    /// Always inject the launch SSH key into the installer configuration.
    #[serde(default)]
    pub key_helper: bool,
    /// Upper bound on concurrently open remote sessions during fan-out.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub prereqs_script_filename: Option<PathBuf>,
    #[serde(default)]
    pub fault_domain_helper: Option<BTreeMap<String, FaultDomainRegion>>,
    #[serde(default = "default_ssh_timeout_secs")]
    pub ssh_timeout_secs: u64,
    #[serde(default = "default_rejoin_timeout_secs")]
    pub rejoin_timeout_secs: u64,
    #[serde(default)]
    pub dcos_config: DcosConfig,
}

impl LaunchConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the launch configuration and inlines the SSH private key.
    pub fn load(path: impl AsRef<Path>, ssh_key_override: Option<&Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LaunchError::validation("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&text)?;
        if let Some(keyfile) = ssh_key_override {
            config.ssh_private_key_filename = Some(keyfile.to_path_buf());
            config.ssh_private_key = None;
        }
        if config.ssh_private_key.is_none() {
            if let Some(keyfile) = &config.ssh_private_key_filename {
                let key = std::fs::read_to_string(keyfile).map_err(|e| {
                    LaunchError::validation(
                        "ssh_private_key_filename",
                        format!("cannot read {}: {}", keyfile.display(), e),
                    )
                })?;
                config.ssh_private_key = Some(key);
            }
        }
        Ok(config)
    }

    pub fn platform(&self) -> Result<Platform> {
        self.platform.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.platform()?;
        if ![1, 3, 5, 7, 9].contains(&self.num_masters) {
            return Err(LaunchError::validation(
                "num_masters",
                format!("{} is not one of 1, 3, 5, 7, 9", self.num_masters),
            ));
        }
        if self.parallelism == 0 {
            return Err(LaunchError::validation("parallelism", "must be at least 1"));
        }
        if self.ssh_private_key.is_some() && self.ssh_private_key_filename.is_some() {
            return Err(LaunchError::validation(
                "ssh_private_key",
                "cannot be set together with ssh_private_key_filename",
            ));
        }
        if let Some(key) = READONLY_DCOS_KEYS
            .iter()
            .find(|key| self.dcos_config.extra.contains_key(**key))
        {
            return Err(LaunchError::validation(
                format!("dcos_config.{}", key),
                "is derived from the cluster hosts and cannot be set",
            ));
        }
        Ok(())
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    pub fn rejoin_timeout(&self) -> Duration {
        Duration::from_secs(self.rejoin_timeout_secs)
    }
}
