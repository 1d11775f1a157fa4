//! onprem-launch: resumable on-premises cluster installer and rolling upgrader.

// Serde helper module.
mod serde;
// Command line arguments and launch configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent hosts.
pub mod host;
// Partitioning hosts into cluster roles.
pub mod topology;
// Fixed-interval retry with a total budget.
pub mod retry;
// Remote execution over SSH.
pub mod session;
// Shell scripts rendered for cluster hosts.
pub mod templates;
// Installer download and helper containers on the bootstrap host.
pub mod bootstrap;
// Fault domain assignment and script synthesis.
pub mod fault_domain;
// Installer configuration materialization.
pub mod genconf;
// Bounded parallel rollout across hosts.
pub mod rollout;
// Node health via Mesos metrics.
pub mod health;
// Installer web API client.
pub mod installer_api;
// Resumable install state machine.
pub mod stage;
// Stage work for SSH and web installs.
pub mod install;
// Rolling upgrade.
pub mod upgrade;

pub use config::{Cli, Command, InstallMethod, LaunchConfig, Platform};
pub use error::{HostFailure, LaunchError, Result};
pub use genconf::{materialize, OnpremConfig};
pub use health::{HttpMetrics, MetricsSource};
pub use host::{load_hosts, parse_hosts, Host};
pub use install::{install, InstallContext, SshInstall, WebInstall};
pub use rollout::{run_fan_out, CommandResult, RolloutPlan, WorkUnit};
pub use session::{CommandOutput, SshOptions, SshTransport, Transport, Tunnel};
pub use stage::{InstallStage, RemoteStageStore, StageMachine, StageStore, StageWork};
pub use topology::{ClusterTopology, Role};
pub use upgrade::{upgrade, UpgradeRequest};
