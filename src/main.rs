use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde_yaml::Mapping;
use tracing_subscriber::EnvFilter;

use onprem_launch::config::{Cli, Command, LaunchConfig};
use onprem_launch::error::{LaunchError, Result};
use onprem_launch::health::HttpMetrics;
use onprem_launch::host::load_hosts;
use onprem_launch::install::{install, InstallContext};
use onprem_launch::rollout::RolloutPlan;
use onprem_launch::session::{SshOptions, SshTransport, Transport};
use onprem_launch::stage::{RemoteStageStore, StageStore};
use onprem_launch::topology::{ClusterTopology, Role};
use onprem_launch::upgrade::{upgrade, UpgradeRequest};

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        // Remote command output goes to stdout.
        .with_writer(std::io::stderr)
        .init();
}

fn load_overrides(path: Option<&Path>) -> Result<Mapping> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                LaunchError::validation(
                    "overrides",
                    format!("cannot read {}: {}", path.display(), e),
                )
            })?;
            Ok(serde_yaml::from_str(&text)?)
        }
        None => Ok(Mapping::new()),
    }
}

fn describe(topology: &ClusterTopology) {
    println!("bootstrap: {}", topology.bootstrap);
    for role in Role::ALL {
        println!("{}s:", role);
        for host in topology.hosts_for(role) {
            println!("  - {}", host);
        }
    }
}

fn ssh_transport(cli: &Cli, config: &LaunchConfig, topology: &ClusterTopology) -> SshTransport {
    let options = SshOptions {
        user: config.ssh_user.clone(),
        port: config.ssh_port,
        keyfile: config.ssh_private_key_filename.clone(),
        print_period: cli.print_period,
        ..Default::default()
    };
    let hosts: Vec<String> = topology.all_hosts().map(|h| h.public_ip.clone()).collect();
    SshTransport::new(options, &hosts)
}

#[tokio::main]
async fn main() -> Result<(), LaunchError> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let config = LaunchConfig::load(&cli.config, cli.ssh_key_file.as_deref())?;
    let hosts = load_hosts(&cli.hosts_file)?;
    let topology = ClusterTopology::from_hosts(
        hosts,
        config.num_masters,
        config.num_private_agents,
        config.num_public_agents,
    )?;
    let transport: Arc<dyn Transport> = Arc::new(ssh_transport(&cli, &config, &topology));

    match &cli.command {
        Command::Describe => describe(&topology),
        Command::Status => {
            let store = RemoteStageStore::new(transport.as_ref(), topology.bootstrap.public_ip.clone());
            match store.get_last_state().await? {
                Some(stage) => println!("{}", stage),
                None => println!("not started"),
            }
        }
        Command::Install => {
            tracing::info!(method = ?config.install_method, "Installing cluster");
            let ctx = InstallContext::new(transport, Arc::new(HttpMetrics::new()), config, topology)?;
            install(ctx).await?;
            tracing::info!("Cluster installed");
        }
        Command::Upgrade {
            starting_version,
            installer_url,
            overrides,
        } => {
            let request = UpgradeRequest {
                starting_version: starting_version.clone(),
                installer_url: installer_url.clone(),
                overrides: load_overrides(overrides.as_deref())?,
            };
            let ctx = InstallContext::new(transport, Arc::new(HttpMetrics::new()), config, topology)?;
            let plan = RolloutPlan::for_upgrade(&ctx.topology, &mut rand::thread_rng());
            upgrade(&ctx, &request, &plan).await?;
            tracing::info!("Cluster upgraded");
        }
    }

    Ok(())
}
