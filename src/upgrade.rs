//! In-place rolling upgrade of a running cluster.
//!
//! Unlike install, nodes are upgraded strictly one at a time and every node must rejoin
//! before the next is touched. Nothing is persisted; a failed upgrade is rerun from the
//! start.

use itertools::Itertools;
use serde_yaml::{Mapping, Value};

use crate::bootstrap::{self, BootstrapPaths, GENCONF_CONTAINER, NGINX_CONTAINER};
use crate::error::{LaunchError, Result};
use crate::genconf::{self, OnpremConfig, ResolvedScript, ScriptKind};
use crate::health;
use crate::install::InstallContext;
use crate::rollout::RolloutPlan;
use crate::session::{argv, Transport, Tunnel};
use crate::topology::Role;

const UPGRADE_SCRIPT_URL_PREFIX: &str = "Node upgrade script URL: ";
const NODE_UPGRADE_SCRIPT: &str = "dcos_node_upgrade.sh";
const DEFAULT_CLUSTER_NAME: &str = "Upgraded DC/OS";

#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    /// Version the cluster currently runs.
    pub starting_version: String,
    /// Installer of the target version.
    pub installer_url: String,
    /// Applied on top of the generated upgrade configuration.
    pub overrides: Mapping,
}

/// Pulls the node upgrade script URL out of the installer's output.
pub fn parse_upgrade_script_url(output: &str) -> Result<String> {
    let last = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default();
    last.split_once(UPGRADE_SCRIPT_URL_PREFIX)
        .map(|(_, url)| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            LaunchError::validation(
                "starting_version",
                format!("installer did not report a node upgrade script URL: '{}'", last),
            )
        })
}

/// Installer configuration for generating the node upgrade script.
pub fn upgrade_config(
    ctx: &InstallContext,
    zk_hosts: &str,
    bootstrap_url: &str,
    overrides: &Mapping,
) -> Result<OnpremConfig> {
    let platform = ctx.config.platform()?;
    let topology = &ctx.topology;
    let cluster_name = ctx
        .config
        .dcos_config
        .extra
        .get("cluster_name")
        .cloned()
        .unwrap_or_else(|| Value::from(DEFAULT_CLUSTER_NAME));
    let mut config = OnpremConfig::default();
    config.insert("cluster_name", cluster_name);
    config.insert("ssh_user", ctx.config.ssh_user.clone());
    config.insert("master_discovery", "static");
    config.insert("exhibitor_storage_backend", "zookeeper");
    config.insert("exhibitor_zk_hosts", zk_hosts);
    config.insert("exhibitor_zk_path", "/exhibitor");
    config.insert("bootstrap_url", bootstrap_url);
    config.insert("rexray_config_reset", platform.as_str());
    config.insert("platform", platform.as_str());
    for (key, role) in [
        ("master_list", Role::Master),
        ("agent_list", Role::PrivateAgent),
        ("public_agent_list", Role::PublicAgent),
    ] {
        let ips = topology
            .private_ips(role)
            .into_iter()
            .map(Value::String)
            .collect();
        config.insert(key, Value::Sequence(ips));
    }
    config.merge(overrides);
    Ok(config)
}

/// Clears out the previous installer run on the bootstrap host.
async fn reset_bootstrap(transport: &dyn Transport, host: &str, paths: &BootstrapPaths) -> Result<()> {
    tracing::info!("Killing any previous installer before starting upgrade");
    if let Some(containers) =
        bootstrap::docker_service_status(transport, host, GENCONF_CONTAINER).await?
    {
        let mut cmd = argv(&["sudo", "docker", "kill"]);
        cmd.extend(containers.split_whitespace().map(str::to_string));
        transport.command(host, &cmd).await?;
    }
    tracing::info!("Clearing out old installation files");
    transport
        .command(host, &argv(&["sudo", "rm", "-rf", &paths.genconf()]))
        .await?;
    transport
        .command(host, &argv(&["mkdir", &paths.genconf()]))
        .await?;
    Ok(())
}

/// Uploads the upgrade configuration, generates the node upgrade script and returns
/// its URL. The served install script is edited so upgrades leave docker running.
async fn generate_node_upgrade_script(
    tunnel: &dyn Tunnel,
    paths: &BootstrapPaths,
    config: &OnpremConfig,
    ssh_key: &str,
    ip_detect: &str,
    starting_version: &str,
) -> Result<String> {
    tracing::info!("Setting up upgrade config on bootstrap host");
    tunnel
        .upload(config.to_yaml()?.as_bytes(), &paths.genconf_file("config.yaml"))
        .await?;
    let key_path = paths.genconf_file("ssh_key");
    tunnel.upload(ssh_key.as_bytes(), &key_path).await?;
    tunnel.command(&argv(&["chmod", "600", &key_path])).await?;
    tunnel
        .upload(ip_detect.as_bytes(), &paths.genconf_file("ip-detect"))
        .await?;

    tracing::info!(starting_version, "Generating node upgrade script");
    let output = tunnel
        .command(&argv(&[
            "bash",
            &paths.installer(),
            "--generate-node-upgrade-script",
            starting_version,
        ]))
        .await?;
    let url = parse_upgrade_script_url(&String::from_utf8_lossy(&output))?;

    // Restarting docker would kill containerized tasks on upgraded agents.
    tunnel
        .command(&argv(&[
            "sudo",
            "sed",
            "-i",
            "-e",
            "s/systemctl restart systemd-journald//g",
            "-e",
            "s/systemctl restart docker//g",
            &format!("{}/dcos_install.sh", paths.serve()),
        ]))
        .await?;
    tunnel
        .command(&argv(&["sudo", "docker", "restart", NGINX_CONTAINER]))
        .await?;
    Ok(url)
}

fn fetch_argv(url: &str) -> Vec<String> {
    argv(&[
        "curl",
        "--silent",
        "--verbose",
        "--show-error",
        "--fail",
        "--location",
        "--keepalive-time",
        "2",
        "--retry",
        "20",
        "--speed-limit",
        "100000",
        "--speed-time",
        "60",
        "--remote-name",
        url,
    ])
}

/// Upgrades every node in `plan` order, stopping at the first node that fails to
/// upgrade or rejoin. Later nodes are left untouched.
pub async fn upgrade_nodes(ctx: &InstallContext, plan: &RolloutPlan, script_url: &str) -> Result<()> {
    let summary = plan
        .steps()
        .map(|(role, host)| format!("{} ({})", host.public_ip, role))
        .join(", ");
    tracing::info!(plan = %summary, "Upgrade plan");
    let transport = ctx.transport.as_ref();
    for (role, host) in plan.steps() {
        let address = host.public_ip.as_str();
        tracing::info!(%role, host = address, "Upgrading");
        transport.command(address, &fetch_argv(script_url)).await?;
        transport
            .command(address, &argv(&["sudo", "bash", NODE_UPGRADE_SCRIPT]))
            .await?;
        tracing::info!(%role, host = address, "Waiting to rejoin the cluster");
        health::wait_for_rejoin(
            ctx.metrics.as_ref(),
            address,
            role,
            ctx.poll_interval,
            ctx.config.rejoin_timeout(),
        )
        .await?;
    }
    Ok(())
}

/// Upgrades the cluster to the version behind `request.installer_url`, visiting
/// nodes in `plan` order.
pub async fn upgrade(ctx: &InstallContext, request: &UpgradeRequest, plan: &RolloutPlan) -> Result<()> {
    let platform = ctx.config.platform()?;
    let ssh_key = ctx.config.ssh_private_key.clone().ok_or_else(|| {
        LaunchError::validation("ssh_private_key", "required to generate the upgrade")
    })?;
    let ip_detect = match genconf::resolve_script(ScriptKind::IpDetect, &ctx.config, platform)? {
        ResolvedScript::Contents(contents) => contents,
        ResolvedScript::FaultDomainHelper => {
            return Err(LaunchError::validation(
                "ip_detect_contents",
                "cannot be generated",
            ))
        }
    };

    let transport = ctx.transport.as_ref();
    let bootstrap_host = ctx.bootstrap();
    let paths = ctx.bootstrap_paths().await?;
    reset_bootstrap(transport, bootstrap_host, &paths).await?;
    bootstrap::download_installer(transport, bootstrap_host, &paths.installer(), &request.installer_url)
        .await?;

    tracing::info!("Starting ZooKeeper on the bootstrap node");
    let zk_hosts = bootstrap::start_bootstrap_zk(transport, &ctx.topology.bootstrap).await?;
    let nginx = bootstrap::start_bootstrap_nginx(transport, &ctx.topology.bootstrap, &paths).await?;
    let config = upgrade_config(ctx, &zk_hosts, &format!("http://{}", nginx), &request.overrides)?;

    let tunnel = transport.tunnel(bootstrap_host).await?;
    let script_url = generate_node_upgrade_script(
        tunnel.as_ref(),
        &paths,
        &config,
        &ssh_key,
        &ip_detect,
        &request.starting_version,
    )
    .await;
    tunnel.close().await?;
    let script_url = script_url?;

    upgrade_nodes(ctx, plan, &script_url).await?;
    tracing::info!("Every node upgraded, waiting for the whole cluster");
    ctx.wait_for_cluster().await
}
