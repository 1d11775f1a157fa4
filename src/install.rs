//! The work behind each install stage, for both install methods.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::bootstrap::{self, BootstrapPaths};
use crate::config::{InstallMethod, LaunchConfig};
use crate::error::{LaunchError, Result};
use crate::genconf::{self, OnpremConfig, ScriptKind};
use crate::health::{self, MetricsSource};
use crate::installer_api::{Action, InstallerApi};
use crate::rollout::{self, WorkUnit};
use crate::session::{argv, Transport};
use crate::stage::{RemoteStageStore, StageMachine, StageWork};
use crate::templates::ScriptTemplates;
use crate::topology::ClusterTopology;

/// Where cluster hosts keep the install script fetched from the bootstrap host.
pub const REMOTE_INSTALL_SCRIPT: &str = "/tmp/install_dcos.sh";

/// Everything the stage work needs, shared by both install methods.
pub struct InstallContext {
    pub transport: Arc<dyn Transport>,
    pub metrics: Arc<dyn MetricsSource>,
    pub config: LaunchConfig,
    pub topology: ClusterTopology,
    pub templates: ScriptTemplates,
    pub poll_interval: Duration,
}

impl InstallContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSource>,
        config: LaunchConfig,
        topology: ClusterTopology,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            metrics,
            config,
            topology,
            templates: ScriptTemplates::new()?,
            poll_interval: health::DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub(crate) fn bootstrap(&self) -> &str {
        &self.topology.bootstrap.public_ip
    }

    pub(crate) async fn bootstrap_paths(&self) -> Result<BootstrapPaths> {
        BootstrapPaths::discover(self.transport.as_ref(), &self.topology.bootstrap).await
    }

    /// Waits for SSH everywhere, readies docker and `genconf/` on the bootstrap host,
    /// downloads the installer and runs the prerequisites script on cluster hosts.
    async fn prepare_hosts(&self) -> Result<BootstrapPaths> {
        // Read before anything remote so a bad path fails fast.
        let prereqs = match &self.config.prereqs_script_filename {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                LaunchError::validation(
                    "prereqs_script_filename",
                    format!("cannot read {}: {}", path.display(), e),
                )
            })?),
            None => None,
        };
        let transport = self.transport.as_ref();
        let timeout = self.config.ssh_timeout();
        // At most `parallelism` connection attempts at once; every wait finishes
        // before the first failure is reported.
        let wait_futures: Vec<_> = self
            .topology
            .all_hosts()
            .map(|host| transport.wait_for_ssh_connection(&host.public_ip, timeout))
            .collect();
        let waits: Vec<Result<()>> = stream::iter(wait_futures)
            .buffer_unordered(self.config.parallelism)
            .collect()
            .await;
        waits.into_iter().collect::<Result<Vec<()>>>()?;

        let bootstrap = self.bootstrap();
        bootstrap::add_ssh_user_to_docker_users(transport, bootstrap).await?;
        let paths = self.bootstrap_paths().await?;
        transport
            .command(bootstrap, &argv(&["mkdir", "-p", &paths.genconf()]))
            .await?;
        bootstrap::download_installer(
            transport,
            bootstrap,
            &paths.installer(),
            &self.config.installer_url,
        )
        .await?;

        if let Some(script) = prereqs {
            let units = self
                .topology
                .cluster_hosts()
                .map(|host| WorkUnit::script(host.public_ip.clone(), &script))
                .collect();
            let results =
                rollout::run_fan_out(self.transport.clone(), units, self.config.parallelism)
                    .await?;
            rollout::check_results("prereqs", &results)?;
        }
        Ok(paths)
    }

    async fn fan_out_checked(&self, action: &str, units: Vec<WorkUnit>) -> Result<()> {
        let results =
            rollout::run_fan_out(self.transport.clone(), units, self.config.parallelism).await?;
        rollout::check_results(action, &results)
    }

    pub(crate) async fn wait_for_cluster(&self) -> Result<()> {
        health::wait_for_cluster(
            self.metrics.as_ref(),
            &self.topology,
            self.poll_interval,
            self.config.rejoin_timeout(),
        )
        .await
    }
}

/// Drives `dcos_generate_config.sh` and the node install script over SSH.
pub struct SshInstall {
    ctx: InstallContext,
}

impl SshInstall {
    pub fn new(ctx: InstallContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StageWork for SshInstall {
    async fn setup(&self) -> Result<()> {
        self.ctx.prepare_hosts().await?;
        Ok(())
    }

    async fn genconf(&self) -> Result<()> {
        let ctx = &self.ctx;
        let onprem = genconf::materialize(
            &ctx.config,
            &ctx.topology,
            ctx.transport.as_ref(),
            &ctx.templates,
        )
        .await?;
        let paths = ctx.bootstrap_paths().await?;
        let tunnel = ctx.transport.tunnel(ctx.bootstrap()).await?;
        let result = async {
            genconf::upload_genconf(tunnel.as_ref(), &paths, &onprem).await?;
            tracing::info!("Running installer genconf");
            tunnel
                .command(&argv(&["sudo", "bash", &paths.installer(), "--genconf"]))
                .await?;
            Ok::<_, LaunchError>(())
        }
        .await;
        tunnel.close().await?;
        result?;
        let address =
            bootstrap::restart_bootstrap_nginx(ctx.transport.as_ref(), &ctx.topology.bootstrap, &paths)
                .await?;
        tracing::info!(%address, "Serving install artifacts");
        Ok(())
    }

    async fn preflight(&self) -> Result<()> {
        let ctx = &self.ctx;
        let url = bootstrap::install_script_url(&ctx.topology.bootstrap);
        let units = rollout::units_by_role(&ctx.topology, |role, host| {
            let script = ctx.templates.preflight(role, &url, REMOTE_INSTALL_SCRIPT)?;
            Ok(WorkUnit::script(host.public_ip.clone(), &script))
        })?;
        ctx.fan_out_checked("preflight", units).await
    }

    async fn deploy(&self) -> Result<()> {
        let ctx = &self.ctx;
        rollout::deploy(
            ctx.transport.clone(),
            &ctx.topology,
            REMOTE_INSTALL_SCRIPT,
            ctx.config.parallelism,
        )
        .await
    }

    async fn postflight(&self) -> Result<()> {
        let ctx = &self.ctx;
        let script = ctx.templates.postflight()?;
        let units = ctx
            .topology
            .cluster_hosts()
            .map(|host| WorkUnit::script(host.public_ip.clone(), &script))
            .collect();
        ctx.fan_out_checked("postflight", units).await?;
        ctx.wait_for_cluster().await
    }
}

/// Drives the installer's web API; the installer itself talks to the cluster hosts.
pub struct WebInstall {
    ctx: InstallContext,
    api: InstallerApi,
}

impl WebInstall {
    pub fn new(ctx: InstallContext) -> Self {
        let api = InstallerApi::new(ctx.bootstrap(), ctx.config.installer_port);
        Self { ctx, api }
    }

    pub fn with_api(ctx: InstallContext, api: InstallerApi) -> Self {
        Self { ctx, api }
    }
}

/// The web installer takes the ip-detect script under a different key.
fn web_installer_config(mut onprem: OnpremConfig) -> OnpremConfig {
    if let Some(script) = onprem.get(&ScriptKind::IpDetect.contents_key()).cloned() {
        onprem.insert("ip_detect_script", script);
    }
    onprem
}

#[async_trait]
impl StageWork for WebInstall {
    async fn setup(&self) -> Result<()> {
        let ctx = &self.ctx;
        let paths = ctx.prepare_hosts().await?;
        let port = ctx.config.installer_port.to_string();
        let installer = paths.installer();
        let mut cmd = argv(&[
            "env",
            "DCOS_INSTALLER_DAEMONIZE=true",
            "bash",
            &installer,
            "--web",
            "-p",
            &port,
        ]);
        if ctx.config.offline_mode {
            cmd.push("--offline".to_string());
        }
        tracing::info!(host = ctx.bootstrap(), %port, "Starting installer server");
        ctx.transport.command(ctx.bootstrap(), &cmd).await?;
        self.api.wait_for_up().await
    }

    async fn genconf(&self) -> Result<()> {
        let ctx = &self.ctx;
        let onprem = genconf::materialize(
            &ctx.config,
            &ctx.topology,
            ctx.transport.as_ref(),
            &ctx.templates,
        )
        .await?;
        self.api.genconf(&web_installer_config(onprem)).await
    }

    async fn preflight(&self) -> Result<()> {
        self.api.run_action(Action::Preflight).await
    }

    async fn deploy(&self) -> Result<()> {
        self.api.run_action(Action::Deploy).await
    }

    async fn postflight(&self) -> Result<()> {
        self.api.run_action(Action::Postflight).await?;
        self.ctx.wait_for_cluster().await
    }
}

pub fn stage_work(ctx: InstallContext) -> Box<dyn StageWork> {
    match ctx.config.install_method {
        InstallMethod::Ssh => Box::new(SshInstall::new(ctx)),
        InstallMethod::Web => Box::new(WebInstall::new(ctx)),
    }
}

/// Installs the cluster, resuming after the last stage recorded on the bootstrap host.
pub async fn install(ctx: InstallContext) -> Result<()> {
    let transport = ctx.transport.clone();
    let bootstrap = ctx.bootstrap().to_string();
    let work = stage_work(ctx);
    let store = RemoteStageStore::new(transport.as_ref(), bootstrap);
    StageMachine::new(&store, work.as_ref()).advance().await
}
