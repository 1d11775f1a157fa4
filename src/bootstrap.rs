//! Preparing the bootstrap host: installer download and the helper containers
//! (ZooKeeper, nginx) the rest of the cluster pulls from during install.

use std::time::Duration;

use crate::error::Result;
use crate::host::Host;
use crate::retry::retry_fixed;
use crate::session::{argv, Transport};
use crate::templates::curl_argv;

pub const INSTALLER_NAME: &str = "dcos_generate_config.sh";
pub const GENCONF_DIR: &str = "genconf";
pub const ZK_CONTAINER: &str = "dcos-bootstrap-zk";
pub const NGINX_CONTAINER: &str = "dcos-bootstrap-nginx";
pub const GENCONF_CONTAINER: &str = "dcos-genconf";

/// S3 may answer 403 for freshly uploaded artifacts for several minutes, which
/// curl's own retry treats as fatal.
const DOWNLOAD_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const DOWNLOAD_RETRY_BUDGET: Duration = Duration::from_secs(300);

/// Where things live on the bootstrap host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPaths {
    pub home: String,
}

impl BootstrapPaths {
    pub fn new(home: impl Into<String>) -> Self {
        Self { home: home.into() }
    }

    pub async fn discover(transport: &dyn Transport, bootstrap: &Host) -> Result<Self> {
        Ok(Self::new(transport.home_dir(&bootstrap.public_ip).await?))
    }

    pub fn installer(&self) -> String {
        format!("{}/{}", self.home, INSTALLER_NAME)
    }

    pub fn genconf(&self) -> String {
        format!("{}/{}", self.home, GENCONF_DIR)
    }

    pub fn genconf_file(&self, name: &str) -> String {
        format!("{}/{}/{}", self.home, GENCONF_DIR, name)
    }

    /// Directory nginx serves the generated install artifacts from.
    pub fn serve(&self) -> String {
        self.genconf_file("serve")
    }
}

/// Downloads the installer to `installer_path` on `host`, retrying on any failure
/// for up to five minutes.
pub async fn download_installer(
    transport: &dyn Transport,
    host: &str,
    installer_path: &str,
    download_url: &str,
) -> Result<()> {
    let cmd = curl_argv(download_url, installer_path);
    retry_fixed(
        &format!("downloading installer from {}", download_url),
        DOWNLOAD_RETRY_INTERVAL,
        DOWNLOAD_RETRY_BUDGET,
        || async {
            tracing::info!(url = download_url, host, "Attempting to download installer");
            transport.command(host, &cmd).await.map(|_| ())
        },
    )
    .await
}

pub async fn add_ssh_user_to_docker_users(transport: &dyn Transport, host: &str) -> Result<()> {
    transport
        .command(
            host,
            &argv(&["bash", "-c", "sudo usermod -aG docker \"$(whoami)\""]),
        )
        .await?;
    Ok(())
}

/// Container id of the running container `name`, if any.
pub async fn docker_service_status(
    transport: &dyn Transport,
    host: &str,
    name: &str,
) -> Result<Option<String>> {
    let out = transport
        .command(
            host,
            &argv(&[
                "sudo",
                "docker",
                "ps",
                "--quiet",
                "--filter",
                &format!("name={}", name),
                "--filter",
                "status=running",
            ]),
        )
        .await?;
    let status = String::from_utf8_lossy(&out).trim().to_string();
    Ok(if status.is_empty() { None } else { Some(status) })
}

pub async fn start_docker_service(
    transport: &dyn Transport,
    host: &str,
    name: &str,
    docker_args: &[String],
) -> Result<()> {
    let mut cmd = argv(&[
        "sudo",
        "docker",
        "run",
        "--name",
        name,
        "--detach=true",
    ]);
    cmd.extend_from_slice(docker_args);
    transport.command(host, &cmd).await?;
    Ok(())
}

/// Starts container `name` unless it is already running.
pub async fn check_or_start_docker_service(
    transport: &dyn Transport,
    host: &str,
    name: &str,
    docker_args: &[String],
) -> Result<()> {
    if let Some(status) = docker_service_status(transport, host, name).await? {
        tracing::warn!(name, container = %status, "Using currently running container");
        return Ok(());
    }
    start_docker_service(transport, host, name, docker_args).await
}

/// Starts (or reuses) a ZooKeeper on the bootstrap host and returns its connection string.
pub async fn start_bootstrap_zk(transport: &dyn Transport, bootstrap: &Host) -> Result<String> {
    tracing::info!(host = %bootstrap, "Starting ZooKeeper on the bootstrap host");
    check_or_start_docker_service(
        transport,
        &bootstrap.public_ip,
        ZK_CONTAINER,
        &argv(&[
            "--publish=2181:2181",
            "--publish=2888:2888",
            "--publish=3888:3888",
            "jplock/zookeeper",
        ]),
    )
    .await?;
    Ok(format!("{}:2181", bootstrap.private_addr()))
}

fn nginx_args(paths: &BootstrapPaths) -> Vec<String> {
    vec![
        "--publish=80:80".to_string(),
        format!("--volume={}:/usr/share/nginx/html", paths.serve()),
        "nginx".to_string(),
    ]
}

/// Starts (or reuses) the nginx serving generated artifacts and returns its address.
pub async fn start_bootstrap_nginx(
    transport: &dyn Transport,
    bootstrap: &Host,
    paths: &BootstrapPaths,
) -> Result<String> {
    check_or_start_docker_service(
        transport,
        &bootstrap.public_ip,
        NGINX_CONTAINER,
        &nginx_args(paths),
    )
    .await?;
    Ok(format!("{}:80", bootstrap.private_addr()))
}

/// Replaces any running nginx so it picks up a freshly generated `serve/` directory.
pub async fn restart_bootstrap_nginx(
    transport: &dyn Transport,
    bootstrap: &Host,
    paths: &BootstrapPaths,
) -> Result<String> {
    let host = &bootstrap.public_ip;
    if docker_service_status(transport, host, NGINX_CONTAINER)
        .await?
        .is_some()
    {
        transport
            .command(host, &argv(&["sudo", "docker", "rm", "-f", NGINX_CONTAINER]))
            .await?;
    }
    start_docker_service(transport, host, NGINX_CONTAINER, &nginx_args(paths)).await?;
    Ok(format!("{}:80", bootstrap.private_addr()))
}

/// URL cluster hosts fetch the generated install script from.
pub fn install_script_url(bootstrap: &Host) -> String {
    format!("http://{}:80/dcos_install.sh", bootstrap.private_addr())
}
