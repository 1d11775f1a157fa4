//! Client for the installer's web mode (`dcos_generate_config.sh --web`).

use std::collections::BTreeMap;
use std::time::Duration;

use itertools::Itertools;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{HostFailure, LaunchError, Result};
use crate::genconf::OnpremConfig;
use crate::retry::retry_fixed;

const UP_INTERVAL: Duration = Duration::from_secs(1);
const UP_BUDGET: Duration = Duration::from_secs(60);
const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Remote actions the installer runs across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Preflight,
    Deploy,
    Postflight,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Preflight => "preflight",
            Action::Deploy => "deploy",
            Action::Postflight => "postflight",
        }
    }
}

/// Body of `GET /api/v1/action/{action}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionStatus {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostStatus {
    pub host_status: String,
    #[serde(default)]
    pub commands: Vec<ActionCommand>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionCommand {
    #[serde(default)]
    pub cmd: Value,
    #[serde(default)]
    pub returncode: Option<i32>,
    #[serde(default)]
    pub stderr: Value,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines.iter().map(value_text).join("\n"),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionProgress {
    InProgress,
    Finished { failures: Vec<HostFailure> },
}

impl ActionStatus {
    /// Done once no host is `running` or `unstarted`; every host that did not end in
    /// `success` is a failure carrying its failed commands.
    pub fn progress(&self) -> ActionProgress {
        let busy = self
            .hosts
            .values()
            .any(|h| h.host_status == "running" || h.host_status == "unstarted");
        if busy {
            return ActionProgress::InProgress;
        }
        let failures = self
            .hosts
            .iter()
            .filter(|(_, h)| h.host_status != "success")
            .map(|(host, h)| {
                let failed: Vec<&ActionCommand> = h
                    .commands
                    .iter()
                    .filter(|c| c.returncode != Some(0))
                    .collect();
                let returncode = failed
                    .first()
                    .and_then(|c| c.returncode)
                    .unwrap_or(-1);
                let stderr = failed
                    .iter()
                    .map(|c| format!("{}: {}", value_text(&c.cmd), value_text(&c.stderr)))
                    .join("; ");
                HostFailure {
                    host: host.clone(),
                    returncode,
                    stderr: if stderr.is_empty() {
                        format!("host status '{}'", h.host_status)
                    } else {
                        stderr
                    },
                }
            })
            .collect();
        ActionProgress::Finished { failures }
    }
}

#[derive(Debug, Clone)]
pub struct InstallerApi {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl InstallerApi {
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_base_url(format!("http://{}:{}", host, port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: ACTION_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Blocks until the installer server answers.
    pub async fn wait_for_up(&self) -> Result<()> {
        let url = self.url("/");
        retry_fixed("installer server", UP_INTERVAL, UP_BUDGET, || async {
            tracing::debug!(url = %url, "Waiting for installer server");
            self.client.get(&url).send().await?.error_for_status()?;
            Ok(())
        })
        .await?;
        tracing::info!(url = %self.base_url, "Installer server is up");
        Ok(())
    }

    /// Submits the configuration and checks the installer accepted it.
    pub async fn genconf(&self, config: &OnpremConfig) -> Result<()> {
        tracing::info!("Generating configuration on installer server");
        self.client
            .post(self.url("/api/v1/configure"))
            .json(&config.to_json()?)
            .send()
            .await?
            .error_for_status()?;
        let status: Value = self
            .client
            .get(self.url("/api/v1/configure/status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match status.as_object() {
            Some(errors) if !errors.is_empty() => Err(LaunchError::validation(
                "dcos_config",
                format!("rejected by the installer: {}", status),
            )),
            _ => Ok(()),
        }
    }

    pub async fn start_action(&self, action: Action) -> Result<()> {
        self.client
            .post(self.url(&format!("/api/v1/action/{}", action.as_str())))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn check_action(&self, action: Action) -> Result<ActionStatus> {
        Ok(self
            .client
            .get(self.url(&format!("/api/v1/action/{}", action.as_str())))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Starts `action` and polls until every host finished. The installer enforces
    /// its own timeouts, so there is none here.
    pub async fn run_action(&self, action: Action) -> Result<()> {
        tracing::info!(action = action.as_str(), "Starting installer action");
        self.start_action(action).await?;
        loop {
            match self.check_action(action).await?.progress() {
                ActionProgress::InProgress => {
                    tracing::info!(action = action.as_str(), "Not yet finished, waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
                ActionProgress::Finished { failures } if failures.is_empty() => return Ok(()),
                ActionProgress::Finished { failures } => {
                    return Err(LaunchError::DeploymentFailure {
                        action: action.as_str().to_string(),
                        failures,
                    })
                }
            }
        }
    }
}
