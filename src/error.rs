use itertools::Itertools;
use thiserror::Error;

use crate::stage::InstallStage;

/// A single failed remote command, as reported inside an aggregated error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    pub host: String,
    pub returncode: i32,
    pub stderr: String,
}

impl std::fmt::Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (exit {}): {}",
            self.host,
            self.returncode,
            self.stderr.trim_end()
        )
    }
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures.iter().join("; ")
}

fn last_seen(stage: &Option<InstallStage>) -> String {
    stage.map_or_else(|| "none".to_string(), |s| s.to_string())
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Invalid configuration for '{field}': {message}")]
    Validation { field: String, message: String },
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    Ssh(#[from] openssh::Error),
    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to (de)serialize YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to render script template: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("Failed to parse script template: {0}")]
    TemplateSyntax(#[from] handlebars::TemplateError),
    #[error("Command {argv:?} on {host} exited with {returncode}: {stderr}")]
    CommandFailed {
        host: String,
        argv: Vec<String>,
        returncode: i32,
        stderr: String,
    },
    #[error("{action} failed on {} host(s): {}", failures.len(), join_failures(failures))]
    DeploymentFailure {
        action: String,
        failures: Vec<HostFailure>,
    },
    #[error("Installer stage marker is inconsistent, last seen stage: {}", last_seen(.0))]
    InconsistentState(Option<InstallStage>),
    #[error("Unrecognized install stage on bootstrap host: '{0}'")]
    UnknownStage(String),
    #[error("Timed out waiting for {role} {host} to rejoin the cluster")]
    RejoinTimeout { host: String, role: String },
    #[error("Gave up on {what}: {last}")]
    RetryExhausted { what: String, last: String },
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LaunchError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;
