//! Instrumented stand-ins for the SSH transport and the metrics endpoint.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use onprem_launch::error::{LaunchError, Result};
use onprem_launch::host::Host;
use onprem_launch::session::{CommandOutput, Transport, Tunnel};
use onprem_launch::{InstallContext, LaunchConfig, MetricsSource};
use onprem_launch::topology::ClusterTopology;

pub const HOME: &str = "/home/core";
pub const UPGRADE_SCRIPT_URL: &str = "http://10.0.0.1:80/upgrade/1234/dcos_node_upgrade.sh";

/// Record of an executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub host: String,
    pub argv: Vec<String>,
}

impl ExecutedCommand {
    pub fn line(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Default)]
pub struct FakeState {
    pub commands: Mutex<Vec<ExecutedCommand>>,
    /// Remote files by (host, path).
    pub files: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Commands containing the pattern exit with the given code on the listed hosts.
    pub failures: Mutex<Vec<(String, String, i32)>>,
    pub delay: Duration,
    /// Hosts `wait_for_ssh_connection` was called for, in call order.
    pub ssh_waits: Mutex<Vec<String>>,
    pub ssh_in_flight: AtomicUsize,
    pub max_ssh_in_flight: AtomicUsize,
    /// Hosts that never accept SSH connections.
    pub unreachable: Mutex<HashSet<String>>,
}

impl FakeState {
    fn record(&self, host: &str, argv: &[String]) {
        self.commands.lock().unwrap().push(ExecutedCommand {
            host: host.to_string(),
            argv: argv.to_vec(),
        });
    }

    fn file_key(host: &str, path: &str) -> (String, String) {
        let path = path.strip_prefix(&format!("{}/", HOME)).unwrap_or(path);
        (host.to_string(), path.to_string())
    }

    async fn run(&self, host: &str, argv: &[String]) -> Result<CommandOutput> {
        self.record(host, argv);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let line = argv.join(" ");
        let failing = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(h, pattern, _)| h == host && line.contains(pattern.as_str()))
            .map(|(_, _, code)| *code);
        if let Some(code) = failing {
            return Ok(output(code, "", &format!("{} failed on {}", line, host)));
        }

        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        Ok(match args.as_slice() {
            ["pwd"] => output(0, &format!("{}\n", HOME), ""),
            ["hostname"] => output(0, &format!("host-{}\n", host), ""),
            ["test", "-f", path] => {
                let exists = self
                    .files
                    .lock()
                    .unwrap()
                    .contains_key(&Self::file_key(host, path));
                output(if exists { 0 } else { 1 }, "", "")
            }
            ["cat", path] => match self.files.lock().unwrap().get(&Self::file_key(host, path)) {
                Some(contents) => output(0, &String::from_utf8_lossy(contents), ""),
                None => output(1, "", "No such file or directory"),
            },
            [.., "--generate-node-upgrade-script", _] => output(
                0,
                &format!("Generating...\nNode upgrade script URL: {}\n", UPGRADE_SCRIPT_URL),
                "",
            ),
            _ => output(0, "", ""),
        })
    }

    async fn wait_for_ssh(&self, host: &str) -> Result<()> {
        self.ssh_waits.lock().unwrap().push(host.to_string());
        let now = self.ssh_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_ssh_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.ssh_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(LaunchError::RetryExhausted {
                what: format!("SSH connection to {}", host),
                last: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn upload(&self, host: &str, contents: &[u8], remote_path: &str) {
        self.record(host, &["upload".to_string(), remote_path.to_string()]);
        self.files
            .lock()
            .unwrap()
            .insert(Self::file_key(host, remote_path), contents.to_vec());
    }

    pub fn commands(&self) -> Vec<ExecutedCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<ExecutedCommand> {
        self.commands()
            .into_iter()
            .filter(|c| c.line().contains(pattern))
            .collect()
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&Self::file_key(host, path))
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    pub fn set_file(&self, host: &str, path: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(Self::file_key(host, path), contents.as_bytes().to_vec());
    }

    pub fn fail_on(&self, host: &str, pattern: &str) {
        self.fail_with(host, pattern, 1);
    }

    pub fn fail_with(&self, host: &str, pattern: &str, returncode: i32) {
        self.failures
            .lock()
            .unwrap()
            .push((host.to_string(), pattern.to_string(), returncode));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }
}

fn output(returncode: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        returncode,
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    pub state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(FakeState {
                delay,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn run(&self, host: &str, argv: &[String]) -> Result<CommandOutput> {
        self.state.run(host, argv).await
    }

    async fn upload(&self, host: &str, contents: &[u8], remote_path: &str) -> Result<()> {
        self.state.upload(host, contents, remote_path);
        Ok(())
    }

    async fn wait_for_ssh_connection(&self, host: &str, _timeout: Duration) -> Result<()> {
        self.state.wait_for_ssh(host).await
    }

    async fn tunnel(&self, host: &str) -> Result<Box<dyn Tunnel>> {
        Ok(Box::new(FakeTunnel {
            host: host.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeTunnel {
    host: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl Tunnel for FakeTunnel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        self.state.run(&self.host, argv).await
    }

    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<()> {
        self.state.upload(&self.host, contents, remote_path);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Reports every node as joined, except those in `never_ready`.
#[derive(Default)]
pub struct FakeMetrics {
    pub never_ready: HashSet<String>,
    pub polled: Mutex<Vec<String>>,
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn snapshot(&self, host: &str, _port: u16) -> Result<Value> {
        self.polled.lock().unwrap().push(host.to_string());
        if self.never_ready.contains(host) {
            return Err(LaunchError::validation("metrics", "connection refused"));
        }
        Ok(json!({ "registrar/log/recovered": 1.0, "slave/registered": 1.0 }))
    }
}

pub fn hosts(n: usize) -> Vec<Host> {
    (1..=n)
        .map(|i| Host::new(format!("10.0.0.{}", i), format!("54.0.0.{}", i)))
        .collect()
}

pub fn launch_config(masters: usize, private: usize, public: usize, extra: &str) -> LaunchConfig {
    let text = format!(
        r#"
platform: aws
installer_url: https://downloads.example.com/dcos_generate_config.sh
num_masters: {}
num_private_agents: {}
num_public_agents: {}
parallelism: 2
ssh_private_key: "PRIVATE KEY"
rejoin_timeout_secs: 1
{}"#,
        masters, private, public, extra
    );
    LaunchConfig::from_yaml(&text).unwrap()
}

pub fn static_dcos_config() -> &'static str {
    "dcos_config:\n  cluster_name: test\n  exhibitor_storage_backend: static\n"
}

pub fn context(
    transport: &FakeTransport,
    metrics: Arc<FakeMetrics>,
    config: LaunchConfig,
) -> InstallContext {
    let total = 1 + config.num_masters + config.num_private_agents + config.num_public_agents;
    let topology = ClusterTopology::from_hosts(
        hosts(total),
        config.num_masters,
        config.num_private_agents,
        config.num_public_agents,
    )
    .unwrap();
    InstallContext::new(Arc::new(transport.clone()), metrics, config, topology)
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
}
