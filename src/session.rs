//! Remote execution over SSH.
//!
//! The orchestration code only talks to the [`Transport`] trait, so tests can swap in an
//! instrumented fake. [`SshTransport`] is the real implementation: one OpenSSH
//! multiplexed connection per call, or a longer-lived [`Tunnel`] for a sequence of
//! commands against the same host.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use colored::ColoredString;
use colourado::{Color, ColorPalette, PaletteType};
use futures::future::try_join;
use openssh::{KnownHosts, Session as SshSession, SessionBuilder, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

use crate::error::{LaunchError, Result};
use crate::host::prettify_address;
use crate::retry::retry_fixed;

/// What a remote command left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 if the remote process was killed by a signal.
    pub returncode: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }

    /// Returns stdout, or a `CommandFailed` error naming the host if the command failed.
    pub fn into_checked(self, host: &str, argv: &[String]) -> Result<Vec<u8>> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(LaunchError::CommandFailed {
                host: host.to_string(),
                argv: argv.to_vec(),
                returncode: self.returncode,
                stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            })
        }
    }
}

/// Builds an owned argv from string slices.
pub fn argv<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|p| p.as_ref().to_string()).collect()
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `argv` on `host`. A non-zero exit is not an error here; only failing to
    /// reach the host is.
    async fn run(&self, host: &str, argv: &[String]) -> Result<CommandOutput>;

    /// Writes `contents` to `remote_path` on `host`, replacing any existing file.
    async fn upload(&self, host: &str, contents: &[u8], remote_path: &str) -> Result<()>;

    /// Blocks until `host` accepts SSH connections or `timeout` elapses.
    async fn wait_for_ssh_connection(&self, host: &str, timeout: Duration) -> Result<()>;

    /// Opens a session to `host` that stays up until the tunnel is closed or dropped.
    async fn tunnel(&self, host: &str) -> Result<Box<dyn Tunnel>>;

    /// Runs `argv` and returns its stdout, failing on a non-zero exit.
    async fn command(&self, host: &str, argv: &[String]) -> Result<Vec<u8>> {
        self.run(host, argv).await?.into_checked(host, argv)
    }

    async fn copy_file(&self, host: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        let contents = tokio::fs::read(local_path).await?;
        self.upload(host, &contents, remote_path).await
    }

    /// Home directory of the SSH user on `host`.
    async fn home_dir(&self, host: &str) -> Result<String> {
        let out = self.command(host, &argv(&["pwd"])).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

/// A scoped session against a single host. Dropping it tears the session down.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn host(&self) -> &str;

    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;

    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<()>;

    /// Closes the session and reports any teardown error.
    async fn close(self: Box<Self>) -> Result<()>;

    async fn command(&self, argv: &[String]) -> Result<Vec<u8>> {
        let host = self.host().to_string();
        self.run(argv).await?.into_checked(&host, argv)
    }

    async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let contents = tokio::fs::read(local_path).await?;
        self.upload(&contents, remote_path).await
    }
}

/// Connection parameters shared by every SSH session.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub port: u16,
    pub keyfile: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Print every Nth line of remote output. 0 silences remote output.
    pub print_period: usize,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: "core".to_string(),
            port: 22,
            keyfile: None,
            connect_timeout: Duration::from_secs(10),
            print_period: 1,
        }
    }
}

pub struct SshTransport {
    options: SshOptions,
    colors: HashMap<String, Color>,
}

impl SshTransport {
    /// `hosts` are only used to give every host a stable output color.
    pub fn new(options: SshOptions, hosts: &[String]) -> Self {
        let palette = ColorPalette::new(hosts.len().max(1) as u32, PaletteType::Pastel, false);
        let colors = hosts.iter().cloned().zip(palette.colors).collect();
        Self { options, colors }
    }

    fn colorhost(&self, host: &str) -> ColoredString {
        let color = self.colors.get(host).cloned().unwrap_or(Color {
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        });
        prettify_address(host, color)
    }

    async fn connect(&self, host: &str) -> Result<SshSession> {
        let mut builder = SessionBuilder::default();
        builder
            .user(self.options.user.clone())
            .port(self.options.port)
            .connect_timeout(self.options.connect_timeout)
            .known_hosts_check(KnownHosts::Add);
        if let Some(keyfile) = &self.options.keyfile {
            builder.keyfile(keyfile);
        }
        match builder.connect_mux(host).await {
            Ok(session) => Ok(session),
            Err(e) => {
                tracing::debug!(host, error = %e, "Failed to connect to host");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(&self, host: &str, argv: &[String]) -> Result<CommandOutput> {
        let session = self.connect(host).await?;
        let colorhost = self.colorhost(host);
        let result = run_on_session(&session, &colorhost, argv, self.options.print_period).await;
        close_session(session, &colorhost).await;
        result
    }

    async fn upload(&self, host: &str, contents: &[u8], remote_path: &str) -> Result<()> {
        let session = self.connect(host).await?;
        let colorhost = self.colorhost(host);
        let result = upload_on_session(&session, host, contents, remote_path).await;
        close_session(session, &colorhost).await;
        result
    }

    async fn wait_for_ssh_connection(&self, host: &str, timeout: Duration) -> Result<()> {
        tracing::info!(host, "Waiting for SSH connectivity");
        let what = format!("SSH connection to {}", host);
        let session = retry_fixed(&what, Duration::from_secs(2), timeout, || self.connect(host))
            .await?;
        session.check().await?;
        close_session(session, &self.colorhost(host)).await;
        Ok(())
    }

    async fn tunnel(&self, host: &str) -> Result<Box<dyn Tunnel>> {
        let session = self.connect(host).await?;
        eprintln!("{} Connected to host.", self.colorhost(host));
        Ok(Box::new(SshTunnel {
            host: host.to_string(),
            colorhost: self.colorhost(host),
            session,
            print_period: self.options.print_period,
        }))
    }
}

pub struct SshTunnel {
    host: String,
    colorhost: ColoredString,
    session: SshSession,
    print_period: usize,
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        run_on_session(&self.session, &self.colorhost, argv, self.print_period).await
    }

    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<()> {
        upload_on_session(&self.session, &self.host, contents, remote_path).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        eprintln!("{} Terminating connection.", self.colorhost);
        Ok(self.session.close().await?)
    }
}

async fn close_session(session: SshSession, colorhost: &ColoredString) {
    if let Err(e) = session.close().await {
        eprintln!("{} Error while terminating: {}", colorhost, e);
    }
}

async fn run_on_session(
    session: &SshSession,
    colorhost: &ColoredString,
    argv: &[String],
    print_period: usize,
) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| LaunchError::validation("argv", "empty command"))?;
    if print_period != 0 {
        println!("{} === run '{}' ===", colorhost, argv.join(" "));
    }
    let mut cmd = session.command(program.as_str());
    for arg in args {
        cmd.arg(arg.as_str());
    }
    let mut process = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .await?;
    let stdout = process
        .stdout()
        .take()
        .ok_or_else(|| LaunchError::validation("stdout", "remote stdout not captured"))?;
    let stderr = process
        .stderr()
        .take()
        .ok_or_else(|| LaunchError::validation("stderr", "remote stderr not captured"))?;
    let (stdout, stderr) = try_join(
        stream(stdout, colorhost, print_period),
        stream(stderr, colorhost, print_period),
    )
    .await?;
    let status = process.wait().await?;
    let returncode = status.code().unwrap_or(-1);
    if print_period != 0 {
        println!("{} === done ({}) ===", colorhost, status);
    }
    Ok(CommandOutput {
        returncode,
        stdout,
        stderr,
    })
}

async fn upload_on_session(
    session: &SshSession,
    host: &str,
    contents: &[u8],
    remote_path: &str,
) -> Result<()> {
    let mut cmd = session.command("sh");
    cmd.arg("-c")
        .arg(format!("cat > {}", shell_quote(remote_path)));
    let mut process = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .await?;
    let mut stdin = process
        .stdin()
        .take()
        .ok_or_else(|| LaunchError::validation("stdin", "remote stdin not available"))?;
    stdin.write_all(contents).await?;
    stdin.shutdown().await?;
    drop(stdin);
    let output = process.wait_with_output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(LaunchError::CommandFailed {
            host: host.to_string(),
            argv: vec!["upload".to_string(), remote_path.to_string()],
            returncode: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Captures everything `stream` produces, echoing every `print_period`-th line with
/// the host prefix.
async fn stream<B: AsyncRead + Unpin>(
    stream: B,
    colorhost: &ColoredString,
    print_period: usize,
) -> std::io::Result<Vec<u8>> {
    let mut reader = BufReader::new(stream);
    let mut captured = Vec::new();
    let mut line = Vec::with_capacity(reader.buffer().len());
    let mut lines = 0usize;
    loop {
        line.clear();
        read_until2(&mut reader, b'\r', b'\n', &mut line).await?;
        // An empty buffer means that EOF was reached.
        if line.is_empty() {
            break;
        }
        captured.extend_from_slice(&line);
        lines += 1;
        if print_period != 0 && lines % print_period == 0 {
            let text = String::from_utf8_lossy(&line);
            // Without the lock, lines from different hosts get mixed.
            let stdout = std::io::stdout();
            let mut guard = stdout.lock();
            let _ = writeln!(guard, "{} {}", colorhost, text.trim_end_matches(&['\r', '\n'][..]));
        }
    }
    Ok(captured)
}

/// Reads into `buf` until either delimiter (inclusive) or EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}
