//! Installer configuration materialization.
//!
//! [`materialize`] turns the user's launch configuration and the cluster topology into
//! the complete key/value configuration the installer consumes. Everything that can be
//! wrong with the input is checked before the first remote call.

use std::path::PathBuf;

use serde_yaml::{Mapping, Value};

use crate::bootstrap::{self, BootstrapPaths, GENCONF_DIR};
use crate::config::{DcosConfig, LaunchConfig, Platform};
use crate::error::{LaunchError, Result};
use crate::fault_domain;
use crate::session::{argv, Transport, Tunnel};
use crate::templates::ScriptTemplates;
use crate::topology::{ClusterTopology, Role};

/// How masters agree on membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhibitorBackend {
    Zookeeper,
    Static,
}

impl ExhibitorBackend {
    /// An absent backend means a static master list.
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("static") => Ok(ExhibitorBackend::Static),
            Some("zookeeper") => Ok(ExhibitorBackend::Zookeeper),
            Some(other) => Err(LaunchError::validation(
                "exhibitor_storage_backend",
                format!("'{}' is not supported, use 'zookeeper' or 'static'", other),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExhibitorBackend::Zookeeper => "zookeeper",
            ExhibitorBackend::Static => "static",
        }
    }
}

/// Scripts the installer runs on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    IpDetect,
    IpDetectPublic,
    FaultDomainDetect,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 3] = [
        ScriptKind::IpDetect,
        ScriptKind::IpDetectPublic,
        ScriptKind::FaultDomainDetect,
    ];

    pub fn field(self) -> &'static str {
        match self {
            ScriptKind::IpDetect => "ip_detect",
            ScriptKind::IpDetectPublic => "ip_detect_public",
            ScriptKind::FaultDomainDetect => "fault_domain_detect",
        }
    }

    pub fn contents_key(self) -> String {
        format!("{}_contents", self.field())
    }

    pub fn filename_key(self) -> String {
        format!("{}_filename", self.field())
    }

    /// File name under `genconf/` the installer picks the script up from.
    pub fn genconf_file(self) -> &'static str {
        match self {
            ScriptKind::IpDetect => "ip-detect",
            ScriptKind::IpDetectPublic => "ip-detect-public",
            ScriptKind::FaultDomainDetect => "fault-domain-detect",
        }
    }

    pub fn platform_default(self, platform: Platform) -> &'static str {
        match (self, platform) {
            (ScriptKind::IpDetect, Platform::Aws) => include_str!("../assets/ip-detect/aws.sh"),
            (ScriptKind::IpDetect, Platform::Gce) => include_str!("../assets/ip-detect/gce.sh"),
            (ScriptKind::IpDetectPublic, Platform::Aws) => {
                include_str!("../assets/ip-detect/aws_public.sh")
            }
            (ScriptKind::IpDetectPublic, Platform::Gce) => {
                include_str!("../assets/ip-detect/gce_public.sh")
            }
            (ScriptKind::FaultDomainDetect, Platform::Aws) => {
                include_str!("../assets/fault-domain-detect/aws.sh")
            }
            (ScriptKind::FaultDomainDetect, Platform::Gce) => {
                include_str!("../assets/fault-domain-detect/gce.sh")
            }
        }
    }

    fn user_sources(self, dcos: &DcosConfig) -> (Option<&String>, Option<&PathBuf>) {
        match self {
            ScriptKind::IpDetect => (
                dcos.ip_detect_contents.as_ref(),
                dcos.ip_detect_filename.as_ref(),
            ),
            ScriptKind::IpDetectPublic => (
                dcos.ip_detect_public_contents.as_ref(),
                dcos.ip_detect_public_filename.as_ref(),
            ),
            ScriptKind::FaultDomainDetect => (
                dcos.fault_domain_detect_contents.as_ref(),
                dcos.fault_domain_detect_filename.as_ref(),
            ),
        }
    }
}

/// Where a script's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline(String),
    File(PathBuf),
    PlatformDefault,
}

impl ScriptSource {
    /// | contents | filename | source            |
    /// |----------|----------|-------------------|
    /// | set      | set      | validation error  |
    /// | set      | -        | `Inline`          |
    /// | -        | set      | `File`            |
    /// | -        | -        | `PlatformDefault` |
    pub fn select(
        kind: ScriptKind,
        contents: Option<&String>,
        filename: Option<&PathBuf>,
    ) -> Result<Self> {
        match (contents, filename) {
            (Some(_), Some(_)) => Err(LaunchError::validation(
                kind.filename_key(),
                format!("cannot be set together with {}", kind.contents_key()),
            )),
            (Some(contents), None) => Ok(ScriptSource::Inline(contents.clone())),
            (None, Some(filename)) => Ok(ScriptSource::File(filename.clone())),
            (None, None) => Ok(ScriptSource::PlatformDefault),
        }
    }
}

/// A script after local resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResolvedScript {
    Contents(String),
    /// Generated from the fault domain helper once hostnames are known.
    FaultDomainHelper,
}

pub(crate) fn resolve_script(
    kind: ScriptKind,
    config: &LaunchConfig,
    platform: Platform,
) -> Result<ResolvedScript> {
    let (contents, filename) = kind.user_sources(&config.dcos_config);
    let source = ScriptSource::select(kind, contents, filename)?;
    let helper = kind == ScriptKind::FaultDomainDetect && config.fault_domain_helper.is_some();
    if helper && source != ScriptSource::PlatformDefault {
        return Err(LaunchError::validation(
            "fault_domain_helper",
            format!(
                "cannot be combined with {} or {}",
                kind.contents_key(),
                kind.filename_key()
            ),
        ));
    }
    match source {
        ScriptSource::Inline(contents) => Ok(ResolvedScript::Contents(contents)),
        ScriptSource::File(path) => std::fs::read_to_string(&path)
            .map(ResolvedScript::Contents)
            .map_err(|e| {
                LaunchError::validation(
                    kind.filename_key(),
                    format!("cannot read {}: {}", path.display(), e),
                )
            }),
        ScriptSource::PlatformDefault if helper => Ok(ResolvedScript::FaultDomainHelper),
        ScriptSource::PlatformDefault => Ok(ResolvedScript::Contents(
            kind.platform_default(platform).to_string(),
        )),
    }
}

/// The installer configuration, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnpremConfig(Mapping);

impl OnpremConfig {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(Value::String(key.into()), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&Value::String(key.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&Value::String(key.to_string()))
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(&Value::String(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|(k, _)| k.as_str())
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.0)?)
    }

    /// Overlays every key of `overrides`.
    pub fn merge(&mut self, overrides: &Mapping) {
        for (key, value) in overrides {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Config with the keys that are shipped as separate `genconf/` files removed.
    fn without_file_keys(&self) -> Self {
        let mut config = self.clone();
        config.remove("ssh_key");
        for kind in ScriptKind::ALL {
            config.remove(&kind.contents_key());
        }
        config
    }
}

fn string_list(items: Vec<String>) -> Value {
    Value::Sequence(items.into_iter().map(Value::String).collect())
}

/// Builds the complete installer configuration.
///
/// The only remote side effects are starting the bootstrap ZooKeeper (zookeeper
/// backend without explicit hosts) and reading hostnames for the fault domain helper,
/// and both happen only after all validation passed.
pub async fn materialize(
    config: &LaunchConfig,
    topology: &ClusterTopology,
    transport: &dyn Transport,
    templates: &ScriptTemplates,
) -> Result<OnpremConfig> {
    let platform = config.platform()?;
    let dcos = &config.dcos_config;
    let backend = ExhibitorBackend::parse(dcos.exhibitor_storage_backend.as_deref())?;
    if let Some(helper) = &config.fault_domain_helper {
        fault_domain::validate_helper(helper)?;
    }
    let scripts = ScriptKind::ALL
        .iter()
        .map(|kind| Ok((*kind, resolve_script(*kind, config, platform)?)))
        .collect::<Result<Vec<_>>>()?;
    let inject_key = config.key_helper || dcos.ssh_key.is_none();
    let ssh_key = if inject_key {
        config.ssh_private_key.clone().ok_or_else(|| {
            LaunchError::validation(
                "ssh_private_key",
                "required to give the installer SSH access to the cluster",
            )
        })?
    } else {
        dcos.ssh_key.clone().unwrap_or_default()
    };

    // Validation done; remote calls may follow.
    let mut onprem = OnpremConfig::default();
    for (key, value) in &dcos.extra {
        onprem.insert(key.clone(), value.clone());
    }
    onprem.insert("exhibitor_storage_backend", backend.as_str());
    match backend {
        ExhibitorBackend::Zookeeper => {
            let zk_hosts = match &dcos.exhibitor_zk_hosts {
                Some(hosts) => hosts.clone(),
                None => bootstrap::start_bootstrap_zk(transport, &topology.bootstrap).await?,
            };
            onprem.insert("exhibitor_zk_hosts", zk_hosts);
        }
        ExhibitorBackend::Static => {
            onprem.insert("master_discovery", "static");
        }
    }
    onprem.insert("master_list", string_list(topology.private_ips(Role::Master)));
    onprem.insert("agent_list", string_list(topology.private_ips(Role::PrivateAgent)));
    onprem.insert(
        "public_agent_list",
        string_list(topology.private_ips(Role::PublicAgent)),
    );
    onprem.insert(
        "ssh_user",
        dcos.ssh_user.clone().unwrap_or_else(|| config.ssh_user.clone()),
    );
    onprem.insert("ssh_key", ssh_key);

    for (kind, script) in scripts {
        let contents = match script {
            ResolvedScript::Contents(contents) => contents,
            ResolvedScript::FaultDomainHelper => {
                // Only resolved this way when the helper is present.
                let helper = config.fault_domain_helper.as_ref().ok_or_else(|| {
                    LaunchError::validation("fault_domain_helper", "missing")
                })?;
                fault_domain::synthesize_script(transport, topology, helper, templates).await?
            }
        };
        onprem.insert(kind.contents_key(), contents);
    }
    tracing::debug!(keys = ?onprem.keys().collect::<Vec<_>>(), "Generated cluster configuration");
    Ok(onprem)
}

/// Writes `config.yaml`, the SSH key and the node scripts into `genconf/` on the
/// bootstrap host.
pub async fn upload_genconf(
    tunnel: &dyn Tunnel,
    paths: &BootstrapPaths,
    onprem: &OnpremConfig,
) -> Result<()> {
    tunnel
        .command(&argv(&["mkdir", "-p", &paths.genconf()]))
        .await?;
    let config_yaml = onprem.without_file_keys().to_yaml()?;
    tunnel
        .upload(config_yaml.as_bytes(), &paths.genconf_file("config.yaml"))
        .await?;
    if let Some(key) = onprem.get_str("ssh_key") {
        let key_path = paths.genconf_file("ssh_key");
        tunnel.upload(key.as_bytes(), &key_path).await?;
        tunnel.command(&argv(&["chmod", "600", &key_path])).await?;
    }
    for kind in ScriptKind::ALL {
        if let Some(contents) = onprem.get_str(&kind.contents_key()) {
            tunnel
                .upload(contents.as_bytes(), &paths.genconf_file(kind.genconf_file()))
                .await?;
        }
    }
    tracing::info!(dir = GENCONF_DIR, "Uploaded installer configuration");
    Ok(())
}
