//! Cluster hosts.
//!
//! Hosts come from the provisioning layer as a YAML list. Each entry is either a bare
//! address (used as both the SSH target and the private address) or a mapping with
//! `public_ip` and an optional `private_ip`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use colored::*;
use colourado::Color;
use serde::{Deserialize, Serialize};
use void::Void;

use crate::error::{LaunchError, Result};
use crate::serde::string_or_mapping;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Host {
    /// Address inside the cluster network. Required before install.
    pub private_ip: Option<String>,
    /// SSH target and identity of the host.
    pub public_ip: String,
}

impl Host {
    pub fn new(private_ip: impl Into<String>, public_ip: impl Into<String>) -> Self {
        Self {
            private_ip: Some(private_ip.into()),
            public_ip: public_ip.into(),
        }
    }

    /// Private address, or an empty string when the provider did not report one.
    pub fn private_addr(&self) -> &str {
        self.private_ip.as_deref().unwrap_or_default()
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        prettify_address(&self.public_ip, color)
    }
}

pub fn prettify_address(address: &str, color: Color) -> ColoredString {
    let r = (color.red * 255.0) as u8;
    let g = (color.green * 255.0) as u8;
    let b = (color.blue * 255.0) as u8;
    format!("[{}]", address).truecolor(r, g, b)
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.private_ip {
            Some(private_ip) => write!(f, "{} ({})", self.public_ip, private_ip),
            None => write!(f, "{}", self.public_ip),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HostSpec(#[serde(deserialize_with = "string_or_mapping")] HostSpecInner);

#[derive(Debug, Deserialize)]
struct HostSpecInner {
    public_ip: String,
    #[serde(default)]
    private_ip: Option<String>,
}

impl FromStr for HostSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            public_ip: s.to_string(),
            private_ip: Some(s.to_string()),
        })
    }
}

/// Parses a host list from YAML text.
pub fn parse_hosts(text: &str) -> Result<Vec<Host>> {
    let specs: Vec<HostSpec> = serde_yaml::from_str(text)?;
    specs
        .into_iter()
        .enumerate()
        .map(|(i, HostSpec(spec))| {
            if spec.public_ip.trim().is_empty() {
                return Err(LaunchError::validation(
                    format!("hosts[{}].public_ip", i),
                    "must not be empty",
                ));
            }
            Ok(Host {
                public_ip: spec.public_ip,
                private_ip: spec.private_ip,
            })
        })
        .collect()
}

/// Reads and parses a host file.
pub fn load_hosts(hosts_file: impl AsRef<Path>) -> Result<Vec<Host>> {
    let hosts_file = hosts_file.as_ref();
    let text = std::fs::read_to_string(hosts_file).map_err(|e| {
        LaunchError::validation(
            "hosts_file",
            format!("cannot read {}: {}", hosts_file.display(), e),
        )
    })?;
    let hosts = parse_hosts(&text)?;
    tracing::debug!(count = hosts.len(), file = %hosts_file.display(), "Hosts detected");
    Ok(hosts)
}
