//! Shell scripts pushed to cluster hosts, rendered with Handlebars.

use handlebars::Handlebars;
use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::topology::Role;

const PREFLIGHT: &str = "preflight";
const POSTFLIGHT: &str = "postflight";
const FAULT_DOMAIN: &str = "fault-domain-detect";

const PREFLIGHT_TEMPLATE: &str = r#"
mkdir -p {{script_dir}}
{{download_cmd}}
sudo bash {{script_path}} --preflight-only {{role}}
"#;

const POSTFLIGHT_TEMPLATE: &str = r#"
if [ -f /opt/mesosphere/etc/dcos-diagnostics-runner-config.json ]; then
    for check_type in node-poststart cluster; do
        T={{timeout_secs}}
        until OUT=$(sudo /opt/mesosphere/bin/dcos-shell /opt/mesosphere/bin/dcos-diagnostics check $check_type) || [[ T -eq 0 ]]; do
            sleep 1
            let T=T-1
        done
        RETCODE=$?
        echo $OUT
        if [[ RETCODE -ne 0 ]]; then
            exit $RETCODE
        fi
    done
else
    T={{timeout_secs}}
    until OUT=$(sudo /opt/mesosphere/bin/./3dt --diag) || [[ T -eq 0 ]]; do
        sleep 1
        let T=T-1
    done
    RETCODE=$?
    for value in $OUT; do
        echo $value
    done
fi
exit $RETCODE
"#;

// Hostnames compare case-insensitively.
const FAULT_DOMAIN_TEMPLATE: &str = r#"#!/bin/sh
hostname=$(hostname | tr '[:upper:]' '[:lower:]')
case "$hostname" in
{{#each assignments}}
    "{{to_lower_case hostname}}")
        REGION="{{region}}"
        ZONE="{{zone}}"
        ;;
{{/each}}
    *)
        echo "No fault domain assigned to $hostname" >&2
        exit 1
        ;;
esac
printf '{"fault_domain":{"region":{"name":"%s"},"zone":{"name":"%s"}}}\n' "$REGION" "$ZONE"
"#;

/// Seconds the postflight script keeps retrying the diagnostics checks.
pub const POSTFLIGHT_TIMEOUT_SECS: u64 = 900;

/// A host's place in the fault-domain layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultDomainAssignment {
    pub hostname: String,
    pub region: String,
    pub zone: String,
}

/// Robust curl invocation that downloads `url` to `out_path`.
pub fn curl_argv(url: &str, out_path: &str) -> Vec<String> {
    [
        "curl",
        "-fLsSv",
        "--retry",
        "20",
        "-Y",
        "100000",
        "-y",
        "60",
        "--create-dirs",
        "-o",
        out_path,
        url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct ScriptTemplates {
    registry: Handlebars<'static>,
}

impl ScriptTemplates {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        // Output is shell, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);
        handlebars_misc_helpers::register(&mut registry);
        registry.register_template_string(PREFLIGHT, PREFLIGHT_TEMPLATE)?;
        registry.register_template_string(POSTFLIGHT, POSTFLIGHT_TEMPLATE)?;
        registry.register_template_string(FAULT_DOMAIN, FAULT_DOMAIN_TEMPLATE)?;
        Ok(Self { registry })
    }

    /// Downloads the install script from the bootstrap host and runs its preflight checks.
    pub fn preflight(&self, role: Role, script_url: &str, script_path: &str) -> Result<String> {
        let script_dir = std::path::Path::new(script_path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/tmp".to_string());
        let data = json!({
            "script_dir": script_dir,
            "download_cmd": curl_argv(script_url, script_path).join(" "),
            "script_path": script_path,
            "role": role.install_arg(),
        });
        Ok(self.registry.render(PREFLIGHT, &data)?)
    }

    /// Runs the node and cluster diagnostics until they pass or time out.
    pub fn postflight(&self) -> Result<String> {
        let data = json!({ "timeout_secs": POSTFLIGHT_TIMEOUT_SECS });
        Ok(self.registry.render(POSTFLIGHT, &data)?)
    }

    /// Maps each assigned hostname to its region and zone.
    pub fn fault_domain(&self, assignments: &[FaultDomainAssignment]) -> Result<String> {
        let data = json!({ "assignments": assignments });
        Ok(self.registry.render(FAULT_DOMAIN, &data)?)
    }
}
