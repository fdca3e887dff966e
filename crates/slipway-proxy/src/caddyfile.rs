//! Caddy site-block synthesis for one (project, environment).

use std::fmt::Write;

use regex::Regex;

use slipway_core::{Environment, SlotName, validate_project_name, validate_version_label};

use crate::error::{ProxyError, ProxyResult};

/// File name of a pair's site block inside the sites directory.
pub fn site_file_name(project: &str, environment: Environment) -> String {
    format!("{project}-{environment}.caddy")
}

/// Host used when no custom domain is bound.
pub fn default_host(project: &str, environment: Environment, base_domain: &str) -> String {
    format!("{}.{base_domain}", default_label(project, environment))
}

fn default_label(project: &str, environment: Environment) -> String {
    match environment {
        Environment::Production => project.to_string(),
        _ => format!("{project}-{environment}"),
    }
}

/// The first (project, environment) pair whose default host `project`
/// would also generate, e.g. `shop-staging` in production against `shop`
/// in staging.
pub fn default_host_clash<'a>(
    project: &str,
    existing: impl IntoIterator<Item = &'a str>,
) -> Option<(String, Environment, Environment)> {
    for other in existing {
        if other == project {
            continue;
        }
        for mine in Environment::ALL {
            for theirs in Environment::ALL {
                if default_label(project, mine) == default_label(other, theirs) {
                    return Some((other.to_string(), mine, theirs));
                }
            }
        }
    }
    None
}

/// Upstream health settings written into every block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamPolicy {
    pub health_uri: String,
    pub health_interval: String,
    pub lb_try_duration: String,
    pub fail_duration: String,
}

impl Default for UpstreamPolicy {
    fn default() -> Self {
        Self {
            health_uri: "/health".to_string(),
            health_interval: "10s".to_string(),
            lb_try_duration: "5s".to_string(),
            fail_duration: "30s".to_string(),
        }
    }
}

/// One routed site: traffic goes to `primary_port`, and to `drain_port`
/// only while the primary upstream is failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteBlock {
    pub project: String,
    pub environment: Environment,
    pub hosts: Vec<String>,
    pub slot: SlotName,
    pub version: Option<String>,
    pub primary_port: u16,
    pub drain_port: Option<u16>,
    pub policy: UpstreamPolicy,
}

impl SiteBlock {
    pub fn file_name(&self) -> String {
        site_file_name(&self.project, self.environment)
    }

    pub fn render(&self) -> ProxyResult<String> {
        let host_re = Regex::new(r"^[A-Za-z0-9*]([A-Za-z0-9.*-]*[A-Za-z0-9])?(:[0-9]{1,5})?$")
            .map_err(|e| ProxyError::InvalidHost(e.to_string()))?;
        if self.hosts.is_empty() {
            return Err(ProxyError::InvalidHost(String::new()));
        }
        if let Some(bad) = self.hosts.iter().find(|h| !host_re.is_match(h)) {
            return Err(ProxyError::InvalidHost(bad.clone()));
        }
        // Both are written bare into the header block.
        validate_project_name(&self.project)?;
        if let Some(version) = &self.version {
            validate_version_label(version)?;
        }

        let mut upstreams = format!("localhost:{}", self.primary_port);
        if let Some(drain) = self.drain_port.filter(|p| *p != self.primary_port) {
            let _ = write!(upstreams, " localhost:{drain}");
        }
        let version = self.version.as_deref().unwrap_or("unknown");

        let mut out = String::new();
        let _ = writeln!(
            out,
            "# slipway: {} ({}) -> {} slot",
            self.project, self.environment, self.slot
        );
        let _ = writeln!(out, "{} {{", self.hosts.join(", "));
        let _ = writeln!(out, "\treverse_proxy {upstreams} {{");
        let _ = writeln!(out, "\t\tlb_policy first");
        let _ = writeln!(out, "\t\tlb_try_duration {}", self.policy.lb_try_duration);
        let _ = writeln!(out, "\t\thealth_uri {}", self.policy.health_uri);
        let _ = writeln!(out, "\t\thealth_interval {}", self.policy.health_interval);
        let _ = writeln!(out, "\t\tfail_duration {}", self.policy.fail_duration);
        let _ = writeln!(out, "\t}}");
        let _ = writeln!(out, "\theader {{");
        let _ = writeln!(out, "\t\tX-Slipway-Project {}", self.project);
        let _ = writeln!(out, "\t\tX-Slipway-Environment {}", self.environment);
        let _ = writeln!(out, "\t\tX-Slipway-Slot {}", self.slot);
        let _ = writeln!(out, "\t\tX-Slipway-Version {version}");
        let _ = writeln!(out, "\t}}");
        let _ = writeln!(out, "}}");
        Ok(out)
    }
}
