//! One-shot administrative commands run against the durable store.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use slipway_auth::{IssueRequest, issue};
use slipway_core::{
    Environment, Role, SlipwayConfig, epoch_secs, parse_duration, validate_project_name,
};
use slipway_proxy::default_host_clash;
use slipway_state::{FileMirror, Persistence, Project, StateStore};

pub fn open_persistence(config: &SlipwayConfig) -> anyhow::Result<Persistence> {
    if let Some(parent) = config.storage.database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let store = StateStore::open(&config.storage.database)
        .with_context(|| format!("open {}", config.storage.database.display()))?;
    let mirror = FileMirror::open(&config.storage.mirror_dir)
        .with_context(|| format!("open mirror {}", config.storage.mirror_dir.display()))?;
    Ok(Persistence::new(Arc::new(store), Arc::new(mirror)))
}

/// `KEY=VALUE` for `--env`.
pub fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid variable name {key:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn register_project(
    config: &SlipwayConfig,
    name: &str,
    team: &str,
    environment: Environment,
    domains: Vec<String>,
    env: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let persistence = open_persistence(config)?;
    let mut project = match persistence.primary().get_project(name)? {
        Some(existing) if existing.team_id != team => {
            bail!("project {name:?} already belongs to team {:?}", existing.team_id)
        }
        Some(existing) => existing,
        None => {
            validate_project_name(name)?;
            let known = persistence.primary().list_projects()?;
            if let Some((other, mine, theirs)) =
                default_host_clash(name, known.iter().map(|p| p.name.as_str()))
            {
                bail!(
                    "project {name:?} in {mine} would share its default host with project {other:?} in {theirs}"
                );
            }
            Project::new(name, team, epoch_secs())
        }
    };

    let settings = project.environments.entry(environment).or_default();
    for domain in domains {
        if !settings.domains.contains(&domain) {
            settings.domains.push(domain);
        }
    }
    settings.env.extend(env);

    persistence.put_project(&project)?;
    info!(project = name, team, %environment, "project registered");
    println!("registered {name} ({environment}) for team {team}");
    Ok(())
}

pub fn issue_credential(
    config: &SlipwayConfig,
    team: &str,
    role: Role,
    scopes: Vec<String>,
    expires_in: Option<&str>,
) -> anyhow::Result<()> {
    let now = epoch_secs();
    let expires_at = match expires_in {
        Some(raw) => {
            let lifetime =
                parse_duration(raw).with_context(|| format!("invalid --expires-in {raw:?}"))?;
            Some(now + lifetime.as_secs())
        }
        None => None,
    };

    let (secret, record) = issue(
        &config.auth.prefix,
        IssueRequest {
            team_id: team.to_string(),
            role,
            scopes,
            expires_at,
        },
        now,
    )?;

    let persistence = open_persistence(config)?;
    persistence.primary().put_credential(&record)?;
    info!(credential = %record.id, team, %role, "credential issued");

    println!("credential id: {}", record.id);
    println!("secret (shown once): {secret}");
    Ok(())
}
