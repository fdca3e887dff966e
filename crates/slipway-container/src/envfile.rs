//! Per-slot environment files handed to `--env-file`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use slipway_core::{Environment, SlotName};

use crate::error::{RuntimeError, RuntimeResult};

/// Values injected into every slot in addition to the project's variables.
#[derive(Debug, Clone)]
pub struct SlotVariables<'a> {
    pub port: u16,
    pub slot: SlotName,
    pub environment: Environment,
    pub version: &'a str,
}

pub struct EnvFileSync {
    root: PathBuf,
}

impl EnvFileSync {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// `{root}/{project}/{environment}/{slot}.env`
    pub fn path_for(&self, project: &str, environment: Environment, slot: SlotName) -> PathBuf {
        self.root
            .join(project)
            .join(environment.as_str())
            .join(format!("{slot}.env"))
    }

    /// Write the slot's env file atomically and return its path.
    ///
    /// Slot variables override project variables of the same name.
    pub fn sync(
        &self,
        project: &str,
        vars: &BTreeMap<String, String>,
        slot_vars: &SlotVariables<'_>,
    ) -> RuntimeResult<PathBuf> {
        let path = self.path_for(project, slot_vars.environment, slot_vars.slot);
        let content = render(vars, slot_vars)?;

        let dir = path
            .parent()
            .ok_or_else(|| RuntimeError::EnvFile(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| RuntimeError::EnvFile(e.to_string()))?;
        let tmp = path.with_extension("env.tmp");
        std::fs::write(&tmp, content).map_err(|e| RuntimeError::EnvFile(e.to_string()))?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &path).map_err(|e| RuntimeError::EnvFile(e.to_string()))?;
        debug!(path = %path.display(), "env file synchronized");
        Ok(path)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> RuntimeResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| RuntimeError::EnvFile(e.to_string()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> RuntimeResult<()> {
    Ok(())
}

/// Render `KEY=VALUE` lines in key order.
pub fn render(vars: &BTreeMap<String, String>, slot_vars: &SlotVariables<'_>) -> RuntimeResult<String> {
    let mut merged = vars.clone();
    merged.insert("PORT".to_string(), slot_vars.port.to_string());
    merged.insert("SLIPWAY_SLOT".to_string(), slot_vars.slot.to_string());
    merged.insert(
        "SLIPWAY_ENVIRONMENT".to_string(),
        slot_vars.environment.to_string(),
    );
    merged.insert("SLIPWAY_VERSION".to_string(), slot_vars.version.to_string());

    let key_re =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| RuntimeError::EnvFile(e.to_string()))?;
    let mut out = String::new();
    for (key, value) in &merged {
        if !key_re.is_match(key) {
            return Err(RuntimeError::EnvFile(format!("invalid variable name {key:?}")));
        }
        if value.contains('\n') || value.contains('\r') {
            return Err(RuntimeError::EnvFile(format!("value of {key} spans lines")));
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_vars() -> SlotVariables<'static> {
        SlotVariables {
            port: 3000,
            slot: SlotName::Green,
            environment: Environment::Staging,
            version: "v7",
        }
    }

    #[test]
    fn renders_sorted_with_slot_overrides() {
        let vars = BTreeMap::from([
            ("DATABASE_URL".to_string(), "postgres://db/shop".to_string()),
            ("PORT".to_string(), "9999".to_string()),
        ]);
        let rendered = render(&vars, &slot_vars()).unwrap();
        assert_eq!(
            rendered,
            "DATABASE_URL=postgres://db/shop\nPORT=3000\nSLIPWAY_ENVIRONMENT=staging\nSLIPWAY_SLOT=green\nSLIPWAY_VERSION=v7\n"
        );
    }

    #[test]
    fn rejects_bad_names_and_multiline_values() {
        let bad_key = BTreeMap::from([("1BAD".to_string(), "x".to_string())]);
        assert!(render(&bad_key, &slot_vars()).is_err());
        let multiline = BTreeMap::from([("KEY".to_string(), "a\nb".to_string())]);
        assert!(render(&multiline, &slot_vars()).is_err());
    }

    #[test]
    fn sync_writes_to_slot_path() {
        let dir = tempfile::tempdir().unwrap();
        let sync = EnvFileSync::new(dir.path());
        let path = sync.sync("shop", &BTreeMap::new(), &slot_vars()).unwrap();

        assert_eq!(path, dir.path().join("shop/staging/green.env"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("SLIPWAY_SLOT=green"));
        assert!(!path.with_extension("env.tmp").exists());
    }
}
