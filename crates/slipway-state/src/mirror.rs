//! File mirror of the slot registry, consulted when the durable store is down.
//!
//! The mirror keeps one JSON document (`registry.json`) holding registry
//! entries, cached projects and cached credentials, plus append-only JSONL
//! journals for deployments and audit entries recorded while degraded.
//! Document writes go to a temp file that is renamed into place.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

const DOCUMENT: &str = "registry.json";
const DEPLOYMENT_JOURNAL: &str = "deployments.jsonl";
const AUDIT_JOURNAL: &str = "audit.jsonl";

/// A registry entry as mirrored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirroredEntry {
    pub entry: SlotRegistryEntry,
    /// Written while the durable store was unreachable.
    #[serde(default)]
    pub unsynced: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorDocument {
    #[serde(default)]
    pub entries: BTreeMap<String, MirroredEntry>,
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
    /// Credentials keyed by token hash.
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialRecord>,
}

pub struct FileMirror {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileMirror {
    pub fn open(dir: &Path) -> StateResult<Self> {
        fs::create_dir_all(dir).map_err(|e| StateError::Io(e.to_string()))?;
        debug!(?dir, "file mirror opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the whole mirror document; a missing file is an empty mirror.
    pub fn load(&self) -> StateResult<MirrorDocument> {
        let path = self.dir.join(DOCUMENT);
        match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StateError::Deserialize(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MirrorDocument::default()),
            Err(e) => Err(StateError::Io(e.to_string())),
        }
    }

    fn store(&self, document: &MirrorDocument) -> StateResult<()> {
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        let tmp = self.dir.join(format!("{DOCUMENT}.tmp"));
        fs::write(&tmp, bytes).map_err(|e| StateError::Io(e.to_string()))?;
        fs::rename(&tmp, self.dir.join(DOCUMENT)).map_err(|e| StateError::Io(e.to_string()))
    }

    fn update<R>(&self, f: impl FnOnce(&mut MirrorDocument) -> StateResult<R>) -> StateResult<R> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StateError::Io("mirror lock poisoned".to_string()))?;
        let mut document = self.load()?;
        let result = f(&mut document)?;
        self.store(&document)?;
        Ok(result)
    }

    // ── Registry ───────────────────────────────────────────────────

    pub fn get_entry(&self, key: &str) -> StateResult<Option<MirroredEntry>> {
        Ok(self.load()?.entries.remove(key))
    }

    /// Refresh the mirror after a successful durable write.
    pub fn put_synced(&self, entry: &SlotRegistryEntry) -> StateResult<()> {
        self.update(|doc| {
            doc.entries.insert(
                entry.table_key(),
                MirroredEntry {
                    entry: entry.clone(),
                    unsynced: false,
                },
            );
            Ok(())
        })
    }

    /// Compare-and-swap against the mirror while degraded. The written
    /// entry is flagged unsynced. Returns the new version.
    pub fn swap_unsynced(&self, entry: &SlotRegistryEntry, expected: u64) -> StateResult<u64> {
        let key = entry.table_key();
        self.update(|doc| {
            let found = doc.entries.get(&key).map(|m| m.entry.version).unwrap_or(0);
            if found != expected {
                return Err(StateError::VersionConflict {
                    key: key.clone(),
                    expected,
                    found,
                });
            }
            if found == 0 {
                for other in doc.entries.values() {
                    if let Some(port) = entry
                        .ports()
                        .into_iter()
                        .find(|p| other.entry.ports().contains(p))
                    {
                        return Err(StateError::PortConflict {
                            port,
                            holder: other.entry.table_key(),
                        });
                    }
                }
            }
            let mut stored = entry.clone();
            stored.version = expected + 1;
            let version = stored.version;
            doc.entries.insert(
                key.clone(),
                MirroredEntry {
                    entry: stored,
                    unsynced: true,
                },
            );
            Ok(version)
        })
    }

    pub fn unsynced_entries(&self) -> StateResult<Vec<SlotRegistryEntry>> {
        Ok(self
            .load()?
            .entries
            .into_values()
            .filter(|m| m.unsynced)
            .map(|m| m.entry)
            .collect())
    }

    pub fn mark_synced(&self, key: &str) -> StateResult<()> {
        self.update(|doc| {
            if let Some(mirrored) = doc.entries.get_mut(key) {
                mirrored.unsynced = false;
            }
            Ok(())
        })
    }

    /// All mirrored entries, synced or not.
    pub fn entries(&self) -> StateResult<Vec<SlotRegistryEntry>> {
        Ok(self.load()?.entries.into_values().map(|m| m.entry).collect())
    }

    // ── Projects and credentials ───────────────────────────────────

    pub fn cache_project(&self, project: &Project) -> StateResult<()> {
        self.update(|doc| {
            doc.projects.insert(project.name.clone(), project.clone());
            Ok(())
        })
    }

    pub fn get_project(&self, name: &str) -> StateResult<Option<Project>> {
        Ok(self.load()?.projects.remove(name))
    }

    pub fn list_projects(&self) -> StateResult<Vec<Project>> {
        Ok(self.load()?.projects.into_values().collect())
    }

    pub fn cache_credential(&self, credential: &CredentialRecord) -> StateResult<()> {
        self.update(|doc| {
            doc.credentials
                .insert(credential.token_hash.clone(), credential.clone());
            Ok(())
        })
    }

    pub fn get_credential(&self, token_hash: &str) -> StateResult<Option<CredentialRecord>> {
        Ok(self.load()?.credentials.remove(token_hash))
    }

    // ── Journals ───────────────────────────────────────────────────

    pub fn append_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.append_line(DEPLOYMENT_JOURNAL, deployment)
    }

    pub fn append_audit(&self, entry: &AuditEntry) -> StateResult<()> {
        self.append_line(AUDIT_JOURNAL, entry)
    }

    /// Deployments journaled while degraded, latest line per id, in the
    /// order they began.
    pub fn journaled_deployments(&self) -> StateResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for deployment in read_journal::<Deployment>(&self.dir.join(DEPLOYMENT_JOURNAL))? {
            match positions.get(&deployment.id) {
                Some(&at) => deployments[at] = deployment,
                None => {
                    positions.insert(deployment.id.clone(), deployments.len());
                    deployments.push(deployment);
                }
            }
        }
        Ok(deployments)
    }

    /// Hand every journaled deployment to `apply`, then remove the journal.
    /// On the first error the journal is left untouched for the next try.
    pub fn drain_deployments(
        &self,
        apply: impl FnMut(&Deployment) -> StateResult<()>,
    ) -> StateResult<usize> {
        self.drain_journal(DEPLOYMENT_JOURNAL, apply)
    }

    /// Same as [`FileMirror::drain_deployments`], for audit entries.
    pub fn drain_audit(&self, apply: impl FnMut(&AuditEntry) -> StateResult<()>) -> StateResult<usize> {
        self.drain_journal(AUDIT_JOURNAL, apply)
    }

    fn drain_journal<T: DeserializeOwned>(
        &self,
        file: &str,
        mut apply: impl FnMut(&T) -> StateResult<()>,
    ) -> StateResult<usize> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StateError::Io("mirror lock poisoned".to_string()))?;
        let path = self.dir.join(file);
        let records = read_journal::<T>(&path)?;
        for record in &records {
            apply(record)?;
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::Io(e.to_string())),
        }
        debug!(file, replayed = records.len(), "journal drained");
        Ok(records.len())
    }

    fn append_line<T: Serialize>(&self, file: &str, value: &T) -> StateResult<()> {
        let mut line =
            serde_json::to_string(value).map_err(|e| StateError::Serialize(e.to_string()))?;
        line.push('\n');
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StateError::Io("mirror lock poisoned".to_string()))?;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .map_err(|e| StateError::Io(e.to_string()))?;
        handle
            .write_all(line.as_bytes())
            .map_err(|e| StateError::Io(e.to_string()))
    }
}

fn read_journal<T: DeserializeOwned>(path: &Path) -> StateResult<Vec<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StateError::Io(e.to_string())),
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| StateError::Deserialize(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::{Environment, SlotName};

    fn entry(project: &str, base_port: u16) -> SlotRegistryEntry {
        SlotRegistryEntry::new(project, Environment::Staging, base_port, 100)
    }

    #[test]
    fn missing_document_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::open(dir.path()).unwrap();
        assert!(mirror.entries().unwrap().is_empty());
        assert!(mirror.get_entry("shop/staging").unwrap().is_none());
    }

    #[test]
    fn synced_then_unsynced_write() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::open(dir.path()).unwrap();

        let mut e = entry("shop", 3000);
        e.version = 4;
        mirror.put_synced(&e).unwrap();
        assert!(mirror.unsynced_entries().unwrap().is_empty());

        let version = mirror.swap_unsynced(&e, 4).unwrap();
        assert_eq!(version, 5);
        let mirrored = mirror.get_entry("shop/staging").unwrap().unwrap();
        assert!(mirrored.unsynced);
        assert_eq!(mirrored.entry.version, 5);

        mirror.mark_synced("shop/staging").unwrap();
        assert!(mirror.unsynced_entries().unwrap().is_empty());
    }

    #[test]
    fn degraded_swap_still_checks_version_and_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::open(dir.path()).unwrap();
        mirror.swap_unsynced(&entry("shop", 3000), 0).unwrap();

        assert!(matches!(
            mirror.swap_unsynced(&entry("shop", 3000), 0),
            Err(StateError::VersionConflict { .. })
        ));
        assert!(matches!(
            mirror.swap_unsynced(&entry("blog", 3000), 0),
            Err(StateError::PortConflict { port: 3000, .. })
        ));
    }

    #[test]
    fn deployment_journal_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::open(dir.path()).unwrap();
        for version in ["v1", "v2"] {
            let d = Deployment::begin(
                "shop",
                Environment::Staging,
                SlotName::Green,
                "shop:latest",
                version,
                "cred",
                1,
            );
            mirror.append_deployment(&d).unwrap();
        }
        let journal = mirror.journaled_deployments().unwrap();
        let versions: Vec<&str> = journal.iter().map(|d| d.version.as_str()).collect();
        assert_eq!(versions, vec!["v1", "v2"]);
    }

    #[test]
    fn journal_keeps_latest_line_per_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::open(dir.path()).unwrap();
        let mut first = Deployment::begin(
            "shop",
            Environment::Staging,
            SlotName::Blue,
            "shop:v1",
            "v1",
            "cred",
            1,
        );
        let second = Deployment::begin(
            "shop",
            Environment::Staging,
            SlotName::Green,
            "shop:v2",
            "v2",
            "cred",
            2,
        );
        mirror.append_deployment(&first).unwrap();
        mirror.append_deployment(&second).unwrap();
        first.succeed(3);
        mirror.append_deployment(&first).unwrap();

        let journal = mirror.journaled_deployments().unwrap();
        assert_eq!(journal, vec![first, second]);
    }

    #[test]
    fn drained_journal_is_removed_unless_replay_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::open(dir.path()).unwrap();
        let d = Deployment::begin(
            "shop",
            Environment::Staging,
            SlotName::Blue,
            "shop:v1",
            "v1",
            "cred",
            1,
        );
        mirror.append_deployment(&d).unwrap();

        let err = mirror
            .drain_deployments(|_| Err(StateError::Unavailable("down".to_string())))
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(mirror.journaled_deployments().unwrap().len(), 1);

        let mut seen = Vec::new();
        let replayed = mirror
            .drain_deployments(|d| {
                seen.push(d.id.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(seen, vec![d.id]);
        assert!(!dir.path().join(DEPLOYMENT_JOURNAL).exists());
        assert_eq!(mirror.drain_deployments(|_| Ok(())).unwrap(), 0);
    }

    #[test]
    fn document_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mirror = FileMirror::open(dir.path()).unwrap();
            mirror.cache_project(&Project::new("shop", "team1", 1)).unwrap();
        }
        let mirror = FileMirror::open(dir.path()).unwrap();
        assert_eq!(mirror.get_project("shop").unwrap().unwrap().team_id, "team1");
        assert!(!dir.path().join("registry.json.tmp").exists());
    }
}
