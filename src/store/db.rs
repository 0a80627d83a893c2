//! The database: journal-backed artifact, file, and applied-rule store.
//!
//! Opening a database replays `db.journal` from the state directory into the
//! history views, then reopens the journal in append mode. The current-
//! session views start empty on every open; the coordinator populates them
//! as it persists new work or promotes still-valid history records.

use super::journal::{FileProp, InputEntry, JournalOp, JournalReader, JournalWriter, StringProp};
use super::{
    AppliedRule, ApplicationId, Artifact, ArtifactId, Bindings, FileEntry, StoreError, StoreResult,
};
use crate::props::{FileId, PropertySet, PropertyValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

const JOURNAL_FILE: &str = "db.journal";

pub struct Database {
    state_dir: PathBuf,
    journal: JournalWriter,

    next_artifact_id: ArtifactId,
    next_application_id: ApplicationId,
    next_file_id: FileId,

    artifact_history: BTreeMap<ArtifactId, Artifact>,
    artifact_ids_by_hash: HashMap<String, ArtifactId>,
    current_artifacts: BTreeSet<ArtifactId>,

    applied_history: BTreeMap<ApplicationId, AppliedRule>,
    current_applied: BTreeSet<ApplicationId>,

    files: BTreeMap<FileId, FileEntry>,
    file_ids_by_hash: HashMap<String, FileId>,
}

impl Database {
    /// Open the database under `state_dir`, replaying any existing journal.
    pub fn open(state_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let journal_path = state_dir.join(JOURNAL_FILE);

        let mut db = Database {
            state_dir: state_dir.to_path_buf(),
            journal: JournalWriter::open(&journal_path)?,
            next_artifact_id: 0,
            next_application_id: 0,
            next_file_id: 0,
            artifact_history: BTreeMap::new(),
            artifact_ids_by_hash: HashMap::new(),
            current_artifacts: BTreeSet::new(),
            applied_history: BTreeMap::new(),
            current_applied: BTreeSet::new(),
            files: BTreeMap::new(),
            file_ids_by_hash: HashMap::new(),
        };

        let mut reader = JournalReader::open(&journal_path)?;
        let mut transactions = 0usize;
        while let Some(ops) = reader.read_transaction()? {
            for op in ops {
                db.apply(op)?;
            }
            transactions += 1;
        }
        debug!(transactions, "journal replay finished");

        // ensure the id sequences stay ahead of everything replayed, even
        // when the last checkpoint record was torn off
        if let Some(max) = db.artifact_history.keys().next_back() {
            db.next_artifact_id = db.next_artifact_id.max(max + 1);
        }
        if let Some(max) = db.applied_history.keys().next_back() {
            db.next_application_id = db.next_application_id.max(max + 1);
        }
        if let Some(max) = db.files.keys().next_back() {
            db.next_file_id = db.next_file_id.max(max + 1);
        }

        Ok(db)
    }

    /// Reconstruct one journaled mutation in memory.
    fn apply(&mut self, op: JournalOp) -> StoreResult<()> {
        match op {
            JournalOp::SetNextIds {
                next_artifact_id,
                next_application_id,
            } => {
                self.next_artifact_id = next_artifact_id;
                self.next_application_id = next_application_id;
            }
            JournalOp::SetArtifact {
                id,
                string_props,
                file_props,
            } => {
                let mut props = PropertySet::new();
                for prop in string_props {
                    props.add(prop.name, prop.value);
                }
                for prop in file_props {
                    props.add_file(prop.name, prop.file_id);
                }
                self.artifact_ids_by_hash.insert(props.hash().to_string(), id);
                self.artifact_history.insert(id, Artifact { id, props });
            }
            JournalOp::DeleteArtifact { id } => {
                if let Some(artifact) = self.artifact_history.remove(&id) {
                    self.artifact_ids_by_hash.remove(artifact.props.hash());
                }
                self.current_artifacts.remove(&id);
            }
            JournalOp::SetFile {
                id,
                local_path,
                global_path,
                sha256,
            } => {
                self.file_ids_by_hash.insert(sha256.clone(), id);
                self.files.insert(
                    id,
                    FileEntry {
                        id,
                        local_path,
                        global_path,
                        sha256,
                    },
                );
            }
            JournalOp::SetAppliedRule {
                id,
                rule_name,
                fingerprint,
                inputs,
                outputs,
                resume_token,
            } => {
                let mut bindings = Bindings::new();
                for entry in inputs {
                    let artifacts = entry
                        .artifact_ids
                        .iter()
                        .map(|artifact_id| {
                            self.artifact_history
                                .get(artifact_id)
                                .cloned()
                                .ok_or(StoreError::UnknownArtifact(*artifact_id))
                        })
                        .collect::<StoreResult<Vec<Artifact>>>()?;
                    if entry.singleton {
                        let artifact = artifacts.into_iter().next().ok_or_else(|| {
                            StoreError::Corrupt(format!(
                                "singleton input {} of application {id} has no artifact",
                                entry.name
                            ))
                        })?;
                        bindings.add_single(entry.name, artifact);
                    } else {
                        bindings.add_set(entry.name, artifacts);
                    }
                }
                self.applied_history.insert(
                    id,
                    AppliedRule {
                        id,
                        rule_name,
                        fingerprint,
                        inputs: bindings,
                        outputs,
                        resume_token,
                    },
                );
            }
            JournalOp::DeleteAppliedRule { id } => {
                self.applied_history.remove(&id);
                self.current_applied.remove(&id);
            }
        }
        Ok(())
    }

    // ---- artifacts -------------------------------------------------------

    /// Persist a new artifact into history. The artifact becomes visible to
    /// queries only once the rule application that owns it completes.
    pub fn persist_artifact(&mut self, props: PropertySet) -> StoreResult<ArtifactId> {
        let hash = props.hash().to_string();
        if self.artifact_ids_by_hash.contains_key(&hash) {
            return Err(StoreError::DuplicateArtifact(hash));
        }
        let id = self.next_artifact_id;
        self.next_artifact_id += 1;

        self.journal.write(&artifact_op(id, &props));
        self.journal.commit();

        self.artifact_ids_by_hash.insert(hash, id);
        self.artifact_history.insert(id, Artifact { id, props });
        Ok(id)
    }

    pub fn artifact(&self, id: ArtifactId) -> Option<&Artifact> {
        self.artifact_history.get(&id)
    }

    /// Look up the history entry with exactly these properties.
    pub fn find_by_hash(&self, props: &PropertySet) -> Option<&Artifact> {
        let id = self.artifact_ids_by_hash.get(props.hash())?;
        self.artifact_history.get(id)
    }

    /// Scan the current session for artifacts whose properties contain the
    /// filter. Results come back in artifact-id order.
    pub fn find_current(&self, filter: &PropertySet) -> Vec<&Artifact> {
        self.current_artifacts
            .iter()
            .filter_map(|id| self.artifact_history.get(id))
            .filter(|artifact| artifact.props.contains(filter))
            .collect()
    }

    pub fn artifact_in_current(&self, id: ArtifactId) -> bool {
        self.current_artifacts.contains(&id)
    }

    fn add_artifact_to_current(&mut self, id: ArtifactId) -> StoreResult<()> {
        if !self.artifact_history.contains_key(&id) {
            return Err(StoreError::UnknownArtifact(id));
        }
        self.current_artifacts.insert(id);
        Ok(())
    }

    // ---- files -----------------------------------------------------------

    /// Return the file with this content hash, ingesting `local_path` under
    /// a fresh id if no file matches.
    pub fn add_file_or_find(&mut self, local_path: &str, sha256: &str) -> FileId {
        if let Some(id) = self.file_ids_by_hash.get(sha256) {
            return *id;
        }
        let id = self.next_file_id;
        self.next_file_id += 1;

        self.journal.write(&JournalOp::SetFile {
            id,
            local_path: local_path.to_string(),
            global_path: None,
            sha256: sha256.to_string(),
        });
        self.journal.commit();

        self.file_ids_by_hash.insert(sha256.to_string(), id);
        self.files.insert(
            id,
            FileEntry {
                id,
                local_path: local_path.to_string(),
                global_path: None,
                sha256: sha256.to_string(),
            },
        );
        id
    }

    pub fn file(&self, id: FileId) -> Option<&FileEntry> {
        self.files.get(&id)
    }

    // ---- rule applications ----------------------------------------------

    pub fn next_application_id(&mut self) -> ApplicationId {
        let id = self.next_application_id;
        self.next_application_id += 1;
        id
    }

    /// Persist a freshly created (incomplete) rule application into history.
    pub fn persist_applied_rule(
        &mut self,
        id: ApplicationId,
        rule_name: &str,
        fingerprint: &str,
        inputs: Bindings,
        resume_token: Option<String>,
    ) -> StoreResult<()> {
        let applied = AppliedRule {
            id,
            rule_name: rule_name.to_string(),
            fingerprint: fingerprint.to_string(),
            inputs,
            outputs: None,
            resume_token,
        };
        self.journal.write(&applied_rule_op(&applied));
        self.journal.commit();
        self.applied_history.insert(id, applied);
        Ok(())
    }

    /// Make a history application (and its outputs, if complete) visible to
    /// the current session.
    pub fn add_applied_to_current(&mut self, id: ApplicationId) -> StoreResult<()> {
        let outputs = self
            .applied_history
            .get(&id)
            .ok_or(StoreError::UnknownApplication(id))?
            .outputs
            .clone()
            .unwrap_or_default();
        self.current_applied.insert(id);
        for artifact_id in outputs {
            self.add_artifact_to_current(artifact_id)?;
        }
        Ok(())
    }

    /// Record an application's outputs, clearing its resume token, and make
    /// the outputs visible to the current session.
    pub fn update_applied_complete(
        &mut self,
        id: ApplicationId,
        outputs: Vec<ArtifactId>,
    ) -> StoreResult<()> {
        {
            let applied = self
                .applied_history
                .get_mut(&id)
                .ok_or(StoreError::UnknownApplication(id))?;
            applied.outputs = Some(outputs.clone());
            applied.resume_token = None;
        }
        let op = applied_rule_op(&self.applied_history[&id]);
        self.journal.write(&op);
        self.journal.commit();
        for artifact_id in outputs {
            self.add_artifact_to_current(artifact_id)?;
        }
        Ok(())
    }

    pub fn applied(&self, id: ApplicationId) -> Option<&AppliedRule> {
        self.applied_history.get(&id)
    }

    /// Find the current-session application equivalent to this candidate.
    pub fn find_applied_in_current(
        &self,
        rule_name: &str,
        fingerprint: &str,
        inputs: &Bindings,
    ) -> Option<&AppliedRule> {
        self.current_applied
            .iter()
            .filter_map(|id| self.applied_history.get(id))
            .find(|applied| applied.is_equivalent(rule_name, fingerprint, inputs))
    }

    /// Find a completed history application equivalent to this candidate.
    /// Incomplete records (no outputs) are never reused.
    pub fn find_applied_in_history(
        &self,
        rule_name: &str,
        fingerprint: &str,
        inputs: &Bindings,
    ) -> Option<&AppliedRule> {
        self.applied_history
            .values()
            .find(|applied| applied.is_complete() && applied.is_equivalent(rule_name, fingerprint, inputs))
    }

    /// Delete a rule application, its output artifacts, and transitively
    /// every current application whose inputs reference a deleted artifact.
    /// Returns the ids of all deleted applications.
    pub fn delete_applied_cascade(&mut self, id: ApplicationId) -> StoreResult<Vec<ApplicationId>> {
        let mut deleted = Vec::new();
        let mut stack = vec![id];
        while let Some(app_id) = stack.pop() {
            let Some(applied) = self.applied_history.remove(&app_id) else {
                continue;
            };
            self.current_applied.remove(&app_id);
            self.journal.write(&JournalOp::DeleteAppliedRule { id: app_id });
            deleted.push(app_id);

            for artifact_id in applied.outputs.unwrap_or_default() {
                let Some(artifact) = self.artifact_history.remove(&artifact_id) else {
                    continue;
                };
                self.artifact_ids_by_hash.remove(artifact.props.hash());
                self.current_artifacts.remove(&artifact_id);
                self.journal.write(&JournalOp::DeleteArtifact { id: artifact_id });

                let downstream = self
                    .current_applied
                    .iter()
                    .copied()
                    .filter(|candidate| {
                        self.applied_history
                            .get(candidate)
                            .is_some_and(|app| app.inputs.referenced_ids().contains(&artifact_id))
                    });
                stack.extend(downstream);
            }
        }
        self.journal.commit();
        Ok(deleted)
    }

    // ---- session ---------------------------------------------------------

    /// The working directory assigned to a rule application.
    pub fn work_dir(&self, id: ApplicationId) -> PathBuf {
        self.state_dir.join(format!("r{id}"))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Put the store into read-only mode: any further journal write panics.
    pub fn disable_updates(&mut self) {
        self.journal.disable_updates();
    }

    pub fn updates_disabled(&self) -> bool {
        self.journal.updates_disabled()
    }

    /// Checkpoint the id sequences and flush the journal.
    pub fn close(mut self) {
        if !self.journal.updates_disabled() {
            self.journal.write(&JournalOp::SetNextIds {
                next_artifact_id: self.next_artifact_id,
                next_application_id: self.next_application_id,
            });
            self.journal.commit();
        }
    }
}

fn artifact_op(id: ArtifactId, props: &PropertySet) -> JournalOp {
    let mut string_props = Vec::new();
    let mut file_props = Vec::new();
    for (name, value) in props.iter() {
        match value {
            PropertyValue::Literal(s) => string_props.push(StringProp {
                name: name.to_string(),
                value: s.clone(),
            }),
            PropertyValue::FileRef(file_id) => file_props.push(FileProp {
                name: name.to_string(),
                file_id: *file_id,
            }),
        }
    }
    JournalOp::SetArtifact {
        id,
        string_props,
        file_props,
    }
}

fn applied_rule_op(applied: &AppliedRule) -> JournalOp {
    let inputs = applied
        .inputs
        .iter()
        .map(|(name, value)| {
            let mut artifact_ids: Vec<ArtifactId> =
                value.artifacts().iter().map(|a| a.id).collect();
            artifact_ids.sort_unstable();
            InputEntry {
                name: name.to_string(),
                singleton: value.is_single(),
                artifact_ids,
            }
        })
        .collect();
    JournalOp::SetAppliedRule {
        id: applied.id,
        rule_name: applied.rule_name.clone(),
        fingerprint: applied.fingerprint.clone(),
        inputs,
        outputs: applied.outputs.clone(),
        resume_token: applied.resume_token.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn props(pairs: &[(&str, &str)]) -> PropertySet {
        let mut ps = PropertySet::new();
        for (k, v) in pairs {
            ps.add(*k, *v);
        }
        ps
    }

    #[test]
    fn test_persist_and_find_by_hash() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");

        let id = db
            .persist_artifact(props(&[("type", "a-out")]))
            .expect("persist");
        let found = db.find_by_hash(&props(&[("type", "a-out")])).expect("found");
        assert_eq!(found.id, id);
        assert!(db.find_by_hash(&props(&[("type", "other")])).is_none());
    }

    #[test]
    fn test_duplicate_hash_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");

        db.persist_artifact(props(&[("type", "a-out")]))
            .expect("persist");
        let err = db.persist_artifact(props(&[("type", "a-out")]));
        assert!(matches!(err, Err(StoreError::DuplicateArtifact(_))));
    }

    #[test]
    fn test_find_current_sees_only_promoted() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");

        let visible = db
            .persist_artifact(props(&[("type", "a-out"), ("value", "1")]))
            .expect("persist");
        db.persist_artifact(props(&[("type", "a-out"), ("value", "2")]))
            .expect("persist");
        db.add_artifact_to_current(visible).expect("promote");

        let found = db.find_current(&props(&[("type", "a-out")]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, visible);
    }

    #[test]
    fn test_replay_reconstructs_state() {
        let temp = TempDir::new().expect("tempdir");
        let (artifact_id, app_id);
        {
            let mut db = Database::open(temp.path()).expect("open");
            artifact_id = db
                .persist_artifact(props(&[("type", "a-out")]))
                .expect("persist");
            app_id = db.next_application_id();
            let mut inputs = Bindings::new();
            inputs.add_single(
                "a",
                db.artifact(artifact_id).expect("artifact").clone(),
            );
            db.persist_applied_rule(app_id, "b", "fp", inputs, Some("42".to_string()))
                .expect("persist applied");
            db.update_applied_complete(app_id, vec![artifact_id])
                .expect("complete");
            db.close();
        }

        let db = Database::open(temp.path()).expect("reopen");
        let artifact = db
            .find_by_hash(&props(&[("type", "a-out")]))
            .expect("artifact survives replay");
        assert_eq!(artifact.id, artifact_id);
        // current session starts empty
        assert!(db.find_current(&props(&[("type", "a-out")])).is_empty());

        let mut inputs = Bindings::new();
        inputs.add_single("a", artifact.clone());
        let applied = db
            .find_applied_in_history("b", "fp", &inputs)
            .expect("application survives replay");
        assert_eq!(applied.id, app_id);
        assert_eq!(applied.outputs, Some(vec![artifact_id]));
        assert_eq!(applied.resume_token, None);
    }

    #[test]
    fn test_replay_keeps_ids_monotonic() {
        let temp = TempDir::new().expect("tempdir");
        let first;
        {
            let mut db = Database::open(temp.path()).expect("open");
            first = db
                .persist_artifact(props(&[("type", "a")]))
                .expect("persist");
            db.close();
        }
        let mut db = Database::open(temp.path()).expect("reopen");
        let second = db
            .persist_artifact(props(&[("type", "b")]))
            .expect("persist");
        assert!(second > first);
    }

    #[test]
    fn test_incomplete_history_application_not_reused() {
        let temp = TempDir::new().expect("tempdir");
        {
            let mut db = Database::open(temp.path()).expect("open");
            let id = db.next_application_id();
            db.persist_applied_rule(id, "a", "fp", Bindings::new(), Some("99".to_string()))
                .expect("persist applied");
            db.close();
        }
        let db = Database::open(temp.path()).expect("reopen");
        assert!(db
            .find_applied_in_history("a", "fp", &Bindings::new())
            .is_none());
    }

    #[test]
    fn test_cascade_delete_removes_downstream() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");

        // upstream application producing one artifact
        let upstream_app = db.next_application_id();
        db.persist_applied_rule(upstream_app, "a", "fp-a", Bindings::new(), None)
            .expect("persist upstream");
        db.add_applied_to_current(upstream_app).expect("current");
        let produced = db
            .persist_artifact(props(&[("type", "a-out")]))
            .expect("persist artifact");
        db.update_applied_complete(upstream_app, vec![produced])
            .expect("complete");

        // downstream application consuming it
        let downstream_app = db.next_application_id();
        let mut inputs = Bindings::new();
        inputs.add_single("a", db.artifact(produced).expect("artifact").clone());
        db.persist_applied_rule(downstream_app, "b", "fp-b", inputs, None)
            .expect("persist downstream");
        db.add_applied_to_current(downstream_app).expect("current");
        let derived = db
            .persist_artifact(props(&[("type", "b-out")]))
            .expect("persist artifact");
        db.update_applied_complete(downstream_app, vec![derived])
            .expect("complete");

        let deleted = db.delete_applied_cascade(upstream_app).expect("cascade");
        assert!(deleted.contains(&upstream_app));
        assert!(deleted.contains(&downstream_app));
        assert!(db.artifact(produced).is_none());
        assert!(db.artifact(derived).is_none());
        assert!(db.find_by_hash(&props(&[("type", "b-out")])).is_none());
        assert!(db.applied(upstream_app).is_none());
        assert!(db.applied(downstream_app).is_none());
    }

    #[test]
    fn test_add_file_or_find_dedups_by_hash() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");

        let first = db.add_file_or_find("/tmp/a", "hash-1");
        let same = db.add_file_or_find("/tmp/b", "hash-1");
        let other = db.add_file_or_find("/tmp/c", "hash-2");
        assert_eq!(first, same);
        assert_ne!(first, other);
        assert_eq!(db.file(first).expect("file").local_path, "/tmp/a");
    }

    #[test]
    fn test_work_dir_layout() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path()).expect("open");
        assert_eq!(db.work_dir(7), temp.path().join("r7"));
    }
}
