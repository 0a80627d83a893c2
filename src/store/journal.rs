//! Write-ahead journal
//!
//! Append-only log of every state mutation, one JSON record per line with an
//! explicit `commit` line closing each logical transaction:
//!
//! ```text
//! {"type":"SetArtifact","body":{"id":0,"string_props":[...],"file_props":[]}}
//! {"type":"SetAppliedRule","body":{...}}
//! commit
//! ```
//!
//! Replay applies complete transactions only; a trailing transaction without
//! its commit line is torn (the process died mid-write) and is discarded.
//! After replay the writer reopens the same file in append mode, so the torn
//! tail is superseded rather than repaired.
//!
//! Writes are unrecoverable: once an append fails the in-memory state has
//! diverged from disk, so the writer panics rather than returning an error.

use super::{ApplicationId, ArtifactId, StoreError, StoreResult};
use crate::props::FileId;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

const COMMIT_TOKEN: &str = "commit";

/// One journaled string property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringProp {
    pub name: String,
    pub value: String,
}

/// One journaled file-reference property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProp {
    pub name: String,
    pub file_id: FileId,
}

/// One input binding of a journaled rule application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry {
    pub name: String,
    pub singleton: bool,
    pub artifact_ids: Vec<ArtifactId>,
}

/// A single journal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum JournalOp {
    SetNextIds {
        next_artifact_id: ArtifactId,
        next_application_id: ApplicationId,
    },
    SetArtifact {
        id: ArtifactId,
        string_props: Vec<StringProp>,
        file_props: Vec<FileProp>,
    },
    DeleteArtifact {
        id: ArtifactId,
    },
    SetFile {
        id: FileId,
        local_path: String,
        global_path: Option<String>,
        sha256: String,
    },
    SetAppliedRule {
        id: ApplicationId,
        rule_name: String,
        fingerprint: String,
        inputs: Vec<InputEntry>,
        outputs: Option<Vec<ArtifactId>>,
        resume_token: Option<String>,
    },
    DeleteAppliedRule {
        id: ApplicationId,
    },
}

/// Append-side handle on the journal file.
pub struct JournalWriter {
    writer: BufWriter<File>,
    disable_updates: bool,
}

impl JournalWriter {
    /// Open the journal for appending, creating it if missing.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JournalWriter {
            writer: BufWriter::new(file),
            disable_updates: false,
        })
    }

    /// Turn any further write attempt into a panic. Used by the read-only
    /// replay flow: a replay that tries to mutate state is a bug.
    pub fn disable_updates(&mut self) {
        self.disable_updates = true;
    }

    pub fn updates_disabled(&self) -> bool {
        self.disable_updates
    }

    /// Append one record. Panics on I/O failure or when updates are
    /// disabled.
    pub fn write(&mut self, op: &JournalOp) {
        assert!(!self.disable_updates, "journal updates are disabled");
        let line = serde_json::to_string(op).expect("journal record serialization cannot fail");
        writeln!(self.writer, "{line}").expect("journal append failed");
    }

    /// Close the open transaction and flush it to disk. Panics on I/O
    /// failure or when updates are disabled.
    pub fn commit(&mut self) {
        assert!(!self.disable_updates, "journal updates are disabled");
        writeln!(self.writer, "{COMMIT_TOKEN}").expect("journal commit failed");
        self.writer.flush().expect("journal flush failed");
    }
}

/// Replay-side handle on the journal file.
pub struct JournalReader {
    reader: BufReader<File>,
}

impl JournalReader {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = File::open(path)?;
        Ok(JournalReader {
            reader: BufReader::new(file),
        })
    }

    /// Read the next complete transaction. Returns `Ok(None)` at the end of
    /// the log, including when the tail holds a torn transaction (records
    /// with no following commit); the torn records are discarded.
    pub fn read_transaction(&mut self) -> StoreResult<Option<Vec<JournalOp>>> {
        let mut ops = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 || !line.ends_with('\n') {
                // EOF (or a partially written final line) before commit
                if !ops.is_empty() || !line.trim().is_empty() {
                    debug!(
                        discarded = ops.len(),
                        "discarding torn transaction at journal tail"
                    );
                }
                return Ok(None);
            }
            let trimmed = line.trim_end();
            if trimmed == COMMIT_TOKEN {
                return Ok(Some(ops));
            }
            match serde_json::from_str::<JournalOp>(trimmed) {
                Ok(op) => ops.push(op),
                Err(err) => {
                    return Err(StoreError::Corrupt(format!(
                        "unreadable journal record: {err}"
                    )))
                }
            }
        }
    }
}
