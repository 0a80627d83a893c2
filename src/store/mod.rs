//! Artifact and Applied-Rule Store
//!
//! The store owns every persistent record of the engine: artifacts (immutable
//! property bags), ingested files, and rule applications. Each kind is held in
//! two views:
//!
//! - **history** — everything ever journaled, keyed by id (and, for
//!   artifacts, by property-set digest);
//! - **current** — the subset visible to the running session. Queries scan
//!   only the current view, so work from prior sessions becomes visible only
//!   when the coordinator decides a historical rule application is still
//!   valid and promotes it.
//!
//! Every mutation is written through the journal (`store::journal`) before it
//! is applied in memory; replaying the journal from empty state reconstructs
//! the history views exactly.

mod binding;
mod db;
mod journal;

pub use binding::{BindingValue, Bindings};
pub use db::Database;
pub use journal::{JournalOp, JournalReader, JournalWriter};

use crate::props::{FileId, PropertySet};
use thiserror::Error;

/// Identifier of a persisted artifact, assigned monotonically.
pub type ArtifactId = u32;

/// Identifier of a rule application, assigned monotonically.
pub type ApplicationId = u32;

/// An immutable property bag with a store-assigned identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub props: PropertySet,
}

/// An ingested file, deduplicated by content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: FileId,
    pub local_path: String,
    pub global_path: Option<String>,
    pub sha256: String,
}

/// A rule application: one `(rule, inputs)` pair tracked through its
/// lifecycle. `outputs` is `None` until the application completes; the
/// resume token is cleared on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRule {
    pub id: ApplicationId,
    pub rule_name: String,
    pub fingerprint: String,
    pub inputs: Bindings,
    pub outputs: Option<Vec<ArtifactId>>,
    pub resume_token: Option<String>,
}

impl AppliedRule {
    /// The idempotence key: name, fingerprint, and inputs must all match.
    pub fn is_equivalent(&self, rule_name: &str, fingerprint: &str, inputs: &Bindings) -> bool {
        self.rule_name == rule_name
            && self.fingerprint == fingerprint
            && self.inputs.same_as(inputs)
    }

    pub fn is_complete(&self) -> bool {
        self.outputs.is_some()
    }
}

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact with identical properties already persisted (hash {0})")]
    DuplicateArtifact(String),

    #[error("artifact {0} already produced in this session")]
    SessionConflict(ArtifactId),

    #[error("journal corrupt: {0}")]
    Corrupt(String),

    #[error("unknown artifact id {0}")]
    UnknownArtifact(ArtifactId),

    #[error("unknown rule application id {0}")]
    UnknownApplication(ApplicationId),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
