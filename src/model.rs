//! Shared model types: rules, run statements, the executor contract, and
//! completion state.

use crate::graph::PropsTemplate;
use crate::props::sha256_hex;
use crate::query::Query;
use crate::store::{ApplicationId, FileEntry};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use thiserror::Error;
use tracing::warn;

/// Name of the executor used when a rule does not pick one.
pub const DEFAULT_EXECUTOR: &str = "local";

/// One shell fragment of a rule: an executable line and an optional script
/// body staged into a file and passed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatement {
    pub executable: String,
    pub script: Option<String>,
}

impl RunStatement {
    pub fn new(executable: impl Into<String>) -> Self {
        RunStatement {
            executable: executable.into(),
            script: None,
        }
    }

    pub fn with_script(executable: impl Into<String>, script: impl Into<String>) -> Self {
        RunStatement {
            executable: executable.into(),
            script: Some(script.into()),
        }
    }
}

/// One property of an output template. `is_filename` marks values that name
/// a file produced by the run statements rather than a literal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProperty {
    pub name: String,
    pub value: String,
    pub is_filename: bool,
}

/// One declared output artifact template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOutput {
    pub properties: Vec<OutputProperty>,
}

impl RuleOutput {
    pub fn add_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.push(OutputProperty {
            name: name.into(),
            value: value.into(),
            is_filename: false,
        });
    }

    pub fn add_filename(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.push(OutputProperty {
            name: name.into(),
            value: value.into(),
            is_filename: true,
        });
    }

    fn template(&self) -> PropsTemplate {
        let mut template = PropsTemplate::new();
        for prop in &self.properties {
            template.add(prop.name.clone(), prop.value.clone());
        }
        template
    }
}

/// An output shape declared without concrete values for every property.
/// Properties with no value still describe the artifact for graph linking
/// but carry nothing into the produced template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedOutput {
    pub properties: Vec<(String, Option<String>)>,
}

/// A rule: a query over prior artifacts, templates for the artifacts it
/// produces, and shell fragments to run.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub name: String,
    pub query: Query,
    pub outputs: Vec<RuleOutput>,
    pub expected_outputs: Vec<ExpectedOutput>,
    pub run_statements: Vec<RunStatement>,
    pub executor_name: String,
    pub required_resources: BTreeMap<String, f64>,
}

impl Rule {
    /// The rule's content fingerprint: a canonical digest of name, query,
    /// and outputs. Run statements and required resources are deliberately
    /// not covered, so a rule whose shell command changes while its
    /// observable contract stays the same is considered unchanged.
    pub fn fingerprint(&self) -> String {
        static INCOMPLETE: Once = Once::new();
        INCOMPLETE.call_once(|| {
            warn!("rule fingerprints do not cover run statements or required resources");
        });

        let mut canonical = String::new();
        let _ = writeln!(canonical, "rule {:?}", self.name);
        canonical.push_str(&self.query.canonical());
        for output in &self.outputs {
            canonical.push_str("output");
            for prop in &output.properties {
                let tag = if prop.is_filename { 'f' } else { 's' };
                let _ = write!(canonical, " {:?}={tag}{:?}", prop.name, prop.value);
            }
            canonical.push('\n');
        }
        for expected in &self.expected_outputs {
            canonical.push_str("expected");
            for (name, value) in &expected.properties {
                match value {
                    Some(v) => {
                        let _ = write!(canonical, " {name:?}={v:?}");
                    }
                    None => {
                        let _ = write!(canonical, " {name:?}");
                    }
                }
            }
            canonical.push('\n');
        }
        sha256_hex(canonical.as_bytes())
    }

    /// Templates this rule's query consumes, for graph construction.
    pub fn query_templates(&self) -> Vec<(bool, PropsTemplate)> {
        self.query
            .templates()
            .into_iter()
            .map(|(is_all, constants)| {
                let mut template = PropsTemplate::new();
                for (name, value) in constants {
                    template.add(name, value);
                }
                (is_all, template)
            })
            .collect()
    }

    /// Templates this rule produces, for graph construction. Concrete
    /// outputs win; otherwise the expected-output shapes are used, minus
    /// their valueless properties.
    pub fn output_templates(&self) -> Vec<PropsTemplate> {
        if !self.outputs.is_empty() {
            return self.outputs.iter().map(RuleOutput::template).collect();
        }
        self.expected_outputs
            .iter()
            .map(|expected| {
                let mut template = PropsTemplate::new();
                for (name, value) in &expected.properties {
                    if let Some(value) = value {
                        template.add(name.clone(), value.clone());
                    }
                }
                template
            })
            .collect()
    }
}

/// Everything a rule file declares: variables, rules, and `add-if-missing`
/// artifacts. The coordinator is fully parameterized on one of these plus a
/// state directory; there is no process-wide state.
#[derive(Debug, Default)]
pub struct Config {
    pub vars: BTreeMap<String, String>,
    pub rules: BTreeMap<String, Rule>,
    /// Property lists from `add-if-missing` statements and `filename()`
    /// inputs, emitted by a synthetic root rule at run time.
    pub artifacts: Vec<RuleOutput>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.insert(rule.name.clone(), rule);
    }
}

/// Final state of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionState {
    pub success: bool,
    pub failure_message: Option<String>,
    /// `(label, path)` pairs pointing at logs that explain a failure.
    pub failure_logs: Vec<(String, String)>,
}

impl CompletionState {
    pub fn success() -> Self {
        CompletionState {
            success: true,
            failure_message: None,
            failure_logs: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        CompletionState {
            success: false,
            failure_message: Some(message.into()),
            failure_logs: Vec::new(),
        }
    }
}

/// Cooperative cancellation signal threaded into `ExecutionBuilder::start`.
/// The executor is responsible for signaling its child when the token
/// trips.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Executor errors.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot make file {0} locally accessible")]
    Localize(String),

    #[error("invalid resume token {0:?}")]
    BadResumeToken(String),

    #[error("{0}")]
    Other(String),
}

/// Callbacks invoked over the lifespan of one execution. `status` may fire
/// any number of times; `completed` fires exactly once at the end.
pub trait Listener: Send {
    fn status(&self, update: &str);
    fn completed(&self, state: CompletionState);
}

/// A started (or re-attached) execution.
pub trait Execution: Send {
    /// Opaque token with which `Executor::resume` can re-attach after a
    /// crash of the coordinator.
    fn resume_token(&self) -> String;

    /// Block until the execution finishes, reporting through the listener.
    /// Runs on its own worker thread.
    fn wait(self: Box<Self>, listener: Box<dyn Listener>);
}

/// Prepares one rule application for execution.
pub trait ExecutionBuilder {
    /// Request a path to the given file usable by the run statements.
    /// Side-effect free with respect to the store.
    fn localize(&mut self, file: &FileEntry) -> Result<String, ExecError>;

    /// Stash an auxiliary file (e.g. a rendered output descriptor) into the
    /// working directory; returns its path relative to that directory.
    fn add_file(&mut self, body: &[u8]) -> Result<String, ExecError>;

    /// Translate the rendered run statements into whatever script form the
    /// executor uses. Statements are sequenced fail-fast, with SIGTERM and
    /// SIGINT forwarded to the child.
    fn prepare(&mut self, statements: &[RunStatement]) -> Result<(), ExecError>;

    /// Start the prepared execution.
    fn start(&mut self, cancel: &CancelToken) -> Result<Box<dyn Execution>, ExecError>;
}

/// Contract with an external execution backend.
pub trait Executor {
    fn builder(&self, application_id: ApplicationId) -> Box<dyn ExecutionBuilder>;

    /// Re-attach to an execution started by an earlier process.
    fn resume(&self, token: &str) -> Result<Box<dyn Execution>, ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryBinding;

    fn rule_with_output(name: &str, value: &str) -> Rule {
        let mut output = RuleOutput::default();
        output.add_string("type", value);
        Rule {
            name: name.to_string(),
            outputs: vec![output],
            executor_name: DEFAULT_EXECUTOR.to_string(),
            ..Rule::default()
        }
    }

    #[test]
    fn test_fingerprint_ignores_run_statements() {
        let mut a = rule_with_output("r", "a-out");
        let mut b = rule_with_output("r", "a-out");
        a.run_statements = vec![RunStatement::new("date")];
        b.run_statements = vec![RunStatement::new("hostname")];
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_covers_outputs() {
        let a = rule_with_output("r", "a-out");
        let b = rule_with_output("r", "b-out");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_covers_name_and_query() {
        let a = rule_with_output("r1", "a-out");
        let b = rule_with_output("r2", "a-out");
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut with_query = rule_with_output("r1", "a-out");
        with_query.query = Query {
            for_each: vec![QueryBinding::new("in").constant("type", "x")],
            for_all: vec![],
        };
        assert_ne!(a.fingerprint(), with_query.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_filename_outputs() {
        let mut literal = Rule {
            name: "r".to_string(),
            ..Rule::default()
        };
        let mut out = RuleOutput::default();
        out.add_string("f", "path");
        literal.outputs = vec![out];

        let mut fileref = Rule {
            name: "r".to_string(),
            ..Rule::default()
        };
        let mut out = RuleOutput::default();
        out.add_filename("f", "path");
        fileref.outputs = vec![out];

        assert_ne!(literal.fingerprint(), fileref.fingerprint());
    }

    #[test]
    fn test_output_templates_fall_back_to_expected() {
        let rule = Rule {
            name: "r".to_string(),
            expected_outputs: vec![ExpectedOutput {
                properties: vec![
                    ("type".to_string(), Some("a-out".to_string())),
                    ("open".to_string(), None),
                ],
            }],
            ..Rule::default()
        };
        let templates = rule.output_templates();
        assert_eq!(templates.len(), 1);
        assert!(templates[0].has("type", "a-out"));
        assert!(templates[0].get("open").is_none());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
