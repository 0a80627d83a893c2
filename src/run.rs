//! The coordinator
//!
//! Owns the main loop: turn the rule set into a dependency graph and an
//! execution plan, then repeatedly drain a completion queue, ask the plan
//! what may start, evaluate each startable rule's query, and dispatch the
//! resulting rule applications through the executor contract. Completion
//! events arrive over a single channel from per-execution worker threads;
//! every mutation of the plan, the store, and the journal happens here on
//! the coordinator thread, so none of them needs internal locking.
//!
//! An application whose `(rule, fingerprint, inputs)` triple already exists
//! in the current session is skipped; one found only in history is promoted
//! without re-executing; anything else runs. On failure the application and
//! everything downstream of its artifacts is cascade-deleted and the rule
//! is not re-attempted within the run.

use crate::exec::LocalExecutor;
use crate::graph::{Graph, GraphBuilder};
use crate::model::{
    CancelToken, Config, Executor, ExecutionBuilder, Listener, Rule, RuleOutput, RunStatement,
    CompletionState, DEFAULT_EXECUTOR,
};
use crate::parser::{self, ParseError};
use crate::plan::{ExecutionPlan, INITIAL};
use crate::props::{sha256_file, PropertySet, PropertyValue};
use crate::render;
use crate::store::{ApplicationId, Artifact, ArtifactId, Bindings, Database, StoreError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the synthetic root rule emitting `add-if-missing` artifacts and
/// `filename()` references.
pub const ARTIFACT_RULE_NAME: &str = "<artifacts>";

/// Coordinator errors.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] crate::model::ExecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed results file: {0}")]
    MalformedResults(String),

    #[error("output artifact {0} was already produced in this session")]
    OutputConflict(ArtifactId),

    #[error("rule names unknown executor {0:?}")]
    UnknownExecutor(String),
}

type RunResult<T> = Result<T, RunError>;

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub rule_evaluations: u32,
    pub reused: u32,
    pub executions: u32,
    pub successful_completions: u32,
    pub failed_completions: u32,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "executions: {}, reused: {}, successes: {}, failures: {}",
            self.executions, self.reused, self.successful_completions, self.failed_completions
        )
    }
}

enum EventKind {
    Status(String),
    Completed(CompletionState),
}

struct ExecEvent {
    application_id: ApplicationId,
    kind: EventKind,
}

struct ExecListener {
    application_id: ApplicationId,
    tx: Sender<ExecEvent>,
}

impl Listener for ExecListener {
    fn status(&self, update: &str) {
        let _ = self.tx.send(ExecEvent {
            application_id: self.application_id,
            kind: EventKind::Status(update.to_string()),
        });
    }

    fn completed(&self, state: CompletionState) {
        let _ = self.tx.send(ExecEvent {
            application_id: self.application_id,
            kind: EventKind::Completed(state),
        });
    }
}

/// Build the bipartite rule/artifact-template graph for a rule set.
pub fn build_graph(rules: &BTreeMap<String, Rule>) -> Graph {
    let mut gb = GraphBuilder::new();
    for rule in rules.values() {
        gb.add_rule(&rule.name);
        for (is_all, template) in rule.query_templates() {
            gb.add_consumes(&rule.name, is_all, template);
        }
        for template in rule.output_templates() {
            gb.add_produces(&rule.name, template);
        }
    }
    gb.build()
}

pub struct Coordinator {
    config: Config,
    executors: BTreeMap<String, Box<dyn Executor>>,
    replay_only: bool,
    cancel: CancelToken,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Coordinator {
            config,
            executors: BTreeMap::new(),
            replay_only: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn register_executor(&mut self, name: &str, executor: Box<dyn Executor>) {
        self.executors.insert(name.to_string(), executor);
    }

    /// Only promote history hits; never execute. Pairs with a store whose
    /// updates are disabled.
    pub fn set_replay_only(&mut self, replay_only: bool) {
        self.replay_only = replay_only;
    }

    /// A token that stops new dispatches and signals running executions.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The dependency graph for the configured rules, including the
    /// synthetic artifact rule.
    pub fn graph(&mut self) -> RunResult<Graph> {
        self.ensure_artifact_rule()?;
        Ok(build_graph(&self.config.rules))
    }

    /// Drive the full coordination loop against `db`.
    pub fn run(&mut self, db: &mut Database) -> RunResult<RunStats> {
        self.ensure_artifact_rule()?;
        let graph = build_graph(&self.config.rules);
        let mut plan = ExecutionPlan::from_graph(&graph);

        let (tx, rx): (Sender<ExecEvent>, Receiver<ExecEvent>) = unbounded();
        let mut running: BTreeMap<ApplicationId, String> = BTreeMap::new();
        let mut stats = RunStats::default();
        let mut queue = vec![INITIAL.to_string()];

        loop {
            while let Some(name) = queue.pop() {
                debug!(rule = %name, "completed");
                plan.completed(&name);

                let next = plan.next_prioritized();
                queue.extend(self.process_rules(db, &mut plan, &next, &tx, &mut running, &mut stats)?);
                let next = plan.next();
                queue.extend(self.process_rules(db, &mut plan, &next, &tx, &mut running, &mut stats)?);
            }

            if running.is_empty() && (plan.done() || self.cancel.is_cancelled()) {
                break;
            }

            let event = rx.recv().expect("coordinator holds a sender");
            self.handle_event(db, event, &mut running, &mut stats, &mut queue)?;
        }

        info!(%stats, "run finished");
        Ok(stats)
    }

    /// Fold `add-if-missing` artifacts and `filename()` references into one
    /// synthetic root rule. File-valued properties get a companion
    /// `{name}$sha256` property, so changing a file's contents changes the
    /// rule's outputs and invalidates everything downstream.
    fn ensure_artifact_rule(&mut self) -> RunResult<()> {
        if self.config.artifacts.is_empty() {
            return Ok(());
        }
        let declared = std::mem::take(&mut self.config.artifacts);
        let mut outputs: Vec<RuleOutput> = Vec::with_capacity(declared.len());
        for artifact in declared {
            let mut output = RuleOutput::default();
            for prop in artifact.properties {
                if prop.is_filename {
                    let digest = sha256_file(Path::new(&prop.value))?;
                    output.add_string(format!("{}$sha256", prop.name), digest);
                    output.add_filename(prop.name, prop.value);
                } else {
                    output.add_string(prop.name, prop.value);
                }
            }
            if !outputs.contains(&output) {
                outputs.push(output);
            }
        }
        self.config.add_rule(Rule {
            name: ARTIFACT_RULE_NAME.to_string(),
            outputs,
            executor_name: DEFAULT_EXECUTOR.to_string(),
            ..Rule::default()
        });
        Ok(())
    }

    /// Evaluate each startable rule and dispatch its pending applications.
    /// Returns the names of applications that needed no execution, which
    /// count as completions for this scheduling step.
    fn process_rules(
        &self,
        db: &mut Database,
        plan: &mut ExecutionPlan,
        names: &[String],
        tx: &Sender<ExecEvent>,
        running: &mut BTreeMap<ApplicationId, String>,
        stats: &mut RunStats,
    ) -> RunResult<Vec<String>> {
        let mut completions = Vec::new();
        for name in names {
            if self.cancel.is_cancelled() {
                break;
            }
            stats.rule_evaluations += 1;
            let rule = self
                .config
                .rules
                .get(name)
                .expect("planned rule must exist in the config");
            let fingerprint = rule.fingerprint();

            let rows = if rule.query.is_empty() {
                vec![Bindings::new()]
            } else {
                rule.query.evaluate(db)
            };
            debug!(rule = %name, rows = rows.len(), "query evaluated");

            for inputs in rows {
                if db.find_applied_in_current(name, &fingerprint, &inputs).is_some() {
                    debug!(rule = %name, "already applied in this session");
                    continue;
                }
                if let Some(existing) = db.find_applied_in_history(name, &fingerprint, &inputs) {
                    let id = existing.id;
                    stats.reused += 1;
                    debug!(rule = %name, application = id, "reusing prior application");
                    db.add_applied_to_current(id)?;
                    plan.started(name);
                    completions.push(name.clone());
                    continue;
                }
                if self.replay_only {
                    continue;
                }

                stats.executions += 1;
                let application_id = db.next_application_id();
                let resume_token = self.start_execution(db, application_id, rule, &inputs, tx)?;
                db.persist_applied_rule(
                    application_id,
                    name,
                    &fingerprint,
                    inputs,
                    Some(resume_token),
                )?;
                db.add_applied_to_current(application_id)?;
                plan.started(name);
                running.insert(application_id, name.clone());
            }
        }
        Ok(completions)
    }

    /// Localize inputs, render run statements and the output descriptor,
    /// and start the execution on its own worker thread. Returns the
    /// resume token.
    fn start_execution(
        &self,
        db: &mut Database,
        application_id: ApplicationId,
        rule: &Rule,
        inputs: &Bindings,
        tx: &Sender<ExecEvent>,
    ) -> RunResult<String> {
        let executor = self
            .executors
            .get(&rule.executor_name)
            .ok_or_else(|| RunError::UnknownExecutor(rule.executor_name.clone()))?;
        let mut builder = executor.builder(application_id);

        let localized = localize_inputs(builder.as_mut(), db, inputs);

        let vars = &self.config.vars;
        let mut statements: Vec<RunStatement> = rule
            .run_statements
            .iter()
            .map(|statement| RunStatement {
                executable: render::expand(&statement.executable, vars, &localized),
                script: statement
                    .script
                    .as_ref()
                    .map(|body| render::expand(body, vars, &localized)),
            })
            .collect();

        if !rule.outputs.is_empty() {
            let descriptor = render_output_descriptor(&rule.outputs, vars, &localized);
            let staged = builder.add_file(descriptor.to_string().as_bytes())?;
            statements.push(RunStatement::new(format!("cp {staged} results.json")));
        }

        builder.prepare(&statements)?;
        let execution = builder.start(&self.cancel)?;
        let resume_token = execution.resume_token();

        let listener = ExecListener {
            application_id,
            tx: tx.clone(),
        };
        std::thread::spawn(move || execution.wait(Box::new(listener)));
        Ok(resume_token)
    }

    fn handle_event(
        &self,
        db: &mut Database,
        event: ExecEvent,
        running: &mut BTreeMap<ApplicationId, String>,
        stats: &mut RunStats,
        queue: &mut Vec<String>,
    ) -> RunResult<()> {
        let application_id = event.application_id;
        match event.kind {
            EventKind::Status(status) => {
                debug!(application = application_id, %status, "status update");
            }
            EventKind::Completed(state) => {
                let Some(name) = running.remove(&application_id) else {
                    warn!(application = application_id, "completion for unknown application");
                    return Ok(());
                };

                let failure = if state.success {
                    match self.collect_outputs(db, application_id) {
                        Ok(outputs) => {
                            db.update_applied_complete(application_id, outputs)?;
                            stats.successful_completions += 1;
                            debug!(rule = %name, application = application_id, "application complete");
                            None
                        }
                        Err(err) => Some(err.to_string()),
                    }
                } else {
                    for (label, path) in &state.failure_logs {
                        warn!(rule = %name, "{label}: {path}");
                    }
                    Some(
                        state
                            .failure_message
                            .unwrap_or_else(|| "execution failed".to_string()),
                    )
                };

                if let Some(message) = failure {
                    stats.failed_completions += 1;
                    warn!(rule = %name, application = application_id, %message, "application failed");
                    let deleted = db.delete_applied_cascade(application_id)?;
                    debug!(?deleted, "cascade deleted");
                }

                // advance the plan for failures as well: the cascade has
                // already removed the failed outputs, so downstream queries
                // find nothing, and the rule is not re-attempted
                queue.push(name);
            }
        }
        Ok(())
    }

    /// Parse the execution's `results.json` into output artifacts, reusing
    /// history hits and rejecting artifacts already visible in the current
    /// session.
    fn collect_outputs(
        &self,
        db: &mut Database,
        application_id: ApplicationId,
    ) -> RunResult<Vec<ArtifactId>> {
        let work_dir = db.work_dir(application_id);
        let raw_outputs = read_results_file(&work_dir)?;

        let mut output_ids = Vec::with_capacity(raw_outputs.len());
        for raw in raw_outputs {
            let props = props_from_json(db, &work_dir, &raw)?;
            let existing = db.find_by_hash(&props).map(|artifact| artifact.id);
            match existing {
                Some(id) if db.artifact_in_current(id) => {
                    return Err(RunError::OutputConflict(id));
                }
                Some(id) => output_ids.push(id),
                None => output_ids.push(db.persist_artifact(props)?),
            }
        }
        Ok(output_ids)
    }
}

/// Replace each file-valued input property with the executor-provided local
/// path, so templates and run statements see plain strings.
///
/// Localization failure is fatal: the artifact names a file the store knows
/// about but the executor cannot materialize, and no rule-level recovery
/// exists for that.
fn localize_inputs(
    builder: &mut dyn ExecutionBuilder,
    db: &Database,
    inputs: &Bindings,
) -> Bindings {
    inputs.transform(|artifact| {
        let mut props = PropertySet::new();
        for (name, value) in artifact.props.iter() {
            match value {
                PropertyValue::Literal(s) => props.add(name, s.clone()),
                PropertyValue::FileRef(file_id) => {
                    let entry = db
                        .file(*file_id)
                        .unwrap_or_else(|| panic!("artifact references unknown file {file_id}"));
                    let local = builder
                        .localize(entry)
                        .unwrap_or_else(|err| panic!("cannot localize file {file_id}: {err}"));
                    props.add(name, local);
                }
            }
        }
        Artifact {
            id: artifact.id,
            props,
        }
    })
}

/// Render the declared outputs into the JSON descriptor the run script
/// copies to `results.json`.
fn render_output_descriptor(
    outputs: &[RuleOutput],
    vars: &BTreeMap<String, String>,
    inputs: &Bindings,
) -> Value {
    let rendered: Vec<Value> = outputs
        .iter()
        .map(|output| {
            let mut object = serde_json::Map::new();
            for prop in &output.properties {
                let value = render::expand(&prop.value, vars, inputs);
                if prop.is_filename {
                    object.insert(
                        prop.name.clone(),
                        serde_json::json!({ "$filename": value }),
                    );
                } else {
                    object.insert(prop.name.clone(), Value::String(value));
                }
            }
            Value::Object(object)
        })
        .collect();
    serde_json::json!({ "outputs": rendered })
}

/// Read and shape-check `results.json` from an application's work dir.
fn read_results_file(work_dir: &Path) -> RunResult<Vec<serde_json::Map<String, Value>>> {
    let path = work_dir.join("results.json");
    let text = std::fs::read_to_string(&path)
        .map_err(|err| RunError::MalformedResults(format!("{}: {err}", path.display())))?;
    let document: Value = serde_json::from_str(&text)
        .map_err(|err| RunError::MalformedResults(format!("{}: {err}", path.display())))?;

    let outputs = document
        .get("outputs")
        .and_then(Value::as_array)
        .ok_or_else(|| RunError::MalformedResults("missing \"outputs\" array".to_string()))?;
    outputs
        .iter()
        .map(|output| {
            output
                .as_object()
                .cloned()
                .ok_or_else(|| RunError::MalformedResults("output must be an object".to_string()))
        })
        .collect()
}

/// Convert one raw output object into a property set, ingesting
/// `{"$filename": path}` values through the file table.
fn props_from_json(
    db: &mut Database,
    work_dir: &Path,
    raw: &serde_json::Map<String, Value>,
) -> RunResult<PropertySet> {
    let mut props = PropertySet::new();
    for (name, value) in raw {
        match value {
            Value::String(s) => props.add(name.clone(), s.clone()),
            Value::Object(object) => {
                let filename = object
                    .get("$filename")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        RunError::MalformedResults(format!(
                            "property {name:?} must be a string or {{\"$filename\": path}}"
                        ))
                    })?;
                let full_path = if Path::new(filename).is_absolute() {
                    PathBuf::from(filename)
                } else {
                    work_dir.join(filename)
                };
                let digest = sha256_file(&full_path).map_err(|err| {
                    RunError::MalformedResults(format!(
                        "cannot read {}: {err}",
                        full_path.display()
                    ))
                })?;
                let file_id = db.add_file_or_find(&full_path.display().to_string(), &digest);
                props.add_file(name.clone(), file_id);
            }
            other => {
                return Err(RunError::MalformedResults(format!(
                    "property {name:?} has unsupported value {other}"
                )));
            }
        }
    }
    Ok(props)
}

// ---- entry points --------------------------------------------------------

fn load_config(rule_file: &Path) -> RunResult<Config> {
    let statements = parser::parse_file(rule_file)?;
    let mut config = Config::new();
    parser::eval(&statements, &mut config)?;
    Ok(config)
}

/// Run every rule in `rule_file` against the state directory.
pub fn run_rules_in_file(state_dir: &Path, rule_file: &Path) -> RunResult<RunStats> {
    let config = load_config(rule_file)?;
    let mut db = Database::open(state_dir)?;

    let mut coordinator = Coordinator::new(config);
    coordinator.register_executor(
        DEFAULT_EXECUTOR,
        Box::new(LocalExecutor::new(state_dir.to_path_buf())),
    );
    let stats = coordinator.run(&mut db)?;
    db.close();
    Ok(stats)
}

/// What a read-only replay of a rule file makes visible.
pub struct SessionExport {
    pub graph: Graph,
    pub artifacts: Vec<Artifact>,
    /// File table entries, for rendering file-valued properties.
    pub files: BTreeMap<crate::props::FileId, crate::store::FileEntry>,
}

/// Reopen the store read-only, replay the rules without executing anything,
/// and return the graph plus the artifacts visible to the session.
pub fn replay_and_export(state_dir: &Path, rule_file: &Path) -> RunResult<SessionExport> {
    let config = load_config(rule_file)?;
    let mut db = Database::open(state_dir)?;
    db.disable_updates();

    let mut coordinator = Coordinator::new(config);
    coordinator.set_replay_only(true);
    let graph = coordinator.graph()?;
    coordinator.run(&mut db)?;

    let artifacts: Vec<Artifact> = db
        .find_current(&PropertySet::new())
        .into_iter()
        .cloned()
        .collect();
    let files = artifacts
        .iter()
        .flat_map(|artifact| artifact.props.iter())
        .filter_map(|(_, value)| match value {
            PropertyValue::FileRef(id) => db.file(*id).map(|entry| (*id, entry.clone())),
            PropertyValue::Literal(_) => None,
        })
        .collect();
    Ok(SessionExport {
        graph,
        artifacts,
        files,
    })
}
