//! Execution plan
//!
//! A state machine over rule names. `after_each[r]` holds the successors
//! whose pending bit is set whenever any execution of `r` completes;
//! `blocked_by[r]` holds the blockers that must be neither pending nor
//! running before `r` may start, which is how `for-all` consumers wait for
//! their entire fan-in. The reserved `INITIAL` pseudo-rule begins running
//! and its completion seeds the roots.
//!
//! Callers drive the machine in this order each step:
//!
//! ```text
//! plan.completed(name);
//! for name in plan.next_prioritized() { ... plan.started(name) ... }
//! for name in plan.next()             { ... plan.started(name) ... }
//! ```
//!
//! `next_prioritized` refuses to start a rule whose blocker is still
//! pending; `next` relaxes that check so that a blocked rule whose blockers
//! can never actually start (they stayed pending because nothing was
//! startable) still gets its chance.

use crate::graph::Graph;
use std::collections::{BTreeMap, BTreeSet};

/// The reserved pseudo-rule that precedes every root.
pub const INITIAL: &str = "<INITIAL>";

#[derive(Debug, Default)]
pub struct ExecutionPlan {
    after_each: BTreeMap<String, BTreeSet<String>>,
    blocked_by: BTreeMap<String, BTreeSet<String>>,
    running: BTreeMap<String, i64>,
    pending: BTreeSet<String>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        let mut plan = ExecutionPlan::default();
        plan.running.insert(INITIAL.to_string(), 1);
        plan
    }

    /// Record that completing `precursor` makes `successor` pending.
    /// Idempotent.
    pub fn add_dependency(&mut self, precursor: &str, successor: &str) {
        self.after_each
            .entry(precursor.to_string())
            .or_default()
            .insert(successor.to_string());
    }

    /// Record that `blockee` cannot start while `blocker` is pending or
    /// running.
    pub fn add_blocked_by(&mut self, blocker: &str, blockee: &str) {
        self.blocked_by
            .entry(blockee.to_string())
            .or_default()
            .insert(blocker.to_string());
    }

    pub fn started(&mut self, name: &str) {
        *self.running.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Record one completion of `name` and set every successor pending.
    ///
    /// Panics when `name` was never started: completing an unstarted rule
    /// is a scheduling bug and continuing would corrupt history.
    pub fn completed(&mut self, name: &str) {
        let count = self.running.entry(name.to_string()).or_insert(0);
        *count -= 1;
        assert!(*count >= 0, "completed rule {name} which was not running");

        if let Some(successors) = self.after_each.get(name) {
            for successor in successors {
                self.pending.insert(successor.clone());
            }
        }
    }

    /// The pending rules whose blockers are all neither pending nor
    /// running, sorted by name and removed from the pending set.
    pub fn next_prioritized(&mut self) -> Vec<String> {
        self.take_startable(true)
    }

    /// Like `next_prioritized` but ignores pending blockers, only running
    /// ones. Used as a second pass once the prioritized set has been
    /// considered and none could actually start.
    pub fn next(&mut self) -> Vec<String> {
        self.take_startable(false)
    }

    fn take_startable(&mut self, check_pending: bool) -> Vec<String> {
        let startable: Vec<String> = self
            .pending
            .iter()
            .filter(|name| {
                self.blocked_by.get(*name).is_none_or(|blockers| {
                    blockers.iter().all(|blocker| {
                        let blocked_on_pending = check_pending && self.pending.contains(blocker);
                        let blocked_on_running =
                            self.running.get(blocker).copied().unwrap_or(0) > 0;
                        !blocked_on_pending && !blocked_on_running
                    })
                })
            })
            .cloned()
            .collect();
        // BTreeSet iteration is already lexicographic, which is the
        // determinism guarantee replays rely on
        for name in &startable {
            self.pending.remove(name);
        }
        startable
    }

    /// True when nothing is pending and every running counter is zero.
    pub fn done(&self) -> bool {
        self.pending.is_empty() && self.running.values().all(|count| *count == 0)
    }

    #[cfg(test)]
    fn successors_of(&self, name: &str) -> Vec<&str> {
        self.after_each
            .get(name)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn blockers_of(&self, name: &str) -> Vec<&str> {
        self.blocked_by
            .get(name)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Build the plan for a graph.
    ///
    /// Rules with no (matched) consumes depend on `INITIAL`; every other
    /// rule depends on each upstream producer of each consumed template,
    /// with an additional blocked-by relation for `for-all` consumes. The
    /// blocked-by relation is then closed transitively: a forall-consumer
    /// must wait for the entire fan-in even when producers are reachable
    /// through multiple paths.
    pub fn from_graph(graph: &Graph) -> Self {
        let mut plan = ExecutionPlan::new();
        graph.for_each_rule(|rule| {
            if rule.consumes.is_empty() {
                plan.add_dependency(INITIAL, &rule.name);
            } else {
                for rel in &rule.consumes {
                    for producer_idx in &graph.template(rel.template).produced_by {
                        let producer = &graph.rule(*producer_idx).name;
                        plan.add_dependency(producer, &rule.name);
                        if rel.is_all {
                            plan.add_blocked_by(producer, &rule.name);
                        }
                    }
                }
            }
        });
        plan.close_blockers();
        plan
    }

    /// For every blocked-by relation `a → b`, also wait on (and run after)
    /// every rule that precedes `a`, to fixpoint.
    fn close_blockers(&mut self) {
        loop {
            let mut additions: Vec<(String, String)> = Vec::new();
            for (blockee, blockers) in &self.blocked_by {
                for blocker in blockers {
                    for (prior, successors) in &self.after_each {
                        if successors.contains(blocker) && !blockers.contains(prior) {
                            additions.push((prior.clone(), blockee.clone()));
                        }
                    }
                }
            }
            if additions.is_empty() {
                return;
            }
            for (prior, blockee) in additions {
                self.add_blocked_by(&prior, &blockee);
                self.add_dependency(&prior, &blockee);
            }
        }
    }
}
