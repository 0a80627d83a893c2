//! Dependency graph
//!
//! A bipartite graph of rule nodes and artifact-template nodes, built from
//! the consume/produce declarations of every rule. Rules and templates are
//! kept in arenas addressed by index; the back edges (template → consuming
//! rules, template → producing rules) are filled in a second pass once all
//! forward edges are known, so the in-memory form never contains pointer
//! cycles.
//!
//! Linking is template-level containment: a consume declaration links to
//! every produced template whose constant properties contain the consumed
//! ones. A consume that matches nothing leaves the rule dead; the builder
//! warns but keeps the rule in the graph.

pub mod dot;

use std::collections::BTreeMap;
use tracing::warn;

/// Index of a rule node in the graph arena.
pub type RuleIdx = usize;

/// Index of an artifact-template node in the graph arena.
pub type TemplateIdx = usize;

/// Constant `name → value` properties of an artifact template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropsTemplate {
    entries: BTreeMap<String, String>,
}

impl PropsTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str, value: &str) -> bool {
        self.entries.get(name).is_some_and(|v| v == value)
    }

    /// True when every entry of `other` appears in `self`.
    pub fn contains(&self, other: &PropsTemplate) -> bool {
        other.entries.iter().all(|(k, v)| self.has(k, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for PropsTemplate {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut template = PropsTemplate::new();
        for (k, v) in pairs {
            template.add(k, v);
        }
        template
    }
}

/// A consume edge: the template consumed and whether the rule takes the
/// entire matching set (`for-all`) rather than one application per match.
#[derive(Debug, Clone)]
pub struct ConsumeRel {
    pub is_all: bool,
    pub template: TemplateIdx,
}

#[derive(Debug)]
pub struct RuleNode {
    pub name: String,
    pub produces: Vec<TemplateIdx>,
    pub consumes: Vec<ConsumeRel>,
}

#[derive(Debug)]
pub struct TemplateNode {
    pub props: PropsTemplate,
    pub produced_by: Vec<RuleIdx>,
    pub consumed_by: Vec<RuleIdx>,
}

/// Incrementally constructed via the `add_*` methods, then `build()`.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    // rule name → (produced templates, declared consumes)
    rules: BTreeMap<String, BuilderRule>,
}

#[derive(Debug, Default)]
struct BuilderRule {
    produces: Vec<PropsTemplate>,
    consumes: Vec<(bool, PropsTemplate)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a rule with no edges yet.
    pub fn add_rule(&mut self, name: &str) {
        self.rules.entry(name.to_string()).or_default();
    }

    /// Declare that `name` consumes artifacts matching `template`.
    pub fn add_consumes(&mut self, name: &str, is_all: bool, template: PropsTemplate) {
        self.rules
            .entry(name.to_string())
            .or_default()
            .consumes
            .push((is_all, template));
    }

    /// Declare that `name` produces artifacts matching `template`.
    pub fn add_produces(&mut self, name: &str, template: PropsTemplate) {
        self.rules
            .entry(name.to_string())
            .or_default()
            .produces
            .push(template);
    }

    /// Two phases: index every produced template, then link each consume
    /// declaration to all produced templates containing it. Back edges are
    /// populated afterwards.
    pub fn build(self) -> Graph {
        let mut rules: Vec<RuleNode> = Vec::with_capacity(self.rules.len());
        let mut templates: Vec<TemplateNode> = Vec::new();

        // phase 1: rule arena + template index over everything produced
        for (name, builder_rule) in &self.rules {
            let rule_idx = rules.len();
            let mut produces = Vec::with_capacity(builder_rule.produces.len());
            for props in &builder_rule.produces {
                let template_idx = templates.len();
                templates.push(TemplateNode {
                    props: props.clone(),
                    produced_by: vec![rule_idx],
                    consumed_by: Vec::new(),
                });
                produces.push(template_idx);
            }
            rules.push(RuleNode {
                name: name.clone(),
                produces,
                consumes: Vec::new(),
            });
        }

        // phase 2: link consumes against the produced-template index
        let mut roots = Vec::new();
        for (rule_idx, (name, builder_rule)) in self.rules.iter().enumerate() {
            if builder_rule.consumes.is_empty() {
                roots.push(rule_idx);
                continue;
            }
            for (is_all, consumed) in &builder_rule.consumes {
                let matches: Vec<TemplateIdx> = templates
                    .iter()
                    .enumerate()
                    .filter(|(_, node)| node.props.contains(consumed))
                    .map(|(idx, _)| idx)
                    .collect();
                if matches.is_empty() {
                    warn!(
                        rule = %name,
                        "consume matches no produced artifact template; rule can never run"
                    );
                }
                for template_idx in matches {
                    rules[rule_idx].consumes.push(ConsumeRel {
                        is_all: *is_all,
                        template: template_idx,
                    });
                    templates[template_idx].consumed_by.push(rule_idx);
                }
            }
        }

        Graph {
            rules,
            templates,
            roots,
        }
    }
}

/// The built graph. Rules are stored in name order, so index order is the
/// deterministic traversal order.
#[derive(Debug)]
pub struct Graph {
    rules: Vec<RuleNode>,
    templates: Vec<TemplateNode>,
    roots: Vec<RuleIdx>,
}

impl Graph {
    pub fn rules(&self) -> &[RuleNode] {
        &self.rules
    }

    pub fn templates(&self) -> &[TemplateNode] {
        &self.templates
    }

    pub fn roots(&self) -> &[RuleIdx] {
        &self.roots
    }

    pub fn rule(&self, idx: RuleIdx) -> &RuleNode {
        &self.rules[idx]
    }

    pub fn template(&self, idx: TemplateIdx) -> &TemplateNode {
        &self.templates[idx]
    }

    /// Visit every rule reachable from the roots, depth-first, in
    /// deterministic order.
    pub fn for_each_rule(&self, mut visit: impl FnMut(&RuleNode)) {
        let mut seen = vec![false; self.rules.len()];
        let mut stack: Vec<RuleIdx> = self.roots.iter().rev().copied().collect();
        while let Some(rule_idx) = stack.pop() {
            if std::mem::replace(&mut seen[rule_idx], true) {
                continue;
            }
            let rule = &self.rules[rule_idx];
            visit(rule);
            let mut children: Vec<RuleIdx> = rule
                .produces
                .iter()
                .flat_map(|t| self.templates[*t].consumed_by.iter().copied())
                .filter(|idx| !seen[*idx])
                .collect();
            children.sort_unstable();
            children.dedup();
            for child in children.into_iter().rev() {
                stack.push(child);
            }
        }
    }
}
