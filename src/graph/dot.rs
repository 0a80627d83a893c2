//! Graphviz export of the rule/artifact-template graph.
//!
//! One node per rule, one box node per artifact template, one directed edge
//! per produce (rule → artifact) and consume (artifact → rule) relation.

use super::Graph;
use std::io::{self, Write};

impl Graph {
    /// Write the graph in DOT form.
    pub fn write_dot(&self, writer: &mut impl Write) -> io::Result<()> {
        writeln!(writer, "digraph {{")?;

        for (idx, rule) in self.rules().iter().enumerate() {
            writeln!(writer, "rule_{idx} [label=\"{}\"];", rule.name)?;
        }
        for (idx, template) in self.templates().iter().enumerate() {
            let label = template.props.get("type").unwrap_or("artifact");
            writeln!(writer, "artifact_{idx} [label=\"{label}\", shape=box];")?;
        }

        for (rule_idx, rule) in self.rules().iter().enumerate() {
            for template_idx in &rule.produces {
                writeln!(writer, "rule_{rule_idx} -> artifact_{template_idx};")?;
            }
            for rel in &rule.consumes {
                writeln!(writer, "artifact_{} -> rule_{rule_idx};", rel.template)?;
            }
        }

        writeln!(writer, "}}")
    }

    /// The DOT form as a string.
    pub fn to_dot(&self) -> String {
        let mut buf = Vec::new();
        self.write_dot(&mut buf).expect("writing to a Vec cannot fail");
        String::from_utf8(buf).expect("DOT output is UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::{GraphBuilder, PropsTemplate};

    #[test]
    fn test_dot_export() {
        let mut gb = GraphBuilder::new();
        gb.add_rule("a");
        gb.add_produces("a", PropsTemplate::from([("type", "a-out")]));
        gb.add_rule("b");
        gb.add_consumes("b", false, PropsTemplate::from([("type", "a-out")]));
        let dot = gb.build().to_dot();

        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("rule_0 [label=\"a\"];"));
        assert!(dot.contains("rule_1 [label=\"b\"];"));
        assert!(dot.contains("[label=\"a-out\", shape=box];"));
        assert!(dot.contains("rule_0 -> artifact_0;"));
        assert!(dot.contains("artifact_0 -> rule_1;"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_dot_untyped_template_label() {
        let mut gb = GraphBuilder::new();
        gb.add_produces("a", PropsTemplate::from([("name", "x")]));
        let dot = gb.build().to_dot();
        assert!(dot.contains("[label=\"artifact\", shape=box];"));
    }
}
