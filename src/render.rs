//! Template rendering
//!
//! Rule files substitute variables into shell fragments and output values
//! with `{{ ... }}` markers. The renderer exposes a single namespace:
//! `inputs.<binding>.<property>` resolves to the string value of that
//! property on the singleton artifact bound to `<binding>`; any bare name
//! resolves against the rule file's `let` variables.
//!
//! Multi-valued (`all`) bindings cannot be substituted into shell text;
//! they render as the empty string with a warning. Unknown names do the
//! same, so a typo produces visibly empty output rather than aborting a
//! half-finished run.

use crate::store::{BindingValue, Bindings};
use std::collections::BTreeMap;
use tracing::warn;

/// Expand every `{{ ... }}` marker in `template`.
pub fn expand(template: &str, vars: &BTreeMap<String, String>, inputs: &Bindings) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                out.push_str(&resolve(name, vars, inputs));
                rest = &after[end + 2..];
            }
            None => {
                // unterminated marker; emit the tail verbatim
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve(name: &str, vars: &BTreeMap<String, String>, inputs: &Bindings) -> String {
    if let Some(rest) = name.strip_prefix("inputs.") {
        let Some((binding, property)) = rest.split_once('.') else {
            warn!(name, "template variable must name a binding property");
            return String::new();
        };
        return match inputs.get(binding) {
            Some(BindingValue::Single(artifact)) => {
                match artifact.props.string_value(property) {
                    Some(value) => value.to_string(),
                    None => {
                        warn!(binding, property, "bound artifact has no such property");
                        String::new()
                    }
                }
            }
            Some(BindingValue::Set(_)) => {
                warn!(
                    binding,
                    "multi-valued bindings cannot be substituted into templates"
                );
                String::new()
            }
            None => {
                warn!(binding, "no such binding");
                String::new()
            }
        };
    }

    match vars.get(name) {
        Some(value) => value.clone(),
        None => {
            warn!(name, "undefined template variable");
            String::new()
        }
    }
}
