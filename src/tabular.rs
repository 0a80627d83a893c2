//! Ad-hoc tabular output for `ls`.
//!
//! Artifacts are flattened to string rows, optionally filtered, grouped and
//! projected, then printed. The brief format splits each group into the
//! properties shared by every row (printed once) and the distinct ones
//! (printed as an aligned table); json and csv formats are available for
//! machine consumption.

use crate::props::{FileId, PropertyValue};
use crate::store::{Artifact, FileEntry};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// One artifact flattened to displayable strings.
pub type Row = BTreeMap<String, String>;

/// Output format of `ls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Brief,
    Json,
    Csv,
    CsvNoHead,
}

/// Flatten an artifact; file-valued properties render as their local path.
pub fn artifact_row(artifact: &Artifact, files: &BTreeMap<FileId, FileEntry>) -> Row {
    artifact
        .props
        .iter()
        .map(|(name, value)| {
            let rendered = match value {
                PropertyValue::Literal(s) => s.clone(),
                PropertyValue::FileRef(id) => files
                    .get(id)
                    .map_or_else(|| format!("<file {id}>"), |entry| entry.local_path.clone()),
            };
            (name.to_string(), rendered)
        })
        .collect()
}

/// Keep rows matching every `name=value` pair.
pub fn filter_rows(rows: Vec<Row>, filters: &[(String, String)]) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| {
            filters
                .iter()
                .all(|(name, value)| row.get(name) == Some(value))
        })
        .collect()
}

/// Project each row onto the given fields.
pub fn select(rows: &[Row], fields: &[String]) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            fields
                .iter()
                .map(|field| {
                    (
                        field.clone(),
                        row.get(field).cloned().unwrap_or_default(),
                    )
                })
                .collect()
        })
        .collect()
}

fn select_without(rows: &[Row], omit: &str) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            row.iter()
                .filter(|(name, _)| name.as_str() != omit)
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        })
        .collect()
}

/// Group rows by a field's value; rows missing the field group under "".
pub fn group_by(rows: &[Row], field: &str) -> BTreeMap<String, Vec<Row>> {
    let mut groups: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    for row in rows {
        let key = row.get(field).cloned().unwrap_or_default();
        groups.entry(key).or_default().push(row.clone());
    }
    groups
}

/// Split fields into those whose value is identical across every row and
/// the rest.
pub fn shared_and_distinct_fields(rows: &[Row]) -> (Vec<String>, Vec<String>) {
    let mut values_per_field: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for row in rows {
        for (field, value) in row {
            values_per_field
                .entry(field)
                .or_default()
                .insert(value.as_str());
        }
    }
    let mut shared = Vec::new();
    let mut distinct = Vec::new();
    for (field, values) in values_per_field {
        // a field absent from some rows is not shared even with one value
        let everywhere = rows.iter().all(|row| row.contains_key(field));
        if values.len() == 1 && everywhere {
            shared.push(field.to_string());
        } else {
            distinct.push(field.to_string());
        }
    }
    (shared, distinct)
}

fn render_table(rows: &[Row], fields: &[String], padding: &str, out: &mut String) {
    let mut widths: Vec<usize> = fields.iter().map(String::len).collect();
    for row in rows {
        for (column, field) in fields.iter().enumerate() {
            let len = row.get(field).map_or(0, String::len);
            widths[column] = widths[column].max(len);
        }
    }

    out.push_str(padding);
    for (column, field) in fields.iter().enumerate() {
        let _ = write!(out, "{:>width$}  ", field, width = widths[column]);
    }
    out.push('\n');

    out.push_str(padding);
    for width in &widths {
        let _ = write!(out, "{}  ", "-".repeat(*width));
    }
    out.push('\n');

    for row in rows {
        out.push_str(padding);
        for (column, field) in fields.iter().enumerate() {
            let value = row.get(field).map_or("", String::as_str);
            let _ = write!(out, "{:>width$}  ", value, width = widths[column]);
        }
        out.push('\n');
    }
}

fn render_brief(rows: &[Row], out: &mut String) {
    if rows.is_empty() {
        return;
    }
    let (shared_fields, distinct_fields) = shared_and_distinct_fields(rows);
    if !shared_fields.is_empty() {
        let _ = writeln!(out, "  Properties shared by all {} rows:", rows.len());
        render_table(&rows[..1], &shared_fields, "    ", out);
    }
    if !distinct_fields.is_empty() {
        render_table(rows, &distinct_fields, "  ", out);
    }
}

/// Render rows in the requested format. Brief groups by `groupby`
/// (defaulting to `type`) and prints shared properties once per group.
pub fn render(rows: &[Row], format: Format, groupby: Option<&str>) -> String {
    let mut out = String::new();
    match format {
        Format::Brief => {
            let field = groupby.unwrap_or("type");
            for (key, group) in group_by(rows, field) {
                let _ = writeln!(out, "For {field}={key}:");
                render_brief(&select_without(&group, field), &mut out);
                out.push('\n');
            }
        }
        Format::Json => {
            let values: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    serde_json::Value::Object(
                        row.iter()
                            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                            .collect(),
                    )
                })
                .collect();
            out = serde_json::to_string_pretty(&values).expect("rows serialize");
            out.push('\n');
        }
        Format::Csv | Format::CsvNoHead => {
            let fields: Vec<String> = {
                let mut all: BTreeSet<String> = BTreeSet::new();
                for row in rows {
                    all.extend(row.keys().cloned());
                }
                all.into_iter().collect()
            };
            if format == Format::Csv {
                let _ = writeln!(out, "{}", fields.join(","));
            }
            for row in rows {
                let cells: Vec<String> = fields
                    .iter()
                    .map(|field| csv_escape(row.get(field).map_or("", String::as_str)))
                    .collect();
                let _ = writeln!(out, "{}", cells.join(","));
            }
        }
    }
    out
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_group_by() {
        let rows = vec![
            row(&[("type", "a"), ("v", "1")]),
            row(&[("type", "b"), ("v", "2")]),
            row(&[("type", "a"), ("v", "3")]),
        ];
        let groups = group_by(&rows, "type");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["a"].len(), 2);
        assert_eq!(groups["b"].len(), 1);
    }

    #[test]
    fn test_shared_and_distinct_fields() {
        let rows = vec![
            row(&[("type", "a"), ("v", "1"), ("run", "7")]),
            row(&[("type", "a"), ("v", "2"), ("run", "7")]),
        ];
        let (shared, distinct) = shared_and_distinct_fields(&rows);
        assert_eq!(shared, vec!["run", "type"]);
        assert_eq!(distinct, vec!["v"]);
    }

    #[test]
    fn test_field_absent_from_some_rows_is_distinct() {
        let rows = vec![row(&[("type", "a"), ("v", "1")]), row(&[("type", "a")])];
        let (shared, distinct) = shared_and_distinct_fields(&rows);
        assert_eq!(shared, vec!["type"]);
        assert_eq!(distinct, vec!["v"]);
    }

    #[test]
    fn test_filter_rows() {
        let rows = vec![
            row(&[("type", "a"), ("v", "1")]),
            row(&[("type", "a"), ("v", "2")]),
        ];
        let kept = filter_rows(rows, &[("v".to_string(), "2".to_string())]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["v"], "2");
    }

    #[test]
    fn test_select() {
        let rows = vec![row(&[("type", "a"), ("v", "1"), ("w", "x")])];
        let projected = select(&rows, &["v".to_string(), "missing".to_string()]);
        assert_eq!(projected[0].len(), 2);
        assert_eq!(projected[0]["v"], "1");
        assert_eq!(projected[0]["missing"], "");
    }

    #[test]
    fn test_render_csv() {
        let rows = vec![
            row(&[("a", "1"), ("b", "x,y")]),
            row(&[("a", "2"), ("b", "z")]),
        ];
        let csv = render(&rows, Format::Csv, None);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("a,b"));
        assert_eq!(lines.next(), Some("1,\"x,y\""));
        assert_eq!(lines.next(), Some("2,z"));

        let headless = render(&rows, Format::CsvNoHead, None);
        assert!(headless.starts_with("1,"));
    }

    #[test]
    fn test_render_json() {
        let rows = vec![row(&[("a", "1")])];
        let json = render(&rows, Format::Json, None);
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(parsed[0]["a"], "1");
    }

    #[test]
    fn test_render_brief_groups_by_type() {
        let rows = vec![
            row(&[("type", "a-out"), ("value", "1")]),
            row(&[("type", "a-out"), ("value", "2")]),
        ];
        let brief = render(&rows, Format::Brief, None);
        assert!(brief.contains("For type=a-out:"));
        assert!(brief.contains("value"));
        assert!(!brief.contains("a-out  "));
    }
}
