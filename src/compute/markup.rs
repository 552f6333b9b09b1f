//! Structured-text computes: Json2Csv and Xml2Csv
//!
//! Both read the table's raw protocol output, flatten the selected records into
//! rows and replace the table (and its raw data) with the result. A document that
//! does not parse, or a record path that selects nothing, leaves the table as it
//! was.

use roxmltree::{Document, Node, ParsingOptions};
use serde_json::Value;

use crate::table::{SourceTable, TABLE_SEP};

use super::Step;

/// One row per element of the array found at `entry_key` (a JSON pointer)
///
/// Row layout: `[<pointer>[i], property 1, property 2, ...]`. Properties are
/// `;`-separated, each a `/`-separated path inside the element.
pub(super) fn json_to_csv(
    table: &mut SourceTable,
    entry_key: &str,
    properties: &str,
    separator: &str,
    step: &mut Step<'_>,
) {
    let Some(raw) = table.raw_data.as_deref() else {
        step.warn("no raw data to convert");
        return;
    };

    let document: Value = match serde_json::from_str(raw) {
        Ok(document) => document,
        Err(e) => {
            step.warn(format!("invalid JSON: {e}"));
            return;
        }
    };

    let pointer = match entry_key.trim() {
        "" | "/" => "",
        key => key,
    };
    let Some(entry) = document.pointer(pointer) else {
        step.warn(format!("no entry at '{entry_key}'"));
        return;
    };

    let properties: Vec<String> = properties
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("/{}", p.trim_start_matches('/')))
        .collect();

    let records: Vec<(String, &Value)> = match entry {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| (format!("{pointer}[{i}]"), item))
            .collect(),
        other => vec![(pointer.to_string(), other)],
    };

    let rows: Vec<Vec<String>> = records
        .into_iter()
        .map(|(path, record)| {
            std::iter::once(path)
                .chain(
                    properties
                        .iter()
                        .map(|p| record.pointer(p).map(render_json).unwrap_or_default()),
                )
                .collect()
        })
        .collect();

    table.raw_data = Some(join_rows(&rows, separator));
    table.rows = rows;
}

fn render_json(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join_rows(rows: &[Vec<String>], separator: &str) -> String {
    rows.iter()
        .map(|row| format!("{}{separator}\n", row.join(separator)))
        .collect()
}

/// One row per element at `record_tag` (e.g. `/configResolveClass/outConfigs/item`)
///
/// Properties are `;`-separated, each one of:
/// - `path` - text of the element at the relative `a/b` path
/// - `path>attr` - attribute of that element
/// - `>attr` - attribute of the record element itself
pub(super) fn xml_to_csv(
    table: &mut SourceTable,
    record_tag: &str,
    properties: &str,
    step: &mut Step<'_>,
) {
    let Some(raw) = table.raw_data.as_deref() else {
        step.warn("no raw data to convert");
        return;
    };
    if record_tag.trim().is_empty() || properties.trim().is_empty() {
        step.warn("xml2Csv needs a record tag and properties");
        return;
    }

    let rows = match xml_rows(raw, record_tag, properties) {
        Ok(rows) => rows,
        Err(e) => {
            step.warn(format!("invalid XML: {e}"));
            return;
        }
    };

    table.raw_data = Some(join_rows(&rows, TABLE_SEP));
    table.rows = rows;
}

fn xml_rows(raw: &str, record_tag: &str, properties: &str) -> Result<Vec<Vec<String>>, roxmltree::Error> {
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    let document = Document::parse_with_options(raw, options)?;
    let root = document.root_element();

    let path: Vec<&str> = record_tag.split('/').filter(|s| !s.is_empty()).collect();
    let records = match path.split_first() {
        Some((first, rest)) if root.tag_name().name() == *first => follow(root, rest),
        _ => Vec::new(),
    };

    Ok(records
        .into_iter()
        .map(|record| {
            properties
                .split(';')
                .map(|property| xml_property(record, property.trim()))
                .collect()
        })
        .collect())
}

fn xml_property(record: Node<'_, '_>, property: &str) -> String {
    let (path, attribute) = match property.split_once('>') {
        Some((path, attribute)) => (path, Some(attribute.trim())),
        None => (property, None),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some(element) = follow(record, &segments).into_iter().next() else {
        return String::new();
    };

    match attribute {
        Some(name) => element
            .attributes()
            .find(|a| a.name().eq_ignore_ascii_case(name))
            .map(|a| a.value().to_string())
            .unwrap_or_default(),
        None => element
            .children()
            .filter(Node::is_text)
            .filter_map(|n| n.text())
            .collect::<String>()
            .trim()
            .to_string(),
    }
}

/// Every element reached by following `path` (local names) down from `start`
fn follow<'a, 'input>(start: Node<'a, 'input>, path: &[&str]) -> Vec<Node<'a, 'input>> {
    let mut current = vec![start];
    for segment in path {
        current = current
            .into_iter()
            .flat_map(|node| {
                node.children()
                    .filter(move |c| c.is_element() && c.tag_name().name() == *segment)
            })
            .collect();
    }
    current
}
