use std::path::Path;

use anyhow::{Context, Result};
use itertools::Itertools;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Keys a locator may live under in record-shaped work lists.
const LOCATOR_KEYS: &[&str] = &["url", "enlace", "link"];
/// Keys holding the child list in grouped work lists.
const CHILD_KEYS: &[&str] = &["productos", "products"];

#[derive(Debug, Error)]
pub enum WorkListError {
    #[error("work list must be a JSON array, got {0}")]
    NotAnArray(&'static str),
    #[error(
        "unrecognized work list shape: expected an array of URLs, an array of {{url}} objects, \
         or an array of groups with a 'productos' list"
    )]
    UnrecognizedShape,
    #[error("work list element {index} is {found}, but the list started as {expected}")]
    MixedShape {
        index: usize,
        found: &'static str,
        expected: &'static str,
    },
    #[error("work list has {0} entries but none carries a locator (url, enlace or link)")]
    NoLocators(usize),
}

/// The three accepted work-list documents, detected once at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkList {
    /// `["https://…", …]`
    Locators(Vec<String>),
    /// `[{"url": "https://…", …}, …]`
    Records(Vec<Value>),
    /// `[{"categoria": …, "productos": [{"url": …} | "https://…"]}, …]`
    Grouped(Vec<Value>),
}

impl WorkList {
    pub fn detect(doc: Value) -> Result<Self, WorkListError> {
        let items = match doc {
            Value::Array(items) => items,
            other => return Err(WorkListError::NotAnArray(json_kind(&other))),
        };

        let expected = match items.first() {
            None => return Ok(WorkList::Locators(Vec::new())),
            Some(first) => element_kind(first),
        };
        if expected == ElementKind::Other {
            return Err(WorkListError::UnrecognizedShape);
        }
        if let Some((index, found)) = items
            .iter()
            .map(element_kind)
            .enumerate()
            .find(|(_, kind)| *kind != expected)
        {
            return Err(WorkListError::MixedShape {
                index,
                found: found.describe(),
                expected: expected.describe(),
            });
        }

        let entries = items.len();
        let list = match expected {
            ElementKind::Locator => WorkList::Locators(
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            ElementKind::Group => WorkList::Grouped(items),
            _ => WorkList::Records(items),
        };
        if list.locators().is_empty() {
            return Err(WorkListError::NoLocators(entries));
        }
        Ok(list)
    }

    /// Flatten into locators, exact-duplicate free, in order of first occurrence.
    pub fn locators(&self) -> Vec<String> {
        let all: Vec<String> = match self {
            WorkList::Locators(urls) => urls.iter().filter_map(|s| non_empty(s)).collect(),
            WorkList::Records(records) => records.iter().filter_map(record_locator).collect(),
            WorkList::Grouped(groups) => groups
                .iter()
                .flat_map(|g| {
                    CHILD_KEYS
                        .iter()
                        .filter_map(|k| g.get(*k).and_then(Value::as_array))
                        .flatten()
                })
                .filter_map(|child| match child {
                    Value::String(s) => non_empty(s),
                    other => record_locator(other),
                })
                .collect(),
        };
        all.into_iter().unique().collect()
    }
}

/// Read a work-list document and return its locators.
pub fn load(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read work list {:?}", path))?;
    let doc: Value = serde_json::from_str(&text)
        .with_context(|| format!("Work list {:?} is not valid JSON", path))?;
    let list = WorkList::detect(doc).with_context(|| format!("Bad work list {:?}", path))?;
    let locators = list.locators();
    info!(path = ?path, shape = list.shape_name(), locators = locators.len(), "Loaded work list");
    Ok(locators)
}

impl WorkList {
    fn shape_name(&self) -> &'static str {
        match self {
            WorkList::Locators(_) => "locators",
            WorkList::Records(_) => "records",
            WorkList::Grouped(_) => "grouped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Locator,
    Record,
    Group,
    Other,
}

impl ElementKind {
    fn describe(self) -> &'static str {
        match self {
            ElementKind::Locator => "a URL string",
            ElementKind::Record => "a record object",
            ElementKind::Group => "a group with a product list",
            ElementKind::Other => "neither a URL nor an object",
        }
    }
}

fn element_kind(v: &Value) -> ElementKind {
    match v {
        Value::String(_) => ElementKind::Locator,
        Value::Object(_) if is_group(v) => ElementKind::Group,
        Value::Object(_) => ElementKind::Record,
        _ => ElementKind::Other,
    }
}

fn is_group(v: &Value) -> bool {
    CHILD_KEYS.iter().any(|k| v.get(*k).is_some_and(Value::is_array))
}

fn record_locator(v: &Value) -> Option<String> {
    LOCATOR_KEYS
        .iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str).and_then(non_empty))
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
