//! Versioned JSON persistence for script values.
//!
//! A document is `{"version": 1, "content": <tree>}`. The tree mirrors the
//! value kinds: `null`, booleans, integers, floats, strings, and tables as an
//! array of `{"key": <tree>, "value": <tree>}` entries so non-string keys
//! survive.

use std::io::{Read, Write};

use serde_json::{Map, Value as Json};

use super::value::{ScriptTable, ScriptValue, MAX_NESTING_DEPTH};
use crate::{HostError, Result};

/// Format version written by this build and the only one it reads.
pub const FORMAT_VERSION: u64 = 1;

const KEY_VERSION: &str = "version";
const KEY_CONTENT: &str = "content";
const KEY_ENTRY_KEY: &str = "key";
const KEY_ENTRY_VALUE: &str = "value";

struct Serializer {
    silent_fail: bool,
    open_tables: Vec<usize>,
}

impl Serializer {
    fn unsupported(&self, what: &str) -> Result<Option<Json>> {
        if self.silent_fail {
            Ok(None)
        } else {
            Err(HostError::Serialization(format!("cannot persist {what}")))
        }
    }

    fn value(&mut self, value: &ScriptValue) -> Result<Option<Json>> {
        match value {
            ScriptValue::Nil => Ok(Some(Json::Null)),
            ScriptValue::Boolean(b) => Ok(Some(Json::Bool(*b))),
            ScriptValue::Integer(i) => Ok(Some(Json::from(*i))),
            ScriptValue::Float(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => Ok(Some(Json::Number(n))),
                None => self.unsupported(&format!("non-finite number {f}")),
            },
            ScriptValue::String(s) => Ok(Some(Json::String(s.clone()))),
            ScriptValue::Table(table) => self.table(table),
            ScriptValue::Opaque(name) => self.unsupported(&format!("value of type {name}")),
        }
    }

    fn table(&mut self, table: &ScriptTable) -> Result<Option<Json>> {
        // A table already open on the current path is a cycle; leave it out.
        if self.open_tables.contains(&table.id()) {
            return Ok(None);
        }
        if self.open_tables.len() >= MAX_NESTING_DEPTH {
            return self.unsupported(&format!(
                "tables nested deeper than {MAX_NESTING_DEPTH} levels"
            ));
        }

        self.open_tables.push(table.id());
        let result = self.entries(table);
        self.open_tables.pop();

        result.map(|entries| Some(Json::Array(entries)))
    }

    fn entries(&mut self, table: &ScriptTable) -> Result<Vec<Json>> {
        let mut entries = Vec::with_capacity(table.len());

        for (key, value) in table.entries() {
            let Some(key) = self.value(&key)? else {
                continue;
            };
            let Some(value) = self.value(&value)? else {
                continue;
            };
            let mut entry = Map::new();
            entry.insert(KEY_ENTRY_KEY.to_string(), key);
            entry.insert(KEY_ENTRY_VALUE.to_string(), value);
            entries.push(Json::Object(entry));
        }

        Ok(entries)
    }
}

/// Serialize a value to its tree form.
///
/// Returns `Ok(None)` when the value is left out: a cycle, or an unsupported
/// value with `silent_fail` set. Without `silent_fail`, functions, userdata,
/// threads, non-finite numbers and tables nested deeper than
/// [`MAX_NESTING_DEPTH`] anywhere in the value are an error.
pub fn serialize(value: &ScriptValue, silent_fail: bool) -> Result<Option<Json>> {
    Serializer {
        silent_fail,
        open_tables: Vec::new(),
    }
    .value(value)
}

/// Rebuild a value from its tree form.
pub fn deserialize(tree: &Json) -> Result<ScriptValue> {
    deserialize_at(tree, 0)
}

fn deserialize_at(tree: &Json, depth: usize) -> Result<ScriptValue> {
    Ok(match tree {
        Json::Null => ScriptValue::Nil,
        Json::Bool(b) => ScriptValue::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => ScriptValue::Integer(i),
            None => match n.as_f64() {
                Some(f) => ScriptValue::Float(f),
                None => {
                    return Err(HostError::Serialization(format!("unreadable number {n}")));
                }
            },
        },
        Json::String(s) => ScriptValue::String(s.clone()),
        Json::Array(_) if depth >= MAX_NESTING_DEPTH => {
            return Err(HostError::Serialization(format!(
                "tables nested deeper than {MAX_NESTING_DEPTH} levels"
            )));
        }
        Json::Array(entries) => ScriptValue::Table(deserialize_entries(entries, depth + 1)?),
        Json::Object(_) => {
            return Err(HostError::Serialization(
                "tables must be stored as entry arrays".to_string(),
            ));
        }
    })
}

fn deserialize_entries(entries: &[Json], depth: usize) -> Result<ScriptTable> {
    let table = ScriptTable::new();

    for entry in entries {
        let Json::Object(fields) = entry else {
            return Err(HostError::Serialization(format!(
                "table entry is not an object: {entry}"
            )));
        };
        let key = field(fields, KEY_ENTRY_KEY, depth)?;
        let value = field(fields, KEY_ENTRY_VALUE, depth)?;
        if key.is_nil() || value.is_nil() {
            continue;
        }
        table.set(key, value);
    }

    Ok(table)
}

fn field(fields: &Map<String, Json>, name: &str, depth: usize) -> Result<ScriptValue> {
    match fields.get(name) {
        Some(tree) => deserialize_at(tree, depth),
        None => Ok(ScriptValue::Nil),
    }
}

/// Wrap a value in a versioned document.
pub fn to_document(value: &ScriptValue, silent_fail: bool) -> Result<Json> {
    let mut document = Map::new();
    document.insert(KEY_VERSION.to_string(), Json::from(FORMAT_VERSION));
    if let Some(content) = serialize(value, silent_fail)? {
        document.insert(KEY_CONTENT.to_string(), content);
    }
    Ok(Json::Object(document))
}

/// Read a value back from a versioned document.
///
/// A document without content holds nil.
pub fn from_document(document: &Json) -> Result<ScriptValue> {
    let Json::Object(fields) = document else {
        return Err(HostError::Serialization(
            "persisted document is not an object".to_string(),
        ));
    };

    let version = fields.get(KEY_VERSION);
    if version.and_then(Json::as_u64) != Some(FORMAT_VERSION) {
        return Err(HostError::VersionMismatch {
            expected: FORMAT_VERSION,
            found: version.map_or_else(|| "none".to_string(), Json::to_string),
        });
    }

    match fields.get(KEY_CONTENT) {
        Some(content) => deserialize(content),
        None => Ok(ScriptValue::Nil),
    }
}

/// Encode a value as a document string.
pub fn to_string(value: &ScriptValue, silent_fail: bool) -> Result<String> {
    Ok(serde_json::to_string(&to_document(value, silent_fail)?)?)
}

/// Decode a value from a document string.
pub fn from_str(text: &str) -> Result<ScriptValue> {
    let document: Json = serde_json::from_str(text)?;
    from_document(&document)
}

/// Write a value as a document to `writer`.
pub fn write_document(writer: impl Write, value: &ScriptValue, silent_fail: bool) -> Result<()> {
    serde_json::to_writer(writer, &to_document(value, silent_fail)?)?;
    Ok(())
}

/// Read a document from `reader`.
pub fn read_document(reader: impl Read) -> Result<ScriptValue> {
    let document: Json = serde_json::from_reader(reader)?;
    from_document(&document)
}

/// Copy a value through the persistence format.
///
/// The copy shares nothing with the original; cyclic parts are dropped and
/// unsupported parts follow `silent_fail`.
pub fn deep_clone(value: &ScriptValue, silent_fail: bool) -> Result<ScriptValue> {
    from_document(&to_document(value, silent_fail)?)
}

/// Compact rendering for logs; never fails.
pub fn describe(value: &ScriptValue) -> String {
    match serialize(value, true) {
        Ok(Some(tree)) => tree.to_string(),
        Ok(None) => "<omitted>".to_string(),
        Err(e) => format!("<{e}>"),
    }
}
