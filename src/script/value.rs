//! Host-side model of script values.
//!
//! [`ScriptValue`] mirrors the dynamic value kinds of the sandboxed language
//! independently of the interpreter, so the persistence codec and the host
//! bridge can work on plain Rust data. Tables keep reference identity: two
//! handles to the same table share their entries, and converting a cyclic or
//! shared Lua table preserves that shape.
//!
//! Conversions refuse tables nested deeper than the sandbox's nesting limit
//! (see [`NestingLimit`]), so a script cannot exhaust the host stack.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;

use mlua::{FromLua, IntoLua, Lua, Table, Value};

/// A script value.
#[derive(Clone)]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Text. Lua strings that are not valid UTF-8 are converted lossily,
    /// each invalid sequence becoming U+FFFD.
    String(String),
    Table(ScriptTable),
    /// A value the host cannot look into (function, userdata, thread).
    Opaque(&'static str),
}

impl ScriptValue {
    /// Name of the value's kind, as the script would see it.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Boolean(_) => "boolean",
            ScriptValue::Integer(_) | ScriptValue::Float(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Table(_) => "table",
            ScriptValue::Opaque(name) => *name,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_table(&self) -> Option<&ScriptTable> {
        match self {
            ScriptValue::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integral value, accepting floats without a fractional part.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScriptValue::Integer(i) => Some(*i),
            ScriptValue::Float(f) => float_to_integer(*f),
            _ => None,
        }
    }

    /// Normalize a value for use as a table key.
    ///
    /// Returns `None` for keys a table cannot hold (nil and NaN).
    fn into_key(self) -> Option<ScriptValue> {
        match self {
            ScriptValue::Nil => None,
            ScriptValue::Float(f) if f.is_nan() => None,
            ScriptValue::Float(f) => Some(match float_to_integer(f) {
                Some(i) => ScriptValue::Integer(i),
                None => ScriptValue::Float(f),
            }),
            other => Some(other),
        }
    }

    /// Lookup slot of a normalized key: primitives by value, tables by
    /// identity. Opaque keys have none and can never be found again.
    fn slot(&self) -> Option<KeySlot> {
        match self {
            ScriptValue::Boolean(b) => Some(KeySlot::Boolean(*b)),
            ScriptValue::Integer(i) => Some(KeySlot::Integer(*i)),
            ScriptValue::Float(f) => Some(KeySlot::Float(f.to_bits())),
            ScriptValue::String(s) => Some(KeySlot::String(s.clone())),
            ScriptValue::Table(t) => Some(KeySlot::Table(t.id())),
            ScriptValue::Nil | ScriptValue::Opaque(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeySlot {
    Boolean(bool),
    Integer(i64),
    Float(u64),
    String(String),
    Table(usize),
}

fn float_to_integer(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Boolean(b)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        ScriptValue::Integer(i)
    }
}

impl From<f64> for ScriptValue {
    fn from(f: f64) -> Self {
        ScriptValue::Float(f)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<ScriptTable> for ScriptValue {
    fn from(t: ScriptTable) -> Self {
        ScriptValue::Table(t)
    }
}

/// Structural equality. Integers and floats are distinct kinds; tables are
/// equal when they hold the same set of entries, regardless of order.
///
/// Comparing tables that contain themselves does not terminate.
impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Nil, ScriptValue::Nil) => true,
            (ScriptValue::Boolean(a), ScriptValue::Boolean(b)) => a == b,
            (ScriptValue::Integer(a), ScriptValue::Integer(b)) => a == b,
            (ScriptValue::Float(a), ScriptValue::Float(b)) => a == b,
            (ScriptValue::String(a), ScriptValue::String(b)) => a == b,
            (ScriptValue::Table(a), ScriptValue::Table(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => f.write_str("nil"),
            ScriptValue::Boolean(b) => write!(f, "{b}"),
            ScriptValue::Integer(i) => write!(f, "{i}"),
            ScriptValue::Float(x) => write!(f, "{x:?}"),
            ScriptValue::String(s) => write!(f, "{s:?}"),
            ScriptValue::Table(t) => t.fmt(f),
            ScriptValue::Opaque(name) => write!(f, "<{name}>"),
        }
    }
}

#[derive(Default)]
struct Entries {
    list: Vec<(ScriptValue, ScriptValue)>,
    index: HashMap<KeySlot, usize>,
}

impl Entries {
    fn get(&self, slot: &KeySlot) -> Option<&ScriptValue> {
        self.index.get(slot).map(|&i| &self.list[i].1)
    }

    fn remove(&mut self, slot: &KeySlot) {
        let Some(i) = self.index.remove(slot) else {
            return;
        };
        self.list.swap_remove(i);
        if let Some(moved) = self.list.get(i).and_then(|(key, _)| key.slot()) {
            self.index.insert(moved, i);
        }
    }
}

/// A reference-counted table of key/value entries.
#[derive(Clone, Default)]
pub struct ScriptTable {
    entries: Rc<RefCell<Entries>>,
}

impl ScriptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sequence table with keys `1..=n`.
    pub fn from_sequence(values: impl IntoIterator<Item = ScriptValue>) -> Self {
        let table = Self::new();
        for (i, value) in values.into_iter().enumerate() {
            table.set(ScriptValue::Integer(i as i64 + 1), value);
        }
        table
    }

    /// Look up `key`.
    pub fn get(&self, key: impl Into<ScriptValue>) -> ScriptValue {
        let Some(slot) = key.into().into_key().and_then(|key| key.slot()) else {
            return ScriptValue::Nil;
        };
        self.entries
            .borrow()
            .get(&slot)
            .cloned()
            .unwrap_or(ScriptValue::Nil)
    }

    /// Assign `key`; a nil value removes the entry. Invalid keys are ignored.
    pub fn set(&self, key: impl Into<ScriptValue>, value: impl Into<ScriptValue>) {
        let Some(key) = key.into().into_key() else {
            return;
        };
        let value = value.into();
        let mut entries = self.entries.borrow_mut();

        let Some(slot) = key.slot() else {
            if !value.is_nil() {
                entries.list.push((key, value));
            }
            return;
        };

        match (entries.index.get(&slot).copied(), value) {
            (Some(_), ScriptValue::Nil) => entries.remove(&slot),
            (Some(i), value) => entries.list[i].1 = value,
            (None, ScriptValue::Nil) => {}
            (None, value) => {
                let position = entries.list.len();
                entries.index.insert(slot, position);
                entries.list.push((key, value));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().list.is_empty()
    }

    /// Snapshot of the entries, in insertion order until one is removed.
    pub fn entries(&self) -> Vec<(ScriptValue, ScriptValue)> {
        self.entries.borrow().list.clone()
    }

    /// Values at keys `1, 2, ...` up to the first gap.
    pub fn sequence(&self) -> Vec<ScriptValue> {
        let mut values = Vec::new();
        loop {
            let value = self.get(ScriptValue::Integer(values.len() as i64 + 1));
            if value.is_nil() {
                return values;
            }
            values.push(value);
        }
    }

    /// Whether both handles refer to the same table.
    pub fn ptr_eq(&self, other: &ScriptTable) -> bool {
        Rc::ptr_eq(&self.entries, &other.entries)
    }

    /// Identity of the table, stable while any handle is alive.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.entries) as *const () as usize
    }
}

impl PartialEq for ScriptTable {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let ours = self.entries.borrow();
        let theirs = other.entries.borrow();
        ours.list.len() == theirs.list.len()
            && ours.list.iter().all(|(k, v)| match k.slot() {
                // Table keys compare structurally here, so they cannot use the index.
                Some(slot) if !matches!(slot, KeySlot::Table(_)) => {
                    theirs.get(&slot).is_some_and(|found| found == v)
                }
                _ => theirs.list.iter().any(|(k2, v2)| k == k2 && v == v2),
            })
    }
}

impl fmt::Debug for ScriptTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: {:#x} ({} entries)", self.id(), self.len())
    }
}

/// Deepest table nesting any conversion accepts.
///
/// A persisted document spends two JSON levels per table, which keeps every
/// value within this limit readable by `serde_json`.
pub const MAX_NESTING_DEPTH: usize = 60;

/// Table nesting limit of one interpreter, stored as its app data.
///
/// Interpreters without one use [`MAX_NESTING_DEPTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestingLimit(pub usize);

impl NestingLimit {
    fn of(lua: &Lua) -> usize {
        lua.app_data_ref::<NestingLimit>()
            .map_or(MAX_NESTING_DEPTH, |limit| limit.0)
    }
}

fn too_deep(limit: usize) -> mlua::Error {
    mlua::Error::RuntimeError(format!("tables nested deeper than {limit} levels"))
}

/// Converts a Lua value, sharing one host table per distinct Lua table.
struct FromLuaState {
    tables: HashMap<*const c_void, ScriptTable>,
    depth: usize,
    max_depth: usize,
}

impl FromLuaState {
    fn new(max_depth: usize) -> Self {
        Self {
            tables: HashMap::new(),
            depth: 0,
            max_depth,
        }
    }

    fn convert(&mut self, value: Value) -> mlua::Result<ScriptValue> {
        Ok(match value {
            Value::Nil => ScriptValue::Nil,
            Value::Boolean(b) => ScriptValue::Boolean(b),
            Value::Integer(i) => ScriptValue::Integer(i),
            Value::Number(n) => ScriptValue::Float(n),
            Value::String(s) => ScriptValue::String(s.to_string_lossy().to_string()),
            Value::Table(table) => ScriptValue::Table(self.convert_table(table)?),
            other => ScriptValue::Opaque(other.type_name()),
        })
    }

    fn convert_table(&mut self, table: Table) -> mlua::Result<ScriptTable> {
        let pointer = table.to_pointer();
        if let Some(existing) = self.tables.get(&pointer) {
            return Ok(existing.clone());
        }
        if self.depth >= self.max_depth {
            return Err(too_deep(self.max_depth));
        }

        let converted = ScriptTable::new();
        self.tables.insert(pointer, converted.clone());

        self.depth += 1;
        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let key = self.convert(key)?;
            let value = self.convert(value)?;
            converted.set(key, value);
        }
        self.depth -= 1;

        Ok(converted)
    }
}

/// Converts a host value, creating one Lua table per distinct host table.
struct IntoLuaState<'lua> {
    lua: &'lua Lua,
    tables: HashMap<usize, Table>,
    depth: usize,
    max_depth: usize,
}

impl IntoLuaState<'_> {
    fn convert(&mut self, value: &ScriptValue) -> mlua::Result<Value> {
        Ok(match value {
            ScriptValue::Nil | ScriptValue::Opaque(_) => Value::Nil,
            ScriptValue::Boolean(b) => Value::Boolean(*b),
            ScriptValue::Integer(i) => Value::Integer(*i),
            ScriptValue::Float(f) => Value::Number(*f),
            ScriptValue::String(s) => Value::String(self.lua.create_string(s)?),
            ScriptValue::Table(table) => Value::Table(self.convert_table(table)?),
        })
    }

    fn convert_table(&mut self, table: &ScriptTable) -> mlua::Result<Table> {
        if let Some(existing) = self.tables.get(&table.id()) {
            return Ok(existing.clone());
        }
        if self.depth >= self.max_depth {
            return Err(too_deep(self.max_depth));
        }

        let converted = self.lua.create_table()?;
        self.tables.insert(table.id(), converted.clone());

        self.depth += 1;
        for (key, value) in table.entries() {
            let key = self.convert(&key)?;
            let value = self.convert(&value)?;
            if !key.is_nil() {
                converted.raw_set(key, value)?;
            }
        }
        self.depth -= 1;

        Ok(converted)
    }
}

impl FromLua for ScriptValue {
    fn from_lua(value: Value, lua: &Lua) -> mlua::Result<Self> {
        FromLuaState::new(NestingLimit::of(lua)).convert(value)
    }
}

impl IntoLua for ScriptValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        IntoLuaState {
            lua,
            tables: HashMap::new(),
            depth: 0,
            max_depth: NestingLimit::of(lua),
        }
        .convert(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_and_nil_removes() {
        let t = ScriptTable::new();
        t.set("a", 1i64);
        t.set("a", 2i64);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("a"), ScriptValue::Integer(2));

        t.set("a", ScriptValue::Nil);
        assert!(t.is_empty());
    }

    #[test]
    fn test_integral_float_keys_normalize() {
        let t = ScriptTable::new();
        t.set(1.0, "one");
        assert_eq!(t.get(1i64), ScriptValue::from("one"));
        t.set(ScriptValue::Nil, "ignored");
        t.set(f64::NAN, "ignored");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_table_equality_ignores_order() {
        let a = ScriptTable::new();
        a.set("x", 1i64);
        a.set("y", true);
        let b = ScriptTable::new();
        b.set("y", true);
        b.set("x", 1i64);
        assert_eq!(ScriptValue::Table(a.clone()), ScriptValue::Table(b.clone()));

        b.set("x", 1.0);
        assert_ne!(ScriptValue::Table(a), ScriptValue::Table(b));
    }

    #[test]
    fn test_sequence() {
        let t = ScriptTable::from_sequence([ScriptValue::from("a"), ScriptValue::from("b")]);
        t.set(4i64, "gap");
        assert_eq!(t.sequence(), vec![ScriptValue::from("a"), ScriptValue::from("b")]);
    }

    #[test]
    fn test_lua_round_trip_preserves_identity() {
        let lua = Lua::new();
        let value: ScriptValue = lua
            .load("local shared = {1} local t = {a = shared, b = shared} t.self = t return t")
            .eval()
            .unwrap();

        let root = value.as_table().unwrap();
        let a = root.get("a");
        let b = root.get("b");
        assert!(a.as_table().unwrap().ptr_eq(b.as_table().unwrap()));
        assert!(root.get("self").as_table().unwrap().ptr_eq(root));

        lua.globals().set("t", value).unwrap();
        let same: bool = lua.load("return t.a == t.b and t.self == t").eval().unwrap();
        assert!(same);
    }

    #[test]
    fn test_functions_become_opaque() {
        let lua = Lua::new();
        let value: ScriptValue = lua.load("return {f = print}").eval().unwrap();
        assert!(matches!(value.as_table().unwrap().get("f"), ScriptValue::Opaque("function")));
    }

    #[test]
    fn test_removal_keeps_index_consistent() {
        let t = ScriptTable::new();
        t.set("a", 1i64);
        t.set("b", 2i64);
        t.set("c", 3i64);
        t.set("a", ScriptValue::Nil);

        assert_eq!(t.len(), 2);
        assert_eq!(t.get("b"), ScriptValue::Integer(2));
        assert_eq!(t.get("c"), ScriptValue::Integer(3));
        t.set("c", 30i64);
        assert_eq!(t.get("c"), ScriptValue::Integer(30));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_table_keys_match_by_identity() {
        let key = ScriptTable::new();
        let t = ScriptTable::new();
        t.set(key.clone(), "found");

        assert_eq!(t.get(key), ScriptValue::from("found"));
        assert!(t.get(ScriptTable::new()).is_nil());
    }

    #[test]
    fn test_large_table_converts_in_linear_time() {
        let lua = Lua::new();
        let started = std::time::Instant::now();
        let value: ScriptValue = lua
            .load("local t = {} for i = 1, 50000 do t[i] = i t['k' .. i] = i end return t")
            .eval()
            .unwrap();

        let table = value.as_table().unwrap();
        assert_eq!(table.len(), 100_000);
        assert_eq!(table.get("k50000"), ScriptValue::Integer(50_000));
        lua.globals().set("t", value).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn test_deep_nesting_is_a_catchable_error() {
        let lua = Lua::new();
        lua.globals()
            .set(
                "capture",
                lua.create_function(|_, _value: ScriptValue| Ok(())).unwrap(),
            )
            .unwrap();

        let (ok, message): (bool, String) = lua
            .load(
                "local t = {} for i = 1, 200000 do t = {t} end \
                 local ok, err = pcall(capture, t) return ok, tostring(err)",
            )
            .eval()
            .unwrap();

        assert!(!ok);
        assert!(message.contains("nested deeper than"), "{message}");
    }

    #[test]
    fn test_nesting_limit_from_app_data() {
        let lua = Lua::new();
        lua.set_app_data(NestingLimit(2));

        let shallow: mlua::Result<ScriptValue> = lua.load("return {{}}").eval();
        assert!(shallow.is_ok());
        let deep: mlua::Result<ScriptValue> = lua.load("return {{{}}}").eval();
        assert!(deep.is_err());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let lua = Lua::new();
        let value: ScriptValue = lua.load(r#"return "ok\255""#).eval().unwrap();
        assert_eq!(value, ScriptValue::from("ok\u{FFFD}"));
    }
}
