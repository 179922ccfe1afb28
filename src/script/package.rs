//! Isolated module system.
//!
//! Replaces Lua's `package` library with one whose searchers only look at
//! `package.preload` and at a [`DataSource`], never the host filesystem or
//! native libraries. The module cache lives in the environment's own
//! `package.loaded` table.

use mlua::{ChunkMode, Function, Lua, Table, Value};
use tracing::debug;

use crate::source::DataSource;

/// Registry slot of the environment's `package` table.
const PACKAGE_KEY: &str = "gamehost.package";

/// Registry slot of the "currently loading" marker stored in `package.loaded`.
const LOADING_KEY: &str = "gamehost.package.loading";

/// Standard libraries also reachable through `require`.
const BUILTIN_LIBRARIES: [&str; 5] = ["coroutine", "table", "string", "utf8", "math"];

/// Install `package` and `require` into `lua`, resolving modules against `source`.
pub(crate) fn install(lua: &Lua, source: DataSource, search_path: &str) -> mlua::Result<()> {
    let globals = lua.globals();
    let package = lua.create_table()?;
    let loaded = lua.create_table()?;

    loaded.raw_set("_G", globals.clone())?;
    for name in BUILTIN_LIBRARIES {
        let library: Value = globals.raw_get(name)?;
        if !library.is_nil() {
            loaded.raw_set(name, library)?;
        }
    }

    package.raw_set("loaded", loaded)?;
    package.raw_set("preload", lua.create_table()?)?;
    package.raw_set("path", search_path)?;
    package.raw_set("config", "/\n;\n?\n!\n-\n")?;

    let search_source = source.clone();
    package.raw_set(
        "searchpath",
        lua.create_function(
            move |_, (name, path, sep, rep): (String, String, Option<String>, Option<String>)| {
                let sep = sep.unwrap_or_else(|| ".".to_string());
                let rep = rep.unwrap_or_else(|| "/".to_string());
                let found = search(&name, &path, &sep, &rep, |candidate| {
                    search_source.read(candidate).map(|_| ())
                });
                match found {
                    Ok((file, ())) => Ok((Some(file), None)),
                    Err(tried) => Ok((None, Some(tried))),
                }
            },
        )?,
    )?;

    lua.set_named_registry_value(PACKAGE_KEY, package.clone())?;
    lua.set_named_registry_value(LOADING_KEY, lua.create_table()?)?;
    globals.raw_set("package", package)?;

    let require = lua.create_function(move |lua, name: String| require(lua, &source, name))?;
    globals.raw_set("require", require)?;

    Ok(())
}

/// Make `module` the result of `require(name)` without running any loader.
pub(crate) fn register_loaded(lua: &Lua, name: &str, module: Value) -> mlua::Result<()> {
    let package: Table = lua.named_registry_value(PACKAGE_KEY)?;
    let loaded: Table = package.get("loaded")?;
    loaded.raw_set(name, module)
}

/// Register `loader` in `package.preload`.
pub(crate) fn register_preload(lua: &Lua, name: &str, loader: Function) -> mlua::Result<()> {
    let package: Table = lua.named_registry_value(PACKAGE_KEY)?;
    let preload: Table = package.get("preload")?;
    preload.raw_set(name, loader)
}

fn is_loading_marker(lua: &Lua, value: &Value) -> mlua::Result<bool> {
    let Value::Table(table) = value else {
        return Ok(false);
    };
    let marker: Table = lua.named_registry_value(LOADING_KEY)?;
    Ok(table.to_pointer() == marker.to_pointer())
}

fn require(lua: &Lua, source: &DataSource, name: String) -> mlua::Result<Value> {
    let package: Table = lua.named_registry_value(PACKAGE_KEY)?;
    let loaded: Table = package.get("loaded")?;

    let cached: Value = loaded.raw_get(name.as_str())?;
    if is_loading_marker(lua, &cached)? {
        return Err(mlua::Error::RuntimeError(format!(
            "loop or previous error loading module '{name}'"
        )));
    }
    if !matches!(cached, Value::Nil | Value::Boolean(false)) {
        return Ok(cached);
    }

    let (loader, extra) = find_loader(lua, &package, source, &name)?;

    let marker: Table = lua.named_registry_value(LOADING_KEY)?;
    loaded.raw_set(name.as_str(), marker)?;

    debug!(module = %name, "loading module");
    let result: Value = loader.call((name.as_str(), extra))?;

    if !result.is_nil() {
        loaded.raw_set(name.as_str(), result)?;
    }
    let stored: Value = loaded.raw_get(name.as_str())?;
    if stored.is_nil() || is_loading_marker(lua, &stored)? {
        loaded.raw_set(name.as_str(), true)?;
        return Ok(Value::Boolean(true));
    }
    Ok(stored)
}

fn find_loader(
    lua: &Lua,
    package: &Table,
    source: &DataSource,
    name: &str,
) -> mlua::Result<(Function, Value)> {
    let mut not_found = format!("module '{name}' not found:");

    let preload: Table = package.get("preload")?;
    if let Value::Function(loader) = preload.raw_get::<Value>(name)? {
        return Ok((loader, Value::String(lua.create_string(":preload:")?)));
    }
    not_found.push_str(&format!("\n\tno field package.preload['{name}']"));

    let path: Value = package.get("path")?;
    let Value::String(path) = path else {
        return Err(mlua::Error::RuntimeError(
            "'package.path' must be a string".to_string(),
        ));
    };
    let path = path.to_str()?.to_string();

    match search(name, &path, ".", "/", |candidate| source.read_bytes(candidate)) {
        Ok((file, code)) => {
            let loader = load_chunk(lua, name, &file, code)?;
            Ok((loader, Value::String(lua.create_string(&file)?)))
        }
        Err(tried) => {
            not_found.push_str(&tried);
            Err(mlua::Error::RuntimeError(not_found))
        }
    }
}

/// Try each `;`-separated template of `path` with `?` replaced by `name`.
///
/// Returns the first candidate for which `probe` yields something, together
/// with what it yielded, or the list of tried candidates formatted for an
/// error message.
fn search<T>(
    name: &str,
    path: &str,
    sep: &str,
    rep: &str,
    mut probe: impl FnMut(&str) -> Option<T>,
) -> std::result::Result<(String, T), String> {
    let name = if sep.is_empty() {
        name.to_string()
    } else {
        name.replace(sep, rep)
    };
    let mut tried = String::new();

    for template in path.split(';').filter(|t| !t.is_empty()) {
        let candidate = template.replace('?', &name);
        if let Some(found) = probe(&candidate) {
            return Ok((candidate, found));
        }
        tried.push_str(&format!("\n\tno file '{candidate}'"));
    }

    Err(tried)
}

fn load_chunk(lua: &Lua, name: &str, file: &str, code: Vec<u8>) -> mlua::Result<Function> {
    let loading_error = |message: String| {
        mlua::Error::RuntimeError(format!(
            "error loading module '{name}' from file '{file}':\n\t{message}"
        ))
    };

    lua.load(code)
        .set_name(format!("@{file}"))
        .set_mode(ChunkMode::Text)
        .into_function()
        .map_err(|e| loading_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AssetBundle;
    use mlua::{LuaOptions, StdLib};

    fn lua_with(files: &[(&'static str, &'static str)]) -> Lua {
        let lua = Lua::new_with(StdLib::STRING | StdLib::TABLE, LuaOptions::default()).unwrap();
        let bundle = AssetBundle::new(files.iter().map(|&(p, c)| (p, c.as_bytes())));
        install(&lua, DataSource::asset(bundle, ""), "?.lua;?/init.lua").unwrap();
        lua
    }

    #[test]
    fn test_require_caches_module() {
        let lua = lua_with(&[("counter.lua", "count = (count or 0) + 1 return { n = count }")]);
        let (a, b, count): (i64, i64, i64) = lua
            .load("local a = require('counter') local b = require('counter') return a.n, b.n, count")
            .eval()
            .unwrap();
        assert_eq!((a, b, count), (1, 1, 1));
    }

    #[test]
    fn test_dotted_names_and_init_files() {
        let lua = lua_with(&[
            ("lib/util.lua", "return 'util'"),
            ("widgets/init.lua", "return 'widgets'"),
        ]);
        let (a, b): (String, String) = lua
            .load("return require('lib.util'), require('widgets')")
            .eval()
            .unwrap();
        assert_eq!(a, "util");
        assert_eq!(b, "widgets");
    }

    #[test]
    fn test_module_returning_nothing_stores_true() {
        let lua = lua_with(&[("side.lua", "x = 1")]);
        let (value, stored): (bool, bool) = lua
            .load("return require('side'), package.loaded.side")
            .eval()
            .unwrap();
        assert!(value && stored);
    }

    #[test]
    fn test_preload_wins_over_source() {
        let lua = lua_with(&[("m.lua", "return 'file'")]);
        let loader = lua.create_function(|_, ()| Ok("preloaded")).unwrap();
        register_preload(&lua, "m", loader).unwrap();
        let value: String = lua.load("return require('m')").eval().unwrap();
        assert_eq!(value, "preloaded");
    }

    #[test]
    fn test_circular_require_is_catchable() {
        let lua = lua_with(&[
            ("a.lua", "return require('b')"),
            ("b.lua", "return require('a')"),
        ]);
        let (ok, message): (bool, String) = lua
            .load("local ok, err = pcall(require, 'a') return ok, tostring(err)")
            .eval()
            .unwrap();
        assert!(!ok);
        assert!(message.contains("loop or previous error loading module 'a'"), "{message}");
    }

    #[test]
    fn test_missing_module_lists_candidates() {
        let lua = lua_with(&[]);
        let message: String = lua
            .load("local ok, err = pcall(require, 'nope') return tostring(err)")
            .eval()
            .unwrap();
        assert!(message.contains("module 'nope' not found:"), "{message}");
        assert!(message.contains("no field package.preload['nope']"));
        assert!(message.contains("no file 'nope.lua'"));
        assert!(message.contains("no file 'nope/init.lua'"));
    }

    #[test]
    fn test_escaping_module_path_is_not_found() {
        let lua = lua_with(&[]);
        let ok: bool = lua
            .load("return (pcall(require, '../../etc/passwd'))")
            .eval()
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_binary_chunks_are_refused() {
        let lua = lua_with(&[("bin.lua", "\x1bLua")]);
        let message: String = lua
            .load("local ok, err = pcall(require, 'bin') return tostring(err)")
            .eval()
            .unwrap();
        assert!(message.contains("error loading module 'bin'"), "{message}");
    }

    #[test]
    fn test_searchpath() {
        let lua = lua_with(&[("a/b.lua", "")]);
        let (found, missing): (Option<String>, Option<String>) = lua
            .load("return package.searchpath('a.b', package.path), select(2, package.searchpath('zz', '?.lua'))")
            .eval()
            .unwrap();
        assert_eq!(found.as_deref(), Some("a/b.lua"));
        assert!(missing.unwrap().contains("no file 'zz.lua'"));
    }
}
