//! Lua script engine with sandboxing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{
    ChunkMode, Function, HookTriggers, IntoLuaMulti, Lua, LuaOptions, MultiValue, StdLib, Table,
    Value, VmState,
};
use tracing::{error, info};

use super::package;
use super::value::{NestingLimit, ScriptValue};
use crate::config::RuntimeConfig;
use crate::logging::SCRIPT_TARGET;
use crate::source::DataSource;
use crate::{HostError, Result};

/// Instructions between two checks of the instruction budget.
const HOOK_GRANULARITY: u32 = 10_000;

/// Base-library functions that reach the host filesystem or load bytecode.
const REMOVED_GLOBALS: [&str; 4] = ["dofile", "loadfile", "load", "collectgarbage"];

/// Resource limits for script execution.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of instructions per entry point (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
    /// Deepest table nesting converted to or from host values.
    pub max_table_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for ResourceLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory_mb * 1024 * 1024,
            max_table_depth: config.max_table_depth,
        }
    }
}

/// An uncaught script error, split into location and message where possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    /// Chunk the error was raised in.
    pub file: Option<String>,
    /// Line within `file`.
    pub line: Option<u32>,
    /// Error message without the location prefix.
    pub message: String,
}

impl ScriptFailure {
    /// Parse a Lua error message of the form `file:line: message`.
    ///
    /// Falls back to the whole first line as the message when no location
    /// prefix is found. Stack tracebacks are dropped.
    pub fn parse(raw: &str) -> Self {
        let first = raw
            .split("\nstack traceback:")
            .next()
            .unwrap_or(raw)
            .trim_end();

        for (i, _) in first.match_indices(':') {
            let rest = &first[i + 1..];
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 || !rest[digits..].starts_with(':') {
                continue;
            }
            if let Ok(line) = rest[..digits].parse() {
                return Self {
                    file: Some(first[..i].to_string()),
                    line: Some(line),
                    message: rest[digits + 1..].trim_start().to_string(),
                };
            }
        }

        Self {
            file: None,
            line: None,
            message: first.to_string(),
        }
    }

    /// Extract the innermost message from an interpreter error.
    pub fn from_lua_error(e: &mlua::Error) -> Self {
        Self::parse(&root_message(e))
    }
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "`{file}`:{line} {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

fn root_message(e: &mlua::Error) -> String {
    match e {
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => root_message(cause),
        other => other.to_string(),
    }
}

/// An isolated Lua state bound to one data source.
///
/// Only the base, coroutine, table, string, utf8 and math libraries are
/// available, minus anything that touches the host filesystem or loads
/// bytecode. `require` resolves modules against the bound source.
pub struct SandboxEnvironment {
    lua: Lua,
    source: DataSource,
    instruction_count: Arc<AtomicU64>,
    limits: ResourceLimits,
}

impl fmt::Debug for SandboxEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxEnvironment")
            .field("source", &self.source)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SandboxEnvironment {
    /// Create a sandbox that loads modules from `source`.
    pub fn new(source: DataSource, config: &RuntimeConfig) -> Result<Self> {
        let libraries =
            StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH;
        let lua = Lua::new_with(libraries, LuaOptions::default())
            .map_err(|e| HostError::Script(format!("failed to create Lua state: {e}")))?;

        Self::apply_sandbox(&lua)?;
        package::install(&lua, source.clone(), &config.search_path)
            .map_err(|e| HostError::Script(format!("failed to install package library: {e}")))?;

        let limits = ResourceLimits::from(config);
        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory)
                .map_err(|e| HostError::Script(format!("failed to set memory limit: {e}")))?;
        }
        lua.set_app_data(NestingLimit(limits.max_table_depth));

        Ok(Self {
            lua,
            source,
            instruction_count: Arc::new(AtomicU64::new(0)),
            limits,
        })
    }

    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();

        for name in REMOVED_GLOBALS {
            globals
                .raw_set(name, Value::Nil)
                .map_err(|e| HostError::Script(format!("failed to disable {name}: {e}")))?;
        }

        let string: Table = globals
            .raw_get("string")
            .map_err(|e| HostError::Script(format!("string library missing: {e}")))?;
        string
            .raw_set("dump", Value::Nil)
            .map_err(|e| HostError::Script(format!("failed to disable string.dump: {e}")))?;

        let print = lua
            .create_function(|lua, args: MultiValue| {
                let tostring: Function = lua.globals().get("tostring")?;
                let mut line = String::new();
                for (i, value) in args.into_iter().enumerate() {
                    if i > 0 {
                        line.push('\t');
                    }
                    let text: mlua::String = tostring.call(value)?;
                    line.push_str(&text.to_string_lossy());
                }
                info!(target: SCRIPT_TARGET, "{line}");
                Ok(())
            })
            .map_err(|e| HostError::Script(format!("failed to create print: {e}")))?;
        globals
            .raw_set("print", print)
            .map_err(|e| HostError::Script(format!("failed to replace print: {e}")))?;

        Ok(())
    }

    /// Run `f` under the instruction budget.
    fn guarded<R>(&self, f: impl FnOnce(&Lua) -> mlua::Result<R>) -> mlua::Result<R> {
        self.instruction_count.store(0, Ordering::SeqCst);

        if self.limits.max_instructions > 0 {
            let count = Arc::clone(&self.instruction_count);
            let limit = self.limits.max_instructions;

            self.lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_GRANULARITY),
                move |_lua, _debug| {
                    let current = count.fetch_add(u64::from(HOOK_GRANULARITY), Ordering::SeqCst)
                        + u64::from(HOOK_GRANULARITY);
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let result = f(&self.lua);
        self.lua.remove_hook();
        result
    }

    /// Execute a text chunk named `name`.
    pub fn exec(&self, code: &[u8], name: &str) -> Result<()> {
        self.guarded(|lua| {
            lua.load(code)
                .set_name(format!("@{name}"))
                .set_mode(ChunkMode::Text)
                .exec()
        })
        .map_err(|e| HostError::Script(ScriptFailure::from_lua_error(&e).to_string()))
    }

    /// Execute the top-level script of a game.
    ///
    /// Errors never propagate: they are logged and returned in parsed form.
    pub fn run_main(&self, code: &[u8], name: &str) -> Option<ScriptFailure> {
        let result = self.guarded(|lua| {
            lua.load(code)
                .set_name(format!("@{name}"))
                .set_mode(ChunkMode::Text)
                .exec()
        });

        match result {
            Ok(()) => None,
            Err(e) => {
                let failure = ScriptFailure::from_lua_error(&e);
                error!(script = name, error = %failure, "script failed");
                Some(failure)
            }
        }
    }

    /// Call the global function `name`.
    ///
    /// Returns `Ok(false)` when no such function is defined.
    pub fn call_global(&self, name: &str, args: impl IntoLuaMulti) -> Result<bool> {
        let function: Value = self.lua.globals().raw_get(name)?;
        let Value::Function(function) = function else {
            return Ok(false);
        };

        self.guarded(|_| function.call::<()>(args)).map_err(|e| {
            HostError::Script(format!(
                "{name}: {}",
                ScriptFailure::from_lua_error(&e)
            ))
        })?;
        Ok(true)
    }

    /// Make `module` the result of `require(name)`.
    pub fn register_module(&self, name: &str, module: Table) -> Result<()> {
        package::register_loaded(&self.lua, name, Value::Table(module))?;
        Ok(())
    }

    /// Register a loader in `package.preload`.
    pub fn register_preload(&self, name: &str, loader: Function) -> Result<()> {
        package::register_preload(&self.lua, name, loader)?;
        Ok(())
    }

    /// Read a global as a host value.
    pub fn get_global(&self, name: &str) -> Result<ScriptValue> {
        Ok(self.lua.globals().raw_get(name)?)
    }

    /// Assign a global from a host value.
    pub fn set_global(&self, name: &str, value: ScriptValue) -> Result<()> {
        self.lua.globals().raw_set(name, value)?;
        Ok(())
    }

    /// Instructions executed by the last entry point, in hook-sized steps.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The data source modules are loaded from.
    pub fn source(&self) -> &DataSource {
        &self.source
    }

    /// The underlying Lua state, for registering host functions.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}
