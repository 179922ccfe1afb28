//! Host API for Lua scripts.
//!
//! Provides the `internal` module (`require("internal")`) through which game
//! scripts talk to the host. The built-in `ui` and `timing` modules are thin
//! Lua wrappers around it.

use std::rc::Rc;

use mlua::{Lua, Result as LuaResult, Table, Value};

use super::engine::SandboxEnvironment;
use super::time::ScriptClock;
use super::value::ScriptValue;
use crate::notification::ScheduledNotification;
use crate::{HostError, Result};

/// Name the API is registered under in `package.loaded`.
pub const MODULE_NAME: &str = "internal";

/// Host side of the `internal` module.
pub trait HostBridge {
    /// Hand a finished render queue to the GUI.
    fn submit_render_queue(&self, queue: ScriptValue) -> Result<()>;

    /// Persist the script's `persistent` global.
    fn commit_persistent_data(&self, data: ScriptValue) -> Result<()>;

    /// Schedule a notification, returning the one it replaced.
    fn schedule_notification(
        &self,
        notification: ScheduledNotification,
    ) -> Result<Option<ScheduledNotification>>;

    fn get_notification(&self, id: &str) -> Option<ScheduledNotification>;

    fn cancel_notification(&self, id: &str) -> Option<ScheduledNotification>;
}

/// Builder registering the `internal` module with a sandbox.
pub struct InternalApi {
    bridge: Rc<dyn HostBridge>,
    clock: ScriptClock,
}

impl InternalApi {
    pub fn new(bridge: Rc<dyn HostBridge>, clock: ScriptClock) -> Self {
        Self { bridge, clock }
    }

    /// Register the module with `env`.
    pub fn register(self, env: &SandboxEnvironment) -> Result<()> {
        let lua = env.lua();
        let internal = lua.create_table()?;

        self.register_render_functions(lua, &internal)?;
        self.register_persistence_functions(lua, &internal)?;
        self.register_time_functions(lua, &internal)?;
        self.register_notification_functions(lua, &internal)?;

        env.register_module(MODULE_NAME, internal)
    }

    fn register_render_functions(&self, lua: &Lua, internal: &Table) -> LuaResult<()> {
        let bridge = Rc::clone(&self.bridge);
        let submit = lua.create_function(move |_, queue: ScriptValue| {
            bridge.submit_render_queue(queue).map_err(into_lua_error)
        })?;
        internal.raw_set("submit_render_queue", submit)
    }

    fn register_persistence_functions(&self, lua: &Lua, internal: &Table) -> LuaResult<()> {
        let bridge = Rc::clone(&self.bridge);
        let commit = lua.create_function(move |lua, ()| {
            let data: ScriptValue = lua.globals().raw_get("persistent")?;
            bridge.commit_persistent_data(data).map_err(into_lua_error)
        })?;
        internal.raw_set("commit_persistent_data", commit)
    }

    fn register_time_functions(&self, lua: &Lua, internal: &Table) -> LuaResult<()> {
        let clock = self.clock;
        let current_instant =
            lua.create_function(move |lua, ()| clock.instant_table(lua, clock.now_millis()))?;
        internal.raw_set("current_instant", current_instant)?;

        let add_duration = lua.create_function(move |lua, (instant, duration): (Value, Value)| {
            let millis = clock.add_duration(clock.millis_of(&instant)?, &duration)?;
            clock.instant_table(lua, millis)
        })?;
        internal.raw_set("add_duration", add_duration)
    }

    fn register_notification_functions(&self, lua: &Lua, internal: &Table) -> LuaResult<()> {
        let clock = self.clock;

        let bridge = Rc::clone(&self.bridge);
        let schedule = lua.create_function(
            move |lua, (id, instant, data): (Option<String>, Value, ScriptValue)| {
                let instant = clock.millis_of(&instant)?;
                let notification =
                    ScheduledNotification::new(id, instant, &data).map_err(into_lua_error)?;
                let replaced = bridge
                    .schedule_notification(notification)
                    .map_err(into_lua_error)?;
                optional_notification(lua, clock, replaced)
            },
        )?;
        internal.raw_set("schedule_notification", schedule)?;

        let bridge = Rc::clone(&self.bridge);
        let get = lua.create_function(move |lua, id: String| {
            optional_notification(lua, clock, bridge.get_notification(&id))
        })?;
        internal.raw_set("get_notification", get)?;

        let bridge = Rc::clone(&self.bridge);
        let cancel = lua.create_function(move |lua, id: String| {
            optional_notification(lua, clock, bridge.cancel_notification(&id))
        })?;
        internal.raw_set("cancel_notification", cancel)
    }
}

/// Script view of a notification: `{ id, instant, data }` with `instant` as
/// an instant table.
pub fn notification_table(
    lua: &Lua,
    clock: ScriptClock,
    notification: &ScheduledNotification,
) -> LuaResult<Table> {
    let table = lua.create_table()?;
    if let Some(id) = &notification.id {
        table.raw_set("id", id.as_str())?;
    }
    table.raw_set("instant", clock.instant_table(lua, notification.instant)?)?;
    table.raw_set("data", notification.payload().map_err(into_lua_error)?)?;
    Ok(table)
}

fn optional_notification(
    lua: &Lua,
    clock: ScriptClock,
    notification: Option<ScheduledNotification>,
) -> LuaResult<Value> {
    match notification {
        Some(notification) => Ok(Value::Table(notification_table(lua, clock, &notification)?)),
        None => Ok(Value::Nil),
    }
}

fn into_lua_error(e: HostError) -> mlua::Error {
    mlua::Error::RuntimeError(e.to_string())
}
