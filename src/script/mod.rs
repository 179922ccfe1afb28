//! Sandboxed Lua scripting.
//!
//! Game scripts run in an isolated interpreter with a restricted standard
//! library and a module system that can only load from the game's data
//! source. Script values cross into the host as [`ScriptValue`] and are
//! persisted with the [`persistence`] codec.

pub mod api;
pub mod engine;
mod package;
pub mod persistence;
pub mod time;
pub mod value;

pub use api::{HostBridge, InternalApi};
pub use engine::{ResourceLimits, SandboxEnvironment, ScriptFailure};
pub use time::ScriptClock;
pub use value::{ScriptTable, ScriptValue};
