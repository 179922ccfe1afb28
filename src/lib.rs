//! gamehost - sandboxed host runtime for distributable game packages
//!
//! Game packages are trees of Lua scripts plus a `meta.toml` descriptor,
//! loaded from local directories, bundled assets or remote URLs. Each game
//! instance runs in an isolated interpreter that can only reach its own
//! package, persists script state as versioned JSON documents, and schedules
//! wall-clock notifications delivered back to the script.

pub mod config;
pub mod error;
pub mod fetch;
pub mod game;
pub mod host;
pub mod logging;
pub mod notification;
pub mod script;
pub mod source;
pub mod version;

pub use config::Config;
pub use error::{HostError, Result};
pub use fetch::{DeferredFetch, FetchError, FetchResult};
pub use game::{
    load_installed, load_instances, Game, GameInstance, GameRepositories, GameRepository,
    InstanceContext, InstanceMetadata, LogRenderSink, RenderSink,
};
pub use host::{ForegroundExecutor, ForegroundQueue, Host};
pub use notification::{NotificationScheduler, ScheduledNotification};
pub use script::{SandboxEnvironment, ScriptClock, ScriptFailure, ScriptTable, ScriptValue};
pub use source::{resolve_path, AssetBundle, DataSource};
pub use version::{compare_versions, parse_version};
