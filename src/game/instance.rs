//! A running game instance.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::metadata::InstanceMetadata;
use super::render::RenderSink;
use super::Game;
use crate::config::RuntimeConfig;
use crate::host::ForegroundExecutor;
use crate::notification::{NotificationScheduler, ScheduledNotification};
use crate::script::api::notification_table;
use crate::script::{
    persistence, HostBridge, InternalApi, SandboxEnvironment, ScriptClock, ScriptValue,
};
use crate::source::{escape_name, AssetBundle, DataSource};
use crate::{HostError, Result};

/// The script global persisted across sessions.
const PERSISTENT_GLOBAL: &str = "persistent";
const PERSISTENT_FILE: &str = "persistent.json";
const NOTIFICATIONS_FILE: &str = "notifications.json";
/// Global function receiving due notifications.
const NOTIFY_HANDLER: &str = "onNotify";
/// Directory of the built-in Lua modules inside [`AssetBundle::builtin_lua`].
const BUILTIN_LUA_DIR: &str = "lua";

/// Host services shared by every instance.
#[derive(Clone)]
pub struct InstanceContext {
    pub executor: ForegroundExecutor,
    pub runtime: RuntimeConfig,
    pub clock: ScriptClock,
    pub render: Rc<dyn RenderSink>,
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("runtime", &self.runtime)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Bridge between an instance's scripts and its storage.
struct InstanceBridge {
    instance_id: String,
    storage: DataSource,
    scheduler: Rc<NotificationScheduler>,
    render: Rc<dyn RenderSink>,
}

impl InstanceBridge {
    fn writer(&self, file: &str) -> Result<Box<dyn std::io::Write + Send>> {
        self.storage.write(file).ok_or_else(|| {
            HostError::Validation(format!(
                "cannot write `{file}` of instance `{}`",
                self.instance_id
            ))
        })
    }
}

impl HostBridge for InstanceBridge {
    fn submit_render_queue(&self, queue: ScriptValue) -> Result<()> {
        self.render.render(&self.instance_id, queue);
        Ok(())
    }

    fn commit_persistent_data(&self, data: ScriptValue) -> Result<()> {
        debug!(
            instance = %self.instance_id,
            data = %persistence::describe(&data),
            "persisting script data"
        );
        persistence::write_document(self.writer(PERSISTENT_FILE)?, &data, true)
    }

    fn schedule_notification(
        &self,
        notification: ScheduledNotification,
    ) -> Result<Option<ScheduledNotification>> {
        Ok(self.scheduler.schedule(notification))
    }

    fn get_notification(&self, id: &str) -> Option<ScheduledNotification> {
        self.scheduler.get(id)
    }

    fn cancel_notification(&self, id: &str) -> Option<ScheduledNotification> {
        self.scheduler.cancel(id)
    }
}

/// One saved playthrough of a game.
///
/// Lives on the foreground thread. The embedding GUI drives it through the
/// lifecycle methods and calls
/// [`deliver_notifications`](Self::deliver_notifications) after running
/// foreground tasks.
pub struct GameInstance {
    game: Arc<Game>,
    metadata: InstanceMetadata,
    bridge: Rc<InstanceBridge>,
    env: SandboxEnvironment,
    clock: ScriptClock,
    notifications_loaded: Cell<bool>,
}

impl fmt::Debug for GameInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameInstance")
            .field("game", &self.game.id())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl GameInstance {
    /// Start a new instance of `game` below `instances`.
    pub fn create(
        game: Arc<Game>,
        instances: &DataSource,
        context: &InstanceContext,
    ) -> Result<Self> {
        let metadata = InstanceMetadata::create(instances, &game)?;
        let storage = instances
            .subsource(&metadata.directory_name())
            .ok_or_else(|| {
                HostError::Validation(format!("invalid instance id `{}`", metadata.instance_id))
            })?;
        info!(instance = %metadata.instance_id, game = game.id(), "created game instance");
        Self::open(game, metadata, storage, context)
    }

    /// Open an instance whose files live in `storage`.
    pub fn open(
        game: Arc<Game>,
        metadata: InstanceMetadata,
        storage: DataSource,
        context: &InstanceContext,
    ) -> Result<Self> {
        let builtin = DataSource::asset(AssetBundle::builtin_lua(), BUILTIN_LUA_DIR);
        let source = game.source().clone().union([builtin]);
        let env = SandboxEnvironment::new(source, &context.runtime)?;

        let bridge = Rc::new(InstanceBridge {
            instance_id: metadata.instance_id.clone(),
            storage,
            scheduler: Rc::new(NotificationScheduler::new(context.executor.clone())),
            render: Rc::clone(&context.render),
        });
        InternalApi::new(bridge.clone(), context.clock).register(&env)?;

        let instance = Self {
            game,
            metadata,
            bridge,
            env,
            clock: context.clock,
            notifications_loaded: Cell::new(false),
        };
        instance.load_persistent_data()?;
        Ok(instance)
    }

    pub fn game(&self) -> &Arc<Game> {
        &self.game
    }

    pub fn metadata(&self) -> &InstanceMetadata {
        &self.metadata
    }

    pub fn instance_id(&self) -> &str {
        &self.metadata.instance_id
    }

    /// The instance's sandbox.
    pub fn environment(&self) -> &SandboxEnvironment {
        &self.env
    }

    pub fn notifications(&self) -> &NotificationScheduler {
        &self.bridge.scheduler
    }

    fn load_persistent_data(&self) -> Result<()> {
        let Some(reader) = self.bridge.storage.read(PERSISTENT_FILE) else {
            return Ok(());
        };
        let data = persistence::read_document(reader)?;
        self.env.set_global(PERSISTENT_GLOBAL, data)
    }

    /// Write the script's `persistent` global to disk.
    pub fn commit_persistent_data(&self) -> Result<()> {
        let data = self.env.get_global(PERSISTENT_GLOBAL)?;
        self.bridge.commit_persistent_data(data)
    }

    /// Replace pending notifications with the stored ones and arm them.
    pub fn load_notifications(&self) -> Result<()> {
        let scheduler = &self.bridge.scheduler;
        match self.bridge.storage.read(NOTIFICATIONS_FILE) {
            Some(reader) => {
                if let Err(e) = scheduler.load(reader) {
                    warn!(instance = %self.instance_id(), error = %e, "discarding unreadable notifications");
                    scheduler.start_empty();
                }
            }
            None => scheduler.start_empty(),
        }
        self.notifications_loaded.set(true);
        Ok(())
    }

    /// Write pending notifications to disk.
    pub fn commit_notifications(&self) -> Result<()> {
        self.bridge
            .scheduler
            .commit(self.bridge.writer(NOTIFICATIONS_FILE)?)
    }

    fn stop_and_commit_notifications(&self) -> Result<()> {
        self.bridge.scheduler.stop();
        self.notifications_loaded.set(false);
        self.commit_notifications()
    }

    /// Run the game's main script.
    pub fn run(&self) -> Result<()> {
        let code = self.game.read_main_script()?;
        match self.env.run_main(&code, self.game.path_to_main_script()) {
            None => Ok(()),
            Some(failure) => Err(HostError::Script(failure.to_string())),
        }
    }

    /// First start of this instance in a session.
    pub fn on_create(&self) -> Result<()> {
        info!(instance = %self.instance_id(), "instance created");
        self.load_notifications()?;
        self.run()
    }

    /// Return to the foreground.
    pub fn on_resume(&self) -> Result<()> {
        info!(instance = %self.instance_id(), "instance resumed");
        if self.notifications_loaded.get() {
            self.bridge.scheduler.recalibrate();
            Ok(())
        } else {
            self.load_notifications()
        }
    }

    /// Leave the foreground: disarm timers and save pending notifications.
    pub fn on_pause(&self) -> Result<()> {
        info!(instance = %self.instance_id(), "instance paused");
        self.stop_and_commit_notifications()
    }

    /// Remove the instance from the active set, keeping its files.
    pub fn unload(&self) -> Result<()> {
        self.stop_and_commit_notifications()
    }

    /// Remove the instance and everything it stored.
    pub fn delete(self) -> bool {
        self.bridge.scheduler.stop();
        let deleted = self.bridge.storage.delete("");
        info!(instance = %self.instance_id(), deleted, "instance deleted");
        deleted
    }

    /// Hand every due notification to the script's `onNotify`.
    ///
    /// Returns how many notifications were taken off the queue.
    pub fn deliver_notifications(&self) -> usize {
        let due = self.bridge.scheduler.take_due();

        for notification in &due {
            let table = match notification_table(self.env.lua(), self.clock, notification) {
                Ok(table) => table,
                Err(e) => {
                    error!(instance = %self.instance_id(), error = %e, "failed to decode notification");
                    continue;
                }
            };

            match self.env.call_global(NOTIFY_HANDLER, table) {
                Ok(true) => {}
                Ok(false) => warn!(
                    instance = %self.instance_id(),
                    "no `{NOTIFY_HANDLER}` handler found, define it as a global function"
                ),
                Err(e) => error!(instance = %self.instance_id(), error = %e, "notification handler failed"),
            }
        }

        due.len()
    }
}

/// Open every instance below `instances` whose game is in `games`.
///
/// Instances of unknown games and unreadable instances are skipped.
pub fn load_instances(
    instances: &DataSource,
    games: &[Arc<Game>],
    context: &InstanceContext,
) -> Vec<GameInstance> {
    let mut opened = Vec::new();

    for directory in instances.paths("") {
        let metadata = match InstanceMetadata::load(instances, &directory) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(directory = %directory, error = %e, "skipping unreadable instance");
                continue;
            }
        };
        let Some(game) = games.iter().find(|g| g.id() == metadata.game_id) else {
            debug!(instance = %metadata.instance_id, game = %metadata.game_id, "game not installed");
            continue;
        };
        let Some(storage) = instances.subsource(&escape_name(&directory)) else {
            continue;
        };

        match GameInstance::open(Arc::clone(game), metadata, storage, context) {
            Ok(instance) => opened.push(instance),
            Err(e) => warn!(directory = %directory, error = %e, "failed to open instance"),
        }
    }

    opened
}
