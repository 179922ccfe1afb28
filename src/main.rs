use std::cmp::Ordering as CmpOrdering;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use gamehost::{
    compare_versions, load_installed, load_instances, Config, DataSource, GameInstance,
    GameRepositories, Host, InstanceContext, LogRenderSink, ScriptClock,
};

/// How long the foreground loop waits for work before checking for shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(250);

fn main() {
    // Load configuration
    let mut config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();

    // Initialize logging
    if let Err(e) = gamehost::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        gamehost::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = run(&config) {
        error!(error = %e, "gamehost stopped with an error");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> gamehost::Result<()> {
    config.validate()?;
    info!("gamehost - sandboxed game package host");

    let host = Host::new(&config.fetch)?;
    let context = InstanceContext {
        executor: host.executor(),
        runtime: config.runtime.clone(),
        clock: ScriptClock::new(&config.clock.timezone)?,
        render: Rc::new(LogRenderSink),
    };

    let games_source = DataSource::file(config.storage.games_path());
    let instances_source = DataSource::file(config.storage.instances_path());

    let games = load_installed(&games_source, &host.executor());
    info!(count = games.len(), "installed games");

    let repositories =
        GameRepositories::from_config(&config.repositories, &host.http(), &host.executor());
    for game in &games {
        let Some(repository) = repositories.get(game.id()) else {
            continue;
        };
        let installed = Arc::clone(game);
        repository.game().get_or_start(move |latest| match latest {
            Ok(latest) => {
                if compare_versions(latest.version(), installed.version()) == CmpOrdering::Greater {
                    info!(game = installed.id(), latest = latest.version(), "update available");
                }
            }
            Err(e) => warn!(error = %e, "could not check for updates"),
        });
    }

    let mut instances = load_instances(&instances_source, &games, &context);
    for game in &games {
        if !instances.iter().any(|i| i.game().id() == game.id()) {
            instances.push(GameInstance::create(Arc::clone(game), &instances_source, &context)?);
        }
    }

    for instance in &instances {
        if let Err(e) = instance.on_create() {
            error!(instance = %instance.instance_id(), error = %e, "instance failed to start");
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::clone(&running);
    host.executor().runtime().spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.store(false, Ordering::SeqCst);
        }
    });

    info!(count = instances.len(), "running game instances, press Ctrl-C to stop");
    while running.load(Ordering::SeqCst) {
        host.queue().run_next(IDLE_WAIT);
        host.queue().run_pending();
        for instance in &instances {
            instance.deliver_notifications();
        }
    }

    for instance in &instances {
        if let Err(e) = instance.on_pause() {
            warn!(instance = %instance.instance_id(), error = %e, "failed to save instance");
        }
    }
    info!("gamehost stopped");
    Ok(())
}
