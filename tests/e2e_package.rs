//! End-to-end tests running installed game packages.

mod common;

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use common::{context, write_package};
use gamehost::config::FetchConfig;
use gamehost::{load_installed, load_instances, DataSource, GameInstance, Host, ScriptValue};

const MAIN: &str = r#"
local internal = require("internal")

local now = internal.current_instant()
escaped = pcall(require, "../../etc/passwd")
outside = pcall(require, "../secret")
secret_ran = secret_ran or false

internal.submit_render_queue({
    { type = "text", text = "year " .. now.year },
})
"#;

#[test]
fn test_package_runs_in_isolation() {
    let host = Host::new(&FetchConfig::default()).unwrap();
    let root = tempdir().unwrap();
    let games_dir = root.path().join("games");
    write_package(&games_dir.join("pet"), "pet", &[("main", MAIN)]);
    fs::write(games_dir.join("secret.lua"), "secret_ran = true return 1").unwrap();

    let games = load_installed(&DataSource::file(&games_dir), &host.executor());
    assert_eq!(games.len(), 1);

    let (context, sink) = context(&host);
    let instances = DataSource::file(root.path().join("instances"));
    let instance = GameInstance::create(Arc::clone(&games[0]), &instances, &context).unwrap();
    instance.on_create().unwrap();

    let queues = sink.queues.borrow();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].0, "pet-0");
    let node = queues[0].1.as_table().unwrap().get(1i64);
    let text = node.as_table().unwrap().get("text");
    assert!(text.as_str().unwrap().starts_with("year "));

    let env = instance.environment();
    assert_eq!(env.get_global("escaped").unwrap(), ScriptValue::Boolean(false));
    assert_eq!(env.get_global("outside").unwrap(), ScriptValue::Boolean(false));
    assert_eq!(env.get_global("secret_ran").unwrap(), ScriptValue::Boolean(false));
}

#[test]
fn test_builtin_modules_and_package_modules() {
    let host = Host::new(&FetchConfig::default()).unwrap();
    let root = tempdir().unwrap();
    let game_dir = root.path().join("games").join("quiz");
    write_package(
        &game_dir,
        "quiz",
        &[
            (
                "main",
                "local ui = require('ui')\n\
                 local questions = require('data.questions')\n\
                 ui.render({ ui.text(questions[1]), ui.button('next', 'advance') })",
            ),
            ("data/questions.lua", "return { 'What is 2 + 2?' }"),
            // package modules take precedence over built-in ones
            ("timing.lua", "return { shadowed = true }"),
        ],
    );

    let games = load_installed(&DataSource::file(root.path().join("games")), &host.executor());
    let (context, sink) = context(&host);
    let instances = DataSource::file(root.path().join("instances"));
    let instance = GameInstance::create(Arc::clone(&games[0]), &instances, &context).unwrap();
    instance.on_create().unwrap();

    let queues = sink.queues.borrow();
    let nodes = queues[0].1.as_table().unwrap().sequence();
    assert_eq!(nodes.len(), 2);
    assert_eq!(
        nodes[1].as_table().unwrap().get("action"),
        ScriptValue::from("advance")
    );
    drop(queues);

    instance
        .environment()
        .exec(b"shadowed = require('timing').shadowed", "check")
        .unwrap();
    assert_eq!(
        instance.environment().get_global("shadowed").unwrap(),
        ScriptValue::Boolean(true)
    );
}

#[test]
fn test_instances_reload_with_their_game() {
    let host = Host::new(&FetchConfig::default()).unwrap();
    let root = tempdir().unwrap();
    let games_dir = root.path().join("games");
    write_package(&games_dir.join("a"), "a", &[("main", "")]);
    write_package(&games_dir.join("b"), "b", &[("main", "")]);

    let games = load_installed(&DataSource::file(&games_dir), &host.executor());
    assert_eq!(games.len(), 2);

    let (context, _) = context(&host);
    let instances = DataSource::file(root.path().join("instances"));
    for game in &games {
        GameInstance::create(Arc::clone(game), &instances, &context).unwrap();
    }
    GameInstance::create(Arc::clone(&games[0]), &instances, &context).unwrap();

    let mut ids: Vec<String> = load_instances(&instances, &games, &context)
        .iter()
        .map(|i| i.instance_id().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a-0", "a-1", "b-0"]);
}

#[test]
fn test_main_script_errors_name_the_file_and_line() {
    let host = Host::new(&FetchConfig::default()).unwrap();
    let root = tempdir().unwrap();
    let game_dir = root.path().join("games").join("bad");
    write_package(&game_dir, "bad", &[("main", "local x = nil\nreturn x.field")]);

    let games = load_installed(&DataSource::file(root.path().join("games")), &host.executor());
    let (context, _) = context(&host);
    let instances = DataSource::file(root.path().join("instances"));
    let instance = GameInstance::create(Arc::clone(&games[0]), &instances, &context).unwrap();

    let err = instance.on_create().unwrap_err();
    assert!(err.to_string().contains("`main`:2"), "{err}");
}
