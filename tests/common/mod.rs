//! Test helpers for integration tests.
//!
//! Provides package fixtures, a recording render sink and a minimal HTTP
//! server for exercising remote sources.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gamehost::config::RuntimeConfig;
use gamehost::{Host, InstanceContext, RenderSink, ScriptClock, ScriptValue};

/// Default timeout for waiting on the foreground queue.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// `meta.toml` for a package with the given id, version and main script path.
pub fn manifest(id: &str, version: &str, main: &str) -> String {
    format!(
        r#"engine_version = 1

[meta]
id = "{id}"
name = "Test {id}"
version = "{version}"
author = "tester"
description = "A game used in tests."
changelog = ["initial"]
path_to_main_script = "{main}"
path_to_logo = "logo.png"
"#
    )
}

/// Write a game package into `dir`.
pub fn write_package(dir: &Path, id: &str, files: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("meta.toml"), manifest(id, "1.0", "main")).unwrap();
    for (path, content) in files {
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(target, content).unwrap();
    }
}

/// Render sink remembering every queue it receives.
#[derive(Default)]
pub struct RecordingSink {
    pub queues: RefCell<Vec<(String, ScriptValue)>>,
}

impl RenderSink for RecordingSink {
    fn render(&self, instance_id: &str, queue: ScriptValue) {
        self.queues
            .borrow_mut()
            .push((instance_id.to_string(), queue));
    }
}

/// Instance context backed by `host` and a fresh recording sink.
pub fn context(host: &Host) -> (InstanceContext, Rc<RecordingSink>) {
    let sink = Rc::new(RecordingSink::default());
    let context = InstanceContext {
        executor: host.executor(),
        runtime: RuntimeConfig::default(),
        clock: ScriptClock::new("UTC").unwrap(),
        render: sink.clone(),
    };
    (context, sink)
}

/// HTTP server answering GET requests from a fixed table of paths.
///
/// Unknown paths get a 404. The server thread lives until the process ends.
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl TestServer {
    /// Start serving `routes` (path to body) on an ephemeral port.
    pub fn start(routes: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(
            routes
                .iter()
                .map(|(path, body)| (path.to_string(), body.as_bytes().to_vec()))
                .collect(),
        ));
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                counter.fetch_add(1, Ordering::SeqCst);
                let routes = Arc::clone(&routes);
                thread::spawn(move || serve(stream, &routes));
            }
        });

        Self { addr, requests }
    }

    /// Base URL of the server, without a trailing slash.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of connections accepted so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn serve(stream: TcpStream, routes: &Mutex<HashMap<String, Vec<u8>>>) {
    let mut reader = BufReader::new(&stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header) {
            Ok(0) | Err(_) => break,
            Ok(_) if header == "\r\n" => break,
            Ok(_) => {}
        }
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let body = routes.lock().unwrap().get(path).cloned();
    let mut stream = &stream;
    let _ = match body {
        Some(body) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream
                .write_all(head.as_bytes())
                .and_then(|()| stream.write_all(&body))
        }
        None => stream.write_all(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ),
    };
    let _ = stream.flush();
}
