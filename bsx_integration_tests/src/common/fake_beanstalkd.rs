use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Default)]
struct State {
    stats: BTreeMap<String, String>,
    tubes: BTreeMap<String, BTreeMap<String, String>>,
    failing: HashSet<String>,
    hang_ups: usize,
    commands: Vec<String>,
}

/// In-process stand-in for beanstalkd answering `stats`, `list-tubes` and
/// `stats-tube`.
pub struct FakeBeanstalkd {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    connections: Arc<AtomicUsize>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FakeBeanstalkd {
    /// Start a server on a random available port
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let mut state = State::default();
        for (key, value) in [
            ("hostname", "fake-queue"),
            ("id", "d3adb33f"),
            ("pid", "4242"),
            ("version", "\"1.13\""),
            ("current-jobs-ready", "0"),
            ("current-connections", "1"),
            ("uptime", "77"),
        ] {
            state.stats.insert(key.to_string(), value.to_string());
        }

        let server = Self {
            addr,
            state: Arc::new(Mutex::new(state)),
            connections: Arc::new(AtomicUsize::new(0)),
            handles: Arc::new(Mutex::new(Vec::new())),
        };

        let state = server.state.clone();
        let connections = server.connections.clone();
        let handles = server.handles.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tracing::debug!("Fake beanstalkd accepted connection from {}", peer);
                connections.fetch_add(1, Ordering::SeqCst);
                let handle = tokio::spawn(serve(stream, state.clone()));
                handles.lock().unwrap().push(handle);
            }
        });
        server.handles.lock().unwrap().push(accept);

        tracing::info!("Fake beanstalkd listening on {}", addr);
        Ok(server)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn set_stat(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .stats
            .insert(key.to_string(), value.to_string());
    }

    /// Add a tube with the given stats; `name` is filled in automatically.
    pub fn add_tube(&self, name: &str, stats: &[(&str, &str)]) {
        let mut tube: BTreeMap<String, String> = stats
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        tube.insert("name".to_string(), name.to_string());
        self.state.lock().unwrap().tubes.insert(name.to_string(), tube);
    }

    /// Answer `stats-tube` for this tube with `NOT_FOUND` while still
    /// listing it.
    pub fn fail_tube(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    /// Close the connection instead of answering the next `count` commands.
    pub fn hang_up_next(&self, count: usize) {
        self.state.lock().unwrap().hang_ups = count;
    }

    /// Number of TCP connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Commands received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count_commands(&self, command: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    /// Stop accepting and drop every open connection.
    pub fn stop(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for FakeBeanstalkd {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Reply {
    Body(String),
    Word(&'static str),
    HangUp,
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim_end().to_string();
        let reply = answer(&command, &state);
        let bytes = match reply {
            Reply::Body(body) => format!("OK {}\r\n{}\r\n", body.len(), body),
            Reply::Word(word) => format!("{word}\r\n"),
            Reply::HangUp => return,
        };
        if write.write_all(bytes.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn answer(command: &str, state: &Mutex<State>) -> Reply {
    let mut state = state.lock().unwrap();
    state.commands.push(command.to_string());

    if state.hang_ups > 0 {
        state.hang_ups -= 1;
        return Reply::HangUp;
    }

    match command.split_once(' ') {
        None if command == "stats" => Reply::Body(yaml_map(&state.stats)),
        None if command == "list-tubes" => {
            let mut body = String::from("---\n");
            for tube in state.tubes.keys() {
                body.push_str(&format!("- {tube}\n"));
            }
            Reply::Body(body)
        }
        Some(("stats-tube", tube)) => {
            if state.failing.contains(tube) {
                return Reply::Word("NOT_FOUND");
            }
            match state.tubes.get(tube) {
                Some(stats) => Reply::Body(yaml_map(stats)),
                None => Reply::Word("NOT_FOUND"),
            }
        }
        _ => Reply::Word("UNKNOWN_COMMAND"),
    }
}

fn yaml_map(map: &BTreeMap<String, String>) -> String {
    let mut body = String::from("---\n");
    for (key, value) in map {
        body.push_str(&format!("{key}: {value}\n"));
    }
    body
}
