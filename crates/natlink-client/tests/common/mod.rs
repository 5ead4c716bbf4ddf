//! Shared fixtures for integration tests: an in-process mock broker speaking the text protocol.

#![allow(dead_code)]

use natlink_client::subject::matches;
use natlink_client::ClientOptions;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Installs a test-friendly tracing subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Broker behaviour knobs.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// JSON body of the INFO line.
    pub info: serde_json::Value,
    /// Answer client PINGs.
    pub answer_ping: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            info: serde_json::json!({
                "server_id": "mock-1",
                "version": "2.10.0",
                "max_payload": 1_048_576,
            }),
            answer_ping: true,
        }
    }
}

struct RemoteSub {
    pattern: String,
    sid: u64,
    remaining: Option<u64>,
}

struct Client {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    subs: Vec<RemoteSub>,
    tasks: Vec<AbortHandle>,
}

struct Shared {
    config: Mutex<MockConfig>,
    clients: Mutex<Vec<Client>>,
    lines: mpsc::UnboundedSender<String>,
    refuse: AtomicBool,
    next_id: AtomicU64,
    accepted: AtomicU64,
}

/// A mock broker on `127.0.0.1:<ephemeral>`.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    lines: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    accept_task: AbortHandle,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kick_all();
    }
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_config(MockConfig::default()).await
    }

    pub async fn with_config(config: MockConfig) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config: Mutex::new(config),
            clients: Mutex::new(Vec::new()),
            lines: lines_tx,
            refuse: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            accepted: AtomicU64::new(0),
        });
        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if accept_shared.refuse.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                serve_client(stream, accept_shared.clone());
            }
        })
        .abort_handle();
        Self {
            addr,
            shared,
            lines: tokio::sync::Mutex::new(lines_rx),
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Options pointed at this broker with short backoffs.
    pub fn options(&self) -> ClientOptions {
        let mut options = ClientOptions::with_server(&self.url()).unwrap();
        options.no_randomize = true;
        options.reconnect_wait_ms = 50;
        options.max_reconnect = 100;
        options.request_watchdog_interval_ms = 50;
        options
    }

    /// Waits for a client line starting with `prefix`. Earlier lines are discarded.
    pub async fn expect_line(&self, prefix: &str) -> String {
        let mut lines = self.lines.lock().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let line = lines.recv().await.expect("mock broker stopped");
                if line.starts_with(prefix) {
                    return line;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no line starting with {:?}", prefix))
    }

    /// Lines received so far that start with `prefix`, without waiting.
    pub async fn drain_lines(&self, prefix: &str) -> Vec<String> {
        let mut lines = self.lines.lock().await;
        let mut out = Vec::new();
        while let Ok(line) = lines.try_recv() {
            if line.starts_with(prefix) {
                out.push(line);
            }
        }
        out
    }

    /// Sends raw bytes to every connected client.
    pub fn inject(&self, bytes: &[u8]) {
        for client in self.shared.clients.lock().unwrap().iter() {
            let _ = client.tx.send(bytes.to_vec());
        }
    }

    /// Drops every client connection.
    pub fn kick_all(&self) {
        let clients: Vec<Client> = self.shared.clients.lock().unwrap().drain(..).collect();
        for client in clients {
            for task in client.tasks {
                task.abort();
            }
        }
    }

    /// While set, new connections are closed right after accept.
    pub fn set_refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_info(&self, info: serde_json::Value) {
        self.shared.config.lock().unwrap().info = info;
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().unwrap().len()
    }

    pub fn accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::SeqCst)
    }
}

fn serve_client(stream: TcpStream, shared: Arc<Shared>) {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if write.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let info = shared.config.lock().unwrap().info.to_string();
    let _ = tx.send(format!("INFO {}\r\n", info).into_bytes());

    let reader_shared = shared.clone();
    let reader_tx = tx.clone();
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim_end().to_string();
            let _ = reader_shared.lines.send(line.clone());
            let args: Vec<&str> = line.split_whitespace().collect();
            let op = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
            match op.as_str() {
                "CONNECT" => {
                    if line.contains("\"verbose\":true") {
                        let _ = reader_tx.send(b"+OK\r\n".to_vec());
                    }
                }
                "PING" => {
                    if reader_shared.config.lock().unwrap().answer_ping {
                        let _ = reader_tx.send(b"PONG\r\n".to_vec());
                    }
                }
                "SUB" => {
                    let sid: u64 = args.last().and_then(|s| s.parse().ok()).unwrap_or(0);
                    let mut clients = reader_shared.clients.lock().unwrap();
                    if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
                        client.subs.push(RemoteSub {
                            pattern: args[1].to_string(),
                            sid,
                            remaining: None,
                        });
                    }
                }
                "UNSUB" => {
                    let sid: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
                    let max: Option<u64> = args.get(2).and_then(|s| s.parse().ok());
                    let mut clients = reader_shared.clients.lock().unwrap();
                    if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
                        match max {
                            Some(max) => {
                                for sub in client.subs.iter_mut().filter(|s| s.sid == sid) {
                                    sub.remaining = Some(max);
                                }
                            }
                            None => client.subs.retain(|s| s.sid != sid),
                        }
                    }
                }
                "PUB" => {
                    let len: usize = args.last().and_then(|s| s.parse().ok()).unwrap_or(0);
                    let mut payload = vec![0u8; len + 2];
                    if reader.read_exact(&mut payload).await.is_err() {
                        break;
                    }
                    payload.truncate(len);
                    let subject = args[1];
                    let reply = if args.len() == 4 { Some(args[2]) } else { None };
                    route(&reader_shared, subject, reply, &payload);
                }
                _ => {}
            }
        }
    });

    shared.clients.lock().unwrap().push(Client {
        id,
        tx,
        subs: Vec::new(),
        tasks: vec![reader.abort_handle(), writer.abort_handle()],
    });
}

fn route(shared: &Shared, subject: &str, reply: Option<&str>, payload: &[u8]) {
    let mut clients = shared.clients.lock().unwrap();
    for client in clients.iter_mut() {
        for sub in client.subs.iter_mut() {
            if !matches(&sub.pattern, subject) {
                continue;
            }
            if sub.remaining == Some(0) {
                continue;
            }
            let header = match reply {
                Some(reply) => {
                    format!("MSG {} {} {} {}\r\n", subject, sub.sid, reply, payload.len())
                }
                None => format!("MSG {} {} {}\r\n", subject, sub.sid, payload.len()),
            };
            let mut frame = header.into_bytes();
            frame.extend_from_slice(payload);
            frame.extend_from_slice(b"\r\n");
            let _ = client.tx.send(frame);
            if let Some(left) = sub.remaining.as_mut() {
                *left -= 1;
            }
        }
        client.subs.retain(|s| s.remaining != Some(0));
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
