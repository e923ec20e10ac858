#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clap::Parser;

use tinyweb::config::Config;
use tinyweb::context::ServerContext;
use tinyweb::db::{ConnectionPool, MemoryStore};
use tinyweb::dispatcher::Dispatcher;
use tinyweb::error::ServerError;
use tinyweb::signals::{Alarm, Notifier};

pub const JUDGE_BODY: &str = "<html>judge</html>";
pub const LOG_BODY: &str = "<html>log in</html>";
pub const WELCOME_BODY: &str = "<html>welcome</html>";
pub const LOG_ERROR_BODY: &str = "<html>login failed</html>";
pub const REGISTER_BODY: &str = "<html>register</html>";
pub const REGISTER_ERROR_BODY: &str = "<html>register failed</html>";

fn write_page(root: &Path, name: &str, body: &str, mode: u32) {
    let path = root.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Document root with the demo pages, an empty page, an unreadable page, a
/// socket file and a directory.
pub fn doc_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::set_permissions(root, fs::Permissions::from_mode(0o755)).unwrap();
    write_page(root, "judge.html", JUDGE_BODY, 0o644);
    write_page(root, "log.html", LOG_BODY, 0o644);
    write_page(root, "welcome.html", WELCOME_BODY, 0o644);
    write_page(root, "logError.html", LOG_ERROR_BODY, 0o644);
    write_page(root, "register.html", REGISTER_BODY, 0o644);
    write_page(root, "registerError.html", REGISTER_ERROR_BODY, 0o644);
    write_page(root, "empty.html", "", 0o644);
    write_page(root, "secret.html", "top secret", 0o600);
    let sock = root.join("sock.html");
    drop(std::os::unix::net::UnixListener::bind(&sock).unwrap());
    fs::set_permissions(&sock, fs::Permissions::from_mode(0o644)).unwrap();
    let sub = root.join("sub");
    fs::create_dir(&sub).unwrap();
    fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
    notifier: Notifier,
    handle: Option<JoinHandle<Result<(), ServerError>>>,
    _root: tempfile::TempDir,
}

impl TestServer {
    /// Start a server on an ephemeral port. `flags` are extra CLI flags.
    pub fn start(flags: &[&str]) -> Self {
        let root = doc_root();
        let root_path = root.path().to_str().unwrap().to_owned();
        let mut args = vec![
            "tinyweb", "-p", "0", "-t", "4", "--max-fd", "4096", "--root",
        ];
        args.push(root_path.as_str());
        args.extend_from_slice(flags);
        let config = Config::parse_from(args);

        let store = Arc::new(MemoryStore::with_rows([("bob", "hi")]));
        let db = ConnectionPool::new(store, config.sql_num);
        let ctx = ServerContext::new(config.root.clone(), db, config.max_fd).unwrap();
        let mut dispatcher = Dispatcher::bind(&config, Arc::clone(&ctx))
            .unwrap()
            .with_alarm(Alarm::Manual);
        let addr = dispatcher.local_addr().unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        let notifier = dispatcher.notifier();
        let handle = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || dispatcher.run())
            .unwrap();

        Self {
            addr,
            ctx,
            notifier,
            handle: Some(handle),
            _root: root,
        }
    }

    pub fn connect(&self) -> Client {
        Client::connect(self.addr)
    }

    /// Inject one timer tick, as SIGALRM would.
    pub fn tick(&self) {
        self.notifier.notify(libc::SIGALRM).unwrap();
    }

    /// Wait up to two seconds for the live-connection count to reach `n`.
    pub fn wait_for_live(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.ctx.live_connections() != n {
            assert!(
                Instant::now() < deadline,
                "live count stuck at {}, expected {n}",
                self.ctx.live_connections()
            );
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.notifier.notify(libc::SIGTERM);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub keep_alive: bool,
    pub content_length: usize,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

pub struct Client {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            writer: stream.try_clone().unwrap(),
            reader: BufReader::new(stream),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    pub fn get(&mut self, target: &str, keep_alive: bool) -> Response {
        let connection = if keep_alive { "keep-alive" } else { "close" };
        self.send(
            format!("GET {target} HTTP/1.1\r\nHost: test\r\nConnection: {connection}\r\n\r\n")
                .as_bytes(),
        );
        self.read_response()
    }

    pub fn post(&mut self, target: &str, body: &str) -> Response {
        self.send(
            format!(
                "POST {target} HTTP/1.1\r\nHost: test\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        );
        self.read_response()
    }

    pub fn read_response(&mut self) -> Response {
        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();
        let mut parts = status_line.trim_end().splitn(3, ' ');
        assert_eq!(parts.next(), Some("HTTP/1.1"), "status line {status_line:?}");
        let status = parts.next().unwrap().parse().unwrap();
        let reason = parts.next().unwrap_or_default().to_owned();

        let mut content_length = 0;
        let mut keep_alive = false;
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            match name {
                "Content-Length" => content_length = value.parse().unwrap(),
                "Connection" => keep_alive = value == "keep-alive",
                other => panic!("unexpected header {other}"),
            }
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).unwrap();
        Response {
            status,
            reason,
            keep_alive,
            content_length,
            body,
        }
    }

    /// True if the server closed the connection without sending more bytes.
    pub fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(self.reader.read(&mut buf), Ok(0))
    }

    /// Everything until the server closes the connection.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        self.reader.read_to_end(&mut out).unwrap();
        out
    }
}
