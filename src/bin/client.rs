use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Test client for the tinyweb server")]
struct Args {
    /// Server port
    #[arg(short, long, default_value_t = 9006)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a few pages and check status lines (default)
    Smoke {
        /// Page expected to exist under the document root
        #[arg(long, default_value = "/")]
        page: String,
    },
    /// Keep-alive GET load with per-request latency measurement
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Requests per connection
        #[arg(short, long, default_value_t = 10_000)]
        requests: usize,
        /// Target to request
        #[arg(long, default_value = "/")]
        page: String,
    },
}

struct Response {
    status: u16,
    keep_alive: bool,
    body: Vec<u8>,
}

fn request(target: &str, keep_alive: bool) -> Vec<u8> {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: {connection}\r\n\r\n")
        .into_bytes()
}

fn read_response<R: BufRead>(reader: &mut R) -> Response {
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .expect("failed to read status line");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("malformed status line {status_line:?}"));

    let mut content_length = 0;
    let mut keep_alive = false;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("failed to read header");
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse().expect("bad Content-Length");
            } else if name.eq_ignore_ascii_case("Connection") {
                keep_alive = value.trim().eq_ignore_ascii_case("keep-alive");
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).expect("failed to read body");
    Response {
        status,
        keep_alive,
        body,
    }
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);

    match args.command.unwrap_or(Command::Smoke {
        page: "/".to_owned(),
    }) {
        Command::Smoke { page } => smoke_test(&addr, &page),
        Command::Bench {
            connections,
            requests,
            page,
        } => bench_test(&addr, connections, requests, &page),
    }
}

fn smoke_test(addr: &str, page: &str) {
    eprintln!("smoke test: connecting to {addr}");
    let stream = TcpStream::connect(addr).expect("failed to connect");
    let mut writer = stream.try_clone().expect("clone failed");
    let mut reader = BufReader::new(stream);

    writer.write_all(&request(page, true)).expect("failed to write");
    let resp = read_response(&mut reader);
    assert_eq!(resp.status, 200, "GET {page}");
    assert!(resp.keep_alive);
    eprintln!("  GET {page}: 200 ({} bytes)", resp.body.len());

    writer
        .write_all(&request("/definitely-missing.html", true))
        .expect("failed to write");
    let resp = read_response(&mut reader);
    assert_eq!(resp.status, 404);
    eprintln!("  GET /definitely-missing.html: 404 on the same connection");

    writer
        .write_all(b"BREW / HTTP/1.1\r\n\r\n")
        .expect("failed to write");
    let resp = read_response(&mut reader);
    assert_eq!(resp.status, 400);
    eprintln!("  BREW /: 400");

    eprintln!("smoke test: PASSED");
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let i = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[i.min(sorted.len() - 1)] as f64 / 1_000.0
}

fn bench_test(addr: &str, num_connections: usize, requests_per_conn: usize, page: &str) {
    eprintln!(
        "bench: {num_connections} connections x {requests_per_conn} keep-alive requests to {addr}{page}"
    );

    let req = request(page, true);
    let start = Instant::now();

    let handles: Vec<_> = (0..num_connections)
        .map(|_| {
            let addr = addr.to_string();
            let req = req.clone();
            std::thread::spawn(move || {
                let stream = TcpStream::connect(&addr).expect("failed to connect");
                stream.set_nodelay(true).unwrap();
                let mut writer = stream.try_clone().expect("clone failed");
                let mut reader = BufReader::new(stream);

                let mut samples = Vec::with_capacity(requests_per_conn);
                for i in 0..requests_per_conn {
                    let sent_at = Instant::now();
                    writer.write_all(&req).expect("write failed");
                    let resp = read_response(&mut reader);
                    assert_eq!(resp.status, 200, "request {i}");
                    samples.push(sent_at.elapsed().as_nanos() as u64);
                }
                samples
            })
        })
        .collect();

    let mut all_samples: Vec<u64> = Vec::new();
    for h in handles {
        all_samples.extend(h.join().expect("thread panicked"));
    }

    let elapsed = start.elapsed();
    report(&mut all_samples, elapsed);
}

fn report(samples: &mut [u64], elapsed: Duration) {
    if samples.is_empty() {
        eprintln!("no samples collected");
        return;
    }
    samples.sort_unstable();
    let n = samples.len();
    eprintln!(
        "── summary ({:.1}s, {} requests) ──────────────────────────────────",
        elapsed.as_secs_f64(),
        n
    );
    eprintln!("  qps     {:.0}", n as f64 / elapsed.as_secs_f64());
    eprintln!("  p50     {:.1}µs", percentile(samples, 50.0));
    eprintln!("  p95     {:.1}µs", percentile(samples, 95.0));
    eprintln!("  p99     {:.1}µs", percentile(samples, 99.0));
    eprintln!("  p99.9   {:.1}µs", percentile(samples, 99.9));
    eprintln!("  max     {:.1}µs", samples[n - 1] as f64 / 1_000.0);
}
