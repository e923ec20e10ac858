//! End-to-end: real listening socket, dispatcher thread and worker pool,
//! driven over loopback TCP.

mod common;

use std::thread;
use std::time::Duration;

use common::*;
use tinyweb::constants::{
    BUSY_MESSAGE, EMPTY_FILE_BODY, ERROR_400_FORM, ERROR_403_FORM, ERROR_404_FORM, ERROR_500_FORM,
};

const LOGIN: &str = "/2CGISQL.cgi";
const REGISTER: &str = "/3CGISQL.cgi";

fn keep_alive_round_trips(flags: &[&str]) {
    let server = TestServer::start(flags);
    let mut client = server.connect();

    let resp = client.get("/", true);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.reason, "OK");
    assert!(resp.keep_alive);
    assert_eq!(resp.text(), JUDGE_BODY);

    // Same socket, next request.
    let resp = client.get("/log.html", true);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text(), LOG_BODY);

    let resp = client.get("/0", false);
    assert_eq!(resp.text(), REGISTER_BODY);
    assert!(!resp.keep_alive);
    assert!(client.is_closed());
}

#[test]
fn proactor_level_triggered() {
    keep_alive_round_trips(&["-a", "proactor", "-m", "0"]);
}

#[test]
fn reactor_level_triggered() {
    keep_alive_round_trips(&["-a", "reactor", "-m", "0"]);
}

#[test]
fn proactor_edge_triggered() {
    keep_alive_round_trips(&["-a", "proactor", "-m", "3"]);
}

#[test]
fn reactor_edge_triggered() {
    keep_alive_round_trips(&["-a", "reactor", "-m", "3"]);
}

#[test]
fn mixed_trigger_modes() {
    keep_alive_round_trips(&["-m", "1"]);
    keep_alive_round_trips(&["-m", "2"]);
}

#[test]
fn error_pages() {
    let server = TestServer::start(&[]);
    let mut client = server.connect();

    let resp = client.get("/missing.html", true);
    assert_eq!((resp.status, resp.reason.as_str()), (404, "Not Found"));
    assert_eq!(resp.text(), ERROR_404_FORM);

    let resp = client.get("/secret.html", true);
    assert_eq!((resp.status, resp.reason.as_str()), (403, "Forbidden"));
    assert_eq!(resp.text(), ERROR_403_FORM);

    let resp = client.get("/sub", true);
    assert_eq!((resp.status, resp.reason.as_str()), (400, "Bad Request"));
    assert_eq!(resp.text(), ERROR_400_FORM);

    let resp = client.get("/../judge.html", true);
    assert_eq!(resp.status, 403);

    let resp = client.get("/sock.html", true);
    assert_eq!((resp.status, resp.reason.as_str()), (500, "Internal Error"));
    assert_eq!(resp.text(), ERROR_500_FORM);
    assert!(resp.keep_alive);

    let resp = client.get("/empty.html", true);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text(), EMPTY_FILE_BODY);
    assert_eq!(resp.content_length, EMPTY_FILE_BODY.len());
}

#[test]
fn malformed_request_gets_400() {
    let server = TestServer::start(&[]);
    let mut client = server.connect();
    client.send(b"DELETE /judge.html HTTP/1.1\r\n\r\n");
    let resp = client.read_response();
    assert_eq!(resp.status, 400);
    assert!(!resp.keep_alive);
    assert!(client.is_closed());

    let mut client = server.connect();
    client.send(b"GET /judge.html HTTP/1.0\r\n\r\n");
    assert_eq!(client.read_response().status, 400);
}

#[test]
fn request_split_across_many_writes() {
    for mode in ["proactor", "reactor"] {
        let server = TestServer::start(&["-a", mode, "-m", "1"]);
        let mut client = server.connect();
        let raw = b"GET /welcome.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";
        for chunk in raw.chunks(5) {
            client.send(chunk);
            thread::sleep(Duration::from_millis(2));
        }
        let resp = client.read_response();
        assert_eq!(resp.status, 200, "{mode}");
        assert_eq!(resp.text(), WELCOME_BODY);
    }
}

#[test]
fn login_checks_password() {
    let server = TestServer::start(&[]);
    let mut client = server.connect();

    let resp = client.post(LOGIN, "user=bob&password=hi");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text(), WELCOME_BODY);

    let resp = client.post(LOGIN, "user=bob&password=wrong");
    assert_eq!(resp.text(), LOG_ERROR_BODY);

    let resp = client.post(LOGIN, "garbage");
    assert_eq!(resp.text(), LOG_ERROR_BODY);
}

#[test]
fn register_then_login() {
    let server = TestServer::start(&["-a", "reactor"]);
    let mut client = server.connect();

    let resp = client.post(REGISTER, "user=amy&password=pw");
    assert_eq!(resp.text(), LOG_BODY);
    assert!(server.ctx.users.contains("amy"));

    let resp = client.post(LOGIN, "user=amy&password=pw");
    assert_eq!(resp.text(), WELCOME_BODY);

    let resp = client.post(REGISTER, "user=amy&password=other");
    assert_eq!(resp.text(), REGISTER_ERROR_BODY);
    let resp = client.post(REGISTER, "user=bob&password=x");
    assert_eq!(resp.text(), REGISTER_ERROR_BODY);

    assert_eq!(server.ctx.db.free_count(), server.ctx.db.size());
}

#[test]
fn get_to_login_target_is_a_file_lookup() {
    let server = TestServer::start(&[]);
    let mut client = server.connect();
    assert_eq!(client.get(LOGIN, true).status, 404);
}

#[test]
fn idle_connection_is_evicted_on_tick() {
    let server = TestServer::start(&["--timeslot", "1"]);
    let mut idle = server.connect();
    let mut busy = server.connect();
    assert_eq!(busy.get("/", true).status, 200);

    // Before expiry a tick leaves both alone.
    server.tick();
    assert_eq!(busy.get("/", true).status, 200);

    thread::sleep(Duration::from_millis(3300));
    server.tick();
    assert!(idle.is_closed());
    assert!(busy.is_closed());
    server.wait_for_live(0);
}

#[test]
fn idle_eviction_does_not_wait_for_a_busy_worker() {
    let server = TestServer::start(&["-a", "proactor", "-s", "1", "--timeslot", "1"]);
    let held = server.ctx.db.acquire();

    // The worker serving this request blocks on the empty DB pool while
    // holding the connection.
    let mut registering = server.connect();
    registering.send(
        b"POST /3CGISQL.cgi HTTP/1.1\r\nContent-Length: 19\r\n\r\nuser=zed&password=z",
    );
    thread::sleep(Duration::from_millis(3300));
    server.tick();

    let mut fresh = server.connect();
    let resp = fresh.get("/", true);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text(), JUDGE_BODY);

    // Once the worker gets its handle it finishes, then closes instead of
    // answering.
    drop(held);
    assert!(registering.is_closed());
    assert!(server.ctx.users.contains("zed"));
    server.wait_for_live(1);
    assert_eq!(fresh.get("/log.html", true).text(), LOG_BODY);
}

#[test]
fn connection_limit_rejects_with_busy_message() {
    let server = TestServer::start(&["--max-conn", "2"]);
    let mut first = server.connect();
    let mut second = server.connect();
    assert_eq!(first.get("/", true).status, 200);
    assert_eq!(second.get("/", true).status, 200);
    server.wait_for_live(2);

    let mut third = server.connect();
    assert_eq!(third.read_to_end(), BUSY_MESSAGE.as_bytes());
    assert!(third.is_closed());
    assert_eq!(server.ctx.live_connections(), 2);

    // A slot frees up once a client leaves.
    drop(first);
    server.wait_for_live(1);
    let mut fourth = server.connect();
    assert_eq!(fourth.get("/", true).status, 200);
    assert_eq!(second.get("/log.html", true).text(), LOG_BODY);
}

#[test]
fn activity_pushes_expiry_forward() {
    let server = TestServer::start(&["--timeslot", "1"]);
    let mut client = server.connect();
    for _ in 0..4 {
        thread::sleep(Duration::from_millis(1000));
        assert_eq!(client.get("/", true).status, 200);
        server.tick();
    }
    // Over four seconds old, but never idle for three.
    assert_eq!(client.get("/", true).status, 200);
}

#[test]
fn many_concurrent_clients() {
    let server = TestServer::start(&["-m", "3", "-t", "8"]);
    let addr = server.addr;
    let handles: Vec<_> = (0..16)
        .map(|_| {
            thread::spawn(move || {
                let mut client = Client::connect(addr);
                for _ in 0..20 {
                    let resp = client.get("/judge.html", true);
                    assert_eq!(resp.status, 200);
                    assert_eq!(resp.text(), JUDGE_BODY);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn full_queue_rejects_with_busy_message() {
    // One worker stuck behind a queue of one: extra requests overflow.
    let server = TestServer::start(&["-t", "1", "--max-requests", "1", "-s", "1"]);
    let held = server.ctx.db.acquire();

    let mut registering = server.connect();
    registering.send(
        b"POST /3CGISQL.cgi HTTP/1.1\r\nContent-Length: 19\r\n\r\nuser=zed&password=z",
    );
    thread::sleep(Duration::from_millis(100));

    let mut queued = server.connect();
    queued.send(b"GET / HTTP/1.1\r\n\r\n");
    thread::sleep(Duration::from_millis(100));

    let mut rejected = server.connect();
    rejected.send(b"GET / HTTP/1.1\r\n\r\n");
    let reply = rejected.read_to_end();
    assert_eq!(reply, BUSY_MESSAGE.as_bytes());

    drop(held);
    assert_eq!(registering.read_response().text(), LOG_BODY);
    assert_eq!(queued.read_response().text(), JUDGE_BODY);
}
