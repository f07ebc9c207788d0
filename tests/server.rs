// Byte-level integration tests: a live server on an ephemeral port, driven
// over raw TCP so fragmentation and exact reply bytes are observable.
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use miniweb::{Server, Session, SharedBody};

fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<Server>>,
}

impl TestServer {
    fn start(configure: fn(&mut Server)) -> Self {
        init_tracing();
        let mut server = Server::new();
        server.set_port(0);
        configure(&mut server);
        // The first iteration creates the listener
        server.run(0);
        let port = server.port().expect("listener should be live");

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                server.run(20);
            }
            server
        });
        Self {
            port,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }

    fn stop(mut self) -> Server {
        self.shutdown.store(true, Ordering::Release);
        self.handle
            .take()
            .expect("thread running")
            .join()
            .expect("server thread")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

/// Independent response reader: status line, headers in wire order, body of
/// exactly `Content-Length` bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<(String, String)>, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let count = stream.read(&mut byte).expect("read header byte");
        assert!(count > 0, "connection closed mid-header");
        head.push(byte[0]);
    }
    let text = String::from_utf8(head).expect("ascii headers");
    let mut lines = text.trim_end().split("\r\n");
    let status = lines.next().expect("status line").to_string();
    let headers: Vec<(String, String)> = lines
        .map(|line| {
            let (name, value) = line.split_once(": ").expect("header line");
            (name.to_string(), value.to_string())
        })
        .collect();
    let length: usize = headers
        .iter()
        .find(|(name, _)| name == "Content-Length")
        .map(|(_, value)| value.parse().expect("length"))
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).expect("body");
    (status, headers, body)
}

fn hi_handler(session: &mut Session) {
    session.response(200);
    session.write(b"Hi");
}

fn wildcard_handler(session: &mut Session) {
    session.response(200);
    let wildcard = session.wildcard().unwrap_or("").to_owned();
    session.write(wildcard.as_bytes());
}

fn echo_post_handler(session: &mut Session) {
    session.response(200);
    let declared = session.content_length().unwrap_or(0).to_string();
    session.add_header("X-Declared-Length", &declared);
    let content = session.content().to_owned();
    session.write(&content);
}

fn shared_handler(session: &mut Session) {
    session.response(200);
    session.write(b"hello ");
    session.shared_body(SharedBody::Static(b"world"));
}

#[test]
fn serves_the_exact_reply_and_closes_on_http_1_0() {
    let server = TestServer::start(|s| s.register_page("GET", "/", hi_handler));
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").expect("send");

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("server closes after flush");
    assert_eq!(
        reply.as_slice(),
        b"HTTP/1.0 200 OK\r\nServer: Miniweb/0.0.1 (Linux)\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nHi"
            .as_slice()
    );
    server.stop();
}

#[test]
fn wildcard_route_keeps_an_http_1_1_session_alive() {
    let server = TestServer::start(|s| s.register_page("GET", "/*/index.html", wildcard_handler));
    let mut stream = server.connect();
    stream
        .write_all(b"GET /docs/index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send");

    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body.as_slice(), b"docs");
    assert!(headers.contains(&("Keep-Alive".to_string(), "timeout=10, max=1000".to_string())));

    // The session is back in its reading state: reuse the connection
    stream
        .write_all(b"GET /more/index.html HTTP/1.1\r\n\r\n")
        .expect("send again");
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body.as_slice(), b"more");
    server.stop();
}

#[test]
fn post_body_reaches_the_handler() {
    let server = TestServer::start(|s| s.register_page("POST", "/submit", echo_post_handler));
    let mut stream = server.connect();
    stream
        .write_all(b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .expect("send");

    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body.as_slice(), b"hello");
    assert!(headers.contains(&("X-Declared-Length".to_string(), "5".to_string())));
    server.stop();
}

#[test]
fn unknown_routes_get_the_pinned_404() {
    let server = TestServer::start(|s| s.register_page("GET", "/", hi_handler));
    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing HTTP/1.1\r\n\r\n")
        .expect("send");

    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 404 Not Found");
    assert!(headers.contains(&("Content-Length".to_string(), "15".to_string())));
    assert_eq!(body.as_slice(), b"Page not found\n");
    server.stop();
}

#[test]
fn single_byte_fragments_produce_an_identical_reply() {
    let server = TestServer::start(|s| s.register_page("GET", "/", hi_handler));

    let mut whole = server.connect();
    whole.write_all(b"GET / HTTP/1.0\r\n\r\n").expect("send");
    let mut expected = Vec::new();
    whole.read_to_end(&mut expected).expect("reply");

    let mut fragmented = server.connect();
    for byte in b"GET / HTTP/1.0\r\n\r\n" {
        fragmented
            .write_all(std::slice::from_ref(byte))
            .expect("send byte");
        fragmented.flush().expect("flush");
        thread::sleep(Duration::from_millis(2));
    }
    let mut reply = Vec::new();
    fragmented.read_to_end(&mut reply).expect("reply");

    assert_eq!(reply, expected);
    server.stop();
}

#[test]
fn idle_sessions_time_out() {
    let server = TestServer::start(|s| {
        s.register_page("GET", "/", hi_handler);
        s.set_timeout_secs(1);
    });
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").expect("send");
    let (status, _, _) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");

    thread::sleep(Duration::from_millis(2500));
    let mut buf = [0u8; 16];
    let count = stream.read(&mut buf).expect("closed connection reads EOF");
    assert_eq!(count, 0);

    let server = server.stop();
    assert!(server.sessions_timed_out() >= 1);
}

#[test]
fn query_strings_never_affect_matching() {
    let server = TestServer::start(|s| s.register_page("GET", "/search", hi_handler));
    let mut stream = server.connect();
    stream
        .write_all(b"GET /search?q=rust&page=2 HTTP/1.1\r\n\r\n")
        .expect("send");
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body.as_slice(), b"Hi");
    server.stop();
}

#[test]
fn content_length_covers_owned_and_shared_bodies() {
    let server = TestServer::start(|s| s.register_page("GET", "/greeting", shared_handler));
    let mut stream = server.connect();
    stream
        .write_all(b"GET /greeting HTTP/1.1\r\n\r\n")
        .expect("send");

    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert!(headers.contains(&("Content-Length".to_string(), "11".to_string())));
    assert_eq!(body.as_slice(), b"hello world");
    server.stop();
}

#[test]
fn session_slots_are_reused_within_the_cap() {
    let server = TestServer::start(|s| {
        s.register_page("GET", "/", hi_handler);
        s.set_max_sessions(4);
    });
    for _ in 0..12 {
        let mut stream = server.connect();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").expect("send");
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).expect("reply");
        assert!(reply.ends_with(b"Hi"));
    }
    let server = server.stop();
    assert!(server.session_count() <= 4);
}

#[test]
fn malformed_requests_terminate_the_session_without_a_reply() {
    let server = TestServer::start(|s| s.register_page("GET", "/", hi_handler));
    let mut stream = server.connect();
    // Bare LF after the request line violates the grammar
    stream.write_all(b"GET / HTTP/1.0\n\n").expect("send");

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("closed");
    assert!(reply.is_empty());
    server.stop();
}

#[test]
fn route_metrics_count_served_requests() {
    let server = TestServer::start(|s| s.register_page("GET", "/", hi_handler));
    for _ in 0..3 {
        let mut stream = server.connect();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").expect("send");
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).expect("reply");
    }
    let server = server.stop();
    let stats = server.route_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].request_count, 3);
}

#[test]
fn tidyup_releases_everything() {
    let server = TestServer::start(|s| s.register_page("GET", "/", hi_handler));
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").expect("send");
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("reply");

    let mut server = server.stop();
    server.tidyup();
    assert_eq!(server.session_count(), 0);
    assert!(server.port().is_none());
    assert!(server.route_stats().is_empty());
}
