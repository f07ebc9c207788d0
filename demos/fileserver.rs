// demos/fileserver.rs
// Static file serving with log/error callbacks and periodic stats.
use std::fs;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use miniweb::{DebugLevel, ErrorKind, Server, Session, SharedBody};
use tracing_subscriber::EnvFilter;

fn page_index(session: &mut Session) {
    static CACHE: OnceLock<Vec<u8>> = OnceLock::new();
    let cached = CACHE.get_or_init(|| fs::read("index.html").unwrap_or_default());
    if cached.is_empty() {
        session.response(404);
        session.write(b"File not found\n");
        return;
    }
    session.response(200);
    // Cached for the process lifetime, so the reply can borrow it
    session.shared_body(SharedBody::Static(cached.as_slice()));
}

fn page_favicon(session: &mut Session) {
    match fs::read("favicon.ico") {
        Ok(bytes) => {
            session.response(200);
            session.add_header("Content-Type", "image/x-icon");
            session.write(&bytes);
        }
        Err(_) => {
            session.response(404);
            session.write(b"File not found\n");
        }
    }
}

fn page_readme(session: &mut Session) {
    match fs::read("README.md") {
        Ok(bytes) => {
            session.response(200);
            session.add_header("Content-Type", "text/plain");
            session.write(&bytes);
        }
        Err(_) => {
            session.response(404);
            session.write(b"File not found\n");
        }
    }
}

fn write_log(url: &str, response_code: u16, micros: u64) {
    println!(
        "Page access: {url} {response_code} {}.{:06}",
        micros / 1_000_000,
        micros % 1_000_000
    );
}

fn show_error(kind: ErrorKind, context: Option<&str>) {
    match context {
        Some(context) => println!("Error: {kind} ({context})"),
        None => println!("Error: {kind}"),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut server = Server::new();
    server.set_port(8080);
    server.set_debug_level(DebugLevel::Errors);
    server.log_callback(write_log);
    server.error_callback(show_error);

    // Which headers are we interested in?
    server.listen_header("Host");

    server.register_page("GET", "/", page_index);
    server.register_page("GET", "/index.html", page_index);
    server.register_page("GET", "/favicon.ico", page_favicon);
    server.register_page("GET", "/README.md", page_readme);
    server.register_page("GET", "/*/index.html", page_index);

    let mut stats_at = Instant::now();
    loop {
        server.run(1000);
        if stats_at.elapsed() >= Duration::from_secs(10) {
            server.stats();
            stats_at = Instant::now();
        }
    }
}
