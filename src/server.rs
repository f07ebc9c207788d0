// src/server.rs
use std::os::unix::io::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, trace};

use crate::error::ErrorKind;
use crate::headers::ListenHeaderSet;
use crate::parser::{self, ParseOutcome};
use crate::response;
use crate::router::{Handler, Registry, RouteStats};
use crate::session::{IoState, Session};
use crate::syscalls::{self, INTEREST_READ, INTEREST_WRITE, PollSet};

const LISTEN_BACKLOG: i32 = 100;
const LISTEN_RETRY_SECS: u64 = 3;
const SESSION_HARD_CAP: usize = 999;

/// Engine verbosity, from silent to per-request tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    None,
    Errors,
    Data,
    All,
}

/// Invoked after each reply with `(url, response_code, microseconds)`.
pub type LogCallback = fn(&str, u16, u64);

/// Invoked on internal failures with the error kind and optional context.
pub type ErrorCallback = fn(ErrorKind, Option<&str>);

/// Copy of the host-installed sinks, handed down the reply pipeline.
#[derive(Clone, Copy)]
pub(crate) struct Hooks {
    pub log: Option<LogCallback>,
    pub error: Option<ErrorCallback>,
    pub debug: DebugLevel,
}

impl Hooks {
    pub(crate) fn report(&self, kind: ErrorKind, context: Option<&str>) {
        if let Some(error_callback) = self.error {
            error_callback(kind, context);
        }
        if self.debug >= DebugLevel::Errors {
            match context {
                Some(context) => error!(%kind, context, "server error"),
                None => error!(%kind, "server error"),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Token {
    Listener,
    Session(usize),
}

/// The server: configuration, registry, listen socket and session list, all
/// owned by one value and driven from one thread. Handlers run to completion
/// inline on that thread.
pub struct Server {
    port: u16,
    max_sessions: usize,
    timeout_secs: u64,
    free_timeout_secs: u64,
    debug_level: DebugLevel,
    log_callback: Option<LogCallback>,
    error_callback: Option<ErrorCallback>,

    listen_socket: Option<RawFd>,
    listen_retry_at: u64,
    sessions: Vec<Session>,
    registry: Registry,
    listen_headers: ListenHeaderSet,
    sessions_timed_out: u64,
    last_sweep: u64,

    poll: PollSet,
    tokens: Vec<Token>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            port: 80,
            max_sessions: 500,
            timeout_secs: 5,
            free_timeout_secs: 15,
            debug_level: DebugLevel::None,
            log_callback: None,
            error_callback: None,
            listen_socket: None,
            listen_retry_at: 0,
            sessions: Vec::new(),
            registry: Registry::new(),
            listen_headers: ListenHeaderSet::new(),
            sessions_timed_out: 0,
            last_sweep: 0,
            poll: PollSet::new(),
            tokens: Vec::new(),
        }
    }

    /// Configure the listen port; takes effect at the next listener creation.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Cap on concurrently allocated session slots (hard cap 999).
    pub fn set_max_sessions(&mut self, max: usize) {
        self.max_sessions = max.min(SESSION_HARD_CAP);
    }

    /// Seconds of inactivity before a connection is closed.
    pub fn set_timeout_secs(&mut self, secs: u64) {
        self.timeout_secs = secs;
    }

    /// Seconds of inactivity before a session slot is released.
    pub fn set_free_timeout_secs(&mut self, secs: u64) {
        self.free_timeout_secs = secs;
    }

    /// Set engine verbosity; returns the previous level.
    pub fn set_debug_level(&mut self, level: DebugLevel) -> DebugLevel {
        std::mem::replace(&mut self.debug_level, level)
    }

    pub fn log_callback(&mut self, callback: LogCallback) {
        self.log_callback = Some(callback);
    }

    pub fn error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    /// Register a handler for `(method, pattern)`. The pattern may contain
    /// one `*`, which must match at least one character. Registering a POST
    /// route also starts listening for `Content-Length`.
    pub fn register_page(&mut self, method: &str, pattern: &str, handler: Handler) {
        if method == "POST" {
            self.listen_headers.listen("Content-Length");
        }
        self.registry.register(method, pattern, handler);
    }

    /// Retain request headers named `name` for handler inspection.
    pub fn listen_header(&mut self, name: &str) {
        self.listen_headers.listen(name);
    }

    /// Local port of the live listener, once one exists.
    pub fn port(&self) -> Option<u16> {
        self.listen_socket
            .and_then(|fd| syscalls::local_port(fd).ok())
    }

    /// Allocated session slots, live and reusable.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connections closed by the idle timeout so far.
    pub fn sessions_timed_out(&self) -> u64 {
        self.sessions_timed_out
    }

    fn hooks(&self) -> Hooks {
        Hooks {
            log: self.log_callback,
            error: self.error_callback,
            debug: self.debug_level,
        }
    }

    /// One event-loop iteration: refresh the listener, block in `poll` for at
    /// most `timeout_ms`, drive ready sessions, expire idle ones, and accept
    /// one new connection.
    pub fn run(&mut self, timeout_ms: i32) {
        let hooks = self.hooks();
        let now = wall_secs();

        self.ensure_listener(now, &hooks);

        // Release stale slots: head plus second-to-last, bounded work per pass
        self.collect_stale_slot(0, now, &hooks);
        if self.sessions.len() >= 2 {
            self.collect_stale_slot(self.sessions.len() - 2, now, &hooks);
        }

        self.poll.clear();
        self.tokens.clear();
        if let Some(fd) = self.listen_socket {
            if self.sessions.len() < self.max_sessions {
                self.poll.push(fd, INTEREST_READ);
                self.tokens.push(Token::Listener);
            }
        }
        for (idx, session) in self.sessions.iter().enumerate() {
            if let Some(fd) = session.socket {
                let interest = match session.io_state {
                    IoState::Reading => INTEREST_READ,
                    _ => INTEREST_WRITE,
                };
                self.poll.push(fd, interest);
                self.tokens.push(Token::Session(idx));
            }
        }

        let ready = match self.poll.wait(timeout_ms) {
            Ok(count) => count,
            Err(err) => {
                hooks.report(err.kind, Some(&err.source.to_string()));
                return;
            }
        };

        let mut accept_pending = false;
        if ready > 0 {
            for token_idx in 0..self.tokens.len() {
                let token = self.tokens[token_idx];
                match token {
                    Token::Listener => {
                        accept_pending = self.poll.readable(token_idx);
                    }
                    Token::Session(idx) => {
                        if self.poll.readable(token_idx) {
                            self.read_session(idx, now, &hooks);
                        }
                        if self.poll.writable(token_idx) {
                            response::drive_write(
                                &mut self.sessions[idx],
                                &mut self.registry,
                                &hooks,
                            );
                        }
                        if self.poll.errored(token_idx) {
                            self.close_session(idx, &hooks);
                        }
                    }
                }
            }
        }

        self.sweep_idle(now, &hooks);

        if accept_pending {
            self.accept_one(now, &hooks);
        }
    }

    fn ensure_listener(&mut self, now: u64, hooks: &Hooks) {
        if self.listen_socket.is_some() || self.listen_retry_at > now {
            return;
        }
        // Failures back off before the next attempt
        self.listen_retry_at = now + LISTEN_RETRY_SECS;
        if hooks.debug >= DebugLevel::All {
            trace!(port = self.port, "creating listen socket");
        }
        match syscalls::create_listen_socket(self.port, LISTEN_BACKLOG) {
            Ok(fd) => {
                self.listen_socket = Some(fd);
                debug!(port = self.port, "listening");
            }
            Err(err) => hooks.report(err.kind, Some(&err.source.to_string())),
        }
    }

    fn collect_stale_slot(&mut self, idx: usize, now: u64, hooks: &Hooks) {
        if idx >= self.sessions.len() {
            return;
        }
        if self.sessions[idx].last_action + self.free_timeout_secs < now {
            self.close_session(idx, hooks);
            self.sessions.remove(idx);
        }
    }

    fn read_session(&mut self, idx: usize, now: u64, hooks: &Hooks) {
        let session = &mut self.sessions[idx];
        let Some(fd) = session.socket else { return };
        session.last_action = now;

        if let Err(kind) = session.ensure_read_capacity() {
            hooks.report(kind, None);
            self.close_session(idx, hooks);
            return;
        }
        let used = session.in_buffer.len();
        session.in_buffer.resize(session.in_capacity, 0);
        let read = syscalls::read_fd(fd, &mut session.in_buffer[used..]);
        let count = match read {
            Ok(Some(0)) | Err(_) => {
                // EOF or a dead peer
                session.in_buffer.truncate(used);
                self.close_session(idx, hooks);
                return;
            }
            Ok(None) => {
                session.in_buffer.truncate(used);
                return;
            }
            Ok(Some(count)) => count,
        };
        session.in_buffer.truncate(used + count);
        if hooks.debug >= DebugLevel::All {
            trace!(bytes = count, "read");
        }

        match parser::advance(session, &self.listen_headers) {
            ParseOutcome::NeedMore => {}
            ParseOutcome::Fault => {
                if hooks.debug >= DebugLevel::Errors {
                    error!("request parse error, closing session");
                }
                self.close_session(idx, hooks);
            }
            ParseOutcome::Dispatch => self.dispatch(idx, hooks),
        }
    }

    fn dispatch(&mut self, idx: usize, hooks: &Hooks) {
        let session = &mut self.sessions[idx];
        let method = session.method.as_deref().unwrap_or("");
        let url = session.full_url.as_deref().unwrap_or("");
        let protocol = session.protocol.as_deref().unwrap_or("");
        if hooks.debug >= DebugLevel::All {
            trace!(method, url, protocol, "dispatching request");
        }
        match self.registry.resolve(method, url, protocol) {
            Some((route_idx, capture)) => {
                session.route = Some(route_idx);
                session.wildcard = capture;
                session.body_size_hint = self.registry.route(route_idx).metrics.body_size_hint();
            }
            None => session.route = None,
        }
        response::send_reply(session, &self.registry);
    }

    fn sweep_idle(&mut self, now: u64, hooks: &Hooks) {
        if self.last_sweep == now {
            return;
        }
        self.last_sweep = now;
        for idx in 0..self.sessions.len() {
            let session = &self.sessions[idx];
            if session.socket.is_some() && session.last_action + self.timeout_secs < now {
                if hooks.debug >= DebugLevel::All {
                    trace!("closing idle session");
                }
                self.close_session(idx, hooks);
                self.sessions_timed_out += 1;
            }
        }
    }

    fn accept_one(&mut self, now: u64, hooks: &Hooks) {
        let Some(listen_fd) = self.listen_socket else {
            return;
        };
        let fd = match syscalls::accept_connection(listen_fd) {
            Ok(Some(fd)) => fd,
            Ok(None) => return,
            Err(err) => {
                hooks.report(err.kind, Some(&err.source.to_string()));
                return;
            }
        };
        if hooks.debug >= DebugLevel::All {
            trace!(fd, "accepted connection");
        }
        // Reuse a freed slot before allocating a fresh one
        match self.sessions.iter().position(|s| s.socket.is_none()) {
            Some(slot) => self.sessions[slot].attach(fd, now),
            None => {
                let mut session = Session::new();
                session.attach(fd, now);
                self.sessions.push(session);
            }
        }
    }

    fn close_session(&mut self, idx: usize, hooks: &Hooks) {
        if let Err(err) = self.sessions[idx].end() {
            hooks.report(err.kind, Some(&err.source.to_string()));
        }
    }

    /// Log per-route request counts and cumulative handler time.
    pub fn stats(&self) {
        info!(
            active_sessions = self.sessions.len(),
            timed_out = self.sessions_timed_out,
            "session stats"
        );
        for stats in self.route_stats() {
            let route = format!("{} {}", stats.method, stats.pattern);
            info!(
                count = stats.request_count,
                time_secs = stats.total_time.as_secs_f64(),
                route = %route,
                "route stats"
            );
        }
    }

    /// The numbers behind [`Server::stats`].
    pub fn route_stats(&self) -> Vec<RouteStats> {
        self.registry
            .iter()
            .map(|route| RouteStats {
                method: route.method.clone(),
                pattern: route.pattern(),
                request_count: route.metrics.request_count,
                total_time: route.metrics.total_time,
            })
            .collect()
    }

    /// Close every socket and release all server state.
    pub fn tidyup(&mut self) {
        let hooks = self.hooks();
        for idx in 0..self.sessions.len() {
            self.close_session(idx, &hooks);
        }
        self.sessions.clear();
        self.listen_headers.clear();
        self.registry.clear();
        if let Some(fd) = self.listen_socket.take() {
            if let Err(err) = syscalls::close_fd(fd) {
                hooks.report(err.kind, Some(&err.source.to_string()));
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.tidyup();
    }
}

fn wall_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
