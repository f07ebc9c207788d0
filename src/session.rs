// src/session.rs
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace};

use crate::error::{ErrorKind, SysError};
use crate::parser::ParserState;
use crate::syscalls;

/// Largest number of unconsumed request bytes a session will buffer.
pub(crate) const MAX_HEADER_SIZE: usize = 10240;
const IN_BUFFER_INITIAL: usize = 128;

/// Which half of the connection the event loop watches for this session.
/// The writing states are traversed in order after a request dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoState {
    Reading,
    WritingHeaders,
    WritingBody,
    WritingSharedBody,
}

/// Reply payload referenced from handler-owned storage. The session writes
/// it after the owned body and never copies or frees it.
#[derive(Debug, Clone)]
pub enum SharedBody {
    Static(&'static [u8]),
    Shared(Arc<[u8]>),
}

impl SharedBody {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SharedBody::Static(bytes) => bytes,
            SharedBody::Shared(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&'static [u8]> for SharedBody {
    fn from(bytes: &'static [u8]) -> Self {
        SharedBody::Static(bytes)
    }
}

impl From<&'static str> for SharedBody {
    fn from(text: &'static str) -> Self {
        SharedBody::Static(text.as_bytes())
    }
}

impl From<Arc<[u8]>> for SharedBody {
    fn from(bytes: Arc<[u8]>) -> Self {
        SharedBody::Shared(bytes)
    }
}

/// State for one TCP connection and its current request/reply cycle.
///
/// Handlers receive `&mut Session` and use the public methods below; the
/// parser, reply pipeline and event loop drive the rest.
pub struct Session {
    pub(crate) socket: Option<RawFd>,
    pub(crate) parser_state: ParserState,
    pub(crate) io_state: IoState,

    // Incoming bytes not yet consumed by the parser. `in_capacity` is the
    // managed allocation size; `scanned` counts bytes already run through
    // the state machine but still part of an unfinished token.
    pub(crate) in_buffer: Vec<u8>,
    pub(crate) in_capacity: usize,
    pub(crate) scanned: usize,

    // Request tokens, populated as the parser completes them
    pub(crate) method: Option<String>,
    pub(crate) full_url: Option<String>,
    pub(crate) protocol: Option<String>,
    pub(crate) wildcard: Option<String>,
    pub(crate) current_header: Option<String>,
    pub(crate) request_headers: Vec<(String, String)>,
    pub(crate) content_length: Option<usize>,
    pub(crate) content: Vec<u8>,

    // Reply under construction
    pub(crate) response_code: u16,
    pub(crate) route: Option<usize>,
    pub(crate) body_size_hint: usize,
    pub(crate) reply_headers: Vec<(String, String)>,
    pub(crate) header_data: Vec<u8>,
    pub(crate) body: Option<Vec<u8>>,
    pub(crate) shared: Option<SharedBody>,
    pub(crate) write_pointer: usize,

    pub(crate) start_time: Instant,
    pub(crate) start_pending: bool,
    pub(crate) last_action: u64,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            socket: None,
            parser_state: ParserState::Method,
            io_state: IoState::Reading,
            in_buffer: Vec::new(),
            in_capacity: 0,
            scanned: 0,
            method: None,
            full_url: None,
            protocol: None,
            wildcard: None,
            current_header: None,
            request_headers: Vec::new(),
            content_length: None,
            content: Vec::new(),
            response_code: 500,
            route: None,
            body_size_hint: 0,
            reply_headers: Vec::new(),
            header_data: Vec::new(),
            body: None,
            shared: None,
            write_pointer: 0,
            start_time: Instant::now(),
            start_pending: true,
            last_action: 0,
        }
    }

    /// Reinitialize this slot for a freshly accepted connection.
    pub(crate) fn attach(&mut self, fd: RawFd, now: u64) {
        *self = Session::new();
        self.socket = Some(fd);
        self.last_action = now;
    }

    /// Make room for the next read: allocate on first use, grow when full.
    /// Full at the cap means the request made no progress in 10240 bytes.
    pub(crate) fn ensure_read_capacity(&mut self) -> Result<(), ErrorKind> {
        if self.in_capacity == 0 {
            self.in_capacity = IN_BUFFER_INITIAL;
        } else if self.in_buffer.len() == self.in_capacity {
            if self.in_capacity == MAX_HEADER_SIZE {
                return Err(ErrorKind::HeaderTooBig);
            }
            self.in_capacity = (self.in_capacity * 3 / 2 + 1).min(MAX_HEADER_SIZE);
        }
        Ok(())
    }

    /// Release all request-scoped state, leaving the slot ready to parse the
    /// next request.
    pub(crate) fn empty(&mut self) {
        self.parser_state = ParserState::Method;
        self.in_buffer = Vec::new();
        self.in_capacity = 0;
        self.scanned = 0;
        self.method = None;
        self.full_url = None;
        self.protocol = None;
        self.wildcard = None;
        self.current_header = None;
        self.request_headers.clear();
        self.content_length = None;
        self.content = Vec::new();
        self.response_code = 500;
        self.route = None;
        self.body_size_hint = 0;
        self.reply_headers.clear();
        self.header_data = Vec::new();
        self.body = None;
        self.shared = None;
        self.write_pointer = 0;
        self.start_pending = true;
    }

    /// Close the socket (if open) and release all request state. The slot
    /// itself stays allocated for reuse.
    pub(crate) fn end(&mut self) -> Result<(), SysError> {
        let result = match self.socket.take() {
            Some(fd) => {
                trace!(fd, "closing session socket");
                syscalls::close_fd(fd)
            }
            None => Ok(()),
        };
        self.io_state = IoState::Reading;
        self.empty();
        result
    }

    /// Set the HTTP status code for the reply. Defaults to 500.
    pub fn response(&mut self, code: u16) {
        self.response_code = code;
    }

    /// Queue a reply header. A repeated name replaces the queued value;
    /// otherwise the header is appended, and insertion order is preserved
    /// on the wire.
    pub fn add_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.reply_headers.iter_mut().find(|(known, _)| known == name) {
            if entry.1 != value {
                entry.1 = value.to_owned();
            }
            return;
        }
        self.reply_headers.push((name.to_owned(), value.to_owned()));
    }

    /// Append bytes to the owned reply body. The first call sizes the buffer
    /// from the route's bytes-per-request history. Returns the count queued.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        match &mut self.body {
            None => {
                let size = self.body_size_hint.max(256).max(data.len());
                let mut body = Vec::new();
                if body.try_reserve_exact(size).is_err() {
                    error!(size, "reply body allocation failed");
                    return 0;
                }
                trace!(size, "allocating reply body buffer");
                body.extend_from_slice(data);
                self.body = Some(body);
            }
            Some(body) => {
                if body.len() + data.len() > body.capacity()
                    && body.try_reserve_exact(data.len() + 64).is_err()
                {
                    error!("reply body growth failed");
                    return 0;
                }
                body.extend_from_slice(data);
            }
        }
        data.len()
    }

    /// Register handler-owned bytes to be sent after the owned body.
    /// Replaces any previously registered shared body. Returns its length.
    pub fn shared_body(&mut self, body: impl Into<SharedBody>) -> usize {
        let body = body.into();
        let len = body.len();
        self.shared = Some(body);
        len
    }

    /// Value of a retained request header, or `None` when the header was
    /// absent or not listened for. Case-sensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(known, _)| known == name)
            .map(|(_, value)| value.as_str())
    }

    /// Declared `Content-Length` of the request, or `None` when the header
    /// was absent. Negative declared values clamp to zero.
    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Request body bytes (empty when the body phase was skipped).
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The substring matched by the route pattern's `*`, if any.
    pub fn wildcard(&self) -> Option<&str> {
        self.wildcard.as_deref()
    }
}
