// src/response.rs
use std::os::unix::io::RawFd;

use tracing::debug;

use crate::error::ErrorKind;
use crate::router::Registry;
use crate::server::Hooks;
use crate::session::{IoState, Session, SharedBody};
use crate::syscalls;

pub(crate) const SERVER_HEADER: &str = "Miniweb/0.0.1 (Linux)";
const NOT_FOUND_BODY: &[u8] = b"Page not found\n";

fn reason_phrase(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        401 => Some("Unauthorized"),
        404 => Some("Not Found"),
        500 => Some("Internal Server Error"),
        _ => None,
    }
}

/// Run the matched handler (or the 404 fallback), then seal the reply:
/// default headers, `Content-Length`, serialized status line + headers.
pub(crate) fn send_reply(session: &mut Session, registry: &Registry) {
    // Defaults first so handlers can overwrite the values in place
    session.add_header("Server", SERVER_HEADER);
    session.add_header("Content-Type", "text/html");
    if session.protocol.as_deref() == Some("HTTP/1.1") {
        session.add_header("Keep-Alive", "timeout=10, max=1000");
    }

    match session.route {
        Some(idx) => {
            session.response_code = 500;
            let handler = registry.route(idx).handler;
            handler(session);
        }
        None => {
            session.response_code = 404;
            session.write(NOT_FOUND_BODY);
        }
    }

    let content_length = session.body.as_ref().map_or(0, Vec::len)
        + session.shared.as_ref().map_or(0, SharedBody::len);
    session.add_header("Content-Length", &content_length.to_string());

    build_header_data(session);
    session.io_state = IoState::WritingHeaders;
}

/// Serialize `{protocol} {code} {reason}\r\n`, the queued headers in
/// insertion order, and the terminating blank line.
fn build_header_data(session: &mut Session) {
    let protocol = session.protocol.as_deref().unwrap_or("HTTP/1.0");
    let status_line = match reason_phrase(session.response_code) {
        Some(reason) => format!("{} {} {}\r\n", protocol, session.response_code, reason),
        None => format!("{} {} Unknown\r\n", protocol, session.response_code),
    };

    let mut data = Vec::with_capacity(status_line.len() + 32 * session.reply_headers.len() + 2);
    data.extend_from_slice(status_line.as_bytes());
    for (name, value) in &session.reply_headers {
        data.extend_from_slice(name.as_bytes());
        data.extend_from_slice(b": ");
        data.extend_from_slice(value.as_bytes());
        data.extend_from_slice(b"\r\n");
    }
    data.extend_from_slice(b"\r\n");

    session.header_data = data;
    session.write_pointer = 0;
}

enum Flush {
    Complete,
    Yield,
    Fault(std::io::Error),
}

fn flush_bytes(fd: RawFd, bytes: &[u8], write_pointer: &mut usize) -> Flush {
    while *write_pointer < bytes.len() {
        match syscalls::write_fd(fd, &bytes[*write_pointer..]) {
            Ok(Some(0)) | Ok(None) => return Flush::Yield,
            Ok(Some(written)) => *write_pointer += written,
            Err(err) => return Flush::Fault(err),
        }
    }
    Flush::Complete
}

/// Drive the current output stage. Called on write readiness; a partial
/// write leaves `write_pointer` where the next readiness event resumes.
pub(crate) fn drive_write(session: &mut Session, registry: &mut Registry, hooks: &Hooks) {
    let Some(fd) = session.socket else { return };
    let flush = match session.io_state {
        IoState::Reading => return,
        IoState::WritingHeaders => flush_bytes(fd, &session.header_data, &mut session.write_pointer),
        IoState::WritingBody => {
            let bytes: &[u8] = session.body.as_deref().unwrap_or(&[]);
            flush_bytes(fd, bytes, &mut session.write_pointer)
        }
        IoState::WritingSharedBody => {
            let bytes: &[u8] = session.shared.as_ref().map_or(&[], SharedBody::as_bytes);
            flush_bytes(fd, bytes, &mut session.write_pointer)
        }
    };

    match flush {
        Flush::Yield => {}
        Flush::Fault(err) => {
            hooks.report(ErrorKind::Write, Some(&err.to_string()));
            if let Err(close_err) = session.end() {
                hooks.report(close_err.kind, Some(&close_err.source.to_string()));
            }
        }
        Flush::Complete => advance_stage(session, registry, hooks),
    }
}

fn advance_stage(session: &mut Session, registry: &mut Registry, hooks: &Hooks) {
    session.write_pointer = 0;
    match session.io_state {
        IoState::WritingHeaders if session.body.is_some() => {
            session.io_state = IoState::WritingBody;
        }
        IoState::WritingHeaders | IoState::WritingBody if session.shared.is_some() => {
            session.io_state = IoState::WritingSharedBody;
        }
        _ => finish_reply(session, registry, hooks),
    }
}

/// The last reply byte has flushed: update route metrics, invoke the log
/// hook, release request state, and close (HTTP/1.0) or resume reading
/// (HTTP/1.1).
fn finish_reply(session: &mut Session, registry: &mut Registry, hooks: &Hooks) {
    let elapsed = session.start_time.elapsed();
    if let Some(idx) = session.route {
        let body_bytes = session.body.as_ref().map_or(0, Vec::len) as u64;
        registry.route_mut(idx).metrics.record(elapsed, body_bytes);
    }
    if let Some(log) = hooks.log {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        log(
            session.full_url.as_deref().unwrap_or(""),
            session.response_code,
            micros,
        );
    }

    if session.protocol.as_deref() == Some("HTTP/1.1") {
        session.empty();
        session.io_state = IoState::Reading;
        debug!("reply complete, session back to reading");
    } else if let Err(err) = session.end() {
        hooks.report(err.kind, Some(&err.source.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hi_handler(session: &mut Session) {
        session.response(200);
        session.write(b"Hi");
    }

    fn parsed_session(protocol: &str) -> Session {
        let mut session = Session::new();
        session.method = Some("GET".into());
        session.full_url = Some("/".into());
        session.protocol = Some(protocol.into());
        session
    }

    #[test]
    fn serializes_the_pinned_http_1_0_reply() {
        let mut registry = Registry::new();
        registry.register("GET", "/", hi_handler);

        let mut session = parsed_session("HTTP/1.0");
        session.route = Some(0);
        send_reply(&mut session, &registry);

        assert_eq!(
            session.header_data.as_slice(),
            b"HTTP/1.0 200 OK\r\nServer: Miniweb/0.0.1 (Linux)\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\n"
                .as_slice()
        );
        assert_eq!(session.body.as_deref(), Some(b"Hi".as_slice()));
        assert_eq!(session.io_state, IoState::WritingHeaders);
    }

    #[test]
    fn http_1_1_replies_advertise_keep_alive() {
        let mut registry = Registry::new();
        registry.register("GET", "/", hi_handler);

        let mut session = parsed_session("HTTP/1.1");
        session.route = Some(0);
        send_reply(&mut session, &registry);

        let head = String::from_utf8(session.header_data.clone()).expect("ascii");
        assert!(head.contains("Keep-Alive: timeout=10, max=1000\r\n"));
    }

    #[test]
    fn missing_route_becomes_the_pinned_404() {
        let registry = Registry::new();
        let mut session = parsed_session("HTTP/1.1");
        session.full_url = Some("/missing".into());
        send_reply(&mut session, &registry);

        assert_eq!(session.response_code, 404);
        let head = String::from_utf8(session.header_data.clone()).expect("ascii");
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Content-Length: 15\r\n"));
        assert_eq!(session.body.as_deref(), Some(b"Page not found\n".as_slice()));
    }

    #[test]
    fn unknown_codes_render_as_unknown() {
        fn teapot(session: &mut Session) {
            session.response(418);
        }
        let mut registry = Registry::new();
        registry.register("GET", "/", teapot);

        let mut session = parsed_session("HTTP/1.1");
        session.route = Some(0);
        send_reply(&mut session, &registry);

        let head = String::from_utf8(session.header_data.clone()).expect("ascii");
        assert!(head.starts_with("HTTP/1.1 418 Unknown\r\n"));
    }

    #[test]
    fn content_length_counts_owned_plus_shared_bytes() {
        fn both_bodies(session: &mut Session) {
            session.response(200);
            session.write(b"hello ");
            session.shared_body("world");
        }
        let mut registry = Registry::new();
        registry.register("GET", "/", both_bodies);

        let mut session = parsed_session("HTTP/1.1");
        session.route = Some(0);
        send_reply(&mut session, &registry);

        let head = String::from_utf8(session.header_data.clone()).expect("ascii");
        assert!(head.contains("Content-Length: 11\r\n"));
    }

    #[test]
    fn handlers_can_overwrite_default_headers_in_place() {
        fn json_handler(session: &mut Session) {
            session.response(200);
            session.add_header("Content-Type", "application/json");
            session.write(b"{}");
        }
        let mut registry = Registry::new();
        registry.register("GET", "/", json_handler);

        let mut session = parsed_session("HTTP/1.0");
        session.route = Some(0);
        send_reply(&mut session, &registry);

        let head = String::from_utf8(session.header_data.clone()).expect("ascii");
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(!head.contains("text/html"));
        // Defaults keep their insertion position
        let server_at = head.find("Server:").expect("server header");
        let type_at = head.find("Content-Type:").expect("type header");
        assert!(server_at < type_at);
    }
}
