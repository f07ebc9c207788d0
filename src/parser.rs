// src/parser.rs
use std::time::Instant;

use tracing::trace;

use crate::headers::ListenHeaderSet;
use crate::session::Session;

/// Parser position within the current request. `Error` is terminal: the
/// session is torn down, no reply is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParserState {
    Method,
    Url,
    Protocol,
    CrLf1,
    HeaderStart,
    HeaderName,
    HeaderColonSp,
    HeaderValue,
    CrLfTerminator,
    Body,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseOutcome {
    /// Everything buffered has been consumed or is part of an open token.
    NeedMore,
    /// A complete request is ready; the parser has reset for the next one.
    Dispatch,
    /// The byte stream violated the grammar.
    Fault,
}

fn is_token_byte(byte: u8) -> bool {
    byte > 0x20 && byte < 0x80
}

fn is_value_byte(byte: u8) -> bool {
    byte >= 0x20 && byte < 0x80
}

fn take_token(buf: &[u8]) -> String {
    // Callers pass bytes already vetted by the token classes: plain ASCII
    String::from_utf8_lossy(buf).into_owned()
}

fn declared_content_length(session: &Session) -> Option<usize> {
    let raw = session.header("Content-Length")?;
    let parsed: i64 = raw.trim().parse().unwrap_or(0);
    Some(parsed.max(0) as usize)
}

/// Run the state machine over the unconsumed bytes of `session.in_buffer`.
///
/// Tokens are sliced out of the buffer when their terminator arrives, so the
/// result is identical for any fragmentation of the same byte stream. The
/// loop stops at `Dispatch`: a second request is never parsed while a reply
/// is in flight.
pub(crate) fn advance(session: &mut Session, listened: &ListenHeaderSet) -> ParseOutcome {
    let mut consumed = 0usize;
    let mut pos = session.scanned;

    let outcome = loop {
        if session.parser_state == ParserState::Body {
            let wanted = session.content_length.unwrap_or(0);
            let take = (session.in_buffer.len() - consumed).min(wanted - session.content.len());
            if take > 0 {
                session
                    .content
                    .extend_from_slice(&session.in_buffer[consumed..consumed + take]);
                consumed += take;
            }
            pos = consumed;
            if session.content.len() == wanted {
                session.parser_state = ParserState::Method;
                break ParseOutcome::Dispatch;
            }
            break ParseOutcome::NeedMore;
        }

        if pos >= session.in_buffer.len() {
            break ParseOutcome::NeedMore;
        }
        let byte = session.in_buffer[pos];
        pos += 1;

        match session.parser_state {
            ParserState::Method => {
                // The request's clock starts on its first byte
                if session.start_pending {
                    session.start_time = Instant::now();
                    session.start_pending = false;
                }
                if byte == b' ' {
                    session.method = Some(take_token(&session.in_buffer[consumed..pos - 1]));
                    consumed = pos;
                    session.parser_state = ParserState::Url;
                } else if !is_token_byte(byte) {
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::Url => {
                if byte == b' ' {
                    session.full_url =
                        Some(take_token(&session.in_buffer[consumed..pos - 1]));
                    consumed = pos;
                    session.parser_state = ParserState::Protocol;
                } else if !is_token_byte(byte) {
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::Protocol => {
                if byte == b'\r' {
                    session.protocol =
                        Some(take_token(&session.in_buffer[consumed..pos - 1]));
                    consumed = pos;
                    session.parser_state = ParserState::CrLf1;
                } else if !is_token_byte(byte) {
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::CrLf1 => {
                if byte == b'\n' {
                    consumed = pos;
                    session.parser_state = ParserState::HeaderStart;
                } else {
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::HeaderStart => {
                if byte == b'\r' {
                    session.parser_state = ParserState::CrLfTerminator;
                } else if is_token_byte(byte) {
                    session.parser_state = ParserState::HeaderName;
                } else {
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::HeaderName => {
                if byte == b':' {
                    session.current_header = listened
                        .find(&session.in_buffer[consumed..pos - 1])
                        .map(str::to_owned);
                    consumed = pos;
                    session.parser_state = ParserState::HeaderColonSp;
                } else if !is_token_byte(byte) {
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::HeaderColonSp => {
                if byte == b' ' {
                    consumed = pos;
                    session.parser_state = ParserState::HeaderValue;
                } else {
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::HeaderValue => {
                if byte == b'\r' {
                    if let Some(name) = session.current_header.take() {
                        let value = take_token(&session.in_buffer[consumed..pos - 1]);
                        trace!(header = %name, value = %value, "retaining request header");
                        session.request_headers.push((name, value));
                    }
                    consumed = pos;
                    session.parser_state = ParserState::CrLf1;
                } else if !is_value_byte(byte) {
                    session.current_header = None;
                    session.parser_state = ParserState::Error;
                }
            }
            ParserState::CrLfTerminator => {
                if byte == b'\n' {
                    consumed = pos;
                    session.content_length = declared_content_length(session);
                    let wanted = session.content_length.unwrap_or(0);
                    if session.method.as_deref() == Some("POST") && wanted > 0 {
                        if session.content.try_reserve_exact(wanted).is_err() {
                            session.parser_state = ParserState::Error;
                        } else {
                            session.parser_state = ParserState::Body;
                        }
                    } else {
                        session.parser_state = ParserState::Method;
                        break ParseOutcome::Dispatch;
                    }
                } else {
                    session.parser_state = ParserState::Error;
                }
            }
            // Body is handled at the top of the loop; a session in Error is
            // torn down by the caller before more bytes arrive.
            ParserState::Body | ParserState::Error => {}
        }

        if session.parser_state == ParserState::Error {
            break ParseOutcome::Fault;
        }
    };

    // Shift consumed bytes off the front; anything left belongs to the next
    // request (or to an open token).
    if consumed > 0 {
        session.in_buffer.drain(..consumed);
    }
    session.scanned = match outcome {
        ParseOutcome::NeedMore => pos - consumed,
        _ => 0,
    };
    outcome
}
