//! The line-based authentication handshake that precedes binary framing.
//!
//! The client must send a single NUL byte, then CRLF-terminated commands:
//! `AUTH <MECHANISM> <HEX-ARG>?`, optionally `NEGOTIATE_UNIX_FD`, and
//! finally `BEGIN`. Bytes following `BEGIN` in the same chunk already belong
//! to the binary stream and are handed back untouched.

use thiserror::Error;
use tracing::trace;

/// Upper bound on one handshake line; longer lines are treated as hostile.
const MAX_LINE_LEN: usize = 16 * 1024;

/// Credentials claimed during authentication. `EXTERNAL` carries a user id;
/// `ANONYMOUS` leaves it absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: Option<u32>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("connection did not start with a NUL byte")]
    MissingNul,
    #[error("handshake line too long")]
    LineTooLong,
    #[error("handshake line is not valid ASCII")]
    NotAscii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitNull,
    AwaitAuth,
    AwaitBeginOrNegotiate,
    Active,
}

/// Output of feeding one chunk of inbound bytes to the state machine.
#[derive(Debug, Default)]
pub struct Advance {
    /// Server replies to write back, already CRLF-terminated.
    pub reply: Vec<u8>,
    /// `BEGIN` was received; the connection switches to binary framing.
    pub begun: bool,
    /// Bytes that arrived after `BEGIN` in the same chunk.
    pub leftover: Vec<u8>,
}

#[derive(Debug)]
pub struct Handshake {
    state: State,
    server_id: String,
    fd_passing_supported: bool,
    fd_passing: bool,
    credentials: Credentials,
    line: Vec<u8>,
}

impl Handshake {
    pub fn new(server_id: &str, fd_passing_supported: bool) -> Self {
        Self {
            state: State::AwaitNull,
            server_id: server_id.to_string(),
            fd_passing_supported,
            fd_passing: false,
            credentials: Credentials::default(),
            line: Vec::new(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Whether `NEGOTIATE_UNIX_FD` was agreed.
    pub fn unix_fd_agreed(&self) -> bool {
        self.fd_passing
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    /// Feeds inbound bytes through the state machine.
    pub fn advance(&mut self, mut input: &[u8]) -> Result<Advance, HandshakeError> {
        let mut out = Advance::default();
        if self.state == State::AwaitNull {
            let Some((&first, rest)) = input.split_first() else {
                return Ok(out);
            };
            if first != 0 {
                return Err(HandshakeError::MissingNul);
            }
            self.state = State::AwaitAuth;
            input = rest;
        }
        self.line.extend_from_slice(input);

        while let Some(pos) = find_crlf(&self.line) {
            let line: Vec<u8> = self.line.drain(..pos + 2).collect();
            let line = std::str::from_utf8(&line[..pos])
                .map_err(|_| HandshakeError::NotAscii)?;
            trace!("handshake command: {line}");
            if self.handle_line(line, &mut out.reply) {
                out.begun = true;
                out.leftover = std::mem::take(&mut self.line);
                return Ok(out);
            }
        }
        if self.line.len() > MAX_LINE_LEN {
            return Err(HandshakeError::LineTooLong);
        }
        Ok(out)
    }

    /// Returns true once `BEGIN` is seen.
    fn handle_line(&mut self, line: &str, reply: &mut Vec<u8>) -> bool {
        let mut words = line.split_ascii_whitespace();
        let command = words.next().unwrap_or("");
        match (self.state, command) {
            (State::AwaitAuth, "AUTH") => match (words.next(), words.next()) {
                (Some("EXTERNAL"), Some(hex)) => match decode_hex_uid(hex) {
                    Some(uid) => {
                        self.credentials = Credentials { uid: Some(uid) };
                        self.ok(reply);
                    }
                    None => reply.extend_from_slice(b"REJECTED EXTERNAL ANONYMOUS\r\n"),
                },
                (Some("ANONYMOUS"), _) => {
                    self.credentials = Credentials::default();
                    self.ok(reply);
                }
                _ => reply.extend_from_slice(b"REJECTED EXTERNAL ANONYMOUS\r\n"),
            },
            (State::AwaitBeginOrNegotiate, "NEGOTIATE_UNIX_FD") => {
                if self.fd_passing_supported {
                    self.fd_passing = true;
                    reply.extend_from_slice(b"AGREE_UNIX_FD\r\n");
                } else {
                    reply.extend_from_slice(b"ERROR\r\n");
                }
            }
            (State::AwaitBeginOrNegotiate, "BEGIN") => {
                self.state = State::Active;
                return true;
            }
            _ => reply.extend_from_slice(b"ERROR\r\n"),
        }
        false
    }

    fn ok(&mut self, reply: &mut Vec<u8>) {
        reply.extend_from_slice(format!("OK {}\r\n", self.server_id).as_bytes());
        self.state = State::AwaitBeginOrNegotiate;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// `AUTH EXTERNAL` carries the user id as ASCII digits, hex-encoded.
fn decode_hex_uid(hex: &str) -> Option<u32> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut ascii = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        ascii.push((hi * 16 + lo) as u8);
    }
    std::str::from_utf8(&ascii).ok()?.parse().ok()
}
