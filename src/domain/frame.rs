//! Text frame protocol: commands, headers, parsing and encoding.
//!
//! A frame is a command line, optional header lines, a blank line and an
//! optional body:
//!
//! ```text
//! SEND destination=/topic/chat
//! content-type:text/plain
//!
//! hello
//! ```
//!
//! Headers may be written inline on the command line (`key=value`) or on
//! their own line as `key=value` or `key:value`. One trailing NUL octet is
//! stripped so STOMP clients that terminate frames with `^@` are accepted.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ProtocolError;

/// Header naming the destination of SUBSCRIBE, UNSUBSCRIBE, SEND and MESSAGE.
pub const DESTINATION_HEADER: &str = "destination";

/// Header carrying the human-readable reason on ERROR frames.
pub const MESSAGE_HEADER: &str = "message";

/// Frame command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Client → server: open the session. `STOMP` is accepted as an alias.
    Connect,
    /// Client → server: add the session to a destination.
    Subscribe,
    /// Client → server: remove the session from a destination.
    Unsubscribe,
    /// Client → server: publish a body to a destination.
    Send,
    /// Client → server: close the session.
    Disconnect,
    /// Server → client: CONNECT accepted.
    Connected,
    /// Server → client: a body delivered from a destination.
    Message,
    /// Server → client: protocol failure, the transport closes afterwards.
    Error,
}

impl Command {
    /// Returns the wire spelling of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
        }
    }

    /// Returns `true` for commands a client is allowed to send.
    #[must_use]
    pub const fn is_client_command(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Subscribe | Self::Unsubscribe | Self::Send | Self::Disconnect
        )
    }

    /// Returns `true` for commands that may carry a body.
    #[must_use]
    pub const fn allows_body(self) -> bool {
        matches!(self, Self::Send | Self::Message | Self::Error)
    }

    const fn requires_destination(self) -> bool {
        matches!(self, Self::Subscribe | Self::Unsubscribe | Self::Send)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" | "STOMP" => Ok(Self::Connect),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "SEND" => Ok(Self::Send),
            "DISCONNECT" => Ok(Self::Disconnect),
            "CONNECTED" => Ok(Self::Connected),
            "MESSAGE" => Ok(Self::Message),
            "ERROR" => Ok(Self::Error),
            other => Err(ProtocolError::Malformed(format!("unknown command `{other}`"))),
        }
    }
}

/// One immutable protocol unit.
///
/// Header keys are unique; insertion order is kept so encoded frames are
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Frame {
    /// Creates a frame with no headers and no body.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Sets a header, replacing any previous value for the same key.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
        self
    }

    /// Sets the body. Empty bodies are stored as no body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.body = (!body.is_empty()).then_some(body);
        self
    }

    /// Builds the ERROR frame sent before a connection is closed.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(Command::Error)
            .with_header(MESSAGE_HEADER, message.clone())
            .with_body(message)
    }

    /// Returns the command kind.
    #[must_use]
    pub const fn command(&self) -> Command {
        self.command
    }

    /// Returns the value of a header, if present.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns all headers in insertion order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the `destination` header, if present.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.header(DESTINATION_HEADER)
    }

    /// Returns the body, if any.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Parses raw transport bytes into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when the input is not UTF-8, is
    /// empty, names an unknown command, has an invalid or duplicate header,
    /// carries a body on a command that does not allow one, or omits the
    /// `destination` header on SUBSCRIBE, UNSUBSCRIBE or SEND.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::Malformed("frame is not valid UTF-8".to_string()))?;
        let text = text.strip_suffix('\0').unwrap_or(text);
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Err(ProtocolError::Malformed("empty frame".to_string()));
        }

        let (head, body) = split_head(text);
        let mut lines = head.lines().map(|line| line.trim_end_matches('\r'));
        let Some(command_line) = lines.next() else {
            return Err(ProtocolError::Malformed("empty frame".to_string()));
        };

        let mut tokens = command_line.split_whitespace();
        let Some(command_token) = tokens.next() else {
            return Err(ProtocolError::Malformed("missing command".to_string()));
        };
        let mut frame = Self::new(command_token.parse()?);

        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                return Err(ProtocolError::Malformed(format!(
                    "expected key=value after command, got `{token}`"
                )));
            };
            frame.push_unique(key, value)?;
        }
        for line in lines.filter(|line| !line.is_empty()) {
            let Some(split) = line.find(['=', ':']) else {
                return Err(ProtocolError::Malformed(format!(
                    "header line without separator: `{line}`"
                )));
            };
            let (key, value) = line.split_at(split);
            frame.push_unique(key.trim(), value.get(1..).unwrap_or_default())?;
        }

        if let Some(body) = body.filter(|b| !b.is_empty()) {
            if !frame.command.allows_body() {
                return Err(ProtocolError::Malformed(format!(
                    "{} frames cannot carry a body",
                    frame.command
                )));
            }
            frame.body = Some(body.to_string());
        }

        if frame.command.requires_destination()
            && frame.destination().is_none_or(str::is_empty)
        {
            return Err(ProtocolError::Malformed(format!(
                "{} frame requires a destination header",
                frame.command
            )));
        }

        Ok(frame)
    }

    /// Renders the frame as wire text.
    ///
    /// Headers are written as `key:value` lines; line breaks inside header
    /// values are replaced by spaces.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.as_ref().map_or(0, String::len));
        out.push_str(self.command.as_str());
        out.push('\n');
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push(':');
            out.extend(value.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
            out.push('\n');
        }
        out.push('\n');
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out
    }

    fn push_unique(&mut self, key: &str, value: &str) -> Result<(), ProtocolError> {
        if key.is_empty() {
            return Err(ProtocolError::Malformed("empty header name".to_string()));
        }
        if self.header(key).is_some() {
            return Err(ProtocolError::Malformed(format!("duplicate header `{key}`")));
        }
        self.headers.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

/// Splits the text at the first blank line into head and body.
fn split_head(text: &str) -> (&str, Option<&str>) {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let end = offset + line.len();
        if offset > 0 && line.trim_end_matches(['\r', '\n']).is_empty() {
            return match (text.get(..offset), text.get(end..)) {
                (Some(head), Some(body)) => (head, Some(body)),
                _ => (text, None),
            };
        }
        offset = end;
    }
    (text, None)
}
