//! Sync Protocol Messages
//!
//! Wire format: `<kind>` optionally followed by `|` and `key=value` pairs
//! joined by `&`, e.g. `seek|time=12.5` or `rtt-pong|ts=1700000000000&ts2=1700000000050`.
//!
//! Two layers live here. [`Message`] is the vocabulary-agnostic codec that maps
//! strings to a kind plus ordered string arguments. [`Command`] is the closed set
//! of commands this crate speaks, with typed payloads, decoded once at the
//! boundary.

use std::fmt;

use thiserror::Error;

/// Separates the kind from the argument section
const KIND_SEPARATOR: char = '|';

/// Separates `key=value` pairs in the argument section
const PAIR_SEPARATOR: &str = "&";

/// Separates a key from its value
const KEY_VALUE_SEPARATOR: char = '=';

/// Wire spelling of the guest greeting (reference peers send `connected`)
const GREET_WIRE_KIND: &str = "connected";

/// Errors produced while turning a raw message into a [`Command`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown command kind: {0}")]
    UnknownKind(String),

    #[error("command `{kind}` is missing argument `{arg}`")]
    MissingArgument { kind: &'static str, arg: &'static str },

    #[error("command `{kind}` has invalid `{arg}` value: {value}")]
    InvalidArgument {
        kind: &'static str,
        arg: &'static str,
        value: String,
    },
}

/// A raw wire message: a kind and an ordered list of string arguments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    kind: String,
    args: Vec<(String, String)>,
}

impl Message {
    /// Create a message with no arguments
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument, replacing an existing value for the same key
    pub fn with_arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set_arg(key.into(), value.to_string());
        self
    }

    fn set_arg(&mut self, key: String, value: String) {
        match self.args.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.args.push((key, value)),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Arguments in wire order
    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    /// Look up an argument value by key
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Encode to the wire format
    pub fn encode(&self) -> String {
        if self.args.is_empty() {
            return self.kind.clone();
        }

        let pairs: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| format!("{}{}{}", escape(k), KEY_VALUE_SEPARATOR, escape(v)))
            .collect();

        format!(
            "{}{}{}",
            self.kind,
            KIND_SEPARATOR,
            pairs.join(PAIR_SEPARATOR)
        )
    }

    /// Decode from the wire format.
    ///
    /// Never fails: a message without `|` has no arguments, a pair without `=`
    /// gets an empty value and a repeated key keeps its last value.
    pub fn decode(raw: &str) -> Self {
        let Some((kind, section)) = raw.split_once(KIND_SEPARATOR) else {
            return Self::new(raw);
        };

        let mut message = Self::new(kind);
        for pair in section.split(PAIR_SEPARATOR).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once(KEY_VALUE_SEPARATOR).unwrap_or((pair, ""));
            message.set_arg(unescape(key), unescape(value));
        }
        message
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Percent-encode only the characters that would break framing. Everything
/// else, `%` included, goes out as-is so values from reference peers (which
/// never escape) keep their exact bytes.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '|' => out.push_str("%7C"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

/// Undo [`escape`]. Other percent sequences (e.g. `%20` in a URL) are kept.
fn unescape(value: &str) -> String {
    if !value.contains('%') {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(i) = rest.find('%') {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        match tail.get(1..3).and_then(reserved_char) {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn reserved_char(code: &str) -> Option<char> {
    match code.to_ascii_uppercase().as_str() {
        "7C" => Some('|'),
        "26" => Some('&'),
        "3D" => Some('='),
        _ => None,
    }
}

/// Symbolic command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Timestamp,
    Origin,
    Play,
    Pause,
    Seek,
    Latency,
    RttPing,
    RttPong,
    Greet,
    Progress,
    VoiceEnabled,
    VoiceDisabled,
}

impl CommandKind {
    /// The kind as written on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Timestamp => "timestamp",
            CommandKind::Origin => "origin",
            CommandKind::Play => "play",
            CommandKind::Pause => "pause",
            CommandKind::Seek => "seek",
            CommandKind::Latency => "latency",
            CommandKind::RttPing => "rtt-ping",
            CommandKind::RttPong => "rtt-pong",
            CommandKind::Greet => GREET_WIRE_KIND,
            CommandKind::Progress => "progress",
            CommandKind::VoiceEnabled => "voice-enabled",
            CommandKind::VoiceDisabled => "voice-disabled",
        }
    }

    /// Parse a wire kind. Accepts both spellings of the greeting.
    pub fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "timestamp" => CommandKind::Timestamp,
            "origin" => CommandKind::Origin,
            "play" => CommandKind::Play,
            "pause" => CommandKind::Pause,
            "seek" => CommandKind::Seek,
            "latency" => CommandKind::Latency,
            "rtt-ping" => CommandKind::RttPing,
            "rtt-pong" => CommandKind::RttPong,
            "greet" | GREET_WIRE_KIND => CommandKind::Greet,
            "progress" => CommandKind::Progress,
            "voice-enabled" => CommandKind::VoiceEnabled,
            "voice-disabled" => CommandKind::VoiceDisabled,
            _ => return None,
        })
    }

    /// Name used in logs and errors
    fn label(&self) -> &'static str {
        match self {
            CommandKind::Greet => "greet",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Commands exchanged between peers for synchronization
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // === Host heartbeat and media identity ===
    /// Host wall-clock heartbeat (ms since epoch)
    Timestamp { atu: u64 },
    /// Media source identity
    Origin { ori: String },

    // === Transport controls (edge-triggered, from host) ===
    Play,
    Pause,
    /// Seek to a position in seconds
    Seek { time: f64 },

    // === Clock synchronization ===
    /// Self-reported one-way latency in milliseconds
    Latency { lat: f64 },
    RttPing { ts: u64 },
    /// `ts` echoes the ping, `ts2` is the responder's clock when it replied
    RttPong { ts: u64, ts2: u64 },

    // === Session setup ===
    /// Guest greeting carrying its identifier
    Greet { gid: String },

    // === Periodic position beacon ===
    /// Playback position `cur` (seconds) valid at wall-clock `atu` (ms)
    Progress { cur: f64, atu: u64 },

    // === Voice capability ===
    VoiceEnabled,
    VoiceDisabled,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Timestamp { .. } => CommandKind::Timestamp,
            Command::Origin { .. } => CommandKind::Origin,
            Command::Play => CommandKind::Play,
            Command::Pause => CommandKind::Pause,
            Command::Seek { .. } => CommandKind::Seek,
            Command::Latency { .. } => CommandKind::Latency,
            Command::RttPing { .. } => CommandKind::RttPing,
            Command::RttPong { .. } => CommandKind::RttPong,
            Command::Greet { .. } => CommandKind::Greet,
            Command::Progress { .. } => CommandKind::Progress,
            Command::VoiceEnabled => CommandKind::VoiceEnabled,
            Command::VoiceDisabled => CommandKind::VoiceDisabled,
        }
    }

    /// Convert to a raw message
    pub fn to_message(&self) -> Message {
        let message = Message::new(self.kind().as_str());
        match self {
            Command::Timestamp { atu } => message.with_arg("atu", atu),
            Command::Origin { ori } => message.with_arg("ori", ori),
            Command::Seek { time } => message.with_arg("time", time),
            Command::Latency { lat } => message.with_arg("lat", lat),
            Command::RttPing { ts } => message.with_arg("ts", ts),
            Command::RttPong { ts, ts2 } => message.with_arg("ts", ts).with_arg("ts2", ts2),
            Command::Greet { gid } => message.with_arg("gid", gid),
            Command::Progress { cur, atu } => message.with_arg("cur", cur).with_arg("atu", atu),
            Command::Play | Command::Pause | Command::VoiceEnabled | Command::VoiceDisabled => {
                message
            }
        }
    }

    /// Encode to the wire format
    pub fn encode(&self) -> String {
        self.to_message().encode()
    }

    /// Decode and type-check a wire string
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Self::try_from(Message::decode(raw))
    }
}

impl TryFrom<Message> for Command {
    type Error = ProtocolError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        if message.kind().is_empty() {
            return Err(ProtocolError::Empty);
        }
        let kind = CommandKind::parse(message.kind())
            .ok_or_else(|| ProtocolError::UnknownKind(message.kind().to_string()))?;
        let args = Args {
            kind: kind.label(),
            message: &message,
        };

        Ok(match kind {
            CommandKind::Timestamp => Command::Timestamp {
                atu: args.millis("atu")?,
            },
            CommandKind::Origin => Command::Origin {
                ori: args.text("ori")?,
            },
            CommandKind::Play => Command::Play,
            CommandKind::Pause => Command::Pause,
            CommandKind::Seek => Command::Seek {
                time: args.number("time")?,
            },
            CommandKind::Latency => Command::Latency {
                lat: args.number("lat")?,
            },
            CommandKind::RttPing => Command::RttPing {
                ts: args.millis("ts")?,
            },
            CommandKind::RttPong => Command::RttPong {
                ts: args.millis("ts")?,
                ts2: args.millis("ts2")?,
            },
            CommandKind::Greet => Command::Greet {
                gid: args.text("gid")?,
            },
            CommandKind::Progress => Command::Progress {
                cur: args.number("cur")?,
                atu: args.millis("atu")?,
            },
            CommandKind::VoiceEnabled => Command::VoiceEnabled,
            CommandKind::VoiceDisabled => Command::VoiceDisabled,
        })
    }
}

/// Typed argument access for a single message
struct Args<'a> {
    kind: &'static str,
    message: &'a Message,
}

impl Args<'_> {
    fn text(&self, arg: &'static str) -> Result<String, ProtocolError> {
        self.message
            .arg(arg)
            .map(str::to_string)
            .ok_or(ProtocolError::MissingArgument {
                kind: self.kind,
                arg,
            })
    }

    /// Integral milliseconds. Reference peers sometimes send fractional values.
    fn millis(&self, arg: &'static str) -> Result<u64, ProtocolError> {
        let value = self.number(arg)?;
        if value < 0.0 {
            return Err(self.invalid(arg, value.to_string()));
        }
        Ok(value.round() as u64)
    }

    fn number(&self, arg: &'static str) -> Result<f64, ProtocolError> {
        let raw = self.text(arg)?;
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(self.invalid(arg, raw)),
        }
    }

    fn invalid(&self, arg: &'static str, value: String) -> ProtocolError {
        ProtocolError::InvalidArgument {
            kind: self.kind,
            arg,
            value,
        }
    }
}
