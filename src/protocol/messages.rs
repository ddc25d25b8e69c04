//! Protocol message types for the line relay
//!
//! Clients send newline-terminated text. A line is either a command
//! (`/join <nickname>`, `/exit`) or chat text. The server answers with
//! broadcast lines that all carry a leading `HH:MM` stamp, plus one direct
//! prompt that is only ever written to the offending connection.

use std::fmt;

use bytes::Bytes;

/// Prefix of the join command
pub const JOIN_COMMAND: &str = "/join";

/// Literal exit command
pub const EXIT_COMMAND: &str = "/exit";

/// Direct reply to a chat line sent before joining
pub const JOIN_PROMPT: &str = "You need to /join with a nickname first.\n";

/// Format of the leading stamp on every broadcast line
const STAMP_FORMAT: &str = "%H:%M";

/// Current local time as `HH:MM`
pub fn clock_stamp() -> String {
    chrono::Local::now().format(STAMP_FORMAT).to_string()
}

/// A parsed client line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/join <nickname>`; the nickname may be empty
    Join(String),
    /// `/exit`
    Exit,
    /// Anything else
    Chat(String),
}

impl Command {
    /// Interpret one input line.
    ///
    /// Surrounding whitespace (including a trailing `\r`) is stripped first.
    /// Any line starting with `/join` is a join; the nickname is whatever
    /// follows the prefix, trimmed.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        if line == EXIT_COMMAND {
            return Command::Exit;
        }

        match line.strip_prefix(JOIN_COMMAND) {
            Some(rest) => Command::Join(rest.trim().to_string()),
            None => Command::Chat(line.to_string()),
        }
    }
}

/// Events that end up on the wire and in the transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A connection joined (or re-joined) under a nickname
    Joined { nickname: String },
    /// A joined connection went away
    Left { nickname: String },
    /// A chat line from a joined connection
    Message { nickname: String, text: String },
}

impl ChatEvent {
    /// Render with an explicit stamp
    pub fn render_at(&self, stamp: &str) -> Broadcast {
        let line = match self {
            ChatEvent::Joined { nickname } => {
                format!("{} Notice: \"{}\" joined the chat\n", stamp, nickname)
            }
            ChatEvent::Left { nickname } => {
                format!("{} Notice: \"{}\" left the chat\n", stamp, nickname)
            }
            ChatEvent::Message { nickname, text } => {
                format!("{} - {}: {}\n", stamp, nickname, text)
            }
        };
        Broadcast(Bytes::from(line))
    }

    /// Render with the current local time
    pub fn render(&self) -> Broadcast {
        self.render_at(&clock_stamp())
    }
}

/// An immutable, newline-terminated broadcast line.
///
/// Cloning is cheap; every recipient queue holds a reference to the same
/// buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast(Bytes);

impl Broadcast {
    /// Raw bytes as written to sockets
    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    /// Text as appended to the transcript
    pub fn as_str(&self) -> &str {
        // Only ever built from a `String` in `ChatEvent::render_at`.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
