//! Client frame classification for the terminal WebSocket
//!
//! The only control frame is `{"type":"resize","cols":N,"rows":N}`; every
//! other frame is raw terminal input.

use axum::extract::ws::Message;
use serde::Deserialize;
use tracing::warn;

use crate::container::TerminalSize;

/// What to do with a frame received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    /// Apply to the PTY window size
    Resize(TerminalSize),
    /// Write verbatim to the process stdin
    Data(Vec<u8>),
    /// Client asked to close
    Close,
    /// Transport-level frame with nothing to forward
    Ignore,
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    cols: Option<u64>,
    rows: Option<u64>,
}

/// Classify a client frame
pub fn classify(message: Message) -> ClientInput {
    match message {
        Message::Text(text) => match parse_resize(text.as_bytes()) {
            Some(parsed) => parsed,
            None => ClientInput::Data(text.into_bytes()),
        },
        Message::Binary(data) => match parse_resize(&data) {
            Some(parsed) => parsed,
            None => ClientInput::Data(data),
        },
        Message::Close(_) => ClientInput::Close,
        Message::Ping(_) | Message::Pong(_) => ClientInput::Ignore,
    }
}

/// `Some` only for frames that are resize control messages
fn parse_resize(data: &[u8]) -> Option<ClientInput> {
    // Cheap pre-check so keystrokes never reach the JSON parser
    let first = data.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }

    let frame: ControlFrame = serde_json::from_slice(data).ok()?;
    if frame.kind != "resize" {
        return None;
    }

    let cols = frame.cols.and_then(|c| u16::try_from(c).ok()).filter(|c| *c > 0);
    let rows = frame.rows.and_then(|r| u16::try_from(r).ok()).filter(|r| *r > 0);

    match (cols, rows) {
        (Some(cols), Some(rows)) => Some(ClientInput::Resize(TerminalSize { cols, rows })),
        _ => {
            warn!(cols = ?frame.cols, rows = ?frame.rows, "Dropping resize frame with invalid dimensions");
            Some(ClientInput::Ignore)
        }
    }
}
