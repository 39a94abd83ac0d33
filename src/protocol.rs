//! Wire format for the chat broadcaster.
//!
//! Clients send newline-terminated text, one line per send. The server
//! rebroadcasts each line and announces joins and leaves:
//!
//! ```text
//! Join:  HELLO <name>\n
//! Chat:  [<name>] <text> \r\n
//! Leave: <name> LEAVE\r\n
//! ```
//!
//! There is no reassembly: each read is framed on its own, and at most
//! `READ_BUFFER_SIZE` bytes of a single read are considered.

use crate::runtime::SessionId;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the per-session read buffer, and the hard per-read line ceiling.
pub const READ_BUFFER_SIZE: usize = 128;

/// Frame one received chunk into a line.
///
/// The line is everything before the first CR, LF or NUL byte. Bytes past
/// `READ_BUFFER_SIZE` are ignored. Returns `None` for an empty line.
pub fn frame_line(chunk: &[u8]) -> Option<&[u8]> {
    let chunk = &chunk[..chunk.len().min(READ_BUFFER_SIZE)];
    let end = chunk
        .iter()
        .position(|&b| matches!(b, b'\r' | b'\n' | b'\0'))
        .unwrap_or(chunk.len());

    if end == 0 {
        None
    } else {
        Some(&chunk[..end])
    }
}

/// A transient message produced by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    /// Announcement that a session joined. Delivered to everyone.
    Join { name: &'a str },
    /// A chat line from a session. Never delivered back to the sender.
    Chat {
        sender: SessionId,
        name: &'a str,
        text: &'a [u8],
    },
    /// Announcement that a session left. Delivered to everyone remaining.
    Leave { name: &'a str },
}

impl Message<'_> {
    /// Session that must not receive this message, if any.
    pub fn excluded(&self) -> Option<SessionId> {
        match self {
            Message::Chat { sender, .. } => Some(*sender),
            Message::Join { .. } | Message::Leave { .. } => None,
        }
    }

    /// Encode the message in its exact on-wire form.
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Join { name } => {
                let mut buf = BytesMut::with_capacity(7 + name.len());
                buf.put_slice(b"HELLO ");
                buf.put_slice(name.as_bytes());
                buf.put_u8(b'\n');
                buf.freeze()
            }
            Message::Chat { name, text, .. } => {
                let mut buf = BytesMut::with_capacity(6 + name.len() + text.len());
                buf.put_u8(b'[');
                buf.put_slice(name.as_bytes());
                buf.put_slice(b"] ");
                buf.put_slice(text);
                buf.put_slice(b" \r\n");
                buf.freeze()
            }
            Message::Leave { name } => {
                let mut buf = BytesMut::with_capacity(8 + name.len());
                buf.put_slice(name.as_bytes());
                buf.put_slice(b" LEAVE\r\n");
                buf.freeze()
            }
        }
    }
}
