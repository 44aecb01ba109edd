//! Codec contract
//!
//! A codec is a stateful, per-channel strategy that turns envelopes into
//! bytes and bytes back into envelopes. Both directions report a
//! [`CodecStatus`], and the dispatcher maps that status onto reactor
//! interest:
//!
//! | status                    | reactor binding                            |
//! |---------------------------|--------------------------------------------|
//! | `Ok`                      | no interest change                         |
//! | `Pause` / `WantWrite`     | register write interest, retry on writable |
//! | `WantRead`                | cancel write interest until the next read  |
//! | `Incomplete` (decode)     | keep buffered bytes, wait for more         |
//! | `Eof`                     | flush remaining output, then discard       |
//! | `Error`                   | discard immediately                        |

pub mod json;
pub mod raw;

use serde::{Deserialize, Serialize};

pub use json::JsonCodec;
pub use raw::RawCodec;

/// Status algebra shared by encode and decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStatus {
    Ok,
    Pause,
    WantWrite,
    WantRead,
    Incomplete,
    Eof,
    Error,
}

/// Wire contracts a channel can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// Newline-delimited JSON messages with a `cmd`/`seq` head
    Json,
    /// Opaque byte stream
    Raw,
    /// Opaque bytes; the channel is closed once each response is flushed
    OneShot,
}

impl CodecKind {
    /// Fresh codec state for a new channel or a protocol switch
    pub fn build(self) -> Box<dyn Codec> {
        match self {
            CodecKind::Json => Box::new(JsonCodec::new()),
            CodecKind::Raw => Box::new(RawCodec::new()),
            CodecKind::OneShot => Box::new(RawCodec::one_shot()),
        }
    }

    /// Numeric id carried in the fd handoff payload
    pub fn wire_id(self) -> i32 {
        match self {
            CodecKind::Json => 1,
            CodecKind::Raw => 2,
            CodecKind::OneShot => 3,
        }
    }

    pub fn from_wire_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(CodecKind::Json),
            2 => Some(CodecKind::Raw),
            3 => Some(CodecKind::OneShot),
            _ => None,
        }
    }
}

/// Routing head of a framed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHead {
    pub cmd: i32,
    pub seq: u32,
}

/// Payload of a framed message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgBody {
    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// The closed set of things a channel can carry
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A head/body message (JSON wire contract)
    Message { head: MsgHead, body: MsgBody },
    /// Opaque bytes (raw and one-shot wire contracts)
    Raw(Vec<u8>),
}

impl Envelope {
    pub fn message(cmd: i32, seq: u32, data: serde_json::Value) -> Self {
        Envelope::Message {
            head: MsgHead { cmd, seq },
            body: MsgBody {
                data,
                trace_id: None,
            },
        }
    }
}

/// Result of one decode step
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub status: CodecStatus,
    pub envelope: Option<Envelope>,
}

impl Decoded {
    pub fn message(envelope: Envelope) -> Self {
        Self {
            status: CodecStatus::Ok,
            envelope: Some(envelope),
        }
    }

    pub fn status(status: CodecStatus) -> Self {
        Self {
            status,
            envelope: None,
        }
    }
}

/// Per-channel encode/decode strategy.
///
/// Codec state is never shared between channels. Switching protocols on a
/// live channel replaces the codec wholesale.
pub trait Codec {
    fn kind(&self) -> CodecKind;

    /// Append the wire form of `envelope` to `out`.
    fn encode(&mut self, envelope: &Envelope, out: &mut Vec<u8>) -> CodecStatus;

    /// Take at most one envelope off the front of `input`.
    ///
    /// On `Incomplete` the buffered bytes must be left in place.
    fn decode(&mut self, input: &mut Vec<u8>) -> Decoded;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_ids_are_stable() {
        for kind in [CodecKind::Json, CodecKind::Raw, CodecKind::OneShot] {
            assert_eq!(CodecKind::from_wire_id(kind.wire_id()), Some(kind));
            assert_eq!(kind.build().kind(), kind);
        }
        assert_eq!(CodecKind::from_wire_id(0), None);
    }

    #[test]
    fn test_codec_kind_config_names() {
        let kind: CodecKind = serde_json::from_str("\"one_shot\"").unwrap();
        assert_eq!(kind, CodecKind::OneShot);
    }
}
