//! Newline-delimited JSON codec
//!
//! Each message travels as one line: `{"cmd":1,"seq":7,"body":{...}}\n`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Codec, CodecKind, CodecStatus, Decoded, Envelope, MsgBody, MsgHead};

/// Lines longer than this without a terminator are treated as a protocol error
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct FrameRef<'a> {
    cmd: i32,
    seq: u32,
    body: &'a MsgBody,
}

#[derive(Deserialize)]
struct Frame {
    cmd: i32,
    seq: u32,
    #[serde(default)]
    body: MsgBody,
}

#[derive(Debug, Default)]
pub struct JsonCodec {
    /// Bytes already scanned for a terminator
    scanned: usize,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn encode(&mut self, envelope: &Envelope, out: &mut Vec<u8>) -> CodecStatus {
        let Envelope::Message { head, body } = envelope else {
            warn!("json codec cannot carry raw bytes");
            return CodecStatus::Error;
        };

        let frame = FrameRef {
            cmd: head.cmd,
            seq: head.seq,
            body,
        };
        match serde_json::to_writer(&mut *out, &frame) {
            Ok(()) => {
                out.push(b'\n');
                CodecStatus::Ok
            }
            Err(e) => {
                warn!("failed to encode message cmd {}: {}", head.cmd, e);
                CodecStatus::Error
            }
        }
    }

    fn decode(&mut self, input: &mut Vec<u8>) -> Decoded {
        loop {
            self.scanned = self.scanned.min(input.len());
            let Some(offset) = input[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = input.len();
                if input.len() > MAX_LINE_LEN {
                    warn!("json line exceeds {} bytes", MAX_LINE_LEN);
                    return Decoded::status(CodecStatus::Error);
                }
                return Decoded::status(CodecStatus::Incomplete);
            };

            let end = self.scanned + offset;
            let line: Vec<u8> = input.drain(..=end).collect();
            self.scanned = 0;

            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            return match serde_json::from_slice::<Frame>(line) {
                Ok(frame) => Decoded::message(Envelope::Message {
                    head: MsgHead {
                        cmd: frame.cmd,
                        seq: frame.seq,
                    },
                    body: frame.body,
                }),
                Err(e) => {
                    warn!("failed to decode json message: {}", e);
                    Decoded::status(CodecStatus::Error)
                }
            };
        }
    }
}
