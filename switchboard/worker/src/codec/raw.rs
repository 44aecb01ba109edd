//! Opaque byte codec
//!
//! Hands whatever arrived to the actor layer unframed. In one-shot mode every
//! encode reports `Eof`, so the channel is closed after the response leaves
//! (request/response protocols without keep-alive).

use super::{Codec, CodecKind, CodecStatus, Decoded, Envelope};

#[derive(Debug, Default)]
pub struct RawCodec {
    one_shot: bool,
}

impl RawCodec {
    pub fn new() -> Self {
        Self { one_shot: false }
    }

    pub fn one_shot() -> Self {
        Self { one_shot: true }
    }
}

impl Codec for RawCodec {
    fn kind(&self) -> CodecKind {
        if self.one_shot {
            CodecKind::OneShot
        } else {
            CodecKind::Raw
        }
    }

    fn encode(&mut self, envelope: &Envelope, out: &mut Vec<u8>) -> CodecStatus {
        match envelope {
            Envelope::Raw(bytes) => {
                out.extend_from_slice(bytes);
                if self.one_shot {
                    CodecStatus::Eof
                } else {
                    CodecStatus::Ok
                }
            }
            Envelope::Message { .. } => CodecStatus::Error,
        }
    }

    fn decode(&mut self, input: &mut Vec<u8>) -> Decoded {
        if input.is_empty() {
            return Decoded::status(CodecStatus::Incomplete);
        }
        Decoded::message(Envelope::Raw(std::mem::take(input)))
    }
}
