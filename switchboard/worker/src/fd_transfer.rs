//! Fd handoff over a local control link
//!
//! The acceptor passes each accepted connection to a sibling worker as one
//! `SCM_RIGHTS` message. The 8-byte payload carries the address family and
//! the codec wire id, both little-endian `i32`.

use std::io::{self, ErrorKind, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags};
use tracing::{trace, warn};

use crate::codec::CodecKind;

const PAYLOAD_LEN: usize = 8;

/// A connection received from the acceptor
#[derive(Debug)]
pub struct FdHandoff {
    pub fd: OwnedFd,
    pub family: AddressFamily,
    pub codec: CodecKind,
}

fn encode_payload(family: AddressFamily, codec: CodecKind) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[..4].copy_from_slice(&(family as i32).to_le_bytes());
    payload[4..].copy_from_slice(&codec.wire_id().to_le_bytes());
    payload
}

fn decode_payload(payload: [u8; PAYLOAD_LEN]) -> io::Result<(AddressFamily, CodecKind)> {
    let [f0, f1, f2, f3, c0, c1, c2, c3] = payload;
    let family = i32::from_le_bytes([f0, f1, f2, f3]);
    let codec = i32::from_le_bytes([c0, c1, c2, c3]);

    let family = AddressFamily::from_i32(family)
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, format!("unknown address family {}", family)))?;
    let codec = CodecKind::from_wire_id(codec)
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, format!("unknown codec id {}", codec)))?;
    Ok((family, codec))
}

/// Send `fd` with its family and codec over `control`.
///
/// The caller still owns `fd` and closes its copy afterwards.
pub fn send_fd(control: &impl AsRawFd, fd: RawFd, family: AddressFamily, codec: CodecKind) -> io::Result<()> {
    let payload = encode_payload(family, codec);
    let iov = [IoSlice::new(&payload)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = sendmsg::<()>(control.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    if sent != PAYLOAD_LEN {
        return Err(io::Error::new(
            ErrorKind::WriteZero,
            format!("short fd handoff write: {} of {} bytes", sent, PAYLOAD_LEN),
        ));
    }
    trace!(fd, ?family, ?codec, "fd handed off");
    Ok(())
}

/// Receive one handed-off fd from a non-blocking `control` link.
///
/// `Ok(None)` when nothing is pending. A closed link is `UnexpectedEof`.
pub fn recv_fd(control: &impl AsRawFd) -> io::Result<Option<FdHandoff>> {
    let mut payload = [0u8; PAYLOAD_LEN];
    let mut cmsg_buf = nix::cmsg_space!(RawFd);

    let (bytes, truncated, received) = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = match recvmsg::<()>(
            control.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut received: Option<OwnedFd> = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for raw in fds {
                    // Safety: SCM_RIGHTS installs a fresh descriptor owned by this process.
                    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                    if received.is_none() {
                        received = Some(owned);
                    } else {
                        warn!(fd = raw, "closing surplus fd in handoff message");
                    }
                }
            }
        }
        (msg.bytes, msg.flags.contains(MsgFlags::MSG_CTRUNC), received)
    };

    if bytes == 0 && received.is_none() {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "control link closed"));
    }
    if truncated {
        return Err(io::Error::new(ErrorKind::InvalidData, "control message truncated"));
    }
    if bytes < PAYLOAD_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "short read on control link"));
    }
    let fd = received.ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "no fd in control message"))?;

    let (family, codec) = decode_payload(payload)?;
    Ok(Some(FdHandoff { fd, family, codec }))
}
