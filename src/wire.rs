//! Frame codec for the wire transports.
//!
//! The in-process core never serializes its own traffic, but it defines
//! the framing the external transports speak:
//!
//! ```text
//! frame     = flags length payload
//! flags     = bit0 MORE | bit1 LONG | bit2 COMMAND
//! length    = 1 byte, or 8 bytes big-endian when LONG
//! ```
//!
//! Subscription commands travel as COMMAND frames whose body is
//! `SUBSCRIBE\0` or `CANCEL\0` followed by the topic. The legacy data-frame
//! form (first byte 0x01 = subscribe, 0x00 = cancel) is left untouched by
//! the codec; the pattern sockets recognize it on their own.

use crate::msg::{Msg, MORE};
use crate::{Error, Result};

pub const FLAG_MORE: u8 = 0x01;
pub const FLAG_LONG: u8 = 0x02;
pub const FLAG_COMMAND: u8 = 0x04;

const FLAG_MASK: u8 = FLAG_MORE | FLAG_LONG | FLAG_COMMAND;

const SUBSCRIBE_PREFIX: &[u8] = b"SUBSCRIBE\0";
const CANCEL_PREFIX: &[u8] = b"CANCEL\0";

/// Append the wire form of `msg` to `out`.
pub fn encode_frame(msg: &Msg, out: &mut Vec<u8>) {
    let mut body: Vec<u8>;
    let mut flags = 0u8;
    if msg.is_subscribe() || msg.is_cancel() {
        flags |= FLAG_COMMAND;
        let prefix = if msg.is_subscribe() {
            SUBSCRIBE_PREFIX
        } else {
            CANCEL_PREFIX
        };
        body = Vec::with_capacity(prefix.len() + msg.size());
        body.extend_from_slice(prefix);
        body.extend_from_slice(msg.command_body());
    } else {
        body = msg.data().to_vec();
    }
    if msg.has_more() {
        flags |= FLAG_MORE;
    }
    if body.len() > u8::MAX as usize {
        flags |= FLAG_LONG;
        out.push(flags);
        out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    } else {
        out.push(flags);
        out.push(body.len() as u8);
    }
    out.extend_from_slice(&body);
}

/// Decode one frame from the head of `buf`. Returns the message and the
/// number of bytes consumed, or `None` when more bytes are needed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Msg, usize)>> {
    let Some(&flags) = buf.first() else {
        return Ok(None);
    };
    if flags & !FLAG_MASK != 0 {
        return Err(Error::Protocol("unknown frame flag bits"));
    }
    let (length, header) = if flags & FLAG_LONG != 0 {
        if buf.len() < 9 {
            return Ok(None);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[1..9]);
        (u64::from_be_bytes(raw) as usize, 9)
    } else {
        if buf.len() < 2 {
            return Ok(None);
        }
        (buf[1] as usize, 2)
    };
    if buf.len() < header + length {
        return Ok(None);
    }
    let body = &buf[header..header + length];

    let mut msg = if flags & FLAG_COMMAND != 0 {
        if let Some(topic) = body.strip_prefix(SUBSCRIBE_PREFIX) {
            Msg::subscribe(topic)
        } else if let Some(topic) = body.strip_prefix(CANCEL_PREFIX) {
            Msg::cancel(topic)
        } else {
            return Err(Error::Protocol("unknown command frame"));
        }
    } else {
        Msg::from_slice(body)
    };
    if flags & FLAG_MORE != 0 {
        msg.set_flags(MORE);
    }
    Ok(Some((msg, header + length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_data_frame_round_trip() {
        let mut msg = Msg::from_slice(b"news.sports");
        msg.set_flags(MORE);
        let mut wire = Vec::new();
        encode_frame(&msg, &mut wire);
        assert_eq!(wire[0], FLAG_MORE);
        assert_eq!(wire[1], 11);
        assert_eq!(&wire[2..], b"news.sports");

        let (decoded, consumed) = decode_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.data(), b"news.sports");
        assert!(decoded.has_more());
    }

    #[test]
    fn long_frame_uses_eight_byte_length() {
        let payload = vec![0xAB; 300];
        let msg = Msg::from_slice(&payload);
        let mut wire = Vec::new();
        encode_frame(&msg, &mut wire);
        assert_eq!(wire[0], FLAG_LONG);
        assert_eq!(&wire[1..9], &300u64.to_be_bytes());
        let (decoded, consumed) = decode_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.size(), 300);
    }

    #[test]
    fn subscribe_command_frame() {
        let msg = Msg::subscribe(b"news.");
        let mut wire = Vec::new();
        encode_frame(&msg, &mut wire);
        assert_eq!(wire[0], FLAG_COMMAND);
        assert_eq!(&wire[2..12], b"SUBSCRIBE\0");
        assert_eq!(&wire[12..], b"news.");

        let (decoded, _) = decode_frame(&wire).unwrap().unwrap();
        assert!(decoded.is_subscribe());
        assert_eq!(decoded.command_body(), b"news.");
    }

    #[test]
    fn cancel_command_frame() {
        let msg = Msg::cancel(b"news.");
        let mut wire = Vec::new();
        encode_frame(&msg, &mut wire);
        let (decoded, _) = decode_frame(&wire).unwrap().unwrap();
        assert!(decoded.is_cancel());
        assert_eq!(decoded.command_body(), b"news.");
    }

    #[test]
    fn partial_input_asks_for_more() {
        let msg = Msg::from_slice(b"payload");
        let mut wire = Vec::new();
        encode_frame(&msg, &mut wire);
        for cut in 0..wire.len() {
            assert!(decode_frame(&wire[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(decode_frame(&[0x80, 0]).is_err());
        // COMMAND frame with an unknown body.
        let wire = [FLAG_COMMAND, 3, b'F', b'O', b'O'];
        assert!(decode_frame(&wire).is_err());
    }
}
