//! Wire-level definitions for the SiriusConnect Protocol (SCP).
//!
//! SCP is a binary, frame-based, stop-and-wait link protocol. A frame is a
//! six-byte header, a payload of up to 255 bytes, and a one-byte
//! 2's-complement checksum of everything before it. The header's leading
//! sentinel (`0xA4`) may appear nowhere else in the byte stream; occurrences
//! inside the payload or checksum are escaped on the wire, as is the escape
//! character itself.
//!
//! This layout comes from reverse engineering, not an official protocol
//! document, so identifiers are guesses based on apparent function.

use bitflags::bitflags;
use tracing::error;

/// Frame start sentinel.
pub const SENTINEL: u8 = 0xA4;
/// The ASCII ESCape character.
pub const ESC: u8 = 0x1B;
/// Second byte of the escaped-sentinel sequence.
pub const SENTINEL_SUB: u8 = 0x53;

/// Frame header length in bytes.
pub const HDR_LEN: usize = 6;
/// Maximum payload length.
pub const MAX_DATA: usize = 255;
/// Maximum unescaped frame length: header + payload + checksum.
pub const MAX_FRAME: usize = HDR_LEN + MAX_DATA + 1;

/// Number of addressable channels.
pub const MAX_CHANNELS: u8 = 224;
/// Sentinel for "no channel".
pub const INVALID_CHANNEL: u8 = 255;
/// Size of the valid-channel bitmap, one bit per channel.
pub const CHANNEL_BITMAP_LEN: usize = MAX_CHANNELS as usize / 8;

bitflags! {
    /// Header flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Prior frame had a bad checksum.
        const CHKSUM = 0x01;
        /// Radio cannot accept the frame right now.
        const BUSY = 0x02;
        /// Frame is an acknowledgement.
        const ACK = 0x80;
    }
}

/// Top-level message opcodes (first payload byte).
pub mod opcode {
    pub const SET: u8 = 0x00;
    pub const SET_RESP: u8 = 0x20;
    pub const GET: u8 = 0x40;
    pub const GET_RESP: u8 = 0x60;
    pub const ASYNC: u8 = 0x80;
}

/// GET sub-opcodes.
pub mod get {
    pub const GAIN: u8 = 0x02;
    pub const MUTE: u8 = 0x03;
    pub const POWER: u8 = 0x07;
    pub const CHANNEL_INFO: u8 = 0x08;
    pub const CHANNEL: u8 = 0x0a;
    pub const SONG_INFO: u8 = 0x0d;
    pub const CHANNEL_MAP: u8 = 0x10;
    pub const SID: u8 = 0x11;
    pub const TZ_INFO: u8 = 0x12;
    pub const TIME: u8 = 0x13;
    pub const ASYNC: u8 = 0x14;
    pub const STATUS: u8 = 0x16;
    pub const RSSI: u8 = 0x18;
}

/// SET sub-opcodes.
pub mod set {
    pub const GAIN: u8 = 0x02;
    pub const MUTE: u8 = 0x03;
    pub const POWER: u8 = 0x08;
    pub const RESET: u8 = 0x09;
    pub const CHANNEL: u8 = 0x0a;
    pub const TZ_INFO: u8 = 0x0c;
    pub const ASYNC: u8 = 0x0d;
}

/// Asynchronous notification kinds.
pub mod async_id {
    pub const RESET: u8 = 0x00;
    pub const SONG_INFO: u8 = 0x01;
    pub const SONG_ID: u8 = 0x02;
    pub const TIME: u8 = 0x03;
    pub const STATUS: u8 = 0x04;
    pub const SIGNAL: u8 = 0x05;
}

/// Async notification subscription flag bits.
pub mod async_flag {
    pub const TIME: u8 = 0x01;
    pub const SIGNAL: u8 = 0x02;
    pub const CHANNEL_INFO: u8 = 0x04;
    /// Info for all channels; overrides SONG_ID.
    pub const ALL_CHANNEL_INFO: u8 = 0x08;
    pub const SONG_ID: u8 = 0x10;
}

/// Status report type codes.
pub mod status_type {
    pub const TUNE: u8 = 0x00;
    pub const SIGNAL: u8 = 0x01;
    pub const ANTENNA: u8 = 0x02;
}

/// Field tags within a song-info message.
pub mod tag {
    pub const ARTIST: u8 = 0x01;
    pub const TITLE: u8 = 0x02;
    pub const ALBUM: u8 = 0x03;
    pub const COMPOSER: u8 = 0x06;
    pub const SONG_ID: u8 = 0x86;
    pub const ARTIST_ID: u8 = 0x88;
    /// Clears the current song info; carries no body.
    pub const ERASE: u8 = 0xE0;
}

/// Parsed view of a frame header.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub seq: u8,
    pub flags: FrameFlags,
    pub len: u8,
}

impl Header {
    /// Read the header fields from the start of an unescaped frame.
    /// Returns None until at least `HDR_LEN` bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HDR_LEN {
            return None;
        }
        Some(Self {
            seq: bytes[3],
            flags: FrameFlags::from_bits_retain(bytes[4]),
            len: bytes[5],
        })
    }

    /// Total unescaped frame length implied by this header.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HDR_LEN + self.len as usize + 1
    }
}

/// 2's-complement checksum byte: chosen so the whole frame sums to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg()
}

/// True iff the frame's bytes sum to zero modulo 256.
pub fn validate(frame: &[u8]) -> bool {
    frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
}

/// Build an unescaped frame around `payload` with the given sequence number
/// and flags.
///
/// Panics if the payload exceeds [`MAX_DATA`].
pub fn compose(payload: &[u8], seq: u8, flags: FrameFlags) -> Vec<u8> {
    assert!(payload.len() <= MAX_DATA, "payload too large for one frame");
    let mut frame = Vec::with_capacity(HDR_LEN + payload.len() + 1);
    frame.extend_from_slice(&[SENTINEL, 0x03, 0x00, seq, flags.bits(), payload.len() as u8]);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

/// Escape a composed frame for transmission.
///
/// Every `0xA4` becomes `1B 53` and every `0x1B` becomes `1B 1B`, except
/// the leading sentinel, which must remain locatable in the raw stream.
pub fn escape(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 4);
    for (i, &b) in frame.iter().enumerate() {
        match b {
            SENTINEL if i != 0 => out.extend_from_slice(&[ESC, SENTINEL_SUB]),
            ESC => out.extend_from_slice(&[ESC, ESC]),
            _ => out.push(b),
        }
    }
    out
}

/// Incremental de-escaper for the receive path.
///
/// The escape state is a single bit that must survive across read calls,
/// since an escape sequence can straddle two reads.
#[derive(Default)]
pub struct Descaper {
    in_escape: bool,
}

impl Descaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// De-escape `input`, appending the decoded bytes to `out`.
    ///
    /// An escape followed by anything other than `0x53` or `0x1B` is a
    /// protocol violation; both bytes are dropped.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if self.in_escape {
                self.in_escape = false;
                match b {
                    SENTINEL_SUB => out.push(SENTINEL),
                    ESC => out.push(ESC),
                    other => error!(byte = other, "invalid escape sequence, dropping"),
                }
            } else if b == ESC {
                self.in_escape = true;
            } else {
                out.push(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_sums_to_zero() {
        let frame = compose(&[0x00, 0x03, 0x01], 7, FrameFlags::empty());
        assert_eq!(frame.len(), HDR_LEN + 3 + 1);
        assert_eq!(frame[0], SENTINEL);
        assert_eq!(frame[3], 7);
        assert_eq!(frame[5], 3);
        assert!(validate(&frame));
    }

    #[test]
    fn validate_rejects_corruption() {
        let mut frame = compose(&[0x40, 0x18], 1, FrameFlags::empty());
        frame[7] ^= 0x10;
        assert!(!validate(&frame));
    }

    #[test]
    fn compose_then_parse_round_trips() {
        let payload = [0x80, 0x05, 0x01];
        let frame = compose(&payload, 42, FrameFlags::ACK);
        let hdr = Header::parse(&frame).unwrap();
        assert_eq!(hdr.seq, 42);
        assert_eq!(hdr.len as usize, payload.len());
        assert_eq!(hdr.frame_len(), frame.len());
        assert!(hdr.flags.contains(FrameFlags::ACK));
        assert_eq!(&frame[HDR_LEN..HDR_LEN + payload.len()], &payload);
    }

    #[test]
    fn escape_round_trip() {
        // Payload containing both reserved bytes.
        let frame = compose(&[SENTINEL, 0x42, ESC], 0, FrameFlags::empty());
        let wire = escape(&frame);
        // The interior sentinel and escape must not appear unescaped.
        assert!(!wire[1..].contains(&SENTINEL));

        let mut out = Vec::new();
        Descaper::new().feed(&wire, &mut out);
        assert_eq!(out, frame);
    }

    #[test]
    fn descape_survives_split_reads() {
        let frame = compose(&[SENTINEL], 3, FrameFlags::empty());
        let wire = escape(&frame);
        let mut out = Vec::new();
        let mut d = Descaper::new();
        // Feed one byte at a time so every escape straddles a call.
        for b in &wire {
            d.feed(std::slice::from_ref(b), &mut out);
        }
        assert_eq!(out, frame);
    }

    #[test]
    fn descape_drops_invalid_sequences() {
        let mut out = Vec::new();
        Descaper::new().feed(&[0x01, ESC, 0x99, 0x02], &mut out);
        assert_eq!(out, vec![0x01, 0x02]);
    }

    #[test]
    fn leading_sentinel_not_escaped() {
        let frame = compose(&[], 0, FrameFlags::ACK);
        let wire = escape(&frame);
        assert_eq!(wire[0], SENTINEL);
    }
}
