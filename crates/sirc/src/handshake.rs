//! TTS-100 unlock sequence.
//!
//! The TTS-100 interface box gates the tuner's control functions behind a
//! challenge/response exchange after every power cycle. The check is
//! vulnerable to a replay: a captured response from the vendor software is
//! accepted for any challenge once two bytes are patched with a simple XOR
//! of challenge material. This module performs the version probe that
//! detects the box, then the unlock, then raises the link rate for SCP.

use std::time::{Duration, Instant};

use sirc_serial::{SerialError, SerialPort};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Link rate while talking to the TTS-100 bootstrap.
pub const TTS_BAUD: u32 = 9600;
/// Link rate for SCP traffic once the box is out of the way.
pub const SCP_BAUD: u32 = 57600;

const PROBE_ATTEMPTS: u32 = 5;
const MAX_AUTH_ATTEMPTS: u32 = 5;
/// Longest silence tolerated while collecting a reply.
const RESPONSE_WINDOW: Duration = Duration::from_secs(1);
const RETRY_DELAY: Duration = Duration::from_secs(1);

const CHALLENGE_LEN: usize = 15;
const CHALLENGE_HDR: [u8; 2] = [0x3E, 0x3E];

/// Captured unlock response replayed to every challenge. Bytes 18 and 19
/// are patched from the challenge before transmission.
const AUTH_REPLAY: [u8; 21] = [
    0x3C, 0x3C, 0x10, 0x01, 0x05, 0x5A, 0xC3, 0x7E, 0x21, 0x9D, 0x44, 0x08, 0xF2, 0x6B, 0x30,
    0x17, 0xE9, 0x5C, 0x00, 0x00, 0x0D,
];

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("TTS-100 refused authentication")]
    AuthRejected,
    #[error(transparent)]
    Serial(#[from] SerialError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtsVersion {
    pub major: u32,
    pub minor: u32,
}

/// Detect and unlock a TTS-100, then switch the port to the SCP rate.
///
/// The port must already be open at [`TTS_BAUD`]. Returns the box's
/// firmware version, or `None` when no box answered the probe (a directly
/// attached tuner; no unlock is needed).
pub fn establish(port: &mut dyn SerialPort) -> Result<Option<TtsVersion>, HandshakeError> {
    let version = probe_version(port);
    if let Some(version) = version {
        debug!(major = version.major, minor = version.minor, "TTS-100 version banner");
        authenticate(port)?;
    }
    port.set_data_rate(SCP_BAUD)?;
    Ok(version)
}

/// Poke the box with `V` and look for its version banner.
fn probe_version(port: &mut dyn SerialPort) -> Option<TtsVersion> {
    for attempt in 1..=PROBE_ATTEMPTS {
        if port.send(b"V", RESPONSE_WINDOW).is_err() {
            continue;
        }
        let line = read_reply(port, |data| data.contains(&b'\n'));
        let text = String::from_utf8_lossy(&line);
        if text.contains("Time Trax") && text.contains("Version") {
            if let Some(version) = parse_version(&text) {
                return Some(version);
            }
            warn!(banner = %text.trim(), "unparseable version banner");
        }
        debug!(attempt, "no version banner");
    }
    None
}

/// Pull `major.minor` out of the banner text.
fn parse_version(text: &str) -> Option<TtsVersion> {
    let mut tokens = text.split(['.', ' ', '\r', '\n']).filter(|t| !t.is_empty());
    while let Some(token) = tokens.next() {
        if token == "Version" {
            let major = tokens.next()?.parse().ok()?;
            let minor = tokens.next()?.parse().ok()?;
            return Some(TtsVersion { major, minor });
        }
    }
    None
}

fn authenticate(port: &mut dyn SerialPort) -> Result<(), HandshakeError> {
    for attempt in 1..=MAX_AUTH_ATTEMPTS {
        if attempt > 1 {
            std::thread::sleep(RETRY_DELAY);
        }
        if port.send(b"A", RESPONSE_WINDOW).is_err() {
            continue;
        }
        let challenge = read_reply(port, |data| data.len() >= CHALLENGE_LEN);
        if challenge.len() < CHALLENGE_LEN || challenge[..2] != CHALLENGE_HDR {
            warn!(attempt, got = challenge.len(), "short or malformed challenge");
            continue;
        }

        let mut response = AUTH_REPLAY;
        response[18] = challenge[2] ^ 0xAD;
        response[19] = challenge[4] ^ 0x3A;
        if port.send(&response, RESPONSE_WINDOW).is_err() {
            continue;
        }

        let verdict = read_reply(port, |data| data.len() >= 3);
        match verdict.first() {
            Some(0x50) | Some(0x70) => {
                info!(attempt, "TTS-100 accepted authentication");
                return Ok(());
            }
            _ => warn!(attempt, "TTS-100 rejected authentication"),
        }
    }
    Err(HandshakeError::AuthRejected)
}

/// Accumulate reply bytes until `done` is satisfied or the box goes silent
/// for [`RESPONSE_WINDOW`].
fn read_reply(port: &mut dyn SerialPort, done: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    let mut deadline = Instant::now() + RESPONSE_WINDOW;
    while !done(&out) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match port.recv(&mut buf, left) {
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                // Silence window restarts with every byte.
                deadline = Instant::now() + RESPONSE_WINDOW;
            }
            Err(SerialError::Timeout) => break,
            Err(err) => {
                warn!(%err, "read error during handshake");
                break;
            }
        }
    }
    out
}
