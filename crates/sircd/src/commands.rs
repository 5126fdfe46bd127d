//! The SiriusConnect text command protocol and event fanout.
//!
//! Client lines are whitespace-separated tokens. The first token picks the
//! verb; a validator checks arity and authorisation before the handler
//! touches the radio. Radio events are rendered to their canonical text
//! lines and pushed to every client, except GET/SET result codes, which
//! correlate to the control holder's pending request and go only there.

use std::sync::{
    mpsc::{Receiver, Sender},
    Arc,
};

use mio::{Token, Waker};
use sirc::{
    scp::{self, async_flag},
    EventSink, Radio, ScEvent, ScResult,
};
use tracing::{debug, info, warn};

use crate::{
    control::{AcquireOutcome, ControlArbiter},
    server::{Server, ServerHandler},
};

/// Channel tuned at startup when the radio isn't on a valid one.
pub const DEFAULT_CHANNEL: u8 = 184;

/// Link-thread side of the event bus: queues the event and rings the
/// server's waker so the fanout happens on the server thread.
pub struct RadioEventBridge {
    tx: Sender<ScEvent>,
    waker: Arc<Waker>,
}

impl RadioEventBridge {
    pub fn new(tx: Sender<ScEvent>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }
}

impl EventSink for RadioEventBridge {
    fn deliver(&self, event: ScEvent) {
        let _ = self.tx.send(event);
        if let Err(err) = self.waker.wake() {
            warn!(%err, "server waker failed");
        }
    }
}

/// The application half of the daemon: command handling plus control
/// arbitration over the generic TCP server.
pub struct SirServer {
    radio: Radio,
    events: Receiver<ScEvent>,
    arbiter: ControlArbiter,
}

impl SirServer {
    pub fn new(radio: Radio, events: Receiver<ScEvent>) -> Self {
        Self { radio, events, arbiter: ControlArbiter::new() }
    }

    fn reply_result(server: &mut Server, client: Token, result: ScResult) {
        let line = match result {
            ScResult::Success => "OK",
            ScResult::Timeout => "TIMEOUT",
            ScResult::NoMemory | ScResult::Shutdown => "ERROR",
        };
        server.send_line(client, line);
    }

    /// Validate a GET and hand back its pending future, or None on any
    /// arity or argument failure.
    fn validate_get(&self, tokens: &[&str]) -> Option<sirc::CommandFuture> {
        match (tokens.get(1).copied()?, tokens.len()) {
            ("GAIN", 2) => Some(self.radio.get_gain()),
            ("MUTE", 2) => Some(self.radio.get_mute()),
            ("POWER", 2) => Some(self.radio.get_power()),
            ("CHANNEL", 2) => Some(self.radio.get_channel()),
            ("CHANNELMAP", 2) => Some(self.radio.get_channel_map()),
            ("SID", 2) => Some(self.radio.get_sid()),
            ("TZINFO", 2) => Some(self.radio.get_tz()),
            ("TIME", 2) => Some(self.radio.get_time()),
            ("RSSI", 2) => Some(self.radio.get_rssi()),
            ("CHANNELINFO", 3) => {
                Some(self.radio.get_channel_info(parse_channel(tokens[2])?))
            }
            ("SONGINFO", 3) => Some(self.radio.get_song_info(parse_channel(tokens[2])?)),
            ("STATUS", 3) => {
                let kind: u8 = tokens[2].parse().ok()?;
                (kind <= scp::status_type::ANTENNA).then(|| self.radio.get_status(kind))
            }
            _ => None,
        }
    }

    /// Validate a SET and hand back its pending future. The caller has
    /// already been checked against the control token.
    fn validate_set(&self, tokens: &[&str]) -> Option<sirc::CommandFuture> {
        match (tokens.get(1).copied()?, tokens.len()) {
            ("RESET", 2) => Some(self.radio.reset()),
            ("GAIN", 3) => Some(self.radio.set_gain(tokens[2].parse().ok()?)),
            ("MUTE", 3) => Some(self.radio.set_mute(parse_bool(tokens[2])?)),
            ("POWER", 3) => Some(self.radio.set_power(tokens[2].parse().ok()?)),
            ("CHANNEL", 3) => {
                let channel = parse_channel(tokens[2])?;
                self.radio.is_valid_channel(channel).then(|| self.radio.set_channel(channel))
            }
            ("TZINFO", 4) => {
                let offset: i16 = tokens[2].parse().ok()?;
                Some(self.radio.set_tz(offset, parse_bool(tokens[3])?))
            }
            ("ASYNC", 3) => {
                Some(self.radio.enable_async_notifications(tokens[2].parse().ok()?))
            }
            _ => None,
        }
    }

    fn process_control(&mut self, server: &mut Server, client: Token, tokens: &[&str]) {
        if tokens.len() != 2 {
            server.send_line(client, "ERROR");
            return;
        }
        match tokens[1] {
            "ACQUIRE" => match self.arbiter.acquire(client) {
                AcquireOutcome::Acquired => server.send_line(client, "CONTROL,ACQUIRED"),
                AcquireOutcome::Pending => server.send_line(client, "CONTROL,PENDING"),
            },
            "RELEASE" => {
                let next = self.arbiter.release(client);
                server.send_line(client, "CONTROL,RELEASED");
                if let Some(next) = next {
                    server.send_line(next, "CONTROL,ACQUIRED");
                }
            }
            _ => server.send_line(client, "ERROR"),
        }
    }

    /// Work queued off the radio's startup announcement: subscribe to the
    /// notifications we relay, prime the cache, and land on a sane channel.
    /// Outcomes are deliberately discarded; these are housekeeping, not a
    /// client's request.
    fn on_radio_startup(&self) {
        info!("radio link up, priming state");
        drop(self.radio.enable_async_notifications(
            async_flag::TIME | async_flag::SIGNAL | async_flag::CHANNEL_INFO | async_flag::SONG_ID,
        ));
        drop(self.radio.get_channel_map());
        drop(self.radio.get_sid());
        if !self.radio.is_valid_channel(self.radio.current_channel()) {
            drop(self.radio.set_channel(DEFAULT_CHANNEL));
        }
    }

    fn fanout(&mut self, server: &mut Server, event: ScEvent) {
        match event {
            ScEvent::GetResult { .. } | ScEvent::SetResult { .. } => {
                // These correlate to the controller's pending request.
                if let Some(holder) = self.arbiter.holder() {
                    server.send_line(holder, &event.to_string());
                }
            }
            ScEvent::Startup => {
                server.broadcast(&event.to_string());
                self.on_radio_startup();
            }
            other => server.broadcast(&other.to_string()),
        }
    }
}

impl ServerHandler for SirServer {
    fn on_line(&mut self, server: &mut Server, client: Token, line: &str) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&verb) = tokens.first() else {
            return;
        };
        debug!(?client, line, "command");
        match verb {
            "GET" => match self.validate_get(&tokens) {
                Some(future) => Self::reply_result(server, client, future.wait()),
                None => server.send_line(client, "ERROR"),
            },
            "SET" => {
                if !self.arbiter.has_control(client) {
                    server.send_line(client, "ERROR");
                    return;
                }
                match self.validate_set(&tokens) {
                    Some(future) => Self::reply_result(server, client, future.wait()),
                    None => server.send_line(client, "ERROR"),
                }
            }
            "CONTROL" => self.process_control(server, client, &tokens),
            "QUIT" => {
                if tokens.len() == 1 {
                    server.drop_client(client);
                } else {
                    server.send_line(client, "ERROR");
                }
            }
            other => warn!(?client, verb = other, "unknown command verb"),
        }
    }

    fn on_detach(&mut self, server: &mut Server, client: Token) {
        if let Some(next) = self.arbiter.drop_client(client) {
            server.send_line(next, "CONTROL,ACQUIRED");
        }
    }

    fn on_wake(&mut self, server: &mut Server) {
        while let Ok(event) = self.events.try_recv() {
            self.fanout(server, event);
        }
    }
}

fn parse_channel(token: &str) -> Option<u8> {
    let channel: u8 = token.parse().ok()?;
    (channel < scp::MAX_CHANNELS).then_some(channel)
}

fn parse_bool(token: &str) -> Option<bool> {
    match token {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parsing_bounds() {
        assert_eq!(parse_channel("0"), Some(0));
        assert_eq!(parse_channel("223"), Some(223));
        assert_eq!(parse_channel("224"), None);
        assert_eq!(parse_channel("-1"), None);
        assert_eq!(parse_channel("xyz"), None);
    }

    #[test]
    fn bool_parsing_is_strict() {
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_bool("on"), None);
    }
}
