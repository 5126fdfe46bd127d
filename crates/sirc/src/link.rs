//! The SCP link engine.
//!
//! Owns the serial side of the daemon: a stop-and-wait transmit queue with
//! bounded retransmission, busy backoff, duplicate suppression and resync on
//! corruption, plus the typed command API that callers use to talk to the
//! radio. Inbound payloads are dispatched into events and handed to the
//! attached [`EventSink`].
//!
//! Threading: the link task thread reads, parses, and ACKs; the timer
//! worker drives retransmission through [`LinkShared::tick`]; any thread
//! may submit a command. The queue mutex serialises all of them, and the
//! port mutex is only ever taken below it.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use sirc_serial::{SerialError, SerialPort};
use sirc_utils::{SlideBuffer, Task, TaskCtl, TimerHandle, TimerService, INVALID_TIMER, TIMER_TICK_MS};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::RadioCache,
    dispatch::dispatch,
    events::ScEvent,
    handshake,
    request::{completion_pair, CommandFuture, OutboundRequest, ScResult},
    scp::{self, get, opcode, set, Descaper, FrameFlags, Header},
};

/// Maximum retransmissions of a single frame.
pub const MAX_RETRIES: u32 = 3;
/// Consecutive request timeouts tolerated before the link is declared dead.
pub const MAX_LINK_FAILURES: u32 = 10;
/// Retransmit ticks to hold off after the radio reports busy. Tunable; the
/// radio recovers within one tick in practice.
pub const BUSY_DELAY_TICKS: u32 = 1;
/// Longest silence tolerated before a keepalive probe goes out.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(30);
/// Staging buffer size: room for two maximal frames.
pub const STAGE_BUF_LEN: usize = 2 * scp::MAX_FRAME;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Receiver of decoded radio events.
///
/// Implementations are called from the link task thread and must not block
/// for long; the usual implementation pushes onto a channel and wakes the
/// consumer.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ScEvent);
}

/// Which hardware sits on the far end of the serial cable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioVariant {
    /// A SiriusConnect tuner wired up directly; no unlock needed.
    Direct,
    /// A TTS-100 interface box that demands the version probe and
    /// challenge/response unlock before any SCP traffic.
    Tts100,
}

struct TxQueue {
    requests: VecDeque<OutboundRequest>,
    /// Next outbound sequence number.
    seq_tx: u8,
    /// Residual busy backoff, in retransmit ticks.
    busy_ticks: u32,
}

struct LinkShared {
    port: Mutex<Box<dyn SerialPort>>,
    queue: Mutex<TxQueue>,
    cache: RadioCache,
    link_alive: AtomicBool,
    /// Consecutive request timeouts.
    link_failures: AtomicU32,
    /// Bytes skipped while hunting for a frame sentinel.
    resyncs: AtomicU64,
}

impl LinkShared {
    /// Compose, escape, and queue a command payload.
    ///
    /// If the queue is idle the frame goes on the wire immediately;
    /// otherwise the retransmit tick picks it up once it reaches the head.
    fn submit(&self, payload: &[u8]) -> CommandFuture {
        if payload.len() > scp::MAX_DATA {
            return CommandFuture::resolved(ScResult::NoMemory);
        }
        let (completion, future) = completion_pair();
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let seq = q.seq_tx;
        q.seq_tx = q.seq_tx.wrapping_add(1);
        let frame = scp::compose(payload, seq, FrameFlags::empty());
        let mut req = OutboundRequest {
            seq,
            retries: 0,
            sent: false,
            wire: scp::escape(&frame),
            completion,
        };
        if q.requests.is_empty() && q.busy_ticks == 0 {
            self.transmit(&mut req);
        }
        q.requests.push_back(req);
        future
    }

    /// Put a request's frame on the wire. Called with the queue lock held.
    fn transmit(&self, req: &mut OutboundRequest) {
        trace!(seq = req.seq, wire = %hex(&req.wire), "tx frame");
        let mut port = self.port.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = port.send(&req.wire, SEND_TIMEOUT) {
            warn!(seq = req.seq, %err, "frame transmit failed");
        }
        req.sent = true;
    }

    /// Send a bare acknowledgement frame for an inbound sequence number.
    fn send_ack(&self, seq: u8, flags: FrameFlags) {
        let wire = scp::escape(&scp::compose(&[], seq, flags));
        trace!(seq, ?flags, "tx ack");
        let mut port = self.port.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = port.send(&wire, SEND_TIMEOUT) {
            warn!(seq, %err, "ack transmit failed");
        }
    }

    /// Process an acknowledgement frame against the queue head.
    fn handle_ack(&self, seq: u8, flags: FrameFlags) {
        let mut guard = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let q = &mut *guard;
        let Some(head) = q.requests.front_mut() else {
            debug!(seq, "ack with nothing outstanding");
            return;
        };
        if head.seq != seq {
            warn!(seq, expected = head.seq, "ack for wrong sequence, ignored");
            return;
        }
        if flags.contains(FrameFlags::CHKSUM) {
            // Frame arrived garbled; resend right away, no retry charged.
            debug!(seq, "radio reports bad checksum, resending");
            self.transmit(head);
        } else if flags.contains(FrameFlags::BUSY) {
            debug!(seq, "radio busy, deferring");
            q.busy_ticks = BUSY_DELAY_TICKS;
            head.sent = false;
        } else {
            let mut req = q.requests.pop_front().expect("head exists");
            req.completion.resolve(ScResult::Success);
            self.link_failures.store(0, Ordering::Relaxed);
            self.link_alive.store(true, Ordering::Relaxed);
            if q.busy_ticks == 0 {
                if let Some(next) = q.requests.front_mut() {
                    self.transmit(next);
                }
            }
        }
    }

    /// One retransmit tick: burn down busy backoff, then advance the head
    /// request's retry state. Runs on the timer worker.
    fn tick(&self, ctl: &TaskCtl) {
        let mut guard = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let q = &mut *guard;
        if q.busy_ticks > 0 {
            q.busy_ticks -= 1;
            if q.busy_ticks > 0 {
                return;
            }
        }
        let Some(head) = q.requests.front_mut() else {
            return;
        };
        if !head.sent {
            self.transmit(head);
            return;
        }
        if head.retries < MAX_RETRIES {
            head.retries += 1;
            debug!(seq = head.seq, retry = head.retries, "retransmitting");
            self.transmit(head);
            return;
        }
        let mut req = q.requests.pop_front().expect("head exists");
        drop(guard);
        req.completion.resolve(ScResult::Timeout);
        let failures = self.link_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(seq = req.seq, failures, "request timed out");
        if failures > MAX_LINK_FAILURES {
            error!("link failure limit exceeded, taking the link down");
            self.link_alive.store(false, Ordering::Relaxed);
            ctl.request_shutdown();
        }
    }

    fn clear_busy(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).busy_ticks = 0;
    }

    /// Resolve everything still queued. Called at link teardown.
    fn drain(&self) {
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        for mut req in q.requests.drain(..) {
            req.completion.resolve(ScResult::Shutdown);
        }
    }
}

/// Cloneable command interface to the radio.
///
/// Commands may be submitted from any thread; each returns a
/// [`CommandFuture`] resolving when the radio acknowledges the frame, the
/// retries run out, or the link dies.
#[derive(Clone)]
pub struct Radio {
    shared: Arc<LinkShared>,
}

impl Radio {
    pub fn reset(&self) -> CommandFuture {
        self.shared.submit(&[opcode::SET, set::RESET])
    }

    pub fn set_power(&self, mode: u8) -> CommandFuture {
        self.shared.submit(&[opcode::SET, set::POWER, mode])
    }

    pub fn set_mute(&self, on: bool) -> CommandFuture {
        self.shared.submit(&[opcode::SET, set::MUTE, u8::from(on)])
    }

    /// Subscribe to asynchronous notifications; `flags` is a bitwise OR of
    /// [`scp::async_flag`] bits.
    pub fn enable_async_notifications(&self, flags: u8) -> CommandFuture {
        self.shared.submit(&[opcode::SET, set::ASYNC, flags])
    }

    pub fn set_gain(&self, db: i8) -> CommandFuture {
        self.shared.submit(&[opcode::SET, set::GAIN, db as u8])
    }

    pub fn set_tz(&self, offset_min: i16, dst: bool) -> CommandFuture {
        let off = (offset_min as u16).to_be_bytes();
        self.shared.submit(&[opcode::SET, set::TZ_INFO, off[0], off[1], u8::from(dst)])
    }

    pub fn set_channel(&self, channel: u8) -> CommandFuture {
        self.shared.submit(&[opcode::SET, set::CHANNEL, channel])
    }

    pub fn get_gain(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::GAIN])
    }

    pub fn get_power(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::POWER])
    }

    pub fn get_mute(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::MUTE])
    }

    pub fn get_status(&self, kind: u8) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::STATUS, kind])
    }

    pub fn get_channel_map(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::CHANNEL_MAP])
    }

    pub fn get_sid(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::SID])
    }

    pub fn get_channel(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::CHANNEL])
    }

    pub fn get_channel_info(&self, channel: u8) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::CHANNEL_INFO, channel])
    }

    pub fn get_rssi(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::RSSI])
    }

    pub fn get_song_info(&self, channel: u8) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::SONG_INFO, channel])
    }

    pub fn get_time(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::TIME])
    }

    pub fn get_tz(&self) -> CommandFuture {
        self.shared.submit(&[opcode::GET, get::TZ_INFO])
    }

    pub fn is_link_alive(&self) -> bool {
        self.shared.link_alive.load(Ordering::Relaxed)
    }

    pub fn is_valid_channel(&self, channel: u8) -> bool {
        self.shared.cache.is_valid_channel(channel)
    }

    pub fn current_channel(&self) -> u8 {
        self.shared.cache.current_channel()
    }

    pub fn channel_map(&self) -> [u8; scp::CHANNEL_BITMAP_LEN] {
        self.shared.cache.channel_map()
    }
}

/// The link task: owns the serial read loop and all receive-side state.
pub struct LinkTask {
    shared: Arc<LinkShared>,
    sink: Arc<dyn EventSink>,
    timers: Arc<TimerService>,
    tick_timer: TimerHandle,
    variant: RadioVariant,
    stage: SlideBuffer,
    descaper: Descaper,
    decoded: Vec<u8>,
    /// Last accepted inbound sequence number; -1 until the first frame.
    last_seq_rx: i32,
    seq_expected: u8,
    last_rx: Instant,
}

impl LinkTask {
    /// Wrap an opened (and, for [`RadioVariant::Tts100`], still-locked)
    /// serial port. Returns the task and the command handle bound to it.
    pub fn new(
        port: Box<dyn SerialPort>,
        variant: RadioVariant,
        sink: Arc<dyn EventSink>,
        timers: Arc<TimerService>,
    ) -> (Self, Radio) {
        let shared = Arc::new(LinkShared {
            port: Mutex::new(port),
            queue: Mutex::new(TxQueue {
                requests: VecDeque::new(),
                seq_tx: 0,
                busy_ticks: 0,
            }),
            cache: RadioCache::new(),
            link_alive: AtomicBool::new(false),
            link_failures: AtomicU32::new(0),
            resyncs: AtomicU64::new(0),
        });
        let radio = Radio { shared: shared.clone() };
        let task = Self {
            shared,
            sink,
            timers,
            tick_timer: INVALID_TIMER,
            variant,
            stage: SlideBuffer::new(STAGE_BUF_LEN),
            descaper: Descaper::new(),
            decoded: Vec::with_capacity(STAGE_BUF_LEN),
            last_seq_rx: -1,
            seq_expected: 0,
            last_rx: Instant::now(),
        };
        (task, radio)
    }

    fn process_frames(&mut self) {
        while self.stage.read_len() >= scp::HDR_LEN {
            if self.stage.unread()[0] != scp::SENTINEL {
                self.stage.mark_read(1);
                let skipped = self.shared.resyncs.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(skipped, "skipping byte while searching for sentinel");
                continue;
            }
            let hdr = Header::parse(self.stage.unread()).expect("header length checked");
            let total = hdr.frame_len();
            if self.stage.read_len() < total {
                break;
            }
            if !scp::validate(&self.stage.unread()[..total]) {
                warn!(seq = hdr.seq, "bad frame checksum");
                self.shared.send_ack(hdr.seq, FrameFlags::ACK | FrameFlags::CHKSUM);
                // The header itself is untrustworthy; skip only the
                // sentinel and rescan from the next byte.
                self.stage.mark_read(1);
                continue;
            }
            let frame = self.stage.unread()[..total].to_vec();
            self.stage.mark_read(total);
            self.handle_frame(&frame, hdr);
        }
    }

    fn handle_frame(&mut self, frame: &[u8], hdr: Header) {
        if hdr.flags.contains(FrameFlags::ACK) {
            self.shared.handle_ack(hdr.seq, hdr.flags);
            return;
        }

        self.shared.send_ack(hdr.seq, FrameFlags::ACK);
        let duplicate = self.last_seq_rx == i32::from(hdr.seq);
        if duplicate {
            // The radio replays its last async frame now and then; it wants
            // the ACK but observers must not hear the event twice.
            debug!(seq = hdr.seq, "duplicate frame suppressed");
        } else {
            if hdr.seq != self.seq_expected {
                warn!(seq = hdr.seq, expected = self.seq_expected, "sequence gap, accepting");
            }
            let payload = &frame[scp::HDR_LEN..scp::HDR_LEN + hdr.len as usize];
            trace!(seq = hdr.seq, payload = %hex(payload), "rx frame");
            for event in dispatch(payload, &self.shared.cache) {
                self.sink.deliver(event);
            }
            self.shared.link_alive.store(true, Ordering::Relaxed);
        }
        self.last_seq_rx = i32::from(hdr.seq);
        self.seq_expected = hdr.seq.wrapping_add(1);
        self.shared.clear_busy();
    }

    fn ingest(&mut self, raw: &[u8]) {
        self.decoded.clear();
        self.descaper.feed(raw, &mut self.decoded);
        let decoded = std::mem::take(&mut self.decoded);
        let mut offset = 0;
        while offset < decoded.len() {
            let room = self.stage.write_len();
            if room == 0 {
                // A full buffer with nothing parseable in it is garbage;
                // start over rather than wedge.
                warn!("staging buffer overflow, clearing");
                self.stage.clear();
                continue;
            }
            let n = room.min(decoded.len() - offset);
            self.stage.writable()[..n].copy_from_slice(&decoded[offset..offset + n]);
            self.stage.mark_written(n);
            offset += n;
            self.process_frames();
        }
        self.decoded = decoded;
    }
}

impl Task for LinkTask {
    fn name(&self) -> &'static str {
        "scp-link"
    }

    fn on_start(&mut self, ctl: &TaskCtl) -> bool {
        if self.variant == RadioVariant::Tts100 {
            let mut port = self.shared.port.lock().unwrap_or_else(|e| e.into_inner());
            match handshake::establish(port.as_mut()) {
                Ok(Some(version)) => {
                    info!(major = version.major, minor = version.minor, "TTS-100 unlocked");
                }
                Ok(None) => info!("no TTS-100 detected, talking SCP directly"),
                Err(err) => {
                    error!(%err, "TTS-100 handshake failed");
                    return false;
                }
            }
        }

        let shared = self.shared.clone();
        let tick_ctl = ctl.clone();
        self.tick_timer = self.timers.create(TIMER_TICK_MS, move || shared.tick(&tick_ctl));

        self.last_rx = Instant::now();
        self.shared.link_alive.store(true, Ordering::Relaxed);
        self.sink.deliver(ScEvent::Startup);
        true
    }

    fn on_run(&mut self, ctl: &TaskCtl) {
        let mut buf = [0u8; 256];
        while !ctl.is_shutdown_requested() {
            let read = {
                let mut port = self.shared.port.lock().unwrap_or_else(|e| e.into_inner());
                port.recv(&mut buf, RECV_TIMEOUT)
            };
            match read {
                Ok(n) => {
                    self.last_rx = Instant::now();
                    self.ingest(&buf[..n]);
                }
                Err(SerialError::Timeout) => {
                    if self.shared.link_alive.load(Ordering::Relaxed)
                        && self.last_rx.elapsed() >= LINK_TIMEOUT
                    {
                        debug!("link idle, sending keepalive probe");
                        drop(self.shared.submit(&[opcode::GET, get::RSSI]));
                        // Reset so one probe per idle window, not a storm.
                        self.last_rx = Instant::now();
                    }
                }
                Err(err) => {
                    error!(%err, "serial receive failed, stopping link");
                    ctl.request_shutdown();
                }
            }
        }
    }

    fn on_exit(&mut self) {
        if self.tick_timer != INVALID_TIMER {
            self.timers.destroy(self.tick_timer);
            self.tick_timer = INVALID_TIMER;
        }
        self.shared.drain();
        self.shared.link_alive.store(false, Ordering::Relaxed);
        self.sink.deliver(ScEvent::Shutdown);
        self.shared.port.lock().unwrap_or_else(|e| e.into_inner()).close();
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!("{b:02X}"));
    }
    out
}
