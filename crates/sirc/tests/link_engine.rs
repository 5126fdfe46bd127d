//! End-to-end link engine scenarios over the replay serial driver.

use std::{
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    time::Duration,
};

use sirc::{
    link::{EventSink, LinkTask, Radio, RadioVariant},
    scp::{self, FrameFlags},
    ScEvent, ScResult,
};
use sirc_serial::{replay_pair, ReplayHandle};
use sirc_utils::{TaskHandle, TimerService};

const WAIT: Duration = Duration::from_secs(2);

struct ChannelSink(Sender<ScEvent>);

impl EventSink for ChannelSink {
    fn deliver(&self, event: ScEvent) {
        let _ = self.0.send(event);
    }
}

struct Harness {
    radio: Radio,
    task: TaskHandle,
    peer: ReplayHandle,
    events: Receiver<ScEvent>,
    _timers: Arc<TimerService>,
}

fn boot() -> Harness {
    let (port, peer) = replay_pair();
    let timers = Arc::new(TimerService::start());
    let (tx, events) = channel();
    let (task, radio) = LinkTask::new(
        Box::new(port),
        RadioVariant::Direct,
        Arc::new(ChannelSink(tx)),
        timers.clone(),
    );
    let task = TaskHandle::start(task);
    let h = Harness { radio, task, peer, events, _timers: timers };
    assert_eq!(h.events.recv_timeout(WAIT), Ok(ScEvent::Startup));
    h
}

fn descape(wire: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    scp::Descaper::new().feed(wire, &mut out);
    out
}

fn payload_of(frame: &[u8]) -> &[u8] {
    let len = frame[5] as usize;
    &frame[scp::HDR_LEN..scp::HDR_LEN + len]
}

/// Radio-side acknowledgement for our sequence number.
fn ack_frame(seq: u8, flags: FrameFlags) -> Vec<u8> {
    scp::escape(&scp::compose(&[], seq, flags))
}

fn is_command(wire: &[u8], payload: &[u8]) -> bool {
    let frame = descape(wire);
    frame.len() > scp::HDR_LEN && payload_of(&frame) == payload
}

#[test]
fn happy_ack_resolves_success() {
    let mut h = boot();
    let future = h.radio.set_mute(true);

    let wire = h
        .peer
        .wait_for_write(WAIT, |w| is_command(w, &[0x00, 0x03, 0x01]))
        .expect("mute frame on the wire");
    let frame = descape(&wire);
    assert!(scp::validate(&frame));
    assert_eq!(frame[3], 0, "first command takes sequence zero");

    h.peer.feed(&ack_frame(0, FrameFlags::ACK));
    assert_eq!(future.wait(), ScResult::Success);
    assert!(h.radio.is_link_alive());
    h.task.stop();
}

#[test]
fn busy_then_ack_succeeds_without_retry_charge() {
    let mut h = boot();
    let future = h.radio.set_mute(true);
    let payload = [0x00u8, 0x03, 0x01];

    h.peer
        .wait_for_write(WAIT, |w| is_command(w, &payload))
        .expect("first transmission");
    h.peer.feed(&ack_frame(0, FrameFlags::ACK | FrameFlags::BUSY));

    // The deferred frame goes out again once the busy window lapses.
    h.peer
        .wait_for_write(WAIT, |w| is_command(w, &payload))
        .expect("post-busy transmission");
    h.peer.feed(&ack_frame(0, FrameFlags::ACK));

    assert_eq!(future.wait(), ScResult::Success);
    h.task.stop();
}

#[test]
fn checksum_nak_triggers_immediate_resend() {
    let mut h = boot();
    let future = h.radio.get_rssi();
    let payload = [0x40u8, 0x18];

    h.peer
        .wait_for_write(WAIT, |w| is_command(w, &payload))
        .expect("first transmission");
    h.peer.feed(&ack_frame(0, FrameFlags::ACK | FrameFlags::CHKSUM));

    // Resend happens off the ACK path, not the 100 ms tick; it should be
    // nearly instantaneous.
    h.peer
        .wait_for_write(Duration::from_millis(80), |w| is_command(w, &payload))
        .expect("immediate resend");
    h.peer.feed(&ack_frame(0, FrameFlags::ACK));

    assert_eq!(future.wait(), ScResult::Success);
    h.task.stop();
}

#[test]
fn unanswered_request_times_out_after_four_transmissions() {
    let mut h = boot();
    let future = h.radio.set_channel(184);

    assert_eq!(future.wait(), ScResult::Timeout);

    let mut transmissions = 0;
    while let Some(w) = h.peer.take_write(Duration::from_millis(300)) {
        if is_command(&w, &[0x00, 0x0a, 184]) {
            transmissions += 1;
        }
    }
    assert_eq!(transmissions, 1 + 3, "initial send plus MAX_RETRIES");
    h.task.stop();
}

#[test]
fn stray_ack_leaves_head_untouched() {
    let mut h = boot();
    let future = h.radio.set_mute(false);

    h.peer
        .wait_for_write(WAIT, |w| is_command(w, &[0x00, 0x03, 0x00]))
        .expect("frame on the wire");
    // Wrong sequence: logged and discarded.
    h.peer.feed(&ack_frame(77, FrameFlags::ACK));
    h.peer.feed(&ack_frame(0, FrameFlags::ACK));

    assert_eq!(future.wait(), ScResult::Success);
    h.task.stop();
}

#[test]
fn escaped_inbound_frame_decodes_and_is_acked() {
    let mut h = boot();

    // GET_RESP RSSI whose readings collide with the sentinel and escape.
    let payload = [0x60, 0x18, 0x00, 0x00, 0xA4, 0x1B, 0x03];
    let wire = scp::escape(&scp::compose(&payload, 9, FrameFlags::empty()));
    assert!(wire.len() > scp::HDR_LEN + payload.len() + 1, "escaping expanded the frame");
    h.peer.feed(&wire);

    assert_eq!(h.events.recv_timeout(WAIT), Ok(ScEvent::GetResult { result: 0 }));
    assert_eq!(
        h.events.recv_timeout(WAIT),
        Ok(ScEvent::Rssi { composite: 164, satellite: 27, terrestrial: 3 })
    );

    let ack = h
        .peer
        .wait_for_write(WAIT, |w| {
            let f = descape(w);
            f.len() == scp::HDR_LEN + 1 && FrameFlags::from_bits_retain(f[4]) == FrameFlags::ACK
        })
        .expect("bare ack");
    assert_eq!(descape(&ack)[3], 9, "ack echoes the inbound sequence");
    h.task.stop();
}

#[test]
fn replayed_frame_is_acked_but_not_redispatched() {
    let mut h = boot();

    let wire = scp::escape(&scp::compose(&[0x80, 0x00], 5, FrameFlags::empty()));
    h.peer.feed(&wire);
    assert_eq!(h.events.recv_timeout(WAIT), Ok(ScEvent::Reset));

    // The radio replays the same frame; it must be ACKed again but stay
    // silent on the event bus.
    h.peer.feed(&wire);
    let mut acks = 0;
    while let Some(w) = h.peer.take_write(Duration::from_millis(300)) {
        let f = descape(&w);
        if f[3] == 5 && FrameFlags::from_bits_retain(f[4]).contains(FrameFlags::ACK) {
            acks += 1;
        }
    }
    assert_eq!(acks, 2);
    assert!(h.events.try_recv().is_err(), "duplicate frame must not re-notify");
    h.task.stop();
}

#[test]
fn corrupted_frame_gets_checksum_nak_then_resync() {
    let mut h = boot();

    let mut bad = scp::escape(&scp::compose(&[0x80, 0x00], 2, FrameFlags::empty()));
    let last = bad.len() - 1;
    bad[last] ^= 0xFF; // trash the checksum
    h.peer.feed(&bad);
    // A clean frame right behind it must still get through.
    h.peer.feed(&scp::escape(&scp::compose(&[0x80, 0x00], 3, FrameFlags::empty())));

    let nak = h
        .peer
        .wait_for_write(WAIT, |w| {
            let f = descape(w);
            FrameFlags::from_bits_retain(f[4]).contains(FrameFlags::CHKSUM)
        })
        .expect("checksum nak");
    assert_eq!(descape(&nak)[3], 2);

    assert_eq!(h.events.recv_timeout(WAIT), Ok(ScEvent::Reset));
    h.task.stop();
}

#[test]
fn consecutive_timeouts_take_the_link_down() {
    let mut h = boot();

    // Eleven unanswered requests: one past the failure limit.
    let futures: Vec<_> = (0..11).map(|_| h.radio.get_rssi()).collect();
    for f in futures {
        assert_eq!(f.wait(), ScResult::Timeout);
    }

    let deadline = std::time::Instant::now() + WAIT;
    while !h.task.is_shutdown_requested() {
        assert!(std::time::Instant::now() < deadline, "engine never requested shutdown");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!h.radio.is_link_alive());
    h.task.stop();
    // Teardown announces itself.
    let mut saw_shutdown = false;
    while let Ok(e) = h.events.try_recv() {
        saw_shutdown |= e == ScEvent::Shutdown;
    }
    assert!(saw_shutdown);
}

#[test]
fn sequence_numbers_increment_per_request() {
    let mut h = boot();
    let f1 = h.radio.get_gain();
    let w1 = h
        .peer
        .wait_for_write(WAIT, |w| is_command(w, &[0x40, 0x02]))
        .expect("first command");
    assert_eq!(descape(&w1)[3], 0);
    h.peer.feed(&ack_frame(0, FrameFlags::ACK));
    assert_eq!(f1.wait(), ScResult::Success);

    let f2 = h.radio.get_mute();
    let w2 = h
        .peer
        .wait_for_write(WAIT, |w| is_command(w, &[0x40, 0x03]))
        .expect("second command");
    assert_eq!(descape(&w2)[3], 1);
    h.peer.feed(&ack_frame(1, FrameFlags::ACK));
    assert_eq!(f2.wait(), ScResult::Success);
    h.task.stop();
}
