//! Socket-level tests of the daemon: a real TCP server, scripted radio.

use std::{
    io::{BufRead, BufReader, Write},
    net::{Ipv4Addr, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::channel,
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use sirc::{
    scp::{self, FrameFlags},
    LinkTask, RadioVariant,
};
use sirc_serial::{replay_pair, ReplayHandle};
use sirc_utils::{TaskHandle, TimerService};
use sircd::{RadioEventBridge, Server, SirServer};

const WAIT: Duration = Duration::from_secs(5);

/// Radio stand-in: acknowledge every command frame the engine puts on the
/// wire, ignore the engine's own ACKs.
fn spawn_acker(peer: ReplayHandle, stop: Arc<AtomicBool>) -> JoinHandle<ReplayHandle> {
    std::thread::spawn(move || {
        loop {
            match peer.take_write(Duration::from_millis(200)) {
                Some(wire) => {
                    let mut frame = Vec::new();
                    scp::Descaper::new().feed(&wire, &mut frame);
                    if frame.len() >= scp::HDR_LEN
                        && !FrameFlags::from_bits_retain(frame[4]).contains(FrameFlags::ACK)
                    {
                        peer.feed(&scp::escape(&scp::compose(&[], frame[3], FrameFlags::ACK)));
                    }
                }
                None => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        peer
    })
}

struct Daemon {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    acker_stop: Arc<AtomicBool>,
    server: Option<JoinHandle<()>>,
    acker: Option<JoinHandle<ReplayHandle>>,
    radio_task: TaskHandle,
    _timers: Arc<TimerService>,
}

impl Daemon {
    /// Boot the full daemon stack on an ephemeral port.
    fn boot() -> Self {
        let (port, peer) = replay_pair();
        let timers = Arc::new(TimerService::start());
        let server = Server::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let addr = server.local_addr().unwrap();

        let (event_tx, event_rx) = channel();
        let bridge = Arc::new(RadioEventBridge::new(event_tx, server.waker()));
        let (link, radio) =
            LinkTask::new(Box::new(port), RadioVariant::Direct, bridge, timers.clone());
        let radio_task = TaskHandle::start(link);

        let stop = Arc::new(AtomicBool::new(false));
        let acker_stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(peer, acker_stop.clone());

        let run_stop = stop.clone();
        let server = std::thread::spawn(move || {
            let mut server = server;
            let mut handler = SirServer::new(radio, event_rx);
            server.run(&mut handler, || run_stop.load(Ordering::Relaxed));
        });

        Self {
            addr,
            stop,
            acker_stop,
            server: Some(server),
            acker: Some(acker),
            radio_task,
            _timers: timers,
        }
    }

    fn connect(&self) -> (TcpStream, BufReader<TcpStream>) {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    /// Borrow the radio-side handle briefly, e.g. to inject async frames.
    fn with_peer(&mut self, f: impl FnOnce(&ReplayHandle)) {
        self.acker_stop.store(true, Ordering::Relaxed);
        let peer = self.acker.take().unwrap().join().unwrap();
        self.acker_stop.store(false, Ordering::Relaxed);
        f(&peer);
        self.acker = Some(spawn_acker(peer, self.acker_stop.clone()));
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.acker_stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.server.take() {
            t.join().unwrap();
        }
        if let Some(t) = self.acker.take() {
            t.join().unwrap();
        }
        self.radio_task.stop();
    }
}

fn send(stream: &mut TcpStream, line: &str) {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
}

fn recv(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end().to_string()
}

#[test]
fn control_handoff_between_clients() {
    let daemon = Daemon::boot();
    let (mut a, mut a_rx) = daemon.connect();
    let (mut b, mut b_rx) = daemon.connect();

    send(&mut a, "CONTROL ACQUIRE");
    assert_eq!(recv(&mut a_rx), "CONTROL,ACQUIRED");

    send(&mut b, "CONTROL ACQUIRE");
    assert_eq!(recv(&mut b_rx), "CONTROL,PENDING");

    // Re-acquiring while holding is answered the same way.
    send(&mut a, "CONTROL ACQUIRE");
    assert_eq!(recv(&mut a_rx), "CONTROL,ACQUIRED");

    send(&mut a, "CONTROL RELEASE");
    assert_eq!(recv(&mut a_rx), "CONTROL,RELEASED");
    assert_eq!(recv(&mut b_rx), "CONTROL,ACQUIRED");

    daemon.shutdown();
}

#[test]
fn gets_are_open_sets_are_gated() {
    let daemon = Daemon::boot();
    let (mut a, mut a_rx) = daemon.connect();
    let (mut b, mut b_rx) = daemon.connect();

    // GETs need no control and resolve once the radio ACKs.
    send(&mut a, "GET RSSI");
    assert_eq!(recv(&mut a_rx), "OK");

    // SET without the control token is rejected outright.
    send(&mut b, "SET MUTE 1");
    assert_eq!(recv(&mut b_rx), "ERROR");

    send(&mut b, "CONTROL ACQUIRE");
    assert_eq!(recv(&mut b_rx), "CONTROL,ACQUIRED");
    send(&mut b, "SET MUTE 1");
    assert_eq!(recv(&mut b_rx), "OK");

    daemon.shutdown();
}

#[test]
fn malformed_commands_get_error_and_connection_survives() {
    let daemon = Daemon::boot();
    let (mut a, mut a_rx) = daemon.connect();

    send(&mut a, "GET"); // missing argument
    assert_eq!(recv(&mut a_rx), "ERROR");
    send(&mut a, "GET CHANNELINFO 999"); // channel out of range
    assert_eq!(recv(&mut a_rx), "ERROR");
    send(&mut a, "GET STATUS 7"); // unknown status type
    assert_eq!(recv(&mut a_rx), "ERROR");
    send(&mut a, "SET MUTE maybe"); // no control held, and garbage anyway
    assert_eq!(recv(&mut a_rx), "ERROR");

    // Unknown verbs are logged, not answered; the session keeps working.
    send(&mut a, "BOGUS THING");
    send(&mut a, "GET RSSI");
    assert_eq!(recv(&mut a_rx), "OK");

    daemon.shutdown();
}

#[test]
fn async_events_fan_out_to_all_clients() {
    let mut daemon = Daemon::boot();
    let (_a, mut a_rx) = daemon.connect();
    let (_b, mut b_rx) = daemon.connect();

    // Give the server a moment to accept both before the event arrives.
    std::thread::sleep(Duration::from_millis(200));

    daemon.with_peer(|peer| {
        // Async SONGID notification from the radio.
        let payload = [0x80, 0x02, 4, b'X', b'Y', b'1', b'2'];
        peer.feed(&scp::escape(&scp::compose(&payload, 0, FrameFlags::empty())));
    });

    assert_eq!(recv(&mut a_rx), "SONGID,\"XY12\"");
    assert_eq!(recv(&mut b_rx), "SONGID,\"XY12\"");

    daemon.shutdown();
}

#[test]
fn quit_drops_the_client_and_promotes_waiters() {
    let daemon = Daemon::boot();
    let (mut a, mut a_rx) = daemon.connect();
    let (mut b, mut b_rx) = daemon.connect();

    send(&mut a, "CONTROL ACQUIRE");
    assert_eq!(recv(&mut a_rx), "CONTROL,ACQUIRED");
    send(&mut b, "CONTROL ACQUIRE");
    assert_eq!(recv(&mut b_rx), "CONTROL,PENDING");

    send(&mut a, "QUIT");
    let mut end = String::new();
    // Server closes the socket; EOF reads as zero bytes.
    assert_eq!(a_rx.read_line(&mut end).unwrap(), 0);

    // The waiter inherits control without asking again.
    assert_eq!(recv(&mut b_rx), "CONTROL,ACQUIRED");

    daemon.shutdown();
}
