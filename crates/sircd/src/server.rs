//! Multiplexed TCP server with slide-over client buffers.
//!
//! One poll loop watches the listener, every accepted client, and a waker
//! used by other threads to push radio events in. The loop ticks at one
//! second so shutdown flags and housekeeping are observed even when the
//! sockets are idle. Accepts are serviced before client I/O, and clients
//! are visited in list order within a tick, so a slow client cannot starve
//! the listener.

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Registry, Token, Waker,
};
use sirc_utils::SlideBuffer;
use tracing::{debug, error, info, warn};

/// Size of each per-client RX and TX buffer.
pub const CLIENT_BUF_SIZE: usize = 512;

const SELECT_TICK: Duration = Duration::from_secs(1);
const LISTENER: Token = Token(usize::MAX - 1);
const WAKER: Token = Token(usize::MAX - 2);

/// Application half of the server: consumes client lines and reacts to
/// lifecycle changes. The server half owns sockets, buffers, and the poll
/// loop.
pub trait ServerHandler {
    fn on_attach(&mut self, _server: &mut Server, _client: Token) {}

    /// One newline-terminated line from a client, terminator stripped.
    fn on_line(&mut self, server: &mut Server, client: Token, line: &str);

    /// The client is gone: socket error, peer close, or QUIT. It has
    /// already been removed from the server's list.
    fn on_detach(&mut self, _server: &mut Server, _client: Token) {}

    /// Another thread rang the waker.
    fn on_wake(&mut self, _server: &mut Server) {}
}

struct Client {
    token: Token,
    stream: TcpStream,
    peer: SocketAddr,
    rx: SlideBuffer,
    tx: SlideBuffer,
    /// True while WRITABLE interest is registered.
    /// Invariant: armed == (tx has pending bytes) outside of flush.
    writable_armed: bool,
    dead: bool,
}

impl Client {
    fn new(token: Token, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            token,
            stream,
            peer,
            rx: SlideBuffer::new(CLIENT_BUF_SIZE),
            tx: SlideBuffer::new(CLIENT_BUF_SIZE),
            writable_armed: false,
            dead: false,
        }
    }

    /// Pull complete lines out of the RX buffer.
    fn extract_lines(&mut self, lines: &mut Vec<String>) {
        while let Some(pos) = self.rx.unread().iter().position(|&b| b == b'\n') {
            let mut line = self.rx.unread()[..pos].to_vec();
            self.rx.mark_read(pos + 1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Write as much pending TX as the socket will take, arming writable
    /// interest for the remainder.
    fn flush(&mut self, registry: &Registry) {
        while self.tx.read_len() > 0 {
            match self.stream.write(self.tx.unread()) {
                Ok(0) => {
                    self.dead = true;
                    return;
                }
                Ok(n) => self.tx.mark_read(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(peer = %self.peer, %err, "client write failed");
                    self.dead = true;
                    return;
                }
            }
        }

        let want_writable = self.tx.read_len() > 0;
        if want_writable != self.writable_armed {
            let interest = if want_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(err) = registry.reregister(&mut self.stream, self.token, interest) {
                debug!(peer = %self.peer, %err, "client reregister failed");
                self.dead = true;
                return;
            }
            self.writable_armed = want_writable;
        }
    }
}

pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    clients: Vec<Client>,
    next_token: usize,
    waker: Arc<Waker>,
}

impl Server {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        info!(%addr, "listening");
        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            clients: Vec::new(),
            next_token: 0,
            waker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waker for cross-thread nudges; firing it invokes
    /// [`ServerHandler::on_wake`] on the next loop pass.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Queue a line (newline appended) for one client.
    ///
    /// A client too slow to drain its buffer is dropped rather than allowed
    /// to stall the rest.
    pub fn send_line(&mut self, client: Token, line: &str) {
        let Some(idx) = self.clients.iter().position(|c| c.token == client) else {
            return;
        };
        {
            let c = &mut self.clients[idx];
            if c.dead {
                return;
            }
            let needed = line.len() + 1;
            if c.tx.write_len() < needed {
                warn!(peer = %c.peer, "client tx buffer overflow, dropping");
                c.dead = true;
                return;
            }
            let w = c.tx.writable();
            w[..line.len()].copy_from_slice(line.as_bytes());
            w[line.len()] = b'\n';
            c.tx.mark_written(needed);
        }
        let registry = self.poll.registry();
        self.clients[idx].flush(registry);
    }

    /// Queue a line for every connected client.
    pub fn broadcast(&mut self, line: &str) {
        let tokens: Vec<Token> = self.clients.iter().map(|c| c.token).collect();
        for token in tokens {
            self.send_line(token, line);
        }
    }

    /// Mark a client for removal at the end of the current pass.
    pub fn drop_client(&mut self, client: Token) {
        if let Some(c) = self.clients.iter_mut().find(|c| c.token == client) {
            c.dead = true;
        }
    }

    /// Drive the server until `should_stop` returns true.
    pub fn run<H: ServerHandler>(&mut self, handler: &mut H, should_stop: impl Fn() -> bool) {
        while !should_stop() {
            if let Err(err) = self.poll.poll(&mut self.events, Some(SELECT_TICK)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "poll failed");
                break;
            }

            let mut accept = false;
            let mut woke = false;
            let mut ready: Vec<(Token, bool, bool)> = Vec::new();
            for ev in self.events.iter() {
                match ev.token() {
                    LISTENER => accept = true,
                    WAKER => woke = true,
                    token => ready.push((token, ev.is_readable(), ev.is_writable())),
                }
            }

            if accept {
                self.accept_clients(handler);
            }

            // Visit ready clients in list order for fairness.
            let ordered: Vec<(Token, bool, bool)> = self
                .clients
                .iter()
                .filter_map(|c| ready.iter().find(|(t, _, _)| *t == c.token).copied())
                .collect();
            for (token, readable, writable) in ordered {
                if readable {
                    self.read_client(handler, token);
                }
                if writable {
                    self.flush_client(token);
                }
            }

            if woke {
                handler.on_wake(self);
            }

            self.sweep(handler);
        }
    }

    fn accept_clients<H: ServerHandler>(&mut self, handler: &mut H) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    set_keepalive(&stream);
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%peer, %err, "failed to register client");
                        continue;
                    }
                    info!(%peer, ?token, "client connected");
                    self.clients.push(Client::new(token, stream, peer));
                    handler.on_attach(self, token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    fn read_client<H: ServerHandler>(&mut self, handler: &mut H, token: Token) {
        let Some(idx) = self.clients.iter().position(|c| c.token == token) else {
            return;
        };
        let mut lines = Vec::new();
        {
            let c = &mut self.clients[idx];
            loop {
                if c.rx.write_len() == 0 {
                    warn!(peer = %c.peer, "client line exceeds buffer, dropping");
                    c.dead = true;
                    break;
                }
                match c.stream.read(c.rx.writable()) {
                    Ok(0) => {
                        debug!(peer = %c.peer, "peer closed");
                        c.dead = true;
                        break;
                    }
                    Ok(n) => {
                        c.rx.mark_written(n);
                        c.extract_lines(&mut lines);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        debug!(peer = %c.peer, %err, "client read failed");
                        c.dead = true;
                        break;
                    }
                }
            }
        }
        for line in lines {
            if !line.trim().is_empty() {
                handler.on_line(self, token, &line);
            }
        }
    }

    fn flush_client(&mut self, token: Token) {
        let Some(idx) = self.clients.iter().position(|c| c.token == token) else {
            return;
        };
        let registry = self.poll.registry();
        self.clients[idx].flush(registry);
    }

    fn sweep<H: ServerHandler>(&mut self, handler: &mut H) {
        loop {
            let Some(idx) = self.clients.iter().position(|c| c.dead) else {
                break;
            };
            let mut client = self.clients.remove(idx);
            let _ = self.poll.registry().deregister(&mut client.stream);
            info!(peer = %client.peer, "client disconnected");
            handler.on_detach(self, client.token);
        }
    }
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            std::ptr::addr_of!(on).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream) {}
