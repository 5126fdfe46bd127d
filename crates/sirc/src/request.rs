use std::{
    sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender},
    time::Duration,
};

/// Outcome of a queued radio command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScResult {
    /// The radio acknowledged the frame.
    Success,
    /// Retries were exhausted without a matching acknowledgement.
    Timeout,
    /// The request could not be staged at submission.
    NoMemory,
    /// The link engine went away with the request still outstanding.
    Shutdown,
}

/// Upper bound on how long a caller is allowed to sit in
/// [`CommandFuture::wait`]. Generously above the worst-case engine
/// resolution (four transmissions across four retransmit ticks) so a wedged
/// engine cannot hang a caller forever.
const WAIT_CAP: Duration = Duration::from_secs(5);

/// Resolver half of a request's one-shot completion slot.
///
/// Resolving twice is a no-op: the sender is consumed by the first call.
pub struct Completion {
    tx: Option<SyncSender<ScResult>>,
}

impl Completion {
    pub fn resolve(&mut self, result: ScResult) {
        if let Some(tx) = self.tx.take() {
            // The caller may have abandoned the future; that just discards
            // the outcome.
            let _ = tx.try_send(result);
        }
    }
}

/// Caller half: blocks until the engine resolves the request.
pub struct CommandFuture {
    rx: Receiver<ScResult>,
}

impl CommandFuture {
    pub fn wait(self) -> ScResult {
        match self.rx.recv_timeout(WAIT_CAP) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => ScResult::Timeout,
            Err(RecvTimeoutError::Disconnected) => ScResult::Shutdown,
        }
    }

    /// An already-resolved future, for failures detected at submission.
    pub fn resolved(result: ScResult) -> Self {
        let (mut completion, future) = completion_pair();
        completion.resolve(result);
        future
    }
}

/// Create a connected completion/future pair.
///
/// The pair must exist before the request becomes observable on the queue,
/// so an acknowledgement racing ahead of the enqueue return still finds a
/// slot to resolve.
pub fn completion_pair() -> (Completion, CommandFuture) {
    let (tx, rx) = sync_channel(1);
    (Completion { tx: Some(tx) }, CommandFuture { rx })
}

/// A frame queued for transmission to the radio.
pub struct OutboundRequest {
    /// Assigned sequence number.
    pub seq: u8,
    /// Retransmissions performed so far.
    pub retries: u32,
    /// Whether the frame has been put on the wire at least once.
    pub sent: bool,
    /// Escaped wire bytes, ready to send.
    pub wire: Vec<u8>,
    pub completion: Completion,
}
