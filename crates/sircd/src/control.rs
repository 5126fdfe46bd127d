use std::collections::VecDeque;

use mio::Token;
use tracing::debug;

/// Outcome of a control acquisition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now holds (or already held) the control token.
    Acquired,
    /// Someone else holds it; the caller is queued.
    Pending,
}

/// Single-writer control token with a FIFO waiter queue.
///
/// At most one client holds control at any instant, and a client appears
/// at most once across the holder and the queue. Mutated only from the
/// server loop.
#[derive(Default)]
pub struct ControlArbiter {
    holder: Option<Token>,
    waiters: VecDeque<Token>,
}

impl ControlArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn holder(&self) -> Option<Token> {
        self.holder
    }

    #[inline]
    pub fn has_control(&self, client: Token) -> bool {
        self.holder == Some(client)
    }

    fn is_waiting(&self, client: Token) -> bool {
        self.waiters.contains(&client)
    }

    /// Try to take control for `client`.
    pub fn acquire(&mut self, client: Token) -> AcquireOutcome {
        if self.has_control(client) {
            return AcquireOutcome::Acquired;
        }
        if self.holder.is_none() && self.waiters.is_empty() {
            self.holder = Some(client);
            debug!(?client, "control granted");
            return AcquireOutcome::Acquired;
        }
        if !self.is_waiting(client) {
            self.waiters.push_back(client);
            debug!(?client, queued = self.waiters.len(), "control pending");
        }
        AcquireOutcome::Pending
    }

    /// Give up control (or a queue position). Returns the next holder, who
    /// must be told `CONTROL,ACQUIRED`.
    pub fn release(&mut self, client: Token) -> Option<Token> {
        if self.has_control(client) {
            self.holder = self.waiters.pop_front();
            debug!(?client, next = ?self.holder, "control released");
            return self.holder;
        }
        self.waiters.retain(|t| *t != client);
        None
    }

    /// Forget a departed client entirely. Same promotion rule as
    /// [`release`](Self::release).
    pub fn drop_client(&mut self, client: Token) -> Option<Token> {
        self.release(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Token = Token(1);
    const B: Token = Token(2);
    const C: Token = Token(3);

    #[test]
    fn grant_queue_release_handoff() {
        let mut arb = ControlArbiter::new();
        assert_eq!(arb.acquire(A), AcquireOutcome::Acquired);
        assert_eq!(arb.acquire(B), AcquireOutcome::Pending);
        assert_eq!(arb.acquire(C), AcquireOutcome::Pending);
        assert!(arb.has_control(A));

        assert_eq!(arb.release(A), Some(B));
        assert!(arb.has_control(B));
        assert_eq!(arb.release(B), Some(C));
        assert_eq!(arb.release(C), None);
        assert_eq!(arb.holder(), None);
    }

    #[test]
    fn reacquire_while_holding_is_idempotent() {
        let mut arb = ControlArbiter::new();
        assert_eq!(arb.acquire(A), AcquireOutcome::Acquired);
        assert_eq!(arb.acquire(A), AcquireOutcome::Acquired);
        assert_eq!(arb.release(A), None);
    }

    #[test]
    fn waiter_is_queued_at_most_once() {
        let mut arb = ControlArbiter::new();
        arb.acquire(A);
        assert_eq!(arb.acquire(B), AcquireOutcome::Pending);
        assert_eq!(arb.acquire(B), AcquireOutcome::Pending);
        // B appears once: after A leaves, B holds and the queue is empty.
        assert_eq!(arb.release(A), Some(B));
        assert_eq!(arb.release(B), None);
    }

    #[test]
    fn release_without_holding_just_dequeues() {
        let mut arb = ControlArbiter::new();
        arb.acquire(A);
        arb.acquire(B);
        arb.acquire(C);
        assert_eq!(arb.release(B), None);
        assert_eq!(arb.release(A), Some(C));
    }

    #[test]
    fn dropping_the_holder_promotes_next_waiter() {
        let mut arb = ControlArbiter::new();
        arb.acquire(A);
        arb.acquire(B);
        assert_eq!(arb.drop_client(A), Some(B));
        assert!(arb.has_control(B));
    }

    #[test]
    fn dropping_a_waiter_is_silent() {
        let mut arb = ControlArbiter::new();
        arb.acquire(A);
        arb.acquire(B);
        assert_eq!(arb.drop_client(B), None);
        assert!(arb.has_control(A));
        assert_eq!(arb.release(A), None);
    }
}
