use std::{
    sync::{
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{SerialError, SerialPort};

/// Test-side controller for a [`ReplayPort`].
///
/// Plays the radio's role: feed canned inbound bytes, observe every write
/// the code under test makes, and inspect data-rate changes.
pub struct ReplayHandle {
    feed_tx: Sender<Vec<u8>>,
    write_rx: Receiver<Vec<u8>>,
    rates: Arc<Mutex<Vec<u32>>>,
}

impl ReplayHandle {
    /// Queue bytes for the port's next `recv` calls.
    pub fn feed(&self, bytes: &[u8]) {
        let _ = self.feed_tx.send(bytes.to_vec());
    }

    /// Wait for the next write issued through the port.
    pub fn take_write(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.write_rx.recv_timeout(timeout).ok()
    }

    /// Drain writes until one satisfies `pred` or the timeout elapses.
    pub fn wait_for_write(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&[u8]) -> bool,
    ) -> Option<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                return None;
            }
            match self.write_rx.recv_timeout(left) {
                Ok(w) if pred(&w) => return Some(w),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    /// Every data rate the port has been set to, oldest first.
    pub fn rates(&self) -> Vec<u32> {
        self.rates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// In-memory [`SerialPort`] scripted from a [`ReplayHandle`].
pub struct ReplayPort {
    feed_rx: Receiver<Vec<u8>>,
    write_tx: Sender<Vec<u8>>,
    pending: Vec<u8>,
    rates: Arc<Mutex<Vec<u32>>>,
    closed: bool,
}

/// Create a connected replay port / handle pair.
pub fn replay_pair() -> (ReplayPort, ReplayHandle) {
    let (feed_tx, feed_rx) = channel();
    let (write_tx, write_rx) = channel();
    let rates = Arc::new(Mutex::new(Vec::new()));
    (
        ReplayPort {
            feed_rx,
            write_tx,
            pending: Vec::new(),
            rates: rates.clone(),
            closed: false,
        },
        ReplayHandle { feed_tx, write_rx, rates },
    )
}

impl SerialPort for ReplayPort {
    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, SerialError> {
        if self.closed {
            return Err(SerialError::TransmitError);
        }
        self.write_tx
            .send(data.to_vec())
            .map_err(|_| SerialError::TransmitError)?;
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        if self.closed {
            return Err(SerialError::ReceiveError);
        }
        if self.pending.is_empty() {
            match self.feed_rx.recv_timeout(timeout) {
                Ok(bytes) => self.pending = bytes,
                Err(RecvTimeoutError::Timeout) => return Err(SerialError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(SerialError::ReceiveError),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn set_data_rate(&mut self, baud: u32) -> Result<(), SerialError> {
        self.rates.lock().unwrap_or_else(|e| e.into_inner()).push(baud);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feeds_and_records() {
        let (mut port, handle) = replay_pair();
        handle.feed(&[1, 2, 3]);

        let mut buf = [0u8; 2];
        assert_eq!(port.recv(&mut buf, Duration::from_millis(10)), Ok(2));
        assert_eq!(buf, [1, 2]);
        assert_eq!(port.recv(&mut buf, Duration::from_millis(10)), Ok(1));
        assert_eq!(buf[0], 3);
        assert_eq!(
            port.recv(&mut buf, Duration::from_millis(10)),
            Err(SerialError::Timeout)
        );

        port.send(&[9, 9], Duration::from_millis(10)).unwrap();
        assert_eq!(handle.take_write(Duration::from_millis(10)), Some(vec![9, 9]));

        port.set_data_rate(57600).unwrap();
        assert_eq!(handle.rates(), vec![57600]);
    }
}
