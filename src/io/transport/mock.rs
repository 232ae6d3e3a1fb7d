// src/io/transport/mock.rs
//
// In-memory transport for tests. Clones share one state, so a test keeps a
// handle to script adapter output and inspect what the driver wrote.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::Transport;
use crate::io::IoError;

/// How the fake adapter answers `S`/`O` commands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AckMode {
    Ack,
    /// NACK the first command (bitrate)
    Nack,
    /// Never answer
    Silent,
}

enum ReadEvent {
    Bytes(Vec<u8>),
    Error(ErrorKind),
}

struct MockState {
    incoming: VecDeque<ReadEvent>,
    written: Vec<u8>,
    ack_mode: AckMode,
    read_attempts: usize,
    discards: usize,
    closed: bool,
    writes_held: bool,
    fail_next_write: Option<ErrorKind>,
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    shared: Arc<(Mutex<MockState>, Condvar)>,
}

impl MockTransport {
    pub(crate) fn new(ack_mode: AckMode) -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(MockState {
                    incoming: VecDeque::new(),
                    written: Vec::new(),
                    ack_mode,
                    read_attempts: 0,
                    discards: 0,
                    closed: false,
                    writes_held: false,
                    fail_next_write: None,
                }),
                Condvar::new(),
            )),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.shared.0.lock().unwrap()
    }

    fn notify(&self) {
        self.shared.1.notify_all();
    }

    /// Queue bytes delivered by one future read
    pub(crate) fn push_bytes(&self, bytes: &[u8]) {
        self.state().incoming.push_back(ReadEvent::Bytes(bytes.to_vec()));
        self.notify();
    }

    /// Make a future read fail with `kind`
    pub(crate) fn push_error(&self, kind: ErrorKind) {
        self.state().incoming.push_back(ReadEvent::Error(kind));
        self.notify();
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub(crate) fn read_attempts(&self) -> usize {
        self.state().read_attempts
    }

    pub(crate) fn discards(&self) -> usize {
        self.state().discards
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub(crate) fn hold_writes(&self) {
        self.state().writes_held = true;
    }

    pub(crate) fn release_writes(&self) {
        self.state().writes_held = false;
        self.notify();
    }

    pub(crate) fn fail_next_write(&self, kind: ErrorKind) {
        self.state().fail_next_write = Some(kind);
    }

    /// Poll until `predicate` holds for the written bytes or `timeout` passes
    pub(crate) fn wait_for_written(&self, timeout: Duration, predicate: impl Fn(&[u8]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.state().written) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Block on the condvar until `ready` holds or `timeout` passes
    fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, MockState>,
        timeout: Duration,
        ready: impl Fn(&MockState) -> bool,
    ) -> MutexGuard<'a, MockState> {
        let deadline = Instant::now() + timeout;
        while !ready(&state) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self.shared.1.wait_timeout(state, deadline - now).unwrap().0;
        }
        state
    }
}

impl Transport for MockTransport {
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, IoError> {
        let state = self.state();
        let state = self.wait_until(state, timeout, |s| !s.incoming.is_empty());
        Ok(!state.incoming.is_empty())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let mut state = self.state();
        state.read_attempts += 1;
        match state.incoming.pop_front() {
            None => Ok(0),
            Some(ReadEvent::Error(kind)) => Err(std::io::Error::new(kind, "mock read failure").into()),
            Some(ReadEvent::Bytes(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    state.incoming.push_front(ReadEvent::Bytes(rest));
                }
                Ok(n)
            }
        }
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, IoError> {
        let mut state = self.state();
        state.read_attempts += 1;
        let mut state = self.wait_until(state, timeout, |s| !s.incoming.is_empty());
        match state.incoming.pop_front() {
            None => Ok(None),
            Some(ReadEvent::Error(kind)) => Err(std::io::Error::new(kind, "mock read failure").into()),
            Some(ReadEvent::Bytes(mut bytes)) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                let byte = bytes.remove(0);
                if !bytes.is_empty() {
                    state.incoming.push_front(ReadEvent::Bytes(bytes));
                }
                Ok(Some(byte))
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        let state = self.state();
        let mut state = self.wait_until(state, Duration::from_secs(10), |s| !s.writes_held);
        if state.closed {
            return Err(std::io::Error::new(ErrorKind::BrokenPipe, "mock port closed").into());
        }
        if let Some(kind) = state.fail_next_write.take() {
            return Err(std::io::Error::new(kind, "mock write failure").into());
        }
        state.written.extend_from_slice(bytes);

        let is_command = matches!(bytes.first(), Some(b'S') | Some(b'O'));
        if is_command {
            match state.ack_mode {
                AckMode::Ack => state.incoming.push_back(ReadEvent::Bytes(vec![b'\r'])),
                AckMode::Nack => state.incoming.push_back(ReadEvent::Bytes(vec![0x07])),
                AckMode::Silent => {}
            }
        }
        drop(state);
        self.notify();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), IoError> {
        let mut state = self.state();
        state.discards += 1;
        state.incoming.clear();
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>, IoError> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> Result<(), IoError> {
        self.state().closed = true;
        self.notify();
        Ok(())
    }
}
