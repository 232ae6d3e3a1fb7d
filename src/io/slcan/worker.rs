// src/io/slcan/worker.rs
//
// The two I/O loops of a session. The inbound worker runs on its own thread
// and owns the read side of the transport; the outbound worker runs on the
// session thread and owns the write side. Both report failures to the
// facade as values on the inbound queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::codec::SlcanCodec;
use crate::io::{
    monotonic_now, wall_clock_now, CanFrame, IoError, TimestampEstimator, Transport,
};

/// Bounded wait for readability before re-checking the exit flag
const SELECT_TIMEOUT: Duration = Duration::from_millis(100);
/// Bounded wait on the outbound queue before re-checking the exit condition
const QUEUE_BLOCK_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause after a recoverable read error
const ERROR_BACKOFF: Duration = SELECT_TIMEOUT;
/// Large enough to drain the adapter in one read and avoid RX overrun
const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Queue messages
// ============================================================================

/// Session -> facade
#[derive(Debug)]
pub(crate) enum InboundMessage {
    Frame(CanFrame),
    /// Handshake done, inbound worker running
    Ready,
    Failure(IoError),
}

/// Facade -> session
#[derive(Debug)]
pub(crate) enum OutboundCommand {
    Frame(CanFrame),
    Stop,
}

/// Best effort: a full or closed queue swallows the report.
pub(crate) fn forward_failure(inbound: &SyncSender<InboundMessage>, error: IoError) {
    let _ = inbound.try_send(InboundMessage::Failure(error));
}

// ============================================================================
// Inbound worker
// ============================================================================

pub(crate) struct InboundWorker {
    transport: Box<dyn Transport>,
    inbound: SyncSender<InboundMessage>,
    ts_estimator_mono: TimestampEstimator,
    ts_estimator_real: TimestampEstimator,
    /// Bytes read but not yet consumed into a frame
    buffer: Vec<u8>,
    read_buf: Box<[u8]>,
    dropped: u64,
}

impl InboundWorker {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        inbound: SyncSender<InboundMessage>,
        ts_estimator_mono: TimestampEstimator,
        ts_estimator_real: TimestampEstimator,
    ) -> Self {
        Self {
            transport,
            inbound,
            ts_estimator_mono,
            ts_estimator_real,
            buffer: Vec::with_capacity(4096),
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            dropped: 0,
        }
    }

    /// Run on a new `slcan_rx` thread. A panic is reported like any other
    /// fatal failure.
    pub(crate) fn spawn(
        self,
        should_exit: Arc<AtomicBool>,
    ) -> Result<JoinHandle<Result<(), IoError>>, IoError> {
        let inbound = self.inbound.clone();
        let handle = std::thread::Builder::new()
            .name("slcan_rx".to_string())
            .spawn(move || {
                match panic::catch_unwind(AssertUnwindSafe(|| self.run(&should_exit))) {
                    Ok(result) => result,
                    Err(_) => {
                        tlog!("[slcan_rx] RX thread panicked, exiting");
                        let err = IoError::fatal_transport("RX thread panicked");
                        forward_failure(&inbound, err.clone());
                        Err(err)
                    }
                }
            })?;
        Ok(handle)
    }

    /// Loop until `should_exit` is set or a fatal transport error occurs.
    pub(crate) fn run(mut self, should_exit: &AtomicBool) -> Result<(), IoError> {
        tlog!("[slcan_rx] RX thread started");

        while !should_exit.load(Ordering::SeqCst) {
            if let Err(e) = self.poll() {
                tlog!("[slcan_rx] RX thread error, buffer discarded: {}", e);
                self.buffer.clear();
                forward_failure(&self.inbound, e.clone());
                if e.is_fatal() {
                    tlog!("[slcan_rx] RX thread failed, exiting");
                    return Err(e);
                }
                // A failing port fails again at once; don't spin on it
                std::thread::sleep(ERROR_BACKOFF);
            }
        }

        if self.dropped > 0 {
            tlog!("[slcan_rx] {} frames dropped on a full RX queue", self.dropped);
        }
        tlog!("[slcan_rx] RX thread is exiting");
        Ok(())
    }

    fn poll(&mut self) -> Result<(), IoError> {
        if !self.transport.wait_readable(SELECT_TIMEOUT)? {
            return Ok(());
        }

        // Timestamping as soon as possible after unblocking
        let local_ts_mono = monotonic_now();
        let local_ts_real = wall_clock_now();

        let n = self.transport.read_available(&mut self.read_buf)?;
        self.buffer.extend_from_slice(&self.read_buf[..n]);

        self.process(local_ts_mono, local_ts_real);
        Ok(())
    }

    /// Decode what the buffer holds, publish the frames, keep the unparsed tail.
    fn process(&mut self, local_ts_mono: f64, local_ts_real: f64) {
        let mut decoder = SlcanCodec::decode(&self.buffer);

        for decoded in decoder.by_ref() {
            // Converting the hardware timestamp into the local clock domains
            let (ts_mono, ts_real) = match decoded.hw_timestamp {
                Some(ts_hardware) => (
                    self.ts_estimator_mono.update(ts_hardware, local_ts_mono),
                    self.ts_estimator_real.update(ts_hardware, local_ts_real),
                ),
                None => (local_ts_mono, local_ts_real),
            };
            let frame = decoded.frame.with_timestamps(ts_mono, ts_real);

            match self.inbound.try_send(InboundMessage::Frame(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    if self.dropped == 1 || self.dropped % 1000 == 0 {
                        tlog!("[slcan_rx] RX queue full, {} frames dropped so far", self.dropped);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }

        if decoder.malformed() > 0 {
            tlog!(
                "[slcan_rx] Could not parse SLCAN stream, skipped {} marker bytes (last: {})",
                decoder.malformed(),
                decoder
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            );
        }

        let consumed = decoder.consumed();
        self.buffer.drain(..consumed);
    }
}

// ============================================================================
// Outbound worker
// ============================================================================

/// Why the outbound loop returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutboundExit {
    StopRequested,
    /// Exit flag set or the inbound worker died
    Terminated,
    /// Every facade handle to the outbound queue is gone
    Disconnected,
}

pub(crate) struct OutboundWorker<'a> {
    transport: &'a mut dyn Transport,
    outbound: &'a Receiver<OutboundCommand>,
    inbound: &'a SyncSender<InboundMessage>,
}

impl<'a> OutboundWorker<'a> {
    pub(crate) fn new(
        transport: &'a mut dyn Transport,
        outbound: &'a Receiver<OutboundCommand>,
        inbound: &'a SyncSender<InboundMessage>,
    ) -> Self {
        Self {
            transport,
            outbound,
            inbound,
        }
    }

    pub(crate) fn run(&mut self, termination_condition: impl Fn() -> bool) -> OutboundExit {
        while !termination_condition() {
            match self.outbound.recv_timeout(QUEUE_BLOCK_TIMEOUT) {
                Ok(OutboundCommand::Frame(frame)) => {
                    if let Err(e) = self.send_frame(&frame) {
                        tlog!("[slcan_tx] TX thread error: {}", e);
                        forward_failure(self.inbound, e);
                    }
                }
                Ok(OutboundCommand::Stop) => return OutboundExit::StopRequested,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return OutboundExit::Disconnected,
            }
        }
        OutboundExit::Terminated
    }

    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), IoError> {
        self.transport.write_all(&SlcanCodec::encode(frame))?;
        self.transport.flush()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::mock::{AckMode, MockTransport};
    use crate::io::EstimatorParams;
    use std::sync::mpsc::sync_channel;

    fn worker(mock: &MockTransport, capacity: usize) -> (InboundWorker, Receiver<InboundMessage>) {
        let (tx, rx) = sync_channel(capacity);
        let est = TimestampEstimator::new(EstimatorParams::default());
        (InboundWorker::new(Box::new(mock.clone()), tx, est.clone(), est), rx)
    }

    fn frames(rx: &Receiver<InboundMessage>) -> Vec<CanFrame> {
        rx.try_iter()
            .filter_map(|m| match m {
                InboundMessage::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_inbound_reassembles_split_frame() {
        let mock = MockTransport::new(AckMode::Silent);
        let (mut worker, rx) = worker(&mock, 16);

        mock.push_bytes(b"t1238DEADBE");
        worker.poll().unwrap();
        assert!(frames(&rx).is_empty());
        assert_eq!(worker.buffer, b"t1238DEADBE");

        mock.push_bytes(b"EF12345678\rt45");
        worker.poll().unwrap();
        let got = frames(&rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id(), 0x123);
        assert_eq!(got[0].data(), &[0xDE, 0xAD, 0xBE, 0xEF, 0x12, 0x34, 0x56, 0x78]);
        assert!(got[0].ts_monotonic().is_some());
        assert!(got[0].ts_real().is_some());
        assert_eq!(worker.buffer, b"t45");
    }

    #[test]
    fn test_inbound_stamps_hardware_timestamps() {
        let mock = MockTransport::new(AckMode::Silent);
        let (mut worker, rx) = worker(&mock, 16);

        mock.push_bytes(b"t1231AA1234\r");
        let before = monotonic_now();
        worker.poll().unwrap();
        let got = frames(&rx);
        assert_eq!(got.len(), 1);
        let ts = got[0].ts_monotonic().unwrap();
        // First sample: host time at read minus the fixed delay
        assert!(ts <= monotonic_now());
        assert!(ts >= before - 0.001);
    }

    #[test]
    fn test_inbound_drops_on_full_queue() {
        let mock = MockTransport::new(AckMode::Silent);
        let (mut worker, rx) = worker(&mock, 2);

        mock.push_bytes(b"t1000\rt1010\rt1020\rt1030\r");
        worker.poll().unwrap();
        assert_eq!(worker.dropped, 2);
        let got = frames(&rx);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id(), 0x100);
        assert_eq!(got[1].id(), 0x101);
    }

    #[test]
    fn test_inbound_error_discards_buffer_and_continues() {
        let mock = MockTransport::new(AckMode::Silent);
        let (worker, rx) = worker(&mock, 16);
        let should_exit = Arc::new(AtomicBool::new(false));
        let handle = worker.spawn(should_exit.clone()).unwrap();

        mock.push_bytes(b"t123");
        mock.push_error(std::io::ErrorKind::Interrupted);
        mock.push_bytes(b"1AA\r");
        mock.push_bytes(b"t4561BB\r");

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, InboundMessage::Failure(IoError::Transport { fatal: false, .. })));
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match second {
            InboundMessage::Frame(f) => assert_eq!(f.id(), 0x456),
            other => panic!("unexpected {:?}", other),
        }

        should_exit.store(true, Ordering::SeqCst);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_inbound_backs_off_on_repeated_errors() {
        let mock = MockTransport::new(AckMode::Silent);
        let (worker, rx) = worker(&mock, 16);
        let should_exit = Arc::new(AtomicBool::new(false));

        for _ in 0..3 {
            mock.push_error(std::io::ErrorKind::Interrupted);
        }
        let started = std::time::Instant::now();
        let handle = worker.spawn(should_exit.clone()).unwrap();

        for _ in 0..3 {
            assert!(matches!(
                rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                InboundMessage::Failure(IoError::Transport { fatal: false, .. })
            ));
        }
        // Two pauses separate the three reports
        assert!(started.elapsed() >= ERROR_BACKOFF * 2);
        assert_eq!(mock.read_attempts(), 3);

        should_exit.store(true, Ordering::SeqCst);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_inbound_fatal_error_ends_worker() {
        let mock = MockTransport::new(AckMode::Silent);
        let (worker, rx) = worker(&mock, 16);
        let handle = worker.spawn(Arc::new(AtomicBool::new(false))).unwrap();

        mock.push_error(std::io::ErrorKind::BrokenPipe);
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(IoError::Transport { fatal: true, .. })));
        assert!(matches!(
            rx.try_recv().unwrap(),
            InboundMessage::Failure(IoError::Transport { fatal: true, .. })
        ));
    }

    #[test]
    fn test_outbound_writes_and_stops() {
        let mock = MockTransport::new(AckMode::Silent);
        let mut transport = mock.clone();
        let (out_tx, out_rx) = sync_channel(4);
        let (in_tx, _in_rx) = sync_channel(4);

        out_tx
            .send(OutboundCommand::Frame(CanFrame::new(0x123, &[1, 2, 3], false).unwrap()))
            .unwrap();
        out_tx.send(OutboundCommand::Stop).unwrap();
        out_tx
            .send(OutboundCommand::Frame(CanFrame::new(0x456, &[], false).unwrap()))
            .unwrap();

        let exit = OutboundWorker::new(&mut transport, &out_rx, &in_tx).run(|| false);
        assert_eq!(exit, OutboundExit::StopRequested);
        assert_eq!(mock.written(), b"t1233010203\r");
    }

    #[test]
    fn test_outbound_forwards_write_errors_and_continues() {
        let mock = MockTransport::new(AckMode::Silent);
        let mut transport = mock.clone();
        let (out_tx, out_rx) = sync_channel(4);
        let (in_tx, in_rx) = sync_channel(4);

        mock.fail_next_write(std::io::ErrorKind::TimedOut);
        out_tx
            .send(OutboundCommand::Frame(CanFrame::new(0x1, &[0xAA], false).unwrap()))
            .unwrap();
        out_tx
            .send(OutboundCommand::Frame(CanFrame::new(0x2, &[0xBB], false).unwrap()))
            .unwrap();
        drop(out_tx);

        let exit = OutboundWorker::new(&mut transport, &out_rx, &in_tx).run(|| false);
        assert_eq!(exit, OutboundExit::Disconnected);
        assert_eq!(mock.written(), b"t0021BB\r");
        assert!(matches!(
            in_rx.try_recv().unwrap(),
            InboundMessage::Failure(IoError::Transport { .. })
        ));
    }

    #[test]
    fn test_outbound_honours_termination_condition() {
        let mock = MockTransport::new(AckMode::Silent);
        let mut transport = mock.clone();
        let (_out_tx, out_rx) = sync_channel::<OutboundCommand>(4);
        let (in_tx, _in_rx) = sync_channel(4);

        let exit = OutboundWorker::new(&mut transport, &out_rx, &in_tx).run(|| true);
        assert_eq!(exit, OutboundExit::Terminated);
    }
}
