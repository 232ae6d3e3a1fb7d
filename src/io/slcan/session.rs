// src/io/slcan/session.rs
//
// The I/O session: owns the transport, runs the handshake, spawns the
// inbound worker, serves the outbound queue and tears everything down on the
// way out, whatever the reason for leaving.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::protocol::{init_adapter, stop_adapter, HandshakeTiming};
use super::worker::{
    forward_failure, InboundMessage, InboundWorker, OutboundCommand, OutboundWorker,
};
use crate::io::{EstimatorParams, IoError, TimestampEstimator, Transport};

/// Capacity of the facade-facing queue of received frames
pub const DEFAULT_RX_QUEUE_CAPACITY: usize = 100_000;
/// Capacity of the queue of frames waiting to be written
pub const DEFAULT_TX_QUEUE_CAPACITY: usize = 1_000;
/// Default bound on the whole startup, handshake included
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs besides the transport
#[derive(Clone, Debug, PartialEq)]
pub struct DriverOptions {
    /// CAN bus bit rate in bit/s
    pub bitrate: u32,
    pub handshake: HandshakeTiming,
    /// How long `start` waits for the session to report readiness
    pub init_timeout: Duration,
    /// Shared by the monotonic and the wall-clock estimators
    pub estimator: EstimatorParams,
    pub rx_queue_capacity: usize,
    pub tx_queue_capacity: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            bitrate: 1_000_000,
            handshake: HandshakeTiming::default(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            estimator: EstimatorParams::default(),
            rx_queue_capacity: DEFAULT_RX_QUEUE_CAPACITY,
            tx_queue_capacity: DEFAULT_TX_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    NotStarted,
    Initializing,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed(IoError),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NotStarted => write!(f, "not_started"),
            SessionState::Initializing => write!(f, "initializing"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed(_) => write!(f, "failed"),
        }
    }
}

/// How a session ended
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    Stopped,
    Failed(IoError),
}

pub(crate) struct IoSession {
    transport: Box<dyn Transport>,
    options: DriverOptions,
    inbound: SyncSender<InboundMessage>,
    outbound: Receiver<OutboundCommand>,
    state: SessionState,
}

impl IoSession {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        options: DriverOptions,
        inbound: SyncSender<InboundMessage>,
        outbound: Receiver<OutboundCommand>,
    ) -> Self {
        Self {
            transport,
            options,
            inbound,
            outbound,
            state: SessionState::NotStarted,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    fn transition(&mut self, next: SessionState) {
        match &next {
            SessionState::Failed(e) => tlog!("[slcan_io] {} -> failed: {}", self.state, e),
            _ => tlog!("[slcan_io] {} -> {}", self.state, next),
        }
        self.state = next;
    }

    /// Run to completion on the calling thread.
    pub(crate) fn run(mut self) -> SessionOutcome {
        tlog!("[slcan_io] IO session started");
        self.transition(SessionState::Initializing);

        let should_exit = Arc::new(AtomicBool::new(false));
        let mut rx_handle: Option<JoinHandle<Result<(), IoError>>> = None;

        let result = self.serve(&should_exit, &mut rx_handle);
        if let Err(e) = &result {
            tlog!("[slcan_io] IO session error: {}", e);
            forward_failure(&self.inbound, e.clone());
        }

        // Teardown runs on every path out of serve()
        self.transition(SessionState::Stopping);
        should_exit.store(true, Ordering::SeqCst);

        // The inbound worker already reported its own failure
        let rx_result = match rx_handle.take().map(|h| h.join()) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(IoError::fatal_transport("RX thread panicked")),
        };

        if let Err(e) = stop_adapter(&mut *self.transport) {
            tlog!("[slcan_io] Could not close the adapter channel: {}", e);
        }
        if let Err(e) = self.transport.close() {
            tlog!("[slcan_io] Could not close the transport: {}", e);
        }

        let outcome = match result.and(rx_result) {
            Ok(()) => SessionOutcome::Stopped,
            Err(e) => SessionOutcome::Failed(e),
        };
        match &outcome {
            SessionOutcome::Stopped => self.transition(SessionState::Stopped),
            SessionOutcome::Failed(e) => self.transition(SessionState::Failed(e.clone())),
        }
        tlog!("[slcan_io] IO session is exiting");
        outcome
    }

    fn serve(
        &mut self,
        should_exit: &Arc<AtomicBool>,
        rx_handle: &mut Option<JoinHandle<Result<(), IoError>>>,
    ) -> Result<(), IoError> {
        init_adapter(
            &mut *self.transport,
            self.options.bitrate,
            &self.options.handshake,
        )?;

        let worker = InboundWorker::new(
            self.transport.try_clone()?,
            self.inbound.clone(),
            TimestampEstimator::new(self.options.estimator),
            TimestampEstimator::new(self.options.estimator),
        );
        let handle = rx_handle.insert(worker.spawn(should_exit.clone())?);

        tlog!("[slcan_io] IO session initialization complete");
        self.transition(SessionState::Ready);
        if self.inbound.send(InboundMessage::Ready).is_err() {
            tlog!("[slcan_io] Driver went away before the session was ready");
            return Ok(());
        }
        self.transition(SessionState::Running);

        let exit = OutboundWorker::new(&mut *self.transport, &self.outbound, &self.inbound)
            .run(|| should_exit.load(Ordering::SeqCst) || handle.is_finished());
        tlog!("[slcan_io] TX loop finished: {:?}", exit);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
