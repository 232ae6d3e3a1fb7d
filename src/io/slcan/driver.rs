// src/io/slcan/driver.rs
//
// Driver facade: the caller-facing handle. Starts the I/O session on its own
// thread, then exchanges frames with it over two bounded queues.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::session::{DriverOptions, IoSession, SessionOutcome};
use super::worker::{InboundMessage, OutboundCommand};
use crate::config::SlcanConfig;
use crate::io::{
    CanDriver, CanFrame, FrameDirection, HookId, IoError, IoHook, SerialTransport, Transport,
};

/// Shortest wait `receive` will block for
const MIN_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1);

pub struct SlcanDriver {
    inbound: Receiver<InboundMessage>,
    outbound: SyncSender<OutboundCommand>,
    session: Option<JoinHandle<SessionOutcome>>,
    /// Set once a fatal failure has been handed to the caller
    failed: bool,
    hooks: Vec<(HookId, IoHook)>,
    next_hook_id: u64,
}

impl SlcanDriver {
    /// Open the configured serial port and bring the adapter up.
    pub fn start(config: &SlcanConfig) -> Result<Self, IoError> {
        let options = config.driver_options()?;
        let transport = SerialTransport::open(&config.serial_settings())?;
        tlog!(
            "[slcan] Opened {} at {} baud, CAN bitrate {}",
            config.port,
            config.baud_rate,
            config.bitrate
        );
        Self::start_with_transport(Box::new(transport), options)
    }

    /// Start a session over an already opened transport. Returns once the
    /// adapter has acknowledged the handshake.
    pub fn start_with_transport(
        transport: Box<dyn Transport>,
        options: DriverOptions,
    ) -> Result<Self, IoError> {
        let (inbound_tx, inbound_rx) = sync_channel(options.rx_queue_capacity);
        let (outbound_tx, outbound_rx) = sync_channel(options.tx_queue_capacity);
        let init_timeout = options.init_timeout;

        let session = IoSession::new(transport, options, inbound_tx, outbound_rx);
        let handle = std::thread::Builder::new()
            .name("slcan_io".to_string())
            .spawn(move || session.run())?;

        let mut driver = Self {
            inbound: inbound_rx,
            outbound: outbound_tx,
            session: Some(handle),
            failed: false,
            hooks: Vec::new(),
            next_hook_id: 0,
        };
        driver.wait_ready(init_timeout)?;
        tlog!("[slcan] Driver ready");
        Ok(driver)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), IoError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbound.recv_timeout(remaining) {
                Ok(InboundMessage::Ready) => break,
                Ok(InboundMessage::Failure(e)) => {
                    tlog!("[slcan] IO session failed to start: {}", e);
                    self.failed = true;
                    self.join_session();
                    return Err(e);
                }
                Ok(InboundMessage::Frame(_)) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    tlog!("[slcan] IO session did not start in {:?}", timeout);
                    let _ = self.outbound.try_send(OutboundCommand::Stop);
                    // Detach: the session may be stuck and must not block the caller
                    self.session = None;
                    self.failed = true;
                    return Err(IoError::InitTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.failed = true;
                    self.join_session();
                    return Err(IoError::SessionDead);
                }
            }
        }

        if !self.is_alive() {
            return Err(self.dead_session_error());
        }
        Ok(())
    }

    /// Whether the session thread is still serving this driver
    pub fn is_alive(&self) -> bool {
        !self.failed && self.session.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// The failure that ended the session, if one is still queued, else `SessionDead`.
    /// Queued frames are dropped on the way.
    fn dead_session_error(&mut self) -> IoError {
        self.failed = true;
        while let Ok(message) = self.inbound.try_recv() {
            if let InboundMessage::Failure(e) = message {
                return e;
            }
        }
        IoError::SessionDead
    }

    fn join_session(&mut self) -> Option<SessionOutcome> {
        let handle = self.session.take()?;
        match handle.join() {
            Ok(outcome) => {
                tlog!("[slcan] IO session ended: {:?}", outcome);
                Some(outcome)
            }
            Err(_) => {
                tlog!("[slcan] IO session thread panicked");
                Some(SessionOutcome::Failed(IoError::SessionDead))
            }
        }
    }

    fn call_hooks(&self, direction: FrameDirection, frame: &CanFrame) {
        for (_, hook) in &self.hooks {
            hook(direction, frame);
        }
    }

    /// Wait up to `timeout` (at least 1 ms) for the next received frame.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, IoError> {
        if !self.is_alive() {
            return Err(self.dead_session_error());
        }

        match self.inbound.recv_timeout(timeout.max(MIN_RECEIVE_TIMEOUT)) {
            Ok(InboundMessage::Frame(frame)) => {
                self.call_hooks(FrameDirection::Rx, &frame);
                Ok(Some(frame))
            }
            Ok(InboundMessage::Failure(e)) => {
                if e.is_fatal() {
                    self.failed = true;
                }
                Err(e)
            }
            Ok(InboundMessage::Ready) => Err(IoError::unexpected(
                "readiness signal received after startup",
            )),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.dead_session_error()),
        }
    }

    /// Queue a frame for transmission. Blocks while the outbound queue is full.
    pub fn send(&mut self, id: u32, payload: &[u8], extended: bool) -> Result<(), IoError> {
        if !self.is_alive() {
            return Err(self.dead_session_error());
        }

        let frame = CanFrame::new(id, payload, extended)?;
        if self.outbound.send(OutboundCommand::Frame(frame)).is_err() {
            return Err(self.dead_session_error());
        }
        self.call_hooks(FrameDirection::Tx, &frame);
        Ok(())
    }

    pub fn add_io_hook(&mut self, hook: IoHook) -> HookId {
        let id = HookId(self.next_hook_id);
        self.next_hook_id += 1;
        self.hooks.push((id, hook));
        id
    }

    pub fn remove_io_hook(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hook_id, _)| *hook_id != id);
        self.hooks.len() != before
    }

    /// Stop the session and wait for its teardown. The first call reports how
    /// the session ended; later calls return `Ok(())`.
    pub fn close(&mut self) -> Result<(), IoError> {
        let running = self.session.as_ref().map_or(false, |h| !h.is_finished());
        if running {
            // Blocks only while the queue is full, which the session drains
            let _ = self.outbound.send(OutboundCommand::Stop);
        }
        self.failed = true;
        match self.join_session() {
            Some(SessionOutcome::Failed(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

impl CanDriver for SlcanDriver {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, IoError> {
        SlcanDriver::receive(self, timeout)
    }

    fn send(&mut self, id: u32, payload: &[u8], extended: bool) -> Result<(), IoError> {
        SlcanDriver::send(self, id, payload, extended)
    }

    fn add_io_hook(&mut self, hook: IoHook) -> HookId {
        SlcanDriver::add_io_hook(self, hook)
    }

    fn remove_io_hook(&mut self, id: HookId) -> bool {
        SlcanDriver::remove_io_hook(self, id)
    }
}

impl Drop for SlcanDriver {
    fn drop(&mut self) {
        if self.session.is_some() {
            let _ = self.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
