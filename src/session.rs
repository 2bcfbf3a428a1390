//! Jensen session: connect/disconnect state machine, health check, and the
//! two request shapes (single-response, streaming) built on top of the
//! transport and streaming receiver.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::constants::{
    self, CMD_GET_DEVICE_INFO, COMMAND_TIMEOUT, CONNECT_RETRY_COUNT, CONNECT_RETRY_DELAY,
    HEALTH_CHECK_INTERVAL, HEALTH_CHECK_TIMEOUT,
};
use crate::error::{HiDockError, Result};
use crate::frame::{build, SequenceCounter};
use crate::receiver::{Frame, StreamingReceiver};
use crate::transport::{Transport, UsbTransport};

/// Commands allowed to keep running while a file-list stream is in flight.
const STREAMING_COMMANDS: [u16; 2] = [constants::CMD_GET_FILE_LIST, constants::CMD_TRANSFER_FILE];

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionStats {
    pub timeout: u64,
    pub pipe: u64,
    pub protocol: u64,
    pub connection_lost: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    connected: bool,
    last_health_check: Option<Instant>,
    in_health_check: bool,
    file_list_streaming: bool,
    stats: ConnectionStats,
    last_error: Option<String>,
}

/// Owns the transport, the receive buffer, and connection bookkeeping for
/// one logical session with a device. Not `Send`-shared across threads;
/// the operations manager's single worker thread is its only owner.
pub struct JensenSession {
    transport: Option<Box<dyn Transport>>,
    receiver: StreamingReceiver,
    sequence: SequenceCounter,
    state: SessionState,
    vid: u16,
    pid: u16,
    interface: u8,
}

impl JensenSession {
    pub fn new() -> Self {
        Self {
            transport: None,
            receiver: StreamingReceiver::new(),
            sequence: SequenceCounter::new(),
            state: SessionState::default(),
            vid: constants::DEFAULT_VENDOR_ID,
            pid: constants::DEFAULT_PRODUCT_ID,
            interface: constants::DEFAULT_INTERFACE,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        self.state.stats
    }

    pub fn reset_error_counts(&mut self) {
        self.state.stats = ConnectionStats::default();
    }

    /// Open the transport for `vid`/`pid`, retrying up to `CONNECT_RETRY_COUNT`
    /// times with a fixed delay between attempts. Errors that can never
    /// succeed on retry (`InUseByAnother`, `AccessDenied`, `NotFound`) fail
    /// immediately instead of burning through the retry budget.
    pub fn connect(&mut self, vid: u16, pid: u16, interface: u8) -> Result<()> {
        self.vid = vid;
        self.pid = pid;
        self.interface = interface;

        let mut last_err = None;
        for attempt in 1..=CONNECT_RETRY_COUNT {
            match UsbTransport::open(vid, pid, interface) {
                Ok(transport) => {
                    self.transport = Some(Box::new(transport));
                    self.state.connected = true;
                    self.state.last_health_check = Some(Instant::now());
                    self.receiver.clear();
                    info!("connected to device {vid:#06x}:{pid:#06x} on attempt {attempt}");
                    return Ok(());
                }
                Err(err @ (HiDockError::InUseByAnother
                | HiDockError::AccessDenied { .. }
                | HiDockError::NotFound { .. })) => {
                    warn!("connect attempt {attempt} failed permanently: {err}");
                    return Err(err);
                }
                Err(err) => {
                    warn!("connect attempt {attempt}/{CONNECT_RETRY_COUNT} failed: {err}");
                    last_err = Some(err);
                    if attempt < CONNECT_RETRY_COUNT {
                        std::thread::sleep(CONNECT_RETRY_DELAY);
                    }
                }
            }
        }
        Err(last_err.unwrap_or(HiDockError::ConnectionLost))
    }

    /// Idempotent: calling on an already-disconnected session is a no-op.
    pub fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.release_and_close() {
                warn!("error releasing transport on disconnect: {err}");
            }
        }
        self.state = SessionState::default();
        self.receiver.clear();
    }

    /// Adopt an already-open transport directly, bypassing device discovery.
    /// Used by tests to inject a fake transport.
    pub fn adopt_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.state.connected = true;
        self.state.last_health_check = Some(Instant::now());
        self.receiver.clear();
    }

    fn transport(&self) -> Result<&dyn Transport> {
        self.transport
            .as_deref()
            .ok_or(HiDockError::ConnectionLost)
    }

    fn maybe_health_check(&mut self) -> Result<()> {
        if self.state.in_health_check || !self.state.connected {
            return Ok(());
        }
        let due = self
            .state
            .last_health_check
            .map(|t| t.elapsed() > HEALTH_CHECK_INTERVAL)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }

        self.state.in_health_check = true;
        let result = self.send_and_receive_inner(CMD_GET_DEVICE_INFO, &[], HEALTH_CHECK_TIMEOUT);
        self.state.in_health_check = false;

        match result {
            Ok(_) => {
                self.state.last_health_check = Some(Instant::now());
                Ok(())
            }
            Err(err) => {
                self.state.stats.connection_lost += 1;
                self.state.last_error = Some(err.to_string());
                warn!("health check failed: {err}");
                Err(HiDockError::HealthCheckFailed)
            }
        }
    }

    /// Write `body` under `command_id` and block until the matching
    /// response frame arrives or `timeout` elapses. Clears the receive
    /// buffer first unless `command_id` is the file-transfer streaming
    /// command (whose leftover bytes belong to the in-flight stream).
    pub fn send_and_receive(
        &mut self,
        command_id: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Frame> {
        if self.state.file_list_streaming && !STREAMING_COMMANDS.contains(&command_id) {
            return Err(HiDockError::Busy);
        }
        self.maybe_health_check()?;
        self.send_and_receive_inner(command_id, body, timeout)
    }

    fn send_and_receive_inner(
        &mut self,
        command_id: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Frame> {
        if command_id != constants::CMD_TRANSFER_FILE {
            self.receiver.clear();
        }

        let frame_bytes = build(&mut self.sequence, command_id, body);
        let expected_sequence = u32::from_be_bytes([
            frame_bytes[6],
            frame_bytes[7],
            frame_bytes[8],
            frame_bytes[9],
        ]);

        let write_result = self.transport()?.write(&frame_bytes, COMMAND_TIMEOUT);
        self.record_result(&write_result);
        write_result?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self
                .receiver
                .receive_matching(Some(expected_sequence), None)?
            {
                debug!("cmd {command_id} -> seq {expected_sequence} resolved");
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                self.state.stats.timeout += 1;
                return Err(HiDockError::UsbTimeout);
            }
            self.read_chunk_into_receiver()?;
        }
    }

    /// Write `body` under `command_id`, then repeatedly read chunks and
    /// hand each parsed frame to `on_chunk` until it returns `false`, a
    /// fatal transport error occurs, or `idle_timeout` elapses with no
    /// frame delivered — the deadline resets on every delivered frame, per
    /// Any arriving frame resets the counter, not just ones that satisfy
    /// `on_chunk`.
    pub fn stream(
        &mut self,
        command_id: u16,
        body: &[u8],
        idle_timeout: Duration,
        mut on_chunk: impl FnMut(Frame) -> bool,
    ) -> Result<()> {
        self.maybe_health_check()?;
        self.receiver.clear();
        self.state.file_list_streaming = true;

        let result = (|| -> Result<()> {
            let frame_bytes = build(&mut self.sequence, command_id, body);
            self.transport()?.write(&frame_bytes, COMMAND_TIMEOUT)?;

            let mut deadline = Instant::now() + idle_timeout;
            loop {
                match self.receiver.receive_matching(None, Some(command_id)) {
                    Ok(Some(frame)) => {
                        deadline = Instant::now() + idle_timeout;
                        if !on_chunk(frame) {
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            self.state.stats.timeout += 1;
                            return Err(HiDockError::UsbTimeout);
                        }
                        self.read_chunk_into_receiver()?;
                    }
                    Err(err) => {
                        self.state.stats.protocol += 1;
                        return Err(err);
                    }
                }
            }
        })();

        self.state.file_list_streaming = false;
        result
    }

    fn read_chunk_into_receiver(&mut self) -> Result<()> {
        let transport = self.transport()?;
        let chunk_size = constants::read_chunk_size(transport.in_max_packet_size());
        match transport.read(chunk_size, constants::USB_READ_TIMEOUT) {
            Ok(bytes) => {
                self.receiver.feed(&bytes);
                Ok(())
            }
            Err(HiDockError::UsbTimeout) => Ok(()),
            Err(err) => {
                self.on_fatal_error(&err);
                Err(err)
            }
        }
    }

    fn record_result<T>(&mut self, result: &Result<T>) {
        if let Err(err) = result {
            self.on_fatal_error(err);
        }
    }

    fn on_fatal_error(&mut self, err: &HiDockError) {
        match err {
            HiDockError::UsbTimeout => self.state.stats.timeout += 1,
            HiDockError::UsbPipeError { .. } => self.state.stats.pipe += 1,
            HiDockError::ProtocolError { .. } => self.state.stats.protocol += 1,
            HiDockError::ConnectionLost => {
                self.state.stats.connection_lost += 1;
                self.disconnect();
            }
            _ => {}
        }
    }
}

impl Default for JensenSession {
    fn default() -> Self {
        Self::new()
    }
}
