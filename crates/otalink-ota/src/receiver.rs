//! Device-side receive loop.
//!
//! One task owns the decoder and the installer and handles frames strictly
//! in order. The only state shared with other tasks is the abort flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use otalink_frame::{Frame, FrameReader, FrameWriter};
use otalink_transport::ByteStream;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{OtaError, Result};
use crate::flash::{FlashSlots, SlotId};
use crate::installer::{Installed, Installer, Reply};
use crate::message::{Ack, Message, MsgType, TransferStatus, ACK_SIZE};

/// Liveness hook fed between chunk writes.
pub trait Watchdog {
    fn feed(&mut self);
}

/// A watchdog that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&mut self) {}
}

impl<F: FnMut()> Watchdog for F {
    fn feed(&mut self) {
        self()
    }
}

/// Cross-task request to abandon the current session.
///
/// Checked once per loop iteration; a request made while no session is
/// running is dropped.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Cross-task request to leave [`Receiver::run`].
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Receive loop timing.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// How long one `receive` may block. Default: 100 ms.
    pub poll_timeout: Duration,
    /// Abort a session with no inbound frame for this long. Default: 30 s.
    pub idle_timeout: Duration,
    /// Extra delay after each chunk write, emulating slow flash. Default: none.
    pub chunk_pause: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(30),
            chunk_pause: Duration::ZERO,
        }
    }
}

impl ReceiverConfig {
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_chunk_pause(mut self, pause: Duration) -> Self {
        self.chunk_pause = pause;
        self
    }
}

/// Who ended a session early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortOrigin {
    /// The sender sent Abort.
    Remote,
    /// An [`AbortHandle`] was triggered.
    Local,
    /// No frame arrived within the idle timeout.
    Idle,
}

/// Session milestones reported by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReceiverEvent {
    SessionStarted {
        generation: u64,
        slot: SlotId,
        firmware_size: u32,
        version: String,
    },
    /// The image verified; the device should reboot into it.
    RebootRequested(Installed),
    SessionFailed {
        status: TransferStatus,
    },
    SessionAborted {
        reason: TransferStatus,
        origin: AbortOrigin,
    },
}

/// Why [`Receiver::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Stopped,
    Disconnected,
}

/// The device-side receive task.
pub struct Receiver<S, F, W = NoWatchdog> {
    reader: FrameReader<S>,
    writer: FrameWriter,
    installer: Installer<F>,
    watchdog: W,
    config: ReceiverConfig,
    abort: AbortHandle,
    stop: StopHandle,
    events: Option<Sender<ReceiverEvent>>,
    last_frame: Instant,
}

impl<S: ByteStream, F: FlashSlots> Receiver<S, F, NoWatchdog> {
    pub fn new(stream: S, installer: Installer<F>) -> Self {
        Self {
            reader: FrameReader::new(stream),
            writer: FrameWriter::new(),
            installer,
            watchdog: NoWatchdog,
            config: ReceiverConfig::default(),
            abort: AbortHandle::new(),
            stop: StopHandle::default(),
            events: None,
            last_frame: Instant::now(),
        }
    }
}

impl<S: ByteStream, F: FlashSlots, W: Watchdog> Receiver<S, F, W> {
    pub fn with_config(mut self, config: ReceiverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_watchdog<W2: Watchdog>(self, watchdog: W2) -> Receiver<S, F, W2> {
        Receiver {
            reader: self.reader,
            writer: self.writer,
            installer: self.installer,
            watchdog,
            config: self.config,
            abort: self.abort,
            stop: self.stop,
            events: self.events,
            last_frame: self.last_frame,
        }
    }

    /// Also send every event to `tx`.
    pub fn with_events(mut self, tx: Sender<ReceiverEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Share a stop flag across receivers, e.g. one per accepted connection.
    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Serve frames until stopped or the sender disconnects.
    ///
    /// A session still open at that point is aborted.
    pub fn run(&mut self) -> Result<RunExit> {
        info!("firmware receiver started");
        let exit = loop {
            if self.stop.is_requested() {
                break RunExit::Stopped;
            }
            match self.poll_once() {
                Ok(_) => {}
                Err(err) if err.is_disconnect() => break RunExit::Disconnected,
                Err(err) => {
                    self.installer.abort(TransferStatus::Aborted);
                    return Err(err);
                }
            }
        };
        if self.installer.in_progress() {
            self.installer.abort(TransferStatus::Aborted);
        }
        info!(?exit, "firmware receiver stopped");
        Ok(exit)
    }

    /// Run one loop iteration: check the abort flag, wait up to
    /// `poll_timeout` for a frame and handle it.
    pub fn poll_once(&mut self) -> Result<Option<ReceiverEvent>> {
        self.watchdog.feed();

        if self.abort.take() && self.installer.in_progress() {
            warn!("local abort requested");
            self.installer.abort(TransferStatus::Aborted);
            self.send_best_effort(Reply::Abort(TransferStatus::Aborted));
            return Ok(Some(self.emit(ReceiverEvent::SessionAborted {
                reason: TransferStatus::Aborted,
                origin: AbortOrigin::Local,
            })));
        }

        let frame = match self.reader.read_frame_timeout(self.config.poll_timeout) {
            Ok(frame) => frame,
            Err(err) if err.is_timeout() => return Ok(self.check_idle()),
            Err(err) => return Err(OtaError::from_frame(err)),
        };
        self.last_frame = Instant::now();

        let event = self.dispatch(&frame)?;
        Ok(event.map(|e| self.emit(e)))
    }

    fn dispatch(&mut self, frame: &Frame) -> Result<Option<ReceiverEvent>> {
        let message = match Message::decode(frame.msg_type, &frame.payload) {
            Ok(message) => message,
            Err(OtaError::UnknownMessage(msg_type)) => {
                debug!(msg_type, "ignoring unknown message type");
                return Ok(None);
            }
            Err(err) => return self.malformed(frame.msg_type, &err),
        };

        match message {
            Message::Begin(begin) => {
                let reply = self.installer.begin(&begin);
                self.send(reply)?;
                Ok(self.installer.token().filter(|_| is_ok(reply)).map(|token| {
                    ReceiverEvent::SessionStarted {
                        generation: token.generation,
                        slot: token.slot,
                        firmware_size: begin.firmware_size,
                        version: begin.version,
                    }
                }))
            }
            Message::Data(chunk) => {
                let reply = self.installer.data(&chunk);
                self.watchdog.feed();
                if !self.config.chunk_pause.is_zero() {
                    std::thread::sleep(self.config.chunk_pause);
                }
                self.send(reply)?;
                Ok(match reply {
                    Reply::Abort(status) => Some(ReceiverEvent::SessionFailed { status }),
                    _ => None,
                })
            }
            Message::End => {
                let reply = self.installer.end();
                self.send(reply)?;
                Ok(match reply {
                    Reply::Ack(ack) if ack.status.is_ok() => self
                        .installer
                        .last_installed()
                        .cloned()
                        .map(ReceiverEvent::RebootRequested),
                    Reply::Ack(ack) if ack.status != TransferStatus::Aborted => {
                        Some(ReceiverEvent::SessionFailed { status: ack.status })
                    }
                    Reply::Abort(status) => Some(ReceiverEvent::SessionFailed { status }),
                    _ => None,
                })
            }
            Message::Abort(reason) => {
                if !self.installer.in_progress() {
                    return Ok(None);
                }
                self.installer.abort(reason);
                Ok(Some(ReceiverEvent::SessionAborted {
                    reason,
                    origin: AbortOrigin::Remote,
                }))
            }
            Message::Ack(_) => {
                debug!("ignoring ack sent to the receiver");
                Ok(None)
            }
        }
    }

    fn malformed(&mut self, msg_type: u8, err: &OtaError) -> Result<Option<ReceiverEvent>> {
        warn!(msg_type, %err, "malformed message");
        match MsgType::from_u8(msg_type) {
            Some(MsgType::Begin) if !self.installer.in_progress() => {
                self.send(Reply::Ack(Ack::status(TransferStatus::Aborted, 0)))?;
                Ok(None)
            }
            Some(MsgType::Data) if self.installer.in_progress() => {
                self.installer.abort(TransferStatus::Aborted);
                self.send(Reply::Abort(TransferStatus::Aborted))?;
                Ok(Some(ReceiverEvent::SessionFailed {
                    status: TransferStatus::Aborted,
                }))
            }
            _ => Ok(None),
        }
    }

    fn check_idle(&mut self) -> Option<ReceiverEvent> {
        if !self.installer.in_progress() || self.last_frame.elapsed() < self.config.idle_timeout {
            return None;
        }
        warn!(
            idle = ?self.last_frame.elapsed(),
            cursor = self.installer.snapshot().write_cursor,
            "sender went quiet, aborting session"
        );
        self.installer.abort(TransferStatus::Aborted);
        self.send_best_effort(Reply::Abort(TransferStatus::Aborted));
        Some(self.emit(ReceiverEvent::SessionAborted {
            reason: TransferStatus::Aborted,
            origin: AbortOrigin::Idle,
        }))
    }

    fn send(&mut self, reply: Reply) -> Result<()> {
        let mut payload = BytesMut::with_capacity(ACK_SIZE);
        let msg_type = match reply {
            Reply::Ack(ack) => {
                ack.encode(&mut payload);
                MsgType::Ack
            }
            Reply::Abort(reason) => {
                payload.put_u8(reason.as_u8());
                MsgType::Abort
            }
            Reply::None => return Ok(()),
        };
        self.writer
            .send(self.reader.get_mut(), msg_type.as_u8(), &payload)
            .map_err(OtaError::from_frame)
    }

    fn send_best_effort(&mut self, reply: Reply) {
        if let Err(err) = self.send(reply) {
            debug!(%err, "could not notify sender");
        }
    }

    fn emit(&self, event: ReceiverEvent) -> ReceiverEvent {
        if let Some(tx) = &self.events {
            let _ = tx.send(event.clone());
        }
        event
    }

    pub fn installer(&self) -> &Installer<F> {
        &self.installer
    }

    pub fn installer_mut(&mut self) -> &mut Installer<F> {
        &mut self.installer
    }

    /// Number of corrupt frames dropped so far.
    pub fn frame_errors(&self) -> u64 {
        self.reader.error_count()
    }

    pub fn into_parts(self) -> (S, Installer<F>) {
        (self.reader.into_inner(), self.installer)
    }
}

fn is_ok(reply: Reply) -> bool {
    matches!(reply, Reply::Ack(ack) if ack.status.is_ok())
}
