//! Host-side transfer driver.
//!
//! Strictly request/response: one message in flight, the receiver's
//! `next_offset` is authoritative, and every failure ends in a distinct
//! [`TransferOutcome`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use otalink_frame::{Frame, FrameReader, FrameWriter};
use otalink_transport::ByteStream;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{OtaError, Result};
use crate::message::{
    Ack, Begin, DataChunk, Message, MsgType, TransferStatus, MAX_CHUNK, MAX_VERSION_LEN,
    SHA256_SIZE,
};

/// Longest single blocking read while waiting, so cancellation stays responsive.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// How large each Data chunk is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Fixed size for byte-stream links, capped at [`MAX_CHUNK`].
    Fixed(usize),
    /// Derived from a packet MTU: `mtu - overhead`, at least `floor`.
    Mtu {
        mtu: usize,
        overhead: usize,
        floor: usize,
    },
}

impl ChunkPolicy {
    pub const DEFAULT_OVERHEAD: usize = 20;
    pub const DEFAULT_FLOOR: usize = 128;

    /// MTU policy with the default overhead and floor.
    pub fn mtu(mtu: usize) -> Self {
        ChunkPolicy::Mtu {
            mtu,
            overhead: Self::DEFAULT_OVERHEAD,
            floor: Self::DEFAULT_FLOOR,
        }
    }

    pub fn chunk_size(&self) -> usize {
        match *self {
            ChunkPolicy::Fixed(size) => size.clamp(1, MAX_CHUNK),
            ChunkPolicy::Mtu {
                mtu,
                overhead,
                floor,
            } => mtu
                .saturating_sub(overhead)
                .max(floor)
                .clamp(1, MAX_CHUNK),
        }
    }
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        ChunkPolicy::Fixed(MAX_CHUNK)
    }
}

/// Sender-side timing and sizing.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_policy: ChunkPolicy,
    /// Wait for the Ack to Begin or Data. Default: 5 s.
    pub message_timeout: Duration,
    /// Wait for the Ack to End, which covers verification. Default: 30 s.
    pub end_timeout: Duration,
    /// Resends of one Begin or Data before giving up. Default: 3.
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_policy: ChunkPolicy::default(),
            message_timeout: Duration::from_secs(5),
            end_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl TransferConfig {
    pub fn with_chunk_policy(mut self, policy: ChunkPolicy) -> Self {
        self.chunk_policy = policy;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_end_timeout(mut self, timeout: Duration) -> Self {
        self.end_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Sender state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    AwaitBeginAck,
    SendingChunks,
    AwaitChunkAck,
    AwaitEndAck,
    Done,
    Failed,
}

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    Done,
    /// An Ack carried a failure status.
    Rejected(TransferStatus),
    /// The receiver sent Abort.
    RemoteAbort(TransferStatus),
    TimedOut { retries: u32 },
    LocallyAborted,
    /// The link failed or the receiver misbehaved.
    Transport,
}

impl TransferOutcome {
    fn from_error(err: &OtaError) -> Self {
        match err {
            OtaError::Rejected(status) => TransferOutcome::Rejected(*status),
            OtaError::RemoteAbort(status) => TransferOutcome::RemoteAbort(*status),
            OtaError::TimedOut { retries } => TransferOutcome::TimedOut { retries: *retries },
            OtaError::LocallyAborted => TransferOutcome::LocallyAborted,
            _ => TransferOutcome::Transport,
        }
    }
}

/// Progress notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Started { firmware_size: u32, chunk_size: usize },
    ChunkAcked { acked_offset: u32, firmware_size: u32 },
    /// The receiver asked to continue from a different offset.
    Resynced { from: u32, to: u32 },
    Retrying { msg_type: &'static str, attempt: u32 },
    Verifying,
    Finished { outcome: TransferOutcome },
}

/// Immutable view of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: TransferState,
    pub firmware_size: u32,
    /// Hex-encoded SHA-256 of the image.
    pub sha256: String,
    pub version: String,
    pub chunk_size: usize,
    pub sent_offset: u32,
    pub acked_offset: u32,
    /// Resends in the current wait; resets when an Ack arrives.
    pub retries_used: u32,
    pub total_retries: u32,
    pub resyncs: u32,
    pub elapsed_ms: u64,
    pub outcome: Option<TransferOutcome>,
}

impl SessionSnapshot {
    fn idle() -> Self {
        Self {
            state: TransferState::Idle,
            firmware_size: 0,
            sha256: String::new(),
            version: String::new(),
            chunk_size: 0,
            sent_offset: 0,
            acked_offset: 0,
            retries_used: 0,
            total_retries: 0,
            resyncs: 0,
            elapsed_ms: 0,
            outcome: None,
        }
    }
}

/// Cancels a running transfer from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Hex-encode a digest for display.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Drives one firmware transfer over a byte stream.
pub struct Orchestrator<S> {
    reader: FrameReader<S>,
    writer: FrameWriter,
    config: TransferConfig,
    cancel: CancelHandle,
    events: Option<Sender<TransferEvent>>,
    snapshot: SessionSnapshot,
    payload: BytesMut,
    /// Replies owed to resends whose first reply was already taken.
    late_acks: u32,
}

impl<S: ByteStream> Orchestrator<S> {
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, TransferConfig::default())
    }

    pub fn with_config(stream: S, config: TransferConfig) -> Self {
        Self {
            reader: FrameReader::new(stream),
            writer: FrameWriter::new(),
            config,
            cancel: CancelHandle::new(),
            events: None,
            snapshot: SessionSnapshot::idle(),
            payload: BytesMut::new(),
            late_acks: 0,
        }
    }

    /// Also send progress events to `tx`.
    pub fn with_events(mut self, tx: Sender<TransferEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Use an existing cancel handle, e.g. one wired to a signal handler.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current state of the transfer.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.clone()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }

    /// Transfer `image` and wait for the receiver to verify it.
    pub fn run(&mut self, image: &[u8], version: &str) -> Result<SessionSnapshot> {
        if image.is_empty() {
            return Err(OtaError::InvalidArg("firmware image is empty".into()));
        }
        let firmware_size = u32::try_from(image.len())
            .map_err(|_| OtaError::InvalidArg("firmware image exceeds 4 GiB".into()))?;
        if version.len() > MAX_VERSION_LEN {
            return Err(OtaError::InvalidArg(format!(
                "version {version:?} is longer than {MAX_VERSION_LEN} bytes"
            )));
        }

        let sha256: [u8; SHA256_SIZE] = Sha256::digest(image).into();
        let chunk_size = self.config.chunk_policy.chunk_size();
        self.snapshot = SessionSnapshot {
            firmware_size,
            sha256: hex(&sha256),
            version: version.to_owned(),
            chunk_size,
            ..SessionSnapshot::idle()
        };
        info!(size = firmware_size, chunk_size, version, "starting transfer");
        self.emit(TransferEvent::Started {
            firmware_size,
            chunk_size,
        });

        let started = Instant::now();
        let result = self.transfer(image, sha256, version);
        self.snapshot.elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(()) => TransferOutcome::Done,
            Err(err) => TransferOutcome::from_error(err),
        };
        self.snapshot.state = match outcome {
            TransferOutcome::Done => TransferState::Done,
            _ => TransferState::Failed,
        };
        self.snapshot.outcome = Some(outcome);
        match &result {
            Ok(()) => info!(elapsed_ms = self.snapshot.elapsed_ms, "transfer complete"),
            Err(err) => warn!(
                %err,
                acked_offset = self.snapshot.acked_offset,
                "transfer failed"
            ),
        }
        self.emit(TransferEvent::Finished { outcome });
        result.map(|()| self.snapshot.clone())
    }

    fn transfer(&mut self, image: &[u8], sha256: [u8; SHA256_SIZE], version: &str) -> Result<()> {
        let size = self.snapshot.firmware_size;
        self.late_acks = 0;

        self.snapshot.state = TransferState::AwaitBeginAck;
        self.payload.clear();
        Begin {
            firmware_size: size,
            sha256,
            version: version.to_owned(),
        }
        .encode(&mut self.payload)?;
        let ack = self.exchange(MsgType::Begin, self.config.message_timeout, true, None)?;
        if !ack.status.is_ok() {
            return Err(OtaError::Rejected(ack.status));
        }

        let chunk_size = self.snapshot.chunk_size as u32;
        while self.snapshot.acked_offset < size {
            self.snapshot.state = TransferState::SendingChunks;
            let offset = self.snapshot.acked_offset;
            let len = chunk_size.min(size - offset);
            let data = &image[offset as usize..(offset + len) as usize];

            self.payload.clear();
            DataChunk { offset, data }.encode(&mut self.payload)?;
            self.snapshot.sent_offset = offset + len;
            self.snapshot.state = TransferState::AwaitChunkAck;
            let timeout = self.config.message_timeout;
            let ack = self.exchange(MsgType::Data, timeout, true, Some(offset))?;
            if !ack.status.is_ok() {
                return Err(OtaError::Rejected(ack.status));
            }

            let next = ack.next_offset;
            if next == offset + len {
                self.snapshot.acked_offset = next;
                self.emit(TransferEvent::ChunkAcked {
                    acked_offset: next,
                    firmware_size: size,
                });
                continue;
            }

            if next > size {
                return Err(OtaError::protocol("ack", "next offset beyond image"));
            }
            debug!(from = offset, to = next, "receiver moved the cursor");
            self.snapshot.resyncs += 1;
            self.snapshot.acked_offset = next;
            self.snapshot.sent_offset = self.snapshot.sent_offset.max(next);
            self.emit(TransferEvent::Resynced {
                from: offset,
                to: next,
            });
        }

        self.snapshot.state = TransferState::AwaitEndAck;
        self.emit(TransferEvent::Verifying);
        // A late Data Ack reads exactly like the End Ack.
        self.settle()?;
        self.payload.clear();
        let ack = self.exchange(MsgType::End, self.config.end_timeout, false, None)?;
        if !ack.status.is_ok() {
            return Err(OtaError::Rejected(ack.status));
        }
        Ok(())
    }

    /// Send the prepared payload and wait for its Ack, resending on timeout.
    ///
    /// With `sent_at`, an `Ok` Ack that does not move the cursor past that
    /// offset answers an earlier message and is skipped.
    fn exchange(
        &mut self,
        msg_type: MsgType,
        timeout: Duration,
        retry: bool,
        sent_at: Option<u32>,
    ) -> Result<Ack> {
        self.snapshot.retries_used = 0;
        loop {
            self.check_cancel()?;
            if self.late_acks > 0 {
                self.drain_ready()?;
            }
            self.writer
                .send(self.reader.get_mut(), msg_type.as_u8(), &self.payload)
                .map_err(OtaError::from_frame)?;

            if let Some(ack) = self.await_ack(timeout, sent_at)? {
                // Every resend may still be answered.
                self.late_acks += self.snapshot.retries_used;
                return Ok(ack);
            }

            let used = self.snapshot.retries_used;
            if !retry || used >= self.config.max_retries {
                return Err(OtaError::TimedOut { retries: used });
            }
            self.snapshot.retries_used += 1;
            self.snapshot.total_retries += 1;
            warn!(msg = msg_type.name(), attempt = used + 1, "no ack, resending");
            self.emit(TransferEvent::Retrying {
                msg_type: msg_type.name(),
                attempt: used + 1,
            });
            if msg_type == MsgType::Begin {
                // The lost Ack may belong to a session the receiver did open.
                self.send_abort();
            }
        }
    }

    /// Wait for an Ack, ignoring stray frames. `Ok(None)` on timeout.
    fn await_ack(&mut self, timeout: Duration, sent_at: Option<u32>) -> Result<Option<Ack>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.check_cancel()?;

            let frame = match self.reader.read_frame_timeout(remaining.min(WAIT_SLICE)) {
                Ok(frame) => frame,
                Err(err) if err.is_timeout() => continue,
                Err(err) => return Err(OtaError::from_frame(err)),
            };
            match Message::decode(frame.msg_type, &frame.payload) {
                Ok(Message::Ack(ack)) if is_stale(&ack, sent_at) => {
                    debug!(next_offset = ack.next_offset, "skipping stale ack");
                    self.late_acks = self.late_acks.saturating_sub(1);
                }
                Ok(Message::Ack(ack)) => {
                    debug!(status = %ack.status, next_offset = ack.next_offset, "ack");
                    return Ok(Some(ack));
                }
                Ok(Message::Abort(reason)) => return Err(OtaError::RemoteAbort(reason)),
                Ok(other) => debug!(msg = other.msg_type().name(), "ignoring stray message"),
                Err(err) => debug!(%err, "ignoring undecodable frame"),
            }
        }
    }

    /// Drop frames that are already readable, noting any late Acks.
    fn drain_ready(&mut self) -> Result<()> {
        while let Some(frame) = self.reader.poll_frame().map_err(OtaError::from_frame)? {
            self.discard(&frame)?;
        }
        Ok(())
    }

    /// Wait up to one message timeout for the replies still owed to resends.
    fn settle(&mut self) -> Result<()> {
        self.drain_ready()?;
        let deadline = Instant::now() + self.config.message_timeout;
        while self.late_acks > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(owed = self.late_acks, "late acks never arrived");
                break;
            }
            self.check_cancel()?;
            match self.reader.read_frame_timeout(remaining.min(WAIT_SLICE)) {
                Ok(frame) => self.discard(&frame)?,
                Err(err) if err.is_timeout() => {}
                Err(err) => return Err(OtaError::from_frame(err)),
            }
        }
        self.late_acks = 0;
        Ok(())
    }

    fn discard(&mut self, frame: &Frame) -> Result<()> {
        match Message::decode(frame.msg_type, &frame.payload) {
            Ok(Message::Ack(ack)) => {
                debug!(next_offset = ack.next_offset, "dropping late ack");
                self.late_acks = self.late_acks.saturating_sub(1);
            }
            Ok(Message::Abort(reason)) => return Err(OtaError::RemoteAbort(reason)),
            _ => debug!(msg_type = frame.msg_type, "dropping stray frame"),
        }
        Ok(())
    }

    fn check_cancel(&mut self) -> Result<()> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        warn!(acked_offset = self.snapshot.acked_offset, "transfer cancelled");
        self.send_abort();
        Err(OtaError::LocallyAborted)
    }

    fn send_abort(&mut self) {
        let reason = [TransferStatus::Aborted.as_u8()];
        if let Err(err) = self
            .writer
            .send(self.reader.get_mut(), MsgType::Abort.as_u8(), &reason)
        {
            debug!(%err, "could not send abort");
        }
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// The receiver's cursor only moves forward, so an `Ok` Ack at or before the
/// offset just sent belongs to an earlier message.
fn is_stale(ack: &Ack, sent_at: Option<u32>) -> bool {
    matches!(sent_at, Some(offset) if ack.status.is_ok() && ack.next_offset <= offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{BootState, FlashSlots, MemoryFlash, SlotId};
    use crate::installer::Installer;
    use crate::receiver::Receiver;
    use otalink_frame::Frame;
    use otalink_transport::MemoryStream;
    use std::thread::JoinHandle;

    type Replies = Vec<(u8, Vec<u8>)>;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn fast() -> TransferConfig {
        TransferConfig::default()
            .with_message_timeout(Duration::from_millis(100))
            .with_end_timeout(Duration::from_millis(300))
            .with_max_retries(2)
    }

    fn ack(status: TransferStatus, next: u32) -> Replies {
        let mut buf = BytesMut::new();
        Ack::status(status, next).encode(&mut buf);
        vec![(MsgType::Ack.as_u8(), buf.to_vec())]
    }

    fn data_end(frame: &Frame) -> u32 {
        match Message::decode(frame.msg_type, &frame.payload).unwrap() {
            Message::Data(chunk) => chunk.offset + chunk.data.len() as u32,
            other => panic!("expected data, got {other:?}"),
        }
    }

    /// A hand-scripted device: `script(frame, index)` decides the replies.
    fn scripted<F>(
        config: TransferConfig,
        mut script: F,
    ) -> (Orchestrator<MemoryStream>, JoinHandle<Vec<Frame>>)
    where
        F: FnMut(&Frame, usize) -> Replies + Send + 'static,
    {
        let (host, device) = MemoryStream::pair();
        let handle = std::thread::spawn(move || {
            let mut reader = FrameReader::new(device);
            let mut writer = FrameWriter::new();
            let mut seen = Vec::new();
            while let Ok(frame) = reader.read_frame_timeout(Duration::from_secs(5)) {
                for (msg_type, payload) in script(&frame, seen.len()) {
                    let _ = writer.send(reader.get_mut(), msg_type, &payload);
                }
                seen.push(frame);
            }
            seen
        });
        (Orchestrator::with_config(host, config), handle)
    }

    /// Acks every chunk in order and everything else with `Ok`.
    fn well_behaved(frame: &Frame) -> Replies {
        match MsgType::from_u8(frame.msg_type) {
            Some(MsgType::Data) => ack(TransferStatus::Ok, data_end(frame)),
            Some(MsgType::Abort) => Vec::new(),
            _ => ack(TransferStatus::Ok, 0),
        }
    }

    #[test]
    fn test_end_to_end_with_receiver() {
        let (host, device) = MemoryStream::pair();
        let device_thread = std::thread::spawn(move || {
            let mut rx = Receiver::new(device, Installer::new(MemoryFlash::new(8192)));
            rx.run().unwrap();
            rx.into_parts().1.into_flash()
        });

        let img = image(2048);
        let (tx, events) = std::sync::mpsc::channel();
        let mut orch = Orchestrator::new(host).with_events(tx);
        let snap = orch.run(&img, "v1.2.3").unwrap();
        assert_eq!(snap.state, TransferState::Done);
        assert_eq!(snap.outcome, Some(TransferOutcome::Done));
        assert_eq!(snap.acked_offset, 2048);
        assert_eq!(snap.chunk_size, MAX_CHUNK);
        assert_eq!(snap.sha256, hex(&Sha256::digest(&img)));
        drop(orch);

        let flash = device_thread.join().unwrap();
        assert_eq!(flash.slot_state(SlotId::B), BootState::PendingVerify);
        assert_eq!(&flash.image(SlotId::B)[..2048], img.as_slice());

        let events: Vec<_> = events.try_iter().collect();
        assert_eq!(
            events.first(),
            Some(&TransferEvent::Started {
                firmware_size: 2048,
                chunk_size: MAX_CHUNK
            })
        );
        assert!(events.contains(&TransferEvent::Verifying));
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Finished {
                outcome: TransferOutcome::Done
            })
        );
    }

    #[test]
    fn test_message_sequence() {
        let (mut orch, device) = scripted(
            fast().with_chunk_policy(ChunkPolicy::Fixed(1000)),
            |frame, _| well_behaved(frame),
        );
        orch.run(&image(2048), "v1.2.3").unwrap();
        drop(orch);

        let types: Vec<u8> = device.join().unwrap().iter().map(|f| f.msg_type).collect();
        assert_eq!(types, vec![0x01, 0x02, 0x02, 0x02, 0x03]);
    }

    #[test]
    fn test_receiver_cursor_is_authoritative() {
        // The first Data ack claims the receiver already holds 1500 bytes.
        let (mut orch, device) = scripted(
            fast().with_chunk_policy(ChunkPolicy::Fixed(1000)),
            |frame, i| match (MsgType::from_u8(frame.msg_type), i) {
                (Some(MsgType::Data), 1) => ack(TransferStatus::Ok, 1500),
                _ => well_behaved(frame),
            },
        );
        let snap = orch.run(&image(2048), "v1").unwrap();
        assert_eq!(snap.resyncs, 1);
        assert_eq!(snap.sent_offset, 2048);
        drop(orch);

        let offsets: Vec<u32> = device
            .join()
            .unwrap()
            .iter()
            .filter_map(|f| match Message::decode(f.msg_type, &f.payload) {
                Ok(Message::Data(chunk)) => Some(chunk.offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 1500]);
    }

    #[test]
    fn test_forward_resync_moves_sent_offset() {
        let (mut orch, _device) = scripted(
            fast().with_chunk_policy(ChunkPolicy::Fixed(10)),
            |frame, _| match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::Data) => ack(TransferStatus::Ok, 100),
                _ => well_behaved(frame),
            },
        );
        let snap = orch.run(&image(100), "v1").unwrap();
        assert_eq!(snap.resyncs, 1);
        assert_eq!(snap.acked_offset, 100);
        assert_eq!(snap.sent_offset, 100);
    }

    #[test]
    fn test_ack_without_progress_is_ignored() {
        let (mut orch, _device) = scripted(fast(), |frame, _| {
            match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::Data) => ack(TransferStatus::Ok, 0),
                _ => well_behaved(frame),
            }
        });
        let err = orch.run(&image(100), "v1").unwrap_err();
        assert!(matches!(err, OtaError::TimedOut { retries: 2 }));
        assert_eq!(
            orch.snapshot().outcome,
            Some(TransferOutcome::TimedOut { retries: 2 })
        );
    }

    #[test]
    fn test_late_data_ack_is_not_taken_for_end() {
        // The last chunk is answered after the host has already resent it,
        // then the image fails verification.
        let (mut orch, device) = scripted(
            fast().with_chunk_policy(ChunkPolicy::Fixed(10)),
            |frame, i| match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::Data) if i == 3 => {
                    std::thread::sleep(Duration::from_millis(150));
                    well_behaved(frame)
                }
                Some(MsgType::End) => ack(TransferStatus::VerifyFailed, 30),
                _ => well_behaved(frame),
            },
        );
        let err = orch.run(&image(30), "v1").unwrap_err();
        assert!(matches!(err, OtaError::Rejected(TransferStatus::VerifyFailed)));
        assert_eq!(orch.snapshot().total_retries, 1);
        drop(orch);

        let types: Vec<u8> = device.join().unwrap().iter().map(|f| f.msg_type).collect();
        assert_eq!(types, vec![0x01, 0x02, 0x02, 0x02, 0x02, 0x03]);
    }

    #[test]
    fn test_late_begin_ack_is_skipped() {
        let (mut orch, device) = scripted(
            fast().with_chunk_policy(ChunkPolicy::Fixed(10)),
            |frame, i| match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::Begin) if i == 0 => {
                    std::thread::sleep(Duration::from_millis(150));
                    well_behaved(frame)
                }
                Some(MsgType::End) => ack(TransferStatus::VerifyFailed, 30),
                _ => well_behaved(frame),
            },
        );
        let err = orch.run(&image(30), "v1").unwrap_err();
        assert!(matches!(err, OtaError::Rejected(TransferStatus::VerifyFailed)));
        drop(orch);

        let types: Vec<u8> = device.join().unwrap().iter().map(|f| f.msg_type).collect();
        // Begin, Abort, Begin, three chunks, End.
        assert_eq!(types, vec![0x01, 0x05, 0x01, 0x02, 0x02, 0x02, 0x03]);
    }

    #[test]
    fn test_lost_ack_is_retried() {
        let (mut orch, device) = scripted(fast(), |frame, i| {
            match MsgType::from_u8(frame.msg_type) {
                // Swallow the first Data frame.
                Some(MsgType::Data) if i == 1 => Vec::new(),
                _ => well_behaved(frame),
            }
        });
        let snap = orch.run(&image(100), "v1").unwrap();
        assert_eq!(snap.total_retries, 1);
        drop(orch);
        assert_eq!(device.join().unwrap().len(), 4);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let (mut orch, device) = scripted(fast(), |frame, _| {
            match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::Begin) => ack(TransferStatus::Ok, 0),
                _ => Vec::new(),
            }
        });
        let err = orch.run(&image(3000), "v1").unwrap_err();
        assert!(matches!(err, OtaError::TimedOut { retries: 2 }));

        let snap = orch.snapshot();
        assert_eq!(snap.state, TransferState::Failed);
        assert_eq!(snap.outcome, Some(TransferOutcome::TimedOut { retries: 2 }));
        assert_eq!(snap.acked_offset, 0);
        drop(orch);
        // Begin plus three attempts at the first chunk.
        assert_eq!(device.join().unwrap().len(), 4);
    }

    #[test]
    fn test_begin_retry_aborts_half_open_session() {
        let (mut orch, device) = scripted(fast(), |frame, i| {
            match (MsgType::from_u8(frame.msg_type), i) {
                (Some(MsgType::Begin), 0) => Vec::new(),
                _ => well_behaved(frame),
            }
        });
        orch.run(&image(10), "v1").unwrap();
        drop(orch);
        let types: Vec<u8> = device.join().unwrap().iter().map(|f| f.msg_type).collect();
        assert_eq!(types, vec![0x01, 0x05, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_rejected_begin() {
        let (mut orch, _device) = scripted(fast(), |_, _| ack(TransferStatus::Busy, 0));
        let err = orch.run(&image(10), "v1").unwrap_err();
        assert!(matches!(err, OtaError::Rejected(TransferStatus::Busy)));
        assert_eq!(
            orch.snapshot().outcome,
            Some(TransferOutcome::Rejected(TransferStatus::Busy))
        );
    }

    #[test]
    fn test_remote_abort_during_data() {
        let (mut orch, _device) = scripted(fast(), |frame, _| {
            match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::Data) => vec![(MsgType::Abort.as_u8(), vec![2])],
                _ => well_behaved(frame),
            }
        });
        let err = orch.run(&image(10), "v1").unwrap_err();
        assert!(matches!(err, OtaError::RemoteAbort(TransferStatus::FlashError)));
        assert_eq!(
            orch.snapshot().outcome,
            Some(TransferOutcome::RemoteAbort(TransferStatus::FlashError))
        );
    }

    #[test]
    fn test_verify_failure_is_reported() {
        let (mut orch, _device) = scripted(fast(), |frame, _| {
            match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::End) => ack(TransferStatus::VerifyFailed, 10),
                _ => well_behaved(frame),
            }
        });
        let err = orch.run(&image(10), "v1").unwrap_err();
        assert_eq!(err.status(), Some(TransferStatus::VerifyFailed));
    }

    #[test]
    fn test_end_is_not_retried() {
        let (mut orch, device) = scripted(fast(), |frame, _| {
            match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::End) => Vec::new(),
                _ => well_behaved(frame),
            }
        });
        let err = orch.run(&image(10), "v1").unwrap_err();
        assert!(matches!(err, OtaError::TimedOut { retries: 0 }));
        drop(orch);
        assert_eq!(device.join().unwrap().len(), 3);
    }

    #[test]
    fn test_stray_frames_are_ignored() {
        let (mut orch, _device) = scripted(fast(), |frame, _| {
            let mut replies = vec![
                (MsgType::End.as_u8(), Vec::new()),
                (0x42, b"trace".to_vec()),
                (MsgType::Ack.as_u8(), vec![0]),
            ];
            replies.extend(well_behaved(frame));
            replies
        });
        let snap = orch.run(&image(10), "v1").unwrap();
        assert_eq!(snap.total_retries, 0);
    }

    #[test]
    fn test_cancel_sends_abort() {
        let cancel = CancelHandle::new();
        let remote = cancel.clone();
        let (orch, device) = scripted(
            fast().with_chunk_policy(ChunkPolicy::Fixed(10)),
            move |frame, i| {
                // Cancel while the third chunk is waiting for its Ack.
                if i == 3 {
                    remote.cancel();
                    return Vec::new();
                }
                well_behaved(frame)
            },
        );
        let mut orch = orch.with_cancel(cancel);

        let err = orch.run(&image(100), "v1").unwrap_err();
        assert!(matches!(err, OtaError::LocallyAborted));
        let snap = orch.snapshot();
        assert_eq!(snap.outcome, Some(TransferOutcome::LocallyAborted));
        assert_eq!(snap.acked_offset, 20);
        drop(orch);

        let frames = device.join().unwrap();
        assert_eq!(frames.len(), 5);
        let last = frames.last().unwrap();
        assert_eq!(last.msg_type, MsgType::Abort.as_u8());
        assert_eq!(last.payload.as_ref(), &[8]);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let (mut orch, _device) = scripted(fast(), |_, _| Vec::new());
        assert!(matches!(orch.run(&[], "v1"), Err(OtaError::InvalidArg(_))));
        assert!(matches!(
            orch.run(&[1], &"v".repeat(32)),
            Err(OtaError::InvalidArg(_))
        ));
        assert_eq!(orch.snapshot().state, TransferState::Idle);
    }

    #[test]
    fn test_chunk_policy() {
        assert_eq!(ChunkPolicy::default().chunk_size(), 1016);
        assert_eq!(ChunkPolicy::Fixed(4096).chunk_size(), 1016);
        assert_eq!(ChunkPolicy::Fixed(0).chunk_size(), 1);
        assert_eq!(ChunkPolicy::mtu(247).chunk_size(), 227);
        assert_eq!(ChunkPolicy::mtu(23).chunk_size(), 128);
        assert_eq!(ChunkPolicy::mtu(4000).chunk_size(), 1016);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(SessionSnapshot::idle()).unwrap();
        assert_eq!(json["state"], "idle");
        let outcome =
            serde_json::to_value(TransferOutcome::Rejected(TransferStatus::Busy)).unwrap();
        assert_eq!(outcome["outcome"], "rejected");
        assert_eq!(outcome["status"], "busy");
    }
}
