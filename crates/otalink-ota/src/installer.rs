//! Receiver-side session state: writes chunks into the inactive slot and
//! gates the image on size and digest before it can boot.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::flash::{BootState, FlashSlots, SlotId};
use crate::message::{Ack, Begin, DataChunk, TransferStatus, SHA256_SIZE};
use crate::version::FirmwareVersion;

/// Default ceiling for an announced image size: 4 MiB.
pub const DEFAULT_MAX_FIRMWARE_SIZE: u32 = 4 * 1024 * 1024;

/// Admission policy for incoming images.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Largest image accepted in Begin. Default: 4 MiB.
    pub max_firmware_size: u32,
    /// Reject Begin when the version string does not parse.
    pub require_version: bool,
    /// Accept images older than `current_version`.
    pub allow_downgrade: bool,
    /// Version of the running firmware, if known.
    pub current_version: Option<FirmwareVersion>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            max_firmware_size: DEFAULT_MAX_FIRMWARE_SIZE,
            require_version: false,
            allow_downgrade: true,
            current_version: None,
        }
    }
}

impl InstallerConfig {
    pub fn with_max_firmware_size(mut self, size: u32) -> Self {
        self.max_firmware_size = size;
        self
    }

    pub fn with_require_version(mut self, require: bool) -> Self {
        self.require_version = require;
        self
    }

    pub fn with_allow_downgrade(mut self, allow: bool) -> Self {
        self.allow_downgrade = allow;
        self
    }

    pub fn with_current_version(mut self, version: FirmwareVersion) -> Self {
        self.current_version = Some(version);
        self
    }
}

/// Identifies one Begin..End session.
///
/// The generation increases with every accepted Begin, so a token from an
/// earlier session never matches the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionToken {
    pub generation: u64,
    pub slot: SlotId,
}

/// What the receiver should send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack(Ack),
    /// The session was discarded; tell the sender why.
    Abort(TransferStatus),
    None,
}

impl Reply {
    fn ack(status: TransferStatus, next_offset: u32) -> Self {
        Reply::Ack(Ack::status(status, next_offset))
    }
}

/// Result of a successful End.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Installed {
    pub generation: u64,
    pub slot: SlotId,
    pub firmware_size: u32,
    pub version: String,
}

/// Immutable view of the installer for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallSnapshot {
    pub generation: u64,
    pub in_progress: bool,
    pub active_slot: SlotId,
    pub target_slot: Option<SlotId>,
    pub target_state: Option<BootState>,
    pub write_cursor: u32,
    pub firmware_size: u32,
    pub version: Option<String>,
}

struct Session {
    token: SessionToken,
    firmware_size: u32,
    sha256: [u8; SHA256_SIZE],
    version: String,
    cursor: u32,
    hasher: Sha256,
}

/// Dual-slot installer.
pub struct Installer<F> {
    flash: F,
    config: InstallerConfig,
    session: Option<Session>,
    generation: u64,
    last_installed: Option<Installed>,
}

impl<F: FlashSlots> Installer<F> {
    pub fn new(flash: F) -> Self {
        Self::with_config(flash, InstallerConfig::default())
    }

    pub fn with_config(flash: F, config: InstallerConfig) -> Self {
        Self {
            flash,
            config,
            session: None,
            generation: 0,
            last_installed: None,
        }
    }

    /// Start a session for the announced image.
    pub fn begin(&mut self, begin: &Begin) -> Reply {
        if let Some(session) = &self.session {
            warn!(
                generation = session.token.generation,
                "begin while an update is in progress"
            );
            return Reply::ack(TransferStatus::Busy, 0);
        }

        if let Err(status) = self.check_version(&begin.version) {
            return Reply::ack(status, 0);
        }

        let slot = match self.flash.select_inactive_slot() {
            Ok(slot) => slot,
            Err(err) => {
                warn!(%err, "no slot to install into");
                return Reply::ack(TransferStatus::PartitionError, 0);
            }
        };

        let size = begin.firmware_size;
        let capacity = self.flash.capacity(slot);
        if size == 0 || size > self.config.max_firmware_size || size as usize > capacity {
            warn!(size, capacity, max = self.config.max_firmware_size, "rejecting image size");
            return Reply::ack(TransferStatus::SizeMismatch, 0);
        }

        if let Err(err) = self.flash.begin_write(slot) {
            warn!(%slot, %err, "failed to prepare slot");
            return Reply::ack(TransferStatus::PartitionError, 0);
        }

        self.generation += 1;
        let token = SessionToken {
            generation: self.generation,
            slot,
        };
        info!(
            generation = token.generation,
            %slot,
            size,
            version = %begin.version,
            "update session started"
        );
        self.session = Some(Session {
            token,
            firmware_size: size,
            sha256: begin.sha256,
            version: begin.version.clone(),
            cursor: 0,
            hasher: Sha256::new(),
        });
        Reply::ack(TransferStatus::Ok, 0)
    }

    fn check_version(&self, version: &str) -> Result<(), TransferStatus> {
        let parsed = match FirmwareVersion::parse(version) {
            Ok(parsed) => parsed,
            Err(err) if self.config.require_version => {
                warn!(%err, "rejecting unversioned image");
                return Err(TransferStatus::VersionError);
            }
            Err(_) => return Ok(()),
        };
        if let Some(current) = &self.config.current_version {
            if !self.config.allow_downgrade && parsed.cmp_triple(current).is_lt() {
                warn!(%parsed, %current, "rejecting downgrade");
                return Err(TransferStatus::VersionError);
            }
        }
        Ok(())
    }

    /// Write one chunk for the current session.
    pub fn data(&mut self, chunk: &DataChunk<'_>) -> Reply {
        match self.token() {
            Some(token) => self.data_with_token(token, chunk),
            None => {
                debug!(offset = chunk.offset, "data without a session");
                Reply::ack(TransferStatus::Aborted, 0)
            }
        }
    }

    /// Write one chunk on behalf of the session identified by `token`.
    ///
    /// Chunks from a session that has since been replaced are refused and
    /// leave the current session untouched.
    pub fn data_with_token(&mut self, token: SessionToken, chunk: &DataChunk<'_>) -> Reply {
        if self.token() != Some(token) {
            warn!(generation = token.generation, "refusing write from stale session");
            return Reply::ack(TransferStatus::Aborted, 0);
        }
        if let Some(reply) = self.fence() {
            return reply;
        }
        let Some(session) = self.session.as_mut() else {
            return Reply::ack(TransferStatus::Aborted, 0);
        };

        let offset = chunk.offset;
        let len = chunk.data.len() as u32;
        if offset > session.firmware_size {
            warn!(offset, size = session.firmware_size, "offset beyond image");
            return self.fail(TransferStatus::OffsetMismatch);
        }
        if offset != session.cursor {
            debug!(offset, cursor = session.cursor, "resyncing sender to write cursor");
            return Reply::ack(TransferStatus::Ok, session.cursor);
        }
        if u64::from(offset) + u64::from(len) > u64::from(session.firmware_size) {
            warn!(offset, len, size = session.firmware_size, "chunk runs past image end");
            return self.fail(TransferStatus::SizeMismatch);
        }
        if chunk.data.is_empty() {
            return Reply::ack(TransferStatus::Ok, session.cursor);
        }

        if let Err(err) = self.flash.write(session.token.slot, offset, chunk.data) {
            warn!(offset, %err, "flash write failed");
            return self.fail(TransferStatus::FlashError);
        }
        session.hasher.update(chunk.data);
        session.cursor += len;
        debug!(offset, len, cursor = session.cursor, "chunk written");
        Reply::ack(TransferStatus::Ok, session.cursor)
    }

    /// Verify the image and make it the next boot target.
    pub fn end(&mut self) -> Reply {
        if self.session.is_none() {
            debug!("end without a session");
            return Reply::ack(TransferStatus::Aborted, 0);
        }
        if let Some(reply) = self.fence() {
            return reply;
        }
        let Some(session) = self.session.take() else {
            return Reply::ack(TransferStatus::Aborted, 0);
        };
        let slot = session.token.slot;
        let cursor = session.cursor;

        // From here on the session is over; a failed image stays in
        // `Writing` and is never marked bootable.
        if cursor != session.firmware_size {
            warn!(cursor, size = session.firmware_size, "end before image complete");
            return Reply::ack(TransferStatus::SizeMismatch, cursor);
        }

        let running: [u8; SHA256_SIZE] = session.hasher.finalize().into();
        if running != session.sha256 {
            warn!(%slot, "image digest mismatch");
            return Reply::ack(TransferStatus::VerifyFailed, cursor);
        }
        match self.flash.read_hash(slot, cursor) {
            Ok(stored) if stored == session.sha256 => {}
            Ok(_) => {
                warn!(%slot, "stored image does not match digest");
                return Reply::ack(TransferStatus::VerifyFailed, cursor);
            }
            Err(err) => {
                warn!(%slot, %err, "read-back failed");
                return Reply::ack(TransferStatus::FlashError, cursor);
            }
        }

        if let Err(err) = self.flash.mark_pending_verify(slot) {
            warn!(%slot, %err, "failed to set boot target");
            return Reply::ack(TransferStatus::PartitionError, cursor);
        }

        info!(
            generation = session.token.generation,
            %slot,
            version = %session.version,
            "image verified, pending boot"
        );
        self.last_installed = Some(Installed {
            generation: session.token.generation,
            slot,
            firmware_size: session.firmware_size,
            version: session.version,
        });
        Reply::ack(TransferStatus::Ok, cursor)
    }

    /// Drop the current session and blank its slot.
    pub fn abort(&mut self, reason: TransferStatus) {
        if let Some(session) = self.session.take() {
            let slot = session.token.slot;
            info!(
                generation = session.token.generation,
                %slot,
                %reason,
                cursor = session.cursor,
                "update session aborted"
            );
            if let Err(err) = self.flash.discard(slot) {
                warn!(%slot, %err, "failed to blank aborted slot");
            }
        }
    }

    /// Refuse to continue a session whose slot is now the running slot.
    fn fence(&mut self) -> Option<Reply> {
        let session = self.session.as_ref()?;
        if self.flash.active_slot() != session.token.slot {
            return None;
        }
        warn!(
            generation = session.token.generation,
            slot = %session.token.slot,
            "session target became the active slot"
        );
        self.session = None;
        Some(Reply::Abort(TransferStatus::PartitionError))
    }

    fn fail(&mut self, status: TransferStatus) -> Reply {
        self.abort(status);
        Reply::Abort(status)
    }

    pub fn in_progress(&self) -> bool {
        self.session.is_some()
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.session.as_ref().map(|s| s.token)
    }

    /// The most recent image that passed End.
    pub fn last_installed(&self) -> Option<&Installed> {
        self.last_installed.as_ref()
    }

    pub fn snapshot(&self) -> InstallSnapshot {
        let session = self.session.as_ref();
        let target_slot = session.map(|s| s.token.slot);
        InstallSnapshot {
            generation: self.generation,
            in_progress: session.is_some(),
            active_slot: self.flash.active_slot(),
            target_slot,
            target_state: target_slot.map(|slot| self.flash.slot_state(slot)),
            write_cursor: session.map_or(0, |s| s.cursor),
            firmware_size: session.map_or(0, |s| s.firmware_size),
            version: session.map(|s| s.version.clone()),
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }
}
