//! Dual-slot storage collaborator and a RAM-backed implementation.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::message::SHA256_SIZE;

/// One of the two firmware slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::A => f.write_str("A"),
            SlotId::B => f.write_str("B"),
        }
    }
}

/// Lifecycle of an image in a slot.
///
/// `Blank -> Writing -> PendingVerify -> Confirmed`, with `RolledBack`
/// reachable from `PendingVerify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    Blank,
    Writing,
    PendingVerify,
    Confirmed,
    RolledBack,
}

/// Errors from slot storage and boot control.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    #[error("no inactive slot available")]
    NoInactiveSlot,

    #[error("slot {0} is the running slot")]
    ActiveSlot(SlotId),

    #[error("write of {len} bytes at {offset} exceeds slot capacity {capacity}")]
    OutOfBounds {
        offset: u32,
        len: usize,
        capacity: usize,
    },

    #[error("flash write failed at offset {offset}")]
    WriteFault { offset: u32 },

    #[error("cannot {op} slot {slot} in state {state:?}")]
    InvalidState {
        slot: SlotId,
        state: BootState,
        op: &'static str,
    },

    #[error("no image is pending verification")]
    NotPending,

    #[error("no confirmed image to roll back to")]
    NoRollbackTarget,
}

/// Slot storage and boot control as seen by the installer.
pub trait FlashSlots {
    /// The slot the device is currently running from.
    fn active_slot(&self) -> SlotId;

    /// The slot an update may be written to.
    fn select_inactive_slot(&self) -> Result<SlotId, FlashError>;

    /// Size of a slot in bytes.
    fn capacity(&self, slot: SlotId) -> usize;

    /// Erase `slot` and mark it `Writing`.
    fn begin_write(&mut self, slot: SlotId) -> Result<(), FlashError>;

    /// Return `slot` to `Blank`, discarding any partial image.
    fn discard(&mut self, slot: SlotId) -> Result<(), FlashError>;

    /// Program `bytes` at `offset`.
    fn write(&mut self, slot: SlotId, offset: u32, bytes: &[u8]) -> Result<(), FlashError>;

    /// SHA-256 of the first `len` bytes as stored.
    fn read_hash(&self, slot: SlotId, len: u32) -> Result<[u8; SHA256_SIZE], FlashError>;

    /// `Writing -> PendingVerify`; the slot becomes the next boot target.
    fn mark_pending_verify(&mut self, slot: SlotId) -> Result<(), FlashError>;

    /// Accept the running pending-verify image permanently.
    fn confirm(&mut self) -> Result<SlotId, FlashError>;

    /// Revert to the last confirmed image.
    fn rollback(&mut self) -> Result<SlotId, FlashError>;

    fn slot_state(&self, slot: SlotId) -> BootState;

    /// Restart the device, returning the slot it boots into.
    fn reboot(&mut self) -> Result<SlotId, FlashError>;
}

impl<F: FlashSlots + ?Sized> FlashSlots for &mut F {
    fn active_slot(&self) -> SlotId {
        (**self).active_slot()
    }
    fn select_inactive_slot(&self) -> Result<SlotId, FlashError> {
        (**self).select_inactive_slot()
    }
    fn capacity(&self, slot: SlotId) -> usize {
        (**self).capacity(slot)
    }
    fn begin_write(&mut self, slot: SlotId) -> Result<(), FlashError> {
        (**self).begin_write(slot)
    }
    fn discard(&mut self, slot: SlotId) -> Result<(), FlashError> {
        (**self).discard(slot)
    }
    fn write(&mut self, slot: SlotId, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        (**self).write(slot, offset, bytes)
    }
    fn read_hash(&self, slot: SlotId, len: u32) -> Result<[u8; SHA256_SIZE], FlashError> {
        (**self).read_hash(slot, len)
    }
    fn mark_pending_verify(&mut self, slot: SlotId) -> Result<(), FlashError> {
        (**self).mark_pending_verify(slot)
    }
    fn confirm(&mut self) -> Result<SlotId, FlashError> {
        (**self).confirm()
    }
    fn rollback(&mut self) -> Result<SlotId, FlashError> {
        (**self).rollback()
    }
    fn slot_state(&self, slot: SlotId) -> BootState {
        (**self).slot_state(slot)
    }
    fn reboot(&mut self) -> Result<SlotId, FlashError> {
        (**self).reboot()
    }
}

#[derive(Debug, Clone)]
struct Slot {
    data: Vec<u8>,
    state: BootState,
}

/// RAM-backed A/B flash with boot-control bookkeeping.
///
/// Starts running a confirmed image from slot A. After an update is marked
/// pending, the next [`reboot`](FlashSlots::reboot) is a trial boot into it.
/// A second reboot without [`confirm`](FlashSlots::confirm) rolls back.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    slots: [Slot; 2],
    capacity: usize,
    active: SlotId,
    confirmed: SlotId,
    boot_target: Option<SlotId>,
    on_trial: bool,
    fail_write_at: Option<u32>,
    boots: u32,
}

impl MemoryFlash {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: [
                Slot {
                    data: vec![0xFF; capacity],
                    state: BootState::Confirmed,
                },
                Slot {
                    data: vec![0xFF; capacity],
                    state: BootState::Blank,
                },
            ],
            capacity,
            active: SlotId::A,
            confirmed: SlotId::A,
            boot_target: None,
            on_trial: false,
            fail_write_at: None,
            boots: 0,
        }
    }

    /// Make the next write covering `offset` fail.
    pub fn fail_write_at(&mut self, offset: u32) {
        self.fail_write_at = Some(offset);
    }

    /// Flip bits in a stored byte, simulating flash corruption.
    pub fn corrupt(&mut self, slot: SlotId, offset: usize) {
        if let Some(byte) = self.slots[slot.index()].data.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }

    /// Stored contents of `slot`.
    pub fn image(&self, slot: SlotId) -> &[u8] {
        &self.slots[slot.index()].data
    }

    /// Slot that will be trial-booted on the next reboot.
    pub fn boot_target(&self) -> Option<SlotId> {
        self.boot_target
    }

    /// Whether the running image still awaits confirmation.
    pub fn on_trial(&self) -> bool {
        self.on_trial
    }

    pub fn boot_count(&self) -> u32 {
        self.boots
    }

    fn slot_mut(&mut self, slot: SlotId) -> &mut Slot {
        &mut self.slots[slot.index()]
    }

    fn revert_trial(&mut self) -> SlotId {
        let failed = self.active;
        self.slot_mut(failed).state = BootState::RolledBack;
        self.active = self.confirmed;
        self.on_trial = false;
        warn!(failed = %failed, active = %self.active, "rolled back unconfirmed image");
        self.active
    }
}

impl FlashSlots for MemoryFlash {
    fn active_slot(&self) -> SlotId {
        self.active
    }

    fn select_inactive_slot(&self) -> Result<SlotId, FlashError> {
        // While on trial the other slot is the rollback image.
        if self.on_trial {
            return Err(FlashError::NoInactiveSlot);
        }
        Ok(self.active.other())
    }

    fn capacity(&self, _slot: SlotId) -> usize {
        self.capacity
    }

    fn begin_write(&mut self, slot: SlotId) -> Result<(), FlashError> {
        if slot == self.active {
            return Err(FlashError::ActiveSlot(slot));
        }
        if self.boot_target == Some(slot) {
            self.boot_target = None;
        }
        let s = self.slot_mut(slot);
        s.data.fill(0xFF);
        s.state = BootState::Writing;
        debug!(%slot, "erased slot for writing");
        Ok(())
    }

    fn discard(&mut self, slot: SlotId) -> Result<(), FlashError> {
        if slot == self.active {
            return Err(FlashError::ActiveSlot(slot));
        }
        if self.boot_target == Some(slot) {
            self.boot_target = None;
        }
        let s = self.slot_mut(slot);
        s.data.fill(0xFF);
        s.state = BootState::Blank;
        Ok(())
    }

    fn write(&mut self, slot: SlotId, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        if slot == self.active {
            return Err(FlashError::ActiveSlot(slot));
        }
        let state = self.slot_state(slot);
        if state != BootState::Writing {
            return Err(FlashError::InvalidState {
                slot,
                state,
                op: "write",
            });
        }
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.capacity)
            .ok_or(FlashError::OutOfBounds {
                offset,
                len: bytes.len(),
                capacity: self.capacity,
            })?;
        if let Some(fault) = self.fail_write_at {
            if (start..end.max(start + 1)).contains(&(fault as usize)) {
                self.fail_write_at = None;
                return Err(FlashError::WriteFault { offset });
            }
        }
        self.slot_mut(slot).data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read_hash(&self, slot: SlotId, len: u32) -> Result<[u8; SHA256_SIZE], FlashError> {
        let data = &self.slots[slot.index()].data;
        let image = data.get(..len as usize).ok_or(FlashError::OutOfBounds {
            offset: 0,
            len: len as usize,
            capacity: self.capacity,
        })?;
        Ok(Sha256::digest(image).into())
    }

    fn mark_pending_verify(&mut self, slot: SlotId) -> Result<(), FlashError> {
        let state = self.slot_state(slot);
        if state != BootState::Writing || slot == self.active {
            return Err(FlashError::InvalidState {
                slot,
                state,
                op: "mark pending",
            });
        }
        self.slot_mut(slot).state = BootState::PendingVerify;
        self.boot_target = Some(slot);
        info!(%slot, "image pending verification");
        Ok(())
    }

    fn confirm(&mut self) -> Result<SlotId, FlashError> {
        if !self.on_trial {
            return Err(FlashError::NotPending);
        }
        let slot = self.active;
        self.slot_mut(slot).state = BootState::Confirmed;
        self.confirmed = slot;
        self.on_trial = false;
        info!(%slot, "image confirmed");
        Ok(slot)
    }

    fn rollback(&mut self) -> Result<SlotId, FlashError> {
        if self.on_trial {
            return Ok(self.revert_trial());
        }
        match self.boot_target.take() {
            Some(slot) => {
                self.slot_mut(slot).state = BootState::RolledBack;
                warn!(%slot, "cancelled pending image");
                Ok(self.active)
            }
            None => Err(FlashError::NoRollbackTarget),
        }
    }

    fn slot_state(&self, slot: SlotId) -> BootState {
        self.slots[slot.index()].state
    }

    fn reboot(&mut self) -> Result<SlotId, FlashError> {
        self.boots += 1;
        if self.on_trial {
            return Ok(self.revert_trial());
        }
        if let Some(slot) = self.boot_target.take() {
            self.active = slot;
            self.on_trial = true;
            info!(%slot, "trial boot into pending image");
        }
        Ok(self.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(image: &[u8]) -> MemoryFlash {
        let mut flash = MemoryFlash::new(4096);
        let slot = flash.select_inactive_slot().unwrap();
        flash.begin_write(slot).unwrap();
        flash.write(slot, 0, image).unwrap();
        flash.mark_pending_verify(slot).unwrap();
        flash
    }

    #[test]
    fn test_initial_layout() {
        let flash = MemoryFlash::new(1024);
        assert_eq!(flash.active_slot(), SlotId::A);
        assert_eq!(flash.slot_state(SlotId::A), BootState::Confirmed);
        assert_eq!(flash.slot_state(SlotId::B), BootState::Blank);
        assert_eq!(flash.select_inactive_slot().unwrap(), SlotId::B);
    }

    #[test]
    fn test_trial_boot_then_confirm() {
        let mut flash = staged(b"new image");
        assert_eq!(flash.reboot().unwrap(), SlotId::B);
        assert!(flash.on_trial());
        assert_eq!(flash.slot_state(SlotId::B), BootState::PendingVerify);

        assert_eq!(flash.confirm().unwrap(), SlotId::B);
        assert_eq!(flash.slot_state(SlotId::B), BootState::Confirmed);
        assert_eq!(flash.reboot().unwrap(), SlotId::B);
        assert_eq!(flash.select_inactive_slot().unwrap(), SlotId::A);
    }

    #[test]
    fn test_unconfirmed_reboot_rolls_back() {
        let mut flash = staged(b"hangs before self-test");
        assert_eq!(flash.reboot().unwrap(), SlotId::B);
        assert_eq!(flash.reboot().unwrap(), SlotId::A);
        assert_eq!(flash.slot_state(SlotId::B), BootState::RolledBack);
        assert_eq!(flash.slot_state(SlotId::A), BootState::Confirmed);
        assert_eq!(flash.active_slot(), SlotId::A);
        assert!(matches!(flash.confirm(), Err(FlashError::NotPending)));
    }

    #[test]
    fn test_explicit_rollback_on_trial() {
        let mut flash = staged(b"image");
        flash.reboot().unwrap();
        assert_eq!(flash.rollback().unwrap(), SlotId::A);
        assert_eq!(flash.slot_state(SlotId::B), BootState::RolledBack);
    }

    #[test]
    fn test_rollback_before_reboot_cancels_pending() {
        let mut flash = staged(b"image");
        assert_eq!(flash.rollback().unwrap(), SlotId::A);
        assert_eq!(flash.boot_target(), None);
        assert_eq!(flash.reboot().unwrap(), SlotId::A);
        assert!(matches!(flash.rollback(), Err(FlashError::NoRollbackTarget)));
    }

    #[test]
    fn test_no_inactive_slot_while_on_trial() {
        let mut flash = staged(b"image");
        flash.reboot().unwrap();
        assert!(matches!(
            flash.select_inactive_slot(),
            Err(FlashError::NoInactiveSlot)
        ));
    }

    #[test]
    fn test_active_slot_is_write_protected() {
        let mut flash = MemoryFlash::new(64);
        assert!(matches!(
            flash.write(SlotId::A, 0, b"x"),
            Err(FlashError::ActiveSlot(SlotId::A))
        ));
        assert!(matches!(
            flash.begin_write(SlotId::A),
            Err(FlashError::ActiveSlot(SlotId::A))
        ));
    }

    #[test]
    fn test_write_requires_writing_state() {
        let mut flash = MemoryFlash::new(64);
        assert!(matches!(
            flash.write(SlotId::B, 0, b"x"),
            Err(FlashError::InvalidState { state: BootState::Blank, .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_write() {
        let mut flash = MemoryFlash::new(8);
        flash.begin_write(SlotId::B).unwrap();
        assert!(matches!(
            flash.write(SlotId::B, 4, &[0; 5]),
            Err(FlashError::OutOfBounds { capacity: 8, .. })
        ));
    }

    #[test]
    fn test_injected_write_fault_fires_once() {
        let mut flash = MemoryFlash::new(64);
        flash.begin_write(SlotId::B).unwrap();
        flash.fail_write_at(10);
        flash.write(SlotId::B, 0, &[1; 8]).unwrap();
        assert!(matches!(
            flash.write(SlotId::B, 8, &[1; 8]),
            Err(FlashError::WriteFault { offset: 8 })
        ));
        flash.write(SlotId::B, 8, &[1; 8]).unwrap();
    }

    #[test]
    fn test_read_hash_sees_corruption() {
        let mut flash = MemoryFlash::new(64);
        flash.begin_write(SlotId::B).unwrap();
        flash.write(SlotId::B, 0, b"abcdef").unwrap();
        let expected: [u8; 32] = Sha256::digest(b"abcdef").into();
        assert_eq!(flash.read_hash(SlotId::B, 6).unwrap(), expected);

        flash.corrupt(SlotId::B, 2);
        assert_ne!(flash.read_hash(SlotId::B, 6).unwrap(), expected);
    }

    #[test]
    fn test_mark_pending_requires_writing() {
        let mut flash = MemoryFlash::new(64);
        assert!(matches!(
            flash.mark_pending_verify(SlotId::B),
            Err(FlashError::InvalidState { op: "mark pending", .. })
        ));
    }

    #[test]
    fn test_discard_returns_to_blank() {
        let mut flash = MemoryFlash::new(64);
        flash.begin_write(SlotId::B).unwrap();
        flash.write(SlotId::B, 0, b"partial").unwrap();
        flash.discard(SlotId::B).unwrap();
        assert_eq!(flash.slot_state(SlotId::B), BootState::Blank);
        assert!(flash.image(SlotId::B).iter().all(|&b| b == 0xFF));
    }
}
