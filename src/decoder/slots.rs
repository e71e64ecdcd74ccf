// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware reference slot allocation.
//!
//! The accelerator addresses reference pictures through a small set of slots, fewer than the
//! decode buffers that may hold reference frames. A buffer that finds no free slot is recorded as
//! the single outstanding request and gets the next slot released.

use std::collections::HashMap;

use log::debug;
use log::warn;
use thiserror::Error;

/// Index of a decode buffer, as handed out by the decode core.
pub type BufferIndex = usize;

/// Hardware reference slot.
pub type Slot = usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("buffer {requested} needs a slot while buffer {outstanding} is still waiting for one")]
    AlreadyDeferred { requested: BufferIndex, outstanding: BufferIndex },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allocation {
    Granted(Slot),
    /// No slot is free. The buffer gets one as soon as another buffer releases its own.
    Deferred,
}

#[derive(Debug)]
pub struct SlotAllocator {
    slot_used: Vec<bool>,
    slots: HashMap<BufferIndex, Slot>,
    outstanding: Option<BufferIndex>,
}

impl SlotAllocator {
    pub fn new(num_slots: usize) -> Self {
        Self { slot_used: vec![false; num_slots], slots: HashMap::new(), outstanding: None }
    }

    pub fn num_slots(&self) -> usize {
        self.slot_used.len()
    }

    pub fn num_free(&self) -> usize {
        self.slot_used.iter().filter(|used| !**used).count()
    }

    pub fn slot_used(&self) -> &[bool] {
        &self.slot_used
    }

    pub fn slot_of(&self, buffer: BufferIndex) -> Option<Slot> {
        self.slots.get(&buffer).copied()
    }

    pub fn outstanding(&self) -> Option<BufferIndex> {
        self.outstanding
    }

    fn grant(&mut self, buffer: BufferIndex) -> Option<Slot> {
        let slot = self.slot_used.iter().position(|used| !used)?;
        self.slot_used[slot] = true;
        self.slots.insert(buffer, slot);
        debug!("Slot {} granted to buffer {}", slot, buffer);
        Some(slot)
    }

    /// Retries the outstanding request, returning the grant if it got one.
    fn retry_outstanding(&mut self) -> Option<(BufferIndex, Slot)> {
        let buffer = self.outstanding?;
        let slot = self.grant(buffer)?;
        self.outstanding = None;
        Some((buffer, slot))
    }

    pub fn allocate(&mut self, buffer: BufferIndex) -> Result<Allocation, SlotError> {
        if let Some(slot) = self.slot_of(buffer) {
            return Ok(Allocation::Granted(slot));
        }

        self.retry_outstanding();
        match self.outstanding {
            Some(outstanding) if outstanding == buffer => return Ok(Allocation::Deferred),
            Some(outstanding) => {
                log::error!("Reference slot requested while another request is outstanding");
                return Err(SlotError::AlreadyDeferred { requested: buffer, outstanding });
            }
            None => (),
        }

        match self.grant(buffer) {
            Some(slot) => Ok(Allocation::Granted(slot)),
            None => {
                warn!("No free reference slot for buffer {}, deferring", buffer);
                self.outstanding = Some(buffer);
                Ok(Allocation::Deferred)
            }
        }
    }

    /// Frees the slot of `buffer`, if any, and cancels its outstanding request. Returns the
    /// buffer and slot of a deferred request this release satisfied.
    pub fn release(&mut self, buffer: BufferIndex) -> Option<(BufferIndex, Slot)> {
        if let Some(slot) = self.slots.remove(&buffer) {
            debug!("Slot {} released by buffer {}", slot, buffer);
            self.slot_used[slot] = false;
        }

        if self.outstanding == Some(buffer) {
            self.outstanding = None;
        }

        self.retry_outstanding()
    }

    pub fn release_all(&mut self) {
        self.slot_used.iter_mut().for_each(|used| *used = false);
        self.slots.clear();
        self.outstanding = None;
    }
}
