//! Generational handle table.
//!
//! A [`Handle`] packs a slot index (low 32 bits) and the slot's generation
//! (high 32 bits). Freeing a slot bumps its generation, so every handle
//! previously issued for it stops resolving, even after the slot is reused.

use crate::error::{BridgeError, Result};
use std::fmt;
use std::num::NonZeroU64;

/// Opaque token for a live table entry. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    fn new(index: u32, generation: u32) -> Self {
        let raw = (u64::from(generation) << 32) | u64::from(index);
        // Generations start at 1, so the high half is never zero.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Decode a raw value received from a caller. Zero decodes to `None`.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// The value handed to callers, e.g. as a JVM `long`.
    pub fn into_raw(self) -> u64 {
        self.0.get()
    }

    fn index(self) -> usize {
        (self.0.get() & u64::from(u32::MAX)) as usize
    }

    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::new(index, 1)
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        let slot = self
            .slots
            .get(handle.index())
            .ok_or(BridgeError::InvalidHandle(handle.into_raw()))?;
        if slot.generation != handle.generation() {
            return Err(Self::stale(slot, handle));
        }
        slot.value.as_ref().ok_or(BridgeError::Released(handle.into_raw()))
    }

    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(BridgeError::InvalidHandle(handle.into_raw()))?;
        if slot.generation != handle.generation() {
            return Err(Self::stale(slot, handle));
        }
        let value = slot.value.take().ok_or(BridgeError::Released(handle.into_raw()))?;

        // Retire the slot for good once its generation counter is spent.
        slot.generation = slot.generation.wrapping_add(1);
        if slot.generation != 0 {
            self.free.push(handle.index() as u32);
        }
        self.len -= 1;
        Ok(value)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove every live entry, returning them with their handles.
    pub fn drain(&mut self) -> Vec<(Handle, T)> {
        let mut out = Vec::with_capacity(self.len);
        for index in 0..self.slots.len() {
            let generation = self.slots[index].generation;
            let handle = Handle::new(index as u32, generation);
            if self.slots[index].value.is_some() {
                if let Ok(value) = self.remove(handle) {
                    out.push((handle, value));
                }
            }
        }
        out
    }

    /// A generation newer than the handle's means it was released; an older
    /// one means the handle was forged.
    fn stale(slot: &Slot<T>, handle: Handle) -> BridgeError {
        if handle.generation() != 0 && (handle.generation() < slot.generation || slot.generation == 0) {
            BridgeError::Released(handle.into_raw())
        } else {
            BridgeError::InvalidHandle(handle.into_raw())
        }
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
