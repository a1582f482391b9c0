//! Growable slot arena with free-list reuse
//!
//! Slots are addressed by [`SlotId`]. Removing a value bumps the slot's
//! generation, so ids issued for the previous occupant stop resolving.
//! The arena is not synchronized; [`HandleTable`](crate::table::HandleTable)
//! guards it with a lock.

use crate::error::{GcError, GcResult};
use crate::slot::SlotId;

/// Default number of slots reserved up front
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Indexed storage whose ids survive growth and detect reuse
#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    /// Freed indices, reused most-recent first
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<T> SlotArena<T> {
    /// Create an arena with room for `capacity` slots before growing
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store a value and return its id
    pub fn insert(&mut self, value: T) -> GcResult<SlotId> {
        self.insert_with(|_| value)
    }

    /// Store a value built from the id it will live at
    pub fn insert_with(&mut self, make: impl FnOnce(SlotId) -> T) -> GcResult<SlotId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let id = SlotId::new(index, slot.generation);
            slot.value = Some(make(id));
            self.len += 1;
            return Ok(id);
        }

        self.grow()?;
        let index = u32::try_from(self.slots.len()).map_err(|_| GcError::ResourceExhaustion {
            requested: self.slots.len() + 1,
        })?;
        let id = SlotId::new(index, 0);
        self.slots.push(Slot {
            generation: 0,
            value: Some(make(id)),
        });
        self.len += 1;
        Ok(id)
    }

    fn grow(&mut self) -> GcResult<()> {
        if self.slots.len() >= u32::MAX as usize {
            return Err(GcError::ResourceExhaustion {
                requested: self.slots.len() + 1,
            });
        }
        if self.slots.len() < self.slots.capacity() {
            return Ok(());
        }
        // double, bounded by what a u32 index can address
        let extra = self
            .slots
            .capacity()
            .max(16)
            .min(u32::MAX as usize - self.slots.len());
        self.slots
            .try_reserve_exact(extra)
            .map_err(|_| GcError::ResourceExhaustion {
                requested: self.slots.capacity() + extra,
            })
    }

    /// Look up a live value; stale or unknown ids return `None`
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.slot())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    /// Whether `id` names the current occupant of its slot
    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Take the value out and release the slot for reuse
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.len -= 1;
        Some(value)
    }

    /// Remove every value, keeping the slot storage
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                values.push(value);
            }
        }
        self.len = 0;
        values
    }

    /// Iterate live values with their ids
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (SlotId::new(index as u32, slot.generation), value))
        })
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no slot is occupied
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots that can be handed out before the next growth
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Slots ever created
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Previously used slots waiting on the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Share of created slots that are currently unoccupied, in percent
    pub fn fragmentation(&self) -> f64 {
        if self.slots.is_empty() {
            return 0.0;
        }
        self.free.len() as f64 * 100.0 / self.slots.len() as f64
    }
}
