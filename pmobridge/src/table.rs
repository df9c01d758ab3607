//! Bounded table of renderers.
//!
//! Slots are addressed by a [`DeviceHandle`] made of the slot index and the
//! slot generation. Freeing a slot bumps its generation, so a handle kept by
//! an in-flight completion or by the host stops resolving once the renderer
//! it designated is gone, even if the slot has been reused since.
//!
//! The table only guards its own structure. Callers lock it for lookups,
//! allocation and removal, never while working on a device.

use std::fmt;
use std::sync::Arc;

use crate::errors::BridgeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    index: u32,
    generation: u32,
}

impl DeviceHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

#[derive(Debug)]
pub struct DeviceTable<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
}

impl<T> DeviceTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Stores the value built by `make` in the first free slot.
    ///
    /// `make` receives the handle the value will be reachable under.
    pub fn insert_with(
        &mut self,
        make: impl FnOnce(DeviceHandle) -> T,
    ) -> Result<(DeviceHandle, Arc<T>), BridgeError> {
        let index = match self.slots.iter().position(|slot| slot.value.is_none()) {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
            None => return Err(BridgeError::TableFull(self.capacity)),
        };

        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let handle = DeviceHandle::new(index as u32, slot.generation);
        let value = Arc::new(make(handle));
        slot.value = Some(Arc::clone(&value));
        Ok((handle, value))
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<Arc<T>> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    /// Frees the slot of `handle`; stale handles are ignored.
    pub fn remove(&mut self, handle: DeviceHandle) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.take()
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<(DeviceHandle, Arc<T>)> {
        self.iter()
            .find(|(_, value)| predicate(value))
            .map(|(handle, value)| (handle, Arc::clone(value)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceHandle, &Arc<T>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (DeviceHandle::new(index as u32, slot.generation), value))
        })
    }

    /// Snapshot of the live entries, for work done outside the table lock.
    pub fn snapshot(&self) -> Vec<(DeviceHandle, Arc<T>)> {
        self.iter()
            .map(|(handle, value)| (handle, Arc::clone(value)))
            .collect()
    }

    /// Empties the table, returning what it held.
    pub fn drain(&mut self) -> Vec<(DeviceHandle, Arc<T>)> {
        let mut drained = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                drained.push((DeviceHandle::new(index as u32, slot.generation), value));
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
