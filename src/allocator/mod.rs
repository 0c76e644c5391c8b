//! Fixed-capacity slot pool for one worker class.

#[cfg(test)]
mod test;

use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
};

use crate::{
    binder::{ServiceBinder, ServiceDescriptor, ServiceName},
    conn::ChildConnection,
    error::{Error, Result},
    launcher::requester::PendingSpawn,
};

/// A fixed-size array of slots for one worker class, plus a FIFO queue of
/// spawn requests waiting for a slot to come free.
///
/// Slot selection is lowest-free-index first, which keeps allocation
/// deterministic. The queue is only ever non-empty while no slot is free;
/// freeing a slot hands the head of the queue back to the caller, which is
/// responsible for dispatching it; the allocator never calls back.
#[derive(Debug)]
pub(crate) struct ConnectionAllocator {
    descriptor: ServiceDescriptor,
    binder: Arc<dyn ServiceBinder>,
    slots: Vec<Option<ChildConnection>>,
    free_slots: BTreeSet<usize>,
    pending: VecDeque<PendingSpawn>,
}

impl ConnectionAllocator {
    /// Creates an allocator for a declared worker class. A class declaring
    /// no instances is a configuration error.
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        binder: Arc<dyn ServiceBinder>,
    ) -> Result<Self> {
        if descriptor.count == 0 {
            return Err(Error::configuration(format!(
                "worker class {}/{} declares no service instances",
                descriptor.package_name, descriptor.class_name_prefix,
            )));
        }
        let mut slots = Vec::with_capacity(descriptor.count);
        slots.resize_with(descriptor.count, || None);
        Ok(Self {
            free_slots: (0..descriptor.count).collect(),
            slots,
            descriptor,
            binder,
            pending: VecDeque::new(),
        })
    }

    /// Constructs a connection in the lowest free slot, or returns `None`
    /// when every slot is occupied.
    pub(crate) fn allocate(&mut self) -> Option<&mut ChildConnection> {
        let index = self.free_slots.pop_first()?;
        let service = self.descriptor.service_name(index);
        let slot = &mut self.slots[index];
        debug_assert!(slot.is_none(), "free list pointed at an occupied slot");
        Some(slot.insert(ChildConnection::new(service, Arc::clone(&self.binder))))
    }

    /// Appends a spawn request to the pending queue.
    pub(crate) fn enqueue(&mut self, pending: PendingSpawn) -> usize {
        debug_assert!(
            self.free_slots.is_empty(),
            "queued a spawn while a slot was free"
        );
        self.pending.push_back(pending);
        self.pending.len()
    }

    /// Clears a slot and returns its connection, along with the next queued
    /// spawn request if one is waiting.
    pub(crate) fn free(&mut self, index: usize) -> Option<(ChildConnection, Option<PendingSpawn>)> {
        let connection = self.slots.get_mut(index)?.take()?;
        self.free_slots.insert(index);
        Some((connection, self.pending.pop_front()))
    }

    /// Whether `service` names a slot of this allocator's class.
    pub(crate) fn owns(&self, service: &ServiceName) -> bool {
        self.descriptor.owns(service) && service.index < self.slots.len()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut ChildConnection> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&ChildConnection> {
        self.slots.get(index)?.as_ref()
    }

    pub(crate) fn is_free_connection_available(&self) -> bool {
        !self.free_slots.is_empty()
    }

    pub(crate) fn any_connection_allocated(&self) -> bool {
        self.free_slots.len() < self.slots.len()
    }

    /// The number of declared service instances for this class.
    pub(crate) fn number_of_services(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drains the pending queue, for launcher teardown.
    pub(crate) fn drain_pending(&mut self) -> impl Iterator<Item = PendingSpawn> + '_ {
        self.pending.drain(..)
    }

    /// The occupied slots, in index order.
    pub(crate) fn connections_mut(&mut self) -> impl Iterator<Item = &mut ChildConnection> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }

    #[cfg(test)]
    pub(crate) fn connections(&self) -> impl Iterator<Item = &ChildConnection> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn free_slot_indices(&self) -> Vec<usize> {
        self.free_slots.iter().copied().collect()
    }
}
