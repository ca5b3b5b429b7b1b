//! Host values exposed to the interpreter.
//!
//! The service references host-side callables and captured host errors by a
//! dense nonnegative index into this table. Slots are recycled through an
//! inline free list: a free cell stores the index of the next free cell
//! directly in the slot vector, so no side structure is needed and both
//! `register` and `release` are O(1).

use std::rc::Rc;

use crate::{
    error::{Error, HostError, Result},
    pyref::PyRef,
    session::Session,
};

/// Host function exposed to the interpreter.
///
/// Shared (`Rc`) so that a release arriving while the function is still
/// executing a nested dispatch frees the slot without freeing the function.
pub(crate) type HostFn = Rc<dyn Fn(&Session, Vec<PyRef>) -> Result<PyRef>>;

/// Slot id in the export table, as seen by the interpreter service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HostIndex(usize);

impl HostIndex {
    /// Creates a host index from a raw slot number.
    #[must_use]
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw slot number.
    #[must_use]
    pub fn raw(self) -> usize {
        self.0
    }
}

/// Marks the end of the free list (bitwise complement of zero).
const NO_NEXT: usize = !0;

/// One cell of the export table.
pub(crate) enum ExportSlot {
    /// Unoccupied; chains to the next free cell.
    Free { next_free: usize },
    /// A host function reachable from one interpreter-side wrapper.
    Callable(HostFn),
    /// A captured host error awaiting its round trip back into host code.
    Exception(HostError),
}

/// Registry of host values reachable from the interpreter.
pub(crate) struct ExportTable {
    slots: Vec<ExportSlot>,
    free_head: usize,
}

impl ExportTable {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), free_head: NO_NEXT }
    }

    /// Stores a slot, reusing a free cell when one exists.
    pub(crate) fn register(&mut self, slot: ExportSlot) -> HostIndex {
        if self.free_head == NO_NEXT {
            self.slots.push(slot);
            return HostIndex::new(self.slots.len() - 1);
        }
        let index = self.free_head;
        let next_free = match &self.slots[index] {
            ExportSlot::Free { next_free } => *next_free,
            _ => unreachable!("ExportTable::register: free list head points at a live slot"),
        };
        self.free_head = next_free;
        self.slots[index] = slot;
        HostIndex::new(index)
    }

    /// Fetches the host function at `index`.
    ///
    /// # Errors
    /// Protocol error if the service named a slot that is absent or not a
    /// callable; the service is the only party that mints these indices, so
    /// a mismatch means the conversation is corrupt.
    pub(crate) fn callable(&self, index: HostIndex) -> Result<HostFn> {
        match self.slots.get(index.raw()) {
            Some(ExportSlot::Callable(function)) => Ok(Rc::clone(function)),
            _ => Err(Error::Protocol(format!("host slot {} is not a callable", index.raw()))),
        }
    }

    /// Fetches the captured host error at `index`.
    ///
    /// # Errors
    /// Protocol error if the slot is absent or does not hold an error.
    pub(crate) fn exception(&self, index: HostIndex) -> Result<HostError> {
        match self.slots.get(index.raw()) {
            Some(ExportSlot::Exception(error)) => Ok(error.clone()),
            _ => Err(Error::Protocol(format!("host slot {} is not a captured error", index.raw()))),
        }
    }

    /// Returns the slot to the free list.
    ///
    /// # Errors
    /// Protocol error on an absent or already-free slot (a double release
    /// would corrupt the free list).
    pub(crate) fn release(&mut self, index: HostIndex) -> Result<()> {
        match self.slots.get(index.raw()) {
            Some(ExportSlot::Free { .. }) | None => {
                Err(Error::Protocol(format!("host slot {} released twice", index.raw())))
            }
            Some(_) => {
                self.slots[index.raw()] = ExportSlot::Free { next_free: self.free_head };
                self.free_head = index.raw();
                Ok(())
            }
        }
    }

    /// Drops every slot. Used at termination; the service releases its side
    /// wholesale by exiting.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free_head = NO_NEXT;
    }

    /// Number of occupied slots.
    pub(crate) fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, ExportSlot::Free { .. }))
            .count()
    }
}
