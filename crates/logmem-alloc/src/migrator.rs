//! Migrator registry.
//!
//! A migrator describes how to relocate objects of one type: its alignment,
//! how to compute an object's size from its bytes, and how to move it.
//! Registration hands out a small integer ID which is what object headers
//! store, so the ID space is kept compact: deregistered IDs are recycled
//! before the table grows, and `2 * id + 1` must fit the single-byte express
//! header encoding.
//!
//! The registry is worker-local, like the rest of the allocator. Using an ID
//! that was never registered, or was deregistered, is a fatal programming
//! bug and aborts with diagnostics.

use std::cell::RefCell;
use std::rc::Rc;

use logmem_common::types::MigratorId;

use crate::vle::EXPRESS_SUPREME;

/// Relocation descriptor for one object type.
///
/// Implementations must be pure with respect to the allocator: `size` and
/// `migrate` are called during compaction and must not allocate from or free
/// to any region.
pub trait Migrator {
    /// Alignment required by objects of this type.
    fn align(&self) -> usize;

    /// Size in bytes of the object at `obj`.
    ///
    /// For variable-sized types this may read the object's bytes.
    fn size(&self, obj: *const u8) -> usize;

    /// Moves the `size`-byte object at `src` to `dst`.
    ///
    /// After the call the object lives at `dst`; `src` is dead storage.
    ///
    /// # Safety
    ///
    /// `src` points at a live object of exactly `size` bytes; `dst` points
    /// at uninitialized storage of at least `size` bytes with this
    /// migrator's alignment.
    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize);
}

struct MigratorTable {
    slots: Vec<Option<Rc<dyn Migrator>>>,
    unused_ids: Vec<u32>,
}

impl MigratorTable {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            unused_ids: Vec::new(),
        }
    }

    fn add(&mut self, migrator: Rc<dyn Migrator>) -> MigratorId {
        let idx = match self.unused_ids.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(migrator);
                idx
            }
            None => {
                self.slots.push(Some(migrator));
                (self.slots.len() - 1) as u32
            }
        };
        // Object headers encode 2 * id + 1; it must stay in express form so
        // live headers have a fixed minimal width of one byte.
        assert!(
            u64::from(idx) * 2 + 1 < EXPRESS_SUPREME,
            "migrator table full: id {} does not fit the header encoding",
            idx
        );
        MigratorId::new(idx)
    }

    fn remove(&mut self, id: MigratorId) {
        let idx = id.as_u32() as usize;
        assert!(
            idx < self.slots.len() && self.slots[idx].is_some(),
            "deregistering migrator id {} which is not registered",
            id
        );
        self.slots[idx] = None;
        self.unused_ids.push(id.as_u32());
    }

    fn get(&self, id: MigratorId) -> Rc<dyn Migrator> {
        let idx = id.as_u32() as usize;
        match self.slots.get(idx) {
            Some(Some(m)) => Rc::clone(m),
            Some(None) => panic!("use of deregistered migrator id {}", id),
            None => panic!("use of migrator id {} which was never registered", id),
        }
    }
}

thread_local! {
    static MIGRATORS: RefCell<MigratorTable> = const { RefCell::new(MigratorTable::new()) };
}

/// Owns a migrator registration; deregisters on drop.
///
/// Objects allocated with this migrator's ID must be freed before the
/// registration is dropped.
pub struct MigratorRegistration {
    id: MigratorId,
}

impl MigratorRegistration {
    /// The registered ID, as stored in object headers.
    #[must_use]
    pub fn id(&self) -> MigratorId {
        self.id
    }
}

impl Drop for MigratorRegistration {
    fn drop(&mut self) {
        MIGRATORS.with(|table| table.borrow_mut().remove(self.id));
    }
}

/// Registers a migrator with the worker's table and returns the
/// registration handle.
pub fn register_migrator(migrator: Rc<dyn Migrator>) -> MigratorRegistration {
    let id = MIGRATORS.with(|table| table.borrow_mut().add(migrator));
    MigratorRegistration { id }
}

/// Looks up a registered migrator. Panics on an unregistered ID.
pub(crate) fn migrator(id: MigratorId) -> Rc<dyn Migrator> {
    MIGRATORS.with(|table| table.borrow().get(id))
}
