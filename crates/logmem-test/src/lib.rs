//! Test support for the logmem conformance suite.

#![warn(clippy::all)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use logmem_alloc::{register_migrator, Migrator, MigratorRegistration};

/// Routes allocator tracing to the test output, honoring `RUST_LOG`.
/// Call at the top of a test when debugging reclamation decisions.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Migrator for fixed-size opaque byte objects.
pub struct ByteMigrator {
    size: usize,
    align: usize,
}

impl Migrator for ByteMigrator {
    fn align(&self) -> usize {
        self.align
    }

    fn size(&self, _obj: *const u8) -> usize {
        self.size
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
    }
}

/// Registers a fixed-size byte migrator.
pub fn register_bytes(size: usize, align: usize) -> MigratorRegistration {
    register_migrator(Rc::new(ByteMigrator { size, align }))
}

/// Migrator for self-describing objects: the payload starts with a `u32`
/// holding the object's total size.
pub struct SelfSizedMigrator {
    align: usize,
}

impl Migrator for SelfSizedMigrator {
    fn align(&self) -> usize {
        self.align
    }

    fn size(&self, obj: *const u8) -> usize {
        unsafe { obj.cast::<u32>().read() as usize }
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
    }
}

/// Registers a self-sized migrator; objects must lead with their `u32`
/// total size and be at least 4-byte aligned.
pub fn register_self_sized(align: usize) -> MigratorRegistration {
    assert!(align >= 4);
    register_migrator(Rc::new(SelfSizedMigrator { align }))
}

/// Relocation map filled in by a [`TrackingMigrator`]: old address to new
/// address, one entry per move.
pub type MoveMap = Rc<RefCell<HashMap<usize, usize>>>;

/// Fixed-size migrator that records every move, so tests can chase an
/// object's address across compactions.
pub struct TrackingMigrator {
    size: usize,
    align: usize,
    moves: MoveMap,
}

impl TrackingMigrator {
    /// Creates the migrator and returns the shared move map with it.
    pub fn register(size: usize, align: usize) -> (MigratorRegistration, MoveMap) {
        let moves: MoveMap = Rc::new(RefCell::new(HashMap::new()));
        let registration = register_migrator(Rc::new(TrackingMigrator {
            size,
            align,
            moves: Rc::clone(&moves),
        }));
        (registration, moves)
    }
}

impl Migrator for TrackingMigrator {
    fn align(&self) -> usize {
        self.align
    }

    fn size(&self, _obj: *const u8) -> usize {
        self.size
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
        self.moves.borrow_mut().insert(src as usize, dst as usize);
    }
}

/// Follows an object's address through the move map.
pub fn chase(moves: &MoveMap, mut addr: usize) -> usize {
    let moves = moves.borrow();
    while let Some(&next) = moves.get(&addr) {
        addr = next;
    }
    addr
}
