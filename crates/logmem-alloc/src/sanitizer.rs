//! Allocation sanitizer.
//!
//! Tracks every live small object in a region and aborts on misuse: leaks
//! at region destruction, double allocation at one address, size mismatch at
//! free, migration onto an occupied address. Active in debug builds;
//! release builds compile it down to empty maps that are never consulted.

use std::backtrace::Backtrace;
use std::collections::HashMap;

use tracing::error;

struct Allocation {
    size: usize,
    backtrace: Option<Backtrace>,
}

/// Per-region allocation tracking.
pub(crate) struct RegionSanitizer {
    enabled: bool,
    report_backtrace: bool,
    allocations: HashMap<usize, Allocation>,
}

impl RegionSanitizer {
    pub(crate) fn new(report_backtrace: bool) -> Self {
        Self {
            enabled: cfg!(debug_assertions),
            report_backtrace,
            allocations: HashMap::new(),
        }
    }

    fn capture(&self) -> Option<Backtrace> {
        self.report_backtrace.then(Backtrace::force_capture)
    }

    fn fail(&self, message: &str) -> ! {
        error!("lsa sanitizer: {}", message);
        panic!("lsa sanitizer: {}", message);
    }

    pub(crate) fn on_allocation(&mut self, ptr: *const u8, size: usize) {
        if !self.enabled {
            return;
        }
        let backtrace = self.capture();
        if self
            .allocations
            .insert(ptr as usize, Allocation { size, backtrace })
            .is_some()
        {
            self.fail(&format!(
                "allocating a {} byte object at an already occupied address {:p}",
                size, ptr
            ));
        }
    }

    pub(crate) fn on_free(&mut self, ptr: *const u8, size: usize) {
        if !self.enabled {
            return;
        }
        match self.allocations.remove(&(ptr as usize)) {
            None => self.fail(&format!(
                "freeing an object at {:p} (size: {}) that does not exist",
                ptr, size
            )),
            Some(alloc) if alloc.size != size => self.fail(&format!(
                "size mismatch freeing object at {:p}: allocated {}, freed {}",
                ptr, alloc.size, size
            )),
            Some(_) => {}
        }
    }

    pub(crate) fn on_migrate(&mut self, src: *const u8, size: usize, dst: *const u8) {
        if !self.enabled {
            return;
        }
        let alloc = match self.allocations.remove(&(src as usize)) {
            None => self.fail(&format!(
                "migrating an object at {:p} (size: {}) that does not exist",
                src, size
            )),
            Some(alloc) if alloc.size != size => self.fail(&format!(
                "size mismatch migrating object at {:p}: allocated {}, migrated {}",
                src, alloc.size, size
            )),
            Some(alloc) => alloc,
        };
        if self.allocations.insert(dst as usize, alloc).is_some() {
            self.fail(&format!(
                "migrating a {} byte object to an already occupied address {:p}",
                size, dst
            ));
        }
    }

    pub(crate) fn on_region_destruction(&mut self) {
        if !self.enabled || self.allocations.is_empty() {
            return;
        }
        // Destruction runs from drop glue; don't pile a second panic onto
        // an unwind already in progress.
        if std::thread::panicking() {
            return;
        }
        for (&ptr, alloc) in &self.allocations {
            match &alloc.backtrace {
                Some(bt) => error!(
                    "leaked {} byte object at {:#x} allocated from:\n{}",
                    alloc.size, ptr, bt
                ),
                None => error!("leaked {} byte object at {:#x}", alloc.size, ptr),
            }
        }
        self.fail(&format!(
            "{} objects leaked at region destruction",
            self.allocations.len()
        ));
    }

    /// Combines another region's tracking into this one, for region merge.
    pub(crate) fn merge(&mut self, other: &mut RegionSanitizer) {
        if !self.enabled {
            return;
        }
        for (ptr, alloc) in other.allocations.drain() {
            if self.allocations.insert(ptr, alloc).is_some() {
                self.fail(&format!(
                    "conflicting allocations at address {:#x} in merged regions",
                    ptr
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> RegionSanitizer {
        let mut sanitizer = RegionSanitizer::new(false);
        sanitizer.enabled = true;
        sanitizer
    }

    #[test]
    fn test_alloc_free_cycle() {
        let mut sanitizer = enabled();
        let ptr = 0x1000 as *const u8;
        sanitizer.on_allocation(ptr, 64);
        sanitizer.on_free(ptr, 64);
        sanitizer.on_region_destruction();
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn test_free_size_mismatch() {
        let mut sanitizer = enabled();
        let ptr = 0x1000 as *const u8;
        sanitizer.on_allocation(ptr, 64);
        sanitizer.on_free(ptr, 32);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn test_free_unknown() {
        let mut sanitizer = enabled();
        sanitizer.on_free(0x2000 as *const u8, 8);
    }

    #[test]
    fn test_migrate_moves_tracking() {
        let mut sanitizer = enabled();
        let src = 0x1000 as *const u8;
        let dst = 0x3000 as *const u8;
        sanitizer.on_allocation(src, 16);
        sanitizer.on_migrate(src, 16, dst);
        sanitizer.on_free(dst, 16);
    }

    #[test]
    #[should_panic(expected = "leaked")]
    fn test_leak_detected() {
        let mut sanitizer = enabled();
        sanitizer.on_allocation(0x1000 as *const u8, 8);
        sanitizer.on_region_destruction();
    }

    #[test]
    fn test_merge_disjoint() {
        let mut a = enabled();
        let mut b = enabled();
        a.on_allocation(0x1000 as *const u8, 8);
        b.on_allocation(0x2000 as *const u8, 8);
        a.merge(&mut b);
        a.on_free(0x1000 as *const u8, 8);
        a.on_free(0x2000 as *const u8, 8);
    }
}
