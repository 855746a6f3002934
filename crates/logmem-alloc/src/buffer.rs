//! Owning handles to relocatable buffers.

use std::fmt;
use std::ptr;

use crate::segment::SegmentIdx;

/// Heap-pinned record backing an [`LsaBuffer`] handle.
///
/// The record's address is stable for the lifetime of the handle, so the
/// owning `bufs` segment descriptor can keep a raw back-reference to it and
/// retarget the buffer in place when compaction moves the bytes. `slot` is
/// the record's index in that descriptor's back-reference table; frees pack
/// the table, updating `slot` of whichever record gets swapped in.
pub(crate) struct BufRecord {
    pub(crate) buf: *mut u8,
    pub(crate) size: usize,
    pub(crate) seg: SegmentIdx,
    pub(crate) slot: usize,
}

/// A unique handle to a chunk of memory allocated inside a region.
///
/// The handle can be in a disengaged state, in which case it doesn't point
/// at any buffer. When engaged, the handle owns the buffer: dropping the
/// handle frees it.
///
/// The handle object itself is never invalidated. The pointed-to buffer can
/// be moved by compaction, so a pointer previously returned by [`get`] may
/// go stale, but the handle is updated automatically and `get` always
/// returns the buffer's current address.
///
/// Must not outlive its region.
///
/// [`get`]: LsaBuffer::get
pub struct LsaBuffer {
    rec: *mut BufRecord,
}

impl LsaBuffer {
    /// Creates a disengaged handle.
    #[must_use]
    pub fn disengaged() -> Self {
        Self {
            rec: ptr::null_mut(),
        }
    }

    pub(crate) fn engage(rec: *mut BufRecord) -> Self {
        Self { rec }
    }

    /// Returns the buffer's current address, or null when disengaged.
    ///
    /// The address is valid at the time of the call; it may change across
    /// any operation that can trigger compaction.
    #[must_use]
    pub fn get(&self) -> *mut u8 {
        if self.rec.is_null() {
            ptr::null_mut()
        } else {
            // Safety: an engaged handle owns its record.
            unsafe { (*self.rec).buf }
        }
    }

    /// Returns the number of bytes in the buffer, or 0 when disengaged.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.rec.is_null() {
            0
        } else {
            // Safety: an engaged handle owns its record.
            unsafe { (*self.rec).size }
        }
    }

    /// Returns true iff the handle is engaged.
    #[must_use]
    pub fn is_engaged(&self) -> bool {
        !self.rec.is_null()
    }
}

impl Default for LsaBuffer {
    fn default() -> Self {
        Self::disengaged()
    }
}

impl fmt::Debug for LsaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rec.is_null() {
            write!(f, "LsaBuffer(disengaged)")
        } else {
            write!(f, "LsaBuffer({:p}, {} bytes)", self.get(), self.size())
        }
    }
}

impl Drop for LsaBuffer {
    fn drop(&mut self) {
        if self.rec.is_null() {
            return;
        }
        // The tracker may already be gone during worker teardown; the
        // segment store reclaims the memory itself in that case.
        let _ = crate::tracker::TRACKER.try_with(|tracker| {
            // Safety: an engaged handle owns its record.
            tracker.free_buf(unsafe { &mut *self.rec });
        });
        // Safety: the record was created by Box::into_raw at allocation.
        drop(unsafe { Box::from_raw(self.rec) });
        self.rec = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disengaged_handle() {
        let buf = LsaBuffer::disengaged();
        assert!(!buf.is_engaged());
        assert!(buf.get().is_null());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn test_default_is_disengaged() {
        assert!(!LsaBuffer::default().is_engaged());
    }
}
