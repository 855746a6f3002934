//! Buffer handles: allocation limits and address tracking across moves.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use logmem_alloc::{MemError, Region, SEGMENT_SIZE};

fn write_buf(buf: &logmem_alloc::LsaBuffer, content: &[u8]) {
    assert_eq!(buf.size(), content.len());
    unsafe { std::ptr::copy_nonoverlapping(content.as_ptr(), buf.get(), content.len()) };
}

fn read_buf(buf: &logmem_alloc::LsaBuffer) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(buf.get(), buf.size()) }.to_vec()
}

fn segment_of(addr: *const u8) -> usize {
    addr as usize & !(SEGMENT_SIZE - 1)
}

#[test]
fn test_oversized_buffer_is_rejected() {
    let region = Region::new();
    let result = region.alloc_buf(SEGMENT_SIZE + 1);
    assert!(matches!(result, Err(MemError::BufferTooLarge { .. })));
    // A whole segment is the limit, inclusive.
    let ok = region.alloc_buf(SEGMENT_SIZE).unwrap();
    assert_eq!(ok.size(), SEGMENT_SIZE);
}

#[test]
fn test_buffers_move_under_compaction() {
    let region = Region::new();

    let first = region.alloc_buf(3000).unwrap();
    let second = region.alloc_buf(5000).unwrap();
    assert_eq!(first.get() as usize % 4096, 0);
    assert_eq!(second.get() as usize % 4096, 0);
    // Both come from the same buffer segment at first.
    assert_eq!(segment_of(first.get()), segment_of(second.get()));

    let first_content = vec![0xa1u8; 3000];
    let second_content = vec![0xb2u8; 5000];
    write_buf(&first, &first_content);
    write_buf(&second, &second_content);

    let first_before = first.get();
    let second_before = second.get();

    region.full_compaction();

    // The handles chased their buffers into a different segment.
    assert_ne!(segment_of(first.get()), segment_of(first_before));
    assert_ne!(segment_of(second.get()), segment_of(second_before));
    assert_eq!(read_buf(&first), first_content);
    assert_eq!(read_buf(&second), second_content);
}

#[test]
fn test_buffer_tracking_across_compaction_fleet() {
    let region = Region::new();
    let mut rng = StdRng::seed_from_u64(21);

    let buffers: Vec<_> = (0..40)
        .map(|_| {
            let size = rng.gen_range(1..=3 * 4096);
            let buf = region.alloc_buf(size).unwrap();
            let content: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
            write_buf(&buf, &content);
            (buf, content)
        })
        .collect();

    region.full_compaction();

    for (buf, content) in &buffers {
        assert!(buf.is_engaged());
        assert_eq!(&read_buf(buf), content);
    }

    // Dropping every handle empties the region.
    drop(buffers);
    assert_eq!(region.occupancy().used_space(), 0);
}

#[test]
fn test_buffer_free_packs_segment() {
    let region = Region::new();
    let a = region.alloc_buf(4096).unwrap();
    let b = region.alloc_buf(4096).unwrap();
    let c = region.alloc_buf(4096).unwrap();
    write_buf(&b, &vec![7u8; 4096]);

    // Dropping the first and last buffers exercises the swap-remove
    // packing of the back-reference table.
    drop(a);
    drop(c);
    assert_eq!(read_buf(&b), vec![7u8; 4096]);

    region.full_compaction();
    assert_eq!(read_buf(&b), vec![7u8; 4096]);
    drop(b);
    assert_eq!(region.occupancy().used_space(), 0);
}
