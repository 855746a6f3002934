//! Allocation-path benchmarks.

use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use logmem_alloc::{register_migrator, Migrator, Region};
use logmem_test::{chase, TrackingMigrator};

struct Fixed {
    size: usize,
}

impl Migrator for Fixed {
    fn align(&self) -> usize {
        8
    }

    fn size(&self, _obj: *const u8) -> usize {
        self.size
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
    }
}

fn bench_alloc_free(c: &mut Criterion) {
    let reg = register_migrator(Rc::new(Fixed { size: 64 }));
    let region = Region::new();

    c.bench_function("alloc_free_64", |b| {
        b.iter(|| {
            let ptr = region.alloc(reg.id(), black_box(64), 8).unwrap();
            unsafe { region.free_sized(ptr.as_ptr(), 64) };
        });
    });
}

fn bench_alloc_churn(c: &mut Criterion) {
    let reg = register_migrator(Rc::new(Fixed { size: 128 }));
    let region = Region::new();

    c.bench_function("alloc_churn_1000x128", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..1000)
                .map(|_| region.alloc(reg.id(), 128, 8).unwrap())
                .collect();
            for ptr in ptrs {
                unsafe { region.free_sized(ptr.as_ptr(), 128) };
            }
        });
    });
}

fn bench_full_compaction(c: &mut Criterion) {
    let (reg, moves) = TrackingMigrator::register(256, 8);
    let region = Region::new();

    c.bench_function("compact_half_empty_1mib", |b| {
        b.iter(|| {
            let addrs: Vec<_> = (0..4096)
                .map(|_| region.alloc(reg.id(), 256, 8).unwrap().as_ptr() as usize)
                .collect();
            for addr in addrs.iter().skip(1).step_by(2) {
                unsafe { region.free_sized(*addr as *mut u8, 256) };
            }
            region.full_compaction();
            for addr in addrs.iter().step_by(2) {
                unsafe { region.free_sized(chase(&moves, *addr) as *mut u8, 256) };
            }
            moves.borrow_mut().clear();
        });
    });
}

criterion_group!(benches, bench_alloc_free, bench_alloc_churn, bench_full_compaction);
criterion_main!(benches);
