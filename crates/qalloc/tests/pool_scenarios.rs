//! End-to-end pool scenarios: bump + grow, coalescing, split-on-reuse,
//! sweep and multithreaded allocation.

use std::ptr::NonNull;

use qalloc::{AllocError, Pool, TypedAllocator};

fn addr(p: NonNull<u8>) -> usize {
    p.as_ptr() as usize
}

/// Bump three blocks, overflow the first subpool, and observe the grown
/// pool plus the published slack.
#[test]
fn bump_then_grow() {
    let pool = Pool::new(256).unwrap();

    let a = pool.allocate(32).unwrap();
    let b = pool.allocate(56).unwrap();
    let c = pool.allocate(96).unwrap();
    assert_eq!(addr(b), addr(a) + 32);
    assert_eq!(addr(c), addr(b) + 56);
    assert_eq!(pool.bytes_used(), 184);
    assert_eq!(pool.pool_size(), 256);

    // 72 bytes left: this request grows the pool by max(136 * 2, 256 * 2).
    let d = pool.allocate(136).unwrap();
    assert_eq!(pool.pool_size(), 256 + 512);
    assert_eq!(pool.bytes_used(), 184 + 136);

    // The 72-byte tail of the first subpool went to the free list; an exact
    // fit request gets it back rather than fresh bytes next to `d`.
    let tail = pool.allocate(72).unwrap();
    assert_eq!(addr(tail), addr(c) + 96);
    assert_ne!(addr(tail), addr(d) + 136);
}

/// Freeing descending-adjacent blocks folds them and the slack into one
/// entry, which a later request then splits from the tail.
#[test]
fn coalesce_chain_then_split_on_reuse() {
    let pool = Pool::new(256).unwrap();
    let _a = pool.allocate(32).unwrap();
    let b = pool.allocate(56).unwrap();
    let c = pool.allocate(96).unwrap();
    pool.allocate(136).unwrap(); // grow; 72-byte slack published

    let used_before = pool.bytes_used();
    pool.deallocate(c, 96);
    pool.deallocate(b, 56);
    // 56 + 96 + 72 coalesced at b's address.
    assert_eq!(pool.bytes_used(), used_before - 152);

    // Reuse 176 of the 224-byte block: the trailing bytes come back, the
    // 48-byte residual stays at the block's start.
    let big = pool.allocate(176).unwrap();
    assert_eq!(addr(big), addr(b) + 48);
    assert_eq!(pool.bytes_used(), used_before - 152 + 176);

    let residual = pool.allocate(48).unwrap();
    assert_eq!(addr(residual), addr(b));
    assert_eq!(pool.bytes_used(), used_before + 72);
}

/// Allocate-then-deallocate leaves `bytes_used` where it started.
#[test]
fn roundtrip_restores_bytes_used() {
    let pool = Pool::new(512).unwrap();
    pool.allocate(100).unwrap();
    let before = pool.bytes_used();

    let p = pool.allocate(64).unwrap();
    assert_eq!(pool.bytes_used(), before + 64);
    pool.deallocate(p, 64);
    assert_eq!(pool.bytes_used(), before);
}

/// The sweep releases a frozen, wholly-free subpool exactly once.
#[test]
fn gc_releases_and_is_idempotent() {
    const HEADER: usize = qalloc::HEADER_SIZE;
    let pool = Pool::new(128).unwrap();

    let sizes = [48 - HEADER, 56 - HEADER, 48 - HEADER, 52 - HEADER];
    let a = pool.detailed_allocate::<u64>(sizes[0]).unwrap();
    let b = pool.detailed_allocate::<u64>(sizes[1]).unwrap();
    let c = pool.detailed_allocate::<u64>(sizes[2]).unwrap(); // forces growth
    let d = pool.detailed_allocate::<u64>(sizes[3]).unwrap();
    assert_eq!(pool.pool_size(), 128 + 256);

    pool.detailed_deallocate::<u64>(a, sizes[0]);
    pool.detailed_deallocate::<u64>(b, sizes[1]);
    pool.detailed_deallocate::<u64>(c, sizes[2]);
    pool.detailed_deallocate::<u64>(d, sizes[3]);

    assert_eq!(pool.gc(), 128);
    assert_eq!(pool.pool_size(), 256);
    // Nothing left to sweep: a second run reclaims nothing.
    assert_eq!(pool.gc(), 0);
    assert_eq!(pool.pool_size(), 256);

    let stats = pool.stats();
    assert_eq!(stats.gc_runs, 2);
    assert_eq!(stats.bytes_reclaimed, 128);
}

/// Introspection headers survive for late type checks.
#[test]
fn detailed_allocations_carry_type_identity() {
    let pool = Pool::new(512).unwrap();
    let alloc = TypedAllocator::<u32>::new(&pool);

    let p = alloc.allocate(4).unwrap();
    // SAFETY: `p` was produced by a detailed allocation on `pool` and is
    // still live.
    unsafe {
        assert!(qalloc::is_type::<u32>(p.cast()));
        assert!(!qalloc::is_type::<u64>(p.cast()));
        let name = qalloc::type_name_of(p.cast()).expect("registered type");
        assert!(name.contains("u32"));
    }
    alloc.deallocate(p, 4);
}

/// Sixteen threads bump the same pool; regions never overlap.
#[test]
fn concurrent_allocations_do_not_overlap() {
    let pool = Pool::new(128).unwrap();

    let regions: Vec<(usize, usize)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let pool = &pool;
                s.spawn(move || {
                    let p = pool.allocate(20).unwrap();
                    // SAFETY: 20 exclusively owned bytes.
                    unsafe { std::ptr::write_bytes(p.as_ptr(), i as u8, 20) };
                    // Read back after every thread may have allocated.
                    (addr(p), i)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (i, &(a, _)) in regions.iter().enumerate() {
        for &(b, _) in &regions[i + 1..] {
            assert!(
                a + 20 <= b || b + 20 <= a,
                "regions overlap: {a:#x} and {b:#x}"
            );
        }
    }

    // Every pattern byte survived its neighbours.
    for &(a, i) in &regions {
        // SAFETY: the regions are still live and exclusively ours.
        unsafe {
            let p = a as *const u8;
            assert!((0..20).all(|off| *p.add(off) == i as u8));
        }
    }

    assert_eq!(pool.bytes_used(), 16 * 20);
    assert!(pool.pool_size() > 128, "growth must have happened");
}

/// Host refusal surfaces as an out-of-memory error and leaves the pool
/// usable.
#[test]
fn impossible_requests_report_out_of_memory() {
    let pool = Pool::new(256).unwrap();
    let err = pool.allocate(usize::MAX / 4).unwrap_err();
    assert!(matches!(err, AllocError::OutOfMemory { .. }));

    // The failed growth left the pool intact.
    let p = pool.allocate(64).unwrap();
    pool.deallocate(p, 64);
    assert_eq!(pool.bytes_used(), 0);
}

/// The diagnostic dump reflects the pool's shape.
#[test]
fn print_info_reports_tombstones() {
    const HEADER: usize = qalloc::HEADER_SIZE;
    let pool = Pool::new(128).unwrap();
    let a = pool.detailed_allocate::<u8>(128 - HEADER).unwrap();
    let _b = pool.detailed_allocate::<u8>(16).unwrap(); // grows
    pool.detailed_deallocate::<u8>(a, 128 - HEADER);
    assert_eq!(pool.gc(), 128);

    let info = pool.format_info(false);
    assert!(info.contains("released by gc"));
}
