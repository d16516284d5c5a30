//! Process-wide default pools, one per element type.
//!
//! Keeping each type's allocations in their own pool concentrates
//! similar-size blocks together, which is what makes the first-fit free
//! list cheap and fragmentation low. Pools created here are leaked on
//! purpose: they live until process termination and release order at exit
//! is irrelevant.

use std::any::TypeId;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::pool::Pool;

static POOLS: Lazy<DashMap<TypeId, &'static Pool>> = Lazy::new(DashMap::new);

/// Smallest default pool handed out, in bytes.
const MIN_DEFAULT_BYTES: usize = 128;

fn default_bytes<T>() -> usize {
    // The initial size barely matters for throughput; growth doubles it as
    // soon as it is exceeded. Keep it small.
    std::mem::size_of::<T>().saturating_mul(16).max(MIN_DEFAULT_BYTES)
}

/// The lazily initialised process-wide pool for `T`.
///
/// The first caller for each type creates the pool; the map's entry locking
/// provides the double-checked publication, so concurrent first callers
/// observe exactly one pool. Failure to obtain the initial host buffer is
/// fatal: a process that cannot allocate a few hundred bytes during
/// startup has no useful recovery path.
pub fn pool_of<T: 'static>() -> &'static Pool {
    let key = TypeId::of::<T>();
    if let Some(pool) = POOLS.get(&key) {
        return *pool;
    }
    *POOLS.entry(key).or_insert_with(|| {
        let initial_bytes = default_bytes::<T>();
        debug!(
            type_name = std::any::type_name::<T>(),
            initial_bytes, "default pool created"
        );
        let pool = Pool::new(initial_bytes)
            .unwrap_or_else(|e| panic!("default pool initialisation failed: {e}"));
        Box::leak(Box::new(pool))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_gets_the_same_pool() {
        let a = pool_of::<u64>();
        let b = pool_of::<u64>();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn distinct_types_get_distinct_pools() {
        let a = pool_of::<u64>();
        let b = pool_of::<u128>();
        assert!(!std::ptr::eq(a, b));
    }

    #[test]
    fn default_size_scales_with_the_type() {
        assert_eq!(default_bytes::<u8>(), MIN_DEFAULT_BYTES);
        assert_eq!(default_bytes::<[u8; 64]>(), 1024);
    }

    #[test]
    fn concurrent_first_use_yields_one_pool() {
        struct Unique;
        let pools: Vec<usize> = std::thread::scope(|s| {
            (0..8)
                .map(|_| s.spawn(|| pool_of::<Unique>() as *const Pool as usize))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert!(pools.windows(2).all(|w| w[0] == w[1]));
    }
}
