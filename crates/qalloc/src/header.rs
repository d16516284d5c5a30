//! Introspection block headers and type identity.
//!
//! In introspection mode every live allocation is prefixed with a fixed-size
//! header recording a per-type token and the index of the subpool that was
//! current when the allocation was made. The sweep phase probes these headers
//! to recognise wholly-free subpools, and diagnostics use them to name the
//! type that owned a deallocated block.
//!
//! Headers are made of plain integers on purpose: the sweep reads headers
//! from *freed* blocks whose bytes may have been overwritten by user data or
//! by a reuse split, and any bit pattern must be a valid read.

use std::ptr::NonNull;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Prefix stored immediately before every introspection-mode allocation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    /// Token identifying the allocation's element type.
    pub(crate) type_token: u64,
    /// Index of the subpool that was current at allocation time.
    pub(crate) subpool_index: usize,
}

/// Size in bytes of the prefix stored before every introspection-mode
/// allocation; `detailed_allocate(n)` consumes `n + HEADER_SIZE` pool bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Token → printable name, filled on first use of each type.
///
/// Keeping names out of the header means a stale header can never make
/// diagnostics chase a dangling pointer.
static TYPE_NAMES: Lazy<DashMap<u64, &'static str>> = Lazy::new(DashMap::new);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Stable per-type token: equality and a printable name, no RTTI.
pub(crate) fn tag_of<T>() -> u64 {
    let name = std::any::type_name::<T>();
    let token = fnv1a(name.as_bytes());
    TYPE_NAMES.entry(token).or_insert(name);
    token
}

/// Printable name for a token previously produced by [`tag_of`], if any.
pub(crate) fn name_of_token(token: u64) -> Option<&'static str> {
    TYPE_NAMES.get(&token).map(|entry| *entry)
}

/// Write `header` at `at`.
///
/// # Safety
///
/// `at` must be valid for `HEADER_SIZE` writable bytes. No alignment is
/// required.
pub(crate) unsafe fn write_header(at: NonNull<u8>, header: BlockHeader) {
    // SAFETY: caller guarantees HEADER_SIZE writable bytes; unaligned write
    // because pool storage carries no alignment guarantee.
    unsafe { at.as_ptr().cast::<BlockHeader>().write_unaligned(header) }
}

/// Read the header stored at `at`.
///
/// # Safety
///
/// `at` must be valid for `HEADER_SIZE` readable bytes. The bytes need not
/// hold a header that was ever written: all fields are plain integers, so a
/// garbage read yields a garbage value, never an invalid one.
pub(crate) unsafe fn read_header(at: NonNull<u8>) -> BlockHeader {
    // SAFETY: caller guarantees HEADER_SIZE readable bytes.
    unsafe { at.as_ptr().cast::<BlockHeader>().read_unaligned() }
}

/// Name of the type recorded for an introspection-mode allocation.
///
/// Returns `None` when the token is unknown to this process (for example
/// when the header was overwritten).
///
/// # Safety
///
/// `p` must point at the user region of a live allocation produced by
/// `detailed_allocate`, so that the preceding `HEADER_SIZE` bytes are
/// readable.
pub unsafe fn type_name_of(p: NonNull<u8>) -> Option<&'static str> {
    // SAFETY: per this function's contract the header precedes `p`.
    let header = unsafe { read_header(NonNull::new_unchecked(p.as_ptr().sub(HEADER_SIZE))) };
    name_of_token(header.type_token)
}

/// Late type check: whether the allocation at `p` was made for `T`.
///
/// # Safety
///
/// Same contract as [`type_name_of`].
pub unsafe fn is_type<T>(p: NonNull<u8>) -> bool {
    // SAFETY: per this function's contract the header precedes `p`.
    let header = unsafe { read_header(NonNull::new_unchecked(p.as_ptr().sub(HEADER_SIZE))) };
    header.type_token == tag_of::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_unaligned() {
        let mut buf = [0u8; HEADER_SIZE + 1];
        let header = BlockHeader { type_token: 0xDEAD_BEEF_0BAD_F00D, subpool_index: 7 };
        // Offset by one to force an unaligned store.
        let at = NonNull::new(buf[1..].as_mut_ptr()).unwrap();
        unsafe {
            write_header(at, header);
            assert_eq!(read_header(at), header);
        }
    }

    #[test]
    fn tags_are_stable_and_distinct() {
        assert_eq!(tag_of::<u32>(), tag_of::<u32>());
        assert_ne!(tag_of::<u32>(), tag_of::<u64>());
        assert_ne!(tag_of::<Vec<u8>>(), tag_of::<Vec<u16>>());
    }

    #[test]
    fn token_table_yields_printable_names() {
        let token = tag_of::<String>();
        let name = name_of_token(token).expect("registered name");
        assert!(name.contains("String"));
        assert_eq!(name_of_token(token ^ 1), None);
    }
}
