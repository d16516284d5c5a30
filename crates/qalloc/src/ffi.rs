//! C facade: `malloc`-style entry points over a process-wide pool.
//!
//! Every allocation stores an out-of-band record so that deallocation and
//! reallocation can recover the original size from the data pointer alone:
//!
//! ```text
//! | size : word | padding : 0..word-1 bytes | padding_len : u8 | data |
//! ```
//!
//! The padding aligns the data pointer to the platform word. All entry
//! points route through one process-wide default pool; out-of-memory is
//! reported as a null pointer, mirroring `malloc`.

use std::os::raw::c_void;
use std::ptr::{self, NonNull};

use crate::pool::Pool;
use crate::registry::pool_of;

/// Platform word: the alignment granted to facade data pointers.
const WORD: usize = std::mem::size_of::<usize>();

/// Registry key for the facade's shared pool.
struct CFacadeHeap;

fn facade_pool() -> &'static Pool {
    pool_of::<CFacadeHeap>()
}

/// Allocate `size` bytes; the returned pointer is word-aligned.
///
/// Returns null when the pool cannot satisfy the request.
#[no_mangle]
pub extern "C" fn q_allocate(size: usize) -> *mut c_void {
    // Size field, worst-case padding and the padding length byte.
    let Some(total) = size.checked_add(WORD + WORD + 1) else {
        return ptr::null_mut();
    };
    let Ok(base) = facade_pool().detailed_allocate::<c_void>(total) else {
        return ptr::null_mut();
    };

    // SAFETY: `base` starts `total` exclusively owned bytes; every write
    // below stays within them (size field, padding byte and data fit by
    // construction of `total`).
    unsafe {
        let base = base.as_ptr();
        base.cast::<usize>().write_unaligned(size);

        let after_size = base.add(WORD);
        let mut padding = 0usize;
        while (after_size as usize + padding + 1) % WORD != 0 {
            padding += 1;
        }
        debug_assert!(padding < WORD);

        let len_byte = after_size.add(padding);
        len_byte.write(padding as u8);

        let data = len_byte.add(1);
        debug_assert_eq!(data as usize % WORD, 0);
        data.cast()
    }
}

/// Allocate a zeroed region for `n` elements of `size` bytes.
///
/// Returns null when both counts are zero, on multiplication overflow, or
/// when the pool cannot satisfy the request.
#[no_mangle]
pub extern "C" fn q_callocate(n: usize, size: usize) -> *mut c_void {
    if (n | size) == 0 {
        return ptr::null_mut();
    }
    let Some(total) = n.checked_mul(size) else {
        return ptr::null_mut();
    };
    let data = q_allocate(total);
    if data.is_null() {
        return data;
    }
    // SAFETY: q_allocate returned `total` writable bytes at `data`.
    unsafe { ptr::write_bytes(data.cast::<u8>(), 0, total) };
    data
}

/// Release a region obtained from [`q_allocate`] / [`q_callocate`] /
/// [`q_reallocate`]. Null is ignored.
///
/// # Safety
///
/// `p` must be null or a pointer previously returned by one of the facade
/// allocation entry points and not yet released.
#[no_mangle]
pub unsafe extern "C" fn q_deallocate(p: *mut c_void) {
    if p.is_null() {
        return;
    }
    // SAFETY: per this function's contract the facade record precedes `p`.
    unsafe {
        let data = p.cast::<u8>();
        let padding = data.sub(1).read() as usize;
        let head = data.sub(1 + padding + WORD);
        let size = head.cast::<usize>().read_unaligned();
        facade_pool().detailed_deallocate::<c_void>(
            NonNull::new_unchecked(head),
            size + WORD + padding + 1,
        );
    }
}

/// Resize a region, preserving `min(old_size, new_size)` bytes of content.
///
/// A null `p` behaves like [`q_allocate`]. On failure the original region
/// is left untouched and null is returned.
///
/// # Safety
///
/// `p` must be null or a pointer previously returned by one of the facade
/// allocation entry points and not yet released.
#[no_mangle]
pub unsafe extern "C" fn q_reallocate(p: *mut c_void, new_size: usize) -> *mut c_void {
    if p.is_null() {
        return q_allocate(new_size);
    }
    let new_data = q_allocate(new_size);
    if new_data.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: per this function's contract the facade record precedes `p`;
    // `new_data` holds `new_size` writable bytes.
    unsafe {
        let data = p.cast::<u8>();
        let padding = data.sub(1).read() as usize;
        let head = data.sub(1 + padding + WORD);
        let old_size = head.cast::<usize>().read_unaligned();

        ptr::copy_nonoverlapping(
            data,
            new_data.cast::<u8>(),
            old_size.min(new_size),
        );
        facade_pool().detailed_deallocate::<c_void>(
            NonNull::new_unchecked(head),
            old_size + WORD + padding + 1,
        );
    }
    new_data
}

/// Run the sweep phase on the facade pool.
///
/// Returns the number of bytes released back to the host allocator.
#[no_mangle]
pub extern "C" fn q_garbage_collect() -> usize {
    facade_pool().gc()
}
