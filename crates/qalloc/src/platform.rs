//! Host-memory shim over the platform heap allocator.
//!
//! The pool carves its subpools out of buffers obtained here. Only natural
//! host alignment is provided; callers needing stricter alignment are out of
//! scope for this crate.

use std::ptr::NonNull;

use crate::error::{AllocError, AllocResult};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Allocate `n_bytes` from the host heap.
        pub(crate) fn raw_alloc(n_bytes: usize) -> AllocResult<NonNull<u8>> {
            debug_assert!(n_bytes > 0, "host allocation must be non-zero");
            // SAFETY: FFI call to libc malloc with a non-zero size. The OS
            // validates the request and returns null on failure, which we
            // surface as an out-of-memory error.
            let p = unsafe { libc::malloc(n_bytes) };
            NonNull::new(p.cast::<u8>()).ok_or_else(|| AllocError::out_of_memory(n_bytes))
        }

        /// Return a buffer previously obtained from [`raw_alloc`].
        ///
        /// # Safety
        ///
        /// `p` must have been returned by `raw_alloc` and not freed since.
        pub(crate) unsafe fn raw_free(p: NonNull<u8>) {
            // SAFETY: caller guarantees `p` came from malloc and is freed
            // exactly once.
            unsafe { libc::free(p.as_ptr().cast()) }
        }
    } else if #[cfg(windows)] {
        use winapi::um::heapapi::{GetProcessHeap, HeapAlloc, HeapFree};

        /// Allocate `n_bytes` from the process heap.
        pub(crate) fn raw_alloc(n_bytes: usize) -> AllocResult<NonNull<u8>> {
            debug_assert!(n_bytes > 0, "host allocation must be non-zero");
            // SAFETY: FFI call to the process heap. HeapAlloc returns null on
            // failure; no flags are requested.
            let p = unsafe { HeapAlloc(GetProcessHeap(), 0, n_bytes) };
            NonNull::new(p.cast::<u8>()).ok_or_else(|| AllocError::out_of_memory(n_bytes))
        }

        /// Return a buffer previously obtained from [`raw_alloc`].
        ///
        /// # Safety
        ///
        /// `p` must have been returned by `raw_alloc` and not freed since.
        pub(crate) unsafe fn raw_free(p: NonNull<u8>) {
            // SAFETY: caller guarantees `p` came from HeapAlloc on the
            // process heap and is freed exactly once.
            unsafe { HeapFree(GetProcessHeap(), 0, p.as_ptr().cast()) };
        }
    } else {
        use std::alloc::{alloc, dealloc, Layout};

        const PREFIX: usize = std::mem::size_of::<usize>();

        // The prefix stores the length so raw_free can rebuild the layout.
        fn layout_for(n_bytes: usize) -> Option<Layout> {
            Layout::from_size_align(n_bytes.checked_add(PREFIX)?, PREFIX).ok()
        }

        /// Allocate `n_bytes` via the global allocator.
        pub(crate) fn raw_alloc(n_bytes: usize) -> AllocResult<NonNull<u8>> {
            debug_assert!(n_bytes > 0, "host allocation must be non-zero");
            let Some(layout) = layout_for(n_bytes) else {
                return Err(AllocError::out_of_memory(n_bytes));
            };
            // SAFETY: the layout has non-zero size.
            let p = unsafe { alloc(layout) };
            let Some(p) = NonNull::new(p) else {
                return Err(AllocError::out_of_memory(n_bytes));
            };
            // SAFETY: the buffer holds at least PREFIX bytes and is aligned
            // for a usize.
            unsafe {
                p.as_ptr().cast::<usize>().write(n_bytes);
                Ok(NonNull::new_unchecked(p.as_ptr().add(PREFIX)))
            }
        }

        /// Return a buffer previously obtained from [`raw_alloc`].
        ///
        /// # Safety
        ///
        /// `p` must have been returned by `raw_alloc` and not freed since.
        pub(crate) unsafe fn raw_free(p: NonNull<u8>) {
            // SAFETY: `p` points PREFIX bytes past the true allocation, whose
            // length is stored in the prefix and produced a valid layout at
            // allocation time.
            unsafe {
                let base = p.as_ptr().sub(PREFIX);
                let n_bytes = base.cast::<usize>().read();
                if let Some(layout) = layout_for(n_bytes) {
                    dealloc(base, layout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_write_free() {
        let p = raw_alloc(64).expect("host allocation");
        // SAFETY: 64 writable bytes were just allocated.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xAB, 64);
            assert_eq!(*p.as_ptr(), 0xAB);
            raw_free(p);
        }
    }
}
