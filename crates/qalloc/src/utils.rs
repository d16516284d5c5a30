//! Small shared helpers.

use std::sync::atomic::{AtomicUsize, Ordering};

static THREAD_COUNTER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ORDINAL: usize = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Monotonically-assigned id of the calling thread.
///
/// The first thread that ever asks receives 0. Used as a trace field so log
/// lines from different threads can be told apart cheaply.
pub(crate) fn thread_ordinal() -> usize {
    THREAD_ORDINAL.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_is_stable_within_a_thread() {
        assert_eq!(thread_ordinal(), thread_ordinal());
    }

    #[test]
    fn ordinal_differs_across_threads() {
        let mine = thread_ordinal();
        let theirs = std::thread::spawn(thread_ordinal).join().unwrap();
        assert_ne!(mine, theirs);
    }
}
