//! Global variable storage for compiled BASIC programs.
//!
//! All module-level variables live in one runtime-allocated vector of 64-bit
//! slots. Generated code loads the base pointer once per basic block and
//! addresses slots with `slot * 8` pointer arithmetic; the runtime only
//! allocates and frees the vector.
//!
//! # Safety Contract
//!
//! `basic_global_init` is called exactly once by the generated program
//! prologue, before any access; `basic_global_cleanup` once from the
//! epilogue. Generated programs are single-threaded (no concurrent access).

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

static BASE: AtomicPtr<i64> = AtomicPtr::new(ptr::null_mut());
static COUNT: AtomicI64 = AtomicI64::new(0);

/// Allocate `count` zeroed 64-bit slots.
#[unsafe(no_mangle)]
pub extern "C" fn basic_global_init(count: i64) {
    let slots = vec![0i64; count.max(0) as usize].into_boxed_slice();
    let old = BASE.swap(Box::into_raw(slots) as *mut i64, Ordering::SeqCst);
    let old_count = COUNT.swap(count.max(0), Ordering::SeqCst);
    if !old.is_null() {
        // Re-init (only tests do this): drop the previous vector.
        unsafe { drop_slots(old, old_count.max(0) as usize) };
    }
}

/// Base pointer of the slot vector.
#[unsafe(no_mangle)]
pub extern "C" fn basic_global_base() -> *mut i64 {
    BASE.load(Ordering::SeqCst)
}

/// Free the slot vector.
#[unsafe(no_mangle)]
pub extern "C" fn basic_global_cleanup() {
    let old = BASE.swap(ptr::null_mut(), Ordering::SeqCst);
    let count = COUNT.swap(0, Ordering::SeqCst).max(0) as usize;
    if !old.is_null() {
        unsafe { drop_slots(old, count) };
    }
}

unsafe fn drop_slots(ptr: *mut i64, count: usize) {
    let slice = std::ptr::slice_from_raw_parts_mut(ptr, count);
    unsafe { drop(Box::from_raw(slice)) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn init_base_cleanup_cycle() {
        basic_global_init(4);
        let base = basic_global_base();
        assert!(!base.is_null());
        unsafe {
            *base.add(3) = 99;
            assert_eq!(*base.add(3), 99);
            assert_eq!(*base.add(0), 0, "slots start zeroed");
        }
        basic_global_cleanup();
        assert!(basic_global_base().is_null());
    }

    #[test]
    #[serial]
    fn zero_count_is_valid() {
        basic_global_init(0);
        basic_global_cleanup();
        assert!(basic_global_base().is_null());
    }
}
