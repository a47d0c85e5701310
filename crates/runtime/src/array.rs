//! Array descriptors for compiled BASIC programs.
//!
//! A `BasicArray` owns its payload and knows its own bounds and strides; all
//! bounds checks live here, not in generated code. Elements are stored
//! row-major and zero-initialized (BASIC semantics: numeric elements start at
//! zero, string elements start null).
//!
//! # Safety Contract
//!
//! Called ONLY by compiler-generated code. The compiler guarantees that
//! every `BasicArray*` was produced by [`array_new`] and not yet erased, and
//! that the index buffer passed to [`array_get_address`] holds exactly
//! `rank` values.

use crate::string::StringDescriptor;
use std::alloc::{self, Layout};

/// Maximum number of dimensions a BASIC array may declare.
pub const MAX_RANK: usize = 8;

/// Element kind tags, fixed between emitter and runtime.
pub const KIND_I8: i64 = 0;
pub const KIND_U8: i64 = 1;
pub const KIND_I16: i64 = 2;
pub const KIND_U16: i64 = 3;
pub const KIND_I32: i64 = 4;
pub const KIND_U32: i64 = 5;
pub const KIND_I64: i64 = 6;
pub const KIND_U64: i64 = 7;
pub const KIND_F32: i64 = 8;
pub const KIND_F64: i64 = 9;
/// String descriptor pointer (participates in refcounting on erase).
pub const KIND_STR: i64 = 10;

fn elem_size(kind: i64) -> usize {
    match kind {
        KIND_I8 | KIND_U8 => 1,
        KIND_I16 | KIND_U16 => 2,
        KIND_I32 | KIND_U32 | KIND_F32 => 4,
        _ => 8,
    }
}

/// Runtime array header. `extents[i]` is the number of valid indices in
/// dimension `i` (a BASIC `DIM a(10)` declares indices 0..=10, extent 11).
#[repr(C)]
pub struct BasicArray {
    data: *mut u8,
    rank: i64,
    kind: i64,
    total: i64,
    extents: [i64; MAX_RANK],
}

impl BasicArray {
    pub fn rank(&self) -> i64 {
        self.rank
    }

    pub fn kind(&self) -> i64 {
        self.kind
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}

fn payload_layout(total: i64, kind: i64) -> Layout {
    Layout::array::<u8>((total.max(1) as usize) * elem_size(kind)).expect("array payload layout")
}

unsafe fn alloc_payload(total: i64, kind: i64) -> *mut u8 {
    let layout = payload_layout(total, kind);
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        alloc::handle_alloc_error(layout);
    }
    ptr
}

unsafe fn free_payload(ptr: *mut u8, total: i64, kind: i64) {
    unsafe { alloc::dealloc(ptr, payload_layout(total, kind)) };
}

fn extents_from_bounds(rank: i64, dims: *const i64) -> ([i64; MAX_RANK], i64) {
    assert!(
        (1..=MAX_RANK as i64).contains(&rank),
        "array rank {} out of range",
        rank
    );
    let mut extents = [0i64; MAX_RANK];
    let mut total: i64 = 1;
    for i in 0..rank as usize {
        let upper = unsafe { *dims.add(i) };
        // A runtime-computed bound can be negative, and a multi-dimensional
        // extent product can overflow; both get the controlled trap.
        if upper < 0 {
            unsafe { basic_bounds_error(0, i as i64, upper) };
        }
        extents[i] = upper + 1;
        total = match total.checked_mul(extents[i]) {
            Some(t) => t,
            None => unsafe { basic_bounds_error(0, i as i64, extents[i]) },
        };
    }
    (extents, total)
}

/// Allocate an array. `dims` holds `rank` inclusive upper bounds.
///
/// # Safety
/// `dims` must point to `rank` readable values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn array_new(rank: i64, dims: *const i64, kind: i64) -> *mut BasicArray {
    let (extents, total) = extents_from_bounds(rank, dims);
    let data = unsafe { alloc_payload(total, kind) };
    Box::into_raw(Box::new(BasicArray {
        data,
        rank,
        kind,
        total,
        extents,
    }))
}

/// Compute the address of element `a(idx[0], idx[1], …)`, trapping on any
/// out-of-range index.
///
/// # Safety
/// `a` must be a live array; `idx` must point to `rank` readable values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn array_get_address(
    a: *const BasicArray,
    idx: *const i64,
) -> *mut std::ffi::c_void {
    let arr = unsafe { &*a };
    let mut offset: i64 = 0;
    for dim in 0..arr.rank as usize {
        let i = unsafe { *idx.add(dim) };
        if i < 0 || i >= arr.extents[dim] {
            unsafe { basic_bounds_error(0, dim as i64, i) };
        }
        offset = offset * arr.extents[dim] + i;
    }
    unsafe { arr.data.add(offset as usize * elem_size(arr.kind)) as *mut std::ffi::c_void }
}

/// Release any string elements still owned by the payload.
unsafe fn release_string_elements(arr: &BasicArray) {
    if arr.kind != KIND_STR {
        return;
    }
    let slots = arr.data as *mut *mut StringDescriptor;
    for i in 0..arr.total as usize {
        let s = unsafe { *slots.add(i) };
        if !s.is_null() {
            unsafe { crate::string::string_release(s) };
        }
    }
}

/// `REDIM a(dims…)`: reallocate with new bounds, discarding the contents.
///
/// # Safety
/// `a` must be a live array; `dims` must point to `rank` readable values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn array_redim(a: *mut BasicArray, rank: i64, dims: *const i64) {
    let arr = unsafe { &mut *a };
    let (extents, total) = extents_from_bounds(rank, dims);
    unsafe {
        release_string_elements(arr);
        free_payload(arr.data, arr.total, arr.kind);
        arr.data = alloc_payload(total, arr.kind);
    }
    arr.rank = rank;
    arr.total = total;
    arr.extents = extents;
}

/// `REDIM PRESERVE a(dims…)`: reallocate, copying elements whose indices are
/// valid under both the old and new bounds.
///
/// # Safety
/// As [`array_redim`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn array_redim_preserve(a: *mut BasicArray, rank: i64, dims: *const i64) {
    let arr = unsafe { &mut *a };
    assert_eq!(
        rank, arr.rank,
        "REDIM PRESERVE cannot change the rank of an array"
    );
    let (extents, total) = extents_from_bounds(rank, dims);
    let size = elem_size(arr.kind);
    let new_data = unsafe { alloc_payload(total, arr.kind) };

    // Walk every old element; copy the ones still addressable.
    let mut idx = [0i64; MAX_RANK];
    'outer: for old_off in 0..arr.total {
        // Decompose old_off into per-dimension indices (row-major).
        let mut rem = old_off;
        for dim in (0..arr.rank as usize).rev() {
            idx[dim] = rem % arr.extents[dim];
            rem /= arr.extents[dim];
        }
        let mut new_off: i64 = 0;
        for dim in 0..arr.rank as usize {
            if idx[dim] >= extents[dim] {
                continue 'outer;
            }
            new_off = new_off * extents[dim] + idx[dim];
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                arr.data.add(old_off as usize * size),
                new_data.add(new_off as usize * size),
                size,
            );
        }
        if arr.kind == KIND_STR {
            // Ownership of the descriptor moved to the new payload; null the
            // old slot so the free below does not release it.
            unsafe {
                *(arr.data.add(old_off as usize * size) as *mut *mut StringDescriptor) =
                    std::ptr::null_mut();
            }
        }
    }

    unsafe {
        release_string_elements(arr);
        free_payload(arr.data, arr.total, arr.kind);
    }
    arr.data = new_data;
    arr.total = total;
    arr.extents = extents;
}

/// `ERASE a`: release string elements, free the payload and the descriptor.
///
/// # Safety
/// `a` must be a live array; the pointer is dead after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn array_erase(a: *mut BasicArray) {
    if a.is_null() {
        return;
    }
    let arr = unsafe { &*a };
    unsafe {
        release_string_elements(arr);
        free_payload(arr.data, arr.total, arr.kind);
        drop(Box::from_raw(a));
    }
}

/// Report an out-of-range array access and terminate.
///
/// `line` is zero when the trap comes from the runtime's own check rather
/// than from generated code that knows its source position.
///
/// # Safety
/// Does not return.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn basic_bounds_error(line: i64, dim: i64, value: i64) -> ! {
    let msg = if line > 0 {
        format!(
            "runtime error: line {}: array index {} out of range in dimension {}\n",
            line, value, dim
        )
    } else {
        format!(
            "runtime error: array index {} out of range in dimension {}\n",
            value, dim
        )
    };
    crate::io::write_stderr(&msg);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_array_is_zeroed() {
        let dims = [4i64];
        unsafe {
            let a = array_new(1, dims.as_ptr(), KIND_I64);
            assert_eq!((*a).total(), 5);
            for i in 0..5i64 {
                let p = array_get_address(a, [i].as_ptr()) as *const i64;
                assert_eq!(*p, 0);
            }
            array_erase(a);
        }
    }

    #[test]
    fn row_major_addressing() {
        let dims = [2i64, 3i64];
        unsafe {
            let a = array_new(2, dims.as_ptr(), KIND_I32);
            // a(1, 2) = 7
            let p = array_get_address(a, [1i64, 2i64].as_ptr()) as *mut i32;
            *p = 7;
            let q = array_get_address(a, [1i64, 2i64].as_ptr()) as *const i32;
            assert_eq!(*q, 7);
            // Distinct elements get distinct addresses.
            let r = array_get_address(a, [0i64, 2i64].as_ptr());
            assert_ne!(r as usize, q as usize);
            array_erase(a);
        }
    }

    #[test]
    fn redim_discards_and_resizes() {
        let dims = [3i64];
        unsafe {
            let a = array_new(1, dims.as_ptr(), KIND_I64);
            let p = array_get_address(a, [2i64].as_ptr()) as *mut i64;
            *p = 42;
            let bigger = [9i64];
            array_redim(a, 1, bigger.as_ptr());
            assert_eq!((*a).total(), 10);
            let q = array_get_address(a, [2i64].as_ptr()) as *const i64;
            assert_eq!(*q, 0, "REDIM clears contents");
            array_erase(a);
        }
    }

    #[test]
    fn redim_preserve_keeps_overlap() {
        let dims = [3i64];
        unsafe {
            let a = array_new(1, dims.as_ptr(), KIND_I64);
            for i in 0..4i64 {
                let p = array_get_address(a, [i].as_ptr()) as *mut i64;
                *p = i * 10;
            }
            array_redim_preserve(a, 1, [1i64].as_ptr());
            assert_eq!((*a).total(), 2);
            for i in 0..2i64 {
                let p = array_get_address(a, [i].as_ptr()) as *const i64;
                assert_eq!(*p, i * 10);
            }
            array_erase(a);
        }
    }

    #[test]
    fn string_elements_released_on_erase() {
        use crate::string::{descriptor_from_str, string_retain};
        let dims = [1i64];
        unsafe {
            let a = array_new(1, dims.as_ptr(), KIND_STR);
            let s = descriptor_from_str("kept");
            string_retain(s); // our own handle survives the erase
            let p = array_get_address(a, [0i64].as_ptr()) as *mut *mut StringDescriptor;
            *p = s;
            array_erase(a);
            assert_eq!((*s).refcount(), 1);
            crate::string::string_release(s);
        }
    }
}
