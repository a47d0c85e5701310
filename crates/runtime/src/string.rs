//! Reference-counted string descriptors for compiled BASIC programs.
//!
//! Strings are UTF-32 internally with an ASCII fast path: a descriptor whose
//! `encoding` field is [`ENC_ASCII`] stores one byte per character, one whose
//! encoding is [`ENC_UTF32`] stores one `u32` per character. All operations
//! branch on the discriminator internally; there is exactly one descriptor
//! type on the ABI.
//!
//! # Safety Contract
//!
//! These functions are called ONLY by compiler-generated code. The compiler
//! guarantees:
//!
//! - Every descriptor pointer passed in was produced by this module and has
//!   not been released to a refcount of zero.
//! - `string_retain`/`string_release` calls are balanced: each live variable
//!   owns exactly one reference to the descriptor it names.
//! - Slice and MID$ assignment go through the copy-on-write entry points
//!   below; generated code never mutates a descriptor's payload directly.

use std::alloc::{self, Layout};
use std::ffi::CStr;
use std::os::raw::c_char;

/// Character data stored one byte per char.
pub const ENC_ASCII: i64 = 0;
/// Character data stored one `u32` code point per char.
pub const ENC_UTF32: i64 = 1;

/// Runtime string header. Field order is ABI: generated code and the
/// compiler's IL both assume `{ data*, length, capacity, refcount, encoding }`.
#[repr(C)]
pub struct StringDescriptor {
    data: *mut u8,
    length: i64,
    capacity: i64,
    refcount: i64,
    encoding: i64,
}

fn elem_size(encoding: i64) -> usize {
    if encoding == ENC_ASCII { 1 } else { 4 }
}

fn buffer_layout(capacity: i64, encoding: i64) -> Layout {
    // A zero-char string still gets a one-element buffer so `data` is never
    // dangling.
    let chars = capacity.max(1) as usize;
    Layout::array::<u8>(chars * elem_size(encoding)).expect("string buffer layout")
}

unsafe fn alloc_buffer(capacity: i64, encoding: i64) -> *mut u8 {
    let layout = buffer_layout(capacity, encoding);
    let ptr = unsafe { alloc::alloc(layout) };
    if ptr.is_null() {
        alloc::handle_alloc_error(layout);
    }
    ptr
}

unsafe fn free_buffer(ptr: *mut u8, capacity: i64, encoding: i64) {
    unsafe { alloc::dealloc(ptr, buffer_layout(capacity, encoding)) };
}

/// Allocate a descriptor with an uninitialized payload of `length` chars.
fn new_descriptor(length: i64, encoding: i64) -> *mut StringDescriptor {
    let data = unsafe { alloc_buffer(length, encoding) };
    Box::into_raw(Box::new(StringDescriptor {
        data,
        length,
        capacity: length,
        refcount: 1,
        encoding,
    }))
}

impl StringDescriptor {
    /// Read the code point at `idx` (0-based, in range).
    unsafe fn char_at(&self, idx: i64) -> u32 {
        unsafe {
            if self.encoding == ENC_ASCII {
                *self.data.offset(idx as isize) as u32
            } else {
                *(self.data as *const u32).offset(idx as isize)
            }
        }
    }

    /// Write the code point at `idx`. The caller has checked that the code
    /// point fits this descriptor's encoding.
    unsafe fn set_char(&mut self, idx: i64, cp: u32) {
        unsafe {
            if self.encoding == ENC_ASCII {
                *self.data.offset(idx as isize) = cp as u8;
            } else {
                *(self.data as *mut u32).offset(idx as isize) = cp;
            }
        }
    }

    pub fn len(&self) -> i64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn refcount(&self) -> i64 {
        self.refcount
    }

    pub fn encoding(&self) -> i64 {
        self.encoding
    }

    /// Collect the code points into an owned Rust `String` (for I/O).
    pub fn to_rust_string(&self) -> String {
        let mut out = String::with_capacity(self.length as usize);
        for i in 0..self.length {
            let cp = unsafe { self.char_at(i) };
            out.push(char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
        out
    }
}

/// Build a descriptor from borrowed code points, choosing the narrowest
/// encoding that holds them all.
fn from_code_points(points: &[u32]) -> *mut StringDescriptor {
    let ascii = points.iter().all(|&cp| cp < 128);
    let encoding = if ascii { ENC_ASCII } else { ENC_UTF32 };
    let desc = new_descriptor(points.len() as i64, encoding);
    let d = unsafe { &mut *desc };
    for (i, &cp) in points.iter().enumerate() {
        unsafe { d.set_char(i as i64, cp) };
    }
    desc
}

fn collect_code_points(desc: &StringDescriptor) -> Vec<u32> {
    (0..desc.length)
        .map(|i| unsafe { desc.char_at(i) })
        .collect()
}

/// Create a descriptor from a Rust string slice. Used by the runtime itself
/// (READ, INPUT, STR$) as well as tests.
pub fn descriptor_from_str(s: &str) -> *mut StringDescriptor {
    let points: Vec<u32> = s.chars().map(|c| c as u32).collect();
    from_code_points(&points)
}

/// Create a string descriptor from a NUL-terminated UTF-8 literal.
///
/// Called once per string literal reference in generated code; the literal
/// bytes live in the program's data section.
///
/// # Safety
/// `bytes` must point to a valid NUL-terminated UTF-8 sequence.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_new_utf8(bytes: *const c_char) -> *mut StringDescriptor {
    assert!(!bytes.is_null(), "string_new_utf8: null literal pointer");
    let cstr = unsafe { CStr::from_ptr(bytes) };
    let s = cstr.to_str().unwrap_or("");
    descriptor_from_str(s)
}

/// Increment the reference count and return the same descriptor.
///
/// # Safety
/// `s` must be a live descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_retain(s: *mut StringDescriptor) -> *mut StringDescriptor {
    if !s.is_null() {
        unsafe { (*s).refcount += 1 };
    }
    s
}

/// Decrement the reference count, freeing the payload and descriptor when it
/// reaches zero. Null is tolerated so generated code can release
/// never-assigned variables on scope exit.
///
/// # Safety
/// `s` must be null or a live descriptor owned by the caller.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_release(s: *mut StringDescriptor) {
    if s.is_null() {
        return;
    }
    let desc = unsafe { &mut *s };
    desc.refcount -= 1;
    if desc.refcount == 0 {
        unsafe {
            free_buffer(desc.data, desc.capacity, desc.encoding);
            drop(Box::from_raw(s));
        }
    }
}

/// Deep-copy a descriptor. The copy starts with a refcount of one.
///
/// # Safety
/// `s` must be a live descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_clone(s: *const StringDescriptor) -> *mut StringDescriptor {
    let src = unsafe { &*s };
    let desc = new_descriptor(src.length, src.encoding);
    let dst = unsafe { &mut *desc };
    for i in 0..src.length {
        unsafe {
            let cp = src.char_at(i);
            dst.set_char(i, cp);
        }
    }
    desc
}

/// Copy-on-write guard: returns `s` itself when the caller is the only
/// owner, otherwise transfers the caller's reference to a private clone.
unsafe fn make_unique(s: *mut StringDescriptor) -> *mut StringDescriptor {
    let desc = unsafe { &mut *s };
    if desc.refcount <= 1 {
        return s;
    }
    // Shared: the clone takes over this caller's reference.
    desc.refcount -= 1;
    unsafe { string_clone(s) }
}

/// Slice assignment `s(lo TO hi) = repl` with copy-on-write.
///
/// Positions are 1-based and inclusive; the range is replaced by the whole
/// replacement, resizing the string when the lengths differ. Returns the
/// descriptor the variable must now hold (a clone when `s` was shared).
///
/// # Safety
/// `s` and `repl` must be live descriptors; the caller stores the returned
/// pointer back into the variable that held `s`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_slice_assign(
    s: *mut StringDescriptor,
    lo: i64,
    hi: i64,
    repl: *const StringDescriptor,
) -> *mut StringDescriptor {
    let src = unsafe { &*s };
    let lo = lo.clamp(1, src.length + 1);
    let hi = hi.clamp(lo - 1, src.length);

    let mut points = collect_code_points(src);
    let repl_points = collect_code_points(unsafe { &*repl });
    points.splice((lo - 1) as usize..hi as usize, repl_points);

    // Splicing resizes, so the unique descriptor is rebuilt rather than
    // mutated in place. The COW contract is the same: the caller's reference
    // moves to the result, and other owners keep the original payload.
    let unique = unsafe { make_unique(s) };
    unsafe { string_release(unique) };
    from_code_points(&points)
}

/// `MID$(s, pos, len) = repl`: overwrite up to `len` characters starting at
/// 1-based `pos` without resizing, with copy-on-write.
///
/// # Safety
/// As [`string_slice_assign`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_mid_assign(
    s: *mut StringDescriptor,
    pos: i64,
    len: i64,
    repl: *const StringDescriptor,
) -> *mut StringDescriptor {
    let repl_desc = unsafe { &*repl };
    let target = unsafe { make_unique(s) };
    let desc = unsafe { &mut *target };

    // A wide replacement character forces the whole payload to UTF-32.
    let needs_wide = desc.encoding == ENC_ASCII
        && (0..repl_desc.length).any(|i| unsafe { repl_desc.char_at(i) } >= 128);
    if needs_wide {
        let points = collect_code_points(desc);
        unsafe { free_buffer(desc.data, desc.capacity, desc.encoding) };
        desc.encoding = ENC_UTF32;
        desc.capacity = desc.length;
        desc.data = unsafe { alloc_buffer(desc.capacity, ENC_UTF32) };
        for (i, &cp) in points.iter().enumerate() {
            unsafe { desc.set_char(i as i64, cp) };
        }
    }

    let start = pos - 1;
    let count = len.min(repl_desc.length).min(desc.length - start).max(0);
    for i in 0..count {
        unsafe {
            let cp = repl_desc.char_at(i);
            desc.set_char(start + i, cp);
        }
    }
    target
}

/// Concatenate two strings into a fresh descriptor. ASCII + ASCII stays
/// ASCII; any wide operand widens the result.
///
/// # Safety
/// Both operands must be live descriptors.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_concat(
    a: *const StringDescriptor,
    b: *const StringDescriptor,
) -> *mut StringDescriptor {
    let mut points = collect_code_points(unsafe { &*a });
    points.extend(collect_code_points(unsafe { &*b }));
    from_code_points(&points)
}

/// Three-way code-point comparison: negative, zero, or positive.
///
/// # Safety
/// Both operands must be live descriptors.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_compare(
    a: *const StringDescriptor,
    b: *const StringDescriptor,
) -> i64 {
    let pa = collect_code_points(unsafe { &*a });
    let pb = collect_code_points(unsafe { &*b });
    match pa.cmp(&pb) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// `LEN(s)` in characters.
///
/// # Safety
/// `s` must be a live descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_len(s: *const StringDescriptor) -> i64 {
    unsafe { (*s).length }
}

/// `CHR$(code)`: a one-character string.
#[unsafe(no_mangle)]
pub extern "C" fn string_chr(code: i64) -> *mut StringDescriptor {
    let cp = u32::try_from(code).ok().filter(|&c| char::from_u32(c).is_some());
    from_code_points(&[cp.unwrap_or(char::REPLACEMENT_CHARACTER as u32)])
}

/// `ASC(s)`: code point of the first character, 0 for the empty string.
///
/// # Safety
/// `s` must be a live descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_asc(s: *const StringDescriptor) -> i64 {
    let desc = unsafe { &*s };
    if desc.length == 0 {
        0
    } else {
        unsafe { desc.char_at(0) as i64 }
    }
}

/// `STR$(n)` for integers.
#[unsafe(no_mangle)]
pub extern "C" fn string_from_int(value: i64) -> *mut StringDescriptor {
    descriptor_from_str(&value.to_string())
}

/// `STR$(x)` for floating point values.
#[unsafe(no_mangle)]
pub extern "C" fn string_from_double(value: f64) -> *mut StringDescriptor {
    descriptor_from_str(&crate::io::format_double(value))
}

/// `VAL(s)`: parse a leading numeric prefix, 0.0 when none.
///
/// # Safety
/// `s` must be a live descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn string_to_double(s: *const StringDescriptor) -> f64 {
    let text = unsafe { (*s).to_rust_string() };
    let trimmed = text.trim_start();
    // Longest prefix that parses as a float.
    let mut end = 0;
    for i in (1..=trimmed.len()).rev() {
        if trimmed.is_char_boundary(i) && trimmed[..i].parse::<f64>().is_ok() {
            end = i;
            break;
        }
    }
    trimmed[..end].parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn release(s: *mut StringDescriptor) {
        unsafe { string_release(s) };
    }

    #[test]
    fn ascii_literal_stays_narrow() {
        let s = descriptor_from_str("Hello World");
        unsafe {
            assert_eq!((*s).encoding(), ENC_ASCII);
            assert_eq!(string_len(s), 11);
            release(s);
        }
    }

    #[test]
    fn wide_literal_uses_utf32() {
        let s = descriptor_from_str("héllo");
        unsafe {
            assert_eq!((*s).encoding(), ENC_UTF32);
            assert_eq!(string_len(s), 5);
            release(s);
        }
    }

    #[test]
    fn retain_release_accounting() {
        let s = descriptor_from_str("x");
        unsafe {
            string_retain(s);
            assert_eq!((*s).refcount(), 2);
            release(s);
            assert_eq!((*s).refcount(), 1);
            release(s);
        }
    }

    #[test]
    fn slice_assign_clones_when_shared() {
        // text$ = "Hello World" : backup$ = text$ : text$(1 TO 5) = "BASIC"
        let text = descriptor_from_str("Hello World");
        let backup = unsafe { string_retain(text) };
        let repl = descriptor_from_str("BASIC");
        unsafe {
            let updated = string_slice_assign(text, 1, 5, repl);
            assert_eq!((*updated).to_rust_string(), "BASIC World");
            assert_eq!((*backup).to_rust_string(), "Hello World");
            assert_eq!((*backup).refcount(), 1);
            release(updated);
            release(backup);
            release(repl);
        }
    }

    #[test]
    fn slice_assign_resizes() {
        let s = descriptor_from_str("abcdef");
        let repl = descriptor_from_str("XY");
        unsafe {
            let out = string_slice_assign(s, 2, 5, repl);
            assert_eq!((*out).to_rust_string(), "aXYf");
            release(out);
            release(repl);
        }
    }

    #[test]
    fn mid_assign_overwrites_in_place() {
        let s = descriptor_from_str("Hello World");
        let repl = descriptor_from_str("BASIC");
        unsafe {
            let out = string_mid_assign(s, 7, 5, repl);
            assert_eq!(out, s, "unshared target is mutated in place");
            assert_eq!((*out).to_rust_string(), "Hello BASIC");
            release(out);
            release(repl);
        }
    }

    #[test]
    fn mid_assign_widens_for_wide_replacement() {
        let s = descriptor_from_str("abc");
        let repl = descriptor_from_str("é");
        unsafe {
            let out = string_mid_assign(s, 2, 1, repl);
            assert_eq!((*out).to_rust_string(), "aéc");
            assert_eq!((*out).encoding(), ENC_UTF32);
            release(out);
            release(repl);
        }
    }

    #[test]
    fn concat_mixed_widens() {
        let a = descriptor_from_str("na");
        let b = descriptor_from_str("ïve");
        unsafe {
            let out = string_concat(a, b);
            assert_eq!((*out).to_rust_string(), "naïve");
            assert_eq!((*out).encoding(), ENC_UTF32);
            release(out);
            release(a);
            release(b);
        }
    }

    #[test]
    fn compare_orders_by_code_point() {
        let a = descriptor_from_str("apple");
        let b = descriptor_from_str("apricot");
        unsafe {
            assert!(string_compare(a, b) < 0);
            assert_eq!(string_compare(a, a), 0);
            release(a);
            release(b);
        }
    }

    #[test]
    fn val_parses_leading_number() {
        let s = descriptor_from_str("  12.5abc");
        unsafe {
            assert_eq!(string_to_double(s), 12.5);
            release(s);
        }
        let none = descriptor_from_str("abc");
        unsafe {
            assert_eq!(string_to_double(none), 0.0);
            release(none);
        }
    }
}
