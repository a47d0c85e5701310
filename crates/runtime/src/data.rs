//! DATA segment access for compiled BASIC programs.
//!
//! The compiler collects every DATA literal into one process-wide table of
//! tagged entries; READ advances a cursor through it and RESTORE rewinds.
//! The table itself lives in the generated program's data section and is
//! registered once from the prologue.
//!
//! # Safety Contract
//!
//! `basic_data_register` is called once, before any READ; the entry table
//! outlives the program. Generated programs are single-threaded.

use crate::string::StringDescriptor;
use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

/// Entry tags, fixed between emitter and runtime.
pub const DATA_INT: i64 = 0;
pub const DATA_DOUBLE: i64 = 1;
pub const DATA_STRING: i64 = 2;

/// One DATA literal. `payload` holds the integer value, the double's bit
/// pattern, or a pointer to a NUL-terminated UTF-8 literal, per `tag`.
#[repr(C)]
pub struct DataEntry {
    pub tag: i64,
    pub payload: i64,
}

static ENTRIES: AtomicPtr<DataEntry> = AtomicPtr::new(ptr::null_mut());
static COUNT: AtomicI64 = AtomicI64::new(0);
static CURSOR: AtomicI64 = AtomicI64::new(0);

/// Register the program's DATA table.
///
/// # Safety
/// `entries` must point to `count` entries that stay alive for the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn basic_data_register(entries: *const DataEntry, count: i64) {
    ENTRIES.store(entries as *mut DataEntry, Ordering::SeqCst);
    COUNT.store(count.max(0), Ordering::SeqCst);
    CURSOR.store(0, Ordering::SeqCst);
}

/// `RESTORE [index]`: rewind the cursor (0 rewinds to the start).
#[unsafe(no_mangle)]
pub extern "C" fn basic_data_restore(index: i64) {
    CURSOR.store(index.clamp(0, COUNT.load(Ordering::SeqCst)), Ordering::SeqCst);
}

fn next_entry() -> &'static DataEntry {
    let cursor = CURSOR.fetch_add(1, Ordering::SeqCst);
    if cursor >= COUNT.load(Ordering::SeqCst) {
        crate::io::write_stderr("runtime error: READ past the end of DATA\n");
        std::process::exit(1);
    }
    let base = ENTRIES.load(Ordering::SeqCst);
    unsafe { &*base.add(cursor as usize) }
}

fn entry_as_double(e: &DataEntry) -> f64 {
    match e.tag {
        DATA_INT => e.payload as f64,
        DATA_DOUBLE => f64::from_bits(e.payload as u64),
        _ => {
            crate::io::write_stderr("runtime error: READ of a string DATA item into a number\n");
            std::process::exit(1);
        }
    }
}

/// `READ n`: next entry as an integer, converting doubles by truncation.
#[unsafe(no_mangle)]
pub extern "C" fn basic_data_read_int() -> i64 {
    let e = next_entry();
    match e.tag {
        DATA_INT => e.payload,
        _ => entry_as_double(e) as i64,
    }
}

/// `READ x#`: next entry as a double.
#[unsafe(no_mangle)]
pub extern "C" fn basic_data_read_double() -> f64 {
    entry_as_double(next_entry())
}

/// `READ s$`: next entry as a fresh string descriptor. Numeric entries read
/// into a string render as their printed form.
#[unsafe(no_mangle)]
pub extern "C" fn basic_data_read_string() -> *mut StringDescriptor {
    let e = next_entry();
    match e.tag {
        DATA_STRING => unsafe { crate::string::string_new_utf8(e.payload as *const c_char) },
        DATA_INT => crate::string::string_from_int(e.payload),
        _ => crate::string::string_from_double(f64::from_bits(e.payload as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn read_and_restore_cycle() {
        let hello = b"hello\0";
        let entries = [
            DataEntry { tag: DATA_INT, payload: 7 },
            DataEntry {
                tag: DATA_DOUBLE,
                payload: 2.5f64.to_bits() as i64,
            },
            DataEntry {
                tag: DATA_STRING,
                payload: hello.as_ptr() as i64,
            },
        ];
        unsafe { basic_data_register(entries.as_ptr(), 3) };

        assert_eq!(basic_data_read_int(), 7);
        assert_eq!(basic_data_read_double(), 2.5);
        let s = basic_data_read_string();
        unsafe {
            assert_eq!((*s).to_rust_string(), "hello");
            crate::string::string_release(s);
        }

        basic_data_restore(1);
        assert_eq!(basic_data_read_int(), 2, "double datum truncates into int");
    }
}
