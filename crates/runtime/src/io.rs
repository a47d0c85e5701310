//! Terminal I/O for compiled BASIC programs.
//!
//! Output goes straight to fd 1 with `libc::write`, bypassing Rust's
//! buffered stdout: generated code mixes these calls with direct process
//! exit, and unflushed buffers would lose output.
//!
//! # Safety Contract
//!
//! Called ONLY by compiler-generated code. The emitter widens every integer
//! argument to 64 bits before calling [`basic_print_int`]; string arguments
//! are live descriptors.

use crate::string::{StringDescriptor, descriptor_from_str};
use std::io::{BufRead, Write};

pub(crate) fn write_stdout(s: &str) {
    unsafe {
        libc::write(1, s.as_ptr() as *const libc::c_void, s.len());
    }
}

pub(crate) fn write_stderr(s: &str) {
    unsafe {
        libc::write(2, s.as_ptr() as *const libc::c_void, s.len());
    }
}

/// Render a double the way BASIC's PRINT does: integral values print without
/// a fraction, everything else uses the shortest round-trip form.
pub fn format_double(value: f64) -> String {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Print a 64-bit integer.
#[unsafe(no_mangle)]
pub extern "C" fn basic_print_int(value: i64) {
    write_stdout(&value.to_string());
}

/// Print a double.
#[unsafe(no_mangle)]
pub extern "C" fn basic_print_double(value: f64) {
    write_stdout(&format_double(value));
}

/// Print a string descriptor's characters.
///
/// # Safety
/// `s` must be a live descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn basic_print_string(s: *const StringDescriptor) {
    if !s.is_null() {
        write_stdout(&unsafe { (*s).to_rust_string() });
    }
}

/// Print a newline.
#[unsafe(no_mangle)]
pub extern "C" fn basic_print_newline() {
    write_stdout("\n");
}

/// Print the column separator used by `PRINT a, b`.
#[unsafe(no_mangle)]
pub extern "C" fn basic_print_tab() {
    write_stdout("\t");
}

fn read_line() -> String {
    // stdout may hold a pending prompt written through Rust's buffered path.
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok();
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// `INPUT s$`: read one line into a fresh descriptor.
#[unsafe(no_mangle)]
pub extern "C" fn basic_input_string() -> *mut StringDescriptor {
    descriptor_from_str(&read_line())
}

/// `INPUT n`: read one line and parse an integer, 0 on garbage.
#[unsafe(no_mangle)]
pub extern "C" fn basic_input_int() -> i64 {
    let line = read_line();
    let t = line.trim();
    t.parse::<i64>()
        .unwrap_or_else(|_| t.parse::<f64>().map(|d| d as i64).unwrap_or(0))
}

/// `INPUT x#`: read one line and parse a double, 0.0 on garbage.
#[unsafe(no_mangle)]
pub extern "C" fn basic_input_double() -> f64 {
    read_line().trim().parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_with_integral_value_print_bare() {
        assert_eq!(format_double(55.0), "55");
        assert_eq!(format_double(-3.0), "-3");
        assert_eq!(format_double(0.5), "0.5");
    }

    #[test]
    fn huge_doubles_keep_float_form() {
        assert_eq!(format_double(1e20), "100000000000000000000");
        assert_eq!(format_double(f64::NAN), "NaN");
    }
}
