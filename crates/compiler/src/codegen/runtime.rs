//! Runtime helper signatures, in one data-driven table.
//!
//! The external backend needs no declarations for calls, but the emitter
//! does: every runtime call it generates is checked against this table so
//! argument classes cannot drift from the ABI the runtime crate exports.
//! One entry per §6.2 helper, plus the libm functions the lowering rules
//! lean on.

use crate::types::ValueClass;
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone)]
pub struct RuntimeFn {
    pub name: &'static str,
    pub args: &'static [ValueClass],
    pub ret: Option<ValueClass>,
    /// Category comment for the generated IL header.
    pub category: Option<&'static str>,
}

const P: ValueClass = ValueClass::Ptr;
const L: ValueClass = ValueClass::L64;
const D: ValueClass = ValueClass::D64;

pub static RUNTIME_FUNCTIONS: LazyLock<Vec<RuntimeFn>> = LazyLock::new(|| {
    vec![
        // Strings
        RuntimeFn { name: "string_new_utf8", args: &[P], ret: Some(P), category: Some("strings") },
        RuntimeFn { name: "string_retain", args: &[P], ret: Some(P), category: None },
        RuntimeFn { name: "string_release", args: &[P], ret: None, category: None },
        RuntimeFn { name: "string_clone", args: &[P], ret: Some(P), category: None },
        RuntimeFn { name: "string_concat", args: &[P, P], ret: Some(P), category: None },
        RuntimeFn { name: "string_compare", args: &[P, P], ret: Some(L), category: None },
        RuntimeFn { name: "string_len", args: &[P], ret: Some(L), category: None },
        RuntimeFn { name: "string_chr", args: &[L], ret: Some(P), category: None },
        RuntimeFn { name: "string_asc", args: &[P], ret: Some(L), category: None },
        RuntimeFn { name: "string_from_int", args: &[L], ret: Some(P), category: None },
        RuntimeFn { name: "string_from_double", args: &[D], ret: Some(P), category: None },
        RuntimeFn { name: "string_to_double", args: &[P], ret: Some(D), category: None },
        RuntimeFn { name: "string_slice_assign", args: &[P, L, L, P], ret: Some(P), category: None },
        RuntimeFn { name: "string_mid_assign", args: &[P, L, L, P], ret: Some(P), category: None },
        // Arrays
        RuntimeFn { name: "array_new", args: &[L, P, L], ret: Some(P), category: Some("arrays") },
        RuntimeFn { name: "array_get_address", args: &[P, P], ret: Some(P), category: None },
        RuntimeFn { name: "array_redim", args: &[P, L, P], ret: None, category: None },
        RuntimeFn { name: "array_redim_preserve", args: &[P, L, P], ret: None, category: None },
        RuntimeFn { name: "array_erase", args: &[P], ret: None, category: None },
        RuntimeFn { name: "basic_bounds_error", args: &[L, L, L], ret: None, category: None },
        // Globals
        RuntimeFn { name: "basic_global_init", args: &[L], ret: None, category: Some("globals") },
        RuntimeFn { name: "basic_global_base", args: &[], ret: Some(P), category: None },
        RuntimeFn { name: "basic_global_cleanup", args: &[], ret: None, category: None },
        // Terminal I/O
        RuntimeFn { name: "basic_print_int", args: &[L], ret: None, category: Some("io") },
        RuntimeFn { name: "basic_print_double", args: &[D], ret: None, category: None },
        RuntimeFn { name: "basic_print_string", args: &[P], ret: None, category: None },
        RuntimeFn { name: "basic_print_newline", args: &[], ret: None, category: None },
        RuntimeFn { name: "basic_print_tab", args: &[], ret: None, category: None },
        RuntimeFn { name: "basic_input_string", args: &[], ret: Some(P), category: None },
        RuntimeFn { name: "basic_input_int", args: &[], ret: Some(L), category: None },
        RuntimeFn { name: "basic_input_double", args: &[], ret: Some(D), category: None },
        // DATA segment
        RuntimeFn { name: "basic_data_register", args: &[P, L], ret: None, category: Some("data") },
        RuntimeFn { name: "basic_data_restore", args: &[L], ret: None, category: None },
        RuntimeFn { name: "basic_data_read_int", args: &[], ret: Some(L), category: None },
        RuntimeFn { name: "basic_data_read_double", args: &[], ret: Some(D), category: None },
        RuntimeFn { name: "basic_data_read_string", args: &[], ret: Some(P), category: None },
        // Process lifecycle
        RuntimeFn { name: "basic_runtime_init", args: &[], ret: None, category: Some("process") },
        RuntimeFn { name: "basic_runtime_cleanup", args: &[], ret: None, category: None },
        RuntimeFn { name: "basic_end", args: &[L], ret: None, category: None },
        // Exceptions
        RuntimeFn { name: "basic_throw", args: &[L], ret: None, category: Some("exceptions") },
        RuntimeFn { name: "basic_try_enter", args: &[P], ret: None, category: None },
        RuntimeFn { name: "basic_try_leave", args: &[], ret: None, category: None },
        // libm (linked by the C toolchain)
        RuntimeFn { name: "pow", args: &[D, D], ret: Some(D), category: Some("libm") },
        RuntimeFn { name: "fabs", args: &[D], ret: Some(D), category: None },
        RuntimeFn { name: "floor", args: &[D], ret: Some(D), category: None },
        RuntimeFn { name: "trunc", args: &[D], ret: Some(D), category: None },
    ]
});

/// Signature lookup by name.
pub static RUNTIME_BY_NAME: LazyLock<HashMap<&'static str, &'static RuntimeFn>> =
    LazyLock::new(|| RUNTIME_FUNCTIONS.iter().map(|f| (f.name, f)).collect());

/// Panic-free signature fetch; an unknown name is a compiler bug.
pub fn runtime_fn(name: &str) -> &'static RuntimeFn {
    RUNTIME_BY_NAME
        .get(name)
        .unwrap_or_else(|| panic!("unknown runtime helper {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_unique_and_complete() {
        assert_eq!(RUNTIME_BY_NAME.len(), RUNTIME_FUNCTIONS.len(), "duplicate names");
        // The §6.2 surface is all present.
        for name in [
            "string_new_utf8",
            "string_retain",
            "string_release",
            "string_clone",
            "string_mid_assign",
            "string_slice_assign",
            "array_new",
            "array_get_address",
            "array_redim",
            "array_redim_preserve",
            "array_erase",
            "basic_global_init",
            "basic_global_base",
            "basic_global_cleanup",
            "basic_print_int",
            "basic_print_double",
            "basic_print_string",
            "basic_print_newline",
            "basic_data_read_int",
            "basic_data_read_double",
            "basic_data_read_string",
            "basic_runtime_init",
            "basic_runtime_cleanup",
            "basic_end",
            "basic_throw",
            "basic_try_enter",
            "basic_try_leave",
        ] {
            assert!(RUNTIME_BY_NAME.contains_key(name), "missing {}", name);
        }
    }

    #[test]
    fn print_int_takes_a_64_bit_value() {
        let f = runtime_fn("basic_print_int");
        assert_eq!(f.args, &[ValueClass::L64]);
        assert!(f.ret.is_none());
    }
}
