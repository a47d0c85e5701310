//! Exception dispatch for compiled BASIC programs.
//!
//! THROW inside a TRY region never reaches this module: the compiler routes
//! it to the matching CATCH handler as a control-flow edge. What remains for
//! the runtime is the dynamic path: a THROW with no handler in its own
//! function. `basic_try_enter`/`basic_try_leave` keep a stack of the handler
//! tables currently active so the diagnostic can say whether a handler
//! existed in some calling frame; control cannot be transferred to it (the
//! generated code has no unwinder), so an uncaught THROW terminates the
//! process with the thrown code as its exit status.
//!
//! # Safety Contract
//!
//! Called ONLY by compiler-generated code. Enter/leave calls are balanced on
//! every path out of a TRY region (the compiler rewrites RETURN/EXIT to pass
//! through FINALLY and the matching leave).

use std::cell::RefCell;

/// Handler table for one TRY region. `codes` points at `count` integer codes;
/// `catch_all` is non-zero when a bare CATCH exists.
#[repr(C)]
pub struct HandlerTable {
    pub count: i64,
    pub codes: *const i64,
    pub catch_all: i64,
}

thread_local! {
    static ACTIVE: RefCell<Vec<*const HandlerTable>> = const { RefCell::new(Vec::new()) };
}

/// Enter a TRY region.
///
/// # Safety
/// `table` must stay alive until the matching [`basic_try_leave`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn basic_try_enter(table: *const HandlerTable) {
    ACTIVE.with(|s| s.borrow_mut().push(table));
}

/// Leave the innermost TRY region.
#[unsafe(no_mangle)]
pub extern "C" fn basic_try_leave() {
    ACTIVE.with(|s| {
        s.borrow_mut().pop();
    });
}

fn some_frame_would_catch(code: i64) -> bool {
    ACTIVE.with(|s| {
        s.borrow().iter().rev().any(|&t| {
            let table = unsafe { &*t };
            if table.catch_all != 0 {
                return true;
            }
            (0..table.count).any(|i| unsafe { *table.codes.add(i as usize) } == code)
        })
    })
}

/// Raise an exception with no handler in the current function.
///
/// Terminates the process with `code` as the exit status. When an enclosing
/// frame had a matching handler the diagnostic says so; transferring control
/// across frames is not supported.
#[unsafe(no_mangle)]
pub extern "C" fn basic_throw(code: i64) -> ! {
    if some_frame_would_catch(code) {
        crate::io::write_stderr(&format!(
            "runtime error: exception {} crossed a procedure boundary; \
             handlers only cover their own procedure\n",
            code
        ));
    } else {
        crate::io::write_stderr(&format!("runtime error: unhandled exception {}\n", code));
    }
    std::process::exit((code & 0xff) as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn handler_stack_matches_codes() {
        let codes = [5i64, 9i64];
        let table = HandlerTable {
            count: 2,
            codes: codes.as_ptr(),
            catch_all: 0,
        };
        unsafe { basic_try_enter(&table) };
        assert!(some_frame_would_catch(9));
        assert!(!some_frame_would_catch(4));
        basic_try_leave();
        assert!(!some_frame_would_catch(9));
    }

    #[test]
    #[serial]
    fn catch_all_matches_everything() {
        let table = HandlerTable {
            count: 0,
            codes: std::ptr::null(),
            catch_all: 1,
        };
        unsafe { basic_try_enter(&table) };
        assert!(some_frame_would_catch(12345));
        basic_try_leave();
    }
}
