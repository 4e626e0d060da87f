//! Exception dispatch and compiled-frame unwinding
//!
//! A throw, explicit or from an inline check stub, puts the exception in
//! the carrier register and the faulting PC in the PC carrier, then enters
//! the generated trampoline, which parks the callee-saved registers and
//! calls [`handle_exception`]. The search maps the PC to its code object,
//! scans that method's dispatch table in source order, and either resumes at
//! a handler or unwinds one frame using the method header: synchronized
//! frames release their monitor, the frame's saved registers are folded into
//! the parked set, and the walk continues at the caller's return address.
//! The call-in stub carries a catch-all row, so every walk terminates there
//! at the latest.

use tracing::{debug, warn};

use super::object::ObjectHeader;
use super::Vm;
use crate::classfile::constant_pool::ClassRef;
use crate::jit::code::HeaderReader;
use crate::jit::target::x86_64::SAVED_ORDER;

/// Callee-saved registers parked by the trampoline, lowest address first,
/// with the exception object on top. Layout must match the trampoline's
/// push order.
#[repr(C)]
#[derive(Debug)]
pub struct SavedRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub xptr: u64,
}

impl SavedRegs {
    fn set(&mut self, reg: u8, value: u64) {
        match reg {
            r if r == SAVED_ORDER[0] => self.rbx = value,
            r if r == SAVED_ORDER[1] => self.rbp = value,
            r if r == SAVED_ORDER[2] => self.r12 = value,
            r if r == SAVED_ORDER[3] => self.r13 = value,
            r if r == SAVED_ORDER[4] => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

/// Where execution resumes: handler address and the stack pointer of its
/// frame. Returned in RAX:RDX.
#[repr(C)]
pub struct Resume {
    pub handler: usize,
    pub sp: usize,
}

/// Does the handler's catch type accept this exception?
///
/// A null class reference is a catch-all. Resolution failures are reported
/// and treated as a non-match.
fn catch_matches(vm: &Vm, cref: *const ClassRef, xptr: usize) -> bool {
    if cref.is_null() {
        return true;
    }
    let cref = unsafe { &*cref };
    let catch_class = match cref.get() {
        Some(c) => c.clone(),
        None => match vm.registry().resolve_class(&cref.name) {
            Ok(c) => {
                cref.install(c.clone());
                c
            }
            Err(e) => {
                warn!(class = %cref.name, error = %e, "catch type failed to resolve");
                return false;
            }
        },
    };
    let obj_class = unsafe { (*(xptr as *const ObjectHeader)).class() };
    obj_class.is_subtype_of(&catch_class)
}

/// Search one code object's dispatch table. Source order implements the
/// innermost-handler rule. Returns the handler's machine-code offset.
pub fn find_handler_in(vm: &Vm, entry: usize, off: u32, xptr: usize) -> Option<u32> {
    let header = HeaderReader::new(entry);
    for i in 0..header.ex_table_len() {
        let (start, end, handler, cref) = header.ex_entry(i);
        if off >= start && off < end && catch_matches(vm, cref, xptr) {
            return Some(handler);
        }
    }
    None
}

/// The dispatch core, called from the exception trampoline.
///
/// # Safety
/// `xpc` must lie inside published compiled code, `regs` must point at the
/// trampoline's parked register block, and `sp` must be the faulting
/// frame's stack pointer.
pub unsafe extern "C" fn handle_exception(
    xptr: usize,
    xpc: usize,
    regs: *mut SavedRegs,
    sp: usize,
) -> Resume {
    let vm = Vm::get();
    let regs = unsafe { &mut *regs };
    let mut xpc = xpc;
    let mut sp = sp;

    loop {
        let Some(code) = vm.code_map().lookup(xpc) else {
            // Unreachable by construction: the call-in stub's catch-all row
            // terminates every walk before leaving compiled code.
            eprintln!("exception pc {:#x} outside compiled code; aborting", xpc);
            std::process::abort();
        };
        let entry = code.entry_point();
        let off = (xpc - entry) as u32;

        if let Some(handler) = find_handler_in(vm, entry, off, xptr) {
            debug!(entry, off, handler, "exception handled");
            regs.xptr = xptr as u64;
            return Resume {
                handler: entry + handler as usize,
                sp,
            };
        }

        // No handler here: unwind one frame.
        let header = HeaderReader::new(entry);
        if let Some(sync_off) = header.sync_slot_offset() {
            let obj = unsafe { *((sp + sync_off as usize) as *const usize) };
            if obj != 0 {
                if let Some(t) = super::threads::ThreadList::try_current() {
                    let _ = super::monitor::exit(&t, obj as *mut ObjectHeader);
                }
            }
        }
        let frame_size = header.frame_size() as usize;
        for i in 0..header.int_saved_count() as usize {
            let addr = sp + frame_size - 8 * (i + 1);
            regs.set(SAVED_ORDER[i], unsafe { *(addr as *const u64) });
        }
        sp += frame_size;
        let ra = unsafe { *(sp as *const usize) };
        sp += 8;
        // Return addresses point after their call; step back inside it so
        // range checks land in the calling instruction's covering rows.
        xpc = ra - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_regs_layout() {
        // The trampoline stores r15 lowest; xptr rides on top.
        assert_eq!(std::mem::size_of::<SavedRegs>(), 56);
        let s = SavedRegs {
            r15: 1,
            r14: 2,
            r13: 3,
            r12: 4,
            rbp: 5,
            rbx: 6,
            xptr: 7,
        };
        let base = &s as *const _ as usize;
        let xptr_off = (&s.xptr as *const _ as usize) - base;
        assert_eq!(xptr_off, 48);
    }

    #[test]
    fn test_saved_regs_set_by_number() {
        let mut s = SavedRegs {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbp: 0,
            rbx: 0,
            xptr: 0,
        };
        s.set(SAVED_ORDER[0], 11); // rbx
        s.set(SAVED_ORDER[1], 22); // rbp
        s.set(SAVED_ORDER[5], 66); // r15
        assert_eq!(s.rbx, 11);
        assert_eq!(s.rbp, 22);
        assert_eq!(s.r15, 66);
    }
}
