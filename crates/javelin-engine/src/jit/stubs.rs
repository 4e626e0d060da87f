//! Stub factory
//!
//! Generated machine-code fragments gluing compiled code to the runtime:
//! the exception trampoline, the register-saving patcher wrapper, the
//! pending-exception rethrow stubs, the call-in stub that carries the
//! catch-all dispatch row terminating every unwind, per-method lazy-compile
//! stubs, and native-call stubs. All of them are [`Code`] objects from the
//! code heap.

use std::sync::Arc;

use crate::classfile::method::Method;
use crate::error::JitError;
use crate::jit::code::{Code, DispatchEntry};
use crate::jit::codemap::CodeMap;
use crate::jit::target::x86_64::asm::reg::*;
use crate::jit::target::CompiledMethod;
use crate::jit::target::x86_64::asm::{Alu, Asm};
use crate::runtime::threads::{CriticalSection, CriticalSections};

/// Addresses of the global stubs, plus ownership of their code objects.
pub struct Stubs {
    pub exception_trampoline: usize,
    pub patcher_wrapper: usize,
    pub rethrow_pending: usize,
    pub rethrow_pending_drop_ra: usize,
    pub vm_call: usize,
    keep: Vec<Arc<Code>>,
}

fn stub_method(code: Vec<u8>, dispatch: Vec<DispatchEntry>) -> CompiledMethod {
    CompiledMethod {
        code,
        dseg: Vec::new(),
        dseg_relocs: Vec::new(),
        dseg_block_addrs: Vec::new(),
        strings: Vec::new(),
        frame_size: 0,
        is_leaf: false,
        sync_slot_offset: None,
        int_saved_count: 0,
        float_saved_count: 0,
        dispatch,
        line_table: Vec::new(),
        patch_refs: Vec::new(),
        call_sites: Vec::new(),
        stack_maps: Vec::new(),
    }
}

fn install(code: Vec<u8>, dispatch: Vec<DispatchEntry>) -> Result<Arc<Code>, JitError> {
    Code::install(stub_method(code, dispatch), std::sync::Weak::new())
}

impl Stubs {
    /// Generate the global stubs. The call-in stub is registered in the
    /// code map so exception walks terminate at its catch-all row.
    pub fn generate(
        code_map: &CodeMap,
        handle_exception: usize,
        patcher_entry: usize,
        take_pending: usize,
        set_pending_uncaught: usize,
    ) -> Result<Stubs, JitError> {
        let mut keep = Vec::new();

        let trampoline_code = install(emit_trampoline(handle_exception), Vec::new())?;
        let exception_trampoline = trampoline_code.entry_point();
        keep.push(trampoline_code);

        let wrapper_code = install(emit_patcher_wrapper(patcher_entry), Vec::new())?;
        let patcher_wrapper = wrapper_code.entry_point();
        keep.push(wrapper_code);

        let rethrow_code = install(
            emit_rethrow(take_pending, exception_trampoline, false),
            Vec::new(),
        )?;
        let rethrow_pending = rethrow_code.entry_point();
        keep.push(rethrow_code);

        let rethrow_drop_code = install(
            emit_rethrow(take_pending, exception_trampoline, true),
            Vec::new(),
        )?;
        let rethrow_pending_drop_ra = rethrow_drop_code.entry_point();
        keep.push(rethrow_drop_code);

        let (vm_call_bytes, uncaught_off) = emit_vm_call(set_pending_uncaught);
        let len = vm_call_bytes.len() as u32;
        let vm_call_code = install(
            vm_call_bytes,
            vec![DispatchEntry {
                start_mpc: 0,
                end_mpc: len,
                handler_mpc: uncaught_off,
                catch_class: None,
            }],
        )?;
        let vm_call = vm_call_code.entry_point();
        code_map.insert(vm_call_code.clone());
        keep.push(vm_call_code);

        Ok(Stubs {
            exception_trampoline,
            patcher_wrapper,
            rethrow_pending,
            rethrow_pending_drop_ra,
            vm_call,
            keep,
        })
    }

    pub fn stub_count(&self) -> usize {
        self.keep.len()
    }
}

/// The exception trampoline: park the callee-saved registers and the
/// exception, run the dispatch core, reload the possibly rewritten register
/// set, switch to the handler frame's stack pointer, and resume with the
/// exception in RAX.
fn emit_trampoline(handle_exception: usize) -> Vec<u8> {
    let mut a = Asm::new(128);
    a.push(RAX); // xptr rides on top of the saved set
    a.push(RBX);
    a.push(RBP);
    a.push(R12);
    a.push(R13);
    a.push(R14);
    a.push(R15);
    a.alu_ri(Alu::Sub, true, RSP, 8);
    a.mov_rr(true, RDI, RAX);
    a.mov_rr(true, RSI, R10);
    a.lea(RDX, RSP, 8); // &SavedRegs, r15 lowest
    a.lea(RCX, RSP, 64); // faulting frame's stack pointer
    a.mov_ri64(R11, handle_exception as u64);
    a.call_reg(R11);
    // rax = handler, rdx = target sp.
    a.mov_rr(true, RCX, RAX);
    a.alu_ri(Alu::Add, true, RSP, 8);
    a.pop(R15);
    a.pop(R14);
    a.pop(R13);
    a.pop(R12);
    a.pop(RBP);
    a.pop(RBX);
    a.pop(RAX);
    a.mov_rr(true, RSP, RDX);
    a.jmp_reg(RCX);
    a.into_bytes()
}

/// Register-preserving wrapper around the patcher. Entered from a patch
/// trailer with the patch reference in R10 and the resume site in R11; all
/// caller-saved state a patch site can hold live is parked around the call.
fn emit_patcher_wrapper(patcher_entry: usize) -> Vec<u8> {
    let mut a = Asm::new(256);
    for r in [RAX, RCX, RDX, RSI, RDI, R8, R9] {
        a.push(r);
    }
    a.alu_ri(Alu::Sub, true, RSP, 104);
    for i in 0..12u8 {
        a.movs_store(false, RSP, (i as i32) * 8, i);
    }
    a.mov_rr(true, RDI, R10);
    a.mov_rr(true, RSI, R11);
    a.mov_ri64(RAX, patcher_entry as u64);
    a.call_reg(RAX);
    a.mov_rr(true, R10, RAX);
    for i in 0..12u8 {
        a.movs_load(false, i, RSP, (i as i32) * 8);
    }
    a.alu_ri(Alu::Add, true, RSP, 104);
    for r in [R9, R8, RDI, RSI, RDX, RCX, RAX] {
        a.pop(r);
    }
    a.jmp_reg(R10);
    a.into_bytes()
}

/// Pick up the pending throwable and enter dispatch. The drop-RA variant is
/// for failure paths still carrying the return address of an aborted call.
fn emit_rethrow(take_pending: usize, trampoline: usize, drop_ra: bool) -> Vec<u8> {
    let mut a = Asm::new(64);
    if drop_ra {
        a.alu_ri(Alu::Add, true, RSP, 8);
    }
    a.mov_ri64(RAX, take_pending as u64);
    a.call_reg(RAX);
    // rax = xptr, rdx = recorded pc.
    a.mov_rr(true, R10, RDX);
    a.mov_ri64(R11, trampoline as u64);
    a.jmp_reg(R11);
    a.into_bytes()
}

/// The call-in stub: `fn(entry, int_args, float_args, out) ` with C linkage.
/// Its catch-all dispatch row makes it the floor of every exception walk;
/// the handler records the exception as pending and returns normally.
fn emit_vm_call(set_pending_uncaught: usize) -> (Vec<u8>, u32) {
    let mut a = Asm::new(256);
    a.push(RBX);
    a.push(RBP);
    a.push(R12);
    a.push(R13);
    a.push(R14);
    a.push(R15);
    a.alu_ri(Alu::Sub, true, RSP, 8);
    a.mov_rr(true, RBX, RDI); // entry
    a.mov_rr(true, RBP, RCX); // out
    a.mov_rr(true, R12, RSI); // int args
    for i in 0..8u8 {
        a.movs_load(false, i, RDX, (i as i32) * 8);
    }
    a.load(true, RDI, R12, 0);
    a.load(true, RSI, R12, 8);
    a.load(true, RDX, R12, 16);
    a.load(true, RCX, R12, 24);
    a.load(true, R8, R12, 32);
    a.load(true, R9, R12, 40);
    a.call_reg(RBX);
    a.store(true, RBP, 0, RAX);
    a.movs_store(false, RBP, 8, XMM0_REG);
    let epilogue = a.pos();
    a.alu_ri(Alu::Add, true, RSP, 8);
    a.pop(R15);
    a.pop(R14);
    a.pop(R13);
    a.pop(R12);
    a.pop(RBP);
    a.pop(RBX);
    a.ret();

    // Catch-all handler: everything unwound to the boundary.
    let uncaught = a.pos() as u32;
    a.mov_rr(true, RDI, RAX);
    a.mov_ri64(RAX, set_pending_uncaught as u64);
    a.call_reg(RAX);
    a.store(true, RBP, 0, RAX);
    a.store(true, RBP, 8, RAX);
    let back = a.jmp();
    let disp = epilogue as i64 - (back as i64 + 4);
    a.patch32(back, disp as i32);

    (a.into_bytes(), uncaught)
}

const XMM0_REG: u8 = 0;

/// Per-method lazy-compile stub: preserve the argument registers, compile,
/// and tail-jump to the fresh entry point with the original arguments.
pub fn make_compile_stub(
    method: &Arc<Method>,
    compile_request: usize,
    critical_sections: &CriticalSections,
) -> Result<(usize, Arc<Code>), JitError> {
    let mut a = Asm::new(192);
    for r in [RDI, RSI, RDX, RCX, R8, R9] {
        a.push(r);
    }
    a.alu_ri(Alu::Sub, true, RSP, 72);
    for i in 0..8u8 {
        a.movs_store(false, RSP, (i as i32) * 8, i);
    }
    a.mov_ri64(RDI, Arc::as_ptr(method) as u64);
    // The return address of the call that got here names the call site to
    // patch back.
    a.load(true, RSI, RSP, 120);
    let save_region_end = a.pos();
    a.mov_ri64(RAX, compile_request as u64);
    a.call_reg(RAX);
    a.mov_rr(true, R10, RAX);
    for i in 0..8u8 {
        a.movs_load(false, i, RSP, (i as i32) * 8);
    }
    a.alu_ri(Alu::Add, true, RSP, 72);
    for r in [R9, R8, RCX, RDX, RSI, RDI] {
        a.pop(r);
    }
    a.jmp_reg(R10);

    let code = install(a.into_bytes(), Vec::new())?;
    let entry = code.entry_point();
    // A thread suspended while still building the stub frame restarts the
    // stub from its beginning.
    critical_sections.register(CriticalSection {
        start: entry,
        restart: entry,
        end: entry + save_region_end,
    });
    Ok((entry, code))
}

/// Native-call stub: shift the Java arguments right, install the JNI
/// environment pointer, call the bound native, and route any pending
/// exception into dispatch at the caller's site.
pub fn make_native_stub(
    method: &Arc<Method>,
    jni_env: usize,
    check_pending: usize,
    rethrow_drop_ra: usize,
) -> Result<(usize, Arc<Code>), JitError> {
    let native_fn = method.native_fn();
    if native_fn == 0 {
        return Err(JitError::Linkage(crate::error::JavaThrowable::with_message(
            crate::error::JavaKind::UnsatisfiedLinkError,
            format!("{}{}", method.name, method.desc),
        )));
    }
    let int_args = method.descriptor.params.iter().filter(|p| {
        !matches!(
            p.value_type(),
            crate::classfile::descriptor::ValueType::Float
                | crate::classfile::descriptor::ValueType::Double
        )
    }).count() + usize::from(!method.is_static());
    if int_args > 5 {
        return Err(JitError::Codegen(
            "native stubs support at most five integer arguments".into(),
        ));
    }

    let mut a = Asm::new(128);
    a.mov_rr(true, R9, R8);
    a.mov_rr(true, R8, RCX);
    a.mov_rr(true, RCX, RDX);
    a.mov_rr(true, RDX, RSI);
    a.mov_rr(true, RSI, RDI);
    a.mov_ri64(RDI, jni_env as u64);
    a.alu_ri(Alu::Sub, true, RSP, 24);
    a.mov_ri64(RAX, native_fn as u64);
    a.call_reg(RAX);
    a.store(true, RSP, 0, RAX);
    a.movs_store(false, RSP, 8, XMM0_REG);
    a.mov_ri64(RAX, check_pending as u64);
    a.call_reg(RAX);
    a.test_rr(false, RAX, RAX);
    let j_pending = a.jcc(crate::jit::target::x86_64::asm::Cc::Ne);
    a.load(true, RAX, RSP, 0);
    a.movs_load(false, XMM0_REG, RSP, 8);
    a.alu_ri(Alu::Add, true, RSP, 24);
    a.ret();
    let pending = a.pos();
    let disp = pending as i64 - (j_pending as i64 + 4);
    a.patch32(j_pending, disp as i32);
    a.alu_ri(Alu::Add, true, RSP, 24);
    a.mov_ri64(R11, rethrow_drop_ra as u64);
    a.jmp_reg(R11);

    let code = install(a.into_bytes(), Vec::new())?;
    Ok((code.entry_point(), code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_stubs_generate() {
        let map = CodeMap::new();
        let stubs = Stubs::generate(&map, 0x1000, 0x2000, 0x3000, 0x4000).unwrap();
        assert_ne!(stubs.exception_trampoline, 0);
        assert_ne!(stubs.patcher_wrapper, 0);
        assert_ne!(stubs.rethrow_pending, stubs.rethrow_pending_drop_ra);
        assert_eq!(stubs.stub_count(), 5);
        // The call-in stub is findable by the dispatcher.
        let found = map.lookup(stubs.vm_call).expect("vm_call registered");
        assert_eq!(found.dispatch.len(), 1);
        assert!(found.dispatch[0].catch_class.is_none());
    }

    #[test]
    fn test_vm_call_handler_inside_range() {
        let (bytes, uncaught) = emit_vm_call(0x5000);
        assert!((uncaught as usize) < bytes.len());
    }
}
