//! Compiler driver
//!
//! `compile` runs the pipeline for one method on the calling thread:
//! parse into blocks, stack analysis, register allocation, emission,
//! publication. Idempotent per method and serialized on the VM-wide
//! re-entrant compiler lock. Methods without bytecode get a native-call
//! stub instead. `compile_request` is the C entry the lazy-compile stubs
//! call on first invocation; it additionally patches the calling site's
//! data-segment slot so later calls go straight through.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::code::Code;
use super::{parser, regalloc, stack, stubs};
use crate::classfile::method::Method;
use crate::error::{JavaKind, JavaThrowable, JitError};
use crate::jit::target::NativeBackend;
use crate::runtime::{builtins, Vm};

/// Compile `method` and return its entry point. Returns the cached entry
/// point on every call after the first.
pub fn compile(vm: &Vm, method: &Arc<Method>) -> Result<usize, JitError> {
    if let Some(entry) = method.entry_point() {
        return Ok(entry);
    }
    let _lock = vm.compiler_lock().lock();
    if let Some(entry) = method.entry_point() {
        return Ok(entry);
    }

    let start = Instant::now();

    if method.is_abstract() {
        return Err(JitError::Linkage(JavaThrowable::with_message(
            JavaKind::AbstractMethodError,
            format!("{}{}", method.name, method.desc),
        )));
    }
    if method.is_native() {
        let (entry, code) = stubs::make_native_stub(
            method,
            vm.jni_env_addr(),
            builtins::check_native_pending as usize,
            vm.stubs().rethrow_pending_drop_ra,
        )?;
        method.install_code(code);
        vm.registry()
            .for_each(|c| c.update_dispatch_entries(method, entry));
        debug!(method = %method.name, entry, "native stub installed");
        return Ok(entry);
    }
    if method.bytecode.is_empty() {
        return Err(JitError::NoCode);
    }

    let parsed = parser::parse(method)?;
    let mut ir = stack::analyze(method, parsed)?;
    let backend = vm.backend();
    let frame = regalloc::allocate(&mut ir, backend.register_set(), method.is_synchronized());
    let compiled = backend.compile(method, &ir, &frame, vm.anchors())?;

    let bytecode_len = method.bytecode.len();
    let mcode_len = compiled.code.len();
    let dseg_len = compiled.dseg.len();
    vm.charge_code_heap(mcode_len + dseg_len)?;

    let code = Code::install(compiled, Arc::downgrade(method))?;
    vm.code_map().insert(code.clone());
    method.install_code(code);
    let entry = method.entry_point().expect("just installed");

    // Every dispatch cell still holding the lazy stub learns the real
    // entry point.
    vm.registry()
        .for_each(|c| c.update_dispatch_entries(method, entry));

    vm.stats()
        .record_compile(bytecode_len, mcode_len, dseg_len, start.elapsed());
    if vm.options().verbose_compile {
        debug!(
            method = %method.name,
            desc = %method.desc,
            mcode = mcode_len,
            dseg = dseg_len,
            "compiled"
        );
    }
    Ok(entry)
}

/// First-invocation entry, reached from a lazy-compile stub.
///
/// Returns the address execution continues at: the compiled entry point, or
/// the rethrow stub when compilation failed and a throwable is pending.
///
/// # Safety
/// `method_ptr` must come from `Arc::as_ptr` of a method kept alive by its
/// class; `ra` must be the stub caller's return address.
pub unsafe extern "C" fn compile_request(method_ptr: *const Method, ra: usize) -> usize {
    let vm = Vm::get();
    let method = unsafe {
        Arc::increment_strong_count(method_ptr);
        Arc::from_raw(method_ptr)
    };

    match compile(vm, &method) {
        Ok(entry) => {
            // Patch the data-segment slot of the call site that trapped
            // here, so its next execution calls the entry point directly.
            if ra != 0 {
                if let Some(caller) = vm.code_map().lookup(ra.wrapping_sub(1)) {
                    let off = (ra - caller.entry_point()) as u32;
                    for site in &caller.call_sites {
                        if site.ret_mpc == off {
                            caller.dseg_write(site.dseg_offset as usize, entry as u64);
                        }
                    }
                }
            }
            entry
        }
        Err(e) => {
            debug!(method = %method.name, error = %e, "lazy compile failed");
            vm.set_pending_throwable(e.to_throwable(), ra);
            vm.stubs().rethrow_pending_drop_ra
        }
    }
}
