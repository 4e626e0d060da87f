//! Backend-agnostic code generation traits
//!
//! Each target declares its register pools and calling convention in a
//! [`RegisterSet`] and implements [`NativeBackend`] to lower allocated IR to
//! machine bytes. The driver is target-agnostic: it runs the allocator with
//! the backend's register set and hands the result to `compile`.

pub mod x86_64;

use std::sync::Arc;

use super::code::{DispatchEntry, StackMapEntry};
use super::ir::IrMethod;
use super::patcher::PatchRef;
use super::regalloc::FrameAlloc;
use crate::classfile::method::Method;
use crate::error::JitError;

/// How parameters map onto argument registers.
///
/// `Numbered`: the n-th parameter lives in the n-th argument register and
/// the allocator hands those registers out as parameter homes. `Used`:
/// argument registers only count toward register pressure; parameters get
/// ordinary homes and the prologue moves them there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    Numbered,
    Used,
}

/// Register pools and calling-convention facts one back-end declares.
///
/// Register numbers are target-local encodings. Reserved registers (stack
/// pointer, emitter scratch, the exception carriers) appear in no pool.
#[derive(Debug)]
pub struct RegisterSet {
    /// Integer argument registers in convention order.
    pub int_args: &'static [u8],
    /// Float argument registers in convention order.
    pub float_args: &'static [u8],
    /// Caller-saved integer registers the allocator may hand to temporaries.
    pub int_tmps: &'static [u8],
    /// Callee-saved integer registers, in canonical save order.
    pub int_saved: &'static [u8],
    /// Caller-saved float registers for temporaries.
    pub float_tmps: &'static [u8],
    /// Callee-saved float registers, in canonical save order.
    pub float_saved: &'static [u8],
    /// Integer/address return register.
    pub int_ret: u8,
    /// Float/double return register.
    pub float_ret: u8,
    pub param_mode: ParamMode,
}

/// Addresses of runtime entry points the emitter plants in data segments.
///
/// Filled by the VM at init from the builtin table and generated stubs.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeAnchors {
    /// `extern "C" fn(kind: u32, xpc: usize, extra: i64) -> *mut Object`
    pub throw_builtin: usize,
    /// The generated exception-dispatch trampoline.
    pub exception_trampoline: usize,
    /// The generated register-saving wrapper around the patcher.
    pub patcher_wrapper: usize,
    /// Builtin table, see [`crate::runtime::builtins`].
    pub builtins: crate::runtime::builtins::BuiltinTable,
}

/// A rip-relative data-segment reference awaiting final layout.
///
/// The 32-bit displacement at `code_offset` is fixed up once the sizes of
/// the data segment and method header are known.
#[derive(Debug, Clone, Copy)]
pub struct DsegReloc {
    pub code_offset: usize,
    pub dseg_offset: usize,
}

/// Machine code plus tables, not yet placed in executable memory.
#[derive(Debug)]
pub struct CompiledMethod {
    pub code: Vec<u8>,
    /// Data segment contents; placed before the method header so constants
    /// sit at negative offsets from the entry point.
    pub dseg: Vec<u8>,
    pub dseg_relocs: Vec<DsegReloc>,
    /// Data-segment words that receive an absolute code address
    /// (switch tables): (dseg offset, machine-code offset).
    pub dseg_block_addrs: Vec<(usize, u32)>,
    /// String literals referenced from the data segment; kept alive with
    /// the code.
    pub strings: Vec<std::sync::Arc<str>>,
    pub frame_size: i32,
    pub is_leaf: bool,
    /// Frame offset of the saved monitor target for synchronized methods.
    pub sync_slot_offset: Option<i32>,
    pub int_saved_count: u8,
    pub float_saved_count: u8,
    /// Exception dispatch rows in machine-code offsets, source order.
    pub dispatch: Vec<DispatchEntry>,
    /// (machine offset, source line) per block entry.
    pub line_table: Vec<(u32, u16)>,
    pub patch_refs: Vec<Arc<PatchRef>>,
    pub call_sites: Vec<super::code::CallSite>,
    /// Reference locations at call sites, for the collector.
    pub stack_maps: Vec<StackMapEntry>,
}

/// A per-target lowering from allocated IR to machine code.
pub trait NativeBackend: Send + Sync {
    /// Backend name, for diagnostics.
    fn name(&self) -> &str;

    /// The pools and conventions the allocator must respect.
    fn register_set(&self) -> &RegisterSet;

    /// Lower an allocated method.
    fn compile(
        &self,
        method: &Method,
        ir: &IrMethod,
        frame: &FrameAlloc,
        anchors: &RuntimeAnchors,
    ) -> Result<CompiledMethod, JitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_pools_disjoint_from_reserved() {
        let set = x86_64::Backend::new().register_set_static();
        // rsp(4), rax(0), r10, r11 never appear in an allocatable pool;
        // rcx(1)/rdx(2) are div/shift clobbers and stay out as well.
        for &r in set.int_tmps.iter().chain(set.int_saved.iter()) {
            assert!(![0u8, 1, 2, 4, 10, 11].contains(&r), "reserved reg {} in pool", r);
        }
        assert_eq!(set.param_mode, ParamMode::Used);
    }
}
