//! Runtime builtins called from compiled code
//!
//! A typed table of C-ABI entry points the emitter plants in data segments:
//! allocation, monitor operations, type checks, the IEEE remainder
//! fallbacks, string interning, and the pending-exception hand-off. A
//! builtin that can fail returns zero with the throwable parked on the
//! current thread; the generated pending-check branches to a trailer that
//! picks it up and enters dispatch.

use std::sync::Arc;

use super::object::ObjectHeader;
use super::threads::{Checkpoint, ThreadList};
use super::Vm;
use crate::classfile::class::Vtable;
use crate::error::{JavaKind, JavaThrowable};
use crate::jit::ir::ArrayElem;

/// Throw-kind codes passed from inline check stubs.
pub mod kind {
    pub const NULL_POINTER: u32 = 0;
    pub const ARITHMETIC: u32 = 1;
    pub const ARRAY_INDEX: u32 = 2;
    pub const ARRAY_STORE: u32 = 3;
    pub const CLASS_CAST: u32 = 4;
    pub const NEGATIVE_ARRAY_SIZE: u32 = 5;
    pub const INCOMPATIBLE_CLASS_CHANGE: u32 = 6;
}

/// Pending exception pair handed back to generated code in RAX:RDX.
#[repr(C)]
pub struct PendingPair {
    pub xptr: usize,
    pub xpc: usize,
}

/// C-ABI entry points for compiled code, as raw addresses.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinTable {
    pub alloc_object: usize,
    pub alloc_prim_array: usize,
    pub alloc_ref_array: usize,
    pub alloc_multi_array: usize,
    pub monitor_enter: usize,
    pub monitor_exit: usize,
    pub checkcast: usize,
    pub instanceof: usize,
    pub aastore_check: usize,
    pub frem: usize,
    pub drem: usize,
    pub intern_string: usize,
    pub class_mirror: usize,
    pub take_pending: usize,
}

impl BuiltinTable {
    pub fn new() -> Self {
        BuiltinTable {
            alloc_object: bi_alloc_object as usize,
            alloc_prim_array: bi_alloc_prim_array as usize,
            alloc_ref_array: bi_alloc_ref_array as usize,
            alloc_multi_array: bi_alloc_multi_array as usize,
            monitor_enter: bi_monitor_enter as usize,
            monitor_exit: bi_monitor_exit as usize,
            checkcast: bi_checkcast as usize,
            instanceof: bi_instanceof as usize,
            aastore_check: bi_aastore_check as usize,
            frem: bi_frem as usize,
            drem: bi_drem as usize,
            intern_string: bi_intern_string as usize,
            class_mirror: bi_class_mirror as usize,
            take_pending: bi_take_pending as usize,
        }
    }
}

impl Default for BuiltinTable {
    fn default() -> Self {
        Self::new()
    }
}

fn set_pending(vm: &Vm, t: JavaThrowable) {
    vm.set_pending_throwable(t, 0);
}

/// Construct and return the exception object for an inline check stub.
/// Never unwinds; allocation failure here is fatal.
pub extern "C" fn bi_throw(code: u32, xpc: usize, extra: i64) -> *mut ObjectHeader {
    let vm = Vm::get();
    let _ = xpc;
    let (kind, message) = match code {
        kind::NULL_POINTER => (JavaKind::NullPointerException, None),
        kind::ARITHMETIC => (JavaKind::ArithmeticException, Some("/ by zero".to_string())),
        kind::ARRAY_INDEX => (
            JavaKind::ArrayIndexOutOfBoundsException,
            Some(format!("Index {} out of bounds", extra as i32)),
        ),
        kind::ARRAY_STORE => (JavaKind::ArrayStoreException, None),
        kind::CLASS_CAST => (JavaKind::ClassCastException, None),
        kind::NEGATIVE_ARRAY_SIZE => (
            JavaKind::NegativeArraySizeException,
            Some((extra as i32).to_string()),
        ),
        _ => (JavaKind::IncompatibleClassChangeError, None),
    };
    let throwable = match message {
        Some(m) => JavaThrowable::with_message(kind, m),
        None => JavaThrowable::new(kind),
    };
    match vm.throwable_object(&throwable) {
        Ok(obj) => obj,
        Err(_) => {
            eprintln!("out of memory while raising {}", throwable);
            std::process::abort();
        }
    }
}

extern "C" fn bi_alloc_object(vtbl: *const Vtable) -> *mut ObjectHeader {
    let vm = Vm::get();
    let class = unsafe { (*vtbl).class() };
    match vm.heap().alloc_object(class) {
        Ok(obj) => obj,
        Err(t) => {
            set_pending(vm, t);
            std::ptr::null_mut()
        }
    }
}

extern "C" fn bi_alloc_prim_array(elem: u32, len: i32) -> *mut ObjectHeader {
    let vm = Vm::get();
    let elem = match elem {
        0 => ArrayElem::Byte,
        1 => ArrayElem::Char,
        2 => ArrayElem::Short,
        3 => ArrayElem::Int,
        4 => ArrayElem::Long,
        5 => ArrayElem::Float,
        6 => ArrayElem::Double,
        _ => ArrayElem::Ref,
    };
    let class = vm.registry().array_class(elem.descriptor());
    match vm.heap().alloc_array(&class, elem.size() as usize, len) {
        Ok(obj) => obj,
        Err(t) => {
            set_pending(vm, t);
            std::ptr::null_mut()
        }
    }
}

extern "C" fn bi_alloc_ref_array(comp_vtbl: *const Vtable, len: i32) -> *mut ObjectHeader {
    let vm = Vm::get();
    let comp = unsafe { (*comp_vtbl).class() };
    let desc = if comp.is_array() {
        format!("[{}", comp.component.as_deref().unwrap_or("Ljava/lang/Object;"))
    } else {
        format!("L{};", comp.name)
    };
    let class = vm.registry().array_class(&desc);
    match vm.heap().alloc_array(&class, 8, len) {
        Ok(obj) => obj,
        Err(t) => {
            set_pending(vm, t);
            std::ptr::null_mut()
        }
    }
}

extern "C" fn bi_alloc_multi_array(
    vtbl: *const Vtable,
    ndims: u32,
    dims: *const i64,
) -> *mut ObjectHeader {
    let vm = Vm::get();
    let class = unsafe { (*vtbl).class() };
    let dims: Vec<i32> = (0..ndims as usize)
        .map(|i| unsafe { *dims.add(i) } as i32)
        .collect();
    match alloc_multi(vm, class, &dims) {
        Ok(obj) => obj,
        Err(t) => {
            set_pending(vm, t);
            std::ptr::null_mut()
        }
    }
}

fn alloc_multi(
    vm: &Vm,
    class: &crate::classfile::class::Class,
    dims: &[i32],
) -> Result<*mut ObjectHeader, JavaThrowable> {
    let len = dims[0];
    let component = class
        .component
        .clone()
        .ok_or_else(|| JavaThrowable::new(JavaKind::InternalError))?;
    let elem_size = match component.as_bytes()[0] {
        b'B' | b'Z' => 1,
        b'C' | b'S' => 2,
        b'I' | b'F' => 4,
        _ => 8,
    };
    let arr = vm.heap().alloc_array(class, elem_size, len)?;
    if dims.len() > 1 {
        let inner_class = vm.registry().resolve_class(&component)?;
        let data = unsafe { super::object::array_data(arr) } as *mut u64;
        for i in 0..len {
            let inner = alloc_multi(vm, &inner_class, &dims[1..])?;
            unsafe { *data.add(i as usize) = inner as u64 };
        }
    }
    Ok(arr)
}

extern "C" fn bi_monitor_enter(obj: *mut ObjectHeader) -> i32 {
    let vm = Vm::get();
    let t = vm.threads().attach();
    vm.threads().safepoint(&t, Checkpoint::default());
    super::monitor::enter(vm.threads(), &t, obj);
    1
}

extern "C" fn bi_monitor_exit(obj: *mut ObjectHeader) -> i32 {
    let vm = Vm::get();
    let t = vm.threads().attach();
    match super::monitor::exit(&t, obj) {
        Ok(()) => 1,
        Err(throwable) => {
            set_pending(vm, throwable);
            0
        }
    }
}

extern "C" fn bi_checkcast(obj: *const ObjectHeader, vtbl: *const Vtable) -> i32 {
    if obj.is_null() {
        return 1;
    }
    let target = unsafe { (*vtbl).class() };
    let class = unsafe { (*obj).class() };
    class.is_subtype_of(target) as i32
}

extern "C" fn bi_instanceof(obj: *const ObjectHeader, vtbl: *const Vtable) -> i32 {
    if obj.is_null() {
        return 0;
    }
    let target = unsafe { (*vtbl).class() };
    let class = unsafe { (*obj).class() };
    class.is_subtype_of(target) as i32
}

extern "C" fn bi_aastore_check(arr: *const ObjectHeader, value: *const ObjectHeader) -> i32 {
    if value.is_null() {
        return 1;
    }
    let arr_class = unsafe { (*arr).class() };
    let value_class = unsafe { (*value).class() };
    match arr_class.component_class() {
        Some(comp) => value_class.is_subtype_of(comp) as i32,
        None => {
            // A primitive-component or unresolved-component array never
            // accepts a reference store.
            let vm = Vm::get();
            match &arr_class.component {
                Some(desc) => match vm.registry().resolve_class(desc) {
                    Ok(comp) => {
                        arr_class.set_component_class(comp.clone());
                        value_class.is_subtype_of(&comp) as i32
                    }
                    Err(_) => 0,
                },
                None => 0,
            }
        }
    }
}

extern "C" fn bi_frem(a: f32, b: f32) -> f32 {
    a % b
}

extern "C" fn bi_drem(a: f64, b: f64) -> f64 {
    a % b
}

extern "C" fn bi_intern_string(ptr: *const u8, len: usize) -> *mut ObjectHeader {
    let vm = Vm::get();
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    let s = std::str::from_utf8(bytes).unwrap_or("");
    match vm.intern_string(s) {
        Ok(obj) => obj,
        Err(t) => {
            set_pending(vm, t);
            std::ptr::null_mut()
        }
    }
}

extern "C" fn bi_class_mirror(vtbl: *const Vtable) -> *mut ObjectHeader {
    let vm = Vm::get();
    let class = unsafe { (*vtbl).class() };
    let mirror = class.mirror();
    if mirror != 0 {
        return mirror as *mut ObjectHeader;
    }
    // Lazily created for classes the loader has not prepared yet.
    match vm.heap().alloc_object(class) {
        Ok(obj) => {
            class.set_mirror(obj as usize);
            obj
        }
        Err(t) => {
            set_pending(vm, t);
            std::ptr::null_mut()
        }
    }
}

extern "C" fn bi_take_pending() -> PendingPair {
    let vm = Vm::get();
    let t = vm.threads().attach();
    match t.take_pending() {
        Some((xptr, xpc)) => PendingPair { xptr, xpc },
        None => {
            eprintln!("pending-exception hand-off with nothing pending");
            std::process::abort();
        }
    }
}

/// `Arc<str>`-free helper for the emitter's prim-array kind codes.
pub fn prim_array_code(elem: ArrayElem) -> u32 {
    match elem {
        ArrayElem::Byte => 0,
        ArrayElem::Char => 1,
        ArrayElem::Short => 2,
        ArrayElem::Int => 3,
        ArrayElem::Long => 4,
        ArrayElem::Float => 5,
        ArrayElem::Double => 6,
        ArrayElem::Ref => 7,
    }
}

/// Native-call stubs check this after each native returns.
pub extern "C" fn check_native_pending() -> i32 {
    let vm = Vm::get();
    match ThreadList::try_current() {
        Some(t) => t.has_pending() as i32,
        None => {
            let _ = vm;
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prim_array_codes_round_trip() {
        for elem in [
            ArrayElem::Byte,
            ArrayElem::Char,
            ArrayElem::Short,
            ArrayElem::Int,
            ArrayElem::Long,
            ArrayElem::Float,
            ArrayElem::Double,
        ] {
            let code = prim_array_code(elem);
            assert!(code < 7);
        }
    }

    #[test]
    fn test_frem_matches_java() {
        assert_eq!(bi_frem(5.5, 2.0), 1.5);
        assert!(bi_frem(f32::NAN, 1.0).is_nan());
        assert_eq!(bi_drem(-7.0, 2.0), -1.0);
    }

    #[test]
    fn test_table_has_distinct_entries() {
        let t = BuiltinTable::new();
        let all = [
            t.alloc_object,
            t.alloc_prim_array,
            t.alloc_ref_array,
            t.alloc_multi_array,
            t.monitor_enter,
            t.monitor_exit,
            t.checkcast,
            t.instanceof,
            t.aastore_check,
            t.frem,
            t.drem,
            t.intern_string,
            t.class_mirror,
            t.take_pending,
        ];
        let mut dedup = all.to_vec();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), all.len());
        assert!(all.iter().all(|&a| a != 0));
    }
}
