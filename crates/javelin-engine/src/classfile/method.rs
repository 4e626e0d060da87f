//! Loaded method metadata
//!
//! A [`Method`] arrives from the loader with verified bytecode, a parsed
//! descriptor, and its exception table. The compiler is the only mutator: it
//! installs the entry point and the compiled [`Code`](crate::jit::code::Code)
//! artifact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::class::Class;
use super::constant_pool::ConstantPool;
use super::descriptor::MethodDescriptor;
use super::flags::MethodFlags;
use crate::jit::code::Code;

/// One row of a method's exception table, in bytecode PCs.
///
/// Covers `[start_pc, end_pc)`; `catch_type` is a constant-pool index or 0
/// for a catch-all handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// One row of the LineNumberTable attribute.
#[derive(Debug, Clone, Copy)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line: u16,
}

/// A loaded, verified method.
pub struct Method {
    /// Owning class; set once when the class is defined.
    class: OnceCell<Weak<Class>>,
    pub name: Arc<str>,
    pub desc: Arc<str>,
    pub descriptor: MethodDescriptor,
    pub flags: MethodFlags,
    pub max_stack: u16,
    pub max_locals: u16,
    /// Verified bytecode; empty for native and abstract methods.
    pub bytecode: Box<[u8]>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub line_numbers: Vec<LineNumberEntry>,
    pub pool: Arc<ConstantPool>,
    /// Index into the vtable method table, for virtual methods.
    vtable_index: OnceCell<u16>,
    /// Published entry point; 0 until the first compile finishes.
    entry_point: AtomicUsize,
    /// Address of this method's lazy-compile stub; 0 until prepared.
    stubroutine: AtomicUsize,
    /// Bound native implementation for `native` methods; 0 if unbound.
    native_fn: AtomicUsize,
    /// The compiled artifact, owned exclusively by this method.
    compiled: Mutex<Option<Arc<Code>>>,
}

impl Method {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<Arc<str>>,
        desc: impl Into<Arc<str>>,
        descriptor: MethodDescriptor,
        flags: MethodFlags,
        max_stack: u16,
        max_locals: u16,
        bytecode: Box<[u8]>,
        exception_table: Vec<ExceptionTableEntry>,
        line_numbers: Vec<LineNumberEntry>,
        pool: Arc<ConstantPool>,
    ) -> Self {
        Method {
            class: OnceCell::new(),
            name: name.into(),
            desc: desc.into(),
            descriptor,
            flags,
            max_stack,
            max_locals,
            bytecode,
            exception_table,
            line_numbers,
            pool,
            vtable_index: OnceCell::new(),
            entry_point: AtomicUsize::new(0),
            stubroutine: AtomicUsize::new(0),
            native_fn: AtomicUsize::new(0),
            compiled: Mutex::new(None),
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    /// Owning class, if the class is still alive.
    pub fn class(&self) -> Option<Arc<Class>> {
        self.class.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_class(&self, class: Weak<Class>) {
        let _ = self.class.set(class);
    }

    pub fn vtable_index(&self) -> Option<u16> {
        self.vtable_index.get().copied()
    }

    pub(crate) fn set_vtable_index(&self, idx: u16) {
        let _ = self.vtable_index.set(idx);
    }

    /// Published entry point, if compiled.
    pub fn entry_point(&self) -> Option<usize> {
        match self.entry_point.load(Ordering::Acquire) {
            0 => None,
            ep => Some(ep),
        }
    }

    /// Address callers may jump to before the method is compiled: the real
    /// entry point if present, otherwise the lazy-compile stub.
    pub fn callable_address(&self) -> Option<usize> {
        self.entry_point().or_else(|| match self.stubroutine() {
            0 => None,
            s => Some(s),
        })
    }

    pub fn stubroutine(&self) -> usize {
        self.stubroutine.load(Ordering::Acquire)
    }

    pub(crate) fn set_stubroutine(&self, addr: usize) {
        self.stubroutine.store(addr, Ordering::Release);
    }

    pub fn native_fn(&self) -> usize {
        self.native_fn.load(Ordering::Acquire)
    }

    /// Bind the native implementation of a `native` method.
    pub fn bind_native(&self, addr: usize) {
        self.native_fn.store(addr, Ordering::Release);
    }

    /// Install the compiled artifact and publish its entry point.
    pub(crate) fn install_code(&self, code: Arc<Code>) {
        let entry = code.entry_point();
        *self.compiled.lock() = Some(code);
        self.entry_point.store(entry, Ordering::Release);
    }

    /// The compiled artifact, if any.
    pub fn code(&self) -> Option<Arc<Code>> {
        self.compiled.lock().clone()
    }

    /// Drop the compiled artifact on class unload.
    pub(crate) fn clear_code(&self) {
        self.entry_point.store(0, Ordering::Release);
        *self.compiled.lock() = None;
    }

    /// Source line for a bytecode PC, from the LineNumberTable.
    pub fn line_for_pc(&self, pc: u16) -> Option<u16> {
        let mut line = None;
        for entry in &self.line_numbers {
            if entry.start_pc <= pc {
                line = Some(entry.line);
            } else {
                break;
            }
        }
        line
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .field("flags", &self.flags)
            .field("bytecode_len", &self.bytecode.len())
            .finish()
    }
}
