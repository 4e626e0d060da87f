//! First-execution patching
//!
//! An unresolved reference compiles into a data-segment slot holding a
//! sentinel plus a trailer that enters the patcher through the register-
//! saving wrapper stub. The patcher resolves the symbol under the compiler
//! lock, publishes the value into the slot with a single aligned store, and
//! resumes at the original site; a racing executor either re-enters here
//! or sees the finished value. Resolution failures become Java linkage
//! errors dispatched from the site's PC like any runtime exception.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::classfile::constant_pool::{ClassRef, FieldHome, FieldRef, MethodRef};
use crate::classfile::class::Class;
use crate::error::JavaThrowable;
use crate::runtime::Vm;

/// What a patch site is waiting for.
#[derive(Debug)]
pub enum PatchKind {
    /// Instance field: slot receives `offset + 1`.
    InstanceFieldOffset(Arc<FieldRef>),
    /// Static field: slot receives the storage cell address.
    StaticFieldCell(Arc<FieldRef>),
    /// Class reference: slot receives the vtable pointer.
    ClassVtable(Arc<ClassRef>),
    /// Static/special call: slot receives the callee's callable address.
    MethodEntry(Arc<MethodRef>),
    /// Virtual call: slot receives `vtable index + 1`.
    VtableIndex(Arc<MethodRef>),
    /// Interface call: slot receives `interface index + 1`, the following
    /// slot the method position within the interface block.
    InterfaceSlots(Arc<MethodRef>),
}

/// One deferred resolution site.
#[derive(Debug)]
pub struct PatchRef {
    /// Data-segment offset of the slot the resolved value lands in.
    pub dseg_offset: usize,
    pub kind: PatchKind,
    done: AtomicBool,
}

impl PatchRef {
    pub fn new(dseg_offset: usize, kind: PatchKind) -> Arc<Self> {
        Arc::new(PatchRef {
            dseg_offset,
            kind,
            done: AtomicBool::new(false),
        })
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Patch trap entry, reached from the wrapper stub with all caller-saved
/// registers parked. Returns the address execution resumes at: the original
/// site on success, the rethrow stub after a linkage failure.
///
/// # Safety
/// `pref` must point at a live [`PatchRef`] of a published code object and
/// `site` must be a PC inside that object's machine code.
pub unsafe extern "C" fn patcher_entry(pref: *const PatchRef, site: usize) -> usize {
    let vm = Vm::get();
    let _lock = vm.compiler_lock().lock();
    let pref = unsafe { &*pref };

    let Some(code) = vm.code_map().lookup(site) else {
        // A patch trap outside any known range is unreachable by
        // construction.
        eprintln!("patcher: site {:#x} not in code map", site);
        std::process::abort();
    };

    if pref.is_done() {
        return site;
    }

    match resolve(vm, pref) {
        Ok(values) => {
            for (off, value) in values {
                code.dseg_write(off, value);
            }
            pref.done.store(true, Ordering::Release);
            debug!(site, kind = ?pref.kind, "patched");
            site
        }
        Err(throwable) => {
            debug!(site, error = %throwable, "patch resolution failed");
            vm.set_pending_throwable(throwable, site);
            vm.stubs().rethrow_pending
        }
    }
}

type Slots = Vec<(usize, u64)>;

fn resolve(vm: &Vm, pref: &PatchRef) -> Result<Slots, JavaThrowable> {
    let registry = vm.registry();
    let off = pref.dseg_offset;
    match &pref.kind {
        PatchKind::InstanceFieldOffset(fr) => {
            let (_, home) = registry.resolve_field(fr, false)?;
            match home {
                FieldHome::Instance { offset } => Ok(vec![(off, offset as u64 + 1)]),
                FieldHome::Static { .. } => unreachable!("checked by resolve_field"),
            }
        }
        PatchKind::StaticFieldCell(fr) => {
            let (class, home) = registry.resolve_field(fr, true)?;
            vm.ensure_prepared(&class);
            match home {
                FieldHome::Static { cell } => Ok(vec![(off, cell as u64)]),
                FieldHome::Instance { .. } => unreachable!("checked by resolve_field"),
            }
        }
        PatchKind::ClassVtable(cr) => {
            let class = resolve_class_ref(vm, cr)?;
            Ok(vec![(off, class.vtable_ptr() as u64)])
        }
        PatchKind::MethodEntry(mr) => {
            let method = registry.resolve_method(mr)?;
            if let Some(class) = method.class() {
                vm.ensure_prepared(&class);
            }
            let addr = method.callable_address().unwrap_or(0);
            debug_assert_ne!(addr, 0, "prepared methods always have a stub");
            Ok(vec![(off, addr as u64)])
        }
        PatchKind::VtableIndex(mr) => {
            let method = registry.resolve_method(mr)?;
            let idx = method.vtable_index().ok_or_else(|| {
                JavaThrowable::with_message(
                    crate::error::JavaKind::IncompatibleClassChangeError,
                    format!("{}.{} is not virtual", mr.class_name, mr.name),
                )
            })?;
            Ok(vec![(off, idx as u64 + 1)])
        }
        PatchKind::InterfaceSlots(mr) => {
            let interface = registry.resolve_class(&mr.class_name)?;
            if !interface.is_interface() {
                return Err(JavaThrowable::with_message(
                    crate::error::JavaKind::IncompatibleClassChangeError,
                    mr.class_name.to_string(),
                ));
            }
            let ifc_index = interface.interface_index.unwrap_or(0);
            let slot = Class::itable_slot_of(&interface, &mr.name, &mr.desc).ok_or_else(|| {
                JavaThrowable::with_message(
                    crate::error::JavaKind::NoSuchMethodError,
                    format!("{}.{}{}", mr.class_name, mr.name, mr.desc),
                )
            })?;
            Ok(vec![(off, ifc_index as u64 + 1), (off + 8, slot as u64)])
        }
    }
}

fn resolve_class_ref(vm: &Vm, cr: &Arc<ClassRef>) -> Result<Arc<Class>, JavaThrowable> {
    if let Some(c) = cr.get() {
        return Ok(c.clone());
    }
    let class = vm.registry().resolve_class(&cr.name)?;
    cr.install(class.clone());
    Ok(class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patchref_done_flag() {
        let pr = PatchRef::new(
            16,
            PatchKind::ClassVtable(Arc::new(ClassRef::new("java/lang/Object"))),
        );
        assert!(!pr.is_done());
        pr.done.store(true, Ordering::Release);
        assert!(pr.is_done());
        assert_eq!(pr.dseg_offset, 16);
    }
}
