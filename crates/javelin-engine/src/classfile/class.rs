//! Loaded classes, vtables, and field layout
//!
//! The vtable is the one structure compiled code reads directly, so its
//! layout is `repr(C)` with offsets exported to the emitter: subtype checks
//! load `baseval`/`diffval`, virtual dispatch loads the method-table pointer,
//! interface dispatch goes through the interface table. Method-table cells
//! are atomics so the compiler stub can patch entry points while other
//! threads dispatch through them.

use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

use super::descriptor::JavaType;
use super::flags::{ClassFlags, FieldFlags};
use super::method::Method;

/// Byte offset of the vtable pointer inside every object header.
pub const OBJECT_VTBL_OFFSET: i32 = 0;
/// Byte offset of the monitor word inside every object header.
pub const OBJECT_MONITOR_OFFSET: i32 = 8;
/// Size of the plain object header; instance fields start here.
pub const OBJECT_HEADER_SIZE: i32 = 16;
/// Byte offset of the `length` field of an array object.
pub const ARRAY_LENGTH_OFFSET: i32 = 16;
/// Byte offset of the first element of an array object.
pub const ARRAY_DATA_OFFSET: i32 = 24;

/// Offset of `baseval` within [`Vtable`].
pub const VTBL_BASEVAL_OFFSET: i32 = 8;
/// Offset of `diffval` within [`Vtable`].
pub const VTBL_DIFFVAL_OFFSET: i32 = 12;
/// Offset of the method-table pointer within [`Vtable`].
pub const VTBL_METHODS_OFFSET: i32 = 16;
/// Offset of the interface-table pointer within [`Vtable`].
pub const VTBL_ITABLE_OFFSET: i32 = 24;
/// Offset of the interface-table length within [`Vtable`].
pub const VTBL_ITABLE_LEN_OFFSET: i32 = 32;

/// Per-class dispatch table, read directly by compiled code.
#[repr(C)]
pub struct Vtable {
    class: AtomicPtr<Class>,
    baseval: AtomicI32,
    diffval: AtomicI32,
    methods: *const AtomicUsize,
    itable: *const *const AtomicUsize,
    itable_len: u32,
    methods_len: u32,
}

// The raw pointers target storage pinned inside the owning Arc<Class>.
unsafe impl Send for Vtable {}
unsafe impl Sync for Vtable {}

impl Vtable {
    /// The owning class.
    ///
    /// # Safety contract
    /// Valid while the owning class is registered; the registry pins classes
    /// until unload.
    pub fn class(&self) -> &Class {
        unsafe { &*self.class.load(Ordering::Acquire) }
    }

    pub fn baseval(&self) -> i32 {
        self.baseval.load(Ordering::Acquire)
    }

    pub fn diffval(&self) -> i32 {
        self.diffval.load(Ordering::Acquire)
    }

    pub(crate) fn set_range(&self, baseval: i32, diffval: i32) {
        self.baseval.store(baseval, Ordering::Release);
        self.diffval.store(diffval, Ordering::Release);
    }

    /// Subtype-range test: is the class of `self` a subclass of `sup`?
    pub fn is_in_range_of(&self, sup: &Vtable) -> bool {
        let diff = self.baseval().wrapping_sub(sup.baseval()) as u32;
        diff <= sup.diffval() as u32
    }

    /// Number of virtual-dispatch slots behind the method-table pointer.
    pub fn method_count(&self) -> u32 {
        self.methods_len
    }

    /// Whether this class's interface table carries the given interface.
    pub fn implements(&self, interface_index: u32) -> bool {
        if interface_index >= self.itable_len {
            return false;
        }
        let slot = unsafe { *self.itable.add(interface_index as usize) };
        !slot.is_null()
    }
}

/// A declared field with its resolved home.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: Arc<str>,
    pub ty: JavaType,
    pub flags: FieldFlags,
    /// Instance fields: byte offset from the object base.
    /// Static fields: index into the class's static storage.
    pub offset: i32,
}

impl Field {
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }
}

/// Interface-table storage for one implemented interface.
struct ITableBlock {
    interface_index: u32,
    cells: Box<[AtomicUsize]>,
    targets: Box<[Arc<Method>]>,
}

/// A loaded class. Created by the loader through [`ClassBuilder`]; pinned in
/// the registry until unload.
pub struct Class {
    pub name: Arc<str>,
    pub flags: ClassFlags,
    pub super_class: Option<Arc<Class>>,
    pub interfaces: Vec<Arc<Class>>,
    pub fields: Vec<Field>,
    pub methods: Vec<Arc<Method>>,
    /// Header plus instance fields, in bytes.
    pub instance_size: usize,
    /// For array classes: the component descriptor (`I`, `Ljava/lang/Foo;`).
    pub component: Option<Arc<str>>,
    /// Dense index assigned to interfaces for interface-table addressing.
    pub interface_index: Option<u32>,
    statics: Box<[AtomicU64]>,
    /// Virtual-method entry cells, pointed to by the vtable.
    vslots: Box<[AtomicUsize]>,
    /// Target methods for each vtable slot, parallel to `vslots`.
    vtargets: Box<[Arc<Method>]>,
    itable_blocks: Vec<ITableBlock>,
    /// Per-interface pointers indexed by interface index; null = absent.
    itable_ptrs: Box<[*const AtomicUsize]>,
    vtable: Box<Vtable>,
    /// Resolved component class of an array class.
    component_class: OnceCell<Arc<Class>>,
    /// Heap object standing in for `java.lang.Class`; the monitor target of
    /// static synchronized methods. Set by the runtime when prepared.
    mirror: AtomicUsize,
}

unsafe impl Send for Class {}
unsafe impl Sync for Class {}

impl Class {
    pub fn is_interface(&self) -> bool {
        self.flags.contains(ClassFlags::INTERFACE)
    }

    pub fn is_array(&self) -> bool {
        self.component.is_some()
    }

    pub fn vtable(&self) -> &Vtable {
        &self.vtable
    }

    /// Raw vtable pointer, the value stored in object headers.
    pub fn vtable_ptr(&self) -> *const Vtable {
        &*self.vtable as *const Vtable
    }

    /// Address of a static storage cell.
    pub fn static_cell(&self, index: i32) -> &AtomicU64 {
        &self.statics[index as usize]
    }

    pub fn static_count(&self) -> usize {
        self.statics.len()
    }

    /// Find a declared or inherited field.
    pub fn lookup_field(&self, name: &str) -> Option<(&Class, &Field)> {
        if let Some(f) = self.fields.iter().find(|f| &*f.name == name) {
            return Some((self, f));
        }
        self.super_class.as_deref().and_then(|s| s.lookup_field(name))
    }

    /// Find a declared or inherited method by name and descriptor.
    pub fn lookup_method(&self, name: &str, desc: &str) -> Option<Arc<Method>> {
        if let Some(m) = self
            .methods
            .iter()
            .find(|m| &*m.name == name && &*m.desc == desc)
        {
            return Some(m.clone());
        }
        if let Some(m) = self
            .super_class
            .as_deref()
            .and_then(|s| s.lookup_method(name, desc))
        {
            return Some(m);
        }
        self.interfaces
            .iter()
            .find_map(|i| i.lookup_method(name, desc))
    }

    /// Number of virtual-dispatch slots.
    pub fn vtable_len(&self) -> usize {
        self.vslots.len()
    }

    /// Target method of a vtable slot.
    pub fn vtable_target(&self, index: usize) -> &Arc<Method> {
        &self.vtargets[index]
    }

    /// Current entry address in a vtable slot.
    pub fn vtable_entry(&self, index: usize) -> usize {
        self.vslots[index].load(Ordering::Acquire)
    }

    /// Rewrite every dispatch cell whose target is `method` to `entry`.
    /// Called by the compiler stub after a compile and by the runtime when
    /// stubs are first installed.
    pub fn update_dispatch_entries(&self, method: &Arc<Method>, entry: usize) {
        for (slot, target) in self.vslots.iter().zip(self.vtargets.iter()) {
            if Arc::ptr_eq(target, method) {
                slot.store(entry, Ordering::Release);
            }
        }
        for block in &self.itable_blocks {
            for (cell, target) in block.cells.iter().zip(block.targets.iter()) {
                if Arc::ptr_eq(target, method) {
                    cell.store(entry, Ordering::Release);
                }
            }
        }
    }

    /// Position of an interface method within its interface table block.
    pub fn itable_slot_of(interface: &Class, name: &str, desc: &str) -> Option<u16> {
        interface
            .methods
            .iter()
            .filter(|m| !m.is_static())
            .position(|m| &*m.name == name && &*m.desc == desc)
            .map(|i| i as u16)
    }

    pub fn component_class(&self) -> Option<&Arc<Class>> {
        self.component_class.get()
    }

    pub(crate) fn set_component_class(&self, class: Arc<Class>) {
        let _ = self.component_class.set(class);
    }

    /// The mirror object used as the monitor target of static synchronized
    /// methods; 0 until the runtime prepares the class.
    pub fn mirror(&self) -> usize {
        self.mirror.load(Ordering::Acquire)
    }

    pub(crate) fn set_mirror(&self, obj: usize) {
        self.mirror.store(obj, Ordering::Release);
    }

    /// Is `self` assignable to `sup` (class or interface)?
    pub fn is_subtype_of(&self, sup: &Class) -> bool {
        if std::ptr::eq(self, sup) {
            return true;
        }
        if sup.is_interface() {
            match sup.interface_index {
                Some(idx) => self.vtable.implements(idx),
                None => false,
            }
        } else {
            self.vtable.is_in_range_of(&sup.vtable)
        }
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("instance_size", &self.instance_size)
            .field("vtable_len", &self.vslots.len())
            .finish()
    }
}

/// Loader-side construction of a class, the ingestion seam between the
/// out-of-scope class-file parser and the core.
pub struct ClassBuilder {
    name: Arc<str>,
    flags: ClassFlags,
    super_class: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
    fields: Vec<(Arc<str>, JavaType, FieldFlags)>,
    methods: Vec<Method>,
    component: Option<Arc<str>>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        ClassBuilder {
            name: name.into(),
            flags: ClassFlags::PUBLIC | ClassFlags::SUPER,
            super_class: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            component: None,
        }
    }

    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn super_class(mut self, super_class: Arc<Class>) -> Self {
        self.super_class = Some(super_class);
        self
    }

    pub fn interface(mut self, interface: Arc<Class>) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn field(mut self, name: impl Into<Arc<str>>, ty: JavaType) -> Self {
        self.fields.push((name.into(), ty, FieldFlags::PUBLIC));
        self
    }

    pub fn static_field(mut self, name: impl Into<Arc<str>>, ty: JavaType) -> Self {
        self.fields
            .push((name.into(), ty, FieldFlags::PUBLIC | FieldFlags::STATIC));
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub(crate) fn component(mut self, desc: Arc<str>) -> Self {
        self.component = Some(desc);
        self
    }

    pub(crate) fn peek_flags(&self) -> ClassFlags {
        self.flags
    }

    /// Lay the class out and build its dispatch tables.
    ///
    /// `interface_index` is assigned by the registry for interfaces;
    /// `itable_universe` is the number of interface indices known so far.
    pub(crate) fn build(self, interface_index: Option<u32>, itable_universe: u32) -> Arc<Class> {
        // Field layout: every instance field takes one 8-byte slot after the
        // header; statics index into the class's own storage.
        let base = self
            .super_class
            .as_deref()
            .map(|s| s.instance_size)
            .unwrap_or(OBJECT_HEADER_SIZE as usize);
        let mut instance_size = base;
        let mut static_count = 0usize;
        let mut fields = Vec::with_capacity(self.fields.len());
        for (name, ty, flags) in self.fields {
            let offset = if flags.contains(FieldFlags::STATIC) {
                let idx = static_count as i32;
                static_count += 1;
                idx
            } else {
                let off = instance_size as i32;
                instance_size += 8;
                off
            };
            fields.push(Field {
                name,
                ty,
                flags,
                offset,
            });
        }

        let methods: Vec<Arc<Method>> = self.methods.into_iter().map(Arc::new).collect();

        // Virtual method table: inherit the super's slots, override on
        // (name, descriptor) match, append fresh virtuals.
        let mut vtargets: Vec<Arc<Method>> = match self.super_class.as_deref() {
            Some(s) => s.vtargets.to_vec(),
            None => Vec::new(),
        };
        for m in &methods {
            if m.is_static() || &*m.name == "<init>" {
                continue;
            }
            let existing = vtargets
                .iter()
                .position(|t| t.name == m.name && t.desc == m.desc);
            match existing {
                Some(idx) => {
                    m.set_vtable_index(idx as u16);
                    vtargets[idx] = m.clone();
                }
                None => {
                    m.set_vtable_index(vtargets.len() as u16);
                    vtargets.push(m.clone());
                }
            }
        }
        let vslots: Box<[AtomicUsize]> = vtargets.iter().map(|_| AtomicUsize::new(0)).collect();
        let vtargets: Box<[Arc<Method>]> = vtargets.into();

        // Interface tables: one block per implemented interface (directly or
        // through the superclass), each resolving the interface's methods
        // against this class's lookup chain.
        let mut implemented: Vec<Arc<Class>> = Vec::new();
        if let Some(s) = self.super_class.as_deref() {
            for block in &s.itable_blocks {
                // Re-derive the interface from the super's list.
                for ifc in s.all_interfaces() {
                    if ifc.interface_index == Some(block.interface_index)
                        && !implemented.iter().any(|i| Arc::ptr_eq(i, &ifc))
                    {
                        implemented.push(ifc);
                    }
                }
            }
        }
        for ifc in &self.interfaces {
            if !implemented.iter().any(|i| Arc::ptr_eq(i, ifc)) {
                implemented.push(ifc.clone());
            }
        }

        let mut itable_blocks = Vec::new();
        let mut itable_ptrs: Vec<*const AtomicUsize> =
            vec![std::ptr::null(); itable_universe as usize];
        for ifc in &implemented {
            let Some(idx) = ifc.interface_index else {
                continue;
            };
            let mut targets = Vec::new();
            for im in ifc.methods.iter().filter(|m| !m.is_static()) {
                // Resolve against this class; default to the interface's own
                // method when the class does not provide one.
                let target = methods
                    .iter()
                    .find(|m| m.name == im.name && m.desc == im.desc)
                    .cloned()
                    .or_else(|| {
                        vtargets
                            .iter()
                            .find(|t| t.name == im.name && t.desc == im.desc)
                            .cloned()
                    })
                    .unwrap_or_else(|| im.clone());
                targets.push(target);
            }
            let cells: Box<[AtomicUsize]> = targets.iter().map(|_| AtomicUsize::new(0)).collect();
            itable_blocks.push(ITableBlock {
                interface_index: idx,
                cells,
                targets: targets.into(),
            });
        }
        for block in &itable_blocks {
            itable_ptrs[block.interface_index as usize] = block.cells.as_ptr();
        }
        let itable_ptrs: Box<[*const AtomicUsize]> = itable_ptrs.into();

        let vtable = Box::new(Vtable {
            class: AtomicPtr::new(std::ptr::null_mut()),
            baseval: AtomicI32::new(0),
            diffval: AtomicI32::new(0),
            methods: vslots.as_ptr(),
            itable: itable_ptrs.as_ptr(),
            itable_len: itable_universe,
            methods_len: vslots.len() as u32,
        });

        let class = Arc::new(Class {
            name: self.name,
            flags: self.flags,
            super_class: self.super_class,
            interfaces: self.interfaces,
            fields,
            methods,
            instance_size,
            component: self.component,
            interface_index,
            statics: (0..static_count).map(|_| AtomicU64::new(0)).collect(),
            vslots,
            vtargets,
            itable_blocks,
            itable_ptrs,
            vtable,
            component_class: OnceCell::new(),
            mirror: AtomicUsize::new(0),
        });

        // Back-pointer from the pinned vtable to the pinned class.
        let ptr = Arc::as_ptr(&class) as *mut Class;
        class.vtable.class.store(ptr, Ordering::Release);
        for m in &class.methods {
            m.set_class(Arc::downgrade(&class));
        }
        class
    }
}

impl Class {
    /// Interfaces implemented directly or through supertypes.
    pub fn all_interfaces(&self) -> Vec<Arc<Class>> {
        let mut out: Vec<Arc<Class>> = Vec::new();
        let mut cur = Some(self);
        while let Some(c) = cur {
            for i in &c.interfaces {
                if !out.iter().any(|o| Arc::ptr_eq(o, i)) {
                    out.push(i.clone());
                    for nested in i.all_interfaces() {
                        if !out.iter().any(|o| Arc::ptr_eq(o, &nested)) {
                            out.push(nested);
                        }
                    }
                }
            }
            cur = c.super_class.as_deref();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::constant_pool::ConstantPool;
    use crate::classfile::descriptor::MethodDescriptor;
    use crate::classfile::flags::MethodFlags;

    fn virtual_method(name: &str, desc: &str) -> Method {
        Method::new(
            name,
            desc,
            MethodDescriptor::parse(desc).unwrap(),
            MethodFlags::PUBLIC,
            2,
            2,
            Box::new([0xb1]),
            vec![],
            vec![],
            Arc::new(ConstantPool::new()),
        )
    }

    #[test]
    fn test_field_layout() {
        let c = ClassBuilder::new("P")
            .field("a", JavaType::Int)
            .field("b", JavaType::Long)
            .static_field("s", JavaType::Int)
            .build(None, 0);
        assert_eq!(c.fields[0].offset, OBJECT_HEADER_SIZE);
        assert_eq!(c.fields[1].offset, OBJECT_HEADER_SIZE + 8);
        assert_eq!(c.fields[2].offset, 0);
        assert_eq!(c.instance_size, OBJECT_HEADER_SIZE as usize + 16);
        assert_eq!(c.static_count(), 1);
    }

    #[test]
    fn test_subclass_layout_continues() {
        let p = ClassBuilder::new("P").field("a", JavaType::Int).build(None, 0);
        let c = ClassBuilder::new("C")
            .super_class(p)
            .field("b", JavaType::Int)
            .build(None, 0);
        assert_eq!(c.fields[0].offset, OBJECT_HEADER_SIZE + 8);
        let (owner, f) = c.lookup_field("a").unwrap();
        assert_eq!(&*owner.name, "P");
        assert_eq!(f.offset, OBJECT_HEADER_SIZE);
    }

    #[test]
    fn test_vtable_override() {
        let p = ClassBuilder::new("P")
            .method(virtual_method("f", "()I"))
            .method(virtual_method("g", "()I"))
            .build(None, 0);
        let c = ClassBuilder::new("C")
            .super_class(p.clone())
            .method(virtual_method("g", "()I"))
            .method(virtual_method("h", "()I"))
            .build(None, 0);

        assert_eq!(p.vtable_len(), 2);
        assert_eq!(c.vtable_len(), 3);
        // g keeps the parent's slot, h is appended.
        let g = c.lookup_method("g", "()I").unwrap();
        assert_eq!(g.vtable_index(), Some(1));
        let h = c.lookup_method("h", "()I").unwrap();
        assert_eq!(h.vtable_index(), Some(2));
        // Slot 0 still targets the parent's f.
        assert_eq!(&*c.vtable_target(0).name, "f");
    }

    #[test]
    fn test_dispatch_entry_update() {
        let p = ClassBuilder::new("P")
            .method(virtual_method("f", "()I"))
            .build(None, 0);
        let f = p.lookup_method("f", "()I").unwrap();
        assert_eq!(p.vtable_entry(0), 0);
        p.update_dispatch_entries(&f, 0x4242);
        assert_eq!(p.vtable_entry(0), 0x4242);
    }

    #[test]
    fn test_subtype_ranges() {
        let a = ClassBuilder::new("A").build(None, 0);
        let b = ClassBuilder::new("B").super_class(a.clone()).build(None, 0);
        // Ranges assigned manually here; the registry normally renumbers.
        a.vtable().set_range(1, 1);
        b.vtable().set_range(2, 0);
        assert!(b.is_subtype_of(&a));
        assert!(!a.is_subtype_of(&b));
        assert!(a.is_subtype_of(&a));
    }

    #[test]
    fn test_vtable_back_pointer() {
        let a = ClassBuilder::new("A").build(None, 0);
        assert_eq!(&*a.vtable().class().name, "A");
    }
}
