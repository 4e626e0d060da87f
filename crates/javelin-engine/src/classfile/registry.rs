//! Classloader-indexed class registry
//!
//! The cache the core resolves symbolic references against. Lookup is
//! lock-free on the hot path (`DashMap`); structural operations (defining a
//! class, renumbering the subtype ranges) serialize on one mutex.
//!
//! Subtype ranges use the classic preorder numbering: each class gets
//! `baseval` on a DFS walk and `diffval` spanning its subtree, so
//! `sub.baseval - super.baseval <= super.diffval` (unsigned) decides
//! subclassing in O(1). Loading a class renumbers under the lock; compiled
//! code reloads the range from the vtable on every check, so it only needs
//! the values to be consistent, not stable.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::class::{Class, ClassBuilder};
use super::constant_pool::{FieldHome, FieldRef, MethodRef};
use super::flags::{ClassFlags, FieldFlags};
use super::method::Method;
use crate::error::{JavaKind, JavaThrowable};

/// Global registry of loaded classes.
pub struct ClassRegistry {
    classes: DashMap<Arc<str>, Arc<Class>>,
    structure: Mutex<Structure>,
}

#[derive(Default)]
struct Structure {
    /// Definition order, for deterministic renumbering.
    order: Vec<Arc<Class>>,
    next_interface_index: u32,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry {
            classes: DashMap::new(),
            structure: Mutex::new(Structure::default()),
        }
    }

    /// Define a class from the loader's builder, assign its interface index
    /// if it is an interface, and renumber the subtype ranges.
    pub fn define(&self, builder: ClassBuilder) -> Arc<Class> {
        let mut st = self.structure.lock();
        let is_interface = builder_is_interface(&builder);
        let interface_index = if is_interface {
            let idx = st.next_interface_index;
            st.next_interface_index = idx + 1;
            Some(idx)
        } else {
            None
        };
        let class = builder.build(interface_index, st.next_interface_index);
        self.classes.insert(class.name.clone(), class.clone());
        st.order.push(class.clone());
        Self::renumber(&st.order);
        class
    }

    /// Look up a loaded class; array classes materialize on demand.
    pub fn lookup(&self, name: &str) -> Option<Arc<Class>> {
        if let Some(c) = self.classes.get(name) {
            return Some(c.clone());
        }
        if name.starts_with('[') {
            return Some(self.array_class(&name[1..]));
        }
        None
    }

    /// The array class with the given component descriptor.
    pub fn array_class(&self, component: &str) -> Arc<Class> {
        let name: Arc<str> = Arc::from(format!("[{}", component));
        if let Some(c) = self.classes.get(&*name) {
            return c.clone();
        }
        // Resolve the component class outside the structure lock; nested
        // arrays recurse here.
        let component_class = if let Some(elem) =
            component.strip_prefix('L').and_then(|s| s.strip_suffix(';'))
        {
            self.classes.get(elem).map(|c| c.clone())
        } else if component.starts_with('[') {
            Some(self.array_class(&component[1..]))
        } else {
            None
        };

        let mut st = self.structure.lock();
        // Re-check under the lock.
        if let Some(c) = self.classes.get(&*name) {
            return c.clone();
        }
        let mut builder = ClassBuilder::new(name.clone())
            .flags(ClassFlags::PUBLIC | ClassFlags::FINAL)
            .component(Arc::from(component));
        if let Some(object) = self.classes.get("java/lang/Object") {
            builder = builder.super_class(object.clone());
        }
        let class = builder.build(None, st.next_interface_index);
        if let Some(cc) = component_class {
            class.set_component_class(cc);
        }
        self.classes.insert(name, class.clone());
        st.order.push(class.clone());
        Self::renumber(&st.order);
        class
    }

    /// Visit every registered class.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Class>)) {
        for entry in self.classes.iter() {
            f(entry.value());
        }
    }

    /// Remove a class on unload. The caller is responsible for retiring the
    /// compiled code of its methods first.
    pub fn remove(&self, name: &str) -> Option<Arc<Class>> {
        let mut st = self.structure.lock();
        let removed = self.classes.remove(name).map(|(_, c)| c);
        if let Some(c) = &removed {
            st.order.retain(|o| !Arc::ptr_eq(o, c));
            Self::renumber(&st.order);
        }
        removed
    }

    /// Resolve a symbolic class reference.
    pub fn resolve_class(&self, name: &str) -> Result<Arc<Class>, JavaThrowable> {
        self.lookup(name)
            .ok_or_else(|| JavaThrowable::with_message(JavaKind::NoClassDefFoundError, name))
    }

    /// Resolve a field reference; `expect_static` comes from the using
    /// opcode (getstatic/putstatic vs getfield/putfield).
    pub fn resolve_field(
        &self,
        fr: &FieldRef,
        expect_static: bool,
    ) -> Result<(Arc<Class>, FieldHome), JavaThrowable> {
        if let Some((class, home)) = fr.get() {
            return Ok((class.clone(), home.clone()));
        }
        let class = self.resolve_class(&fr.class_name)?;
        let (owner, field) = class.lookup_field(&fr.name).ok_or_else(|| {
            JavaThrowable::with_message(
                JavaKind::NoSuchFieldError,
                format!("{}.{}", fr.class_name, fr.name),
            )
        })?;
        if field.is_static() != expect_static {
            return Err(JavaThrowable::with_message(
                JavaKind::IncompatibleClassChangeError,
                format!("{}.{}", fr.class_name, fr.name),
            ));
        }
        let owner = self.resolve_class(&owner.name)?;
        let home = if field.flags.contains(FieldFlags::STATIC) {
            FieldHome::Static {
                cell: owner.static_cell(field.offset) as *const _,
            }
        } else {
            FieldHome::Instance {
                offset: field.offset,
            }
        };
        fr.install(owner.clone(), home.clone());
        Ok((owner, home))
    }

    /// Resolve a method reference.
    pub fn resolve_method(&self, mr: &MethodRef) -> Result<Arc<Method>, JavaThrowable> {
        if let Some(m) = mr.get() {
            return Ok(m.clone());
        }
        let class = self.resolve_class(&mr.class_name)?;
        let method = class.lookup_method(&mr.name, &mr.desc).ok_or_else(|| {
            JavaThrowable::with_message(
                JavaKind::NoSuchMethodError,
                format!("{}.{}{}", mr.class_name, mr.name, mr.desc),
            )
        })?;
        mr.install(method.clone());
        Ok(method)
    }

    /// Reassign `baseval`/`diffval` for every class. Called with the
    /// structure lock held.
    fn renumber(order: &[Arc<Class>]) {
        // Children in definition order keeps the numbering deterministic.
        let roots: Vec<&Arc<Class>> = order
            .iter()
            .filter(|c| c.super_class.is_none() && !c.is_interface())
            .collect();
        let mut next = 1i32;
        for root in roots {
            Self::number_subtree(root, order, &mut next);
        }
        // Interfaces sit outside the range scheme; give them an empty range
        // so an accidental range test never matches.
        for c in order.iter().filter(|c| c.is_interface()) {
            c.vtable().set_range(-1, -1);
        }
    }

    fn number_subtree(class: &Arc<Class>, order: &[Arc<Class>], next: &mut i32) -> i32 {
        let base = *next;
        *next += 1;
        let mut last = base;
        for child in order
            .iter()
            .filter(|c| matches!(&c.super_class, Some(s) if Arc::ptr_eq(s, class)))
        {
            last = Self::number_subtree(child, order, next);
        }
        class.vtable().set_range(base, last - base);
        last
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builder_is_interface(builder: &ClassBuilder) -> bool {
    builder.peek_flags().contains(ClassFlags::INTERFACE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::descriptor::JavaType;

    #[test]
    fn test_define_and_lookup() {
        let reg = ClassRegistry::new();
        let a = reg.define(ClassBuilder::new("A"));
        assert!(Arc::ptr_eq(&reg.lookup("A").unwrap(), &a));
        assert!(reg.lookup("B").is_none());
    }

    #[test]
    fn test_subtype_numbering() {
        let reg = ClassRegistry::new();
        let a = reg.define(ClassBuilder::new("A"));
        let b = reg.define(ClassBuilder::new("B").super_class(a.clone()));
        let c = reg.define(ClassBuilder::new("C").super_class(b.clone()));
        let d = reg.define(ClassBuilder::new("D").super_class(a.clone()));

        assert!(c.is_subtype_of(&a));
        assert!(c.is_subtype_of(&b));
        assert!(b.is_subtype_of(&a));
        assert!(!b.is_subtype_of(&c));
        assert!(d.is_subtype_of(&a));
        assert!(!d.is_subtype_of(&b));
    }

    #[test]
    fn test_renumber_after_late_load() {
        let reg = ClassRegistry::new();
        let a = reg.define(ClassBuilder::new("A"));
        let b = reg.define(ClassBuilder::new("B").super_class(a.clone()));
        // A sibling loaded later must not fall into B's old range.
        let c = reg.define(ClassBuilder::new("C").super_class(a.clone()));
        assert!(!c.is_subtype_of(&b));
        assert!(c.is_subtype_of(&a));
    }

    #[test]
    fn test_interface_index_assignment() {
        let reg = ClassRegistry::new();
        let i1 = reg.define(ClassBuilder::new("I1").flags(ClassFlags::INTERFACE));
        let i2 = reg.define(ClassBuilder::new("I2").flags(ClassFlags::INTERFACE));
        assert_eq!(i1.interface_index, Some(0));
        assert_eq!(i2.interface_index, Some(1));

        let c = reg.define(ClassBuilder::new("C").interface(i2.clone()));
        assert!(c.is_subtype_of(&i2));
        assert!(!c.is_subtype_of(&i1));
    }

    #[test]
    fn test_array_classes() {
        let reg = ClassRegistry::new();
        let ia = reg.array_class("I");
        assert_eq!(&*ia.name, "[I");
        assert!(ia.is_array());
        // Auto-created through lookup as well, and canonical.
        let again = reg.lookup("[I").unwrap();
        assert!(Arc::ptr_eq(&ia, &again));

        let nested = reg.array_class("[I");
        assert_eq!(&*nested.name, "[[I");
        assert!(Arc::ptr_eq(nested.component_class().unwrap(), &ia));
    }

    #[test]
    fn test_field_resolution() {
        let reg = ClassRegistry::new();
        reg.define(
            ClassBuilder::new("C")
                .field("x", JavaType::Int)
                .static_field("s", JavaType::Int),
        );
        let fr = FieldRef::new("C", "x", JavaType::Int);
        let (_, home) = reg.resolve_field(&fr, false).unwrap();
        assert!(matches!(home, FieldHome::Instance { offset } if offset >= 16));

        // Static-ness mismatch is an incompatible class change.
        let fr = FieldRef::new("C", "x", JavaType::Int);
        let err = reg.resolve_field(&fr, true).unwrap_err();
        assert_eq!(err.kind, JavaKind::IncompatibleClassChangeError);

        let fr = FieldRef::new("C", "missing", JavaType::Int);
        let err = reg.resolve_field(&fr, false).unwrap_err();
        assert_eq!(err.kind, JavaKind::NoSuchFieldError);
    }

    #[test]
    fn test_method_resolution() {
        let reg = ClassRegistry::new();
        let err = reg.resolve_method(&MethodRef::new("Nope", "f", "()V").unwrap());
        assert_eq!(err.unwrap_err().kind, JavaKind::NoClassDefFoundError);
    }
}
