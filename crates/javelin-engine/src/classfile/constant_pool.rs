//! Runtime constant pool
//!
//! The parser (out of scope here) delivers pools already structured: literal
//! constants are materialized, symbolic references are [`ClassRef`] /
//! [`FieldRef`] / [`MethodRef`] records that resolve lazily against the
//! [`ClassRegistry`](super::registry::ClassRegistry). A reference that is
//! still unresolved when the compiler meets it becomes a patch site.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::class::Class;
use super::descriptor::{JavaType, MethodDescriptor};
use super::method::Method;
use crate::error::{JavaKind, JavaThrowable};

/// One entry of the runtime constant pool.
///
/// Index 0 and the trailing slot of each long/double entry are `Unused`,
/// matching class-file numbering.
#[derive(Debug, Clone)]
pub enum Constant {
    Unused,
    Utf8(Arc<str>),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    StringLit(Arc<str>),
    Class(Arc<ClassRef>),
    Field(Arc<FieldRef>),
    Method(Arc<MethodRef>),
    InterfaceMethod(Arc<MethodRef>),
}

/// A symbolic class reference with a lazily resolved target.
#[derive(Debug)]
pub struct ClassRef {
    /// Binary name, e.g. `java/lang/Object` or `[I`.
    pub name: Arc<str>,
    resolved: OnceCell<Arc<Class>>,
}

impl ClassRef {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        ClassRef {
            name: name.into(),
            resolved: OnceCell::new(),
        }
    }

    /// The resolved class, if resolution has happened.
    pub fn get(&self) -> Option<&Arc<Class>> {
        self.resolved.get()
    }

    /// Record the resolution result. Racing installs agree by construction
    /// (the registry returns one canonical `Arc` per name).
    pub fn install(&self, class: Arc<Class>) {
        let _ = self.resolved.set(class);
    }
}

/// Where a resolved field lives.
#[derive(Debug, Clone)]
pub enum FieldHome {
    /// Byte offset of the field from the object base.
    Instance { offset: i32 },
    /// Address of the static storage cell inside the owning class.
    Static { cell: *const core::sync::atomic::AtomicU64 },
}

// The static cell pointer targets storage owned by a registered Class, which
// is pinned for the lifetime of the registry.
unsafe impl Send for FieldHome {}
unsafe impl Sync for FieldHome {}

/// A symbolic field reference.
#[derive(Debug)]
pub struct FieldRef {
    pub class_name: Arc<str>,
    pub name: Arc<str>,
    /// Raw field descriptor, e.g. `I` or `Ljava/lang/String;`.
    pub desc: Arc<str>,
    /// Parsed descriptor type.
    pub ty: JavaType,
    resolved: OnceCell<(Arc<Class>, FieldHome)>,
}

impl FieldRef {
    pub fn new(class_name: impl Into<Arc<str>>, name: impl Into<Arc<str>>, ty: JavaType) -> Self {
        let desc: Arc<str> = Arc::from(descriptor_of(&ty));
        FieldRef {
            class_name: class_name.into(),
            name: name.into(),
            desc,
            ty,
            resolved: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Option<&(Arc<Class>, FieldHome)> {
        self.resolved.get()
    }

    pub fn install(&self, class: Arc<Class>, home: FieldHome) {
        let _ = self.resolved.set((class, home));
    }
}

/// A symbolic method reference.
#[derive(Debug)]
pub struct MethodRef {
    pub class_name: Arc<str>,
    pub name: Arc<str>,
    pub desc: Arc<str>,
    pub descriptor: MethodDescriptor,
    resolved: OnceCell<Arc<Method>>,
}

impl MethodRef {
    pub fn new(
        class_name: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        desc: impl Into<Arc<str>>,
    ) -> Result<Self, JavaThrowable> {
        let desc = desc.into();
        let descriptor = MethodDescriptor::parse(&desc).map_err(|_| {
            JavaThrowable::with_message(JavaKind::NoClassDefFoundError, desc.to_string())
        })?;
        Ok(MethodRef {
            class_name: class_name.into(),
            name: name.into(),
            desc,
            descriptor,
            resolved: OnceCell::new(),
        })
    }

    pub fn get(&self) -> Option<&Arc<Method>> {
        self.resolved.get()
    }

    pub fn install(&self, method: Arc<Method>) {
        let _ = self.resolved.set(method);
    }
}

fn descriptor_of(ty: &JavaType) -> String {
    match ty {
        JavaType::Boolean => "Z".into(),
        JavaType::Byte => "B".into(),
        JavaType::Char => "C".into(),
        JavaType::Short => "S".into(),
        JavaType::Int => "I".into(),
        JavaType::Long => "J".into(),
        JavaType::Float => "F".into(),
        JavaType::Double => "D".into(),
        JavaType::Reference(n) => format!("L{};", n),
        JavaType::Array(c) => format!("[{}", c),
    }
}

/// The per-class runtime constant pool.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    /// An empty pool with the reserved zero entry in place.
    pub fn new() -> Self {
        ConstantPool {
            entries: vec![Constant::Unused],
        }
    }

    /// Append an entry and return its index. Long and double entries claim
    /// the following slot as well, per class-file numbering.
    pub fn push(&mut self, c: Constant) -> u16 {
        let idx = self.entries.len() as u16;
        let twoslot = matches!(c, Constant::Long(_) | Constant::Double(_));
        self.entries.push(c);
        if twoslot {
            self.entries.push(Constant::Unused);
        }
        idx
    }

    pub fn get(&self, idx: u16) -> Option<&Constant> {
        self.entries.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_numbering() {
        let mut pool = ConstantPool::new();
        let a = pool.push(Constant::Integer(7));
        let b = pool.push(Constant::Long(1 << 40));
        let c = pool.push(Constant::Integer(9));
        assert_eq!((a, b, c), (1, 2, 4));
        assert!(matches!(pool.get(3), Some(Constant::Unused)));
        assert!(matches!(pool.get(4), Some(Constant::Integer(9))));
    }

    #[test]
    fn test_classref_single_resolution() {
        let r = ClassRef::new("java/lang/Object");
        assert!(r.get().is_none());
        assert_eq!(&*r.name, "java/lang/Object");
    }

    #[test]
    fn test_methodref_descriptor_parse() {
        let r = MethodRef::new("Foo", "bar", "(IJ)V").unwrap();
        assert_eq!(r.descriptor.param_slots, 3);
        assert!(MethodRef::new("Foo", "bar", "(Q)V").is_err());
    }

    #[test]
    fn test_fieldref_desc_text() {
        let r = FieldRef::new("Foo", "x", JavaType::Reference(Arc::from("java/lang/String")));
        assert_eq!(&*r.desc, "Ljava/lang/String;");
        let r = FieldRef::new("Foo", "y", JavaType::Array(Arc::from("I")));
        assert_eq!(&*r.desc, "[I");
    }
}
