//! Object headers and the allocation interface
//!
//! Every heap object starts with the two-word header compiled code knows:
//! the vtable pointer and the monitor word. Arrays add a length word and
//! 8-aligned element storage. The collector internals live outside the core;
//! this module is the allocation seam it plugs into, here backed by a pinned
//! arena so object addresses are stable for compiled code.

use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::classfile::class::{Class, Vtable, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET};
use crate::error::{JavaKind, JavaThrowable};
use crate::runtime::monitor::{dummy_lock_record, LockRecord};

/// The header every object begins with.
#[repr(C)]
pub struct ObjectHeader {
    pub vtbl: *const Vtable,
    pub monitor: AtomicPtr<LockRecord>,
}

impl ObjectHeader {
    /// The object's class, through its vtable.
    ///
    /// # Safety
    /// The header must belong to a live object of a registered class.
    pub unsafe fn class<'a>(&self) -> &'a Class {
        unsafe { (*self.vtbl).class() }
    }
}

/// Length of an array object.
///
/// # Safety
/// `obj` must point at a live array object.
pub unsafe fn array_length(obj: *const ObjectHeader) -> i32 {
    unsafe { *((obj as usize + ARRAY_LENGTH_OFFSET as usize) as *const i32) }
}

/// Pointer to the first element of an array object.
///
/// # Safety
/// `obj` must point at a live array object.
pub unsafe fn array_data(obj: *const ObjectHeader) -> *mut u8 {
    (obj as usize + ARRAY_DATA_OFFSET as usize) as *mut u8
}

/// Bump-arena heap behind the allocation interface.
///
/// Blocks are pinned for the life of the VM; compiled code and lock records
/// hold raw addresses into them.
pub struct Heap {
    blocks: Mutex<Vec<Box<[u64]>>>,
    limit: usize,
    allocated: Mutex<usize>,
}

impl Heap {
    pub fn new(limit: usize) -> Self {
        Heap {
            blocks: Mutex::new(Vec::new()),
            limit,
            allocated: Mutex::new(0),
        }
    }

    fn alloc_words(&self, words: usize) -> Result<*mut u64, JavaThrowable> {
        let mut allocated = self.allocated.lock();
        if *allocated + words * 8 > self.limit {
            return Err(JavaThrowable::new(JavaKind::OutOfMemoryError));
        }
        *allocated += words * 8;
        drop(allocated);

        let block: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let ptr = block.as_ptr() as *mut u64;
        self.blocks.lock().push(block);
        Ok(ptr)
    }

    /// Allocate a zeroed instance of `class` with its header set up.
    pub fn alloc_object(&self, class: &Class) -> Result<*mut ObjectHeader, JavaThrowable> {
        let words = class.instance_size.div_ceil(8).max(2);
        let ptr = self.alloc_words(words)? as *mut ObjectHeader;
        unsafe {
            (*ptr).vtbl = class.vtable_ptr();
            (*ptr).monitor = AtomicPtr::new(dummy_lock_record());
        }
        Ok(ptr)
    }

    /// Allocate a zeroed array of `len` elements of `elem_size` bytes.
    pub fn alloc_array(
        &self,
        class: &Class,
        elem_size: usize,
        len: i32,
    ) -> Result<*mut ObjectHeader, JavaThrowable> {
        if len < 0 {
            return Err(JavaThrowable::with_message(
                JavaKind::NegativeArraySizeException,
                len.to_string(),
            ));
        }
        let bytes = ARRAY_DATA_OFFSET as usize + elem_size * len as usize;
        let ptr = self.alloc_words(bytes.div_ceil(8))? as *mut ObjectHeader;
        unsafe {
            (*ptr).vtbl = class.vtable_ptr();
            (*ptr).monitor = AtomicPtr::new(dummy_lock_record());
            *((ptr as usize + ARRAY_LENGTH_OFFSET as usize) as *mut i32) = len;
        }
        Ok(ptr)
    }

    pub fn bytes_allocated(&self) -> usize {
        *self.allocated.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::class::ClassBuilder;
    use crate::classfile::descriptor::JavaType;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<ObjectHeader>(), 16);
        assert_eq!(memoffset_of_monitor(), 8);
    }

    fn memoffset_of_monitor() -> usize {
        let h = ObjectHeader {
            vtbl: std::ptr::null(),
            monitor: AtomicPtr::new(std::ptr::null_mut()),
        };
        (&h.monitor as *const _ as usize) - (&h as *const _ as usize)
    }

    #[test]
    fn test_alloc_object() {
        let heap = Heap::new(1 << 20);
        let class = ClassBuilder::new("P").field("x", JavaType::Int).build(None, 0);
        let obj = heap.alloc_object(&class).unwrap();
        unsafe {
            assert_eq!((*obj).vtbl, class.vtable_ptr());
            assert_eq!(&*(*obj).class().name, "P");
            // Field storage is zeroed.
            let field = (obj as usize + 16) as *const i64;
            assert_eq!(*field, 0);
        }
    }

    #[test]
    fn test_alloc_array() {
        let heap = Heap::new(1 << 20);
        let class = ClassBuilder::new("[I").build(None, 0);
        let arr = heap.alloc_array(&class, 4, 5).unwrap();
        unsafe {
            assert_eq!(array_length(arr), 5);
            let data = array_data(arr) as *mut i32;
            *data.add(2) = 77;
            assert_eq!(*data.add(2), 77);
        }
    }

    #[test]
    fn test_negative_length() {
        let heap = Heap::new(1 << 20);
        let class = ClassBuilder::new("[I").build(None, 0);
        let err = heap.alloc_array(&class, 4, -1).unwrap_err();
        assert_eq!(err.kind, JavaKind::NegativeArraySizeException);
    }

    #[test]
    fn test_heap_limit() {
        let heap = Heap::new(64);
        let class = ClassBuilder::new("P").build(None, 0);
        assert!(heap.alloc_object(&class).is_ok());
        // Exhausted after a few objects.
        let mut failed = false;
        for _ in 0..8 {
            if heap.alloc_object(&class).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
