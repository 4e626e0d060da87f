//! PC -> code lookup tree
//!
//! Every published machine-code range is registered here; the stack walker
//! and the exception dispatcher map any return address or faulting PC back
//! to its [`Code`]. An ordered map under a read-write lock: lookups take the
//! read side, publish and unload take the write side.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::code::Code;

/// The global machine-code range tree.
pub struct CodeMap {
    ranges: RwLock<BTreeMap<usize, Arc<Code>>>,
}

impl CodeMap {
    pub fn new() -> Self {
        CodeMap {
            ranges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a published code object by its machine-code range.
    pub fn insert(&self, code: Arc<Code>) {
        let (start, _) = code.code_range();
        self.ranges.write().insert(start, code);
    }

    /// Find the code whose range contains `pc`.
    pub fn lookup(&self, pc: usize) -> Option<Arc<Code>> {
        let ranges = self.ranges.read();
        let (_, code) = ranges.range(..=pc).next_back()?;
        let (start, end) = code.code_range();
        (pc >= start && pc < end).then(|| code.clone())
    }

    /// Remove a range on unload; returns the code if it was present.
    pub fn remove(&self, code: &Arc<Code>) -> Option<Arc<Code>> {
        let (start, _) = code.code_range();
        let mut ranges = self.ranges.write();
        match ranges.get(&start) {
            Some(existing) if Arc::ptr_eq(existing, code) => ranges.remove(&start),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }
}

impl Default for CodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::target::CompiledMethod;
    use std::sync::Weak;

    fn make_code(len: usize) -> Arc<Code> {
        let compiled = CompiledMethod {
            code: vec![0x90; len],
            dseg: vec![],
            dseg_relocs: vec![],
            dseg_block_addrs: vec![],
            strings: vec![],
            frame_size: 8,
            is_leaf: true,
            sync_slot_offset: None,
            int_saved_count: 0,
            float_saved_count: 0,
            dispatch: vec![],
            line_table: vec![],
            patch_refs: vec![],
            call_sites: vec![],
            stack_maps: vec![],
        };
        Code::install(compiled, Weak::new()).unwrap()
    }

    #[test]
    fn test_lookup_hits_every_pc_in_range() {
        let map = CodeMap::new();
        let code = make_code(64);
        map.insert(code.clone());

        let (start, end) = code.code_range();
        for pc in [start, start + 1, end - 1] {
            let found = map.lookup(pc).expect("pc must map to its code");
            assert!(Arc::ptr_eq(&found, &code));
        }
        assert!(map.lookup(end).is_none());
        assert!(map.lookup(start - 1).is_none());
    }

    #[test]
    fn test_multiple_ranges() {
        let map = CodeMap::new();
        let a = make_code(16);
        let b = make_code(16);
        map.insert(a.clone());
        map.insert(b.clone());
        assert_eq!(map.len(), 2);

        let (a_start, _) = a.code_range();
        let (b_start, _) = b.code_range();
        assert!(Arc::ptr_eq(&map.lookup(a_start + 3).unwrap(), &a));
        assert!(Arc::ptr_eq(&map.lookup(b_start + 3).unwrap(), &b));
    }

    #[test]
    fn test_remove_on_unload() {
        let map = CodeMap::new();
        let code = make_code(16);
        map.insert(code.clone());
        let (start, _) = code.code_range();

        assert!(map.remove(&code).is_some());
        assert!(map.lookup(start).is_none());
        assert!(map.remove(&code).is_none());
    }
}
