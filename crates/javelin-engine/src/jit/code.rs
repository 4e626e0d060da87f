//! Compiled-code artifacts
//!
//! A [`Code`] owns one mapped region laid out as
//! `[data segment | pad | method header | machine code]`: constants sit at
//! negative offsets from the entry point and the header immediately precedes
//! it, so the stack walker can step backward from any return address inside
//! the region. The data segment stays on writable pages, since the patcher
//! rewrites 8-byte slots in place, while header and code are remapped
//! read-execute once written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::classfile::constant_pool::ClassRef;
use crate::classfile::method::Method;
use crate::error::JitError;

use super::target::CompiledMethod;

/// One row of the exception-dispatch table, in machine-code offsets.
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    pub start_mpc: u32,
    pub end_mpc: u32,
    pub handler_mpc: u32,
    /// `None` catches everything.
    pub catch_class: Option<Arc<ClassRef>>,
}

/// Where a live reference sits at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefLoc {
    Register(u8),
    /// Byte offset from the stack pointer of the frame.
    Frame(i32),
}

/// Reference locations at one call site, keyed by the return address offset.
#[derive(Debug, Clone)]
pub struct StackMapEntry {
    pub mpc: u32,
    pub refs: Vec<RefLoc>,
}

/// A static/special call site: return-address offset plus the data-segment
/// slot its target address lives in. The compiler stub patches the slot to
/// the real entry point after the first call.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    pub ret_mpc: u32,
    pub dseg_offset: u32,
}

/// Size of the fixed part of the method header.
const HEADER_FIXED: usize = 32;
/// Size of one header exception row: three i32s and a pointer.
const HEADER_EX_ROW: usize = 20;

fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// One mapped region from the code heap.
pub struct ExecutableMemory {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Map `len` bytes read-write.
    pub fn map(len: usize) -> Result<Self, JitError> {
        let len = len.max(1).next_multiple_of(page_size());
        #[cfg(unix)]
        {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(JitError::CodeHeapExhausted(len));
            }
            Ok(ExecutableMemory {
                base: ptr as *mut u8,
                len,
            })
        }
        #[cfg(not(unix))]
        {
            Err(JitError::Codegen("no executable memory on this target".into()))
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remap `[offset, offset+len)` read-execute. `offset` must be
    /// page-aligned.
    pub fn protect_rx(&self, offset: usize, len: usize) -> Result<(), JitError> {
        #[cfg(unix)]
        {
            let rc = unsafe {
                libc::mprotect(
                    self.base.add(offset) as *mut libc::c_void,
                    len.next_multiple_of(page_size()),
                    libc::PROT_READ | libc::PROT_EXEC,
                )
            };
            if rc != 0 {
                return Err(JitError::Codegen("mprotect failed".into()));
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = (offset, len);
            Err(JitError::Codegen("no executable memory on this target".into()))
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// The compiled artifact for one method (or one stub).
pub struct Code {
    mem: ExecutableMemory,
    /// Absolute entry point.
    entry: usize,
    /// Absolute base of the data segment (start of the mapping).
    dseg_base: usize,
    dseg_len: usize,
    code_len: usize,
    /// Owning method; stubs have none.
    pub method: Weak<Method>,
    /// String literals referenced from the data segment.
    pub strings: Vec<Arc<str>>,
    pub frame_size: i32,
    pub is_leaf: bool,
    pub sync_slot_offset: Option<i32>,
    pub int_saved_count: u8,
    pub float_saved_count: u8,
    pub dispatch: Vec<DispatchEntry>,
    pub line_table: Vec<(u32, u16)>,
    pub patch_refs: Vec<Arc<super::patcher::PatchRef>>,
    pub call_sites: Vec<CallSite>,
    pub stack_maps: Vec<StackMapEntry>,
}

unsafe impl Send for Code {}
unsafe impl Sync for Code {}

impl Code {
    /// Place a compiled method in executable memory and write its header.
    pub fn install(
        compiled: CompiledMethod,
        method: Weak<Method>,
    ) -> Result<Arc<Code>, JitError> {
        let page = page_size();
        let dseg_pages = compiled.dseg.len().next_multiple_of(page).max(page);

        let header_len = HEADER_FIXED + HEADER_EX_ROW * compiled.dispatch.len();
        // Pad in front of the header so the entry point is 16-aligned.
        let header_pad = (16 - (header_len % 16)) % 16;
        let text_len = header_pad + header_len + compiled.code.len();
        let total = dseg_pages + text_len;

        let mem = ExecutableMemory::map(total)?;
        let base = mem.base() as usize;
        let dseg_base = base + dseg_pages - compiled.dseg.len().next_multiple_of(16).max(16);
        let entry = base + dseg_pages + header_pad + header_len;

        let code = Arc::new(Code {
            mem,
            entry,
            dseg_base,
            dseg_len: compiled.dseg.len(),
            code_len: compiled.code.len(),
            method: method.clone(),
            strings: compiled.strings,
            frame_size: compiled.frame_size,
            is_leaf: compiled.is_leaf,
            sync_slot_offset: compiled.sync_slot_offset,
            int_saved_count: compiled.int_saved_count,
            float_saved_count: compiled.float_saved_count,
            dispatch: compiled.dispatch,
            line_table: compiled.line_table,
            patch_refs: compiled.patch_refs,
            call_sites: compiled.call_sites,
            stack_maps: compiled.stack_maps,
        });

        unsafe {
            // Data segment.
            std::ptr::copy_nonoverlapping(
                compiled.dseg.as_ptr(),
                code.dseg_base as *mut u8,
                compiled.dseg.len(),
            );

            // Machine code, then the rip-relative fixups into the dseg.
            let code_base = entry as *mut u8;
            std::ptr::copy_nonoverlapping(compiled.code.as_ptr(), code_base, code.code_len);
            for reloc in &compiled.dseg_relocs {
                let target = code.dseg_base + reloc.dseg_offset;
                let next_rip = entry + reloc.code_offset + 4;
                let disp = (target as i64 - next_rip as i64) as i32;
                std::ptr::write_unaligned(code_base.add(reloc.code_offset) as *mut i32, disp);
            }

            // Switch tables: absolute block addresses in the data segment.
            for &(dseg_off, mpc) in &compiled.dseg_block_addrs {
                let addr = (entry + mpc as usize) as u64;
                std::ptr::write_unaligned((code.dseg_base + dseg_off) as *mut u64, addr);
            }

            code.write_header(&method);
        }

        // Header and code become read-execute; the data pages stay writable
        // for the patcher.
        code.mem.protect_rx(dseg_pages, text_len)?;
        Ok(code)
    }

    unsafe fn write_header(&self, method: &Weak<Method>) {
        let e = self.entry;
        let method_ptr = method
            .upgrade()
            .map(|m| Arc::as_ptr(&m) as usize)
            .unwrap_or(0);
        unsafe {
            std::ptr::write_unaligned((e - 8) as *mut usize, method_ptr);
            std::ptr::write_unaligned((e - 12) as *mut i32, self.frame_size);
            std::ptr::write_unaligned(
                (e - 16) as *mut i32,
                self.sync_slot_offset.map(|o| o + 1).unwrap_or(0),
            );
            std::ptr::write_unaligned((e - 20) as *mut i32, self.is_leaf as i32);
            std::ptr::write_unaligned((e - 24) as *mut i32, self.int_saved_count as i32);
            std::ptr::write_unaligned((e - 28) as *mut i32, self.float_saved_count as i32);
            std::ptr::write_unaligned((e - 32) as *mut i32, self.dispatch.len() as i32);
            for (i, row) in self.dispatch.iter().enumerate() {
                let row_base = e - HEADER_FIXED - HEADER_EX_ROW * (i + 1);
                std::ptr::write_unaligned(row_base as *mut i32, row.start_mpc as i32);
                std::ptr::write_unaligned((row_base + 4) as *mut i32, row.end_mpc as i32);
                std::ptr::write_unaligned((row_base + 8) as *mut i32, row.handler_mpc as i32);
                let catch_ptr = row
                    .catch_class
                    .as_ref()
                    .map(|c| Arc::as_ptr(c) as usize)
                    .unwrap_or(0);
                std::ptr::write_unaligned((row_base + 12) as *mut usize, catch_ptr);
            }
        }
    }

    pub fn entry_point(&self) -> usize {
        self.entry
    }

    /// The machine-code range, for the PC -> code map.
    pub fn code_range(&self) -> (usize, usize) {
        (self.entry, self.entry + self.code_len)
    }

    pub fn dseg_base(&self) -> usize {
        self.dseg_base
    }

    pub fn dseg_len(&self) -> usize {
        self.dseg_len
    }

    /// Read a data-segment slot.
    pub fn dseg_read(&self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= self.dseg_len);
        let cell = unsafe { &*((self.dseg_base + offset) as *const AtomicU64) };
        cell.load(Ordering::Acquire)
    }

    /// Publish a resolved value into a data-segment slot. Aligned 8-byte
    /// store: a racing executor reads either the placeholder or the final
    /// value, never a tear.
    pub fn dseg_write(&self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= self.dseg_len);
        debug_assert_eq!((self.dseg_base + offset) % 8, 0);
        let cell = unsafe { &*((self.dseg_base + offset) as *const AtomicU64) };
        cell.store(value, Ordering::Release);
    }
}

/// Reader for the method header preceding an entry point.
///
/// The walker finds the entry through the PC -> code map and steps backward
/// from it.
#[derive(Clone, Copy)]
pub struct HeaderReader {
    entry: usize,
}

impl HeaderReader {
    pub fn new(entry: usize) -> Self {
        HeaderReader { entry }
    }

    fn read_i32(&self, back: usize) -> i32 {
        unsafe { std::ptr::read_unaligned((self.entry - back) as *const i32) }
    }

    pub fn method_ptr(&self) -> usize {
        unsafe { std::ptr::read_unaligned((self.entry - 8) as *const usize) }
    }

    pub fn frame_size(&self) -> i32 {
        self.read_i32(12)
    }

    /// Frame offset of the saved monitor target, if synchronized.
    pub fn sync_slot_offset(&self) -> Option<i32> {
        match self.read_i32(16) {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.read_i32(20) != 0
    }

    pub fn int_saved_count(&self) -> u8 {
        self.read_i32(24) as u8
    }

    pub fn float_saved_count(&self) -> u8 {
        self.read_i32(28) as u8
    }

    pub fn ex_table_len(&self) -> usize {
        self.read_i32(32) as usize
    }

    /// (start_mpc, end_mpc, handler_mpc, catch classref pointer).
    pub fn ex_entry(&self, i: usize) -> (u32, u32, u32, *const ClassRef) {
        let row_base = self.entry - HEADER_FIXED - HEADER_EX_ROW * (i + 1);
        unsafe {
            (
                std::ptr::read_unaligned(row_base as *const i32) as u32,
                std::ptr::read_unaligned((row_base + 4) as *const i32) as u32,
                std::ptr::read_unaligned((row_base + 8) as *const i32) as u32,
                std::ptr::read_unaligned((row_base + 12) as *const usize) as *const ClassRef,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_compiled(code: Vec<u8>, dseg: Vec<u8>) -> CompiledMethod {
        CompiledMethod {
            code,
            dseg,
            dseg_relocs: vec![],
            dseg_block_addrs: vec![],
            strings: vec![],
            frame_size: 24,
            is_leaf: true,
            sync_slot_offset: None,
            int_saved_count: 2,
            float_saved_count: 0,
            dispatch: vec![],
            line_table: vec![],
            patch_refs: vec![],
            call_sites: vec![],
            stack_maps: vec![],
        }
    }

    #[test]
    fn test_install_layout() {
        let code = Code::install(dummy_compiled(vec![0xc3], vec![0u8; 24]), Weak::new()).unwrap();
        let entry = code.entry_point();
        assert_eq!(entry % 16, 0);
        // Data segment ends below the entry point.
        assert!(code.dseg_base() + code.dseg_len() <= entry);
        let (start, end) = code.code_range();
        assert_eq!(start, entry);
        assert_eq!(end - start, 1);
        // The ret byte landed at the entry.
        assert_eq!(unsafe { *(entry as *const u8) }, 0xc3);
    }

    #[test]
    fn test_header_round_trip() {
        let mut compiled = dummy_compiled(vec![0xc3], vec![]);
        compiled.sync_slot_offset = Some(16);
        compiled.is_leaf = false;
        compiled.dispatch = vec![DispatchEntry {
            start_mpc: 4,
            end_mpc: 20,
            handler_mpc: 28,
            catch_class: None,
        }];
        let code = Code::install(compiled, Weak::new()).unwrap();

        let h = HeaderReader::new(code.entry_point());
        assert_eq!(h.frame_size(), 24);
        assert_eq!(h.sync_slot_offset(), Some(16));
        assert!(!h.is_leaf());
        assert_eq!(h.int_saved_count(), 2);
        assert_eq!(h.float_saved_count(), 0);
        assert_eq!(h.ex_table_len(), 1);
        let (s, e, hh, c) = h.ex_entry(0);
        assert_eq!((s, e, hh), (4, 20, 28));
        assert!(c.is_null());
    }

    #[test]
    fn test_dseg_negative_offsets_and_patching() {
        let dseg = (0u64..4).flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
        let code = Code::install(dummy_compiled(vec![0xc3], dseg), Weak::new()).unwrap();
        assert_eq!(code.dseg_read(8), 1);
        assert_eq!(code.dseg_read(24), 3);
        // Slots stay writable after install.
        code.dseg_write(8, 0xdead_beef);
        assert_eq!(code.dseg_read(8), 0xdead_beef);
    }

    #[test]
    fn test_dseg_reloc_resolution() {
        use crate::jit::target::DsegReloc;
        // lea rax, [rip+disp] where disp targets dseg slot 8.
        let code_bytes = vec![0x48, 0x8d, 0x05, 0, 0, 0, 0, 0xc3];
        let mut compiled = dummy_compiled(code_bytes, vec![0u8; 16]);
        compiled.dseg_relocs = vec![DsegReloc {
            code_offset: 3,
            dseg_offset: 8,
        }];
        let code = Code::install(compiled, Weak::new()).unwrap();
        let entry = code.entry_point();
        let disp = unsafe { std::ptr::read_unaligned((entry + 3) as *const i32) };
        let target = (entry + 7).wrapping_add(disp as usize);
        assert_eq!(target, code.dseg_base() + 8);
    }
}
