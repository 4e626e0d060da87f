//! x86-64 System V back-end
//!
//! Lowers allocated IR block by block in source order. Frames are rsp-based
//! (no frame pointer): spill slots at the bottom, saved registers at the
//! top, the frame size chosen so rsp stays 16-byte aligned at call sites.
//! The data segment is reached rip-relative, so no register is reserved for
//! a procedure vector. RAX carries exception objects and R10 the faulting
//! PC when control enters the dispatch trampoline.
//!
//! Scratch registers never handed to the allocator: RAX/R10/R11, RCX and
//! RDX (shift and division clobbers), XMM12-XMM15.

pub mod asm;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use self::asm::reg::*;
use self::asm::xmm::*;
use self::asm::{Alu, Asm, Cc};
use super::{CompiledMethod, DsegReloc, NativeBackend, ParamMode, RegisterSet, RuntimeAnchors};
use crate::classfile::class::{
    ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, VTBL_BASEVAL_OFFSET, VTBL_DIFFVAL_OFFSET,
    VTBL_ITABLE_OFFSET, VTBL_METHODS_OFFSET,
};
use crate::classfile::constant_pool::{ClassRef, FieldHome, FieldRef};
use crate::classfile::descriptor::ValueType;
use crate::classfile::method::Method;
use crate::error::JitError;
use crate::jit::code::{CallSite, DispatchEntry, RefLoc, StackMapEntry};
use crate::jit::ir::*;
use crate::jit::patcher::{PatchKind, PatchRef};
use crate::jit::regalloc::FrameAlloc;
use crate::runtime::builtins::kind as throw_kind;

const ITMP1: u8 = RAX;
const ITMP2: u8 = R10;
const ITMP3: u8 = R11;
const FTMP1: u8 = XMM12;
const FTMP2: u8 = XMM13;
const FZERO: u8 = XMM15;

/// Canonical save order for the callee-saved registers; the unwinder
/// restores the first `int_saved_count` of these.
pub const SAVED_ORDER: [u8; 6] = [RBX, RBP, R12, R13, R14, R15];

static REGISTER_SET: RegisterSet = RegisterSet {
    int_args: &[RDI, RSI, RDX, RCX, R8, R9],
    float_args: &[0, 1, 2, 3, 4, 5, 6, 7],
    int_tmps: &[RSI, RDI, R8, R9],
    int_saved: &[RBX, RBP, R12, R13, R14, R15],
    float_tmps: &[XMM8, XMM9, XMM10, XMM11],
    float_saved: &[],
    int_ret: RAX,
    float_ret: XMM0,
    param_mode: ParamMode::Used,
};

/// The x86-64 backend.
pub struct Backend;

impl Backend {
    pub fn new() -> Self {
        Backend
    }

    pub fn register_set_static(&self) -> &'static RegisterSet {
        &REGISTER_SET
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend for Backend {
    fn name(&self) -> &str {
        "x86_64"
    }

    fn register_set(&self) -> &RegisterSet {
        &REGISTER_SET
    }

    fn compile(
        &self,
        method: &Method,
        ir: &IrMethod,
        frame: &FrameAlloc,
        anchors: &RuntimeAnchors,
    ) -> Result<CompiledMethod, JitError> {
        Emitter::new(method, ir, frame, anchors).run()
    }
}

/// A resolved operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Reg(u8),
    /// Byte offset from rsp (before any transient adjustment).
    Mem(i32),
}

#[derive(Debug, Clone, Copy)]
enum FixTarget {
    Block(BlockId),
    Trailer(usize),
    /// Absolute machine-code offset (trailer back-references).
    Mpc(u32),
}

#[derive(Debug)]
enum Trailer {
    Throw {
        kind: u32,
        site: u32,
        extra: Option<Loc>,
    },
    Pending {
        site: u32,
    },
    Patch {
        pref: Arc<PatchRef>,
        resume: u32,
    },
}

/// Data-segment builder: deduplicated constant words plus unique patchable
/// slots, all 8-byte aligned.
struct Dseg {
    bytes: Vec<u8>,
    dedup: FxHashMap<u64, usize>,
}

impl Dseg {
    fn new() -> Self {
        Dseg {
            bytes: Vec::new(),
            dedup: FxHashMap::default(),
        }
    }

    fn word(&mut self, value: u64) -> usize {
        if let Some(&off) = self.dedup.get(&value) {
            return off;
        }
        let off = self.slot(value);
        self.dedup.insert(value, off);
        off
    }

    fn slot(&mut self, initial: u64) -> usize {
        let off = self.bytes.len();
        self.bytes.extend_from_slice(&initial.to_le_bytes());
        off
    }

    fn reserve_words(&mut self, n: usize) -> usize {
        let off = self.bytes.len();
        self.bytes.resize(off + n * 8, 0);
        off
    }
}

struct Emitter<'a> {
    method: &'a Method,
    ir: &'a IrMethod,
    frame: &'a FrameAlloc,
    anchors: &'a RuntimeAnchors,
    a: Asm,
    dseg: Dseg,
    frame_size: i32,
    /// Transient rsp displacement while outgoing stack arguments are live.
    stack_adj: i32,
    block_mpc: Vec<u32>,
    fixups: Vec<(usize, FixTarget)>,
    trailers: Vec<Trailer>,
    trailer_mpc: Vec<u32>,
    dseg_relocs: Vec<DsegReloc>,
    dseg_block_addrs: Vec<(usize, BlockId)>,
    patch_refs: Vec<Arc<PatchRef>>,
    call_sites: Vec<CallSite>,
    stack_maps: Vec<StackMapEntry>,
    strings: Vec<Arc<str>>,
    /// Reference locations, the same at every call site.
    ref_locs: Vec<RefLoc>,
}

impl<'a> Emitter<'a> {
    fn new(
        method: &'a Method,
        ir: &'a IrMethod,
        frame: &'a FrameAlloc,
        anchors: &'a RuntimeAnchors,
    ) -> Self {
        let raw = (frame.memuse + frame.int_saved_used as u32) as i32 * 8;
        let frame_size = if raw % 16 == 8 { raw } else { raw + 8 };

        let ref_locs = ir
            .slots
            .iter()
            .filter(|s| s.ty == ValueType::Address && (s.kind != SlotKind::Temp || s.saved))
            .map(|s| {
                if s.in_memory {
                    RefLoc::Frame(s.regoff)
                } else {
                    RefLoc::Register(s.regoff as u8)
                }
            })
            .collect();

        Emitter {
            method,
            ir,
            frame,
            anchors,
            a: Asm::new(1024),
            dseg: Dseg::new(),
            frame_size,
            stack_adj: 0,
            block_mpc: vec![0; ir.blocks.len()],
            fixups: Vec::new(),
            trailers: Vec::new(),
            trailer_mpc: Vec::new(),
            dseg_relocs: Vec::new(),
            dseg_block_addrs: Vec::new(),
            patch_refs: Vec::new(),
            call_sites: Vec::new(),
            stack_maps: Vec::new(),
            strings: Vec::new(),
            ref_locs,
        }
    }

    // ===== Operand plumbing =====

    fn loc(&self, id: SlotId) -> Loc {
        let s = self.ir.slot(id);
        if s.in_memory {
            Loc::Mem(s.regoff)
        } else {
            Loc::Reg(s.regoff as u8)
        }
    }

    fn is_float(&self, id: SlotId) -> bool {
        self.ir.slot(id).ty.is_float()
    }

    fn is_single(&self, id: SlotId) -> bool {
        self.ir.slot(id).ty == ValueType::Float
    }

    /// Bring an integer-family slot into a register.
    fn int_src(&mut self, id: SlotId, scratch: u8) -> u8 {
        match self.loc(id) {
            Loc::Reg(r) => r,
            Loc::Mem(off) => {
                let off = off + self.stack_adj;
                self.a.load(true, scratch, RSP, off);
                scratch
            }
        }
    }

    /// Register the result of an integer op should be computed in.
    fn int_dst(&mut self, id: SlotId, scratch: u8) -> u8 {
        match self.loc(id) {
            Loc::Reg(r) => r,
            Loc::Mem(_) => scratch,
        }
    }

    fn store_int(&mut self, id: SlotId, src: u8) {
        match self.loc(id) {
            Loc::Reg(r) => {
                if r != src {
                    self.a.mov_rr(true, r, src);
                }
            }
            Loc::Mem(off) => {
                let off = off + self.stack_adj;
                self.a.store(true, RSP, off, src);
            }
        }
    }

    fn flt_src(&mut self, id: SlotId, scratch: u8) -> u8 {
        let single = self.is_single(id);
        match self.loc(id) {
            Loc::Reg(r) => r,
            Loc::Mem(off) => {
                let off = off + self.stack_adj;
                self.a.movs_load(single, scratch, RSP, off);
                scratch
            }
        }
    }

    fn flt_dst(&mut self, id: SlotId, scratch: u8) -> u8 {
        match self.loc(id) {
            Loc::Reg(r) => r,
            Loc::Mem(_) => scratch,
        }
    }

    fn store_flt(&mut self, id: SlotId, src: u8) {
        let single = self.is_single(id);
        match self.loc(id) {
            Loc::Reg(r) => {
                if r != src {
                    self.a.movs_rr(single, r, src);
                }
            }
            Loc::Mem(off) => {
                let off = off + self.stack_adj;
                self.a.movs_store(single, RSP, off, src);
            }
        }
    }

    // ===== Fixup helpers =====

    fn jcc_to_block(&mut self, cc: Cc, target: BlockId) {
        let at = self.a.jcc(cc);
        self.fixups.push((at, FixTarget::Block(target)));
    }

    fn jmp_to_block(&mut self, target: BlockId) {
        let at = self.a.jmp();
        self.fixups.push((at, FixTarget::Block(target)));
    }

    fn jcc_to_trailer(&mut self, cc: Cc, trailer: Trailer) {
        let at = self.a.jcc(cc);
        let idx = self.trailers.len();
        self.trailers.push(trailer);
        self.fixups.push((at, FixTarget::Trailer(idx)));
    }

    fn bind(&mut self, at: usize) {
        let disp = self.a.pos() as i64 - (at as i64 + 4);
        self.a.patch32(at, disp as i32);
    }

    /// rip-relative load of a data-segment word.
    fn load_dseg(&mut self, w: bool, dst: u8, dseg_offset: usize) {
        let at = self.a.load_rip(w, dst);
        self.dseg_relocs.push(DsegReloc {
            code_offset: at,
            dseg_offset,
        });
    }

    fn lea_dseg(&mut self, dst: u8, dseg_offset: usize) {
        let at = self.a.lea_rip(dst);
        self.dseg_relocs.push(DsegReloc {
            code_offset: at,
            dseg_offset,
        });
    }

    fn movs_load_dseg(&mut self, single: bool, dst: u8, dseg_offset: usize) {
        let at = self.a.movs_load_rip(single, dst);
        self.dseg_relocs.push(DsegReloc {
            code_offset: at,
            dseg_offset,
        });
    }

    fn call_dseg(&mut self, dseg_offset: usize) {
        let at = self.a.call_rip();
        self.dseg_relocs.push(DsegReloc {
            code_offset: at,
            dseg_offset,
        });
    }

    fn jmp_dseg(&mut self, dseg_offset: usize) {
        let at = self.a.jmp_rip();
        self.dseg_relocs.push(DsegReloc {
            code_offset: at,
            dseg_offset,
        });
    }

    /// A patchable slot plus its patch record; returns the slot offset.
    fn patch_slot(&mut self, kind: PatchKind) -> (usize, Arc<PatchRef>) {
        let off = self.dseg.slot(0);
        let pref = PatchRef::new(off, kind);
        self.patch_refs.push(pref.clone());
        (off, pref)
    }

    /// Emit the load of a lazily resolved value: the slot starts at zero and
    /// the patch trailer re-enters at the load until resolution sticks.
    fn load_resolvable(&mut self, dst: u8, kind: PatchKind) -> usize {
        let resume = self.a.pos() as u32;
        let (off, pref) = self.patch_slot(kind);
        self.load_dseg(true, dst, off);
        self.a.test_rr(true, dst, dst);
        let idx = self.trailers.len();
        self.trailers.push(Trailer::Patch { pref, resume });
        let at = self.a.jcc(Cc::E);
        self.fixups.push((at, FixTarget::Trailer(idx)));
        off
    }

    fn record_call_site(&mut self) {
        self.stack_maps.push(StackMapEntry {
            mpc: self.a.pos() as u32,
            refs: self.ref_locs.clone(),
        });
    }

    fn pending_check(&mut self) {
        // Builtins that can throw return zero with the throwable pending.
        self.a.test_rr(true, RAX, RAX);
        let site = self.a.pos() as u32;
        self.jcc_to_trailer(Cc::E, Trailer::Pending { site });
    }

    fn null_check(&mut self, r: u8, site_pc: u32) {
        let _ = site_pc;
        self.a.test_rr(true, r, r);
        let site = self.a.pos() as u32;
        self.jcc_to_trailer(
            Cc::E,
            Trailer::Throw {
                kind: throw_kind::NULL_POINTER,
                site,
                extra: None,
            },
        );
    }

    // ===== Frame =====

    fn spill_off(&self, regoff: i32) -> i32 {
        regoff + self.stack_adj
    }

    fn saved_reg_off(&self, i: usize) -> i32 {
        self.frame_size - 8 * (i as i32 + 1)
    }

    fn emit_prologue(&mut self) {
        self.a.ensure(128);
        self.a.alu_ri(Alu::Sub, true, RSP, self.frame_size);
        for i in 0..self.frame.int_saved_used as usize {
            let off = self.saved_reg_off(i);
            self.a.store(true, RSP, off, SAVED_ORDER[i]);
        }

        // Move incoming arguments to their allocated homes. Int and float
        // positions advance independently; overflow arguments come from the
        // caller frame.
        let ir = self.ir;
        let mut int_n = 0usize;
        let mut flt_n = 0usize;
        let mut caller_off = self.frame_size + 8;
        for &p in &ir.params {
            let float = self.is_float(p);
            if float {
                if flt_n < REGISTER_SET.float_args.len() {
                    let src = REGISTER_SET.float_args[flt_n];
                    flt_n += 1;
                    self.store_flt(p, src);
                } else {
                    let single = self.is_single(p);
                    self.a.movs_load(single, FTMP1, RSP, caller_off);
                    caller_off += 8;
                    self.store_flt(p, FTMP1);
                }
            } else if int_n < REGISTER_SET.int_args.len() {
                let src = REGISTER_SET.int_args[int_n];
                int_n += 1;
                self.store_int(p, src);
            } else {
                self.a.load(true, ITMP1, RSP, caller_off);
                caller_off += 8;
                self.store_int(p, ITMP1);
            }
        }

        if self.method.is_synchronized() {
            let sync_off = self.frame.sync_slot.expect("allocator reserved sync slot");
            if self.method.is_static() {
                let mirror = self
                    .method
                    .class()
                    .map(|c| c.mirror())
                    .unwrap_or_default();
                let off = self.dseg.word(mirror as u64);
                self.load_dseg(true, ITMP2, off);
            } else {
                let r = self.int_src(self.ir.params[0], ITMP2);
                if r != ITMP2 {
                    self.a.mov_rr(true, ITMP2, r);
                }
            }
            self.a.store(true, RSP, sync_off, ITMP2);
            self.a.mov_rr(true, RDI, ITMP2);
            let enter = self.dseg.word(self.anchors.builtins.monitor_enter as u64);
            self.call_dseg(enter);
            self.record_call_site();
        }
    }

    fn emit_epilogue(&mut self, value: Option<SlotId>) {
        self.a.ensure(96);
        // Return value first, then the monitor release with the value
        // stashed in the sync slot.
        let float_ret = match value {
            Some(v) if self.is_float(v) => {
                let r = self.flt_src(v, XMM0);
                if r != XMM0 {
                    self.a.movs_rr(self.is_single(v), XMM0, r);
                }
                true
            }
            Some(v) => {
                let r = self.int_src(v, RAX);
                if r != RAX {
                    self.a.mov_rr(true, RAX, r);
                }
                false
            }
            None => false,
        };

        if self.method.is_synchronized() {
            let sync_off = self.frame.sync_slot.expect("allocator reserved sync slot");
            self.a.load(true, ITMP2, RSP, sync_off);
            if value.is_some() {
                if float_ret {
                    self.a.movs_store(false, RSP, sync_off, XMM0);
                } else {
                    self.a.store(true, RSP, sync_off, RAX);
                }
            }
            self.a.mov_rr(true, RDI, ITMP2);
            let exit = self.dseg.word(self.anchors.builtins.monitor_exit as u64);
            self.call_dseg(exit);
            self.pending_check_status();
            if value.is_some() {
                if float_ret {
                    self.a.movs_load(false, XMM0, RSP, sync_off);
                } else {
                    self.a.load(true, RAX, RSP, sync_off);
                }
            }
        }

        for i in (0..self.frame.int_saved_used as usize).rev() {
            let off = self.saved_reg_off(i);
            self.a.load(true, SAVED_ORDER[i], RSP, off);
        }
        self.a.alu_ri(Alu::Add, true, RSP, self.frame_size);
        self.a.ret();
    }

    /// Status check for builtins whose failure leaves a pending throwable
    /// but whose success value is not in RAX terms meaningful.
    fn pending_check_status(&mut self) {
        self.a.test_rr(false, RAX, RAX);
        let site = self.a.pos() as u32;
        self.jcc_to_trailer(Cc::E, Trailer::Pending { site });
    }

    // ===== Main loop =====

    fn run(mut self) -> Result<CompiledMethod, JitError> {
        let ir = self.ir;
        self.emit_prologue();

        for block in &ir.blocks {
            self.block_mpc[block.id.0 as usize] = self.a.pos() as u32;
            if !block.reachable {
                continue;
            }
            if block.is_handler_entry {
                // The trampoline resumes here with the exception in RAX.
                self.store_int(block.in_stack[0], RAX);
            }
            for instr in &block.instrs {
                self.a.ensure(160);
                self.lower(instr)?;
            }
        }

        self.emit_trailers();
        self.resolve_fixups();

        let dispatch = self.build_dispatch();
        let line_table = self.build_line_table();
        let block_addrs = self
            .dseg_block_addrs
            .iter()
            .map(|&(off, b)| (off, self.block_mpc[b.0 as usize]))
            .collect();

        Ok(CompiledMethod {
            code: self.a.into_bytes(),
            dseg: self.dseg.bytes,
            dseg_relocs: self.dseg_relocs,
            dseg_block_addrs: block_addrs,
            strings: self.strings,
            frame_size: self.frame_size,
            is_leaf: self.ir.is_leaf,
            sync_slot_offset: self.frame.sync_slot,
            int_saved_count: self.frame.int_saved_used,
            float_saved_count: self.frame.float_saved_used,
            dispatch,
            line_table,
            patch_refs: self.patch_refs,
            call_sites: self.call_sites,
            stack_maps: self.stack_maps,
        })
    }

    fn resolve_fixups(&mut self) {
        for (at, target) in std::mem::take(&mut self.fixups) {
            let mpc = match target {
                FixTarget::Block(b) => self.block_mpc[b.0 as usize],
                FixTarget::Trailer(i) => self.trailer_mpc[i],
                FixTarget::Mpc(m) => m,
            };
            let disp = mpc as i64 - (at as i64 + 4);
            self.a.patch32(at, disp as i32);
        }
    }

    fn mpc_of_pc(&self, pc: u32) -> u32 {
        if pc as usize >= self.method.bytecode.len() {
            return self.a.pos() as u32;
        }
        // Range boundaries are block leaders by construction.
        for b in &self.ir.blocks {
            if b.start_pc == pc {
                return self.block_mpc[b.id.0 as usize];
            }
        }
        // Fall back to the covering block.
        for b in &self.ir.blocks {
            if b.start_pc <= pc && pc < b.end_pc {
                return self.block_mpc[b.id.0 as usize];
            }
        }
        self.a.pos() as u32
    }

    fn build_dispatch(&self) -> Vec<DispatchEntry> {
        self.ir
            .exception_entries
            .iter()
            .map(|e| DispatchEntry {
                start_mpc: self.mpc_of_pc(e.start_pc),
                end_mpc: self.mpc_of_pc(e.end_pc),
                handler_mpc: self.block_mpc[e.handler.0 as usize],
                catch_class: e.catch_class.clone(),
            })
            .collect()
    }

    fn build_line_table(&self) -> Vec<(u32, u16)> {
        self.ir
            .blocks
            .iter()
            .filter(|b| b.reachable)
            .filter_map(|b| b.line.map(|l| (self.block_mpc[b.id.0 as usize], l)))
            .collect()
    }

    fn emit_trailers(&mut self) {
        let throw = self.dseg.word(self.anchors.throw_builtin as u64);
        let tramp = self.dseg.word(self.anchors.exception_trampoline as u64);
        let take_pending = self.dseg.word(self.anchors.builtins.take_pending as u64);
        let wrapper = self.dseg.word(self.anchors.patcher_wrapper as u64);

        for i in 0..self.trailers.len() {
            self.a.ensure(96);
            self.trailer_mpc.push(self.a.pos() as u32);
            match std::mem::replace(
                &mut self.trailers[i],
                Trailer::Pending { site: 0 },
            ) {
                Trailer::Throw { kind, site, extra } => {
                    self.a.mov_ri32(RDI, kind as i32);
                    let at = self.a.lea_rip(RSI);
                    self.fixups.push((at, FixTarget::Mpc(site)));
                    match extra {
                        Some(Loc::Reg(r)) => self.a.mov_rr(false, RDX, r),
                        Some(Loc::Mem(off)) => self.a.load(false, RDX, RSP, off),
                        None => self.a.mov_ri32(RDX, 0),
                    }
                    self.call_dseg(throw);
                    let at = self.a.lea_rip(R10);
                    self.fixups.push((at, FixTarget::Mpc(site)));
                    self.jmp_dseg(tramp);
                }
                Trailer::Pending { site } => {
                    self.call_dseg(take_pending);
                    let at = self.a.lea_rip(R10);
                    self.fixups.push((at, FixTarget::Mpc(site)));
                    self.jmp_dseg(tramp);
                }
                Trailer::Patch { pref, resume } => {
                    self.a.mov_ri64(R10, Arc::as_ptr(&pref) as u64);
                    let at = self.a.lea_rip(R11);
                    self.fixups.push((at, FixTarget::Mpc(resume)));
                    self.jmp_dseg(wrapper);
                    // Keep the Arc alive through the method's patch table.
                    debug_assert!(self
                        .patch_refs
                        .iter()
                        .any(|p| Arc::ptr_eq(p, &pref)));
                }
            }
        }
    }

    // ===== Instruction lowering =====

    fn lower(&mut self, instr: &Instr) -> Result<(), JitError> {
        match &instr.kind {
            InstrKind::Const { dst, value } => self.lower_const(*dst, value),
            InstrKind::Move { src, dst } => {
                self.lower_move(*src, *dst);
                Ok(())
            }
            InstrKind::Arith {
                op,
                ty,
                lhs,
                rhs,
                dst,
            } => self.lower_arith(*op, *ty, *lhs, *rhs, *dst),
            InstrKind::Neg { ty, src, dst } => {
                self.lower_neg(*ty, *src, *dst);
                Ok(())
            }
            InstrKind::Conv { op, src, dst } => {
                self.lower_conv(*op, *src, *dst);
                Ok(())
            }
            InstrKind::Cmp { op, lhs, rhs, dst } => {
                self.lower_cmp(*op, *lhs, *rhs, *dst);
                Ok(())
            }
            InstrKind::Iinc { slot, delta } => {
                match self.loc(*slot) {
                    Loc::Reg(r) => self.a.alu_ri(Alu::Add, false, r, *delta),
                    Loc::Mem(off) => {
                        let off = self.spill_off(off);
                        self.a.load(false, ITMP1, RSP, off);
                        self.a.alu_ri(Alu::Add, false, ITMP1, *delta);
                        self.a.store(true, RSP, off, ITMP1);
                    }
                }
                Ok(())
            }
            InstrKind::If {
                cond,
                lhs,
                rhs,
                target,
            } => {
                let l = self.int_src(*lhs, ITMP1);
                let cc = cond_cc(*cond);
                match rhs {
                    IfRhs::Zero => self.a.test_rr(false, l, l),
                    IfRhs::Null => self.a.test_rr(true, l, l),
                    IfRhs::Slot(r) => {
                        let w = self.ir.slot(*lhs).ty == ValueType::Address;
                        let rr = self.int_src(*r, ITMP2);
                        self.a.alu_rr(Alu::Cmp, w, l, rr);
                    }
                }
                self.jcc_to_block(cc, *target);
                Ok(())
            }
            InstrKind::Goto { target } => {
                self.jmp_to_block(*target);
                Ok(())
            }
            InstrKind::Jsr { target, dst } => {
                let at = self.a.lea_rip(ITMP1);
                self.store_int(*dst, ITMP1);
                self.jmp_to_block(*target);
                // The return address is the instruction after the jmp.
                self.bind(at);
                Ok(())
            }
            InstrKind::RetLocal { slot } => {
                let r = self.int_src(*slot, ITMP1);
                self.a.jmp_reg(r);
                Ok(())
            }
            InstrKind::TableSwitch {
                key,
                low,
                targets,
                default,
            } => {
                let k = self.int_src(*key, ITMP1);
                // 32-bit move clears the upper half; the scaled jump below
                // indexes with the full register.
                self.a.mov_rr(false, ITMP1, k);
                if *low != 0 {
                    self.a.alu_ri(Alu::Sub, false, ITMP1, *low);
                }
                self.a.alu_ri(Alu::Cmp, false, ITMP1, targets.len() as i32);
                self.jcc_to_block(Cc::Ae, *default);
                let table = self.dseg.reserve_words(targets.len());
                for (i, t) in targets.iter().enumerate() {
                    self.dseg_block_addrs.push((table + i * 8, *t));
                }
                self.lea_dseg(ITMP2, table);
                self.a.jmp_mem_sib(ITMP2, ITMP1, 3, 0);
                Ok(())
            }
            InstrKind::LookupSwitch {
                key,
                pairs,
                default,
            } => {
                let k = self.int_src(*key, ITMP1);
                for (val, target) in pairs {
                    self.a.alu_ri(Alu::Cmp, false, k, *val);
                    self.jcc_to_block(Cc::E, *target);
                }
                self.jmp_to_block(*default);
                Ok(())
            }
            InstrKind::Return { value } => {
                self.emit_epilogue(*value);
                Ok(())
            }
            InstrKind::GetField { obj, field, dst } => self.lower_getfield(*obj, field, *dst, instr.pc),
            InstrKind::PutField { obj, field, value } => {
                self.lower_putfield(*obj, field, *value, instr.pc)
            }
            InstrKind::GetStatic { field, dst } => self.lower_getstatic(field, *dst),
            InstrKind::PutStatic { field, value } => self.lower_putstatic(field, *value),
            InstrKind::ArrayLoad {
                elem,
                arr,
                idx,
                dst,
            } => {
                let (a_reg, i_reg) = self.array_check(*arr, *idx, instr.pc);
                match elem {
                    ArrayElem::Byte => {
                        let d = self.int_dst(*dst, ITMP3);
                        self.a.load8s_sib(d, a_reg, i_reg, ARRAY_DATA_OFFSET);
                        self.store_int(*dst, d);
                    }
                    ArrayElem::Char => {
                        let d = self.int_dst(*dst, ITMP3);
                        self.a.load16u_sib(d, a_reg, i_reg, ARRAY_DATA_OFFSET);
                        self.store_int(*dst, d);
                    }
                    ArrayElem::Short => {
                        let d = self.int_dst(*dst, ITMP3);
                        self.a.load16s_sib(d, a_reg, i_reg, ARRAY_DATA_OFFSET);
                        self.store_int(*dst, d);
                    }
                    ArrayElem::Int => {
                        let d = self.int_dst(*dst, ITMP3);
                        self.a.load_sib(false, d, a_reg, i_reg, 2, ARRAY_DATA_OFFSET);
                        self.store_int(*dst, d);
                    }
                    ArrayElem::Long | ArrayElem::Ref => {
                        let d = self.int_dst(*dst, ITMP3);
                        self.a.load_sib(true, d, a_reg, i_reg, 3, ARRAY_DATA_OFFSET);
                        self.store_int(*dst, d);
                    }
                    ArrayElem::Float | ArrayElem::Double => {
                        let single = *elem == ArrayElem::Float;
                        let d = self.flt_dst(*dst, FTMP1);
                        let scale = if single { 2 } else { 3 };
                        self.a
                            .movs_load_sib(single, d, a_reg, i_reg, scale, ARRAY_DATA_OFFSET);
                        self.store_flt(*dst, d);
                    }
                }
                Ok(())
            }
            InstrKind::ArrayStore {
                elem,
                arr,
                idx,
                value,
            } => self.lower_array_store(*elem, *arr, *idx, *value, instr.pc),
            InstrKind::ArrayLength { arr, dst } => {
                let a_reg = self.int_src(*arr, ITMP2);
                self.null_check(a_reg, instr.pc);
                let d = self.int_dst(*dst, ITMP3);
                self.a.load(false, d, a_reg, ARRAY_LENGTH_OFFSET);
                self.store_int(*dst, d);
                Ok(())
            }
            InstrKind::New { class, dst } => {
                self.load_class_vtable(ITMP3, class);
                self.a.mov_rr(true, RDI, ITMP3);
                let f = self.dseg.word(self.anchors.builtins.alloc_object as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.pending_check();
                self.store_int(*dst, RAX);
                Ok(())
            }
            InstrKind::NewArray {
                elem,
                class,
                len,
                dst,
            } => {
                let l = self.int_src(*len, ITMP1);
                self.a.test_rr(false, l, l);
                let site = self.a.pos() as u32;
                let extra = Some(self.loc(*len));
                self.jcc_to_trailer(
                    Cc::S,
                    Trailer::Throw {
                        kind: throw_kind::NEGATIVE_ARRAY_SIZE,
                        site,
                        extra,
                    },
                );
                let builtin = match class {
                    Some(cr) => {
                        self.load_class_vtable(ITMP3, cr);
                        self.a.mov_rr(true, RDI, ITMP3);
                        let l = self.int_src(*len, ITMP1);
                        self.a.mov_rr(false, RSI, l);
                        self.anchors.builtins.alloc_ref_array
                    }
                    None => {
                        let code = crate::runtime::builtins::prim_array_code(*elem);
                        self.a.mov_ri32(RDI, code as i32);
                        let l = self.int_src(*len, ITMP1);
                        self.a.mov_rr(false, RSI, l);
                        self.anchors.builtins.alloc_prim_array
                    }
                };
                let f = self.dseg.word(builtin as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.pending_check();
                self.store_int(*dst, RAX);
                Ok(())
            }
            InstrKind::MultiNewArray { class, dims, dst } => {
                self.load_class_vtable(ITMP3, class);
                // Dimension counts go through a small outgoing area.
                let n = dims.len() as i32;
                let reserve = ((n * 8) + 15) & !15;
                self.a.alu_ri(Alu::Sub, true, RSP, reserve);
                self.stack_adj += reserve;
                for (i, d) in dims.iter().enumerate() {
                    let r = self.int_src(*d, ITMP1);
                    // Negative counts are checked by the builtin, which sees
                    // them sign-extended.
                    self.a.movsxd_rr(ITMP1, r);
                    self.a.store(true, RSP, (i * 8) as i32, ITMP1);
                }
                self.a.mov_rr(true, RDI, ITMP3);
                self.a.mov_ri32(RSI, n);
                self.a.mov_rr(true, RDX, RSP);
                let f = self
                    .dseg
                    .word(self.anchors.builtins.alloc_multi_array as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.a.alu_ri(Alu::Add, true, RSP, reserve);
                self.stack_adj -= reserve;
                self.pending_check();
                self.store_int(*dst, RAX);
                Ok(())
            }
            InstrKind::Checkcast { obj, class } => self.lower_checkcast(*obj, class),
            InstrKind::InstanceOf { obj, class, dst } => self.lower_instanceof(*obj, class, *dst),
            InstrKind::Invoke {
                kind,
                mref,
                args,
                dst,
            } => self.lower_invoke(*kind, mref, args, *dst, instr.pc),
            InstrKind::Throw { obj } => {
                let r = self.int_src(*obj, ITMP1);
                if r != RAX {
                    self.a.mov_rr(true, RAX, r);
                }
                self.null_check(RAX, instr.pc);
                let tramp = self.dseg.word(self.anchors.exception_trampoline as u64);
                // xpc = address of the lea itself, inside this range.
                let at = self.a.lea_rip(R10);
                self.a.patch32(at, -7);
                self.jmp_dseg(tramp);
                Ok(())
            }
            InstrKind::MonitorEnter { obj } => {
                let r = self.int_src(*obj, ITMP1);
                self.null_check(r, instr.pc);
                if r != RDI {
                    self.a.mov_rr(true, RDI, r);
                }
                let f = self.dseg.word(self.anchors.builtins.monitor_enter as u64);
                self.call_dseg(f);
                self.record_call_site();
                Ok(())
            }
            InstrKind::MonitorExit { obj } => {
                let r = self.int_src(*obj, ITMP1);
                self.null_check(r, instr.pc);
                if r != RDI {
                    self.a.mov_rr(true, RDI, r);
                }
                let f = self.dseg.word(self.anchors.builtins.monitor_exit as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.pending_check_status();
                Ok(())
            }
        }
    }

    fn lower_const(&mut self, dst: SlotId, value: &ConstValue) -> Result<(), JitError> {
        match value {
            ConstValue::Int(v) => {
                let d = self.int_dst(dst, ITMP1);
                self.a.mov_ri32(d, *v);
                self.store_int(dst, d);
            }
            ConstValue::Long(v) => {
                let off = self.dseg.word(*v as u64);
                let d = self.int_dst(dst, ITMP1);
                self.load_dseg(true, d, off);
                self.store_int(dst, d);
            }
            ConstValue::Float(v) => {
                let off = self.dseg.word(v.to_bits() as u64);
                let d = self.flt_dst(dst, FTMP1);
                self.movs_load_dseg(true, d, off);
                self.store_flt(dst, d);
            }
            ConstValue::Double(v) => {
                let off = self.dseg.word(v.to_bits());
                let d = self.flt_dst(dst, FTMP1);
                self.movs_load_dseg(false, d, off);
                self.store_flt(dst, d);
            }
            ConstValue::Null => {
                let d = self.int_dst(dst, ITMP1);
                self.a.alu_rr(Alu::Xor, false, d, d);
                self.store_int(dst, d);
            }
            ConstValue::Str(s) => {
                self.strings.push(s.clone());
                let ptr_off = self.dseg.slot(s.as_ptr() as u64);
                let len_off = self.dseg.slot(s.len() as u64);
                self.load_dseg(true, RDI, ptr_off);
                self.load_dseg(true, RSI, len_off);
                let f = self.dseg.word(self.anchors.builtins.intern_string as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.pending_check();
                self.store_int(dst, RAX);
            }
            ConstValue::Class(cr) => {
                self.load_class_vtable(ITMP3, cr);
                self.a.mov_rr(true, RDI, ITMP3);
                let f = self.dseg.word(self.anchors.builtins.class_mirror as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.pending_check();
                self.store_int(dst, RAX);
            }
        }
        Ok(())
    }

    fn lower_move(&mut self, src: SlotId, dst: SlotId) {
        if self.loc(src) == self.loc(dst) {
            return;
        }
        if self.is_float(src) {
            let single = self.is_single(dst);
            match (self.loc(src), self.loc(dst)) {
                (Loc::Reg(s), Loc::Reg(d)) => self.a.movs_rr(single, d, s),
                (Loc::Reg(s), Loc::Mem(d)) => {
                    let d = self.spill_off(d);
                    self.a.movs_store(single, RSP, d, s);
                }
                (Loc::Mem(s), Loc::Reg(d)) => {
                    let s = self.spill_off(s);
                    self.a.movs_load(single, d, RSP, s);
                }
                (Loc::Mem(s), Loc::Mem(d)) => {
                    let (s, d) = (self.spill_off(s), self.spill_off(d));
                    self.a.movs_load(single, FTMP1, RSP, s);
                    self.a.movs_store(single, RSP, d, FTMP1);
                }
            }
        } else {
            match (self.loc(src), self.loc(dst)) {
                (Loc::Reg(s), Loc::Reg(d)) => self.a.mov_rr(true, d, s),
                (Loc::Reg(s), Loc::Mem(d)) => {
                    let d = self.spill_off(d);
                    self.a.store(true, RSP, d, s);
                }
                (Loc::Mem(s), Loc::Reg(d)) => {
                    let s = self.spill_off(s);
                    self.a.load(true, d, RSP, s);
                }
                (Loc::Mem(s), Loc::Mem(d)) => {
                    let (s, d) = (self.spill_off(s), self.spill_off(d));
                    self.a.load(true, ITMP1, RSP, s);
                    self.a.store(true, RSP, d, ITMP1);
                }
            }
        }
    }

    fn lower_arith(
        &mut self,
        op: ArithOp,
        ty: ValueType,
        lhs: SlotId,
        rhs: SlotId,
        dst: SlotId,
    ) -> Result<(), JitError> {
        if ty.is_float() {
            return self.lower_float_arith(op, ty, lhs, rhs, dst);
        }
        let w = ty == ValueType::Long;
        match op {
            ArithOp::Add | ArithOp::Sub | ArithOp::And | ArithOp::Or | ArithOp::Xor => {
                let alu = match op {
                    ArithOp::Add => Alu::Add,
                    ArithOp::Sub => Alu::Sub,
                    ArithOp::And => Alu::And,
                    ArithOp::Or => Alu::Or,
                    _ => Alu::Xor,
                };
                let l = self.int_src(lhs, ITMP1);
                let r = self.int_src(rhs, ITMP2);
                let d = self.int_dst(dst, ITMP1);
                if d != l {
                    self.a.mov_rr(true, d, l);
                }
                self.a.alu_rr(alu, w, d, r);
                self.store_int(dst, d);
            }
            ArithOp::Mul => {
                let l = self.int_src(lhs, ITMP1);
                let r = self.int_src(rhs, ITMP2);
                let d = self.int_dst(dst, ITMP1);
                if d != l {
                    self.a.mov_rr(true, d, l);
                }
                self.a.imul_rr(w, d, r);
                self.store_int(dst, d);
            }
            ArithOp::Div | ArithOp::Rem => {
                let l = self.int_src(lhs, ITMP1);
                let r = self.int_src(rhs, ITMP3);
                self.a.test_rr(w, r, r);
                let site = self.a.pos() as u32;
                self.jcc_to_trailer(
                    Cc::E,
                    Trailer::Throw {
                        kind: throw_kind::ARITHMETIC,
                        site,
                        extra: None,
                    },
                );
                if l != RAX {
                    self.a.mov_rr(true, RAX, l);
                }
                // Divisor -1 bypasses idiv: MIN_VALUE / -1 must not trap,
                // and the JVM defines the quotient as the dividend.
                self.a.alu_ri(Alu::Cmp, w, r, -1);
                let j_norm = self.a.jcc(Cc::Ne);
                if op == ArithOp::Div {
                    self.a.neg(w, RAX);
                } else {
                    self.a.alu_rr(Alu::Xor, false, RAX, RAX);
                }
                let j_done = self.a.jmp();
                self.bind(j_norm);
                if w {
                    self.a.cqo();
                } else {
                    self.a.cdq();
                }
                self.a.idiv(w, r);
                if op == ArithOp::Rem {
                    self.a.mov_rr(true, RAX, RDX);
                }
                self.bind(j_done);
                self.store_int(dst, RAX);
            }
            ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr => {
                let l = self.int_src(lhs, ITMP1);
                let r = self.int_src(rhs, ITMP2);
                self.a.mov_rr(false, RCX, r);
                let d = self.int_dst(dst, ITMP1);
                if d != l {
                    self.a.mov_rr(true, d, l);
                }
                match op {
                    ArithOp::Shl => self.a.shl_cl(w, d),
                    ArithOp::Shr => self.a.sar_cl(w, d),
                    _ => {
                        if !w {
                            // Logical 32-bit shift needs clean upper bits.
                            self.a.mov_rr(false, d, d);
                        }
                        self.a.shr_cl(w, d);
                    }
                }
                self.store_int(dst, d);
            }
        }
        Ok(())
    }

    fn lower_float_arith(
        &mut self,
        op: ArithOp,
        ty: ValueType,
        lhs: SlotId,
        rhs: SlotId,
        dst: SlotId,
    ) -> Result<(), JitError> {
        let single = ty == ValueType::Float;
        if op == ArithOp::Rem {
            // IEEE remainder comes from the builtin.
            let l = self.flt_src(lhs, XMM0);
            if l != XMM0 {
                self.a.movs_rr(single, XMM0, l);
            }
            let r = self.flt_src(rhs, XMM1);
            if r != XMM1 {
                self.a.movs_rr(single, XMM1, r);
            }
            let f = if single {
                self.anchors.builtins.frem
            } else {
                self.anchors.builtins.drem
            };
            let off = self.dseg.word(f as u64);
            self.call_dseg(off);
            self.record_call_site();
            self.store_flt(dst, XMM0);
            return Ok(());
        }

        let l = self.flt_src(lhs, FTMP1);
        let r = self.flt_src(rhs, FTMP2);
        let d = self.flt_dst(dst, FTMP1);
        if d != l {
            self.a.movs_rr(single, d, l);
        }
        match op {
            ArithOp::Add => self.a.adds(single, d, r),
            ArithOp::Sub => self.a.subs(single, d, r),
            ArithOp::Mul => self.a.muls(single, d, r),
            ArithOp::Div => self.a.divs(single, d, r),
            _ => {
                return Err(JitError::Codegen(format!(
                    "float op {:?} has no direct lowering",
                    op
                )))
            }
        }
        self.store_flt(dst, d);
        Ok(())
    }

    fn lower_neg(&mut self, ty: ValueType, src: SlotId, dst: SlotId) {
        match ty {
            ValueType::Int | ValueType::Long => {
                let w = ty == ValueType::Long;
                let s = self.int_src(src, ITMP1);
                let d = self.int_dst(dst, ITMP1);
                if d != s {
                    self.a.mov_rr(true, d, s);
                }
                self.a.neg(w, d);
                self.store_int(dst, d);
            }
            ValueType::Float => {
                let s = self.flt_src(src, FTMP1);
                self.a.mov_gpr_x(false, RAX, s);
                self.a.alu_ri(Alu::Xor, false, RAX, i32::MIN);
                let d = self.flt_dst(dst, FTMP1);
                self.a.mov_x_gpr(false, d, RAX);
                self.store_flt(dst, d);
            }
            _ => {
                let s = self.flt_src(src, FTMP1);
                self.a.mov_gpr_x(true, RAX, s);
                self.a.mov_ri64(ITMP2, 0x8000_0000_0000_0000);
                self.a.alu_rr(Alu::Xor, true, RAX, ITMP2);
                let d = self.flt_dst(dst, FTMP1);
                self.a.mov_x_gpr(true, d, RAX);
                self.store_flt(dst, d);
            }
        }
    }

    fn lower_conv(&mut self, op: ConvOp, src: SlotId, dst: SlotId) {
        use ConvOp::*;
        match op {
            I2l => {
                let s = self.int_src(src, ITMP1);
                let d = self.int_dst(dst, ITMP1);
                self.a.movsxd_rr(d, s);
                self.store_int(dst, d);
            }
            L2i => {
                let s = self.int_src(src, ITMP1);
                let d = self.int_dst(dst, ITMP1);
                self.a.mov_rr(false, d, s);
                self.store_int(dst, d);
            }
            I2b => {
                let s = self.int_src(src, ITMP1);
                let d = self.int_dst(dst, ITMP1);
                self.a.movsx8_rr(d, s);
                self.store_int(dst, d);
            }
            I2c => {
                let s = self.int_src(src, ITMP1);
                let d = self.int_dst(dst, ITMP1);
                self.a.movzx16_rr(d, s);
                self.store_int(dst, d);
            }
            I2s => {
                let s = self.int_src(src, ITMP1);
                let d = self.int_dst(dst, ITMP1);
                self.a.movsx16_rr(d, s);
                self.store_int(dst, d);
            }
            I2f | I2d | L2f | L2d => {
                let w = matches!(op, L2f | L2d);
                let single = matches!(op, I2f | L2f);
                let s = self.int_src(src, ITMP1);
                let d = self.flt_dst(dst, FTMP1);
                self.a.cvtsi2s(single, w, d, s);
                self.store_flt(dst, d);
            }
            F2d => {
                let s = self.flt_src(src, FTMP1);
                let d = self.flt_dst(dst, FTMP2);
                self.a.cvtss2sd(d, s);
                self.store_flt(dst, d);
            }
            D2f => {
                let s = self.flt_src(src, FTMP1);
                let d = self.flt_dst(dst, FTMP2);
                self.a.cvtsd2ss(d, s);
                self.store_flt(dst, d);
            }
            F2i | F2l | D2i | D2l => {
                let single = matches!(op, F2i | F2l);
                let w = matches!(op, F2l | D2l);
                let s = self.flt_src(src, FTMP1);
                let d = self.int_dst(dst, ITMP1);
                self.a.cvtts2si(single, w, d, s);
                // The hardware writes the indefinite value on NaN and
                // overflow; Java wants 0 / MIN / MAX.
                if w {
                    self.a.mov_ri64(ITMP2, i64::MIN as u64);
                    self.a.alu_rr(Alu::Cmp, true, d, ITMP2);
                } else {
                    self.a.alu_ri(Alu::Cmp, false, d, i32::MIN);
                }
                let j_done = self.a.jcc(Cc::Ne);
                self.a.ucomis(single, s, s);
                let j_num = self.a.jcc(Cc::Np);
                if w {
                    self.a.mov_ri32(d, 0);
                } else {
                    self.a.alu_rr(Alu::Xor, false, d, d);
                }
                let j_done2 = self.a.jmp();
                self.bind(j_num);
                self.a.pxor_rr(FZERO, FZERO);
                self.a.ucomis(single, s, FZERO);
                let j_done3 = self.a.jcc(Cc::B);
                if w {
                    self.a.mov_ri64(d, i64::MAX as u64);
                } else {
                    self.a.mov_ri32(d, i32::MAX);
                }
                self.bind(j_done);
                self.bind(j_done2);
                self.bind(j_done3);
                self.store_int(dst, d);
            }
        }
    }

    fn lower_cmp(&mut self, op: CmpOp, lhs: SlotId, rhs: SlotId, dst: SlotId) {
        let d = self.int_dst(dst, ITMP1);
        match op {
            CmpOp::Lcmp => {
                let l = self.int_src(lhs, ITMP1);
                let r = self.int_src(rhs, ITMP2);
                self.a.alu_rr(Alu::Cmp, true, l, r);
                self.a.mov_ri32(d, 0);
                let j_done = self.a.jcc(Cc::E);
                self.a.mov_ri32(d, 1);
                let j_done2 = self.a.jcc(Cc::G);
                self.a.mov_ri32(d, -1);
                self.bind(j_done);
                self.bind(j_done2);
            }
            CmpOp::Fcmpl | CmpOp::Dcmpl => {
                let single = op == CmpOp::Fcmpl;
                let l = self.flt_src(lhs, FTMP1);
                let r = self.flt_src(rhs, FTMP2);
                self.a.ucomis(single, l, r);
                self.a.mov_ri32(d, -1);
                let j_gt = self.a.jcc(Cc::A);
                let j_done = self.a.jcc(Cc::B);
                self.a.mov_ri32(d, 0);
                let j_done2 = self.a.jmp();
                self.bind(j_gt);
                self.a.mov_ri32(d, 1);
                self.bind(j_done);
                self.bind(j_done2);
            }
            CmpOp::Fcmpg | CmpOp::Dcmpg => {
                let single = op == CmpOp::Fcmpg;
                let l = self.flt_src(lhs, FTMP1);
                let r = self.flt_src(rhs, FTMP2);
                self.a.ucomis(single, l, r);
                self.a.mov_ri32(d, 1);
                let j_done = self.a.jcc(Cc::P);
                let j_done2 = self.a.jcc(Cc::A);
                self.a.mov_ri32(d, -1);
                let j_done3 = self.a.jcc(Cc::B);
                self.a.mov_ri32(d, 0);
                self.bind(j_done);
                self.bind(j_done2);
                self.bind(j_done3);
            }
        }
        self.store_int(dst, d);
    }

    fn array_check(&mut self, arr: SlotId, idx: SlotId, pc: u32) -> (u8, u8) {
        let a_reg = self.int_src(arr, ITMP2);
        self.null_check(a_reg, pc);
        let i_reg = self.int_src(idx, ITMP1);
        self.a.alu_rm(Alu::Cmp, false, i_reg, a_reg, ARRAY_LENGTH_OFFSET);
        let site = self.a.pos() as u32;
        let extra = Some(self.loc(idx));
        self.jcc_to_trailer(
            Cc::Ae,
            Trailer::Throw {
                kind: throw_kind::ARRAY_INDEX,
                site,
                extra,
            },
        );
        // Normalize the index: a 32-bit move clears bits an earlier 64-bit
        // spill reload may have dragged along.
        if i_reg != ITMP1 {
            self.a.mov_rr(false, ITMP1, i_reg);
        } else {
            self.a.mov_rr(false, ITMP1, ITMP1);
        }
        (a_reg, ITMP1)
    }

    fn lower_array_store(
        &mut self,
        elem: ArrayElem,
        arr: SlotId,
        idx: SlotId,
        value: SlotId,
        pc: u32,
    ) -> Result<(), JitError> {
        let (mut a_reg, mut i_reg) = self.array_check(arr, idx, pc);
        if elem == ArrayElem::Ref {
            // Covariance check through the runtime, skipped for null. The
            // operands are call-safe (the analyzer pinned them), but the
            // working registers need a reload afterwards.
            let v = self.int_src(value, ITMP1);
            self.a.test_rr(true, v, v);
            let j_null = self.a.jcc(Cc::E);
            if a_reg != RDI {
                self.a.mov_rr(true, RDI, a_reg);
            }
            let v = self.int_src(value, ITMP1);
            if v != RSI {
                self.a.mov_rr(true, RSI, v);
            }
            let f = self.dseg.word(self.anchors.builtins.aastore_check as u64);
            self.call_dseg(f);
            self.record_call_site();
            self.a.test_rr(false, RAX, RAX);
            let site = self.a.pos() as u32;
            self.jcc_to_trailer(
                Cc::E,
                Trailer::Throw {
                    kind: throw_kind::ARRAY_STORE,
                    site,
                    extra: None,
                },
            );
            self.bind(j_null);
            a_reg = self.int_src(arr, ITMP2);
            let i = self.int_src(idx, ITMP1);
            self.a.mov_rr(false, ITMP1, i);
            i_reg = ITMP1;
        }
        match elem {
            ArrayElem::Byte => {
                let v = self.int_src(value, ITMP3);
                self.a.store8_sib(a_reg, i_reg, ARRAY_DATA_OFFSET, v);
            }
            ArrayElem::Char | ArrayElem::Short => {
                let v = self.int_src(value, ITMP3);
                self.a.store16_sib(a_reg, i_reg, ARRAY_DATA_OFFSET, v);
            }
            ArrayElem::Int => {
                let v = self.int_src(value, ITMP3);
                self.a.store_sib(false, a_reg, i_reg, 2, ARRAY_DATA_OFFSET, v);
            }
            ArrayElem::Long | ArrayElem::Ref => {
                let v = self.int_src(value, ITMP3);
                self.a.store_sib(true, a_reg, i_reg, 3, ARRAY_DATA_OFFSET, v);
            }
            ArrayElem::Float | ArrayElem::Double => {
                let single = elem == ArrayElem::Float;
                let v = self.flt_src(value, FTMP1);
                let scale = if single { 2 } else { 3 };
                self.a
                    .movs_store_sib(single, a_reg, i_reg, scale, ARRAY_DATA_OFFSET, v);
            }
        }
        Ok(())
    }

    /// Field offset into ITMP3, biased by one when it comes from a patch
    /// slot. Returns the addressing bias (0 for resolved, -1 for patched).
    fn field_offset(&mut self, field: &Arc<FieldRef>) -> Result<i32, JitError> {
        match field.get() {
            Some((_, FieldHome::Instance { offset })) => {
                self.a.mov_ri32(ITMP3, *offset);
                Ok(0)
            }
            Some((_, FieldHome::Static { .. })) => Err(JitError::Codegen(
                "instance access to static field".into(),
            )),
            None => {
                self.load_resolvable(
                    ITMP3,
                    PatchKind::InstanceFieldOffset(field.clone()),
                );
                Ok(-1)
            }
        }
    }

    fn lower_getfield(
        &mut self,
        obj: SlotId,
        field: &Arc<FieldRef>,
        dst: SlotId,
        pc: u32,
    ) -> Result<(), JitError> {
        let bias = self.field_offset(field)?;
        let o = self.int_src(obj, ITMP2);
        self.null_check(o, pc);
        let vt = field.ty.value_type();
        if vt.is_float() {
            let single = vt == ValueType::Float;
            let d = self.flt_dst(dst, FTMP1);
            self.a.movs_load_sib(single, d, o, ITMP3, 0, bias);
            self.store_flt(dst, d);
        } else {
            let w = vt != ValueType::Int;
            let d = self.int_dst(dst, ITMP1);
            self.a.load_sib(w, d, o, ITMP3, 0, bias);
            self.store_int(dst, d);
        }
        Ok(())
    }

    fn lower_putfield(
        &mut self,
        obj: SlotId,
        field: &Arc<FieldRef>,
        value: SlotId,
        pc: u32,
    ) -> Result<(), JitError> {
        let bias = self.field_offset(field)?;
        let o = self.int_src(obj, ITMP2);
        self.null_check(o, pc);
        let vt = field.ty.value_type();
        if vt.is_float() {
            let single = vt == ValueType::Float;
            let v = self.flt_src(value, FTMP1);
            self.a.movs_store_sib(single, o, ITMP3, 0, bias, v);
        } else {
            let w = vt != ValueType::Int;
            let v = self.int_src(value, ITMP1);
            self.a.store_sib(w, o, ITMP3, 0, bias, v);
        }
        Ok(())
    }

    /// Static storage cell address into ITMP3.
    fn static_cell(&mut self, field: &Arc<FieldRef>) {
        match field.get() {
            Some((_, FieldHome::Static { cell })) => {
                let off = self.dseg.word(*cell as u64);
                self.load_dseg(true, ITMP3, off);
            }
            _ => {
                self.load_resolvable(ITMP3, PatchKind::StaticFieldCell(field.clone()));
            }
        }
    }

    fn lower_getstatic(&mut self, field: &Arc<FieldRef>, dst: SlotId) -> Result<(), JitError> {
        self.static_cell(field);
        let vt = field.ty.value_type();
        if vt.is_float() {
            let single = vt == ValueType::Float;
            let d = self.flt_dst(dst, FTMP1);
            self.a.movs_load(single, d, ITMP3, 0);
            self.store_flt(dst, d);
        } else {
            let w = vt != ValueType::Int;
            let d = self.int_dst(dst, ITMP1);
            self.a.load(w, d, ITMP3, 0);
            self.store_int(dst, d);
        }
        Ok(())
    }

    fn lower_putstatic(&mut self, field: &Arc<FieldRef>, value: SlotId) -> Result<(), JitError> {
        self.static_cell(field);
        let vt = field.ty.value_type();
        if vt.is_float() {
            let single = vt == ValueType::Float;
            let v = self.flt_src(value, FTMP1);
            self.a.movs_store(single, ITMP3, 0, v);
        } else {
            let w = vt != ValueType::Int;
            let v = self.int_src(value, ITMP1);
            self.a.store(w, ITMP3, 0, v);
        }
        Ok(())
    }

    /// Load a class's vtable pointer into `dst`, through the patcher when
    /// the class is not yet resolved.
    fn load_class_vtable(&mut self, dst: u8, class: &Arc<ClassRef>) {
        match class.get() {
            Some(c) => {
                let off = self.dseg.word(c.vtable_ptr() as u64);
                self.load_dseg(true, dst, off);
            }
            None => {
                self.load_resolvable(dst, PatchKind::ClassVtable(class.clone()));
            }
        }
    }

    fn lower_checkcast(&mut self, obj: SlotId, class: &Arc<ClassRef>) -> Result<(), JitError> {
        match class.get() {
            Some(c) if !c.is_interface() => {
                // Inline subtype-range check; null always passes.
                let o = self.int_src(obj, ITMP1);
                self.a.test_rr(true, o, o);
                let j_ok = self.a.jcc(Cc::E);
                let off = self.dseg.word(c.vtable_ptr() as u64);
                self.load_dseg(true, ITMP2, off);
                self.a.load(true, ITMP3, o, 0);
                self.a.load(false, RAX, ITMP3, VTBL_BASEVAL_OFFSET);
                self.a.alu_rm(Alu::Sub, false, RAX, ITMP2, VTBL_BASEVAL_OFFSET);
                self.a.alu_rm(Alu::Cmp, false, RAX, ITMP2, VTBL_DIFFVAL_OFFSET);
                let site = self.a.pos() as u32;
                self.jcc_to_trailer(
                    Cc::A,
                    Trailer::Throw {
                        kind: throw_kind::CLASS_CAST,
                        site,
                        extra: None,
                    },
                );
                self.bind(j_ok);
            }
            _ => {
                // Interfaces and unresolved targets go through the runtime.
                self.load_class_vtable(ITMP3, class);
                let o = self.int_src(obj, ITMP1);
                if o != RDI {
                    self.a.mov_rr(true, RDI, o);
                }
                self.a.mov_rr(true, RSI, ITMP3);
                let f = self.dseg.word(self.anchors.builtins.checkcast as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.a.test_rr(false, RAX, RAX);
                let site = self.a.pos() as u32;
                self.jcc_to_trailer(
                    Cc::E,
                    Trailer::Throw {
                        kind: throw_kind::CLASS_CAST,
                        site,
                        extra: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn lower_instanceof(
        &mut self,
        obj: SlotId,
        class: &Arc<ClassRef>,
        dst: SlotId,
    ) -> Result<(), JitError> {
        match class.get() {
            Some(c) if !c.is_interface() => {
                let o = self.int_src(obj, ITMP1);
                let d = self.int_dst(dst, ITMP2);
                // Result starts at 0; null stays there.
                self.a.alu_rr(Alu::Xor, false, d, d);
                self.a.test_rr(true, o, o);
                let j_done = self.a.jcc(Cc::E);
                let off = self.dseg.word(c.vtable_ptr() as u64);
                self.load_dseg(true, ITMP3, off);
                self.a.load(true, RAX, o, 0);
                self.a.load(false, RAX, RAX, VTBL_BASEVAL_OFFSET);
                self.a.alu_rm(Alu::Sub, false, RAX, ITMP3, VTBL_BASEVAL_OFFSET);
                self.a.alu_rm(Alu::Cmp, false, RAX, ITMP3, VTBL_DIFFVAL_OFFSET);
                self.a.setcc(Cc::Be, d);
                self.a.movzx8_rr(d, d);
                self.bind(j_done);
                self.store_int(dst, d);
            }
            _ => {
                self.load_class_vtable(ITMP3, class);
                let o = self.int_src(obj, ITMP1);
                if o != RDI {
                    self.a.mov_rr(true, RDI, o);
                }
                self.a.mov_rr(true, RSI, ITMP3);
                let f = self.dseg.word(self.anchors.builtins.instanceof as u64);
                self.call_dseg(f);
                self.record_call_site();
                self.store_int(dst, RAX);
            }
        }
        Ok(())
    }

    fn lower_invoke(
        &mut self,
        kind: InvokeKind,
        mref: &Arc<crate::classfile::constant_pool::MethodRef>,
        args: &[SlotId],
        dst: Option<SlotId>,
        pc: u32,
    ) -> Result<(), JitError> {
        let reserve = self.emit_call_args(args);

        if kind != InvokeKind::Static {
            // Receiver sits in the first integer argument register.
            self.null_check(RDI, pc);
        }

        match kind {
            InvokeKind::Static | InvokeKind::Special => {
                let resolved = mref.get().and_then(|m| {
                    if let Some(class) = m.class() {
                        crate::runtime::Vm::get().ensure_prepared(&class);
                    }
                    m.callable_address()
                });
                let slot = match resolved {
                    Some(addr) => {
                        let off = self.dseg.slot(addr as u64);
                        self.load_dseg(true, ITMP3, off);
                        off
                    }
                    None => self.load_resolvable(ITMP3, PatchKind::MethodEntry(mref.clone())),
                };
                self.a.call_reg(ITMP3);
                self.call_sites.push(CallSite {
                    ret_mpc: self.a.pos() as u32,
                    dseg_offset: slot as u32,
                });
            }
            InvokeKind::Virtual => {
                match mref.get().and_then(|m| m.vtable_index()) {
                    Some(idx) => {
                        self.a.load(true, ITMP2, RDI, 0);
                        self.a.load(true, ITMP2, ITMP2, VTBL_METHODS_OFFSET);
                        self.a.call_mem(ITMP2, idx as i32 * 8);
                    }
                    None => {
                        self.load_resolvable(ITMP3, PatchKind::VtableIndex(mref.clone()));
                        self.a.load(true, ITMP2, RDI, 0);
                        self.a.load(true, ITMP2, ITMP2, VTBL_METHODS_OFFSET);
                        self.a.call_mem_sib(ITMP2, ITMP3, 3, -8);
                    }
                }
            }
            InvokeKind::Interface => {
                let resolved = mref.get().and_then(|m| {
                    let class = crate::runtime::Vm::get()
                        .registry()
                        .lookup(&mref.class_name)?;
                    let idx = class.interface_index?;
                    let slot =
                        crate::classfile::class::Class::itable_slot_of(&class, &mref.name, &mref.desc)?;
                    let _ = m;
                    Some((idx, slot))
                });
                match resolved {
                    Some((ifc, slot)) => {
                        self.a.load(true, ITMP2, RDI, 0);
                        self.a.load(true, ITMP2, ITMP2, VTBL_ITABLE_OFFSET);
                        self.a.load(true, ITMP2, ITMP2, ifc as i32 * 8);
                        self.icce_check(pc);
                        self.a.call_mem(ITMP2, slot as i32 * 8);
                    }
                    None => {
                        let off =
                            self.load_resolvable(ITMP3, PatchKind::InterfaceSlots(mref.clone()));
                        // The following slot carries the method position.
                        let slot2 = self.dseg.slot(0);
                        debug_assert_eq!(slot2, off + 8);
                        self.a.load(true, ITMP2, RDI, 0);
                        self.a.load(true, ITMP2, ITMP2, VTBL_ITABLE_OFFSET);
                        self.a.load_sib(true, ITMP2, ITMP2, ITMP3, 3, -8);
                        self.icce_check(pc);
                        self.load_dseg(true, RAX, slot2);
                        self.a.call_mem_sib(ITMP2, RAX, 3, 0);
                    }
                }
            }
        }

        self.record_call_site();
        if reserve > 0 {
            self.a.alu_ri(Alu::Add, true, RSP, reserve);
            self.stack_adj -= reserve;
        }
        if let Some(d) = dst {
            if self.is_float(d) {
                self.store_flt(d, XMM0);
            } else {
                self.store_int(d, RAX);
            }
        }
        Ok(())
    }

    fn icce_check(&mut self, _pc: u32) {
        self.a.test_rr(true, ITMP2, ITMP2);
        let site = self.a.pos() as u32;
        self.jcc_to_trailer(
            Cc::E,
            Trailer::Throw {
                kind: throw_kind::INCOMPATIBLE_CLASS_CHANGE,
                site,
                extra: None,
            },
        );
    }

    /// Materialize call arguments into their System V positions. Returns
    /// the bytes reserved for outgoing stack arguments.
    fn emit_call_args(&mut self, args: &[SlotId]) -> i32 {
        let mut int_n = 0usize;
        let mut flt_n = 0usize;
        let mut int_moves: Vec<(Loc, u8)> = Vec::new();
        let mut flt_moves: Vec<(SlotId, u8)> = Vec::new();
        let mut stack_args: Vec<(SlotId, i32)> = Vec::new();
        let mut stack_n = 0i32;

        for &arg in args {
            if self.is_float(arg) {
                if flt_n < REGISTER_SET.float_args.len() {
                    flt_moves.push((arg, REGISTER_SET.float_args[flt_n]));
                    flt_n += 1;
                } else {
                    stack_args.push((arg, stack_n));
                    stack_n += 1;
                }
            } else if int_n < REGISTER_SET.int_args.len() {
                int_moves.push((self.loc(arg), REGISTER_SET.int_args[int_n]));
                int_n += 1;
            } else {
                stack_args.push((arg, stack_n));
                stack_n += 1;
            }
        }

        let reserve = (stack_n * 8 + 15) & !15;
        if reserve > 0 {
            self.a.alu_ri(Alu::Sub, true, RSP, reserve);
            self.stack_adj += reserve;
            for (arg, pos) in stack_args {
                if self.is_float(arg) {
                    let r = self.flt_src(arg, FTMP1);
                    self.a.movs_store(self.is_single(arg), RSP, pos * 8, r);
                } else {
                    let r = self.int_src(arg, ITMP1);
                    self.a.store(true, RSP, pos * 8, r);
                }
            }
        }

        // Float argument homes (xmm8-11 or memory) never alias xmm0-7.
        for (arg, dst) in flt_moves {
            let single = self.is_single(arg);
            match self.loc(arg) {
                Loc::Reg(s) => self.a.movs_rr(single, dst, s),
                Loc::Mem(off) => {
                    let off = off + self.stack_adj;
                    self.a.movs_load(single, dst, RSP, off);
                }
            }
        }

        self.resolve_parallel_int(int_moves);
        reserve
    }

    /// Emit a parallel register assignment. Cycles among argument registers
    /// break through ITMP3; the drained cycle frees the scratch before the
    /// next one can need it.
    fn resolve_parallel_int(&mut self, moves: Vec<(Loc, u8)>) {
        let mut pending: Vec<(Loc, u8)> = moves
            .into_iter()
            .filter(|&(src, dst)| src != Loc::Reg(dst))
            .collect();

        while !pending.is_empty() {
            let emittable = pending.iter().position(|&(_, dst)| {
                !pending.iter().any(|&(src, _)| src == Loc::Reg(dst))
            });
            match emittable {
                Some(i) => {
                    let (src, dst) = pending.remove(i);
                    match src {
                        Loc::Reg(s) => self.a.mov_rr(true, dst, s),
                        Loc::Mem(off) => {
                            let off = off + self.stack_adj;
                            self.a.load(true, dst, RSP, off);
                        }
                    }
                }
                None => {
                    // Pure register cycle: park the first source.
                    let (src, _) = pending[0];
                    let Loc::Reg(s) = src else {
                        unreachable!("blocked moves have register sources")
                    };
                    self.a.mov_rr(true, ITMP3, s);
                    pending[0].0 = Loc::Reg(ITMP3);
                }
            }
        }
    }
}

fn cond_cc(cond: Cond) -> Cc {
    match cond {
        Cond::Eq => Cc::E,
        Cond::Ne => Cc::Ne,
        Cond::Lt => Cc::L,
        Cond::Ge => Cc::Ge,
        Cond::Gt => Cc::G,
        Cond::Le => Cc::Le,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_set_shape() {
        let set = &REGISTER_SET;
        assert_eq!(set.int_args, &[RDI, RSI, RDX, RCX, R8, R9]);
        assert_eq!(set.int_saved, &SAVED_ORDER);
        assert!(set.float_saved.is_empty());
        assert_eq!(set.int_ret, RAX);
    }

    #[test]
    fn test_dseg_dedup_and_slots() {
        let mut d = Dseg::new();
        let a = d.word(42);
        let b = d.word(42);
        assert_eq!(a, b);
        // Patchable slots never deduplicate.
        let s1 = d.slot(0);
        let s2 = d.slot(0);
        assert_ne!(s1, s2);
        assert_eq!(d.bytes.len(), 24);
    }

    #[test]
    fn test_frame_size_alignment() {
        // raw ≡ 0 (mod 16) gets the extra word; raw ≡ 8 stays.
        for (memuse, saved, expect) in [(0u32, 0u8, 8i32), (1, 0, 8), (1, 1, 24), (2, 0, 24)] {
            let raw = (memuse + saved as u32) as i32 * 8;
            let frame = if raw % 16 == 8 { raw } else { raw + 8 };
            assert_eq!(frame % 16, 8, "memuse={} saved={}", memuse, saved);
            assert_eq!(frame, expect);
        }
    }
}
