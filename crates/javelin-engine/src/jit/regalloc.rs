//! Register allocation
//!
//! A single deterministic pass over the slot array. Persistent variables
//! (locals, parameters, interface slots, and temporaries that live across a
//! call) draw from the callee-saved pools in canonical order and spill to
//! the frame when the pool runs dry. Block-local temporaries are keyed by
//! the stack depth they were created at: two temporaries at the same depth
//! are never live at once, so each depth owns one caller-saved register,
//! and depths past the pool spill. Destination and left-hand source of a
//! binary operation land at the same depth, which is exactly the tie a
//! two-address target wants.
//!
//! Allocation never fails: the frame grows by one 8-byte slot per spill,
//! bounded by the method's locals and stack.

use super::ir::{IrMethod, SlotKind, StackSlot};
use super::target::RegisterSet;

/// Frame facts the emitter needs, produced alongside slot assignment.
#[derive(Debug, Clone)]
pub struct FrameAlloc {
    /// 8-byte spill slots in use, including the sync slot.
    pub memuse: u32,
    /// How many of the canonical callee-saved integer registers are in use.
    pub int_saved_used: u8,
    /// Same for float registers.
    pub float_saved_used: u8,
    /// Byte offset of the monitor-target slot for synchronized methods.
    pub sync_slot: Option<i32>,
}

/// Assign every slot a register or a frame offset.
pub fn allocate(ir: &mut IrMethod, regs: &RegisterSet, synchronized: bool) -> FrameAlloc {
    let mut memuse: u32 = 0;
    let mut next_int_saved = 0usize;
    let mut next_float_saved = 0usize;

    let sync_slot = if synchronized {
        let off = (memuse * 8) as i32;
        memuse += 1;
        Some(off)
    } else {
        None
    };

    for slot in ir.slots.iter_mut() {
        let persistent = matches!(
            slot.kind,
            SlotKind::Local | SlotKind::Arg | SlotKind::Stack
        ) || slot.saved;

        if slot.ty.is_float() {
            if persistent {
                if next_float_saved < regs.float_saved.len() {
                    assign_reg(slot, regs.float_saved[next_float_saved]);
                    next_float_saved += 1;
                } else {
                    spill(slot, &mut memuse);
                }
            } else if (slot.varnum as usize) < regs.float_tmps.len() {
                assign_reg(slot, regs.float_tmps[slot.varnum as usize]);
            } else {
                spill(slot, &mut memuse);
            }
        } else if persistent {
            if next_int_saved < regs.int_saved.len() {
                assign_reg(slot, regs.int_saved[next_int_saved]);
                next_int_saved += 1;
            } else {
                spill(slot, &mut memuse);
            }
        } else if (slot.varnum as usize) < regs.int_tmps.len() {
            assign_reg(slot, regs.int_tmps[slot.varnum as usize]);
        } else {
            spill(slot, &mut memuse);
        }
    }

    FrameAlloc {
        memuse,
        int_saved_used: next_int_saved as u8,
        float_saved_used: next_float_saved as u8,
        sync_slot,
    }
}

fn assign_reg(slot: &mut StackSlot, reg: u8) {
    slot.in_memory = false;
    slot.regoff = reg as i32;
}

fn spill(slot: &mut StackSlot, memuse: &mut u32) {
    slot.in_memory = true;
    slot.regoff = (*memuse * 8) as i32;
    *memuse += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::constant_pool::ConstantPool;
    use crate::classfile::descriptor::{MethodDescriptor, ValueType};
    use crate::classfile::flags::MethodFlags;
    use crate::classfile::method::Method;
    use crate::jit::target::x86_64;
    use crate::jit::{parser, stack};
    use std::sync::Arc;

    fn build_ir(desc: &str, code: Vec<u8>) -> IrMethod {
        let m = Method::new(
            "t",
            desc,
            MethodDescriptor::parse(desc).unwrap(),
            MethodFlags::STATIC,
            8,
            8,
            code.into_boxed_slice(),
            vec![],
            vec![],
            Arc::new(ConstantPool::new()),
        );
        let parsed = parser::parse(&m).unwrap();
        stack::analyze(&m, parsed).unwrap()
    }

    fn regs() -> &'static RegisterSet {
        x86_64::Backend::new().register_set_static()
    }

    #[test]
    fn test_params_get_saved_registers() {
        // static int add(int, int)
        let mut ir = build_ir("(II)I", vec![0x1a, 0x1b, 0x60, 0xac]);
        let frame = allocate(&mut ir, regs(), false);

        for &p in &ir.params {
            let s = ir.slot(p);
            assert!(!s.in_memory);
            assert!(regs().int_saved.contains(&(s.regoff as u8)));
        }
        assert_eq!(frame.int_saved_used as usize, 2);
        assert_eq!(frame.sync_slot, None);
    }

    #[test]
    fn test_temps_keyed_by_depth() {
        let mut ir = build_ir("(II)I", vec![0x1a, 0x1b, 0x60, 0xac]);
        allocate(&mut ir, regs(), false);

        let temps: Vec<&StackSlot> = ir
            .slots
            .iter()
            .filter(|s| s.kind == SlotKind::Temp)
            .collect();
        // iload_0 temp at depth 0, iload_1 temp at depth 1, iadd result at 0.
        assert_eq!(temps[0].regoff as u8, regs().int_tmps[0]);
        assert_eq!(temps[1].regoff as u8, regs().int_tmps[1]);
        assert_eq!(temps[2].regoff, temps[0].regoff);
    }

    #[test]
    fn test_spill_offsets_disjoint_and_aligned() {
        // 12 int locals force the saved pool dry.
        let mut code = Vec::new();
        for i in 0..12u8 {
            code.push(0x03); // iconst_0
            code.extend_from_slice(&[0x36, i]); // istore i
        }
        code.push(0xb1);
        let mut ir = build_ir("()V", code);
        let frame = allocate(&mut ir, regs(), false);

        let spilled: Vec<&StackSlot> = ir.slots.iter().filter(|s| s.in_memory).collect();
        assert!(!spilled.is_empty());
        let mut offsets: Vec<i32> = spilled.iter().map(|s| s.regoff).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), spilled.len(), "spill offsets must be disjoint");
        for off in offsets {
            assert!(off >= 0);
            assert_eq!(off % 8, 0);
            assert!(off < (frame.memuse * 8) as i32);
        }
    }

    #[test]
    fn test_float_temps_from_float_pool() {
        // fconst_0, fconst_1, fadd, freturn
        let mut ir = build_ir("()F", vec![0x0b, 0x0c, 0x62, 0xae]);
        allocate(&mut ir, regs(), false);
        for s in ir.slots.iter().filter(|s| s.kind == SlotKind::Temp) {
            assert_eq!(s.ty, ValueType::Float);
            assert!(regs().float_tmps.contains(&(s.regoff as u8)));
        }
    }

    #[test]
    fn test_sync_slot_reserved() {
        let mut ir = build_ir("()V", vec![0xb1]);
        let frame = allocate(&mut ir, regs(), true);
        assert_eq!(frame.sync_slot, Some(0));
        assert!(frame.memuse >= 1);
        // No spilled slot shares the sync slot.
        for s in ir.slots.iter().filter(|s| s.in_memory) {
            assert_ne!(s.regoff, 0);
        }
    }

    #[test]
    fn test_deterministic() {
        let build = || {
            let mut ir = build_ir("(II)I", vec![0x1a, 0x1b, 0x60, 0xac]);
            allocate(&mut ir, regs(), false);
            ir.slots
                .iter()
                .map(|s| (s.in_memory, s.regoff))
                .collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }
}
