//! Stack analysis
//!
//! Simulates the abstract operand stack over the block graph and assigns
//! every produced value a typed pseudo-variable. Block boundaries go through
//! method-global interface slots, one per (stack depth, type); predecessors
//! append reconciling moves before their transfer so every successor sees
//! the agreed arrangement. Locals are not statically typed in class files,
//! so each (local index, type) pair is its own variable.

use rustc_hash::FxHashMap;

use super::ir::*;
use super::parser::{ByteOp, Imm, ParsedMethod};
use crate::classfile::constant_pool::Constant;
use crate::classfile::descriptor::ValueType;
use crate::classfile::method::Method;
use crate::error::JitError;

/// Run stack analysis, turning the parsed skeleton into full IR.
pub fn analyze(method: &Method, parsed: ParsedMethod) -> Result<IrMethod, JitError> {
    Analyzer::new(method, parsed).run()
}

struct Analyzer<'m> {
    method: &'m Method,
    ops: Vec<ByteOp>,
    pc_to_op: FxHashMap<u32, usize>,
    blocks: Vec<Block>,
    pc_to_block: FxHashMap<u32, BlockId>,
    exception_entries: Vec<ExEntry>,

    slots: Vec<StackSlot>,
    interface_slots: FxHashMap<(u16, ValueType), SlotId>,
    locals: FxHashMap<(u16, ValueType), SlotId>,
    params: Vec<SlotId>,
    in_shapes: Vec<Option<Vec<ValueType>>>,
    max_stack_depth: u16,
    is_leaf: bool,
}

impl<'m> Analyzer<'m> {
    fn new(method: &'m Method, parsed: ParsedMethod) -> Self {
        let nblocks = parsed.blocks.len();
        Analyzer {
            method,
            ops: parsed.ops,
            pc_to_op: parsed.pc_to_op,
            blocks: parsed.blocks,
            pc_to_block: parsed.pc_to_block,
            exception_entries: parsed.exception_entries,
            slots: Vec::new(),
            interface_slots: FxHashMap::default(),
            locals: FxHashMap::default(),
            params: Vec::new(),
            in_shapes: vec![None; nblocks],
            max_stack_depth: 0,
            is_leaf: true,
        }
    }

    fn run(mut self) -> Result<IrMethod, JitError> {
        self.setup_params();

        let mut work: Vec<(BlockId, Vec<ValueType>)> = vec![(BlockId(0), Vec::new())];
        while let Some((id, shape)) = work.pop() {
            self.process_block(id, shape, &mut work)?;
        }

        Ok(IrMethod {
            blocks: self.blocks,
            slots: self.slots,
            interface_slots: self.interface_slots,
            locals: self.locals,
            params: self.params,
            exception_entries: self.exception_entries,
            raw_exception_table: self.method.exception_table.clone(),
            max_stack_depth: self.max_stack_depth,
            is_leaf: self.is_leaf,
        })
    }

    /// Parameters are the initial local variables; the prologue will move
    /// them from their calling-convention positions to the allocated homes.
    fn setup_params(&mut self) {
        let mut local_index = 0u16;
        if !self.method.is_static() {
            let id = self.new_slot(SlotKind::Arg, ValueType::Address, local_index);
            self.locals.insert((local_index, ValueType::Address), id);
            self.params.push(id);
            local_index += 1;
        }
        let param_types: Vec<ValueType> = self
            .method
            .descriptor
            .params
            .iter()
            .map(|p| p.value_type())
            .collect();
        for ty in param_types {
            let id = self.new_slot(SlotKind::Arg, ty, local_index);
            self.locals.insert((local_index, ty), id);
            self.params.push(id);
            local_index += if ty.is_twoword() { 2 } else { 1 };
        }
    }

    fn new_slot(&mut self, kind: SlotKind, ty: ValueType, varnum: u16) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        let mut slot = StackSlot::new(kind, ty);
        slot.varnum = varnum;
        // Interface slots cross block boundaries and conservatively calls.
        slot.saved = matches!(kind, SlotKind::Stack);
        self.slots.push(slot);
        id
    }

    fn new_temp(&mut self, ty: ValueType, depth: usize) -> SlotId {
        self.new_slot(SlotKind::Temp, ty, depth as u16)
    }

    fn local(&mut self, index: u16, ty: ValueType) -> SlotId {
        if let Some(&id) = self.locals.get(&(index, ty)) {
            return id;
        }
        let id = self.new_slot(SlotKind::Local, ty, index);
        self.locals.insert((index, ty), id);
        id
    }

    fn interface(&mut self, depth: u16, ty: ValueType) -> SlotId {
        if let Some(&id) = self.interface_slots.get(&(depth, ty)) {
            return id;
        }
        let id = self.new_slot(SlotKind::Stack, ty, depth);
        self.interface_slots.insert((depth, ty), id);
        id
    }

    fn slot_ty(&self, id: SlotId) -> ValueType {
        self.slots[id.0 as usize].ty
    }

    fn err(&self, pc: u32, reason: impl Into<String>) -> JitError {
        JitError::Analysis {
            pc,
            reason: reason.into(),
        }
    }

    fn process_block(
        &mut self,
        id: BlockId,
        shape: Vec<ValueType>,
        work: &mut Vec<(BlockId, Vec<ValueType>)>,
    ) -> Result<(), JitError> {
        let idx = id.0 as usize;
        let shape = if self.blocks[idx].is_handler_entry {
            vec![ValueType::Address]
        } else {
            shape
        };
        if let Some(existing) = &self.in_shapes[idx] {
            if *existing != shape {
                return Err(self.err(
                    self.blocks[idx].start_pc,
                    format!(
                        "stack shape mismatch at block entry: {:?} vs {:?}",
                        existing, shape
                    ),
                ));
            }
            return Ok(());
        }
        self.in_shapes[idx] = Some(shape.clone());

        let mut stack: Vec<SlotId> = Vec::with_capacity(shape.len());
        for (depth, &ty) in shape.iter().enumerate() {
            stack.push(self.interface(depth as u16, ty));
        }
        self.blocks[idx].in_stack = stack.clone();
        self.max_stack_depth = self.max_stack_depth.max(stack.len() as u16);

        // Handlers covering this block observe the locals; whatever it
        // throws reaches them with just the exception on the stack.
        for h in self.blocks[idx].handlers.clone() {
            work.push((h, Vec::new()));
        }

        let (start_pc, end_pc) = (self.blocks[idx].start_pc, self.blocks[idx].end_pc);
        let mut instrs: Vec<Instr> = Vec::new();
        let op_indices: Vec<usize> = {
            let mut v = Vec::new();
            let mut pc = start_pc;
            while pc < end_pc {
                let i = *self.pc_to_op.get(&pc).ok_or_else(|| {
                    self.err(pc, "pc does not start an instruction")
                })?;
                v.push(i);
                pc = self
                    .ops
                    .get(i + 1)
                    .map(|o| o.pc)
                    .unwrap_or(end_pc)
                    .max(pc + 1);
            }
            v
        };

        let mut terminated = false;
        for &oi in &op_indices {
            let op = self.ops[oi].clone();
            if op.opcode.ends_block() {
                self.translate_terminator(id, &op, &mut stack, &mut instrs, work)?;
                terminated = true;
                break;
            }
            self.translate(&op, &mut stack, &mut instrs)?;
            self.max_stack_depth = self.max_stack_depth.max(stack.len() as u16);
        }

        if !terminated {
            // Fallthrough edge: reconcile and hand the shape on.
            let out_shape = self.flush(end_pc, &mut stack, &mut instrs);
            if let Some(&next) = self.blocks[idx].successors.first() {
                work.push((next, out_shape));
            }
        }

        self.blocks[idx].instrs = instrs;
        Ok(())
    }

    /// Move every live stack value into its interface slot and return the
    /// resulting shape. A value already in the right cell stays put; when a
    /// pending destination is also a pending source (a `swap` of two
    /// interface values), the cycle is broken through fresh temporaries.
    fn flush(
        &mut self,
        pc: u32,
        stack: &mut Vec<SlotId>,
        instrs: &mut Vec<Instr>,
    ) -> Vec<ValueType> {
        let mut shape = Vec::with_capacity(stack.len());
        let mut moves: Vec<(SlotId, SlotId, usize)> = Vec::new();
        for (depth, &src) in stack.iter().enumerate() {
            let ty = self.slot_ty(src);
            shape.push(ty);
            let dst = self.interface(depth as u16, ty);
            if src != dst {
                moves.push((src, dst, depth));
            }
        }
        let needs_temps = moves
            .iter()
            .any(|(_, dst, _)| moves.iter().any(|(src, _, _)| src == dst));
        if needs_temps {
            let staged: Vec<(SlotId, SlotId)> = moves
                .iter()
                .map(|&(src, dst, depth)| {
                    let tmp = self.new_temp(self.slot_ty(src), depth);
                    instrs.push(Instr {
                        pc,
                        kind: InstrKind::Move { src, dst: tmp },
                    });
                    (tmp, dst)
                })
                .collect();
            for (tmp, dst) in staged {
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Move { src: tmp, dst },
                });
            }
        } else {
            for (src, dst, _) in moves {
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Move { src, dst },
                });
            }
        }
        stack.clear();
        for (depth, &ty) in shape.iter().enumerate() {
            let s = self.interface(depth as u16, ty);
            stack.push(s);
        }
        shape
    }

    fn pop(&self, pc: u32, stack: &mut Vec<SlotId>) -> Result<SlotId, JitError> {
        stack
            .pop()
            .ok_or_else(|| self.err(pc, "operand stack underflow"))
    }

    fn pop_ty(
        &self,
        pc: u32,
        stack: &mut Vec<SlotId>,
        ty: ValueType,
    ) -> Result<SlotId, JitError> {
        let s = self.pop(pc, stack)?;
        let actual = self.slot_ty(s);
        if actual != ty {
            return Err(self.err(pc, format!("expected {} on stack, found {}", ty, actual)));
        }
        Ok(s)
    }

    /// Mark everything still on the stack as live across a call.
    fn mark_saved(&mut self, stack: &[SlotId]) {
        self.is_leaf = false;
        for &s in stack {
            self.slots[s.0 as usize].saved = true;
        }
    }

    fn target_block(&self, pc: u32, target: u32) -> Result<BlockId, JitError> {
        self.pc_to_block
            .get(&target)
            .copied()
            .ok_or_else(|| self.err(pc, format!("branch target {} has no block", target)))
    }

    fn translate_terminator(
        &mut self,
        _block: BlockId,
        op: &ByteOp,
        stack: &mut Vec<SlotId>,
        instrs: &mut Vec<Instr>,
        work: &mut Vec<(BlockId, Vec<ValueType>)>,
    ) -> Result<(), JitError> {
        use super::opcode::Opcode::*;
        let pc = op.pc;
        match op.opcode {
            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle => {
                let lhs = self.pop_ty(pc, stack, ValueType::Int)?;
                let shape = self.flush(pc, stack, instrs);
                let target = self.branch_target(op)?;
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::If {
                        cond: cond_of(op.opcode),
                        lhs,
                        rhs: IfRhs::Zero,
                        target,
                    },
                });
                self.enqueue_branch(op, shape, work)?;
            }
            IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple => {
                let rhs = self.pop_ty(pc, stack, ValueType::Int)?;
                let lhs = self.pop_ty(pc, stack, ValueType::Int)?;
                let shape = self.flush(pc, stack, instrs);
                let target = self.branch_target(op)?;
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::If {
                        cond: cond_of(op.opcode),
                        lhs,
                        rhs: IfRhs::Slot(rhs),
                        target,
                    },
                });
                self.enqueue_branch(op, shape, work)?;
            }
            IfAcmpeq | IfAcmpne => {
                let rhs = self.pop_ty(pc, stack, ValueType::Address)?;
                let lhs = self.pop_ty(pc, stack, ValueType::Address)?;
                let shape = self.flush(pc, stack, instrs);
                let target = self.branch_target(op)?;
                let cond = if op.opcode == IfAcmpeq { Cond::Eq } else { Cond::Ne };
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::If {
                        cond,
                        lhs,
                        rhs: IfRhs::Slot(rhs),
                        target,
                    },
                });
                self.enqueue_branch(op, shape, work)?;
            }
            Ifnull | Ifnonnull => {
                let lhs = self.pop_ty(pc, stack, ValueType::Address)?;
                let shape = self.flush(pc, stack, instrs);
                let target = self.branch_target(op)?;
                let cond = if op.opcode == Ifnull { Cond::Eq } else { Cond::Ne };
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::If {
                        cond,
                        lhs,
                        rhs: IfRhs::Null,
                        target,
                    },
                });
                self.enqueue_branch(op, shape, work)?;
            }
            Goto | GotoW => {
                let shape = self.flush(pc, stack, instrs);
                let target = self.branch_target(op)?;
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Goto { target },
                });
                work.push((target, shape));
            }
            Jsr | JsrW => {
                let shape = self.flush(pc, stack, instrs);
                let target = self.branch_target(op)?;
                let depth = shape.len() as u16;
                let dst = self.interface(depth, ValueType::Ret);
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Jsr { target, dst },
                });
                let mut target_shape = shape.clone();
                target_shape.push(ValueType::Ret);
                work.push((target, target_shape));
                // The op after jsr is re-entered by ret with the pre-jsr
                // shape.
                if let Some(next) = self.next_pc(op) {
                    let ft = self.target_block(pc, next)?;
                    work.push((ft, shape));
                }
            }
            Ret => {
                let Imm::Local(index) = op.imm else {
                    return Err(self.err(pc, "ret without local operand"));
                };
                let slot = self.local(index, ValueType::Ret);
                let _ = self.flush(pc, stack, instrs);
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::RetLocal { slot },
                });
            }
            Tableswitch => {
                let key = self.pop_ty(pc, stack, ValueType::Int)?;
                let shape = self.flush(pc, stack, instrs);
                let Imm::Table {
                    default,
                    low,
                    targets,
                } = &op.imm
                else {
                    return Err(self.err(pc, "tableswitch without table"));
                };
                let default_b = self.target_block(pc, *default)?;
                let mut target_blocks = Vec::with_capacity(targets.len());
                for t in targets {
                    let b = self.target_block(pc, *t)?;
                    target_blocks.push(b);
                    work.push((b, shape.clone()));
                }
                work.push((default_b, shape));
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::TableSwitch {
                        key,
                        low: *low,
                        targets: target_blocks,
                        default: default_b,
                    },
                });
            }
            Lookupswitch => {
                let key = self.pop_ty(pc, stack, ValueType::Int)?;
                let shape = self.flush(pc, stack, instrs);
                let Imm::Lookup { default, pairs } = &op.imm else {
                    return Err(self.err(pc, "lookupswitch without pairs"));
                };
                let default_b = self.target_block(pc, *default)?;
                let mut out_pairs = Vec::with_capacity(pairs.len());
                for (k, t) in pairs {
                    let b = self.target_block(pc, *t)?;
                    out_pairs.push((*k, b));
                    work.push((b, shape.clone()));
                }
                work.push((default_b, shape));
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::LookupSwitch {
                        key,
                        pairs: out_pairs,
                        default: default_b,
                    },
                });
            }
            Ireturn => self.emit_return(pc, stack, instrs, Some(ValueType::Int))?,
            Lreturn => self.emit_return(pc, stack, instrs, Some(ValueType::Long))?,
            Freturn => self.emit_return(pc, stack, instrs, Some(ValueType::Float))?,
            Dreturn => self.emit_return(pc, stack, instrs, Some(ValueType::Double))?,
            Areturn => self.emit_return(pc, stack, instrs, Some(ValueType::Address))?,
            Return => self.emit_return(pc, stack, instrs, None)?,
            Athrow => {
                let obj = self.pop_ty(pc, stack, ValueType::Address)?;
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Throw { obj },
                });
            }
            other => return Err(self.err(pc, format!("{:?} is not a terminator", other))),
        }
        Ok(())
    }

    fn emit_return(
        &mut self,
        pc: u32,
        stack: &mut Vec<SlotId>,
        instrs: &mut Vec<Instr>,
        ty: Option<ValueType>,
    ) -> Result<(), JitError> {
        let value = match ty {
            Some(t) => Some(self.pop_ty(pc, stack, t)?),
            None => None,
        };
        instrs.push(Instr {
            pc,
            kind: InstrKind::Return { value },
        });
        Ok(())
    }

    fn branch_target(&self, op: &ByteOp) -> Result<BlockId, JitError> {
        match &op.imm {
            Imm::Branch(t) => self.target_block(op.pc, *t),
            _ => Err(self.err(op.pc, "branch without target")),
        }
    }

    fn next_pc(&self, op: &ByteOp) -> Option<u32> {
        let idx = self.pc_to_op.get(&op.pc)?;
        self.ops.get(idx + 1).map(|o| o.pc)
    }

    fn enqueue_branch(
        &mut self,
        op: &ByteOp,
        shape: Vec<ValueType>,
        work: &mut Vec<(BlockId, Vec<ValueType>)>,
    ) -> Result<(), JitError> {
        let target = self.branch_target(op)?;
        work.push((target, shape.clone()));
        if let Some(next) = self.next_pc(op) {
            let ft = self.target_block(op.pc, next)?;
            work.push((ft, shape));
        }
        Ok(())
    }

    fn pool_constant(&self, pc: u32, idx: u16) -> Result<Constant, JitError> {
        self.method
            .pool
            .get(idx)
            .cloned()
            .ok_or_else(|| self.err(pc, format!("constant pool index {} out of range", idx)))
    }

    fn translate(
        &mut self,
        op: &ByteOp,
        stack: &mut Vec<SlotId>,
        instrs: &mut Vec<Instr>,
    ) -> Result<(), JitError> {
        use super::opcode::Opcode::*;
        let pc = op.pc;
        let push_const = |this: &mut Self, value: ConstValue, instrs: &mut Vec<Instr>,
                          stack: &mut Vec<SlotId>| {
            let dst = this.new_temp(value.ty(), stack.len());
            instrs.push(Instr {
                pc,
                kind: InstrKind::Const { dst, value },
            });
            stack.push(dst);
        };

        match op.opcode {
            Nop => {}
            AconstNull => push_const(self, ConstValue::Null, instrs, stack),
            IconstM1 => push_const(self, ConstValue::Int(-1), instrs, stack),
            Iconst0 => push_const(self, ConstValue::Int(0), instrs, stack),
            Iconst1 => push_const(self, ConstValue::Int(1), instrs, stack),
            Iconst2 => push_const(self, ConstValue::Int(2), instrs, stack),
            Iconst3 => push_const(self, ConstValue::Int(3), instrs, stack),
            Iconst4 => push_const(self, ConstValue::Int(4), instrs, stack),
            Iconst5 => push_const(self, ConstValue::Int(5), instrs, stack),
            Lconst0 => push_const(self, ConstValue::Long(0), instrs, stack),
            Lconst1 => push_const(self, ConstValue::Long(1), instrs, stack),
            Fconst0 => push_const(self, ConstValue::Float(0.0), instrs, stack),
            Fconst1 => push_const(self, ConstValue::Float(1.0), instrs, stack),
            Fconst2 => push_const(self, ConstValue::Float(2.0), instrs, stack),
            Dconst0 => push_const(self, ConstValue::Double(0.0), instrs, stack),
            Dconst1 => push_const(self, ConstValue::Double(1.0), instrs, stack),
            Bipush => {
                let Imm::Byte(v) = op.imm else {
                    return Err(self.err(pc, "bipush without byte"));
                };
                push_const(self, ConstValue::Int(v as i32), instrs, stack);
            }
            Sipush => {
                let Imm::Short(v) = op.imm else {
                    return Err(self.err(pc, "sipush without short"));
                };
                push_const(self, ConstValue::Int(v as i32), instrs, stack);
            }
            Ldc | LdcW | Ldc2W => {
                let Imm::Cp(idx) = op.imm else {
                    return Err(self.err(pc, "ldc without pool index"));
                };
                let value = match self.pool_constant(pc, idx)? {
                    Constant::Integer(v) => ConstValue::Int(v),
                    Constant::Float(v) => ConstValue::Float(v),
                    Constant::Long(v) => ConstValue::Long(v),
                    Constant::Double(v) => ConstValue::Double(v),
                    Constant::StringLit(s) => ConstValue::Str(s),
                    Constant::Class(c) => ConstValue::Class(c),
                    other => {
                        return Err(self.err(pc, format!("ldc of {:?}", other)));
                    }
                };
                if matches!(value, ConstValue::Str(_) | ConstValue::Class(_)) {
                    // Materialization may call into the runtime.
                    self.mark_saved(stack);
                }
                push_const(self, value, instrs, stack);
            }

            Iload | Lload | Fload | Dload | Aload | Iload0 | Iload1 | Iload2 | Iload3
            | Lload0 | Lload1 | Lload2 | Lload3 | Fload0 | Fload1 | Fload2 | Fload3
            | Dload0 | Dload1 | Dload2 | Dload3 | Aload0 | Aload1 | Aload2 | Aload3 => {
                let (index, ty) = load_store_target(op)?;
                // aload of a ret-address local re-loads the Ret variable.
                let ty = if ty == ValueType::Address
                    && self.locals.contains_key(&(index, ValueType::Ret))
                    && !self.locals.contains_key(&(index, ValueType::Address))
                {
                    ValueType::Ret
                } else {
                    ty
                };
                let src = self.local(index, ty);
                let dst = self.new_temp(ty, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Move { src, dst },
                });
                stack.push(dst);
            }

            Istore | Lstore | Fstore | Dstore | Astore | Istore0 | Istore1 | Istore2
            | Istore3 | Lstore0 | Lstore1 | Lstore2 | Lstore3 | Fstore0 | Fstore1
            | Fstore2 | Fstore3 | Dstore0 | Dstore1 | Dstore2 | Dstore3 | Astore0
            | Astore1 | Astore2 | Astore3 => {
                let (index, ty) = load_store_target(op)?;
                let src = self.pop(pc, stack)?;
                let actual = self.slot_ty(src);
                // astore of a jsr return address retypes the local to RET.
                let ty = if ty == ValueType::Address && actual == ValueType::Ret {
                    ValueType::Ret
                } else {
                    ty
                };
                if actual != ty {
                    return Err(self.err(pc, format!("store of {} into {} local", actual, ty)));
                }
                let dst = self.local(index, ty);
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Move { src, dst },
                });
            }

            Iaload | Laload | Faload | Daload | Aaload | Baload | Caload | Saload => {
                let elem = array_elem_of(op.opcode);
                let idx = self.pop_ty(pc, stack, ValueType::Int)?;
                let arr = self.pop_ty(pc, stack, ValueType::Address)?;
                let dst = self.new_temp(elem.value_type(), stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::ArrayLoad {
                        elem,
                        arr,
                        idx,
                        dst,
                    },
                });
                stack.push(dst);
            }
            Iastore | Lastore | Fastore | Dastore | Aastore | Bastore | Castore | Sastore => {
                let elem = array_elem_of(op.opcode);
                let value = self.pop_ty(pc, stack, elem.value_type())?;
                let idx = self.pop_ty(pc, stack, ValueType::Int)?;
                let arr = self.pop_ty(pc, stack, ValueType::Address)?;
                if elem == ArrayElem::Ref {
                    // The store check calls into the runtime; the operands
                    // are still needed for the store afterwards.
                    self.mark_saved(stack);
                    for s in [value, idx, arr] {
                        self.slots[s.0 as usize].saved = true;
                    }
                }
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::ArrayStore {
                        elem,
                        arr,
                        idx,
                        value,
                    },
                });
            }

            Pop => {
                let s = self.pop(pc, stack)?;
                if self.slot_ty(s).is_twoword() {
                    return Err(self.err(pc, "pop of two-word value"));
                }
            }
            Pop2 => {
                let s = self.pop(pc, stack)?;
                if !self.slot_ty(s).is_twoword() {
                    let s2 = self.pop(pc, stack)?;
                    if self.slot_ty(s2).is_twoword() {
                        return Err(self.err(pc, "pop2 split a two-word value"));
                    }
                }
            }
            Dup => {
                let &s = stack.last().ok_or_else(|| self.err(pc, "dup on empty stack"))?;
                if self.slot_ty(s).is_twoword() {
                    return Err(self.err(pc, "dup of two-word value"));
                }
                stack.push(s);
            }
            DupX1 => {
                let a = self.pop(pc, stack)?;
                let b = self.pop(pc, stack)?;
                stack.push(a);
                stack.push(b);
                stack.push(a);
            }
            DupX2 => {
                let a = self.pop(pc, stack)?;
                let b = self.pop(pc, stack)?;
                if self.slot_ty(b).is_twoword() {
                    stack.push(a);
                    stack.push(b);
                    stack.push(a);
                } else {
                    let c = self.pop(pc, stack)?;
                    stack.push(a);
                    stack.push(c);
                    stack.push(b);
                    stack.push(a);
                }
            }
            Dup2 => {
                let a = self.pop(pc, stack)?;
                if self.slot_ty(a).is_twoword() {
                    stack.push(a);
                    stack.push(a);
                } else {
                    let b = self.pop(pc, stack)?;
                    stack.push(b);
                    stack.push(a);
                    stack.push(b);
                    stack.push(a);
                }
            }
            Dup2X1 => {
                let a = self.pop(pc, stack)?;
                if self.slot_ty(a).is_twoword() {
                    let b = self.pop(pc, stack)?;
                    stack.push(a);
                    stack.push(b);
                    stack.push(a);
                } else {
                    let b = self.pop(pc, stack)?;
                    let c = self.pop(pc, stack)?;
                    stack.push(b);
                    stack.push(a);
                    stack.push(c);
                    stack.push(b);
                    stack.push(a);
                }
            }
            Dup2X2 => {
                let a = self.pop(pc, stack)?;
                if self.slot_ty(a).is_twoword() {
                    let b = self.pop(pc, stack)?;
                    if self.slot_ty(b).is_twoword() {
                        stack.push(a);
                        stack.push(b);
                        stack.push(a);
                    } else {
                        let c = self.pop(pc, stack)?;
                        stack.push(a);
                        stack.push(c);
                        stack.push(b);
                        stack.push(a);
                    }
                } else {
                    let b = self.pop(pc, stack)?;
                    let c = self.pop(pc, stack)?;
                    if self.slot_ty(c).is_twoword() {
                        stack.push(b);
                        stack.push(a);
                        stack.push(c);
                        stack.push(b);
                        stack.push(a);
                    } else {
                        let d = self.pop(pc, stack)?;
                        stack.push(b);
                        stack.push(a);
                        stack.push(d);
                        stack.push(c);
                        stack.push(b);
                        stack.push(a);
                    }
                }
            }
            Swap => {
                let a = self.pop(pc, stack)?;
                let b = self.pop(pc, stack)?;
                stack.push(a);
                stack.push(b);
            }

            Iadd | Ladd | Fadd | Dadd | Isub | Lsub | Fsub | Dsub | Imul | Lmul | Fmul
            | Dmul | Idiv | Ldiv | Fdiv | Ddiv | Irem | Lrem | Frem | Drem | Iand | Land
            | Ior | Lor | Ixor | Lxor => {
                let (ty, arith) = arith_of(op.opcode);
                let rhs = self.pop_ty(pc, stack, ty)?;
                let lhs = self.pop_ty(pc, stack, ty)?;
                if ty.is_float() && arith == ArithOp::Rem {
                    // frem/drem lower to a builtin call.
                    self.mark_saved(stack);
                }
                let dst = self.new_temp(ty, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Arith {
                        op: arith,
                        ty,
                        lhs,
                        rhs,
                        dst,
                    },
                });
                stack.push(dst);
            }
            Ishl | Lshl | Ishr | Lshr | Iushr | Lushr => {
                let (ty, arith) = arith_of(op.opcode);
                let rhs = self.pop_ty(pc, stack, ValueType::Int)?;
                let lhs = self.pop_ty(pc, stack, ty)?;
                let dst = self.new_temp(ty, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Arith {
                        op: arith,
                        ty,
                        lhs,
                        rhs,
                        dst,
                    },
                });
                stack.push(dst);
            }
            Ineg | Lneg | Fneg | Dneg => {
                let ty = match op.opcode {
                    Ineg => ValueType::Int,
                    Lneg => ValueType::Long,
                    Fneg => ValueType::Float,
                    _ => ValueType::Double,
                };
                let src = self.pop_ty(pc, stack, ty)?;
                let dst = self.new_temp(ty, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Neg { ty, src, dst },
                });
                stack.push(dst);
            }
            Iinc => {
                let Imm::LocalIinc { index, delta } = op.imm else {
                    return Err(self.err(pc, "iinc without operands"));
                };
                let slot = self.local(index, ValueType::Int);
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Iinc { slot, delta },
                });
            }

            I2l | I2f | I2d | L2i | L2f | L2d | F2i | F2l | F2d | D2i | D2l | D2f | I2b
            | I2c | I2s => {
                let conv = conv_of(op.opcode);
                let src = self.pop_ty(pc, stack, conv.src_ty())?;
                let dst = self.new_temp(conv.dst_ty(), stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Conv {
                        op: conv,
                        src,
                        dst,
                    },
                });
                stack.push(dst);
            }

            Lcmp | Fcmpl | Fcmpg | Dcmpl | Dcmpg => {
                let (cmp, ty) = match op.opcode {
                    Lcmp => (CmpOp::Lcmp, ValueType::Long),
                    Fcmpl => (CmpOp::Fcmpl, ValueType::Float),
                    Fcmpg => (CmpOp::Fcmpg, ValueType::Float),
                    Dcmpl => (CmpOp::Dcmpl, ValueType::Double),
                    _ => (CmpOp::Dcmpg, ValueType::Double),
                };
                let rhs = self.pop_ty(pc, stack, ty)?;
                let lhs = self.pop_ty(pc, stack, ty)?;
                let dst = self.new_temp(ValueType::Int, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Cmp {
                        op: cmp,
                        lhs,
                        rhs,
                        dst,
                    },
                });
                stack.push(dst);
            }

            Getstatic | Putstatic | Getfield | Putfield => {
                let Imm::Cp(idx) = op.imm else {
                    return Err(self.err(pc, "field op without pool index"));
                };
                let Constant::Field(field) = self.pool_constant(pc, idx)? else {
                    return Err(self.err(pc, format!("pool index {} is not a field", idx)));
                };
                let vty = field.ty.value_type();
                match op.opcode {
                    Getstatic => {
                        let dst = self.new_temp(vty, stack.len());
                        instrs.push(Instr {
                            pc,
                            kind: InstrKind::GetStatic { field, dst },
                        });
                        stack.push(dst);
                    }
                    Putstatic => {
                        let value = self.pop_ty(pc, stack, vty)?;
                        instrs.push(Instr {
                            pc,
                            kind: InstrKind::PutStatic { field, value },
                        });
                    }
                    Getfield => {
                        let obj = self.pop_ty(pc, stack, ValueType::Address)?;
                        let dst = self.new_temp(vty, stack.len());
                        instrs.push(Instr {
                            pc,
                            kind: InstrKind::GetField { obj, field, dst },
                        });
                        stack.push(dst);
                    }
                    _ => {
                        let value = self.pop_ty(pc, stack, vty)?;
                        let obj = self.pop_ty(pc, stack, ValueType::Address)?;
                        instrs.push(Instr {
                            pc,
                            kind: InstrKind::PutField { obj, field, value },
                        });
                    }
                }
            }

            Invokevirtual | Invokespecial | Invokestatic | Invokeinterface => {
                let (idx, kind) = match (op.opcode, &op.imm) {
                    (Invokevirtual, Imm::Cp(i)) => (*i, InvokeKind::Virtual),
                    (Invokespecial, Imm::Cp(i)) => (*i, InvokeKind::Special),
                    (Invokestatic, Imm::Cp(i)) => (*i, InvokeKind::Static),
                    (Invokeinterface, Imm::Interface { cp }) => (*cp, InvokeKind::Interface),
                    _ => return Err(self.err(pc, "invoke without pool index")),
                };
                let mref = match self.pool_constant(pc, idx)? {
                    Constant::Method(m) | Constant::InterfaceMethod(m) => m,
                    other => {
                        return Err(self.err(pc, format!("pool index {} is {:?}", idx, other)))
                    }
                };
                let mut args = Vec::new();
                for p in mref.descriptor.params.iter().rev() {
                    args.push(self.pop_ty(pc, stack, p.value_type())?);
                }
                if kind != InvokeKind::Static {
                    args.push(self.pop_ty(pc, stack, ValueType::Address)?);
                }
                args.reverse();
                self.mark_saved(stack);
                let dst = mref
                    .descriptor
                    .return_value_type()
                    .map(|t| self.new_temp(t, stack.len()));
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Invoke {
                        kind,
                        mref,
                        args,
                        dst,
                    },
                });
                if let Some(d) = dst {
                    stack.push(d);
                }
            }

            New => {
                let Imm::Cp(idx) = op.imm else {
                    return Err(self.err(pc, "new without pool index"));
                };
                let Constant::Class(class) = self.pool_constant(pc, idx)? else {
                    return Err(self.err(pc, format!("pool index {} is not a class", idx)));
                };
                self.mark_saved(stack);
                let dst = self.new_temp(ValueType::Address, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::New { class, dst },
                });
                stack.push(dst);
            }
            Newarray => {
                let Imm::AType(atype) = op.imm else {
                    return Err(self.err(pc, "newarray without atype"));
                };
                let elem = ArrayElem::from_atype(atype)
                    .ok_or_else(|| self.err(pc, format!("bad newarray atype {}", atype)))?;
                let len = self.pop_ty(pc, stack, ValueType::Int)?;
                self.mark_saved(stack);
                let dst = self.new_temp(ValueType::Address, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::NewArray {
                        elem,
                        class: None,
                        len,
                        dst,
                    },
                });
                stack.push(dst);
            }
            Anewarray => {
                let Imm::Cp(idx) = op.imm else {
                    return Err(self.err(pc, "anewarray without pool index"));
                };
                let Constant::Class(class) = self.pool_constant(pc, idx)? else {
                    return Err(self.err(pc, format!("pool index {} is not a class", idx)));
                };
                let len = self.pop_ty(pc, stack, ValueType::Int)?;
                self.mark_saved(stack);
                let dst = self.new_temp(ValueType::Address, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::NewArray {
                        elem: ArrayElem::Ref,
                        class: Some(class),
                        len,
                        dst,
                    },
                });
                stack.push(dst);
            }
            Multianewarray => {
                let Imm::Multi { cp, dims } = op.imm else {
                    return Err(self.err(pc, "multianewarray without operands"));
                };
                let Constant::Class(class) = self.pool_constant(pc, cp)? else {
                    return Err(self.err(pc, format!("pool index {} is not a class", cp)));
                };
                let mut dim_slots = Vec::with_capacity(dims as usize);
                for _ in 0..dims {
                    dim_slots.push(self.pop_ty(pc, stack, ValueType::Int)?);
                }
                dim_slots.reverse();
                self.mark_saved(stack);
                let dst = self.new_temp(ValueType::Address, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::MultiNewArray {
                        class,
                        dims: dim_slots,
                        dst,
                    },
                });
                stack.push(dst);
            }
            Arraylength => {
                let arr = self.pop_ty(pc, stack, ValueType::Address)?;
                let dst = self.new_temp(ValueType::Int, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::ArrayLength { arr, dst },
                });
                stack.push(dst);
            }

            Checkcast => {
                let Imm::Cp(idx) = op.imm else {
                    return Err(self.err(pc, "checkcast without pool index"));
                };
                let Constant::Class(class) = self.pool_constant(pc, idx)? else {
                    return Err(self.err(pc, format!("pool index {} is not a class", idx)));
                };
                let obj = *stack
                    .last()
                    .ok_or_else(|| self.err(pc, "checkcast on empty stack"))?;
                // Interface and unresolved targets check through the
                // runtime; the whole stack stays live across that call.
                self.mark_saved(stack);
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::Checkcast { obj, class },
                });
            }
            Instanceof => {
                let Imm::Cp(idx) = op.imm else {
                    return Err(self.err(pc, "instanceof without pool index"));
                };
                let Constant::Class(class) = self.pool_constant(pc, idx)? else {
                    return Err(self.err(pc, format!("pool index {} is not a class", idx)));
                };
                let obj = self.pop_ty(pc, stack, ValueType::Address)?;
                self.mark_saved(stack);
                let dst = self.new_temp(ValueType::Int, stack.len());
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::InstanceOf { obj, class, dst },
                });
                stack.push(dst);
            }

            Monitorenter => {
                let obj = self.pop_ty(pc, stack, ValueType::Address)?;
                self.mark_saved(stack);
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::MonitorEnter { obj },
                });
            }
            Monitorexit => {
                let obj = self.pop_ty(pc, stack, ValueType::Address)?;
                self.mark_saved(stack);
                instrs.push(Instr {
                    pc,
                    kind: InstrKind::MonitorExit { obj },
                });
            }

            other => {
                return Err(self.err(pc, format!("unhandled opcode {:?}", other)));
            }
        }
        Ok(())
    }
}

fn cond_of(op: super::opcode::Opcode) -> Cond {
    use super::opcode::Opcode::*;
    match op {
        Ifeq | IfIcmpeq => Cond::Eq,
        Ifne | IfIcmpne => Cond::Ne,
        Iflt | IfIcmplt => Cond::Lt,
        Ifge | IfIcmpge => Cond::Ge,
        Ifgt | IfIcmpgt => Cond::Gt,
        _ => Cond::Le,
    }
}

fn arith_of(op: super::opcode::Opcode) -> (ValueType, ArithOp) {
    use super::opcode::Opcode::*;
    let ty = match op {
        Iadd | Isub | Imul | Idiv | Irem | Iand | Ior | Ixor | Ishl | Ishr | Iushr => {
            ValueType::Int
        }
        Ladd | Lsub | Lmul | Ldiv | Lrem | Land | Lor | Lxor | Lshl | Lshr | Lushr => {
            ValueType::Long
        }
        Fadd | Fsub | Fmul | Fdiv | Frem => ValueType::Float,
        _ => ValueType::Double,
    };
    let a = match op {
        Iadd | Ladd | Fadd | Dadd => ArithOp::Add,
        Isub | Lsub | Fsub | Dsub => ArithOp::Sub,
        Imul | Lmul | Fmul | Dmul => ArithOp::Mul,
        Idiv | Ldiv | Fdiv | Ddiv => ArithOp::Div,
        Irem | Lrem | Frem | Drem => ArithOp::Rem,
        Iand | Land => ArithOp::And,
        Ior | Lor => ArithOp::Or,
        Ixor | Lxor => ArithOp::Xor,
        Ishl | Lshl => ArithOp::Shl,
        Ishr | Lshr => ArithOp::Shr,
        _ => ArithOp::Ushr,
    };
    (ty, a)
}

fn conv_of(op: super::opcode::Opcode) -> ConvOp {
    use super::opcode::Opcode::*;
    match op {
        I2l => ConvOp::I2l,
        I2f => ConvOp::I2f,
        I2d => ConvOp::I2d,
        L2i => ConvOp::L2i,
        L2f => ConvOp::L2f,
        L2d => ConvOp::L2d,
        F2i => ConvOp::F2i,
        F2l => ConvOp::F2l,
        F2d => ConvOp::F2d,
        D2i => ConvOp::D2i,
        D2l => ConvOp::D2l,
        D2f => ConvOp::D2f,
        I2b => ConvOp::I2b,
        I2c => ConvOp::I2c,
        _ => ConvOp::I2s,
    }
}

fn array_elem_of(op: super::opcode::Opcode) -> ArrayElem {
    use super::opcode::Opcode::*;
    match op {
        Iaload | Iastore => ArrayElem::Int,
        Laload | Lastore => ArrayElem::Long,
        Faload | Fastore => ArrayElem::Float,
        Daload | Dastore => ArrayElem::Double,
        Aaload | Aastore => ArrayElem::Ref,
        Baload | Bastore => ArrayElem::Byte,
        Caload | Castore => ArrayElem::Char,
        _ => ArrayElem::Short,
    }
}

/// Local index and type of a load/store opcode.
fn load_store_target(op: &ByteOp) -> Result<(u16, ValueType), JitError> {
    use super::opcode::Opcode::*;
    let explicit = |imm: &Imm| -> Result<u16, JitError> {
        match imm {
            Imm::Local(i) => Ok(*i),
            _ => Err(JitError::Parse {
                pc: 0,
                reason: "load/store without local operand".into(),
            }),
        }
    };
    let (index, ty) = match op.opcode {
        Iload | Istore => (explicit(&op.imm)?, ValueType::Int),
        Lload | Lstore => (explicit(&op.imm)?, ValueType::Long),
        Fload | Fstore => (explicit(&op.imm)?, ValueType::Float),
        Dload | Dstore => (explicit(&op.imm)?, ValueType::Double),
        Aload | Astore => (explicit(&op.imm)?, ValueType::Address),
        Iload0 | Iload1 | Iload2 | Iload3 => {
            ((op.opcode as u8 - Iload0 as u8) as u16, ValueType::Int)
        }
        Lload0 | Lload1 | Lload2 | Lload3 => {
            ((op.opcode as u8 - Lload0 as u8) as u16, ValueType::Long)
        }
        Fload0 | Fload1 | Fload2 | Fload3 => {
            ((op.opcode as u8 - Fload0 as u8) as u16, ValueType::Float)
        }
        Dload0 | Dload1 | Dload2 | Dload3 => {
            ((op.opcode as u8 - Dload0 as u8) as u16, ValueType::Double)
        }
        Aload0 | Aload1 | Aload2 | Aload3 => {
            ((op.opcode as u8 - Aload0 as u8) as u16, ValueType::Address)
        }
        Istore0 | Istore1 | Istore2 | Istore3 => {
            ((op.opcode as u8 - Istore0 as u8) as u16, ValueType::Int)
        }
        Lstore0 | Lstore1 | Lstore2 | Lstore3 => {
            ((op.opcode as u8 - Lstore0 as u8) as u16, ValueType::Long)
        }
        Fstore0 | Fstore1 | Fstore2 | Fstore3 => {
            ((op.opcode as u8 - Fstore0 as u8) as u16, ValueType::Float)
        }
        Dstore0 | Dstore1 | Dstore2 | Dstore3 => {
            ((op.opcode as u8 - Dstore0 as u8) as u16, ValueType::Double)
        }
        Astore0 | Astore1 | Astore2 | Astore3 => {
            ((op.opcode as u8 - Astore0 as u8) as u16, ValueType::Address)
        }
        other => {
            return Err(JitError::Parse {
                pc: op.pc,
                reason: format!("{:?} is not a load/store", other),
            })
        }
    };
    Ok((index, ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::constant_pool::ConstantPool;
    use crate::classfile::descriptor::MethodDescriptor;
    use crate::classfile::flags::MethodFlags;
    use crate::classfile::method::ExceptionTableEntry;
    use crate::jit::parser;
    use std::sync::Arc;

    fn analyze_code(desc: &str, code: Vec<u8>) -> IrMethod {
        try_analyze(desc, code, vec![], ConstantPool::new()).unwrap()
    }

    fn try_analyze(
        desc: &str,
        code: Vec<u8>,
        ex: Vec<ExceptionTableEntry>,
        pool: ConstantPool,
    ) -> Result<IrMethod, JitError> {
        let m = Method::new(
            "t",
            desc,
            MethodDescriptor::parse(desc).unwrap(),
            MethodFlags::STATIC,
            8,
            8,
            code.into_boxed_slice(),
            ex,
            vec![],
            Arc::new(pool),
        );
        let parsed = parser::parse(&m)?;
        analyze(&m, parsed)
    }

    #[test]
    fn test_add_method() {
        // iload_0, iload_1, iadd, ireturn
        let ir = analyze_code("(II)I", vec![0x1a, 0x1b, 0x60, 0xac]);
        assert_eq!(ir.params.len(), 2);
        assert!(ir.is_leaf);
        let block = &ir.blocks[0];
        // 2 moves + arith + return
        assert_eq!(block.instrs.len(), 4);
        assert!(matches!(
            block.instrs[2].kind,
            InstrKind::Arith {
                op: ArithOp::Add,
                ty: ValueType::Int,
                ..
            }
        ));
        assert!(matches!(
            block.instrs[3].kind,
            InstrKind::Return { value: Some(_) }
        ));
    }

    #[test]
    fn test_param_slots_are_locals() {
        let ir = analyze_code("(IJ)V", vec![0xb1]);
        // int at local 0, long at local 1 (two class-file slots).
        assert_eq!(ir.params.len(), 2);
        assert_eq!(ir.locals[&(0, ValueType::Int)], ir.params[0]);
        assert_eq!(ir.locals[&(1, ValueType::Long)], ir.params[1]);
        let p1 = ir.slot(ir.params[1]);
        assert_eq!(p1.kind, SlotKind::Arg);
        assert_eq!(p1.varnum, 1);
    }

    #[test]
    fn test_branch_interface_slots() {
        // iconst_1, iload_0, ifeq +4 -> else, ireturn(top); else: iconst_2...
        // Simpler: iload_0, ifeq L, iconst_1, goto M, L: iconst_2, M: ireturn
        let code = vec![
            0x1a, // 0: iload_0
            0x99, 0x00, 0x07, // 1: ifeq -> 8
            0x04, // 4: iconst_1
            0xa7, 0x00, 0x04, // 5: goto -> 9
            0x05, // 8: iconst_2
            0xac, // 9: ireturn
        ];
        let ir = analyze_code("(I)I", code);
        // The merge block must start with one int on the stack through an
        // interface slot.
        let merge = ir
            .blocks
            .iter()
            .find(|b| b.start_pc == 9)
            .expect("merge block");
        assert_eq!(merge.in_stack.len(), 1);
        let s = ir.slot(merge.in_stack[0]);
        assert_eq!(s.kind, SlotKind::Stack);
        assert_eq!(s.ty, ValueType::Int);
        // Both predecessors reconcile into the same interface slot.
        assert_eq!(ir.interface_slots.len(), 1);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        // One path leaves an int, the other a float, meeting at pc 9.
        let code = vec![
            0x1a, // 0: iload_0
            0x99, 0x00, 0x07, // 1: ifeq -> 8
            0x04, // 4: iconst_1
            0xa7, 0x00, 0x04, // 5: goto -> 9
            0x0b, // 8: fconst_0
            0xac, // 9: ireturn
        ];
        let err = try_analyze("(I)I", code, vec![], ConstantPool::new()).unwrap_err();
        assert!(matches!(err, JitError::Analysis { .. }));
    }

    #[test]
    fn test_dup2_x2_word_semantics() {
        // long + two ints: lconst_0, iconst_1, iconst_2, dup2_x2 then clean up
        // form 2 of dup2_x2: [.., l, b, a] -> [.., b, a, l?]... exercise via
        // ints only: iconst_1..4, dup2_x2, pops to keep the verifier-true
        // depth: just check resulting abstract effects through instrs count.
        let code = vec![
            0x04, 0x05, 0x06, 0x07, // iconst_1..iconst_4 -> [1,2,3,4]
            0x5e, // dup2_x2 -> [3,4,1,2,3,4]
            0x57, 0x57, 0x57, 0x57, 0x57, // pop x5
            0xac, // ireturn (returns the remaining int)
        ];
        let ir = analyze_code("()I", code);
        assert_eq!(ir.max_stack_depth, 6);
    }

    #[test]
    fn test_call_marks_saved(){
        // A value alive across an invokestatic must be flagged saved.
        let mut pool = ConstantPool::new();
        let mref = crate::classfile::constant_pool::MethodRef::new("X", "f", "()I").unwrap();
        let cp = pool.push(Constant::Method(Arc::new(mref)));
        // iconst_5, invokestatic f()I, iadd, ireturn
        let code = vec![0x08, 0xb8, 0x00, cp as u8, 0x60, 0xac];
        let ir = try_analyze("()I", code, vec![], pool).unwrap();
        assert!(!ir.is_leaf);
        // The iconst_5 temp is on the stack during the call.
        let saved_temp = ir
            .slots
            .iter()
            .any(|s| s.kind == SlotKind::Temp && s.saved && s.ty == ValueType::Int);
        assert!(saved_temp);
    }

    #[test]
    fn test_handler_entry_stack() {
        // try { iconst_1; pop } handler: astore_0, return
        let code = vec![0x04, 0x57, 0xb1, 0x4b, 0xb1];
        let ex = vec![ExceptionTableEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 3,
            catch_type: 0,
        }];
        let ir = try_analyze("()V", code, ex, ConstantPool::new()).unwrap();
        let handler = ir
            .blocks
            .iter()
            .find(|b| b.is_handler_entry)
            .expect("handler block");
        assert_eq!(handler.in_stack.len(), 1);
        assert_eq!(ir.slot(handler.in_stack[0]).ty, ValueType::Address);
    }

    #[test]
    fn test_jsr_ret_types() {
        // 0: jsr -> 4, 3: return, 4: astore_1, 5: ret 1
        let code = vec![0xa8, 0x00, 0x04, 0xb1, 0x4c, 0xa9, 0x01];
        let ir = analyze_code("()V", code);
        // Local 1 carries the RET pseudo-type.
        assert!(ir.locals.contains_key(&(1, ValueType::Ret)));
        let sub = ir.blocks.iter().find(|b| b.start_pc == 4).unwrap();
        assert!(matches!(
            sub.instrs.last().unwrap().kind,
            InstrKind::RetLocal { .. }
        ));
    }

    #[test]
    fn test_iinc_in_place() {
        // iinc 0, 7 ; iload_0 ; ireturn
        let ir = analyze_code("(I)I", vec![0x84, 0x00, 0x07, 0x1a, 0xac]);
        assert!(matches!(
            ir.blocks[0].instrs[0].kind,
            InstrKind::Iinc { delta: 7, .. }
        ));
    }

    #[test]
    fn test_local_retyping_across_blocks() {
        // Local 0 holds an int param, then a float is stored into it:
        // distinct variables per (index, type).
        let code = vec![
            0x0b, // fconst_0
            0x38, 0x00, // fstore 0
            0xb1, // return
        ];
        let ir = analyze_code("(I)V", code);
        assert!(ir.locals.contains_key(&(0, ValueType::Int)));
        assert!(ir.locals.contains_key(&(0, ValueType::Float)));
        assert_ne!(
            ir.locals[&(0, ValueType::Int)],
            ir.locals[&(0, ValueType::Float)]
        );
    }
}
