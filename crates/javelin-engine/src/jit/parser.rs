//! Bytecode decoding and basic-block splitting
//!
//! First pass decodes each opcode with its operands into a [`ByteOp`] and
//! collects block leaders: branch targets, the PC after every transfer, and
//! every exception-handler entry. Second pass materializes the block array in
//! source order, wires normal successors, and overlays the exception edges
//! from the method's table.

use rustc_hash::{FxHashMap, FxHashSet};

use super::ir::{Block, BlockId, ExEntry};
use super::opcode::Opcode;
use crate::classfile::constant_pool::Constant;
use crate::classfile::method::Method;
use crate::error::JitError;

/// Decoded operands of one bytecode.
#[derive(Debug, Clone)]
pub enum Imm {
    None,
    Byte(i8),
    Short(i16),
    Local(u16),
    LocalIinc { index: u16, delta: i32 },
    Cp(u16),
    /// Absolute branch target PC.
    Branch(u32),
    Table {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    Lookup {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
    AType(u8),
    Interface { cp: u16 },
    Multi { cp: u16, dims: u8 },
}

/// One decoded bytecode instruction.
#[derive(Debug, Clone)]
pub struct ByteOp {
    pub pc: u32,
    pub opcode: Opcode,
    pub imm: Imm,
}

/// Parser output: decoded ops plus the block skeleton.
#[derive(Debug)]
pub struct ParsedMethod {
    pub ops: Vec<ByteOp>,
    /// PC of an op to its index in `ops`.
    pub pc_to_op: FxHashMap<u32, usize>,
    pub blocks: Vec<Block>,
    pub pc_to_block: FxHashMap<u32, BlockId>,
    pub exception_entries: Vec<ExEntry>,
}

impl ParsedMethod {
    pub fn block_at(&self, pc: u32) -> Option<BlockId> {
        self.pc_to_block.get(&pc).copied()
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, JitError> {
        let b = *self.code.get(self.pos).ok_or_else(|| JitError::Parse {
            pc: self.pos as u32,
            reason: "truncated bytecode".into(),
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, JitError> {
        Ok(((self.u8()? as u16) << 8) | self.u8()? as u16)
    }

    fn i16(&mut self) -> Result<i16, JitError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, JitError> {
        Ok(((self.u16()? as i32) << 16) | self.u16()? as i32 & 0xffff)
    }
}

/// Decode the verified bytecode of `method` into ops.
pub fn decode(method: &Method) -> Result<Vec<ByteOp>, JitError> {
    let code = &method.bytecode;
    let mut r = Reader { code, pos: 0 };
    let mut ops = Vec::new();

    while r.pos < code.len() {
        let pc = r.pos as u32;
        let byte = r.u8()?;
        let opcode = Opcode::try_from(byte).map_err(|_| JitError::Parse {
            pc,
            reason: format!("unknown opcode 0x{:02x}", byte),
        })?;

        let op = match opcode {
            Opcode::Wide => decode_wide(&mut r, pc)?,
            _ => ByteOp {
                pc,
                opcode,
                imm: decode_imm(&mut r, opcode, pc)?,
            },
        };
        ops.push(op);
    }
    Ok(ops)
}

fn decode_wide(r: &mut Reader<'_>, pc: u32) -> Result<ByteOp, JitError> {
    let byte = r.u8()?;
    let opcode = Opcode::try_from(byte).map_err(|_| JitError::Parse {
        pc,
        reason: format!("unknown wide opcode 0x{:02x}", byte),
    })?;
    let imm = match opcode {
        Opcode::Iload
        | Opcode::Lload
        | Opcode::Fload
        | Opcode::Dload
        | Opcode::Aload
        | Opcode::Istore
        | Opcode::Lstore
        | Opcode::Fstore
        | Opcode::Dstore
        | Opcode::Astore
        | Opcode::Ret => Imm::Local(r.u16()?),
        Opcode::Iinc => Imm::LocalIinc {
            index: r.u16()?,
            delta: r.i16()? as i32,
        },
        other => {
            return Err(JitError::Parse {
                pc,
                reason: format!("wide prefix on {:?}", other),
            })
        }
    };
    Ok(ByteOp { pc, opcode, imm })
}

fn decode_imm(r: &mut Reader<'_>, opcode: Opcode, pc: u32) -> Result<Imm, JitError> {
    use Opcode::*;
    let imm = match opcode {
        Bipush => Imm::Byte(r.u8()? as i8),
        Sipush => Imm::Short(r.i16()?),
        Ldc => Imm::Cp(r.u8()? as u16),
        LdcW | Ldc2W => Imm::Cp(r.u16()?),
        Iload | Lload | Fload | Dload | Aload | Istore | Lstore | Fstore | Dstore | Astore
        | Ret => Imm::Local(r.u8()? as u16),
        Iinc => Imm::LocalIinc {
            index: r.u8()? as u16,
            delta: (r.u8()? as i8) as i32,
        },
        Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle | IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge
        | IfIcmpgt | IfIcmple | IfAcmpeq | IfAcmpne | Goto | Jsr | Ifnull | Ifnonnull => {
            let off = r.i16()? as i32;
            Imm::Branch(rel_target(pc, off)?)
        }
        GotoW | JsrW => {
            let off = r.i32()?;
            Imm::Branch(rel_target(pc, off)?)
        }
        Tableswitch => {
            while r.pos % 4 != 0 {
                r.u8()?;
            }
            let default = rel_target(pc, r.i32()?)?;
            let low = r.i32()?;
            let high = r.i32()?;
            if high < low {
                return Err(JitError::Parse {
                    pc,
                    reason: format!("tableswitch bounds {}..{}", low, high),
                });
            }
            let count = (high - low + 1) as usize;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(rel_target(pc, r.i32()?)?);
            }
            Imm::Table {
                default,
                low,
                targets,
            }
        }
        Lookupswitch => {
            while r.pos % 4 != 0 {
                r.u8()?;
            }
            let default = rel_target(pc, r.i32()?)?;
            let npairs = r.i32()?;
            if npairs < 0 {
                return Err(JitError::Parse {
                    pc,
                    reason: format!("lookupswitch npairs {}", npairs),
                });
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for _ in 0..npairs {
                let key = r.i32()?;
                pairs.push((key, rel_target(pc, r.i32()?)?));
            }
            Imm::Lookup { default, pairs }
        }
        Getstatic | Putstatic | Getfield | Putfield | Invokevirtual | Invokespecial
        | Invokestatic | New | Anewarray | Checkcast | Instanceof => Imm::Cp(r.u16()?),
        Invokeinterface => {
            let cp = r.u16()?;
            let _count = r.u8()?;
            let _zero = r.u8()?;
            Imm::Interface { cp }
        }
        Invokedynamic => {
            return Err(JitError::Parse {
                pc,
                reason: "invokedynamic is not supported by this engine".into(),
            })
        }
        Newarray => Imm::AType(r.u8()?),
        Multianewarray => {
            let cp = r.u16()?;
            let dims = r.u8()?;
            Imm::Multi { cp, dims }
        }
        _ => Imm::None,
    };
    Ok(imm)
}

fn rel_target(pc: u32, offset: i32) -> Result<u32, JitError> {
    let target = pc as i64 + offset as i64;
    if target < 0 {
        return Err(JitError::Parse {
            pc,
            reason: format!("branch target {} before method start", target),
        });
    }
    Ok(target as u32)
}

/// Split decoded ops into basic blocks and wire the edges.
pub fn split_blocks(method: &Method, ops: Vec<ByteOp>) -> Result<ParsedMethod, JitError> {
    let code_len = method.bytecode.len() as u32;
    let mut pc_to_op = FxHashMap::default();
    for (i, op) in ops.iter().enumerate() {
        pc_to_op.insert(op.pc, i);
    }

    // Pass 1: leaders.
    let mut leaders: FxHashSet<u32> = FxHashSet::default();
    leaders.insert(0);
    for (i, op) in ops.iter().enumerate() {
        match &op.imm {
            Imm::Branch(t) => {
                check_target(*t, &pc_to_op, op.pc)?;
                leaders.insert(*t);
            }
            Imm::Table {
                default, targets, ..
            } => {
                check_target(*default, &pc_to_op, op.pc)?;
                leaders.insert(*default);
                for t in targets {
                    check_target(*t, &pc_to_op, op.pc)?;
                    leaders.insert(*t);
                }
            }
            Imm::Lookup { default, pairs } => {
                check_target(*default, &pc_to_op, op.pc)?;
                leaders.insert(*default);
                for (_, t) in pairs {
                    check_target(*t, &pc_to_op, op.pc)?;
                    leaders.insert(*t);
                }
            }
            _ => {}
        }
        if op.opcode.ends_block() {
            if let Some(next) = ops.get(i + 1) {
                leaders.insert(next.pc);
            }
        }
    }
    // Handler entries begin blocks, and so do the covered range boundaries
    // so the emitter can map them straight to machine-code offsets.
    for entry in &method.exception_table {
        let h = entry.handler_pc as u32;
        check_target(h, &pc_to_op, h)?;
        leaders.insert(h);
        let start = entry.start_pc as u32;
        check_target(start, &pc_to_op, start)?;
        leaders.insert(start);
        let end = entry.end_pc as u32;
        if end < code_len {
            check_target(end, &pc_to_op, end)?;
            leaders.insert(end);
        }
    }

    // Pass 2: blocks in source order.
    let mut starts: Vec<u32> = leaders.into_iter().collect();
    starts.sort_unstable();
    let mut pc_to_block = FxHashMap::default();
    for (i, &start) in starts.iter().enumerate() {
        pc_to_block.insert(start, BlockId(i as u32));
    }
    let mut blocks: Vec<Block> = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(code_len);
            let mut b = Block::new(BlockId(i as u32), start, end);
            b.line = method.line_for_pc(start as u16);
            b
        })
        .collect();

    // Successor edges from each block's last op.
    for block in blocks.iter_mut() {
        let Some(&last_idx) = last_op_in(&pc_to_op, block.start_pc, block.end_pc) else {
            continue;
        };
        let last = &ops[last_idx];
        let fallthrough = pc_to_block.get(&block.end_pc).copied();
        match (&last.opcode, &last.imm) {
            (op, Imm::Branch(t)) if op.is_conditional_branch() => {
                block.successors.push(pc_to_block[t]);
                if let Some(ft) = fallthrough {
                    block.successors.push(ft);
                }
            }
            (Opcode::Goto | Opcode::GotoW, Imm::Branch(t)) => {
                block.successors.push(pc_to_block[t]);
            }
            // jsr transfers to the subroutine; the instruction after it is
            // reached again through `ret`, modeled as a second edge.
            (Opcode::Jsr | Opcode::JsrW, Imm::Branch(t)) => {
                block.successors.push(pc_to_block[t]);
                if let Some(ft) = fallthrough {
                    block.successors.push(ft);
                }
            }
            (
                Opcode::Tableswitch,
                Imm::Table {
                    default, targets, ..
                },
            ) => {
                for t in targets {
                    push_unique(&mut block.successors, pc_to_block[t]);
                }
                push_unique(&mut block.successors, pc_to_block[default]);
            }
            (Opcode::Lookupswitch, Imm::Lookup { default, pairs }) => {
                for (_, t) in pairs {
                    push_unique(&mut block.successors, pc_to_block[t]);
                }
                push_unique(&mut block.successors, pc_to_block[default]);
            }
            (op, _) if op.is_unconditional_transfer() => {}
            _ => {
                if let Some(ft) = fallthrough {
                    block.successors.push(ft);
                }
            }
        }
    }

    // Exception edges: every block whose range intersects [start, end)
    // gains an edge to the handler.
    let mut exception_entries = Vec::with_capacity(method.exception_table.len());
    for entry in &method.exception_table {
        let handler = pc_to_block[&(entry.handler_pc as u32)];
        let catch_class = if entry.catch_type == 0 {
            None
        } else {
            match method.pool.get(entry.catch_type) {
                Some(Constant::Class(c)) => Some(c.clone()),
                _ => {
                    return Err(JitError::Parse {
                        pc: entry.handler_pc as u32,
                        reason: format!("catch type index {} is not a class", entry.catch_type),
                    })
                }
            }
        };
        exception_entries.push(ExEntry {
            start_pc: entry.start_pc as u32,
            end_pc: entry.end_pc as u32,
            handler,
            catch_class,
        });
        for block in blocks.iter_mut() {
            if block.start_pc < entry.end_pc as u32 && block.end_pc > entry.start_pc as u32 {
                push_unique(&mut block.handlers, handler);
            }
        }
        blocks[handler.0 as usize].is_handler_entry = true;
    }

    // Predecessors and reachability: handlers of a reachable block are
    // themselves reachable.
    let succs: Vec<Vec<BlockId>> = blocks.iter().map(|b| b.successors.clone()).collect();
    for (i, succ) in succs.iter().enumerate() {
        for s in succ {
            push_unique(&mut blocks[s.0 as usize].predecessors, BlockId(i as u32));
        }
    }
    let mut work = vec![BlockId(0)];
    while let Some(id) = work.pop() {
        let block = &mut blocks[id.0 as usize];
        if block.reachable {
            continue;
        }
        block.reachable = true;
        let mut next = block.successors.clone();
        next.extend(block.handlers.iter().copied());
        work.extend(next);
    }

    Ok(ParsedMethod {
        ops,
        pc_to_op,
        blocks,
        pc_to_block,
        exception_entries,
    })
}

fn check_target(
    target: u32,
    pc_to_op: &FxHashMap<u32, usize>,
    pc: u32,
) -> Result<(), JitError> {
    if pc_to_op.contains_key(&target) {
        Ok(())
    } else {
        Err(JitError::Parse {
            pc,
            reason: format!("branch target {} is not an instruction boundary", target),
        })
    }
}

fn last_op_in<'a>(
    pc_to_op: &'a FxHashMap<u32, usize>,
    start: u32,
    end: u32,
) -> Option<&'a usize> {
    // Blocks are short; scan back from the end PC for the op start.
    let mut pc = end;
    while pc > start {
        pc -= 1;
        if let Some(idx) = pc_to_op.get(&pc) {
            return Some(idx);
        }
    }
    None
}

fn push_unique(list: &mut Vec<BlockId>, id: BlockId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// Decode and split in one step.
pub fn parse(method: &Method) -> Result<ParsedMethod, JitError> {
    let ops = decode(method)?;
    split_blocks(method, ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::constant_pool::ConstantPool;
    use crate::classfile::descriptor::MethodDescriptor;
    use crate::classfile::flags::MethodFlags;
    use crate::classfile::method::ExceptionTableEntry;
    use std::sync::Arc;

    fn method_with(code: Vec<u8>, ex: Vec<ExceptionTableEntry>, pool: ConstantPool) -> Method {
        Method::new(
            "t",
            "()V",
            MethodDescriptor::parse("()V").unwrap(),
            MethodFlags::STATIC,
            4,
            4,
            code.into_boxed_slice(),
            ex,
            vec![],
            Arc::new(pool),
        )
    }

    #[test]
    fn test_decode_linear() {
        // iconst_1, iconst_2, iadd, ireturn
        let m = method_with(vec![0x04, 0x05, 0x60, 0xac], vec![], ConstantPool::new());
        let ops = decode(&m).unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[2].opcode, Opcode::Iadd);
        assert_eq!(ops[3].pc, 3);
    }

    #[test]
    fn test_decode_wide_iinc() {
        // wide iinc 260, -300 ; return
        let mut code = vec![0xc4, 0x84];
        code.extend_from_slice(&260u16.to_be_bytes());
        code.extend_from_slice(&(-300i16).to_be_bytes());
        code.push(0xb1);
        let m = method_with(code, vec![], ConstantPool::new());
        let ops = decode(&m).unwrap();
        assert!(matches!(
            ops[0].imm,
            Imm::LocalIinc { index: 260, delta: -300 }
        ));
        assert_eq!(ops[1].pc, 6);
    }

    #[test]
    fn test_branch_blocks() {
        // 0: iload_0, 1: ifeq +5 (-> 6), 4: iconst_1, 5: ireturn, 6: iconst_2, 7: ireturn
        let code = vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x05, 0xac];
        let m = method_with(code, vec![], ConstantPool::new());
        let parsed = parse(&m).unwrap();

        // Blocks at 0, 4, 6.
        assert_eq!(parsed.blocks.len(), 3);
        assert_eq!(parsed.block_at(0), Some(BlockId(0)));
        assert_eq!(parsed.block_at(4), Some(BlockId(1)));
        assert_eq!(parsed.block_at(6), Some(BlockId(2)));

        let entry = &parsed.blocks[0];
        assert_eq!(entry.successors, vec![BlockId(2), BlockId(1)]);
        assert!(parsed.blocks.iter().all(|b| b.reachable));
        assert_eq!(parsed.blocks[2].predecessors, vec![BlockId(0)]);
    }

    #[test]
    fn test_backward_goto() {
        // 0: iconst_0, 1: goto -1 (-> 0)
        let code = vec![0x03, 0xa7, 0xff, 0xff];
        let m = method_with(code, vec![], ConstantPool::new());
        let parsed = parse(&m).unwrap();
        assert_eq!(parsed.blocks.len(), 2);
        // goto targets pc 0: both ops end up in separate blocks with a back
        // edge from the goto block.
        let goto_block = parsed.block_at(1).unwrap();
        assert_eq!(parsed.blocks[goto_block.0 as usize].successors, vec![BlockId(0)]);
    }

    #[test]
    fn test_tableswitch_decode() {
        // 0: iload_0
        // 1: tableswitch pad(2) default=+23 low=1 high=2 offsets +19 +21
        let mut code = vec![0x1a, 0xaa, 0, 0];
        code.extend_from_slice(&23i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        code.extend_from_slice(&19i32.to_be_bytes());
        code.extend_from_slice(&21i32.to_be_bytes());
        // 20: iconst_1, 21: ireturn, 22: iconst_2, 23: ireturn, 24: iconst_0, 25: ireturn
        code.extend_from_slice(&[0x04, 0xac, 0x05, 0xac, 0x03, 0xac]);
        let m = method_with(code, vec![], ConstantPool::new());
        let parsed = parse(&m).unwrap();
        let switch_block = parsed.block_at(0).unwrap();
        let succ = &parsed.blocks[switch_block.0 as usize].successors;
        assert_eq!(succ.len(), 3);
        assert!(matches!(parsed.ops[1].imm, Imm::Table { low: 1, .. }));
    }

    #[test]
    fn test_exception_edges() {
        // try { 0: iconst_1, 1: pop } catch(any at 3) { 3: athrow } 2: return
        let code = vec![0x04, 0x57, 0xb1, 0xbf];
        let ex = vec![ExceptionTableEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 3,
            catch_type: 0,
        }];
        let m = method_with(code, ex, ConstantPool::new());
        let parsed = parse(&m).unwrap();

        let covered = parsed.block_at(0).unwrap();
        let handler = parsed.block_at(3).unwrap();
        assert!(parsed.blocks[covered.0 as usize].handlers.contains(&handler));
        assert!(parsed.blocks[handler.0 as usize].is_handler_entry);
        assert!(parsed.blocks[handler.0 as usize].reachable);
        assert_eq!(parsed.exception_entries.len(), 1);
        assert!(parsed.exception_entries[0].catch_class.is_none());
    }

    #[test]
    fn test_dead_code_unreachable() {
        // 0: return, 1: iconst_0 (dead), 2: return (dead)
        let code = vec![0xb1, 0x03, 0xb1];
        let m = method_with(code, vec![], ConstantPool::new());
        let parsed = parse(&m).unwrap();
        assert!(parsed.blocks[0].reachable);
        assert!(!parsed.blocks[1].reachable);
    }

    #[test]
    fn test_jsr_has_two_edges() {
        // 0: jsr +4 (-> 4), 3: return, 4: astore_1, 5: ret 1
        let code = vec![0xa8, 0x00, 0x04, 0xb1, 0x4c, 0xa9, 0x01];
        let m = method_with(code, vec![], ConstantPool::new());
        let parsed = parse(&m).unwrap();
        let entry = parsed.block_at(0).unwrap();
        let succ = &parsed.blocks[entry.0 as usize].successors;
        assert_eq!(succ.len(), 2);
    }

    #[test]
    fn test_bad_branch_target_rejected() {
        // goto into the middle of a bipush operand
        let code = vec![0xa7, 0x00, 0x03, 0x10, 0x07, 0xb1];
        let m = method_with(code, vec![], ConstantPool::new());
        // target 3 is the bipush itself: fine. Target 4 would be inside it.
        assert!(parse(&m).is_ok());
        let code = vec![0xa7, 0x00, 0x04, 0x10, 0x07, 0xb1];
        let m = method_with(code, vec![], ConstantPool::new());
        assert!(matches!(parse(&m), Err(JitError::Parse { .. })));
    }
}
