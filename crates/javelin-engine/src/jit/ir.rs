//! Compiler intermediate representation
//!
//! Instructions are a tagged variant over a closed set of opcode families.
//! Operands are references into the method's stack-slot array; the stack
//! analyzer creates the slots, the register allocator assigns each one a
//! register or a frame offset, and the emitter reads both. All of it lives
//! only for the duration of one compile.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::classfile::constant_pool::{ClassRef, FieldRef, MethodRef};
use crate::classfile::descriptor::ValueType;
use crate::classfile::method::ExceptionTableEntry;

/// Index into [`IrMethod::slots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Index into [`IrMethod::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// What a pseudo-variable stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Single-assignment temporary created for a pushed value.
    Temp,
    /// Method-global interface slot for one (stack depth, type) cell.
    Stack,
    /// One (local index, type) variable.
    Local,
    /// Incoming parameter in its natural position.
    Arg,
}

/// A compiler pseudo-variable: register-resident or spilled to the frame.
#[derive(Debug, Clone)]
pub struct StackSlot {
    pub kind: SlotKind,
    pub ty: ValueType,
    /// Spilled: `regoff` is a byte offset from the stack pointer.
    pub in_memory: bool,
    /// Must survive a call; steers allocation toward callee-saved registers.
    pub saved: bool,
    /// Register number or frame offset, depending on `in_memory`.
    pub regoff: i32,
    /// Local index for `Local` kind, parameter position for `Arg`.
    pub varnum: u16,
}

impl StackSlot {
    pub fn new(kind: SlotKind, ty: ValueType) -> Self {
        StackSlot {
            kind,
            ty,
            in_memory: false,
            saved: false,
            regoff: -1,
            varnum: 0,
        }
    }
}

/// A constant pushed by `ldc` and friends.
#[derive(Debug, Clone)]
pub enum ConstValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    /// Interned string literal; materialized through the runtime.
    Str(Arc<str>),
    /// `ldc` of a class constant; materializes the class mirror.
    Class(Arc<ClassRef>),
}

impl ConstValue {
    pub fn ty(&self) -> ValueType {
        match self {
            ConstValue::Int(_) => ValueType::Int,
            ConstValue::Long(_) => ValueType::Long,
            ConstValue::Float(_) => ValueType::Float,
            ConstValue::Double(_) => ValueType::Double,
            ConstValue::Null | ConstValue::Str(_) | ConstValue::Class(_) => ValueType::Address,
        }
    }
}

/// Two-operand arithmetic and logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

/// Primitive conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvOp {
    I2l,
    I2f,
    I2d,
    L2i,
    L2f,
    L2d,
    F2i,
    F2l,
    F2d,
    D2i,
    D2l,
    D2f,
    I2b,
    I2c,
    I2s,
}

impl ConvOp {
    pub fn src_ty(self) -> ValueType {
        match self {
            ConvOp::I2l | ConvOp::I2f | ConvOp::I2d | ConvOp::I2b | ConvOp::I2c | ConvOp::I2s => {
                ValueType::Int
            }
            ConvOp::L2i | ConvOp::L2f | ConvOp::L2d => ValueType::Long,
            ConvOp::F2i | ConvOp::F2l | ConvOp::F2d => ValueType::Float,
            ConvOp::D2i | ConvOp::D2l | ConvOp::D2f => ValueType::Double,
        }
    }

    pub fn dst_ty(self) -> ValueType {
        match self {
            ConvOp::L2i
            | ConvOp::F2i
            | ConvOp::D2i
            | ConvOp::I2b
            | ConvOp::I2c
            | ConvOp::I2s => ValueType::Int,
            ConvOp::I2l | ConvOp::F2l | ConvOp::D2l => ValueType::Long,
            ConvOp::I2f | ConvOp::L2f | ConvOp::D2f => ValueType::Float,
            ConvOp::I2d | ConvOp::L2d | ConvOp::F2d => ValueType::Double,
        }
    }
}

/// Three-way comparisons producing an int.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lcmp,
    /// Float compare, NaN yields -1.
    Fcmpl,
    /// Float compare, NaN yields +1.
    Fcmpg,
    Dcmpl,
    Dcmpg,
}

/// Branch conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Right-hand side of a compare-branch.
#[derive(Debug, Clone, Copy)]
pub enum IfRhs {
    Slot(SlotId),
    /// Compare against integer zero (`ifeq` family).
    Zero,
    /// Compare against null (`ifnull`/`ifnonnull`).
    Null,
}

/// Array element families; small integers load as int.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayElem {
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl ArrayElem {
    pub fn value_type(self) -> ValueType {
        match self {
            ArrayElem::Long => ValueType::Long,
            ArrayElem::Float => ValueType::Float,
            ArrayElem::Double => ValueType::Double,
            ArrayElem::Ref => ValueType::Address,
            _ => ValueType::Int,
        }
    }

    pub fn size(self) -> i32 {
        match self {
            ArrayElem::Byte => 1,
            ArrayElem::Char | ArrayElem::Short => 2,
            ArrayElem::Int | ArrayElem::Float => 4,
            ArrayElem::Long | ArrayElem::Double | ArrayElem::Ref => 8,
        }
    }

    /// `newarray` atype operand (JVMS table 6.5.newarray-A).
    pub fn from_atype(atype: u8) -> Option<Self> {
        match atype {
            4 | 8 => Some(ArrayElem::Byte), // boolean arrays store as bytes
            5 => Some(ArrayElem::Char),
            6 => Some(ArrayElem::Float),
            7 => Some(ArrayElem::Double),
            9 => Some(ArrayElem::Short),
            10 => Some(ArrayElem::Int),
            11 => Some(ArrayElem::Long),
            _ => None,
        }
    }

    /// Component descriptor for the array class.
    pub fn descriptor(self) -> &'static str {
        match self {
            ArrayElem::Byte => "B",
            ArrayElem::Char => "C",
            ArrayElem::Short => "S",
            ArrayElem::Int => "I",
            ArrayElem::Long => "J",
            ArrayElem::Float => "F",
            ArrayElem::Double => "D",
            ArrayElem::Ref => "Ljava/lang/Object;",
        }
    }
}

/// Dispatch families for method calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Static,
    Special,
    Virtual,
    Interface,
}

/// One IR instruction.
#[derive(Debug, Clone)]
pub struct Instr {
    /// Bytecode PC this instruction came from.
    pub pc: u32,
    pub kind: InstrKind,
}

/// The closed instruction families of the IR.
#[derive(Debug, Clone)]
pub enum InstrKind {
    Const {
        dst: SlotId,
        value: ConstValue,
    },
    Move {
        src: SlotId,
        dst: SlotId,
    },
    Arith {
        op: ArithOp,
        ty: ValueType,
        lhs: SlotId,
        rhs: SlotId,
        dst: SlotId,
    },
    Neg {
        ty: ValueType,
        src: SlotId,
        dst: SlotId,
    },
    Conv {
        op: ConvOp,
        src: SlotId,
        dst: SlotId,
    },
    Cmp {
        op: CmpOp,
        lhs: SlotId,
        rhs: SlotId,
        dst: SlotId,
    },
    /// Increment a local-variable slot in place.
    Iinc {
        slot: SlotId,
        delta: i32,
    },
    If {
        cond: Cond,
        lhs: SlotId,
        rhs: IfRhs,
        target: BlockId,
    },
    Goto {
        target: BlockId,
    },
    Jsr {
        target: BlockId,
        dst: SlotId,
    },
    /// Indirect jump through a return-address local.
    RetLocal {
        slot: SlotId,
    },
    TableSwitch {
        key: SlotId,
        low: i32,
        targets: Vec<BlockId>,
        default: BlockId,
    },
    LookupSwitch {
        key: SlotId,
        pairs: Vec<(i32, BlockId)>,
        default: BlockId,
    },
    Return {
        value: Option<SlotId>,
    },
    GetField {
        obj: SlotId,
        field: Arc<FieldRef>,
        dst: SlotId,
    },
    PutField {
        obj: SlotId,
        field: Arc<FieldRef>,
        value: SlotId,
    },
    GetStatic {
        field: Arc<FieldRef>,
        dst: SlotId,
    },
    PutStatic {
        field: Arc<FieldRef>,
        value: SlotId,
    },
    ArrayLoad {
        elem: ArrayElem,
        arr: SlotId,
        idx: SlotId,
        dst: SlotId,
    },
    ArrayStore {
        elem: ArrayElem,
        arr: SlotId,
        idx: SlotId,
        value: SlotId,
    },
    ArrayLength {
        arr: SlotId,
        dst: SlotId,
    },
    New {
        class: Arc<ClassRef>,
        dst: SlotId,
    },
    NewArray {
        elem: ArrayElem,
        /// Element class for `anewarray`; `None` for primitive arrays.
        class: Option<Arc<ClassRef>>,
        len: SlotId,
        dst: SlotId,
    },
    MultiNewArray {
        class: Arc<ClassRef>,
        dims: Vec<SlotId>,
        dst: SlotId,
    },
    Checkcast {
        obj: SlotId,
        class: Arc<ClassRef>,
    },
    InstanceOf {
        obj: SlotId,
        class: Arc<ClassRef>,
        dst: SlotId,
    },
    Invoke {
        kind: InvokeKind,
        mref: Arc<MethodRef>,
        args: Vec<SlotId>,
        dst: Option<SlotId>,
    },
    Throw {
        obj: SlotId,
    },
    MonitorEnter {
        obj: SlotId,
    },
    MonitorExit {
        obj: SlotId,
    },
}

impl InstrKind {
    /// Instructions that transfer out of line; nothing in the block follows.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstrKind::Goto { .. }
                | InstrKind::RetLocal { .. }
                | InstrKind::TableSwitch { .. }
                | InstrKind::LookupSwitch { .. }
                | InstrKind::Return { .. }
                | InstrKind::Throw { .. }
        )
    }

    /// Does lowering this instruction call out of the method?
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            InstrKind::Invoke { .. }
                | InstrKind::New { .. }
                | InstrKind::NewArray { .. }
                | InstrKind::MultiNewArray { .. }
                | InstrKind::MonitorEnter { .. }
                | InstrKind::MonitorExit { .. }
                | InstrKind::Const {
                    value: ConstValue::Str(_),
                    ..
                }
        )
    }
}

/// An exception edge from a covered range to its handler block.
#[derive(Debug, Clone)]
pub struct ExEntry {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler: BlockId,
    /// `None` is a catch-all.
    pub catch_class: Option<Arc<ClassRef>>,
}

/// A basic block of IR.
#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub start_pc: u32,
    pub end_pc: u32,
    pub instrs: Vec<Instr>,
    /// Interface slots agreed at entry, bottom of stack first.
    pub in_stack: Vec<SlotId>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
    /// Exception handlers covering any PC of this block.
    pub handlers: Vec<BlockId>,
    pub reachable: bool,
    /// Entry of an exception handler; the in-stack is the exception object.
    pub is_handler_entry: bool,
    /// Source line of the first instruction, for the line table.
    pub line: Option<u16>,
    /// Machine-code offset of the block entry, set during emission.
    pub mpc: u32,
}

impl Block {
    pub fn new(id: BlockId, start_pc: u32, end_pc: u32) -> Self {
        Block {
            id,
            start_pc,
            end_pc,
            instrs: Vec::new(),
            in_stack: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            handlers: Vec::new(),
            reachable: false,
            is_handler_entry: false,
            line: None,
            mpc: 0,
        }
    }
}

/// The whole method in IR form, output of the stack analyzer.
#[derive(Debug)]
pub struct IrMethod {
    /// Blocks in source order; ids equal indices.
    pub blocks: Vec<Block>,
    pub slots: Vec<StackSlot>,
    /// Interface slot per (stack depth, type).
    pub interface_slots: FxHashMap<(u16, ValueType), SlotId>,
    /// Variable per (local index, type).
    pub locals: FxHashMap<(u16, ValueType), SlotId>,
    /// Parameter slots in signature order, receiver first for instance
    /// methods. These are the same slots as the corresponding locals.
    pub params: Vec<SlotId>,
    /// Exception table with block-resolved handlers, in source order.
    pub exception_entries: Vec<ExEntry>,
    /// Original bytecode table rows, for diagnostics.
    pub raw_exception_table: Vec<ExceptionTableEntry>,
    /// Deepest operand stack seen, in slots.
    pub max_stack_depth: u16,
    /// No calls of any kind are emitted for this method.
    pub is_leaf: bool,
}

impl IrMethod {
    pub fn slot(&self, id: SlotId) -> &StackSlot {
        &self.slots[id.0 as usize]
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut StackSlot {
        &mut self.slots[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }
}

impl fmt::Display for IrMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            if !block.reachable {
                continue;
            }
            writeln!(f, "{} (pc {}..{}):", block.id, block.start_pc, block.end_pc)?;
            for instr in &block.instrs {
                writeln!(f, "    {:?}", instr.kind)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_types() {
        assert_eq!(ConvOp::F2i.src_ty(), ValueType::Float);
        assert_eq!(ConvOp::F2i.dst_ty(), ValueType::Int);
        assert_eq!(ConvOp::I2d.dst_ty(), ValueType::Double);
        assert_eq!(ConvOp::I2c.dst_ty(), ValueType::Int);
    }

    #[test]
    fn test_atype_mapping() {
        assert_eq!(ArrayElem::from_atype(10), Some(ArrayElem::Int));
        assert_eq!(ArrayElem::from_atype(4), Some(ArrayElem::Byte));
        assert_eq!(ArrayElem::from_atype(11), Some(ArrayElem::Long));
        assert_eq!(ArrayElem::from_atype(3), None);
    }

    #[test]
    fn test_terminators() {
        assert!(InstrKind::Return { value: None }.is_terminator());
        assert!(InstrKind::Goto {
            target: BlockId(0)
        }
        .is_terminator());
        assert!(!InstrKind::Iinc {
            slot: SlotId(0),
            delta: 1
        }
        .is_terminator());
    }

    #[test]
    fn test_call_classification() {
        assert!(InstrKind::MonitorEnter { obj: SlotId(0) }.is_call());
        assert!(!InstrKind::ArrayLength {
            arr: SlotId(0),
            dst: SlotId(1)
        }
        .is_call());
    }

    #[test]
    fn test_elem_sizes() {
        assert_eq!(ArrayElem::Byte.size(), 1);
        assert_eq!(ArrayElem::Char.size(), 2);
        assert_eq!(ArrayElem::Double.size(), 8);
        assert_eq!(ArrayElem::Ref.value_type(), ValueType::Address);
    }
}
