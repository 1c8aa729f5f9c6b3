//! Bytecode to value graph, one method at a time.
//!
//! A first pass finds the basic-block boundaries: branch targets, and the
//! fall-through successors of conditional branches. The second pass executes
//! the code symbolically, keeping the operand stack and the locals as SSA
//! variables, and checks that every edge into a block agrees on the stack
//! depth.

use std::collections::{BTreeSet, HashSet};

use log::{debug, trace};

use crate::classfile::{ClassFile, ConstantInfo, MethodInfo, RefKind};
use crate::error::{Error, Result};
use crate::gcj::{RuntimeFn, ARRAY_DATA_OFFSET};
use crate::ir::{pn, BlockId, Graph, Mode, NodeId, Op, Relation};
use crate::jvmtypes::*;
use crate::program::{EntityId, Program, TypeId, TypeRef};
use crate::ssa::Builder;
use crate::stack::Manager;

/// How the translator reaches the rest of the program. Resolution may load
/// and finalize further classes.
pub trait Resolver {
    fn program(&self) -> &Program;
    fn field_entity(&mut self, class : &ClassFile, index : u16) -> Result<EntityId>;
    fn method_entity(&mut self, class : &ClassFile, index : u16, kind : RefKind) -> Result<EntityId>;
    fn class_ref(&mut self, class : &ClassFile, index : u16) -> Result<TypeRef>;
    /// An interned NUL-terminated copy of `bytes`.
    fn string_literal(&mut self, bytes : &[u8]) -> EntityId;
    fn runtime(&mut self, f : RuntimeFn) -> EntityId;
    /// The class object standing for `ty`; array classes have none at compile time.
    fn rtti(&mut self, ty : &TypeRef) -> Option<EntityId>;
}

#[derive(Clone, Debug)]
struct BasicBlock {
    pc : usize,
    block : BlockId,
    depth : Option<u16>,
}

struct Translator<'a> {
    resolver : &'a mut dyn Resolver,
    class : &'a ClassFile,
    class_id : TypeId,
    ssa : Builder,
    sm : Manager,
    blocks : Vec<BasicBlock>,
    // classes already initialized on the path through the current block
    initialized : HashSet<TypeId>,
    pc : usize,
}

fn relation(way : Comparison) -> Relation {
    use Comparison::*;
    match way {
        Eq => Relation::EQUAL,
        Ne => Relation::LESS_GREATER,
        Lt => Relation::LESS,
        Ge => Relation::GREATER_EQUAL,
        Gt => Relation::GREATER,
        Le => Relation::LESS_EQUAL,
    }
}

/// Block boundaries of `ops`: every branch target, and the instruction after
/// each conditional branch.
fn find_boundaries(ops : &[(usize, Operation)], code_len : usize) -> Result<BTreeSet<usize>> {
    let starts : HashSet<usize> = ops.iter().map(|(pc, _)| *pc).collect();
    let mut boundaries = BTreeSet::new();
    boundaries.insert(0);
    for (i, (pc, op)) in ops.iter().enumerate() {
        let next = ops.get(i + 1).map_or(code_len, |(n, _)| *n);
        let check = |target : usize| {
            if starts.contains(&target) {
                Ok(target)
            } else {
                Err(Error::InvalidBranchTarget { pc : *pc, target : target as isize })
            }
        };
        match op {
            Operation::Branch { target, .. } => {
                boundaries.insert(check(*target)?);
                boundaries.insert(check(next)?);
            },
            Operation::Jump { target } => {
                boundaries.insert(check(*target)?);
            },
            _ => {},
        }
    }
    Ok(boundaries)
}

impl<'a> Translator<'a> {
    fn graph(&mut self) -> &mut Graph { self.ssa.graph_mut() }

    fn push(&mut self, v : NodeId) -> Result<()> { self.sm.push(&mut self.ssa, v) }
    fn pop(&mut self, mode : Mode) -> Result<NodeId> { self.sm.pop(&mut self.ssa, mode) }

    fn mode_of(&self, n : NodeId) -> Mode { self.ssa.graph().node(n).mode }

    fn conv(&mut self, v : NodeId, mode : Mode) -> NodeId {
        if self.mode_of(v) == mode {
            v
        } else {
            self.ssa.node(Op::Conv, mode, vec![v])
        }
    }

    fn address(&mut self, e : EntityId) -> NodeId { self.graph().address(e) }

    fn unsupported(&self, what : impl Into<String>) -> Error {
        Error::Unsupported { pc : self.pc, what : what.into() }
    }

    /// Emits a node that takes and yields memory, and returns its result
    /// projection if `result` is given.
    fn memory_op(&mut self, op : Op, mut inputs : Vec<NodeId>, result : Option<Mode>) -> Option<NodeId> {
        let mem = self.ssa.get_store();
        inputs.insert(0, mem);
        let node = self.ssa.node(op, Mode::Tuple, inputs);
        let new_mem = self.ssa.proj(node, Mode::Memory, pn::M);
        self.ssa.set_store(new_mem);
        result.map(|mode| self.ssa.proj(node, mode, pn::RES))
    }

    fn call(&mut self, callee : NodeId, mut args : Vec<NodeId>, result : Option<Mode>) -> Option<NodeId> {
        args.insert(0, callee);
        self.memory_op(Op::Call, args, result)
    }

    fn call_runtime(&mut self, f : RuntimeFn, args : Vec<NodeId>, result : Option<Mode>) -> Option<NodeId> {
        let e = self.resolver.runtime(f);
        let callee = self.address(e);
        self.call(callee, args, result)
    }

    fn call_runtime_value(&mut self, f : RuntimeFn, args : Vec<NodeId>, result : Mode) -> NodeId {
        match self.call_runtime(f, args, Some(result)) {
            Some(v) => v,
            None => self.graph().bad(result),
        }
    }

    /// `_Jv_InitClass(&class$)` unless this class is the current one or was
    /// already initialized earlier in this block.
    fn class_init(&mut self, id : TypeId) {
        if id == self.class_id || !self.initialized.insert(id) {
            return;
        }
        self.emit_class_init(id);
    }

    fn emit_class_init(&mut self, id : TypeId) {
        if let Some(rtti) = self.resolver.program().class(id).rtti {
            let addr = self.address(rtti);
            self.call_runtime(RuntimeFn::InitClass, vec![addr], None);
        }
    }

    fn block_index(&self, pc : usize) -> Option<usize> {
        self.blocks.binary_search_by_key(&pc, |b| b.pc).ok()
    }

    /// The block starting at `target`, after checking that arriving there
    /// with the current stack depth is consistent.
    fn branch_target(&mut self, target : usize) -> Result<BlockId> {
        let depth = self.sm.depth();
        let i = self.block_index(target).ok_or(Error::InvalidBranchTarget { pc : self.pc, target : target as isize })?;
        let bb = &mut self.blocks[i];
        match bb.depth {
            None => bb.depth = Some(depth),
            Some(d) if d != depth => return Err(Error::StackPointerMismatch { pc : target }),
            Some(_) => {},
        }
        Ok(bb.block)
    }

    /// Called at every block boundary before the instruction there.
    fn enter_block(&mut self, i : usize) -> Result<()> {
        let depth = self.sm.depth();
        let bb = self.blocks[i].clone();
        match self.ssa.cur_block() {
            Some(cur) => {
                match bb.depth {
                    None => self.blocks[i].depth = Some(depth),
                    Some(d) if d != depth => return Err(Error::StackPointerMismatch { pc : bb.pc }),
                    Some(_) => {},
                }
                if cur != bb.block {
                    let jmp = self.ssa.node(Op::Jmp, Mode::Control, vec![]);
                    self.ssa.add_pred(bb.block, jmp);
                }
            },
            None => match bb.depth {
                Some(d) => self.sm.set_depth(d),
                // nothing has branched here yet; assume the depth we have
                None => self.blocks[i].depth = Some(depth),
            },
        }
        self.ssa.set_cur_block(Some(bb.block));
        self.initialized.clear();
        Ok(())
    }

    fn end_block(&mut self) {
        self.ssa.set_cur_block(None);
    }

    fn constant(&mut self, c : Indirection<ExplicitConstant>) -> Result<()> {
        let v = match c {
            Indirection::Explicit(ExplicitConstant { kind, value }) => {
                let value = i64::from(value);
                match kind {
                    JType::Long   => self.graph().constant(Mode::Long, value as u64),
                    JType::Float  => self.graph().constant(Mode::Float, u64::from((value as f32).to_bits())),
                    JType::Double => self.graph().constant(Mode::Double, (value as f64).to_bits()),
                    JType::Object => self.graph().null(),
                    _             => self.graph().const_int(value as i32),
                }
            },
            Indirection::Indirect(index) => {
                let info = self.class.constant_pool.get(index)?.info.clone();
                match info {
                    ConstantInfo::Integer(i) => self.graph().const_int(i),
                    ConstantInfo::Float(f) => self.graph().constant(Mode::Float, u64::from(f.to_bits())),
                    ConstantInfo::Long(l) => self.graph().constant(Mode::Long, l as u64),
                    ConstantInfo::Double(d) => self.graph().constant(Mode::Double, d.to_bits()),
                    ConstantInfo::String { string_index } => {
                        let bytes = self.class.constant_pool.get_utf8(string_index)?.as_bytes().to_vec();
                        let literal = self.resolver.string_literal(&bytes);
                        let addr = self.address(literal);
                        self.call_runtime_value(RuntimeFn::NewStringUtf, vec![addr], Mode::Reference)
                    },
                    ConstantInfo::Class { .. } => {
                        let ty = self.resolver.class_ref(self.class, index)?;
                        let rtti = self.resolver.rtti(&ty).ok_or_else(|| self.unsupported("array class literal"))?;
                        self.address(rtti)
                    },
                    _ => return Err(Error::UnexpectedConstant { index, expected : "loadable constant" }),
                }
            },
        };
        self.push(v)
    }

    fn arithmetic(&mut self, kind : JType, op : ArithmeticOperation) -> Result<()> {
        use ArithmeticOperation::*;
        let mode = Mode::from(kind);
        let result = match op {
            Neg => {
                let v = self.pop(mode)?;
                self.ssa.node(Op::Minus, mode, vec![v])
            },
            Shl | Shr | Ushr => {
                let count = self.pop(Mode::Int)?;
                let count = self.conv(count, Mode::Unsigned);
                let v = self.pop(mode)?;
                let op = match op { Shl => Op::Shl, Shr => Op::Shrs, _ => Op::Shr };
                self.ssa.node(op, mode, vec![v, count])
            },
            Div | Rem => {
                let right = self.pop(mode)?;
                let left = self.pop(mode)?;
                let op = if op == Div { Op::Div } else { Op::Mod };
                match self.memory_op(op, vec![left, right], Some(mode)) {
                    Some(v) => v,
                    None => self.graph().bad(mode),
                }
            },
            _ => {
                let right = self.pop(mode)?;
                let left = self.pop(mode)?;
                let op = match op {
                    Add => Op::Add,
                    Sub => Op::Sub,
                    Mul => Op::Mul,
                    And => Op::And,
                    Or  => Op::Or,
                    _   => Op::Eor,
                };
                self.ssa.node(op, mode, vec![left, right])
            },
        };
        self.push(result)
    }

    // lcmp, fcmpl, fcmpg, dcmpl, dcmpg: (a > b) - (a < b)
    fn compare(&mut self, kind : JType, nans : Option<NanComparisons>) -> Result<()> {
        let mode = Mode::from(kind);
        let right = self.pop(mode)?;
        let left = self.pop(mode)?;
        let (gt, lt) = match nans {
            Some(NanComparisons::Greater) => (Relation::GREATER | Relation::UNORDERED, Relation::LESS),
            Some(NanComparisons::Less) => (Relation::GREATER, Relation::LESS | Relation::UNORDERED),
            None => (Relation::GREATER, Relation::LESS),
        };
        let gt = self.ssa.node(Op::Cmp(gt), Mode::Bool, vec![left, right]);
        let lt = self.ssa.node(Op::Cmp(lt), Mode::Bool, vec![left, right]);
        let gt = self.conv(gt, Mode::Int);
        let lt = self.conv(lt, Mode::Int);
        let res = self.ssa.node(Op::Sub, Mode::Int, vec![gt, lt]);
        self.push(res)
    }

    fn branch(&mut self, kind : JType, ops : OperandCount, way : Comparison, target : usize, next : usize) -> Result<()> {
        let mode = Mode::from(kind);
        let (left, right) = match ops {
            OperandCount::_2 => {
                let right = self.pop(mode)?;
                let left = self.pop(mode)?;
                (left, right)
            },
            OperandCount::_1 => {
                let left = self.pop(mode)?;
                let zero = if mode == Mode::Reference { self.graph().null() } else { self.graph().const_int(0) };
                (left, zero)
            },
        };
        let cmp = self.ssa.node(Op::Cmp(relation(way)), Mode::Bool, vec![left, right]);
        let cond = self.ssa.node(Op::Cond, Mode::Tuple, vec![cmp]);
        let taken = self.ssa.proj(cond, Mode::Control, pn::COND_TRUE);
        let fall = self.ssa.proj(cond, Mode::Control, pn::COND_FALSE);

        let target = self.branch_target(target)?;
        self.ssa.add_pred(target, taken);
        let next = self.branch_target(next)?;
        self.ssa.add_pred(next, fall);
        self.end_block();
        Ok(())
    }

    fn jump(&mut self, target : usize) -> Result<()> {
        let jmp = self.ssa.node(Op::Jmp, Mode::Control, vec![]);
        let target = self.branch_target(target)?;
        self.ssa.add_pred(target, jmp);
        self.end_block();
        Ok(())
    }

    fn ret(&mut self, kind : JType, result : Option<Mode>) -> Result<()> {
        let mut inputs = vec![self.ssa.get_store()];
        if kind != JType::Void {
            let mode = result.ok_or_else(|| self.unsupported("value returned from void method"))?;
            let v = self.pop(mode.arithmetic())?;
            inputs.push(self.conv(v, mode));
        }
        let ret = self.ssa.node(Op::Return, Mode::Control, inputs);
        let end = self.ssa.graph().end_block();
        self.ssa.add_pred(end, ret);
        self.end_block();
        Ok(())
    }

    fn element_address(&mut self, array : NodeId, index : NodeId, mode : Mode) -> NodeId {
        let size = self.graph().const_int(mode.size() as i32);
        let offset = self.ssa.node(Op::Mul, Mode::Int, vec![index, size]);
        let header = self.graph().const_int(ARRAY_DATA_OFFSET as i32);
        let offset = self.ssa.node(Op::Add, Mode::Int, vec![offset, header]);
        self.ssa.node(Op::Add, Mode::Reference, vec![array, offset])
    }

    fn load(&mut self, addr : NodeId, mode : Mode) -> NodeId {
        match self.memory_op(Op::Load(mode), vec![addr], Some(mode)) {
            Some(v) => v,
            None => self.graph().bad(mode),
        }
    }

    fn store(&mut self, addr : NodeId, value : NodeId) {
        self.memory_op(Op::Store, vec![addr, value], None);
    }

    fn load_array(&mut self, kind : JType) -> Result<()> {
        let mode = Mode::from(kind);
        let index = self.pop(Mode::Int)?;
        let array = self.pop(Mode::Reference)?;
        let addr = self.element_address(array, index, mode);
        let v = self.load(addr, mode);
        let v = self.conv(v, mode.arithmetic());
        self.push(v)
    }

    fn store_array(&mut self, kind : JType) -> Result<()> {
        let mode = Mode::from(kind);
        let value = self.pop(mode.arithmetic())?;
        let index = self.pop(Mode::Int)?;
        let array = self.pop(Mode::Reference)?;
        let addr = self.element_address(array, index, mode);
        let value = self.conv(value, mode);
        self.store(addr, value);
        Ok(())
    }

    fn stack_op(&mut self, size : OperandCount, op : StackOperation) -> Result<()> {
        use StackOperation::*;
        let wide = size == OperandCount::_2;
        // slots popped (top of stack first), then the slots pushed back, bottom first
        let (n, order) : (usize, &[usize]) = match (op, wide) {
            (Pop, false)   => (1, &[]),
            (Pop, true)    => (2, &[]),
            (Dup, false)   => (1, &[0, 0]),
            (Dup, true)    => (2, &[1, 0, 1, 0]),
            (DupX1, false) => (2, &[0, 1, 0]),
            (DupX1, true)  => (3, &[1, 0, 2, 1, 0]),
            (DupX2, false) => (3, &[0, 2, 1, 0]),
            (DupX2, true)  => (4, &[1, 0, 3, 2, 1, 0]),
            (Swap, _)      => (2, &[0, 1]),
        };
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.sm.pop_slot(&mut self.ssa)?);
        }
        for &i in order {
            self.sm.push_slot(&mut self.ssa, v[i])?;
        }
        Ok(())
    }

    fn field_mode(&self, e : EntityId) -> Result<Mode> {
        let program = self.resolver.program();
        let entity = program.entity(e);
        entity.field().map(|f| f.ty.mode()).ok_or(Error::UnexpectedConstant { index : 0, expected : "field" })
    }

    fn var_action(&mut self, op : VarOp, kind : VarKind, index : u16) -> Result<()> {
        let e = self.resolver.field_entity(self.class, index)?;
        let mode = self.field_mode(e)?;
        let owner = self.resolver.program().entity(e).owner;
        match (op, kind) {
            (VarOp::Get, VarKind::Static) => {
                if let Some(o) = owner { self.class_init(o); }
                let addr = self.address(e);
                let v = self.load(addr, mode);
                let v = self.conv(v, mode.arithmetic());
                self.push(v)
            },
            (VarOp::Put, VarKind::Static) => {
                let v = self.pop(mode.arithmetic())?;
                if let Some(o) = owner { self.class_init(o); }
                let addr = self.address(e);
                let v = self.conv(v, mode);
                self.store(addr, v);
                Ok(())
            },
            (VarOp::Get, VarKind::Field) => {
                let obj = self.pop(Mode::Reference)?;
                let addr = self.ssa.node(Op::Sel(e), Mode::Reference, vec![obj]);
                let v = self.load(addr, mode);
                let v = self.conv(v, mode.arithmetic());
                self.push(v)
            },
            (VarOp::Put, VarKind::Field) => {
                let v = self.pop(mode.arithmetic())?;
                let obj = self.pop(Mode::Reference)?;
                let addr = self.ssa.node(Op::Sel(e), Mode::Reference, vec![obj]);
                let v = self.conv(v, mode);
                self.store(addr, v);
                Ok(())
            },
        }
    }

    fn invoke(&mut self, kind : InvokeKind, index : u16) -> Result<()> {
        let ref_kind = match kind {
            InvokeKind::Dynamic => return Err(self.unsupported("invokedynamic")),
            InvokeKind::Interface(_) => RefKind::InterfaceMethod,
            _ => RefKind::Method,
        };
        let e = self.resolver.method_entity(self.class, index, ref_kind)?;
        let (params, result, owner, target) = {
            let program = self.resolver.program();
            let entity = program.entity(e);
            let m = entity.method().ok_or(Error::UnexpectedConstant { index, expected : "method" })?;
            if m.is_static() != (kind == InvokeKind::Static) {
                return Err(self.unsupported(format!("{:?} call of {}", kind, entity.name)));
            }
            // proxies of inherited implementations have no code of their own
            let mut target = e;
            while let Some(real) = program.method(target).and_then(|m| m.implementation) {
                target = real;
            }
            // the receiver is popped like any other argument
            (m.param_modes(), m.result_mode(), entity.owner, target)
        };

        let mut args = Vec::with_capacity(params.len());
        for &mode in params.iter().rev() {
            let v = self.pop(mode.arithmetic())?;
            args.push(self.conv(v, mode));
        }
        args.reverse();

        let callee = match kind {
            InvokeKind::Static => {
                if let Some(o) = owner { self.class_init(o); }
                self.address(target)
            },
            InvokeKind::Special => self.address(target),
            _ => {
                let mem = self.ssa.get_store();
                self.ssa.node(Op::MethodSel(e), Mode::Reference, vec![mem, args[0]])
            },
        };

        if let Some(v) = self.call(callee, args, result) {
            let mode = self.mode_of(v).arithmetic();
            let v = self.conv(v, mode);
            self.push(v)?;
        }
        Ok(())
    }

    fn allocation(&mut self, kind : AllocationKind) -> Result<()> {
        let ty = match kind {
            AllocationKind::Element { index } => {
                let ty = self.resolver.class_ref(self.class, index)?;
                match ty {
                    TypeRef::Class(id) => self.class_init(id),
                    _ => return Err(self.unsupported("new of a non-class type")),
                }
                let one = self.graph().constant(Mode::Unsigned, 1);
                let obj = self.alloc(ty, one);
                return self.push(obj);
            },
            AllocationKind::Array { dims, .. } if dims > 1 => return Err(self.unsupported("multianewarray")),
            AllocationKind::Array { kind : Indirection::Explicit(t), .. } => TypeRef::Prim(t),
            AllocationKind::Array { kind : Indirection::Indirect(index), .. } => {
                let elem = self.resolver.class_ref(self.class, index)?;
                if self.resolver.rtti(&elem).is_none() {
                    return Err(self.unsupported("array of arrays"));
                }
                elem
            },
        };
        let count = self.pop(Mode::Int)?;
        let count = self.conv(count, Mode::Unsigned);
        let array = self.alloc(TypeRef::Array(Box::new(ty)), count);
        self.push(array)
    }

    fn alloc(&mut self, ty : TypeRef, count : NodeId) -> NodeId {
        match self.memory_op(Op::Alloc(ty), vec![count], Some(Mode::Reference)) {
            Some(v) => v,
            None => self.graph().bad(Mode::Reference),
        }
    }

    fn type_check(&mut self, check : TypeCheck, index : u16) -> Result<()> {
        let ty = self.resolver.class_ref(self.class, index)?;
        let rtti = self.resolver.rtti(&ty).ok_or_else(|| self.unsupported("type test against an array type"))?;
        let obj = self.pop(Mode::Reference)?;
        let v = match check {
            TypeCheck::Cast => {
                let class = self.address(rtti);
                self.call_runtime_value(RuntimeFn::CheckCast, vec![class, obj], Mode::Reference)
            },
            TypeCheck::InstanceOf => {
                let b = match self.memory_op(Op::InstanceOf(ty), vec![obj], Some(Mode::Bool)) {
                    Some(b) => b,
                    None => self.graph().bad(Mode::Bool),
                };
                self.conv(b, Mode::Int)
            },
        };
        self.push(v)
    }

    fn throw(&mut self) -> Result<()> {
        let _exception = self.pop(Mode::Reference)?;
        self.call_runtime(RuntimeFn::Abort, vec![], None);
        let mem = self.ssa.get_store();
        self.graph().keep_alive(mem);
        self.end_block();
        Ok(())
    }

    fn operation(&mut self, op : Operation, next : usize, result : Option<Mode>) -> Result<()> {
        use Operation::*;
        match op {
            Allocation(kind) => self.allocation(kind),
            Arithmetic { kind, op } => self.arithmetic(kind, op),
            Branch { kind, ops, way, target } => self.branch(kind, ops, way, target, next),
            Compare { kind, nans } => self.compare(kind, nans),
            Constant(c) => self.constant(c),
            Conversion { from, to } => {
                let v = self.pop(Mode::from(from))?;
                let to = Mode::from(to);
                let v = self.conv(v, to);
                let v = self.conv(v, to.arithmetic());
                self.push(v)
            },
            Increment { index, value } => {
                let v = self.sm.get_local(&mut self.ssa, index, Mode::Int)?;
                let c = self.graph().const_int(i32::from(value));
                let sum = self.ssa.node(Op::Add, Mode::Int, vec![v, c]);
                self.sm.set_local(&mut self.ssa, index, sum)
            },
            Invocation { kind, index } => self.invoke(kind, index),
            Jump { target } => self.jump(target),
            Length => {
                let array = self.pop(Mode::Reference)?;
                let len = match self.memory_op(Op::Arraylength, vec![array], Some(Mode::Int)) {
                    Some(l) => l,
                    None => self.graph().bad(Mode::Int),
                };
                self.push(len)
            },
            LoadArray(kind) => self.load_array(kind),
            LoadLocal { kind, index } => {
                let v = self.sm.get_local(&mut self.ssa, index, Mode::from(kind))?;
                self.push(v)
            },
            Monitor => self.pop(Mode::Reference).map(|_| ()),
            Noop => Ok(()),
            StackOp { size, op } => self.stack_op(size, op),
            StoreArray(kind) => self.store_array(kind),
            StoreLocal { kind, index } => {
                let v = self.pop(Mode::from(kind))?;
                self.sm.set_local(&mut self.ssa, index, v)
            },
            Throw => self.throw(),
            TypeCheck { check, index } => self.type_check(check, index),
            VarAction { op, kind, index } => self.var_action(op, kind, index),
            Yield { kind } => self.ret(kind, result),
            Unhandled(insn) => Err(self.unsupported(format!("{:?}", insn))),
        }
    }
}

/// Builds the value graph of one method of `class`. `entity` is the method's
/// program entity, already created during class finalization.
pub fn translate_method(
        resolver : &mut dyn Resolver,
        class_id : TypeId,
        class : &ClassFile,
        method : &MethodInfo,
        entity : EntityId,
    ) -> Result<Graph>
{
    let (name, params, result) = {
        let e = resolver.program().entity(entity);
        let m = e.method().ok_or(Error::UnexpectedConstant { index : method.name_index, expected : "method" })?;
        (e.ld_name.clone(), m.param_modes(), m.result_mode())
    };
    let code = method.code().ok_or_else(|| Error::MissingCode(name.clone()))?;
    debug!("translating {}", name);

    let ops = decode_code(&code.code)?;
    let boundaries = find_boundaries(&ops, code.code.len())?;

    let sm = Manager::new(code.max_stack, code.max_locals);
    let mut ssa = Builder::new(Graph::new(&name), sm.n_vars());
    let start = ssa.graph().start_block();

    let targeted_entry = ops.iter().any(|(_, op)| match op {
        Operation::Branch { target, .. } | Operation::Jump { target } => *target == 0,
        _ => false,
    });
    let blocks : Vec<BasicBlock> = boundaries
        .iter()
        .map(|&pc| {
            let block = if pc == 0 && !targeted_entry { start } else { ssa.new_imm_block() };
            ssa.graph_mut().block_mut(block).pc = Some(pc);
            let depth = if pc == 0 { Some(0) } else { None };
            BasicBlock { pc, block, depth }
        })
        .collect();

    let mut t = Translator {
        resolver,
        class,
        class_id,
        ssa,
        sm,
        blocks,
        initialized : HashSet::new(),
        pc : 0,
    };

    let mut slot = 0;
    for (n, &mode) in params.iter().enumerate() {
        let arg = t.graph().arg(n as u32, mode);
        let arg = t.conv(arg, mode.arithmetic());
        t.sm.set_local(&mut t.ssa, slot, arg)?;
        slot += if mode.is_two_slot() { 2 } else { 1 };
    }
    let is_static = t.resolver.program().method(entity).map_or(false, |m| m.is_static());
    if is_static {
        t.emit_class_init(class_id);
    }
    if targeted_entry {
        let jmp = t.ssa.node(Op::Jmp, Mode::Control, vec![]);
        let entry = t.blocks[0].block;
        t.ssa.add_pred(entry, jmp);
    }

    for (i, (pc, op)) in ops.iter().enumerate() {
        let (pc, op) = (*pc, op.clone());
        let next = ops.get(i + 1).map_or(code.code.len(), |(n, _)| *n);
        t.pc = pc;
        t.sm.at(pc);
        if let Some(b) = t.block_index(pc) {
            t.enter_block(b)?;
        }
        if t.ssa.cur_block().is_none() {
            trace!("{:5}: unreachable {:?}", pc, op);
            continue;
        }
        trace!("{:5}: {:?}", pc, op);
        t.operation(op, next, result)?;
    }
    if t.ssa.cur_block().is_some() {
        return Err(Error::Unsupported { pc : code.code.len(), what : "control falls off the end of the code".to_owned() });
    }

    let order : Vec<BlockId> = t.blocks.iter().map(|b| b.block).collect();
    for b in order {
        t.ssa.mature(b);
    }
    let end = t.ssa.graph().end_block();
    t.ssa.mature(end);

    let mut graph = t.ssa.finish();
    for pc in graph.remove_unreachable() {
        debug!("{}: dropping unreachable block at PC {}", name, pc);
    }
    graph.normalize();
    Ok(graph)
}

#[cfg(test)]
struct TestResolver {
    program : Program,
    runtime : crate::gcj::RuntimeEntities,
    strings : crate::gcj::StringPool,
}

#[cfg(test)]
impl Resolver for TestResolver {
    fn program(&self) -> &Program { &self.program }

    fn field_entity(&mut self, class : &ClassFile, index : u16) -> Result<EntityId> {
        let r = class.constant_pool.member_ref(index, RefKind::Field)?;
        Err(Error::MissingMember { class : r.class_name.to_owned(), name : r.name.to_owned(), descriptor : r.descriptor.to_owned() })
    }

    fn method_entity(&mut self, class : &ClassFile, index : u16, kind : RefKind) -> Result<EntityId> {
        let r = class.constant_pool.member_ref(index, kind)?;
        Err(Error::MissingMember { class : r.class_name.to_owned(), name : r.name.to_owned(), descriptor : r.descriptor.to_owned() })
    }

    fn class_ref(&mut self, class : &ClassFile, index : u16) -> Result<TypeRef> {
        Err(Error::ClassNotFound(class.constant_pool.class_name(index)?.to_owned()))
    }

    fn string_literal(&mut self, bytes : &[u8]) -> EntityId {
        self.strings.c_string(&mut self.program, bytes)
    }

    fn runtime(&mut self, f : RuntimeFn) -> EntityId {
        self.runtime.function(&mut self.program, f)
    }

    fn rtti(&mut self, ty : &TypeRef) -> Option<EntityId> {
        match ty {
            TypeRef::Class(id) => self.program.class(*id).rtti,
            _ => None,
        }
    }
}

/// Translates `code` as the only method, static `m` with `descriptor`, of a class `T`.
#[cfg(test)]
fn translate_code(descriptor : &str, max_stack : u16, max_locals : u16, code : &[u8]) -> Result<(Graph, TestResolver)> {
    use crate::classfile::*;
    use crate::descriptor::MethodDescriptor;
    use crate::program::*;

    let utf8 = |s : &str| Constant::new(ConstantInfo::Utf8(Utf8Constant::new(s.as_bytes())));
    let pool = ConstantPool::new(vec![
        Constant::new(ConstantInfo::Unusable),
        utf8("T"),
        Constant::new(ConstantInfo::Class { name_index : 1 }),
        utf8("java/lang/Object"),
        Constant::new(ConstantInfo::Class { name_index : 3 }),
        utf8("m"),
        utf8(descriptor),
        utf8("Code"),
    ]);
    let attr = Attribute::Code(CodeAttribute {
        max_stack,
        max_locals,
        code : code.to_vec(),
        exception_table : vec![],
        attributes : vec![],
    });
    let flags = AccessFlags::PUBLIC | AccessFlags::STATIC;
    let class = ClassFile {
        minor_version : 0,
        major_version : 50,
        constant_pool : pool,
        access_flags : AccessFlags::PUBLIC,
        this_class : 2,
        super_class : 4,
        interfaces : vec![],
        fields : vec![],
        methods : vec![MethodInfo::new(flags, 5, 6, vec![attr])],
        attributes : vec![],
    };

    let mut program = Program::new();
    let id = program.new_class("T");
    let method = Method {
        descriptor : descriptor.to_owned(),
        signature : MethodDescriptor::parse(descriptor)?,
        flags,
        overwrites : vec![],
        vtable_slot : None,
        binding : Binding::Static,
        exclude_from_vtable : true,
        is_abstract : false,
        is_final : false,
        implementation : None,
        graph : None,
    };
    let e = program.add_member(id, Entity {
        name : "m".to_owned(),
        ld_name : "_ZN1T1mEJvv".to_owned(),
        owner : None,
        kind : EntityKind::Method(method),
        visibility : Visibility::Local,
        initializer : None,
    });
    let mut r = TestResolver {
        program,
        runtime : crate::gcj::RuntimeEntities::new(),
        strings : crate::gcj::StringPool::new(),
    };
    let g = translate_method(&mut r, id, &class, &class.methods[0], e)?;
    Ok((g, r))
}

#[cfg(test)]
fn live_blocks(g : &Graph) -> usize {
    g.blocks().filter(|&b| !g.block(b).dead && b != g.end_block()).count()
}

#[test]
fn test_return_only() -> crate::GeneralResult<()> {
    let (g, _) = translate_code("()V", 0, 0, &[0xb1])?;
    assert_eq!(live_blocks(&g), 1);
    assert_eq!(g.find_nodes(|op| *op == Op::Return).len(), 1);
    assert!(g.find_nodes(|op| matches!(op, Op::Const(_) | Op::Add | Op::Phi | Op::Call)).is_empty());
    assert_eq!(g.block(g.end_block()).preds.len(), 1);
    Ok(())
}

// iload_0; ifeq 8; iconst_1; goto 9; iconst_2; ireturn
#[cfg(test)]
const SELECT : [u8 ; 10] = [0x1a, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x04, 0x05, 0xac];

#[test]
fn test_merge_with_equal_depth() -> crate::GeneralResult<()> {
    let (g, _) = translate_code("(I)I", 1, 1, &SELECT)?;
    assert_eq!(live_blocks(&g), 4);
    let phis = g.find_nodes(|op| *op == Op::Phi);
    assert_eq!(phis.len(), 1);
    let phi = g.node(phis[0]);
    assert_eq!(phi.mode, Mode::Int);
    assert_eq!(g.block(phi.block).pc, Some(9));
    let ret = g.find_nodes(|op| *op == Op::Return)[0];
    assert_eq!(g.node(ret).inputs[1], phis[0]);
    Ok(())
}

#[test]
fn test_merge_with_unequal_depth() {
    let mut code = SELECT;
    code[8] = 0x00; // nop instead of iconst_2
    match translate_code("(I)I", 1, 1, &code) {
        Err(Error::StackPointerMismatch { pc }) => assert_eq!(pc, 9),
        other => panic!("expected a stack pointer mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_loop() -> crate::GeneralResult<()> {
    // int s = 0; while (n > 0) { s += n; n--; } return s;
    let code = [
        0x03, 0x3c, 0x1a, 0x9e, 0x00, 0x0d, 0x1b, 0x1a, 0x60,
        0x3c, 0x84, 0x00, 0xff, 0xa7, 0xff, 0xf5, 0x1b, 0xac,
    ];
    let (g, _) = translate_code("(I)I", 2, 2, &code)?;
    let phis = g.find_nodes(|op| *op == Op::Phi);
    assert_eq!(phis.len(), 2);
    for p in phis {
        assert_eq!(g.block(g.node(p).block).pc, Some(2));
        assert_eq!(g.node(p).inputs.len(), 2);
    }
    Ok(())
}

#[test]
fn test_unreachable_code_dropped() -> crate::GeneralResult<()> {
    // goto 4; iconst_0 (never reached); return
    let (g, _) = translate_code("()V", 1, 0, &[0xa7, 0x00, 0x04, 0x03, 0xb1])?;
    assert_eq!(g.find_nodes(|op| *op == Op::Return).len(), 1);
    assert!(g.find_nodes(|op| *op == Op::Const(0)).is_empty());
    Ok(())
}

#[test]
fn test_falling_off_the_end() {
    // iconst_0; pop
    assert!(matches!(translate_code("()V", 1, 0, &[0x03, 0x57]), Err(Error::Unsupported { .. })));
}

#[test]
fn test_throw_aborts() -> crate::GeneralResult<()> {
    // aconst_null; athrow
    let (g, r) = translate_code("()V", 1, 0, &[0x01, 0xbf])?;
    let calls = g.find_nodes(|op| *op == Op::Call);
    assert_eq!(calls.len(), 1);
    assert!(g.find_nodes(|op| *op == Op::Return).is_empty());
    assert_eq!(g.keep_alives().len(), 1);
    let callee = g.node(calls[0]).inputs[1];
    match g.node(callee).op {
        Op::Address(e) => assert_eq!(r.program.entity(e).ld_name, "abort"),
        ref op => panic!("unexpected callee {:?}", op),
    }
    Ok(())
}

#[test]
fn test_long_arithmetic() -> crate::GeneralResult<()> {
    // lload_0; lload_0; lcmp; ireturn
    let (g, _) = translate_code("(J)I", 4, 2, &[0x1e, 0x1e, 0x94, 0xac])?;
    let cmps = g.find_nodes(|op| matches!(op, Op::Cmp(_)));
    assert_eq!(cmps.len(), 2);
    assert_eq!(g.find_nodes(|op| *op == Op::Sub).len(), 1);

    // lload_0; pop; istore_2 reads the lower half of the long as an int
    assert!(matches!(translate_code("(J)V", 4, 3, &[0x1e, 0x57, 0x3d, 0xb1]), Err(Error::SlotArity { .. })));
    Ok(())
}

#[test]
fn test_invokedynamic_rejected() {
    assert!(matches!(translate_code("()V", 1, 0, &[0xba, 0x00, 0x01, 0x00, 0x00, 0xb1]), Err(Error::Unsupported { pc : 0, .. })));
}
