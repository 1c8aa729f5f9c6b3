//! The value graph handed to the code generator.
//!
//! A `Graph` is an arena of nodes and an arena of blocks. Every node lives in
//! exactly one block; control flow is expressed by the `preds` list of each
//! block, whose entries are control-mode nodes (`Jmp`, a projection of a
//! `Cond`, or `Return` for the end block). Nodes producing several results
//! have mode `Tuple` and are taken apart with `Proj`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use bitflags::bitflags;

use crate::jvmtypes::JType;
use crate::program::{EntityId, TypeRef};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

impl NodeId  { pub fn index(self) -> usize { self.0 } }
impl BlockId { pub fn index(self) -> usize { self.0 } }

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
    /// Unsigned 32-bit, for shift counts and sizes.
    Unsigned,
    Memory,
    Control,
    Tuple,
}

impl Mode {
    pub fn is_two_slot(self) -> bool {
        matches!(self, Mode::Long | Mode::Double)
    }

    /// Java computes on int at least; narrower values are widened when loaded.
    pub fn arithmetic(self) -> Mode {
        match self {
            Mode::Bool | Mode::Byte | Mode::Char | Mode::Short => Mode::Int,
            m => m,
        }
    }

    /// Size in bytes of a value of this mode in memory.
    pub fn size(self) -> u32 {
        use Mode::*;
        match self {
            Bool | Byte => 1,
            Char | Short => 2,
            Int | Float | Unsigned | Reference => 4,
            Long | Double => 8,
            Memory | Control | Tuple => 0,
        }
    }
}

impl From<JType> for Mode {
    fn from(t : JType) -> Self {
        match t {
            JType::Int     => Mode::Int,
            JType::Long    => Mode::Long,
            JType::Float   => Mode::Float,
            JType::Double  => Mode::Double,
            JType::Object  => Mode::Reference,
            JType::Byte    => Mode::Byte,
            JType::Char    => Mode::Char,
            JType::Short   => Mode::Short,
            JType::Boolean => Mode::Bool,
            JType::Void    => Mode::Tuple,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        use Mode::*;
        let s = match self {
            Bool => "b", Byte => "Bs", Char => "Hu", Short => "Hs", Int => "Is",
            Long => "Ls", Float => "F", Double => "D", Reference => "P",
            Unsigned => "Iu", Memory => "M", Control => "X", Tuple => "T",
        };
        f.write_str(s)
    }
}

bitflags! {
    pub struct Relation : u8 {
        const EQUAL     = 0b0001;
        const LESS      = 0b0010;
        const GREATER   = 0b0100;
        const UNORDERED = 0b1000;

        const LESS_EQUAL    = Self::LESS.bits | Self::EQUAL.bits;
        const GREATER_EQUAL = Self::GREATER.bits | Self::EQUAL.bits;
        const LESS_GREATER  = Self::LESS.bits | Self::GREATER.bits;
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        let mut s = String::new();
        if self.contains(Relation::UNORDERED) { s.push('u'); }
        if self.contains(Relation::LESS)      { s.push('<'); }
        if self.contains(Relation::GREATER)   { s.push('>'); }
        if self.contains(Relation::EQUAL)     { s.push('='); }
        f.write_str(&s)
    }
}

/// Projection numbers. Every node that touches memory yields its new memory
/// state as projection `M` and its value, if any, as `RES`.
pub mod pn {
    pub const M : u32 = 0;
    pub const RES : u32 = 1;

    pub const START_M : u32 = 0;
    /// The n-th argument of a graph is projection `START_ARG0 + n` of its Start.
    pub const START_ARG0 : u32 = 1;

    pub const COND_FALSE : u32 = 0;
    pub const COND_TRUE : u32 = 1;
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Start,
    Proj(u32),
    /// Raw bits; interpretation depends on the node mode.
    Const(u64),
    Address(EntityId),
    /// A value read from a slot nothing ever wrote.
    Unknown,
    /// Placeholder for the upper half of a two-slot value.
    Bad,
    /// Forwards to its only input; left behind by `exchange`.
    Id,

    Add,
    Sub,
    Mul,
    Minus,
    And,
    Or,
    Eor,
    Shl,
    Shr,
    Shrs,
    /// Inputs: memory, left, right.
    Div,
    /// Inputs: memory, left, right.
    Mod,
    Conv,
    Cmp(Relation),

    Cond,
    Jmp,
    /// Inputs: memory, then the returned value if any.
    Return,
    Phi,

    /// Inputs: memory, address.
    Load(Mode),
    /// Inputs: memory, address, value.
    Store,
    /// Address of a field within the object given as input.
    Sel(EntityId),
    /// Inputs: memory, callee address, arguments.
    Call,
    /// Address of the implementation of a dynamically bound method for the
    /// receiver given as second input. Inputs: memory, receiver.
    MethodSel(EntityId),

    /// Inputs: memory, element count.
    Alloc(TypeRef),
    /// Inputs: memory, array.
    Arraylength,
    /// Inputs: memory, object.
    InstanceOf(TypeRef),
}

impl Op {
    fn is_pinned_cf(&self) -> bool {
        matches!(self, Op::Cond | Op::Jmp | Op::Return)
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub op : Op,
    pub mode : Mode,
    pub block : BlockId,
    pub inputs : Vec<NodeId>,
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    /// Control-flow predecessors: nodes of mode `Control` in other blocks.
    pub preds : Vec<NodeId>,
    /// Bytecode address this block starts at, if it corresponds to one.
    pub pc : Option<usize>,
    pub dead : bool,
}

#[derive(Clone, Debug)]
pub struct Graph {
    pub name : String,
    nodes : Vec<Node>,
    blocks : Vec<Block>,
    start_block : BlockId,
    end_block : BlockId,
    start : NodeId,
    keep_alives : Vec<NodeId>,
    bads : HashMap<Mode, NodeId>,
}

impl Graph {
    pub fn new(name : &str) -> Self {
        let mut g = Self {
            name : name.to_owned(),
            nodes : Vec::new(),
            blocks : Vec::new(),
            start_block : BlockId(0),
            end_block : BlockId(1),
            start : NodeId(0),
            keep_alives : Vec::new(),
            bads : HashMap::new(),
        };
        g.start_block = g.new_block();
        g.end_block = g.new_block();
        g.start = g.add(g.start_block, Op::Start, Mode::Tuple, vec![]);
        g
    }

    pub fn start_block(&self) -> BlockId { self.start_block }
    pub fn end_block(&self) -> BlockId { self.end_block }
    pub fn start(&self) -> NodeId { self.start }

    pub fn initial_mem(&mut self) -> NodeId {
        self.proj(self.start, Mode::Memory, pn::START_M)
    }

    pub fn arg(&mut self, n : u32, mode : Mode) -> NodeId {
        self.proj(self.start, mode, pn::START_ARG0 + n)
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        BlockId(self.blocks.len() - 1)
    }

    pub fn block(&self, b : BlockId) -> &Block { &self.blocks[b.0] }
    pub fn block_mut(&mut self, b : BlockId) -> &mut Block { &mut self.blocks[b.0] }

    pub fn blocks(&self) -> impl Iterator<Item=BlockId> + '_ {
        (0..self.blocks.len()).map(BlockId).filter(move |&b| !self.blocks[b.0].dead)
    }

    pub fn node(&self, n : NodeId) -> &Node { &self.nodes[n.0] }
    pub fn node_mut(&mut self, n : NodeId) -> &mut Node { &mut self.nodes[n.0] }

    /// Live nodes, in creation order, with forwarding `Id`s left out.
    pub fn nodes(&self) -> impl Iterator<Item=NodeId> + '_ {
        (0..self.nodes.len())
            .map(NodeId)
            .filter(move |&n| {
                let node = &self.nodes[n.0];
                node.op != Op::Id && !self.blocks[node.block.0].dead
            })
    }

    pub fn add(&mut self, block : BlockId, op : Op, mode : Mode, inputs : Vec<NodeId>) -> NodeId {
        self.nodes.push(Node { op, mode, block, inputs });
        NodeId(self.nodes.len() - 1)
    }

    pub fn proj(&mut self, of : NodeId, mode : Mode, num : u32) -> NodeId {
        let block = self.nodes[of.0].block;
        self.add(block, Op::Proj(num), mode, vec![of])
    }

    pub fn constant(&mut self, mode : Mode, bits : u64) -> NodeId {
        let block = self.start_block;
        self.add(block, Op::Const(bits), mode, vec![])
    }

    pub fn const_int(&mut self, v : i32) -> NodeId {
        self.constant(Mode::Int, v as u32 as u64)
    }

    pub fn null(&mut self) -> NodeId {
        self.constant(Mode::Reference, 0)
    }

    pub fn address(&mut self, entity : EntityId) -> NodeId {
        let block = self.start_block;
        self.add(block, Op::Address(entity), Mode::Reference, vec![])
    }

    /// The shared placeholder of the given mode.
    pub fn bad(&mut self, mode : Mode) -> NodeId {
        if let Some(&b) = self.bads.get(&mode) {
            return b;
        }
        let block = self.start_block;
        let b = self.add(block, Op::Bad, mode, vec![]);
        self.bads.insert(mode, b);
        b
    }

    pub fn is_bad(&self, n : NodeId) -> bool {
        self.nodes[self.skip_id(n).0].op == Op::Bad
    }

    pub fn add_pred(&mut self, block : BlockId, pred : NodeId) {
        self.blocks[block.0].preds.push(pred);
    }

    pub fn keep_alive(&mut self, n : NodeId) {
        self.keep_alives.push(n);
    }

    pub fn keep_alives(&self) -> &[NodeId] { &self.keep_alives }

    /// The block a control predecessor leaves from.
    pub fn pred_block(&self, pred : NodeId) -> BlockId {
        self.nodes[self.skip_id(pred).0].block
    }

    pub fn skip_id(&self, mut n : NodeId) -> NodeId {
        while self.nodes[n.0].op == Op::Id {
            n = self.nodes[n.0].inputs[0];
        }
        n
    }

    /// Replaces every use of `old` by `new`.
    pub fn exchange(&mut self, old : NodeId, new : NodeId) {
        if old == new {
            return;
        }
        let node = &mut self.nodes[old.0];
        node.op = Op::Id;
        node.inputs = vec![new];
    }

    /// The one value `phi` merges, ignoring references to itself.
    fn single_operand(&self, phi : NodeId) -> Option<NodeId> {
        let mut same = None;
        for &op in &self.nodes[phi.0].inputs {
            let op = self.skip_id(op);
            if op == phi || Some(op) == same {
                continue;
            }
            if same.is_some() {
                return None;
            }
            same = Some(op);
        }
        same
    }

    /// Forwards Phis that merge a single value to that value, then rewrites
    /// every input through forwarding `Id`s so the `Id`s become unreferenced.
    pub fn normalize(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..self.nodes.len() {
                let node = &self.nodes[i];
                if node.op != Op::Phi || self.blocks[node.block.0].dead {
                    continue;
                }
                if let Some(v) = self.single_operand(NodeId(i)) {
                    self.exchange(NodeId(i), v);
                    changed = true;
                }
            }
        }
        for i in 0..self.nodes.len() {
            let inputs : Vec<_> = self.nodes[i].inputs.iter().map(|&n| self.skip_id(n)).collect();
            if self.nodes[i].op != Op::Id {
                self.nodes[i].inputs = inputs;
            }
        }
        for b in 0..self.blocks.len() {
            let preds : Vec<_> = self.blocks[b].preds.iter().map(|&n| self.skip_id(n)).collect();
            self.blocks[b].preds = preds;
        }
        let keeps : Vec<_> = self.keep_alives.iter().map(|&n| self.skip_id(n)).collect();
        self.keep_alives = keeps;
    }

    /// Successor blocks of every block, derived from the predecessor lists.
    fn successors(&self) -> Vec<Vec<BlockId>> {
        let mut succs = vec![Vec::new(); self.blocks.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            for &p in &block.preds {
                succs[self.pred_block(p).0].push(BlockId(b));
            }
        }
        succs
    }

    /// Marks every block not reachable from the start block as dead, detaches
    /// it from its successors and returns the bytecode addresses of the
    /// dropped blocks that had one.
    pub fn remove_unreachable(&mut self) -> Vec<usize> {
        let succs = self.successors();
        let mut seen = BTreeSet::new();
        let mut work = vec![self.start_block];
        while let Some(b) = work.pop() {
            if seen.insert(b) {
                work.extend(succs[b.0].iter().copied());
            }
        }
        // the end block stays even for methods that never return
        seen.insert(self.end_block);

        let mut dropped = Vec::new();
        for b in 0..self.blocks.len() {
            if !seen.contains(&BlockId(b)) && !self.blocks[b].dead {
                self.blocks[b].dead = true;
                dropped.extend(self.blocks[b].pc);
            }
        }

        for b in seen {
            let keep : Vec<bool> = self.blocks[b.0].preds
                .iter()
                .map(|&p| !self.blocks[self.pred_block(p).0].dead)
                .collect();
            if keep.iter().all(|&k| k) {
                continue;
            }
            let filter = |v : &[NodeId]| -> Vec<NodeId> {
                v.iter().zip(&keep).filter(|&(_, &k)| k).map(|(&n, _)| n).collect()
            };
            let preds = filter(&self.blocks[b.0].preds);
            self.blocks[b.0].preds = preds;
            let phis : Vec<_> = (0..self.nodes.len())
                .filter(|&i| self.nodes[i].block == b && self.nodes[i].op == Op::Phi)
                .collect();
            for i in phis {
                let inputs = filter(&self.nodes[i].inputs);
                self.nodes[i].inputs = inputs;
            }
        }

        self.keep_alives.retain({
            let nodes = &self.nodes;
            let blocks = &self.blocks;
            move |n| !blocks[nodes[n.0].block.0].dead
        });

        dropped
    }

    /// Nodes with the given op in block order; lowering passes walk these.
    pub fn find_nodes(&self, pred : impl Fn(&Op) -> bool) -> Vec<NodeId> {
        self.nodes().filter(|&n| pred(&self.nodes[n.0].op)).collect()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "graph {} {{", self.name)?;
        for b in self.blocks() {
            let block = &self.blocks[b.0];
            let tag = if b == self.start_block { " start" } else if b == self.end_block { " end" } else { "" };
            write!(f, "  block{}{}", b.0, tag)?;
            if let Some(pc) = block.pc {
                write!(f, " @{}", pc)?;
            }
            let preds : Vec<_> = block.preds.iter().map(|p| format!("%{}", p.0)).collect();
            writeln!(f, " <- [{}]", preds.join(", "))?;
            for n in self.nodes().filter(|&n| self.nodes[n.0].block == b) {
                let node = &self.nodes[n.0];
                let inputs : Vec<_> = node.inputs.iter().map(|i| format!("%{}", i.0)).collect();
                let op = match &node.op {
                    Op::Cmp(r) => format!("Cmp[{}]", r),
                    Op::Const(bits) => format!("Const[{:#x}]", bits),
                    Op::Proj(p) => format!("Proj[{}]", p),
                    Op::Address(e) => format!("Address[e{}]", e.index()),
                    Op::Sel(e) => format!("Sel[e{}]", e.index()),
                    Op::MethodSel(e) => format!("MethodSel[e{}]", e.index()),
                    Op::Alloc(t) => format!("Alloc[{}]", t),
                    Op::InstanceOf(t) => format!("InstanceOf[{}]", t),
                    Op::Load(m) => format!("Load[{}]", m),
                    other => format!("{:?}", other),
                };
                let pin = if node.op.is_pinned_cf() { " !" } else { "" };
                writeln!(f, "    %{} = {} {} ({}){}", n.0, op, node.mode, inputs.join(", "), pin)?;
            }
        }
        if !self.keep_alives.is_empty() {
            let keeps : Vec<_> = self.keep_alives.iter().map(|k| format!("%{}", k.0)).collect();
            writeln!(f, "  keep [{}]", keeps.join(", "))?;
        }
        writeln!(f, "}}")
    }
}

#[test]
fn test_bad_is_shared() {
    let mut g = Graph::new("g");
    let a = g.bad(Mode::Long);
    let b = g.bad(Mode::Long);
    let c = g.bad(Mode::Double);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(g.is_bad(c));
}

#[test]
fn test_exchange_and_normalize() {
    let mut g = Graph::new("g");
    let s = g.start_block();
    let one = g.const_int(1);
    let two = g.const_int(2);
    let sum = g.add(s, Op::Add, Mode::Int, vec![one, one]);
    g.exchange(one, two);
    assert_eq!(g.skip_id(g.node(sum).inputs[0]), two);
    g.normalize();
    assert_eq!(g.node(sum).inputs, vec![two, two]);
    assert!(g.nodes().all(|n| n != one));
}

#[test]
fn test_remove_unreachable() {
    let mut g = Graph::new("g");
    let s = g.start_block();
    let live = g.new_block();
    let dead = g.new_block();
    g.block_mut(dead).pc = Some(7);
    let j = g.add(s, Op::Jmp, Mode::Control, vec![]);
    g.add_pred(live, j);
    let k = g.add(dead, Op::Jmp, Mode::Control, vec![]);
    g.add_pred(live, k);
    let x = g.const_int(0);
    let y = g.const_int(1);
    let phi = g.add(live, Op::Phi, Mode::Int, vec![x, y]);

    assert_eq!(g.remove_unreachable(), vec![7]);
    assert_eq!(g.block(live).preds, vec![j]);
    assert_eq!(g.node(phi).inputs, vec![x]);
    assert!(g.blocks().all(|b| b != dead));
}

#[test]
fn test_normalize_collapses_pruned_phis() {
    let mut g = Graph::new("g");
    let s = g.start_block();
    let live = g.new_block();
    let dead = g.new_block();
    let j = g.add(s, Op::Jmp, Mode::Control, vec![]);
    g.add_pred(live, j);
    let k = g.add(dead, Op::Jmp, Mode::Control, vec![]);
    g.add_pred(live, k);
    let x = g.const_int(0);
    let y = g.const_int(1);
    let phi = g.add(live, Op::Phi, Mode::Int, vec![x, y]);
    // a second phi that merges the first with itself
    let loop_phi = g.add(live, Op::Phi, Mode::Int, vec![phi, phi]);
    let sum = g.add(live, Op::Add, Mode::Int, vec![phi, loop_phi]);

    g.remove_unreachable();
    g.normalize();
    assert_eq!(g.node(sum).inputs, vec![x, x]);
    assert!(g.nodes().all(|n| n != phi && n != loop_phi));
}
