//! On-the-fly SSA construction over numbered variables.
//!
//! Every block remembers the last definition of each variable made in it. A
//! read that finds nothing locally asks the predecessors, placing a Phi where
//! several of them meet. Blocks whose predecessor list may still grow are
//! *immature*: reads there get an operandless Phi that is completed when the
//! block is matured. Phis that turn out to merge a single value are replaced
//! by that value.

use std::collections::HashSet;

use crate::ir::{BlockId, Graph, Mode, NodeId, Op};

#[derive(Default, Clone, Debug)]
struct BlockState {
    values : Vec<Option<NodeId>>,
    matured : bool,
    incomplete : Vec<(usize, NodeId)>,
}

#[derive(Debug)]
pub struct Builder {
    graph : Graph,
    n_vars : usize,
    states : Vec<BlockState>,
    cur : Option<BlockId>,
}

impl Builder {
    /// `n_vars` counts the data variables; one more, for memory, is added.
    pub fn new(mut graph : Graph, n_vars : usize) -> Self {
        let start = graph.start_block();
        let mem = graph.initial_mem();
        let mut b = Self { graph, n_vars, states : Vec::new(), cur : Some(start) };
        b.state(start).matured = true;
        b.set_store(mem);
        b
    }

    pub fn graph(&self) -> &Graph { &self.graph }
    pub fn graph_mut(&mut self) -> &mut Graph { &mut self.graph }
    pub fn finish(self) -> Graph { self.graph }

    fn state(&mut self, block : BlockId) -> &mut BlockState {
        let n = self.n_vars + 1;
        while self.states.len() <= block.index() {
            self.states.push(BlockState { values : vec![None ; n], ..BlockState::default() });
        }
        &mut self.states[block.index()]
    }

    fn memory_var(&self) -> usize { self.n_vars }

    pub fn new_imm_block(&mut self) -> BlockId {
        let b = self.graph.new_block();
        self.state(b);
        b
    }

    pub fn is_matured(&self, block : BlockId) -> bool {
        self.states.get(block.index()).map_or(false, |s| s.matured)
    }

    pub fn cur_block(&self) -> Option<BlockId> { self.cur }

    /// `None` marks the code that follows as unreachable until the next block starts.
    pub fn set_cur_block(&mut self, block : Option<BlockId>) { self.cur = block; }

    fn block(&self) -> BlockId {
        self.cur.unwrap_or_else(|| self.graph.start_block())
    }

    /// Adds a node to the current block.
    pub fn node(&mut self, op : Op, mode : Mode, inputs : Vec<NodeId>) -> NodeId {
        let block = self.block();
        self.graph.add(block, op, mode, inputs)
    }

    pub fn proj(&mut self, of : NodeId, mode : Mode, num : u32) -> NodeId {
        self.graph.proj(of, mode, num)
    }

    pub fn set_value(&mut self, var : usize, value : NodeId) {
        let block = self.block();
        self.state(block).values[var] = Some(value);
    }

    pub fn get_value(&mut self, var : usize, mode : Mode) -> NodeId {
        let block = self.block();
        self.read(var, block, mode)
    }

    pub fn set_store(&mut self, mem : NodeId) {
        let var = self.memory_var();
        self.set_value(var, mem);
    }

    pub fn get_store(&mut self) -> NodeId {
        let var = self.memory_var();
        self.get_value(var, Mode::Memory)
    }

    /// The mode of whatever `var` holds in the current block, looking through
    /// predecessors if it is not defined locally.
    pub fn guess_mode(&mut self, var : usize) -> Option<Mode> {
        let mut seen = HashSet::new();
        let mut work = vec![self.block()];
        while let Some(b) = work.pop() {
            if !seen.insert(b) {
                continue;
            }
            if let Some(v) = self.state(b).values[var] {
                let v = self.graph.skip_id(v);
                return Some(self.graph.node(v).mode);
            }
            let preds = self.graph.block(b).preds.clone();
            work.extend(preds.into_iter().map(|p| self.graph.pred_block(p)));
        }
        None
    }

    fn read(&mut self, var : usize, block : BlockId, mode : Mode) -> NodeId {
        match self.state(block).values[var] {
            Some(v) => self.graph.skip_id(v),
            None => self.read_recursive(var, block, mode),
        }
    }

    fn read_recursive(&mut self, var : usize, block : BlockId, mode : Mode) -> NodeId {
        let val = if !self.is_matured(block) {
            let phi = self.graph.add(block, Op::Phi, mode, vec![]);
            self.state(block).incomplete.push((var, phi));
            phi
        } else {
            let preds = self.graph.block(block).preds.clone();
            match preds.as_slice() {
                [] => self.graph.add(block, Op::Unknown, mode, vec![]),
                [only] => {
                    let pb = self.graph.pred_block(*only);
                    self.read(var, pb, mode)
                },
                _ => {
                    // break cycles through loops before visiting the predecessors
                    let phi = self.graph.add(block, Op::Phi, mode, vec![]);
                    self.state(block).values[var] = Some(phi);
                    self.add_phi_operands(var, phi)
                },
            }
        };
        self.state(block).values[var] = Some(val);
        val
    }

    fn add_phi_operands(&mut self, var : usize, phi : NodeId) -> NodeId {
        let block = self.graph.node(phi).block;
        let mode = self.graph.node(phi).mode;
        let preds = self.graph.block(block).preds.clone();
        let inputs = preds
            .into_iter()
            .map(|p| {
                let pb = self.graph.pred_block(p);
                self.read(var, pb, mode)
            })
            .collect();
        self.graph.node_mut(phi).inputs = inputs;
        self.try_remove_trivial_phi(phi)
    }

    fn try_remove_trivial_phi(&mut self, phi : NodeId) -> NodeId {
        let mut same = None;
        for &op in &self.graph.node(phi).inputs {
            let op = self.graph.skip_id(op);
            if Some(op) == same || op == phi {
                continue;
            }
            if same.is_some() {
                return phi;
            }
            same = Some(op);
        }
        let same = match same {
            Some(s) => s,
            None => {
                let node = self.graph.node(phi);
                let (block, mode) = (node.block, node.mode);
                self.graph.add(block, Op::Unknown, mode, vec![])
            },
        };
        self.graph.exchange(phi, same);
        same
    }

    /// Declares that `block` will get no further predecessors.
    pub fn mature(&mut self, block : BlockId) {
        if self.is_matured(block) {
            return;
        }
        let incomplete = std::mem::take(&mut self.state(block).incomplete);
        for (var, phi) in incomplete {
            self.add_phi_operands(var, phi);
        }
        self.state(block).matured = true;
    }

    pub fn add_pred(&mut self, block : BlockId, pred : NodeId) {
        self.graph.add_pred(block, pred);
    }
}

#[cfg(test)]
fn diamond() -> (Builder, BlockId, BlockId, BlockId) {
    let mut b = Builder::new(Graph::new("diamond"), 2);
    let start = b.graph().start_block();
    let left = b.new_imm_block();
    let right = b.new_imm_block();
    let join = b.new_imm_block();

    let c = b.graph_mut().const_int(1);
    let cmp = b.node(Op::Cmp(crate::ir::Relation::EQUAL), Mode::Bool, vec![c, c]);
    let cond = b.node(Op::Cond, Mode::Tuple, vec![cmp]);
    let t = b.proj(cond, Mode::Control, crate::ir::pn::COND_TRUE);
    let f = b.proj(cond, Mode::Control, crate::ir::pn::COND_FALSE);
    b.add_pred(left, t);
    b.add_pred(right, f);
    b.mature(left);
    b.mature(right);
    let _ = start;
    (b, left, right, join)
}

#[test]
fn test_phi_at_join() {
    let (mut b, left, right, join) = diamond();
    let one = b.graph_mut().const_int(1);
    let two = b.graph_mut().const_int(2);

    b.set_cur_block(Some(left));
    b.set_value(0, one);
    let j1 = b.node(Op::Jmp, Mode::Control, vec![]);
    b.set_cur_block(Some(right));
    b.set_value(0, two);
    let j2 = b.node(Op::Jmp, Mode::Control, vec![]);
    b.add_pred(join, j1);
    b.add_pred(join, j2);
    b.mature(join);

    b.set_cur_block(Some(join));
    let v = b.get_value(0, Mode::Int);
    assert_eq!(b.graph().node(v).op, Op::Phi);
    assert_eq!(b.graph().node(v).inputs, vec![one, two]);
}

#[test]
fn test_trivial_phi_removed() {
    let (mut b, left, right, join) = diamond();
    let one = b.graph_mut().const_int(1);
    b.set_cur_block(Some(b.graph().start_block()));
    b.set_value(1, one);

    // the join is read before it is matured, which leaves a placeholder Phi
    b.set_cur_block(Some(join));
    let early = b.get_value(1, Mode::Int);
    assert_eq!(b.graph().node(early).op, Op::Phi);

    b.set_cur_block(Some(left));
    let j1 = b.node(Op::Jmp, Mode::Control, vec![]);
    b.set_cur_block(Some(right));
    let j2 = b.node(Op::Jmp, Mode::Control, vec![]);
    b.add_pred(join, j1);
    b.add_pred(join, j2);
    b.mature(join);

    assert_eq!(b.graph().skip_id(early), one);
    b.set_cur_block(Some(join));
    assert_eq!(b.get_value(1, Mode::Int), one);
}

#[test]
fn test_guess_mode() {
    let (mut b, left, _, _) = diamond();
    let l = b.graph_mut().constant(Mode::Long, 5);
    b.set_cur_block(Some(b.graph().start_block()));
    b.set_value(0, l);
    b.set_cur_block(Some(left));
    assert_eq!(b.guess_mode(0), Some(Mode::Long));
    assert_eq!(b.guess_mode(1), None);
}
