use crate::error::{Error, Result};
use crate::ir::{Mode, NodeId, Op};
use crate::ssa::Builder;

#[cfg(test)]
use quickcheck::{quickcheck, TestResult};

/// Symbolic operand stack and local-variable array.
///
/// Stack slot `i` and local `n` are SSA variables `i` and `max_stack + n` of
/// the builder, so values flow between blocks through the usual Phi
/// construction. A long or double takes two slots: the lower one holds a
/// `Bad` placeholder of the same mode and the upper one the value.
#[derive(Clone, Debug)]
pub struct Manager {
    // stack sizes are inherently constrained by JVM to be 16-bit
    max_stack : u16,
    max_locals : u16,
    count : u16,
    pc : usize,
}

impl Manager {
    pub fn new(max_stack : u16, max_locals : u16) -> Self {
        Self { max_stack, max_locals, count : 0, pc : 0 }
    }

    /// Number of SSA variables the builder needs for this frame.
    pub fn n_vars(&self) -> usize {
        usize::from(self.max_stack) + usize::from(self.max_locals)
    }

    /// Records the bytecode address used in error reports.
    pub fn at(&mut self, pc : usize) { self.pc = pc; }

    pub fn depth(&self) -> u16 { self.count }
    pub fn set_depth(&mut self, depth : u16) { self.count = depth; }

    fn reserve(&mut self, n : u16) -> Result<u16> {
        if u32::from(self.count) + u32::from(n) > u32::from(self.max_stack) {
            return Err(Error::StackOverflow { pc : self.pc });
        }
        let at = self.count;
        self.count += n;
        Ok(at)
    }

    fn release(&mut self, n : u16) -> Result<u16> {
        if self.count < n {
            return Err(Error::StackUnderflow { pc : self.pc });
        }
        self.count -= n;
        Ok(self.count)
    }

    pub fn push(&mut self, ssa : &mut Builder, value : NodeId) -> Result<()> {
        let mode = ssa.graph().node(value).mode;
        if mode.is_two_slot() {
            let at = self.reserve(2)?;
            let bad = ssa.graph_mut().bad(mode);
            ssa.set_value(usize::from(at), bad);
            ssa.set_value(usize::from(at) + 1, value);
        } else {
            let at = self.reserve(1)?;
            ssa.set_value(usize::from(at), value);
        }
        Ok(())
    }

    /// Pops a value that is to be used as `mode`.
    pub fn pop(&mut self, ssa : &mut Builder, mode : Mode) -> Result<NodeId> {
        let at = usize::from(self.release(1)?);
        let value = ssa.get_value(at, mode);
        if mode.is_two_slot() {
            let below = usize::from(self.release(1)?);
            let placeholder = ssa.get_value(below, mode);
            if !self.is_placeholder(ssa, placeholder) {
                return Err(Error::SlotArity { pc : self.pc });
            }
        } else if ssa.graph().is_bad(value) {
            return Err(Error::SlotArity { pc : self.pc });
        }
        Ok(value)
    }

    // a Phi can stand for a placeholder that only becomes visible once its block matures
    fn is_placeholder(&self, ssa : &Builder, n : NodeId) -> bool {
        let n = ssa.graph().skip_id(n);
        matches!(ssa.graph().node(n).op, Op::Bad | Op::Phi)
    }

    /// Pops one slot whatever it holds, for the untyped stack shuffles.
    pub fn pop_slot(&mut self, ssa : &mut Builder) -> Result<NodeId> {
        let at = usize::from(self.release(1)?);
        let mode = ssa.guess_mode(at).ok_or(Error::Unsupported {
            pc : self.pc,
            what : "stack slot of unknown type".to_owned(),
        })?;
        Ok(ssa.get_value(at, mode))
    }

    pub fn push_slot(&mut self, ssa : &mut Builder, value : NodeId) -> Result<()> {
        let at = self.reserve(1)?;
        ssa.set_value(usize::from(at), value);
        Ok(())
    }

    fn local_var(&self, index : u16, mode : Mode) -> Result<usize> {
        let width = if mode.is_two_slot() { 2 } else { 1 };
        if u32::from(index) + width > u32::from(self.max_locals) {
            return Err(Error::LocalOutOfRange { pc : self.pc, index });
        }
        Ok(usize::from(self.max_stack) + usize::from(index))
    }

    pub fn get_local(&self, ssa : &mut Builder, index : u16, mode : Mode) -> Result<NodeId> {
        let var = self.local_var(index, mode)?;
        Ok(ssa.get_value(var, mode))
    }

    pub fn set_local(&self, ssa : &mut Builder, index : u16, value : NodeId) -> Result<()> {
        let mode = ssa.graph().node(value).mode;
        let var = self.local_var(index, mode)?;
        ssa.set_value(var, value);
        if mode.is_two_slot() {
            let bad = ssa.graph_mut().bad(mode);
            ssa.set_value(var + 1, bad);
        }
        Ok(())
    }
}

#[cfg(test)]
fn frame(max_stack : u16, max_locals : u16) -> (Manager, Builder) {
    let sm = Manager::new(max_stack, max_locals);
    let ssa = Builder::new(crate::ir::Graph::new("frame"), sm.n_vars());
    (sm, ssa)
}

#[cfg(test)]
quickcheck! {
fn test_push_pop_order(v : Vec<i32>) -> TestResult {
    if v.is_empty() || v.len() > 200 {
        return TestResult::discard();
    }
    let (mut sm, mut ssa) = frame(v.len() as u16, 0);
    let nodes : Vec<_> = v.iter().map(|&x| ssa.graph_mut().const_int(x)).collect();
    for &n in &nodes {
        if sm.push(&mut ssa, n).is_err() {
            return TestResult::failed();
        }
    }
    let popped : Vec<_> = (0..v.len()).filter_map(|_| sm.pop(&mut ssa, Mode::Int).ok()).collect();
    TestResult::from_bool(popped.into_iter().rev().eq(nodes.into_iter()) && sm.depth() == 0)
}
}

#[test]
fn test_underflow() {
    let (mut sm, mut ssa) = frame(4, 0);
    sm.at(17);
    let one = ssa.graph_mut().const_int(1);
    assert!(sm.push(&mut ssa, one).is_ok());
    assert!(sm.pop(&mut ssa, Mode::Int).is_ok());
    assert!(matches!(sm.pop(&mut ssa, Mode::Int), Err(Error::StackUnderflow { pc : 17 })));
}

#[test]
fn test_overflow() -> crate::GeneralResult<()> {
    let (mut sm, mut ssa) = frame(3, 0);
    let one = ssa.graph_mut().const_int(1);
    let wide = ssa.graph_mut().constant(Mode::Long, 1);
    sm.push(&mut ssa, one)?;
    sm.push(&mut ssa, wide)?;
    assert_eq!(sm.depth(), 3);
    assert!(matches!(sm.push(&mut ssa, one), Err(Error::StackOverflow { .. })));
    Ok(())
}

#[test]
fn test_two_slot_values() -> crate::GeneralResult<()> {
    let (mut sm, mut ssa) = frame(4, 0);
    let wide = ssa.graph_mut().constant(Mode::Double, 0);
    sm.push(&mut ssa, wide)?;
    assert_eq!(sm.depth(), 2);
    assert_eq!(sm.pop(&mut ssa, Mode::Double)?, wide);
    assert_eq!(sm.depth(), 0);

    // reading the upper half of a long as an int is an arity error
    let l = ssa.graph_mut().constant(Mode::Long, 0);
    sm.push(&mut ssa, l)?;
    let _ = sm.pop_slot(&mut ssa)?;
    assert!(matches!(sm.pop(&mut ssa, Mode::Int), Err(Error::SlotArity { .. })));

    // two ints do not make a long
    let i = ssa.graph_mut().const_int(0);
    sm.push(&mut ssa, i)?;
    sm.push(&mut ssa, i)?;
    assert!(matches!(sm.pop(&mut ssa, Mode::Long), Err(Error::SlotArity { .. })));
    Ok(())
}

#[test]
fn test_locals() -> crate::GeneralResult<()> {
    let (sm, mut ssa) = frame(0, 3);
    let l = ssa.graph_mut().constant(Mode::Long, 9);
    sm.set_local(&mut ssa, 1, l)?;
    assert_eq!(sm.get_local(&mut ssa, 1, Mode::Long)?, l);
    let v = sm.get_local(&mut ssa, 2, Mode::Int)?;
    assert!(ssa.graph().is_bad(v));
    assert!(matches!(sm.set_local(&mut ssa, 2, l), Err(Error::LocalOutOfRange { index : 2, .. })));
    assert!(sm.get_local(&mut ssa, 3, Mode::Int).is_err());
    Ok(())
}
