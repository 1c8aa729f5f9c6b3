//! Object-model lowering: vtable layout, and the rewriting of the
//! object-oriented graph nodes into loads, stores and runtime calls.

use log::debug;

use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::gcj::*;
use crate::ir::{pn, Graph, Mode, NodeId, Op};
use crate::program::*;

/// Assigns vtable slots to the methods of `id` and builds its vtable
/// initializer on top of the superclass's. `trap` fills the slots of abstract
/// methods. Superclasses must have been set up already.
pub fn setup_vtable(program : &mut Program, id : TypeId, trap : EntityId) {
    let class = program.class(id);
    let vtable = match (class.is_interface(), class.vtable) {
        (false, Some(v)) => v,
        _ => return,
    };
    let rtti = class.rtti;
    let members = class.members.clone();

    let (mut size, mut entries) = match class.superclass.map(|s| program.class(s)) {
        Some(sup) => {
            let inherited = match sup.vtable.and_then(|v| program.entity(v).initializer.as_ref()) {
                Some(Initializer::Compound(v)) => v.clone(),
                _ => Vec::new(),
            };
            (sup.vtable_size, inherited)
        },
        None => (VTABLE_HEADER_SLOTS, Vec::new()),
    };

    for e in members {
        let (slot, abstract_) = match program.method(e) {
            Some(m) if !m.exclude_from_vtable => {
                let inherited = m.overwrites.iter().find_map(|&o| program.method(o).and_then(|om| om.vtable_slot));
                let slot = inherited.unwrap_or_else(|| {
                    size += 1;
                    size - 1
                });
                (slot, m.is_abstract)
            },
            _ => continue,
        };
        if let Some(m) = program.method_mut(e) {
            m.vtable_slot = Some(slot);
        }
        let slot = slot as usize;
        if entries.len() <= slot {
            entries.resize(slot + 1, Initializer::Null);
        }
        entries[slot] = Initializer::Address(if abstract_ { trap } else { e });
    }

    entries.resize(size as usize, Initializer::Null);
    entries[0] = rtti.map_or(Initializer::Null, Initializer::Address);
    entries[1] = Initializer::Null;

    program.entity_mut(vtable).initializer = Some(Initializer::Compound(entries));
    let class = program.class_mut(id);
    class.vtable_size = size;
    debug!("vtable of {}: {} slots", class.name, size);
}

/// Extern classes are only referenced: their vtables are defined elsewhere.
pub fn remove_extern_vtables(program : &mut Program) {
    let externs : Vec<_> = program.classes().filter(|&c| program.class(c).is_extern).collect();
    for c in externs {
        if let Some(v) = program.class(c).vtable {
            let vtable = program.entity_mut(v);
            vtable.initializer = None;
            vtable.visibility = Visibility::External;
        }
    }
}

/// Everything the node rewriting needs besides the graph.
pub struct Lowering<'a> {
    pub program : &'a mut Program,
    pub runtime : &'a mut RuntimeEntities,
    pub strings : &'a mut StringPool,
    pub flavor : Runtime,
}

fn projections(g : &Graph, n : NodeId) -> Vec<(NodeId, u32)> {
    g.nodes()
        .filter_map(|p| match g.node(p).op {
            Op::Proj(num) if g.node(p).inputs.first() == Some(&n) => Some((p, num)),
            _ => None,
        })
        .collect()
}

/// Redirects the memory and result projections of the tuple `old` to `mem`
/// and `result`.
fn replace_tuple(g : &mut Graph, old : NodeId, mem : NodeId, result : NodeId) {
    for (p, num) in projections(g, old) {
        match num {
            pn::M => g.exchange(p, mem),
            _ => g.exchange(p, result),
        }
    }
}

/// Points the memory input of calls through `callee` at `mem`.
fn rethread_calls(g : &mut Graph, callee : NodeId, mem : NodeId) {
    let calls : Vec<_> = g.nodes()
        .filter(|&c| g.node(c).op == Op::Call && g.node(c).inputs.get(1).map(|&i| g.skip_id(i)) == Some(callee))
        .collect();
    for c in calls {
        g.node_mut(c).inputs[0] = mem;
    }
}

impl Lowering<'_> {
    fn runtime_address(&mut self, g : &mut Graph, f : RuntimeFn) -> NodeId {
        let e = self.runtime.function(self.program, f);
        g.address(e)
    }

    /// A memory-threading node in the block of `at`; returns the node and its
    /// memory and result projections.
    fn tuple(&self, g : &mut Graph, at : NodeId, op : Op, inputs : Vec<NodeId>, result : Mode) -> (NodeId, NodeId, NodeId) {
        let block = g.node(at).block;
        let t = g.add(block, op, Mode::Tuple, inputs);
        let mem = g.proj(t, Mode::Memory, pn::M);
        let res = g.proj(t, result, pn::RES);
        (t, mem, res)
    }

    fn store(&self, g : &mut Graph, at : NodeId, mem : NodeId, addr : NodeId, value : NodeId) -> NodeId {
        let block = g.node(at).block;
        let st = g.add(block, Op::Store, Mode::Tuple, vec![mem, addr, value]);
        g.proj(st, Mode::Memory, pn::M)
    }

    fn call(&mut self, g : &mut Graph, at : NodeId, mem : NodeId, f : RuntimeFn, args : Vec<NodeId>, result : Mode) -> (NodeId, NodeId, NodeId) {
        let callee = self.runtime_address(g, f);
        let mut inputs = vec![mem, callee];
        inputs.extend(args);
        self.tuple(g, at, Op::Call, inputs, result)
    }

    fn rtti_of(&mut self, ty : &TypeRef) -> Result<EntityId> {
        match ty {
            TypeRef::Class(id) => {
                let class = self.program.class(*id);
                class.rtti.ok_or_else(|| Error::ClassNotFound(class.name.clone()))
            },
            TypeRef::Prim(t) => Ok(self.runtime.primitive_class(self.program, *t)),
            TypeRef::Array(_) => Err(Error::Unsupported { pc : 0, what : format!("class object of array type {}", ty) }),
        }
    }

    fn object_vtable(&self) -> Option<EntityId> {
        self.program
            .classes()
            .map(|c| self.program.class(c))
            .find(|c| c.name == crate::loader::OBJECT_CLASS)
            .and_then(|c| c.vtable)
    }

    fn lower_alloc(&mut self, g : &mut Graph, n : NodeId, ty : &TypeRef) -> Result<()> {
        let (mem, count) = (g.node(n).inputs[0], g.node(n).inputs[1]);
        let (t, mem, obj) = match (self.flavor, ty) {
            (Runtime::SimpleRt, TypeRef::Class(id)) => {
                let class = self.program.class(*id);
                let (size, vtable) = (class.size, class.vtable);
                let one = g.constant(Mode::Unsigned, 1);
                let size = g.constant(Mode::Unsigned, u64::from(size));
                let (t, mem, obj) = self.call(g, n, mem, RuntimeFn::Calloc, vec![one, size], Mode::Reference);
                let mem = self.store_vptr(g, n, mem, obj, vtable);
                (t, mem, obj)
            },
            (Runtime::SimpleRt, TypeRef::Array(elem)) => {
                let one = g.constant(Mode::Unsigned, 1);
                let elem_size = g.constant(Mode::Unsigned, u64::from(elem.size()));
                let header = g.constant(Mode::Unsigned, u64::from(ARRAY_DATA_OFFSET));
                let block = g.node(n).block;
                let data = g.add(block, Op::Mul, Mode::Unsigned, vec![count, elem_size]);
                let total = g.add(block, Op::Add, Mode::Unsigned, vec![data, header]);
                let (t, mem, obj) = self.call(g, n, mem, RuntimeFn::Calloc, vec![one, total], Mode::Reference);
                let vtable = self.object_vtable();
                let mem = self.store_vptr(g, n, mem, obj, vtable);
                let offset = g.const_int(ARRAY_LENGTH_OFFSET as i32);
                let at = g.add(block, Op::Add, Mode::Reference, vec![obj, offset]);
                let len = g.add(block, Op::Conv, Mode::Int, vec![count]);
                let mem = self.store(g, n, mem, at, len);
                (t, mem, obj)
            },
            (Runtime::Gcj, TypeRef::Class(_)) => {
                let rtti = self.rtti_of(ty)?;
                let class = g.address(rtti);
                self.call(g, n, mem, RuntimeFn::AllocObject, vec![class], Mode::Reference)
            },
            (Runtime::Gcj, TypeRef::Array(elem)) => {
                let block = g.node(n).block;
                let count = g.add(block, Op::Conv, Mode::Int, vec![count]);
                let rtti = self.rtti_of(elem)?;
                let class = g.address(rtti);
                match **elem {
                    TypeRef::Prim(_) => self.call(g, n, mem, RuntimeFn::NewPrimArray, vec![class, count], Mode::Reference),
                    _ => {
                        let null = g.null();
                        self.call(g, n, mem, RuntimeFn::NewObjectArray, vec![count, class, null], Mode::Reference)
                    },
                }
            },
            (_, TypeRef::Prim(t)) => {
                return Err(Error::Unsupported { pc : 0, what : format!("allocation of primitive type {:?}", t) });
            },
        };
        replace_tuple(g, n, mem, obj);
        g.exchange(n, t);
        Ok(())
    }

    fn store_vptr(&mut self, g : &mut Graph, at : NodeId, mem : NodeId, obj : NodeId, vtable : Option<EntityId>) -> NodeId {
        match vtable {
            Some(v) => {
                let vt = g.address(v);
                self.store(g, at, mem, obj, vt)
            },
            None => mem,
        }
    }

    fn lower_method_sel(&mut self, g : &mut Graph, n : NodeId, e : EntityId) -> Result<()> {
        let (mem, receiver) = (g.node(n).inputs[0], g.node(n).inputs[1]);
        let entity = self.program.entity(e);
        let m = entity.method().ok_or_else(|| Error::Unsupported { pc : 0, what : format!("call of non-method {}", entity.name) })?;
        let (name, descriptor) = (entity.name.clone(), m.descriptor.clone());
        let (binding, slot, implementation) = (m.binding, m.vtable_slot, m.implementation);
        let block = g.node(n).block;

        let target = match (binding, slot) {
            (Binding::Interface, _) => {
                let (_, mem, vt) = self.tuple(g, n, Op::Load(Mode::Reference), vec![mem, receiver], Mode::Reference);
                let (_, mem, class) = self.tuple(g, n, Op::Load(Mode::Reference), vec![mem, vt], Mode::Reference);
                let name = self.strings.utf8_const(self.program, name.as_bytes());
                let descriptor = self.strings.utf8_const(self.program, descriptor.as_bytes());
                let (name, descriptor) = (g.address(name), g.address(descriptor));
                let (_, mem, fp) = self.call(g, n, mem, RuntimeFn::LookupInterfaceMethod, vec![class, name, descriptor], Mode::Reference);
                rethread_calls(g, n, mem);
                fp
            },
            (Binding::Dynamic, Some(slot)) => {
                let (_, mem, vt) = self.tuple(g, n, Op::Load(Mode::Reference), vec![mem, receiver], Mode::Reference);
                let offset = g.const_int((slot * POINTER_SIZE) as i32);
                let at = g.add(block, Op::Add, Mode::Reference, vec![vt, offset]);
                let (_, mem, fp) = self.tuple(g, n, Op::Load(Mode::Reference), vec![mem, at], Mode::Reference);
                rethread_calls(g, n, mem);
                fp
            },
            _ => g.address(implementation.unwrap_or(e)),
        };
        g.exchange(n, target);
        Ok(())
    }

    fn lower_graph(&mut self, g : &mut Graph) -> Result<()> {
        let nodes = g.find_nodes(|op| matches!(op,
            Op::Alloc(_) | Op::MethodSel(_) | Op::Arraylength | Op::InstanceOf(_) | Op::Sel(_)));
        for n in nodes {
            let block = g.node(n).block;
            match g.node(n).op.clone() {
                Op::Sel(field) => {
                    let offset = self.program.entity(field).field().and_then(|f| f.offset).ok_or_else(|| {
                        Error::Unsupported { pc : 0, what : format!("instance access to {}", self.program.entity(field).name) }
                    })?;
                    let c = g.const_int(offset as i32);
                    let node = g.node_mut(n);
                    node.op = Op::Add;
                    node.inputs.push(c);
                },
                Op::Arraylength => {
                    let (mem, array) = (g.node(n).inputs[0], g.node(n).inputs[1]);
                    let c = g.const_int(ARRAY_LENGTH_OFFSET as i32);
                    let at = g.add(block, Op::Add, Mode::Reference, vec![array, c]);
                    let node = g.node_mut(n);
                    node.op = Op::Load(Mode::Int);
                    node.inputs = vec![mem, at];
                },
                Op::InstanceOf(ty) => {
                    let (mem, obj) = (g.node(n).inputs[0], g.node(n).inputs[1]);
                    let rtti = self.rtti_of(&ty)?;
                    let class = g.address(rtti);
                    let callee = self.runtime_address(g, RuntimeFn::IsInstanceOf);
                    let node = g.node_mut(n);
                    node.op = Op::Call;
                    node.inputs = vec![mem, callee, obj, class];
                },
                Op::Alloc(ty) => self.lower_alloc(g, n, &ty)?,
                Op::MethodSel(e) => self.lower_method_sel(g, n, e)?,
                _ => {},
            }
        }
        g.normalize();
        Ok(())
    }

    /// Rewrites the graphs of every method.
    pub fn lower_program(&mut self) -> Result<()> {
        let methods : Vec<_> = self.program.entities().collect();
        for e in methods {
            let graph = self.program.method_mut(e).and_then(|m| m.graph.take());
            if let Some(mut g) = graph {
                self.lower_graph(&mut g)?;
                debug!("lowered {}", g.name);
                if let Some(m) = self.program.method_mut(e) {
                    m.graph = Some(g);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
fn method(program : &mut Program, owner : TypeId, name : &str, overwrites : Vec<EntityId>, is_abstract : bool) -> EntityId {
    use crate::classfile::AccessFlags;
    use crate::descriptor::MethodDescriptor;
    let m = Method {
        descriptor : "()V".to_owned(),
        signature : MethodDescriptor { params : vec![], ret : None },
        flags : AccessFlags::PUBLIC,
        overwrites,
        vtable_slot : None,
        binding : Binding::Dynamic,
        exclude_from_vtable : false,
        is_abstract,
        is_final : false,
        implementation : None,
        graph : None,
    };
    program.add_member(owner, Entity {
        name : name.to_owned(),
        ld_name : name.to_owned(),
        owner : None,
        kind : EntityKind::Method(m),
        visibility : Visibility::Local,
        initializer : None,
    })
}

#[cfg(test)]
fn class_with_vtable(program : &mut Program, name : &str, superclass : Option<TypeId>) -> TypeId {
    let id = program.new_class(name);
    let vt = program.new_entity(global(format!("_ZTV{}", name), EntityKind::Data, Visibility::Local, None));
    let class = program.class_mut(id);
    class.vtable = Some(vt);
    class.superclass = superclass;
    id
}

#[cfg(test)]
fn vtable_entries(program : &Program, id : TypeId) -> Vec<Initializer> {
    let vt = program.class(id).vtable.and_then(|v| program.entity(v).initializer.clone());
    match vt {
        Some(Initializer::Compound(v)) => v,
        other => panic!("no vtable initializer: {:?}", other),
    }
}

#[test]
fn test_vtable_inheritance() {
    let mut p = Program::new();
    let trap = p.new_entity(global("trap".to_owned(), EntityKind::Data, Visibility::External, None));
    let base = class_with_vtable(&mut p, "Base", None);
    let a = method(&mut p, base, "a", vec![], false);
    let b = method(&mut p, base, "b", vec![], true);
    setup_vtable(&mut p, base, trap);
    assert_eq!(p.method(a).and_then(|m| m.vtable_slot), Some(2));
    assert_eq!(p.method(b).and_then(|m| m.vtable_slot), Some(3));

    let sub = class_with_vtable(&mut p, "Sub", Some(base));
    let c = method(&mut p, sub, "c", vec![], false);
    let b2 = method(&mut p, sub, "b", vec![b], false);
    setup_vtable(&mut p, sub, trap);
    assert_eq!(p.method(b2).and_then(|m| m.vtable_slot), Some(3));
    assert_eq!(p.method(c).and_then(|m| m.vtable_slot), Some(4));
    assert_eq!(p.class(sub).vtable_size, 5);

    let base_vt = vtable_entries(&p, base);
    assert_eq!(base_vt[3], Initializer::Address(trap));
    let sub_vt = vtable_entries(&p, sub);
    assert_eq!(sub_vt.len(), 5);
    assert_eq!(sub_vt[2], Initializer::Address(a));
    assert_eq!(sub_vt[3], Initializer::Address(b2));
    assert_eq!(sub_vt[4], Initializer::Address(c));
}

#[test]
fn test_extern_vtable_removed() {
    let mut p = Program::new();
    let trap = p.new_entity(global("trap".to_owned(), EntityKind::Data, Visibility::External, None));
    let c = class_with_vtable(&mut p, "Ext", None);
    p.class_mut(c).is_extern = true;
    setup_vtable(&mut p, c, trap);
    remove_extern_vtables(&mut p);
    let vt = p.class(c).vtable.map(|v| p.entity(v));
    assert!(vt.map_or(false, |v| v.initializer.is_none() && v.visibility == Visibility::External));
}

#[cfg(test)]
fn lowered(flavor : Runtime, build : impl Fn(&mut Program, &mut Graph) -> NodeId) -> (Program, Graph, NodeId) {
    let mut program = Program::new();
    let mut runtime = RuntimeEntities::new();
    let mut strings = StringPool::new();
    let mut g = Graph::new("test");
    let n = build(&mut program, &mut g);
    let mut l = Lowering { program : &mut program, runtime : &mut runtime, strings : &mut strings, flavor };
    l.lower_graph(&mut g).expect("lowering failed");
    (program, g, n)
}

#[test]
fn test_dynamic_call_loads_slot() {
    let (_, g, _) = lowered(Runtime::SimpleRt, |p, g| {
        let c = class_with_vtable(p, "C", None);
        let m = method(p, c, "m", vec![], false);
        if let Some(m) = p.method_mut(m) { m.vtable_slot = Some(3); }
        let start = g.start_block();
        let mem = g.initial_mem();
        let this = g.arg(0, Mode::Reference);
        let sel = g.add(start, Op::MethodSel(m), Mode::Reference, vec![mem, this]);
        g.add(start, Op::Call, Mode::Tuple, vec![mem, sel, this])
    });
    assert!(g.find_nodes(|op| matches!(op, Op::MethodSel(_))).is_empty());
    assert_eq!(g.find_nodes(|op| *op == Op::Load(Mode::Reference)).len(), 2);
    assert_eq!(g.find_nodes(|op| *op == Op::Const(12)).len(), 1);
    // the call now depends on the vtable loads
    let call = g.find_nodes(|op| *op == Op::Call)[0];
    let mem = g.node(call).inputs[0];
    assert_eq!(g.node(mem).op, Op::Proj(pn::M));
    assert_eq!(g.node(g.node(mem).inputs[0]).op, Op::Load(Mode::Reference));
}

#[test]
fn test_interface_call_looks_up_method() {
    let (p, g, _) = lowered(Runtime::SimpleRt, |p, g| {
        let i = p.new_class("I");
        let m = method(p, i, "run", vec![], true);
        if let Some(m) = p.method_mut(m) { m.binding = Binding::Interface; }
        let start = g.start_block();
        let mem = g.initial_mem();
        let this = g.arg(0, Mode::Reference);
        let sel = g.add(start, Op::MethodSel(m), Mode::Reference, vec![mem, this]);
        g.add(start, Op::Call, Mode::Tuple, vec![mem, sel, this])
    });
    let calls = g.find_nodes(|op| *op == Op::Call);
    assert_eq!(calls.len(), 2);
    let callees : Vec<_> = calls.iter()
        .filter_map(|&c| match g.node(g.node(c).inputs[1]).op {
            Op::Address(e) => Some(p.entity(e).ld_name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(callees, vec!["_Jv_LookupInterfaceMethod".to_owned()]);
}

#[test]
fn test_object_allocation() {
    let (p, g, alloc) = lowered(Runtime::SimpleRt, |p, g| {
        let c = class_with_vtable(p, "C", None);
        p.class_mut(c).size = 12;
        let start = g.start_block();
        let mem = g.initial_mem();
        let one = g.constant(Mode::Unsigned, 1);
        let a = g.add(start, Op::Alloc(TypeRef::Class(c)), Mode::Tuple, vec![mem, one]);
        let m = g.proj(a, Mode::Memory, pn::M);
        let _obj = g.proj(a, Mode::Reference, pn::RES);
        let ret = g.add(start, Op::Return, Mode::Control, vec![m]);
        let end = g.end_block();
        g.add_pred(end, ret);
        a
    });
    assert_eq!(g.node(alloc).op, Op::Id);
    let call = g.find_nodes(|op| *op == Op::Call)[0];
    match g.node(g.node(call).inputs[1]).op {
        Op::Address(e) => assert_eq!(p.entity(e).ld_name, "calloc"),
        ref op => panic!("unexpected callee {:?}", op),
    }
    assert_eq!(g.node(g.node(call).inputs[3]).op, Op::Const(12));
    // the method returns the memory of the vptr store
    let ret = g.find_nodes(|op| *op == Op::Return)[0];
    let mem = g.node(ret).inputs[0];
    assert_eq!(g.node(g.node(mem).inputs[0]).op, Op::Store);
}

#[test]
fn test_gcj_array_allocation() {
    use crate::jvmtypes::JType;
    let (p, g, _) = lowered(Runtime::Gcj, |_, g| {
        let start = g.start_block();
        let mem = g.initial_mem();
        let n = g.constant(Mode::Unsigned, 10);
        g.add(start, Op::Alloc(TypeRef::Array(Box::new(TypeRef::Prim(JType::Int)))), Mode::Tuple, vec![mem, n])
    });
    let call = g.find_nodes(|op| *op == Op::Call)[0];
    let names : Vec<_> = g.node(call).inputs.iter()
        .filter_map(|&i| match g.node(i).op {
            Op::Address(e) => Some(p.entity(e).ld_name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["_Jv_NewPrimArray".to_owned(), "_Jv_intClass".to_owned()]);
}
