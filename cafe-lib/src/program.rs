//! Persistent program model: class types and the global entities (methods,
//! fields, vtables, type descriptors, constant data) emitted for them.
//!
//! Types and entities live in arenas owned by `Program` and are referred to by
//! index, so the resolution caches in the class-file model can hold plain
//! copies of the handles.

use std::fmt;
use std::rc::Rc;

use crate::classfile::{AccessFlags, ClassFile};
use crate::descriptor::{FieldType, MethodDescriptor};
use crate::ir::{Graph, Mode};
use crate::jvmtypes::JType;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

impl TypeId {
    pub fn from_raw(n : usize) -> Self { TypeId(n) }
    pub fn index(self) -> usize { self.0 }
}

impl EntityId {
    pub fn from_raw(n : usize) -> Self { EntityId(n) }
    pub fn index(self) -> usize { self.0 }
}

/// The static type of a Java value. Class and array types are always used
/// through a reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Prim(JType),
    Class(TypeId),
    Array(Box<TypeRef>),
}

impl TypeRef {
    pub fn mode(&self) -> Mode {
        match self {
            TypeRef::Prim(t) => Mode::from(*t),
            _ => Mode::Reference,
        }
    }

    pub fn size(&self) -> u32 {
        self.mode().size()
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeRef::Prim(t) => write!(f, "{:?}", t),
            TypeRef::Class(c) => write!(f, "t{}", c.0),
            TypeRef::Array(e) => write!(f, "{}[]", e),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassState {
    /// Referenced by name; nothing is known about it yet.
    Placeholder,
    Loaded,
    /// Members, layout, vtable and type descriptor exist.
    Finalized,
}

#[derive(Debug)]
pub struct ClassType {
    pub name : String,
    pub class_file : Option<Rc<ClassFile>>,
    pub flags : AccessFlags,
    /// Found through an extern class-path entry: compiled against, never emitted.
    pub is_extern : bool,
    pub state : ClassState,
    pub superclass : Option<TypeId>,
    pub interfaces : Vec<TypeId>,
    pub members : Vec<EntityId>,
    /// The hidden vtable pointer field, shared by every class below java/lang/Object.
    pub vptr : Option<EntityId>,
    pub vtable : Option<EntityId>,
    pub rtti : Option<EntityId>,
    /// Number of vtable slots, the two header slots included.
    pub vtable_size : u32,
    /// Instance size in bytes.
    pub size : u32,
    pub methods_constructed : bool,
}

impl ClassType {
    pub fn new(name : &str) -> Self {
        Self {
            name : name.to_owned(),
            class_file : None,
            flags : AccessFlags::empty(),
            is_extern : false,
            state : ClassState::Placeholder,
            superclass : None,
            interfaces : Vec::new(),
            members : Vec::new(),
            vptr : None,
            vtable : None,
            rtti : None,
            vtable_size : 0,
            size : 0,
            methods_constructed : false,
        }
    }

    pub fn is_interface(&self) -> bool { self.flags.contains(AccessFlags::INTERFACE) }
    pub fn is_abstract(&self) -> bool { self.flags.contains(AccessFlags::ABSTRACT) }
    pub fn is_final(&self) -> bool { self.flags.contains(AccessFlags::FINAL) }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visibility {
    /// Defined here, visible to other objects.
    Local,
    /// Defined here, visible only here.
    Private,
    /// Defined elsewhere.
    External,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    Static,
    Dynamic,
    Interface,
}

#[derive(Debug)]
pub struct Method {
    pub descriptor : String,
    pub signature : MethodDescriptor,
    pub flags : AccessFlags,
    /// Methods of supertypes this one implements.
    pub overwrites : Vec<EntityId>,
    pub vtable_slot : Option<u32>,
    pub binding : Binding,
    pub exclude_from_vtable : bool,
    pub is_abstract : bool,
    pub is_final : bool,
    /// For proxies of inherited interface implementations: the real method.
    pub implementation : Option<EntityId>,
    pub graph : Option<Graph>,
}

impl Method {
    pub fn is_static(&self) -> bool { self.flags.contains(AccessFlags::STATIC) }

    /// Modes of the arguments as passed, the receiver included.
    pub fn param_modes(&self) -> Vec<Mode> {
        let this = if self.is_static() { None } else { Some(Mode::Reference) };
        this.into_iter()
            .chain(self.signature.params.iter().map(FieldType::mode))
            .collect()
    }

    pub fn result_mode(&self) -> Option<Mode> {
        self.signature.ret.as_ref().map(FieldType::mode)
    }
}

#[derive(Debug)]
pub struct Field {
    pub descriptor : String,
    pub ty : FieldType,
    pub flags : AccessFlags,
    /// Byte offset within the instance; `None` for static fields.
    pub offset : Option<u32>,
}

impl Field {
    pub fn is_static(&self) -> bool { self.flags.contains(AccessFlags::STATIC) }
}

#[derive(Debug)]
pub enum EntityKind {
    Method(Method),
    Field(Field),
    /// Compiler-generated data: vtables, descriptors, constant strings.
    Data,
    /// A function of the external runtime.
    Function { params : Vec<Mode>, result : Option<Mode> },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Initializer {
    Null,
    Const { mode : Mode, bits : u64 },
    Address(EntityId),
    Bytes(Vec<u8>),
    Compound(Vec<Initializer>),
}

impl Initializer {
    pub fn int(mode : Mode, v : i64) -> Self {
        Initializer::Const { mode, bits : v as u64 }
    }
}

impl fmt::Display for Initializer {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        match self {
            Initializer::Null => write!(f, "null"),
            Initializer::Const { mode, bits } => write!(f, "{}:{}", mode, *bits as i64),
            Initializer::Address(e) => write!(f, "&e{}", e.0),
            Initializer::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Initializer::Compound(v) => {
                write!(f, "{{ ")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", x)?;
                }
                write!(f, " }}")
            },
        }
    }
}

#[derive(Debug)]
pub struct Entity {
    pub name : String,
    /// Linkage symbol.
    pub ld_name : String,
    /// The class a member belongs to; `None` for global data and runtime functions.
    pub owner : Option<TypeId>,
    pub kind : EntityKind,
    pub visibility : Visibility,
    pub initializer : Option<Initializer>,
}

impl Entity {
    pub fn method(&self) -> Option<&Method> {
        match &self.kind {
            EntityKind::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn method_mut(&mut self) -> Option<&mut Method> {
        match &mut self.kind {
            EntityKind::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn field(&self) -> Option<&Field> {
        match &self.kind {
            EntityKind::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn descriptor(&self) -> Option<&str> {
        match &self.kind {
            EntityKind::Method(m) => Some(&m.descriptor),
            EntityKind::Field(f) => Some(&f.descriptor),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Program {
    classes : Vec<ClassType>,
    entities : Vec<Entity>,
}

impl Program {
    pub fn new() -> Self { Self::default() }

    pub fn new_class(&mut self, name : &str) -> TypeId {
        self.classes.push(ClassType::new(name));
        TypeId(self.classes.len() - 1)
    }

    pub fn class(&self, id : TypeId) -> &ClassType { &self.classes[id.0] }
    pub fn class_mut(&mut self, id : TypeId) -> &mut ClassType { &mut self.classes[id.0] }

    pub fn classes(&self) -> impl Iterator<Item=TypeId> {
        (0..self.classes.len()).map(TypeId)
    }

    pub fn new_entity(&mut self, entity : Entity) -> EntityId {
        self.entities.push(entity);
        EntityId(self.entities.len() - 1)
    }

    pub fn entity(&self, id : EntityId) -> &Entity { &self.entities[id.0] }
    pub fn entity_mut(&mut self, id : EntityId) -> &mut Entity { &mut self.entities[id.0] }

    pub fn entities(&self) -> impl Iterator<Item=EntityId> {
        (0..self.entities.len()).map(EntityId)
    }

    /// Adds `entity` as a member of `owner`.
    pub fn add_member(&mut self, owner : TypeId, entity : Entity) -> EntityId {
        let id = self.new_entity(Entity { owner : Some(owner), ..entity });
        self.classes[owner.0].members.push(id);
        id
    }

    pub fn method(&self, id : EntityId) -> Option<&Method> { self.entity(id).method() }
    pub fn method_mut(&mut self, id : EntityId) -> Option<&mut Method> { self.entity_mut(id).method_mut() }

    /// The superclass chain of `id`, starting with `id` itself.
    pub fn ancestry(&self, id : TypeId) -> Vec<TypeId> {
        let mut chain = vec![id];
        let mut cur = id;
        while let Some(s) = self.classes[cur.0].superclass {
            chain.push(s);
            cur = s;
        }
        chain
    }

    pub fn is_subclass_of(&self, sub : TypeId, sup : TypeId) -> bool {
        self.ancestry(sub).contains(&sup)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        for (i, e) in self.entities.iter().enumerate() {
            let vis = match e.visibility {
                Visibility::Local    => "local",
                Visibility::Private  => "private",
                Visibility::External => "external",
            };
            let kind = match &e.kind {
                EntityKind::Method(m) => match m.vtable_slot {
                    Some(s) => format!("method {} slot {}", m.descriptor, s),
                    None => format!("method {}", m.descriptor),
                },
                EntityKind::Field(fd) => match fd.offset {
                    Some(o) => format!("field {} +{}", fd.descriptor, o),
                    None => format!("field {} static", fd.descriptor),
                },
                EntityKind::Data => "data".to_owned(),
                EntityKind::Function { .. } => "function".to_owned(),
            };
            write!(f, "e{} {} {} ({})", i, vis, e.ld_name, kind)?;
            if let Some(init) = &e.initializer {
                write!(f, " = {}", init)?;
            }
            writeln!(f)?;
        }
        for e in &self.entities {
            if let Some(g) = e.method().and_then(|m| m.graph.as_ref()) {
                writeln!(f)?;
                write!(f, "{}", g)?;
            }
        }
        Ok(())
    }
}

#[test]
fn test_ancestry() {
    let mut p = Program::new();
    let object = p.new_class("java/lang/Object");
    let base = p.new_class("a/Base");
    let derived = p.new_class("a/Derived");
    p.class_mut(base).superclass = Some(object);
    p.class_mut(derived).superclass = Some(base);
    assert_eq!(p.ancestry(derived), vec![derived, base, object]);
    assert!(p.is_subclass_of(derived, object));
    assert!(!p.is_subclass_of(base, derived));
}

#[test]
fn test_param_modes() -> crate::GeneralResult<()> {
    let signature = MethodDescriptor::parse("(ZJ[I)C")?;
    let m = Method {
        descriptor : "(ZJ[I)C".to_owned(),
        signature,
        flags : AccessFlags::PUBLIC,
        overwrites : vec![],
        vtable_slot : None,
        binding : Binding::Dynamic,
        exclude_from_vtable : false,
        is_abstract : false,
        is_final : false,
        implementation : None,
        graph : None,
    };
    assert_eq!(m.param_modes(), vec![Mode::Reference, Mode::Bool, Mode::Long, Mode::Reference]);
    assert_eq!(m.result_mode(), Some(Mode::Char));
    Ok(())
}
