//! Turns loaded class files into program types: members, layout, vtable and
//! class descriptor, and resolves the references method bodies make.

use std::collections::HashSet;
use std::rc::Rc;

use log::{debug, info};

use crate::classfile::{AccessFlags, ClassFile, FieldInfo, Link, MethodInfo, RefKind};
use crate::classpath::ClassSource;
use crate::descriptor::{FieldType, MethodDescriptor};
use crate::error::{Error, Result};
use crate::gcj::{self, Globals, RuntimeEntities, RuntimeFn, StringPool, POINTER_SIZE};
use crate::ir::Mode;
use crate::mangle::{mangle_member_name, mangle_rtti_name, mangle_vtable_name, MemberKind};
use crate::oo;
use crate::program::*;
use crate::registry::Registry;
use crate::translate::{translate_method, Resolver};

pub const OBJECT_CLASS : &str = "java/lang/Object";
pub const CLASS_CLASS : &str = "java/lang/Class";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MemberSort {
    Field,
    Method,
}

pub struct Loader<'s> {
    source : &'s dyn ClassSource,
    pub registry : Registry,
    pub program : Program,
    pub runtime : RuntimeEntities,
    pub strings : StringPool,
    finalizing : HashSet<TypeId>,
}

fn align(offset : u32, size : u32) -> u32 {
    let a = size.max(1);
    (offset + a - 1) / a * a
}

fn zero(mode : Mode) -> Initializer {
    match mode {
        Mode::Reference => Initializer::Null,
        m => Initializer::int(m, 0),
    }
}

impl<'s> Loader<'s> {
    pub fn new(source : &'s dyn ClassSource) -> Self {
        Self {
            source,
            registry : Registry::new(),
            program : Program::new(),
            runtime : RuntimeEntities::new(),
            strings : StringPool::new(),
            finalizing : HashSet::new(),
        }
    }

    /// Resolves `name`, declaring the vtable and class object of a class the
    /// first time it is loaded.
    pub fn get_class_type(&mut self, name : &str) -> Result<TypeId> {
        let (id, loaded) = self.registry.resolve(&mut self.program, self.source, name)?;
        if loaded {
            self.declare_class_entities(id)?;
        }
        Ok(id)
    }

    fn declare_class_entities(&mut self, id : TypeId) -> Result<()> {
        let class = self.program.class(id);
        let name = class.name.clone();
        let is_interface = class.is_interface();
        let visibility = if class.is_extern { Visibility::External } else { Visibility::Local };
        let data = |name : &str, ld_name : String| Entity {
            name : name.to_owned(),
            ld_name,
            owner : Some(id),
            kind : EntityKind::Data,
            visibility,
            initializer : None,
        };

        if !is_interface {
            let vtable = self.program.new_entity(data("vtable", mangle_vtable_name(&name)?));
            self.program.class_mut(id).vtable = Some(vtable);
        }
        let rtti = self.program.new_entity(data("class$", mangle_rtti_name(&name)?));
        self.program.class_mut(id).rtti = Some(rtti);
        Ok(())
    }

    /// The type a class constant names. Array types are built on the fly and
    /// not cached; class types are finalized before they are returned.
    pub fn classref_type(&mut self, class : &ClassFile, index : u16) -> Result<TypeRef> {
        let constant = class.constant_pool.get(index)?;
        if let Some(Link::Class(id)) = constant.link() {
            return Ok(TypeRef::Class(id));
        }
        let name = class.constant_pool.class_name(index)?;
        if name.starts_with('[') {
            return self.type_of(&FieldType::parse(name)?);
        }
        let id = self.get_class_type(name)?;
        self.finalize_class_type(id)?;
        constant.set_link(Link::Class(id));
        Ok(TypeRef::Class(id))
    }

    pub fn type_of(&mut self, ty : &FieldType) -> Result<TypeRef> {
        Ok(match ty {
            FieldType::Base(t) => TypeRef::Prim(*t),
            FieldType::Object(name) => TypeRef::Class(self.get_class_type(name)?),
            FieldType::Array(elem) => TypeRef::Array(Box::new(self.type_of(elem)?)),
        })
    }

    fn class_file(&self, id : TypeId) -> Result<Rc<ClassFile>> {
        let class = self.program.class(id);
        class.class_file.clone().ok_or_else(|| Error::ClassNotFound(class.name.clone()))
    }

    /// Builds everything about a class except its method bodies, after doing
    /// the same for its supertypes, and queues it for method construction.
    pub fn finalize_class_type(&mut self, id : TypeId) -> Result<()> {
        if self.program.class(id).state == ClassState::Finalized || !self.finalizing.insert(id) {
            return Ok(());
        }
        let cf = self.class_file(id)?;

        match cf.super_name()? {
            Some(super_name) => {
                let sid = self.get_class_type(super_name)?;
                self.finalize_class_type(sid)?;
                let vptr = self.program.class(sid).vptr;
                let class = self.program.class_mut(id);
                class.superclass = Some(sid);
                class.vptr = vptr;
            },
            None => {
                let name = self.program.class(id).name.clone();
                let field = Field {
                    descriptor : format!("L{};", name),
                    ty : FieldType::Object(name.clone()),
                    flags : AccessFlags::PRIVATE,
                    offset : Some(0),
                };
                let vptr = self.program.new_entity(Entity {
                    name : "@vptr".to_owned(),
                    ld_name : format!("{}@vptr", name),
                    owner : Some(id),
                    kind : EntityKind::Field(field),
                    visibility : Visibility::Private,
                    initializer : None,
                });
                self.program.class_mut(id).vptr = Some(vptr);
            },
        }

        for f in &cf.fields {
            self.create_field_entity(id, &cf, f)?;
        }
        for m in &cf.methods {
            self.create_method_entity(id, &cf, m)?;
        }

        for &index in &cf.interfaces {
            let iid = self.get_class_type(cf.constant_pool.class_name(index)?)?;
            self.finalize_class_type(iid)?;
            self.program.class_mut(id).interfaces.push(iid);
        }
        if !cf.is_interface() {
            self.link_interface_methods(id)?;
        }

        self.layout_fields(id);
        let trap = self.runtime.function(&mut self.program, RuntimeFn::ThrowAbstractMethodError);
        oo::setup_vtable(&mut self.program, id, trap);

        if !self.program.class(id).is_extern {
            let class_vtable = self.registry.get(CLASS_CLASS).and_then(|c| self.program.class(c).vtable);
            let mut globals = Globals {
                strings : &mut self.strings,
                runtime : &mut self.runtime,
                class_vtable,
            };
            gcj::build_class_descriptor(&mut self.program, &mut globals, id)?;
        }

        self.registry.enqueue(id);
        self.finalizing.remove(&id);
        let class = self.program.class_mut(id);
        class.state = ClassState::Finalized;
        info!("finalized class {} ({} bytes, {} vtable slots)", class.name, class.size, class.vtable_size);
        Ok(())
    }

    fn create_field_entity(&mut self, id : TypeId, cf : &ClassFile, f : &FieldInfo) -> Result<EntityId> {
        let name = cf.name_of(f)?;
        let descriptor = cf.descriptor_of(f)?;
        let ty = FieldType::parse(descriptor)?;
        let class = self.program.class(id);
        let ld_name = mangle_member_name(&class.name, name, MemberKind::Field)?;
        let is_static = f.access_flags.contains(AccessFlags::STATIC);
        let (visibility, initializer) = match (is_static, class.is_extern) {
            (true, false) => (Visibility::Local, Some(zero(ty.mode()))),
            (true, true) => (Visibility::External, None),
            (false, _) => (Visibility::Local, None),
        };
        let field = Field {
            descriptor : descriptor.to_owned(),
            ty,
            flags : f.access_flags,
            offset : None,
        };
        let e = self.program.add_member(id, Entity {
            name : name.to_owned(),
            ld_name,
            owner : Some(id),
            kind : EntityKind::Field(field),
            visibility,
            initializer,
        });
        f.set_entity(e);
        Ok(e)
    }

    /// The nearest non-static, non-private method of a superclass of `id`
    /// with the given name and descriptor.
    fn find_overridden(&self, id : TypeId, name : &str, descriptor : &str) -> Option<EntityId> {
        let sup = self.program.class(id).superclass?;
        self.program.ancestry(sup).into_iter().find_map(|c| {
            self.program.class(c).members.iter().copied().find(|&e| {
                let entity = self.program.entity(e);
                match entity.method() {
                    Some(m) => entity.name == name
                        && m.descriptor == descriptor
                        && !m.is_static()
                        && !m.flags.contains(AccessFlags::PRIVATE),
                    None => false,
                }
            })
        })
    }

    fn create_method_entity(&mut self, id : TypeId, cf : &ClassFile, m : &MethodInfo) -> Result<EntityId> {
        let name = cf.name_of(m)?;
        let descriptor = cf.descriptor_of(m)?;
        let signature = MethodDescriptor::parse(descriptor)?;
        let flags = m.access_flags;

        let is_static = flags.contains(AccessFlags::STATIC);
        let is_private = flags.contains(AccessFlags::PRIVATE);
        let is_special = name.starts_with('<');
        let overwrites : Vec<_> = if is_static || is_private || is_special {
            Vec::new()
        } else {
            self.find_overridden(id, name, descriptor).into_iter().collect()
        };

        let class = self.program.class(id);
        let is_final = flags.contains(AccessFlags::FINAL) || class.is_final();
        let exclude_from_vtable = is_static || is_private || name == "<init>" || (is_final && overwrites.is_empty());
        let binding = if exclude_from_vtable || is_final {
            Binding::Static
        } else if class.is_interface() {
            Binding::Interface
        } else {
            Binding::Dynamic
        };
        let is_abstract = flags.contains(AccessFlags::ABSTRACT);
        let visibility = if is_abstract || flags.contains(AccessFlags::NATIVE) || class.is_extern {
            Visibility::External
        } else {
            Visibility::Local
        };
        let ld_name = mangle_member_name(&class.name, name, MemberKind::Method { descriptor : &signature, is_static })?;

        let method = Method {
            descriptor : descriptor.to_owned(),
            signature,
            flags,
            overwrites,
            vtable_slot : None,
            binding,
            exclude_from_vtable,
            is_abstract,
            is_final,
            implementation : None,
            graph : None,
        };
        let e = self.program.add_member(id, Entity {
            name : name.to_owned(),
            ld_name,
            owner : Some(id),
            kind : EntityKind::Method(method),
            visibility,
            initializer : None,
        });
        m.set_entity(e);
        Ok(e)
    }

    /// Every interface `id` implements, directly or through other interfaces.
    fn all_interfaces(&self, id : TypeId) -> Vec<TypeId> {
        let mut seen = Vec::new();
        let mut work : Vec<_> = self.program.class(id).interfaces.iter().rev().copied().collect();
        while let Some(i) = work.pop() {
            if !seen.contains(&i) {
                seen.push(i);
                work.extend(self.program.class(i).interfaces.iter().rev());
            }
        }
        seen
    }

    fn direct_method(&self, id : TypeId, name : &str, descriptor : &str) -> Option<EntityId> {
        self.program.class(id).members.iter().copied().find(|&e| {
            let entity = self.program.entity(e);
            entity.method().map_or(false, |m| !m.is_static() && entity.name == name && m.descriptor == descriptor)
        })
    }

    /// Makes every method of an implemented interface a member of `id`, so
    /// the runtime finds it by name and signature in this class's method
    /// table. Inherited implementations get a private proxy.
    fn link_interface_methods(&mut self, id : TypeId) -> Result<()> {
        for iface in self.all_interfaces(id) {
            let methods : Vec<_> = self.program.class(iface).members.clone();
            for im in methods {
                let (name, descriptor) = match self.program.entity(im).method() {
                    Some(m) if !m.is_static() => (self.program.entity(im).name.clone(), m.descriptor.clone()),
                    _ => continue,
                };
                if let Some(own) = self.direct_method(id, &name, &descriptor) {
                    if let Some(m) = self.program.method_mut(own) {
                        m.overwrites.push(im);
                    }
                    continue;
                }

                let inherited = self.find_overridden(id, &name, &descriptor).map(|e| self.real_implementation(e));
                let class = self.program.class(id);
                if inherited.is_none() && !class.is_abstract() {
                    return Err(Error::MissingInterfaceImplementation {
                        class : class.name.clone(),
                        method : name,
                        interface : self.program.class(iface).name.clone(),
                    });
                }
                self.add_proxy(id, im, inherited);
            }
        }
        Ok(())
    }

    fn real_implementation(&self, mut e : EntityId) -> EntityId {
        while let Some(real) = self.program.method(e).and_then(|m| m.implementation) {
            e = real;
        }
        e
    }

    fn add_proxy(&mut self, id : TypeId, interface_method : EntityId, implementation : Option<EntityId>) -> Option<EntityId> {
        let template = implementation.unwrap_or(interface_method);
        let t = self.program.entity(template);
        let m = t.method()?;
        let ld_name = format!("inh__{}", t.ld_name);
        let method = Method {
            descriptor : m.descriptor.clone(),
            signature : m.signature.clone(),
            flags : m.flags,
            overwrites : implementation.into_iter().chain(Some(interface_method)).collect(),
            vtable_slot : m.vtable_slot.filter(|_| implementation.is_some()),
            binding : Binding::Dynamic,
            // an unimplemented method gets a trap slot of its own, for subclasses to override
            exclude_from_vtable : implementation.is_some(),
            is_abstract : implementation.is_none(),
            is_final : m.is_final,
            implementation,
            graph : None,
        };
        let name = self.program.entity(interface_method).name.clone();
        debug!("{}: proxy {} for {}", self.program.class(id).name, ld_name, name);
        Some(self.program.add_member(id, Entity {
            name,
            ld_name,
            owner : Some(id),
            kind : EntityKind::Method(method),
            visibility : Visibility::Private,
            initializer : None,
        }))
    }

    fn layout_fields(&mut self, id : TypeId) {
        let class = self.program.class(id);
        let mut offset = match class.superclass {
            Some(s) => self.program.class(s).size,
            None => POINTER_SIZE,
        };
        let members = class.members.clone();
        for e in members {
            if let EntityKind::Field(f) = &mut self.program.entity_mut(e).kind {
                if !f.is_static() {
                    let size = f.ty.mode().size();
                    offset = align(offset, size);
                    f.offset = Some(offset);
                    offset += size;
                }
            }
        }
        self.program.class_mut(id).size = align(offset, POINTER_SIZE);
    }

    /// Searches `id`, then its superclasses, then its interfaces.
    fn find_entity(&self, id : TypeId, name : &str, descriptor : &str, sort : MemberSort) -> Option<EntityId> {
        let class = self.program.class(id);
        let own = class.members.iter().copied().find(|&e| {
            let entity = self.program.entity(e);
            let right_sort = match sort {
                MemberSort::Field => entity.field().is_some(),
                MemberSort::Method => entity.method().is_some(),
            };
            right_sort && entity.name == name && entity.descriptor() == Some(descriptor)
        });
        own.or_else(|| class.superclass.and_then(|s| self.find_entity(s, name, descriptor, sort)))
            .or_else(|| class.interfaces.iter().find_map(|&i| self.find_entity(i, name, descriptor, sort)))
    }

    fn member_entity(&mut self, class : &ClassFile, index : u16, kind : RefKind) -> Result<EntityId> {
        let constant = class.constant_pool.get(index)?;
        if let Some(Link::Entity(e)) = constant.link() {
            return Ok(e);
        }
        let r = class.constant_pool.member_ref(index, kind)?;
        let owner = match self.classref_type(class, r.class_index)? {
            TypeRef::Class(id) => id,
            // members of arrays are those of Object
            _ => {
                let id = self.get_class_type(OBJECT_CLASS)?;
                self.finalize_class_type(id)?;
                id
            },
        };
        let sort = if kind == RefKind::Field { MemberSort::Field } else { MemberSort::Method };
        let e = self.find_entity(owner, r.name, r.descriptor, sort).ok_or_else(|| Error::MissingMember {
            class : r.class_name.to_owned(),
            name : r.name.to_owned(),
            descriptor : r.descriptor.to_owned(),
        })?;
        constant.set_link(Link::Entity(e));
        Ok(e)
    }

    /// Translates the bodies of every method of a finalized class that has one.
    pub fn construct_class_methods(&mut self, id : TypeId) -> Result<()> {
        let class = self.program.class(id);
        if class.is_extern || class.methods_constructed {
            return Ok(());
        }
        let cf = self.class_file(id)?;
        let mut count = 0;
        for m in &cf.methods {
            let e = match m.entity() {
                Some(e) => e,
                None => continue,
            };
            if m.access_flags.intersects(AccessFlags::ABSTRACT | AccessFlags::NATIVE) {
                continue;
            }
            let graph = translate_method(self, id, &cf, m, e)?;
            if let Some(method) = self.program.method_mut(e) {
                method.graph = Some(graph);
            }
            count += 1;
        }
        let class = self.program.class_mut(id);
        class.methods_constructed = true;
        info!("constructed {} methods of {}", count, class.name);
        Ok(())
    }
}

impl Resolver for Loader<'_> {
    fn program(&self) -> &Program { &self.program }

    fn field_entity(&mut self, class : &ClassFile, index : u16) -> Result<EntityId> {
        self.member_entity(class, index, RefKind::Field)
    }

    fn method_entity(&mut self, class : &ClassFile, index : u16, kind : RefKind) -> Result<EntityId> {
        self.member_entity(class, index, kind)
    }

    fn class_ref(&mut self, class : &ClassFile, index : u16) -> Result<TypeRef> {
        self.classref_type(class, index)
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
            TypeRef::Prim(t) => Some(self.runtime.primitive_class(&mut self.program, *t)),
            TypeRef::Array(_) => None,
        }
    }
}

#[test]
fn test_align() {
    assert_eq!(align(5, 4), 8);
    assert_eq!(align(8, 8), 8);
    assert_eq!(align(9, 1), 9);
    assert_eq!(align(3, 0), 3);
}
