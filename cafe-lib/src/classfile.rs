//! In-memory model of a parsed class file.
//!
//! Everything here holds unresolved 16-bit indices into the class's own constant
//! pool. Resolution happens lazily during linking; the results are remembered in
//! the per-constant and per-member link cells so each reference is looked up by
//! name at most once.

use std::cell::Cell;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::program::{EntityId, TypeId};

bitflags! {
    pub struct AccessFlags : u16 {
        const PUBLIC       = 0x0001;
        const PRIVATE      = 0x0002;
        const PROTECTED    = 0x0004;
        const STATIC       = 0x0008;
        const FINAL        = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE     = 0x0040;
        const TRANSIENT    = 0x0080;
        const NATIVE       = 0x0100;
        const INTERFACE    = 0x0200;
        const ABSTRACT     = 0x0400;
        const STRICT       = 0x0800;
    }
}

/// What a constant pool entry resolved to, once something asked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Link {
    Class(TypeId),
    Entity(EntityId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Utf8Constant {
    bytes : Vec<u8>,
}

impl Utf8Constant {
    pub fn new(payload : &[u8]) -> Self {
        Self { bytes : payload.to_vec() }
    }

    pub fn len(&self) -> usize { self.bytes.len() }
    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }
    pub fn as_bytes(&self) -> &[u8] { &self.bytes }
    pub fn as_str(&self) -> Option<&str> { std::str::from_utf8(self.as_bytes()).ok() }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConstantInfo {
    Utf8(Utf8Constant),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index : u16 },
    String { string_index : u16 },
    FieldRef { class_index : u16, name_and_type_index : u16 },
    MethodRef { class_index : u16, name_and_type_index : u16 },
    InterfaceMethodRef { class_index : u16, name_and_type_index : u16 },
    NameAndType { name_index : u16, descriptor_index : u16 },
    /// Index 0, and the slot after every Long or Double.
    Unusable,
}

#[derive(Debug)]
pub struct Constant {
    pub info : ConstantInfo,
    link : Cell<Option<Link>>,
}

impl Constant {
    pub fn new(info : ConstantInfo) -> Self {
        Self { info, link : Cell::new(None) }
    }

    pub fn link(&self) -> Option<Link> { self.link.get() }
    pub fn set_link(&self, link : Link) { self.link.set(Some(link)) }
}

/// A reference to a field or method, with its strings already looked up.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MemberRef<'a> {
    pub class_index : u16,
    pub class_name : &'a str,
    pub name : &'a str,
    pub descriptor : &'a str,
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    entries : Vec<Constant>,
}

impl ConstantPool {
    pub fn new(entries : Vec<Constant>) -> Self { Self { entries } }

    /// The `constant_pool_count` of the class file: one more than the last index.
    pub fn count(&self) -> usize { self.entries.len() }

    pub fn get(&self, index : u16) -> Result<&Constant> {
        match self.entries.get(usize::from(index)) {
            Some(c) if c.info != ConstantInfo::Unusable => Ok(c),
            _ => Err(Error::InvalidConstantIndex(index)),
        }
    }

    pub fn get_utf8(&self, index : u16) -> Result<&Utf8Constant> {
        match &self.get(index)?.info {
            ConstantInfo::Utf8(u) => Ok(u),
            _ => Err(Error::UnexpectedConstant { index, expected : "UTF-8 string" }),
        }
    }

    pub fn get_str(&self, index : u16) -> Result<&str> {
        self.get_utf8(index)?
            .as_str()
            .ok_or(Error::UnexpectedConstant { index, expected : "UTF-8 string" })
    }

    pub fn class_name(&self, index : u16) -> Result<&str> {
        match self.get(index)?.info {
            ConstantInfo::Class { name_index } => self.get_str(name_index),
            _ => Err(Error::UnexpectedConstant { index, expected : "class reference" }),
        }
    }

    pub fn name_and_type(&self, index : u16) -> Result<(&str, &str)> {
        match self.get(index)?.info {
            ConstantInfo::NameAndType { name_index, descriptor_index } =>
                Ok((self.get_str(name_index)?, self.get_str(descriptor_index)?)),
            _ => Err(Error::UnexpectedConstant { index, expected : "name and type" }),
        }
    }

    /// Looks up a FieldRef, MethodRef or InterfaceMethodRef, whichever `expected` names.
    pub fn member_ref(&self, index : u16, expected : RefKind) -> Result<MemberRef<'_>> {
        use ConstantInfo::*;
        let (class_index, nat) = match (&self.get(index)?.info, expected) {
            (FieldRef { class_index, name_and_type_index }, RefKind::Field)
                | (MethodRef { class_index, name_and_type_index }, RefKind::Method)
                | (InterfaceMethodRef { class_index, name_and_type_index }, RefKind::InterfaceMethod)
                => (*class_index, *name_and_type_index),
            _ => return Err(Error::UnexpectedConstant { index, expected : expected.describe() }),
        };
        let (name, descriptor) = self.name_and_type(nat)?;
        let class_name = self.class_name(class_index)?;
        Ok(MemberRef { class_index, class_name, name, descriptor })
    }

    pub fn iter(&self) -> impl Iterator<Item=(u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, c)| c.info != ConstantInfo::Unusable)
            .map(|(i, c)| (i as u16, c))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefKind {
    Field,
    Method,
    InterfaceMethod,
}

impl RefKind {
    fn describe(self) -> &'static str {
        match self {
            RefKind::Field           => "field reference",
            RefKind::Method          => "method reference",
            RefKind::InterfaceMethod => "interface method reference",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc : u16,
    pub end_pc : u16,
    pub handler_pc : u16,
    pub catch_type : u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CodeAttribute {
    pub max_stack : u16,
    pub max_locals : u16,
    pub code : Vec<u8>,
    /// Carried for completeness; translation does not wire handlers into control flow.
    pub exception_table : Vec<ExceptionEntry>,
    pub attributes : Vec<Attribute>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    Code(CodeAttribute),
    Unknown { name_index : u16, info : Vec<u8> },
}

pub trait Named     { fn name_index(&self)       -> u16; }
pub trait Described { fn descriptor_index(&self) -> u16; }

#[derive(Debug)]
pub struct FieldInfo {
    pub access_flags : AccessFlags,
    pub name_index : u16,
    pub descriptor_index : u16,
    pub attributes : Vec<Attribute>,
    link : Cell<Option<EntityId>>,
}

#[derive(Debug)]
pub struct MethodInfo {
    pub access_flags : AccessFlags,
    pub name_index : u16,
    pub descriptor_index : u16,
    pub attributes : Vec<Attribute>,
    link : Cell<Option<EntityId>>,
}

impl FieldInfo {
    pub fn new(access_flags : AccessFlags, name_index : u16, descriptor_index : u16, attributes : Vec<Attribute>) -> Self {
        Self { access_flags, name_index, descriptor_index, attributes, link : Cell::new(None) }
    }

    pub fn entity(&self) -> Option<EntityId> { self.link.get() }
    pub fn set_entity(&self, e : EntityId) { self.link.set(Some(e)) }
}

impl MethodInfo {
    pub fn new(access_flags : AccessFlags, name_index : u16, descriptor_index : u16, attributes : Vec<Attribute>) -> Self {
        Self { access_flags, name_index, descriptor_index, attributes, link : Cell::new(None) }
    }

    pub fn entity(&self) -> Option<EntityId> { self.link.get() }
    pub fn set_entity(&self, e : EntityId) { self.link.set(Some(e)) }

    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Code(c) => Some(c),
            _ => None,
        })
    }
}

impl Named     for FieldInfo  { fn name_index(&self)       -> u16 { self.name_index } }
impl Described for FieldInfo  { fn descriptor_index(&self) -> u16 { self.descriptor_index } }

impl Named     for MethodInfo { fn name_index(&self)       -> u16 { self.name_index } }
impl Described for MethodInfo { fn descriptor_index(&self) -> u16 { self.descriptor_index } }

#[derive(Debug)]
pub struct ClassFile {
    pub minor_version : u16,
    pub major_version : u16,
    pub constant_pool : ConstantPool,
    pub access_flags : AccessFlags,
    pub this_class : u16,
    pub super_class : u16,
    pub interfaces : Vec<u16>,
    pub fields : Vec<FieldInfo>,
    pub methods : Vec<MethodInfo>,
    pub attributes : Vec<Attribute>,
}

impl ClassFile {
    pub fn name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    /// `None` only for java/lang/Object.
    pub fn super_name(&self) -> Result<Option<&str>> {
        match self.super_class {
            0 => Ok(None),
            n => self.constant_pool.class_name(n).map(Some),
        }
    }

    pub fn name_of(&self, member : &dyn Named) -> Result<&str> {
        self.constant_pool.get_str(member.name_index())
    }

    pub fn descriptor_of(&self, member : &dyn Described) -> Result<&str> {
        self.constant_pool.get_str(member.descriptor_index())
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(AccessFlags::INTERFACE)
    }
}

#[cfg(test)]
fn sample_pool() -> ConstantPool {
    use ConstantInfo::*;
    ConstantPool::new(vec![
        Constant::new(Unusable),
        Constant::new(Utf8(Utf8Constant::new(b"java/lang/Object"))),
        Constant::new(Class { name_index : 1 }),
        Constant::new(Long(42)),
        Constant::new(Unusable),
        Constant::new(Utf8(Utf8Constant::new(b"hashCode"))),
        Constant::new(Utf8(Utf8Constant::new(b"()I"))),
        Constant::new(NameAndType { name_index : 5, descriptor_index : 6 }),
        Constant::new(MethodRef { class_index : 2, name_and_type_index : 7 }),
    ])
}

#[test]
fn test_unusable_slots() {
    let pool = sample_pool();
    assert!(pool.get(0).is_err());
    assert!(pool.get(3).is_ok());
    assert!(pool.get(4).is_err());
    assert!(pool.get(9).is_err());
    assert_eq!(pool.iter().count(), 7);
}

#[test]
fn test_member_ref() -> crate::GeneralResult<()> {
    let pool = sample_pool();
    let mr = pool.member_ref(8, RefKind::Method)?;
    assert_eq!(mr.class_name, "java/lang/Object");
    assert_eq!(mr.name, "hashCode");
    assert_eq!(mr.descriptor, "()I");
    assert!(pool.member_ref(8, RefKind::Field).is_err());
    assert!(pool.class_name(1).is_err());
    Ok(())
}

#[test]
fn test_utf8_constant() {
    let u = Utf8Constant::new(b"Code");
    assert_eq!(u.len(), 4);
    assert_eq!(u.as_bytes(), b"Code");
    assert_eq!(u.as_str(), Some("Code"));
}

#[test]
fn test_resolution_cache() {
    let pool = sample_pool();
    let c = pool.get(2).map(|c| { c.set_link(Link::Class(TypeId::from_raw(7))); c.link() });
    assert_eq!(c.ok().flatten(), Some(Link::Class(TypeId::from_raw(7))));
}
