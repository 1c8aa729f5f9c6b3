//! The class-library runtime's side of the ABI: its entry points, the
//! primitive class objects, UTF-8 constants, and the class descriptor record
//! it reads directly out of the emitted data.

use std::collections::HashMap;

use log::debug;

use crate::descriptor::FieldType;
use crate::error::Result;
use crate::ir::Mode;
use crate::jvmtypes::JType;
use crate::program::{Entity, EntityId, EntityKind, Initializer, Program, TypeId, Visibility};

pub const POINTER_SIZE : u32 = 4;
/// Class pointer and GC descriptor precede the method slots of every vtable.
pub const VTABLE_HEADER_SLOTS : u32 = 2;
/// Arrays are objects with an `int` length after the vtable pointer.
pub const ARRAY_LENGTH_OFFSET : u32 = 4;
pub const ARRAY_DATA_OFFSET : u32 = 8;

/// `next_or_version` of a compiled class: the C++ ABI version of GCC 4.
pub const ABI_VERSION : i64 = 400_000;
/// Compiled classes start uninitialized; `_Jv_InitClass` moves them on.
pub const JV_STATE_NOTHING : i64 = 0;
/// Set in `jv_field.flags` when `type` holds a UTF-8 signature, not a class.
pub const FIELD_UNRESOLVED_FLAG : u16 = 0x8000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    InitClass,
    AllocObject,
    NewPrimArray,
    NewObjectArray,
    NewStringUtf,
    CheckCast,
    IsInstanceOf,
    LookupInterfaceMethod,
    ThrowAbstractMethodError,
    Abort,
    Calloc,
}

impl RuntimeFn {
    pub fn symbol(self) -> &'static str {
        use RuntimeFn::*;
        match self {
            InitClass                => "_Jv_InitClass",
            AllocObject              => "_Jv_AllocObjectNoInitNoFinalizer",
            NewPrimArray             => "_Jv_NewPrimArray",
            NewObjectArray           => "_Jv_NewObjectArray",
            NewStringUtf             => "_Jv_NewStringUTF",
            CheckCast                => "_Jv_CheckCast",
            IsInstanceOf             => "_Jv_IsInstanceOf",
            LookupInterfaceMethod    => "_Jv_LookupInterfaceMethod",
            ThrowAbstractMethodError => "_Jv_ThrowAbstractMethodError",
            Abort                    => "abort",
            Calloc                   => "calloc",
        }
    }

    fn signature(self) -> (Vec<Mode>, Option<Mode>) {
        use Mode::*;
        use RuntimeFn::*;
        match self {
            InitClass                => (vec![Reference], None),
            AllocObject              => (vec![Reference], Some(Reference)),
            NewPrimArray             => (vec![Reference, Int], Some(Reference)),
            NewObjectArray           => (vec![Int, Reference, Reference], Some(Reference)),
            NewStringUtf             => (vec![Reference], Some(Reference)),
            CheckCast                => (vec![Reference, Reference], Some(Reference)),
            IsInstanceOf             => (vec![Reference, Reference], Some(Bool)),
            LookupInterfaceMethod    => (vec![Reference, Reference, Reference], Some(Reference)),
            ThrowAbstractMethodError => (vec![], None),
            Abort                    => (vec![], None),
            Calloc                   => (vec![Unsigned, Unsigned], Some(Reference)),
        }
    }
}

fn primitive_name(t : JType) -> &'static str {
    use JType::*;
    match t {
        Int     => "int",
        Long    => "long",
        Float   => "float",
        Double  => "double",
        Byte    => "byte",
        Char    => "char",
        Short   => "short",
        Boolean => "boolean",
        Void | Object => "void",
    }
}

pub(crate) fn global(name : String, kind : EntityKind, visibility : Visibility, initializer : Option<Initializer>) -> Entity {
    Entity { ld_name : name.clone(), name, owner : None, kind, visibility, initializer }
}

/// Runtime functions and primitive class objects, declared on first use.
#[derive(Debug, Default)]
pub struct RuntimeEntities {
    functions : HashMap<RuntimeFn, EntityId>,
    classes : HashMap<JType, EntityId>,
}

impl RuntimeEntities {
    pub fn new() -> Self { Self::default() }

    pub fn function(&mut self, program : &mut Program, f : RuntimeFn) -> EntityId {
        *self.functions.entry(f).or_insert_with(|| {
            let (params, result) = f.signature();
            let kind = EntityKind::Function { params, result };
            program.new_entity(global(f.symbol().to_owned(), kind, Visibility::External, None))
        })
    }

    /// `_Jv_intClass` and friends.
    pub fn primitive_class(&mut self, program : &mut Program, t : JType) -> EntityId {
        *self.classes.entry(t).or_insert_with(|| {
            let name = format!("_Jv_{}Class", primitive_name(t));
            program.new_entity(global(name, EntityKind::Data, Visibility::External, None))
        })
    }
}

/// The hash the runtime keeps alongside every UTF-8 constant.
pub fn utf8_hash(bytes : &[u8]) -> u16 {
    bytes.iter().fold(0u32, |h, &b| (31 * h + u32::from(b)) & 0xFFFF) as u16
}

/// Interned constant strings, shared by every class of the program.
#[derive(Debug, Default)]
pub struct StringPool {
    utf8 : HashMap<Vec<u8>, EntityId>,
    c_strings : HashMap<Vec<u8>, EntityId>,
}

impl StringPool {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.utf8.len() + self.c_strings.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// A `{ u16 hash; u16 len; char data[]; }` record, as the runtime's
    /// method and field tables expect.
    pub fn utf8_const(&mut self, program : &mut Program, bytes : &[u8]) -> EntityId {
        if let Some(&e) = self.utf8.get(bytes) {
            return e;
        }
        let mut data = bytes.to_vec();
        data.push(0);
        let init = Initializer::Compound(vec![
            Initializer::int(Mode::Char, i64::from(utf8_hash(bytes))),
            Initializer::int(Mode::Char, bytes.len() as i64),
            Initializer::Bytes(data),
        ]);
        let name = format!("_Utf{}", self.utf8.len());
        debug!("interned {} as {}", String::from_utf8_lossy(bytes), name);
        let e = program.new_entity(global(name, EntityKind::Data, Visibility::Private, Some(init)));
        self.utf8.insert(bytes.to_vec(), e);
        e
    }

    /// A NUL-terminated string literal.
    pub fn c_string(&mut self, program : &mut Program, bytes : &[u8]) -> EntityId {
        if let Some(&e) = self.c_strings.get(bytes) {
            return e;
        }
        let mut data = bytes.to_vec();
        data.push(0);
        let name = format!("_Str{}", self.c_strings.len());
        debug!("interned literal {:?} as {}", String::from_utf8_lossy(bytes), name);
        let e = program.new_entity(global(name, EntityKind::Data, Visibility::Private, Some(Initializer::Bytes(data))));
        self.c_strings.insert(bytes.to_vec(), e);
        e
    }
}

/// Fields of `java.lang.Class`, in the order the runtime lays them out.
pub const CLASS_FIELDS : &[&str] = &[
    "vptr", "next_or_version", "name", "accflags", "superclass",
    "constants.size", "constants.tags", "constants.data",
    "methods", "method_count", "vtable_method_count",
    "fields", "size_in_bytes", "field_count", "static_field_count",
    "vtable", "otable", "otable_syms", "atable", "atable_syms", "itable", "itable_syms",
    "catch_classes", "interfaces", "loader", "interface_count", "state", "thread",
    "depth", "ancestors", "idt", "arrayclass", "protectionDomain", "assertion_table",
    "hack_signers", "chain", "aux_info", "engine",
];

/// Everything a class descriptor refers to outside of its own class.
pub struct Globals<'a> {
    pub strings : &'a mut StringPool,
    pub runtime : &'a mut RuntimeEntities,
    /// Vtable of `java/lang/Class`, which every class object is an instance of.
    pub class_vtable : Option<EntityId>,
}

fn address_or_null(e : Option<EntityId>) -> Initializer {
    e.map_or(Initializer::Null, Initializer::Address)
}

fn table(program : &mut Program, name : String, entries : Vec<Initializer>) -> Option<EntityId> {
    if entries.is_empty() {
        return None;
    }
    let init = Some(Initializer::Compound(entries));
    Some(program.new_entity(global(name, EntityKind::Data, Visibility::Private, init)))
}

fn method_entry(program : &mut Program, g : &mut Globals<'_>, e : EntityId) -> Option<Initializer> {
    let trap = g.runtime.function(program, RuntimeFn::ThrowAbstractMethodError);
    let entity = program.entity(e);
    let m = entity.method()?;
    let name = entity.name.clone();
    let descriptor = m.descriptor.clone();
    let flags = m.flags.bits();
    let index = m.vtable_slot.map_or(0xFFFF, |s| s - VTABLE_HEADER_SLOTS);
    let code = match (m.is_abstract, m.implementation) {
        (true, _) => trap,
        (false, Some(real)) => real,
        (false, None) => e,
    };
    Some(Initializer::Compound(vec![
        Initializer::Address(g.strings.utf8_const(program, name.as_bytes())),
        Initializer::Address(g.strings.utf8_const(program, descriptor.as_bytes())),
        Initializer::int(Mode::Char, i64::from(flags)),
        Initializer::int(Mode::Char, i64::from(index)),
        Initializer::Address(code),
        Initializer::Null,
    ]))
}

fn field_entry(program : &mut Program, g : &mut Globals<'_>, e : EntityId) -> Option<Initializer> {
    let entity = program.entity(e);
    let f = entity.field()?;
    let name = entity.name.clone();
    let (ty, descriptor, offset) = (f.ty.clone(), f.descriptor.clone(), f.offset);
    let mut flags = f.flags.bits();
    let ty_init = match ty {
        FieldType::Base(t) => Initializer::Address(g.runtime.primitive_class(program, t)),
        _ => {
            flags |= FIELD_UNRESOLVED_FLAG;
            Initializer::Address(g.strings.utf8_const(program, descriptor.as_bytes()))
        },
    };
    let place = match offset {
        Some(o) => Initializer::int(Mode::Int, i64::from(o)),
        None => Initializer::Address(e),
    };
    Some(Initializer::Compound(vec![
        Initializer::Address(g.strings.utf8_const(program, name.as_bytes())),
        ty_init,
        Initializer::int(Mode::Char, i64::from(flags)),
        Initializer::int(Mode::Char, i64::from(ty.mode().size())),
        place,
    ]))
}

/// Fills in the class object of `id`, creating its method, field and
/// interface tables.
pub fn build_class_descriptor(program : &mut Program, g : &mut Globals<'_>, id : TypeId) -> Result<()> {
    let class = program.class(id);
    let tag = class.name.replace('/', "_");
    let dotted = class.name.replace('/', ".");
    let members = class.members.clone();
    let interfaces = class.interfaces.clone();
    let superclass = class.superclass;
    let (flags, vtable, vtable_size, size) = (class.flags, class.vtable, class.vtable_size, class.size);
    let rtti = match class.rtti {
        Some(r) => r,
        None => return Ok(()),
    };

    let mut methods = Vec::new();
    for &m in &members {
        if let Some(entry) = method_entry(program, g, m) {
            methods.push(entry);
        }
    }

    let is_static = |p : &Program, e : EntityId| p.entity(e).field().map(|f| f.is_static());
    let statics : Vec<_> = members.iter().copied().filter(|&e| is_static(program, e) == Some(true)).collect();
    let instance : Vec<_> = members.iter().copied().filter(|&e| is_static(program, e) == Some(false)).collect();
    let mut fields = Vec::new();
    for &f in statics.iter().chain(&instance) {
        if let Some(entry) = field_entry(program, g, f) {
            fields.push(entry);
        }
    }

    let ifaces : Vec<_> = interfaces.iter().map(|&i| address_or_null(program.class(i).rtti)).collect();
    let super_rtti = superclass.and_then(|s| program.class(s).rtti);
    let depth = superclass.map_or(0, |s| program.ancestry(s).len());

    let (method_count, field_count, iface_count) = (methods.len(), fields.len(), ifaces.len());
    let method_table = table(program, format!("_MT_{}", tag), methods);
    let field_table = table(program, format!("_FL_{}", tag), fields);
    let iface_table = table(program, format!("_IF_{}", tag), ifaces);
    let name = g.strings.utf8_const(program, dotted.as_bytes());

    let vtable_methods = vtable_size.saturating_sub(VTABLE_HEADER_SLOTS);
    let null = || Initializer::Null;
    let values = vec![
        address_or_null(g.class_vtable),
        Initializer::Const { mode : Mode::Reference, bits : ABI_VERSION as u64 },
        Initializer::Address(name),
        Initializer::int(Mode::Char, i64::from(flags.bits())),
        address_or_null(super_rtti),
        Initializer::int(Mode::Int, 0),
        null(),
        null(),
        address_or_null(method_table),
        Initializer::int(Mode::Short, method_count as i64),
        Initializer::int(Mode::Short, i64::from(vtable_methods)),
        address_or_null(field_table),
        Initializer::int(Mode::Int, i64::from(size)),
        Initializer::int(Mode::Short, field_count as i64),
        Initializer::int(Mode::Short, statics.len() as i64),
        address_or_null(vtable),
        null(), null(), null(), null(), null(), null(),
        null(),
        address_or_null(iface_table),
        null(),
        Initializer::int(Mode::Short, iface_count as i64),
        Initializer::int(Mode::Byte, JV_STATE_NOTHING),
        null(),
        Initializer::int(Mode::Short, depth as i64),
        null(), null(), null(), null(), null(), null(), null(), null(), null(),
    ];
    debug_assert_eq!(values.len(), CLASS_FIELDS.len());

    debug!("class descriptor for {}: {} methods, {} fields", dotted, method_count, field_count);
    program.entity_mut(rtti).initializer = Some(Initializer::Compound(values));
    Ok(())
}

/// A C translation unit that hands the root class to the runtime's launcher.
pub fn startup_stub(rtti_symbol : &str) -> String {
    format!(
        "extern void JvRunMain(void* klass, int argc, const char **argv);\n\
         extern void *{0};\n\
         int main(int argc, const char **argv) {{ JvRunMain(&{0}, argc, argv); return 0; }}\n",
        rtti_symbol
    )
}

#[test]
fn test_utf8_hash() {
    assert_eq!(utf8_hash(b"()V"), 0x9b75);
    assert_eq!(utf8_hash(b"<clinit>"), 0x0ea9);
    assert_eq!(utf8_hash(b""), 0);
}

#[test]
fn test_string_pool_idempotent() {
    let mut p = Program::new();
    let mut pool = StringPool::new();
    let a = pool.utf8_const(&mut p, b"hello");
    let b = pool.utf8_const(&mut p, b"world");
    let c = pool.utf8_const(&mut p, b"hello");
    assert_eq!(a, c);
    assert_ne!(a, b);
    assert_ne!(pool.c_string(&mut p, b"hello"), a);
    assert_eq!(pool.len(), 3);
    assert_eq!(p.entities().count(), 3);
    match &p.entity(a).initializer {
        Some(Initializer::Compound(v)) => assert_eq!(v[2], Initializer::Bytes(b"hello\0".to_vec())),
        other => panic!("unexpected initializer {:?}", other),
    }
}

#[test]
fn test_runtime_entities_shared() {
    let mut p = Program::new();
    let mut rt = RuntimeEntities::new();
    let a = rt.function(&mut p, RuntimeFn::InitClass);
    let b = rt.function(&mut p, RuntimeFn::InitClass);
    assert_eq!(a, b);
    assert_eq!(p.entity(a).ld_name, "_Jv_InitClass");
    let i = rt.primitive_class(&mut p, JType::Boolean);
    assert_eq!(p.entity(i).ld_name, "_Jv_booleanClass");
    assert_eq!(p.entity(i).visibility, Visibility::External);
}

#[test]
fn test_startup_stub() {
    let s = startup_stub("_ZN1a4Main6class$E");
    assert!(s.contains("extern void *_ZN1a4Main6class$E;"));
    assert!(s.contains("JvRunMain(&_ZN1a4Main6class$E, argc, argv); return 0; }"));
}
