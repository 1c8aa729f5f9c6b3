#![allow(dead_code)]

use std::collections::HashMap;

use cafe::classpath::MemorySource;
use cafe::ir::{Graph, Op};
use cafe::program::{EntityId, Program, TypeId};
use cafe::{Compilation, Options};

pub const PUBLIC    : u16 = 0x0001;
pub const PRIVATE   : u16 = 0x0002;
pub const PROTECTED : u16 = 0x0004;
pub const STATIC    : u16 = 0x0008;
pub const FINAL     : u16 = 0x0010;
pub const SUPER     : u16 = 0x0020;
pub const INTERFACE : u16 = 0x0200;
pub const ABSTRACT  : u16 = 0x0400;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Member {
    flags : u16,
    name : u16,
    descriptor : u16,
    code : Option<(u16, u16, Vec<u8>)>,
}

/// Assembles a version 50 class file. Constant-pool entries are interned, so
/// asking twice for the same reference yields the same index.
pub struct ClassBuilder {
    pool : Vec<Vec<u8>>,
    interned : HashMap<Vec<u8>, u16>,
    flags : u16,
    this_class : u16,
    super_class : u16,
    interfaces : Vec<u16>,
    fields : Vec<Member>,
    methods : Vec<Member>,
}

impl ClassBuilder {
    pub fn new(name : &str, superclass : Option<&str>) -> Self {
        let mut b = ClassBuilder {
            pool : Vec::new(),
            interned : HashMap::new(),
            flags : PUBLIC | SUPER,
            this_class : 0,
            super_class : 0,
            interfaces : Vec::new(),
            fields : Vec::new(),
            methods : Vec::new(),
        };
        b.this_class = b.class(name);
        b.super_class = superclass.map_or(0, |s| b.class(s));
        b
    }

    pub fn interface(name : &str) -> Self {
        let mut b = Self::new(name, Some("java/lang/Object"));
        b.flags = PUBLIC | INTERFACE | ABSTRACT;
        b
    }

    pub fn flags(mut self, flags : u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn implements(mut self, name : &str) -> Self {
        let i = self.class(name);
        self.interfaces.push(i);
        self
    }

    fn constant(&mut self, entry : Vec<u8>) -> u16 {
        if let Some(&i) = self.interned.get(&entry) {
            return i;
        }
        self.pool.push(entry.clone());
        let index = self.pool.len() as u16;
        self.interned.insert(entry, index);
        index
    }

    pub fn utf8(&mut self, s : &str) -> u16 {
        let mut e = vec![1];
        e.extend(&(s.len() as u16).to_be_bytes());
        e.extend(s.as_bytes());
        self.constant(e)
    }

    fn pair(&mut self, tag : u8, a : u16, b : u16) -> u16 {
        let mut e = vec![tag];
        e.extend(&a.to_be_bytes());
        e.extend(&b.to_be_bytes());
        self.constant(e)
    }

    pub fn class(&mut self, name : &str) -> u16 {
        let n = self.utf8(name);
        let mut e = vec![7];
        e.extend(&n.to_be_bytes());
        self.constant(e)
    }

    pub fn string(&mut self, s : &str) -> u16 {
        let n = self.utf8(s);
        let mut e = vec![8];
        e.extend(&n.to_be_bytes());
        self.constant(e)
    }

    pub fn integer(&mut self, v : i32) -> u16 {
        let mut e = vec![3];
        e.extend(&v.to_be_bytes());
        self.constant(e)
    }

    fn member_ref(&mut self, tag : u8, class : &str, name : &str, descriptor : &str) -> u16 {
        let c = self.class(class);
        let n = self.utf8(name);
        let d = self.utf8(descriptor);
        let nt = self.pair(12, n, d);
        self.pair(tag, c, nt)
    }

    pub fn field_ref(&mut self, class : &str, name : &str, descriptor : &str) -> u16 {
        self.member_ref(9, class, name, descriptor)
    }

    pub fn method_ref(&mut self, class : &str, name : &str, descriptor : &str) -> u16 {
        self.member_ref(10, class, name, descriptor)
    }

    pub fn interface_method_ref(&mut self, class : &str, name : &str, descriptor : &str) -> u16 {
        self.member_ref(11, class, name, descriptor)
    }

    pub fn field(&mut self, flags : u16, name : &str, descriptor : &str) {
        let (name, descriptor) = (self.utf8(name), self.utf8(descriptor));
        self.fields.push(Member { flags, name, descriptor, code : None });
    }

    pub fn method(&mut self, flags : u16, name : &str, descriptor : &str, max_stack : u16, max_locals : u16, code : &[u8]) {
        let (name, descriptor) = (self.utf8(name), self.utf8(descriptor));
        self.methods.push(Member { flags, name, descriptor, code : Some((max_stack, max_locals, code.to_vec())) });
    }

    pub fn abstract_method(&mut self, flags : u16, name : &str, descriptor : &str) {
        let (name, descriptor) = (self.utf8(name), self.utf8(descriptor));
        self.methods.push(Member { flags : flags | ABSTRACT, name, descriptor, code : None });
    }

    fn members(&mut self, members : &[Member], out : &mut Vec<u8>) {
        let code_name = self.utf8("Code");
        out.extend(&(members.len() as u16).to_be_bytes());
        for m in members {
            out.extend(&m.flags.to_be_bytes());
            out.extend(&m.name.to_be_bytes());
            out.extend(&m.descriptor.to_be_bytes());
            match &m.code {
                None => out.extend(&[0, 0]),
                Some((max_stack, max_locals, code)) => {
                    out.extend(&[0, 1]);
                    out.extend(&code_name.to_be_bytes());
                    out.extend(&(12 + code.len() as u32).to_be_bytes());
                    out.extend(&max_stack.to_be_bytes());
                    out.extend(&max_locals.to_be_bytes());
                    out.extend(&(code.len() as u32).to_be_bytes());
                    out.extend(code);
                    // no exception table, no attributes
                    out.extend(&[0, 0, 0, 0]);
                },
            }
        }
    }

    pub fn build(mut self) -> Vec<u8> {
        let fields = std::mem::take(&mut self.fields);
        let methods = std::mem::take(&mut self.methods);
        let mut body = Vec::new();
        self.members(&fields, &mut body);
        self.members(&methods, &mut body);
        body.extend(&[0, 0]);

        let mut out = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 50];
        out.extend(&(self.pool.len() as u16 + 1).to_be_bytes());
        for e in &self.pool {
            out.extend(e);
        }
        out.extend(&self.flags.to_be_bytes());
        out.extend(&self.this_class.to_be_bytes());
        out.extend(&self.super_class.to_be_bytes());
        out.extend(&(self.interfaces.len() as u16).to_be_bytes());
        for i in &self.interfaces {
            out.extend(&i.to_be_bytes());
        }
        out.extend(body);
        out
    }
}

pub fn u16_operand(index : u16) -> [u8 ; 2] {
    index.to_be_bytes()
}

/// `java/lang/Object` with three overridable methods, taking vtable slots 2
/// to 4, and an empty `java/lang/Class`.
pub fn runtime_source() -> MemorySource {
    let mut source = MemorySource::new();

    let mut object = ClassBuilder::new("java/lang/Object", None);
    object.method(PUBLIC, "<init>", "()V", 0, 1, &[0xb1]);
    object.method(PUBLIC, "hashCode", "()I", 1, 1, &[0x03, 0xac]);
    object.method(PUBLIC, "equals", "(Ljava/lang/Object;)Z", 1, 2, &[0x03, 0xac]);
    object.method(PROTECTED, "finalize", "()V", 0, 1, &[0xb1]);
    source.insert("java/lang/Object", object.build());

    let class = ClassBuilder::new("java/lang/Class", Some("java/lang/Object")).flags(PUBLIC | FINAL | SUPER);
    source.insert("java/lang/Class", class.build());

    source
}

/// `<init>()V` calling the superclass constructor.
pub fn default_constructor(b : &mut ClassBuilder, superclass : &str) {
    let init = b.method_ref(superclass, "<init>", "()V");
    let [hi, lo] = u16_operand(init);
    // aload_0; invokespecial; return
    b.method(PUBLIC, "<init>", "()V", 1, 1, &[0x2a, 0xb7, hi, lo, 0xb1]);
}

pub fn find_method(program : &Program, class : &str, name : &str, descriptor : &str) -> Option<EntityId> {
    program.entities().find(|&e| {
        let entity = program.entity(e);
        let owner = entity.owner.map(|o| program.class(o).name.as_str());
        owner == Some(class) && entity.name == name && entity.descriptor() == Some(descriptor)
    })
}

pub fn method_graph<'a>(c : &'a Compilation, class : &str, name : &str, descriptor : &str) -> Option<&'a Graph> {
    let e = find_method(&c.program, class, name, descriptor)?;
    c.program.method(e)?.graph.as_ref()
}

pub fn class_id(program : &Program, name : &str) -> Option<TypeId> {
    program.classes().find(|&c| program.class(c).name == name)
}

/// Every class builder's bytes, over the runtime classes.
pub fn source_with(classes : Vec<(&str, ClassBuilder)>) -> MemorySource {
    let mut source = runtime_source();
    for (name, b) in classes {
        source.insert(name, b.build());
    }
    source
}

pub fn compile(source : &MemorySource, root : &str) -> cafe::Result<Compilation> {
    init_logger();
    cafe::compile_from(source, root, &Options::default())
}

/// Linkage names of the statically known callees in `g`.
pub fn callees(program : &Program, g : &Graph) -> Vec<String> {
    g.find_nodes(|op| *op == Op::Call)
        .into_iter()
        .filter_map(|c| match g.node(g.node(c).inputs[1]).op {
            Op::Address(e) => Some(program.entity(e).ld_name.clone()),
            _ => None,
        })
        .collect()
}

pub fn live_blocks(g : &Graph) -> usize {
    g.blocks().filter(|&b| !g.block(b).dead && b != g.end_block()).count()
}
