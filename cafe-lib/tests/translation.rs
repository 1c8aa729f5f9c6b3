mod common;

use common::*;

use cafe::ir::{Mode, Op};
use cafe::program::{Initializer, Visibility};
use cafe::{Error, GeneralResult, Options, Runtime};

fn main_class() -> ClassBuilder {
    let mut b = ClassBuilder::new("a/Main", Some("java/lang/Object"));
    default_constructor(&mut b, "java/lang/Object");
    b
}

#[test]
fn test_return_only_method() -> GeneralResult<()> {
    let mut b = main_class();
    b.method(PUBLIC, "run", "()V", 0, 1, &[0xb1]);
    let c = compile(&source_with(vec![("a/Main", b)]), "a/Main")?;

    let g = method_graph(&c, "a/Main", "run", "()V").ok_or("run was not translated")?;
    assert_eq!(live_blocks(g), 1);
    assert_eq!(g.find_nodes(|op| *op == Op::Return).len(), 1);
    // only the start node, its projections and the return
    assert!(g.nodes().all(|n| matches!(g.node(n).op, Op::Start | Op::Proj(_) | Op::Return)));
    assert!(c.startup.contains("_ZN1a4Main6class$E"));
    assert_eq!(c.root_symbol(), Some("_ZN1a4Main6class$E"));
    Ok(())
}

// iload_1; ifeq 8; iconst_1; goto 9; iconst_2; ireturn
const SELECT : [u8 ; 10] = [0x1b, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x04, 0x05, 0xac];

#[test]
fn test_branches_merge_with_equal_depth() -> GeneralResult<()> {
    let mut b = main_class();
    b.method(PUBLIC, "pick", "(I)I", 1, 2, &SELECT);
    let c = compile(&source_with(vec![("a/Main", b)]), "a/Main")?;

    let g = method_graph(&c, "a/Main", "pick", "(I)I").ok_or("pick was not translated")?;
    let phis = g.find_nodes(|op| *op == Op::Phi);
    assert_eq!(phis.len(), 1);
    let phi = g.node(phis[0]);
    assert_eq!(phi.mode, Mode::Int);
    assert_eq!(phi.inputs.len(), 2);
    assert_eq!(g.block(phi.block).pc, Some(9));
    Ok(())
}

#[test]
fn test_branches_merge_with_unequal_depth() {
    let mut code = SELECT;
    code[8] = 0x00; // nop: the fall-through path arrives empty
    let mut b = main_class();
    b.method(PUBLIC, "pick", "(I)I", 1, 2, &code);
    match compile(&source_with(vec![("a/Main", b)]), "a/Main") {
        Err(Error::StackPointerMismatch { pc }) => assert_eq!(pc, 9),
        other => panic!("expected a stack pointer mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_root() {
    match compile(&runtime_source(), "a/Nowhere") {
        Err(Error::ClassNotFound(name)) => assert_eq!(name, "a/Nowhere"),
        other => panic!("expected a missing class, got {:?}", other.map(|_| ())),
    }
}

/// A class whose `make()V` allocates an `a/Other` and prints "hello".
fn allocating_class(name : &str) -> ClassBuilder {
    let mut b = ClassBuilder::new(name, Some("java/lang/Object"));
    default_constructor(&mut b, "java/lang/Object");
    let other = b.class("a/Other");
    let init = b.method_ref("a/Other", "<init>", "()V");
    let hello = b.string("hello");
    let [oh, ol] = u16_operand(other);
    let [ih, il] = u16_operand(init);
    // new; dup; invokespecial; pop; ldc; pop; return
    let code = [0xbb, oh, ol, 0x59, 0xb7, ih, il, 0x57, 0x12, hello as u8, 0x57, 0xb1];
    b.method(PUBLIC, "make", "()V", 2, 1, &code);
    b
}

fn other_class() -> ClassBuilder {
    let mut b = ClassBuilder::new("a/Other", Some("java/lang/Object"));
    b.field(PRIVATE, "count", "I");
    b.field(PRIVATE, "big", "J");
    b.field(STATIC, "instances", "I");
    default_constructor(&mut b, "java/lang/Object");
    b
}

#[test]
fn test_constants_are_interned_once() -> GeneralResult<()> {
    let source = source_with(vec![
        ("a/Main", allocating_class("a/Main")),
        ("a/Other", other_class()),
    ]);
    let c = compile(&source, "a/Main")?;
    let p = &c.program;

    let with_bytes = |bytes : &[u8]| p.entities().filter(|&e| {
        match &p.entity(e).initializer {
            Some(Initializer::Bytes(b)) => b.as_slice() == bytes,
            Some(Initializer::Compound(v)) => v.last() == Some(&Initializer::Bytes(bytes.to_vec())),
            _ => false,
        }
    }).count();
    assert_eq!(with_bytes(b"hello\0"), 1);
    // every class has a constructor
    assert_eq!(with_bytes(b"<init>\0"), 1);
    assert_eq!(with_bytes(b"()V\0"), 1);
    Ok(())
}

#[test]
fn test_field_layout() -> GeneralResult<()> {
    let source = source_with(vec![
        ("a/Main", allocating_class("a/Main")),
        ("a/Other", other_class()),
    ]);
    let c = compile(&source, "a/Main")?;
    let p = &c.program;
    let other = class_id(p, "a/Other").ok_or("a/Other was not loaded")?;
    let offset = |name : &str| p.class(other).members.iter()
        .map(|&e| p.entity(e))
        .find(|e| e.name == name)
        .and_then(|e| e.field())
        .and_then(|f| f.offset);
    // the vptr comes first, and the long is aligned to its size
    assert_eq!(offset("count"), Some(4));
    assert_eq!(offset("big"), Some(8));
    assert_eq!(offset("instances"), None);
    assert_eq!(p.class(other).size, 16);
    Ok(())
}

#[test]
fn test_simple_runtime_allocates_with_calloc() -> GeneralResult<()> {
    let source = source_with(vec![
        ("a/Main", allocating_class("a/Main")),
        ("a/Other", other_class()),
    ]);
    let c = compile(&source, "a/Main")?;
    let g = method_graph(&c, "a/Main", "make", "()V").ok_or("make was not translated")?;
    assert!(g.find_nodes(|op| matches!(op, Op::Alloc(_))).is_empty());
    let names = callees(&c.program, g);
    assert!(names.contains(&"calloc".to_owned()));
    assert!(names.contains(&"_Jv_NewStringUTF".to_owned()));
    assert!(names.contains(&"_ZN1a5OtherC1Ev".to_owned()));
    Ok(())
}

#[test]
fn test_gcj_runtime_allocates_objects() -> GeneralResult<()> {
    init_logger();
    let source = source_with(vec![
        ("a/Main", allocating_class("a/Main")),
        ("a/Other", other_class()),
    ]);
    let options = Options { runtime : Runtime::Gcj, ..Options::default() };
    let c = cafe::compile_from(&source, "a/Main", &options)?;
    let g = method_graph(&c, "a/Main", "make", "()V").ok_or("make was not translated")?;
    let names = callees(&c.program, g);
    assert!(names.contains(&"_Jv_AllocObjectNoInitNoFinalizer".to_owned()));
    assert!(!names.contains(&"calloc".to_owned()));
    Ok(())
}

#[test]
fn test_extern_classes_are_not_emitted() -> GeneralResult<()> {
    let mut lib = ClassBuilder::new("a/Lib", Some("java/lang/Object"));
    lib.method(PUBLIC | STATIC, "answer", "()I", 1, 0, &[0x10, 42, 0xac]);

    let mut main = main_class();
    let answer = main.method_ref("a/Lib", "answer", "()I");
    let [h, l] = u16_operand(answer);
    main.method(PUBLIC, "ask", "()I", 1, 1, &[0xb8, h, l, 0xac]);

    let mut source = source_with(vec![("a/Main", main)]);
    source.insert_extern("a/Lib", lib.build());
    let c = compile(&source, "a/Main")?;
    let p = &c.program;

    let lib = class_id(p, "a/Lib").ok_or("a/Lib was not loaded")?;
    assert!(p.class(lib).is_extern);
    let answer = find_method(p, "a/Lib", "answer", "()I").ok_or("a/Lib.answer has no entity")?;
    assert!(p.method(answer).map_or(false, |m| m.graph.is_none()));
    assert_eq!(p.entity(answer).visibility, Visibility::External);
    let vtable = p.class(lib).vtable.map(|v| p.entity(v)).ok_or("a/Lib has no vtable entity")?;
    assert!(vtable.initializer.is_none());
    assert_eq!(vtable.visibility, Visibility::External);
    let rtti = p.class(lib).rtti.map(|r| p.entity(r)).ok_or("a/Lib has no class object")?;
    assert!(rtti.initializer.is_none());

    // calling a static method initializes its class first
    let g = method_graph(&c, "a/Main", "ask", "()I").ok_or("ask was not translated")?;
    let names = callees(p, g);
    assert_eq!(names, vec!["_Jv_InitClass".to_owned(), "_ZN1a3Lib6answerEJiv".to_owned()]);
    Ok(())
}
