mod common;

use common::*;

use cafe::ir::Op;
use cafe::program::{Binding, Initializer, Visibility};
use cafe::{Error, GeneralResult};

fn slot_of(c : &cafe::Compilation, class : &str, name : &str, descriptor : &str) -> Option<u32> {
    let e = find_method(&c.program, class, name, descriptor)?;
    c.program.method(e)?.vtable_slot
}

fn vtable(c : &cafe::Compilation, class : &str) -> Vec<Initializer> {
    let p = &c.program;
    let init = class_id(p, class)
        .and_then(|id| p.class(id).vtable)
        .and_then(|v| p.entity(v).initializer.clone());
    match init {
        Some(Initializer::Compound(v)) => v,
        other => panic!("{} has no vtable initializer: {:?}", class, other),
    }
}

fn base_and_foo() -> Vec<(&'static str, ClassBuilder)> {
    let mut base = ClassBuilder::new("java/lang/Base", Some("java/lang/Object"));
    default_constructor(&mut base, "java/lang/Object");
    base.method(PUBLIC, "bar", "()V", 0, 1, &[0xb1]);
    base.method(PUBLIC, "other", "()V", 0, 1, &[0xb1]);

    let mut foo = ClassBuilder::new("java/lang/Foo", Some("java/lang/Base"));
    default_constructor(&mut foo, "java/lang/Base");
    foo.method(PUBLIC, "bar", "()V", 0, 1, &[0xb1]);
    foo.method(PUBLIC, "extra", "()V", 0, 1, &[0xb1]);

    vec![("java/lang/Base", base), ("java/lang/Foo", foo)]
}

#[test]
fn test_override_keeps_slot() -> GeneralResult<()> {
    let c = compile(&source_with(base_and_foo()), "java/lang/Foo")?;

    assert_eq!(slot_of(&c, "java/lang/Object", "finalize", "()V"), Some(4));
    assert_eq!(slot_of(&c, "java/lang/Base", "bar", "()V"), Some(5));
    assert_eq!(slot_of(&c, "java/lang/Foo", "bar", "()V"), Some(5));
    assert_eq!(slot_of(&c, "java/lang/Base", "other", "()V"), Some(6));
    assert_eq!(slot_of(&c, "java/lang/Foo", "extra", "()V"), Some(7));
    assert_eq!(slot_of(&c, "java/lang/Foo", "<init>", "()V"), None);

    let base = vtable(&c, "java/lang/Base");
    let foo = vtable(&c, "java/lang/Foo");
    assert_eq!(base.len(), 7);
    assert_eq!(foo.len(), 8);
    // below the overridden slot everything but the class object is inherited
    assert_eq!(foo[1..5], base[1..5]);
    assert_ne!(foo[0], base[0]);
    assert_ne!(foo[5], base[5]);
    assert_eq!(foo[6], base[6]);

    let foo_bar = find_method(&c.program, "java/lang/Foo", "bar", "()V").ok_or("no Foo.bar")?;
    assert_eq!(foo[5], Initializer::Address(foo_bar));
    Ok(())
}

#[test]
fn test_final_methods_bind_statically() -> GeneralResult<()> {
    let mut b = ClassBuilder::new("a/Leaf", Some("java/lang/Object")).flags(PUBLIC | FINAL | SUPER);
    default_constructor(&mut b, "java/lang/Object");
    b.method(PUBLIC, "fresh", "()V", 0, 1, &[0xb1]);
    b.method(PUBLIC, "hashCode", "()I", 1, 1, &[0x04, 0xac]);
    let c = compile(&source_with(vec![("a/Leaf", b)]), "a/Leaf")?;
    let p = &c.program;

    let fresh = find_method(p, "a/Leaf", "fresh", "()V").and_then(|e| p.method(e)).ok_or("no fresh")?;
    assert!(fresh.exclude_from_vtable);
    assert_eq!(fresh.binding, Binding::Static);
    // an override still needs the inherited slot
    let hash = find_method(p, "a/Leaf", "hashCode", "()I").and_then(|e| p.method(e)).ok_or("no hashCode")?;
    assert!(!hash.exclude_from_vtable);
    assert_eq!(hash.vtable_slot, Some(2));
    assert_eq!(hash.binding, Binding::Static);
    Ok(())
}

fn runner() -> ClassBuilder {
    let mut i = ClassBuilder::interface("a/Runner");
    i.abstract_method(PUBLIC, "run", "()V");
    i
}

#[test]
fn test_interface_calls_look_up_the_method() -> GeneralResult<()> {
    let mut main = ClassBuilder::new("a/Main", Some("java/lang/Object"));
    default_constructor(&mut main, "java/lang/Object");
    let run = main.interface_method_ref("a/Runner", "run", "()V");
    let [h, l] = u16_operand(run);
    // aload_1; invokeinterface run 1 0; return
    main.method(PUBLIC, "go", "(La/Runner;)V", 1, 2, &[0x2b, 0xb9, h, l, 1, 0, 0xb1]);

    let c = compile(&source_with(vec![("a/Main", main), ("a/Runner", runner())]), "a/Main")?;
    let p = &c.program;

    let run = find_method(p, "a/Runner", "run", "()V").and_then(|e| p.method(e)).ok_or("no Runner.run")?;
    assert_eq!(run.binding, Binding::Interface);

    let g = method_graph(&c, "a/Main", "go", "(La/Runner;)V").ok_or("go was not translated")?;
    assert!(g.find_nodes(|op| matches!(op, Op::MethodSel(_))).is_empty());
    assert_eq!(callees(p, g), vec!["_Jv_LookupInterfaceMethod".to_owned()]);
    // the looked-up pointer is the callee of the second call
    assert_eq!(g.find_nodes(|op| *op == Op::Call).len(), 2);
    Ok(())
}

#[test]
fn test_virtual_calls_load_the_vtable_slot() -> GeneralResult<()> {
    let mut sources = base_and_foo();
    let mut main = ClassBuilder::new("a/Main", Some("java/lang/Object"));
    default_constructor(&mut main, "java/lang/Object");
    let bar = main.method_ref("java/lang/Base", "bar", "()V");
    let [h, l] = u16_operand(bar);
    // aload_1; invokevirtual bar; return
    main.method(PUBLIC, "poke", "(Ljava/lang/Base;)V", 1, 2, &[0x2b, 0xb6, h, l, 0xb1]);
    sources.push(("a/Main", main));

    let c = compile(&source_with(sources), "a/Main")?;
    let g = method_graph(&c, "a/Main", "poke", "(Ljava/lang/Base;)V").ok_or("poke was not translated")?;
    assert!(callees(&c.program, g).is_empty());
    // slot 5, four bytes each
    assert_eq!(g.find_nodes(|op| *op == Op::Const(20)).len(), 1);
    Ok(())
}

#[test]
fn test_inherited_implementation_gets_a_proxy() -> GeneralResult<()> {
    let mut base = ClassBuilder::new("a/Base", Some("java/lang/Object"));
    default_constructor(&mut base, "java/lang/Object");
    base.method(PUBLIC, "run", "()V", 0, 1, &[0xb1]);

    let mut sub = ClassBuilder::new("a/Sub", Some("a/Base")).implements("a/Runner");
    default_constructor(&mut sub, "a/Base");

    let c = compile(&source_with(vec![("a/Base", base), ("a/Sub", sub), ("a/Runner", runner())]), "a/Sub")?;
    let p = &c.program;
    let sub = class_id(p, "a/Sub").ok_or("a/Sub was not loaded")?;
    let base_run = find_method(p, "a/Base", "run", "()V").ok_or("no Base.run")?;

    let proxies : Vec<_> = p.class(sub).members.iter().copied()
        .filter(|&e| p.entity(e).ld_name.starts_with("inh__"))
        .collect();
    assert_eq!(proxies.len(), 1);
    let proxy = p.entity(proxies[0]);
    assert_eq!(proxy.ld_name, format!("inh__{}", p.entity(base_run).ld_name));
    assert_eq!(proxy.visibility, Visibility::Private);
    assert_eq!(proxy.method().and_then(|m| m.implementation), Some(base_run));
    Ok(())
}

/// `a/Mid` inherits `run` from `a/Base` and implements `a/Runner`, so it
/// carries a proxy for `Base.run`.
fn proxied_hierarchy() -> Vec<(&'static str, ClassBuilder)> {
    let mut base = ClassBuilder::new("a/Base", Some("java/lang/Object"));
    default_constructor(&mut base, "java/lang/Object");
    base.method(PUBLIC, "run", "()V", 0, 1, &[0xb1]);

    let mut mid = ClassBuilder::new("a/Mid", Some("a/Base")).implements("a/Runner");
    default_constructor(&mut mid, "a/Base");

    vec![("a/Base", base), ("a/Mid", mid), ("a/Runner", runner())]
}

fn no_calls_to_proxies(p : &cafe::program::Program) -> bool {
    p.entities()
        .filter_map(|e| p.method(e).and_then(|m| m.graph.as_ref()))
        .all(|g| callees(p, g).iter().all(|name| !name.starts_with("inh__")))
}

#[test]
fn test_super_call_through_proxy_reaches_implementation() -> GeneralResult<()> {
    let mut sources = proxied_hierarchy();
    let mut leaf = ClassBuilder::new("a/Leaf", Some("a/Mid"));
    default_constructor(&mut leaf, "a/Mid");
    let super_run = leaf.method_ref("a/Mid", "run", "()V");
    let [h, l] = u16_operand(super_run);
    // aload_0; invokespecial Mid.run; return
    leaf.method(PUBLIC, "run", "()V", 1, 1, &[0x2a, 0xb7, h, l, 0xb1]);
    sources.push(("a/Leaf", leaf));

    let c = compile(&source_with(sources), "a/Leaf")?;
    let p = &c.program;
    let base_run = find_method(p, "a/Base", "run", "()V").ok_or("no Base.run")?;

    let g = method_graph(&c, "a/Leaf", "run", "()V").ok_or("Leaf.run was not translated")?;
    assert_eq!(callees(p, g), vec![p.entity(base_run).ld_name.clone()]);
    assert!(no_calls_to_proxies(p));
    Ok(())
}

#[test]
fn test_virtual_call_through_proxy_uses_implementation_slot() -> GeneralResult<()> {
    let mut sources = proxied_hierarchy();
    let mut main = ClassBuilder::new("a/Main", Some("java/lang/Object"));
    default_constructor(&mut main, "java/lang/Object");
    let run = main.method_ref("a/Mid", "run", "()V");
    let [h, l] = u16_operand(run);
    // aload_1; invokevirtual Mid.run; return
    main.method(PUBLIC, "poke", "(La/Mid;)V", 1, 2, &[0x2b, 0xb6, h, l, 0xb1]);
    sources.push(("a/Main", main));

    let c = compile(&source_with(sources), "a/Main")?;
    let p = &c.program;
    let mid = class_id(p, "a/Mid").ok_or("a/Mid was not loaded")?;
    let proxy = p.class(mid).members.iter().copied()
        .find(|&e| p.entity(e).ld_name.starts_with("inh__"))
        .ok_or("a/Mid has no proxy")?;
    assert_eq!(p.method(proxy).and_then(|m| m.vtable_slot), Some(5));
    assert_eq!(slot_of(&c, "a/Base", "run", "()V"), Some(5));

    let g = method_graph(&c, "a/Main", "poke", "(La/Mid;)V").ok_or("poke was not translated")?;
    assert!(callees(p, g).is_empty());
    assert_eq!(g.find_nodes(|op| *op == Op::Const(20)).len(), 1);
    assert!(no_calls_to_proxies(p));
    Ok(())
}

#[test]
fn test_missing_interface_implementation() {
    let mut bad = ClassBuilder::new("a/Bad", Some("java/lang/Object")).implements("a/Runner");
    default_constructor(&mut bad, "java/lang/Object");
    match compile(&source_with(vec![("a/Bad", bad), ("a/Runner", runner())]), "a/Bad") {
        Err(Error::MissingInterfaceImplementation { class, method, interface }) => {
            assert_eq!(class, "a/Bad");
            assert_eq!(method, "run");
            assert_eq!(interface, "a/Runner");
        },
        other => panic!("expected a missing implementation, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_abstract_class_may_leave_interface_open() -> GeneralResult<()> {
    let mut partial = ClassBuilder::new("a/Partial", Some("java/lang/Object"))
        .flags(PUBLIC | ABSTRACT | SUPER)
        .implements("a/Runner");
    default_constructor(&mut partial, "java/lang/Object");
    let c = compile(&source_with(vec![("a/Partial", partial), ("a/Runner", runner())]), "a/Partial")?;

    let vt = vtable(&c, "a/Partial");
    let trap = c.program.entities()
        .find(|&e| c.program.entity(e).ld_name == "_Jv_ThrowAbstractMethodError")
        .ok_or("no abstract method trap")?;
    assert_eq!(vt.last(), Some(&Initializer::Address(trap)));
    Ok(())
}
