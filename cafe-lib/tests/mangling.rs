use cafe::descriptor::MethodDescriptor;
use cafe::mangle::{demangle, mangle_member_name, mangle_vtable_name, MemberKind};
use cafe::GeneralResult;

#[test]
fn test_symbols_do_not_share_compression_state() -> GeneralResult<()> {
    let baz = MethodDescriptor::parse("(I)V")?;
    let kind = MemberKind::Method { descriptor : &baz, is_static : false };
    let first = mangle_member_name("a/b/C", "baz", kind)?;
    let field = mangle_member_name("a/b/C", "count", MemberKind::Field)?;
    let again = mangle_member_name("a/b/C", "baz", kind)?;

    assert_eq!(first, "_ZN1a1b1C3bazEJvi");
    assert_eq!(field, "_ZN1a1b1C5countE");
    assert_eq!(first, again);
    // the qualified name is spelled out in full both times
    assert!(field.starts_with("_ZN1a1b1C"));
    assert_eq!(mangle_vtable_name("a/b/C")?, "_ZTVN1a1b1CE");
    Ok(())
}

#[test]
fn test_demangle_recovers_names() -> GeneralResult<()> {
    let d = MethodDescriptor::parse("(Ljava/lang/String;)Ljava/lang/String;")?;
    let kind = MemberKind::Method { descriptor : &d, is_static : true };
    let symbol = mangle_member_name("java/lang/String", "valueOf", kind)?;
    let de = demangle(&symbol)?;
    assert_eq!(de.class, "java/lang/String");
    assert_eq!(de.member.as_deref(), Some("valueOf"));

    let vt = demangle(&mangle_vtable_name("a/b/C")?)?;
    assert_eq!(vt.class, "a/b/C");
    assert_eq!(vt.member, None);
    Ok(())
}
