//! Linkage symbols in the Itanium C++ scheme the class-library runtime uses
//! for Java classes: `java/lang/Object.hashCode()I` becomes
//! `_ZN4java4lang6Object8hashCodeEJiv`.
//!
//! Name components, pointer types and `JArray` instantiations are recorded in
//! a compression table as they are emitted; a later occurrence is written as
//! a back-reference `S<base-36 index>_`. Each symbol starts with an empty table.

use crate::descriptor::{FieldType, MethodDescriptor};
use crate::error::{Error, Result};
use crate::jvmtypes::JType;

#[cfg(test)]
use quickcheck::quickcheck;

const TABLE_SIZE : usize = 36;
const BASE36 : &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

// members whose names are keywords of the target language get a `$` suffix
const KEYWORDS : &[&str] = &["not", "and", "or", "xor", "delete"];

const CLINIT : &str = "18__U3c_clinit__U3e_";

/// What the member being named is.
#[derive(Copy, Clone, Debug)]
pub enum MemberKind<'a> {
    Field,
    Method { descriptor : &'a MethodDescriptor, is_static : bool },
}

#[derive(Default)]
struct Mangler {
    table : Vec<String>,
    out : String,
}

fn prim_code(t : JType) -> char {
    use JType::*;
    match t {
        Byte    => 'c',
        Char    => 'w',
        Short   => 's',
        Int     => 'i',
        Long    => 'x',
        Boolean => 'b',
        Float   => 'f',
        Double  => 'd',
        Object | Void => 'v',
    }
}

// the spelling of a type used as its compression-table key
fn unsubstituted(t : &FieldType) -> String {
    match t {
        FieldType::Base(b) => prim_code(*b).to_string(),
        FieldType::Object(name) => format!("P{}", name),
        FieldType::Array(elem) => format!("JArray<{}>", unsubstituted(elem)),
    }
}

impl Mangler {
    fn find(&self, name : &str) -> Option<usize> {
        self.table.iter().position(|e| e == name)
    }

    fn insert(&mut self, name : String) -> Result<()> {
        if self.table.len() >= TABLE_SIZE {
            return Err(Error::CompressionTableFull);
        }
        self.table.push(name);
        Ok(())
    }

    fn substitution(&mut self, index : usize) {
        self.out.push('S');
        if index > 0 {
            self.out.push(char::from(BASE36[index - 1]));
        }
        self.out.push('_');
    }

    fn source_name(&mut self, name : &str) {
        self.out.push_str(&name.len().to_string());
        self.out.push_str(name);
    }

    /// Returns whether a nested name was opened with `N`; the caller closes it.
    fn qualified_name(&mut self, class : &str, pointer : bool) -> Result<bool> {
        let pointer_key = format!("P{}", class);
        if pointer {
            if let Some(m) = self.find(&pointer_key) {
                self.substitution(m);
                return Ok(false);
            }
        }

        if let Some(m) = self.find(class) {
            if pointer {
                self.insert(pointer_key)?;
                self.out.push('P');
            }
            self.substitution(m);
            return Ok(false);
        }

        if pointer {
            self.out.push('P');
        }
        self.out.push('N');

        let mut last_match = None;
        let mut end = 0;
        for comp in class.split('/').filter(|c| !c.is_empty()) {
            end = class[end..].find(comp).map_or(end, |at| end + at) + comp.len();
            let prefix = &class[..end];
            match self.find(prefix) {
                Some(m) => last_match = Some(m),
                None => {
                    self.insert(prefix.to_owned())?;
                    if let Some(m) = last_match.take() {
                        self.substitution(m);
                    }
                    self.source_name(comp);
                },
            }
        }

        if pointer {
            self.insert(pointer_key)?;
        }
        Ok(true)
    }

    fn array_type(&mut self, elem : &FieldType) -> Result<()> {
        let key = format!("PJArray<{}>", unsubstituted(elem));
        if let Some(m) = self.find(&key) {
            self.substitution(m);
            return Ok(());
        }

        self.out.push('P');
        match self.find("JArray") {
            Some(m) => self.substitution(m),
            None => {
                self.out.push_str("6JArray");
                self.insert("JArray".to_owned())?;
            },
        }
        self.out.push('I');
        self.field_type(elem)?;
        self.out.push('E');

        self.insert(key[1..].to_owned())?;
        self.insert(key)
    }

    fn field_type(&mut self, t : &FieldType) -> Result<()> {
        match t {
            FieldType::Base(b) => self.out.push(prim_code(*b)),
            FieldType::Object(name) => {
                if self.qualified_name(name, true)? {
                    self.out.push('E');
                }
            },
            FieldType::Array(elem) => self.array_type(elem)?,
        }
        Ok(())
    }

    fn member_name(&mut self, member : &str) {
        match member {
            "<init>" => self.out.push_str("C1"),
            "<clinit>" => self.out.push_str(CLINIT),
            _ => {
                self.source_name(member);
                if KEYWORDS.contains(&member) {
                    self.out.push('$');
                }
            },
        }
    }
}

pub fn mangle_member_name(class : &str, member : &str, kind : MemberKind<'_>) -> Result<String> {
    let mut m = Mangler::default();
    m.out.push_str("_Z");
    if !m.qualified_name(class, false)? {
        return Err(Error::InvalidSymbol(class.to_owned()));
    }
    m.member_name(member);
    m.out.push('E');

    if let MemberKind::Method { descriptor, is_static } = kind {
        let is_ctor = member == "<init>";
        if is_ctor && descriptor.ret.is_none() && descriptor.params.is_empty() && !is_static {
            m.out.push('v');
            return Ok(m.out);
        }

        m.out.push('J');
        match &descriptor.ret {
            None => m.out.push('v'),
            Some(r) => m.field_type(r)?,
        }
        if descriptor.params.is_empty() {
            m.out.push('v');
        }
        for p in &descriptor.params {
            m.field_type(p)?;
        }
    }

    Ok(m.out)
}

pub fn mangle_vtable_name(class : &str) -> Result<String> {
    let mut m = Mangler::default();
    m.out.push_str("_ZTV");
    if !m.qualified_name(class, false)? {
        return Err(Error::InvalidSymbol(class.to_owned()));
    }
    m.out.push('E');
    Ok(m.out)
}

/// The symbol of the class object, which doubles as the type descriptor.
pub fn mangle_rtti_name(class : &str) -> Result<String> {
    mangle_member_name(class, "class$", MemberKind::Field)
}

/// What can be recovered from a symbol without the types involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Demangled {
    /// Binary class name, `/`-separated.
    pub class : String,
    /// `None` for a vtable.
    pub member : Option<String>,
    /// The encoded signature after the name, for methods; left as is.
    pub signature : String,
}

pub fn demangle(symbol : &str) -> Result<Demangled> {
    let invalid = || Error::InvalidSymbol(symbol.to_owned());
    let (rest, vtable) = match symbol.strip_prefix("_ZTVN") {
        Some(r) => (r, true),
        None => (symbol.strip_prefix("_ZN").ok_or_else(invalid)?, false),
    };

    let mut comps = Vec::new();
    let mut rest = rest;
    loop {
        if let Some(r) = rest.strip_prefix('E') {
            rest = r;
            break;
        }
        if let Some(r) = rest.strip_prefix("C1") {
            comps.push("<init>".to_owned());
            rest = r;
            continue;
        }
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let len : usize = rest[..digits].parse().map_err(|_| invalid())?;
        let name = rest.get(digits..digits + len).ok_or_else(invalid)?;
        rest = &rest[digits + len..];
        if let Some(r) = rest.strip_prefix('$') {
            if KEYWORDS.contains(&name) {
                rest = r;
            }
        }
        comps.push(if name == &CLINIT[2..] { "<clinit>".to_owned() } else { name.to_owned() });
    }

    let member = if vtable {
        if !rest.is_empty() {
            return Err(invalid());
        }
        None
    } else {
        comps.pop()
    };
    if comps.is_empty() {
        return Err(invalid());
    }

    Ok(Demangled { class : comps.join("/"), member, signature : rest.to_owned() })
}

#[cfg(test)]
fn method(d : &MethodDescriptor) -> MemberKind<'_> {
    MemberKind::Method { descriptor : d, is_static : false }
}

#[test]
fn test_compression() -> crate::GeneralResult<()> {
    let d = MethodDescriptor::parse("(Ljava/lang/Class;III[Ljava/lang/Object;)[Ljava/lang/Object;")?;
    assert_eq!(
        mangle_member_name("java/lang/ClassLoader", "putDeclaredAnnotations", method(&d))?,
        "_ZN4java4lang11ClassLoader22putDeclaredAnnotationsEJP6JArrayIPNS0_6ObjectEEPNS0_5ClassEiiiS6_"
    );
    Ok(())
}

#[test]
fn test_simple_members() -> crate::GeneralResult<()> {
    let hash = MethodDescriptor::parse("()I")?;
    assert_eq!(mangle_member_name("java/lang/Object", "hashCode", method(&hash))?, "_ZN4java4lang6Object8hashCodeEJiv");

    let init = MethodDescriptor::parse("()V")?;
    assert_eq!(mangle_member_name("java/lang/Object", "<init>", method(&init))?, "_ZN4java4lang6ObjectC1Ev");
    let clinit = MemberKind::Method { descriptor : &init, is_static : true };
    assert_eq!(mangle_member_name("a/B", "<clinit>", clinit)?, "_ZN1a1B18__U3c_clinit__U3e_EJvv");

    let ctor = MethodDescriptor::parse("(Ljava/lang/String;)V")?;
    assert_eq!(
        mangle_member_name("java/lang/Object", "<init>", method(&ctor))?,
        "_ZN4java4lang6ObjectC1EJvPNS0_6StringE"
    );

    let eq = MethodDescriptor::parse("(Ljava/lang/Object;)Z")?;
    assert_eq!(mangle_member_name("java/lang/Object", "equals", method(&eq))?, "_ZN4java4lang6Object6equalsEJbPS1_");

    assert_eq!(mangle_member_name("a/Bits", "and", method(&hash))?, "_ZN1a4Bits3and$EJiv");
    assert_eq!(mangle_rtti_name("java/lang/String")?, "_ZN4java4lang6String6class$E");
    assert_eq!(mangle_vtable_name("java/lang/String")?, "_ZTVN4java4lang6StringE");
    Ok(())
}

#[test]
fn test_arrays() -> crate::GeneralResult<()> {
    let d = MethodDescriptor::parse("([I[I)V")?;
    let kind = MemberKind::Method { descriptor : &d, is_static : true };
    assert_eq!(mangle_member_name("a/B", "f", kind)?, "_ZN1a1B1fEJvP6JArrayIiES3_");

    let nested = MethodDescriptor::parse("([[J)V")?;
    let kind = MemberKind::Method { descriptor : &nested, is_static : true };
    assert_eq!(mangle_member_name("a/B", "g", kind)?, "_ZN1a1B1gEJvP6JArrayIPS1_IxEE");
    Ok(())
}

#[test]
fn test_fresh_table_per_symbol() -> crate::GeneralResult<()> {
    let baz = MethodDescriptor::parse("(I)V")?;
    let qux = MethodDescriptor::parse("()I")?;
    let first = mangle_member_name("a/b/C", "baz", method(&baz))?;
    let second = mangle_member_name("a/b/C", "qux", method(&qux))?;
    assert_eq!(first, "_ZN1a1b1C3bazEJvi");
    assert_eq!(second, "_ZN1a1b1C3quxEJiv");
    Ok(())
}

#[test]
fn test_table_limit() -> crate::GeneralResult<()> {
    let params : String = (0..40).map(|i| format!("Lp{}/C;", i)).collect();
    let d = MethodDescriptor::parse(&format!("({})V", params))?;
    assert!(matches!(mangle_member_name("a/B", "f", method(&d)), Err(Error::CompressionTableFull)));
    Ok(())
}

#[test]
fn test_demangle() -> crate::GeneralResult<()> {
    let d = demangle("_ZN4java4lang6Object8hashCodeEJiv")?;
    assert_eq!(d.class, "java/lang/Object");
    assert_eq!(d.member.as_deref(), Some("hashCode"));
    assert_eq!(d.signature, "Jiv");

    assert_eq!(demangle("_ZN4java4lang6ObjectC1Ev")?.member.as_deref(), Some("<init>"));
    assert_eq!(demangle("_ZN1a1B18__U3c_clinit__U3e_EJvv")?.member.as_deref(), Some("<clinit>"));
    assert_eq!(demangle("_ZN1a4Bits3and$EJiv")?.member.as_deref(), Some("and"));

    let v = demangle("_ZTVN4java4lang6StringE")?;
    assert_eq!((v.class.as_str(), v.member), ("java/lang/String", None));

    for bad in &["", "_Z", "foo", "_ZN4javaE", "_ZN9javaE", "_ZTVN4java4lang6StringEJv"] {
        assert!(demangle(bad).is_err(), "accepted {}", bad);
    }
    Ok(())
}

#[cfg(test)]
fn component(n : u8) -> String {
    format!("c{}{}", n, "x".repeat(usize::from(n % 4)))
}

#[cfg(test)]
quickcheck! {
fn test_deterministic(comps : Vec<u8>, member : u8) -> bool {
    let class : Vec<_> = comps.iter().take(8).map(|&n| component(n)).collect();
    if class.is_empty() {
        return true;
    }
    let class = class.join("/");
    let member = component(member);
    let first = mangle_member_name(&class, &member, MemberKind::Field).ok();
    let second = mangle_member_name(&class, &member, MemberKind::Field).ok();
    first.is_some() && first == second
}

fn test_round_trip(comps : Vec<u8>, member : u8) -> bool {
    let class : Vec<_> = comps.iter().take(8).map(|&n| component(n)).collect();
    if class.is_empty() {
        return true;
    }
    let class = class.join("/");
    let member = component(member);
    let d = MethodDescriptor { params : vec![FieldType::Object(class.clone())], ret : None };
    mangle_member_name(&class, &member, method(&d))
        .and_then(|s| demangle(&s))
        .map(|dm| dm.class == class && dm.member.as_deref() == Some(member.as_str()))
        .unwrap_or(false)
}
}
