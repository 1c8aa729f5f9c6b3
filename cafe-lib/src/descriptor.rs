//! Field and method descriptors, in the `(ILjava/lang/String;)V` notation of
//! the class-file format.

use std::convert::TryFrom;
use std::fmt;

use crate::error::{Error, Result};
use crate::ir::Mode;
use crate::jvmtypes::JType;

#[cfg(test)]
use quickcheck::quickcheck;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Base(JType),
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn parse(descriptor : &str) -> Result<Self> {
        match eat(descriptor)? {
            (t, "") => Ok(t),
            _ => Err(Error::InvalidDescriptor(descriptor.to_owned())),
        }
    }

    /// Slots taken on the operand stack or in the local-variable array.
    pub fn slots(&self) -> u8 {
        match self {
            FieldType::Base(t) => t.size(),
            _ => 1,
        }
    }

    /// Mode of the value as stored in memory. Arithmetic happens in
    /// `Mode::arithmetic` of this.
    pub fn mode(&self) -> Mode {
        match self {
            FieldType::Base(t) => Mode::from(*t),
            _ => Mode::Reference,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldType::Base(t) => write!(f, "{}", char::try_from(*t).unwrap_or('L')),
            FieldType::Object(name) => write!(f, "L{};", name),
            FieldType::Array(elem) => write!(f, "[{}", elem),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params : Vec<FieldType>,
    /// `None` for `V`.
    pub ret : Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor : &str) -> Result<Self> {
        let invalid = || Error::InvalidDescriptor(descriptor.to_owned());
        let mut rest = descriptor.strip_prefix('(').ok_or_else(invalid)?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            let (t, r) = eat(rest).map_err(|_| invalid())?;
            params.push(t);
            rest = r;
        }
        let ret = match &rest[1..] {
            "V" => None,
            r => Some(FieldType::parse(r).map_err(|_| invalid())?),
        };
        Ok(Self { params, ret })
    }

    /// Parameter slots, not counting any receiver.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(|p| u16::from(p.slots())).sum()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{}", p)?;
        }
        write!(f, ")")?;
        match &self.ret {
            Some(r) => write!(f, "{}", r),
            None => write!(f, "V"),
        }
    }
}

// consumes one field type from the front of `s`
fn eat(s : &str) -> Result<(FieldType, &str)> {
    let invalid = || Error::InvalidDescriptor(s.to_owned());
    let ch = s.chars().next().ok_or_else(invalid)?;
    match ch {
        'B' | 'C' | 'F' | 'I' | 'S' | 'Z' | 'D' | 'J' => {
            let t = JType::try_from(ch).map_err(|_| invalid())?;
            Ok((FieldType::Base(t), &s[1..]))
        },
        'L' => {
            let end = s.find(';').ok_or_else(invalid)?;
            if end == 1 {
                return Err(invalid());
            }
            Ok((FieldType::Object(s[1..end].to_owned()), &s[end + 1..]))
        },
        '[' => {
            let (elem, rest) = eat(&s[1..])?;
            Ok((FieldType::Array(Box::new(elem)), rest))
        },
        _ => Err(invalid()),
    }
}

// JVM limitations restrict the count of method parameters to 255 slots at most
pub fn count_params(descriptor : &str) -> Result<u8> {
    let d = MethodDescriptor::parse(descriptor)?;
    u8::try_from(d.param_slots()).map_err(|_| Error::InvalidDescriptor(descriptor.to_owned()))
}

// JVM limitations restrict the count of return values to 1 at most, of size 2 at most
pub fn count_returns(descriptor : &str) -> Result<u8> {
    Ok(MethodDescriptor::parse(descriptor)?.ret.map_or(0, |r| r.slots()))
}

#[test]
fn test_count_params() -> crate::GeneralResult<()> {
    assert_eq!(3, count_params("(III)V")?);
    assert_eq!(4, count_params("(JD)I")?);
    assert_eq!(2, count_params("(Lmetasyntactic;Lvariable;)I")?);
    assert_eq!(1, count_params("([[[I)I")?);
    assert_eq!(0, count_params("()Lplaceholder;")?);
    assert_eq!(0, count_params("()D")?);
    Ok(())
}

#[test]
fn test_count_returns() -> crate::GeneralResult<()> {
    assert_eq!(0, count_returns("(III)V")?);
    assert_eq!(1, count_returns("(JD)I")?);
    assert_eq!(1, count_returns("(Lmetasyntactic;Lvariable;)I")?);
    assert_eq!(1, count_returns("([[[I)I")?);
    assert_eq!(1, count_returns("()Lplaceholder;")?);
    assert_eq!(2, count_returns("()D")?);
    Ok(())
}

#[test]
fn test_bad_descriptors() {
    for d in &["", "I", "(I", "(Q)V", "(L;)V", "(I)", "(I)VV", "()[", "(Ljava/lang/Object)V"] {
        assert!(MethodDescriptor::parse(d).is_err(), "accepted {}", d);
    }
    assert!(FieldType::parse("II").is_err());
}

#[test]
fn test_parse_nested() -> crate::GeneralResult<()> {
    let d = MethodDescriptor::parse("([[Ljava/lang/String;JZ)[B")?;
    assert_eq!(d.params[0], FieldType::Array(Box::new(FieldType::Array(Box::new(
        FieldType::Object("java/lang/String".to_owned()))))));
    assert_eq!(d.params[2], FieldType::Base(JType::Boolean));
    assert_eq!(d.param_slots(), 4);
    assert_eq!(d.ret, Some(FieldType::Array(Box::new(FieldType::Base(JType::Byte)))));
    Ok(())
}

#[cfg(test)]
quickcheck! {
fn test_descriptor_display(params : Vec<u8>, ret : Option<u8>) -> bool {
    let pick = |n : u8| match n % 5 {
        0 => FieldType::Base(JType::Int),
        1 => FieldType::Base(JType::Double),
        2 => FieldType::Object(format!("p{}/C{}", n, n / 5)),
        3 => FieldType::Array(Box::new(FieldType::Base(JType::Char))),
        _ => FieldType::Array(Box::new(FieldType::Object("java/lang/Object".to_owned()))),
    };
    let d = MethodDescriptor { params : params.into_iter().map(pick).collect(), ret : ret.map(pick) };
    MethodDescriptor::parse(&d.to_string()).ok() == Some(d)
}
}
