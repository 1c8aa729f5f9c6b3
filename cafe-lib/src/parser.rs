//! Big-endian class-file reader.
//!
//! The grammar is walked once, front to back; every list is count- or
//! length-prefixed. Malformed input is fatal and reported as the first error
//! encountered.

use nom::{
    bytes::complete::take,
    error::{ErrorKind, ParseError},
    multi::count,
    number::complete::{be_f32, be_f64, be_i32, be_i64, be_u16, be_u32, be_u8},
};

use crate::classfile::*;
use crate::error::{Error, Result};

const MAGIC : u32 = 0xCAFE_BABE;

#[derive(Debug)]
enum ClassError<'a> {
    Nom(&'a [u8], ErrorKind),
    Fatal(Error),
}

impl<'a> ParseError<&'a [u8]> for ClassError<'a> {
    fn from_error_kind(input : &'a [u8], kind : ErrorKind) -> Self {
        ClassError::Nom(input, kind)
    }

    fn append(_ : &'a [u8], _ : ErrorKind, other : Self) -> Self {
        other
    }
}

impl From<ClassError<'_>> for Error {
    fn from(e : ClassError<'_>) -> Self {
        match e {
            ClassError::Nom(..) => Error::Truncated,
            ClassError::Fatal(e) => e,
        }
    }
}

type PResult<'a, T> = nom::IResult<&'a [u8], T, ClassError<'a>>;

fn fatal<T>(e : Error) -> PResult<'static, T> {
    Err(nom::Err::Failure(ClassError::Fatal(e)))
}

fn u8_(i : &[u8]) -> PResult<'_, u8> { be_u8(i) }
fn u16_(i : &[u8]) -> PResult<'_, u16> { be_u16(i) }
fn u32_(i : &[u8]) -> PResult<'_, u32> { be_u32(i) }

fn bytes(i : &[u8], n : usize) -> PResult<'_, &[u8]> { take(n)(i) }

fn ref_pair(i : &[u8]) -> PResult<'_, (u16, u16)> {
    let (i, a) = u16_(i)?;
    let (i, b) = u16_(i)?;
    Ok((i, (a, b)))
}

fn constant_parser(input : &[u8]) -> PResult<'_, ConstantInfo> {
    use ConstantInfo::*;

    let (i, tag) = u8_(input)?;
    match tag {
        1 => {
            let (i, length) = u16_(i)?;
            let (i, payload) = bytes(i, usize::from(length))?;
            Ok((i, Utf8(Utf8Constant::new(payload))))
        },
        3  => be_i32(i).map(|(i, v)| (i, Integer(v))),
        4  => be_f32(i).map(|(i, v)| (i, Float(v))),
        5  => be_i64(i).map(|(i, v)| (i, Long(v))),
        6  => be_f64(i).map(|(i, v)| (i, Double(v))),
        7  => u16_(i).map(|(i, name_index)| (i, Class { name_index })),
        8  => u16_(i).map(|(i, string_index)| (i, String { string_index })),
        9  => ref_pair(i).map(|(i, (class_index, name_and_type_index))|
                    (i, FieldRef { class_index, name_and_type_index })),
        10 => ref_pair(i).map(|(i, (class_index, name_and_type_index))|
                    (i, MethodRef { class_index, name_and_type_index })),
        11 => ref_pair(i).map(|(i, (class_index, name_and_type_index))|
                    (i, InterfaceMethodRef { class_index, name_and_type_index })),
        12 => ref_pair(i).map(|(i, (name_index, descriptor_index))|
                    (i, NameAndType { name_index, descriptor_index })),
        _ => fatal(Error::UnsupportedConstantTag(tag)),
    }
}

fn constant_pool_parser(input : &[u8]) -> PResult<'_, ConstantPool> {
    let (mut input, n) = u16_(input)?;
    let n = usize::from(n);
    let mut entries = Vec::with_capacity(n.max(1));
    entries.push(Constant::new(ConstantInfo::Unusable));
    while entries.len() < n {
        let (rest, info) = constant_parser(input)?;
        input = rest;
        // long and double take up two slots; the second one is unusable
        let wide = matches!(info, ConstantInfo::Long(_) | ConstantInfo::Double(_));
        entries.push(Constant::new(info));
        if wide {
            entries.push(Constant::new(ConstantInfo::Unusable));
        }
    }
    Ok((input, ConstantPool::new(entries)))
}

fn exception_entry_parser(i : &[u8]) -> PResult<'_, ExceptionEntry> {
    let (i, start_pc) = u16_(i)?;
    let (i, end_pc) = u16_(i)?;
    let (i, handler_pc) = u16_(i)?;
    let (i, catch_type) = u16_(i)?;
    Ok((i, ExceptionEntry { start_pc, end_pc, handler_pc, catch_type }))
}

fn code_attribute_parser<'a>(pool : &ConstantPool, body : &'a [u8]) -> PResult<'a, CodeAttribute> {
    let length = body.len() as u32;
    let (i, max_stack) = u16_(body)?;
    let (i, max_locals) = u16_(i)?;
    let (i, code_length) = u32_(i)?;
    if code_length >= length {
        return fatal(Error::BadCodeLength { length, code_length });
    }
    let (i, code) = bytes(i, code_length as usize)?;
    let (i, n) = u16_(i)?;
    let (i, exception_table) = count(exception_entry_parser, usize::from(n))(i)?;
    let (i, n) = u16_(i)?;
    let (i, attributes) = count(|i| attribute_parser(pool, i), usize::from(n))(i)?;
    Ok((i, CodeAttribute { max_stack, max_locals, code : code.to_vec(), exception_table, attributes }))
}

fn attribute_parser<'a>(pool : &ConstantPool, input : &'a [u8]) -> PResult<'a, Attribute> {
    let (i, name_index) = u16_(input)?;
    let (i, length) = u32_(i)?;
    let (i, body) = bytes(i, length as usize)?;
    let name = match pool.get_utf8(name_index) {
        Ok(name) => name,
        Err(e) => return fatal(e),
    };
    if name.as_bytes() == b"Code" {
        let (rest, code) = code_attribute_parser(pool, body)?;
        if !rest.is_empty() {
            return fatal(Error::TrailingBytes(rest.len()));
        }
        Ok((i, Attribute::Code(code)))
    } else {
        Ok((i, Attribute::Unknown { name_index, info : body.to_vec() }))
    }
}

fn attributes_parser<'a>(pool : &ConstantPool, input : &'a [u8]) -> PResult<'a, Vec<Attribute>> {
    let (i, n) = u16_(input)?;
    count(|i| attribute_parser(pool, i), usize::from(n))(i)
}

fn member_header(i : &[u8]) -> PResult<'_, (AccessFlags, u16, u16)> {
    let (i, flags) = u16_(i)?;
    let (i, name_index) = u16_(i)?;
    let (i, descriptor_index) = u16_(i)?;
    Ok((i, (AccessFlags::from_bits_truncate(flags), name_index, descriptor_index)))
}

fn field_parser<'a>(pool : &ConstantPool, input : &'a [u8]) -> PResult<'a, FieldInfo> {
    let (i, (flags, name, desc)) = member_header(input)?;
    let (i, attributes) = attributes_parser(pool, i)?;
    Ok((i, FieldInfo::new(flags, name, desc, attributes)))
}

fn method_parser<'a>(pool : &ConstantPool, input : &'a [u8]) -> PResult<'a, MethodInfo> {
    let (i, (flags, name, desc)) = member_header(input)?;
    let (i, attributes) = attributes_parser(pool, i)?;
    Ok((i, MethodInfo::new(flags, name, desc, attributes)))
}

fn class_parser(input : &[u8]) -> PResult<'_, ClassFile> {
    let (i, magic) = u32_(input)?;
    if magic != MAGIC {
        return fatal(Error::BadMagic(magic));
    }
    let (i, minor_version) = u16_(i)?;
    let (i, major_version) = u16_(i)?;
    if minor_version != 0 || !(major_version == 49 || major_version == 50) {
        return fatal(Error::UnsupportedVersion { major : major_version, minor : minor_version });
    }
    let (i, constant_pool) = constant_pool_parser(i)?;
    let (i, access_flags) = u16_(i)?;
    let (i, this_class) = u16_(i)?;
    let (i, super_class) = u16_(i)?;
    let (i, n) = u16_(i)?;
    let (i, interfaces) = count(u16_, usize::from(n))(i)?;
    let (i, n) = u16_(i)?;
    let (i, fields) = count(|i| field_parser(&constant_pool, i), usize::from(n))(i)?;
    let (i, n) = u16_(i)?;
    let (i, methods) = count(|i| method_parser(&constant_pool, i), usize::from(n))(i)?;
    let (i, attributes) = attributes_parser(&constant_pool, i)?;

    Ok((i, ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags : AccessFlags::from_bits_truncate(access_flags),
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    }))
}

/// Parses a complete class file. Trailing bytes are an error.
pub fn parse_class(input : &[u8]) -> Result<ClassFile> {
    match class_parser(input) {
        Ok((rest, _)) if !rest.is_empty() => Err(Error::TrailingBytes(rest.len())),
        Ok((_, class)) => Ok(class),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e.into()),
        Err(nom::Err::Incomplete(_)) => Err(Error::Truncated),
    }
}

#[cfg(test)]
fn minimal_class(major : u16, extra_pool : &[u8], extra_count : u16) -> Vec<u8> {
    let mut v = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0];
    v.extend(&major.to_be_bytes());
    v.extend(&(5 + extra_count).to_be_bytes());
    // 1: Utf8 "Foo", 2: Class #1, 3: Utf8 "java/lang/Object", 4: Class #3
    v.extend(&[1, 0, 3, b'F', b'o', b'o', 7, 0, 1]);
    v.push(1);
    v.extend(&16u16.to_be_bytes());
    v.extend(b"java/lang/Object");
    v.extend(&[7, 0, 3]);
    v.extend(extra_pool);
    v.extend(&[0x00, 0x21, 0, 2, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
    v
}

#[test]
fn test_parse_minimal() -> crate::GeneralResult<()> {
    let class = parse_class(&minimal_class(50, &[], 0))?;
    assert_eq!(class.name()?, "Foo");
    assert_eq!(class.super_name()?, Some("java/lang/Object"));
    assert!(class.access_flags.contains(AccessFlags::PUBLIC));
    assert_eq!(class.constant_pool.count(), 5);
    Ok(())
}

#[test]
fn test_wide_constants_take_two_slots() -> crate::GeneralResult<()> {
    // 5: Long, 6: unusable, 7: Integer
    let extra = [5, 0, 0, 0, 0, 0, 0, 0, 9, 3, 0, 0, 0, 7];
    let class = parse_class(&minimal_class(49, &extra, 3))?;
    let pool = &class.constant_pool;
    assert_eq!(pool.get(5)?.info, ConstantInfo::Long(9));
    assert!(pool.get(6).is_err());
    assert_eq!(pool.get(7)?.info, ConstantInfo::Integer(7));
    Ok(())
}

#[test]
fn test_reject_bad_input() {
    let mut bad_magic = minimal_class(50, &[], 0);
    bad_magic[0] = 0xCB;
    assert!(matches!(parse_class(&bad_magic), Err(Error::BadMagic(0xCBFE_BABE))));

    assert!(matches!(parse_class(&minimal_class(52, &[], 0)),
        Err(Error::UnsupportedVersion { major : 52, minor : 0 })));

    let whole = minimal_class(50, &[], 0);
    assert!(matches!(parse_class(&whole[..whole.len() - 3]), Err(Error::Truncated)));

    let mut long = whole.clone();
    long.push(0);
    assert!(matches!(parse_class(&long), Err(Error::TrailingBytes(1))));

    // tag 15 (MethodHandle) is not part of the supported grammar
    let class = minimal_class(50, &[15, 1, 0, 1], 1);
    assert!(matches!(parse_class(&class), Err(Error::UnsupportedConstantTag(15))));
}
