use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every condition that stops a compilation. None of them is recoverable: the
/// driver never emits anything for a class it could not fully translate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // malformed input
    #[error("not a class file (bad magic number {0:#010x})")]
    BadMagic(u32),
    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major : u16, minor : u16 },
    #[error("class file is truncated")]
    Truncated,
    #[error("{0} unexpected bytes after end of class file")]
    TrailingBytes(usize),
    #[error("unsupported constant pool tag {0}")]
    UnsupportedConstantTag(u8),
    #[error("code attribute length {length} cannot hold {code_length} bytes of code")]
    BadCodeLength { length : u32, code_length : u32 },

    // internal consistency of the input
    #[error("invalid constant pool index {0}")]
    InvalidConstantIndex(u16),
    #[error("constant pool entry {index} is not a {expected}")]
    UnexpectedConstant { index : u16, expected : &'static str },
    #[error("invalid type descriptor `{0}`")]
    InvalidDescriptor(String),
    #[error("could not find class {0}")]
    ClassNotFound(String),
    #[error("could not find member {class}.{name} ({descriptor})")]
    MissingMember { class : String, name : String, descriptor : String },
    #[error("{class}: implementation of method {method} from interface {interface} missing in non-abstract class")]
    MissingInterfaceImplementation { class : String, method : String, interface : String },
    #[error("method {0} has no code")]
    MissingCode(String),

    // translation
    #[error("operand stack underflow at PC {pc}")]
    StackUnderflow { pc : usize },
    #[error("code exceeds stack limit at PC {pc}")]
    StackOverflow { pc : usize },
    #[error("local variable {index} out of range at PC {pc}")]
    LocalOutOfRange { pc : usize, index : u16 },
    #[error("stack pointer mismatch at PC {pc}")]
    StackPointerMismatch { pc : usize },
    #[error("two-slot value split by a one-slot operation at PC {pc}")]
    SlotArity { pc : usize },
    #[error("unknown or undecodable opcode: {0}")]
    UnknownOpcode(String),
    #[error("unsupported instruction at PC {pc}: {what}")]
    Unsupported { pc : usize, what : String },
    #[error("branch at PC {pc} targets {target}, outside of the method code")]
    InvalidBranchTarget { pc : usize, target : isize },

    // mangling
    #[error("mangling compression table exceeds 36 entries")]
    CompressionTableFull,
    #[error("invalid mangled symbol `{0}`")]
    InvalidSymbol(String),
}
