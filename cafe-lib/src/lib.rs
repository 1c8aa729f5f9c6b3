#![deny(clippy::items_after_statements)]
#![deny(clippy::needless_borrow)]
#![deny(clippy::option_unwrap_used)]
#![deny(clippy::redundant_field_names)]
#![deny(clippy::result_unwrap_used)]
#![deny(unconditional_recursion)]

//! Ahead-of-time compilation of JVM class files into value graphs and global
//! data laid out for the GCJ object ABI.
//!
//! Starting from one root class, every class it references is loaded from the
//! class path, given a layout, a vtable and a class descriptor, and has its
//! methods translated into SSA graphs. Object-oriented operations in those
//! graphs are finally lowered onto the runtime's entry points.

pub mod classfile;
pub mod classpath;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod gcj;
pub mod ir;
pub mod jvmtypes;
pub mod loader;
pub mod mangle;
pub mod oo;
pub mod parser;
pub mod program;
pub mod registry;
pub mod ssa;
pub mod stack;
pub mod translate;

use std::fmt;

use log::info;

pub use config::{ClassPathEntry, Options, Runtime};
pub use error::{Error, Result};

use classpath::{ClassPath, ClassSource};
use loader::{Loader, CLASS_CLASS};
use program::{Program, TypeId};

pub type GeneralResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// The whole program reachable from a root class, lowered and ready for code
/// generation.
#[derive(Debug)]
pub struct Compilation {
    pub program : Program,
    pub root : TypeId,
    /// C source handing the root class to the runtime's launcher.
    pub startup : String,
}

impl Compilation {
    /// Linkage symbol of the root class object.
    pub fn root_symbol(&self) -> Option<&str> {
        self.program.class(self.root).rtti.map(|r| self.program.entity(r).ld_name.as_str())
    }
}

impl fmt::Display for Compilation {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program)
    }
}

/// Compiles `root` (a binary name such as `a/b/Main`) and everything it
/// references, reading class files from `options.class_path`.
pub fn compile(root : &str, options : &Options) -> Result<Compilation> {
    let source = ClassPath::new(options.class_path.clone());
    compile_from(&source, root, options)
}

pub fn compile_from(source : &dyn ClassSource, root : &str, options : &Options) -> Result<Compilation> {
    let mut loader = Loader::new(source);

    // every class descriptor is an instance of java/lang/Class
    let class_class = loader.get_class_type(CLASS_CLASS)?;
    loader.registry.enqueue(class_class);
    let root_id = loader.get_class_type(root)?;
    loader.registry.enqueue(root_id);

    while let Some(id) = loader.registry.dequeue() {
        if loader.program.class(id).is_extern {
            continue;
        }
        loader.finalize_class_type(id)?;
        loader.construct_class_methods(id)?;
    }

    oo::Lowering {
        program : &mut loader.program,
        runtime : &mut loader.runtime,
        strings : &mut loader.strings,
        flavor : options.runtime,
    }.lower_program()?;
    oo::remove_extern_vtables(&mut loader.program);

    let program = loader.program;
    let startup = {
        let rtti = program.class(root_id).rtti.map(|r| program.entity(r).ld_name.clone());
        gcj::startup_stub(&rtti.ok_or_else(|| Error::ClassNotFound(root.to_owned()))?)
    };
    info!("compiled {} classes from root {}", program.classes().count(), root);

    Ok(Compilation { program, root : root_id, startup })
}
