#![deny(clippy::needless_borrow)]

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use log::info;

use cafe::descriptor::MethodDescriptor;
use cafe::mangle::{self, MemberKind};
use cafe::{Options, Runtime};

type TerminatingResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn translate_class(root : &str, options : &Options) -> TerminatingResult {
    let compilation = cafe::compile(root, options)?;

    let short = root.rsplit('/').next().unwrap_or(root);
    let output = options.output.clone().unwrap_or_else(|| PathBuf::from(format!("{}.ir", short)));
    let startup = output.with_extension("startup.c");

    info!("writing {} and {}", output.display(), startup.display());
    write!(File::create(&output)?, "{}", compilation)?;
    File::create(&startup)?.write_all(compilation.startup.as_bytes())?;
    Ok(())
}

/// `a/b/C.name:(I)V` names a method, `a/b/C.name` a field and `a/b/C` the
/// vtable and class object.
fn mangle_triple(triple : &str, is_static : bool) -> std::result::Result<Vec<String>, Box<dyn std::error::Error>> {
    let (class, member) = match triple.split_once('.') {
        Some((c, m)) => (c, Some(m)),
        None => (triple, None),
    };
    Ok(match member.map(|m| m.split_once(':').unwrap_or((m, ""))) {
        None => vec![ mangle::mangle_vtable_name(class)?, mangle::mangle_rtti_name(class)? ],
        Some((name, "")) => vec![ mangle::mangle_member_name(class, name, MemberKind::Field)? ],
        Some((name, descriptor)) => {
            let descriptor = MethodDescriptor::parse(descriptor)?;
            vec![ mangle::mangle_member_name(class, name, MemberKind::Method { descriptor : &descriptor, is_static })? ]
        },
    })
}

#[test]
fn test_mangle_spec() -> TerminatingResult {
    assert_eq!(mangle_triple("a/b/C.baz:(I)V", false)?, vec![ "_ZN1a1b1C3bazEJvi" ]);
    assert_eq!(mangle_triple("java/lang/String", false)?, vec![ "_ZTVN4java4lang6StringE", "_ZN4java4lang6String6class$E" ]);
    assert!(mangle_triple("a/B.f:(", false).is_err());
    Ok(())
}

fn main() -> TerminatingResult {
    use clap::*;

    let m =
        app_from_crate!()
            .arg(Arg::with_name("verbose")
                    .short("v")
                    .long("verbose")
                    .global(true)
                    .help("Logs progress at debug level unless RUST_LOG says otherwise")
                )
            .subcommand(
                SubCommand::with_name("translate")
                    .about("Compiles a root class and everything it references")
                    .arg(Arg::with_name("classpath")
                            .long("classpath")
                            .visible_alias("cp")
                            .help("Searches this directory before all others")
                            .takes_value(true)
                            .multiple(true)
                            .number_of_values(1)
                        )
                    .arg(Arg::with_name("bootclasspath")
                            .long("bootclasspath")
                            .help("Searches this directory after all others")
                            .takes_value(true)
                            .multiple(true)
                            .number_of_values(1)
                        )
                    .arg(Arg::with_name("externclasspath")
                            .long("externclasspath")
                            .help("Compiles against classes in this directory without emitting them")
                            .takes_value(true)
                            .multiple(true)
                            .number_of_values(1)
                        )
                    .arg(Arg::with_name("output")
                            .short("o")
                            .long("output")
                            .help("Specifies the output file name")
                            .takes_value(true)
                        )
                    .arg(Arg::with_name("gcj")
                            .long("gcj")
                            .help("Allocates through the GCJ runtime")
                            .conflicts_with("simplert")
                        )
                    .arg(Arg::with_name("simplert")
                            .long("simplert")
                            .help("Allocates with calloc, for the simple runtime (default)")
                        )
                    .arg(Arg::with_name("class")
                            .help("Names the root class, as in a/b/Main")
                            .required(true)
                        )
                )
            .subcommand(
                SubCommand::with_name("mangle")
                    .about("Mangles class.member:descriptor triples into linkage symbols")
                    .arg(Arg::with_name("static")
                            .long("static")
                            .help("Mangles methods as static")
                        )
                    .arg(Arg::with_name("strings")
                            .help("Provides inputs for mangling")
                            .multiple(true)
                            .required(true)
                        )
                )
            .subcommand(
                SubCommand::with_name("demangle")
                    .about("Decodes linkage symbols into their class and member names")
                    .arg(Arg::with_name("strings")
                            .help("Provides symbols for demangling")
                            .multiple(true)
                            .required(true)
                        )
                )
            .get_matches();

    let verbose = m.is_present("verbose") || m.subcommand().1.map_or(false, |s| s.is_present("verbose"));
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Some(m) = m.subcommand_matches("translate") {
        let mut options = Options::default();
        for dir in m.values_of("bootclasspath").into_iter().flatten() {
            options.append_boot_class_path(dir);
        }
        for dir in m.values_of("externclasspath").into_iter().flatten() {
            options.append_extern_class_path(dir);
        }
        // later -cp entries take precedence over earlier ones
        for dir in m.values_of("classpath").into_iter().flatten() {
            options.prepend_class_path(dir);
        }
        if options.class_path.is_empty() {
            options.prepend_class_path(".");
        }
        options.runtime = if m.is_present("gcj") { Runtime::Gcj } else { Runtime::SimpleRt };
        options.output = m.value_of("output").map(PathBuf::from);
        options.verbose = verbose;

        let root = m.value_of("class").ok_or("expected a root class")?;
        let root = root.trim_end_matches(".class").replace('.', "/");
        translate_class(&root, &options)?;
    } else if let Some(m) = m.subcommand_matches("mangle") {
        let is_static = m.is_present("static");
        for triple in m.values_of("strings").ok_or("expected at least one string to mangle")? {
            for symbol in mangle_triple(triple, is_static)? {
                println!("{}", symbol);
            }
        }
    } else if let Some(m) = m.subcommand_matches("demangle") {
        for symbol in m.values_of("strings").ok_or("expected at least one string to demangle")? {
            let de = mangle::demangle(symbol)?;
            match de.member {
                Some(member) => println!("{}.{}{}", de.class, member, de.signature),
                None => println!("vtable for {}", de.class),
            }
        }
    }

    Ok(())
}
