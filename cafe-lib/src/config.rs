use std::path::PathBuf;

/// One place to look for `<prefix><binary name>.class`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassPathEntry {
    /// Prepended verbatim to the binary class name, so directories need a trailing `/`.
    pub prefix : String,
    /// Classes found here are compiled against but not emitted.
    pub is_extern : bool,
}

impl ClassPathEntry {
    pub fn new(prefix : &str, is_extern : bool) -> Self {
        let mut prefix = prefix.to_owned();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix, is_extern }
    }
}

/// Which runtime the emitted objects link against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Runtime {
    /// The small stand-in runtime; objects are allocated with `calloc`.
    SimpleRt,
    /// The GCJ class library and its allocation entry points.
    Gcj,
}

impl Default for Runtime {
    fn default() -> Self { Runtime::SimpleRt }
}

#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Searched front to back.
    pub class_path : Vec<ClassPathEntry>,
    pub runtime : Runtime,
    pub output : Option<PathBuf>,
    pub verbose : bool,
}

impl Options {
    /// `-cp`: searched before everything given so far.
    pub fn prepend_class_path(&mut self, prefix : &str) {
        self.class_path.insert(0, ClassPathEntry::new(prefix, false));
    }

    /// `--bootclasspath`: searched after everything given so far.
    pub fn append_boot_class_path(&mut self, prefix : &str) {
        self.class_path.push(ClassPathEntry::new(prefix, false));
    }

    /// `--externclasspath`: like the boot class path, but nothing found there is emitted.
    pub fn append_extern_class_path(&mut self, prefix : &str) {
        self.class_path.push(ClassPathEntry::new(prefix, true));
    }
}

#[test]
fn test_class_path_order() {
    let mut o = Options::default();
    o.append_boot_class_path("boot");
    o.prepend_class_path("user/");
    o.append_extern_class_path("rt");
    o.prepend_class_path("first");
    let prefixes : Vec<_> = o.class_path.iter().map(|e| e.prefix.as_str()).collect();
    assert_eq!(prefixes, vec!["first/", "user/", "boot/", "rt/"]);
    assert!(o.class_path[3].is_extern);
    assert!(!o.class_path[2].is_extern);
}
