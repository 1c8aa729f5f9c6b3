//! Where class-file bytes come from.

use std::collections::HashMap;
use std::fs;
use std::io;

use log::trace;

use crate::config::ClassPathEntry;
use crate::error::Result;

/// The bytes of a class file, and whether they came from an extern entry.
#[derive(Clone, Debug)]
pub struct Located {
    pub bytes : Vec<u8>,
    pub is_extern : bool,
}

pub trait ClassSource {
    /// Looks up a class by binary name (`java/lang/Object`). `Ok(None)` means
    /// it is nowhere to be found.
    fn find(&self, name : &str) -> Result<Option<Located>>;
}

/// An ordered list of directory prefixes on the file system.
#[derive(Clone, Debug, Default)]
pub struct ClassPath {
    entries : Vec<ClassPathEntry>,
}

impl ClassPath {
    pub fn new(entries : Vec<ClassPathEntry>) -> Self { Self { entries } }
}

impl ClassSource for ClassPath {
    fn find(&self, name : &str) -> Result<Option<Located>> {
        for entry in &self.entries {
            let path = format!("{}{}.class", entry.prefix, name);
            trace!("trying {}", path);
            match fs::read(&path) {
                Ok(bytes) => return Ok(Some(Located { bytes, is_extern : entry.is_extern })),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// Class files held in memory, keyed by binary name.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    classes : HashMap<String, Located>,
}

impl MemorySource {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, name : &str, bytes : Vec<u8>) {
        self.classes.insert(name.to_owned(), Located { bytes, is_extern : false });
    }

    pub fn insert_extern(&mut self, name : &str, bytes : Vec<u8>) {
        self.classes.insert(name.to_owned(), Located { bytes, is_extern : true });
    }
}

impl ClassSource for MemorySource {
    fn find(&self, name : &str) -> Result<Option<Located>> {
        Ok(self.classes.get(name).cloned())
    }
}

#[test]
fn test_class_path_search() -> crate::GeneralResult<()> {
    let dir = std::env::temp_dir().join(format!("cafe-classpath-{}", std::process::id()));
    let first = dir.join("first");
    let second = dir.join("second");
    fs::create_dir_all(first.join("a"))?;
    fs::create_dir_all(second.join("a"))?;
    fs::write(first.join("a/B.class"), b"first")?;
    fs::write(second.join("a/B.class"), b"second")?;
    fs::write(second.join("a/C.class"), b"only")?;

    let entry = |p : &std::path::Path, ext| ClassPathEntry::new(&p.to_string_lossy(), ext);
    let cp = ClassPath::new(vec![entry(&first, false), entry(&second, true)]);

    let b = cp.find("a/B")?.ok_or("a/B not found")?;
    assert_eq!(b.bytes, b"first");
    assert!(!b.is_extern);
    let c = cp.find("a/C")?.ok_or("a/C not found")?;
    assert!(c.is_extern);
    assert!(cp.find("a/D")?.is_none());

    fs::remove_dir_all(&dir)?;
    Ok(())
}
