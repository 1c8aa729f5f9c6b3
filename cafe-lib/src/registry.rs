//! Binary class name to type handle, plus the worklist of classes whose
//! method bodies still have to be built.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use log::info;

use crate::classpath::ClassSource;
use crate::error::{Error, Result};
use crate::parser::parse_class;
use crate::program::{ClassState, Program, TypeId};

#[derive(Debug, Default)]
pub struct Registry {
    by_name : HashMap<String, TypeId>,
    queue : VecDeque<TypeId>,
    queued : HashSet<TypeId>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Pure lookup; never loads anything.
    pub fn get(&self, name : &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Returns the handle for `name`, loading and parsing its class file the
    /// first time. The second element tells whether this call did the loading.
    pub fn resolve(&mut self, program : &mut Program, source : &dyn ClassSource, name : &str)
        -> Result<(TypeId, bool)>
    {
        if let Some(id) = self.get(name) {
            return Ok((id, false));
        }

        let id = program.new_class(name);
        self.by_name.insert(name.to_owned(), id);

        let located = source.find(name)?.ok_or_else(|| Error::ClassNotFound(name.to_owned()))?;
        let class_file = parse_class(&located.bytes)?;
        let found = class_file.name()?;
        if found != name {
            return Err(Error::ClassNotFound(format!("{} (file defines {})", name, found)));
        }

        let class = program.class_mut(id);
        class.flags = class_file.access_flags;
        class.is_extern = located.is_extern;
        class.class_file = Some(Rc::new(class_file));
        class.state = ClassState::Loaded;
        info!("loaded class {}{}", name, if located.is_extern { " (extern)" } else { "" });

        Ok((id, true))
    }

    /// Queues a class for method construction; queuing it again is a no-op.
    pub fn enqueue(&mut self, id : TypeId) {
        if self.queued.insert(id) {
            self.queue.push_back(id);
        }
    }

    pub fn dequeue(&mut self) -> Option<TypeId> {
        self.queue.pop_front()
    }
}

#[test]
fn test_fifo_without_duplicates() {
    let mut r = Registry::new();
    let (a, b, c) = (TypeId::from_raw(0), TypeId::from_raw(1), TypeId::from_raw(2));
    r.enqueue(b);
    r.enqueue(a);
    r.enqueue(b);
    r.enqueue(c);
    assert_eq!(r.dequeue(), Some(b));
    r.enqueue(b);
    assert_eq!(r.dequeue(), Some(a));
    assert_eq!(r.dequeue(), Some(c));
    assert_eq!(r.dequeue(), None);
}

#[test]
fn test_missing_class() {
    let mut r = Registry::new();
    let mut p = Program::new();
    let src = crate::classpath::MemorySource::new();
    assert!(matches!(r.resolve(&mut p, &src, "a/Nope"), Err(Error::ClassNotFound(_))));
}
