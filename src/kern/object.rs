//! Kernel Objects
//!
//! The closed set of object kinds the kernel knows about. All objects
//! live in one id-indexed table owned by the kernel; user space only ever
//! names them through capability selectors.
//!
//! Every slot carries a generation that is bumped when its object is
//! destroyed, so an [`ObjRef`] held by a capability space or a pending
//! message can never reach a later object reusing the same id.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::id_alloc::IdAllocator;
use super::irq::Irq;
use super::pd::Pd;
use super::signal::{SignalContext, SignalReceiver};
use super::thread::Thread;
use super::vm::Vm;
use crate::error::{KernResult, KernelError};
use crate::types::{ObjRef, ObjectId};

// ============================================================================
// Object Kinds
// ============================================================================

/// Kind tag of a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectKind {
    Thread = 1,
    Pd = 2,
    SignalReceiver = 3,
    SignalContext = 4,
    Irq = 5,
    Vm = 6,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Pd => "pd",
            Self::SignalReceiver => "signal receiver",
            Self::SignalContext => "signal context",
            Self::Irq => "irq",
            Self::Vm => "vm",
        }
    }
}

/// A kernel object of any kind
#[derive(Debug)]
pub enum KernelObject {
    Thread(Box<Thread>),
    Pd(Box<Pd>),
    SignalReceiver(SignalReceiver),
    SignalContext(SignalContext),
    Irq(Irq),
    Vm(Box<Vm>),
}

impl KernelObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Thread(_) => ObjectKind::Thread,
            Self::Pd(_) => ObjectKind::Pd,
            Self::SignalReceiver(_) => ObjectKind::SignalReceiver,
            Self::SignalContext(_) => ObjectKind::SignalContext,
            Self::Irq(_) => ObjectKind::Irq,
            Self::Vm(_) => ObjectKind::Vm,
        }
    }
}

// ============================================================================
// Object Table
// ============================================================================

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    object: Option<KernelObject>,
}

/// Id-indexed directory of all kernel objects
#[derive(Debug)]
pub struct ObjectTable {
    slots: Vec<Slot>,
    ids: IdAllocator,
}

/// Generate a typed shared and mutable accessor for one object kind
macro_rules! object_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $get(&self, id: ObjectId) -> KernResult<&$ty> {
            match self.get(id) {
                Some(KernelObject::$variant(obj)) => {
                    let obj: &$ty = obj;
                    Ok(obj)
                }
                _ => Err(KernelError::Denied),
            }
        }

        pub fn $get_mut(&mut self, id: ObjectId) -> KernResult<&mut $ty> {
            match self.get_mut(id) {
                Some(KernelObject::$variant(obj)) => {
                    let obj: &mut $ty = obj;
                    Ok(obj)
                }
                _ => Err(KernelError::Denied),
            }
        }
    };
}

impl ObjectTable {
    /// Create a table for up to `capacity` objects, ids start at 1
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            ids: IdAllocator::new(1, capacity),
        }
    }

    /// Store a new object under the lowest free id
    pub fn insert(&mut self, object: KernelObject) -> KernResult<ObjRef> {
        let raw = self.ids.alloc().ok_or_else(|| {
            log::warn!("object table: out of ids for {}", object.kind().name());
            KernelError::OutOfResources
        })?;
        let id = ObjectId(raw);
        if self.slots.len() <= id.index() {
            self.slots.resize_with(id.index() + 1, Slot::default);
        }
        let slot = &mut self.slots[id.index()];
        assert!(slot.object.is_none(), "object table: slot {} in use", id);
        slot.object = Some(object);
        Ok(ObjRef::new(id, slot.generation))
    }

    /// Take an object out of the table and retire its id
    pub fn remove(&mut self, id: ObjectId) -> Option<KernelObject> {
        let slot = self.slots.get_mut(id.index())?;
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.ids.free(id.0);
        Some(object)
    }

    pub fn get(&self, id: ObjectId) -> Option<&KernelObject> {
        self.slots.get(id.index())?.object.as_ref()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut KernelObject> {
        self.slots.get_mut(id.index())?.object.as_mut()
    }

    /// Current reference of a live object
    pub fn reference(&self, id: ObjectId) -> Option<ObjRef> {
        let slot = self.slots.get(id.index())?;
        slot.object
            .as_ref()
            .map(|_| ObjRef::new(id, slot.generation))
    }

    /// Is `obj` still the object living under its id
    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.reference(obj.id) == Some(obj)
    }

    /// Id behind a reference, `None` if the object is gone
    pub fn resolve(&self, obj: ObjRef) -> Option<ObjectId> {
        if self.is_live(obj) {
            Some(obj.id)
        } else {
            None
        }
    }

    pub fn kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.get(id).map(KernelObject::kind)
    }

    /// Ids of all live objects of `kind`
    pub fn ids_of(&self, kind: ObjectKind) -> Vec<ObjectId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.object.as_ref().map(KernelObject::kind) == Some(kind))
            .map(|(index, _)| ObjectId(index as u32))
            .collect()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.ids.used()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    object_accessors!(thread, thread_mut, Thread, Thread);
    object_accessors!(pd, pd_mut, Pd, Pd);
    object_accessors!(receiver, receiver_mut, SignalReceiver, SignalReceiver);
    object_accessors!(context, context_mut, SignalContext, SignalContext);
    object_accessors!(irq, irq_mut, Irq, Irq);
    object_accessors!(vm, vm_mut, Vm, Vm);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_kinds() {
        let mut table = ObjectTable::new(4);
        let r = table
            .insert(KernelObject::SignalReceiver(SignalReceiver::new()))
            .unwrap();
        assert_eq!(r.id, ObjectId(1));
        assert_eq!(table.kind(r.id), Some(ObjectKind::SignalReceiver));
        assert!(table.receiver(r.id).is_ok());
        assert_eq!(table.thread(r.id).err(), Some(KernelError::Denied));
        assert_eq!(table.ids_of(ObjectKind::SignalReceiver), alloc::vec![r.id]);
    }

    #[test]
    fn test_generation_retires_refs() {
        let mut table = ObjectTable::new(4);
        let first = table
            .insert(KernelObject::SignalReceiver(SignalReceiver::new()))
            .unwrap();
        assert!(table.remove(first.id).is_some());
        assert!(!table.is_live(first));
        let second = table
            .insert(KernelObject::SignalReceiver(SignalReceiver::new()))
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_ne!(second.generation, first.generation);
        assert_eq!(table.resolve(first), None);
        assert_eq!(table.resolve(second), Some(second.id));
    }

    #[test]
    fn test_capacity() {
        let mut table = ObjectTable::new(1);
        table
            .insert(KernelObject::SignalReceiver(SignalReceiver::new()))
            .unwrap();
        assert_eq!(
            table
                .insert(KernelObject::SignalReceiver(SignalReceiver::new()))
                .err(),
            Some(KernelError::OutOfResources)
        );
        assert_eq!(table.len(), 1);
    }
}
