//! Protection Domains
//!
//! A PD is an address space (translation-table root and ASID), a
//! capability space and the set of threads bound to it. The CPU mask
//! records every CPU that ran a job of the PD since its creation;
//! translation updates and the retirement of its ASID are broadcast to
//! exactly those CPUs.

use alloc::collections::BTreeSet;

use super::kernel::KernelData;
use super::object::{KernelObject, ObjectKind};
use crate::board::{MapFlags, MmuError};
use crate::error::{KernResult, KernelError};
use crate::ipc::message::{label, Label};
use crate::ipc::space::CapSpace;
use crate::types::{CapId, ObjectId, Word};

/// Number of address space ids, id 0 belongs to core
pub const MAX_ASIDS: usize = 256;

/// `map_region` flag bits
pub const MAP_WRITABLE: Word = 1 << 0;
pub const MAP_EXECUTABLE: Word = 1 << 1;

/// Protection domain
#[derive(Debug)]
pub struct Pd {
    pub label: Label,
    /// Root of the translation table
    pub root: Word,
    pub asid: u32,
    pub caps: CapSpace,
    /// Threads started in this PD
    pub threads: BTreeSet<ObjectId>,
    /// CPUs that may hold cached translations
    pub cpu_mask: u32,
    pub core: bool,
}

impl Pd {
    pub fn new(label: Label, root: Word, asid: u32, max_caps: usize, core: bool) -> Self {
        Self {
            label,
            root,
            asid,
            caps: CapSpace::new(max_caps),
            threads: BTreeSet::new(),
            cpu_mask: 0,
            core,
        }
    }
}

fn map_flags(word: Word) -> MapFlags {
    MapFlags {
        writable: word & MAP_WRITABLE != 0,
        executable: word & MAP_EXECUTABLE != 0,
    }
}

impl From<MmuError> for KernelError {
    fn from(err: MmuError) -> Self {
        match err {
            MmuError::Misaligned => KernelError::InvalidArgument,
            MmuError::Overlap => KernelError::Denied,
            MmuError::NoMemory => KernelError::OutOfResources,
        }
    }
}

impl KernelData {
    /// Create a PD with a fresh address space, labeled from the caller's UTCB
    pub(crate) fn new_pd(&mut self, caller: ObjectId) -> KernResult<CapId> {
        let name = self.objects.thread(caller)?.utcb.name.clone();
        let name = if name.is_empty() { label("pd") } else { name };
        let asid = self.asids.alloc().ok_or(KernelError::OutOfResources)?;
        let pd = Pd::new(name, asid as Word, asid, self.config.max_caps, false);
        match self.create(caller, KernelObject::Pd(alloc::boxed::Box::new(pd))) {
            Ok((_, cap)) => Ok(cap),
            Err(err) => {
                self.asids.free(asid);
                Err(err)
            }
        }
    }

    /// Delete an empty PD, `true` if the caller waits for its ASID to be
    /// flushed on the CPUs that ran it
    pub(crate) fn delete_pd(&mut self, caller: ObjectId, cap: CapId) -> KernResult<bool> {
        let pd = self.lookup_kind(caller, cap, ObjectKind::Pd)?;
        let p = self.objects.pd(pd)?;
        if p.core || !p.threads.is_empty() {
            log::warn!(
                "{}: cannot delete pd {} with {} thread(s)",
                self.label_of(caller),
                p.label,
                p.threads.len()
            );
            return Err(KernelError::Denied);
        }
        let (root, asid, mask) = (p.root, p.asid, p.cpu_mask);
        self.board.mmu.remove(root, 0, Word::MAX);
        self.retire(pd);
        Ok(self.retire_asid(caller, asid, mask))
    }

    /// Insert a mapping into a PD's translation table
    pub(crate) fn map_region(
        &mut self,
        caller: ObjectId,
        pd_cap: CapId,
        vaddr: Word,
        paddr: Word,
        size: Word,
        flags: Word,
    ) -> KernResult<()> {
        let pd = self.lookup_kind(caller, pd_cap, ObjectKind::Pd)?;
        let root = self.objects.pd(pd)?.root;
        self.board
            .mmu
            .insert(root, vaddr, paddr, size, map_flags(flags))
            .map_err(|err| {
                log::debug!("{}: map {:#x}+{:#x} failed: {:?}", self.label_of(caller), vaddr, size, err);
                KernelError::from(err)
            })
    }

    /// Remove a range and invalidate it everywhere, `true` if the caller waits
    pub(crate) fn unmap_region(
        &mut self,
        caller: ObjectId,
        pd_cap: CapId,
        vaddr: Word,
        size: Word,
    ) -> KernResult<bool> {
        let pd = self.lookup_kind(caller, pd_cap, ObjectKind::Pd)?;
        let root = self.objects.pd(pd)?.root;
        self.board.mmu.remove(root, vaddr, size);
        Ok(self.broadcast_invalidation(caller, pd))
    }

    /// Invalidate the cached translations of a PD, `true` if the caller waits
    pub(crate) fn update_pd(&mut self, caller: ObjectId, pd_cap: CapId) -> KernResult<bool> {
        let pd = self.lookup_kind(caller, pd_cap, ObjectKind::Pd)?;
        Ok(self.broadcast_invalidation(caller, pd))
    }

    /// Hand the object behind one of the caller's selectors to another PD
    pub(crate) fn install_cap(&mut self, caller: ObjectId, pd_cap: CapId, obj_cap: CapId) -> KernResult<CapId> {
        let pd = self.lookup_kind(caller, pd_cap, ObjectKind::Pd)?;
        let obj = self.lookup(caller, obj_cap)?;
        let obj = self.objects.reference(obj).ok_or(KernelError::Denied)?;
        self.objects.pd_mut(pd)?.caps.insert(obj)
    }

    /// Drop a selector from the caller's own capability space
    pub(crate) fn delete_cap(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let pd = self.objects.thread(caller)?.pd.ok_or(KernelError::Denied)?;
        self.objects
            .pd_mut(pd)?
            .caps
            .remove(cap)
            .map(|_| ())
            .ok_or(KernelError::Denied)
    }
}
