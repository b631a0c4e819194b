// virtio-gpu memory regions
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Guest memory regions handed to the device by `VIRTIO_GPU_CMD_MEMORY_CREATE`.
//!
//! Every region is keyed by the identifier the guest picked for it and holds
//! the host mappings of its scatter-gather entries until the last reference
//! is released.

use std::collections::BTreeMap;

use log::{debug, trace, warn};
use thiserror::Error as ThisError;
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryError, GuestMemoryMmap};

use crate::{
    protocol::{
        GpuResponse, VIRTIO_GPU_MAX_MEM_ENTRIES, VIRTIO_GPU_MEMORY_HOST_COHERENT,
        VIRTIO_GPU_MEMORY_SHARED_GUEST, VIRTIO_GPU_MEMORY_TRANSFER,
    },
    MemoryTypes,
};

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Memory region {0} already exists")]
    DuplicateId(u32),
    #[error("Unknown memory region {0}")]
    UnknownId(u32),
    #[error("Invalid memory type {0}")]
    InvalidType(u32),
    #[error("Memory type {0:?} is not supported by this device")]
    UnsupportedType(MemoryType),
    #[error("Memory region {0} already has backing storage")]
    AlreadyBacked(u32),
    #[error("Memory region {0} is not referenced by the guest")]
    NoGuestReference(u32),
    #[error("Memory region {0} has too many references")]
    TooManyRefs(u32),
    #[error("Too many memory entries: {0}")]
    TooManyEntries(usize),
    #[error("Memory entry {index} at {addr:#x} has zero length")]
    EmptyEntry { index: usize, addr: u64 },
    #[error("Failed to map memory entry {index} at {addr:#x}: {source}")]
    MapFailed {
        index: usize,
        addr: u64,
        source: GuestMemoryError,
    },
    #[error("Memory entry {index} at {addr:#x} mapped {mapped} of {len} bytes")]
    ShortMapping {
        index: usize,
        addr: u64,
        len: usize,
        mapped: usize,
    },
}

impl From<Error> for GpuResponse {
    fn from(e: Error) -> Self {
        match e {
            Error::UnknownId(_) => Self::ErrInvalidResourceId,
            Error::DuplicateId(_)
            | Error::InvalidType(_)
            | Error::UnsupportedType(_)
            | Error::AlreadyBacked(_)
            | Error::NoGuestReference(_)
            | Error::EmptyEntry { .. } => Self::ErrInvalidParameter,
            Error::TooManyRefs(_)
            | Error::TooManyEntries(_)
            | Error::MapFailed { .. }
            | Error::ShortMapping { .. } => Self::ErrUnspec,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryType {
    /// Guest pages used as a staging area for transfers.
    Transfer,
    /// Guest pages accessed in place by the host.
    SharedGuest,
    /// Host memory exposed coherently to the guest.
    HostCoherent,
}

impl TryFrom<u32> for MemoryType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            VIRTIO_GPU_MEMORY_TRANSFER => Ok(Self::Transfer),
            VIRTIO_GPU_MEMORY_SHARED_GUEST => Ok(Self::SharedGuest),
            VIRTIO_GPU_MEMORY_HOST_COHERENT => Ok(Self::HostCoherent),
            other => Err(Error::InvalidType(other)),
        }
    }
}

impl From<MemoryType> for u32 {
    fn from(memory_type: MemoryType) -> Self {
        match memory_type {
            MemoryType::Transfer => VIRTIO_GPU_MEMORY_TRANSFER,
            MemoryType::SharedGuest => VIRTIO_GPU_MEMORY_SHARED_GUEST,
            MemoryType::HostCoherent => VIRTIO_GPU_MEMORY_HOST_COHERENT,
        }
    }
}

/// A guest range translated into host address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostMapping {
    pub host_addr: u64,
    pub len: usize,
}

/// Translation of guest physical ranges into host pointers usable for DMA.
pub trait GuestDma {
    /// Maps up to `len` bytes at `addr`. The returned mapping may be shorter
    /// than requested.
    fn map(
        &self,
        addr: GuestAddress,
        len: usize,
    ) -> std::result::Result<HostMapping, GuestMemoryError>;

    /// Releases a mapping obtained from `map`.
    fn unmap(&self, mapping: HostMapping);
}

impl GuestDma for GuestMemoryMmap<()> {
    fn map(
        &self,
        addr: GuestAddress,
        len: usize,
    ) -> std::result::Result<HostMapping, GuestMemoryError> {
        let slice = self.get_slice(addr, len)?;
        Ok(HostMapping {
            host_addr: slice.ptr_guard_mut().as_ptr() as u64,
            len: slice.len(),
        })
    }

    // The guest memory stays mapped for the lifetime of the backend.
    fn unmap(&self, _mapping: HostMapping) {}
}

/// One scatter-gather entry of a region together with its host mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryEntry {
    pub addr: GuestAddress,
    pub mapping: HostMapping,
}

/// The result of translating a scatter-gather list.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MappedIov {
    pub entries: Vec<MemoryEntry>,
    pub size: u64,
}

/// Maps every `(addr, len)` entry of `sg_list`. If an entry fails to map, or
/// maps short, the entries mapped so far are released again and the failing
/// index is reported.
pub fn create_iov<D: GuestDma + ?Sized>(
    dma: &D,
    sg_list: &[(GuestAddress, usize)],
) -> Result<MappedIov> {
    if sg_list.len() > VIRTIO_GPU_MAX_MEM_ENTRIES as usize {
        return Err(Error::TooManyEntries(sg_list.len()));
    }

    let mut iov = MappedIov {
        entries: Vec::with_capacity(sg_list.len()),
        size: 0,
    };
    for (index, &(addr, len)) in sg_list.iter().enumerate() {
        match map_entry(dma, index, addr, len) {
            Ok(mapping) => {
                iov.entries.push(MemoryEntry { addr, mapping });
                iov.size += len as u64;
            }
            Err(e) => {
                warn!("{e}, releasing {index} mapped entries");
                cleanup_iov(dma, &iov.entries);
                return Err(e);
            }
        }
    }
    Ok(iov)
}

fn map_entry<D: GuestDma + ?Sized>(
    dma: &D,
    index: usize,
    addr: GuestAddress,
    len: usize,
) -> Result<HostMapping> {
    if len == 0 {
        return Err(Error::EmptyEntry {
            index,
            addr: addr.0,
        });
    }

    let mapping = dma.map(addr, len).map_err(|source| Error::MapFailed {
        index,
        addr: addr.0,
        source,
    })?;
    if mapping.len != len {
        dma.unmap(mapping);
        return Err(Error::ShortMapping {
            index,
            addr: addr.0,
            len,
            mapped: mapping.len,
        });
    }
    Ok(mapping)
}

/// Releases the host mapping of every entry.
pub fn cleanup_iov<D: GuestDma + ?Sized>(dma: &D, entries: &[MemoryEntry]) {
    for entry in entries {
        dma.unmap(entry.mapping);
    }
}

#[derive(Debug)]
pub struct MemoryRegion {
    memory_id: u32,
    memory_type: MemoryType,
    refs: u32,
    size: u64,
    guest_ref: bool,
    entries: Vec<MemoryEntry>,
}

impl MemoryRegion {
    fn new(memory_id: u32, memory_type: MemoryType, guest_ref: bool) -> Self {
        Self {
            memory_id,
            memory_type,
            refs: 1,
            size: 0,
            guest_ref,
            entries: Vec::new(),
        }
    }

    pub const fn memory_id(&self) -> u32 {
        self.memory_id
    }

    pub const fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub const fn refs(&self) -> u32 {
        self.refs
    }

    /// Total length of the backing entries in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn guest_ref(&self) -> bool {
        self.guest_ref
    }

    pub fn iov_cnt(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    /// Guest physical addresses of the backing, in order.
    pub fn addrs(&self) -> impl Iterator<Item = GuestAddress> + '_ {
        self.entries.iter().map(|entry| entry.addr)
    }

    /// Host `(address, length)` pairs of the backing, in order.
    pub fn iovecs(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.entries
            .iter()
            .map(|entry| (entry.mapping.host_addr, entry.mapping.len))
    }

    pub(crate) fn set_backing(&mut self, iov: MappedIov) -> Result<()> {
        if !self.entries.is_empty() {
            return Err(Error::AlreadyBacked(self.memory_id));
        }
        self.entries = iov.entries;
        self.size = iov.size;
        Ok(())
    }

    fn release_backing<D: GuestDma + ?Sized>(&mut self, dma: &D) {
        cleanup_iov(dma, &self.entries);
        self.entries.clear();
        self.size = 0;
    }
}

/// Outcome of dropping a reference with `MemoryRegionTable::unref`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Unref {
    /// Other references keep the region alive.
    Live(u32),
    /// That was the last reference; the region is gone.
    Dropped,
}

/// The memory regions of one device, keyed by the guest's identifier.
#[derive(Debug, Default)]
pub struct MemoryRegionTable {
    regions: BTreeMap<u32, MemoryRegion>,
    memory_types: MemoryTypes,
}

impl MemoryRegionTable {
    pub fn new(memory_types: MemoryTypes) -> Self {
        Self {
            regions: BTreeMap::new(),
            memory_types,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    /// Whether regions of `memory_type` can be created on this device.
    pub fn check_memory_type(&self, memory_type: MemoryType) -> bool {
        match memory_type {
            MemoryType::Transfer => true,
            MemoryType::SharedGuest => self.memory_types.shared_guest,
            MemoryType::HostCoherent => false,
        }
    }

    /// Creates a region holding a single reference and no backing.
    pub fn new_region(
        &mut self,
        memory_id: u32,
        memory_type: MemoryType,
        guest_ref: bool,
    ) -> Result<&mut MemoryRegion> {
        use std::collections::btree_map::Entry;

        match self.regions.entry(memory_id) {
            Entry::Occupied(_) => Err(Error::DuplicateId(memory_id)),
            Entry::Vacant(slot) => {
                trace!("new memory region {memory_id} ({memory_type:?})");
                Ok(slot.insert(MemoryRegion::new(memory_id, memory_type, guest_ref)))
            }
        }
    }

    pub fn find(&self, memory_id: u32) -> Option<&MemoryRegion> {
        self.regions.get(&memory_id)
    }

    pub fn find_mut(&mut self, memory_id: u32) -> Option<&mut MemoryRegion> {
        self.regions.get_mut(&memory_id)
    }

    /// Takes an additional reference and returns the new count.
    pub fn ref_region(&mut self, memory_id: u32) -> Result<u32> {
        let region = self
            .regions
            .get_mut(&memory_id)
            .ok_or(Error::UnknownId(memory_id))?;
        region.refs = region
            .refs
            .checked_add(1)
            .ok_or(Error::TooManyRefs(memory_id))?;
        Ok(region.refs)
    }

    /// Drops a reference. The last one unmaps the backing and removes the
    /// region.
    pub fn unref<D: GuestDma + ?Sized>(&mut self, dma: &D, memory_id: u32) -> Result<Unref> {
        let region = self
            .regions
            .get_mut(&memory_id)
            .ok_or(Error::UnknownId(memory_id))?;
        region.refs -= 1;
        if region.refs > 0 {
            return Ok(Unref::Live(region.refs));
        }

        if let Some(mut region) = self.regions.remove(&memory_id) {
            debug!(
                "dropping memory region {memory_id} ({} entries)",
                region.iov_cnt()
            );
            region.release_backing(dma);
        }
        Ok(Unref::Dropped)
    }

    /// Maps `sg_list` and installs it as the backing of `memory_id`.
    pub fn attach_backing<D: GuestDma + ?Sized>(
        &mut self,
        dma: &D,
        memory_id: u32,
        sg_list: &[(GuestAddress, usize)],
    ) -> Result<()> {
        let region = self
            .regions
            .get_mut(&memory_id)
            .ok_or(Error::UnknownId(memory_id))?;
        if region.iov_cnt() > 0 {
            return Err(Error::AlreadyBacked(memory_id));
        }
        region.set_backing(create_iov(dma, sg_list)?)
    }

    /// Creates a guest-owned region backed by `sg_list`. Nothing is inserted
    /// unless every entry could be mapped.
    pub fn cmd_memory_create<D: GuestDma + ?Sized>(
        &mut self,
        dma: &D,
        memory_id: u32,
        memory_type: u32,
        sg_list: &[(GuestAddress, usize)],
    ) -> Result<()> {
        let memory_type = MemoryType::try_from(memory_type)?;
        if !self.check_memory_type(memory_type) {
            return Err(Error::UnsupportedType(memory_type));
        }
        if self.regions.contains_key(&memory_id) {
            return Err(Error::DuplicateId(memory_id));
        }

        let iov = create_iov(dma, sg_list)?;
        let size = iov.size;
        self.new_region(memory_id, memory_type, true)?
            .set_backing(iov)?;
        debug!(
            "memory region {memory_id}: {} entries, {size} bytes",
            sg_list.len()
        );
        Ok(())
    }

    /// Drops the guest's reference on `memory_id`.
    pub fn cmd_memory_unref<D: GuestDma + ?Sized>(
        &mut self,
        dma: &D,
        memory_id: u32,
    ) -> Result<Unref> {
        let region = self
            .regions
            .get_mut(&memory_id)
            .ok_or(Error::UnknownId(memory_id))?;
        if !region.guest_ref {
            return Err(Error::NoGuestReference(memory_id));
        }
        region.guest_ref = false;
        self.unref(dma, memory_id)
    }

    /// Unmaps and forgets every region.
    pub fn reset<D: GuestDma + ?Sized>(&mut self, dma: &D) {
        for region in self.regions.values_mut() {
            region.release_backing(dma);
        }
        self.regions.clear();
    }
}
