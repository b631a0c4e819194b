// virtio-gpu memory region save/restore
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Memory region state as it travels in a migration stream.
//!
//! A region is written as `iov_cnt` pairs of big-endian `(u64 address, u32
//! length)`. The count itself is not part of the region data; whoever loads
//! it must already know it. `save_table`/`load_table` carry that count for
//! the guest-owned regions of a whole table.

use std::io::{self, Read, Write};

use log::{debug, warn};
use thiserror::Error as ThisError;
use vm_memory::{Be32, Be64, ByteValued, GuestAddress};

use crate::{
    memory::{self, create_iov, GuestDma, MemoryRegion, MemoryRegionTable, MemoryType},
    protocol::VIRTIO_GPU_MAX_MEM_ENTRIES,
};

type Result<T> = std::result::Result<T, Error>;

const TABLE_MAGIC: [u8; 4] = *b"VGMR";
const TABLE_VERSION: u32 = 1;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error on the migration stream: {0}")]
    Io(#[from] io::Error),
    #[error("Bad memory region table magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("Unsupported memory region table version {0}")]
    UnsupportedVersion(u32),
    #[error("Cannot restore into a table holding {0} regions")]
    TableNotEmpty(usize),
    #[error("Memory region entry {index} has length {len}, which does not fit the stream")]
    EntryTooLarge { index: usize, len: usize },
    #[error("Failed to restore memory region: {0}")]
    Region(#[from] memory::Error),
}

fn read_obj<T: ByteValued + Default, R: Read>(reader: &mut R) -> io::Result<T> {
    let mut obj = T::default();
    reader.read_exact(obj.as_mut_slice())?;
    Ok(obj)
}

fn put_be32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(Be32::from(value).as_slice())
}

fn get_be32<R: Read>(reader: &mut R) -> io::Result<u32> {
    Ok(read_obj::<Be32, _>(reader)?.to_native())
}

/// Writes the `(address, length)` pairs backing `region`.
pub fn save<W: Write>(writer: &mut W, region: &MemoryRegion) -> Result<()> {
    for (index, entry) in region.entries().iter().enumerate() {
        let len = u32::try_from(entry.mapping.len).map_err(|_| Error::EntryTooLarge {
            index,
            len: entry.mapping.len,
        })?;
        writer.write_all(Be64::from(entry.addr.0).as_slice())?;
        put_be32(writer, len)?;
    }
    Ok(())
}

/// Reads `iov_cnt` pairs and maps them as the backing of `region`. On failure
/// every mapping taken by this call has been released again.
pub fn load<R: Read, D: GuestDma + ?Sized>(
    reader: &mut R,
    dma: &D,
    region: &mut MemoryRegion,
    iov_cnt: usize,
) -> Result<()> {
    if iov_cnt > VIRTIO_GPU_MAX_MEM_ENTRIES as usize {
        return Err(memory::Error::TooManyEntries(iov_cnt).into());
    }

    let mut sg_list = Vec::with_capacity(iov_cnt);
    for _ in 0..iov_cnt {
        let addr = read_obj::<Be64, _>(reader)?.to_native();
        let len = get_be32(reader)?;
        sg_list.push((GuestAddress(addr), len as usize));
    }

    if region.iov_cnt() > 0 {
        return Err(memory::Error::AlreadyBacked(region.memory_id()).into());
    }
    region.set_backing(create_iov(dma, &sg_list)?)?;
    Ok(())
}

/// Writes every guest-owned region of `table`, preceded by a header holding
/// the region count.
pub fn save_table<W: Write>(writer: &mut W, table: &MemoryRegionTable) -> Result<()> {
    let regions: Vec<_> = table.iter().filter(|region| region.guest_ref()).collect();

    writer.write_all(&TABLE_MAGIC)?;
    put_be32(writer, TABLE_VERSION)?;
    put_be32(writer, regions.len() as u32)?;
    for region in regions {
        put_be32(writer, region.memory_id())?;
        put_be32(writer, region.memory_type().into())?;
        put_be32(writer, region.iov_cnt() as u32)?;
        save(writer, region)?;
    }
    writer.flush()?;
    Ok(())
}

/// Restores a table written by `save_table` into an empty `table`. A failed
/// restore leaves the table empty.
pub fn load_table<R: Read, D: GuestDma + ?Sized>(
    reader: &mut R,
    dma: &D,
    table: &mut MemoryRegionTable,
) -> Result<()> {
    if !table.is_empty() {
        return Err(Error::TableNotEmpty(table.len()));
    }

    let result = load_regions(reader, dma, table);
    if let Err(e) = &result {
        warn!("memory region restore failed: {e}");
        table.reset(dma);
    }
    result
}

fn load_regions<R: Read, D: GuestDma + ?Sized>(
    reader: &mut R,
    dma: &D,
    table: &mut MemoryRegionTable,
) -> Result<()> {
    let magic: [u8; 4] = read_obj(reader)?;
    if magic != TABLE_MAGIC {
        return Err(Error::BadMagic(magic));
    }
    let version = get_be32(reader)?;
    if version != TABLE_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let count = get_be32(reader)?;
    for _ in 0..count {
        let memory_id = get_be32(reader)?;
        let memory_type = MemoryType::try_from(get_be32(reader)?)?;
        let iov_cnt = get_be32(reader)? as usize;

        let region = table.new_region(memory_id, memory_type, true)?;
        load(reader, dma, region, iov_cnt)?;
        debug!("restored memory region {memory_id} with {iov_cnt} entries");
    }
    Ok(())
}
