// virtio-gpu wire protocol: the control header, memory region commands and
// the responses this device produces.
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(non_camel_case_types)]

use std::{
    fmt::{self, Debug},
    io::{self, Read, Write},
    mem::{size_of, size_of_val},
};

use thiserror::Error as ThisError;
use vm_memory::{ByteValued, GuestAddress, Le32, Le64};

pub const QUEUE_SIZE: usize = 1024;
pub const NUM_QUEUES: usize = 2;

pub const CONTROL_QUEUE: u16 = 0;
pub const CURSOR_QUEUE: u16 = 1;

pub const VIRTIO_GPU_MAX_SCANOUTS: usize = 16;

/// Pre-upstream feature bit announcing guest memory regions.
pub const VIRTIO_GPU_F_MEMORY: u32 = 2;

/* 2d commands */
pub const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x100;
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x101;
pub const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x102;
pub const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x103;
pub const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x104;
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x105;
pub const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x106;
pub const VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING: u32 = 0x107;

/* memory region commands, not upstreamed */
pub const VIRTIO_GPU_CMD_MEMORY_CREATE: u32 = 0x208;
pub const VIRTIO_GPU_CMD_MEMORY_UNREF: u32 = 0x209;

/* cursor commands */
pub const VIRTIO_GPU_CMD_UPDATE_CURSOR: u32 = 0x300;
pub const VIRTIO_GPU_CMD_MOVE_CURSOR: u32 = 0x301;

/* success responses */
pub const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
pub const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;

/* error responses */
pub const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;
pub const VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY: u32 = 0x1201;
pub const VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID: u32 = 0x1202;
pub const VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1203;
pub const VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID: u32 = 0x1204;
pub const VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER: u32 = 0x1205;

/* guest memory types, not upstreamed */
pub const VIRTIO_GPU_MEMORY_TRANSFER: u32 = 1;
pub const VIRTIO_GPU_MEMORY_SHARED_GUEST: u32 = 2;
pub const VIRTIO_GPU_MEMORY_HOST_COHERENT: u32 = 3;

/// Upper bound on the scatter-gather entries of a single request.
pub const VIRTIO_GPU_MAX_MEM_ENTRIES: u32 = 16384;

pub const VIRTIO_GPU_FLAG_FENCE: u32 = 1 << 0;

pub fn virtio_gpu_cmd_str(cmd: u32) -> &'static str {
    match cmd {
        VIRTIO_GPU_CMD_GET_DISPLAY_INFO => "VIRTIO_GPU_CMD_GET_DISPLAY_INFO",
        VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => "VIRTIO_GPU_CMD_RESOURCE_CREATE_2D",
        VIRTIO_GPU_CMD_RESOURCE_UNREF => "VIRTIO_GPU_CMD_RESOURCE_UNREF",
        VIRTIO_GPU_CMD_SET_SCANOUT => "VIRTIO_GPU_CMD_SET_SCANOUT",
        VIRTIO_GPU_CMD_RESOURCE_FLUSH => "VIRTIO_GPU_CMD_RESOURCE_FLUSH",
        VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => "VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D",
        VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => "VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING",
        VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => "VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING",
        VIRTIO_GPU_CMD_MEMORY_CREATE => "VIRTIO_GPU_CMD_MEMORY_CREATE",
        VIRTIO_GPU_CMD_MEMORY_UNREF => "VIRTIO_GPU_CMD_MEMORY_UNREF",
        VIRTIO_GPU_CMD_UPDATE_CURSOR => "VIRTIO_GPU_CMD_UPDATE_CURSOR",
        VIRTIO_GPU_CMD_MOVE_CURSOR => "VIRTIO_GPU_CMD_MOVE_CURSOR",
        VIRTIO_GPU_RESP_OK_NODATA => "VIRTIO_GPU_RESP_OK_NODATA",
        VIRTIO_GPU_RESP_OK_DISPLAY_INFO => "VIRTIO_GPU_RESP_OK_DISPLAY_INFO",
        VIRTIO_GPU_RESP_ERR_UNSPEC => "VIRTIO_GPU_RESP_ERR_UNSPEC",
        VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY => "VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY",
        VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID => "VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID",
        VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID => "VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID",
        VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID => "VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID",
        VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER => "VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER",
        _ => "UNKNOWN",
    }
}

/// Virtio Gpu Configuration
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VirtioGpuConfig {
    /// Signals pending events to the driver
    pub events_read: Le32,
    /// Clears pending events in the device
    pub events_clear: Le32,
    /// Maximum number of scanouts supported by the device
    pub num_scanouts: Le32,
    /// Maximum number of capability sets supported by the device
    pub num_capsets: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for VirtioGpuConfig {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_ctrl_hdr {
    pub type_: Le32,
    pub flags: Le32,
    pub fence_id: Le64,
    pub ctx_id: Le32,
    pub ring_idx: u8,
    pub padding: [u8; 3],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_ctrl_hdr {}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_rect {
    pub x: Le32,
    pub y: Le32,
    pub width: Le32,
    pub height: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_rect {}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_display_one {
    pub r: virtio_gpu_rect,
    pub enabled: Le32,
    pub flags: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_display_one {}

/* VIRTIO_GPU_RESP_OK_DISPLAY_INFO */
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_resp_display_info {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub pmodes: [virtio_gpu_display_one; VIRTIO_GPU_MAX_SCANOUTS],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_resp_display_info {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_mem_entry {
    pub addr: Le64,
    pub length: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_mem_entry {}

/* VIRTIO_GPU_CMD_MEMORY_CREATE */
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_memory_create {
    pub memory_id: Le32,
    pub memory_type: Le32,
    pub nr_entries: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_memory_create {}

/* VIRTIO_GPU_CMD_MEMORY_UNREF */
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_memory_unref {
    pub memory_id: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_memory_unref {}

fn read_obj<T: ByteValued + Default, R: Read>(reader: &mut R) -> io::Result<T> {
    let mut obj = T::default();
    reader.read_exact(obj.as_mut_slice())?;
    Ok(obj)
}

/// A virtio gpu command and associated metadata specific to each command.
/// The control header is returned next to it by `GpuCommand::decode`.
#[derive(Clone, PartialEq, Eq)]
pub enum GpuCommand {
    GetDisplayInfo,
    MemoryCreate(virtio_gpu_memory_create, Vec<(GuestAddress, usize)>),
    MemoryUnref(virtio_gpu_memory_unref),
}

/// An error indicating something went wrong decoding a `GpuCommand`.
#[derive(Debug, ThisError)]
pub enum GpuCommandDecodeError {
    /// The type of the command was invalid.
    #[error("invalid command type ({0})")]
    InvalidType(u32),
    /// The command carries more scatter-gather entries than allowed.
    #[error("too many memory entries ({0})")]
    TooManyEntries(u32),
    /// An I/O error occurred.
    #[error("an I/O error occurred: {0}")]
    IO(io::Error),
}

impl From<io::Error> for GpuCommandDecodeError {
    fn from(e: io::Error) -> Self {
        Self::IO(e)
    }
}

impl Debug for GpuCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::GetDisplayInfo => f.debug_struct("GetDisplayInfo").finish(),
            Self::MemoryCreate(info, entries) => f
                .debug_struct("MemoryCreate")
                .field("memory_id", &info.memory_id.to_native())
                .field("memory_type", &info.memory_type.to_native())
                .field("nr_entries", &entries.len())
                .finish(),
            Self::MemoryUnref(info) => f
                .debug_struct("MemoryUnref")
                .field("memory_id", &info.memory_id.to_native())
                .finish(),
        }
    }
}

impl GpuCommand {
    /// Decodes a command from the given chunk of memory.
    pub fn decode<R: Read>(
        reader: &mut R,
    ) -> Result<(virtio_gpu_ctrl_hdr, Self), GpuCommandDecodeError> {
        let hdr: virtio_gpu_ctrl_hdr = read_obj(reader)?;
        let cmd = match hdr.type_.to_native() {
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO => Self::GetDisplayInfo,
            VIRTIO_GPU_CMD_MEMORY_CREATE => {
                let info: virtio_gpu_memory_create = read_obj(reader)?;
                let nr_entries = info.nr_entries.to_native();
                if nr_entries > VIRTIO_GPU_MAX_MEM_ENTRIES {
                    return Err(GpuCommandDecodeError::TooManyEntries(nr_entries));
                }

                let mut entries = Vec::with_capacity(nr_entries as usize);
                for _ in 0..nr_entries {
                    let entry: virtio_gpu_mem_entry = read_obj(reader)?;
                    entries.push((
                        GuestAddress(entry.addr.to_native()),
                        entry.length.to_native() as usize,
                    ));
                }
                Self::MemoryCreate(info, entries)
            }
            VIRTIO_GPU_CMD_MEMORY_UNREF => Self::MemoryUnref(read_obj(reader)?),
            other => return Err(GpuCommandDecodeError::InvalidType(other)),
        };
        Ok((hdr, cmd))
    }
}

/// A response to a `GpuCommand`. These correspond to `VIRTIO_GPU_RESP_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuResponse {
    OkNoData,
    /// `(width, height, enabled)` per scanout.
    OkDisplayInfo(Vec<(u32, u32, bool)>),
    ErrUnspec,
    ErrInvalidResourceId,
    ErrInvalidParameter,
}

pub type VirtioGpuResult = Result<GpuResponse, GpuResponse>;

/// An error indicating something went wrong encoding a `GpuResponse`.
#[derive(Debug, ThisError)]
pub enum GpuResponseEncodeError {
    /// More displays than are valid were in a `OkDisplayInfo`.
    #[error("{0} is more displays than are valid")]
    TooManyDisplays(usize),
    /// An I/O error occurred.
    #[error("an I/O error occurred: {0}")]
    IO(io::Error),
}

impl From<io::Error> for GpuResponseEncodeError {
    fn from(e: io::Error) -> Self {
        Self::IO(e)
    }
}

impl GpuResponse {
    /// Encodes this `GpuResponse` into `resp` with the given fence metadata and
    /// returns the number of bytes written.
    pub fn encode<W: Write>(
        &self,
        flags: u32,
        fence_id: u64,
        ctx_id: u32,
        ring_idx: u8,
        resp: &mut W,
    ) -> Result<u32, GpuResponseEncodeError> {
        let hdr = virtio_gpu_ctrl_hdr {
            type_: self.get_type().into(),
            flags: flags.into(),
            fence_id: fence_id.into(),
            ctx_id: ctx_id.into(),
            ring_idx,
            padding: Default::default(),
        };
        let len = match self {
            Self::OkDisplayInfo(info) => {
                if info.len() > VIRTIO_GPU_MAX_SCANOUTS {
                    return Err(GpuResponseEncodeError::TooManyDisplays(info.len()));
                }
                let mut disp_info = virtio_gpu_resp_display_info {
                    hdr,
                    pmodes: Default::default(),
                };
                for (disp_mode, &(width, height, enabled)) in disp_info.pmodes.iter_mut().zip(info)
                {
                    disp_mode.r.width = width.into();
                    disp_mode.r.height = height.into();
                    disp_mode.enabled = u32::from(enabled).into();
                }
                resp.write_all(disp_info.as_slice())?;
                size_of_val(&disp_info)
            }
            _ => {
                resp.write_all(hdr.as_slice())?;
                size_of::<virtio_gpu_ctrl_hdr>()
            }
        };
        Ok(len as u32)
    }

    /// Gets the `VIRTIO_GPU_*` enum value that corresponds to this variant.
    pub fn get_type(&self) -> u32 {
        match self {
            Self::OkNoData => VIRTIO_GPU_RESP_OK_NODATA,
            Self::OkDisplayInfo(_) => VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
            Self::ErrUnspec => VIRTIO_GPU_RESP_ERR_UNSPEC,
            Self::ErrInvalidResourceId => VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID,
            Self::ErrInvalidParameter => VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER,
        }
    }
}
