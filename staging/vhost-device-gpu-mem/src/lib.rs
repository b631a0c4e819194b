// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod device;
pub mod egl;
pub mod memory;
pub mod migration;
pub mod pcap;
pub mod protocol;

use std::path::{Path, PathBuf};

/// Memory types the device accepts in `VIRTIO_GPU_CMD_MEMORY_CREATE` besides
/// transfer memory, which is always available.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryTypes {
    pub shared_guest: bool,
}

#[derive(Debug, Clone)]
/// This structure is the public API through which an external program
/// is allowed to configure the backend.
pub struct GpuConfig {
    /// vhost-user Unix domain socket
    socket_path: PathBuf,
    max_outputs: u32,
    resolution: (u32, u32),
    memory_types: MemoryTypes,
    /// Optional pcap capture of the control queue
    trace_file: Option<PathBuf>,
}

impl GpuConfig {
    /// Create a new instance of the GpuConfig struct, containing the
    /// parameters to be fed into the gpu-backend server.
    pub const fn new(
        socket_path: PathBuf,
        max_outputs: u32,
        resolution: (u32, u32),
        memory_types: MemoryTypes,
        trace_file: Option<PathBuf>,
    ) -> Self {
        Self {
            socket_path,
            max_outputs,
            resolution,
            memory_types,
            trace_file,
        }
    }

    /// Return the path of the unix domain socket which is listening to
    /// requests from the guest.
    pub fn get_socket_path(&self) -> PathBuf {
        self.socket_path.clone()
    }

    pub const fn get_max_outputs(&self) -> u32 {
        self.max_outputs
    }

    /// Width and height of the first output.
    pub const fn get_resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub const fn get_memory_types(&self) -> MemoryTypes {
        self.memory_types
    }

    pub fn get_trace_file(&self) -> Option<&Path> {
        self.trace_file.as_deref()
    }
}
