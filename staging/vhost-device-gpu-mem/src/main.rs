// virtio-gpu memory regions via vhost-user
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use log::{error, info};
use std::{path::PathBuf, process::exit};

use clap::Parser;
use thiserror::Error as ThisError;
use vhost_device_gpu_mem::{
    device::{self, VhostUserGpuBackend},
    protocol::VIRTIO_GPU_MAX_SCANOUTS,
    GpuConfig, MemoryTypes,
};
use vhost_user_backend::VhostUserDaemon;
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub(crate) enum Error {
    #[error("Invalid number of outputs {0}, must be between 1 and 16")]
    InvalidMaxOutputs(u32),
    #[error("Invalid resolution {0}x{1}")]
    InvalidResolution(u32, u32),
    #[error("Could not create backend: {0}")]
    CouldNotCreateBackend(device::Error),
    #[error("Could not create daemon: {0}")]
    CouldNotCreateDaemon(vhost_user_backend::Error),
    #[error("Fatal error: {0}")]
    ServeFailed(vhost_user_backend::Error),
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct GpuArgs {
    /// vhost-user Unix domain socket.
    #[clap(short, long, value_name = "SOCKET")]
    socket_path: PathBuf,

    /// Number of outputs reported to the guest.
    #[clap(long, default_value_t = 1)]
    max_outputs: u32,

    /// Horizontal resolution of the first output.
    #[clap(long, default_value_t = 1024)]
    xres: u32,

    /// Vertical resolution of the first output.
    #[clap(long, default_value_t = 768)]
    yres: u32,

    /// Accept shared guest memory regions in addition to transfer memory.
    #[clap(long)]
    shared_guest_memory: bool,

    /// Record control queue traffic to this pcap file.
    #[clap(long, value_name = "FILE")]
    trace_file: Option<PathBuf>,
}

impl TryFrom<GpuArgs> for GpuConfig {
    type Error = Error;

    fn try_from(args: GpuArgs) -> Result<Self> {
        if args.max_outputs == 0 || args.max_outputs as usize > VIRTIO_GPU_MAX_SCANOUTS {
            return Err(Error::InvalidMaxOutputs(args.max_outputs));
        }
        if args.xres == 0 || args.yres == 0 {
            return Err(Error::InvalidResolution(args.xres, args.yres));
        }

        Ok(GpuConfig::new(
            args.socket_path,
            args.max_outputs,
            (args.xres, args.yres),
            MemoryTypes {
                shared_guest: args.shared_guest_memory,
            },
            args.trace_file,
        ))
    }
}

fn start_backend(config: GpuConfig) -> Result<()> {
    info!("Starting backend");
    let socket = config.get_socket_path();
    let backend = VhostUserGpuBackend::new(config).map_err(Error::CouldNotCreateBackend)?;

    let mut daemon = VhostUserDaemon::new(
        "vhost-device-gpu-mem-backend".to_string(),
        backend,
        GuestMemoryAtomic::new(GuestMemoryMmap::new()),
    )
    .map_err(Error::CouldNotCreateDaemon)?;

    daemon.serve(socket).map_err(Error::ServeFailed)?;
    Ok(())
}

fn main() {
    env_logger::init();

    let config = match GpuConfig::try_from(GpuArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    if let Err(e) = start_backend(config) {
        error!("{e}");
        exit(1);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use std::path::Path;
    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    impl GpuArgs {
        pub(crate) fn from_args(path: &Path) -> GpuArgs {
            GpuArgs {
                socket_path: path.to_path_buf(),
                max_outputs: 1,
                xres: 1024,
                yres: 768,
                shared_guest_memory: false,
                trace_file: None,
            }
        }
    }

    #[test]
    fn test_parse_successful() {
        let socket_name = Path::new("vgpu.sock");

        let cmd_args = GpuArgs::from_args(socket_name);
        let config = GpuConfig::try_from(cmd_args);

        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.get_socket_path(), socket_name);
        assert_eq!(config.get_max_outputs(), 1);
        assert_eq!(config.get_resolution(), (1024, 768));
        assert_eq!(config.get_memory_types(), MemoryTypes::default());
        assert!(config.get_trace_file().is_none());
    }

    #[test]
    fn test_parse_command_line() {
        let args = GpuArgs::try_parse_from([
            "vhost-device-gpu-mem",
            "--socket-path",
            "/tmp/vgpu.sock",
            "--max-outputs",
            "4",
            "--xres",
            "1920",
            "--yres",
            "1080",
            "--shared-guest-memory",
            "--trace-file",
            "/tmp/vgpu.pcap",
        ])
        .unwrap();
        let config = GpuConfig::try_from(args).unwrap();
        assert_eq!(config.get_max_outputs(), 4);
        assert_eq!(config.get_resolution(), (1920, 1080));
        assert!(config.get_memory_types().shared_guest);
        assert_eq!(config.get_trace_file(), Some(Path::new("/tmp/vgpu.pcap")));

        assert!(GpuArgs::try_parse_from(["vhost-device-gpu-mem"]).is_err());
    }

    #[test]
    fn test_parse_invalid() {
        let socket_name = Path::new("vgpu.sock");

        let mut cmd_args = GpuArgs::from_args(socket_name);
        cmd_args.max_outputs = 0;
        assert_matches!(
            GpuConfig::try_from(cmd_args),
            Err(Error::InvalidMaxOutputs(0))
        );

        let mut cmd_args = GpuArgs::from_args(socket_name);
        cmd_args.max_outputs = 17;
        assert_matches!(
            GpuConfig::try_from(cmd_args),
            Err(Error::InvalidMaxOutputs(17))
        );

        let mut cmd_args = GpuArgs::from_args(socket_name);
        cmd_args.yres = 0;
        assert_matches!(
            GpuConfig::try_from(cmd_args),
            Err(Error::InvalidResolution(1024, 0))
        );
    }

    #[test]
    fn test_fail_listener() {
        // This will fail the listeners and thread will panic.
        let socket_name = Path::new("~/path/not/present/gpu");
        let cmd_args = GpuArgs::from_args(socket_name);
        let config = GpuConfig::try_from(cmd_args).unwrap();

        assert_matches!(start_backend(config).unwrap_err(), Error::ServeFailed(_));
    }

    #[test]
    fn test_fail_trace_file() {
        let dir = TempDir::new().unwrap();
        let mut cmd_args = GpuArgs::from_args(&dir.as_path().join("vgpu.sock"));
        cmd_args.trace_file = Some(dir.as_path().join("missing").join("vgpu.pcap"));
        let config = GpuConfig::try_from(cmd_args).unwrap();

        assert_matches!(
            start_backend(config).unwrap_err(),
            Error::CouldNotCreateBackend(device::Error::TraceFile(_))
        );
    }
}
