// vhost device Gpu memory regions
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use log::{debug, trace, warn};
use std::{
    fs::File,
    io::{self, Read, Result as IoResult, Write},
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error as ThisError;
use vhost::vhost_user::message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost_user_backend::{VhostUserBackend, VringRwLock, VringT};
use virtio_bindings::{
    bindings::{
        virtio_config::{VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_F_RING_RESET, VIRTIO_F_VERSION_1},
        virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC},
    },
    virtio_gpu::VIRTIO_GPU_F_EDID,
};
use virtio_queue::{QueueOwnedT, Reader, Writer};
use vm_memory::{ByteValued, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap, Le32};
use vmm_sys_util::{
    epoll::EventSet,
    eventfd::{EventFd, EFD_NONBLOCK},
};

use crate::{
    memory::{MemoryRegionTable, Unref},
    migration,
    pcap::PcapWriter,
    protocol::{
        virtio_gpu_cmd_str, virtio_gpu_ctrl_hdr, GpuCommand, GpuCommandDecodeError,
        GpuResponse::{self, ErrUnspec},
        GpuResponseEncodeError, VirtioGpuConfig, VirtioGpuResult, CONTROL_QUEUE, CURSOR_QUEUE,
        NUM_QUEUES, QUEUE_SIZE, VIRTIO_GPU_FLAG_FENCE, VIRTIO_GPU_F_MEMORY,
    },
    GpuConfig,
};

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to handle event, didn't match EPOLLIN")]
    HandleEventNotEpollIn,
    #[error("Failed to handle unknown event")]
    HandleEventUnknown,
    #[error("Descriptor read failed: {0}")]
    DescriptorReadFailed(io::Error),
    #[error("Descriptor write failed: {0}")]
    DescriptorWriteFailed(io::Error),
    #[error("Failed to send used queue notification: {0}")]
    NotificationFailed(io::Error),
    #[error("Failed to toggle queue notifications: {0}")]
    NotificationToggle(virtio_queue::Error),
    #[error("Failed to create new EventFd")]
    EventFdFailed,
    #[error("Guest memory is not set up yet")]
    NoMemoryConfigured,
    #[error("Failed to create an iterator over a descriptor chain: {0}")]
    CreateIteratorDescChain(virtio_queue::Error),
    #[error("Failed to create descriptor chain Reader: {0}")]
    CreateReader(virtio_queue::Error),
    #[error("Failed to create descriptor chain Writer: {0}")]
    CreateWriter(virtio_queue::Error),
    #[error("Failed to encode gpu response: {0}")]
    GpuResponseEncode(GpuResponseEncodeError),
    #[error("Failed add used chain to queue: {0}")]
    QueueAddUsed(virtio_queue::Error),
    #[error("Failed to open trace file: {0}")]
    TraceFile(io::Error),
    #[error("Failed to save or restore memory regions: {0}")]
    Migration(#[from] migration::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

struct VhostUserGpuBackendInner {
    virtio_cfg: VirtioGpuConfig,
    event_idx: bool,
    exit_event: EventFd,
    mem: Option<GuestMemoryAtomic<GuestMemoryMmap>>,
    regions: MemoryRegionTable,
    trace: Option<PcapWriter<File>>,
    max_outputs: u32,
    resolution: (u32, u32),
}

pub struct VhostUserGpuBackend {
    inner: Mutex<VhostUserGpuBackendInner>,
}

impl VhostUserGpuBackend {
    pub fn new(gpu_config: GpuConfig) -> Result<Arc<Self>> {
        log::trace!("VhostUserGpuBackend::new(config = {:?})", &gpu_config);
        let trace = match gpu_config.get_trace_file() {
            Some(path) => {
                let file = File::create(path).map_err(Error::TraceFile)?;
                let mut writer = PcapWriter::new(file).map_err(Error::TraceFile)?;
                writer.reset().map_err(Error::TraceFile)?;
                debug!("Tracing control queue to {}", path.display());
                Some(writer)
            }
            None => None,
        };

        let inner = VhostUserGpuBackendInner {
            virtio_cfg: VirtioGpuConfig {
                events_read: 0.into(),
                events_clear: 0.into(),
                num_scanouts: Le32::from(gpu_config.get_max_outputs()),
                num_capsets: 0.into(),
            },
            event_idx: false,
            exit_event: EventFd::new(EFD_NONBLOCK).map_err(|_| Error::EventFdFailed)?,
            mem: None,
            regions: MemoryRegionTable::new(gpu_config.get_memory_types()),
            trace,
            max_outputs: gpu_config.get_max_outputs(),
            resolution: gpu_config.get_resolution(),
        };

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
        }))
    }

    fn lock_inner(&self) -> MutexGuard<'_, VhostUserGpuBackendInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Writes the guest-owned memory regions to a migration stream.
    pub fn save_regions<W: Write>(&self, writer: &mut W) -> Result<()> {
        let inner = self.lock_inner();
        migration::save_table(writer, &inner.regions)?;
        debug!("Saved {} memory regions", inner.regions.len());
        Ok(())
    }

    /// Restores memory regions from a migration stream. Guest memory must be
    /// set up already.
    pub fn load_regions<R: Read>(&self, reader: &mut R) -> Result<()> {
        let mut inner = self.lock_inner();
        let mem = inner
            .mem
            .as_ref()
            .ok_or(Error::NoMemoryConfigured)?
            .memory()
            .into_inner();
        migration::load_table(reader, &*mem, &mut inner.regions)?;
        debug!("Restored {} memory regions", inner.regions.len());
        Ok(())
    }
}

impl VhostUserGpuBackendInner {
    fn process_gpu_command(
        &mut self,
        mem: &GuestMemoryMmap,
        hdr: virtio_gpu_ctrl_hdr,
        cmd: GpuCommand,
    ) -> VirtioGpuResult {
        debug!(
            "process_gpu_command: {} {cmd:?}",
            virtio_gpu_cmd_str(hdr.type_.to_native())
        );
        match cmd {
            GpuCommand::GetDisplayInfo => {
                let (xres, yres) = self.resolution;
                let displays = (0..self.max_outputs)
                    .map(|idx| match idx {
                        0 => (xres, yres, true),
                        _ => (0, 0, false),
                    })
                    .collect();
                Ok(GpuResponse::OkDisplayInfo(displays))
            }
            GpuCommand::MemoryCreate(info, entries) => {
                let memory_id = info.memory_id.to_native();
                self.regions
                    .cmd_memory_create(mem, memory_id, info.memory_type.to_native(), &entries)
                    .map_err(|e| {
                        warn!("MEMORY_CREATE {memory_id} failed: {e}");
                        GpuResponse::from(e)
                    })?;
                Ok(GpuResponse::OkNoData)
            }
            GpuCommand::MemoryUnref(info) => {
                let memory_id = info.memory_id.to_native();
                match self.regions.cmd_memory_unref(mem, memory_id) {
                    Ok(Unref::Live(refs)) => {
                        debug!("memory region {memory_id} still has {refs} references");
                        Ok(GpuResponse::OkNoData)
                    }
                    Ok(Unref::Dropped) => Ok(GpuResponse::OkNoData),
                    Err(e) => {
                        warn!("MEMORY_UNREF {memory_id} failed: {e}");
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn trace_packet(&mut self, request: bool, data: &[u8]) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        let result = if request {
            trace.request(data)
        } else {
            trace.reply(data)
        };
        if let Err(e) = result {
            warn!("Failed to write trace packet, tracing stopped: {e}");
            self.trace = None;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_queue_chain(
        &mut self,
        mem: &GuestMemoryMmap,
        vring: &VringRwLock,
        head_index: u16,
        reader: &mut Reader,
        writer: &mut Writer,
        signal_used_queue: &mut bool,
        traced: bool,
    ) -> Result<()> {
        let mut request = Vec::new();
        reader
            .read_to_end(&mut request)
            .map_err(Error::DescriptorReadFailed)?;
        if traced {
            self.trace_packet(true, &request);
        }

        let mut response = ErrUnspec;
        let ctrl_hdr = match GpuCommand::decode(&mut request.as_slice()) {
            Ok((ctrl_hdr, gpu_cmd)) => {
                let cmd_name = format!("{:?}", gpu_cmd);
                response = match self.process_gpu_command(mem, ctrl_hdr, gpu_cmd) {
                    Ok(response) => response,
                    Err(response) => {
                        debug!("GpuCommand {cmd_name} failed: {response:?}");
                        response
                    }
                };
                Some(ctrl_hdr)
            }
            Err(GpuCommandDecodeError::InvalidType(type_)) => {
                warn!(
                    "Unsupported GpuCommand {} ({type_:#x})",
                    virtio_gpu_cmd_str(type_)
                );
                None
            }
            Err(e) => {
                warn!("Failed to decode GpuCommand: {e}");
                None
            }
        };

        if writer.available_bytes() == 0 {
            debug!("Command does not have descriptors for a response");
            vring.add_used(head_index, 0).map_err(Error::QueueAddUsed)?;
            *signal_used_queue = true;
            return Ok(());
        }

        let mut fence_id = 0;
        let mut ctx_id = 0;
        let mut flags = 0;
        let mut ring_idx = 0;

        // No renderer runs behind this device, so fences signal right away.
        if let Some(ctrl_hdr) = ctrl_hdr {
            if ctrl_hdr.flags.to_native() & VIRTIO_GPU_FLAG_FENCE != 0 {
                flags = ctrl_hdr.flags.to_native();
                fence_id = ctrl_hdr.fence_id.to_native();
                ctx_id = ctrl_hdr.ctx_id.to_native();
                ring_idx = ctrl_hdr.ring_idx;
                trace!("Fence {fence_id} on ctx {ctx_id} ring {ring_idx} completed");
            }
        }

        let mut encoded = Vec::new();
        response
            .encode(flags, fence_id, ctx_id, ring_idx, &mut encoded)
            .map_err(Error::GpuResponseEncode)?;
        if traced {
            self.trace_packet(false, &encoded);
        }

        let available = writer.available_bytes();
        if available < encoded.len() {
            warn!(
                "Response truncated to {available} of {} bytes",
                encoded.len()
            );
            encoded.truncate(available);
        }
        writer
            .write_all(&encoded)
            .map_err(Error::DescriptorWriteFailed)?;

        let response_len = encoded.len() as u32;
        vring
            .add_used(head_index, response_len)
            .map_err(Error::QueueAddUsed)?;
        trace!("add_used {}bytes", response_len);
        *signal_used_queue = true;
        Ok(())
    }

    /// Process the requests in the vring and dispatch replies
    fn process_queue(&mut self, vring: &VringRwLock, traced: bool) -> Result<()> {
        let mem = self
            .mem
            .as_ref()
            .ok_or(Error::NoMemoryConfigured)?
            .memory()
            .into_inner();
        let desc_chains: Vec<_> = vring
            .get_mut()
            .get_queue_mut()
            .iter(mem.clone())
            .map_err(Error::CreateIteratorDescChain)?
            .collect();

        let mut signal_used_queue = false;
        for desc_chain in desc_chains {
            let head_index = desc_chain.head_index();
            let mut reader = desc_chain
                .clone()
                .reader(&mem)
                .map_err(Error::CreateReader)?;
            let mut writer = desc_chain.writer(&mem).map_err(Error::CreateWriter)?;

            self.process_queue_chain(
                &mem,
                vring,
                head_index,
                &mut reader,
                &mut writer,
                &mut signal_used_queue,
                traced,
            )?;
        }

        if signal_used_queue {
            debug!("Notifying used queue");
            vring
                .signal_used_queue()
                .map_err(Error::NotificationFailed)?;
        }
        debug!("Processing queue finished");

        Ok(())
    }

    fn handle_event(
        &mut self,
        device_event: u16,
        evset: EventSet,
        vrings: &[VringRwLock],
    ) -> IoResult<()> {
        debug!("Handle event called");
        if evset != EventSet::IN {
            return Err(Error::HandleEventNotEpollIn.into());
        }

        match device_event {
            CONTROL_QUEUE | CURSOR_QUEUE => {
                let vring = vrings
                    .get(device_event as usize)
                    .ok_or(Error::HandleEventUnknown)?;
                let traced = device_event == CONTROL_QUEUE;
                if self.event_idx {
                    // vm-virtio's Queue implementation only checks avail_index
                    // once, so to properly support EVENT_IDX we need to keep
                    // calling process_queue() until it stops finding new
                    // requests on the queue.
                    loop {
                        vring
                            .disable_notification()
                            .map_err(Error::NotificationToggle)?;
                        self.process_queue(vring, traced)?;
                        if !vring
                            .enable_notification()
                            .map_err(Error::NotificationToggle)?
                        {
                            break;
                        }
                    }
                } else {
                    // Without EVENT_IDX, a single call is enough.
                    self.process_queue(vring, traced)?;
                }
            }
            _ => {
                warn!("unhandled device_event: {}", device_event);
                return Err(Error::HandleEventUnknown.into());
            }
        }

        Ok(())
    }

    /// Forgets every memory region, as after a device reset.
    fn reset(&mut self) {
        if self.regions.is_empty() {
            return;
        }
        debug!("Dropping {} memory regions", self.regions.len());
        match self.mem.as_ref() {
            Some(mem) => self.regions.reset(&*mem.memory().into_inner()),
            None => self.regions.reset(&GuestMemoryMmap::<()>::new()),
        }
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        let offset = offset as usize;
        let size = size as usize;

        let buf = self.virtio_cfg.as_slice();

        match offset.checked_add(size) {
            Some(end) if end <= buf.len() => buf[offset..end].to_vec(),
            _ => Vec::new(),
        }
    }
}

/// VhostUserBackend trait methods
impl VhostUserBackend for VhostUserGpuBackend {
    type Vring = VringRwLock;
    type Bitmap = ();

    fn num_queues(&self) -> usize {
        debug!("Num queues called");
        NUM_QUEUES
    }

    fn max_queue_size(&self) -> usize {
        debug!("Max queues called");
        QUEUE_SIZE
    }

    fn features(&self) -> u64 {
        1 << VIRTIO_F_VERSION_1
            | 1 << VIRTIO_F_RING_RESET
            | 1 << VIRTIO_F_NOTIFY_ON_EMPTY
            | 1 << VIRTIO_RING_F_INDIRECT_DESC
            | 1 << VIRTIO_RING_F_EVENT_IDX
            | 1 << VIRTIO_GPU_F_EDID
            | 1 << VIRTIO_GPU_F_MEMORY
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        VhostUserProtocolFeatures::CONFIG | VhostUserProtocolFeatures::MQ
    }

    fn acked_features(&self, features: u64) {
        debug!("Features acked: {features:#x}");
        let mut inner = self.lock_inner();
        inner.reset();
        if let Some(trace) = inner.trace.as_mut() {
            if let Err(e) = trace.reset() {
                warn!("Failed to write trace reset: {e}");
            }
        }
    }

    fn set_event_idx(&self, enabled: bool) {
        self.lock_inner().event_idx = enabled;
        debug!("Event idx set to: {}", enabled);
    }

    fn update_memory(&self, mem: GuestMemoryAtomic<GuestMemoryMmap>) -> IoResult<()> {
        debug!("Update memory called");
        self.lock_inner().mem = Some(mem);
        Ok(())
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        self.lock_inner().get_config(offset, size)
    }

    fn exit_event(&self, _thread_index: usize) -> Option<EventFd> {
        self.lock_inner().exit_event.try_clone().ok()
    }

    fn handle_event(
        &self,
        device_event: u16,
        evset: EventSet,
        vrings: &[Self::Vring],
        _thread_id: usize,
    ) -> IoResult<()> {
        self.lock_inner().handle_event(device_event, evset, vrings)
    }
}
