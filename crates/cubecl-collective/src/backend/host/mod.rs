//! Devices, streams and communicators simulated with host threads.
//!
//! Every device owns a default stream and any number of private streams, each one backed by a
//! worker thread executing its work in order. Communicators built from the same bootstrap id share
//! a clique on a [HostFabric], which plays the role of the interconnect: one fabric is shared by
//! all the simulated processes of a test, each process owning its own [HostBackend].

mod clique;
mod event;
mod reduce;
mod storage;
mod stream;

pub use clique::{HostComm, HostFabric};
pub use event::HostEvent;
pub use storage::HostStorage;
pub use stream::HostStream;

use crate::backend::{
    BOOTSTRAP_ID_BYTES, BootstrapId, CommBackend, CommDataType, ReduceOp, StreamBackend,
};
use crate::buffer::{Buffer, BufferRef, ElemType};
use crate::device::DeviceId;
use crate::error::{CollectiveError, Result, ensure};
use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bytemuck::Pod;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use storage::Region;

/// Lock a mutex, ignoring poisoning: a panicking stream job doesn't invalidate the state it
/// guards.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

std::thread_local! {
    /// Current device of the calling thread, per backend instance.
    static CURRENT_DEVICE: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// A process worth of simulated devices.
pub struct HostBackend {
    id: u64,
    fabric: Arc<HostFabric>,
    devices: Vec<HostDevice>,
}

struct HostDevice {
    default_stream: HostStream,
    streams: spin::Mutex<Vec<HostStream>>,
}

impl HostBackend {
    /// Create a backend driving `device_count` devices connected to the given fabric.
    pub fn new(fabric: Arc<HostFabric>, device_count: usize) -> Result<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        ensure!(device_count > 0, "A host backend needs at least one device");

        let devices = (0..device_count)
            .map(|index| {
                Ok(HostDevice {
                    default_stream: HostStream::new(DeviceId::gpu(index as u32))?,
                    streams: spin::Mutex::new(Vec::new()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            fabric,
            devices,
        })
    }

    /// The fabric connecting this backend to its peers.
    pub fn fabric(&self) -> &Arc<HostFabric> {
        &self.fabric
    }

    /// Create a buffer holding a copy of `data`.
    pub fn buffer<T: Pod>(
        &self,
        device: DeviceId,
        dtype: ElemType,
        shape: Vec<usize>,
        data: &[T],
    ) -> Result<Buffer<HostStorage>> {
        ensure!(
            core::mem::size_of::<T>() == dtype.size(),
            "Elements of {} bytes can't be stored as {dtype:?}",
            core::mem::size_of::<T>()
        );
        ensure!(
            data.len() == shape.iter().product::<usize>(),
            "{} elements don't fit the shape {shape:?}",
            data.len()
        );
        if device.is_gpu() {
            self.device(device)?;
        }

        let storage = HostStorage::from_bytes(device, bytemuck::cast_slice(data).to_vec());
        Ok(Buffer::new(storage, device, dtype, shape))
    }

    /// Create a zeroed buffer.
    pub fn zeros(
        &self,
        device: DeviceId,
        dtype: ElemType,
        shape: Vec<usize>,
    ) -> Result<Buffer<HostStorage>> {
        if device.is_gpu() {
            self.device(device)?;
        }
        let size = shape.iter().product::<usize>() * dtype.size();

        Ok(Buffer::new(
            HostStorage::zeros(device, size),
            device,
            dtype,
            shape,
        ))
    }

    /// Read the buffer back, after every piece of work queued on the default stream of its device.
    pub fn read<T: Pod>(&self, buffer: &Buffer<HostStorage>) -> Result<Vec<T>> {
        let size = core::mem::size_of::<T>();
        ensure!(
            size == buffer.dtype().size(),
            "Elements of {size} bytes can't be read from {:?}",
            buffer.dtype()
        );
        let offset = buffer.offset() * size;
        let len = buffer.size_in_bytes();

        let bytes = match buffer.device().is_gpu() {
            true => {
                let stream = &self.device(buffer.device())?.default_stream;
                let slot = Arc::new(spin::Mutex::new(None));
                let (storage, target) = (buffer.storage().clone(), slot.clone());

                stream::submit(
                    stream,
                    Box::new(move || {
                        *target.lock() = Some(storage.read(offset, len)?);
                        Ok(())
                    }),
                    false,
                )?;
                stream.synchronize()?;

                let bytes = slot.lock().take();
                bytes.ok_or_else(|| {
                    CollectiveError::library("The read was deferred by an open group")
                })?
            }
            false => buffer
                .storage()
                .read(offset, len)
                .map_err(CollectiveError::library)?,
        };

        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Run a host function on the default stream of a device, after all work already queued on
    /// it. Stands in for compute kernels.
    pub fn enqueue<F>(&self, device: DeviceId, func: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let stream = &self.device(device)?.default_stream;

        stream::submit(
            stream,
            Box::new(move || {
                func();
                Ok(())
            }),
            false,
        )
    }

    fn device(&self, device: DeviceId) -> Result<&HostDevice> {
        if !device.is_gpu() {
            return Err(CollectiveError::library(format!(
                "{device} isn't a device of the host backend"
            )));
        }

        self.devices.get(device.index as usize).ok_or_else(|| {
            CollectiveError::library(format!(
                "Invalid device ordinal {}, only {} devices are available",
                device.index,
                self.devices.len()
            ))
        })
    }

    fn ensure_current(&self, device: DeviceId, what: &str) -> Result<()> {
        let current = self.current_device()?;

        match current == device {
            true => Ok(()),
            false => Err(CollectiveError::library(format!(
                "{what} belongs to {device}, but {current} is the current device"
            ))),
        }
    }

    fn ensure_issue(&self, comm: &HostComm, stream: &HostStream) -> Result<()> {
        self.ensure_current(comm.device(), "The communicator")?;
        self.ensure_current(stream.device(), "The stream")
    }
}

impl core::fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostBackend")
            .field("id", &self.id)
            .field("devices", &self.devices.len())
            .finish()
    }
}

fn ensure_peer(comm: &HostComm, peer: usize, what: &str) -> Result<()> {
    match peer < comm.size() {
        true => Ok(()),
        false => Err(CollectiveError::library(format!(
            "Invalid {what} {peer} for a communicator of {} ranks",
            comm.size()
        ))),
    }
}

fn ensure_same_layout(
    input: &BufferRef<'_, HostStorage>,
    output: &BufferRef<'_, HostStorage>,
    scale: usize,
) -> Result<()> {
    match input.dtype == output.dtype && input.count * scale == output.count {
        true => Ok(()),
        false => Err(CollectiveError::library(format!(
            "Invalid argument: {} x {:?} input for {} x {:?} output",
            input.count, input.dtype, output.count, output.dtype
        ))),
    }
}

fn signature(
    op: &str,
    dtype: CommDataType,
    count: usize,
    extra: impl core::fmt::Debug,
) -> alloc::string::String {
    format!("{op}/{dtype:?}/{count}/{extra:?}")
}

impl StreamBackend for HostBackend {
    type Storage = HostStorage;
    type Stream = HostStream;
    type Event = HostEvent;

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn current_device(&self) -> Result<DeviceId> {
        let index = CURRENT_DEVICE.with(|current| current.borrow().get(&self.id).copied());
        Ok(DeviceId::gpu(index.unwrap_or(0)))
    }

    fn set_device(&self, device: DeviceId) -> Result<()> {
        self.device(device)?;
        CURRENT_DEVICE.with(|current| current.borrow_mut().insert(self.id, device.index));
        Ok(())
    }

    fn default_stream(&self, device: DeviceId) -> Result<HostStream> {
        Ok(self.device(device)?.default_stream.clone())
    }

    fn create_stream(&self) -> Result<HostStream> {
        let device = self.current_device()?;
        let stream = HostStream::new(device)?;
        self.device(device)?.streams.lock().push(stream.clone());

        Ok(stream)
    }

    fn create_event(&self) -> Result<HostEvent> {
        Ok(HostEvent::new(self.current_device()?))
    }

    fn record_event(&self, event: &HostEvent, stream: &HostStream) -> Result<()> {
        self.ensure_current(stream.device(), "The stream")?;
        self.ensure_current(event.device(), "The event")?;
        event.record(stream)
    }

    fn wait_event(&self, stream: &HostStream, event: &HostEvent) -> Result<()> {
        self.ensure_current(stream.device(), "The stream")?;
        event.block(stream)
    }

    fn query_event(&self, event: &HostEvent) -> Result<bool> {
        Ok(event.query())
    }

    fn stream_error(&self, stream: &HostStream) -> Result<()> {
        match stream.error() {
            Some(reason) => Err(CollectiveError::library(reason)),
            None => Ok(()),
        }
    }

    fn synchronize_device(&self) -> Result<()> {
        let device = self.device(self.current_device()?)?;
        device.default_stream.synchronize()?;

        let streams = device.streams.lock().clone();
        for stream in streams {
            stream.synchronize()?;
        }

        Ok(())
    }

    fn record_stream(&self, storage: &HostStorage, stream: &HostStream) -> Result<()> {
        self.ensure_current(stream.device(), "The stream")?;
        let storage = storage.clone();

        // Holding the handle until the stream reaches this point keeps the memory alive.
        stream::submit(
            stream,
            Box::new(move || {
                core::mem::drop(storage);
                Ok(())
            }),
            false,
        )
    }

    fn alloc_zeros(&self, dtype: ElemType, numel: usize) -> Result<HostStorage> {
        Ok(HostStorage::zeros(
            self.current_device()?,
            numel * dtype.size(),
        ))
    }
}

impl CommBackend for HostBackend {
    type Comm = HostComm;

    const GROUP_NAME: &'static str = "ProcessGroupHost";

    fn unique_id(&self) -> Result<BootstrapId> {
        let mut bytes = [0u8; BOOTSTRAP_ID_BYTES];
        rand::rng().fill(&mut bytes[..]);

        Ok(BootstrapId::new(bytes))
    }

    fn group_start(&self) -> Result<()> {
        stream::group_start();
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        stream::group_end()
    }

    fn create_communicator(
        &self,
        world_size: usize,
        rank: usize,
        id: &BootstrapId,
    ) -> Result<HostComm> {
        let device = self.current_device()?;
        let clique = self.fabric.join(id, world_size, rank)?;

        Ok(HostComm::new(clique, rank, device))
    }

    fn broadcast(
        &self,
        input: BufferRef<'_, HostStorage>,
        output: BufferRef<'_, HostStorage>,
        root: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        self.ensure_issue(comm, stream)?;
        ensure_peer(comm, root, "root")?;
        ensure_same_layout(&input, &output, 1)?;

        let signature = signature("broadcast", input.dtype, input.count, root);
        let (input, output) = (Region::new(&input), Region::new(&output));
        let (clique, rank, seq) = (comm.clique(), comm.rank(), comm.next_seq());

        stream::submit(
            stream,
            Box::new(move || {
                let data = match rank == root {
                    true => input.read()?,
                    false => Vec::new(),
                };
                let all = clique.exchange(seq, rank, signature, data)?;
                output.write(&all[root])
            }),
            false,
        )
    }

    fn all_reduce(
        &self,
        input: BufferRef<'_, HostStorage>,
        output: BufferRef<'_, HostStorage>,
        op: ReduceOp,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        self.ensure_issue(comm, stream)?;
        ensure_same_layout(&input, &output, 1)?;

        let dtype = input.dtype;
        let signature = signature("all_reduce", dtype, input.count, op);
        let (input, output) = (Region::new(&input), Region::new(&output));
        let (clique, rank, seq) = (comm.clique(), comm.rank(), comm.next_seq());

        stream::submit(
            stream,
            Box::new(move || {
                let all = clique.exchange(seq, rank, signature, input.read()?)?;
                output.write(&reduce::reduce(dtype, op, &all))
            }),
            false,
        )
    }

    fn reduce(
        &self,
        input: BufferRef<'_, HostStorage>,
        output: BufferRef<'_, HostStorage>,
        op: ReduceOp,
        root: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        self.ensure_issue(comm, stream)?;
        ensure_peer(comm, root, "root")?;
        ensure_same_layout(&input, &output, 1)?;

        let dtype = input.dtype;
        let signature = signature("reduce", dtype, input.count, (op, root));
        let (input, output) = (Region::new(&input), Region::new(&output));
        let (clique, rank, seq) = (comm.clique(), comm.rank(), comm.next_seq());

        stream::submit(
            stream,
            Box::new(move || {
                let all = clique.exchange(seq, rank, signature, input.read()?)?;
                match rank == root {
                    true => output.write(&reduce::reduce(dtype, op, &all)),
                    false => Ok(()),
                }
            }),
            false,
        )
    }

    fn all_gather(
        &self,
        input: BufferRef<'_, HostStorage>,
        output: BufferRef<'_, HostStorage>,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        self.ensure_issue(comm, stream)?;
        ensure_same_layout(&input, &output, comm.size())?;

        let signature = signature("all_gather", input.dtype, input.count, ());
        let (input, output) = (Region::new(&input), Region::new(&output));
        let (clique, rank, seq) = (comm.clique(), comm.rank(), comm.next_seq());

        stream::submit(
            stream,
            Box::new(move || {
                let all = clique.exchange(seq, rank, signature, input.read()?)?;
                output.write(&all.concat())
            }),
            false,
        )
    }

    fn send(
        &self,
        input: BufferRef<'_, HostStorage>,
        peer: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        self.ensure_issue(comm, stream)?;
        ensure_peer(comm, peer, "peer")?;

        let input = Region::new(&input);
        let (clique, rank) = (comm.clique(), comm.rank());

        stream::submit(
            stream,
            Box::new(move || {
                clique.post(rank, peer, input.read()?);
                Ok(())
            }),
            true,
        )
    }

    fn recv(
        &self,
        output: BufferRef<'_, HostStorage>,
        peer: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        self.ensure_issue(comm, stream)?;
        ensure_peer(comm, peer, "peer")?;

        let output = Region::new(&output);
        let (clique, rank) = (comm.clique(), comm.rank());

        stream::submit(
            stream,
            Box::new(move || output.write(&clique.take(peer, rank))),
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::grouped;

    fn comms(fabric: &Arc<HostFabric>, size: usize) -> Vec<(HostBackend, HostComm, HostStream)> {
        let backends: Vec<_> = (0..size)
            .map(|_| HostBackend::new(fabric.clone(), 1).unwrap())
            .collect();
        let id = backends[0].unique_id().unwrap();

        backends
            .into_iter()
            .enumerate()
            .map(|(rank, backend)| {
                let comm = backend.create_communicator(size, rank, &id).unwrap();
                let stream = backend.create_stream().unwrap();
                (backend, comm, stream)
            })
            .collect()
    }

    #[test]
    fn all_reduce_sums_across_backends() {
        let fabric = HostFabric::new();
        let ranks = comms(&fabric, 3);

        let results = std::thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .enumerate()
                .map(|(rank, (backend, comm, stream))| {
                    s.spawn(move || {
                        let device = DeviceId::gpu(0);
                        let buffer = backend
                            .buffer(device, ElemType::F32, vec![2], &[rank as f32, 1.0])
                            .unwrap();
                        let view = BufferRef::whole(&buffer).unwrap();
                        backend
                            .all_reduce(view, view, ReduceOp::Sum, comm, stream)
                            .unwrap();
                        stream.synchronize().unwrap();
                        backend.read::<f32>(&buffer).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        for result in results {
            assert_eq!(result, [3.0, 3.0]);
        }
        assert_eq!(fabric.clique_count(), 1);
    }

    #[test]
    fn grouped_send_recv_doesnt_deadlock() {
        let fabric = HostFabric::new();
        let ranks = comms(&fabric, 2);

        let results = std::thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .enumerate()
                .map(|(rank, (backend, comm, stream))| {
                    s.spawn(move || {
                        let device = DeviceId::gpu(0);
                        let peer = 1 - rank;
                        let input = backend
                            .buffer(device, ElemType::I32, vec![1], &[rank as i32 + 10])
                            .unwrap();
                        let output = backend.zeros(device, ElemType::I32, vec![1]).unwrap();

                        grouped(backend, || {
                            // Receive first on purpose, the group must still make progress.
                            backend.recv(BufferRef::whole(&output)?, peer, comm, stream)?;
                            backend.send(BufferRef::whole(&input)?, peer, comm, stream)
                        })
                        .unwrap();
                        stream.synchronize().unwrap();
                        backend.read::<i32>(&output).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(results, vec![vec![11], vec![10]]);
    }

    #[test]
    fn work_on_another_device_is_rejected() {
        let backend = HostBackend::new(HostFabric::new(), 2).unwrap();

        backend.set_device(DeviceId::gpu(1)).unwrap();
        let stream = backend.create_stream().unwrap();
        let event = backend.create_event().unwrap();
        backend.set_device(DeviceId::gpu(0)).unwrap();

        assert!(backend.record_event(&event, &stream).is_err());
        assert!(backend.set_device(DeviceId::gpu(2)).is_err());
    }

    #[test]
    fn buffer_checks_element_size() {
        let backend = HostBackend::new(HostFabric::new(), 1).unwrap();

        assert!(
            backend
                .buffer(DeviceId::gpu(0), ElemType::F64, vec![1], &[1.0f32])
                .unwrap_err()
                .is_precondition()
        );
    }
}
