use super::base::ProcessGroup;
use super::options::{AllReduceOptions, BroadcastOptions, ReduceOptions, ScatterOptions};
use super::validation::{check_buffers, check_numel, check_pairs, check_rank};
use crate::backend::{CommBackend, ReduceOp};
use crate::buffer::{Buffer, BufferRef, ElemType};
use crate::device::DeviceGuard;
use crate::error::{Result, ensure};
use crate::task::{CommKind, Task};

impl<B: CommBackend> ProcessGroup<B> {
    /// Copy the buffer `source_root` of rank `source_rank` into every output of every rank.
    pub fn broadcast(
        &self,
        inputs: &[Buffer<B::Storage>],
        outputs: &[Buffer<B::Storage>],
        options: BroadcastOptions,
    ) -> Result<Task<B>> {
        let devices = check_pairs(inputs, outputs, self.size())?;
        check_numel(inputs, outputs, 1, 1)?;
        check_rank(options.source_rank, self.size(), "source rank")?;
        ensure!(
            options.source_root < devices.len(),
            "The source root {} is out of range for {} local buffers",
            options.source_root,
            devices.len()
        );
        let root = options.source_rank * devices.len() + options.source_root;

        self.issue(
            CommKind::Broadcast,
            devices,
            inputs,
            outputs.to_vec(),
            |backend, slot| {
                backend.broadcast(
                    BufferRef::whole(&inputs[slot.index])?,
                    BufferRef::whole(&outputs[slot.index])?,
                    root,
                    slot.comm,
                    slot.stream,
                )
            },
        )
    }

    /// Reduce the inputs of every rank element-wise into every output. Inputs and outputs may
    /// alias.
    pub fn all_reduce(
        &self,
        inputs: &[Buffer<B::Storage>],
        outputs: &[Buffer<B::Storage>],
        options: AllReduceOptions,
    ) -> Result<Task<B>> {
        let devices = check_pairs(inputs, outputs, self.size())?;
        check_numel(inputs, outputs, 1, 1)?;

        self.issue(
            CommKind::AllReduce,
            devices,
            inputs,
            outputs.to_vec(),
            |backend, slot| {
                backend.all_reduce(
                    BufferRef::whole(&inputs[slot.index])?,
                    BufferRef::whole(&outputs[slot.index])?,
                    options.reduce_op,
                    slot.comm,
                    slot.stream,
                )
            },
        )
    }

    /// Reduce the inputs of every rank element-wise into the first output of `root_rank`. The
    /// outputs of other ranks are left unspecified.
    pub fn reduce(
        &self,
        inputs: &[Buffer<B::Storage>],
        outputs: &[Buffer<B::Storage>],
        options: ReduceOptions,
    ) -> Result<Task<B>> {
        let devices = check_pairs(inputs, outputs, self.size())?;
        check_numel(inputs, outputs, 1, 1)?;
        check_rank(options.root_rank, self.size(), "root rank")?;
        let root = options.root_rank * devices.len();

        self.issue(
            CommKind::Reduce,
            devices,
            inputs,
            outputs.to_vec(),
            |backend, slot| {
                backend.reduce(
                    BufferRef::whole(&inputs[slot.index])?,
                    BufferRef::whole(&outputs[slot.index])?,
                    options.reduce_op,
                    root,
                    slot.comm,
                    slot.stream,
                )
            },
        )
    }

    /// Concatenate the inputs of every rank, in rank order, into every output.
    pub fn all_gather(
        &self,
        inputs: &[Buffer<B::Storage>],
        outputs: &[Buffer<B::Storage>],
    ) -> Result<Task<B>> {
        let devices = check_pairs(inputs, outputs, self.size())?;
        check_numel(inputs, outputs, self.size() * devices.len(), 1)?;

        self.issue(
            CommKind::AllGather,
            devices,
            inputs,
            outputs.to_vec(),
            |backend, slot| {
                backend.all_gather(
                    BufferRef::whole(&inputs[slot.index])?,
                    BufferRef::whole(&outputs[slot.index])?,
                    slot.comm,
                    slot.stream,
                )
            },
        )
    }

    /// Split every input into one equal slice per rank, send slice `i` to rank `i` and receive the
    /// slice of rank `i` into slice `i` of the output.
    ///
    /// The number of elements must be divisible by the number of ranks.
    pub fn all_to_all(
        &self,
        inputs: &[Buffer<B::Storage>],
        outputs: &[Buffer<B::Storage>],
    ) -> Result<Task<B>> {
        let devices = check_pairs(inputs, outputs, self.size())?;
        let world_size = self.size() * devices.len();
        check_numel(inputs, outputs, world_size, world_size)?;

        self.issue(
            CommKind::AllToAll,
            devices,
            inputs,
            outputs.to_vec(),
            |backend, slot| {
                let (input, output) = (&inputs[slot.index], &outputs[slot.index]);
                let chunk = input.numel() / slot.world_size;

                for peer in 0..slot.world_size {
                    let offset = peer * chunk;
                    backend.send(
                        BufferRef::range(input, offset, chunk)?,
                        peer,
                        slot.comm,
                        slot.stream,
                    )?;
                    backend.recv(
                        BufferRef::range(output, offset, chunk)?,
                        peer,
                        slot.comm,
                        slot.stream,
                    )?;
                }
                Ok(())
            },
        )
    }

    /// Split the first input of `root_rank` into one equal slice per rank and send slice `i` to
    /// rank `i`. Every rank receives its slice into its output.
    ///
    /// The number of elements must be divisible by the number of ranks.
    pub fn scatter(
        &self,
        inputs: &[Buffer<B::Storage>],
        outputs: &[Buffer<B::Storage>],
        options: ScatterOptions,
    ) -> Result<Task<B>> {
        let devices = check_pairs(inputs, outputs, self.size())?;
        let world_size = self.size() * devices.len();
        check_numel(inputs, outputs, 1, world_size)?;
        check_rank(options.root_rank, self.size(), "root rank")?;
        let root = options.root_rank * devices.len();

        self.issue(
            CommKind::Scatter,
            devices,
            inputs,
            outputs.to_vec(),
            |backend, slot| {
                let (input, output) = (&inputs[slot.index], &outputs[slot.index]);

                if slot.comm_rank == root {
                    let chunk = input.numel() / slot.world_size;
                    for peer in 0..slot.world_size {
                        backend.send(
                            BufferRef::range(input, peer * chunk, chunk)?,
                            peer,
                            slot.comm,
                            slot.stream,
                        )?;
                    }
                }

                backend.recv(BufferRef::whole(output)?, root, slot.comm, slot.stream)
            },
        )
    }

    /// Send every buffer to the device with the same index on rank `dst_rank`.
    pub fn send(&self, buffers: &[Buffer<B::Storage>], dst_rank: usize) -> Result<Task<B>> {
        let devices = check_buffers(buffers, self.size())?;
        check_rank(dst_rank, self.size(), "destination rank")?;

        self.issue(
            CommKind::Send,
            devices,
            buffers,
            Vec::new(),
            |backend, slot| {
                backend.send(
                    BufferRef::whole(&buffers[slot.index])?,
                    dst_rank * slot.local_count + slot.index,
                    slot.comm,
                    slot.stream,
                )
            },
        )
    }

    /// Receive into every buffer from the device with the same index on rank `src_rank`.
    pub fn recv(&self, buffers: &[Buffer<B::Storage>], src_rank: usize) -> Result<Task<B>> {
        let devices = check_buffers(buffers, self.size())?;
        check_rank(src_rank, self.size(), "source rank")?;

        self.issue(
            CommKind::Recv,
            devices,
            buffers,
            buffers.to_vec(),
            |backend, slot| {
                backend.recv(
                    BufferRef::whole(&buffers[slot.index])?,
                    src_rank * slot.local_count + slot.index,
                    slot.comm,
                    slot.stream,
                )
            },
        )
    }

    /// Send the elements `[offset, offset + length)` of the flattened buffer, without copying.
    pub fn send_partial(
        &self,
        buffer: &Buffer<B::Storage>,
        dst_rank: usize,
        offset: usize,
        length: usize,
    ) -> Result<Task<B>> {
        let view = partial_view(buffer, offset, length)?;
        self.send(core::slice::from_ref(&view), dst_rank)
    }

    /// Receive into the elements `[offset, offset + length)` of the flattened buffer, leaving the
    /// others untouched.
    pub fn recv_partial(
        &self,
        buffer: &Buffer<B::Storage>,
        src_rank: usize,
        offset: usize,
        length: usize,
    ) -> Result<Task<B>> {
        let view = partial_view(buffer, offset, length)?;
        self.recv(core::slice::from_ref(&view), src_rank)
    }

    /// Synchronize every rank.
    ///
    /// Waiting on the returned task blocks the host until every rank issued its barrier. Only one
    /// device per process is supported: the device of the group.
    pub fn barrier(&self) -> Result<Task<B>> {
        let device = self.device();
        ensure!(
            device.is_gpu(),
            "A barrier needs a GPU-class device, the group is on {device}"
        );

        let scratch = {
            let _guard = DeviceGuard::on(self.backend().as_ref(), device)?;
            let storage = self.backend().alloc_zeros(ElemType::F32, 1)?;
            Buffer::new(storage, device, ElemType::F32, vec![1])
        };
        let buffers = [scratch];

        let task = self.issue(
            CommKind::Barrier,
            vec![device],
            &buffers,
            Vec::new(),
            |backend, slot| {
                let buffer = BufferRef::whole(&buffers[slot.index])?;
                backend.all_reduce(buffer, buffer, ReduceOp::Sum, slot.comm, slot.stream)
            },
        )?;

        Ok(task.with_scratch(buffers.to_vec()))
    }
}

fn partial_view<S: Clone>(buffer: &Buffer<S>, offset: usize, length: usize) -> Result<Buffer<S>> {
    ensure!(
        offset.checked_add(length).is_some_and(|end| end <= buffer.numel()),
        "The range [{offset}, {offset} + {length}) is out of bounds for a buffer of {} elements",
        buffer.numel()
    );

    buffer.flatten().slice(offset, offset + length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;

    #[test]
    fn partial_view_shares_storage() {
        let buffer = Buffer::new((), DeviceId::gpu(0), ElemType::F32, vec![10, 10]);

        let view = partial_view(&buffer, 25, 10).unwrap();

        assert_eq!(view.shape(), &[10]);
        assert_eq!(view.offset(), 25);
    }

    #[test]
    fn partial_view_checks_bounds() {
        let buffer = Buffer::new((), DeviceId::gpu(0), ElemType::F32, vec![100]);

        assert!(partial_view(&buffer, 95, 10).unwrap_err().is_precondition());
        assert!(partial_view(&buffer, usize::MAX, 2).unwrap_err().is_precondition());
    }
}
