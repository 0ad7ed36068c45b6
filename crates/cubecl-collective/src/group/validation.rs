use crate::backend::CommDataType;
use crate::buffer::Buffer;
use crate::device::{DeviceId, devices_of};
use crate::error::{Result, ensure};
use alloc::vec::Vec;
use hashbrown::HashSet;

/// Check the placement of the buffers of one call and return their devices.
///
/// Buffers must live on distinct GPU-class devices, with no more buffers than ranks, and hold an
/// element type the library supports.
pub(crate) fn check_buffers<S>(buffers: &[Buffer<S>], world_size: usize) -> Result<Vec<DeviceId>> {
    ensure!(!buffers.is_empty(), "At least one buffer is required");
    ensure!(
        buffers.len() <= world_size,
        "{} buffers were given but the world has only {world_size} ranks",
        buffers.len()
    );

    let devices = devices_of(buffers);
    let mut seen = HashSet::with_capacity(devices.len());
    for device in devices.iter() {
        ensure!(device.is_gpu(), "Buffers must be on a GPU-class device, got {device}");
        ensure!(
            seen.insert(*device),
            "Buffers of the same call must be on distinct devices, {device} is used twice"
        );
    }

    for buffer in buffers {
        CommDataType::try_from(buffer.dtype())?;
    }

    Ok(devices)
}

/// Check that inputs and outputs go in pairs on the same devices with the same element type.
pub(crate) fn check_pairs<S>(
    inputs: &[Buffer<S>],
    outputs: &[Buffer<S>],
    world_size: usize,
) -> Result<Vec<DeviceId>> {
    ensure!(
        inputs.len() == outputs.len(),
        "{} inputs were given for {} outputs",
        inputs.len(),
        outputs.len()
    );
    let devices = check_buffers(inputs, world_size)?;

    for (input, output) in inputs.iter().zip(outputs) {
        ensure!(
            input.device() == output.device(),
            "The output on {} doesn't match the input on {}",
            output.device(),
            input.device()
        );
        ensure!(
            input.dtype() == output.dtype(),
            "The output element type {:?} doesn't match the input element type {:?}",
            output.dtype(),
            input.dtype()
        );
    }

    Ok(devices)
}

/// Check that every output holds `numerator / denominator` times the elements of its input.
pub(crate) fn check_numel<S>(
    inputs: &[Buffer<S>],
    outputs: &[Buffer<S>],
    numerator: usize,
    denominator: usize,
) -> Result<()> {
    for (input, output) in inputs.iter().zip(outputs) {
        ensure!(
            input.numel() % denominator == 0,
            "The input of {} elements can't be split into {denominator} equal parts",
            input.numel()
        );
        let expected = input.numel() / denominator * numerator;
        ensure!(
            output.numel() == expected,
            "The output holds {} elements but {expected} are expected",
            output.numel()
        );
    }

    Ok(())
}

/// Check that a rank is part of the world.
pub(crate) fn check_rank(rank: usize, world_size: usize, what: &str) -> Result<()> {
    ensure!(
        rank < world_size,
        "The {what} {rank} is out of range for a world of {world_size} ranks"
    );
    Ok(())
}
