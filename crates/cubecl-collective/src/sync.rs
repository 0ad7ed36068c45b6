use crate::backend::StreamBackend;
use crate::device::{DeviceGuard, DeviceId};
use crate::error::Result;

/// Order the private streams of a device set after the work already queued on the default stream
/// of each device.
///
/// An event is recorded on the default stream of every device and the matching private stream
/// waits on it, so a collective never races the compute that produced its inputs.
pub fn sync_default_stream<B: StreamBackend>(
    backend: &B,
    devices: &[DeviceId],
    events: &[B::Event],
    streams: &[B::Stream],
) -> Result<()> {
    let mut guard = DeviceGuard::new(backend);

    for ((device, event), stream) in devices.iter().zip(events).zip(streams) {
        guard.set(*device)?;
        let default_stream = backend.default_stream(*device)?;
        backend.record_event(event, &default_stream)?;
        backend.wait_event(stream, event)?;
    }

    Ok(())
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::backend::host::{HostBackend, HostFabric};
    use crate::buffer::ElemType;
    use core::time::Duration;
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn private_stream_waits_for_prior_compute() {
        let backend = HostBackend::new(HostFabric::new(), 1).unwrap();
        let device = DeviceId::gpu(0);
        let buffer = backend
            .buffer(device, ElemType::I32, vec![1], &[0i32])
            .unwrap();
        let stream = backend.create_stream().unwrap();
        let event = backend.create_event().unwrap();

        // Slow compute writing the buffer on the default stream.
        let storage = buffer.storage().clone();
        backend
            .enqueue(device, move || {
                std::thread::sleep(Duration::from_millis(50));
                storage.write(0, &7i32.to_ne_bytes()).unwrap();
            })
            .unwrap();

        sync_default_stream(
            &backend,
            &[device],
            core::slice::from_ref(&event),
            core::slice::from_ref(&stream),
        )
        .unwrap();
        stream.synchronize().unwrap();

        // The private stream only drained after the compute completed.
        assert_eq!(buffer.storage().read(0, 4).unwrap(), 7i32.to_ne_bytes());
    }
}
