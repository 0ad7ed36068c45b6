use bytemuck::Pod;
use cubecl_collective::backend::host::{HostBackend, HostFabric, HostStorage};
use cubecl_collective::buffer::{Buffer, ElemType};
use cubecl_collective::config::CollectiveConfig;
use cubecl_collective::device::DeviceId;
use cubecl_collective::store::{MemoryStore, Store};
use cubecl_collective::ProcessGroup;
use std::sync::Arc;
use std::time::Duration;

pub type Group = ProcessGroup<HostBackend>;
pub type HostBuffer = Buffer<HostStorage>;

/// Run `func` on `size` simulated processes with `devices` devices each, one thread per rank,
/// and return the results in rank order.
pub fn run<R, F>(size: usize, devices: usize, config: CollectiveConfig, func: F) -> Vec<R>
where
    R: Send,
    F: Fn(&Group) -> R + Sync,
{
    let fabric = HostFabric::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::with_timeout(Duration::from_secs(30)));

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let (fabric, store, config, func) =
                    (fabric.clone(), store.clone(), config.clone(), &func);
                s.spawn(move || {
                    let backend = Arc::new(HostBackend::new(fabric, devices).unwrap());
                    let group = ProcessGroup::with_config(
                        backend,
                        store,
                        rank,
                        size,
                        DeviceId::gpu(0),
                        0,
                        config,
                    )
                    .unwrap();
                    func(&group)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
}

/// Run `func` with the default configuration and one device per rank.
pub fn run_default<R, F>(size: usize, func: F) -> Vec<R>
where
    R: Send,
    F: Fn(&Group) -> R + Sync,
{
    run(size, 1, CollectiveConfig::default(), func)
}

pub fn buffer<T: Pod>(group: &Group, device: u32, dtype: ElemType, data: &[T]) -> HostBuffer {
    group
        .backend()
        .buffer(DeviceId::gpu(device), dtype, vec![data.len()], data)
        .unwrap()
}

pub fn read<T: Pod>(group: &Group, buffer: &HostBuffer) -> Vec<T> {
    group.backend().read(buffer).unwrap()
}
