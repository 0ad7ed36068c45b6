use crate::backend::{CommBackend, StreamBackend, grouped};
use crate::device::{DeviceGuard, DeviceId, DeviceSetKey};
use crate::error::{CollectiveError, Result};
use crate::rendezvous::exchange_bootstrap_id;
use crate::store::Store;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use std::sync::RwLock;

/// The communicators of one device set, with a private stream and an event per device.
///
/// A set never changes once built.
pub struct CommunicatorSet<B: CommBackend> {
    key: DeviceSetKey,
    devices: Vec<DeviceId>,
    comms: Vec<B::Comm>,
    streams: Vec<<B as StreamBackend>::Stream>,
    events: Vec<<B as StreamBackend>::Event>,
    comm_ranks: Vec<usize>,
    world_size: usize,
}

/// Parameters used to build the communicators of a device set.
#[derive(new, Clone, Copy)]
pub struct SetOptions<'a> {
    /// Where bootstrap ids are exchanged.
    pub store: &'a dyn Store,
    /// The id of the process group.
    pub group_id: usize,
    /// The rank of this process.
    pub rank: usize,
    /// The number of processes.
    pub world_size: usize,
}

impl<B: CommBackend> CommunicatorSet<B> {
    /// Build the communicators of the device set number `index`.
    ///
    /// Device `i` of rank `r` joins a communicator of `world_size * n` ranks as rank `r * n + i`,
    /// where `n` is the number of local devices. Every communicator is created inside a single
    /// library group.
    pub fn create(
        backend: &B,
        key: DeviceSetKey,
        devices: &[DeviceId],
        index: usize,
        options: SetOptions<'_>,
    ) -> Result<Self> {
        let id = exchange_bootstrap_id(
            backend,
            options.store,
            options.group_id,
            index,
            options.rank,
        )?;

        let count = devices.len();
        let world_size = options.world_size * count;
        let comm_ranks: Vec<usize> = (0..count).map(|i| options.rank * count + i).collect();

        let mut guard = DeviceGuard::new(backend);
        let mut streams = Vec::with_capacity(count);
        let mut events = Vec::with_capacity(count);

        for device in devices {
            guard.set(*device)?;
            streams.push(backend.create_stream()?);
            events.push(backend.create_event()?);
        }

        let comms = grouped(backend, || {
            let mut comms = Vec::with_capacity(count);
            for (device, comm_rank) in devices.iter().zip(comm_ranks.iter()) {
                guard.set(*device)?;
                comms.push(backend.create_communicator(world_size, *comm_rank, &id)?);
            }
            Ok(comms)
        })?;

        log::debug!(
            "Created {count} communicators for devices [{key}] of rank {} in a world of {world_size}",
            options.rank
        );

        Ok(Self {
            key,
            devices: devices.to_vec(),
            comms,
            streams,
            events,
            comm_ranks,
            world_size,
        })
    }

    /// The key of the device set.
    pub fn key(&self) -> &DeviceSetKey {
        &self.key
    }

    /// The devices of the set, in order.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// One communicator per device.
    pub fn comms(&self) -> &[B::Comm] {
        &self.comms
    }

    /// The private stream of each device.
    pub fn streams(&self) -> &[<B as StreamBackend>::Stream] {
        &self.streams
    }

    /// The synchronization event of each device.
    pub fn events(&self) -> &[<B as StreamBackend>::Event] {
        &self.events
    }

    /// The rank of each device inside its communicator.
    pub fn comm_ranks(&self) -> &[usize] {
        &self.comm_ranks
    }

    /// The number of ranks of every communicator of the set.
    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

impl<B: CommBackend> core::fmt::Debug for CommunicatorSet<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommunicatorSet")
            .field("key", &self.key)
            .field("comm_ranks", &self.comm_ranks)
            .field("world_size", &self.world_size)
            .finish()
    }
}

/// Communicator sets of a process group, keyed by device set.
///
/// Sets are added on demand and never evicted.
pub struct CommunicatorCache<B: CommBackend> {
    sets: RwLock<HashMap<DeviceSetKey, Arc<CommunicatorSet<B>>>>,
}

impl<B: CommBackend> Default for CommunicatorCache<B> {
    fn default() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
        }
    }
}

impl<B: CommBackend> CommunicatorCache<B> {
    /// Get the set of the given key, if it was built already.
    pub fn get(&self, key: &DeviceSetKey) -> Result<Option<Arc<CommunicatorSet<B>>>> {
        let sets = self.sets.read().map_err(|_| poisoned())?;
        Ok(sets.get(key).cloned())
    }

    /// Get the set of the given key, building it with `init` on first use.
    ///
    /// `init` receives the creation ordinal of the set and runs under the exclusive lock, so at
    /// most one set is built at a time. A set that fails to build isn't cached.
    pub fn resolve<F>(&self, key: &DeviceSetKey, init: F) -> Result<Arc<CommunicatorSet<B>>>
    where
        F: FnOnce(usize) -> Result<CommunicatorSet<B>>,
    {
        if let Some(set) = self.get(key)? {
            return Ok(set);
        }

        let mut sets = self.sets.write().map_err(|_| poisoned())?;
        if let Some(set) = sets.get(key) {
            return Ok(set.clone());
        }

        let set = Arc::new(init(sets.len())?);
        sets.insert(key.clone(), set.clone());

        Ok(set)
    }

    /// Number of device sets built so far.
    pub fn len(&self) -> usize {
        self.sets.read().map(|sets| sets.len()).unwrap_or(0)
    }

    /// Whether no device set was built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> CollectiveError {
    CollectiveError::library("The communicator cache is poisoned")
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::backend::host::{HostBackend, HostFabric};
    use crate::store::MemoryStore;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use pretty_assertions::assert_eq;

    fn build(
        backend: &HostBackend,
        store: &MemoryStore,
        devices: &[DeviceId],
        index: usize,
    ) -> Result<CommunicatorSet<HostBackend>> {
        let key = DeviceSetKey::new(devices)?;
        CommunicatorSet::create(
            backend,
            key,
            devices,
            index,
            SetOptions::new(store, 0, 0, 1),
        )
    }

    #[test_log::test]
    fn resolve_is_idempotent() {
        let backend = HostBackend::new(HostFabric::new(), 2).unwrap();
        let store = MemoryStore::new();
        let cache = CommunicatorCache::default();
        let calls = AtomicUsize::new(0);
        let devices = [DeviceId::gpu(0), DeviceId::gpu(1)];
        let key = DeviceSetKey::new(&devices).unwrap();

        let init = |index| {
            calls.fetch_add(1, Ordering::Relaxed);
            build(&backend, &store, &devices, index)
        };
        let first = cache.resolve(&key, init).unwrap();
        let second = cache
            .resolve(&key, |index| build(&backend, &store, &devices, index))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(first.comm_ranks(), &[0, 1]);
        assert_eq!(first.world_size(), 2);
        assert_eq!(backend.fabric().clique_count(), 1);
    }

    #[test_log::test]
    fn each_device_set_gets_its_own_ordinal() {
        let backend = HostBackend::new(HostFabric::new(), 2).unwrap();
        let store = MemoryStore::new();
        let cache = CommunicatorCache::default();
        let mut ordinals = Vec::new();

        for devices in [[DeviceId::gpu(0)], [DeviceId::gpu(1)]] {
            let key = DeviceSetKey::new(&devices).unwrap();
            cache
                .resolve(&key, |index| {
                    ordinals.push(index);
                    build(&backend, &store, &devices, index)
                })
                .unwrap();
        }

        assert_eq!(ordinals, vec![0, 1]);
        assert_eq!(cache.len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test_log::test]
    fn failed_sets_are_not_cached() {
        let cache = CommunicatorCache::<HostBackend>::default();
        let key = DeviceSetKey::new(&[DeviceId::gpu(0)]).unwrap();

        let err = cache
            .resolve(&key, |_| Err(CollectiveError::library("boom")))
            .unwrap_err();

        assert!(matches!(err, CollectiveError::Library { .. }));
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn creation_restores_the_current_device() {
        let backend = HostBackend::new(HostFabric::new(), 2).unwrap();
        let store = MemoryStore::new();

        build(&backend, &store, &[DeviceId::gpu(1)], 0).unwrap();

        assert_eq!(backend.current_device().unwrap(), DeviceId::gpu(0));
    }
}
