use crate::backend::{CommBackend, grouped};
use crate::buffer::Buffer;
use crate::cache::{CommunicatorCache, CommunicatorSet, SetOptions};
use crate::config::{CollectiveConfig, CollectiveLogLevel, GlobalConfig, Logger};
use crate::device::{DeviceGuard, DeviceId, DeviceSetKey};
use crate::error::{Result, ensure};
use crate::store::Store;
use crate::sync::sync_default_stream;
use crate::task::{CommKind, Task, WaitPolicy};
use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// A group of processes running collective operations together.
///
/// Every operation is issued asynchronously on a private stream per device and returns a
/// [task](Task) tracking its completion. Communicators are created on first use of a device set
/// and cached for the lifetime of the group.
pub struct ProcessGroup<B: CommBackend> {
    backend: Arc<B>,
    store: Arc<dyn Store>,
    rank: usize,
    size: usize,
    device: DeviceId,
    group_id: usize,
    config: CollectiveConfig,
    cache: CommunicatorCache<B>,
    used_devices: spin::Mutex<BTreeSet<u32>>,
    logger: spin::Mutex<Logger>,
}

/// The slot of one local device while an operation is issued.
pub(crate) struct Slot<'a, B: CommBackend> {
    /// Index of the device among the buffers of the call.
    pub index: usize,
    pub comm: &'a B::Comm,
    pub stream: &'a B::Stream,
    /// Rank of the device inside its communicator.
    pub comm_rank: usize,
    /// Number of ranks of the communicator.
    pub world_size: usize,
    /// Number of local devices taking part in the call.
    pub local_count: usize,
}

impl<B: CommBackend> ProcessGroup<B> {
    /// Create a process group configured from the [global config](GlobalConfig).
    pub fn new(
        backend: Arc<B>,
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        device: DeviceId,
        group_id: usize,
    ) -> Result<Self> {
        let config = GlobalConfig::get().collective.clone();
        Self::with_config(backend, store, rank, size, device, group_id, config)
    }

    /// Create a process group with an explicit configuration.
    pub fn with_config(
        backend: Arc<B>,
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        device: DeviceId,
        group_id: usize,
        config: CollectiveConfig,
    ) -> Result<Self> {
        ensure!(size > 0, "A process group needs at least one rank");
        ensure!(
            rank < size,
            "The rank {rank} is out of range for a world of {size} ranks"
        );

        let logger = Logger::new(&config.logger);
        log::debug!(
            "Creating {} {group_id} for rank {rank}/{size} on {device}",
            B::GROUP_NAME
        );

        Ok(Self {
            backend,
            store,
            rank,
            size,
            device,
            group_id,
            config,
            cache: CommunicatorCache::default(),
            used_devices: spin::Mutex::new(BTreeSet::new()),
            logger: spin::Mutex::new(logger),
        })
    }

    /// The rank of this process.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of processes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The device of this process.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The id of the group.
    pub fn group_id(&self) -> usize {
        self.group_id
    }

    /// The name of the communication backend.
    pub fn backend_name(&self) -> &'static str {
        B::GROUP_NAME
    }

    /// The backend driving the devices.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The configuration of the group.
    pub fn config(&self) -> &CollectiveConfig {
        &self.config
    }

    /// Ordinals of every device that ever took part in an operation of the group.
    pub fn used_devices(&self) -> Vec<u32> {
        self.used_devices.lock().iter().copied().collect()
    }

    /// Number of device sets with communicators.
    pub fn communicator_sets(&self) -> usize {
        self.cache.len()
    }

    /// Get the communicators of the given ordered devices, creating them on first use.
    pub fn communicators(&self, devices: &[DeviceId]) -> Result<Arc<CommunicatorSet<B>>> {
        let key = DeviceSetKey::new(devices)?;

        self.cache.resolve(&key, |index| {
            let options = SetOptions::new(self.store.as_ref(), self.group_id, self.rank, self.size);
            let set = CommunicatorSet::create(
                self.backend.as_ref(),
                key.clone(),
                devices,
                index,
                options,
            )?;

            self.used_devices
                .lock()
                .extend(devices.iter().map(|device| device.index));
            self.log(CollectiveLogLevel::Basic, || {
                format!(
                    "[{}] rank {} created {} communicators for devices [{key}] (set {index})",
                    B::GROUP_NAME,
                    self.rank,
                    devices.len()
                )
            });

            Ok(set)
        })
    }

    /// Issue one operation on every device of the call.
    ///
    /// The private streams first wait on the default streams, then `func` issues the work of each
    /// device inside a single library group, and finally a completion event is recorded on every
    /// private stream.
    pub(crate) fn issue<F>(
        &self,
        kind: CommKind,
        devices: Vec<DeviceId>,
        used: &[Buffer<B::Storage>],
        outputs: Vec<Buffer<B::Storage>>,
        mut func: F,
    ) -> Result<Task<B>>
    where
        F: FnMut(&B, Slot<'_, B>) -> Result<()>,
    {
        let backend = self.backend.as_ref();
        let set = self.communicators(&devices)?;

        sync_default_stream(backend, set.devices(), set.events(), set.streams())?;

        let mut guard = DeviceGuard::new(backend);

        if self.config.stream_safe_allocator {
            for ((device, buffer), stream) in devices.iter().zip(used).zip(set.streams()) {
                guard.set(*device)?;
                backend.record_stream(buffer.storage(), stream)?;
            }
        }

        grouped(backend, || {
            for (index, device) in devices.iter().enumerate() {
                guard.set(*device)?;
                func(
                    backend,
                    Slot {
                        index,
                        comm: &set.comms()[index],
                        stream: &set.streams()[index],
                        comm_rank: set.comm_ranks()[index],
                        world_size: set.world_size(),
                        local_count: devices.len(),
                    },
                )?;
            }
            Ok(())
        })?;

        let mut events = Vec::with_capacity(devices.len());
        for (device, stream) in devices.iter().zip(set.streams()) {
            guard.set(*device)?;
            let event = backend.create_event()?;
            backend.record_event(&event, stream)?;
            events.push(event);
        }

        log::trace!("Rank {} issued {kind:?} on [{}]", self.rank, set.key());
        self.log(CollectiveLogLevel::Full, || {
            format!(
                "[{}] rank {} issued {kind:?} on devices [{}]",
                B::GROUP_NAME,
                self.rank,
                set.key()
            )
        });

        Ok(Task::new(
            self.backend.clone(),
            devices,
            self.rank,
            kind,
            set.streams().to_vec(),
            events,
            outputs,
            self.wait_policy(),
        ))
    }

    pub(crate) fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::new(self.config.blocking_wait, self.config.wait.clone())
    }

    fn log<F: FnOnce() -> String>(&self, level: CollectiveLogLevel, message: F) {
        let mut logger = self.logger.lock();
        if logger.is_enabled(level) {
            logger.log_collective(&message());
        }
    }
}

impl<B: CommBackend> core::fmt::Debug for ProcessGroup<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("backend", &B::GROUP_NAME)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("device", &self.device)
            .field("group_id", &self.group_id)
            .finish()
    }
}
