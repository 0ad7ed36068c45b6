use crate::backend::StreamBackend;
use crate::buffer::Buffer;
use crate::config::WaitConfig;
use crate::device::{DeviceGuard, DeviceId};
use crate::error::{CollectiveError, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use web_time::Instant;

/// The kind of operation a [task](Task) tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommKind {
    /// [Broadcast](crate::ProcessGroup::broadcast).
    Broadcast,
    /// [All-reduce](crate::ProcessGroup::all_reduce).
    AllReduce,
    /// [Reduce](crate::ProcessGroup::reduce).
    Reduce,
    /// [All-gather](crate::ProcessGroup::all_gather).
    AllGather,
    /// [All-to-all](crate::ProcessGroup::all_to_all).
    AllToAll,
    /// [Scatter](crate::ProcessGroup::scatter).
    Scatter,
    /// [Send](crate::ProcessGroup::send), whole or partial.
    Send,
    /// [Receive](crate::ProcessGroup::recv), whole or partial.
    Recv,
    /// An all-reduce over scratch buffers, waiting on it blocks the host.
    Barrier,
}

/// How [wait](Task::wait) blocks the host.
#[derive(new, Debug, Clone, PartialEq)]
pub struct WaitPolicy {
    /// Poll the completion of the task before returning.
    pub blocking: bool,
    /// Timeout and polling settings.
    pub config: WaitConfig,
}

/// Handle on one issued operation, possibly spanning multiple devices.
///
/// The task keeps its output buffers alive until it is dropped.
pub struct Task<B: StreamBackend> {
    backend: Arc<B>,
    devices: Vec<DeviceId>,
    rank: usize,
    kind: CommKind,
    streams: Vec<B::Stream>,
    events: Vec<B::Event>,
    outputs: Vec<Buffer<B::Storage>>,
    scratch: Option<Vec<Buffer<B::Storage>>>,
    policy: WaitPolicy,
}

impl<B: StreamBackend> Task<B> {
    /// Create a task completing when every event is reached.
    ///
    /// `streams` and `events` hold one entry per device, the events already recorded on the
    /// streams after the operation.
    pub(crate) fn new(
        backend: Arc<B>,
        devices: Vec<DeviceId>,
        rank: usize,
        kind: CommKind,
        streams: Vec<B::Stream>,
        events: Vec<B::Event>,
        outputs: Vec<Buffer<B::Storage>>,
        policy: WaitPolicy,
    ) -> Self {
        Self {
            backend,
            devices,
            rank,
            kind,
            streams,
            events,
            outputs,
            scratch: None,
            policy,
        }
    }

    /// Turn the task into a barrier retaining the given scratch buffers.
    pub(crate) fn with_scratch(mut self, scratch: Vec<Buffer<B::Storage>>) -> Self {
        self.kind = CommKind::Barrier;
        self.scratch = Some(scratch);
        self
    }

    /// The kind of operation.
    pub fn kind(&self) -> CommKind {
        self.kind
    }

    /// The rank of the process that issued the operation.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The devices taking part in the operation.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// The output buffers retained by the task.
    pub fn outputs(&self) -> &[Buffer<B::Storage>] {
        &self.outputs
    }

    /// Whether waiting on the task synchronizes the host with the devices.
    pub fn is_barrier(&self) -> bool {
        self.scratch.is_some()
    }

    /// Whether the operation completed on every device. Never blocks.
    ///
    /// Fails with a [library error](CollectiveError::Library) once a device that reached the
    /// operation reports an asynchronous failure.
    pub fn is_completed(&self) -> Result<bool> {
        let mut completed = true;

        for (stream, event) in self.streams.iter().zip(self.events.iter()) {
            match self.backend.query_event(event)? {
                true => self.backend.stream_error(stream)?,
                false => completed = false,
            }
        }

        Ok(completed)
    }

    /// Order the default stream of every device after the operation.
    ///
    /// In blocking mode, the host additionally polls the completion of the task, failing with a
    /// [timeout](CollectiveError::Timeout) when it's enforced. Barriers always synchronize the host
    /// with their devices. Failures already reported by the devices are returned in both modes.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let mut guard = DeviceGuard::new(self.backend.as_ref());

        for (device, event) in self.devices.iter().zip(self.events.iter()) {
            guard.set(*device)?;
            let stream = self.backend.default_stream(*device)?;
            self.backend.wait_event(&stream, event)?;
        }

        match self.policy.blocking {
            true => self.poll(timeout)?,
            false => {
                self.is_completed()?;
            }
        }

        if self.is_barrier() {
            for device in self.devices.iter() {
                guard.set(*device)?;
                self.backend.synchronize_device()?;
            }
        }

        Ok(())
    }

    /// [Wait](Self::wait) with the default timeout.
    pub fn synchronize(&self) -> Result<()> {
        self.wait(self.policy.config.default_timeout())
    }

    fn poll(&self, timeout: Duration) -> Result<()> {
        let config = &self.policy.config;
        let start = Instant::now();
        let max_delay = Duration::from_micros(config.poll_max_us.max(config.poll_min_us));
        let mut delay = Duration::from_micros(config.poll_min_us);

        while !self.is_completed()? {
            let elapsed = start.elapsed();
            if config.enforce_timeout && elapsed >= timeout {
                log::warn!(
                    "{:?} task of rank {} didn't complete after {elapsed:?}",
                    self.kind,
                    self.rank
                );
                return Err(CollectiveError::Timeout {
                    timeout_ms: timeout.as_millis(),
                    elapsed_ms: elapsed.as_millis(),
                });
            }

            std::thread::sleep(delay);
            delay = (delay * 2).min(max_delay);
        }

        Ok(())
    }
}

impl<B: StreamBackend> core::fmt::Debug for Task<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("devices", &self.devices)
            .finish()
    }
}
