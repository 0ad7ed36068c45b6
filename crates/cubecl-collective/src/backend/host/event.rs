use super::lock;
use super::stream::{HostStream, submit};
use crate::device::DeviceId;
use crate::error::Result;
use alloc::boxed::Box;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// A marker recorded on a [stream](HostStream).
///
/// Follows the semantics of device runtimes: querying or waiting refers to the last recording at
/// the time of the call, and an event that was never recorded is complete.
#[derive(Debug)]
pub struct HostEvent {
    device: DeviceId,
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct EventState {
    recorded: u64,
    completed: u64,
}

impl HostEvent {
    pub(crate) fn new(device: DeviceId) -> Self {
        Self {
            device,
            inner: Arc::new(EventInner::default()),
        }
    }

    /// The device the event was created on.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn record(&self, stream: &HostStream) -> Result<()> {
        let target = {
            let mut state = lock(&self.inner.state);
            state.recorded += 1;
            state.recorded
        };
        let inner = self.inner.clone();

        submit(
            stream,
            Box::new(move || {
                let mut state = lock(&inner.state);
                state.completed = state.completed.max(target);
                inner.cond.notify_all();
                Ok(())
            }),
            false,
        )
    }

    pub(crate) fn block(&self, stream: &HostStream) -> Result<()> {
        let target = lock(&self.inner.state).recorded;
        if target == 0 {
            return Ok(());
        }
        let inner = self.inner.clone();

        submit(
            stream,
            Box::new(move || {
                let mut state = lock(&inner.state);
                while state.completed < target {
                    state = inner
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Ok(())
            }),
            false,
        )
    }

    pub(crate) fn query(&self) -> bool {
        let state = lock(&self.inner.state);
        state.completed >= state.recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn unrecorded_event_is_complete() {
        assert!(HostEvent::new(DeviceId::gpu(0)).query());
    }

    #[test]
    fn waiting_stream_is_held_until_the_event_completes() {
        let device = DeviceId::gpu(0);
        let producer = HostStream::new(device).unwrap();
        let consumer = HostStream::new(device).unwrap();
        let event = HostEvent::new(device);
        let (release, gate) = mpsc::channel::<()>();

        submit(
            &producer,
            Box::new(move || gate.recv().map_err(|err| err.to_string())),
            false,
        )
        .unwrap();
        event.record(&producer).unwrap();
        event.block(&consumer).unwrap();

        assert!(!event.query());
        assert!(!consumer.is_idle());

        release.send(()).unwrap();
        consumer.synchronize().unwrap();

        assert!(event.query());
    }
}
