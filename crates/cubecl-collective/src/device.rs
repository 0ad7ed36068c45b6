use crate::backend::StreamBackend;
use crate::error::{Result, ensure};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

/// The family of a device.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub enum DeviceKind {
    /// A GPU-class device that the communication library can address.
    Gpu,
    /// Host memory.
    Host,
}

/// Identifies one device of the local process.
#[derive(new, Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct DeviceId {
    /// The family of the device.
    pub kind: DeviceKind,
    /// The device ordinal inside its family.
    pub index: u32,
}

impl DeviceId {
    /// A GPU-class device with the given ordinal.
    pub const fn gpu(index: u32) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            index,
        }
    }

    /// Host memory.
    pub const fn host() -> Self {
        Self {
            kind: DeviceKind::Host,
            index: 0,
        }
    }

    /// Whether collective operations can be issued on this device.
    pub fn is_gpu(&self) -> bool {
        self.kind == DeviceKind::Gpu
    }
}

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind {
            DeviceKind::Gpu => write!(f, "Gpu({})", self.index),
            DeviceKind::Host => write!(f, "Host"),
        }
    }
}

/// Canonical, order-sensitive fingerprint of the devices taking part in one operation.
///
/// Two calls with the same ordered device list always produce the same key.
#[derive(Debug, Hash, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct DeviceSetKey {
    value: String,
}

impl DeviceSetKey {
    /// Compute the key of the given ordered device list.
    pub fn new(devices: &[DeviceId]) -> Result<Self> {
        ensure!(
            !devices.is_empty(),
            "Can't create or get a communicator since the devices aren't known"
        );

        let mut value = String::new();
        for (i, device) in devices.iter().enumerate() {
            if i > 0 {
                value.push(',');
            }
            // Writing into a String can't fail.
            let _ = write!(value, "{}", device.index);
        }

        Ok(Self { value })
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl core::fmt::Display for DeviceSetKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.value)
    }
}

/// Selects a device context and restores the previous one when dropped.
///
/// Every call touching a device must go through a guard: device runtimes are sensitive to the
/// current context and silently issue work on the wrong device otherwise.
pub struct DeviceGuard<'a, B: StreamBackend> {
    backend: &'a B,
    previous: Option<DeviceId>,
}

impl<'a, B: StreamBackend> DeviceGuard<'a, B> {
    /// Create a guard that doesn't change the current device until [set](Self::set) is called.
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            previous: None,
        }
    }

    /// Create a guard and select the given device right away.
    pub fn on(backend: &'a B, device: DeviceId) -> Result<Self> {
        let mut guard = Self::new(backend);
        guard.set(device)?;
        Ok(guard)
    }

    /// Select the given device for the current thread.
    pub fn set(&mut self, device: DeviceId) -> Result<()> {
        if self.previous.is_none() {
            self.previous = Some(self.backend.current_device()?);
        }
        self.backend.set_device(device)
    }
}

impl<B: StreamBackend> Drop for DeviceGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(err) = self.backend.set_device(previous) {
                log::warn!("Failed to restore device {previous}: {err}");
            }
        }
    }
}

/// Collect the devices of the given buffers, in order.
pub(crate) fn devices_of<'a, S: 'a>(
    buffers: impl IntoIterator<Item = &'a crate::buffer::Buffer<S>>,
) -> Vec<DeviceId> {
    buffers.into_iter().map(|buffer| buffer.device()).collect()
}
