use crate::buffer::BufferRef;
use crate::device::DeviceId;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

/// Host memory standing in for device memory.
///
/// Clones share the same bytes.
#[derive(Clone)]
pub struct HostStorage {
    device: DeviceId,
    bytes: Arc<spin::Mutex<Vec<u8>>>,
}

impl HostStorage {
    pub(crate) fn zeros(device: DeviceId, size: usize) -> Self {
        Self::from_bytes(device, vec![0; size])
    }

    pub(crate) fn from_bytes(device: DeviceId, bytes: Vec<u8>) -> Self {
        Self {
            device,
            bytes: Arc::new(spin::Mutex::new(bytes)),
        }
    }

    /// The device owning the memory.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Copy `len` bytes starting at byte `offset`.
    ///
    /// The access isn't ordered with the streams, it's meant to be called from stream work such as
    /// [enqueue](super::HostBackend::enqueue).
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, String> {
        let bytes = self.bytes.lock();
        bytes
            .get(offset..offset + len)
            .map(|slice| slice.to_vec())
            .ok_or_else(|| {
                format!(
                    "Read of [{offset}, {}) out of bounds for {} bytes",
                    offset + len,
                    bytes.len()
                )
            })
    }

    /// Overwrite the bytes starting at byte `offset`. Unordered, like [read](Self::read).
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), String> {
        let mut bytes = self.bytes.lock();
        let size = bytes.len();
        let target = bytes.get_mut(offset..offset + data.len()).ok_or_else(|| {
            format!(
                "Write of [{offset}, {}) out of bounds for {size} bytes",
                offset + data.len()
            )
        })?;
        target.copy_from_slice(data);

        Ok(())
    }
}

impl core::fmt::Debug for HostStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostStorage")
            .field("device", &self.device)
            .field("size", &self.size())
            .finish()
    }
}

/// An owned copy of a [BufferRef] that can move to a stream worker.
#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub storage: HostStorage,
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn new(buffer: &BufferRef<'_, HostStorage>) -> Self {
        Self {
            storage: buffer.storage.clone(),
            offset: buffer.byte_offset(),
            len: buffer.byte_len(),
        }
    }

    pub fn read(&self) -> Result<Vec<u8>, String> {
        self.storage.read(self.offset, self.len)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), String> {
        if data.len() != self.len {
            return Err(format!(
                "Received {} bytes for a region of {} bytes",
                data.len(),
                self.len
            ));
        }
        self.storage.write(self.offset, data)
    }
}
