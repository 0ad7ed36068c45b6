use crate::backend::CommDataType;
use crate::device::DeviceId;
use crate::error::{CollectiveError, Result, ensure};
use alloc::vec;
use alloc::vec::Vec;

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ElemType {
    /// Boolean stored on one byte.
    Bool,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// IEEE half precision float.
    F16,
    /// Brain float.
    BF16,
    /// IEEE single precision float.
    F32,
    /// IEEE double precision float.
    F64,
}

impl ElemType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            ElemType::Bool | ElemType::I8 | ElemType::U8 => 1,
            ElemType::I16 | ElemType::F16 | ElemType::BF16 => 2,
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 | ElemType::F64 => 8,
        }
    }
}

impl TryFrom<ElemType> for CommDataType {
    type Error = CollectiveError;

    fn try_from(value: ElemType) -> Result<Self> {
        Ok(match value {
            ElemType::I8 => CommDataType::I8,
            ElemType::U8 => CommDataType::U8,
            ElemType::I32 => CommDataType::I32,
            ElemType::U32 => CommDataType::U32,
            ElemType::I64 => CommDataType::I64,
            ElemType::U64 => CommDataType::U64,
            ElemType::F16 => CommDataType::F16,
            ElemType::BF16 => CommDataType::BF16,
            ElemType::F32 => CommDataType::F32,
            ElemType::F64 => CommDataType::F64,
            ElemType::Bool | ElemType::I16 => {
                return Err(CollectiveError::unimplemented(alloc::format!(
                    "The element type {value:?} isn't supported by the communication library"
                )));
            }
        })
    }
}

/// Opaque descriptor of a device buffer: a storage handle with its placement, element type and
/// logical shape.
///
/// Cloning a buffer only clones the storage handle, never the data.
#[derive(Debug, Clone)]
pub struct Buffer<S> {
    storage: S,
    device: DeviceId,
    dtype: ElemType,
    shape: Vec<usize>,
    /// Offset of the first element inside the storage, in elements.
    offset: usize,
}

impl<S> Buffer<S> {
    /// Create a buffer covering the storage from its first element.
    pub fn new(storage: S, device: DeviceId, dtype: ElemType, shape: Vec<usize>) -> Self {
        Self {
            storage,
            device,
            dtype,
            shape,
            offset: 0,
        }
    }

    /// The storage handle backing this buffer.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The device holding the storage.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The element type.
    pub fn dtype(&self) -> ElemType {
        self.dtype
    }

    /// The logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The offset of the first element inside the storage, in elements.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// The number of bytes covered by this buffer.
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }
}

impl<S: Clone> Buffer<S> {
    /// A one dimensional view over the same storage.
    pub fn flatten(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            device: self.device,
            dtype: self.dtype,
            shape: vec![self.numel()],
            offset: self.offset,
        }
    }

    /// A view of the rows `[start, end)` of the first dimension, sharing the same storage.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self> {
        ensure!(!self.shape.is_empty(), "Can't slice a scalar buffer");
        ensure!(
            start <= end && end <= self.shape[0],
            "The slice [{start}, {end}) is out of bounds for a first dimension of {}",
            self.shape[0]
        );

        let row: usize = self.shape[1..].iter().product();
        let mut shape = self.shape.clone();
        shape[0] = end - start;

        Ok(Self {
            storage: self.storage.clone(),
            device: self.device,
            dtype: self.dtype,
            shape,
            offset: self.offset + start * row,
        })
    }
}

/// A contiguous range of elements handed to the communication library.
#[derive(new, Debug)]
pub struct BufferRef<'a, S> {
    /// The storage holding the elements.
    pub storage: &'a S,
    /// Offset of the first element, in elements.
    pub offset: usize,
    /// Number of elements.
    pub count: usize,
    /// Element type tag.
    pub dtype: CommDataType,
}

impl<S> Clone for BufferRef<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for BufferRef<'_, S> {}

impl<'a, S> BufferRef<'a, S> {
    /// Reference the whole buffer.
    pub fn whole(buffer: &'a Buffer<S>) -> Result<Self> {
        Ok(Self {
            storage: &buffer.storage,
            offset: buffer.offset,
            count: buffer.numel(),
            dtype: buffer.dtype.try_into()?,
        })
    }

    /// Reference `count` elements of the buffer starting at element `offset`.
    pub fn range(buffer: &'a Buffer<S>, offset: usize, count: usize) -> Result<Self> {
        ensure!(
            offset + count <= buffer.numel(),
            "The range [{offset}, {}) is out of bounds for a buffer of {} elements",
            offset + count,
            buffer.numel()
        );

        Ok(Self {
            storage: &buffer.storage,
            offset: buffer.offset + offset,
            count,
            dtype: buffer.dtype.try_into()?,
        })
    }

    /// The byte offset of the first element.
    pub fn byte_offset(&self) -> usize {
        self.offset * self.dtype.size()
    }

    /// The number of bytes covered.
    pub fn byte_len(&self) -> usize {
        self.count * self.dtype.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_then_slice_shares_storage() {
        let buffer = Buffer::new(7u8, DeviceId::gpu(0), ElemType::F32, vec![10, 10]);
        let view = buffer.flatten().slice(25, 40).unwrap();

        assert_eq!(view.shape(), &[15]);
        assert_eq!(view.offset(), 25);
        assert_eq!(*view.storage(), 7);
    }

    #[test]
    fn slice_uses_row_size() {
        let buffer = Buffer::new((), DeviceId::gpu(0), ElemType::F32, vec![4, 3]);
        let view = buffer.slice(1, 3).unwrap();

        assert_eq!(view.shape(), &[2, 3]);
        assert_eq!(view.offset(), 3);
        assert_eq!(view.numel(), 6);
    }

    #[test]
    fn out_of_bound_slice_is_rejected() {
        let buffer = Buffer::new((), DeviceId::gpu(0), ElemType::F32, vec![100]);

        assert!(buffer.slice(90, 101).unwrap_err().is_precondition());
    }

    #[test]
    fn unsupported_elem_type() {
        let buffer = Buffer::new((), DeviceId::gpu(0), ElemType::Bool, vec![4]);

        assert!(matches!(
            BufferRef::whole(&buffer),
            Err(CollectiveError::Unimplemented { .. })
        ));
    }

    #[test]
    fn range_offsets_are_relative_to_the_view() {
        let buffer = Buffer::new((), DeviceId::gpu(0), ElemType::F64, vec![8]);
        let view = buffer.slice(2, 8).unwrap();
        let range = BufferRef::range(&view, 1, 2).unwrap();

        assert_eq!(range.offset, 3);
        assert_eq!(range.byte_offset(), 24);
        assert_eq!(range.byte_len(), 16);
    }
}
