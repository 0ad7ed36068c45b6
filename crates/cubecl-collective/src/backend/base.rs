use crate::buffer::{BufferRef, ElemType};
use crate::device::DeviceId;
use crate::error::{CollectiveError, Result};
use core::fmt::Debug;

/// Number of bytes of a [BootstrapId].
pub const BOOTSTRAP_ID_BYTES: usize = 128;

/// Opaque token shared by every participant before building communicators.
///
/// Rank 0 generates it and every other rank receives the identical bytes through the rendezvous
/// store.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BootstrapId {
    bytes: [u8; BOOTSTRAP_ID_BYTES],
}

impl BootstrapId {
    /// Wrap raw bytes produced by the communication library.
    pub const fn new(bytes: [u8; BOOTSTRAP_ID_BYTES]) -> Self {
        Self { bytes }
    }

    /// Rebuild an id from bytes received through the store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; BOOTSTRAP_ID_BYTES] = bytes.try_into().map_err(|_| {
            CollectiveError::library(alloc::format!(
                "Invalid bootstrap id: expected {BOOTSTRAP_ID_BYTES} bytes, got {}",
                bytes.len()
            ))
        })?;

        Ok(Self { bytes })
    }

    /// The raw bytes to publish.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Debug for BootstrapId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // The full id is long and mostly noise, the prefix is enough to tell two apart.
        f.write_str("BootstrapId(")?;
        for byte in &self.bytes[..8] {
            write!(f, "{byte:02x}")?;
        }
        f.write_str("..)")
    }
}

/// Element type tag understood by the communication library.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CommDataType {
    I8,
    U8,
    I32,
    U32,
    I64,
    U64,
    F16,
    BF16,
    F32,
    F64,
}

impl CommDataType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            CommDataType::I8 | CommDataType::U8 => 1,
            CommDataType::F16 | CommDataType::BF16 => 2,
            CommDataType::I32 | CommDataType::U32 | CommDataType::F32 => 4,
            CommDataType::I64 | CommDataType::U64 | CommDataType::F64 => 8,
        }
    }
}

/// Element-wise associative reduction.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum of all participants.
    #[default]
    Sum,
    /// Product of all participants.
    Prod,
    /// Maximum of all participants.
    Max,
    /// Minimum of all participants.
    Min,
    /// Sum divided by the number of participants.
    Avg,
}

/// Device context, stream and event capability.
///
/// Every stream and event call is issued against the device selected with
/// [set_device](StreamBackend::set_device); implementations reject or misbehave on work issued
/// for another device, so callers go through a [DeviceGuard](crate::device::DeviceGuard).
pub trait StreamBackend: Send + Sync + 'static {
    /// Handle to device memory.
    type Storage: Clone + Send + Sync + Debug;
    /// An ordered queue of device work.
    type Stream: Clone + Send + Sync + Debug;
    /// A marker recorded on a stream.
    type Event: Send + Sync + Debug;

    /// Number of devices driven by this backend.
    fn device_count(&self) -> usize;
    /// The device selected for the calling thread.
    fn current_device(&self) -> Result<DeviceId>;
    /// Select the device for the calling thread.
    fn set_device(&self, device: DeviceId) -> Result<()>;
    /// The default compute stream of a device.
    fn default_stream(&self, device: DeviceId) -> Result<Self::Stream>;
    /// Open a new private stream on the current device.
    fn create_stream(&self) -> Result<Self::Stream>;
    /// Create a new event on the current device.
    fn create_event(&self) -> Result<Self::Event>;
    /// Record the event at the current end of the stream.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> Result<()>;
    /// Make all future work on the stream wait for the last recording of the event.
    fn wait_event(&self, stream: &Self::Stream, event: &Self::Event) -> Result<()>;
    /// Whether all work captured by the last recording of the event is done. Never blocks.
    fn query_event(&self, event: &Self::Event) -> Result<bool>;
    /// The first asynchronous failure of work executed on the stream, if any. Never blocks.
    fn stream_error(&self, stream: &Self::Stream) -> Result<()>;
    /// Block the host until every stream of the current device is idle.
    fn synchronize_device(&self) -> Result<()>;
    /// Tell the allocator the storage is used by the stream, so it isn't reused before the stream
    /// reaches this point.
    fn record_stream(&self, storage: &Self::Storage, stream: &Self::Stream) -> Result<()>;
    /// Allocate zeroed storage on the current device.
    fn alloc_zeros(&self, dtype: ElemType, numel: usize) -> Result<Self::Storage>;
}

/// Communication library capability.
///
/// All primitives are asynchronous: they enqueue work on the given stream and return. Calls
/// issued between [group_start](CommBackend::group_start) and [group_end](CommBackend::group_end)
/// are launched together when the outermost bracket closes.
pub trait CommBackend: StreamBackend {
    /// One device's membership in a communication topology.
    type Comm: Send + Sync + Debug;

    /// Name used to namespace the rendezvous keys.
    const GROUP_NAME: &'static str;

    /// Generate a fresh bootstrap id.
    fn unique_id(&self) -> Result<BootstrapId>;
    /// Open a group bracket.
    fn group_start(&self) -> Result<()>;
    /// Close a group bracket.
    fn group_end(&self) -> Result<()>;
    /// Create the communicator of the current device.
    fn create_communicator(
        &self,
        world_size: usize,
        rank: usize,
        id: &BootstrapId,
    ) -> Result<Self::Comm>;

    /// Copy `input` of the `root` rank into `output` of every rank.
    fn broadcast(
        &self,
        input: BufferRef<'_, Self::Storage>,
        output: BufferRef<'_, Self::Storage>,
        root: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Reduce `input` of every rank into `output` of every rank.
    fn all_reduce(
        &self,
        input: BufferRef<'_, Self::Storage>,
        output: BufferRef<'_, Self::Storage>,
        op: ReduceOp,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Reduce `input` of every rank into `output` of the `root` rank.
    fn reduce(
        &self,
        input: BufferRef<'_, Self::Storage>,
        output: BufferRef<'_, Self::Storage>,
        op: ReduceOp,
        root: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Concatenate `input` of every rank, in rank order, into `output` of every rank.
    fn all_gather(
        &self,
        input: BufferRef<'_, Self::Storage>,
        output: BufferRef<'_, Self::Storage>,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Send `input` to `peer`.
    fn send(
        &self,
        input: BufferRef<'_, Self::Storage>,
        peer: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Receive into `output` from `peer`.
    fn recv(
        &self,
        output: BufferRef<'_, Self::Storage>,
        peer: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;
}

/// Run `func` inside a library group bracket.
///
/// The bracket is always closed, even when `func` fails; the first error wins.
pub fn grouped<B, R, F>(backend: &B, func: F) -> Result<R>
where
    B: CommBackend + ?Sized,
    F: FnOnce() -> Result<R>,
{
    backend.group_start()?;
    let result = func();
    let end = backend.group_end();

    match (result, end) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
    }
}
