use crate::backend::ReduceOp;

/// Options of a [broadcast](super::ProcessGroup::broadcast).
#[derive(new, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// The rank holding the data.
    pub source_rank: usize,
    /// The index of the local buffer holding the data on the source rank.
    pub source_root: usize,
}

/// Options of an [all-reduce](super::ProcessGroup::all_reduce).
#[derive(new, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllReduceOptions {
    /// The reduction applied element-wise.
    pub reduce_op: ReduceOp,
}

/// Options of a [reduce](super::ProcessGroup::reduce).
#[derive(new, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    /// The reduction applied element-wise.
    pub reduce_op: ReduceOp,
    /// The rank receiving the result.
    pub root_rank: usize,
}

/// Options of a [scatter](super::ProcessGroup::scatter).
#[derive(new, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScatterOptions {
    /// The rank holding the data to scatter.
    pub root_rank: usize,
}
