use crate::backend::{BootstrapId, CommBackend};
use crate::error::Result;
use crate::store::Store;
use alloc::format;
use alloc::string::String;

/// The store key under which the bootstrap id of a device set is published.
pub fn bootstrap_key(group_name: &str, group_id: usize, index: usize) -> String {
    format!("{group_name}/bootstrap_ids/{group_id}/{index}")
}

/// Agree on the bootstrap id of the device set number `index` of a group.
///
/// Rank 0 generates the id and publishes it, every other rank blocks on the store until it is
/// available. The wait is only bounded by the store itself.
pub fn exchange_bootstrap_id<B: CommBackend>(
    backend: &B,
    store: &dyn Store,
    group_id: usize,
    index: usize,
    rank: usize,
) -> Result<BootstrapId> {
    let key = bootstrap_key(B::GROUP_NAME, group_id, index);

    let id = match rank {
        0 => {
            let id = backend.unique_id()?;
            store.set(&key, id.as_bytes())?;
            id
        }
        _ => BootstrapId::from_bytes(&store.get(&key)?)?,
    };
    log::debug!("Rank {rank} agreed on {id:?} under `{key}`");

    Ok(id)
}
