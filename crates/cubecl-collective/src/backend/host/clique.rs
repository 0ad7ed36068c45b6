use super::lock;
use crate::backend::BootstrapId;
use crate::device::DeviceId;
use crate::error::{CollectiveError, Result};
use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};

/// The interconnect shared by every simulated process.
///
/// Communicators built from the same [BootstrapId] join the same clique, whatever backend
/// instance created them.
#[derive(Default)]
pub struct HostFabric {
    cliques: spin::Mutex<HashMap<BootstrapId, Arc<Clique>>>,
}

impl HostFabric {
    /// Create a new fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of distinct communication cliques created so far.
    pub fn clique_count(&self) -> usize {
        self.cliques.lock().len()
    }

    pub(crate) fn join(&self, id: &BootstrapId, size: usize, rank: usize) -> Result<Arc<Clique>> {
        if rank >= size {
            return Err(CollectiveError::library(format!(
                "Invalid communicator rank {rank} for a world of {size}"
            )));
        }

        let clique = self
            .cliques
            .lock()
            .entry(*id)
            .or_insert_with(|| Arc::new(Clique::new(size)))
            .clone();

        if clique.size != size {
            return Err(CollectiveError::library(format!(
                "Communicator {id:?} has {} ranks, can't join it with {size} ranks",
                clique.size
            )));
        }

        let mut state = lock(&clique.state);
        if core::mem::replace(&mut state.joined[rank], true) {
            return Err(CollectiveError::library(format!(
                "Rank {rank} already joined communicator {id:?}"
            )));
        }
        core::mem::drop(state);

        Ok(clique)
    }
}

impl core::fmt::Debug for HostFabric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostFabric")
            .field("cliques", &self.clique_count())
            .finish()
    }
}

/// Ranks sharing one bootstrap id.
///
/// Collectives are matched by their issue order on each communicator, point-to-point messages by
/// their order between a pair of ranks.
pub(crate) struct Clique {
    size: usize,
    state: Mutex<CliqueState>,
    cond: Condvar,
}

struct CliqueState {
    joined: Vec<bool>,
    rounds: HashMap<u64, Round>,
    mailboxes: HashMap<(usize, usize), VecDeque<Vec<u8>>>,
}

type Outcome = core::result::Result<Arc<Vec<Vec<u8>>>, String>;

struct Round {
    signature: String,
    contributions: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
    mismatch: Option<String>,
    outcome: Option<Outcome>,
}

impl Clique {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(CliqueState {
                joined: vec![false; size],
                rounds: HashMap::new(),
                mailboxes: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Contribute to the collective number `seq` and block until every rank did, returning all
    /// contributions in rank order.
    ///
    /// Every rank must describe the collective with the same `signature`, otherwise all of them
    /// fail.
    pub fn exchange(&self, seq: u64, rank: usize, signature: String, data: Vec<u8>) -> Outcome {
        let size = self.size;
        let mut state = lock(&self.state);

        let round = state.rounds.entry(seq).or_insert_with(|| Round {
            signature: signature.clone(),
            contributions: vec![None; size],
            arrived: 0,
            departed: 0,
            mismatch: None,
            outcome: None,
        });

        if round.signature != signature {
            round.mismatch.get_or_insert(format!(
                "Collective #{seq} mismatch: `{}` vs `{signature}` issued by rank {rank}",
                round.signature
            ));
        }
        if round.contributions[rank].replace(data).is_some() {
            return Err(format!("Rank {rank} contributed twice to collective #{seq}"));
        }
        round.arrived += 1;

        if round.arrived == size {
            round.outcome = Some(match round.mismatch.take() {
                Some(reason) => Err(reason),
                None => Ok(Arc::new(
                    round
                        .contributions
                        .iter_mut()
                        .map(|c| c.take().unwrap_or_default())
                        .collect(),
                )),
            });
            self.cond.notify_all();
        }

        loop {
            let round = state
                .rounds
                .get_mut(&seq)
                .ok_or_else(|| format!("Collective #{seq} vanished"))?;

            if let Some(outcome) = round.outcome.clone() {
                round.departed += 1;
                if round.departed == size {
                    state.rounds.remove(&seq);
                }
                return outcome;
            }

            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Post a message from `src` to `dst`. Never blocks.
    pub fn post(&self, src: usize, dst: usize, data: Vec<u8>) {
        let mut state = lock(&self.state);
        state.mailboxes.entry((src, dst)).or_default().push_back(data);
        self.cond.notify_all();
    }

    /// Take the oldest message from `src` to `dst`, blocking until one is posted.
    pub fn take(&self, src: usize, dst: usize) -> Vec<u8> {
        let mut state = lock(&self.state);

        loop {
            if let Some(data) = state
                .mailboxes
                .get_mut(&(src, dst))
                .and_then(|queue| queue.pop_front())
            {
                return data;
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// One device's membership in a [clique](Clique).
pub struct HostComm {
    clique: Arc<Clique>,
    rank: usize,
    size: usize,
    device: DeviceId,
    seq: AtomicU64,
}

impl HostComm {
    pub(crate) fn new(clique: Arc<Clique>, rank: usize, device: DeviceId) -> Self {
        Self {
            size: clique.size,
            clique,
            rank,
            device,
            seq: AtomicU64::new(0),
        }
    }

    /// Rank of the communicator.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the clique.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The device the communicator was created on.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn clique(&self) -> Arc<Clique> {
        self.clique.clone()
    }

    /// Reserve the sequence number of the next collective, in issue order.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

impl core::fmt::Debug for HostComm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BOOTSTRAP_ID_BYTES;

    fn id(byte: u8) -> BootstrapId {
        BootstrapId::new([byte; BOOTSTRAP_ID_BYTES])
    }

    #[test]
    fn join_checks_size_and_duplicates() {
        let fabric = HostFabric::new();

        fabric.join(&id(1), 2, 0).unwrap();
        assert!(fabric.join(&id(1), 3, 1).is_err());
        assert!(fabric.join(&id(1), 2, 0).is_err());
        assert!(fabric.join(&id(1), 2, 2).is_err());
        fabric.join(&id(1), 2, 1).unwrap();

        assert_eq!(fabric.clique_count(), 1);
    }

    #[test]
    fn exchange_returns_contributions_in_rank_order() {
        let fabric = HostFabric::new();
        let cliques: Vec<_> = (0..3).map(|r| fabric.join(&id(2), 3, r).unwrap()).collect();

        let results = std::thread::scope(|s| {
            let handles: Vec<_> = cliques
                .iter()
                .enumerate()
                .map(|(rank, clique)| {
                    s.spawn(move || clique.exchange(0, rank, "op".into(), vec![rank as u8]))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect::<Vec<_>>()
        });

        for result in results {
            assert_eq!(*result, vec![vec![0u8], vec![1], vec![2]]);
        }
    }

    #[test]
    fn mismatched_signatures_fail_everyone() {
        let fabric = HostFabric::new();
        let a = fabric.join(&id(3), 2, 0).unwrap();
        let b = fabric.join(&id(3), 2, 1).unwrap();

        let (ra, rb) = std::thread::scope(|s| {
            let ha = s.spawn(|| a.exchange(0, 0, "all_reduce".into(), vec![]));
            let hb = s.spawn(|| b.exchange(0, 1, "broadcast".into(), vec![]));
            (ha.join().unwrap(), hb.join().unwrap())
        });

        assert!(ra.is_err());
        assert!(rb.is_err());
    }

    #[test]
    fn mailbox_is_fifo_per_pair() {
        let fabric = HostFabric::new();
        let clique = fabric.join(&id(4), 2, 0).unwrap();

        clique.post(0, 1, vec![1]);
        clique.post(1, 0, vec![9]);
        clique.post(0, 1, vec![2]);

        assert_eq!(clique.take(0, 1), [1]);
        assert_eq!(clique.take(0, 1), [2]);
        assert_eq!(clique.take(1, 0), [9]);
    }
}
