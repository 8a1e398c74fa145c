//! The replicated read cache: every node holds a symmetric replica of
//! the hot keyspace, readers are lock-free, and writers publish through
//! per-entry versions.

mod log;

pub use self::log::HashLog;

use crate::config::VALUE_MAX;
use crate::protocol::{Op, Opcode, Response};

/// The replicated cache index shared by all workers on a node.
pub struct CacheIndex {
    log: HashLog,
}

impl CacheIndex {
    /// Creates a cache index with the given bucket count and log slots.
    pub fn new(buckets: usize, log_slots: usize) -> CacheIndex {
        CacheIndex {
            log: HashLog::new(buckets, log_slots),
        }
    }

    /// Looks up a batch of ops. Hits fill `resp` in place; the returned
    /// list holds the indices of misses in the original batch, in batch
    /// order, so owner responses can be merged back later.
    ///
    /// A PUT that hits is still reported as a miss: writes are routed
    /// through the key's owner, never applied from the lookup path.
    pub fn lookup_batch(&self, ops: &[Op], resp: &mut [Response]) -> Vec<usize> {
        debug_assert!(resp.len() >= ops.len());
        let mut misses = Vec::with_capacity(ops.len());
        let mut value = [0u8; VALUE_MAX];
        for (i, op) in ops.iter().enumerate() {
            if op.opcode == Opcode::Get {
                if let Some(len) = self.log.get(&op.key, &mut value) {
                    resp[i] = Response::get_success(&value[..len as usize]);
                    continue;
                }
            }
            misses.push(i);
        }
        misses
    }

    /// Applies a batch of foreign UPDATEs (or locally completed writes)
    /// to the replica. Each application advances the entry's version,
    /// including when the value bits are unchanged.
    pub fn apply_updates(&self, updates: &[Op]) {
        for op in updates {
            debug_assert!(matches!(op.opcode, Opcode::Update | Opcode::Put | Opcode::Broadcast));
            self.log.put(&op.key, op.value());
        }
    }

    /// Installs a single entry. Used at bootstrap to seed hot keys and
    /// by the worker to make its own writes locally visible.
    pub fn insert(&self, op: &Op) {
        self.log.put(&op.key, op.value());
    }

    #[cfg(test)]
    pub(crate) fn force_wrap(&self, records: u64) {
        self.log.force_wrap(records);
    }
}
