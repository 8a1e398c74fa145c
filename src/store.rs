use crate::cache::HashLog;
use crate::config::VALUE_MAX;
use crate::protocol::{Op, Opcode, Response, RespKind};

/// The owner-local store: the same hash+log shape as the cache index,
/// holding the slice of the keyspace this worker owns.
///
/// The façade is single-threaded per worker over its own shard. When a
/// single store is shared across workers, mutations still serialize per
/// entry through the optimistic version lock, so either deployment is
/// sound.
pub struct KvStore {
    log: HashLog,
}

impl KvStore {
    /// Creates a store shard with the given bucket count and log slots.
    pub fn new(buckets: usize, log_slots: usize) -> KvStore {
        KvStore {
            log: HashLog::new(buckets, log_slots),
        }
    }

    /// Applies a batch of ops in array order, filling `resp` slot for
    /// slot. GET responses carry the value copied out at lookup time.
    pub fn batch_op(&self, ops: &[Op], resp: &mut [Response]) {
        debug_assert!(resp.len() >= ops.len());
        let mut value = [0u8; VALUE_MAX];
        for (i, op) in ops.iter().enumerate() {
            match op.opcode {
                Opcode::Get => {
                    resp[i] = match self.log.get(&op.key, &mut value) {
                        Some(len) => Response::get_success(&value[..len as usize]),
                        None => Response::of_kind(RespKind::GetMiss),
                    };
                }
                Opcode::Put | Opcode::Update | Opcode::Broadcast => {
                    self.log.put(&op.key, op.value());
                    resp[i] = Response::of_kind(RespKind::PutSuccess);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyFingerprint;

    #[test]
    fn batch_applies_in_array_order() {
        let kv = KvStore::new(64, 256);
        let key = KeyFingerprint::from_parts(1, 2);
        let ops = [
            Op::put(key, b"first").unwrap(),
            Op::put(key, b"second").unwrap(),
            Op::get(key),
        ];
        let mut resp = [Response::empty(); 3];
        kv.batch_op(&ops, &mut resp);

        assert_eq!(resp[0].kind, RespKind::PutSuccess);
        assert_eq!(resp[1].kind, RespKind::PutSuccess);
        assert_eq!(resp[2].kind, RespKind::GetSuccess);
        // The later PUT in the same batch wins.
        assert_eq!(resp[2].value(), b"second");
    }

    #[test]
    fn get_missing_key_reports_miss() {
        let kv = KvStore::new(64, 256);
        let ops = [Op::get(KeyFingerprint::from_parts(8, 8))];
        let mut resp = [Response::empty(); 1];
        kv.batch_op(&ops, &mut resp);
        assert_eq!(resp[0].kind, RespKind::GetMiss);
    }
}
