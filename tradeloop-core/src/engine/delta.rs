use crate::algo::canonical::digest_hex;
use crate::types::{MutationRecord, WalletId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};

const FINGERPRINT_DOMAIN: &[u8] = b"TRADELOOP_ROOTSET_V1";

/// Union of the affected root sets of a batch of mutations
pub fn affected_roots(records: &[MutationRecord]) -> BTreeSet<WalletId> {
    let mut roots = BTreeSet::new();
    for record in records {
        roots.extend(record.affected_wallets());
    }
    roots
}

/// Stable fingerprint of a root set. Rapid bursts of events touching the
/// same wallets collapse to the same fingerprint and are debounced.
pub fn fingerprint(roots: &BTreeSet<WalletId>) -> String {
    digest_hex(FINGERPRINT_DOMAIN, roots.iter().map(|w| w.as_bytes()))
}

/// A rediscovery that could not start immediately
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingDiscovery {
    pub fingerprint: String,
    pub roots: BTreeSet<WalletId>,
}

/// Outcome of offering work to the coalescing queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// An identical fingerprint was already pending
    Coalesced,
    Full,
}

/// Bounded FIFO between the delta engine and the enumerator. Repeated root
/// sets with the same fingerprint collapse into a single pending task.
pub struct CoalescingQueue {
    inner: Mutex<VecDeque<PendingDiscovery>>,
    capacity: usize,
}

impl CoalescingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, task: PendingDiscovery) -> PushOutcome {
        let mut queue = self.inner.lock();
        if queue.iter().any(|t| t.fingerprint == task.fingerprint) {
            return PushOutcome::Coalesced;
        }
        if queue.len() >= self.capacity {
            return PushOutcome::Full;
        }
        queue.push_back(task);
        PushOutcome::Enqueued
    }

    pub fn pop(&self) -> Option<PendingDiscovery> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(roots: &[&str]) -> PendingDiscovery {
        let roots: BTreeSet<WalletId> = roots.iter().map(|r| r.to_string()).collect();
        PendingDiscovery {
            fingerprint: fingerprint(&roots),
            roots,
        }
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let mut a = BTreeSet::new();
        a.insert("w1".to_string());
        a.insert("w2".to_string());
        let mut b = BTreeSet::new();
        b.insert("w2".to_string());
        b.insert("w1".to_string());
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_distinct_roots_distinct_fingerprints() {
        let a = BTreeSet::from(["w1".to_string()]);
        let b = BTreeSet::from(["w2".to_string()]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_queue_coalesces_same_fingerprint() {
        let queue = CoalescingQueue::new(10);
        assert_eq!(queue.push(task(&["a"])), PushOutcome::Enqueued);
        assert_eq!(queue.push(task(&["a"])), PushOutcome::Coalesced);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_is_bounded() {
        let queue = CoalescingQueue::new(2);
        assert_eq!(queue.push(task(&["a"])), PushOutcome::Enqueued);
        assert_eq!(queue.push(task(&["b"])), PushOutcome::Enqueued);
        assert_eq!(queue.push(task(&["c"])), PushOutcome::Full);
    }

    #[test]
    fn test_roots_for_transfer_batch() {
        let records = vec![MutationRecord::Transferred {
            nft: "n1".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
            wanters: vec!["c".to_string()],
        }];
        let roots = affected_roots(&records);
        assert_eq!(roots.len(), 3);
    }
}
