use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::trace;

use crate::storage::wal::{Lsn, RecLsnSource, Xid};

/// What the log needs to know about a running transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    /// No entry of this transaction precedes this LSN.
    pub rec_lsn: Option<Lsn>,
    /// The transaction's newest entry, used as `prev_lsn` of the next one.
    pub last_lsn: Option<Lsn>,
}

/// Transactions that may still need their log entries for undo.
#[derive(Default)]
pub struct ActiveTransactions {
    next_xid: AtomicU64,
    table: DashMap<Xid, TransactionState>,
}

impl ActiveTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction with a fresh xid.
    pub fn begin(&self) -> Xid {
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        self.table.insert(xid, TransactionState::default());
        trace!("Began xid {}", xid);
        xid
    }

    /// Bound the transaction's recLSN by `lsn` before it writes its first
    /// entry. Later calls have no effect.
    pub fn reserve_rec_lsn(&self, xid: Xid, lsn: Lsn) {
        let mut state = self.table.entry(xid).or_default();
        if state.rec_lsn.is_none() {
            state.rec_lsn = Some(lsn);
        }
    }

    /// Note that `xid` wrote the entry at `lsn`.
    pub fn record(&self, xid: Xid, lsn: Lsn) {
        let mut state = self.table.entry(xid).or_default();
        state.rec_lsn.get_or_insert(lsn);
        state.last_lsn = Some(lsn);
    }

    pub fn last_lsn(&self, xid: Xid) -> Option<Lsn> {
        self.table.get(&xid).and_then(|state| state.last_lsn)
    }

    pub fn state(&self, xid: Xid) -> Option<TransactionState> {
        self.table.get(&xid).map(|state| *state)
    }

    pub fn is_active(&self, xid: Xid) -> bool {
        self.table.contains_key(&xid)
    }

    /// Forget a committed or fully aborted transaction.
    pub fn finish(&self, xid: Xid) -> Option<TransactionState> {
        self.table.remove(&xid).map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Oldest recLSN of any active transaction.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.table.iter().filter_map(|entry| entry.rec_lsn).min()
    }
}

impl RecLsnSource for ActiveTransactions {
    fn min_rec_lsn(&self) -> Option<Lsn> {
        ActiveTransactions::min_rec_lsn(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_record_finish() {
        let txns = ActiveTransactions::new();
        let a = txns.begin();
        let b = txns.begin();
        assert_ne!(a, b);
        assert_eq!(txns.len(), 2);
        assert_eq!(txns.min_rec_lsn(), None);

        txns.record(a, Lsn(40));
        txns.record(a, Lsn(90));
        txns.record(b, Lsn(60));
        assert_eq!(txns.last_lsn(a), Some(Lsn(90)));
        assert_eq!(
            txns.state(a),
            Some(TransactionState {
                rec_lsn: Some(Lsn(40)),
                last_lsn: Some(Lsn(90)),
            })
        );
        assert_eq!(txns.min_rec_lsn(), Some(Lsn(40)));

        txns.finish(a);
        assert!(!txns.is_active(a));
        assert_eq!(txns.min_rec_lsn(), Some(Lsn(60)));
    }

    #[test]
    fn test_reserved_bound_is_kept() {
        let txns = ActiveTransactions::new();
        let xid = txns.begin();
        txns.reserve_rec_lsn(xid, Lsn(10));
        txns.record(xid, Lsn(25));
        txns.reserve_rec_lsn(xid, Lsn(30));
        assert_eq!(txns.state(xid).and_then(|s| s.rec_lsn), Some(Lsn(10)));
        assert_eq!(txns.last_lsn(xid), Some(Lsn(25)));
    }
}
