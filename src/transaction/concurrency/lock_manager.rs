use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{Transaction, TransactionState};

/// Lock modes a request can carry. An upgrade is treated as exclusive for
/// compatibility and converts to `Exclusive` once granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    Upgrading,
}

/// Per-request rendezvous: a blocked acquirer waits here until the request
/// at the head of the queue grants it.
struct Waiter {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Waiter {
    fn new(granted: bool) -> Self {
        Self {
            granted: Mutex::new(granted),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cv.wait(&mut granted);
        }
    }

    fn grant(&self) {
        *self.granted.lock() = true;
        self.cv.notify_one();
    }
}

struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
    waiter: Arc<Waiter>,
}

#[derive(Default)]
struct QueueState {
    requests: Vec<LockRequest>,
    has_upgrading: bool,
}

impl QueueState {
    /// A new request is compatible only with a granted shared tail.
    fn can_grant(&self, mode: LockMode) -> bool {
        match self.requests.last() {
            None => true,
            Some(last) => {
                mode == LockMode::Shared && last.granted && last.mode == LockMode::Shared
            }
        }
    }
}

#[derive(Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
}

/// Tuple-level lock manager implementing two-phase locking.
///
/// Each rid owns a FIFO request list. Grants are first-come-first-served
/// with shared batching: when the head of the queue is released, the next
/// waiter is granted, and if it is shared so are the contiguous shared
/// waiters behind it. There is no deadlock detection; a stuck waiter must
/// be aborted by external policy.
pub struct LockManager {
    strict_2pl: bool,
    table: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn strict_2pl(&self) -> bool {
        self.strict_2pl
    }

    /// Acquire a shared lock, blocking until granted. Returns false and
    /// aborts the transaction if it is not in the growing phase.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        self.lock_template(txn, rid, LockMode::Shared)
    }

    /// Acquire an exclusive lock, blocking until granted.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        self.lock_template(txn, rid, LockMode::Exclusive)
    }

    /// Upgrade a held shared lock to exclusive. Fails if another upgrade is
    /// already queued on this rid or the transaction holds no shared lock.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        self.lock_template(txn, rid, LockMode::Upgrading)
    }

    fn lock_template(&self, txn: &Transaction, rid: Rid, mode: LockMode) -> bool {
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        // Resolve the queue under the table latch, then work on the queue
        // latch alone.
        let queue = {
            let mut table = self.table.lock();
            table.entry(rid).or_default().clone()
        };
        let mut state = queue.state.lock();

        if mode == LockMode::Upgrading {
            if state.has_upgrading {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            let pos = state.requests.iter().position(|r| r.txn_id == txn.id());
            match pos {
                Some(p)
                    if state.requests[p].mode == LockMode::Shared && state.requests[p].granted =>
                {
                    state.requests.remove(p);
                    txn.remove_shared_lock(&rid);
                }
                _ => {
                    txn.set_state(TransactionState::Aborted);
                    return false;
                }
            }
        }

        let can_grant = state.can_grant(mode);

        // A granted upgrade is an exclusive lock from the start; a waiting
        // one converts when the release path grants it.
        let queued_mode = if mode == LockMode::Upgrading && can_grant {
            LockMode::Exclusive
        } else {
            mode
        };

        let waiter = Arc::new(Waiter::new(can_grant));
        state.requests.push(LockRequest {
            txn_id: txn.id(),
            mode: queued_mode,
            granted: can_grant,
            waiter: waiter.clone(),
        });

        if !can_grant {
            if mode == LockMode::Upgrading {
                state.has_upgrading = true;
            }
            drop(state);
            waiter.wait();
        }

        match mode {
            LockMode::Shared => txn.add_shared_lock(rid),
            LockMode::Exclusive | LockMode::Upgrading => txn.add_exclusive_lock(rid),
        }
        true
    }

    /// Release a lock held on `rid` and grant the next compatible waiters.
    ///
    /// Under strict 2PL the transaction must already be committed or
    /// aborted; otherwise the first unlock moves a growing transaction to
    /// the shrinking phase.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        if self.strict_2pl {
            let s = txn.state();
            if s != TransactionState::Committed && s != TransactionState::Aborted {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
        } else if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let mut table = self.table.lock();
        let queue = match table.get(&rid) {
            Some(q) => q.clone(),
            None => return false,
        };
        let mut state = queue.state.lock();

        let pos = match state.requests.iter().position(|r| r.txn_id == txn.id()) {
            Some(p) => p,
            None => return false,
        };
        let removed = state.requests.remove(pos);
        match removed.mode {
            LockMode::Shared => {
                txn.remove_shared_lock(&rid);
            }
            _ => {
                txn.remove_exclusive_lock(&rid);
            }
        }

        if state.requests.is_empty() {
            table.remove(&rid);
            return true;
        }
        drop(table);

        // Grant from the head: the first waiter always, then contiguous
        // shared waiters behind a shared grant.
        let mut granted_waiters = Vec::new();
        let mut i = 0;
        while i < state.requests.len() {
            if state.requests[i].granted {
                break;
            }
            state.requests[i].granted = true;
            granted_waiters.push(state.requests[i].waiter.clone());
            match state.requests[i].mode {
                LockMode::Shared => {
                    i += 1;
                }
                LockMode::Upgrading => {
                    state.requests[i].mode = LockMode::Exclusive;
                    state.has_upgrading = false;
                    break;
                }
                LockMode::Exclusive => break,
            }
        }
        drop(state);

        for waiter in granted_waiters {
            waiter.grant();
        }
        true
    }
}
