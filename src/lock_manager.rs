//! Multigranularity lock manager: table-level IS/IX/S/SIX/X and record-level
//! S/X under strict two-phase locking, with wait-die deadlock avoidance.
//!
//! One mutex guards the lock table; each queue carries its own condition
//! variable so waiters only wake when their resource changes hands.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::errors::{AbortReason, DbError, Result};
use crate::transaction::{Transaction, TxnId, TxnState};
use crate::{FileId, Rid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// A lockable resource: a whole table (keyed by its record file) or a single
/// record within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table { file: FileId },
    Record { file: FileId, rid: Rid },
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct LockQueue {
    requests: VecDeque<LockRequest>,
    cvar: Arc<Condvar>,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            cvar: Arc::new(Condvar::new()),
        }
    }
}

/// Row = held, column = requested. X conflicts with everything; IS conflicts
/// only with X.
fn compatible(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match (held, requested) {
        (Exclusive, _) | (_, Exclusive) => false,
        (IntentionShared, _) | (_, IntentionShared) => true,
        (IntentionExclusive, IntentionExclusive) => true,
        (IntentionExclusive, _) | (_, IntentionExclusive) => false,
        (Shared, Shared) => true,
        (Shared, _) | (_, Shared) => false,
        (SharedIntentionExclusive, SharedIntentionExclusive) => false,
    }
}

/// Whether an already granted `held` mode makes `requested` redundant.
fn subsumes(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match held {
        Exclusive => true,
        SharedIntentionExclusive => requested != Exclusive,
        Shared => matches!(requested, Shared | IntentionShared),
        IntentionExclusive => matches!(requested, IntentionExclusive | IntentionShared),
        IntentionShared => requested == IntentionShared,
    }
}

/// The lock manager. All public operations follow strict 2PL: acquiring any
/// lock after the transaction's first unlock aborts it.
#[derive(Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockQueue>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared_on_record(&self, txn: &Transaction, rid: Rid, file: FileId) -> Result<()> {
        // A record S lock requires a table IS (or stronger) first.
        self.lock(txn, LockDataId::Table { file }, LockMode::IntentionShared)?;
        self.lock(txn, LockDataId::Record { file, rid }, LockMode::Shared)
    }

    pub fn lock_exclusive_on_record(
        &self,
        txn: &Transaction,
        rid: Rid,
        file: FileId,
    ) -> Result<()> {
        // A record X lock requires a table IX (or stronger) first.
        self.lock(txn, LockDataId::Table { file }, LockMode::IntentionExclusive)?;
        self.lock(txn, LockDataId::Record { file, rid }, LockMode::Exclusive)
    }

    pub fn lock_shared_on_table(&self, txn: &Transaction, file: FileId) -> Result<()> {
        self.lock(txn, LockDataId::Table { file }, LockMode::Shared)
    }

    pub fn lock_exclusive_on_table(&self, txn: &Transaction, file: FileId) -> Result<()> {
        self.lock(txn, LockDataId::Table { file }, LockMode::Exclusive)
    }

    pub fn lock_is_on_table(&self, txn: &Transaction, file: FileId) -> Result<()> {
        self.lock(txn, LockDataId::Table { file }, LockMode::IntentionShared)
    }

    pub fn lock_ix_on_table(&self, txn: &Transaction, file: FileId) -> Result<()> {
        self.lock(txn, LockDataId::Table { file }, LockMode::IntentionExclusive)
    }

    fn lock(&self, txn: &Transaction, id: LockDataId, mode: LockMode) -> Result<()> {
        if txn.state() == TxnState::Shrinking {
            return Err(DbError::TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            });
        }
        let my_id = txn.id();

        let mut table = self.lock_table.lock().unwrap();
        let queue = table.entry(id).or_insert_with(LockQueue::new);

        // Already holding something at least as strong: nothing to do.
        if queue
            .requests
            .iter()
            .any(|r| r.txn_id == my_id && r.granted && subsumes(r.mode, mode))
        {
            txn.lock_set().insert(id);
            return Ok(());
        }

        // S -> X upgrade in place when we are the sole granted holder.
        if mode == LockMode::Exclusive {
            let holds_shared = queue
                .requests
                .iter()
                .any(|r| r.txn_id == my_id && r.granted && r.mode == LockMode::Shared);
            if holds_shared {
                let others_hold = queue
                    .requests
                    .iter()
                    .any(|r| r.granted && r.txn_id != my_id);
                if !others_hold {
                    for r in queue.requests.iter_mut() {
                        if r.txn_id == my_id && r.granted && r.mode == LockMode::Shared {
                            r.mode = LockMode::Exclusive;
                        }
                    }
                    txn.lock_set().insert(id);
                    return Ok(());
                }
                // Other holders present: fall through and let wait-die decide.
            }
        }

        queue.requests.push_back(LockRequest {
            txn_id: my_id,
            mode,
            granted: false,
        });

        loop {
            let queue = table.get_mut(&id).expect("queue holds our request");

            let my_pos = queue
                .requests
                .iter()
                .position(|r| r.txn_id == my_id && !r.granted && r.mode == mode)
                .expect("our request is queued");

            // FIFO: grantable only when everything ahead of us is granted and
            // no other transaction holds an incompatible mode.
            let blocked_by_queue = queue.requests.iter().take(my_pos).any(|r| !r.granted);
            let conflict = queue
                .requests
                .iter()
                .any(|r| r.granted && r.txn_id != my_id && !compatible(r.mode, mode));

            if !blocked_by_queue && !conflict {
                queue.requests[my_pos].granted = true;
                txn.lock_set().insert(id);
                return Ok(());
            }

            // Wait-die: die if any conflicting holder is older than us.
            let must_die = queue.requests.iter().any(|r| {
                r.granted && r.txn_id != my_id && !compatible(r.mode, mode) && my_id > r.txn_id
            });
            if must_die {
                Self::remove_request(&mut table, id, my_id, mode);
                return Err(DbError::TransactionAbort {
                    txn_id: my_id,
                    reason: AbortReason::DeadlockPrevention,
                });
            }

            let cvar = queue.cvar.clone();
            table = cvar.wait(table).unwrap();

            if txn.state() == TxnState::Shrinking {
                Self::remove_request(&mut table, id, my_id, mode);
                return Err(DbError::TransactionAbort {
                    txn_id: my_id,
                    reason: AbortReason::LockOnShrinking,
                });
            }
        }
    }

    fn remove_request(
        table: &mut HashMap<LockDataId, LockQueue>,
        id: LockDataId,
        txn_id: TxnId,
        mode: LockMode,
    ) {
        if let Some(queue) = table.get_mut(&id) {
            if let Some(pos) = queue
                .requests
                .iter()
                .position(|r| r.txn_id == txn_id && !r.granted && r.mode == mode)
            {
                queue.requests.remove(pos);
            }
            if queue.requests.is_empty() {
                table.remove(&id);
            } else {
                queue.cvar.notify_all();
            }
        }
    }

    /// Releases every lock the transaction holds on `id`. The first unlock
    /// moves the transaction from GROWING to SHRINKING.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> bool {
        if txn.state() == TxnState::Growing {
            txn.set_state(TxnState::Shrinking);
        }
        let my_id = txn.id();

        let mut table = self.lock_table.lock().unwrap();
        let Some(queue) = table.get_mut(&id) else {
            return false;
        };

        let before = queue.requests.len();
        queue.requests.retain(|r| r.txn_id != my_id);
        if queue.requests.len() == before {
            return false;
        }

        txn.lock_set().remove(&id);

        if queue.requests.is_empty() {
            table.remove(&id);
        } else {
            queue.cvar.notify_all();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn rid(page_no: i32, slot_no: i32) -> Rid {
        Rid { page_no, slot_no }
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [
            IntentionShared,
            IntentionExclusive,
            Shared,
            SharedIntentionExclusive,
            Exclusive,
        ];
        let expect = [
            // held = IS, IX, S, SIX, X / requested across columns
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, held) in modes.iter().enumerate() {
            for (j, requested) in modes.iter().enumerate() {
                assert_eq!(
                    compatible(*held, *requested),
                    expect[i][j],
                    "held {held:?} requested {requested:?}"
                );
            }
        }
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, 1);
        let t2 = Transaction::new(2, 2);

        lm.lock_shared_on_record(&t1, rid(1, 0), 0).unwrap();
        lm.lock_shared_on_record(&t2, rid(1, 0), 0).unwrap();
        assert_eq!(t1.lock_set().len(), 2); // table IS + record S
        assert_eq!(t2.lock_set().len(), 2);
    }

    #[test]
    fn test_wait_die_younger_aborts() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, 1);
        let t2 = Transaction::new(2, 2);

        lm.lock_exclusive_on_record(&t1, rid(1, 0), 0).unwrap();
        let err = lm.lock_shared_on_record(&t2, rid(1, 0), 0).unwrap_err();
        assert!(matches!(
            err,
            DbError::TransactionAbort {
                txn_id: 2,
                reason: AbortReason::DeadlockPrevention,
            }
        ));
    }

    #[test]
    fn test_wait_die_older_waits_until_release() {
        let lm = Arc::new(LockManager::new());
        let t1 = Arc::new(Transaction::new(1, 1));
        let t2 = Arc::new(Transaction::new(2, 2));

        lm.lock_exclusive_on_record(&t2, rid(3, 0), 0).unwrap();

        let lm2 = lm.clone();
        let t1c = t1.clone();
        let waiter = thread::spawn(move || lm2.lock_shared_on_record(&t1c, rid(3, 0), 0));

        // Give the older transaction time to park on the queue.
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        let locks: Vec<_> = t2.lock_set().iter().copied().collect();
        for id in locks {
            lm.unlock(&t2, id);
        }
        waiter.join().unwrap().unwrap();
        assert!(t1.lock_set().contains(&LockDataId::Record {
            file: 0,
            rid: rid(3, 0)
        }));
    }

    #[test]
    fn test_lock_on_shrinking_aborts() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, 1);

        lm.lock_shared_on_record(&t1, rid(1, 0), 0).unwrap();
        lm.unlock(&t1, LockDataId::Record { file: 0, rid: rid(1, 0) });
        assert_eq!(t1.state(), TxnState::Shrinking);

        let err = lm.lock_shared_on_record(&t1, rid(1, 1), 0).unwrap_err();
        assert!(matches!(
            err,
            DbError::TransactionAbort {
                reason: AbortReason::LockOnShrinking,
                ..
            }
        ));
    }

    #[test]
    fn test_subsumption_is_idempotent() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, 1);

        lm.lock_exclusive_on_record(&t1, rid(1, 0), 0).unwrap();
        // X subsumes S on the same record; IX subsumes IS on the table.
        lm.lock_shared_on_record(&t1, rid(1, 0), 0).unwrap();
        assert_eq!(t1.lock_set().len(), 2);
    }

    #[test]
    fn test_upgrade_shared_to_exclusive_when_sole_holder() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, 1);
        let t2 = Transaction::new(2, 2);

        lm.lock_shared_on_record(&t1, rid(2, 1), 0).unwrap();
        lm.lock_exclusive_on_record(&t1, rid(2, 1), 0).unwrap();

        // The upgraded X now blocks the younger reader outright.
        let err = lm.lock_shared_on_record(&t2, rid(2, 1), 0).unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn test_unlock_unknown_resource_is_false() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, 1);
        assert!(!lm.unlock(&t1, LockDataId::Table { file: 9 }));
    }

    #[test]
    fn test_intention_locks_do_not_block_each_other() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, 1);
        let t2 = Transaction::new(2, 2);

        lm.lock_ix_on_table(&t1, 0).unwrap();
        lm.lock_is_on_table(&t2, 0).unwrap();
        // But a younger full-table S conflicts with the held IX.
        let t3 = Transaction::new(3, 3);
        assert!(lm.lock_shared_on_table(&t3, 0).is_err());
    }
}
