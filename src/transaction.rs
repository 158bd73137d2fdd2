//! Transactions and the transaction manager. A transaction carries its write
//! set (the in-memory undo log) and its lock set; the manager owns the global
//! transaction table and the id/timestamp counters, and implements commit and
//! undo-based abort.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::context::Context;
use crate::errors::Result;
use crate::lock_manager::{LockDataId, LockManager};
use crate::log::LogManager;
use crate::Rid;

pub type TxnId = u32;
pub type Timestamp = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// One entry of a transaction's write set: enough to undo the mutation and
/// its index maintenance. Insert keeps the after-image so the entries built
/// for the inserted key can be removed; delete and update keep the
/// before-image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteRecord {
    Insert {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
    Delete {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
    Update {
        table: String,
        rid: Rid,
        old_record: Vec<u8>,
    },
}

pub struct Transaction {
    id: TxnId,
    start_ts: AtomicU32,
    state: Mutex<TxnState>,
    write_set: Mutex<Vec<WriteRecord>>,
    lock_set: Mutex<HashSet<LockDataId>>,
}

impl Transaction {
    pub fn new(id: TxnId, start_ts: Timestamp) -> Self {
        Self {
            id,
            start_ts: AtomicU32::new(start_ts),
            state: Mutex::new(TxnState::Growing),
            write_set: Mutex::new(Vec::new()),
            lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock().unwrap() = state;
    }

    /// Appends an undo entry in execution order.
    pub fn append_write_record(&self, record: WriteRecord) {
        self.write_set.lock().unwrap().push(record);
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().unwrap().len()
    }

    pub fn lock_set(&self) -> MutexGuard<'_, HashSet<LockDataId>> {
        self.lock_set.lock().unwrap()
    }
}

/// Owns the global transaction table and drives the transaction lifecycle.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    next_timestamp: AtomicU32,
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    lock_mgr: Arc<LockManager>,
    catalog: Arc<Catalog>,
}

impl TransactionManager {
    pub fn new(lock_mgr: Arc<LockManager>, catalog: Arc<Catalog>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            next_timestamp: AtomicU32::new(0),
            txns: Mutex::new(HashMap::new()),
            lock_mgr,
            catalog,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    /// Starts a transaction. A fresh one is allocated when none is supplied;
    /// either way the transaction enters GROWING with a new start timestamp
    /// and is registered in the global table.
    pub fn begin(&self, txn: Option<Arc<Transaction>>) -> Arc<Transaction> {
        let txn = match txn {
            Some(txn) => {
                txn.set_state(TxnState::Growing);
                txn.start_ts.store(
                    self.next_timestamp.fetch_add(1, Ordering::SeqCst),
                    Ordering::Release,
                );
                txn
            }
            None => {
                let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
                let ts = self.next_timestamp.fetch_add(1, Ordering::SeqCst);
                Arc::new(Transaction::new(id, ts))
            }
        };
        crate::granite_debug_log!("[TransactionManager::begin] txn {}", txn.id());
        self.txns.lock().unwrap().insert(txn.id(), txn.clone());
        txn
    }

    pub fn get(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().unwrap().get(&id).cloned()
    }

    /// Commits: the write set is discarded, every held lock is released, the
    /// log is flushed, and the transaction becomes COMMITTED.
    pub fn commit(&self, txn: &Arc<Transaction>, log_mgr: Option<&LogManager>) -> Result<()> {
        txn.set_state(TxnState::Shrinking);

        txn.write_set.lock().unwrap().clear();
        self.release_all_locks(txn);

        if let Some(log_mgr) = log_mgr {
            log_mgr.flush()?;
        }
        txn.set_state(TxnState::Committed);
        crate::granite_debug_log!("[TransactionManager::commit] txn {}", txn.id());
        Ok(())
    }

    /// Aborts: the write set is undone in reverse order (records and index
    /// entries both), locks are released, the log is flushed, and the
    /// transaction becomes ABORTED.
    pub fn abort(&self, txn: &Arc<Transaction>, log_mgr: Option<&LogManager>) -> Result<()> {
        txn.set_state(TxnState::Shrinking);
        crate::granite_debug_log!("[TransactionManager::abort] txn {}", txn.id());

        let writes: Vec<WriteRecord> = {
            let mut write_set = txn.write_set.lock().unwrap();
            write_set.drain(..).collect()
        };
        // Undo bypasses concurrency control: the transaction still holds its
        // X locks on everything it touched.
        let ctx = Context::no_txn(&self.lock_mgr);

        for record in writes.into_iter().rev() {
            match record {
                WriteRecord::Insert { table, rid, record } => {
                    let (file, indexes) = self.catalog.handles(&table)?;
                    for ih in &indexes {
                        let key = ih.schema().key_from_record(&record);
                        ih.delete_entry(&ctx, &key)?;
                    }
                    file.delete_record(&ctx, rid)?;
                }
                WriteRecord::Delete { table, rid, record } => {
                    let (file, indexes) = self.catalog.handles(&table)?;
                    file.insert_record_at(&ctx, rid, &record)?;
                    for ih in &indexes {
                        let key = ih.schema().key_from_record(&record);
                        ih.insert_entry(&ctx, &key, rid)?;
                    }
                }
                WriteRecord::Update {
                    table,
                    rid,
                    old_record,
                } => {
                    // The dirty record is still in place; read it back to
                    // recover the keys that must come out of the indexes.
                    let (file, indexes) = self.catalog.handles(&table)?;
                    let current = file.get_record(&ctx, rid)?;
                    for ih in &indexes {
                        let new_key = ih.schema().key_from_record(&current);
                        ih.delete_entry(&ctx, &new_key)?;
                        let old_key = ih.schema().key_from_record(&old_record);
                        ih.insert_entry(&ctx, &old_key, rid)?;
                    }
                    file.update_record(&ctx, rid, &old_record)?;
                }
            }
        }

        self.release_all_locks(txn);
        if let Some(log_mgr) = log_mgr {
            log_mgr.flush()?;
        }
        txn.set_state(TxnState::Aborted);
        Ok(())
    }

    /// Releases every lock in the transaction's lock set. Iterates over a
    /// snapshot because `unlock` erases entries from the set as it goes.
    fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let locks: Vec<LockDataId> = txn.lock_set().iter().copied().collect();
        for id in locks {
            self.lock_mgr.unlock(txn, id);
        }
    }
}
