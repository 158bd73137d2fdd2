//! The execution context threaded through every record and index operation:
//! the lock manager, the log manager, and the current transaction. A context
//! without a transaction means "no concurrency control" and is used only
//! during bootstrap and rollback.

use std::sync::Arc;

use crate::lock_manager::LockManager;
use crate::log::LogManager;
use crate::transaction::Transaction;

pub struct Context<'a> {
    pub lock_mgr: &'a LockManager,
    pub log_mgr: Option<&'a LogManager>,
    pub txn: Option<&'a Arc<Transaction>>,
}

impl<'a> Context<'a> {
    pub fn new(
        lock_mgr: &'a LockManager,
        log_mgr: Option<&'a LogManager>,
        txn: Option<&'a Arc<Transaction>>,
    ) -> Self {
        Self {
            lock_mgr,
            log_mgr,
            txn,
        }
    }

    /// A context that bypasses locking and logging entirely.
    pub fn no_txn(lock_mgr: &'a LockManager) -> Self {
        Self {
            lock_mgr,
            log_mgr: None,
            txn: None,
        }
    }
}
