use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::{FileId, PageNo};

/// Why a transaction was forced to abort by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A lock was requested after the transaction entered its shrinking phase.
    LockOnShrinking,
    /// The wait-die policy killed a younger transaction to avoid deadlock.
    DeadlockPrevention,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("record not found at page {page_no} slot {slot_no}")]
    RecordNotFound { page_no: PageNo, slot_no: i32 },

    #[error("page {page_no} does not exist in file {file}")]
    PageNotExist { file: FileId, page_no: PageNo },

    #[error("file already exists: {0}")]
    FileExists(PathBuf),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("file handle {0} is not open")]
    FileNotOpen(FileId),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("transaction {txn_id} aborted: {reason:?}")]
    TransactionAbort { txn_id: u32, reason: AbortReason },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// True for the two lock-manager abort conditions; the transaction driver
    /// must respond by rolling the transaction back.
    pub fn is_abort(&self) -> bool {
        matches!(self, DbError::TransactionAbort { .. })
    }
}
