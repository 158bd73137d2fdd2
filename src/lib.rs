//! # Granite Storage Engine
//! The storage and transaction core of a single-node relational database.
//! This crate manages the on-disk and in-memory representation of data:
//! paged files, a buffer pool, slotted record files, clustered B+ tree
//! indexes, and strict two-phase locking with undo-based rollback.

/// The B+ tree index implementation.
pub mod btree;
/// The buffer pool manager.
pub mod buffer_pool;
/// The table and index registry used by the transaction layer.
pub mod catalog;
/// The per-operation execution context.
pub mod context;
/// The disk manager for paged file I/O.
pub mod disk_manager;
/// Crate-wide error types.
pub mod errors;
/// The lock manager for concurrency control.
pub mod lock_manager;
/// The append-only undo log channel.
pub mod log;
/// The slotted-page record file.
pub mod record;
/// Frame replacement policies for the buffer pool.
pub mod replacer;
/// Transactions and the transaction manager.
pub mod transaction;

use serde::{Deserialize, Serialize};

/// The size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A handle to an open file, vended by the disk manager.
pub type FileId = u32;

/// A page number within a file. Signed so that on-disk sentinels
/// (`INVALID_PAGE_NO`) round-trip exactly.
pub type PageNo = i32;

/// Marks an absent page in free lists, leaf links, and parent pointers.
pub const INVALID_PAGE_NO: PageNo = -1;

/// A unique identifier for a page across all open files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub file: FileId,
    pub page_no: PageNo,
}

/// A record identifier: `(page_no, slot_no)` within a record file. Also the
/// payload slot type inside B+ tree nodes, where internal nodes store a child
/// page number in `page_no`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_no: PageNo,
    pub slot_no: i32,
}

/// A position inside a B+ tree: `(leaf page, slot)`. Distinct from [`Rid`],
/// which points into a record file; an `Iid` indexes the key array of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: i32,
}

pub use buffer_pool::{BufferPoolManager, PageGuard};
pub use errors::{DbError, Result};

pub fn debug_logs_enabled() -> bool {
    std::env::var_os("GRANITE_DEBUG_LOG").is_some()
}

#[macro_export]
macro_rules! granite_debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_logs_enabled() {
            println!($($arg)*);
        }
    };
}
