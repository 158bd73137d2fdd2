//! The append-only log channel. Crash recovery is out of scope; what remains
//! is the framing and the flush-at-commit discipline: every DML write record
//! is serialized into an in-memory buffer and drained to the disk manager's
//! log file when its transaction terminates.

use std::sync::{Arc, Mutex};

use crc32fast::Hasher;

use crate::disk_manager::DiskManager;
use crate::errors::Result;
use crate::transaction::{TxnId, WriteRecord};

/// Framing for every log record: total length, owning transaction, payload
/// checksum.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LogRecordHeader {
    pub total_len: u32,
    pub txn_id: TxnId,
    pub crc: u32,
}

pub const LOG_RECORD_HEADER_SIZE: usize = std::mem::size_of::<LogRecordHeader>();

pub struct LogManager {
    disk: Arc<Mutex<DiskManager>>,
    buffer: Mutex<Vec<u8>>,
}

impl LogManager {
    pub fn new(disk: Arc<Mutex<DiskManager>>) -> Self {
        Self {
            disk,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Serializes a write record into the log buffer.
    pub fn append(&self, txn_id: TxnId, record: &WriteRecord) -> Result<()> {
        let payload = bincode::serialize(record)
            .map_err(|e| crate::errors::DbError::Internal(format!("log serialize: {e}")))?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();
        let total_len = (LOG_RECORD_HEADER_SIZE + payload.len()) as u32;

        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend_from_slice(&total_len.to_le_bytes());
        buffer.extend_from_slice(&txn_id.to_le_bytes());
        buffer.extend_from_slice(&crc.to_le_bytes());
        buffer.extend_from_slice(&payload);
        Ok(())
    }

    /// Drains the buffer to the on-disk log and syncs it. Called at commit
    /// and abort.
    pub fn flush(&self) -> Result<()> {
        let drained = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        let mut disk = self.disk.lock().unwrap();
        disk.append_log(&drained)?;
        disk.sync_log()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Rid;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_flush() {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::new();
        dm.open_log(dir.path().join("undo.log")).unwrap();
        let disk = Arc::new(Mutex::new(dm));
        let lm = LogManager::new(disk);

        let record = WriteRecord::Insert {
            table: "t".into(),
            rid: Rid { page_no: 1, slot_no: 0 },
            record: vec![1, 2, 3],
        };
        lm.append(7, &record).unwrap();
        assert!(lm.buffered_len() > LOG_RECORD_HEADER_SIZE);

        lm.flush().unwrap();
        assert_eq!(lm.buffered_len(), 0);

        let bytes = std::fs::read(dir.path().join("undo.log")).unwrap();
        let total_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let txn_id = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(total_len, bytes.len());
        assert_eq!(txn_id, 7);

        let payload = &bytes[LOG_RECORD_HEADER_SIZE..];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        assert_eq!(hasher.finalize(), crc);

        let back: WriteRecord = bincode::deserialize(payload).unwrap();
        assert!(matches!(back, WriteRecord::Insert { .. }));
    }
}
