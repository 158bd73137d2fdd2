//! The table and index registry. Owns the record-file and index handles of
//! every open table and pairs record mutations with index maintenance and
//! write-set bookkeeping, which is exactly what undo-based abort needs to see.
//! SQL-level DDL and metadata live above this crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::btree::{IndexCol, IndexHandle};
use crate::buffer_pool::BufferPoolManager;
use crate::context::Context;
use crate::errors::{DbError, Result};
use crate::record::RecordFile;
use crate::transaction::WriteRecord;
use crate::Rid;

struct TableEntry {
    file: Arc<RecordFile>,
    indexes: Vec<Arc<IndexHandle>>,
}

pub struct Catalog {
    root: PathBuf,
    bpm: Arc<BufferPoolManager>,
    tables: Mutex<HashMap<String, TableEntry>>,
}

impl Catalog {
    /// Opens (creating if needed) a database directory.
    pub fn new(bpm: Arc<BufferPoolManager>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            bpm,
            tables: Mutex::new(HashMap::new()),
        })
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.tbl"))
    }

    fn index_path(&self, table: &str, cols: &[IndexCol]) -> PathBuf {
        let suffix: Vec<String> = cols.iter().map(|c| c.offset.to_string()).collect();
        self.root.join(format!("{table}_{}.idx", suffix.join("_")))
    }

    pub fn create_table(&self, name: &str, record_size: usize) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(name) {
            return Err(DbError::FileExists(self.table_path(name)));
        }
        let file = RecordFile::create(self.bpm.clone(), self.table_path(name), record_size)?;
        tables.insert(
            name.to_string(),
            TableEntry {
                file: Arc::new(file),
                indexes: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn open_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(name) {
            return Ok(());
        }
        let file = RecordFile::open(self.bpm.clone(), self.table_path(name))?;
        tables.insert(
            name.to_string(),
            TableEntry {
                file: Arc::new(file),
                indexes: Vec::new(),
            },
        );
        Ok(())
    }

    /// Drops a table and all of its indexes from disk.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let entry = self
            .tables
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| DbError::FileNotFound(self.table_path(name)))?;

        let mut file_ids = vec![entry.file.file_id()];
        file_ids.extend(entry.indexes.iter().map(|ih| ih.file_id()));
        drop(entry);

        for file_id in file_ids {
            let path = self.bpm.disk.lock().unwrap().path_of(file_id)?;
            self.bpm.purge_pages(file_id)?;
            let mut disk = self.bpm.disk.lock().unwrap();
            disk.close_file(file_id)?;
            disk.destroy_file(&path)?;
        }
        Ok(())
    }

    /// Builds an index over the given columns, backfilling it from the
    /// table's existing records.
    pub fn create_index(
        &self,
        ctx: &Context<'_>,
        table: &str,
        cols: Vec<IndexCol>,
        order: Option<usize>,
    ) -> Result<()> {
        let file = self.table(table)?;
        let path = self.index_path(table, &cols);
        let ih = Arc::new(IndexHandle::create(self.bpm.clone(), path, cols, order)?);

        let mut scan = file.scan()?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = file.get_record(ctx, rid)?;
            let key = ih.schema().key_from_record(&record);
            ih.insert_entry(ctx, &key, rid)?;
            scan.next()?;
        }

        let mut tables = self.tables.lock().unwrap();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| DbError::FileNotFound(self.table_path(table)))?;
        entry.indexes.push(ih);
        Ok(())
    }

    pub fn drop_index(&self, table: &str, col_offsets: &[usize]) -> Result<()> {
        let ih = {
            let mut tables = self.tables.lock().unwrap();
            let entry = tables
                .get_mut(table)
                .ok_or_else(|| DbError::FileNotFound(self.table_path(table)))?;
            let pos = entry
                .indexes
                .iter()
                .position(|ih| {
                    let offsets: Vec<usize> =
                        ih.schema().cols.iter().map(|c| c.offset).collect();
                    offsets == col_offsets
                })
                .ok_or(DbError::IndexEntryNotFound)?;
            entry.indexes.remove(pos)
        };

        let file_id = ih.file_id();
        drop(ih);
        let path = self.bpm.disk.lock().unwrap().path_of(file_id)?;
        self.bpm.purge_pages(file_id)?;
        let mut disk = self.bpm.disk.lock().unwrap();
        disk.close_file(file_id)?;
        disk.destroy_file(&path)?;
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<Arc<RecordFile>> {
        self.tables
            .lock()
            .unwrap()
            .get(name)
            .map(|entry| entry.file.clone())
            .ok_or_else(|| DbError::FileNotFound(self.table_path(name)))
    }

    pub fn indexes(&self, name: &str) -> Result<Vec<Arc<IndexHandle>>> {
        self.tables
            .lock()
            .unwrap()
            .get(name)
            .map(|entry| entry.indexes.clone())
            .ok_or_else(|| DbError::FileNotFound(self.table_path(name)))
    }

    /// Record file plus indexes in one registry lookup.
    pub fn handles(&self, name: &str) -> Result<(Arc<RecordFile>, Vec<Arc<IndexHandle>>)> {
        let tables = self.tables.lock().unwrap();
        let entry = tables
            .get(name)
            .ok_or_else(|| DbError::FileNotFound(self.table_path(name)))?;
        Ok((entry.file.clone(), entry.indexes.clone()))
    }

    /// Inserts a record, maintains every index, and books the undo entry.
    pub fn insert_into(&self, ctx: &Context<'_>, table: &str, data: &[u8]) -> Result<Rid> {
        let (file, indexes) = self.handles(table)?;
        let rid = file.insert_record(ctx, data)?;

        self.book_write(
            ctx,
            WriteRecord::Insert {
                table: table.to_string(),
                rid,
                record: data.to_vec(),
            },
        )?;

        for ih in &indexes {
            let key = ih.schema().key_from_record(data);
            ih.insert_entry(ctx, &key, rid)?;
        }
        Ok(rid)
    }

    /// Deletes a record and its index entries, booking the before-image.
    pub fn delete_from(&self, ctx: &Context<'_>, table: &str, rid: Rid) -> Result<()> {
        let (file, indexes) = self.handles(table)?;
        let before = file.get_record(ctx, rid)?;
        file.delete_record(ctx, rid)?;

        self.book_write(
            ctx,
            WriteRecord::Delete {
                table: table.to_string(),
                rid,
                record: before.clone(),
            },
        )?;

        for ih in &indexes {
            let key = ih.schema().key_from_record(&before);
            ih.delete_entry(ctx, &key)?;
        }
        Ok(())
    }

    /// Overwrites a record in place, remapping index entries whose keys
    /// changed and booking the before-image.
    pub fn update_at(&self, ctx: &Context<'_>, table: &str, rid: Rid, data: &[u8]) -> Result<()> {
        let (file, indexes) = self.handles(table)?;
        let before = file.get_record(ctx, rid)?;
        file.update_record(ctx, rid, data)?;

        self.book_write(
            ctx,
            WriteRecord::Update {
                table: table.to_string(),
                rid,
                old_record: before.clone(),
            },
        )?;

        for ih in &indexes {
            let old_key = ih.schema().key_from_record(&before);
            let new_key = ih.schema().key_from_record(data);
            if old_key != new_key {
                ih.delete_entry(ctx, &old_key)?;
                ih.insert_entry(ctx, &new_key, rid)?;
            }
        }
        Ok(())
    }

    fn book_write(&self, ctx: &Context<'_>, record: WriteRecord) -> Result<()> {
        if let Some(txn) = ctx.txn {
            if let Some(log_mgr) = ctx.log_mgr {
                log_mgr.append(txn.id(), &record)?;
            }
            txn.append_write_record(record);
        }
        Ok(())
    }

    /// Writes every open header back and flushes all pool pages to disk.
    pub fn flush_all(&self) -> Result<()> {
        let tables = self.tables.lock().unwrap();
        for entry in tables.values() {
            entry.file.sync_header()?;
            self.bpm.flush_all_pages(entry.file.file_id())?;
            for ih in &entry.indexes {
                ih.sync_header()?;
                self.bpm.flush_all_pages(ih.file_id())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::ColType;
    use crate::disk_manager::DiskManager;
    use crate::lock_manager::LockManager;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<BufferPoolManager>, Catalog) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(Mutex::new(DiskManager::new()));
        let bpm = Arc::new(BufferPoolManager::new(disk, 32));
        let catalog = Catalog::new(bpm.clone(), dir.path().join("db")).unwrap();
        (dir, bpm, catalog)
    }

    fn int_record(v: i32) -> Vec<u8> {
        let mut rec = vec![0u8; 8];
        rec[..4].copy_from_slice(&v.to_le_bytes());
        rec
    }

    fn int_cols() -> Vec<IndexCol> {
        vec![IndexCol {
            col_type: ColType::Int,
            len: 4,
            offset: 0,
        }]
    }

    #[test]
    fn test_create_and_drop_table() {
        let (_dir, _bpm, catalog) = setup();
        catalog.create_table("t", 8).unwrap();
        assert!(matches!(
            catalog.create_table("t", 8),
            Err(DbError::FileExists(_))
        ));
        catalog.drop_table("t").unwrap();
        assert!(catalog.table("t").is_err());
        catalog.create_table("t", 8).unwrap();
    }

    #[test]
    fn test_dml_maintains_indexes() {
        let (_dir, _bpm, catalog) = setup();
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        catalog.create_table("t", 8).unwrap();
        catalog.create_index(&ctx, "t", int_cols(), Some(4)).unwrap();

        let rid = catalog.insert_into(&ctx, "t", &int_record(42)).unwrap();
        let ih = &catalog.indexes("t").unwrap()[0];
        let key = 42i32.to_le_bytes();
        assert_eq!(ih.get_value(&ctx, &key).unwrap(), Some(rid));

        catalog.update_at(&ctx, "t", rid, &int_record(43)).unwrap();
        assert_eq!(ih.get_value(&ctx, &key).unwrap(), None);
        assert_eq!(
            ih.get_value(&ctx, &43i32.to_le_bytes()).unwrap(),
            Some(rid)
        );

        catalog.delete_from(&ctx, "t", rid).unwrap();
        assert_eq!(ih.get_value(&ctx, &43i32.to_le_bytes()).unwrap(), None);
    }

    #[test]
    fn test_create_index_backfills_existing_records() {
        let (_dir, _bpm, catalog) = setup();
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        catalog.create_table("t", 8).unwrap();
        let rids: Vec<Rid> = (0..10)
            .map(|v| catalog.insert_into(&ctx, "t", &int_record(v)).unwrap())
            .collect();

        catalog.create_index(&ctx, "t", int_cols(), Some(4)).unwrap();
        let ih = &catalog.indexes("t").unwrap()[0];
        for (v, rid) in rids.iter().enumerate() {
            assert_eq!(
                ih.get_value(&ctx, &(v as i32).to_le_bytes()).unwrap(),
                Some(*rid)
            );
        }
    }

    #[test]
    fn test_drop_index() {
        let (_dir, _bpm, catalog) = setup();
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        catalog.create_table("t", 8).unwrap();
        catalog.create_index(&ctx, "t", int_cols(), Some(4)).unwrap();
        assert_eq!(catalog.indexes("t").unwrap().len(), 1);

        catalog.drop_index("t", &[0]).unwrap();
        assert!(catalog.indexes("t").unwrap().is_empty());
        assert!(matches!(
            catalog.drop_index("t", &[0]),
            Err(DbError::IndexEntryNotFound)
        ));
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(Mutex::new(DiskManager::new()));
        let bpm = Arc::new(BufferPoolManager::new(disk, 32));
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let rid = {
            let catalog = Catalog::new(bpm.clone(), dir.path().join("db")).unwrap();
            catalog.create_table("t", 8).unwrap();
            let rid = catalog.insert_into(&ctx, "t", &int_record(7)).unwrap();
            catalog.flush_all().unwrap();
            rid
        };

        let catalog = Catalog::new(bpm, dir.path().join("db")).unwrap();
        catalog.open_table("t").unwrap();
        let file = catalog.table("t").unwrap();
        assert_eq!(file.get_record(&ctx, rid).unwrap(), int_record(7));
    }
}
