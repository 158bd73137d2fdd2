//! Fixed-size record storage over slotted pages. Page 0 of a record file is
//! its header; every later page holds a small header, an occupancy bitmap,
//! and a packed array of record slots. Pages with at least one free slot are
//! chained into a singly-linked free-page list headed in the file header.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::buffer_pool::BufferPoolManager;
use crate::context::Context;
use crate::errors::{DbError, Result};
use crate::{FileId, PageId, PageNo, Rid, INVALID_PAGE_NO, PAGE_SIZE};

/// Sentinel for "no free page" in the free-list chain.
pub const RM_NO_PAGE: PageNo = INVALID_PAGE_NO;

/// Record pages start right after the file header page.
pub const FIRST_RECORD_PAGE: PageNo = 1;

const RECORD_PAGE_HEADER_SIZE: usize = std::mem::size_of::<RecordPageHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RecordPageHeader {
    next_free_page: PageNo,
    num_records: i32,
}

fn read_page_header(data: &[u8]) -> RecordPageHeader {
    unsafe { std::ptr::read_unaligned(data.as_ptr() as *const RecordPageHeader) }
}

fn write_page_header(data: &mut [u8], hdr: &RecordPageHeader) {
    unsafe {
        std::ptr::write_unaligned(data.as_mut_ptr() as *mut RecordPageHeader, *hdr);
    }
}

mod bitmap {
    pub fn is_set(bitmap: &[u8], i: usize) -> bool {
        bitmap[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set(bitmap: &mut [u8], i: usize) {
        bitmap[i / 8] |= 1 << (i % 8);
    }

    pub fn clear(bitmap: &mut [u8], i: usize) {
        bitmap[i / 8] &= !(1 << (i % 8));
    }

    pub fn first_clear(bitmap: &[u8], n: usize) -> Option<usize> {
        (0..n).find(|&i| !is_set(bitmap, i))
    }

    pub fn next_set(bitmap: &[u8], n: usize, from: usize) -> Option<usize> {
        (from..n).find(|&i| is_set(bitmap, i))
    }
}

/// Serialized into page 0 of every record file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFileHeader {
    pub record_size: u32,
    pub records_per_page: u32,
    pub bitmap_size: u32,
    /// Total pages including the header page.
    pub num_pages: PageNo,
    /// Head of the free-page list, `RM_NO_PAGE` when every page is full.
    pub first_free_page: PageNo,
    pub first_record_page: PageNo,
}

/// The largest slot count whose header + bitmap + slots fit in one page.
fn records_per_page(record_size: usize) -> usize {
    let usable = PAGE_SIZE - RECORD_PAGE_HEADER_SIZE;
    let mut n = usable * 8 / (record_size * 8 + 1);
    while n > 0 && n.div_ceil(8) + n * record_size > usable {
        n -= 1;
    }
    n
}

/// A handle to one record file. The in-memory header is the authority for the
/// free list and page count; `sync_header` writes it back to page 0.
pub struct RecordFile {
    bpm: Arc<BufferPoolManager>,
    file_id: FileId,
    hdr: Mutex<RecordFileHeader>,
}

impl RecordFile {
    /// Creates a record file for fixed `record_size` records and opens it.
    pub fn create<P: AsRef<Path>>(
        bpm: Arc<BufferPoolManager>,
        path: P,
        record_size: usize,
    ) -> Result<Self> {
        let n = records_per_page(record_size);
        if record_size == 0 || n == 0 {
            return Err(DbError::Internal(format!(
                "record size {record_size} does not fit a page"
            )));
        }
        let hdr = RecordFileHeader {
            record_size: record_size as u32,
            records_per_page: n as u32,
            bitmap_size: n.div_ceil(8) as u32,
            num_pages: 1,
            first_free_page: RM_NO_PAGE,
            first_record_page: FIRST_RECORD_PAGE,
        };

        let file_id = {
            let mut disk = bpm.disk.lock().unwrap();
            disk.create_file(&path)?;
            let file_id = disk.open_file(&path)?;
            let mut page0 = [0u8; PAGE_SIZE];
            let bytes = bincode::serialize(&hdr)
                .map_err(|e| DbError::Internal(format!("header serialize: {e}")))?;
            page0[..bytes.len()].copy_from_slice(&bytes);
            disk.write_page(file_id, 0, &page0)?;
            file_id
        };

        Ok(Self {
            bpm,
            file_id,
            hdr: Mutex::new(hdr),
        })
    }

    pub fn open<P: AsRef<Path>>(bpm: Arc<BufferPoolManager>, path: P) -> Result<Self> {
        let (file_id, hdr) = {
            let mut disk = bpm.disk.lock().unwrap();
            let file_id = disk.open_file(&path)?;
            let mut page0 = [0u8; PAGE_SIZE];
            disk.read_page(file_id, 0, &mut page0)?;
            let hdr: RecordFileHeader = bincode::deserialize(&page0)
                .map_err(|e| DbError::Internal(format!("header deserialize: {e}")))?;
            (file_id, hdr)
        };
        Ok(Self {
            bpm,
            file_id,
            hdr: Mutex::new(hdr),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn record_size(&self) -> usize {
        self.hdr.lock().unwrap().record_size as usize
    }

    pub fn header(&self) -> RecordFileHeader {
        self.hdr.lock().unwrap().clone()
    }

    /// Writes the in-memory header back to page 0.
    pub fn sync_header(&self) -> Result<()> {
        let hdr = self.hdr.lock().unwrap().clone();
        let mut page0 = [0u8; PAGE_SIZE];
        let bytes = bincode::serialize(&hdr)
            .map_err(|e| DbError::Internal(format!("header serialize: {e}")))?;
        page0[..bytes.len()].copy_from_slice(&bytes);
        self.bpm
            .disk
            .lock()
            .unwrap()
            .write_page(self.file_id, 0, &page0)
    }

    fn check_rid(&self, hdr: &RecordFileHeader, rid: Rid) -> Result<()> {
        if rid.page_no < hdr.first_record_page || rid.page_no >= hdr.num_pages {
            return Err(DbError::PageNotExist {
                file: self.file_id,
                page_no: rid.page_no,
            });
        }
        Ok(())
    }

    /// Reads the record at `rid`. Takes a record S lock when a transaction is
    /// present. Fails with `RecordNotFound` when the slot is free.
    pub fn get_record(&self, ctx: &Context<'_>, rid: Rid) -> Result<Vec<u8>> {
        if let Some(txn) = ctx.txn {
            ctx.lock_mgr.lock_shared_on_record(txn, rid, self.file_id)?;
        }
        let hdr = self.hdr.lock().unwrap();
        self.check_rid(&hdr, rid)?;

        let guard = self.bpm.fetch_page(PageId {
            file: self.file_id,
            page_no: rid.page_no,
        })?;
        let page = guard.read();
        let bitmap = &page.data[RECORD_PAGE_HEADER_SIZE..][..hdr.bitmap_size as usize];
        if rid.slot_no < 0
            || rid.slot_no >= hdr.records_per_page as i32
            || !bitmap::is_set(bitmap, rid.slot_no as usize)
        {
            return Err(DbError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let offset = self.slot_offset(&hdr, rid.slot_no as usize);
        Ok(page.data[offset..offset + hdr.record_size as usize].to_vec())
    }

    fn slot_offset(&self, hdr: &RecordFileHeader, slot_no: usize) -> usize {
        RECORD_PAGE_HEADER_SIZE + hdr.bitmap_size as usize + slot_no * hdr.record_size as usize
    }

    /// Inserts a record into the first free slot of the free-list head,
    /// allocating a fresh page when the list is empty. Takes a record X lock
    /// (with its table IX) when a transaction is present.
    pub fn insert_record(&self, ctx: &Context<'_>, data: &[u8]) -> Result<Rid> {
        if let Some(txn) = ctx.txn {
            ctx.lock_mgr.lock_ix_on_table(txn, self.file_id)?;
        }

        let rid = {
            let mut hdr = self.hdr.lock().unwrap();
            if data.len() != hdr.record_size as usize {
                return Err(DbError::Internal(format!(
                    "record length {} does not match record size {}",
                    data.len(),
                    hdr.record_size
                )));
            }

            let guard = if hdr.first_free_page != RM_NO_PAGE {
                self.bpm.fetch_page(PageId {
                    file: self.file_id,
                    page_no: hdr.first_free_page,
                })?
            } else {
                let guard = self.bpm.new_page(self.file_id)?;
                let page_no = guard.page_id().page_no;
                {
                    let mut page = guard.write();
                    write_page_header(
                        &mut page.data,
                        &RecordPageHeader {
                            next_free_page: hdr.first_free_page,
                            num_records: 0,
                        },
                    );
                }
                hdr.first_free_page = page_no;
                hdr.num_pages += 1;
                guard
            };

            let page_no = guard.page_id().page_no;
            let mut page = guard.write();
            let mut page_hdr = read_page_header(&page.data);
            let bitmap = &page.data[RECORD_PAGE_HEADER_SIZE..][..hdr.bitmap_size as usize];
            let slot_no = bitmap::first_clear(bitmap, hdr.records_per_page as usize)
                .ok_or_else(|| DbError::Internal("free-list page has no free slot".into()))?;

            bitmap::set(
                &mut page.data[RECORD_PAGE_HEADER_SIZE..][..hdr.bitmap_size as usize],
                slot_no,
            );
            let offset = self.slot_offset(&hdr, slot_no);
            page.data[offset..offset + data.len()].copy_from_slice(data);
            page_hdr.num_records += 1;

            if page_hdr.num_records == hdr.records_per_page as i32 {
                // The page was the free-list head; advance the head past it.
                hdr.first_free_page = page_hdr.next_free_page;
                page_hdr.next_free_page = RM_NO_PAGE;
            }
            write_page_header(&mut page.data, &page_hdr);

            Rid {
                page_no,
                slot_no: slot_no as i32,
            }
        };

        if let Some(txn) = ctx.txn {
            if let Err(e) = ctx.lock_mgr.lock_exclusive_on_record(txn, rid, self.file_id) {
                // The slot was written but the transaction will never own it;
                // take the insert back before surfacing the abort.
                self.erase_slot(rid)?;
                return Err(e);
            }
        }
        Ok(rid)
    }

    /// Placement insert at an exact rid, used to undo a delete. Fails when
    /// the slot is occupied or out of range.
    pub fn insert_record_at(&self, ctx: &Context<'_>, rid: Rid, data: &[u8]) -> Result<()> {
        if let Some(txn) = ctx.txn {
            ctx.lock_mgr.lock_exclusive_on_record(txn, rid, self.file_id)?;
        }
        let mut hdr = self.hdr.lock().unwrap();
        self.check_rid(&hdr, rid)?;
        if rid.slot_no < 0 || rid.slot_no >= hdr.records_per_page as i32 {
            return Err(DbError::Internal(format!(
                "insert_record_at: slot {} out of range",
                rid.slot_no
            )));
        }
        if data.len() != hdr.record_size as usize {
            return Err(DbError::Internal(format!(
                "record length {} does not match record size {}",
                data.len(),
                hdr.record_size
            )));
        }

        let guard = self.bpm.fetch_page(PageId {
            file: self.file_id,
            page_no: rid.page_no,
        })?;
        let filled_with_next;
        {
            let mut page = guard.write();
            let mut page_hdr = read_page_header(&page.data);
            let bitmap = &mut page.data[RECORD_PAGE_HEADER_SIZE..][..hdr.bitmap_size as usize];
            if bitmap::is_set(bitmap, rid.slot_no as usize) {
                return Err(DbError::Internal(format!(
                    "insert_record_at: slot {} already occupied",
                    rid.slot_no
                )));
            }
            bitmap::set(bitmap, rid.slot_no as usize);
            let offset = self.slot_offset(&hdr, rid.slot_no as usize);
            page.data[offset..offset + data.len()].copy_from_slice(data);
            page_hdr.num_records += 1;
            if page_hdr.num_records == hdr.records_per_page as i32 {
                filled_with_next = Some(page_hdr.next_free_page);
                page_hdr.next_free_page = RM_NO_PAGE;
            } else {
                filled_with_next = None;
            }
            write_page_header(&mut page.data, &page_hdr);
        }
        drop(guard);

        if let Some(successor) = filled_with_next {
            self.unlink_full_page(&mut hdr, rid.page_no, successor)?;
        }
        Ok(())
    }

    /// Splices a page that just filled up out of the free list. The page is
    /// usually the head; otherwise its predecessor is found by walking.
    fn unlink_full_page(
        &self,
        hdr: &mut RecordFileHeader,
        page_no: PageNo,
        successor: PageNo,
    ) -> Result<()> {
        if hdr.first_free_page == page_no {
            hdr.first_free_page = successor;
            return Ok(());
        }
        let mut prev = hdr.first_free_page;
        while prev != RM_NO_PAGE {
            let guard = self.bpm.fetch_page(PageId {
                file: self.file_id,
                page_no: prev,
            })?;
            let mut prev_hdr = read_page_header(&guard.read().data);
            if prev_hdr.next_free_page == page_no {
                prev_hdr.next_free_page = successor;
                write_page_header(&mut guard.write().data, &prev_hdr);
                return Ok(());
            }
            prev = prev_hdr.next_free_page;
        }
        Ok(())
    }

    /// Overwrites the record at `rid` in place.
    pub fn update_record(&self, ctx: &Context<'_>, rid: Rid, data: &[u8]) -> Result<()> {
        if let Some(txn) = ctx.txn {
            ctx.lock_mgr.lock_exclusive_on_record(txn, rid, self.file_id)?;
        }
        let hdr = self.hdr.lock().unwrap();
        self.check_rid(&hdr, rid)?;
        if data.len() != hdr.record_size as usize {
            return Err(DbError::Internal(format!(
                "record length {} does not match record size {}",
                data.len(),
                hdr.record_size
            )));
        }

        let guard = self.bpm.fetch_page(PageId {
            file: self.file_id,
            page_no: rid.page_no,
        })?;
        let mut page = guard.write();
        let bitmap = &page.data[RECORD_PAGE_HEADER_SIZE..][..hdr.bitmap_size as usize];
        if rid.slot_no < 0
            || rid.slot_no >= hdr.records_per_page as i32
            || !bitmap::is_set(bitmap, rid.slot_no as usize)
        {
            return Err(DbError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let offset = self.slot_offset(&hdr, rid.slot_no as usize);
        page.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Deletes the record at `rid`, pushing the page onto the free list when
    /// it transitions from full to non-full.
    pub fn delete_record(&self, ctx: &Context<'_>, rid: Rid) -> Result<()> {
        if let Some(txn) = ctx.txn {
            ctx.lock_mgr.lock_exclusive_on_record(txn, rid, self.file_id)?;
        }
        self.erase_slot(rid)
    }

    fn erase_slot(&self, rid: Rid) -> Result<()> {
        let mut hdr = self.hdr.lock().unwrap();
        self.check_rid(&hdr, rid)?;

        let guard = self.bpm.fetch_page(PageId {
            file: self.file_id,
            page_no: rid.page_no,
        })?;
        let mut page = guard.write();
        let bitmap = &mut page.data[RECORD_PAGE_HEADER_SIZE..][..hdr.bitmap_size as usize];
        if rid.slot_no < 0
            || rid.slot_no >= hdr.records_per_page as i32
            || !bitmap::is_set(bitmap, rid.slot_no as usize)
        {
            return Err(DbError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        bitmap::clear(bitmap, rid.slot_no as usize);
        let offset = self.slot_offset(&hdr, rid.slot_no as usize);
        page.data[offset..offset + hdr.record_size as usize].fill(0);

        let mut page_hdr = read_page_header(&page.data);
        page_hdr.num_records -= 1;
        if page_hdr.num_records == hdr.records_per_page as i32 - 1 {
            // Full -> non-full: the page rejoins the free list at its head.
            page_hdr.next_free_page = hdr.first_free_page;
            hdr.first_free_page = rid.page_no;
        }
        write_page_header(&mut page.data, &page_hdr);
        Ok(())
    }

    pub fn scan(&self) -> Result<RecordScan<'_>> {
        let mut scan = RecordScan {
            file: self,
            rid: Rid {
                page_no: FIRST_RECORD_PAGE,
                slot_no: -1,
            },
        };
        scan.next()?;
        Ok(scan)
    }
}

/// Forward iterator over occupied `(page, slot)` positions. The end state is
/// `(num_pages, -1)`.
pub struct RecordScan<'a> {
    file: &'a RecordFile,
    rid: Rid,
}

impl RecordScan<'_> {
    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn is_end(&self) -> bool {
        let hdr = self.file.hdr.lock().unwrap();
        self.rid.page_no == hdr.num_pages && self.rid.slot_no == -1
    }

    /// Advances to the next occupied slot, or to the end state.
    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        let (num_pages, per_page, bitmap_size) = {
            let hdr = self.file.hdr.lock().unwrap();
            (
                hdr.num_pages,
                hdr.records_per_page as usize,
                hdr.bitmap_size as usize,
            )
        };

        let mut page_no = self.rid.page_no;
        while page_no < num_pages {
            let guard = self.file.bpm.fetch_page(PageId {
                file: self.file.file_id,
                page_no,
            })?;
            let page = guard.read();
            let bitmap = &page.data[RECORD_PAGE_HEADER_SIZE..][..bitmap_size];
            let from = if page_no == self.rid.page_no {
                (self.rid.slot_no + 1) as usize
            } else {
                0
            };
            if let Some(slot) = bitmap::next_set(bitmap, per_page, from) {
                self.rid = Rid {
                    page_no,
                    slot_no: slot as i32,
                };
                return Ok(());
            }
            page_no += 1;
        }

        self.rid = Rid {
            page_no: num_pages,
            slot_no: -1,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_manager::DiskManager;
    use crate::lock_manager::LockManager;
    use tempfile::tempdir;

    fn setup(record_size: usize) -> (tempfile::TempDir, Arc<BufferPoolManager>, RecordFile) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(Mutex::new(DiskManager::new()));
        let bpm = Arc::new(BufferPoolManager::new(disk, 16));
        let file =
            RecordFile::create(bpm.clone(), dir.path().join("t.tbl"), record_size).unwrap();
        (dir, bpm, file)
    }

    #[test]
    fn test_records_per_page_fits() {
        for size in [1, 8, 16, 100, 2000] {
            let n = records_per_page(size);
            assert!(n > 0);
            assert!(RECORD_PAGE_HEADER_SIZE + n.div_ceil(8) + n * size <= PAGE_SIZE);
        }
        // A 2000-byte record leaves room for exactly two slots per page.
        assert_eq!(records_per_page(2000), 2);
    }

    #[test]
    fn test_insert_get_delete_round_trip() {
        let (_dir, bpm, file) = setup(16);
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let data: Vec<u8> = (0u8..16).collect();
        let rid = file.insert_record(&ctx, &data).unwrap();
        assert_eq!(rid, Rid { page_no: 1, slot_no: 0 });
        assert_eq!(file.get_record(&ctx, rid).unwrap(), data);

        file.delete_record(&ctx, rid).unwrap();
        assert!(matches!(
            file.get_record(&ctx, rid),
            Err(DbError::RecordNotFound { .. })
        ));

        // No page pins may outlive the operations above.
        assert_eq!(bpm.pin_count(PageId { file: file.file_id(), page_no: 1 }), Some(0));
    }

    #[test]
    fn test_update_record() {
        let (_dir, _bpm, file) = setup(8);
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let rid = file.insert_record(&ctx, &[1u8; 8]).unwrap();
        file.update_record(&ctx, rid, &[9u8; 8]).unwrap();
        assert_eq!(file.get_record(&ctx, rid).unwrap(), vec![9u8; 8]);

        let missing = Rid { page_no: 1, slot_no: 5 };
        assert!(matches!(
            file.update_record(&ctx, missing, &[0u8; 8]),
            Err(DbError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn test_free_list_splicing() {
        // Two slots per page: four inserts fill two pages.
        let (_dir, _bpm, file) = setup(2000);
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let rec = vec![3u8; 2000];
        let rids: Vec<Rid> = (0..4)
            .map(|_| file.insert_record(&ctx, &rec).unwrap())
            .collect();
        assert_eq!(
            rids,
            vec![
                Rid { page_no: 1, slot_no: 0 },
                Rid { page_no: 1, slot_no: 1 },
                Rid { page_no: 2, slot_no: 0 },
                Rid { page_no: 2, slot_no: 1 },
            ]
        );
        // Both pages are full, so the free list is empty.
        assert_eq!(file.header().first_free_page, RM_NO_PAGE);

        file.delete_record(&ctx, rids[0]).unwrap();
        assert_eq!(file.header().first_free_page, 1);

        // The next insert reuses the freed slot at the head of the list.
        let rid = file.insert_record(&ctx, &rec).unwrap();
        assert_eq!(rid, Rid { page_no: 1, slot_no: 0 });
    }

    #[test]
    fn test_insert_record_at_restores_and_unlinks() {
        let (_dir, _bpm, file) = setup(2000);
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let rec = vec![5u8; 2000];
        let a = file.insert_record(&ctx, &rec).unwrap();
        let _b = file.insert_record(&ctx, &rec).unwrap();
        file.delete_record(&ctx, a).unwrap();

        // Restoring at the exact rid refills the page and empties the list.
        file.insert_record_at(&ctx, a, &rec).unwrap();
        assert_eq!(file.get_record(&ctx, a).unwrap(), rec);
        assert_eq!(file.header().first_free_page, RM_NO_PAGE);

        assert!(matches!(
            file.insert_record_at(&ctx, a, &rec),
            Err(DbError::Internal(_))
        ));
    }

    #[test]
    fn test_insert_record_at_walks_free_list_predecessor() {
        let (_dir, _bpm, file) = setup(2000);
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let rec = vec![6u8; 2000];
        let rids: Vec<Rid> = (0..6)
            .map(|_| file.insert_record(&ctx, &rec).unwrap())
            .collect();
        // Free one slot on page 3 and one on page 1: list is 1 -> 3.
        file.delete_record(&ctx, rids[4]).unwrap();
        file.delete_record(&ctx, rids[0]).unwrap();
        assert_eq!(file.header().first_free_page, 1);

        // Refill page 3 (not the head): the walk must splice it out.
        file.insert_record_at(&ctx, rids[4], &rec).unwrap();
        assert_eq!(file.header().first_free_page, 1);
        let rid = file.insert_record(&ctx, &rec).unwrap();
        assert_eq!(rid, rids[0]);
        assert_eq!(file.header().first_free_page, RM_NO_PAGE);
    }

    #[test]
    fn test_scan_visits_all_records_in_order() {
        let (_dir, _bpm, file) = setup(2000);
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let rec = vec![1u8; 2000];
        let rids: Vec<Rid> = (0..5)
            .map(|_| file.insert_record(&ctx, &rec).unwrap())
            .collect();
        file.delete_record(&ctx, rids[1]).unwrap();

        let mut seen = Vec::new();
        let mut scan = file.scan().unwrap();
        while !scan.is_end() {
            seen.push(scan.rid());
            scan.next().unwrap();
        }
        assert_eq!(seen, vec![rids[0], rids[2], rids[3], rids[4]]);

        // End state pins nothing and stays put.
        let end = scan.rid();
        scan.next().unwrap();
        assert_eq!(scan.rid(), end);
        assert_eq!(end.slot_no, -1);
    }

    #[test]
    fn test_get_record_bad_page_is_page_not_exist() {
        let (_dir, _bpm, file) = setup(16);
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);
        assert!(matches!(
            file.get_record(&ctx, Rid { page_no: 40, slot_no: 0 }),
            Err(DbError::PageNotExist { .. })
        ));
    }

    #[test]
    fn test_header_survives_reopen() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(Mutex::new(DiskManager::new()));
        let bpm = Arc::new(BufferPoolManager::new(disk, 16));
        let path = dir.path().join("re.tbl");
        let lm = LockManager::new();
        let ctx = Context::no_txn(&lm);

        let rid = {
            let file = RecordFile::create(bpm.clone(), &path, 32).unwrap();
            let rid = file.insert_record(&ctx, &[8u8; 32]).unwrap();
            file.sync_header().unwrap();
            bpm.flush_all_pages(file.file_id()).unwrap();
            rid
        };

        let file = RecordFile::open(bpm.clone(), &path).unwrap();
        assert_eq!(file.record_size(), 32);
        assert_eq!(file.get_record(&ctx, rid).unwrap(), vec![8u8; 32]);
    }
}
