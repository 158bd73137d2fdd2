//! Manages the buffer pool, a collection of in-memory frames that cache disk
//! pages. A single latch serializes the frame table, free list, replacement
//! policy, and per-frame pin counts; page contents live behind per-frame
//! read-write locks so that guards can access bytes without the latch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::RwLock;

use crate::disk_manager::DiskManager;
use crate::errors::{DbError, Result};
use crate::replacer::{LruReplacer, Replacer};
use crate::{FileId, PageId, PAGE_SIZE};

/// A page image resident in a frame.
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    fn new(id: PageId) -> Self {
        Self {
            id,
            data: [0; PAGE_SIZE],
        }
    }
}

struct Frame {
    page: RwLock<Page>,
    dirty: AtomicBool,
}

#[derive(Clone, Copy)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
}

struct PoolState {
    page_table: HashMap<PageId, usize>,
    free_list: Vec<usize>,
    replacer: LruReplacer,
    meta: Vec<FrameMeta>,
}

/// The buffer pool manager.
pub struct BufferPoolManager {
    pub disk: Arc<Mutex<DiskManager>>,
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
}

/// An RAII pin on a page. `read`/`write` expose the page bytes; dropping the
/// guard unpins the frame and re-admits it to the replacement policy once the
/// pin count reaches zero.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame_idx: usize,
}

impl PageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Page> {
        self.bpm.frames[self.frame_idx].page.read()
    }

    /// Marks the frame dirty and returns write access to the page bytes.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Page> {
        self.bpm.frames[self.frame_idx].dirty.store(true, Ordering::Release);
        self.bpm.frames[self.frame_idx].page.write()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.bpm.unpin_frame(self.frame_idx);
    }
}

impl BufferPoolManager {
    pub fn new(disk: Arc<Mutex<DiskManager>>, pool_size: usize) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = Vec::with_capacity(pool_size);
        let mut meta = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(PageId { file: 0, page_no: 0 })),
                dirty: AtomicBool::new(false),
            }));
            // Pop order is irrelevant; reversed so frame 0 goes out first.
            free_list.push(pool_size - 1 - i);
            meta.push(FrameMeta {
                page_id: None,
                pin_count: 0,
            });
        }
        Self {
            disk,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(pool_size),
                meta,
            }),
        }
    }

    /// Returns a pinned guard for the page, reading it from disk on a miss.
    /// Fails without blocking when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock().unwrap();

        if let Some(&frame_idx) = state.page_table.get(&page_id) {
            state.meta[frame_idx].pin_count += 1;
            state.replacer.pin(frame_idx);
            return Ok(PageGuard {
                bpm: self,
                page_id,
                frame_idx,
            });
        }

        let frame_idx = self.find_victim(&mut state)?;
        self.evict(&mut state, frame_idx)?;

        let read_result = {
            let mut page = self.frames[frame_idx].page.write();
            page.id = page_id;
            self.disk
                .lock()
                .unwrap()
                .read_page(page_id.file, page_id.page_no, &mut page.data)
        };
        if let Err(e) = read_result {
            state.free_list.push(frame_idx);
            return Err(e);
        }
        self.frames[frame_idx].dirty.store(false, Ordering::Release);
        state.meta[frame_idx] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
        };
        state.page_table.insert(page_id, frame_idx);
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame_idx,
        })
    }

    /// Allocates a fresh page of `file` and returns it pinned and zeroed. New
    /// pages are born dirty so eviction always materializes them on disk.
    pub fn new_page(&self, file: FileId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock().unwrap();

        let frame_idx = self.find_victim(&mut state)?;
        self.evict(&mut state, frame_idx)?;

        let page_no = match self.disk.lock().unwrap().allocate_page(file) {
            Ok(page_no) => page_no,
            Err(e) => {
                state.free_list.push(frame_idx);
                return Err(e);
            }
        };
        let page_id = PageId { file, page_no };
        crate::granite_debug_log!("[BufferPool::new_page] allocated {page_id:?}");

        *self.frames[frame_idx].page.write() = Page::new(page_id);
        self.frames[frame_idx].dirty.store(true, Ordering::Release);
        state.meta[frame_idx] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
        };
        state.page_table.insert(page_id, frame_idx);
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame_idx,
        })
    }

    fn find_victim(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(frame_idx) = state.free_list.pop() {
            return Ok(frame_idx);
        }
        state
            .replacer
            .victim()
            .ok_or_else(|| DbError::Internal("buffer pool exhausted: all frames pinned".into()))
    }

    /// Detaches whatever page currently occupies the frame, writing it back
    /// first when dirty.
    fn evict(&self, state: &mut PoolState, frame_idx: usize) -> Result<()> {
        if let Some(old_id) = state.meta[frame_idx].page_id {
            debug_assert_eq!(state.meta[frame_idx].pin_count, 0);
            if self.frames[frame_idx].dirty.swap(false, Ordering::AcqRel) {
                let page = self.frames[frame_idx].page.read();
                crate::granite_debug_log!("[BufferPool::evict] writing back {old_id:?}");
                self.disk
                    .lock()
                    .unwrap()
                    .write_page(old_id.file, old_id.page_no, &page.data)?;
            }
            state.page_table.remove(&old_id);
            state.meta[frame_idx].page_id = None;
        }
        Ok(())
    }

    fn unpin_frame(&self, frame_idx: usize) {
        let mut state = self.state.lock().unwrap();
        let meta = &mut state.meta[frame_idx];
        debug_assert!(meta.pin_count > 0);
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
            if meta.pin_count == 0 {
                state.replacer.unpin(frame_idx);
            }
        }
    }

    /// Decrements the pin count of a resident page. Returns false when the
    /// page is not resident or already unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return false;
        };
        if state.meta[frame_idx].pin_count == 0 {
            return false;
        }
        if is_dirty {
            self.frames[frame_idx].dirty.store(true, Ordering::Release);
        }
        state.meta[frame_idx].pin_count -= 1;
        if state.meta[frame_idx].pin_count == 0 {
            state.replacer.unpin(frame_idx);
        }
        true
    }

    /// Writes a resident page back unconditionally and clears its dirty bit.
    /// Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = self.state.lock().unwrap();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let page = self.frames[frame_idx].page.read();
        self.disk
            .lock()
            .unwrap()
            .write_page(page_id.file, page_id.page_no, &page.data)?;
        self.frames[frame_idx].dirty.store(false, Ordering::Release);
        Ok(true)
    }

    /// Flushes every resident page belonging to `file`.
    pub fn flush_all_pages(&self, file: FileId) -> Result<()> {
        let state = self.state.lock().unwrap();
        let mut disk = self.disk.lock().unwrap();
        for (&page_id, &frame_idx) in state.page_table.iter() {
            if page_id.file != file {
                continue;
            }
            let page = self.frames[frame_idx].page.read();
            disk.write_page(page_id.file, page_id.page_no, &page.data)?;
            self.frames[frame_idx].dirty.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Drops a page from the pool, flushing it first. Returns true when the
    /// page is absent or successfully removed; false while it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.meta[frame_idx].pin_count > 0 {
            return Ok(false);
        }
        if self.frames[frame_idx].dirty.swap(false, Ordering::AcqRel) {
            let page = self.frames[frame_idx].page.read();
            self.disk
                .lock()
                .unwrap()
                .write_page(page_id.file, page_id.page_no, &page.data)?;
        }
        state.page_table.remove(&page_id);
        state.meta[frame_idx].page_id = None;
        state.replacer.pin(frame_idx);
        state.free_list.push(frame_idx);
        Ok(true)
    }

    /// Drops every resident page of `file` without writing anything back.
    /// Used when a file is being destroyed. Fails if any page is pinned.
    pub fn purge_pages(&self, file: FileId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let targets: Vec<(PageId, usize)> = state
            .page_table
            .iter()
            .filter(|(page_id, _)| page_id.file == file)
            .map(|(&page_id, &idx)| (page_id, idx))
            .collect();
        for (page_id, frame_idx) in targets {
            if state.meta[frame_idx].pin_count > 0 {
                return Err(DbError::Internal(format!(
                    "purge_pages: {page_id:?} is still pinned"
                )));
            }
            self.frames[frame_idx].dirty.store(false, Ordering::Release);
            state.page_table.remove(&page_id);
            state.meta[frame_idx].page_id = None;
            state.replacer.pin(frame_idx);
            state.free_list.push(frame_idx);
        }
        Ok(())
    }

    /// Current pin count of a resident page, if any. Used by tests to verify
    /// that every fetch is paired with exactly one unpin.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .page_table
            .get(&page_id)
            .map(|&idx| state.meta[idx].pin_count)
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(pool_size: usize) -> (tempfile::TempDir, Arc<BufferPoolManager>, FileId) {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::new();
        let path = dir.path().join("pool.db");
        dm.create_file(&path).unwrap();
        let fid = dm.open_file(&path).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(
            Arc::new(Mutex::new(dm)),
            pool_size,
        ));
        (dir, bpm, fid)
    }

    #[test]
    fn test_new_fetch_round_trip() {
        let (_dir, bpm, fid) = setup(4);

        let page_id = {
            let guard = bpm.new_page(fid).unwrap();
            guard.write().data[100] = 42;
            guard.page_id()
        };
        assert_eq!(bpm.pin_count(page_id), Some(0));

        let guard = bpm.fetch_page(page_id).unwrap();
        assert_eq!(guard.read().data[100], 42);
        assert_eq!(bpm.pin_count(page_id), Some(1));
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let (_dir, bpm, fid) = setup(2);

        let first = {
            let guard = bpm.new_page(fid).unwrap();
            guard.write().data[0] = 7;
            guard.page_id()
        };
        // Force the first page out of the two-frame pool.
        for _ in 0..2 {
            let _ = bpm.new_page(fid).unwrap();
        }
        assert_eq!(bpm.pin_count(first), None);

        let guard = bpm.fetch_page(first).unwrap();
        assert_eq!(guard.read().data[0], 7);
    }

    #[test]
    fn test_pool_exhaustion_is_an_error() {
        let (_dir, bpm, fid) = setup(2);

        let _a = bpm.new_page(fid).unwrap();
        let _b = bpm.new_page(fid).unwrap();
        assert!(matches!(bpm.new_page(fid), Err(DbError::Internal(_))));
    }

    #[test]
    fn test_unpin_page_contract() {
        let (_dir, bpm, fid) = setup(4);

        let page_id = bpm.new_page(fid).unwrap().page_id();
        // Guard already dropped: pin count is zero.
        assert!(!bpm.unpin_page(page_id, false));

        let guard = bpm.fetch_page(page_id).unwrap();
        let id = guard.page_id();
        std::mem::forget(guard);
        assert!(bpm.unpin_page(id, true));
        assert!(!bpm.unpin_page(id, false));
        assert!(!bpm.unpin_page(PageId { file: fid, page_no: 999 }, false));
    }

    #[test]
    fn test_delete_page_refuses_while_pinned() {
        let (_dir, bpm, fid) = setup(4);

        let guard = bpm.new_page(fid).unwrap();
        let page_id = guard.page_id();
        assert!(!bpm.delete_page(page_id).unwrap());
        drop(guard);
        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.pin_count(page_id), None);
        // Absent pages delete trivially.
        assert!(bpm.delete_page(page_id).unwrap());
    }

    #[test]
    fn test_flush_page_clears_dirty() {
        let (_dir, bpm, fid) = setup(4);

        let guard = bpm.new_page(fid).unwrap();
        let page_id = guard.page_id();
        guard.write().data[10] = 9;
        drop(guard);

        assert!(bpm.flush_page(page_id).unwrap());
        let disk = bpm.disk.clone();
        let mut buf = [0u8; PAGE_SIZE];
        disk.lock()
            .unwrap()
            .read_page(page_id.file, page_id.page_no, &mut buf)
            .unwrap();
        assert_eq!(buf[10], 9);
        assert!(!bpm.flush_page(PageId { file: fid, page_no: 77 }).unwrap());
    }

    #[test]
    fn test_pinned_pages_survive_pressure() {
        let (_dir, bpm, fid) = setup(3);

        let keep = bpm.new_page(fid).unwrap();
        keep.write().data[0] = 1;
        let keep_id = keep.page_id();

        // Churn the remaining two frames.
        for _ in 0..8 {
            let g = bpm.new_page(fid).unwrap();
            g.write().data[0] = 2;
        }

        assert_eq!(bpm.pin_count(keep_id), Some(1));
        assert_eq!(keep.read().data[0], 1);
    }
}
