//! Page-aligned file I/O, file handle management, and per-file page allocation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{DbError, Result};
use crate::{FileId, PageNo, PAGE_SIZE};

struct OpenFile {
    file: File,
    path: PathBuf,
    /// Next page number to vend for this file. Writing past it advances it,
    /// so the allocator never hands out a page the file already contains.
    next_page_no: PageNo,
}

/// Owns every open file of the engine. Maintains a bidirectional map between
/// paths and integer file handles, a monotonic page-number allocator per
/// file, and the append-only log channel.
pub struct DiskManager {
    files: HashMap<FileId, OpenFile>,
    path_table: HashMap<PathBuf, FileId>,
    next_file_id: FileId,
    log_file: Option<File>,
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            path_table: HashMap::new(),
            next_file_id: 0,
            log_file: None,
        }
    }

    /// Creates an empty file. The path must not exist yet.
    pub fn create_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DbError::FileExists(path.to_path_buf()));
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(())
    }

    /// Removes a file from disk. Refuses while the file is in the open table.
    pub fn destroy_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if self.path_table.contains_key(path) {
            return Err(DbError::Internal(format!(
                "destroy_file: file is still open: {}",
                path.display()
            )));
        }
        if !path.exists() {
            return Err(DbError::FileNotFound(path.to_path_buf()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Opens a file and returns its handle. Re-opening an already open path
    /// returns the existing handle.
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> Result<FileId> {
        let path = path.as_ref();
        if let Some(&id) = self.path_table.get(path) {
            return Ok(id);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DbError::FileNotFound(path.to_path_buf())
                } else {
                    DbError::Io(e)
                }
            })?;

        let len = file.metadata()?.len();
        let next_page_no = (len / PAGE_SIZE as u64) as PageNo;
        crate::granite_debug_log!(
            "[DiskManager::open_file] {} len={len} next_page_no={next_page_no}",
            path.display()
        );

        let id = self.next_file_id;
        self.next_file_id += 1;
        self.files.insert(
            id,
            OpenFile {
                file,
                path: path.to_path_buf(),
                next_page_no,
            },
        );
        self.path_table.insert(path.to_path_buf(), id);
        Ok(id)
    }

    pub fn close_file(&mut self, id: FileId) -> Result<()> {
        let open = self.files.remove(&id).ok_or(DbError::FileNotOpen(id))?;
        self.path_table.remove(&open.path);
        open.file.sync_all()?;
        Ok(())
    }

    pub fn is_open<P: AsRef<Path>>(&self, path: P) -> bool {
        self.path_table.contains_key(path.as_ref())
    }

    pub fn path_of(&self, id: FileId) -> Result<PathBuf> {
        self.files
            .get(&id)
            .map(|f| f.path.clone())
            .ok_or(DbError::FileNotOpen(id))
    }

    pub fn id_of<P: AsRef<Path>>(&self, path: P) -> Option<FileId> {
        self.path_table.get(path.as_ref()).copied()
    }

    fn open(&mut self, id: FileId) -> Result<&mut OpenFile> {
        self.files.get_mut(&id).ok_or(DbError::FileNotOpen(id))
    }

    /// Reads one page into `buf`. A short transfer surfaces as an I/O error.
    pub fn read_page(&mut self, id: FileId, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        debug_assert!(buf.len() <= PAGE_SIZE);
        let open = self.open(id)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        open.file.seek(SeekFrom::Start(offset))?;
        open.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes one page. Writing at or past the allocation frontier advances
    /// the per-file page allocator.
    pub fn write_page(&mut self, id: FileId, page_no: PageNo, buf: &[u8]) -> Result<()> {
        debug_assert!(buf.len() <= PAGE_SIZE);
        let open = self.open(id)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        open.file.seek(SeekFrom::Start(offset))?;
        open.file.write_all(buf)?;
        if page_no >= open.next_page_no {
            open.next_page_no = page_no + 1;
        }
        Ok(())
    }

    /// Returns the next unused page number for the file and advances the
    /// counter. Does not grow the file; the caller writes to induce growth.
    pub fn allocate_page(&mut self, id: FileId) -> Result<PageNo> {
        let open = self.open(id)?;
        let page_no = open.next_page_no;
        open.next_page_no += 1;
        crate::granite_debug_log!("[DiskManager::allocate_page] file={id} page_no={page_no}");
        Ok(page_no)
    }

    pub fn sync_file(&mut self, id: FileId) -> Result<()> {
        self.open(id)?.file.sync_all()?;
        Ok(())
    }

    pub fn file_size<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        Ok(std::fs::metadata(path.as_ref())?.len())
    }

    /// Opens (or creates) the append-only log file.
    pub fn open_log<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path.as_ref())?;
        self.log_file = Some(file);
        Ok(())
    }

    pub fn append_log(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .log_file
            .as_mut()
            .ok_or_else(|| DbError::Internal("log file not open".into()))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn sync_log(&mut self) -> Result<()> {
        if let Some(file) = &self.log_file {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_page_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fid = dm.open_file(&path).unwrap();

        assert_eq!(dm.allocate_page(fid).unwrap(), 0);
        assert_eq!(dm.allocate_page(fid).unwrap(), 1);

        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(fid, 1, &page).unwrap();

        let mut back = [0u8; PAGE_SIZE];
        dm.read_page(fid, 1, &mut back).unwrap();
        assert_eq!(page[..], back[..]);
    }

    #[test]
    fn test_allocator_resumes_from_file_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.db");

        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fid = dm.open_file(&path).unwrap();
        let page = [7u8; PAGE_SIZE];
        dm.write_page(fid, 0, &page).unwrap();
        dm.write_page(fid, 1, &page).unwrap();
        dm.close_file(fid).unwrap();

        let fid = dm.open_file(&path).unwrap();
        assert_eq!(dm.allocate_page(fid).unwrap(), 2);
    }

    #[test]
    fn test_create_existing_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.db");

        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        assert!(matches!(
            dm.create_file(&path),
            Err(DbError::FileExists(_))
        ));
    }

    #[test]
    fn test_destroy_open_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy.db");

        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fid = dm.open_file(&path).unwrap();
        assert!(matches!(dm.destroy_file(&path), Err(DbError::Internal(_))));
        dm.close_file(fid).unwrap();
        dm.destroy_file(&path).unwrap();
        assert!(matches!(
            dm.destroy_file(&path),
            Err(DbError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_close_unknown_handle_fails() {
        let mut dm = DiskManager::new();
        assert!(matches!(dm.close_file(42), Err(DbError::FileNotOpen(42))));
    }

    #[test]
    fn test_reopen_returns_same_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("same.db");

        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let a = dm.open_file(&path).unwrap();
        let b = dm.open_file(&path).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_log_append() {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::new();
        dm.open_log(dir.path().join("granite.log")).unwrap();
        dm.append_log(b"hello").unwrap();
        dm.append_log(b" world").unwrap();
        dm.sync_log().unwrap();
        let data = std::fs::read(dir.path().join("granite.log")).unwrap();
        assert_eq!(data, b"hello world");
    }
}
