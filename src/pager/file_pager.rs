//! File-backed pager with a rollback journal.
//!
//! Before a page that existed at the start of a write transaction is
//! overwritten, its original image is appended to `<db>-journal`. Commit
//! deletes the journal; rollback, or opening a file whose journal survived a
//! crash, copies the original images back and truncates the file to its old
//! length.
//!
//! Journal layout:
//! ```text
//! header:  magic (8) | page size (4) | original page count (4) | crc32 (4)
//! record:  page number (4) | original page image | crc32 of both (4)
//! ```
//! Playback stops at the first torn or mismatching record.

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::pager::{FileHeader, FreeList, Pager, FILE_HEADER_LEN};
use crate::types::{is_valid_page_size, PageId};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

const JOURNAL_MAGIC: &[u8; 8] = b"SBTJRNL\0";
const JOURNAL_HEADER_LEN: usize = 20;

/// Path of the rollback journal that belongs to a database file
pub fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

/// State of an open write transaction
struct WriteTxn {
    /// Header as of `begin`
    header: FileHeader,
    /// Freelist as of `begin`
    free_list: FreeList,
    journal: Option<File>,
    /// Pages whose original image is already in the journal
    journaled: HashSet<PageId>,
    header_written: bool,
}

/// Pager over a single database file
pub struct FilePager {
    file: File,
    journal_path: PathBuf,
    header: FileHeader,
    free_list: FreeList,
    sync_on_commit: bool,
    data_version: u64,
    txn: Option<WriteTxn>,
}

impl FilePager {
    /// Open or create a database file.
    ///
    /// `page_size` is used only when the file is new; an existing file keeps
    /// the size recorded in its header.
    pub fn open(path: &Path, page_size: usize, sync_on_commit: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let journal_path = journal_path(path);
        if journal_path.exists() {
            recover_hot_journal(&mut file, &journal_path)?;
        }

        let len = file.metadata()?.len();
        let header = if len == 0 {
            if !is_valid_page_size(page_size) {
                return Err(StorageError::invalid_operation(format!(
                    "invalid page size {}",
                    page_size
                )));
            }
            let header = FileHeader::new(page_size);
            write_header_page(&mut file, &header)?;
            file.sync_all()?;
            debug!(path = %path.display(), page_size, "created database file");
            header
        } else if len < FILE_HEADER_LEN as u64 {
            return Err(StorageError::invalid_db("file too short for header"));
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            FileHeader::read(&buf)?
        };

        let free_list = load_free_list(&mut file, &header)?;
        debug!(
            path = %path.display(),
            page_size = header.page_size,
            page_count = header.page_count,
            free_pages = free_list.len(),
            "opened database file"
        );

        Ok(Self {
            file,
            journal_path,
            header,
            free_list,
            sync_on_commit,
            data_version: 1,
            txn: None,
        })
    }

    /// The in-memory file header
    pub fn header(&self) -> FileHeader {
        self.header
    }

    fn require_txn(&self) -> Result<()> {
        if self.txn.is_none() {
            return Err(StorageError::read_only("no write transaction is open"));
        }
        Ok(())
    }

    fn check_btree_page(&self, page_id: PageId) -> Result<()> {
        if !page_id.is_btree_page() {
            return Err(StorageError::invalid_operation(format!(
                "page {} is not a B-tree page",
                page_id
            )));
        }
        if page_id.value() >= self.header.page_count {
            return Err(StorageError::PageNotFound(page_id));
        }
        Ok(())
    }

    /// Append the original image of a page to the journal if it needs one
    fn journal_original(&mut self, page_id: PageId) -> Result<()> {
        let page_size = self.page_size();
        let Self {
            file,
            journal_path,
            txn,
            sync_on_commit,
            ..
        } = self;
        let Some(txn) = txn.as_mut() else {
            return Err(StorageError::read_only("no write transaction is open"));
        };

        if page_id.value() >= txn.header.page_count || txn.journaled.contains(&page_id) {
            return Ok(());
        }

        if txn.journal.is_none() {
            let mut journal = File::create(&*journal_path)?;
            let mut head = [0u8; JOURNAL_HEADER_LEN];
            head[0..8].copy_from_slice(JOURNAL_MAGIC);
            head[8..12].copy_from_slice(&txn.header.page_size.to_be_bytes());
            head[12..16].copy_from_slice(&txn.header.page_count.to_be_bytes());
            let crc = crc32fast::hash(&head[0..16]);
            head[16..20].copy_from_slice(&crc.to_be_bytes());
            journal.write_all(&head)?;
            txn.journal = Some(journal);
        }

        let original = read_raw(file, page_id, page_size)?;
        let pgno = page_id.value().to_be_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&pgno);
        hasher.update(&original);
        let crc = hasher.finalize();

        if let Some(journal) = txn.journal.as_mut() {
            journal.write_all(&pgno)?;
            journal.write_all(&original)?;
            journal.write_all(&crc.to_be_bytes())?;
            if *sync_on_commit {
                journal.sync_data()?;
            }
        }
        txn.journaled.insert(page_id);
        trace!(page = %page_id, "journaled original page");
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.journal_original(PageId::HEADER)?;
        write_header_page(&mut self.file, &self.header)
    }
}

impl Pager for FilePager {
    fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        if !is_valid_page_size(page_size) {
            return Err(StorageError::invalid_operation(format!(
                "invalid page size {}",
                page_size
            )));
        }
        if self.txn.is_some() {
            return Err(StorageError::invalid_operation(
                "cannot change page size inside a write transaction",
            ));
        }
        if self.header.page_count > 1 {
            return Err(StorageError::invalid_operation(
                "cannot change page size of a database that has pages",
            ));
        }

        let header = FileHeader {
            change_counter: self.header.change_counter,
            ..FileHeader::new(page_size)
        };
        self.file.set_len(0)?;
        write_header_page(&mut self.file, &header)?;
        self.file.sync_all()?;
        self.header = header;
        debug!(page_size, "database page size changed");
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.header.page_count
    }

    fn read_page(&mut self, page_id: PageId) -> Result<PageBuf> {
        self.check_btree_page(page_id)?;
        let page_size = self.page_size();
        trace!(page = %page_id, "reading page");
        read_raw(&mut self.file, page_id, page_size)
    }

    fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Ok(());
        }
        self.txn = Some(WriteTxn {
            header: self.header,
            free_list: self.free_list.clone(),
            journal: None,
            journaled: HashSet::new(),
            header_written: false,
        });
        debug!(page_count = self.header.page_count, "pager write transaction started");
        Ok(())
    }

    fn in_write(&self) -> bool {
        self.txn.is_some()
    }

    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.require_txn()?;
        self.check_btree_page(page_id)?;
        if data.len() != self.page_size() {
            return Err(StorageError::invalid_operation(format!(
                "page data must be {} bytes, got {}",
                self.page_size(),
                data.len()
            )));
        }

        self.journal_original(page_id)?;

        let offset = page_id.file_offset(self.page_size());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        if let Some(txn) = self.txn.as_mut() {
            txn.header_written = false;
        }
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<PageId> {
        self.require_txn()?;
        let page_id = match self.free_list.pop() {
            Some(page_id) => {
                self.header.first_free_page = self.free_list.head();
                self.header.free_page_count = self.free_list.len() as u32;
                page_id
            }
            None => self.header.allocate_page(),
        };
        trace!(page = %page_id, "allocated page");
        Ok(page_id)
    }

    fn free_page(&mut self, page_id: PageId) -> Result<()> {
        self.require_txn()?;
        self.check_btree_page(page_id)?;
        if self.free_list.contains(page_id) {
            return Err(StorageError::corruption(format!(
                "page {} freed twice",
                page_id
            )));
        }

        let image = FreeList::encode_link(self.free_list.head(), self.page_size());
        self.write_page(page_id, &image)?;
        self.free_list.push(page_id);
        self.header.first_free_page = page_id;
        self.header.free_page_count = self.free_list.len() as u32;
        trace!(page = %page_id, "freed page");
        Ok(())
    }

    fn free_page_count(&self) -> u32 {
        self.header.free_page_count
    }

    fn commit_phase_one(&mut self) -> Result<()> {
        let Some(txn) = self.txn.as_ref() else {
            return Ok(());
        };
        if txn.header_written {
            return Ok(());
        }
        if txn.journal.is_some() || self.header != txn.header {
            self.header.change_counter = self.header.change_counter.wrapping_add(1);
            self.write_header()?;
        }
        if let Some(txn) = self.txn.as_mut() {
            txn.header_written = true;
        }
        Ok(())
    }

    fn commit_phase_two(&mut self) -> Result<()> {
        if self.txn.is_none() {
            return Ok(());
        }
        // Counted before any step that can fail
        self.data_version += 1;
        self.commit_phase_one()?;
        if self.sync_on_commit {
            self.file.sync_all()?;
        }

        if let Some(txn) = self.txn.take() {
            if txn.journal.is_some() {
                drop(txn.journal);
                fs::remove_file(&self.journal_path)?;
            }
        }
        debug!(
            page_count = self.header.page_count,
            change_counter = self.header.change_counter,
            "pager commit finished"
        );
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };

        let page_size = txn.header.page_size as u64;
        if txn.journal.is_some() {
            drop(txn.journal);
            play_back_journal(&mut self.file, &self.journal_path)?;
        }
        self.file
            .set_len(u64::from(txn.header.page_count) * page_size)?;
        self.file.sync_all()?;
        if self.journal_path.exists() {
            fs::remove_file(&self.journal_path)?;
        }

        self.header = txn.header;
        self.free_list = txn.free_list;
        debug!(page_count = self.header.page_count, "pager rolled back");
        Ok(())
    }

    fn data_version(&self) -> u64 {
        self.data_version
    }
}

fn read_raw(file: &mut File, page_id: PageId, page_size: usize) -> Result<PageBuf> {
    let mut buf = PageBuf::new(page_size);
    file.seek(SeekFrom::Start(page_id.file_offset(page_size)))?;

    // Pages allocated but never written read back as zeros
    let mut filled = 0;
    while filled < page_size {
        let n = file.read(&mut buf.as_bytes_mut()[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf)
}

fn write_header_page(file: &mut File, header: &FileHeader) -> Result<()> {
    let mut page = vec![0u8; header.page_size as usize];
    header.write(&mut page);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&page)?;
    Ok(())
}

/// Walk the on-disk freelist chain
fn load_free_list(file: &mut File, header: &FileHeader) -> Result<FreeList> {
    let page_size = header.page_size as usize;
    let mut chain = Vec::with_capacity(header.free_page_count as usize);
    let mut next = header.first_free_page;

    for _ in 0..header.free_page_count {
        if !next.is_btree_page() || next.value() >= header.page_count {
            return Err(StorageError::corruption(format!(
                "freelist points at page {}",
                next
            )));
        }
        let image = read_raw(file, next, page_size)?;
        chain.push(next);
        next = FreeList::decode_link(&image).ok_or_else(|| {
            StorageError::corruption(format!("page {} on freelist is not free", next))
        })?;
    }

    Ok(FreeList::from_chain(chain))
}

/// Copy original images from a journal back into the database file.
///
/// Returns the page count recorded in the journal header, or `None` when the
/// header itself is torn (nothing was written to the database yet).
fn play_back_journal(file: &mut File, journal_path: &Path) -> Result<Option<u32>> {
    let journal = fs::read(journal_path)?;
    if journal.len() < JOURNAL_HEADER_LEN || &journal[0..8] != JOURNAL_MAGIC {
        return Ok(None);
    }
    let word = |at: usize| {
        u32::from_be_bytes([journal[at], journal[at + 1], journal[at + 2], journal[at + 3]])
    };
    if word(16) != crc32fast::hash(&journal[0..16]) {
        return Ok(None);
    }
    let page_size = word(8) as usize;
    let page_count = word(12);
    if !is_valid_page_size(page_size) {
        return Err(StorageError::corruption("journal page size is invalid"));
    }

    let record_len = 4 + page_size + 4;
    let mut restored = 0usize;
    let mut offset = JOURNAL_HEADER_LEN;
    while offset + record_len <= journal.len() {
        let record = &journal[offset..offset + record_len];
        let image = &record[4..4 + page_size];
        let stored = u32::from_be_bytes([
            record[4 + page_size],
            record[5 + page_size],
            record[6 + page_size],
            record[7 + page_size],
        ]);
        if stored != crc32fast::hash(&record[..4 + page_size]) {
            break;
        }
        let page_id = PageId::new(u32::from_be_bytes([record[0], record[1], record[2], record[3]]));
        file.seek(SeekFrom::Start(page_id.file_offset(page_size)))?;
        file.write_all(image)?;
        restored += 1;
        offset += record_len;
    }

    file.sync_all()?;
    debug!(pages = restored, page_count, "journal played back");
    Ok(Some(page_count))
}

fn recover_hot_journal(file: &mut File, journal_path: &Path) -> Result<()> {
    warn!(journal = %journal_path.display(), "hot journal found, rolling back");
    if let Some(page_count) = play_back_journal(file, journal_path)? {
        let mut head = [0u8; FILE_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head)?;
        let header = FileHeader::read(&head)?;
        file.set_len(u64::from(page_count) * u64::from(header.page_size))?;
        file.sync_all()?;
    }
    fs::remove_file(journal_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page_with(page_size: usize, byte: u8) -> Vec<u8> {
        vec![byte; page_size]
    }

    #[test]
    fn test_create_new_database() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = FilePager::open(&path, 1024, false)?;
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.page_size(), 1024);
        assert_eq!(pager.free_page_count(), 0);
        assert!(!pager.in_write());

        Ok(())
    }

    #[test]
    fn test_write_requires_transaction() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut pager = FilePager::open(&dir.path().join("test.db"), 512, false)?;

        assert!(matches!(
            pager.allocate_page(),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(
            pager.read_page(PageId::HEADER),
            Err(StorageError::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_commit_and_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut pager = FilePager::open(&path, 512, true)?;
            pager.begin()?;
            let page_id = pager.allocate_page()?;
            assert_eq!(page_id, PageId::new(1));
            pager.write_page(page_id, &page_with(512, 7))?;
            pager.commit_phase_one()?;
            let before = pager.data_version();
            pager.commit_phase_two()?;
            assert_eq!(pager.data_version(), before + 1);
            assert!(!journal_path(&path).exists());
        }

        let mut pager = FilePager::open(&path, 4096, false)?;
        assert_eq!(pager.page_size(), 512);
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.header().change_counter, 1);
        assert!(pager.read_page(PageId::new(1))?.iter().all(|&b| b == 7));
        Ok(())
    }

    #[test]
    fn test_rollback_restores_pages_and_length() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut pager = FilePager::open(&path, 512, false)?;

        pager.begin()?;
        let page_id = pager.allocate_page()?;
        pager.write_page(page_id, &page_with(512, 1))?;
        pager.commit_phase_two()?;

        pager.begin()?;
        pager.write_page(page_id, &page_with(512, 2))?;
        let extra = pager.allocate_page()?;
        pager.write_page(extra, &page_with(512, 3))?;
        assert_eq!(pager.page_count(), 3);
        pager.rollback()?;

        assert_eq!(pager.page_count(), 2);
        assert!(pager.read_page(page_id)?.iter().all(|&b| b == 1));
        assert_eq!(std::fs::metadata(&path)?.len(), 2 * 512);
        assert!(!journal_path(&path).exists());
        Ok(())
    }

    #[test]
    fn test_hot_journal_is_played_back_on_open() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut pager = FilePager::open(&path, 512, true)?;
            pager.begin()?;
            let page_id = pager.allocate_page()?;
            pager.write_page(page_id, &page_with(512, 1))?;
            pager.commit_phase_two()?;

            // Crash in the middle of the next transaction
            pager.begin()?;
            pager.write_page(page_id, &page_with(512, 9))?;
            let grown = pager.allocate_page()?;
            pager.write_page(grown, &page_with(512, 9))?;
            pager.commit_phase_one()?;
            assert!(journal_path(&path).exists());
        }

        let mut pager = FilePager::open(&path, 512, false)?;
        assert!(!journal_path(&path).exists());
        assert_eq!(pager.page_count(), 2);
        assert!(pager.read_page(PageId::new(1))?.iter().all(|&b| b == 1));
        Ok(())
    }

    #[test]
    fn test_freelist_persists_and_is_reused() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut pager = FilePager::open(&path, 512, false)?;
            pager.begin()?;
            for _ in 0..3 {
                let page_id = pager.allocate_page()?;
                pager.write_page(page_id, &page_with(512, 0x0D))?;
            }
            pager.free_page(PageId::new(2))?;
            pager.free_page(PageId::new(3))?;
            assert!(pager.free_page(PageId::new(3)).is_err());
            pager.commit_phase_two()?;
        }

        let mut pager = FilePager::open(&path, 512, false)?;
        assert_eq!(pager.free_page_count(), 2);
        pager.begin()?;
        assert_eq!(pager.allocate_page()?, PageId::new(3));
        assert_eq!(pager.allocate_page()?, PageId::new(2));
        assert_eq!(pager.allocate_page()?, PageId::new(4));
        assert_eq!(pager.free_page_count(), 0);
        pager.rollback()?;
        assert_eq!(pager.free_page_count(), 2);
        Ok(())
    }

    #[test]
    fn test_set_page_size_only_when_empty() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut pager = FilePager::open(&path, 4096, false)?;

        pager.set_page_size(1024)?;
        assert_eq!(pager.page_size(), 1024);
        assert!(pager.set_page_size(1000).is_err());

        pager.begin()?;
        let page_id = pager.allocate_page()?;
        pager.write_page(page_id, &page_with(1024, 0x0D))?;
        pager.commit_phase_two()?;

        assert!(pager.set_page_size(2048).is_err());
        drop(pager);

        let pager = FilePager::open(&path, 4096, false)?;
        assert_eq!(pager.page_size(), 1024);
        Ok(())
    }
}
