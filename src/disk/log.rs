use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Segments are pre-sized to exactly this many bytes; a batch landing at or
/// past the end rolls over to a fresh segment.
pub const MAX_DATA_FILE_SIZE: u64 = 2_147_483_648;

/// `{k_len: u16, v_len: u16}`, little-endian, followed by key then value.
pub const RECORD_HEADER_SIZE: usize = 4;

fn data_filename(dir: &Path, id: u16) -> PathBuf {
    dir.join(format!("cheapis-dakv-{}.data", id))
}

/// Append-only record log split across numbered segment files.
///
/// Writes go to the current segment at `offset`; reads address any segment by
/// id. Old records are never reclaimed, which keeps every location the index
/// ever handed out valid for the lifetime of the store.
pub struct DataLog {
    dir: PathBuf,
    segments: HashMap<u16, File>,
    curr_id: u16,
    offset: u64,
    opened: bool,
    max_file_size: u64,
}

impl DataLog {
    /// Opens the log in `dir`. `cursor` is the persisted `(segment id,
    /// append offset)` of a previous run; all segments up to the id are
    /// reopened. `None` starts an empty log whose first segment is created
    /// lazily by `create_file_if_need`.
    pub fn open(dir: &Path, cursor: Option<(u16, u64)>) -> io::Result<DataLog> {
        DataLog::open_with_limit(dir, cursor, MAX_DATA_FILE_SIZE)
    }

    pub(crate) fn open_with_limit(
        dir: &Path,
        cursor: Option<(u16, u64)>,
        max_file_size: u64,
    ) -> io::Result<DataLog> {
        let mut log = DataLog {
            dir: dir.to_path_buf(),
            segments: HashMap::new(),
            curr_id: 0,
            offset: 0,
            opened: false,
            max_file_size,
        };
        if let Some((id, offset)) = cursor {
            for seg in 0..=id {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(data_filename(dir, seg))?;
                advise_random(&file);
                log.segments.insert(seg, file);
            }
            log.curr_id = id;
            log.offset = offset;
            log.opened = true;
        }
        Ok(log)
    }

    /// Rolls to a fresh segment when none is open yet or the current one has
    /// filled up. New segments are pre-truncated to the full segment size.
    pub fn create_file_if_need(&mut self) -> io::Result<()> {
        if self.opened && self.offset < self.max_file_size {
            return Ok(());
        }
        let id = if self.opened { self.curr_id + 1 } else { 0 };
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(data_filename(&self.dir, id))?;
        file.set_len(self.max_file_size)?;
        advise_random(&file);

        debug!("opened data segment {}", id);
        self.segments.insert(id, file);
        self.curr_id = id;
        self.offset = 0;
        self.opened = true;
        Ok(())
    }

    /// Appends a prepared batch to the current segment. A short or failed
    /// write is fatal to the store; the caller must not update the index
    /// unless this succeeds.
    pub fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let file = self.segment(self.curr_id)?;
        file.write_all_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    pub fn read_exact_at(&self, id: u16, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.segment(id)?.read_exact_at(buf, offset)
    }

    /// Asks the kernel to pull a record range into the page cache ahead of
    /// the synchronous read at execute time. Purely advisory.
    pub fn prefetch(&self, id: u16, offset: u64, len: usize) {
        if let Ok(file) = self.segment(id) {
            unsafe {
                libc::readahead(file.as_raw_fd(), offset as i64, len);
            }
        }
    }

    pub fn curr_id(&self) -> u16 {
        self.curr_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn segment(&self, id: u16) -> io::Result<&File> {
        self.segments.get(&id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("data segment {} is not open", id),
            )
        })
    }
}

fn advise_random(file: &File) {
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_append_creates_segment_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DataLog::open(dir.path(), None).unwrap();

        log.create_file_if_need().unwrap();
        assert_eq!(log.curr_id(), 0);
        assert_eq!(log.offset(), 0);
        assert!(data_filename(dir.path(), 0).exists());

        log.append(b"\x03\x00\x03\x00foobar").unwrap();
        assert_eq!(log.offset(), 10);

        let mut buf = [0u8; 10];
        log.read_exact_at(0, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"\x03\x00\x03\x00foobar");
    }

    #[test]
    fn rollover_opens_next_segment_at_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DataLog::open_with_limit(dir.path(), None, 16).unwrap();

        log.create_file_if_need().unwrap();
        log.append(b"0123456789abcdefgh").unwrap();
        assert_eq!(log.curr_id(), 0);
        assert_eq!(log.offset(), 18);

        // past the cap: the next batch lands in segment 1 at offset 0
        log.create_file_if_need().unwrap();
        assert_eq!(log.curr_id(), 1);
        assert_eq!(log.offset(), 0);

        log.append(b"second").unwrap();
        let mut buf = [0u8; 6];
        log.read_exact_at(1, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"second");

        // segment 0 stays readable
        let mut buf = [0u8; 4];
        log.read_exact_at(0, &mut buf, 10).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn reopen_with_cursor_resumes_appends() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = {
            let mut log = DataLog::open_with_limit(dir.path(), None, 1024).unwrap();
            log.create_file_if_need().unwrap();
            log.append(b"before-restart").unwrap();
            (log.curr_id(), log.offset())
        };

        let mut log = DataLog::open_with_limit(dir.path(), Some(cursor), 1024).unwrap();
        assert_eq!(log.offset(), 14);
        log.append(b"-after").unwrap();

        let mut buf = [0u8; 20];
        log.read_exact_at(0, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"before-restart-after");
    }

    #[test]
    fn reading_an_unknown_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = DataLog::open(dir.path(), None).unwrap();
        let mut buf = [0u8; 1];
        assert!(log.read_exact_at(7, &mut buf, 0).is_err());
    }
}
