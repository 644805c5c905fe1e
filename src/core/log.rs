// Log pool engine: append-only byte stream with a durably persisted write
// cursor over a durable mapping.
//
// On-disk layout:
//   [0,    8192)  header: magic "PMEMLOG\0", pool_size, write_cursor
//   [8192, EOF )  flat payload region of `capacity` bytes
//
// Appends are all-or-nothing: the payload is persisted first, the cursor
// second, so a crash between the two leaves the old cursor and the append
// is simply not observable.
use std::path::Path;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::memcpy::{copy_nodrain, streamable};
use crate::core::pmem::{MapConfig, MappedFile};

const LOG_MAGIC: [u8; 8] = *b"PMEMLOG\0";
const LOG_HEADER_SIZE: usize = 8192;
const CURSOR_OFF: usize = 16;

/// Minimum total pool file size accepted by `create`.
pub const LOG_MIN_POOL: u64 = 2 * 1024 * 1024;

/// Tells `walk` whether to keep delivering chunks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkControl {
    Continue,
    Stop,
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Handle to an append-only persistent log pool. The write cursor survives
/// close and reopen; rewinding is the only way it moves backwards.
#[derive(Debug)]
pub struct LogPool {
    map: MappedFile,
    capacity: u64,
    cursor: u64,
}

impl LogPool {
    pub fn create(
        path: impl AsRef<Path>,
        pool_size: u64,
        mode: u32,
        config: &MapConfig,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        if pool_size < LOG_MIN_POOL {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message(format!("pool size below minimum {LOG_MIN_POOL}")));
        }

        let mut map = MappedFile::create(path, pool_size, mode, config)?;
        let header = &mut map.as_mut_slice()[..LOG_HEADER_SIZE];
        header[0..8].copy_from_slice(&LOG_MAGIC);
        write_u64(header, 8, pool_size);
        write_u64(header, CURSOR_OFF, 0);
        map.persist(0, LOG_HEADER_SIZE)?;

        let capacity = pool_size - LOG_HEADER_SIZE as u64;
        debug!(path = %path.display(), pool_size, capacity, "created log pool");
        Ok(Self {
            map,
            capacity,
            cursor: 0,
        })
    }

    pub fn open(path: impl AsRef<Path>, config: &MapConfig) -> Result<Self, Error> {
        let path = path.as_ref();
        let map = MappedFile::open(path, config)?;

        if map.len() < LOG_HEADER_SIZE || map.as_slice()[0..8] != LOG_MAGIC {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("not a log pool (bad magic)"));
        }
        let header = &map.as_slice()[..LOG_HEADER_SIZE];
        let pool_size = read_u64(header, 8);
        let cursor = read_u64(header, CURSOR_OFF);

        if pool_size != map.len() as u64 {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("header pool size does not match the file extent"));
        }
        let capacity = pool_size - LOG_HEADER_SIZE as u64;
        if cursor > capacity {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("persisted write cursor exceeds capacity"));
        }

        debug!(path = %path.display(), cursor, capacity, "opened log pool");
        Ok(Self {
            map,
            capacity,
            cursor,
        })
    }

    /// Bytes available for log payload: pool size minus the fixed header.
    pub fn nbyte(&self) -> u64 {
        self.capacity
    }

    /// Current append offset.
    pub fn tell(&self) -> u64 {
        self.cursor
    }

    pub fn is_pmem(&self) -> bool {
        self.map.is_pmem()
    }

    /// Appends `buf` at the write cursor. All-or-nothing: on `OutOfSpace`
    /// the cursor is untouched; on success the payload and the advanced
    /// cursor are both durable before returning.
    pub fn append(&mut self, buf: &[u8]) -> Result<(), Error> {
        let len = buf.len() as u64;
        if self.cursor.checked_add(len).is_none_or(|end| end > self.capacity) {
            return Err(Error::new(ErrorKind::OutOfSpace)
                .with_path(self.map.path())
                .with_offset(self.cursor)
                .with_message(format!(
                    "append of {len} bytes exceeds capacity {}",
                    self.capacity
                )));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let start = LOG_HEADER_SIZE + self.cursor as usize;
        let dst = &mut self.map.as_mut_slice()[start..start + buf.len()];
        if streamable(dst.as_ptr(), buf.as_ptr(), buf.len()) {
            copy_nodrain(dst, buf);
        } else {
            dst.copy_from_slice(buf);
        }
        self.map.persist(start, buf.len())?;

        let new_cursor = self.cursor + len;
        write_u64(self.map.as_mut_slice(), CURSOR_OFF, new_cursor);
        self.map.persist(CURSOR_OFF, 8)?;
        self.cursor = new_cursor;
        Ok(())
    }

    /// Resets the write cursor to zero without touching payload bytes.
    pub fn rewind(&mut self) -> Result<(), Error> {
        write_u64(self.map.as_mut_slice(), CURSOR_OFF, 0);
        self.map.persist(CURSOR_OFF, 8)?;
        self.cursor = 0;
        Ok(())
    }

    /// Visits the stored bytes from `start_offset` up to the write cursor.
    ///
    /// The whole written range is presented as a single chunk; appends do
    /// not record chunk boundaries. The callback may stop the walk early by
    /// returning `WalkControl::Stop`.
    pub fn walk(
        &self,
        start_offset: u64,
        mut callback: impl FnMut(&[u8]) -> WalkControl,
    ) -> Result<(), Error> {
        if start_offset > self.capacity {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(self.map.path())
                .with_offset(start_offset)
                .with_message("walk start offset exceeds capacity"));
        }
        if start_offset >= self.cursor {
            return Ok(());
        }

        let start = LOG_HEADER_SIZE + start_offset as usize;
        let end = LOG_HEADER_SIZE + self.cursor as usize;
        let _ = callback(&self.map.as_slice()[start..end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{LOG_HEADER_SIZE, LOG_MIN_POOL, LogPool, WalkControl};
    use crate::core::error::ErrorKind;
    use crate::core::pmem::{ForcePmem, MapConfig};

    fn config() -> MapConfig {
        MapConfig::new(ForcePmem::NeverPmem)
    }

    #[test]
    fn capacity_excludes_fixed_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = LogPool::create(dir.path().join("log"), LOG_MIN_POOL, 0o600, &config())
            .expect("create");
        assert_eq!(pool.nbyte(), LOG_MIN_POOL - LOG_HEADER_SIZE as u64);
        assert_eq!(pool.tell(), 0);
    }

    #[test]
    fn undersized_pool_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = LogPool::create(dir.path().join("log"), LOG_MIN_POOL - 1, 0o600, &config())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn walk_delivers_written_range_as_one_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pool = LogPool::create(dir.path().join("log"), LOG_MIN_POOL, 0o600, &config())
            .expect("create");
        pool.append(&[0xAB; 4096]).expect("append");
        pool.append(&[0xCD; 1024]).expect("append");

        let mut chunks = Vec::new();
        pool.walk(0, |chunk| {
            chunks.push(chunk.to_vec());
            WalkControl::Continue
        })
        .expect("walk");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 5120);
        assert!(chunks[0][..4096].iter().all(|&b| b == 0xAB));
        assert!(chunks[0][4096..].iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn walk_honors_start_offset_and_empty_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pool = LogPool::create(dir.path().join("log"), LOG_MIN_POOL, 0o600, &config())
            .expect("create");
        pool.append(b"0123456789").expect("append");

        let mut seen = Vec::new();
        pool.walk(4, |chunk| {
            seen.extend_from_slice(chunk);
            WalkControl::Stop
        })
        .expect("walk");
        assert_eq!(seen, b"456789");

        let mut called = false;
        pool.walk(10, |_| {
            called = true;
            WalkControl::Continue
        })
        .expect("walk");
        assert!(!called);
    }
}
