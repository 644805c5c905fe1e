// Durable mapping layer: file/device mapping, pmem detection, flush/drain primitives.
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::core::error::{Error, ErrorKind, from_io};

pub const CACHE_LINE_SIZE: usize = 64;

/// Overrides pmem detection, normally driven by `PMEM_IS_PMEM_FORCE`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ForcePmem {
    #[default]
    Auto,
    AlwaysPmem,
    NeverPmem,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MapConfig {
    pub force: ForcePmem,
}

impl MapConfig {
    pub fn new(force: ForcePmem) -> Self {
        Self { force }
    }

    /// Reads `PMEM_IS_PMEM_FORCE` once; "1" forces pmem on, "0" forces it off,
    /// anything else leaves detection to the mapping probe.
    pub fn from_env() -> Self {
        let force = match std::env::var("PMEM_IS_PMEM_FORCE") {
            Ok(value) if value == "1" => ForcePmem::AlwaysPmem,
            Ok(value) if value == "0" => ForcePmem::NeverPmem,
            _ => ForcePmem::Auto,
        };
        Self { force }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapFlags {
    /// Map an existing file or device; `requested_len` must be zero for files.
    Open,
    /// Create the backing file exclusively, sized to `requested_len`.
    CreateExclusive,
}

/// A durably-mapped region backing exactly one pool.
///
/// When `is_pmem` reports true the mapping supports cache-line granular
/// durability (`flush` + `drain`); otherwise callers must go through `sync`,
/// which msyncs the range. `persist` picks the right path.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    is_pmem: bool,
}

impl MappedFile {
    pub fn map(
        path: impl AsRef<Path>,
        requested_len: u64,
        flags: MapFlags,
        mode: u32,
        config: &MapConfig,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.file_type().is_char_device() {
                return Self::map_device(path, requested_len, flags, meta.rdev());
            }
        }

        let (file, len) = match flags {
            MapFlags::CreateExclusive => {
                if requested_len == 0 {
                    return Err(Error::new(ErrorKind::InvalidArgument)
                        .with_path(path)
                        .with_message("creation requires a nonzero length"));
                }
                let file = OpenOptions::new()
                    .create_new(true)
                    .read(true)
                    .write(true)
                    .mode(mode)
                    .open(&path)
                    .map_err(|err| from_io(err, &path))?;
                file.set_len(requested_len)
                    .map_err(|err| from_io(err, &path))?;
                (file, requested_len)
            }
            MapFlags::Open => {
                if requested_len != 0 {
                    return Err(Error::new(ErrorKind::InvalidArgument)
                        .with_path(path)
                        .with_message("length must be zero when opening an existing file"));
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|err| from_io(err, &path))?;
                let len = file
                    .metadata()
                    .map(|meta| meta.len())
                    .map_err(|err| from_io(err, &path))?;
                (file, len)
            }
        };

        let mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(&file)
                .map_err(|err| from_io(err, &path))?
        };

        let is_pmem = match config.force {
            ForcePmem::AlwaysPmem => true,
            ForcePmem::NeverPmem => false,
            ForcePmem::Auto => probe_is_pmem(&file, len as usize),
        };

        debug!(path = %path.display(), len, is_pmem, "mapped pool file");
        Ok(Self {
            path,
            _file: file,
            mmap,
            is_pmem,
        })
    }

    pub fn create(
        path: impl AsRef<Path>,
        len: u64,
        mode: u32,
        config: &MapConfig,
    ) -> Result<Self, Error> {
        Self::map(path, len, MapFlags::CreateExclusive, mode, config)
    }

    pub fn open(path: impl AsRef<Path>, config: &MapConfig) -> Result<Self, Error> {
        Self::map(path, 0, MapFlags::Open, 0, config)
    }

    fn map_device(
        path: PathBuf,
        requested_len: u64,
        flags: MapFlags,
        rdev: u64,
    ) -> Result<Self, Error> {
        if flags != MapFlags::Open {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("create flags are not permitted for a device target"));
        }

        let len = device_dax_size(&path, rdev)?;
        if requested_len != 0 && requested_len != len {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message(format!(
                    "requested length {requested_len} does not match device size {len}"
                )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| from_io(err, &path))?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(&file)
                .map_err(|err| from_io(err, &path))?
        };

        // Device DAX is persistent memory by definition; the force override
        // does not apply here.
        debug!(path = %path.display(), len, "mapped device dax region");
        Ok(Self {
            path,
            _file: file,
            mmap,
            is_pmem: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Writes back the cache lines covering `[offset, offset + len)` without
    /// waiting for completion. A no-op on non-pmem mappings, where `sync` is
    /// the required substitute.
    pub fn flush(&self, offset: usize, len: usize) {
        debug_assert!(offset.checked_add(len).is_some_and(|end| end <= self.len()));
        if !self.is_pmem || len == 0 {
            return;
        }
        #[cfg(target_arch = "x86_64")]
        {
            let base = self.mmap.as_ptr();
            let mut line = offset & !(CACHE_LINE_SIZE - 1);
            while line < offset + len {
                unsafe { core::arch::x86_64::_mm_clflush(base.add(line)) };
                line += CACHE_LINE_SIZE;
            }
        }
    }

    /// Store fence ordering all previously flushed writes. Takes no range:
    /// it orders prior flushes, not a specific region.
    pub fn drain(&self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::x86_64::_mm_sfence()
        };
        #[cfg(not(target_arch = "x86_64"))]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// Full synchronization through the storage layer (msync).
    pub fn sync(&self, offset: usize, len: usize) -> Result<(), Error> {
        self.mmap
            .flush_range(offset, len)
            .map_err(|err| from_io(err, &self.path))
    }

    /// Makes `[offset, offset + len)` durable: flush + drain on pmem,
    /// msync otherwise.
    pub fn persist(&self, offset: usize, len: usize) -> Result<(), Error> {
        if self.is_pmem && cfg!(target_arch = "x86_64") {
            self.flush(offset, len);
            self.drain();
            return Ok(());
        }
        self.sync(offset, len)
    }
}

/// Probes whether the mapping behaves as true persistent memory. A mapping
/// accepted with MAP_SYNC guarantees cache-line durability semantics.
#[cfg(target_os = "linux")]
fn probe_is_pmem(file: &File, len: usize) -> bool {
    use std::os::unix::io::AsRawFd;

    if len == 0 {
        return false;
    }
    unsafe {
        let addr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC,
            file.as_raw_fd(),
            0,
        );
        if addr == libc::MAP_FAILED {
            return false;
        }
        libc::munmap(addr, len);
    }
    true
}

#[cfg(not(target_os = "linux"))]
fn probe_is_pmem(_file: &File, _len: usize) -> bool {
    false
}

/// Resolves the size of a device DAX region via sysfs, rejecting character
/// devices that are not DAX.
fn device_dax_size(path: &Path, rdev: u64) -> Result<u64, Error> {
    let major = libc::major(rdev);
    let minor = libc::minor(rdev);

    let subsystem = PathBuf::from(format!("/sys/dev/char/{major}:{minor}/subsystem"));
    let target = std::fs::read_link(&subsystem).map_err(|err| from_io(err, path))?;
    if target.file_name().and_then(|name| name.to_str()) != Some("dax") {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_path(path)
            .with_message("character device is not a dax device"));
    }

    let size_path = PathBuf::from(format!("/sys/dev/char/{major}:{minor}/size"));
    let raw = std::fs::read_to_string(&size_path).map_err(|err| from_io(err, path))?;
    raw.trim().parse::<u64>().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_path(path)
            .with_message("unparseable device dax size")
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{ForcePmem, MapConfig, MapFlags, MappedFile};
    use crate::core::error::ErrorKind;

    fn never_pmem() -> MapConfig {
        MapConfig::new(ForcePmem::NeverPmem)
    }

    #[test]
    fn create_exclusive_then_reopen_reports_extent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region");

        let mapped =
            MappedFile::create(&path, 1 << 20, 0o600, &never_pmem()).expect("create");
        assert_eq!(mapped.len(), 1 << 20);
        assert!(!mapped.is_pmem());
        drop(mapped);

        let reopened = MappedFile::open(&path, &never_pmem()).expect("open");
        assert_eq!(reopened.len(), 1 << 20);
    }

    #[test]
    fn create_fails_if_target_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region");
        MappedFile::create(&path, 4096, 0o600, &never_pmem()).expect("create");

        let err = MappedFile::create(&path, 4096, 0o600, &never_pmem()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn open_missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = MappedFile::open(dir.path().join("absent"), &never_pmem()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn open_with_nonzero_length_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region");
        MappedFile::create(&path, 4096, 0o600, &never_pmem()).expect("create");

        let err =
            MappedFile::map(&path, 4096, MapFlags::Open, 0, &never_pmem()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn create_with_zero_length_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = MappedFile::create(dir.path().join("region"), 0, 0o600, &never_pmem())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn forced_pmem_flush_drain_persist_are_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region");
        let config = MapConfig::new(ForcePmem::AlwaysPmem);

        let mut mapped = MappedFile::create(&path, 1 << 16, 0o600, &config).expect("create");
        assert!(mapped.is_pmem());

        mapped.as_mut_slice()[0..4].copy_from_slice(b"test");
        mapped.flush(0, 4);
        mapped.drain();
        mapped.persist(0, 4).expect("persist");
        assert_eq!(&mapped.as_slice()[0..4], b"test");
    }

    #[test]
    fn env_override_parses_recognized_values() {
        // Only value interpretation is covered here; the environment itself
        // is read once by callers via MapConfig::from_env.
        assert_eq!(MapConfig::default().force, ForcePmem::Auto);
        assert_eq!(
            MapConfig::new(ForcePmem::AlwaysPmem).force,
            ForcePmem::AlwaysPmem
        );
    }
}
