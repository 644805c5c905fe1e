// Block pool engine: fixed-size blocks with per-block error flags and
// crash-atomic writes over a durable mapping.
//
// On-disk layout:
//   [0,      4096)  header: magic "PMEMBLK\0", block_size, pool_size
//   [4096,   4160)  transaction record: state u32, pad, block index u64
//   [4160,   ....)  shadow slot, one block rounded up to a cache line
//   [......, ....)  error-flag bitmap, one bit per block, 64-byte aligned
//   [data_off, EOF) block payload region
//
// A mutation stages the full new block in the shadow slot, persists a
// commit record, copies the shadow into place, then retires the record.
// An interruption at any point leaves the block either untouched or fully
// rewritten; open replays a committed-but-unretired record.
use std::path::Path;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::memcpy::{copy_nodrain, streamable};
use crate::core::pmem::{CACHE_LINE_SIZE, MapConfig, MappedFile};

const BLK_MAGIC: [u8; 8] = *b"PMEMBLK\0";
const BLK_HEADER_SIZE: usize = 4096;
const TXN_OFF: usize = BLK_HEADER_SIZE;
const TXN_RECORD_SIZE: usize = 64;

const TXN_IDLE: u32 = 0;
const TXN_COMMITTED: u32 = 1;

/// Minimum total pool file size accepted by `create`.
pub const BLK_MIN_POOL: u64 = 16 * 1024 * 1024;
/// Minimum block size accepted by `create`.
pub const BLK_MIN_BLK: u64 = 512;

/// Derived layout of a block pool. Deterministic in (block_size, pool_size),
/// so it is recomputed on open rather than persisted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Geometry {
    block_size: usize,
    nblock: u64,
    shadow_off: usize,
    bitmap_off: usize,
    data_off: usize,
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

fn compute_geometry(block_size: usize, pool_size: u64) -> Result<Geometry, Error> {
    let shadow_off = TXN_OFF + TXN_RECORD_SIZE;
    let shadow_len = round_up(block_size, CACHE_LINE_SIZE);
    let bitmap_off = shadow_off + shadow_len;

    if pool_size <= bitmap_off as u64 {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_message("pool size cannot accommodate the block pool layout"));
    }
    let usable = pool_size - bitmap_off as u64;

    // One error-flag bit rides along with every block, so solve
    //   bitmap + nblock * block_size <= usable
    // in bits and walk down past the bitmap's alignment padding.
    let mut nblock = (usable as u128 * 8 / (block_size as u128 * 8 + 1)) as u64;
    let bitmap_len = loop {
        let bitmap_len = round_up(nblock.div_ceil(8) as usize, CACHE_LINE_SIZE);
        if bitmap_len as u128 + nblock as u128 * block_size as u128 <= usable as u128 {
            break bitmap_len;
        }
        nblock -= 1;
    };

    if nblock < 256 {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_message("block size leaves fewer than 256 blocks in the pool"));
    }

    Ok(Geometry {
        block_size,
        nblock,
        shadow_off,
        bitmap_off,
        data_off: bitmap_off + bitmap_len,
    })
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Handle to a fixed-block-size persistent pool. Blocks are addressed by a
/// zero-based index; the handle exclusively owns its mapped region.
#[derive(Debug)]
pub struct BlkPool {
    map: MappedFile,
    geo: Geometry,
}

impl BlkPool {
    pub fn create(
        path: impl AsRef<Path>,
        block_size: u64,
        pool_size: u64,
        mode: u32,
        config: &MapConfig,
    ) -> Result<Self, Error> {
        let path = path.as_ref();

        if block_size == 0 || block_size > u32::MAX as u64 {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("block size must be a positive 32-bit value"));
        }
        if block_size < BLK_MIN_BLK {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message(format!("block size below minimum {BLK_MIN_BLK}")));
        }
        if block_size >= pool_size {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("block size must be smaller than the pool size"));
        }
        if pool_size < BLK_MIN_POOL {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message(format!("pool size below minimum {BLK_MIN_POOL}")));
        }

        let geo = compute_geometry(block_size as usize, pool_size)
            .map_err(|err| err.with_path(path))?;

        // The fresh file is zero-filled, so blocks, flags, and the
        // transaction record all start in their initial state.
        let mut map = MappedFile::create(path, pool_size, mode, config)?;

        let header = &mut map.as_mut_slice()[..BLK_HEADER_SIZE];
        header[0..8].copy_from_slice(&BLK_MAGIC);
        write_u64(header, 8, block_size);
        write_u64(header, 16, pool_size);
        map.persist(0, BLK_HEADER_SIZE)?;

        debug!(
            path = %path.display(),
            block_size,
            pool_size,
            nblock = geo.nblock,
            "created block pool"
        );
        Ok(Self { map, geo })
    }

    pub fn open(
        path: impl AsRef<Path>,
        expected_block_size: u64,
        config: &MapConfig,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let map = MappedFile::open(path, config)?;

        if map.len() < BLK_HEADER_SIZE || map.as_slice()[0..8] != BLK_MAGIC {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("not a block pool (bad magic)"));
        }
        let header = &map.as_slice()[..BLK_HEADER_SIZE];
        let block_size = read_u64(header, 8);
        let pool_size = read_u64(header, 16);

        if pool_size != map.len() as u64 {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("header pool size does not match the file extent"));
        }
        if block_size == 0 || block_size > u32::MAX as u64 || block_size >= pool_size {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message("corrupt block size in pool header"));
        }
        if expected_block_size != 0 && expected_block_size != block_size {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(path)
                .with_message(format!(
                    "block size mismatch (expected {expected_block_size}, pool has {block_size})"
                )));
        }

        let geo = compute_geometry(block_size as usize, pool_size)
            .map_err(|err| err.with_path(path))?;

        let mut pool = Self { map, geo };
        pool.recover()?;
        Ok(pool)
    }

    /// Replays an interrupted block write left in the committed state.
    fn recover(&mut self) -> Result<(), Error> {
        let record = &self.map.as_slice()[TXN_OFF..TXN_OFF + TXN_RECORD_SIZE];
        let state = read_u32(record, 0);
        let index = read_u64(record, 8);

        match state {
            TXN_IDLE => Ok(()),
            TXN_COMMITTED => {
                if index < self.geo.nblock {
                    self.apply_committed(index)?;
                    debug!(
                        path = %self.map.path().display(),
                        block = index,
                        "replayed interrupted block write"
                    );
                }
                self.retire_txn()
            }
            _ => Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(self.map.path())
                .with_message("corrupt block transaction record")),
        }
    }

    pub fn block_size(&self) -> usize {
        self.geo.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.geo.nblock
    }

    pub fn is_pmem(&self) -> bool {
        self.map.is_pmem()
    }

    fn check_index(&self, index: u64) -> Result<usize, Error> {
        if index >= self.geo.nblock {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(self.map.path())
                .with_block(index)
                .with_message("block index out of range"));
        }
        Ok(self.geo.data_off + index as usize * self.geo.block_size)
    }

    fn flag_location(&self, index: u64) -> (usize, u8) {
        let byte = self.geo.bitmap_off + (index / 8) as usize;
        let mask = 1u8 << (index % 8);
        (byte, mask)
    }

    fn error_flag(&self, index: u64) -> bool {
        let (byte, mask) = self.flag_location(index);
        self.map.as_slice()[byte] & mask != 0
    }

    /// Reads block `index` into `buf`, which must hold exactly one block.
    pub fn read_into(&self, index: u64, buf: &mut [u8]) -> Result<(), Error> {
        let block_off = self.check_index(index)?;
        if buf.len() != self.geo.block_size {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(self.map.path())
                .with_message("read buffer must be exactly one block"));
        }
        if self.error_flag(index) {
            return Err(Error::new(ErrorKind::Io)
                .with_path(self.map.path())
                .with_block(index)
                .with_message("block is marked in error"));
        }
        buf.copy_from_slice(&self.map.as_slice()[block_off..block_off + self.geo.block_size]);
        Ok(())
    }

    pub fn read(&self, index: u64) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; self.geo.block_size];
        self.read_into(index, &mut buf)?;
        Ok(buf)
    }

    /// Atomically replaces the block's full contents and clears its error
    /// flag. Either the whole block is rewritten or none of it is, even if
    /// the process dies mid-call.
    pub fn write(&mut self, buf: &[u8], index: u64) -> Result<(), Error> {
        self.check_index(index)?;
        if buf.len() != self.geo.block_size {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_path(self.map.path())
                .with_message("write buffer must be exactly one block"));
        }
        self.write_block(index, Some(buf))
    }

    /// Atomically fills the block with zeroes and clears its error flag.
    pub fn set_zero(&mut self, index: u64) -> Result<(), Error> {
        self.check_index(index)?;
        self.write_block(index, None)
    }

    /// Marks the block's error flag without altering its data. Reads fail
    /// with `Io` until the next `write` or `set_zero`.
    pub fn set_error(&mut self, index: u64) -> Result<(), Error> {
        self.check_index(index)?;
        let (byte, mask) = self.flag_location(index);
        self.map.as_mut_slice()[byte] |= mask;
        self.map.persist(byte, 1)
    }

    fn write_block(&mut self, index: u64, payload: Option<&[u8]>) -> Result<(), Error> {
        let block_size = self.geo.block_size;
        let shadow_off = self.geo.shadow_off;

        // Stage the new contents in the shadow slot.
        {
            let shadow = &mut self.map.as_mut_slice()[shadow_off..shadow_off + block_size];
            match payload {
                Some(buf) if streamable(shadow.as_ptr(), buf.as_ptr(), block_size) => {
                    copy_nodrain(shadow, buf);
                }
                Some(buf) => shadow.copy_from_slice(buf),
                None => shadow.fill(0),
            }
        }
        self.map.persist(shadow_off, block_size)?;

        // Commit: record the target index, then flip the state. The block is
        // logically rewritten the moment the committed state is durable.
        let record = &mut self.map.as_mut_slice()[TXN_OFF..TXN_OFF + TXN_RECORD_SIZE];
        write_u64(record, 8, index);
        self.map.persist(TXN_OFF + 8, 8)?;
        let record = &mut self.map.as_mut_slice()[TXN_OFF..TXN_OFF + TXN_RECORD_SIZE];
        write_u32(record, 0, TXN_COMMITTED);
        self.map.persist(TXN_OFF, 4)?;

        self.apply_committed(index)?;
        self.retire_txn()
    }

    /// Copies the staged shadow into its target block and clears the error
    /// flag. Idempotent, so recovery may repeat it.
    fn apply_committed(&mut self, index: u64) -> Result<(), Error> {
        let block_size = self.geo.block_size;
        let shadow_off = self.geo.shadow_off;
        let block_off = self.geo.data_off + index as usize * block_size;

        self.map
            .as_mut_slice()
            .copy_within(shadow_off..shadow_off + block_size, block_off);
        self.map.persist(block_off, block_size)?;

        let (byte, mask) = self.flag_location(index);
        self.map.as_mut_slice()[byte] &= !mask;
        self.map.persist(byte, 1)
    }

    fn retire_txn(&mut self) -> Result<(), Error> {
        let record = &mut self.map.as_mut_slice()[TXN_OFF..TXN_OFF + TXN_RECORD_SIZE];
        write_u32(record, 0, TXN_IDLE);
        self.map.persist(TXN_OFF, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::{BLK_MIN_BLK, BLK_MIN_POOL, compute_geometry};

    #[test]
    fn minimum_pool_yields_at_least_256_blocks() {
        let geo = compute_geometry(BLK_MIN_BLK as usize, BLK_MIN_POOL).expect("geometry");
        assert!(geo.nblock >= 256);
        assert!(geo.nblock * BLK_MIN_BLK < BLK_MIN_POOL);
        assert!(geo.data_off as u64 + geo.nblock * BLK_MIN_BLK <= BLK_MIN_POOL);
    }

    #[test]
    fn geometry_accounts_for_bitmap_and_shadow() {
        let geo = compute_geometry(8192, BLK_MIN_POOL).expect("geometry");
        assert!(geo.shadow_off > 4096);
        assert!(geo.bitmap_off >= geo.shadow_off + 8192);
        assert!(geo.data_off > geo.bitmap_off);
        assert_eq!(geo.data_off % 64, 0);
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        // A block size this large cannot leave 256 blocks in a minimum pool.
        let err = compute_geometry(1 << 20, BLK_MIN_POOL).unwrap_err();
        assert_eq!(
            err.kind(),
            crate::core::error::ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn geometry_is_deterministic() {
        let a = compute_geometry(512, 64 * 1024 * 1024).expect("geometry");
        let b = compute_geometry(512, 64 * 1024 * 1024).expect("geometry");
        assert_eq!(a, b);
    }
}
