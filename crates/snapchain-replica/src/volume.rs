//! Block dispatch across the active chain.
//!
//! [`Volume`] holds one open handle per active layer (root first, head last),
//! the optional backing image and the block location cache. The cache maps
//! every block to the newest layer holding it so a read touches exactly one
//! file.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{ReplicaError, ReplicaResult};
use crate::lun::LunGenerator;
use crate::sparse::SparseFile;

/// Cache value for a block no layer holds: read from the backing image or zeros.
pub const LOCATION_NONE: u16 = 0;
/// Cache value for a block whose owner is not known yet.
pub const LOCATION_UNRESOLVED: u16 = u16::MAX;

/// Read-only base image beneath the chain root.
#[derive(Debug, Clone)]
pub struct BackingFile {
    /// Name recorded in `volume.meta`.
    pub name: String,
    /// The image; bytes past its end read as zeros.
    pub disk: Arc<dyn SparseFile>,
}

/// The active layers of a replica and the block location cache.
#[derive(Debug)]
pub struct Volume {
    size: u64,
    block_size: u64,
    layers: Vec<Arc<dyn SparseFile>>,
    backing: Option<BackingFile>,
    location: Vec<AtomicU16>,
}

impl Volume {
    /// Creates a volume with no layers and every block unresolved.
    pub fn new(size: u64, block_size: u64, backing: Option<BackingFile>) -> Self {
        let blocks = (size / block_size) as usize;
        Self {
            size,
            block_size,
            layers: Vec::new(),
            backing,
            location: (0..blocks).map(|_| AtomicU16::new(LOCATION_UNRESOLVED)).collect(),
        }
    }

    /// Volume size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Active layers, root first.
    pub fn layers(&self) -> &[Arc<dyn SparseFile>] {
        &self.layers
    }

    /// The backing image, if any.
    pub fn backing(&self) -> Option<&BackingFile> {
        self.backing.as_ref()
    }

    /// Appends a new head layer.
    pub fn push_layer(&mut self, layer: Arc<dyn SparseFile>) -> ReplicaResult<()> {
        if self.layers.len() + 1 >= LOCATION_UNRESOLVED as usize {
            return Err(ReplicaError::InvalidConfig {
                reason: format!("chain longer than {} layers", LOCATION_UNRESOLVED - 1),
            });
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Swaps the handle at `index` without touching the cache.
    pub fn replace_layer(&mut self, index: usize, layer: Arc<dyn SparseFile>) {
        self.layers[index] = layer;
    }

    /// Drops the layer at `index`; every cached location becomes unresolved.
    pub fn remove_layer(&mut self, index: usize) -> Arc<dyn SparseFile> {
        let layer = self.layers.remove(index);
        self.invalidate();
        layer
    }

    /// Grows the block range to cover `size` bytes; new blocks have no owner.
    pub fn resize(&mut self, size: u64) -> ReplicaResult<()> {
        if size < self.size || size % self.block_size != 0 {
            return Err(ReplicaError::InvalidConfig {
                reason: format!("cannot resize volume from {} to {} bytes", self.size, size),
            });
        }
        let blocks = (size / self.block_size) as usize;
        self.location
            .resize_with(blocks, || AtomicU16::new(LOCATION_NONE));
        debug!(from = self.size, to = size, blocks, "volume resized");
        self.size = size;
        Ok(())
    }

    /// Marks every block unresolved.
    pub fn invalidate(&self) {
        for slot in &self.location {
            slot.store(LOCATION_UNRESOLVED, Ordering::Release);
        }
    }

    /// Fills the cache from the data extents of every layer, root to head.
    pub fn preload(&self) -> ReplicaResult<()> {
        for slot in &self.location {
            slot.store(LOCATION_NONE, Ordering::Relaxed);
        }
        for (index, layer) in self.layers.iter().enumerate() {
            let tag = (index + 1) as u16;
            for block in LunGenerator::new(layer.as_ref(), self.block_size).generate() {
                let block = block? as usize;
                if let Some(slot) = self.location.get(block) {
                    slot.store(tag, Ordering::Relaxed);
                }
            }
        }
        debug!(layers = self.layers.len(), blocks = self.location.len(), "location cache preloaded");
        Ok(())
    }

    /// Copy of the location cache.
    pub fn location(&self) -> Vec<u16> {
        self.location
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect()
    }

    /// Layer holding `block`: `Some(index)` into [`Self::layers`], `None` for none.
    pub fn owner(&self, block: u64) -> ReplicaResult<Option<usize>> {
        let tag = self.resolve(block)?;
        Ok((tag != LOCATION_NONE).then(|| tag as usize - 1))
    }

    fn resolve(&self, block: u64) -> ReplicaResult<u16> {
        let slot = &self.location[block as usize];
        let cached = slot.load(Ordering::Acquire);
        if cached != LOCATION_UNRESOLVED {
            return Ok(cached);
        }
        let offset = block * self.block_size;
        let mut tag = LOCATION_NONE;
        for (index, layer) in self.layers.iter().enumerate().rev() {
            if layer.has_data(offset, self.block_size)? {
                tag = (index + 1) as u16;
                break;
            }
        }
        trace!(block, tag, "location resolved");
        // A concurrent writer may have claimed the block for the head already.
        let _ = slot.compare_exchange(LOCATION_UNRESOLVED, tag, Ordering::AcqRel, Ordering::Acquire);
        Ok(slot.load(Ordering::Acquire))
    }

    fn check_range(&self, offset: u64, len: usize) -> ReplicaResult<()> {
        let len = len as u64;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ReplicaError::OutOfRange {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn read_block(&self, block: u64, within: u64, buf: &mut [u8]) -> ReplicaResult<()> {
        let offset = block * self.block_size + within;
        match self.resolve(block)? {
            LOCATION_NONE => match &self.backing {
                Some(backing) => backing.disk.read_full_at(buf, offset)?,
                None => buf.fill(0),
            },
            tag => self.layers[tag as usize - 1].read_full_at(buf, offset)?,
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset` through the chain.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> ReplicaResult<usize> {
        self.check_range(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / self.block_size;
            let within = pos % self.block_size;
            let n = ((self.block_size - within) as usize).min(buf.len() - done);
            self.read_block(block, within, &mut buf[done..done + n])
                .map_err(|e| partial(done, e))?;
            done += n;
        }
        Ok(done)
    }

    /// Writes `buf` at `offset` into the head layer.
    ///
    /// A partial block the head does not hold yet is first filled from the
    /// chain. `shadowed` is called with `(layer index, block)` for every block
    /// an older layer held before this write.
    pub fn write_at<F>(&self, buf: &[u8], offset: u64, mut shadowed: F) -> ReplicaResult<usize>
    where
        F: FnMut(usize, u64),
    {
        self.check_range(offset, buf.len())?;
        let head_index = self
            .layers
            .len()
            .checked_sub(1)
            .ok_or_else(|| ReplicaError::corruption("volume has no head layer"))?;
        let head = &self.layers[head_index];
        let head_tag = (head_index + 1) as u16;
        let bs = self.block_size as usize;

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / self.block_size;
            let within = (pos % self.block_size) as usize;
            let n = (bs - within).min(buf.len() - done);
            let chunk = &buf[done..done + n];

            let step = || -> ReplicaResult<u16> {
                let previous = self.resolve(block)?;
                if n == bs || previous == head_tag {
                    head.write_full_at(chunk, pos)?;
                } else {
                    let mut merged = vec![0u8; bs];
                    self.read_block(block, 0, &mut merged)?;
                    merged[within..within + n].copy_from_slice(chunk);
                    head.write_full_at(&merged, block * self.block_size)?;
                }
                Ok(previous)
            };
            let previous = step().map_err(|e| partial(done, e))?;
            self.location[block as usize].store(head_tag, Ordering::Release);
            if previous != LOCATION_NONE && previous != head_tag {
                shadowed(previous as usize - 1, block);
            }
            done += n;
        }
        Ok(done)
    }

    /// Flushes every writable layer.
    pub fn sync(&self) -> ReplicaResult<()> {
        for layer in &self.layers {
            layer.sync()?;
        }
        Ok(())
    }
}

fn partial(completed: usize, err: ReplicaError) -> ReplicaError {
    match err {
        ReplicaError::IoError(source) => ReplicaError::PartialIo { completed, source },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::MemFile;

    const BS: u64 = 4;

    fn volume(layers: usize, blocks: u64) -> Volume {
        let mut v = Volume::new(blocks * BS, BS, None);
        for _ in 0..layers {
            v.push_layer(Arc::new(MemFile::new(blocks * BS, BS))).unwrap();
        }
        v
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let v = volume(1, 4);
        let mut buf = vec![0xFFu8; 16];
        assert_eq!(v.read_at(&mut buf, 0).unwrap(), 16);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(v.location(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_read_prefers_newest_layer() {
        let v = volume(2, 4);
        v.layers()[0].write_full_at(&[1; 8], 0).unwrap();
        v.layers()[1].write_full_at(&[2; 4], 4).unwrap();
        v.preload().unwrap();
        assert_eq!(v.location(), vec![1, 2, 0, 0]);

        let mut buf = vec![0u8; 8];
        v.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_unresolved_walks_chain() {
        let v = volume(3, 2);
        v.layers()[1].write_full_at(&[5; 4], 4).unwrap();
        v.invalidate();
        assert_eq!(v.location(), vec![LOCATION_UNRESOLVED, LOCATION_UNRESOLVED]);
        assert_eq!(v.owner(1).unwrap(), Some(1));
        assert_eq!(v.owner(0).unwrap(), None);
        assert_eq!(v.location(), vec![0, 2]);
    }

    #[test]
    fn test_partial_write_merges_from_chain() {
        let v = volume(2, 2);
        v.layers()[0].write_full_at(&[1, 2, 3, 4], 0).unwrap();
        v.preload().unwrap();

        let mut shadowed = Vec::new();
        v.write_at(&[9, 9], 1, |layer, block| shadowed.push((layer, block)))
            .unwrap();
        assert_eq!(shadowed, vec![(0, 0)]);

        let mut head = vec![0u8; 4];
        v.layers()[1].read_full_at(&mut head, 0).unwrap();
        assert_eq!(head, vec![1, 9, 9, 4]);
        assert_eq!(v.location(), vec![2, 0]);
    }

    #[test]
    fn test_write_spanning_blocks() {
        let v = volume(1, 3);
        v.preload().unwrap();
        v.write_at(&[7; 6], 2, |_, _| {}).unwrap();
        let mut buf = vec![0u8; 12];
        v.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![0, 0, 7, 7, 7, 7, 7, 7, 0, 0, 0, 0]);
        assert_eq!(v.location(), vec![1, 1, 0]);
    }

    #[test]
    fn test_out_of_range() {
        let v = volume(1, 2);
        let mut buf = vec![0u8; 4];
        assert!(matches!(
            v.read_at(&mut buf, 6),
            Err(ReplicaError::OutOfRange { .. })
        ));
        assert!(matches!(
            v.write_at(&buf, u64::MAX, |_, _| {}),
            Err(ReplicaError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_backing_file_fills_gaps() {
        let backing = Arc::new(MemFile::new(6, 4));
        backing.write_full_at(&[3; 6], 0).unwrap();
        let mut v = Volume::new(12, BS, Some(BackingFile { name: "base".into(), disk: backing }));
        v.push_layer(Arc::new(MemFile::new(12, BS))).unwrap();
        v.preload().unwrap();
        let mut buf = vec![0xFFu8; 12];
        v.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![3, 3, 3, 3, 3, 3, 0, 0, 0, 0, 0, 0]);
    }

    /// Accepts writes below `limit`, fails the rest.
    #[derive(Debug)]
    struct FailingFile {
        inner: MemFile,
        limit: u64,
    }

    impl SparseFile for FailingFile {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
            self.inner.read_at(buf, offset)
        }

        fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
            if offset >= self.limit {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "device gone"));
            }
            self.inner.write_at(buf, offset)
        }

        fn next_data_extent(&self, from: u64) -> std::io::Result<Option<crate::sparse::Extent>> {
            self.inner.next_data_extent(from)
        }

        fn punch_hole(&self, offset: u64, len: u64) -> std::io::Result<()> {
            self.inner.punch_hole(offset, len)
        }

        fn len(&self) -> std::io::Result<u64> {
            self.inner.len()
        }

        fn set_len(&self, size: u64) -> std::io::Result<()> {
            self.inner.set_len(size)
        }

        fn sync(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_reports_completed_bytes() {
        let mut v = Volume::new(3 * BS, BS, None);
        v.push_layer(Arc::new(FailingFile {
            inner: MemFile::new(3 * BS, BS),
            limit: 2 * BS,
        }))
        .unwrap();
        v.preload().unwrap();
        match v.write_at(&[1; 12], 0, |_, _| {}) {
            Err(ReplicaError::PartialIo { completed, .. }) => assert_eq!(completed, 8),
            other => panic!("expected PartialIo, got {:?}", other),
        }
        assert_eq!(v.location(), vec![1, 1, 0]);
    }

    #[test]
    fn test_resize_extends_location() {
        let mut v = volume(1, 2);
        v.write_at(&[5; 8], 0, |_, _| {}).unwrap();
        v.layers()[0].set_len(4 * BS).unwrap();
        v.resize(4 * BS).unwrap();
        assert_eq!(v.size(), 4 * BS);
        assert_eq!(v.location(), vec![1, 1, 0, 0]);

        v.write_at(&[6; 4], 3 * BS, |_, _| {}).unwrap();
        let mut buf = vec![0u8; 16];
        v.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![5, 5, 5, 5, 5, 5, 5, 5, 0, 0, 0, 0, 6, 6, 6, 6]);

        assert!(v.resize(2 * BS).is_err());
        assert!(v.resize(4 * BS + 1).is_err());
    }

    #[test]
    fn test_remove_layer_invalidates() {
        let mut v = volume(3, 2);
        v.layers()[1].write_full_at(&[1; 4], 0).unwrap();
        v.preload().unwrap();
        v.remove_layer(1);
        assert!(v.location().iter().all(|&l| l == LOCATION_UNRESOLVED));
    }
}
