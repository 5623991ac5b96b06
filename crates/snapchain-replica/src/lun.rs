//! Block-granular enumeration of a layer's allocated data.

use std::collections::BTreeSet;
use std::io;

use crate::sparse::SparseFile;

/// Produces the indices of the blocks a layer holds data for.
///
/// A block counts as allocated when any byte of it lies inside a data extent.
/// Each call to [`LunGenerator::generate`] starts a fresh scan.
#[derive(Debug, Clone, Copy)]
pub struct LunGenerator<'a> {
    layer: &'a dyn SparseFile,
    block_size: u64,
}

impl<'a> LunGenerator<'a> {
    /// Creates a generator over `layer` with the volume's block size.
    pub fn new(layer: &'a dyn SparseFile, block_size: u64) -> Self {
        Self { layer, block_size }
    }

    /// Lazily yields allocated block indices in strictly ascending order.
    pub fn generate(&self) -> LunBlocks<'a> {
        LunBlocks {
            layer: self.layer,
            block_size: self.block_size,
            cursor: 0,
            current: None,
            last: None,
            done: false,
        }
    }

    /// Collects all allocated block indices.
    pub fn collect_set(&self) -> io::Result<BTreeSet<u64>> {
        self.generate().collect()
    }
}

/// Iterator returned by [`LunGenerator::generate`].
#[derive(Debug)]
pub struct LunBlocks<'a> {
    layer: &'a dyn SparseFile,
    block_size: u64,
    cursor: u64,
    current: Option<(u64, u64)>,
    last: Option<u64>,
    done: bool,
}

impl Iterator for LunBlocks<'_> {
    type Item = io::Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some((next, end)) = self.current {
                if next < end {
                    self.current = Some((next + 1, end));
                    self.last = Some(next);
                    return Some(Ok(next));
                }
                self.current = None;
            }
            match self.layer.next_data_extent(self.cursor) {
                Ok(Some(extent)) if extent.len > 0 => {
                    self.cursor = extent.end();
                    let mut first = extent.offset / self.block_size;
                    if let Some(last) = self.last {
                        first = first.max(last + 1);
                    }
                    self.current = Some((first, extent.end().div_ceil(self.block_size)));
                }
                Ok(_) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
