//! Block-streamed spill store (C7), §4.5.
//!
//! When an in-memory trace array grows past budget, older elements are
//! written out in fixed-size blocks to a process-temporary file, and read
//! back through a bounded-cache view and a random-access iterator. `T`
//! must be trivially copyable — elements are moved to/from disk as raw
//! bytes, in blocks of fixed-size plain-old-data structs.

use crate::error::IntakeError;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use tempfile::NamedTempFile;

/// Default block element count. Callers needing a different value use
/// [`SpillStore::with_block_size`].
pub const BLK: usize = 512;

fn element_size<T>() -> usize {
    std::mem::size_of::<T>()
}

/// SAFETY prerequisite for every unsafe block in this module: `T` must be
/// `Copy` (checked at the type level) and must not contain padding bytes
/// whose value matters, since blocks are written/read as raw memory.
unsafe fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), std::mem::size_of_val(data))
}

unsafe fn bytes_to_vec<T: Copy + Default>(bytes: &[u8], count: usize) -> Vec<T> {
    let mut out = vec![T::default(); count];
    let dst = std::slice::from_raw_parts_mut(out.as_mut_ptr().cast::<u8>(), count * element_size::<T>());
    dst.copy_from_slice(&bytes[..count * element_size::<T>()]);
    out
}

/// Accumulates elements in memory and spills full blocks to a temporary
/// file once accrued. `append` handles growth; `finish` pads and flushes
/// the tail block so a [`SpillView`] can be opened afterward.
pub struct SpillStore<T> {
    file: NamedTempFile,
    blk: usize,
    blocks_written: usize,
    partial: Vec<T>,
    total_len: usize,
}

impl<T: Copy + Default> SpillStore<T> {
    pub fn new() -> std::io::Result<Self> {
        Self::with_block_size(BLK)
    }

    pub fn with_block_size(blk: usize) -> std::io::Result<Self> {
        assert!(blk > 0, "block size must be nonzero");
        Ok(Self {
            file: NamedTempFile::new()?,
            blk,
            blocks_written: 0,
            partial: Vec::with_capacity(blk),
            total_len: 0,
        })
    }

    pub fn block_size(&self) -> usize {
        self.blk
    }

    /// §4.5 `append`: accumulates into the current partial block; whenever
    /// full, writes one block to disk and resets.
    pub fn append(&mut self, data: &[T]) -> std::io::Result<()> {
        self.total_len += data.len();
        for &item in data {
            self.partial.push(item);
            if self.partial.len() == self.blk {
                self.write_block()?;
            }
        }
        Ok(())
    }

    fn write_block(&mut self) -> std::io::Result<()> {
        // SAFETY: `T: Copy`, buffer length is exactly one block.
        let bytes = unsafe { as_bytes(&self.partial) };
        self.file.write_all(bytes)?;
        self.blocks_written += 1;
        self.partial.clear();
        Ok(())
    }

    /// `size()`: `(block_count-1)*BLK + last.element_count`, matching the
    /// invariant in §4.5 (the last block may be partial and isn't counted
    /// as a full `blocks_written` until padded).
    pub fn size(&self) -> usize {
        self.total_len
    }

    /// Opens a read view over the blocks flushed so far, without consuming
    /// `self` — the store remains appendable. The view only ever sees
    /// fully-written blocks; any partial tail block stays in `self.partial`
    /// and must be read from there directly by the caller.
    pub fn view(&self) -> std::io::Result<SpillView<T>> {
        let file = self.file.reopen()?;
        Ok(SpillView {
            file,
            blk: self.blk,
            blocks_written: self.blocks_written,
            total_len: self.blocks_written * self.blk,
            cache: VecDeque::new(),
            cache_cap: 4,
            _marker: PhantomData,
        })
    }

    /// Pads the tail block with `T::default()` and flushes it, then
    /// returns a read-only [`SpillView`] over the completed file.
    pub fn finish(mut self) -> std::io::Result<SpillView<T>> {
        let partial_len = self.partial.len();
        if partial_len > 0 {
            self.partial.resize(self.blk, T::default());
            self.write_block()?;
        }
        self.file.flush()?;
        let total_len = self.total_len;
        let blk = self.blk;
        let blocks_written = self.blocks_written;
        let file = self.file.reopen()?;
        Ok(SpillView { file, blk, blocks_written, total_len, cache: VecDeque::new(), cache_cap: 4, _marker: PhantomData })
    }
}

/// Opens a spilled file and exposes bounded-cache block reads plus a
/// random-access iterator over elements.
pub struct SpillView<T> {
    file: File,
    blk: usize,
    blocks_written: usize,
    total_len: usize,
    cache: VecDeque<(usize, Vec<T>)>,
    cache_cap: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy + Default> SpillView<T> {
    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn block_size(&self) -> usize {
        self.blk
    }

    pub fn with_cache_capacity(mut self, n: usize) -> Self {
        self.cache_cap = n.max(1);
        self
    }

    /// Reads block `block_id`, using (and populating) the bounded cache.
    pub fn read_block(&mut self, block_id: usize) -> Result<&[T], IntakeError> {
        if block_id >= self.blocks_written {
            return Err(IntakeError::TruncatedPayload { expected: block_id + 1, got: self.blocks_written });
        }
        if let Some(pos) = self.cache.iter().position(|(id, _)| *id == block_id) {
            let entry = self.cache.remove(pos).unwrap();
            self.cache.push_back(entry);
        } else {
            self.load_block(block_id)?;
        }
        Ok(&self.cache.back().unwrap().1)
    }

    fn load_block(&mut self, block_id: usize) -> Result<(), IntakeError> {
        let offset = (block_id * self.blk * element_size::<T>()) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0u8; self.blk * element_size::<T>()];
        self.file.read_exact(&mut bytes)?;
        // SAFETY: bytes were written by `SpillStore::write_block` for the
        // same `T`, so the layout matches exactly.
        let block = unsafe { bytes_to_vec::<T>(&bytes, self.blk) };
        if self.cache.len() >= self.cache_cap {
            self.cache.pop_front();
        }
        self.cache.push_back((block_id, block));
        Ok(())
    }

    /// Reads `n` elements starting at global element offset `block_offset`
    /// (in elements, not blocks, despite `read_block`'s naming — consumers
    /// pass `iter.block_id() * BLK + iter.element_id()`).
    pub fn read_range(&mut self, start: usize, n: usize) -> Result<Vec<T>, IntakeError> {
        let mut out = Vec::with_capacity(n);
        let mut pos = start;
        while out.len() < n && pos < self.total_len {
            let block_id = pos / self.blk;
            let elem_id = pos % self.blk;
            let block = self.read_block(block_id)?;
            let take = (n - out.len()).min(self.blk - elem_id);
            out.extend_from_slice(&block[elem_id..elem_id + take]);
            pos += take;
        }
        Ok(out)
    }

    /// Reads every element back in original order.
    pub fn read_all(&mut self) -> Result<Vec<T>, IntakeError> {
        self.read_range(0, self.total_len)
    }

    pub fn iter(&mut self) -> SpillIter<'_, T> {
        SpillIter { view: self, pos: 0 }
    }
}

/// Random-access cursor over a [`SpillView`], indexed by `(block_id,
/// element_id)` per §4.5, supporting forward/backward `+=`/`-=` via
/// `(n / BLK, n % BLK)` arithmetic.
pub struct SpillIter<'a, T> {
    view: &'a mut SpillView<T>,
    pos: usize,
}

impl<T: Copy + Default> SpillIter<'_, T> {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn block_id(&self) -> usize {
        self.pos / self.view.blk
    }

    pub fn element_id(&self) -> usize {
        self.pos % self.view.blk
    }

    pub fn advance(&mut self, n: isize) {
        self.pos = (self.pos as isize + n).clamp(0, self.view.total_len as isize) as usize;
    }

    pub fn next_n(&mut self, n: usize) -> Result<Vec<T>, IntakeError> {
        let out = self.view.read_range(self.pos, n)?;
        self.pos += out.len();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_exact_multiple_of_block() {
        let mut store = SpillStore::<u64>::with_block_size(8).unwrap();
        let data: Vec<u64> = (0..16).collect();
        store.append(&data).unwrap();
        let mut view = store.finish().unwrap();
        assert_eq!(view.read_all().unwrap(), data);
    }

    #[test]
    fn round_trip_with_partial_tail_block() {
        let mut store = SpillStore::<u64>::with_block_size(8).unwrap();
        let data: Vec<u64> = (0..13).collect();
        store.append(&data).unwrap();
        let mut view = store.finish().unwrap();
        assert_eq!(view.len(), 13);
        assert_eq!(view.read_all().unwrap(), data);
    }

    #[test]
    fn scenario_block_stream_view_iteration() {
        // §8 scenario 6: BLK=8, 50 elements, load blocks [2,4), iterate 16
        // elements from the first, get elements 16..31.
        let mut store = SpillStore::<u64>::with_block_size(8).unwrap();
        let data: Vec<u64> = (0..50).collect();
        store.append(&data).unwrap();
        let mut view = store.finish().unwrap();

        view.read_block(2).unwrap();
        view.read_block(3).unwrap();

        let mut iter = view.iter();
        iter.advance(16);
        let got = iter.next_n(16).unwrap();
        assert_eq!(got, (16..32).collect::<Vec<u64>>());
    }

    #[test]
    fn cache_evicts_oldest_block() {
        let mut store = SpillStore::<u32>::with_block_size(4).unwrap();
        let data: Vec<u32> = (0..40).collect();
        store.append(&data).unwrap();
        let mut view = store.finish().unwrap().with_cache_capacity(2);
        for b in 0..10 {
            view.read_block(b).unwrap();
        }
        assert!(view.cache.len() <= 2);
    }
}
