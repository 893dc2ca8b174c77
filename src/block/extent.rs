//! Free-space extent list.

use std::collections::BTreeMap;

/// Sorted list of free extents in a file, keyed by offset.
///
/// Adjacent extents are always coalesced, so no two entries touch or
/// overlap. Allocation is first-fit: the lowest-offset extent large enough
/// wins. First-fit keeps live data packed toward the start of the file,
/// which is what lets a freed tail be truncated and what compaction relies
/// on to move blocks forward.
#[derive(Debug, Default, Clone)]
pub struct ExtentList {
    /// offset -> size
    extents: BTreeMap<u64, u64>,
    bytes: u64,
}

impl ExtentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total free bytes.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Number of extents.
    #[inline]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Iterate `(offset, size)` in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.extents.iter().map(|(&off, &size)| (off, size))
    }

    /// Return `[offset, offset + size)` to the free list, merging with its
    /// neighbours.
    ///
    /// Returns `false` (and changes nothing) if the range overlaps space
    /// that is already free.
    pub fn insert(&mut self, offset: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        let end = offset + size;

        let prev = self
            .extents
            .range(..=offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        let next = self.extents.range(offset..).next().map(|(&o, &s)| (o, s));

        if let Some((poff, psize)) = prev {
            if poff + psize > offset {
                return false;
            }
        }
        if let Some((noff, _)) = next {
            if noff < end {
                return false;
            }
        }

        let mut start = offset;
        let mut stop = end;
        if let Some((poff, psize)) = prev {
            if poff + psize == offset {
                self.extents.remove(&poff);
                start = poff;
            }
        }
        if let Some((noff, nsize)) = next {
            if noff == end {
                self.extents.remove(&noff);
                stop = noff + nsize;
            }
        }
        self.extents.insert(start, stop - start);
        self.bytes += size;
        true
    }

    /// Take `size` bytes from the first extent large enough.
    pub fn alloc_first_fit(&mut self, size: u64) -> Option<u64> {
        let (off, ext_size) = self.iter().find(|&(_, s)| s >= size)?;
        self.extents.remove(&off);
        if ext_size > size {
            self.extents.insert(off + size, ext_size - size);
        }
        self.bytes -= size;
        Some(off)
    }

    /// If the last extent ends exactly at `file_size`, remove it and return
    /// its offset (the new end of file).
    pub fn take_tail(&mut self, file_size: u64) -> Option<u64> {
        let (&off, &size) = self.extents.iter().next_back()?;
        if off + size != file_size {
            return None;
        }
        self.extents.remove(&off);
        self.bytes -= size;
        Some(off)
    }

    /// Free bytes in extents starting before `limit`.
    pub fn bytes_before(&self, limit: u64) -> u64 {
        self.extents.range(..limit).map(|(_, &size)| size).sum()
    }

    /// Whether an extent of at least `size` bytes starts before `limit`.
    pub fn has_fit_before(&self, size: u64, limit: u64) -> bool {
        self.extents.range(..limit).any(|(_, &s)| s >= size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_coalesces_neighbours() {
        let mut list = ExtentList::new();
        assert!(list.insert(0, 4096));
        assert!(list.insert(8192, 4096));
        assert_eq!(list.len(), 2);

        assert!(list.insert(4096, 4096));
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![(0, 12288)]);
        assert_eq!(list.bytes(), 12288);
    }

    #[test]
    fn test_insert_rejects_double_free() {
        let mut list = ExtentList::new();
        assert!(list.insert(4096, 8192));
        assert!(!list.insert(8192, 4096));
        assert!(!list.insert(0, 8192));
        assert_eq!(list.bytes(), 8192);
    }

    #[test]
    fn test_first_fit_prefers_lowest_offset() {
        let mut list = ExtentList::new();
        list.insert(40960, 16384);
        list.insert(4096, 4096);
        list.insert(16384, 8192);

        assert_eq!(list.alloc_first_fit(8192), Some(16384));
        assert_eq!(list.alloc_first_fit(4096), Some(4096));
        assert_eq!(list.alloc_first_fit(8192), Some(40960));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![(49152, 8192)]);
        assert_eq!(list.alloc_first_fit(65536), None);
    }

    #[test]
    fn test_take_tail() {
        let mut list = ExtentList::new();
        list.insert(4096, 4096);
        list.insert(16384, 8192);

        assert_eq!(list.take_tail(32768), None);
        assert_eq!(list.take_tail(24576), Some(16384));
        assert_eq!(list.bytes(), 4096);
    }

    #[test]
    fn test_bytes_before_and_fit() {
        let mut list = ExtentList::new();
        list.insert(0, 4096);
        list.insert(8192, 8192);
        list.insert(32768, 4096);

        assert_eq!(list.bytes_before(8192), 4096);
        assert_eq!(list.bytes_before(32768), 12288);
        assert!(list.has_fit_before(8192, 16384));
        assert!(!list.has_fit_before(8192, 8192));
    }

    fn first_run(free: &[bool], len: usize) -> Option<usize> {
        let mut i = 0;
        while i < free.len() {
            if !free[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < free.len() && free[i] {
                i += 1;
            }
            if i - start >= len {
                return Some(start);
            }
        }
        None
    }

    proptest! {
        #[test]
        fn prop_extents_never_touch(ops in proptest::collection::vec((0u64..64, 1u64..8, any::<bool>()), 1..200)) {
            let mut list = ExtentList::new();
            let mut free = [false; 72];

            for (slot, len, is_free) in ops {
                if is_free {
                    let range = slot as usize..(slot + len) as usize;
                    let overlaps = free[range.clone()].iter().any(|&f| f);
                    prop_assert_eq!(list.insert(slot * 4096, len * 4096), !overlaps);
                    if !overlaps {
                        free[range].iter_mut().for_each(|f| *f = true);
                    }
                } else {
                    // Extents are maximal free runs; first fit is the first
                    // run long enough.
                    let expected = first_run(&free, len as usize).map(|s| s as u64 * 4096);
                    let got = list.alloc_first_fit(len * 4096);
                    prop_assert_eq!(got, expected);
                    if let Some(off) = got {
                        let start = (off / 4096) as usize;
                        free[start..start + len as usize].iter_mut().for_each(|f| *f = false);
                    }
                }

                let mut last_end = None;
                let mut total = 0;
                for (off, size) in list.iter() {
                    prop_assert!(size > 0);
                    if let Some(end) = last_end {
                        prop_assert!(off > end, "extents touch or overlap");
                    }
                    last_end = Some(off + size);
                    total += size;
                }
                prop_assert_eq!(total, list.bytes());
                prop_assert_eq!(total, free.iter().filter(|&&f| f).count() as u64 * 4096);
            }
        }
    }
}
