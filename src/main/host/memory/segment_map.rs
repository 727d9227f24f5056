//! Bookkeeping of the guest address space as a sorted list of non-overlapping
//! segments. Addresses not covered by any segment are free.

use netbsd_api::mman::ProtFlags;

use super::{MemError, SegKind, Segment, ShrinkMode};

/// Everything about a segment except its bounds. Two adjacent segments with
/// equal `SegInfo` are merged into one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SegInfo {
    kind: SegKind,
    prot: ProtFlags,
    has_t: bool,
    smode: ShrinkMode,
}

impl SegInfo {
    fn mergeable_with(&self, other: &SegInfo) -> bool {
        // Reservations keep their own identity so that a guard page stays
        // distinguishable from the reservation it was carved from.
        self == other && self.kind != SegKind::Resvn
    }
}

/// Sorted segment list. `starts`, `ends` (inclusive) and `infos` are parallel
/// vectors, which keeps the binary search over `starts` cache-friendly.
#[derive(Debug, Default)]
pub struct SegmentMap {
    starts: Vec<usize>,
    ends: Vec<usize>,
    infos: Vec<SegInfo>,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn segment_at(&self, i: usize) -> Segment {
        let info = self.infos[i];
        Segment {
            kind: info.kind,
            start: self.starts[i],
            end: self.ends[i],
            prot: info.prot,
            has_t: info.has_t,
            smode: info.smode,
        }
    }

    // Index of the segment containing `addr`.
    fn index_of(&self, addr: usize) -> Option<usize> {
        match self.starts.binary_search(&addr) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) if addr <= self.ends[i - 1] => Some(i - 1),
            Err(_) => None,
        }
    }

    /// The segment containing `addr`, or `None` if `addr` is free.
    pub fn find(&self, addr: usize) -> Option<Segment> {
        self.index_of(addr).map(|i| self.segment_at(i))
    }

    /// The segment immediately above `seg`, if it is directly adjacent.
    pub fn next(&self, seg: &Segment) -> Option<Segment> {
        let above = seg.end.checked_add(1)?;
        self.find(above)
    }

    pub fn iter(&self) -> impl Iterator<Item = Segment> + '_ {
        (0..self.starts.len()).map(|i| self.segment_at(i))
    }

    /// All segments overlapping `[start, end]`, in address order.
    fn overlapping(&self, start: usize, end: usize) -> impl Iterator<Item = Segment> + '_ {
        let first = match self.starts.binary_search(&start) {
            Ok(i) => i,
            Err(i) if i > 0 && self.ends[i - 1] >= start => i - 1,
            Err(i) => i,
        };
        (first..self.starts.len())
            .take_while(move |&i| self.starts[i] <= end)
            .map(|i| self.segment_at(i))
    }

    /// Replaces whatever covers `[start, end]` with `info` (or with free space
    /// if `info` is `None`), trimming or splitting partially covered segments.
    fn splice(&mut self, start: usize, end: usize, info: Option<SegInfo>) {
        assert!(start <= end);
        let mut new_starts = Vec::with_capacity(2);
        let mut new_ends = Vec::with_capacity(2);
        let mut new_infos = Vec::with_capacity(2);
        if let Some(info) = info {
            new_starts.push(start);
            new_ends.push(end);
            new_infos.push(info);
        }

        let splice_start = match self.starts.binary_search(&start) {
            Ok(i) | Err(i) => i,
        };
        let mut splice_end = splice_start;

        // A segment beginning below `start` either ends inside the range and
        // gets truncated, or extends past it and gets split in two.
        if splice_start > 0 && self.ends[splice_start - 1] >= start {
            let i = splice_start - 1;
            if self.ends[i] > end {
                new_starts.push(end + 1);
                new_ends.push(self.ends[i]);
                new_infos.push(self.infos[i]);
            }
            self.ends[i] = start - 1;
        }

        while splice_end < self.ends.len() && self.ends[splice_end] <= end {
            splice_end += 1;
        }

        // The last overlapped segment may extend past `end`; keep its tail.
        if splice_end < self.starts.len() && self.starts[splice_end] <= end {
            self.starts[splice_end] = end + 1;
        }

        self.starts.splice(splice_start..splice_end, new_starts);
        self.ends.splice(splice_start..splice_end, new_ends);
        self.infos.splice(splice_start..splice_end, new_infos);
    }

    /// Inserts `[start, end]` and merges it with equal neighbours.
    fn insert_merging(&mut self, start: usize, end: usize, info: SegInfo) {
        self.splice(start, end, Some(info));

        let mut merged_start = start;
        let mut merged_end = end;
        if let Some(below) = start.checked_sub(1).and_then(|a| self.index_of(a)) {
            if self.infos[below].mergeable_with(&info) {
                merged_start = self.starts[below];
            }
        }
        if let Some(above) = end.checked_add(1).and_then(|a| self.index_of(a)) {
            if self.infos[above].mergeable_with(&info) {
                merged_end = self.ends[above];
            }
        }
        if (merged_start, merged_end) != (start, end) {
            self.splice(merged_start, merged_end, Some(info));
        }
    }

    fn all_free(&self, start: usize, end: usize) -> bool {
        self.overlapping(start, end).next().is_none()
    }

    /// Creates a reservation over `[start, start + len)`. The range must be
    /// free, and so must the `extra` bytes adjacent to the side the
    /// reservation shrinks from (those are about to be mapped by the caller),
    /// except that they may already be covered by other reservations.
    pub fn reserve(
        &mut self,
        start: usize,
        len: usize,
        smode: ShrinkMode,
        extra: usize,
    ) -> Result<(), MemError> {
        let end = inclusive_end(start, len)?;
        if !self.all_free(start, end) {
            return Err(MemError::NotFree { start, len });
        }

        let adjacent = match smode {
            ShrinkMode::SmLower if extra > 0 => Some((
                start.checked_sub(extra).ok_or(MemError::OutOfRange)?,
                start - 1,
            )),
            ShrinkMode::SmUpper if extra > 0 => {
                Some((end + 1, end.checked_add(extra).ok_or(MemError::OutOfRange)?))
            }
            _ => None,
        };
        if let Some((adj_start, adj_end)) = adjacent {
            if self
                .overlapping(adj_start, adj_end)
                .any(|seg| seg.kind != SegKind::Resvn)
            {
                return Err(MemError::NotFree {
                    start: adj_start,
                    len: adj_end - adj_start + 1,
                });
            }
        }

        self.splice(
            start,
            end,
            Some(SegInfo {
                kind: SegKind::Resvn,
                prot: ProtFlags::empty(),
                has_t: false,
                smode,
            }),
        );
        Ok(())
    }

    /// Maps anonymous client memory at a fixed address. The range may only
    /// cover free space and reservations.
    pub fn map_anon(&mut self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError> {
        self.check_mappable(start, len)?;
        let end = inclusive_end(start, len)?;
        self.insert_merging(start, end, Self::client_info(SegKind::AnonC, prot));
        Ok(())
    }

    /// Whether [`Self::map_anon`] would accept the range.
    pub fn check_mappable(&self, start: usize, len: usize) -> Result<(), MemError> {
        let end = inclusive_end(start, len)?;
        if self
            .overlapping(start, end)
            .any(|seg| seg.kind != SegKind::Resvn)
        {
            return Err(MemError::NotFree { start, len });
        }
        Ok(())
    }

    /// Records a mapping the kernel has already made, replacing anything that
    /// was there (`MAP_FIXED` semantics).
    pub fn record_client_mapping(
        &mut self,
        start: usize,
        len: usize,
        prot: ProtFlags,
        kind: SegKind,
    ) -> Result<(), MemError> {
        let end = inclusive_end(start, len)?;
        self.insert_merging(start, end, Self::client_info(kind, prot));
        Ok(())
    }

    /// Records engine-private memory.
    pub fn record_engine_mapping(&mut self, start: usize, len: usize) -> Result<(), MemError> {
        let end = inclusive_end(start, len)?;
        if !self.all_free(start, end) {
            return Err(MemError::NotFree { start, len });
        }
        self.insert_merging(start, end, Self::client_info(SegKind::AnonV, ProtFlags::RW));
        Ok(())
    }

    /// Changes the protection of an already-mapped client range.
    pub fn protect(&mut self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError> {
        let end = inclusive_end(start, len)?;
        let covering: Vec<Segment> = self.overlapping(start, end).collect();
        let mut expected = start;
        for seg in &covering {
            if seg.start > expected || !seg.kind.is_client_mapping() {
                return Err(MemError::NotMapped { addr: expected });
            }
            expected = seg.end.saturating_add(1);
        }
        if expected <= end {
            return Err(MemError::NotMapped { addr: expected });
        }
        for seg in covering {
            let sub_start = seg.start.max(start);
            let sub_end = seg.end.min(end);
            let info = SegInfo {
                prot,
                ..Self::client_info(seg.kind, seg.prot)
            };
            self.insert_merging(sub_start, sub_end, info);
        }
        Ok(())
    }

    /// Sets or clears the has-translations flag of the segment containing
    /// `addr`.
    pub fn set_has_translations(&mut self, addr: usize, has_t: bool) {
        if let Some(i) = self.index_of(addr) {
            self.infos[i].has_t = has_t;
        }
    }

    /// Whether `[start, start + len)` is entirely covered by client mappings
    /// granting at least `prot`.
    pub fn is_valid_for_client(&self, start: usize, len: usize, prot: ProtFlags) -> bool {
        if len == 0 {
            return true;
        }
        let Ok(end) = inclusive_end(start, len) else {
            return false;
        };
        let mut expected = start;
        for seg in self.overlapping(start, end) {
            if seg.start > expected || !seg.kind.is_client_mapping() || !seg.prot.contains(prot)
            {
                return false;
            }
            match seg.end.checked_add(1) {
                Some(next) => expected = next,
                None => return true,
            }
        }
        expected > end
    }

    /// Like [`Self::is_valid_for_client`], but also accepts engine memory.
    pub fn is_accessible(&self, start: usize, len: usize, prot: ProtFlags) -> bool {
        if len == 0 {
            return true;
        }
        let Ok(end) = inclusive_end(start, len) else {
            return false;
        };
        let mut expected = start;
        for seg in self.overlapping(start, end) {
            let mapped = seg.kind.is_client_mapping() || seg.kind == SegKind::AnonV;
            if seg.start > expected || !mapped || !seg.prot.contains(prot) {
                return false;
            }
            match seg.end.checked_add(1) {
                Some(next) => expected = next,
                None => return true,
            }
        }
        expected > end
    }

    fn client_info(kind: SegKind, prot: ProtFlags) -> SegInfo {
        SegInfo {
            kind,
            prot,
            has_t: false,
            smode: ShrinkMode::SmFixed,
        }
    }
}

fn inclusive_end(start: usize, len: usize) -> Result<usize, MemError> {
    if len == 0 {
        return Err(MemError::OutOfRange);
    }
    start.checked_add(len - 1).ok_or(MemError::OutOfRange)
}
