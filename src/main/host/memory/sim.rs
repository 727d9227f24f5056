//! An in-process model of the guest address space. Nothing is mapped in the
//! engine's own address space; guest memory lives in a sparse page store.
//! Used by tests and by `--dry-run`.

use std::collections::HashMap;
use std::sync::Mutex;

use guest_helper::page::{page_round_down, page_round_up, PAGE_SIZE};
use netbsd_api::mman::{MapFlags, ProtFlags};

use super::segment_map::SegmentMap;
use super::{AddressSpace, EngineStack, MemError, Segment};

/// Where guest executables are loaded when they don't ask for an address.
pub const SIM_CLIENT_BASE: usize = 0x20_0000;
/// The last byte below the main thread's stack area.
pub const SIM_CLIENT_STACK_END: usize = 0x7f7f_ffff_efff;
/// Engine stacks are handed out upwards from here.
const SIM_ENGINE_AREA: usize = 0x5800_0000_0000;

type Page = Box<[u8; PAGE_SIZE]>;

#[derive(Debug)]
struct SimInner {
    segments: SegmentMap,
    /// Pages that have been written to. Missing pages read as zero.
    pages: HashMap<usize, Page>,
    next_engine_stack: usize,
}

impl SimInner {
    /// Forgets the contents of every page overlapping `[start, start + len)`,
    /// which then read as zero.
    fn discard_pages(&mut self, start: usize, len: usize) {
        let first = page_round_down(start);
        let last = page_round_up(start + len);
        for page in (first..last).step_by(PAGE_SIZE) {
            self.pages.remove(&page);
        }
    }

    fn copy_out(&self, addr: usize, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done;
            let page = page_round_down(cur);
            let offset = cur - page;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            match self.pages.get(&page) {
                Some(p) => buf[done..done + n].copy_from_slice(&p[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    fn copy_in(&mut self, addr: usize, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let cur = addr + done;
            let page = page_round_down(cur);
            let offset = cur - page;
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            let p = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            p[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }
}

#[derive(Debug)]
pub struct SimAddressSpace {
    inner: Mutex<SimInner>,
    client_base: usize,
    client_stack_end: usize,
}

impl SimAddressSpace {
    pub fn new() -> Self {
        Self::with_layout(SIM_CLIENT_BASE, SIM_CLIENT_STACK_END)
    }

    /// `client_stack_end + 1` must be page aligned.
    pub fn with_layout(client_base: usize, client_stack_end: usize) -> Self {
        assert!(guest_helper::page::is_page_aligned(client_stack_end + 1));
        Self {
            inner: Mutex::new(SimInner {
                segments: SegmentMap::new(),
                pages: HashMap::new(),
                next_engine_stack: SIM_ENGINE_AREA,
            }),
            client_base,
            client_stack_end,
        }
    }
}

impl Default for SimAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SimAddressSpace {
    fn find_segment(&self, addr: usize) -> Option<Segment> {
        self.inner.lock().unwrap().segments.find(addr)
    }

    fn next_segment(&self, seg: &Segment) -> Option<Segment> {
        self.inner.lock().unwrap().segments.next(seg)
    }

    fn create_reservation(
        &self,
        start: usize,
        len: usize,
        smode: super::ShrinkMode,
        extra: usize,
    ) -> Result<(), MemError> {
        self.inner
            .lock()
            .unwrap()
            .segments
            .reserve(start, len, smode, extra)
    }

    fn map_anon_fixed(&self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError> {
        let mut inner = self.inner.lock().unwrap();
        inner.segments.map_anon(start, len, prot)?;
        inner.discard_pages(start, len);
        Ok(())
    }

    fn protect(&self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError> {
        self.inner.lock().unwrap().segments.protect(start, len, prot)
    }

    fn notify_client_mmap(
        &self,
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        _offset: u64,
    ) -> Result<(), MemError> {
        let kind = if flags.contains(MapFlags::MAP_ANON) || fd < 0 {
            super::SegKind::AnonC
        } else {
            super::SegKind::FileC
        };
        let len = page_round_up(len);
        let mut inner = self.inner.lock().unwrap();
        inner.segments.record_client_mapping(addr, len, prot, kind)?;
        inner.discard_pages(addr, len);
        Ok(())
    }

    fn set_has_translations(&self, addr: usize, has_t: bool) {
        self.inner
            .lock()
            .unwrap()
            .segments
            .set_has_translations(addr, has_t)
    }

    fn is_valid_for_client(&self, start: usize, len: usize, prot: ProtFlags) -> bool {
        self.inner
            .lock()
            .unwrap()
            .segments
            .is_valid_for_client(start, len, prot)
    }

    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemError> {
        let inner = self.inner.lock().unwrap();
        if !inner
            .segments
            .is_accessible(addr, buf.len(), ProtFlags::PROT_READ)
        {
            return Err(MemError::NotMapped { addr });
        }
        inner.copy_out(addr, buf);
        Ok(())
    }

    fn write_bytes(&self, addr: usize, data: &[u8]) -> Result<(), MemError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner
            .segments
            .is_accessible(addr, data.len(), ProtFlags::PROT_WRITE)
        {
            return Err(MemError::NotMapped { addr });
        }
        inner.copy_in(addr, data);
        Ok(())
    }

    fn zero(&self, addr: usize, len: usize) -> Result<(), MemError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner
            .segments
            .is_accessible(addr, len, ProtFlags::PROT_WRITE)
        {
            return Err(MemError::NotMapped { addr });
        }
        // Whole pages can simply be dropped; partial ones at either end are
        // cleared in place.
        let whole_start = page_round_up(addr);
        let whole_end = page_round_down(addr + len);
        if whole_start < whole_end {
            inner.discard_pages(whole_start, whole_end - whole_start);
            inner.copy_in(addr, &vec![0; whole_start - addr]);
            inner.copy_in(whole_end, &vec![0; addr + len - whole_end]);
        } else {
            inner.copy_in(addr, &vec![0; len]);
        }
        Ok(())
    }

    fn client_base(&self) -> usize {
        self.client_base
    }

    fn client_stack_end(&self) -> usize {
        self.client_stack_end
    }

    fn alloc_engine_stack(&self, size: usize) -> Result<EngineStack, MemError> {
        let size = page_round_up(size);
        let mut inner = self.inner.lock().unwrap();
        let base = inner.next_engine_stack;
        inner.segments.record_engine_mapping(base, size)?;
        // Leave an unmapped page between stacks.
        inner.next_engine_stack = base + size + PAGE_SIZE;
        Ok(EngineStack { base, size })
    }

    fn segments(&self) -> Vec<Segment> {
        self.inner.lock().unwrap().segments.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{SegKind, ShrinkMode};

    #[test]
    fn test_unwritten_memory_reads_zero() {
        let aspace = SimAddressSpace::new();
        aspace.map_anon_fixed(0x10000, 2 * PAGE_SIZE, ProtFlags::RW).unwrap();
        let mut buf = [0xffu8; 16];
        aspace.read_bytes(0x10000 + PAGE_SIZE - 8, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn test_write_across_pages() {
        let aspace = SimAddressSpace::new();
        aspace.map_anon_fixed(0x10000, 2 * PAGE_SIZE, ProtFlags::RW).unwrap();
        let data: Vec<u8> = (0..32).collect();
        let addr = 0x10000 + PAGE_SIZE - 16;
        aspace.write_bytes(addr, &data).unwrap();
        let mut buf = vec![0; 32];
        aspace.read_bytes(addr, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_permissions_enforced() {
        let aspace = SimAddressSpace::new();
        aspace
            .map_anon_fixed(0x10000, PAGE_SIZE, ProtFlags::PROT_READ)
            .unwrap();
        assert!(matches!(
            aspace.write_bytes(0x10000, &[1]),
            Err(MemError::NotMapped { .. })
        ));
        let mut buf = [0u8; 1];
        assert!(aspace.read_bytes(0x20000, &mut buf).is_err());
    }

    #[test]
    fn test_zero_partial_pages() {
        let aspace = SimAddressSpace::new();
        aspace.map_anon_fixed(0x10000, 3 * PAGE_SIZE, ProtFlags::RW).unwrap();
        aspace
            .write_bytes(0x10000, &vec![0xaa; 3 * PAGE_SIZE])
            .unwrap();
        aspace.zero(0x10000 + 100, 2 * PAGE_SIZE).unwrap();
        let mut buf = vec![0; 3 * PAGE_SIZE];
        aspace.read_bytes(0x10000, &mut buf).unwrap();
        assert!(buf[..100].iter().all(|b| *b == 0xaa));
        assert!(buf[100..100 + 2 * PAGE_SIZE].iter().all(|b| *b == 0));
        assert!(buf[100 + 2 * PAGE_SIZE..].iter().all(|b| *b == 0xaa));
    }

    #[test]
    fn test_remap_discards_contents() {
        let aspace = SimAddressSpace::new();
        aspace.create_reservation(0x10000, PAGE_SIZE, ShrinkMode::SmLower, 0).unwrap();
        aspace.map_anon_fixed(0x10000, PAGE_SIZE, ProtFlags::RW).unwrap();
        aspace.write_bytes(0x10000, &[7; 8]).unwrap();
        aspace
            .notify_client_mmap(0x10000, PAGE_SIZE, ProtFlags::RW, MapFlags::MAP_FIXED, 3, 0)
            .unwrap();
        assert_eq!(aspace.find_segment(0x10000).unwrap().kind, SegKind::FileC);
        let mut buf = [1u8; 8];
        aspace.read_bytes(0x10000, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn test_engine_stacks_are_disjoint() {
        let aspace = SimAddressSpace::new();
        let a = aspace.alloc_engine_stack(3 * PAGE_SIZE).unwrap();
        let b = aspace.alloc_engine_stack(PAGE_SIZE + 1).unwrap();
        assert_eq!(b.size, 2 * PAGE_SIZE);
        assert!(a.base + a.size < b.base);
        assert_eq!(a.init_sp() % 16, 0);
        assert_eq!(aspace.find_segment(a.base).unwrap().kind, SegKind::AnonV);
        // Engine memory is not guest memory.
        assert!(!aspace.is_valid_for_client(a.base, 8, ProtFlags::PROT_READ));
    }
}
