//! The guest's `brk` heap.
//!
//! The heap is an anonymous mapping that starts at the first page boundary
//! above `brk_base` and is followed by a one-page reservation, so that nothing
//! else gets mapped directly above it:
//!
//! ```text
//!          |      heap           | 1 page
//!   +------+------+--------------+-------+
//!   | BSS  | anon |   anon       | resvn |
//!   +------+------+--------------+-------+
//!          ^      ^        ^     ^
//!          |      |        |     end of heap mapping (page aligned)
//!          |      |        brk_limit
//!          |      page_round_up(brk_base)
//!          brk_base
//! ```
//!
//! `brk_base` is usually not page aligned, and the page containing it belongs
//! to the executable's data segment.

use guest_helper::page::{is_page_aligned, page_round_up, PAGE_SIZE};
use netbsd_api::errno::Errno;

use crate::host::engine::Services;
use crate::host::memory::{AddressSpace, MemError, SegKind, Segment, ShrinkMode};
use crate::host::thread::Tid;

const MIB: usize = 1024 * 1024;

/// Initial size of the heap mapping is the data limit clamped to this range.
pub const INITIAL_DATASEG_MIN: usize = MIB;
pub const INITIAL_DATASEG_MAX: usize = 8 * MIB;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BrkState {
    /// Fixed once the executable is loaded.
    pub base: usize,
    /// Current break, in `[base, end of heap mapping]`.
    pub limit: usize,
}

impl BrkState {
    pub fn new(base: usize) -> Self {
        Self { base, limit: base }
    }

    fn base_pgup(&self) -> usize {
        page_round_up(self.base)
    }
}

/// Maps the initial heap above `brk.base` and the reservation that guards it.
/// The heap inherits the protection of the segment containing `brk.base - 1`,
/// which must exist.
pub fn setup_client_dataseg(
    aspace: &dyn AddressSpace,
    brk: &BrkState,
    data_limit: usize,
) -> Result<(), MemError> {
    assert_eq!(brk.base, brk.limit);
    log::debug!("Setup client data (brk) segment at {:#x}", brk.base);

    let initial_size =
        page_round_up(data_limit.clamp(INITIAL_DATASEG_MIN, INITIAL_DATASEG_MAX));
    let anon_start = brk.base_pgup();
    let anon_size = initial_size;
    let resvn_start = anon_start + anon_size;

    let data_seg = aspace
        .find_segment(brk.base - 1)
        .ok_or(MemError::NotMapped {
            addr: brk.base - 1,
        })?;

    aspace.create_reservation(resvn_start, PAGE_SIZE, ShrinkMode::SmLower, anon_size)?;
    aspace.map_anon_fixed(anon_start, anon_size, data_seg.prot)?;
    Ok(())
}

/// Segment containing `addr`, which must be mapped heap memory.
fn heap_segment(aspace: &dyn AddressSpace, addr: usize) -> Segment {
    match aspace.find_segment(addr) {
        Some(seg) => seg,
        None => panic!("brk: no segment at {addr:#x}"),
    }
}

/// Resets `[start, start + len)` of `seg` as if it had been freshly mapped.
fn scrub(services: &Services, seg: &Segment, start: usize, len: usize) {
    if len == 0 {
        return;
    }
    if seg.has_t {
        services
            .translations
            .discard_translations(start, len, "do_brk(shrink)");
    }
    if seg.has_w() {
        if let Err(e) = services.aspace.zero(start, len) {
            panic!("brk: zeroing {start:#x}+{len:#x} failed: {e}");
        }
    } else {
        log::debug!("brk: not zeroing {start:#x}+{len:#x}, segment isn't writable");
    }
}

/// Emulates `break(2)`: moves the limit to `new_brk`.
pub fn do_brk(
    services: &Services,
    brk: &mut BrkState,
    data_limit: usize,
    tid: Tid,
    new_brk: usize,
) -> Result<(), Errno> {
    let aspace = services.aspace.as_ref();
    let old_limit = brk.limit;
    let base_pgup = brk.base_pgup();

    if new_brk == old_limit {
        return Ok(());
    }
    if new_brk < brk.base {
        return Err(Errno::ENOMEM);
    }
    if new_brk - brk.base > data_limit {
        return Err(Errno::ENOMEM);
    }

    if new_brk < old_limit {
        // Shrinking. The memory stays mapped, but it must read as zero if it
        // is handed out again.
        if old_limit > base_pgup {
            let new_local = new_brk.max(base_pgup);
            let seg = heap_segment(aspace, new_local);
            assert_eq!(seg.kind, SegKind::AnonC);
            assert_eq!(heap_segment(aspace, old_limit - 1), seg);
            scrub(services, &seg, new_local, old_limit - new_local);
        }

        // The part of the page containing `brk_base`.
        if new_brk < base_pgup {
            let old_local = old_limit.min(base_pgup);
            let seg = heap_segment(aspace, new_brk);
            assert_eq!(heap_segment(aspace, old_local - 1), seg);
            scrub(services, &seg, new_brk, old_local - new_brk);
        }

        brk.limit = new_brk;
        services.tool.die_mem_brk(new_brk, old_limit - new_brk);
        return Ok(());
    }

    // Growing. Within the page containing `brk_base` nothing needs mapping.
    if old_limit < base_pgup {
        let new_local = new_brk.min(base_pgup);
        assert_eq!(
            heap_segment(aspace, old_limit),
            heap_segment(aspace, new_local - 1)
        );
    }

    if new_brk > base_pgup {
        let old_local = old_limit.max(base_pgup);
        let seg = if old_local > base_pgup {
            heap_segment(aspace, old_local - 1)
        } else {
            heap_segment(aspace, old_local)
        };
        assert_eq!(seg.kind, SegKind::AnonC);

        let resvn = match aspace.next_segment(&seg) {
            Some(resvn) => resvn,
            None => panic!("brk: heap at {:#x} has no reservation above it", seg.start),
        };
        assert_eq!(resvn.kind, SegKind::Resvn);
        assert_eq!(seg.end + 1, resvn.start);
        assert_eq!(resvn.len(), PAGE_SIZE);

        if new_brk > resvn.start {
            let anon_start = seg.end + 1;
            let resvn_start = page_round_up(new_brk);
            let anon_size = resvn_start - anon_start;
            assert!(is_page_aligned(anon_start) && anon_size > 0);

            if let Err(e) =
                aspace.create_reservation(resvn_start, PAGE_SIZE, ShrinkMode::SmLower, anon_size)
            {
                log::warn!(
                    "brk segment overflow in thread #{tid}: can't grow to {new_brk:#x} ({e})"
                );
                return Err(Errno::ENOMEM);
            }
            if let Err(e) = aspace.map_anon_fixed(anon_start, anon_size, seg.prot) {
                log::warn!(
                    "Cannot map memory to grow brk segment in thread #{tid} to {new_brk:#x} ({e})"
                );
                return Err(Errno::ENOMEM);
            }
        }
    }

    brk.limit = new_brk;
    services.tool.new_mem_brk(old_limit, new_brk - old_limit, tid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use netbsd_api::mman::ProtFlags;

    use super::*;
    use crate::host::testing::TestServices;
    use crate::host::tool::ToolEvent;

    const DATA_START: usize = 0x60_0000;
    // Not page aligned, as for a real executable.
    const BRK_BASE: usize = 0x60_1234;

    fn setup() -> (TestServices, BrkState) {
        let ts = TestServices::new();
        ts.aspace
            .map_anon_fixed(DATA_START, 0x2000, ProtFlags::RW)
            .unwrap();
        let brk = BrkState::new(BRK_BASE);
        setup_client_dataseg(ts.services.aspace.as_ref(), &brk, 2 * MIB).unwrap();
        (ts, brk)
    }

    #[test]
    fn test_dataseg_layout() {
        let (ts, brk) = setup();
        let heap = ts.aspace.find_segment(page_round_up(BRK_BASE)).unwrap();
        assert_eq!(heap.kind, SegKind::AnonC);
        // Merges with the data segment below.
        assert_eq!(heap.start, DATA_START);
        assert_eq!(heap.end + 1, 0x60_2000 + 2 * MIB);
        let resvn = ts.aspace.next_segment(&heap).unwrap();
        assert_eq!(resvn.kind, SegKind::Resvn);
        assert_eq!(resvn.len(), PAGE_SIZE);
        assert_eq!(heap.prot, ProtFlags::RW);
        assert_eq!(brk.limit, BRK_BASE);
    }

    #[test]
    fn test_dataseg_size_clamped() {
        let ts = TestServices::new();
        ts.aspace
            .map_anon_fixed(DATA_START, 0x2000, ProtFlags::RW)
            .unwrap();
        let brk = BrkState::new(BRK_BASE);
        setup_client_dataseg(ts.services.aspace.as_ref(), &brk, usize::MAX).unwrap();
        let heap = ts.aspace.find_segment(page_round_up(BRK_BASE)).unwrap();
        assert_eq!(heap.end + 1, 0x60_2000 + INITIAL_DATASEG_MAX);
    }

    #[test]
    fn test_below_base_fails() {
        let (ts, mut brk) = setup();
        let rv = do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, BRK_BASE - 1);
        assert_eq!(rv, Err(Errno::ENOMEM));
        assert_eq!(brk.limit, BRK_BASE);
    }

    #[test]
    fn test_over_limit_fails() {
        let (ts, mut brk) = setup();
        let rv = do_brk(&ts.services, &mut brk, MIB, Tid::MAIN, BRK_BASE + MIB + 1);
        assert_eq!(rv, Err(Errno::ENOMEM));
        assert_eq!(brk.limit, BRK_BASE);
    }

    #[test]
    fn test_same_is_noop() {
        let (ts, mut brk) = setup();
        ts.tool.take();
        do_brk(&ts.services, &mut brk, MIB, Tid::MAIN, BRK_BASE).unwrap();
        assert!(ts.tool.events().is_empty());
    }

    #[test]
    fn test_grow_within_mapping() {
        let (ts, mut brk) = setup();
        ts.tool.take();
        do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, BRK_BASE + 0x10_0000).unwrap();
        assert_eq!(brk.limit, BRK_BASE + 0x10_0000);
        assert_eq!(
            ts.tool.events(),
            vec![ToolEvent::NewMemBrk {
                start: BRK_BASE,
                len: 0x10_0000,
                tid: Tid::MAIN
            }]
        );
    }

    #[test]
    fn test_grow_past_mapping_moves_reservation() {
        let (ts, mut brk) = setup();
        let new_brk = BRK_BASE + 5 * MIB;
        do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, new_brk).unwrap();
        assert_eq!(brk.limit, new_brk);

        let heap = ts.aspace.find_segment(new_brk - 1).unwrap();
        assert_eq!(heap.kind, SegKind::AnonC);
        assert_eq!(heap.end + 1, page_round_up(new_brk));
        let resvn = ts.aspace.next_segment(&heap).unwrap();
        assert_eq!(resvn.kind, SegKind::Resvn);
        assert_eq!(resvn.start, page_round_up(new_brk));
        assert_eq!(resvn.len(), PAGE_SIZE);
    }

    #[test]
    fn test_grow_blocked_by_mapping() {
        let (ts, mut brk) = setup();
        // Something mapped a little way above the reservation.
        let heap_end = 0x60_2000 + 2 * MIB;
        ts.aspace
            .map_anon_fixed(heap_end + 4 * PAGE_SIZE, PAGE_SIZE, ProtFlags::RW)
            .unwrap();
        let rv = do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, heap_end + 8 * PAGE_SIZE);
        assert_eq!(rv, Err(Errno::ENOMEM));
        assert_eq!(brk.limit, BRK_BASE);
        // Nothing was changed.
        let resvn = ts.aspace.find_segment(heap_end).unwrap();
        assert_eq!(resvn.kind, SegKind::Resvn);
        assert_eq!(resvn.len(), PAGE_SIZE);
    }

    #[test]
    fn test_grow_then_shrink_zeroes() {
        let (ts, mut brk) = setup();
        let grow = 3 * MIB;
        do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, BRK_BASE + grow).unwrap();

        let aspace: &dyn AddressSpace = ts.services.aspace.as_ref();
        aspace.write_bytes(BRK_BASE, &[0xaa; 64]).unwrap();
        aspace.write_bytes(BRK_BASE + grow - 64, &[0xbb; 64]).unwrap();
        ts.tool.take();

        do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, BRK_BASE).unwrap();
        assert_eq!(brk.limit, BRK_BASE);

        let mut buf = [0xffu8; 64];
        aspace.read_bytes(BRK_BASE, &mut buf).unwrap();
        assert_eq!(buf, [0; 64]);
        aspace.read_bytes(BRK_BASE + grow - 64, &mut buf).unwrap();
        assert_eq!(buf, [0; 64]);

        assert_eq!(
            ts.tool.events(),
            vec![ToolEvent::DieMemBrk {
                start: BRK_BASE,
                len: grow
            }]
        );
    }

    #[test]
    fn test_shrink_discards_translations() {
        let (ts, mut brk) = setup();
        do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, BRK_BASE + 0x3000).unwrap();
        ts.aspace.set_has_translations(BRK_BASE, true);
        do_brk(&ts.services, &mut brk, 64 * MIB, Tid::MAIN, BRK_BASE + 0x100).unwrap();
        let base_pgup = page_round_up(BRK_BASE);
        assert_eq!(
            ts.translations.ranges(),
            vec![
                (base_pgup, BRK_BASE + 0x3000 - base_pgup),
                (BRK_BASE + 0x100, base_pgup - (BRK_BASE + 0x100)),
            ]
        );
        assert_eq!(brk.limit, BRK_BASE + 0x100);
    }
}
