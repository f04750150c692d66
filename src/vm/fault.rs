//! 4.J Page-fault resolver.
//!
//! The CPU trap itself — the `int $0xe` path, the saved interrupt frame —
//! is out of scope (spec §1); `resolve` takes exactly the inputs the
//! handler would have pulled out of that frame: the faulting address, the
//! access mode, and the faulting thread's saved stack pointer.

use std::sync::Arc;

use log::{trace, warn};

use crate::vm::address_space::AddressSpace;
use crate::vm::frame::{FrameTable, VmOwner};
use crate::vm::spt::{PageState, Spt};
use crate::vm::swap::SwapArea;
use crate::vm::{page_floor, zero_page, PAGE_SIZE};

/// Largest a user stack may grow to (spec §4.J: "has not exceeded 8 MiB").
pub const STACK_LIMIT_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    /// The process must be terminated with exit status -1.
    Kill,
}

/// `true` if `addr` looks like a stack-growth access relative to `esp`:
/// the address itself, one word below it (`push`), or 32 bytes below it
/// (`pusha`), per spec §4.J step 3.
fn is_plausible_stack_access(addr: u64, esp: u64) -> bool {
    addr == esp || addr + 4 == esp || addr + 32 == esp
}

/// Reads `read_bytes` from `file` at `offset` into a fresh page, zeroing
/// the remainder, matching the ELF/mmap demand-load contract (spec §4.I).
fn load_file_backed_page(
    file: &crate::fs::inode::InodeHandle,
    cache: &crate::cache::BufferCache,
    offset: u64,
    read_bytes: u32,
) -> Box<crate::vm::Page> {
    let mut page = Box::new(zero_page());
    if read_bytes > 0 {
        let n = file.read_at(cache, &mut page[..read_bytes as usize], offset);
        debug_assert!(n as u32 <= read_bytes);
    }
    page
}

#[allow(clippy::too_many_arguments)]
pub fn resolve(
    fault_addr: u64,
    esp: u64,
    user_mode: bool,
    write_access: bool,
    is_user_address: impl Fn(u64) -> bool,
    spt: &Spt,
    frame_table: &FrameTable,
    swap: &SwapArea,
    cache: &crate::cache::BufferCache,
    address_space: &dyn AddressSpace,
    owner: Arc<dyn VmOwner>,
) -> FaultOutcome {
    let user_page = page_floor(fault_addr);

    if !user_mode && !is_user_address(fault_addr) && spt.lookup(user_page).is_none() {
        panic!("unmapped kernel-mode page fault at {fault_addr:#x}");
    }

    if let Some(entry) = spt.lookup(user_page) {
        if write_access && !entry.writable {
            warn!("write fault on read-only page {user_page:#x}");
            return FaultOutcome::Kill;
        }
        match entry.state {
            PageState::InFrame => {
                // Already mapped; the CPU would not have faulted. Treat as
                // a kernel bug surfaced through this simulated path.
                FaultOutcome::Kill
            }
            PageState::InSwap => {
                let slot = entry.swap_slot.expect("IN_SWAP entry without a slot");
                let frame = frame_table.alloc(owner, user_page);
                let mut page = zero_page();
                swap.swap_in(slot, &mut page);
                frame_table.write(frame, &page);
                frame_table.finish_settling(frame);
                address_space.map(user_page, frame, entry.writable);
                spt.set_in_frame(user_page, frame, entry.writable);
                trace!("resolved IN_SWAP fault at {user_page:#x} from slot {slot}");
                FaultOutcome::Resolved
            }
            PageState::InFile => {
                let file = entry.file.expect("IN_FILE entry without a file handle");
                let offset = entry.file_offset.unwrap_or(0);
                let read_bytes = entry.read_bytes.unwrap_or(0);
                let page = load_file_backed_page(&file, cache, offset, read_bytes);
                let frame = frame_table.alloc(owner, user_page);
                frame_table.write(frame, &page);
                frame_table.finish_settling(frame);
                address_space.map(user_page, frame, entry.writable);
                spt.set_in_frame(user_page, frame, entry.writable);
                trace!("resolved IN_FILE fault at {user_page:#x}");
                FaultOutcome::Resolved
            }
        }
    } else if is_plausible_stack_access(fault_addr, esp) && user_page <= STACK_LIMIT_BYTES {
        let frame = frame_table.alloc(owner, user_page);
        frame_table.finish_settling(frame);
        address_space.map(user_page, frame, true);
        spt.install_in_frame(user_page, frame, true);
        trace!("grew stack to include {user_page:#x}");
        FaultOutcome::Resolved
    } else {
        FaultOutcome::Kill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;
    use crate::cache::BufferCache;
    use crate::fs::freemap::FreeMap;
    use crate::fs::inode::{self, InodeTable};
    use crate::vm::address_space::SimulatedAddressSpace;
    use crate::vm::swap::SwapArea;
    use std::sync::Arc;

    struct NullOwner;
    impl VmOwner for NullOwner {
        fn on_evicted(&self, _user_page: u64, _slot: u32) {}
        fn is_dirty(&self, _user_page: u64) -> bool {
            false
        }
        fn clear_dirty(&self, _user_page: u64) {}
    }

    fn harness() -> (FrameTable, Spt, SimulatedAddressSpace, Arc<dyn VmOwner>, Arc<SwapArea>, Arc<BufferCache>) {
        let swap = Arc::new(SwapArea::new(Arc::new(MemoryBlockDevice::new(64 * crate::vm::PAGE_SECTORS))));
        let cache = Arc::new(BufferCache::new(Arc::new(MemoryBlockDevice::new(256))));
        (
            FrameTable::new(swap.clone(), 8),
            Spt::new(),
            SimulatedAddressSpace::new(),
            Arc::new(NullOwner),
            swap,
            cache,
        )
    }

    #[test]
    fn stack_growth_within_limit_succeeds() {
        let (ft, spt, addr_space, owner, swap, cache) = harness();
        let esp = STACK_LIMIT_BYTES - PAGE_SIZE as u64;
        let outcome = resolve(esp, esp, true, true, |_| true, &spt, &ft, &swap, &cache, &addr_space, owner);
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(addr_space.is_present(page_floor(esp)));
    }

    #[test]
    fn stack_growth_past_limit_kills() {
        let (ft, spt, addr_space, owner, swap, cache) = harness();
        let addr = STACK_LIMIT_BYTES + PAGE_SIZE as u64;
        let outcome = resolve(addr, addr, true, true, |_| true, &spt, &ft, &swap, &cache, &addr_space, owner);
        assert_eq!(outcome, FaultOutcome::Kill);
    }

    #[test]
    fn unrelated_address_kills() {
        let (ft, spt, addr_space, owner, swap, cache) = harness();
        let outcome = resolve(
            0x9999_0000,
            0x2000_0000,
            true,
            false,
            |_| true,
            &spt,
            &ft,
            &swap,
            &cache,
            &addr_space,
            owner,
        );
        assert_eq!(outcome, FaultOutcome::Kill);
    }

    #[test]
    fn swap_entry_resolves_and_clears_spt_slot() {
        let (ft, spt, addr_space, owner, swap, cache) = harness();
        let f = ft.alloc(owner.clone(), 0x4000);
        ft.write(f, &[0x7au8; PAGE_SIZE]);
        ft.finish_settling(f);
        let slot = swap.swap_out(&ft.read(f)).unwrap();
        ft.free(f);
        spt.install_in_frame(0x4000, 0, true);
        spt.mark_swapped(0x4000, slot);

        let outcome = resolve(
            0x4000,
            0x2000_0000,
            true,
            false,
            |_| true,
            &spt,
            &ft,
            &swap,
            &cache,
            &addr_space,
            owner,
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(addr_space.is_present(0x4000));
        let e = spt.lookup(0x4000).unwrap();
        assert_eq!(e.state, PageState::InFrame);
        let restored = ft.read(e.kernel_page.unwrap());
        assert!(restored.iter().all(|&b| b == 0x7a));
    }

    #[test]
    fn write_to_read_only_page_kills() {
        let (ft, spt, addr_space, owner, swap, cache) = harness();
        spt.install_in_frame(0x4000, 1, false);
        spt.mark_swapped(0x4000, 0);
        let outcome = resolve(
            0x4000,
            0x2000_0000,
            true,
            true,
            |_| true,
            &spt,
            &ft,
            &swap,
            &cache,
            &addr_space,
            owner,
        );
        assert_eq!(outcome, FaultOutcome::Kill);
    }

    #[test]
    fn in_file_fault_loads_bytes_from_inode() {
        let (ft, spt, addr_space, owner, swap, cache) = harness();
        let freemap = FreeMap::format(cache.clone(), 256).unwrap();
        let table = InodeTable::new();
        let sector = freemap.allocate(1).unwrap();
        inode::create_inode(&cache, &freemap, sector, 0, false).unwrap();
        let file = table.open(&cache, sector);
        file.write_at(&cache, &freemap, b"hello", 0).unwrap();

        spt.install_in_file(0x5000, file.clone(), 0, 5, (PAGE_SIZE - 5) as u32, true, false);
        let outcome = resolve(
            0x5000,
            0x2000_0000,
            true,
            false,
            |_| true,
            &spt,
            &ft,
            &swap,
            &cache,
            &addr_space,
            owner,
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        let e = spt.lookup(0x5000).unwrap();
        let page = ft.read(e.kernel_page.unwrap());
        assert_eq!(&page[..5], b"hello");
        table.close(&cache, &freemap, &file);
    }
}
