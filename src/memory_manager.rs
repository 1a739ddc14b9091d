// SPDX-FileCopyrightText: 2025 tegra-mm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address space manager.
//!
//! Region state lives in an ordered interval map of [`VirtualMemoryArea`]s
//! tiling the whole 40-bit space, kept canonical by eager merging. Every map
//! mutation is projected into the flat [`PageTable`], so command-stream
//! decoding reads and writes guest GPU memory with a single page lookup.
//!
//! Block reads and writes of mapped ranges synchronize with the rasterizer's
//! caches, which keeps guest-visible memory synchronous even when the GPU
//! backend runs asynchronously. The typed single-value accessors skip that
//! synchronization and are reserved for memory the rasterizer does not cache.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::{MemoryAttribute, MemoryBus};
use crate::page_table::{PageAttribute, PageTable};
use crate::rasterizer::RasterizerInterface;
use crate::types::{
    align_up, is_page_aligned, CpuAddr, GpuAddr, HostPtr, ADDRESS_SPACE_BITS, ADDRESS_SPACE_SIZE,
    NUM_PAGES, PAGE_BITS, PAGE_MASK, PAGE_SIZE,
};
use crate::vma::{VirtualMemoryArea, VmaType};

/// Abort unless `[base, base + size)` stays inside the managed space.
fn validate_range(base: GpuAddr, size: u64) {
    match base.checked_add(size) {
        Some(end) if end <= ADDRESS_SPACE_SIZE => {}
        _ => panic!(
            "range {base:#018X}+{size:#X} escapes the {ADDRESS_SPACE_BITS}-bit address space"
        ),
    }
}

/// Software-managed GPU address space.
pub struct MemoryManager {
    page_table: PageTable,
    /// Interval map keyed by base address. Tiles `[0, ADDRESS_SPACE_SIZE)`
    /// without gaps; no two adjacent entries are mergeable.
    vma_map: BTreeMap<GpuAddr, VirtualMemoryArea>,
    bus: Arc<dyn MemoryBus>,
    rasterizer: Arc<dyn RasterizerInterface>,
    /// Hot-path accesses that hit an invalid or unmapped page.
    invalid_access_count: AtomicU64,
}

impl MemoryManager {
    pub fn new(bus: Arc<dyn MemoryBus>, rasterizer: Arc<dyn RasterizerInterface>) -> Self {
        let mut manager = Self {
            page_table: PageTable::new(),
            vma_map: BTreeMap::new(),
            bus,
            rasterizer,
            invalid_access_count: AtomicU64::new(0),
        };

        // One free region covering the entire managed space.
        let initial_vma = VirtualMemoryArea {
            size: ADDRESS_SPACE_SIZE,
            ..Default::default()
        };
        manager.vma_map.insert(initial_vma.base, initial_vma);
        manager.update_page_table_for_vma(&initial_vma);

        manager
    }

    // ── Address space management ────────────────────────────────────────────

    /// Reserve `size` bytes (rounded up to pages) at the lowest free address.
    ///
    /// Returns `None` when no free region is large enough.
    pub fn allocate_space(&mut self, size: u64) -> Option<GpuAddr> {
        let aligned_size = align_up(size, PAGE_SIZE);
        let gpu_addr = self.find_free_region(0, aligned_size)?;

        self.allocate_memory(gpu_addr, 0, aligned_size);

        Some(gpu_addr)
    }

    /// Reserve `[gpu_addr, gpu_addr + size)` (size rounded up to pages).
    pub fn allocate_space_at(&mut self, gpu_addr: GpuAddr, size: u64) -> GpuAddr {
        let aligned_size = align_up(size, PAGE_SIZE);

        self.allocate_memory(gpu_addr, 0, aligned_size);

        gpu_addr
    }

    /// Map `size` bytes of guest memory at `cpu_addr` to the lowest free GPU
    /// address.
    ///
    /// Returns `None` when no free region is large enough.
    pub fn map_buffer(&mut self, cpu_addr: CpuAddr, size: u64) -> Option<GpuAddr> {
        let aligned_size = align_up(size, PAGE_SIZE);
        let gpu_addr = self.find_free_region(0, aligned_size)?;
        let host_ptr = self.bus.host_pointer(cpu_addr);

        self.map_backing_memory(gpu_addr, host_ptr, aligned_size, cpu_addr);
        self.set_device_mapped(cpu_addr, size, true);

        Some(gpu_addr)
    }

    /// Map `size` bytes of guest memory at `cpu_addr` to a fixed GPU address.
    ///
    /// If the region containing `gpu_addr` is already mapped the address
    /// space is left unchanged and `gpu_addr` is returned as-is, even when
    /// the requested range only partially overlaps that mapping.
    pub fn map_buffer_at(&mut self, cpu_addr: CpuAddr, gpu_addr: GpuAddr, size: u64) -> GpuAddr {
        assert!(
            is_page_aligned(gpu_addr),
            "non-page aligned base: {gpu_addr:#018X}"
        );

        let aligned_size = align_up(size, PAGE_SIZE);
        let host_ptr = self.bus.host_pointer(cpu_addr);

        self.map_backing_memory(gpu_addr, host_ptr, aligned_size, cpu_addr);
        self.set_device_mapped(cpu_addr, size, true);

        gpu_addr
    }

    /// Unmap `[gpu_addr, gpu_addr + size)`, returning the range to the
    /// `Allocated` state so the same GPU addresses stay reserved for a later
    /// re-map.
    pub fn unmap_buffer(&mut self, gpu_addr: GpuAddr, size: u64) -> GpuAddr {
        assert!(
            is_page_aligned(gpu_addr),
            "non-page aligned base: {gpu_addr:#018X}"
        );

        let aligned_size = align_up(size, PAGE_SIZE);
        let cache_addr = self.get_pointer(gpu_addr).cache_addr();
        let cpu_addr = self
            .gpu_to_cpu_address(gpu_addr)
            .expect("unmapping a range with no backing address");

        // The rasterizer must retire every cached access to the region before
        // its pages go away, even in asynchronous GPU mode.
        self.rasterizer
            .flush_and_invalidate_region(cache_addr, aligned_size);

        self.unmap_range(gpu_addr, aligned_size);
        self.set_device_mapped(cpu_addr, size, false);

        gpu_addr
    }

    /// First-fit search over free regions, ascending by base address.
    ///
    /// The chosen address is clamped to `region_start` so a start inside a
    /// free VMA is honored.
    fn find_free_region(&self, region_start: GpuAddr, size: u64) -> Option<GpuAddr> {
        self.vma_map.values().find_map(|vma| {
            if vma.vma_type != VmaType::Unmapped {
                return None;
            }
            let vma_end = vma.end();
            if vma_end <= region_start {
                return None;
            }
            let candidate = region_start.max(vma.base);
            match candidate.checked_add(size) {
                Some(end) if end <= vma_end => Some(candidate),
                _ => None,
            }
        })
    }

    /// VMA containing `target`, or `None` past the end of the managed space.
    pub fn find_vma(&self, target: GpuAddr) -> Option<&VirtualMemoryArea> {
        if target >= ADDRESS_SPACE_SIZE {
            return None;
        }
        self.vma_map.range(..=target).next_back().map(|(_, vma)| vma)
    }

    fn set_device_mapped(&self, cpu_addr: CpuAddr, size: u64, mapped: bool) {
        let value = if mapped {
            MemoryAttribute::DEVICE_MAPPED
        } else {
            MemoryAttribute::empty()
        };
        self.bus
            .set_memory_attribute(cpu_addr, size, MemoryAttribute::DEVICE_MAPPED, value)
            .expect("guest kernel rejected a DeviceMapped attribute update");
    }

    // ── Carve / split / merge engine ────────────────────────────────────────

    /// Carve `[target, target + size)` out of the map and mark it
    /// `Allocated`, then restore canonical form.
    fn allocate_memory(&mut self, target: GpuAddr, offset: u64, size: u64) -> GpuAddr {
        let vma_base = self.carve_vma(target, size);
        let vma = self.vma_map.get_mut(&vma_base).expect("carved VMA present");

        if vma.vma_type == VmaType::Mapped {
            // Allocating over an existing mapping is a no-op.
            return vma_base;
        }
        assert_eq!(vma.size, size, "carved region has the wrong size");
        vma.offset = offset;

        self.allocate(vma_base)
    }

    /// Carve `[target, target + size)` out of the map and back it with host
    /// memory, then restore canonical form.
    fn map_backing_memory(
        &mut self,
        target: GpuAddr,
        memory: HostPtr,
        size: u64,
        backing_addr: CpuAddr,
    ) -> GpuAddr {
        let vma_base = self.carve_vma(target, size);
        let vma = self.vma_map.get_mut(&vma_base).expect("carved VMA present");

        if vma.vma_type == VmaType::Mapped {
            // Mapping over an existing mapping is a no-op.
            return vma_base;
        }
        assert_eq!(vma.size, size, "carved region has the wrong size");

        vma.vma_type = VmaType::Mapped;
        vma.backing_memory = memory;
        vma.backing_addr = backing_addr;
        let vma = *vma;
        self.update_page_table_for_vma(&vma);

        log::debug!(
            "map gpu {:#x}..{:#x} -> cpu {:#x}",
            target,
            target + size,
            backing_addr
        );

        self.merge_adjacent(vma_base)
    }

    /// Return a VMA to the `Allocated` state and restore canonical form.
    /// Returns the base of the (possibly merged) containing VMA.
    fn allocate(&mut self, vma_base: GpuAddr) -> GpuAddr {
        let vma = self.vma_map.get_mut(&vma_base).expect("VMA present");

        vma.vma_type = VmaType::Allocated;
        vma.backing_addr = 0;
        vma.backing_memory = HostPtr::null();
        let vma = *vma;
        self.update_page_table_for_vma(&vma);

        self.merge_adjacent(vma_base)
    }

    /// Return every VMA covering `[target, target + size)` to `Allocated`.
    ///
    /// Unmapped ranges keep their address-space reservation: guest software
    /// (Super Mario Odyssey, Sonic Forces) unmaps a buffer and expects to
    /// re-map the same GPU addresses later, so the range must not become
    /// eligible for free-region searches.
    fn unmap_range(&mut self, target: GpuAddr, size: u64) {
        let target_end = target + size;
        let mut vma_base = self.carve_vma_range(target, size);

        // Walk by address, not by handle: every `allocate` may merge the
        // current VMA with its neighbors.
        while vma_base < target_end {
            let merged_base = self.allocate(vma_base);
            let merged = self.vma_map[&merged_base];
            vma_base = merged.end();
        }

        debug_assert!(self
            .find_vma(target)
            .is_some_and(|vma| vma.size >= size));

        log::debug!("unmap gpu {target:#x}..{target_end:#x}");
    }

    /// Slice the VMA containing `base` so `[base, base + size)` is covered
    /// by exactly one VMA, and return that VMA's base.
    ///
    /// An enclosing VMA that is already `Mapped` is returned unchanged, even
    /// when it only partially overlaps the requested range.
    fn carve_vma(&mut self, base: GpuAddr, size: u64) -> GpuAddr {
        assert!(is_page_aligned(size), "non-page aligned size: {size:#018X}");
        assert!(is_page_aligned(base), "non-page aligned base: {base:#018X}");
        validate_range(base, size);

        let vma = *self
            .find_vma(base)
            .expect("carve target outside the managed range");
        if vma.vma_type == VmaType::Mapped {
            return vma.base;
        }

        let start_in_vma = base - vma.base;
        let end_in_vma = start_in_vma + size;
        assert!(
            end_in_vma <= vma.size,
            "carve of {size:#X} bytes at {base:#018X} escapes its region"
        );

        let mut vma_base = vma.base;
        if end_in_vma < vma.size {
            // Split the tail off the carved region.
            self.split_vma(vma_base, end_in_vma);
        }
        if start_in_vma != 0 {
            // Split the head off and keep the right half.
            vma_base = self.split_vma(vma_base, start_in_vma);
        }

        vma_base
    }

    /// Split at both endpoints of `[target, target + size)`, which may span
    /// several VMAs, and return the base of the first covered VMA.
    ///
    /// Aborts if any covered VMA is `Unmapped`.
    fn carve_vma_range(&mut self, target: GpuAddr, size: u64) -> GpuAddr {
        assert!(is_page_aligned(size), "non-page aligned size: {size:#018X}");
        assert!(
            is_page_aligned(target),
            "non-page aligned base: {target:#018X}"
        );
        assert!(size > 0, "zero-size carve at {target:#018X}");
        validate_range(target, size);

        let target_end = target + size;
        let begin = *self
            .find_vma(target)
            .expect("carve target outside the managed range");
        assert!(
            self.vma_map
                .range(begin.base..target_end)
                .all(|(_, vma)| vma.vma_type != VmaType::Unmapped),
            "carving an unmapped range at {target:#018X}"
        );

        let mut begin_base = begin.base;
        if target != begin_base {
            begin_base = self.split_vma(begin_base, target - begin_base);
        }

        if let Some(end_vma) = self.find_vma(target_end).copied() {
            if target_end != end_vma.base {
                self.split_vma(end_vma.base, target_end - end_vma.base);
            }
        }

        begin_base
    }

    /// Split the VMA at `vma_base` in two at `offset_in_vma` bytes; returns
    /// the base of the new right-hand VMA.
    fn split_vma(&mut self, vma_base: GpuAddr, offset_in_vma: u64) -> GpuAddr {
        let old_vma = self.vma_map.get_mut(&vma_base).expect("split target present");
        assert!(
            offset_in_vma > 0 && offset_in_vma < old_vma.size,
            "illegal split of a {:#X}-byte region at {offset_in_vma:#X}",
            old_vma.size
        );

        let mut new_vma = *old_vma;
        old_vma.size = offset_in_vma;
        new_vma.base += offset_in_vma;
        new_vma.size -= offset_in_vma;

        match new_vma.vma_type {
            VmaType::Unmapped => {}
            VmaType::Allocated => new_vma.offset += offset_in_vma,
            VmaType::Mapped => {
                new_vma.backing_memory = new_vma.backing_memory.add(offset_in_vma);
                new_vma.backing_addr += offset_in_vma;
            }
        }

        // A fresh split must leave two halves that would merge right back.
        debug_assert!(self.vma_map[&vma_base].can_be_merged_with(&new_vma));

        let new_base = new_vma.base;
        self.vma_map.insert(new_base, new_vma);
        new_base
    }

    /// Fold the VMA at `vma_base` into identical neighbors, restoring
    /// canonical form. Returns the base of the surviving VMA.
    ///
    /// One look each way suffices: the map was canonical before the mutation,
    /// so merging never cascades.
    fn merge_adjacent(&mut self, vma_base: GpuAddr) -> GpuAddr {
        // Absorb the next VMA.
        let vma = self.vma_map[&vma_base];
        if let Some(next) = self.vma_map.get(&vma.end()).copied() {
            if vma.can_be_merged_with(&next) {
                self.vma_map.remove(&next.base);
                self.vma_map.get_mut(&vma_base).expect("VMA present").size += next.size;
            }
        }

        // Absorb into the previous VMA.
        let vma = self.vma_map[&vma_base];
        if let Some(prev) = self.vma_map.range(..vma_base).next_back().map(|(_, v)| *v) {
            if prev.can_be_merged_with(&vma) {
                self.vma_map.remove(&vma_base);
                self.vma_map.get_mut(&prev.base).expect("VMA present").size += vma.size;
                return prev.base;
            }
        }

        vma_base
    }

    /// Project a VMA into the page table. This is the sole writer of the
    /// page table and runs after every map mutation.
    fn update_page_table_for_vma(&mut self, vma: &VirtualMemoryArea) {
        let base_page = vma.base >> PAGE_BITS;
        let num_pages = vma.size >> PAGE_BITS;

        match vma.vma_type {
            VmaType::Unmapped => {
                self.page_table
                    .map_pages(base_page, num_pages, HostPtr::null(), 0, PageAttribute::Unmapped)
            }
            // An allocation has no host memory behind it yet, so its pages
            // stay `Unmapped` in the table; only the backing address carries.
            VmaType::Allocated => self.page_table.map_pages(
                base_page,
                num_pages,
                HostPtr::null(),
                vma.backing_addr,
                PageAttribute::Unmapped,
            ),
            VmaType::Mapped => self.page_table.map_pages(
                base_page,
                num_pages,
                vma.backing_memory,
                vma.backing_addr,
                PageAttribute::Memory,
            ),
        }
    }

    // ── Hot-path access ─────────────────────────────────────────────────────

    /// Whether `addr` lies inside the managed address space.
    #[inline]
    pub fn is_address_valid(&self, addr: GpuAddr) -> bool {
        (addr >> PAGE_BITS) < NUM_PAGES
    }

    /// Read a little-endian `u8` from GPU memory. See [`read_scalar`].
    ///
    /// [`read_scalar`]: Self::read_scalar
    pub fn read_u8(&self, addr: GpuAddr) -> u8 {
        let mut bytes = [0u8; 1];
        self.read_scalar(addr, &mut bytes);
        bytes[0]
    }

    /// Read a little-endian `u16` from GPU memory. See [`read_scalar`].
    ///
    /// [`read_scalar`]: Self::read_scalar
    pub fn read_u16(&self, addr: GpuAddr) -> u16 {
        let mut bytes = [0u8; 2];
        self.read_scalar(addr, &mut bytes);
        u16::from_le_bytes(bytes)
    }

    /// Read a little-endian `u32` from GPU memory. See [`read_scalar`].
    ///
    /// [`read_scalar`]: Self::read_scalar
    pub fn read_u32(&self, addr: GpuAddr) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_scalar(addr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Read a little-endian `u64` from GPU memory. See [`read_scalar`].
    ///
    /// [`read_scalar`]: Self::read_scalar
    pub fn read_u64(&self, addr: GpuAddr) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_scalar(addr, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn write_u8(&mut self, addr: GpuAddr, value: u8) {
        self.write_scalar(addr, &value.to_le_bytes());
    }

    pub fn write_u16(&mut self, addr: GpuAddr, value: u16) {
        self.write_scalar(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: GpuAddr, value: u32) {
        self.write_scalar(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: GpuAddr, value: u64) {
        self.write_scalar(addr, &value.to_le_bytes());
    }

    /// Shared fast path of the typed reads. Reads of unmapped pages leave
    /// `buf` zeroed and return `false`.
    ///
    /// The access must not cross a page boundary; the fast path assumes
    /// contiguity within one page. Use [`read_block`] for boundary-safe
    /// reads.
    ///
    /// [`read_block`]: Self::read_block
    fn read_scalar(&self, addr: GpuAddr, buf: &mut [u8]) -> bool {
        if !self.is_address_valid(addr) {
            self.note_invalid_access();
            log::error!("read{} at invalid gpu address {:#018X}", buf.len() * 8, addr);
            return false;
        }

        let entry = self.page_table.entry(addr);
        if !entry.pointer.is_null() {
            // NOTE: no extra logic belongs in this fast-path block.
            unsafe { entry.pointer.add(addr & PAGE_MASK).copy_to(buf) };
            return true;
        }

        match entry.attribute {
            PageAttribute::Unmapped => {
                self.note_invalid_access();
                log::error!("unmapped read{} @ {:#018X}", buf.len() * 8, addr);
                false
            }
            PageAttribute::Memory => {
                unreachable!("mapped page without a pointer @ {:#018X}", addr)
            }
        }
    }

    /// Shared fast path of the typed writes. Writes to unmapped pages are
    /// dropped. Same page-boundary contract as [`read_scalar`].
    ///
    /// [`read_scalar`]: Self::read_scalar
    fn write_scalar(&mut self, addr: GpuAddr, bytes: &[u8]) {
        if !self.is_address_valid(addr) {
            self.note_invalid_access();
            log::error!(
                "write{} at invalid gpu address {:#018X}",
                bytes.len() * 8,
                addr
            );
            return;
        }

        let entry = self.page_table.entry(addr);
        if !entry.pointer.is_null() {
            // NOTE: no extra logic belongs in this fast-path block.
            unsafe { entry.pointer.add(addr & PAGE_MASK).copy_from(bytes) };
            return;
        }

        match entry.attribute {
            PageAttribute::Unmapped => {
                self.note_invalid_access();
                let mut value = [0u8; 8];
                value[..bytes.len()].copy_from_slice(bytes);
                log::error!(
                    "unmapped write{} of {:#010X} @ {:#018X}",
                    bytes.len() * 8,
                    u64::from_le_bytes(value),
                    addr
                );
            }
            PageAttribute::Memory => {
                unreachable!("mapped page without a pointer @ {:#018X}", addr)
            }
        }
    }

    /// Host pointer for `addr`, or null when the page has no backing memory.
    pub fn get_pointer(&self, addr: GpuAddr) -> HostPtr {
        if !self.is_address_valid(addr) {
            self.note_invalid_access();
            log::error!("get_pointer at invalid gpu address {addr:#018X}");
            return HostPtr::null();
        }

        let entry = self.page_table.entry(addr);
        if !entry.pointer.is_null() {
            return entry.pointer.add(addr & PAGE_MASK);
        }

        self.note_invalid_access();
        log::error!("unknown get_pointer @ {addr:#018X}");
        HostPtr::null()
    }

    /// Guest CPU address backing `addr`, if any.
    pub fn gpu_to_cpu_address(&self, addr: GpuAddr) -> Option<CpuAddr> {
        if !self.is_address_valid(addr) {
            return None;
        }

        let backing_addr = self.page_table.entry(addr).backing_addr;
        if backing_addr != 0 {
            Some(backing_addr + (addr & PAGE_MASK))
        } else {
            None
        }
    }

    /// Whether `[start, start + size)` maps to one contiguous host
    /// allocation. Lets the buffer cache elide scatter copies.
    pub fn is_block_continuous(&self, start: GpuAddr, size: u64) -> bool {
        let inner_size = size - 1;
        let start_ptr = self.get_pointer(start);
        let end_ptr = self.get_pointer(start + inner_size);
        end_ptr.addr().wrapping_sub(start_ptr.addr()) as u64 == inner_size
    }

    /// Hot-path accesses so far that faulted on invalid or unmapped pages.
    pub fn invalid_access_count(&self) -> u64 {
        self.invalid_access_count.load(Ordering::Relaxed)
    }

    fn note_invalid_access(&self) {
        self.invalid_access_count.fetch_add(1, Ordering::Relaxed);
    }

    // ── Block I/O ───────────────────────────────────────────────────────────

    /// Read `dest.len()` bytes starting at `src_addr`, flushing the
    /// rasterizer over each source page first so memory is synchronous even
    /// in asynchronous GPU mode.
    ///
    /// Every page in the range must be mapped.
    pub fn read_block(&self, src_addr: GpuAddr, dest: &mut [u8]) {
        let mut page_index = src_addr >> PAGE_BITS;
        let mut page_offset = (src_addr & PAGE_MASK) as usize;
        let mut copied = 0usize;

        while copied < dest.len() {
            let copy_amount = (PAGE_SIZE as usize - page_offset).min(dest.len() - copied);
            let entry = self.page_table.entry_at(page_index);

            match entry.attribute {
                PageAttribute::Memory => {
                    let src_ptr = entry.pointer.add(page_offset as u64);
                    self.rasterizer
                        .flush_region(src_ptr.cache_addr(), copy_amount as u64);
                    unsafe { src_ptr.copy_to(&mut dest[copied..copied + copy_amount]) };
                }
                PageAttribute::Unmapped => {
                    unreachable!("block read of unmapped gpu page {:#018X}", page_index << PAGE_BITS)
                }
            }

            page_index += 1;
            page_offset = 0;
            copied += copy_amount;
        }
    }

    /// Like [`read_block`] but with no rasterizer synchronization; unmapped
    /// pages read as zero.
    ///
    /// [`read_block`]: Self::read_block
    pub fn read_block_unsafe(&self, src_addr: GpuAddr, dest: &mut [u8]) {
        let mut page_index = src_addr >> PAGE_BITS;
        let mut page_offset = (src_addr & PAGE_MASK) as usize;
        let mut copied = 0usize;

        while copied < dest.len() {
            let copy_amount = (PAGE_SIZE as usize - page_offset).min(dest.len() - copied);
            let entry = self.page_table.entry_at(page_index);

            if entry.pointer.is_null() {
                dest[copied..copied + copy_amount].fill(0);
            } else {
                let src_ptr = entry.pointer.add(page_offset as u64);
                unsafe { src_ptr.copy_to(&mut dest[copied..copied + copy_amount]) };
            }

            page_index += 1;
            page_offset = 0;
            copied += copy_amount;
        }
    }

    /// Write `src` starting at `dest_addr`, invalidating the rasterizer over
    /// each destination page first so no stale cached interpretation of the
    /// range survives the write.
    ///
    /// Every page in the range must be mapped.
    pub fn write_block(&mut self, dest_addr: GpuAddr, src: &[u8]) {
        let mut page_index = dest_addr >> PAGE_BITS;
        let mut page_offset = (dest_addr & PAGE_MASK) as usize;
        let mut copied = 0usize;

        while copied < src.len() {
            let copy_amount = (PAGE_SIZE as usize - page_offset).min(src.len() - copied);
            let entry = self.page_table.entry_at(page_index);

            match entry.attribute {
                PageAttribute::Memory => {
                    let dest_ptr = entry.pointer.add(page_offset as u64);
                    self.rasterizer
                        .invalidate_region(dest_ptr.cache_addr(), copy_amount as u64);
                    unsafe { dest_ptr.copy_from(&src[copied..copied + copy_amount]) };
                }
                PageAttribute::Unmapped => {
                    unreachable!("block write of unmapped gpu page {:#018X}", page_index << PAGE_BITS)
                }
            }

            page_index += 1;
            page_offset = 0;
            copied += copy_amount;
        }
    }

    /// Like [`write_block`] but with no rasterizer synchronization; unmapped
    /// pages are skipped.
    ///
    /// [`write_block`]: Self::write_block
    pub fn write_block_unsafe(&mut self, dest_addr: GpuAddr, src: &[u8]) {
        let mut page_index = dest_addr >> PAGE_BITS;
        let mut page_offset = (dest_addr & PAGE_MASK) as usize;
        let mut copied = 0usize;

        while copied < src.len() {
            let copy_amount = (PAGE_SIZE as usize - page_offset).min(src.len() - copied);
            let entry = self.page_table.entry_at(page_index);

            if !entry.pointer.is_null() {
                let dest_ptr = entry.pointer.add(page_offset as u64);
                unsafe { dest_ptr.copy_from(&src[copied..copied + copy_amount]) };
            }

            page_index += 1;
            page_offset = 0;
            copied += copy_amount;
        }
    }

    /// Copy `size` bytes from `src_addr` to `dest_addr`, flushing each source
    /// page and invalidating each destination page.
    ///
    /// Every page in both ranges must be mapped.
    pub fn copy_block(&mut self, dest_addr: GpuAddr, src_addr: GpuAddr, size: usize) {
        let mut scratch = [0u8; PAGE_SIZE as usize];
        let mut page_index = src_addr >> PAGE_BITS;
        let mut page_offset = (src_addr & PAGE_MASK) as usize;
        let mut dest_addr = dest_addr;
        let mut copied = 0usize;

        while copied < size {
            let copy_amount = (PAGE_SIZE as usize - page_offset).min(size - copied);
            let entry = self.page_table.entry_at(page_index);

            match entry.attribute {
                PageAttribute::Memory => {
                    let src_ptr = entry.pointer.add(page_offset as u64);
                    self.rasterizer
                        .flush_region(src_ptr.cache_addr(), copy_amount as u64);
                    unsafe { src_ptr.copy_to(&mut scratch[..copy_amount]) };
                    self.write_block(dest_addr, &scratch[..copy_amount]);
                }
                PageAttribute::Unmapped => {
                    unreachable!("block copy of unmapped gpu page {:#018X}", page_index << PAGE_BITS)
                }
            }

            page_index += 1;
            page_offset = 0;
            dest_addr += copy_amount as u64;
            copied += copy_amount;
        }
    }

    /// Like [`copy_block`] but with no rasterizer synchronization; tolerates
    /// sparse mappings on both sides.
    ///
    /// [`copy_block`]: Self::copy_block
    pub fn copy_block_unsafe(&mut self, dest_addr: GpuAddr, src_addr: GpuAddr, size: usize) {
        let mut tmp_buffer = vec![0u8; size];
        self.read_block_unsafe(src_addr, &mut tmp_buffer);
        self.write_block_unsafe(dest_addr, &tmp_buffer);
    }
}
