/*
 * This file is part of Cinabrio OS
 * Copyright (C) 2026 Cinabrio OS Developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Lesser General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU Lesser General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Single-page mapping primitives: a manual walk of the four table levels
//! through the physical-offset mapping.

use super::{
	arch::{invalidate_page, root_page_table_pointer_phys, Entry, PageTable},
	pmm, MapError, MapFlags, PhysicalAddress, PAGE_SIZE, PHYSICAL_MAPPED_BASE,
};

pub const L1_SHIFT: u64 = 12;
pub const L2_SHIFT: u64 = 21;
pub const L3_SHIFT: u64 = 30;
pub const L4_SHIFT: u64 = 39;

const fn table_index(virt: u64, shift: u64) -> usize {
	((virt >> shift) & 0x1ff) as usize
}

/// Retrieves a virtual pointer to the current root (L4) page table.
///
/// # Safety
///
/// This operation is unsafe because of aliasing; Rust assumes it is the only one accessing the table.
unsafe fn root_page_table_pointer() -> *mut PageTable {
	((root_page_table_pointer_phys() as u64) + PHYSICAL_MAPPED_BASE) as *mut PageTable
}

/// Maps one 4 KiB page, allocating intermediate tables as needed.
///
/// # Safety
///
/// The caller must own `virt` and hold whatever lock protects the address
/// space; the walk assumes exclusive access to the tables.
pub(crate) unsafe fn map_page(virt: u64, frame: PhysicalAddress, flags: MapFlags) -> Result<(), MapError> {
	let mut table = root_page_table_pointer();

	for shift in [L4_SHIFT, L3_SHIFT, L2_SHIFT] {
		let entry = &mut (*table).entries[table_index(virt, shift)];

		if !entry.is_present() {
			let table_frame = pmm::allocate_frame().ok_or(MapError)?;
			// fresh tables start out with every entry non-present
			core::ptr::write_bytes(table_frame.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
			*entry = Entry::new_table(table_frame.as_value());
		} else if entry.is_huge() {
			// someone already mapped a large page over this range
			return Err(MapError);
		}

		table = (entry.address() + PHYSICAL_MAPPED_BASE) as *mut PageTable;
	}

	let entry = &mut (*table).entries[table_index(virt, L1_SHIFT)];
	if entry.is_present() {
		return Err(MapError);
	}

	*entry = Entry::new_page(frame.as_value())
		.as_writable(flags.contains(MapFlags::WRITABLE))
		.as_no_execute(flags.contains(MapFlags::NO_EXECUTE));

	Ok(())
}

/// Unmaps one 4 KiB page and hands back the frame that was behind it.
/// Nothing mapped there is not an error; the caller gets `None`.
///
/// # Safety
///
/// Same contract as [`map_page`].
pub(crate) unsafe fn unmap_page(virt: u64) -> Option<PhysicalAddress> {
	let mut table = root_page_table_pointer();

	for shift in [L4_SHIFT, L3_SHIFT, L2_SHIFT] {
		let entry = (*table).entries[table_index(virt, shift)];

		if !entry.is_present() || entry.is_huge() {
			return None;
		}

		table = (entry.address() + PHYSICAL_MAPPED_BASE) as *mut PageTable;
	}

	let entry = &mut (*table).entries[table_index(virt, L1_SHIFT)];
	if !entry.is_present() {
		return None;
	}

	let frame = PhysicalAddress::new(entry.address());
	*entry = Entry::new();
	invalidate_page(virt);

	Some(frame)
}

/// The mapper seam, backed by the current address space.
pub struct KernelPageMapper;

impl super::PageMapper for KernelPageMapper {
	fn map(&self, virt: u64, frame: PhysicalAddress, flags: MapFlags) -> Result<(), MapError> {
		// SAFETY: heap callers hold the heap lock for the ranges they map,
		//         and the kernel tables are shared by design.
		unsafe { map_page(virt, frame, flags) }
	}

	fn unmap(&self, virt: u64) -> Option<PhysicalAddress> {
		// SAFETY: same as map().
		unsafe { unmap_page(virt) }
	}
}
