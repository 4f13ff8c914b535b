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

use core::fmt::Debug;

use bitflags::bitflags;

pub mod heap;

#[cfg(target_os = "none")]
pub mod pmm;
#[cfg(target_os = "none")]
pub mod vmm;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use x86_64 as arch;

pub const PAGE_SIZE: u64 = 0x1000;
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;

pub const KERNEL_VIRTUAL_START: u64 = 0xffff_8000_0000_0000;

/// Every byte of physical memory is also visible at this offset (the
/// bootstrap installs the mapping before handing over).
pub const PHYSICAL_MAPPED_BASE: u64 = 0xffff_ff80_0000_0000;

/// The fixed upper bound of the kernel heap's virtual range, exclusive. The
/// lower bound is wherever the kernel image ends.
pub const HEAP_VIRTUAL_END: u64 = 0xffff_c000_0000_0000;

/// A pointer that represents a physical address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
	pub const fn new(value: u64) -> Self {
		Self(value)
	}

	pub const fn as_value(&self) -> u64 {
		self.0
	}

	/// The physical-offset-mapped view of this address.
	#[cfg(target_os = "none")]
	pub(crate) fn as_mut_ptr<T>(&self) -> *mut T {
		(self.0 + PHYSICAL_MAPPED_BASE) as *mut T
	}
}

// we implement Debug and not Display because you should only ever see physical addresses during debugging
impl Debug for PhysicalAddress {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "PhysicalAddress({:#x})", self.0)
	}
}

bitflags! {
	/// Portable attributes for a single page mapping. Architecture bits are
	/// derived from these at the mapper.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct MapFlags: u64 {
		const WRITABLE = 1 << 0;
		const NO_EXECUTE = 1 << 1;
	}
}

/// A mapping request that could not be satisfied.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MapError;

/// The physical frame allocator the heap draws from. One frame at a time;
/// `None` when physical memory is exhausted.
pub trait FrameAllocator: Sync {
	fn allocate(&self) -> Option<PhysicalAddress>;
	fn free(&self, frame: PhysicalAddress);
}

/// The virtual mapper the heap installs its mappings through.
pub trait PageMapper: Sync {
	/// Maps one page. Fails if the page is already mapped or a table cannot
	/// be allocated.
	fn map(&self, virt: u64, frame: PhysicalAddress, flags: MapFlags) -> Result<(), MapError>;

	/// Unmaps one page and returns the frame that was behind it, or `None`
	/// if nothing was mapped there.
	fn unmap(&self, virt: u64) -> Option<PhysicalAddress>;
}

/// Brings up the frame pool and the kernel heap. The heap is not optional:
/// failure to place it is a boot-time fatal.
#[cfg(target_os = "none")]
pub fn initialize(memory_regions: &[crate::MemoryRegion], kernel_image_info: &crate::KernelImageInfo) {
	use crate::kprintln;
	use crate::util::align_up_pow2;

	pmm::initialize(memory_regions).expect("The frame pool should initialize without error");
	kprintln!("PMM initialized");

	// the heap starts at the first 2 MiB boundary past the kernel image
	let heap_base = align_up_pow2(
		kernel_image_info.virtual_start + kernel_image_info.size,
		LARGE_PAGE_SIZE,
	);

	heap::kernel_heap()
		.initialize(
			heap_base,
			HEAP_VIRTUAL_END,
			&pmm::KernelFrameAllocator,
			&vmm::KernelPageMapper,
		)
		.expect("The kernel heap should initialize without error");
	kprintln!("heap initialized ({:#x}-{:#x})", heap_base, HEAP_VIRTUAL_END);
}
