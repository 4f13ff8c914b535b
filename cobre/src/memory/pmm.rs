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

//! The physical frame pool.
//!
//! Free frames carry their own bookkeeping: each one holds a list link at its
//! base, reached through the physical-offset mapping, so the pool needs no
//! storage of its own.

use core::mem::{size_of, MaybeUninit};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use static_assertions::const_assert;

use super::{FrameAllocator, PhysicalAddress, PAGE_SIZE, PHYSICAL_MAPPED_BASE};
use crate::{sync::SpinLock, MemoryRegion, MemoryRegionType};

struct FreeFrame {
	link: LinkedListAtomicLink,
}

intrusive_adapter!(FreeFrameAdapter = &'static FreeFrame: FreeFrame { link: LinkedListAtomicLink });

const_assert!(size_of::<FreeFrame>() as u64 <= PAGE_SIZE);

struct FramePool {
	free: LinkedList<FreeFrameAdapter>,
	free_count: u64,
}

static FRAMES: SpinLock<Option<FramePool>> = SpinLock::new(None);

/// SAFETY: `frame` must be free RAM covered by the physical-offset mapping
/// and must not already be on the list.
unsafe fn insert_free(pool: &mut FramePool, frame: PhysicalAddress) {
	let block = frame.as_mut_ptr::<MaybeUninit<FreeFrame>>();
	let block_ref = &mut *block;
	block_ref.write(FreeFrame {
		link: Default::default(),
	});
	pool.free.push_back(block_ref.assume_init_ref());
	pool.free_count += 1;
}

pub(crate) fn initialize(regions: &[MemoryRegion]) -> Result<(), ()> {
	let mut pool = FramePool {
		free: LinkedList::new(FreeFrameAdapter::NEW),
		free_count: 0,
	};

	for region in regions {
		if region.ty != MemoryRegionType::General {
			continue;
		}

		for page in 0..region.page_count {
			let frame = PhysicalAddress::new(region.physical_start + page * PAGE_SIZE);
			// SAFETY: the boot memory map promises this is free RAM, and the
			//         offset mapping covers all of physical memory.
			unsafe { insert_free(&mut pool, frame) };
		}
	}

	if pool.free_count == 0 {
		return Err(());
	}

	*FRAMES.lock() = Some(pool);
	Ok(())
}

pub fn allocate_frame() -> Option<PhysicalAddress> {
	let mut frames = FRAMES.lock();
	let pool = frames.as_mut()?;

	let block = pool.free.pop_front()?;
	pool.free_count -= 1;

	Some(PhysicalAddress::new(
		(block as *const FreeFrame) as u64 - PHYSICAL_MAPPED_BASE,
	))
}

pub fn free_frame(frame: PhysicalAddress) {
	let mut frames = FRAMES.lock();
	let pool = frames
		.as_mut()
		.expect("The frame pool should be initialized before frames are freed");

	// SAFETY: the frame came out of this pool, so it's free RAM under the
	//         offset mapping again.
	unsafe { insert_free(pool, frame) };
}

pub fn free_frame_count() -> u64 {
	let frames = FRAMES.lock();
	frames.as_ref().map(|pool| pool.free_count).unwrap_or(0)
}

/// The frame-allocator seam, backed by the kernel's own pool.
pub struct KernelFrameAllocator;

impl FrameAllocator for KernelFrameAllocator {
	fn allocate(&self) -> Option<PhysicalAddress> {
		allocate_frame()
	}

	fn free(&self, frame: PhysicalAddress) {
		free_frame(frame)
	}
}
