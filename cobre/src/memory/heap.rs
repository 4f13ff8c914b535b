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

//! The kernel heap: page-granular allocation out of one reserved virtual
//! range.
//!
//! The bookkeeping lives inside the range itself. Every node owns one header
//! page followed by its payload pages, and the nodes form a list sorted by
//! address with no gaps: each node's end is the next node's header. Freeing
//! merges a node with free neighbors on both sides, so fragmentation only
//! ever costs the header pages of the splits still in use.
//!
//! # Safety
//!
//! Header pages are written through raw pointers at addresses the heap
//! itself chose and mapped; the node list must only ever be touched while
//! holding the heap lock.

use core::{cell::Cell, mem::size_of, ptr::NonNull};

use bitflags::bitflags;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use static_assertions::const_assert;

use super::{FrameAllocator, MapFlags, PageMapper, PAGE_SIZE};
use crate::{sync::SpinLock, util::align_up_pow2};

bitflags! {
	/// Caller-facing allocation attributes. Payload mappings are
	/// non-executable unless `EXECUTABLE` is given.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct AllocFlags: u32 {
		const WRITABLE = 1 << 0;
		const EXECUTABLE = 1 << 1;
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NodeState {
	/// Not allocated.
	Free,

	/// Allocated; the backing frames are the caller's business.
	Reserved,

	/// Allocated; the heap owns the backing frames.
	Allocated,
}

/// One node header. Lives in the page right before its payload.
struct HeapNode {
	link: LinkedListAtomicLink,
	state: Cell<NodeState>,

	/// The first payload page, inclusive.
	start: Cell<u64>,

	/// The last payload page, exclusive. Also the next node's header, unless
	/// this is the last node.
	end: Cell<u64>,
}

intrusive_adapter!(HeapNodeAdapter = &'static HeapNode: HeapNode { link: LinkedListAtomicLink });

const_assert!(size_of::<HeapNode>() as u64 <= PAGE_SIZE);

// SAFETY: nodes are only ever touched while holding the heap lock, and they
//         never move out of their header pages.
unsafe impl Send for HeapNode {}
unsafe impl Sync for HeapNode {}

impl HeapNode {
	fn header_address(&self) -> u64 {
		(self as *const HeapNode) as u64
	}

	fn size(&self) -> u64 {
		self.end.get() - self.start.get()
	}
}

/// SAFETY: `header` must be a mapped, writable page that nothing else refers
/// to.
unsafe fn write_node(header: u64, state: NodeState, start: u64, end: u64) -> &'static HeapNode {
	let node = header as *mut HeapNode;
	node.write(HeapNode {
		link: LinkedListAtomicLink::new(),
		state: Cell::new(state),
		start: Cell::new(start),
		end: Cell::new(end),
	});
	&*node
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapInitError {
	/// The range has no room for even the root header.
	EmptyRange,

	/// No physical frame for the root header.
	RootFrame,

	/// The root header frame could not be mapped.
	RootMapping,
}

const HEADER_MAP_FLAGS: MapFlags = MapFlags::WRITABLE.union(MapFlags::NO_EXECUTE);

pub struct Heap {
	nodes: LinkedList<HeapNodeAdapter>,
	frames: &'static dyn FrameAllocator,
	mapper: &'static dyn PageMapper,
}

// SAFETY: the list only refers to header pages owned by this heap, and the
//         heap is only reachable through its lock.
unsafe impl Send for Heap {}

impl Heap {
	/// Creates a heap over `[base, end)` with the root node header at
	/// `base`, covering the whole rest of the range.
	pub fn new(
		base: u64,
		end: u64,
		frames: &'static dyn FrameAllocator,
		mapper: &'static dyn PageMapper,
	) -> Result<Self, HeapInitError> {
		if base + PAGE_SIZE >= end {
			return Err(HeapInitError::EmptyRange);
		}

		let root_frame = frames.allocate().ok_or(HeapInitError::RootFrame)?;
		if mapper.map(base, root_frame, HEADER_MAP_FLAGS).is_err() {
			frames.free(root_frame);
			return Err(HeapInitError::RootMapping);
		}

		let mut nodes = LinkedList::new(HeapNodeAdapter::NEW);
		// SAFETY: the header page was just mapped and belongs to nobody else.
		let root = unsafe { write_node(base, NodeState::Free, base + PAGE_SIZE, end) };
		nodes.push_back(root);

		Ok(Self {
			nodes,
			frames,
			mapper,
		})
	}

	/// First-fit walk over the free nodes. The chosen node comes back
	/// RESERVED; splitting off the tail is best-effort.
	fn find_node(&mut self, size: u64) -> Option<&'static HeapNode> {
		let mut cursor = self.nodes.front_mut();

		while let Some(node) = cursor.get() {
			// decouple the node from the cursor borrow; it lives in a header
			// page, not in the cursor
			let node = unsafe { &*(node as *const HeapNode) };

			if node.state.get() != NodeState::Free || node.size() < size {
				cursor.move_next();
				continue;
			}

			// splitting only pays off if the tail can hold a header page and
			// at least one payload page
			let extra = node.size() - size;
			if extra >= 2 * PAGE_SIZE {
				if let Some(frame) = self.frames.allocate() {
					let header = node.start.get() + size;
					if self.mapper.map(header, frame, HEADER_MAP_FLAGS).is_ok() {
						// SAFETY: freshly mapped, nothing else refers to it.
						let next =
							unsafe { write_node(header, NodeState::Free, header + PAGE_SIZE, node.end.get()) };
						node.end.set(header);
						cursor.insert_after(next);
					} else {
						// no split then; hand the node out whole
						self.frames.free(frame);
					}
				}
			}

			node.state.set(NodeState::Reserved);
			return Some(node);
		}

		None
	}

	fn allocate_inner(&mut self, size: u64, flags: AllocFlags, back_with_frames: bool) -> Option<NonNull<u8>> {
		let size = align_up_pow2(size, PAGE_SIZE);
		if size == 0 {
			return None;
		}

		let node = self.find_node(size)?;

		if back_with_frames {
			// flip the state first so a rollback releases whatever got mapped
			node.state.set(NodeState::Allocated);

			let mut map_flags = MapFlags::NO_EXECUTE;
			if flags.contains(AllocFlags::WRITABLE) {
				map_flags |= MapFlags::WRITABLE;
			}
			if flags.contains(AllocFlags::EXECUTABLE) {
				map_flags &= !MapFlags::NO_EXECUTE;
			}

			let start = node.start.get();
			let mut page = start;
			while page < start + size {
				let frame = match self.frames.allocate() {
					Some(frame) => frame,
					None => {
						self.free_node(node);
						return None;
					},
				};

				if self.mapper.map(page, frame, map_flags).is_err() {
					self.frames.free(frame);
					self.free_node(node);
					return None;
				}

				page += PAGE_SIZE;
			}
		}

		NonNull::new(node.start.get() as *mut u8)
	}

	/// Allocates `size` bytes of fresh physical memory, mapped at the
	/// returned address. `size` is rounded up to whole pages.
	pub fn allocate(&mut self, size: u64, flags: AllocFlags) -> Option<NonNull<u8>> {
		self.allocate_inner(size, flags, true)
	}

	/// Claims a virtual range without backing it; the caller installs its
	/// own payload mappings.
	pub fn reserve(&mut self, size: u64) -> Option<NonNull<u8>> {
		self.allocate_inner(size, AllocFlags::empty(), false)
	}

	/// Releases an allocation made by [`Self::allocate`] or
	/// [`Self::reserve`]. `ptr` is the payload address those returned.
	pub fn free(&mut self, ptr: NonNull<u8>) {
		let header = (ptr.as_ptr() as u64) - PAGE_SIZE;

		let node = match self.node_at(header) {
			Some(node) => node,
			None => panic!("heap free of untracked pointer {:#x}", ptr.as_ptr() as u64),
		};
		if node.state.get() == NodeState::Free {
			panic!("heap double free of {:#x}", ptr.as_ptr() as u64);
		}

		self.free_node(node);
	}

	fn node_at(&self, header: u64) -> Option<&'static HeapNode> {
		self.nodes
			.iter()
			.find(|node| node.header_address() == header)
			// same decoupling as in find_node
			.map(|node| unsafe { &*(node as *const HeapNode) })
	}

	fn free_node(&mut self, node: &'static HeapNode) {
		// give back the payload frames if the heap owns them. pages that
		// never got mapped (a rolled-back allocation) come back as None and
		// are skipped.
		if node.state.get() == NodeState::Allocated {
			let mut page = node.start.get();
			while page < node.end.get() {
				if let Some(frame) = self.mapper.unmap(page) {
					self.frames.free(frame);
				}
				page += PAGE_SIZE;
			}
		}

		node.state.set(NodeState::Free);

		// SAFETY: the node is a live member of the list and we hold the heap.
		let mut cursor = unsafe { self.nodes.cursor_mut_from_ptr(node as *const HeapNode) };

		// absorb the next neighbor if it's free
		let next = match cursor.peek_next().get() {
			Some(next) if next.state.get() == NodeState::Free => {
				Some(unsafe { &*(next as *const HeapNode) })
			},
			_ => None,
		};
		if let Some(next) = next {
			let next_header = next.header_address();
			node.end.set(next.end.get());

			cursor.move_next();
			cursor.remove();
			// after the removal the cursor sits on the element after `next`;
			// step back onto `node` (from the null sentinel this wraps to the
			// last element, which is `node` too)
			cursor.move_prev();

			// the absorbed node's header page goes back to the pool
			if let Some(frame) = self.mapper.unmap(next_header) {
				self.frames.free(frame);
			}
		}

		// and the previous neighbor
		let previous = match cursor.peek_prev().get() {
			Some(previous) if previous.state.get() == NodeState::Free => {
				Some(unsafe { &*(previous as *const HeapNode) })
			},
			_ => None,
		};
		if let Some(previous) = previous {
			let node_header = node.header_address();
			previous.end.set(node.end.get());

			cursor.remove();

			// this time `node` itself was absorbed
			if let Some(frame) = self.mapper.unmap(node_header) {
				self.frames.free(frame);
			}
		}
	}
}

/// The lockable singleton wrapper around [`Heap`]. Acquisition masks
/// interrupts, so allocation is safe from interrupt context.
pub struct KernelHeap {
	inner: SpinLock<Option<Heap>>,
}

impl KernelHeap {
	pub const fn new() -> Self {
		Self {
			inner: SpinLock::new(None),
		}
	}

	/// Boot-time setup; see [`Heap::new`].
	pub fn initialize(
		&self,
		base: u64,
		end: u64,
		frames: &'static dyn FrameAllocator,
		mapper: &'static dyn PageMapper,
	) -> Result<(), HeapInitError> {
		let heap = Heap::new(base, end, frames, mapper)?;
		*self.inner.lock() = Some(heap);
		Ok(())
	}

	pub fn allocate(&self, size: u64, flags: AllocFlags) -> Option<NonNull<u8>> {
		self.inner.lock().as_mut()?.allocate(size, flags)
	}

	pub fn reserve(&self, size: u64) -> Option<NonNull<u8>> {
		self.inner.lock().as_mut()?.reserve(size)
	}

	pub fn free(&self, ptr: NonNull<u8>) {
		self.inner
			.lock()
			.as_mut()
			.expect("The kernel heap should be initialized before anything is freed")
			.free(ptr)
	}
}

impl Default for KernelHeap {
	fn default() -> Self {
		Self::new()
	}
}

static KERNEL_HEAP: KernelHeap = KernelHeap::new();

/// The kernel's heap.
pub fn kernel_heap() -> &'static KernelHeap {
	&KERNEL_HEAP
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::{MapError, PhysicalAddress};
	use std::collections::HashMap;
	use std::sync::Mutex;

	struct TestFrames {
		next: Mutex<u64>,
		/// Successful allocations left before allocate() starts failing.
		remaining: Mutex<Option<usize>>,
		freed: Mutex<Vec<u64>>,
	}

	impl TestFrames {
		fn new() -> &'static TestFrames {
			Box::leak(Box::new(TestFrames {
				next: Mutex::new(0x4000_0000),
				remaining: Mutex::new(None),
				freed: Mutex::new(Vec::new()),
			}))
		}

		fn fail_after(&self, successes: usize) {
			*self.remaining.lock().unwrap() = Some(successes);
		}

		fn freed_count(&self) -> usize {
			self.freed.lock().unwrap().len()
		}
	}

	impl FrameAllocator for TestFrames {
		fn allocate(&self) -> Option<PhysicalAddress> {
			let mut remaining = self.remaining.lock().unwrap();
			if let Some(remaining) = remaining.as_mut() {
				if *remaining == 0 {
					return None;
				}
				*remaining -= 1;
			}

			let mut next = self.next.lock().unwrap();
			let frame = *next;
			*next += PAGE_SIZE;
			Some(PhysicalAddress::new(frame))
		}

		fn free(&self, frame: PhysicalAddress) {
			self.freed.lock().unwrap().push(frame.as_value());
		}
	}

	struct TestMapper {
		mappings: Mutex<HashMap<u64, u64>>,
		fail_next_map: Mutex<bool>,
	}

	impl TestMapper {
		fn new() -> &'static TestMapper {
			Box::leak(Box::new(TestMapper {
				mappings: Mutex::new(HashMap::new()),
				fail_next_map: Mutex::new(false),
			}))
		}

		fn fail_next_map(&self) {
			*self.fail_next_map.lock().unwrap() = true;
		}

		fn is_mapped(&self, virt: u64) -> bool {
			self.mappings.lock().unwrap().contains_key(&virt)
		}
	}

	impl PageMapper for TestMapper {
		fn map(&self, virt: u64, frame: PhysicalAddress, _flags: MapFlags) -> Result<(), MapError> {
			if std::mem::take(&mut *self.fail_next_map.lock().unwrap()) {
				return Err(MapError);
			}
			self.mappings.lock().unwrap().insert(virt, frame.as_value());
			Ok(())
		}

		fn unmap(&self, virt: u64) -> Option<PhysicalAddress> {
			self.mappings
				.lock()
				.unwrap()
				.remove(&virt)
				.map(PhysicalAddress::new)
		}
	}

	/// A real buffer backs the "virtual" range so the header pages the heap
	/// writes land in memory this process actually owns.
	fn test_heap(payload_pages: u64) -> (Heap, &'static TestFrames, &'static TestMapper, u64, u64) {
		let pages = payload_pages + 1;
		let buffer = vec![0u8; ((pages + 1) * PAGE_SIZE) as usize];
		let raw = Box::leak(buffer.into_boxed_slice()).as_mut_ptr() as u64;
		let base = align_up_pow2(raw, PAGE_SIZE);
		let end = base + pages * PAGE_SIZE;

		let frames = TestFrames::new();
		let mapper = TestMapper::new();
		let heap = Heap::new(base, end, frames, mapper).unwrap();
		(heap, frames, mapper, base, end)
	}

	fn layout(heap: &Heap) -> Vec<(u64, u64, u64, NodeState)> {
		heap.nodes
			.iter()
			.map(|node| {
				(
					node.header_address(),
					node.start.get(),
					node.end.get(),
					node.state.get(),
				)
			})
			.collect()
	}

	/// The node list must tile [base, end) exactly: headers mapped, each
	/// node starting right after its header, each node ending where the next
	/// begins, free payload pages unmapped.
	fn assert_tiles(heap: &Heap, mapper: &TestMapper, base: u64, end: u64) {
		let nodes = layout(heap);
		assert!(!nodes.is_empty());

		let mut expected_header = base;
		for (header, start, node_end, state) in &nodes {
			assert_eq!(*header, expected_header);
			assert_eq!(*start, header + PAGE_SIZE);
			assert!(start <= node_end);
			assert!(mapper.is_mapped(*header));

			if *state == NodeState::Free {
				let mut page = *start;
				while page < *node_end {
					assert!(!mapper.is_mapped(page));
					page += PAGE_SIZE;
				}
			}

			expected_header = *node_end;
		}

		assert_eq!(expected_header, end);
	}

	#[test]
	fn fresh_heap_is_one_free_node() {
		let (heap, _frames, mapper, base, end) = test_heap(16);

		assert_eq!(layout(&heap), vec![(base, base + PAGE_SIZE, end, NodeState::Free)]);
		assert_tiles(&heap, mapper, base, end);
	}

	#[test]
	fn allocation_splits_off_the_tail() {
		let (mut heap, _frames, mapper, base, end) = test_heap(16);

		let ptr = heap.allocate(4 * PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		assert_eq!(ptr.as_ptr() as u64, base + PAGE_SIZE);

		// [header][4 payload][header][11 payload]
		assert_eq!(
			layout(&heap),
			vec![
				(base, base + PAGE_SIZE, base + 5 * PAGE_SIZE, NodeState::Allocated),
				(
					base + 5 * PAGE_SIZE,
					base + 6 * PAGE_SIZE,
					end,
					NodeState::Free
				),
			]
		);
		assert_tiles(&heap, mapper, base, end);

		// all four payload pages really are mapped
		for page in 0..4 {
			assert!(mapper.is_mapped(base + PAGE_SIZE + page * PAGE_SIZE));
		}
	}

	#[test]
	fn frees_in_any_order_coalesce_back_to_one_node() {
		let (mut heap, frames, mapper, base, end) = test_heap(16);

		let first = heap.allocate(PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		let second = heap.allocate(PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		let third = heap.allocate(PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		assert_eq!(layout(&heap).len(), 4);

		heap.free(second);
		heap.free(first);
		heap.free(third);

		assert_eq!(layout(&heap), vec![(base, base + PAGE_SIZE, end, NodeState::Free)]);
		assert_tiles(&heap, mapper, base, end);

		// three payload frames plus three split headers came back
		assert_eq!(frames.freed_count(), 6);
	}

	#[test]
	fn freeing_between_two_free_neighbors_merges_all_three() {
		let (mut heap, frames, mapper, base, end) = test_heap(16);

		let first = heap.allocate(2 * PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		let second = heap.allocate(2 * PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		let third = heap.allocate(2 * PAGE_SIZE, AllocFlags::WRITABLE).unwrap();

		heap.free(first);
		heap.free(third);
		let before = frames.freed_count();

		// the middle free touches both free neighbors: its two payload
		// frames and two absorbed header frames come back
		heap.free(second);
		assert_eq!(frames.freed_count(), before + 4);

		assert_eq!(layout(&heap), vec![(base, base + PAGE_SIZE, end, NodeState::Free)]);
		assert_tiles(&heap, mapper, base, end);
	}

	#[test]
	fn exhausted_frames_roll_the_allocation_back() {
		// exact fit: no split, so the only frames involved are the payload's
		let (mut heap, frames, mapper, base, end) = test_heap(4);
		let before = layout(&heap);

		// the third of four payload frames fails
		frames.fail_after(2);
		assert!(heap.allocate(4 * PAGE_SIZE, AllocFlags::WRITABLE).is_none());

		assert_eq!(layout(&heap), before);
		assert_tiles(&heap, mapper, base, end);

		// exactly the two frames that made it in came back
		assert_eq!(frames.freed_count(), 2);
	}

	#[test]
	fn rollback_after_a_split_restores_the_tiling() {
		let (mut heap, frames, mapper, base, end) = test_heap(16);
		let before = layout(&heap);

		// one split header succeeds, two payload frames succeed, the third
		// payload frame fails
		frames.fail_after(3);
		assert!(heap.allocate(4 * PAGE_SIZE, AllocFlags::WRITABLE).is_none());

		assert_eq!(layout(&heap), before);
		assert_tiles(&heap, mapper, base, end);

		// two payload frames plus the reabsorbed split header
		assert_eq!(frames.freed_count(), 3);
	}

	#[test]
	fn failed_header_mapping_skips_the_split() {
		let (mut heap, frames, mapper, base, end) = test_heap(16);

		mapper.fail_next_map();
		let ptr = heap.allocate(PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		assert_eq!(ptr.as_ptr() as u64, base + PAGE_SIZE);

		// the whole range went out as one node and the orphaned header frame
		// was returned, not leaked
		assert_eq!(layout(&heap), vec![(base, base + PAGE_SIZE, end, NodeState::Allocated)]);
		assert_eq!(frames.freed_count(), 1);
		assert_tiles(&heap, mapper, base, end);
	}

	#[test]
	fn reserve_maps_nothing() {
		let (mut heap, frames, mapper, base, end) = test_heap(8);

		let ptr = heap.reserve(2 * PAGE_SIZE).unwrap();
		assert_eq!(ptr.as_ptr() as u64, base + PAGE_SIZE);
		assert!(!mapper.is_mapped(base + PAGE_SIZE));
		assert!(!mapper.is_mapped(base + 2 * PAGE_SIZE));

		// freeing a reservation returns no payload frames, only the split
		// header once the neighbors merge
		heap.free(ptr);
		assert_eq!(frames.freed_count(), 1);
		assert_tiles(&heap, mapper, base, end);
	}

	#[test]
	fn requests_beyond_the_range_fail_cleanly() {
		let (mut heap, _frames, mapper, base, end) = test_heap(8);

		assert!(heap.allocate(64 * PAGE_SIZE, AllocFlags::WRITABLE).is_none());
		assert_tiles(&heap, mapper, base, end);
	}

	#[test]
	#[should_panic(expected = "untracked pointer")]
	fn freeing_an_untracked_pointer_panics() {
		let (mut heap, _frames, _mapper, base, _end) = test_heap(8);

		// off by half a page: no node has this header
		heap.free(NonNull::new((base + PAGE_SIZE / 2) as *mut u8).unwrap());
	}

	#[test]
	#[should_panic(expected = "double free")]
	fn freeing_twice_panics() {
		let (mut heap, _frames, _mapper, _base, _end) = test_heap(8);

		let ptr = heap.allocate(PAGE_SIZE, AllocFlags::WRITABLE).unwrap();
		heap.free(ptr);
		heap.free(ptr);
	}

	#[test]
	fn kernel_heap_wrapper_fails_closed_before_initialization() {
		let heap = KernelHeap::new();
		assert!(heap.allocate(PAGE_SIZE, AllocFlags::WRITABLE).is_none());
		assert!(heap.reserve(PAGE_SIZE).is_none());
	}
}
