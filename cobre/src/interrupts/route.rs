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

//! The dispatch table and the routing policy around it.
//!
//! Dispatch takes the table read-locked, so any number of CPUs can deliver
//! interrupts at once; registration takes it write-locked and drains them
//! out. Chain nodes come straight from the kernel heap, which is why
//! registration can fail and dispatch never allocates.

use core::{mem::size_of, ptr::NonNull};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};

use super::{
	vector_for_irq, InterruptController, InterruptFrame, InterruptHandler, IrqTuple, FAULT_LAST,
	INTERRUPTS, SPURIOUS_VECTOR,
};
use crate::{
	kprintln,
	memory::heap::{AllocFlags, KernelHeap},
	sync::RwLock,
};

struct HandlerNode {
	link: LinkedListAtomicLink,
	handler: InterruptHandler,
}

intrusive_adapter!(HandlerNodeAdapter = &'static HandlerNode: HandlerNode { link: LinkedListAtomicLink });

struct RouteTable {
	/// One chain per vector, newest handler first.
	chains: [LinkedList<HandlerNodeAdapter>; INTERRUPTS],
	heap: &'static KernelHeap,
	controller: &'static dyn InterruptController,
}

/// The interrupt router: the single dispatch entry point plus the
/// registration surface drivers use.
pub struct Router {
	table: RwLock<Option<RouteTable>>,
}

impl Router {
	pub const fn new() -> Self {
		Self {
			table: RwLock::new(None),
		}
	}

	/// Wires the table up and prints the discovered controllers for the boot
	/// log.
	pub fn initialize(&self, heap: &'static KernelHeap, controller: &'static dyn InterruptController) {
		let mut table = self.table.write();

		controller.print_info();
		for index in 0..controller.record_count() {
			if let Some(record) = controller.record(index) {
				kprintln!(
					" => interrupt controller {:#04x} at {:#018x}, irqs {}-{}",
					record.id,
					record.address,
					record.irq_base,
					record.irq_base + record.irqs - 1
				);
			}
		}

		*table = Some(RouteTable {
			chains: core::array::from_fn(|_| LinkedList::new(HandlerNodeAdapter::NEW)),
			heap,
			controller,
		});
	}

	/// The single entry point the architectural stubs call with the saved
	/// state of the interrupted context.
	///
	/// Panics if the vector has no handlers: an unhandled interrupt is a
	/// programming error, not a runtime event.
	pub fn dispatch(&self, frame: &InterruptFrame) {
		let vector = frame.vector();
		let table = self.table.read();

		let table = match table.as_ref() {
			Some(table) => table,
			None => panic!("unhandled interrupt {}", vector),
		};

		// faults are synchronous and have no end-of-interrupt, and a
		// spurious vector must never get one. everything else is
		// acknowledged up front so the controller can queue the next
		// delivery while the handlers run.
		if vector > FAULT_LAST && vector != SPURIOUS_VECTOR {
			table.controller.acknowledge(vector);
		}

		let chain = &table.chains[vector as usize];
		if chain.is_empty() {
			panic!("unhandled interrupt {}", vector);
		}

		for node in chain.iter() {
			(node.handler)(frame);
		}
	}

	fn install(table: &mut RouteTable, vector: u8, handler: InterruptHandler) -> bool {
		let page = match table
			.heap
			.allocate(size_of::<HandlerNode>() as u64, AllocFlags::WRITABLE)
		{
			Some(page) => page,
			None => return false,
		};

		let node = page.as_ptr() as *mut HandlerNode;
		// SAFETY: the heap just handed us this page, mapped and writable.
		let node = unsafe {
			node.write(HandlerNode {
				link: LinkedListAtomicLink::new(),
				handler,
			});
			&*node
		};

		// newest first
		table.chains[vector as usize].push_front(node);
		true
	}

	fn uninstall(table: &mut RouteTable, vector: u8, handler: InterruptHandler) {
		let mut cursor = table.chains[vector as usize].front_mut();

		while let Some(node) = cursor.get() {
			if node.handler as *const () == handler as *const () {
				let node = cursor
					.remove()
					.expect("The cursor should still point at the node it just read")
					as *const HandlerNode;

				// SAFETY: chain nodes are heap payload pages, never null.
				table.heap.free(unsafe { NonNull::new_unchecked(node as *mut u8) });
				return;
			}

			cursor.move_next();
		}

		// unrouting a handler that isn't there is fine; nothing to do
	}

	/// Pushes `handler` onto the chain for `vector`. Fails only if the chain
	/// node cannot be allocated.
	pub fn route_intr(&self, vector: u8, handler: InterruptHandler) -> bool {
		let mut table = self.table.write();
		let table = match table.as_mut() {
			Some(table) => table,
			None => return false,
		};

		Self::install(table, vector, handler)
	}

	/// Unlinks the first chain entry for `vector` whose handler matches.
	pub fn unroute_intr(&self, vector: u8, handler: InterruptHandler) {
		let mut table = self.table.write();
		let table = match table.as_mut() {
			Some(table) => table,
			None => return,
		};

		Self::uninstall(table, vector, handler);
	}

	/// Registers `handler` for a hardware interrupt line and programs the
	/// controller that owns it. Fails if no controller owns the line or the
	/// chain node cannot be allocated.
	pub fn route_irq(&self, tuple: &IrqTuple, handler: InterruptHandler) -> bool {
		let vector = vector_for_irq(tuple.irq);

		let mut table = self.table.write();
		let table = match table.as_mut() {
			Some(table) => table,
			None => return false,
		};

		for index in 0..table.controller.record_count() {
			let record = match table.controller.record(index) {
				Some(record) => record,
				None => continue,
			};
			if !record.contains(tuple.irq) {
				continue;
			}

			// the handler has to be in place before the line can fire, so an
			// early interrupt never finds an empty chain
			if !Self::install(table, vector, handler) {
				return false;
			}
			table.controller.route(index, tuple, vector);
			return true;
		}

		false
	}

	/// Masks the line at every controller that owns it, then removes the
	/// handler. The order matters: a delivery that was already in flight
	/// must still find the chain intact.
	pub fn unroute_irq(&self, tuple: &IrqTuple, handler: InterruptHandler) {
		let vector = vector_for_irq(tuple.irq);

		let mut table = self.table.write();
		let table = match table.as_mut() {
			Some(table) => table,
			None => return,
		};

		for index in 0..table.controller.record_count() {
			let record = match table.controller.record(index) {
				Some(record) => record,
				None => continue,
			};
			if record.contains(tuple.irq) {
				table.controller.mask(index, tuple);
			}
		}

		Self::uninstall(table, vector, handler);
	}
}

impl Default for Router {
	fn default() -> Self {
		Self::new()
	}
}

static ROUTER: Router = Router::new();

/// The kernel's interrupt router.
pub fn router() -> &'static Router {
	&ROUTER
}
