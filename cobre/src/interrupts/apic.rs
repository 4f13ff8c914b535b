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

//! The local and I/O APIC drivers behind the controller seam.
//!
//! An I/O APIC exposes two memory-mapped registers: a selector and a window.
//! Writing a register number into the selector makes that register readable
//! and writable through the window.

use super::{ControllerRecord, InterruptController, IrqTuple, Polarity, TriggerMode};
use crate::{kprintln, memory::PHYSICAL_MAPPED_BASE, sync::SpinLock, IoApicDescription};

const REGISTER_VERSION: u32 = 0x01;
const REGISTER_REDIRECTION_BASE: u32 = 0x10;

// redirection entry, low dword
const REDIRECTION_POLARITY_LOW: u32 = 1 << 13;
const REDIRECTION_TRIGGER_LEVEL: u32 = 1 << 15;
const REDIRECTION_MASKED: u32 = 1 << 16;

const LOCAL_APIC_EOI_OFFSET: u64 = 0xb0;

const MAX_IO_APICS: usize = 8;

struct IoApic {
	record: ControllerRecord,
	selector: *mut u32,
	window: *mut u32,
}

impl IoApic {
	/// SAFETY: the selector/window pair must point at a real I/O APIC, and
	/// accesses must be serialized (the APICS lock does this).
	unsafe fn read_register(&self, register: u32) -> u32 {
		self.selector.write_volatile(register);
		self.window.read_volatile()
	}

	/// SAFETY: same as read_register.
	unsafe fn write_register(&self, register: u32, value: u32) {
		self.selector.write_volatile(register);
		self.window.write_volatile(value);
	}

	fn redirection_register(&self, tuple: &IrqTuple) -> u32 {
		let offset = tuple.irq - self.record.irq_base;
		REGISTER_REDIRECTION_BASE + offset * 2
	}
}

struct ApicSet {
	io_apics: [Option<IoApic>; MAX_IO_APICS],
	count: usize,
	local_apic_eoi: Option<*mut u32>,
}

// SAFETY: the MMIO pointers are only ever dereferenced while holding the
//         APICS lock.
unsafe impl Send for ApicSet {}

static APICS: SpinLock<ApicSet> = SpinLock::new(ApicSet {
	io_apics: [None, None, None, None, None, None, None, None],
	count: 0,
	local_apic_eoi: None,
});

/// Registers the controllers the bootstrap discovered in the firmware
/// tables. Must happen before any IRQ is routed.
pub fn initialize(local_apic_address: u64, descriptions: &[IoApicDescription]) {
	let mut apics = APICS.lock();

	apics.local_apic_eoi =
		Some((local_apic_address + PHYSICAL_MAPPED_BASE + LOCAL_APIC_EOI_OFFSET) as *mut u32);

	for description in descriptions {
		if apics.count == MAX_IO_APICS {
			kprintln!("ignoring extra I/O APIC {:#04x}", description.id);
			continue;
		}

		let selector = (description.address + PHYSICAL_MAPPED_BASE) as *mut u32;
		let window = (description.address + PHYSICAL_MAPPED_BASE + 0x10) as *mut u32;

		let mut apic = IoApic {
			record: ControllerRecord {
				id: description.id,
				address: description.address,
				irq_base: description.global_system_interrupt_base,
				irqs: 0,
			},
			selector,
			window,
		};

		// the redirection entry count hides in the version register
		// SAFETY: the bootstrap vouched for this MMIO base, and we hold the lock.
		let version = unsafe { apic.read_register(REGISTER_VERSION) };
		apic.record.irqs = ((version >> 16) & 0xff) + 1;

		let index = apics.count;
		apics.io_apics[index] = Some(apic);
		apics.count += 1;
	}
}

/// The controller seam, backed by the discovered APICs.
pub struct SystemController;

pub static SYSTEM_CONTROLLER: SystemController = SystemController;

impl InterruptController for SystemController {
	fn record_count(&self) -> usize {
		APICS.lock().count
	}

	fn record(&self, index: usize) -> Option<ControllerRecord> {
		let apics = APICS.lock();
		apics.io_apics.get(index)?.as_ref().map(|apic| apic.record)
	}

	fn route(&self, index: usize, tuple: &IrqTuple, vector: u8) {
		let apics = APICS.lock();
		let apic = match apics.io_apics.get(index).and_then(|apic| apic.as_ref()) {
			Some(apic) => apic,
			None => return,
		};
		if !apic.record.contains(tuple.irq) {
			return;
		}

		let mut low = vector as u32;
		if tuple.polarity == Polarity::Low {
			low |= REDIRECTION_POLARITY_LOW;
		}
		if tuple.trigger == TriggerMode::Level {
			low |= REDIRECTION_TRIGGER_LEVEL;
		}

		let register = apic.redirection_register(tuple);
		// SAFETY: interrupts are masked while the lock is held, so nothing
		//         fires between the two halves; delivery goes to the
		//         bootstrap CPU in physical mode (high dword stays zero).
		unsafe {
			apic.write_register(register, low | REDIRECTION_MASKED);
			apic.write_register(register + 1, 0);
			apic.write_register(register, low);
		}
	}

	fn mask(&self, index: usize, tuple: &IrqTuple) {
		let apics = APICS.lock();
		let apic = match apics.io_apics.get(index).and_then(|apic| apic.as_ref()) {
			Some(apic) => apic,
			None => return,
		};
		if !apic.record.contains(tuple.irq) {
			return;
		}

		let register = apic.redirection_register(tuple);
		// SAFETY: serialized by the lock; setting the mask bit only.
		unsafe {
			let low = apic.read_register(register);
			apic.write_register(register, low | REDIRECTION_MASKED);
		}
	}

	fn acknowledge(&self, _vector: u8) {
		let apics = APICS.lock();
		if let Some(eoi) = apics.local_apic_eoi {
			// SAFETY: any write to the EOI register signals end-of-interrupt.
			unsafe { eoi.write_volatile(0) };
		}
	}

	fn print_info(&self) {
		let apics = APICS.lock();
		kprintln!("local APIC at EOI offset {:#x}, {} I/O APIC(s)", LOCAL_APIC_EOI_OFFSET, apics.count);
	}
}
