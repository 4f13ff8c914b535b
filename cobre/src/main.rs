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

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
	use core::panic::PanicInfo;

	use cobre::{bus, interrupts, kprintln, memory, BootInfo};

	/// Entered by the bootstrap once the firmware handoff is complete: the
	/// physical-offset mapping is installed, the descriptor tables are
	/// loaded, and the stubs point every vector at the dispatcher.
	#[no_mangle]
	pub extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
		kprintln!("cobre starting");

		memory::initialize(boot_info.memory_regions, &boot_info.kernel_image);

		// firmware overrides have to land before any driver routes a line
		for isa_override in boot_info.isa_overrides {
			bus::isa::apply_override(isa_override.line, isa_override.tuple);
		}

		interrupts::apic::initialize(boot_info.local_apic_address, boot_info.io_apics);
		interrupts::initialize(
			memory::heap::kernel_heap(),
			&interrupts::apic::SYSTEM_CONTROLLER,
		);

		kprintln!("cobre ready");

		loop {
			interrupts::halt();
		}
	}

	#[panic_handler]
	fn panic(info: &PanicInfo) -> ! {
		interrupts::disable_interrupts();

		// the console may be half-initialized this early; a missing sink
		// just swallows the message
		kprintln!("kernel panic: {}", info);

		loop {
			interrupts::halt();
		}
	}
}

#[cfg(not(target_os = "none"))]
fn main() {}
