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

//! Hosted stand-in for the local interrupt flag.
//!
//! On a hosted build there is no interrupt delivery to mask, but the sync
//! primitives still save and restore "interrupt state" around every
//! acquisition. A process-wide flag keeps those save/restore pairs honest
//! without pretending to be per-CPU state.

pub use super::common::InterruptState;

// under the test harness each thread plays the part of one CPU, so the flag
// is thread-local there
#[cfg(test)]
mod flag {
	use std::cell::Cell;

	std::thread_local! {
		static DELIVERY_ENABLED: Cell<bool> = const { Cell::new(true) };
	}

	pub fn set(enabled: bool) {
		DELIVERY_ENABLED.with(|flag| flag.set(enabled));
	}

	pub fn get() -> bool {
		DELIVERY_ENABLED.with(|flag| flag.get())
	}
}

#[cfg(not(test))]
mod flag {
	use core::sync::atomic::{AtomicBool, Ordering};

	static DELIVERY_ENABLED: AtomicBool = AtomicBool::new(true);

	pub fn set(enabled: bool) {
		DELIVERY_ENABLED.store(enabled, Ordering::SeqCst);
	}

	pub fn get() -> bool {
		DELIVERY_ENABLED.load(Ordering::SeqCst)
	}
}

pub fn disable_interrupts() {
	flag::set(false);
}

/// # Safety
///
/// Safe on a hosted build; the signature mirrors the freestanding one.
pub unsafe fn enable_interrupts() {
	flag::set(true);
}

pub fn interrupts_enabled() -> bool {
	flag::get()
}

/// Saves the current interrupt state, disables interrupts, and then returns the saved interrupt state.
pub fn disable_and_save_interrupts() -> InterruptState {
	let enabled = interrupts_enabled();
	disable_interrupts();
	InterruptState(enabled)
}

/// Enables interrupts if they were previously enabled.
///
/// # Safety
///
/// Safe on a hosted build; the signature mirrors the freestanding one.
pub unsafe fn restore_interrupts(interrupt_state: InterruptState) {
	if interrupt_state.0 {
		enable_interrupts();
	}
}

/// Parks the CPU until the next interrupt arrives. Hosted builds just spin.
pub fn halt() {
	core::hint::spin_loop();
}
