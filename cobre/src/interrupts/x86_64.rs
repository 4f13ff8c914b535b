use core::arch::asm;

pub use super::common::InterruptState;

const RFLAGS_INTERRUPT_ENABLE: u64 = 1 << 9;

fn rflags() -> u64 {
	let value: u64;

	// SAFETY: the pushed slot is consumed by the pop inside the same
	//         sequence; no memory visible outside the block is touched.
	unsafe {
		asm!("pushfq", "pop {}", out(reg) value, options(preserves_flags, nomem));
	}

	value
}

/// Whether this CPU currently accepts interrupt delivery.
pub fn interrupts_enabled() -> bool {
	rflags() & RFLAGS_INTERRUPT_ENABLE != 0
}

/// Closes local delivery until further notice.
pub fn disable_interrupts() {
	// SAFETY: turning delivery off cannot invalidate anything the compiler
	//         assumed; code only becomes less concurrent.
	unsafe {
		asm!("cli", options(nostack));
	}
}

/// Reopens local delivery.
///
/// # Safety
///
/// Interrupt code may run the moment this executes. The caller must not be
/// inside a critical section that such code could re-enter.
pub unsafe fn enable_interrupts() {
	asm!("sti", options(nostack));
}

/// Masks delivery and reports what it was beforehand, so the caller can put
/// things back exactly as they were.
pub fn disable_and_save_interrupts() -> InterruptState {
	let state = InterruptState(interrupts_enabled());
	disable_interrupts();
	state
}

/// Undoes a [`disable_and_save_interrupts`]: delivery reopens only if it was
/// open when the state was captured.
///
/// # Safety
///
/// Same contract as [`enable_interrupts`].
pub unsafe fn restore_interrupts(interrupt_state: InterruptState) {
	if interrupt_state.0 {
		enable_interrupts();
	}
}

/// Parks the CPU until the next interrupt arrives.
pub fn halt() {
	// SAFETY: hlt pauses the CPU and changes no program state.
	unsafe {
		asm!("hlt", options(nostack, preserves_flags));
	}
}
