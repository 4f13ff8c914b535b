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

//! Synchronization primitives that are safe to take from interrupt context.
//!
//! Every acquisition here masks local interrupt delivery for as long as the
//! guard lives. A lock that an interrupt handler may take would otherwise
//! deadlock its own CPU: the interrupted holder can never run again to
//! release it.

use core::{
	cell::UnsafeCell,
	hint::spin_loop,
	marker::PhantomData,
	ops::{Deref, DerefMut},
	sync::atomic::{AtomicBool, Ordering},
};

use crate::interrupts::{self, restore_interrupts, InterruptState};

mod rwlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A busy-waiting mutual exclusion lock.
///
/// Taking it also masks interrupt delivery on the local CPU until the guard
/// drops, so code that may run in interrupt context can hold one without
/// risking a self-deadlock.
pub struct SpinLock<T: ?Sized> {
	locked: AtomicBool,
	data: UnsafeCell<T>,
}

/// Exclusive access to the data behind a [`SpinLock`]. Unlocks and unmasks
/// on drop.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
	lock: &'a SpinLock<T>,
	interrupt_state: InterruptState,
	// the saved interrupt state belongs to the CPU that took the lock, so
	// the guard has to be dropped on that CPU as well
	_not_send: PhantomData<*const ()>,
}

impl<T> SpinLock<T> {
	pub const fn new(data: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> SpinLock<T> {
	/// Spins until the lock is won. No fairness of any kind.
	pub fn lock(&self) -> SpinLockGuard<'_, T> {
		loop {
			if let Some(guard) = self.try_lock() {
				return guard;
			}
			// each failed attempt unmasks again before retrying, so the
			// interrupt that will eventually release this lock on another
			// path still has a window to land here
			spin_loop();
		}
	}

	/// A single attempt. On failure the mask this attempt pushed is popped
	/// right away.
	pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
		let interrupt_state = interrupts::disable_and_save_interrupts();

		if self
			.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			Some(SpinLockGuard {
				lock: self,
				interrupt_state,
				_not_send: PhantomData,
			})
		} else {
			// SAFETY: undoing the save this very attempt made; nothing was
			//         acquired.
			unsafe { restore_interrupts(interrupt_state) };
			None
		}
	}
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Ordering::Release);

		// SAFETY: popping the mask the matching acquisition pushed, on the
		//         same CPU it was pushed on.
		unsafe { restore_interrupts(self.interrupt_state) };
	}
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		// SAFETY: the lock word stays ours until the guard drops, so nobody
		//         else can reach the data.
		unsafe { &*self.lock.data.get() }
	}
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		// SAFETY: as for deref; exclusive while the guard lives.
		unsafe { &mut *self.lock.data.get() }
	}
}

// SAFETY: the lock serializes every access, so moving or sharing the lock
//         itself asks no more of T than being movable between threads.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

// SAFETY: sharing a guard is sharing &T; the lock is held the whole time.
unsafe impl<'a, T: ?Sized + Sync> Sync for SpinLockGuard<'a, T> {}

impl<T: ?Sized + Default> Default for SpinLock<T> {
	fn default() -> Self {
		Self::new(Default::default())
	}
}

/// A bare scoped interrupt mask: disables local delivery on construction and
/// restores the previous state on drop. Pairs nest.
pub struct InterruptGuard {
	interrupt_state: InterruptState,
	// per-CPU state; see SpinLockGuard
	_not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
	pub fn new() -> Self {
		Self {
			interrupt_state: interrupts::disable_and_save_interrupts(),
			_not_send: PhantomData,
		}
	}
}

impl Drop for InterruptGuard {
	fn drop(&mut self) {
		// SAFETY: restoring the state this guard saved on this same CPU.
		unsafe { restore_interrupts(self.interrupt_state) };
	}
}

impl Default for InterruptGuard {
	fn default() -> Self {
		Self::new()
	}
}
